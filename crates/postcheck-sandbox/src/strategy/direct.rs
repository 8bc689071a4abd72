//! Direct evaluator: a persistent host realm with sealed intrinsics.

use super::context::{PersistentContext, SurfaceEnvelope};
use super::{IsolationStrategy, StrategyKind};
use crate::error::SandboxError;
use crate::runtime::Hardening;
use crate::sandbox::SandboxConfig;
use crate::surface::Surface;
use crate::validator::{PolicyMode, ValidatedScript};

/// Compiles each script with the host's captured `Function` in a long-lived
/// realm and hands the surface over as is.
///
/// Host globals other than `Deno` stay reachable, so allow mode is the
/// better fit. Intrinsics and the host binding are sealed against writes.
pub struct DirectEvaluator {
    context: PersistentContext,
}

impl DirectEvaluator {
    /// Start the realm thread.
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        if config.validator.mode == PolicyMode::Deny {
            tracing::warn!("direct evaluator running with deny-mode validation");
        }
        Ok(Self {
            context: PersistentContext::start("direct", Hardening::Bare, config.timeout)?,
        })
    }
}

impl IsolationStrategy for DirectEvaluator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    fn execute(&self, script: ValidatedScript, surface: Surface) -> Result<(), SandboxError> {
        self.context.submit(script, SurfaceEnvelope::Live(surface))
    }
}
