//! Isolation strategies: the hosts a validated script can run in.
//!
//! Every strategy is fire-and-forget. [`IsolationStrategy::execute`] only
//! fails when the job could not be dispatched; everything the script does,
//! including an uncaught error or a timeout, arrives on the surface's result
//! channel, which closes when the job is finished.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
use crate::sandbox::SandboxConfig;
use crate::surface::Surface;
use crate::validator::ValidatedScript;

mod compartment;
mod context;
mod direct;
mod embedded;
mod worker;

pub use compartment::{run_in_fresh_compartment, CompartmentHost};
pub use direct::DirectEvaluator;
pub use embedded::EmbeddedDocumentHost;
pub use worker::BackgroundWorkerHost;

/// A host that runs validated scripts against a capability surface.
pub trait IsolationStrategy: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> StrategyKind;

    /// Dispatch one job. Returns once the job is queued or started.
    fn execute(&self, script: ValidatedScript, surface: Surface) -> Result<(), SandboxError>;
}

/// Strategy selector used by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Long-lived `postcheck-worker` child process.
    Worker,
    /// Fresh hardened isolate per execution.
    #[default]
    Compartment,
    /// One persistent isolate reached through a job queue.
    Embedded,
    /// Persistent unhardened realm, scripts compiled with `Function`.
    Direct,
}

impl StrategyKind {
    /// Every strategy, in configuration order.
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Worker,
        StrategyKind::Compartment,
        StrategyKind::Embedded,
        StrategyKind::Direct,
    ];

    /// Configuration name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Compartment => "compartment",
            Self::Embedded => "embedded",
            Self::Direct => "direct",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                format!("unknown strategy '{s}' (expected worker, compartment, embedded or direct)")
            })
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the strategy `config` selects.
///
/// The worker strategy spawns its child process and completes the
/// handshake before this returns.
pub async fn build_strategy(
    config: &SandboxConfig,
) -> Result<Arc<dyn IsolationStrategy>, SandboxError> {
    tracing::debug!(strategy = %config.strategy, "building isolation strategy");
    let strategy: Arc<dyn IsolationStrategy> = match config.strategy {
        StrategyKind::Worker => Arc::new(BackgroundWorkerHost::spawn(config).await?),
        StrategyKind::Compartment => Arc::new(CompartmentHost::new(config)),
        StrategyKind::Embedded => Arc::new(EmbeddedDocumentHost::new(config)?),
        StrategyKind::Direct => Arc::new(DirectEvaluator::new(config)?),
    };
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_kind_parses_config_names() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.as_str().parse::<StrategyKind>().unwrap(), kind);
        }
        let err = "sandbox".parse::<StrategyKind>().unwrap_err();
        assert!(err.contains("unknown strategy 'sandbox'"), "{err}");
    }

    #[test]
    fn strategy_kind_serde_matches_display() {
        let json = serde_json::to_string(&StrategyKind::Embedded).unwrap();
        assert_eq!(json, "\"embedded\"");
        assert_eq!(StrategyKind::default(), StrategyKind::Compartment);
    }
}
