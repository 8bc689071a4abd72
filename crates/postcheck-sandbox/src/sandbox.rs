//! The [`Sandbox`] orchestrator: validate, build a surface, dispatch.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::{result_channel, Report, ResultListener};
use crate::error::SandboxError;
use crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE;
use crate::strategy::{build_strategy, IsolationStrategy, StrategyKind};
use crate::surface::{Surface, SurfaceInputs};
use crate::validator::{ValidationResult, Validator, ValidatorConfig};
use crate::RequestSender;

/// Configuration for the sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Which isolation strategy runs accepted scripts.
    pub strategy: StrategyKind,
    /// Per-execution timeout. `None` lets a script run until it finishes.
    pub timeout: Option<Duration>,
    /// Maximum concurrent compartment isolates.
    pub max_concurrent: usize,
    /// Maximum IPC message size in bytes (default: 64 MB).
    pub max_ipc_message_size: usize,
    /// How long the background worker may take to register.
    pub handshake_timeout: Duration,
    /// Static validation settings.
    pub validator: ValidatorConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            timeout: Some(Duration::from_secs(5)),
            max_concurrent: 8,
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
            handshake_timeout: Duration::from_secs(10),
            validator: ValidatorConfig::default(),
        }
    }
}

/// Validates scripts and runs accepted ones in the configured strategy.
///
/// `Send + Sync`; all V8 work happens on strategy-owned threads.
pub struct Sandbox {
    validator: Validator,
    strategy: Arc<dyn IsolationStrategy>,
    requests: Option<Arc<dyn RequestSender>>,
}

impl Sandbox {
    /// Build the sandbox and its isolation strategy.
    pub async fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let strategy = build_strategy(&config).await?;
        Ok(Self::with_strategy(config.validator, strategy))
    }

    /// Use an already built strategy.
    pub fn with_strategy(validator: ValidatorConfig, strategy: Arc<dyn IsolationStrategy>) -> Self {
        Self {
            validator: Validator::new(validator),
            strategy,
            requests: None,
        }
    }

    /// Back `pm.sendRequest` with `sender` for every later submission.
    pub fn with_request_sender(mut self, sender: Arc<dyn RequestSender>) -> Self {
        self.requests = Some(sender);
        self
    }

    /// The active strategy.
    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Validate without running.
    pub fn validate(&self, source: &str) -> ValidationResult {
        self.validator.validate(source)
    }

    /// Validate `source` and dispatch it. Never waits for the script.
    ///
    /// The returned listener yields the execution's report messages and
    /// ends when the execution is complete.
    pub fn submit(
        &self,
        source: &str,
        inputs: SurfaceInputs,
    ) -> Result<ResultListener, SandboxError> {
        let script = self.validator.accept(source).map_err(|result| {
            tracing::info!(
                errors = result.errors().count(),
                "submit: script rejected"
            );
            SandboxError::Rejected {
                diagnostics: result.diagnostics,
            }
        })?;

        let (reporter, listener) = result_channel();
        let surface = Surface::from_inputs(inputs, reporter);
        let surface = match &self.requests {
            Some(sender) => surface.with_request_sender(sender.clone()),
            None => surface,
        };

        self.strategy.execute(script, surface)?;
        tracing::info!(strategy = %self.strategy.kind(), "submit: dispatched");
        Ok(listener)
    }

    /// Submit and wait for the complete report.
    pub async fn run(&self, source: &str, inputs: SurfaceInputs) -> Result<Report, SandboxError> {
        Ok(self.submit(source, inputs)?.collect().await)
    }
}
