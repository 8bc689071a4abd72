//! A persistent isolate living on its own thread, fed through a job queue.
//!
//! Shared by the embedded document host and the direct evaluator. Jobs run
//! one at a time in submission order; each gets a fresh function scope in
//! the same realm. The isolate is rebuilt after a job times out, since a
//! terminated isolate cannot run further scripts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::channel::{ReportMessage, ResultChannel};
use crate::error::SandboxError;
use crate::runtime::{create_runtime, job_script, run_job, Hardening, JobOutcome};
use crate::surface::{Surface, SurfaceInputs};
use crate::validator::ValidatedScript;
use crate::RequestSender;

/// How a surface reaches the context thread.
pub(crate) enum SurfaceEnvelope {
    /// The surface object itself.
    Live(Surface),
    /// Inputs as JSON, rebuilt into a surface on the context side.
    Serialized {
        inputs: String,
        reporter: ResultChannel,
        requests: Option<Arc<dyn RequestSender>>,
    },
}

impl SurfaceEnvelope {
    /// Serialize the inputs of `surface`, keeping the live channel parts.
    pub(crate) fn serialize(surface: Surface) -> Result<Self, SandboxError> {
        let (inputs, reporter, requests) = surface.into_parts();
        Ok(Self::Serialized {
            inputs: serde_json::to_string(&inputs)?,
            reporter,
            requests,
        })
    }

    fn open(self) -> Option<Surface> {
        match self {
            Self::Live(surface) => Some(surface),
            Self::Serialized {
                inputs,
                reporter,
                requests,
            } => match serde_json::from_str::<SurfaceInputs>(&inputs) {
                Ok(inputs) => {
                    let surface = Surface::from_inputs(inputs, reporter);
                    Some(match requests {
                        Some(sender) => surface.with_request_sender(sender),
                        None => surface,
                    })
                }
                Err(e) => {
                    reporter.send(ReportMessage::Error {
                        message: format!("invalid surface inputs: {e}"),
                    });
                    None
                }
            },
        }
    }
}

struct Job {
    script: ValidatedScript,
    envelope: SurfaceEnvelope,
}

/// Handle to a persistent context thread.
pub(crate) struct PersistentContext {
    name: &'static str,
    jobs: mpsc::UnboundedSender<Job>,
}

impl PersistentContext {
    /// Start the context thread.
    pub(crate) fn start(
        name: &'static str,
        hardening: Hardening,
        timeout: Option<Duration>,
    ) -> Result<Self, SandboxError> {
        let (jobs, queue) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(format!("postcheck-{name}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(context = name, error = %e, "failed to create runtime");
                        return;
                    }
                };
                rt.block_on(serve(name, hardening, timeout, queue));
            })
            .map_err(|e| SandboxError::Execution(e.into()))?;
        tracing::debug!(context = name, "persistent context started");
        Ok(Self { name, jobs })
    }

    /// Queue one job.
    pub(crate) fn submit(
        &self,
        script: ValidatedScript,
        envelope: SurfaceEnvelope,
    ) -> Result<(), SandboxError> {
        self.jobs
            .send(Job { script, envelope })
            .map_err(|_| SandboxError::ContextClosed {
                strategy: self.name,
            })
    }
}

async fn serve(
    name: &'static str,
    hardening: Hardening,
    timeout: Option<Duration>,
    mut queue: mpsc::UnboundedReceiver<Job>,
) {
    let mut runtime = None;
    while let Some(job) = queue.recv().await {
        let Some(mut surface) = job.envelope.open() else {
            continue;
        };
        if runtime.is_none() {
            match create_runtime(hardening) {
                Ok(fresh) => runtime = Some(fresh),
                Err(e) => {
                    tracing::warn!(context = name, error = %e, "context setup failed");
                    surface.report_error(e.to_string());
                    continue;
                }
            }
        }
        let Some(active) = runtime.as_mut() else {
            continue;
        };
        let script = job_script(&job.script, hardening);
        if run_job(active, script, surface, timeout).await == JobOutcome::TimedOut {
            tracing::info!(context = name, "recreating context after timeout");
            runtime = None;
        }
    }
    tracing::debug!(context = name, "persistent context stopped");
}
