//! Compartment host: a fresh, hardened isolate per execution.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use super::{IsolationStrategy, StrategyKind};
use crate::error::SandboxError;
use crate::runtime::{create_runtime, job_script, run_job, Hardening};
use crate::sandbox::SandboxConfig;
use crate::surface::Surface;
use crate::validator::ValidatedScript;

/// Runs every script in a brand new isolate on its own thread.
///
/// Non-allow-listed globals are deleted, `eval` and the function
/// constructors are removed, and intrinsic prototypes are frozen before the
/// script sees the realm. A semaphore bounds the number of live isolates.
pub struct CompartmentHost {
    timeout: Option<Duration>,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
}

impl CompartmentHost {
    /// Create a host bounded by `config.max_concurrent`.
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            timeout: config.timeout,
            max_concurrent: config.max_concurrent,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
        }
    }
}

impl IsolationStrategy for CompartmentHost {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Compartment
    }

    fn execute(&self, script: ValidatedScript, surface: Surface) -> Result<(), SandboxError> {
        let permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.max_concurrent,
            }
        })?;
        let timeout = self.timeout;

        // V8 isolates are !Send, so each execution gets a dedicated thread.
        std::thread::Builder::new()
            .name("postcheck-compartment".into())
            .spawn(move || {
                let _permit = permit;
                let mut surface = surface;
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        surface.report_error(format!("failed to create runtime: {e}"));
                        return;
                    }
                };
                rt.block_on(run_in_fresh_compartment(script, surface, timeout));
            })
            .map_err(|e| SandboxError::Execution(e.into()))?;
        Ok(())
    }
}

/// Run `script` in a new compartment isolate on the current thread.
///
/// The caller must be on a thread that may own a V8 isolate. The
/// `postcheck-worker` binary uses this for each job it receives.
pub async fn run_in_fresh_compartment(
    script: ValidatedScript,
    mut surface: Surface,
    timeout: Option<Duration>,
) {
    let mut runtime = match create_runtime(Hardening::Compartment) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::warn!(error = %e, "compartment setup failed");
            surface.report_error(e.to_string());
            return;
        }
    };
    let job = job_script(&script, Hardening::Compartment);
    run_job(&mut runtime, job, surface, timeout).await;
}
