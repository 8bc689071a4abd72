//! Background worker host: one long-lived `postcheck-worker` process.
//!
//! The worker is spawned and registered once, then reused for every job.
//! Jobs run sequentially inside the worker, each in a fresh isolate. Report
//! messages stream back tagged with the job id and are forwarded to that
//! job's result channel; `pm.sendRequest` calls come back as `Request`
//! messages and are served by the job's [`RequestSender`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;

use super::{IsolationStrategy, StrategyKind};
use crate::channel::{ReportMessage, ResultChannel};
use crate::error::SandboxError;
use crate::host::{handshake, spawn_worker};
use crate::ipc::{
    read_message_with_limit, write_message, ChildMessage, ParentMessage, RemoteError,
    WorkerConfig,
};
use crate::sandbox::SandboxConfig;
use crate::surface::Surface;
use crate::validator::ValidatedScript;
use crate::RequestSender;

const WORKER_LOG_TARGET: &str = "postcheck::sandbox::worker";

struct PendingJob {
    reporter: ResultChannel,
    requests: Option<Arc<dyn RequestSender>>,
}

#[derive(Default)]
struct JobTable {
    pending: HashMap<u64, PendingJob>,
    closed: Option<String>,
}

impl JobTable {
    /// Mark the worker gone and fail every job still waiting on it.
    fn close(&mut self, reason: String) {
        if self.closed.is_some() {
            return;
        }
        if !self.pending.is_empty() {
            tracing::warn!(jobs = self.pending.len(), %reason, "worker lost with jobs pending");
        }
        for (_, job) in self.pending.drain() {
            job.reporter.send(ReportMessage::Error {
                message: format!("background worker exited: {reason}"),
            });
        }
        self.closed = Some(reason);
    }
}

fn lock(table: &Mutex<JobTable>) -> MutexGuard<'_, JobTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs scripts in a persistent child process.
pub struct BackgroundWorkerHost {
    outgoing: mpsc::UnboundedSender<ParentMessage>,
    jobs: Arc<Mutex<JobTable>>,
    next_job: AtomicU64,
}

impl BackgroundWorkerHost {
    /// Spawn the worker and complete the handshake.
    pub async fn spawn(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let worker_config = WorkerConfig::from(config);
        let mut process = spawn_worker()?;
        handshake(&mut process, &worker_config, config.handshake_timeout).await?;

        let jobs = Arc::new(Mutex::new(JobTable::default()));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(process.stdin, outgoing_rx, jobs.clone()));
        tokio::spawn(read_loop(
            process.child,
            process.stdout,
            worker_config.max_ipc_message_size,
            jobs.clone(),
            outgoing.clone(),
        ));

        tracing::info!("background worker ready");
        Ok(Self {
            outgoing,
            jobs,
            next_job: AtomicU64::new(1),
        })
    }
}

impl IsolationStrategy for BackgroundWorkerHost {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Worker
    }

    fn execute(&self, script: ValidatedScript, surface: Surface) -> Result<(), SandboxError> {
        let (inputs, reporter, requests) = surface.into_parts();
        let job_id = self.next_job.fetch_add(1, Ordering::SeqCst);
        let requests_enabled = requests.is_some();

        {
            let mut table = lock(&self.jobs);
            if let Some(reason) = &table.closed {
                tracing::warn!(%reason, "worker unavailable");
                return Err(SandboxError::ContextClosed { strategy: "worker" });
            }
            table.pending.insert(job_id, PendingJob { reporter, requests });
        }

        let execute = ParentMessage::Execute {
            job_id,
            source: script.source().to_string(),
            mode: script.mode(),
            inputs,
            requests_enabled,
        };
        if self.outgoing.send(execute).is_err() {
            lock(&self.jobs).pending.remove(&job_id);
            return Err(SandboxError::ContextClosed { strategy: "worker" });
        }
        tracing::debug!(job_id, "job queued on worker");
        Ok(())
    }
}

impl Drop for BackgroundWorkerHost {
    fn drop(&mut self) {
        // The worker drains queued jobs before exiting.
        let _ = self.outgoing.send(ParentMessage::Shutdown);
    }
}

async fn write_loop(
    mut stdin: ChildStdin,
    mut outgoing: mpsc::UnboundedReceiver<ParentMessage>,
    jobs: Arc<Mutex<JobTable>>,
) {
    while let Some(msg) = outgoing.recv().await {
        let shutdown = matches!(msg, ParentMessage::Shutdown);
        if let Err(e) = write_message(&mut stdin, &msg).await {
            lock(&jobs).close(format!("IPC write error: {e}"));
            return;
        }
        if shutdown {
            return;
        }
    }
}

async fn read_loop(
    mut child: Child,
    mut stdout: BufReader<ChildStdout>,
    max_ipc_message_size: usize,
    jobs: Arc<Mutex<JobTable>>,
    outgoing: mpsc::UnboundedSender<ParentMessage>,
) {
    let reason = loop {
        let msg = match read_message_with_limit::<ChildMessage, _>(&mut stdout, max_ipc_message_size)
            .await
        {
            Ok(Some(msg)) => msg,
            Ok(None) => break "worker closed its output".to_string(),
            Err(e) => break format!("IPC read error: {e}"),
        };

        match msg {
            ChildMessage::Report { job_id, message } => {
                let table = lock(&jobs);
                match table.pending.get(&job_id) {
                    Some(job) => job.reporter.send(message),
                    None => tracing::debug!(job_id, "report for unknown job dropped"),
                }
            }
            ChildMessage::Request {
                job_id,
                request_id,
                request,
            } => {
                let sender = lock(&jobs)
                    .pending
                    .get(&job_id)
                    .and_then(|job| job.requests.clone());
                let outgoing = outgoing.clone();
                tokio::spawn(async move {
                    let result = match sender {
                        Some(sender) => sender
                            .send(request)
                            .await
                            .map_err(|e| RemoteError::from(&e)),
                        None => Err(RemoteError {
                            code: "UNAVAILABLE".into(),
                            message: "sendRequest is not available: job has no request sender"
                                .into(),
                        }),
                    };
                    let _ = outgoing.send(ParentMessage::RequestResult { request_id, result });
                });
            }
            ChildMessage::ExecutionComplete { job_id } => {
                // Dropping the job's reporter closes its result channel.
                if lock(&jobs).pending.remove(&job_id).is_some() {
                    tracing::debug!(job_id, "job complete");
                }
            }
            ChildMessage::Log { message } => {
                tracing::info!(target: WORKER_LOG_TARGET, "{}", message);
            }
            ChildMessage::Registered { .. } => {
                tracing::warn!("unexpected Registered after handshake");
            }
        }
    };

    lock(&jobs).close(reason);
    match child.wait().await {
        Ok(status) => tracing::debug!(%status, "worker exited"),
        Err(e) => tracing::warn!(error = %e, "failed to reap worker"),
    }
}
