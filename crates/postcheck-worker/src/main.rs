//! postcheck background worker: a long-lived child process that runs scripts.
//!
//! Spawned by the parent's background worker host. After the
//! `Register`/`Registered` handshake it accepts `Execute` jobs over stdin and
//! runs them one at a time, each in a fresh hardened isolate. Report messages
//! stream back over stdout tagged with the job id. `pm.sendRequest` calls are
//! proxied to the parent, which owns the real request sender.
//!
//! **Security**: This process runs with a clean environment. It has no
//! network client of its own and no inherited credentials.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use postcheck_error::RequestError;
use postcheck_sandbox::ipc::{
    read_message, read_message_with_limit, write_message, ChildMessage, ParentMessage,
    RemoteError, WorkerConfig, PROTOCOL_VERSION,
};
use postcheck_sandbox::strategy::run_in_fresh_compartment;
use postcheck_sandbox::{
    OutboundRequest, PolicyMode, ReportMessage, ReportSink, RequestReply, RequestSender,
    ResultChannel, SandboxError, Surface, SurfaceInputs, Validator, ValidatorConfig,
};
use tokio::io::{self, BufReader};
use tokio::sync::{mpsc, oneshot};

type ReplyWaiter = oneshot::Sender<Result<RequestReply, RemoteError>>;
type Waiters = Arc<Mutex<HashMap<u64, ReplyWaiter>>>;

fn lock(waiters: &Waiters) -> MutexGuard<'_, HashMap<u64, ReplyWaiter>> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One queued `Execute` request.
struct Job {
    job_id: u64,
    source: String,
    mode: PolicyMode,
    inputs: SurfaceInputs,
    requests_enabled: bool,
}

/// Report sink that tags every message with its job and writes it to the parent.
struct JobSink {
    job_id: u64,
    tx: mpsc::UnboundedSender<ChildMessage>,
}

impl ReportSink for JobSink {
    fn deliver(&self, message: ReportMessage) -> bool {
        self.tx
            .send(ChildMessage::Report {
                job_id: self.job_id,
                message,
            })
            .is_ok()
    }
}

/// Request sender that proxies `pm.sendRequest` through IPC to the parent.
///
/// The waiter is registered before the `Request` leaves, so a fast reply
/// always finds it.
struct IpcRequestBridge {
    job_id: u64,
    tx: mpsc::UnboundedSender<ChildMessage>,
    waiters: Waiters,
    next_id: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl RequestSender for IpcRequestBridge {
    async fn send(&self, request: OutboundRequest) -> Result<RequestReply, RequestError> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (resp_tx, resp_rx) = oneshot::channel();
        lock(&self.waiters).insert(request_id, resp_tx);

        let sent = self.tx.send(ChildMessage::Request {
            job_id: self.job_id,
            request_id,
            request,
        });
        if sent.is_err() {
            lock(&self.waiters).remove(&request_id);
            return Err(RequestError::Unavailable("worker output is closed".into()));
        }

        match resp_rx.await {
            Ok(result) => result.map_err(RequestError::from),
            Err(_) => Err(RequestError::Unavailable(
                "parent went away before answering".into(),
            )),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Clean environment: remove all env vars for security isolation
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    // Minimal logging to stderr; the parent only shows it in debug mode
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let msg: ParentMessage = read_message(&mut stdin)
        .await
        .context("failed to read initial message from parent")?
        .context("parent closed stdin before sending Register")?;

    let config = match msg {
        ParentMessage::Register {
            protocol_version,
            config,
        } => {
            write_message(
                &mut stdout,
                &ChildMessage::Registered {
                    protocol_version: PROTOCOL_VERSION,
                },
            )
            .await
            .context("failed to send Registered")?;
            if protocol_version != PROTOCOL_VERSION {
                anyhow::bail!(
                    "protocol version mismatch: parent {protocol_version}, worker {PROTOCOL_VERSION}"
                );
            }
            config
        }
        other => anyhow::bail!("expected Register message, got: {:?}", other),
    };

    let max_ipc_size = config.max_ipc_message_size;
    let (tx, mut outgoing) = mpsc::unbounded_channel::<ChildMessage>();
    let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();
    let waiters: Waiters = Arc::default();

    // V8 isolates are !Send: jobs run on a dedicated thread
    let exec_waiters = waiters.clone();
    let exec_handle = std::thread::Builder::new()
        .name("postcheck-worker-v8".into())
        .spawn(move || run_jobs(config, job_rx, tx, exec_waiters))
        .context("failed to spawn execution thread")?;

    // Reading stdin in its own task keeps partial frames out of select!
    let (incoming_tx, mut incoming) = mpsc::unbounded_channel::<ParentMessage>();
    tokio::spawn(async move {
        loop {
            match read_message_with_limit::<ParentMessage, _>(&mut stdin, max_ipc_size).await {
                Ok(Some(msg)) => {
                    if incoming_tx.send(msg).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read from parent");
                    return;
                }
            }
        }
    });

    // IPC event loop: multiplex between
    // 1. Outgoing messages from the V8 thread (reports, requests, completions)
    // 2. Incoming messages from the parent (jobs, request results, shutdown)
    let mut job_tx = Some(job_tx);
    let mut parent_open = true;

    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                match msg {
                    Some(ChildMessage::Request { request_id, .. }) if !parent_open => {
                        lock(&waiters).remove(&request_id);
                    }
                    Some(child_msg) => {
                        write_message(&mut stdout, &child_msg)
                            .await
                            .context("failed to write message to parent")?;
                    }
                    // The V8 thread drained its queue and exited
                    None => break,
                }
            }

            msg = incoming.recv(), if parent_open => {
                match msg {
                    Some(ParentMessage::Execute { job_id, source, mode, inputs, requests_enabled }) => {
                        match &job_tx {
                            Some(queue) => {
                                let _ = queue.send(Job { job_id, source, mode, inputs, requests_enabled });
                            }
                            None => tracing::warn!(job_id, "job received after shutdown dropped"),
                        }
                    }
                    Some(ParentMessage::RequestResult { request_id, result }) => {
                        if let Some(waiter) = lock(&waiters).remove(&request_id) {
                            let _ = waiter.send(result);
                        }
                    }
                    Some(ParentMessage::Shutdown) => {
                        // Queued jobs still run; the thread exits once the queue is empty
                        job_tx = None;
                    }
                    Some(ParentMessage::Register { .. }) => {
                        tracing::warn!("unexpected Register after handshake");
                    }
                    None => {
                        // Parent closed stdin: no answers will arrive for pending requests
                        parent_open = false;
                        job_tx = None;
                        lock(&waiters).clear();
                    }
                }
            }
        }
    }

    let _ = exec_handle.join();

    Ok(())
}

/// Execution thread: run queued jobs in order until the queue closes.
fn run_jobs(
    config: WorkerConfig,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    tx: mpsc::UnboundedSender<ChildMessage>,
    waiters: Waiters,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = tx.send(ChildMessage::Log {
                message: format!("failed to create tokio runtime: {e}"),
            });
            return;
        }
    };

    let next_request_id = Arc::new(AtomicU64::new(1));
    rt.block_on(async {
        while let Some(job) = jobs.recv().await {
            let job_id = job.job_id;
            run_job(&config, job, &tx, &waiters, &next_request_id).await;
            let _ = tx.send(ChildMessage::ExecutionComplete { job_id });
        }
    });
}

async fn run_job(
    config: &WorkerConfig,
    job: Job,
    tx: &mpsc::UnboundedSender<ChildMessage>,
    waiters: &Waiters,
    next_request_id: &Arc<AtomicU64>,
) {
    let reporter = ResultChannel::from_sink(Arc::new(JobSink {
        job_id: job.job_id,
        tx: tx.clone(),
    }));

    // The parent validated already; the worker does not trust it
    let validator = Validator::new(ValidatorConfig {
        mode: job.mode,
        ..config.validator.clone()
    });
    let script = match validator.accept(&job.source) {
        Ok(script) => script,
        Err(result) => {
            let rejected = SandboxError::Rejected {
                diagnostics: result.diagnostics,
            };
            reporter.send(ReportMessage::Error {
                message: rejected.to_string(),
            });
            return;
        }
    };

    let mut surface = Surface::from_inputs(job.inputs, reporter);
    if job.requests_enabled {
        surface = surface.with_request_sender(Arc::new(IpcRequestBridge {
            job_id: job.job_id,
            tx: tx.clone(),
            waiters: waiters.clone(),
            next_id: next_request_id.clone(),
        }));
    }

    run_in_fresh_compartment(script, surface, config.timeout()).await;
}
