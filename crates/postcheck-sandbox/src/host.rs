//! Parent-side management of the `postcheck-worker` child process.
//!
//! Locates the worker binary, spawns it with a clean environment and
//! performs the `Register` / `Registered` handshake over stdin/stdout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::SandboxError;
use crate::ipc::{
    read_message_with_limit, write_message, ChildMessage, ParentMessage, WorkerConfig,
    PROTOCOL_VERSION,
};

/// Environment variable naming the worker binary. Must be an absolute path.
pub const WORKER_BIN_ENV: &str = "POSTCHECK_WORKER_BIN";

/// When set, the worker's stderr is inherited instead of discarded.
pub const DEBUG_ENV: &str = "POSTCHECK_DEBUG";

const WORKER_BIN_NAME: &str = "postcheck-worker";

/// A spawned worker with its pipes taken.
pub(crate) struct WorkerProcess {
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: BufReader<ChildStdout>,
}

/// Spawn `postcheck-worker` with a clean environment.
pub(crate) fn spawn_worker() -> Result<WorkerProcess, SandboxError> {
    let worker_bin = find_worker_binary()?;

    let mut child = Command::new(&worker_bin)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(if std::env::var(DEBUG_ENV).is_ok() {
            std::process::Stdio::inherit()
        } else {
            std::process::Stdio::null()
        })
        .env_clear()
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "failed to spawn worker at {}: {}",
                worker_bin.display(),
                e
            ))
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdin on child")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdout on child")))?;

    tracing::debug!(bin = %worker_bin.display(), pid = ?child.id(), "worker spawned");
    Ok(WorkerProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

/// Send `Register` and wait for a matching `Registered`.
pub(crate) async fn handshake(
    process: &mut WorkerProcess,
    config: &WorkerConfig,
    timeout: Duration,
) -> Result<(), SandboxError> {
    let register = ParentMessage::Register {
        protocol_version: PROTOCOL_VERSION,
        config: config.clone(),
    };
    write_message(&mut process.stdin, &register)
        .await
        .map_err(|e| SandboxError::Handshake {
            reason: format!("failed to send Register: {e}"),
        })?;

    let reply = tokio::time::timeout(
        timeout,
        read_message_with_limit::<ChildMessage, _>(
            &mut process.stdout,
            config.max_ipc_message_size,
        ),
    )
    .await
    .map_err(|_| SandboxError::Handshake {
        reason: format!("no Registered reply within {}ms", timeout.as_millis()),
    })?
    .map_err(|e| SandboxError::Handshake {
        reason: format!("IPC read error: {e}"),
    })?;

    match reply {
        Some(ChildMessage::Registered { protocol_version }) if protocol_version == PROTOCOL_VERSION => {
            tracing::debug!(protocol_version, "worker registered");
            Ok(())
        }
        Some(ChildMessage::Registered { protocol_version }) => Err(SandboxError::Handshake {
            reason: format!(
                "protocol version mismatch: parent {PROTOCOL_VERSION}, worker {protocol_version}"
            ),
        }),
        Some(other) => Err(SandboxError::Handshake {
            reason: format!("expected Registered, got: {other:?}"),
        }),
        None => Err(SandboxError::Handshake {
            reason: "worker exited before registering".into(),
        }),
    }
}

/// Find the `postcheck-worker` binary.
///
/// Search order:
/// 1. `POSTCHECK_WORKER_BIN` environment variable (must be absolute path)
/// 2. Same directory as the current executable, or its parent
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
pub fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    let file_name = format!("{WORKER_BIN_NAME}{}", std::env::consts::EXE_SUFFIX);

    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            // Test binaries live in target/<profile>/deps/, the worker one level up.
            for candidate in [Some(dir), dir.parent()].into_iter().flatten() {
                let worker = candidate.join(&file_name);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::Execution(anyhow::anyhow!(
        "{WORKER_BIN_NAME} binary not found. Set {WORKER_BIN_ENV} or install it next to postcheck"
    )))
}

/// Reject world-writable binaries (Unix only).
fn validate_binary_permissions(_path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "cannot read metadata for {}: {}",
                _path.display(),
                e
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            )));
        }
    }
    Ok(())
}
