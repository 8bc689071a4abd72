//! IPC protocol between the parent and the `postcheck-worker` process.
//!
//! Uses length-delimited JSON messages: 4-byte big-endian length prefix + JSON payload.
//! All messages are typed via [`ParentMessage`] and [`ChildMessage`] enums.
//!
//! A session starts with `Register` / `Registered`, after which the parent
//! may send any number of `Execute` messages. Each job streams `Report`
//! messages back and ends with `ExecutionComplete`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::channel::ReportMessage;
use crate::request::{OutboundRequest, RequestReply};
use crate::surface::SurfaceInputs;
use crate::validator::{PolicyMode, ValidatorConfig};

/// Protocol version exchanged during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default maximum IPC message size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Messages sent from the parent process to the worker child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// First message of a session.
    Register {
        /// The parent's [`PROTOCOL_VERSION`].
        protocol_version: u32,
        /// Worker configuration.
        config: WorkerConfig,
    },
    /// Run one script.
    Execute {
        /// Correlates reports with the submitting caller.
        job_id: u64,
        /// Script source, already accepted by the parent.
        source: String,
        /// Validator mode the parent accepted it under.
        mode: PolicyMode,
        /// Serialized surface inputs.
        inputs: SurfaceInputs,
        /// Whether `pm.sendRequest` is backed by the parent.
        requests_enabled: bool,
    },
    /// Response to a [`ChildMessage::Request`].
    RequestResult {
        /// Matches the request_id from [`ChildMessage::Request`].
        request_id: u64,
        /// The reply, or the failure split into code and message.
        result: Result<RequestReply, RemoteError>,
    },
    /// Finish queued jobs and exit.
    Shutdown,
}

/// Messages sent from the worker child to the parent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// Handshake answer.
    Registered {
        /// The worker's [`PROTOCOL_VERSION`].
        protocol_version: u32,
    },
    /// One message on a job's result channel.
    Report {
        /// The job that produced it.
        job_id: u64,
        /// The message itself.
        message: ReportMessage,
    },
    /// Ask the parent to perform `pm.sendRequest`.
    Request {
        /// The job issuing the request.
        job_id: u64,
        /// Unique ID for correlating request and response.
        request_id: u64,
        /// The normalized request.
        request: OutboundRequest,
    },
    /// The job finished; its result channel is closed.
    ExecutionComplete {
        /// The finished job.
        job_id: u64,
    },
    /// A log message from the worker.
    Log {
        /// The log message text.
        message: String,
    },
}

/// A request failure carried across the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Stable error code, e.g. `TRANSPORT`.
    pub code: String,
    /// Display message of the original error.
    pub message: String,
}

impl From<&postcheck_error::RequestError> for RemoteError {
    fn from(err: &postcheck_error::RequestError) -> Self {
        let (code, message) = err.to_remote();
        Self { code, message }
    }
}

impl From<RemoteError> for postcheck_error::RequestError {
    fn from(err: RemoteError) -> Self {
        postcheck_error::RequestError::Remote {
            code: err.code,
            message: err.message,
        }
    }
}

/// Configuration passed to the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Per-job timeout, if any.
    pub timeout_ms: Option<u64>,
    /// Validator settings used to re-check each script.
    pub validator: ValidatorConfig,
    /// Maximum IPC message size in bytes. Defaults to [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

impl From<&crate::SandboxConfig> for WorkerConfig {
    fn from(config: &crate::SandboxConfig) -> Self {
        Self {
            timeout_ms: config.timeout.map(|t| t.as_millis() as u64),
            validator: config.validator.clone(),
            max_ipc_message_size: config.max_ipc_message_size,
        }
    }
}

impl WorkerConfig {
    /// The per-job timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Write a length-delimited JSON message to an async writer.
///
/// Format: 4-byte big-endian length prefix followed by the JSON payload bytes.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC payload too large: {} bytes (max {} bytes)",
                payload.len(),
                u32::MAX
            ),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited JSON message from an async reader.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
/// Uses [`DEFAULT_MAX_IPC_MESSAGE_SIZE`] as the size limit.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message with a configurable size limit.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC message too large: {} bytes (limit: {} bytes)",
                len, max_size
            ),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TestResult;
    use crate::response::MockResponse;
    use std::io::Cursor;

    async fn roundtrip<T>(msg: &T) -> T
    where
        T: Serialize + for<'de> Deserialize<'de>,
    {
        let mut buf = Vec::new();
        write_message(&mut buf, msg).await.unwrap();
        let mut cursor = Cursor::new(buf);
        read_message(&mut cursor).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn execute_carries_inputs_and_mode() {
        let msg = ParentMessage::Execute {
            job_id: 9,
            source: "pm.test('a', () => {});".into(),
            mode: PolicyMode::Allow,
            inputs: SurfaceInputs::new(MockResponse::default().with_status(404), Default::default()),
            requests_enabled: true,
        };
        match roundtrip(&msg).await {
            ParentMessage::Execute {
                job_id,
                mode,
                inputs,
                requests_enabled,
                ..
            } => {
                assert_eq!(job_id, 9);
                assert_eq!(mode, PolicyMode::Allow);
                assert_eq!(inputs.response.status_code, 404);
                assert!(requests_enabled);
            }
            other => panic!("expected Execute, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn request_result_error_becomes_remote_request_error() {
        let original = postcheck_error::RequestError::Transport {
            url: "http://x".into(),
            message: "refused".into(),
        };
        let msg = ParentMessage::RequestResult {
            request_id: 3,
            result: Err(RemoteError::from(&original)),
        };
        match roundtrip(&msg).await {
            ParentMessage::RequestResult { request_id, result } => {
                assert_eq!(request_id, 3);
                let err: postcheck_error::RequestError = result.unwrap_err().into();
                assert_eq!(err.to_report_message(), original.to_report_message());
            }
            other => panic!("expected RequestResult, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn report_wire_format_nests_channel_message() {
        let msg = ChildMessage::Report {
            job_id: 1,
            message: ReportMessage::TestResult {
                result: TestResult::passed("ok"),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Report");
        assert_eq!(json["message"]["type"], "testResult");
        assert_eq!(json["message"]["result"]["status"], "success");
    }

    #[tokio::test]
    async fn multiple_messages_in_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &ChildMessage::Log { message: "first".into() })
            .await
            .unwrap();
        write_message(
            &mut buf,
            &ChildMessage::Request {
                job_id: 1,
                request_id: 1,
                request: OutboundRequest::get("http://localhost/"),
            },
        )
        .await
        .unwrap();
        write_message(&mut buf, &ChildMessage::ExecutionComplete { job_id: 1 })
            .await
            .unwrap();

        let mut cursor = Cursor::new(buf);
        let d1: ChildMessage = read_message(&mut cursor).await.unwrap().unwrap();
        let d2: ChildMessage = read_message(&mut cursor).await.unwrap().unwrap();
        let d3: ChildMessage = read_message(&mut cursor).await.unwrap().unwrap();

        assert!(matches!(d1, ChildMessage::Log { .. }));
        assert!(matches!(d2, ChildMessage::Request { .. }));
        assert!(matches!(d3, ChildMessage::ExecutionComplete { job_id: 1 }));

        // EOF after all messages
        let d4: Option<ChildMessage> = read_message(&mut cursor).await.unwrap();
        assert!(d4.is_none());
    }

    #[tokio::test]
    async fn eof_returns_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result: Option<ParentMessage> = read_message(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn u32_try_from_overflow() {
        let overflow_size = u32::MAX as usize + 1;
        assert!(u32::try_from(overflow_size).is_err());
    }

    #[tokio::test]
    async fn read_message_with_limit_rejects_oversized() {
        let msg = ChildMessage::Log {
            message: "x".repeat(1024),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let result: Result<Option<ChildMessage>, _> =
            read_message_with_limit(&mut cursor, 64).await;
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("too large"), "error: {err_msg}");
    }

    #[test]
    fn worker_config_from_sandbox_config() {
        let sandbox = crate::SandboxConfig::default();
        let worker = WorkerConfig::from(&sandbox);
        assert_eq!(worker.timeout(), sandbox.timeout);
        assert_eq!(worker.validator, sandbox.validator);
        assert_eq!(worker.max_ipc_message_size, DEFAULT_MAX_IPC_MESSAGE_SIZE);
    }

    #[test]
    fn worker_config_ipc_limit_serde_default() {
        let json = r#"{
            "timeout_ms": 5000,
            "validator": { "mode": "deny", "max_script_size": 65536, "allowed_functions": [] }
        }"#;
        let config: WorkerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_ipc_message_size, DEFAULT_MAX_IPC_MESSAGE_SIZE);
        assert_eq!(config.timeout(), Some(Duration::from_millis(5000)));
    }
}
