//! Result channel: how executions report back to the caller.
//!
//! Every surface side effect becomes a [`ReportMessage`] delivered through a
//! [`ResultChannel`]. The channel writes to a [`ReportSink`], which is an
//! in-process mpsc queue for local strategies and the IPC stream inside the
//! worker process. Completion is signalled by the channel closing once every
//! sender is dropped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::environment::{EnvSnapshot, EnvValue};

/// Message of every passing test.
pub const TEST_PASSED_MESSAGE: &str = "Test passed successfully";

/// Outcome of one `pm.test` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// The callback returned without throwing.
    Success,
    /// The callback threw.
    Fail,
}

/// One assertion outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Test name as given to `pm.test`.
    pub name: String,
    /// Pass or fail.
    pub status: TestStatus,
    /// [`TEST_PASSED_MESSAGE`] or the thrown error's message.
    pub message: String,
}

impl TestResult {
    /// A passing result.
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Success,
            message: TEST_PASSED_MESSAGE.to_string(),
        }
    }

    /// A failing result.
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Fail,
            message: message.into(),
        }
    }
}

/// Console method a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    /// `console.log`
    Log,
    /// `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
    /// `console.debug`
    Debug,
}

impl ConsoleLevel {
    /// Parse a console method name. Unknown names map to `Log`.
    pub fn from_method(method: &str) -> Self {
        match method {
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            "debug" => Self::Debug,
            _ => Self::Log,
        }
    }
}

/// One message on the result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReportMessage {
    /// One assertion outcome.
    TestResult {
        /// The outcome.
        result: TestResult,
    },
    /// One environment mutation.
    SetEnv {
        /// Variable name.
        key: String,
        /// New value.
        value: EnvValue,
    },
    /// Captured console output.
    Console {
        /// Console method.
        level: ConsoleLevel,
        /// Arguments as JSON values.
        args: Vec<serde_json::Value>,
    },
    /// Uncaught top-level failure.
    Error {
        /// Error message.
        message: String,
    },
    /// A swallowed `pm.sendRequest` failure.
    RequestError {
        /// Error message.
        message: String,
    },
}

/// Where report messages go.
pub trait ReportSink: Send + Sync {
    /// Deliver one message. Returns `false` if the receiver is gone.
    fn deliver(&self, message: ReportMessage) -> bool;
}

struct MpscSink(mpsc::UnboundedSender<ReportMessage>);

impl ReportSink for MpscSink {
    fn deliver(&self, message: ReportMessage) -> bool {
        self.0.send(message).is_ok()
    }
}

/// Sending half of the result channel.
#[derive(Clone)]
pub struct ResultChannel {
    sink: Arc<dyn ReportSink>,
}

impl std::fmt::Debug for ResultChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultChannel").finish_non_exhaustive()
    }
}

impl ResultChannel {
    /// Wrap an arbitrary sink.
    pub fn from_sink(sink: Arc<dyn ReportSink>) -> Self {
        Self { sink }
    }

    /// Send one message. Sends after the listener is dropped are no-ops.
    pub fn send(&self, message: ReportMessage) {
        if !self.sink.deliver(message) {
            tracing::trace!("result listener dropped, message discarded");
        }
    }
}

/// Create a connected in-process channel.
pub fn result_channel() -> (ResultChannel, ResultListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ResultChannel::from_sink(Arc::new(MpscSink(tx))),
        ResultListener { rx },
    )
}

/// Receiving half of the result channel.
#[derive(Debug)]
pub struct ResultListener {
    rx: mpsc::UnboundedReceiver<ReportMessage>,
}

impl ResultListener {
    /// Next message, or `None` once the execution finished.
    pub async fn recv(&mut self) -> Option<ReportMessage> {
        self.rx.recv().await
    }

    /// Drain every message until completion.
    pub async fn collect(mut self) -> Report {
        let mut report = Report::default();
        while let Some(message) = self.rx.recv().await {
            report.record(message);
        }
        report
    }
}

/// One captured console line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    /// Console method.
    pub level: ConsoleLevel,
    /// Arguments as JSON values.
    pub args: Vec<serde_json::Value>,
}

/// Everything one execution reported, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Assertion outcomes in completion order.
    pub tests: Vec<TestResult>,
    /// Environment mutations in emission order.
    pub env_changes: Vec<(String, EnvValue)>,
    /// Captured console output.
    pub console: Vec<ConsoleEntry>,
    /// The uncaught top-level error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Swallowed `pm.sendRequest` failures.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub request_errors: Vec<String>,
}

impl Report {
    /// Accumulate one message. Only the first `error` is kept.
    pub fn record(&mut self, message: ReportMessage) {
        match message {
            ReportMessage::TestResult { result } => self.tests.push(result),
            ReportMessage::SetEnv { key, value } => self.env_changes.push((key, value)),
            ReportMessage::Console { level, args } => {
                self.console.push(ConsoleEntry { level, args })
            }
            ReportMessage::Error { message } => {
                if self.error.is_none() {
                    self.error = Some(message);
                }
            }
            ReportMessage::RequestError { message } => self.request_errors.push(message),
        }
    }

    /// True when no test failed and no error was reported.
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.tests.iter().all(|t| t.status == TestStatus::Success)
    }

    /// Apply the recorded environment mutations to a snapshot.
    pub fn apply_env(&self, snapshot: &mut EnvSnapshot) {
        for (key, value) in &self.env_changes {
            snapshot.insert(key.clone(), value.clone());
        }
    }
}
