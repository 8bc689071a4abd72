#![warn(missing_docs)]

//! # postcheck-sandbox
//!
//! Static validation and isolated execution of post-response test scripts.
//!
//! A script is checked by the [`Validator`] before it may run. Accepted
//! scripts execute in a deno_core isolate whose only bridge to the host is
//! the `pm` capability surface. Every outcome (test results, environment
//! changes, console output, uncaught errors) is reported as a
//! [`ReportMessage`] on an asynchronous result channel, never as a return
//! value.
//!
//! ## Security model
//!
//! - **Pre-execution validation**: deny-list or allow-list policy over identifiers and call sites
//! - **Capability surface**: scripts see `pm` and a `console` capture, nothing else by contract
//! - **Isolation strategies**: worker process, fresh compartment, persistent embedded context, or direct
//! - **Timeout enforcement**: CPU watchdog plus event-loop deadline per execution
//! - **Opaque requests**: `pm.sendRequest` goes through a host [`RequestSender`]

pub mod channel;
pub mod environment;
pub mod error;
pub mod host;
pub mod html;
pub mod ipc;
pub mod ops;
pub mod request;
pub mod response;
mod runtime;
pub mod sandbox;
pub mod strategy;
pub mod surface;
pub mod validator;

pub use channel::{
    result_channel, ConsoleLevel, Report, ReportMessage, ReportSink, ResultChannel,
    ResultListener, TestResult, TestStatus,
};
pub use environment::{EnvSnapshot, EnvValue, Environment};
pub use error::SandboxError;
pub use request::{HttpRequestSender, OutboundRequest, RequestReply};
pub use response::{ContentType, MockResponse};
pub use sandbox::{Sandbox, SandboxConfig};
pub use strategy::{build_strategy, IsolationStrategy, StrategyKind};
pub use surface::{build_surface, Surface, SurfaceInputs};
pub use validator::{
    validate, Diagnostic, PolicyMode, Severity, ValidatedScript, ValidationResult, Validator,
    ValidatorConfig,
};

/// Trait for performing `pm.sendRequest` on behalf of a script.
///
/// The sandbox itself has no network access. Implementations decide what a
/// script may reach; failures are reported to the caller as `requestError`
/// messages and never raised inside the script.
#[async_trait::async_trait]
pub trait RequestSender: Send + Sync {
    /// Perform one request.
    async fn send(
        &self,
        request: OutboundRequest,
    ) -> Result<RequestReply, postcheck_error::RequestError>;
}
