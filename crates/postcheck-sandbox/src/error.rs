//! Error types for the postcheck sandbox.

use thiserror::Error;

use crate::validator::Diagnostic;

/// Errors returned when a script cannot be accepted or dispatched.
///
/// Failures that happen while a script runs are never returned; they are
/// reported on the result channel.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The script failed static validation. Nothing was executed.
    #[error("script rejected: {}", summarize(.diagnostics))]
    Rejected {
        /// Every diagnostic the validator produced.
        diagnostics: Vec<Diagnostic>,
    },

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// A JavaScript error was thrown while preparing a context.
    #[error("javascript error: {message}")]
    JsError {
        /// The error message from JavaScript.
        message: String,
    },

    /// Serializing inputs or messages failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Too many concurrent executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// A persistent context stopped accepting jobs.
    #[error("{strategy} context is closed")]
    ContextClosed {
        /// Which strategy owned the context.
        strategy: &'static str,
    },

    /// The background worker did not complete its handshake.
    #[error("worker handshake failed: {reason}")]
    Handshake {
        /// What went wrong.
        reason: String,
    },
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
    let errors: Vec<String> = diagnostics
        .iter()
        .filter(|d| d.severity == crate::validator::Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    match errors.len() {
        0 => "no errors".to_string(),
        1 => errors[0].clone(),
        n => format!("{} (and {} more)", errors[0], n - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{Range, Severity};

    fn diag(message: &str, severity: Severity) -> Diagnostic {
        Diagnostic {
            message: message.into(),
            severity,
            range: Range::default(),
        }
    }

    #[test]
    fn rejected_names_first_error() {
        let err = SandboxError::Rejected {
            diagnostics: vec![
                diag("Potential infinite loop detected.", Severity::Warning),
                diag("Invalid identifier 'fetch' detected.", Severity::Error),
                diag("Invalid identifier 'window' detected.", Severity::Error),
            ],
        };
        assert_eq!(
            err.to_string(),
            "script rejected: Invalid identifier 'fetch' detected. (and 1 more)"
        );
    }

    #[test]
    fn context_closed_names_strategy() {
        let err = SandboxError::ContextClosed {
            strategy: "embedded",
        };
        assert_eq!(err.to_string(), "embedded context is closed");
    }
}
