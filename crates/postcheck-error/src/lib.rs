//! Typed error types for postcheck capability dispatch.
//!
//! Provides [`RequestError`], the error type of the `RequestSender` trait
//! that backs `pm.sendRequest()` inside the sandbox.

use thiserror::Error;

/// Canonical error type for outbound requests issued on behalf of a script.
///
/// Marked `#[non_exhaustive]` so new failure kinds can be added without
/// breaking downstream matches.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RequestError {
    /// The script supplied request options that cannot be turned into a request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The URL could not be parsed or uses an unsupported scheme.
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl {
        /// The URL as given by the script.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The request did not complete within the configured deadline.
    #[error("request to '{url}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Target URL.
        url: String,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A connection or protocol level failure.
    #[error("request to '{url}' failed: {message}")]
    Transport {
        /// Target URL.
        url: String,
        /// Underlying transport message.
        message: String,
    },

    /// Outbound requests are not available in this execution.
    #[error("sendRequest is not available: {0}")]
    Unavailable(String),

    /// A failure raised in another process and forwarded by code and message.
    #[error("{message}")]
    Remote {
        /// The original [`RequestError::code`].
        code: String,
        /// The original display message.
        message: String,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RequestError {
    /// Returns the error code string for programmatic matching.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidUrl { .. } => "INVALID_URL",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Transport { .. } => "TRANSPORT",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Remote { code, .. } => code,
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Split into code and message so the error can cross a process boundary.
    pub fn to_remote(&self) -> (String, String) {
        (self.code().to_string(), self.to_string())
    }

    /// Render the error the way it is reported to the caller through the
    /// result channel: `"<CODE>: <message>"`.
    pub fn to_report_message(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}

// RequestError crosses thread and task boundaries inside the sandbox.
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<RequestError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_url() {
        let err = RequestError::InvalidUrl {
            url: "ftp://x".into(),
            reason: "unsupported scheme".into(),
        };
        assert_eq!(err.to_string(), "invalid url 'ftp://x': unsupported scheme");
    }

    #[test]
    fn display_timeout() {
        let err = RequestError::Timeout {
            url: "https://slow.example".into(),
            timeout_ms: 2500,
        };
        assert_eq!(
            err.to_string(),
            "request to 'https://slow.example' timed out after 2500ms"
        );
    }

    #[test]
    fn display_internal_is_transparent() {
        let err = RequestError::Internal(anyhow::anyhow!("something broke"));
        assert_eq!(err.to_string(), "something broke");
    }

    #[test]
    fn code_exhaustive() {
        let cases: Vec<(RequestError, &str)> = vec![
            (RequestError::InvalidRequest("x".into()), "INVALID_REQUEST"),
            (
                RequestError::InvalidUrl {
                    url: "u".into(),
                    reason: "r".into(),
                },
                "INVALID_URL",
            ),
            (
                RequestError::Timeout {
                    url: "u".into(),
                    timeout_ms: 1,
                },
                "TIMEOUT",
            ),
            (
                RequestError::Transport {
                    url: "u".into(),
                    message: "m".into(),
                },
                "TRANSPORT",
            ),
            (RequestError::Unavailable("x".into()), "UNAVAILABLE"),
            (
                RequestError::Remote {
                    code: "TIMEOUT".into(),
                    message: "m".into(),
                },
                "TIMEOUT",
            ),
            (RequestError::Internal(anyhow::anyhow!("x")), "INTERNAL"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.code(), expected, "wrong code for {err}");
        }
    }

    #[test]
    fn report_message_carries_code_prefix() {
        let err = RequestError::Transport {
            url: "https://api.example".into(),
            message: "connection refused".into(),
        };
        assert_eq!(
            err.to_report_message(),
            "TRANSPORT: request to 'https://api.example' failed: connection refused"
        );
    }

    #[test]
    fn remote_preserves_report_message() {
        let original = RequestError::Timeout {
            url: "https://slow.example".into(),
            timeout_ms: 100,
        };
        let (code, message) = original.to_remote();
        let forwarded = RequestError::Remote { code, message };
        assert_eq!(forwarded.to_report_message(), original.to_report_message());
    }
}
