#![warn(missing_docs)]

//! # postcheck-config
//!
//! Configuration loading for postcheck.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [validator]
//! mode = "deny"
//! max_script_size = 65536
//! allowed_functions = ["String"]
//!
//! [sandbox]
//! strategy = "compartment"
//! timeout_secs = 5
//! max_concurrent = 8
//!
//! [requests]
//! enabled = true
//! timeout_secs = 10
//! user_agent = "postcheck/${POSTCHECK_BUILD}"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Validator modes accepted in `[validator] mode`.
pub const VALIDATOR_MODES: &[&str] = &["deny", "allow"];

/// Isolation strategies accepted in `[sandbox] strategy`.
pub const STRATEGIES: &[&str] = &["worker", "compartment", "embedded", "direct"];

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level postcheck configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostcheckConfig {
    /// Static validator settings.
    #[serde(default)]
    pub validator: ValidatorOverrides,

    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Outbound request (`pm.sendRequest`) settings.
    #[serde(default)]
    pub requests: RequestOverrides,
}

/// Validator configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorOverrides {
    /// Policy mode: "deny" (default) or "allow".
    #[serde(default)]
    pub mode: Option<String>,

    /// Maximum script size in bytes.
    #[serde(default)]
    pub max_script_size: Option<usize>,

    /// Bare-identifier callees permitted in allow mode.
    #[serde(default)]
    pub allowed_functions: Vec<String>,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Isolation strategy: "worker", "compartment", "embedded" or "direct".
    #[serde(default)]
    pub strategy: Option<String>,

    /// Per-execution timeout in seconds. `0` disables the timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum concurrent compartment executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

/// Outbound request configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestOverrides {
    /// Whether scripts may issue real requests through `pm.sendRequest`.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// User-Agent header sent with every request.
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl PostcheckConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: PostcheckConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(mode) = &self.validator.mode {
            if !VALIDATOR_MODES.contains(&mode.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "validator: unsupported mode '{}', supported: {}",
                    mode,
                    VALIDATOR_MODES.join(", ")
                )));
            }
        }
        if self.validator.max_script_size == Some(0) {
            return Err(ConfigError::Invalid(
                "validator: max_script_size must be greater than zero".into(),
            ));
        }
        if let Some(strategy) = &self.sandbox.strategy {
            if !STRATEGIES.contains(&strategy.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox: unsupported strategy '{}', supported: {}",
                    strategy,
                    STRATEGIES.join(", ")
                )));
            }
        }
        if self.sandbox.max_concurrent == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox: max_concurrent must be greater than zero".into(),
            ));
        }
        if self.requests.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "requests: timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Leave the placeholder if env var not found
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn config_parses_validator_section() {
        let toml = r#"
            [validator]
            mode = "allow"
            max_script_size = 4096
            allowed_functions = ["String", "parseInt"]
        "#;

        let config = PostcheckConfig::from_toml(toml).unwrap();
        assert_eq!(config.validator.mode.as_deref(), Some("allow"));
        assert_eq!(config.validator.max_script_size, Some(4096));
        assert_eq!(config.validator.allowed_functions, vec!["String", "parseInt"]);
    }

    #[test]
    fn config_parses_sandbox_overrides() {
        let toml = r#"
            [sandbox]
            strategy = "worker"
            timeout_secs = 10
            max_concurrent = 4
        "#;

        let config = PostcheckConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.strategy.as_deref(), Some("worker"));
        assert_eq!(config.sandbox.timeout_secs, Some(10));
        assert_eq!(config.sandbox.max_concurrent, Some(4));
    }

    #[test]
    fn config_allows_zero_timeout_to_disable_it() {
        let toml = r#"
            [sandbox]
            timeout_secs = 0
        "#;

        let config = PostcheckConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.timeout_secs, Some(0));
    }

    #[test]
    #[serial]
    fn config_expands_environment_variables() {
        std::env::set_var("POSTCHECK_TEST_AGENT", "ci-runner");
        let toml = r#"
            [requests]
            user_agent = "postcheck/${POSTCHECK_TEST_AGENT}"
        "#;

        let config = PostcheckConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(
            config.requests.user_agent.as_deref(),
            Some("postcheck/ci-runner")
        );
        std::env::remove_var("POSTCHECK_TEST_AGENT");
    }

    #[test]
    fn config_rejects_unknown_mode() {
        let toml = r#"
            [validator]
            mode = "permissive"
        "#;

        let err = PostcheckConfig::from_toml(toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("permissive"), "error should name the mode: {msg}");
        assert!(msg.contains("deny"), "error should list supported modes: {msg}");
    }

    #[test]
    fn config_rejects_unknown_strategy() {
        let toml = r#"
            [sandbox]
            strategy = "iframe"
        "#;

        let err = PostcheckConfig::from_toml(toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("iframe"), "error should name the strategy: {msg}");
        assert!(msg.contains("compartment"), "error should list strategies: {msg}");
    }

    #[test]
    fn config_rejects_zero_concurrency() {
        let toml = r#"
            [sandbox]
            max_concurrent = 0
        "#;

        let err = PostcheckConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn config_rejects_zero_request_timeout() {
        let toml = r#"
            [requests]
            timeout_secs = 0
        "#;

        let err = PostcheckConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let toml = r#"
            [sandbox]
            max_heap_mb = 64
        "#;

        assert!(matches!(
            PostcheckConfig::from_toml(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postcheck.toml");
        std::fs::write(
            &path,
            r#"
            [sandbox]
            strategy = "embedded"
        "#,
        )
        .unwrap();

        let config = PostcheckConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.strategy.as_deref(), Some("embedded"));
    }

    #[test]
    fn config_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PostcheckConfig::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn config_uses_defaults_when_absent() {
        let config = PostcheckConfig::from_toml("").unwrap();
        assert!(config.validator.mode.is_none());
        assert!(config.validator.allowed_functions.is_empty());
        assert!(config.sandbox.strategy.is_none());
        assert!(config.sandbox.timeout_secs.is_none());
        assert!(config.requests.enabled.is_none());
    }

    #[test]
    fn config_parses_full_example() {
        let toml = r#"
            [validator]
            mode = "deny"

            [sandbox]
            strategy = "direct"
            timeout_secs = 2

            [requests]
            enabled = false
            timeout_secs = 3
        "#;

        let config = PostcheckConfig::from_toml(toml).unwrap();
        assert_eq!(config.validator.mode.as_deref(), Some("deny"));
        assert_eq!(config.sandbox.strategy.as_deref(), Some("direct"));
        assert_eq!(config.sandbox.timeout_secs, Some(2));
        assert_eq!(config.requests.enabled, Some(false));
        assert_eq!(config.requests.timeout_secs, Some(3));
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        let result = expand_env_vars("no variables here");
        assert_eq!(result, "no variables here");
    }
}
