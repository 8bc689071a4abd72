//! postcheck - validate and run post-response test scripts.
//!
//! ## Commands
//!
//! - `check`: statically validate a script and print its diagnostics
//! - `run`: validate a script, run it against a mocked response and print
//!   the report as JSON

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use postcheck_config::PostcheckConfig;
use postcheck_sandbox::{
    EnvSnapshot, HttpRequestSender, MockResponse, PolicyMode, Sandbox, SandboxConfig,
    SandboxError, Severity, StrategyKind, SurfaceInputs, ValidationResult, Validator,
    ValidatorConfig,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "postcheck.toml";
const DEFAULT_USER_AGENT: &str = concat!("postcheck/", env!("CARGO_PKG_VERSION"));
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "postcheck")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Statically validated, sandboxed post-response test scripts", long_about = None)]
struct Cli {
    /// Config file (default: ./postcheck.toml when present)
    #[arg(long, global = true, env = "POSTCHECK_CONFIG")]
    config: Option<PathBuf>,

    /// Validator mode: deny or allow (overrides the config file)
    #[arg(long, global = true)]
    mode: Option<PolicyMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a script without running it
    Check {
        /// Script file
        script: PathBuf,
    },

    /// Validate a script and run it against a mocked response
    Run {
        /// Script file
        script: PathBuf,

        /// Mocked response (JSON: statusCode, contentType, headers, cookies, body)
        #[arg(short, long)]
        response: PathBuf,

        /// Environment snapshot (JSON object of string or number values)
        #[arg(short, long)]
        env: Option<PathBuf>,

        /// Write the environment with the script's changes applied
        #[arg(long)]
        env_out: Option<PathBuf>,

        /// Isolation strategy: worker, compartment, embedded or direct
        #[arg(short, long)]
        strategy: Option<StrategyKind>,
    },
}

/// Locate the config file.
///
/// Search order:
/// 1. `--config` or `POSTCHECK_CONFIG`
/// 2. `./postcheck.toml` in the current directory
/// 3. None (no config file found, not an error)
fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let cwd = PathBuf::from(DEFAULT_CONFIG_FILE);
    cwd.exists().then_some(cwd)
}

fn load_config(explicit: Option<&Path>) -> Result<PostcheckConfig> {
    match find_config_file(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            PostcheckConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(PostcheckConfig::default())
        }
    }
}

/// Build the validator settings from config overrides and the `--mode` flag.
fn build_validator_config(
    config: &PostcheckConfig,
    mode: Option<PolicyMode>,
) -> Result<ValidatorConfig> {
    let overrides = &config.validator;
    let mut validator = ValidatorConfig::default();
    if let Some(ref mode) = overrides.mode {
        validator.mode = mode
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("invalid [validator] mode")?;
    }
    if let Some(mode) = mode {
        validator.mode = mode;
    }
    if let Some(size) = overrides.max_script_size {
        validator.max_script_size = size;
    }
    validator.allowed_functions = overrides.allowed_functions.clone();
    Ok(validator)
}

/// Build SandboxConfig from config overrides and command-line flags.
fn build_sandbox_config(
    config: &PostcheckConfig,
    strategy: Option<StrategyKind>,
    mode: Option<PolicyMode>,
) -> Result<SandboxConfig> {
    let overrides = &config.sandbox;
    let mut sandbox = SandboxConfig {
        validator: build_validator_config(config, mode)?,
        ..SandboxConfig::default()
    };
    if let Some(ref name) = overrides.strategy {
        sandbox.strategy = name
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("invalid [sandbox] strategy")?;
    }
    if let Some(strategy) = strategy {
        sandbox.strategy = strategy;
    }
    if let Some(secs) = overrides.timeout_secs {
        sandbox.timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(concurrent) = overrides.max_concurrent {
        sandbox.max_concurrent = concurrent;
    }
    Ok(sandbox)
}

fn build_request_sender(config: &PostcheckConfig) -> Result<Option<HttpRequestSender>> {
    let overrides = &config.requests;
    if !overrides.enabled.unwrap_or(true) {
        return Ok(None);
    }
    let timeout = overrides
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
    let user_agent = overrides.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
    let sender =
        HttpRequestSender::new(timeout, user_agent).context("failed to build HTTP client")?;
    Ok(Some(sender))
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn load_response(path: &Path) -> Result<MockResponse> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid mocked response in {}", path.display()))
}

fn load_env(path: Option<&Path>) -> Result<EnvSnapshot> {
    let Some(path) = path else {
        return Ok(EnvSnapshot::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid environment snapshot in {}", path.display()))
}

fn print_diagnostics(path: &Path, result: &ValidationResult) {
    for diagnostic in &result.diagnostics {
        let label = match diagnostic.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Hint => "hint",
        };
        eprintln!(
            "{}:{}:{}: {label}: {}",
            path.display(),
            diagnostic.range.start_line,
            diagnostic.range.start_col,
            diagnostic.message
        );
    }
}

fn check(
    cli_mode: Option<PolicyMode>,
    config: &PostcheckConfig,
    script: &Path,
) -> Result<ExitCode> {
    let source = read_script(script)?;
    let validator = Validator::new(build_validator_config(config, cli_mode)?);
    let result = validator.validate(&source);
    print_diagnostics(script, &result);

    if result.is_valid {
        println!("{}: ok ({} mode)", script.display(), validator.config().mode);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{}: rejected", script.display());
        Ok(ExitCode::FAILURE)
    }
}

struct RunArgs<'a> {
    script: &'a Path,
    response: &'a Path,
    env: Option<&'a Path>,
    env_out: Option<&'a Path>,
    strategy: Option<StrategyKind>,
    mode: Option<PolicyMode>,
}

async fn run(config: &PostcheckConfig, args: RunArgs<'_>) -> Result<ExitCode> {
    let source = read_script(args.script)?;
    let response = load_response(args.response)?;
    let mut environment = load_env(args.env)?;

    let sandbox_config = build_sandbox_config(config, args.strategy, args.mode)?;
    let mut sandbox = Sandbox::new(sandbox_config)
        .await
        .context("failed to start sandbox")?;
    if let Some(sender) = build_request_sender(config)? {
        sandbox = sandbox.with_request_sender(Arc::new(sender));
    }
    tracing::info!(strategy = %sandbox.strategy(), "sandbox ready");

    let inputs = SurfaceInputs::new(response, environment.clone());
    let report = match sandbox.run(&source, inputs).await {
        Ok(report) => report,
        Err(SandboxError::Rejected { diagnostics }) => {
            let result = ValidationResult {
                is_valid: false,
                diagnostics,
            };
            print_diagnostics(args.script, &result);
            println!("{}: rejected", args.script.display());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e).context("execution failed"),
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialize report")?
    );

    if let Some(path) = args.env_out {
        report.apply_env(&mut environment);
        let json = serde_json::to_string_pretty(&environment)
            .context("failed to serialize environment")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check { script } => check(cli.mode, &config, &script),
        Commands::Run {
            script,
            response,
            env,
            env_out,
            strategy,
        } => {
            run(
                &config,
                RunArgs {
                    script: &script,
                    response: &response,
                    env: env.as_deref(),
                    env_out: env_out.as_deref(),
                    strategy,
                    mode: cli.mode,
                },
            )
            .await
        }
    }
}
