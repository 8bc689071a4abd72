//! Static validator for post-response test scripts.
//!
//! Scripts are wrapped in an async arrow function (so top-level `await`
//! parses), parsed with `oxc_parser`, and walked once. The walk records
//! identifier references, bare-identifier calls, member accesses and escape
//! patterns; a mode-specific policy then turns those findings into
//! [`Diagnostic`]s. A script is accepted iff no diagnostic is an
//! [`Severity::Error`].
//!
//! Validation is pure: the same source and mode always produce the same
//! diagnostics in the same order.

mod policy;
mod walker;

use std::fmt;
use std::str::FromStr;

use oxc_allocator::Allocator;
use oxc_parser::Parser;
use oxc_span::{SourceType, Span};
use serde::{Deserialize, Serialize};

pub use policy::{
    ALLOWED_CONSTANTS, ALLOWED_INTRINSICS, DENIED_FUNCTIONS, DENIED_IDENTIFIERS, ROOT_OBJECT,
};

/// Maximum bracket nesting depth before the script is rejected unparsed.
const MAX_NESTING_DEPTH: usize = 256;

/// Default maximum script size (64 KB).
pub const DEFAULT_MAX_SCRIPT_SIZE: usize = 64 * 1024;

pub(crate) const WRAP_PREFIX: &str = "(async () => {\n";
pub(crate) const WRAP_SUFFIX: &str = "\n})()";

/// Wrap source the same way for validation and execution.
pub(crate) fn wrap_async(source: &str) -> String {
    let mut wrapped = String::with_capacity(WRAP_PREFIX.len() + source.len() + WRAP_SUFFIX.len());
    wrapped.push_str(WRAP_PREFIX);
    wrapped.push_str(source);
    wrapped.push_str(WRAP_SUFFIX);
    wrapped
}

/// Diagnostic severity. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// A suggestion.
    Hint,
    /// Informational.
    Info,
    /// Reported, but does not reject the script.
    Warning,
    /// Rejects the script.
    Error,
}

impl Severity {
    /// Editor marker code: Hint=1, Info=2, Warning=4, Error=8.
    pub fn code(self) -> u8 {
        match self {
            Self::Hint => 1,
            Self::Info => 2,
            Self::Warning => 4,
            Self::Error => 8,
        }
    }
}

/// A source range. Lines and columns are 1-based and count characters of
/// the caller's source. Line 0 means the position is unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    /// Line of the first character.
    pub start_line: u32,
    /// Column of the first character.
    pub start_col: u32,
    /// Line just past the last character.
    pub end_line: u32,
    /// Column just past the last character.
    pub end_col: u32,
}

/// One validator finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Human-readable message.
    pub message: String,
    /// How severe the finding is.
    pub severity: Severity,
    /// Where it was found.
    pub range: Range,
}

impl Diagnostic {
    pub(crate) fn new(message: impl Into<String>, severity: Severity, range: Range) -> Self {
        Self {
            message: message.into(),
            severity,
            range,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {:?}: {}",
            self.range.start_line, self.range.start_col, self.severity, self.message
        )
    }
}

/// Outcome of validating one script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// True iff no diagnostic is an error.
    pub is_valid: bool,
    /// Diagnostics in visit order.
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let is_valid = !diagnostics.iter().any(|d| d.severity == Severity::Error);
        Self {
            is_valid,
            diagnostics,
        }
    }

    /// Diagnostics that reject the script.
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }
}

/// Which policy table the validator applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Reject a fixed list of dangerous globals and calls.
    #[default]
    Deny,
    /// Reject everything that is not `pm`, an allowed intrinsic or declared.
    Allow,
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deny" => Ok(Self::Deny),
            "allow" => Ok(Self::Allow),
            other => Err(format!("unknown validator mode '{other}'")),
        }
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deny => "deny",
            Self::Allow => "allow",
        })
    }
}

/// Validator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Policy table to apply.
    pub mode: PolicyMode,
    /// Scripts larger than this many bytes are rejected unparsed.
    pub max_script_size: usize,
    /// Bare-identifier callees permitted in allow mode.
    pub allowed_functions: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Deny,
            max_script_size: DEFAULT_MAX_SCRIPT_SIZE,
            allowed_functions: Vec::new(),
        }
    }
}

/// A script that passed validation.
///
/// Only [`Validator::accept`] constructs one, so every isolation strategy
/// receives validated source.
#[derive(Debug, Clone)]
pub struct ValidatedScript {
    source: String,
    mode: PolicyMode,
}

impl ValidatedScript {
    /// The caller's source, unwrapped.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The mode the script was accepted under.
    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    /// The source wrapped in the async arrow used for validation.
    pub(crate) fn wrapped(&self) -> String {
        wrap_async(&self.source)
    }

    /// Skip validation. Lets runtime tests exercise the hardening directly.
    #[cfg(test)]
    pub(crate) fn unchecked(source: &str) -> Self {
        Self {
            source: source.to_string(),
            mode: PolicyMode::Deny,
        }
    }
}

/// Static validator.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    /// Create a validator with the given settings.
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// The validator's settings.
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate `source`. Never fails: malformed input yields a diagnostic.
    pub fn validate(&self, source: &str) -> ValidationResult {
        if source.len() > self.config.max_script_size {
            return ValidationResult::from_diagnostics(vec![Diagnostic::new(
                format!(
                    "Script exceeds maximum size of {} bytes (got {}).",
                    self.config.max_script_size,
                    source.len()
                ),
                Severity::Error,
                Range::default(),
            )]);
        }
        if let Some(depth) = nesting_depth_over_limit(source) {
            return ValidationResult::from_diagnostics(vec![Diagnostic::new(
                format!("Nesting depth {depth} exceeds maximum {MAX_NESTING_DEPTH}."),
                Severity::Error,
                Range::default(),
            )]);
        }

        let wrapped = wrap_async(source);
        let index = LineIndex::new(source);
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, &wrapped, SourceType::cjs()).parse();

        if ret.panicked || !ret.errors.is_empty() {
            let diagnostic = match ret.errors.first() {
                Some(err) => {
                    let range = err
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.first())
                        .map(|label| index.point(label.offset()))
                        .unwrap_or_default();
                    Diagnostic::new(format!("Syntax error: {err}"), Severity::Error, range)
                }
                None => Diagnostic::new(
                    "Syntax error: parser panicked on malformed input",
                    Severity::Error,
                    Range::default(),
                ),
            };
            return ValidationResult::from_diagnostics(vec![diagnostic]);
        }

        let mut walker = walker::AstWalker::default();
        walker.walk_program(&ret.program);

        let policy = policy::Policy {
            mode: self.config.mode,
            allowed_functions: &self.config.allowed_functions,
            declared: &walker.declared,
            index: &index,
        };
        ValidationResult::from_diagnostics(policy.evaluate(&walker.findings))
    }

    /// Validate `source` and, if accepted, wrap it for execution.
    pub fn accept(&self, source: &str) -> Result<ValidatedScript, ValidationResult> {
        let result = self.validate(source);
        if result.is_valid {
            Ok(ValidatedScript {
                source: source.to_string(),
                mode: self.config.mode,
            })
        } else {
            Err(result)
        }
    }
}

/// Validate `source` with default limits under `mode`.
pub fn validate(source: &str, mode: PolicyMode) -> ValidationResult {
    Validator::new(ValidatorConfig {
        mode,
        ..ValidatorConfig::default()
    })
    .validate(source)
}

/// Bracket nesting depth, if it exceeds the limit.
fn nesting_depth_over_limit(code: &str) -> Option<usize> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for ch in code.chars() {
        match ch {
            '{' | '[' | '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' | ']' | ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    (max_depth > MAX_NESTING_DEPTH).then_some(max_depth)
}

/// Maps byte offsets in the wrapped source to 1-based line/column positions
/// in the caller's source.
pub(crate) struct LineIndex<'a> {
    source: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(source: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            source,
            line_starts,
        }
    }

    fn locate(&self, wrapped_offset: usize) -> (u32, u32) {
        let mut offset = wrapped_offset
            .saturating_sub(WRAP_PREFIX.len())
            .min(self.source.len());
        while !self.source.is_char_boundary(offset) {
            offset -= 1;
        }
        let line = self.line_starts.partition_point(|&start| start <= offset);
        let line_start = self.line_starts[line - 1];
        let col = self.source[line_start..offset].chars().count() + 1;
        (line as u32, col as u32)
    }

    pub(crate) fn point(&self, wrapped_offset: usize) -> Range {
        let (line, col) = self.locate(wrapped_offset);
        Range {
            start_line: line,
            start_col: col,
            end_line: line,
            end_col: col,
        }
    }

    pub(crate) fn range(&self, span: Span) -> Range {
        let (start_line, start_col) = self.locate(span.start as usize);
        let (end_line, end_col) = self.locate(span.end as usize);
        Range {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }
}
