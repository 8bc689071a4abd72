//! Policy tables for the two validator modes.

use std::collections::HashSet;

use super::walker::Finding;
use super::{Diagnostic, LineIndex, PolicyMode, Severity};

/// Globals a deny-mode script may not reference unless it declares them.
pub const DENIED_IDENTIFIERS: &[&str] = &[
    "document",
    "window",
    "global",
    "globalThis",
    "self",
    "parent",
    "top",
    "opener",
    "frames",
    "location",
    "history",
    "navigator",
    "screen",
    "localStorage",
    "sessionStorage",
    "indexedDB",
    "caches",
    "cookie",
    "fetch",
    "XMLHttpRequest",
    "Request",
    "Response",
    "WebSocket",
    "EventSource",
    "BroadcastChannel",
    "MessageChannel",
    "Worker",
    "SharedWorker",
    "ServiceWorker",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "requestAnimationFrame",
    "requestIdleCallback",
    "queueMicrotask",
    "eval",
    "Function",
    "SharedArrayBuffer",
    "Atomics",
    "WebAssembly",
    "postMessage",
    "addEventListener",
    "removeEventListener",
    "dispatchEvent",
    "importScripts",
    "crypto",
    "Notification",
    "alert",
    "prompt",
    "confirm",
    "Intl",
    "Performance",
    "AbortController",
    "AbortSignal",
    "Cache",
    "Deno",
    "process",
    "require",
    "__postcheck",
];

/// Bare-identifier callees rejected in deny mode, declared or not.
pub const DENIED_FUNCTIONS: &[&str] = &[
    "eval",
    "Function",
    "setTimeout",
    "setInterval",
    "requestAnimationFrame",
    "requestIdleCallback",
    "importScripts",
    "postMessage",
    "queueMicrotask",
    "dispatchEvent",
    "addEventListener",
    "removeEventListener",
];

/// The capability object every script receives.
pub const ROOT_OBJECT: &str = "pm";

/// Intrinsics an allow-mode script may reference.
pub const ALLOWED_INTRINSICS: &[&str] = &[
    "Array", "Object", "Map", "WeakMap", "Set", "WeakSet", "String", "Promise", "console",
];

/// Value constants an allow-mode script may reference.
pub const ALLOWED_CONSTANTS: &[&str] = &["undefined", "NaN", "Infinity"];

const JARO_WINKLER_THRESHOLD: f64 = 0.85;

/// Own properties of each allow-listed intrinsic's prototype, minus
/// `constructor`. For `console` these are the captured logging methods.
fn allowed_members(object: &str) -> &'static [&'static str] {
    match object {
        "Array" => &[
            "at", "concat", "copyWithin", "entries", "every", "fill", "filter", "find",
            "findIndex", "findLast", "findLastIndex", "flat", "flatMap", "forEach",
            "includes", "indexOf", "join", "keys", "lastIndexOf", "length", "map", "pop",
            "push", "reduce", "reduceRight", "reverse", "shift", "slice", "some", "sort",
            "splice", "toLocaleString", "toReversed", "toSorted", "toSpliced", "toString",
            "unshift", "values", "with",
        ],
        "Object" => &[
            "hasOwnProperty", "isPrototypeOf", "propertyIsEnumerable", "toLocaleString",
            "toString", "valueOf",
        ],
        "Map" => &[
            "clear", "delete", "entries", "forEach", "get", "has", "keys", "set", "size",
            "values",
        ],
        "WeakMap" => &["delete", "get", "has", "set"],
        "Set" => &[
            "add", "clear", "delete", "entries", "forEach", "has", "keys", "size", "values",
        ],
        "WeakSet" => &["add", "delete", "has"],
        "String" => &[
            "at", "charAt", "charCodeAt", "codePointAt", "concat", "endsWith", "includes",
            "indexOf", "lastIndexOf", "length", "localeCompare", "match", "matchAll",
            "normalize", "padEnd", "padStart", "repeat", "replace", "replaceAll", "search",
            "slice", "split", "startsWith", "substring", "toLocaleLowerCase",
            "toLocaleUpperCase", "toLowerCase", "toString", "toUpperCase", "trim", "trimEnd",
            "trimStart", "valueOf",
        ],
        "Promise" => &["catch", "finally", "then"],
        "console" => &["debug", "error", "info", "log", "warn"],
        _ => &[],
    }
}

/// Turns walker findings into diagnostics for one mode.
pub(crate) struct Policy<'a> {
    pub(crate) mode: PolicyMode,
    pub(crate) allowed_functions: &'a [String],
    pub(crate) declared: &'a HashSet<String>,
    pub(crate) index: &'a LineIndex<'a>,
}

impl Policy<'_> {
    pub(crate) fn evaluate(&self, findings: &[Finding]) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for finding in findings {
            match self.mode {
                PolicyMode::Deny => self.deny(finding, &mut diagnostics),
                PolicyMode::Allow => self.allow(finding, &mut diagnostics),
            }
        }
        diagnostics
    }

    fn is_declared(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    fn deny(&self, finding: &Finding, out: &mut Vec<Diagnostic>) {
        match finding {
            Finding::Reference { name, span } => {
                if DENIED_IDENTIFIERS.contains(&name.as_str()) && !self.is_declared(name) {
                    out.push(self.invalid_identifier(name, *span));
                }
            }
            Finding::Call { callee, span } => {
                if DENIED_FUNCTIONS.contains(&callee.as_str()) {
                    out.push(self.forbidden_call(callee, *span));
                }
            }
            Finding::Member { .. } => {}
            Finding::InfiniteLoop { span } => out.push(self.infinite_loop(*span)),
            Finding::Escape { message, span } => {
                out.push(Diagnostic::new(*message, Severity::Error, self.index.range(*span)))
            }
        }
    }

    fn allow(&self, finding: &Finding, out: &mut Vec<Diagnostic>) {
        match finding {
            Finding::Reference { name, span } => {
                if !self.is_allowed_name(name) {
                    out.push(self.invalid_identifier(name, *span));
                    if let Some(candidate) = suggest(name) {
                        out.push(Diagnostic::new(
                            format!("Did you mean '{candidate}'?"),
                            Severity::Hint,
                            self.index.range(*span),
                        ));
                    }
                }
            }
            Finding::Call { callee, span } => {
                if !self.is_declared(callee)
                    && !self.allowed_functions.iter().any(|f| f == callee)
                {
                    out.push(self.forbidden_call(callee, *span));
                }
            }
            Finding::Member {
                object,
                property,
                span,
            } => {
                if object == ROOT_OBJECT
                    || self.is_declared(object)
                    || !ALLOWED_INTRINSICS.contains(&object.as_str())
                {
                    return;
                }
                let permitted = property
                    .as_deref()
                    .is_some_and(|p| allowed_members(object).contains(&p));
                if !permitted {
                    let prop = property.as_deref().unwrap_or("<computed>");
                    out.push(Diagnostic::new(
                        format!("Member '{prop}' of '{object}' is not allowed."),
                        Severity::Error,
                        self.index.range(*span),
                    ));
                }
            }
            Finding::InfiniteLoop { span } => out.push(self.infinite_loop(*span)),
            Finding::Escape { message, span } => {
                out.push(Diagnostic::new(*message, Severity::Error, self.index.range(*span)))
            }
        }
    }

    fn is_allowed_name(&self, name: &str) -> bool {
        name == ROOT_OBJECT
            || ALLOWED_INTRINSICS.contains(&name)
            || ALLOWED_CONSTANTS.contains(&name)
            || self.is_declared(name)
    }

    fn invalid_identifier(&self, name: &str, span: oxc_span::Span) -> Diagnostic {
        Diagnostic::new(
            format!("Invalid identifier '{name}' detected."),
            Severity::Error,
            self.index.range(span),
        )
    }

    fn forbidden_call(&self, callee: &str, span: oxc_span::Span) -> Diagnostic {
        Diagnostic::new(
            format!("Use of function '{callee}' is not allowed due to security risks."),
            Severity::Error,
            self.index.range(span),
        )
    }

    fn infinite_loop(&self, span: oxc_span::Span) -> Diagnostic {
        Diagnostic::new(
            "Potential infinite loop detected.",
            Severity::Warning,
            self.index.range(span),
        )
    }
}

/// Closest allow-listed name to a rejected identifier, if any is close enough.
fn suggest(name: &str) -> Option<&'static str> {
    std::iter::once(ROOT_OBJECT)
        .chain(ALLOWED_INTRINSICS.iter().copied())
        .chain(ALLOWED_CONSTANTS.iter().copied())
        .map(|candidate| (candidate, strsim::jaro_winkler(name, candidate)))
        .filter(|(_, score)| *score >= JARO_WINKLER_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(candidate, _)| candidate)
}
