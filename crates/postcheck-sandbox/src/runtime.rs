//! V8 runtime setup and the per-job run loop shared by every strategy.
//!
//! V8 isolates are `!Send`, so everything here runs on the thread that owns
//! the `JsRuntime`. A runtime is bootstrapped once with the JS half of the
//! surface (`js/expect.js`, `js/surface.js`), hardened according to the
//! strategy, and then runs one or more jobs. Each job swaps its [`Surface`]
//! into the op state and takes it out again when the event loop drains;
//! dropping the surface closes that job's result channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions};

use crate::error::SandboxError;
use crate::ops::{postcheck_ext, SurfaceSlot};
use crate::surface::Surface;
use crate::validator::ValidatedScript;

const EXPECT_JS: &str = include_str!("js/expect.js");
const SURFACE_JS: &str = include_str!("js/surface.js");

/// Globals that survive compartment hardening.
const COMPARTMENT_GLOBALS: &[&str] = &[
    "__postcheck",
    "globalThis",
    "undefined",
    "NaN",
    "Infinity",
    "Object",
    "Array",
    "Number",
    "Boolean",
    "String",
    "Symbol",
    "BigInt",
    "Date",
    "Math",
    "JSON",
    "Promise",
    "RegExp",
    "Map",
    "Set",
    "WeakMap",
    "WeakSet",
    "WeakRef",
    "Proxy",
    "Reflect",
    "Iterator",
    "Error",
    "EvalError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "TypeError",
    "URIError",
    "AggregateError",
    "ArrayBuffer",
    "DataView",
    "Int8Array",
    "Uint8Array",
    "Uint8ClampedArray",
    "Int16Array",
    "Uint16Array",
    "Int32Array",
    "Uint32Array",
    "Float32Array",
    "Float64Array",
    "BigInt64Array",
    "BigUint64Array",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "encodeURI",
    "encodeURIComponent",
    "decodeURI",
    "decodeURIComponent",
    "escape",
    "unescape",
];

/// How much of the host realm a runtime strips before running jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hardening {
    /// Allow-listed intrinsics only, no code generation, frozen prototypes.
    Compartment,
    /// `Deno` and `eval` removed, function constructors neutered,
    /// intrinsics sealed.
    Embedded,
    /// `Deno` removed, function constructors neutered, intrinsics sealed.
    /// Scripts are compiled with the `Function` captured at bootstrap.
    Bare,
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    /// The event loop drained.
    Completed,
    /// The watchdog or the event-loop timeout fired. The runtime must not
    /// be reused.
    TimedOut,
}

fn bootstrap_script(hardening: Hardening) -> String {
    // Only the compartment host detaches itself; persistent hosts pin it.
    let (host, configurable) = match hardening {
        Hardening::Compartment => ("host", true),
        Hardening::Embedded => ("host", false),
        Hardening::Bare => (
            r#"Object.freeze({ ...host, compile: (body) => makeFunction("pm", "console", body) })"#,
            false,
        ),
    };
    format!(
        r#"((ops, makeFunction) => {{
    const expect = {EXPECT_JS};
    const host = ({SURFACE_JS})(ops, expect);
    Object.defineProperty(globalThis, "__postcheck", {{
        value: {host}, configurable: {configurable}, enumerable: false, writable: false
    }});
}})(Deno.core.ops, Function);"#
    )
}

const NEUTER_CONSTRUCTORS: &str = r#"
    const AsyncFunction = (async function(){}).constructor;
    const GeneratorFunction = (function*(){}).constructor;
    const AsyncGeneratorFunction = (async function*(){}).constructor;
    const functionPrototypes = [
        Function.prototype,
        AsyncFunction.prototype,
        GeneratorFunction.prototype,
        AsyncGeneratorFunction.prototype,
    ];
    for (const proto of functionPrototypes) {
        Object.defineProperty(proto, 'constructor', {
            value: undefined, configurable: false, writable: false
        });
    }
"#;

/// Freezes the function prototypes and every intrinsic in `sealed` that is
/// still present, pinning its global binding. Runs after `NEUTER_CONSTRUCTORS`.
const SEAL_INTRINSICS: &str = r#"
    for (const proto of functionPrototypes) Object.freeze(proto);
    for (const name of sealed) {
        const desc = Reflect.getOwnPropertyDescriptor(globalThis, name);
        if (desc === undefined || !("value" in desc)) continue;
        if (desc.configurable) {
            Reflect.defineProperty(globalThis, name, { writable: false, configurable: false });
        }
        const value = desc.value;
        if (name === "globalThis") continue;
        if (value === null || (typeof value !== "object" && typeof value !== "function")) continue;
        Object.freeze(value);
        if (value.prototype) Object.freeze(value.prototype);
    }
"#;

/// Intrinsics the seal pass covers. `Function` is absent from compartments
/// by the time the seal runs.
fn sealed_globals() -> String {
    let names: Vec<&str> = COMPARTMENT_GLOBALS
        .iter()
        .copied()
        .filter(|name| *name != "__postcheck")
        .chain(["Function"])
        .collect();
    serde_json::Value::from(names).to_string()
}

fn hardening_script(hardening: Hardening) -> String {
    let sealed = sealed_globals();
    match hardening {
        Hardening::Bare => format!(
            "(() => {{\n    const sealed = {sealed};\n    delete globalThis.Deno;\n{NEUTER_CONSTRUCTORS}{SEAL_INTRINSICS}}})();"
        ),
        Hardening::Embedded => format!(
            "(() => {{\n    const sealed = {sealed};\n    delete globalThis.Deno;\n    delete globalThis.eval;\n{NEUTER_CONSTRUCTORS}{SEAL_INTRINSICS}}})();"
        ),
        Hardening::Compartment => {
            let keep = serde_json::Value::from(COMPARTMENT_GLOBALS.to_vec()).to_string();
            format!(
                r#"(() => {{
    const keep = new Set({keep});
    const sealed = {sealed};
{NEUTER_CONSTRUCTORS}
    for (const name of Reflect.ownKeys(globalThis)) {{
        if (typeof name === "string" && !keep.has(name)) {{
            Reflect.deleteProperty(globalThis, name);
        }}
    }}
{SEAL_INTRINSICS}}})();"#
            )
        }
    }
}

/// Create a runtime with the surface bootstrapped and `hardening` applied.
pub(crate) fn create_runtime(hardening: Hardening) -> Result<JsRuntime, SandboxError> {
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![postcheck_ext::init_ops_and_esm()],
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(SurfaceSlot::default());

    runtime
        .execute_script("[postcheck:bootstrap]", bootstrap_script(hardening))
        .map_err(|e| SandboxError::JsError {
            message: e.to_string(),
        })?;
    runtime
        .execute_script("[postcheck:harden]", hardening_script(hardening))
        .map_err(|e| SandboxError::JsError {
            message: e.to_string(),
        })?;
    Ok(runtime)
}

/// The script that runs one job under `hardening`.
pub(crate) fn job_script(script: &ValidatedScript, hardening: Hardening) -> String {
    let wrapped = script.wrapped();
    match hardening {
        Hardening::Compartment => format!(
            "globalThis.__postcheck.settle((function (pm, console) {{ \"use strict\"; return {wrapped}; }}).call(undefined, ...globalThis.__postcheck.detach()));"
        ),
        Hardening::Embedded => format!(
            "globalThis.__postcheck.settle((function (pm, console) {{ \"use strict\"; return {wrapped}; }}).call(undefined, ...globalThis.__postcheck.scope()));"
        ),
        Hardening::Bare => {
            let body = serde_json::Value::String(format!("\"use strict\";\nreturn {wrapped};"));
            format!(
                "globalThis.__postcheck.settle(globalThis.__postcheck.compile({body}).call(undefined, ...globalThis.__postcheck.scope()));"
            )
        }
    }
}

/// Reduce a V8 error to the message a script author expects to see.
fn clean_error(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default().trim();
    let line = line
        .strip_prefix("Uncaught (in promise) ")
        .or_else(|| line.strip_prefix("Uncaught "))
        .unwrap_or(line);
    line.strip_prefix("Error: ").unwrap_or(line).to_string()
}

/// Run one job on `runtime`.
///
/// A CPU watchdog thread terminates V8 if `timeout` elapses while the
/// script is busy; the event loop is bounded by the same timeout. Uncaught
/// failures and timeouts are reported on the surface before it is dropped.
pub(crate) async fn run_job(
    runtime: &mut JsRuntime,
    script: String,
    surface: Surface,
    timeout: Option<Duration>,
) -> JobOutcome {
    runtime.op_state().borrow_mut().put(SurfaceSlot(Some(surface)));

    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog = timeout.map(|limit| {
        let handle = runtime.v8_isolate().thread_safe_handle();
        let flag = timed_out.clone();
        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(limit)
            {
                flag.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });
        (cancel_tx, thread)
    });

    let failure = match runtime.execute_script("[postcheck:job]", script) {
        Ok(_) => {
            let event_loop = runtime.run_event_loop(PollEventLoopOptions::default());
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, event_loop).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => {
                        timed_out.store(true, Ordering::SeqCst);
                        None
                    }
                },
                None => event_loop.await.err().map(|e| e.to_string()),
            }
        }
        Err(e) => Some(e.to_string()),
    };

    // The watchdog holds an isolate handle; join it before the runtime can drop.
    if let Some((cancel_tx, thread)) = watchdog {
        let _ = cancel_tx.send(());
        let _ = thread.join();
    }

    let surface = runtime
        .op_state()
        .borrow_mut()
        .try_borrow_mut::<SurfaceSlot>()
        .and_then(|slot| slot.0.take());
    let Some(mut surface) = surface else {
        tracing::warn!("job surface missing after execution");
        return JobOutcome::Completed;
    };

    if timed_out.load(Ordering::SeqCst) {
        let ms = timeout.map(|t| t.as_millis()).unwrap_or_default();
        tracing::warn!(timeout_ms = ms as u64, "script timed out");
        surface.report_error(format!("script timed out after {ms}ms"));
        return JobOutcome::TimedOut;
    }
    if let Some(message) = failure {
        tracing::debug!(error = %message, "script failed");
        surface.report_error(clean_error(&message));
    }
    JobOutcome::Completed
}
