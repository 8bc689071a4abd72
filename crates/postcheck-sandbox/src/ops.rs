//! deno_core op definitions for the postcheck surface.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
//!
//! Every op is infallible from JS's point of view. Failures that the script
//! should see come back as `{"error": "..."}` JSON; failures it should not
//! see are reported on the result channel.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;

use deno_core::op2;
use deno_core::OpState;
use serde_json::{json, Value};

use crate::channel::ConsoleLevel;
use crate::environment::{EnvValue, VariableScope};
use crate::html::Document;
use crate::request::OutboundRequest;
use crate::surface::Surface;

/// The surface of the execution currently running in this isolate.
///
/// Persistent contexts swap a fresh surface in per job and take it out
/// afterwards, which closes the job's result channel.
#[derive(Default)]
pub struct SurfaceSlot(pub Option<Surface>);

fn with_surface<R>(state: &mut OpState, f: impl FnOnce(&mut Surface) -> R) -> Option<R> {
    state
        .try_borrow_mut::<SurfaceSlot>()
        .and_then(|slot| slot.0.as_mut())
        .map(f)
}

fn error_json(message: impl std::fmt::Display) -> String {
    json!({ "error": message.to_string() }).to_string()
}

/// Report one `pm.test` outcome.
#[op2(fast)]
pub fn op_pm_test_result(
    state: &mut OpState,
    #[string] name: &str,
    passed: bool,
    #[string] message: &str,
) {
    let failure = (!passed).then(|| message.to_string());
    with_surface(state, |s| s.record_test(name, failure));
}

/// Forward a captured console call. `args_json` is a JSON array.
#[op2(fast)]
pub fn op_pm_console(state: &mut OpState, #[string] level: &str, #[string] args_json: &str) {
    let args = match serde_json::from_str::<Value>(args_json) {
        Ok(Value::Array(items)) => items,
        Ok(other) => vec![other],
        Err(_) => vec![Value::String(args_json.to_string())],
    };
    let level = ConsoleLevel::from_method(level);
    with_surface(state, |s| s.console(level, args));
}

/// Report the uncaught top-level error of the running script.
#[op2(fast)]
pub fn op_pm_uncaught(state: &mut OpState, #[string] message: &str) {
    with_surface(state, |s| s.report_error(message));
}

/// Look up a variable. Returns its JSON, or `null` when unset.
#[op2]
#[string]
pub fn op_pm_env_get(state: &mut OpState, #[string] scope: &str, #[string] key: &str) -> String {
    let Some(scope) = VariableScope::from_name(scope) else {
        return "null".to_string();
    };
    with_surface(state, |s| {
        s.variable(scope, key)
            .map(|v| v.to_json().to_string())
            .unwrap_or_else(|| "null".to_string())
    })
    .unwrap_or_else(|| "null".to_string())
}

/// All variables of a scope as a JSON object.
#[op2]
#[string]
pub fn op_pm_env_object(state: &mut OpState, #[string] scope: &str) -> String {
    let Some(scope) = VariableScope::from_name(scope) else {
        return "{}".to_string();
    };
    with_surface(state, |s| Value::Object(s.variables_object(scope)).to_string())
        .unwrap_or_else(|| "{}".to_string())
}

/// `pm.environment.set`. `value_json` is the JSON of the script's value.
#[op2(fast)]
pub fn op_pm_env_set(state: &mut OpState, #[string] key: &str, #[string] value_json: &str) {
    let value = serde_json::from_str::<Value>(value_json)
        .map(EnvValue::from_json)
        .unwrap_or_else(|_| EnvValue::String(value_json.to_string()));
    with_surface(state, |s| s.env_set(key.to_string(), value));
}

/// JSON view of the response under test.
#[op2]
#[string]
pub fn op_pm_response(state: &mut OpState) -> String {
    with_surface(state, |s| serde_json::to_string(&s.response_view()))
        .and_then(Result::ok)
        .unwrap_or_else(|| error_json("no response available"))
}

/// Parse markup into a new document. Returns the document handle.
#[op2(fast)]
pub fn op_pm_html_parse(state: &mut OpState, #[string] markup: &str) -> u32 {
    with_surface(state, |s| s.parse_html(markup) as u32).unwrap_or(u32::MAX)
}

/// Parse the response body as HTML. Returns the document handle.
#[op2(fast)]
pub fn op_pm_response_html(state: &mut OpState) -> u32 {
    with_surface(state, |s| {
        let body = s.response().body_text();
        s.parse_html(&body) as u32
    })
    .unwrap_or(u32::MAX)
}

fn with_document(
    state: &mut OpState,
    doc: u32,
    f: impl FnOnce(&Document) -> String,
) -> String {
    with_surface(state, |s| match s.document(doc as usize) {
        Some(document) => f(document),
        None => error_json(format!("unknown document {doc}")),
    })
    .unwrap_or_else(|| error_json("no surface available"))
}

/// Run a selector under `node`. Returns `{"nodes": [...]}` snapshots.
#[op2]
#[string]
pub fn op_pm_html_query(
    state: &mut OpState,
    #[smi] doc: u32,
    #[smi] node: u32,
    #[string] selector: &str,
    all: bool,
) -> String {
    with_document(state, doc, |document| {
        match document.select(node as usize, selector, all) {
            Ok(ids) => {
                let nodes: Vec<_> = ids.into_iter().filter_map(|id| document.snapshot(id)).collect();
                json!({ "nodes": nodes }).to_string()
            }
            Err(e) => error_json(e),
        }
    })
}

/// Element children of `node` as snapshots.
#[op2]
#[string]
pub fn op_pm_html_children(state: &mut OpState, #[smi] doc: u32, #[smi] node: u32) -> String {
    with_document(state, doc, |document| {
        let nodes: Vec<_> = document
            .element_children(node as usize)
            .into_iter()
            .filter_map(|id| document.snapshot(id))
            .collect();
        json!({ "nodes": nodes }).to_string()
    })
}

/// Text content of any node, including the document itself.
#[op2]
#[string]
pub fn op_pm_html_text(state: &mut OpState, #[smi] doc: u32, #[smi] node: u32) -> String {
    with_document(state, doc, |document| {
        json!({ "text": document.text_content(node as usize) }).to_string()
    })
}

/// Issue `pm.sendRequest`. Returns `{"reply": ...}` or `{"error": ...}`;
/// failures are also reported as `requestError`.
#[op2(async)]
#[string]
pub async fn op_pm_send_request(
    op_state: Rc<RefCell<OpState>>,
    #[string] request_json: String,
) -> String {
    let sender = {
        let mut st = op_state.borrow_mut();
        with_surface(&mut st, |s| s.request_sender()).flatten()
    };

    let outcome = match serde_json::from_str::<OutboundRequest>(&request_json) {
        Err(e) => Err(postcheck_error::RequestError::InvalidRequest(e.to_string())),
        Ok(request) => match sender {
            None => Err(postcheck_error::RequestError::Unavailable(
                "no request sender is configured for this execution".into(),
            )),
            Some(sender) => {
                tracing::debug!(url = %request.url, method = %request.method, "sendRequest dispatched");
                sender.send(request).await
            }
        },
    };

    match outcome {
        Ok(reply) => json!({ "reply": reply }).to_string(),
        Err(e) => {
            let message = e.to_report_message();
            let mut st = op_state.borrow_mut();
            with_surface(&mut st, |s| s.report_request_error(message.clone()));
            error_json(message)
        }
    }
}

deno_core::extension!(
    postcheck_ext,
    ops = [
        op_pm_test_result,
        op_pm_console,
        op_pm_uncaught,
        op_pm_env_get,
        op_pm_env_object,
        op_pm_env_set,
        op_pm_response,
        op_pm_html_parse,
        op_pm_response_html,
        op_pm_html_query,
        op_pm_html_children,
        op_pm_html_text,
        op_pm_send_request
    ],
);
