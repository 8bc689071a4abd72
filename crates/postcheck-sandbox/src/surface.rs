//! The capability surface: everything a script can reach.
//!
//! A [`Surface`] is built fresh per execution from explicit inputs. The JS
//! side (`js/surface.js`) exposes it as the `pm` object and the `console`
//! capture; every side effect goes through methods here, which emit the
//! matching [`ReportMessage`] on the result channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channel::{ConsoleLevel, ReportMessage, ResultChannel, TestResult};
use crate::environment::{resolve, EnvSnapshot, EnvValue, Environment, VariableScope};
use crate::html::Document;
use crate::response::{ContentType, Headers, MockResponse};
use crate::RequestSender;

/// Target for script console output mirrored into the host log.
pub const JS_LOG_TARGET: &str = "postcheck::sandbox::js";

/// The serializable part of a surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceInputs {
    /// The response under test.
    pub response: MockResponse,
    /// Initial environment.
    #[serde(default)]
    pub environment: EnvSnapshot,
    /// Read-only global variables.
    #[serde(default)]
    pub globals: EnvSnapshot,
    /// Read-only collection variables.
    #[serde(default)]
    pub collection_variables: EnvSnapshot,
}

impl SurfaceInputs {
    /// Inputs with empty variable scopes.
    pub fn new(response: MockResponse, environment: EnvSnapshot) -> Self {
        Self {
            response,
            environment,
            ..Self::default()
        }
    }
}

/// One parsed cookie as seen by the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CookieView {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
}

/// JSON view of the response handed to the JS surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseView {
    /// Status code.
    pub code: u16,
    /// Reason phrase.
    pub status: String,
    /// Response time in milliseconds.
    pub response_time: u64,
    /// Headers in order.
    pub headers: Vec<(String, String)>,
    /// Parsed cookies.
    pub cookies: Vec<CookieView>,
    /// `"json"` or `"html"`.
    pub content_type: ContentType,
    /// Body text.
    pub body: String,
}

fn parse_cookie(raw: &str) -> Option<CookieView> {
    let pair = raw.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(CookieView {
        name: name.to_string(),
        value: value.trim().to_string(),
    })
}

/// Capability surface of one execution.
pub struct Surface {
    response: MockResponse,
    environment: Environment,
    globals: EnvSnapshot,
    collection: EnvSnapshot,
    reporter: ResultChannel,
    requests: Option<Arc<dyn RequestSender>>,
    error_reported: bool,
    documents: Vec<Document>,
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("status_code", &self.response.status_code)
            .field("environment", &self.environment)
            .field("requests", &self.requests.is_some())
            .field("error_reported", &self.error_reported)
            .finish_non_exhaustive()
    }
}

/// Build the surface for one execution.
pub fn build_surface(
    response: MockResponse,
    environment: Environment,
    reporter: ResultChannel,
) -> Surface {
    Surface {
        response,
        environment,
        globals: EnvSnapshot::new(),
        collection: EnvSnapshot::new(),
        reporter,
        requests: None,
        error_reported: false,
        documents: Vec::new(),
    }
}

impl Surface {
    /// Build a surface from serialized inputs.
    pub fn from_inputs(inputs: SurfaceInputs, reporter: ResultChannel) -> Self {
        build_surface(
            inputs.response,
            Environment::from_snapshot(inputs.environment),
            reporter,
        )
        .with_variables(inputs.globals, inputs.collection_variables)
    }

    /// Attach read-only globals and collection variables.
    pub fn with_variables(mut self, globals: EnvSnapshot, collection: EnvSnapshot) -> Self {
        self.globals = globals;
        self.collection = collection;
        self
    }

    /// Enable `pm.sendRequest` through `sender`.
    pub fn with_request_sender(mut self, sender: Arc<dyn RequestSender>) -> Self {
        self.requests = Some(sender);
        self
    }

    /// The response under test.
    pub fn response(&self) -> &MockResponse {
        &self.response
    }

    /// The current environment.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// The result channel.
    pub fn reporter(&self) -> &ResultChannel {
        &self.reporter
    }

    /// The configured request sender, if any.
    pub fn request_sender(&self) -> Option<Arc<dyn RequestSender>> {
        self.requests.clone()
    }

    /// Split into serializable inputs and the live parts that cannot cross
    /// a serialization boundary.
    pub fn into_parts(
        self,
    ) -> (
        SurfaceInputs,
        ResultChannel,
        Option<Arc<dyn RequestSender>>,
    ) {
        let inputs = SurfaceInputs {
            response: self.response,
            environment: self.environment.into_snapshot(),
            globals: self.globals,
            collection_variables: self.collection,
        };
        (inputs, self.reporter, self.requests)
    }

    /// Report one `pm.test` outcome.
    pub fn record_test(&self, name: &str, failure: Option<String>) {
        let result = match failure {
            None => TestResult::passed(name),
            Some(message) => TestResult::failed(name, message),
        };
        tracing::debug!(test = name, status = ?result.status, "test result");
        self.reporter.send(ReportMessage::TestResult { result });
    }

    /// Look up `key` in a variable scope.
    pub fn variable(&self, scope: VariableScope, key: &str) -> Option<&EnvValue> {
        match scope {
            VariableScope::Environment => self.environment.get(key),
            VariableScope::Globals => self.globals.get(key),
            VariableScope::Collection => self.collection.get(key),
            VariableScope::Resolved => {
                resolve(key, &self.environment, &self.collection, &self.globals)
            }
        }
    }

    /// All variables of a scope as a JSON object.
    pub fn variables_object(&self, scope: VariableScope) -> serde_json::Map<String, serde_json::Value> {
        let to_object = |snapshot: &EnvSnapshot| {
            snapshot
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect::<serde_json::Map<_, _>>()
        };
        match scope {
            VariableScope::Environment => to_object(self.environment.snapshot()),
            VariableScope::Globals => to_object(&self.globals),
            VariableScope::Collection => to_object(&self.collection),
            VariableScope::Resolved => {
                let mut merged = to_object(&self.globals);
                merged.extend(to_object(&self.collection));
                merged.extend(to_object(self.environment.snapshot()));
                merged
            }
        }
    }

    /// `pm.environment.set`: update and emit `setEnv` synchronously.
    pub fn env_set(&mut self, key: String, value: EnvValue) {
        self.environment.set(key, value, &self.reporter);
    }

    /// Forward one captured console call.
    pub fn console(&self, level: ConsoleLevel, args: Vec<serde_json::Value>) {
        tracing::debug!(target: JS_LOG_TARGET, ?level, args = ?args, "console");
        self.reporter.send(ReportMessage::Console { level, args });
    }

    /// Report the uncaught top-level error. Only the first call per
    /// execution emits; returns whether this call did.
    pub fn report_error(&mut self, message: impl Into<String>) -> bool {
        if self.error_reported {
            return false;
        }
        self.error_reported = true;
        let message = message.into();
        tracing::debug!(error = %message, "script error");
        self.reporter.send(ReportMessage::Error { message });
        true
    }

    /// Report a swallowed `pm.sendRequest` failure.
    pub fn report_request_error(&self, message: impl Into<String>) {
        self.reporter.send(ReportMessage::RequestError {
            message: message.into(),
        });
    }

    /// JSON view of the response for the JS surface.
    pub fn response_view(&self) -> ResponseView {
        ResponseView {
            code: self.response.status_code,
            status: self.response.status_text().to_string(),
            response_time: self.response.response_time_ms,
            headers: self
                .response
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            cookies: self
                .response
                .cookies
                .iter()
                .filter_map(|c| parse_cookie(c))
                .collect(),
            content_type: self.response.content_type,
            body: self.response.body_text(),
        }
    }

    /// Parse markup into a new document; returns its handle.
    pub fn parse_html(&mut self, markup: &str) -> usize {
        self.documents.push(Document::parse(markup));
        self.documents.len() - 1
    }

    /// A previously parsed document.
    pub fn document(&self, handle: usize) -> Option<&Document> {
        self.documents.get(handle)
    }

    /// Response headers.
    pub fn headers(&self) -> &Headers {
        &self.response.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{result_channel, Report, TestStatus};
    use serde_json::json;

    fn surface_with(inputs: SurfaceInputs) -> (Surface, crate::channel::ResultListener) {
        let (channel, listener) = result_channel();
        (Surface::from_inputs(inputs, channel), listener)
    }

    async fn finish(surface: Surface, listener: crate::channel::ResultListener) -> Report {
        drop(surface);
        listener.collect().await
    }

    #[tokio::test]
    async fn env_round_trip_emits_exactly_one_set_env() {
        let (mut surface, listener) = surface_with(SurfaceInputs::default());
        surface.env_set("k".into(), EnvValue::from("v"));
        assert_eq!(
            surface.variable(VariableScope::Environment, "k"),
            Some(&EnvValue::from("v"))
        );
        let report = finish(surface, listener).await;
        assert_eq!(report.env_changes, vec![("k".to_string(), EnvValue::from("v"))]);
    }

    #[tokio::test]
    async fn record_test_uses_fixed_success_message() {
        let (surface, listener) = surface_with(SurfaceInputs::default());
        surface.record_test("ok", None);
        surface.record_test("bad", Some("expected 404 to equal 200".into()));
        let report = finish(surface, listener).await;
        assert_eq!(report.tests[0].message, "Test passed successfully");
        assert_eq!(report.tests[1].status, TestStatus::Fail);
        assert_eq!(report.tests[1].message, "expected 404 to equal 200");
    }

    #[tokio::test]
    async fn report_error_emits_once() {
        let (mut surface, listener) = surface_with(SurfaceInputs::default());
        assert!(surface.report_error("first"));
        assert!(!surface.report_error("second"));
        let report = finish(surface, listener).await;
        assert_eq!(report.error.as_deref(), Some("first"));
    }

    #[test]
    fn variables_resolve_narrowest_first() {
        let inputs = SurfaceInputs {
            environment: EnvSnapshot::from([("a".into(), "env".into())]),
            globals: EnvSnapshot::from([("a".into(), "glob".into()), ("g".into(), "glob".into())]),
            collection_variables: EnvSnapshot::from([("a".into(), "col".into())]),
            ..SurfaceInputs::default()
        };
        let (surface, _listener) = surface_with(inputs);
        assert_eq!(
            surface.variable(VariableScope::Resolved, "a"),
            Some(&EnvValue::from("env"))
        );
        assert_eq!(
            surface.variable(VariableScope::Globals, "a"),
            Some(&EnvValue::from("glob"))
        );
        let merged = surface.variables_object(VariableScope::Resolved);
        assert_eq!(merged["a"], json!("env"));
        assert_eq!(merged["g"], json!("glob"));
    }

    #[test]
    fn response_view_parses_cookies_and_reason() {
        let response = MockResponse::json(json!({"ok": true}))
            .with_status(404)
            .with_cookie("session=abc123; Path=/; HttpOnly")
            .with_cookie("malformed");
        let (surface, _listener) = surface_with(SurfaceInputs::new(response, EnvSnapshot::new()));
        let view = surface.response_view();
        assert_eq!(view.status, "Not Found");
        assert_eq!(
            view.cookies,
            vec![CookieView {
                name: "session".into(),
                value: "abc123".into()
            }]
        );
        assert_eq!(view.body, r#"{"ok":true}"#);
    }

    #[test]
    fn into_parts_preserves_inputs() {
        let inputs = SurfaceInputs::new(
            MockResponse::html("<p>x</p>"),
            EnvSnapshot::from([("k".into(), "v".into())]),
        );
        let (surface, _listener) = surface_with(inputs.clone());
        let (parts, _reporter, requests) = surface.into_parts();
        assert_eq!(parts, inputs);
        assert!(requests.is_none());
    }

    #[test]
    fn inputs_deserialize_camel_case() {
        let inputs: SurfaceInputs = serde_json::from_value(json!({
            "response": {"body": "hi", "contentType": "html", "statusCode": 201},
            "collectionVariables": {"c": 1}
        }))
        .unwrap();
        assert_eq!(inputs.response.status_code, 201);
        assert_eq!(inputs.collection_variables["c"], EnvValue::from(1));
    }
}
