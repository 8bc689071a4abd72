//! End-to-end execution through [`Sandbox`] across the in-process strategies.
//!
//! The worker strategy joins this matrix in the `postcheck-worker` crate,
//! which owns the worker binary.

use std::sync::{Arc, Mutex};

use postcheck_sandbox::{
    ConsoleLevel, EnvValue, MockResponse, OutboundRequest, Report, RequestReply, RequestSender,
    Sandbox, SandboxConfig, SandboxError, StrategyKind, SurfaceInputs, TestStatus,
};
use serde_json::json;

const IN_PROCESS: [StrategyKind; 3] = [
    StrategyKind::Compartment,
    StrategyKind::Embedded,
    StrategyKind::Direct,
];

const SCENARIO: &str = r#"
pm.test("code is 200", () => pm.expect(pm.response.code).to.equal(200));
const r = await pm.response.json();
pm.test("has message", () => pm.expect(r).to.have.property("message", "Success"));
"#;

async fn sandbox(strategy: StrategyKind) -> Sandbox {
    Sandbox::new(SandboxConfig {
        strategy,
        ..SandboxConfig::default()
    })
    .await
    .unwrap()
}

fn success_inputs() -> SurfaceInputs {
    SurfaceInputs::new(
        MockResponse::json(json!({ "message": "Success" })),
        Default::default(),
    )
}

async fn run_everywhere(source: &str, inputs: SurfaceInputs) -> Vec<(StrategyKind, Report)> {
    let mut reports = Vec::new();
    for kind in IN_PROCESS {
        let report = sandbox(kind).await.run(source, inputs.clone()).await.unwrap();
        reports.push((kind, report));
    }
    reports
}

fn assert_equivalent(reports: &[(StrategyKind, Report)]) {
    let (first_kind, first) = &reports[0];
    for (kind, report) in &reports[1..] {
        assert_eq!(report, first, "{kind} differs from {first_kind}");
    }
}

#[tokio::test]
async fn success_scenario_reports_two_passes() {
    let reports = run_everywhere(SCENARIO, success_inputs()).await;
    for (kind, report) in &reports {
        let names: Vec<_> = report.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["code is 200", "has message"], "{kind}");
        assert!(
            report.tests.iter().all(|t| t.status == TestStatus::Success),
            "{kind}: {report:?}"
        );
        assert!(report.error.is_none(), "{kind}: {:?}", report.error);
    }
    assert_equivalent(&reports);
}

#[tokio::test]
async fn failing_assertion_is_reported_not_raised() {
    let inputs = SurfaceInputs::new(
        MockResponse::json(json!({ "message": "Nope" })).with_status(404),
        Default::default(),
    );
    let reports = run_everywhere(SCENARIO, inputs).await;
    for (kind, report) in &reports {
        assert_eq!(report.tests.len(), 2, "{kind}");
        assert_eq!(report.tests[0].status, TestStatus::Fail);
        assert_eq!(report.tests[0].message, "expected 404 to equal 200");
        assert_eq!(report.tests[1].status, TestStatus::Fail);
        assert!(report.error.is_none(), "{kind}: {:?}", report.error);
    }
    assert_equivalent(&reports);
}

#[tokio::test]
async fn rejected_script_produces_no_listener() {
    for kind in IN_PROCESS {
        let err = sandbox(kind)
            .await
            .submit(r#"fetch("/x");"#, SurfaceInputs::default())
            .unwrap_err();
        match err {
            SandboxError::Rejected { diagnostics } => {
                assert_eq!(diagnostics.len(), 1, "{kind}");
                assert!(diagnostics[0].message.contains("fetch"));
            }
            other => panic!("{kind}: expected Rejected, got {other}"),
        }
    }
}

#[tokio::test]
async fn environment_round_trip() {
    let mut environment = postcheck_sandbox::EnvSnapshot::new();
    environment.insert("base".into(), EnvValue::String("api.test".into()));
    let inputs = SurfaceInputs::new(MockResponse::default(), environment.clone());
    let source = r#"
        pm.test("reads input", () => pm.expect(pm.environment.get("base")).to.equal("api.test"));
        pm.environment.set("k", "v");
        pm.test("sees own write", () => pm.expect(pm.environment.get("k")).to.equal("v"));
    "#;

    let reports = run_everywhere(source, inputs).await;
    for (kind, report) in &reports {
        assert!(report.passed(), "{kind}: {report:?}");
        assert_eq!(
            report.env_changes,
            vec![("k".to_string(), EnvValue::String("v".into()))],
            "{kind}"
        );
        let mut next = environment.clone();
        report.apply_env(&mut next);
        assert_eq!(next.get("k"), Some(&EnvValue::String("v".into())));
        assert_eq!(next.len(), 2);
    }
    assert_equivalent(&reports);
}

#[tokio::test]
async fn uncaught_error_after_tests_keeps_results() {
    let source = r#"
        pm.test("first", () => {});
        const body = await pm.response.json();
        throw new Error("no " + body.missing);
    "#;
    let reports = run_everywhere(source, success_inputs()).await;
    for (kind, report) in &reports {
        assert_eq!(report.tests.len(), 1, "{kind}");
        assert_eq!(report.error.as_deref(), Some("no undefined"), "{kind}");
    }
    assert_equivalent(&reports);
}

#[tokio::test]
async fn console_output_is_captured() {
    let source = r#"console.log("hello", 1); console.warn({ a: true });"#;
    let reports = run_everywhere(source, SurfaceInputs::default()).await;
    for (kind, report) in &reports {
        assert_eq!(report.console.len(), 2, "{kind}");
        assert_eq!(report.console[0].level, ConsoleLevel::Log);
        assert_eq!(report.console[0].args, vec![json!("hello"), json!(1)]);
        assert_eq!(report.console[1].level, ConsoleLevel::Warn);
        assert_eq!(report.console[1].args, vec![json!({ "a": true })]);
    }
    assert_equivalent(&reports);
}

#[tokio::test]
async fn parse_html_queries_markup() {
    let source = r#"
        const doc = pm.parseHTML('<ul id="items"><li class="a">one</li><li>two</li></ul>');
        pm.test("counts items", () => pm.expect(doc.querySelectorAll("li").length).to.equal(2));
        pm.test("reads text", () => pm.expect(doc.querySelector("li.a").textContent).to.equal("one"));
    "#;
    let reports = run_everywhere(source, SurfaceInputs::default()).await;
    for (kind, report) in &reports {
        assert_eq!(report.tests.len(), 2, "{kind}");
        assert!(report.passed(), "{kind}: {report:?}");
    }
}

#[tokio::test]
async fn response_html_body() {
    let inputs = SurfaceInputs::new(
        MockResponse::html("<html><body><h1 id='t'>Title</h1></body></html>"),
        Default::default(),
    );
    let source = r##"
        const doc = await pm.response.html();
        pm.test("heading", () => pm.expect(doc.querySelector("#t").textContent).to.equal("Title"));
    "##;
    let reports = run_everywhere(source, inputs).await;
    for (kind, report) in &reports {
        assert_eq!(report.tests.len(), 1, "{kind}");
        assert!(report.passed(), "{kind}: {report:?}");
    }
    assert_equivalent(&reports);
}

#[tokio::test]
async fn each_run_starts_from_a_fresh_scope() {
    let first = r#"
        var leaked = 1;
        try { Array.prototype.includes = () => true; } catch (e) {}
        try { Math.max = () => 0; } catch (e) {}
        pm.test("first", () => {});
    "#;
    let second = r#"
        pm.test("fresh", () => {
            pm.expect(typeof leaked).to.equal("undefined");
            pm.expect([1].includes(2)).to.equal(false);
            pm.expect(Math.max(1, 2)).to.equal(2);
        });
    "#;
    for kind in IN_PROCESS {
        let sandbox = sandbox(kind).await;
        let report = sandbox.run(first, SurfaceInputs::default()).await.unwrap();
        assert!(report.passed(), "{kind}: {report:?}");

        let report = sandbox.run(second, SurfaceInputs::default()).await.unwrap();
        assert_eq!(report.tests.len(), 1, "{kind}");
        assert!(report.passed(), "{kind}: {report:?}");
    }
}

struct StubSender {
    seen: Mutex<Vec<OutboundRequest>>,
}

#[async_trait::async_trait]
impl RequestSender for StubSender {
    async fn send(
        &self,
        request: OutboundRequest,
    ) -> Result<RequestReply, postcheck_error::RequestError> {
        self.seen.lock().unwrap().push(request);
        Ok(RequestReply {
            code: 201,
            status: "Created".into(),
            headers: [("X-Id", "7")].into_iter().collect(),
            body: r#"{"id":7}"#.into(),
            response_time: 3,
        })
    }
}

#[tokio::test]
async fn send_request_goes_through_host_sender() {
    let source = r#"
        const reply = await pm.sendRequest({
            url: "https://api.test/items",
            method: "post",
            header: { "Content-Type": "application/json" },
            body: { mode: "raw", raw: '{"name":"x"}' },
        });
        pm.test("created", () => pm.expect(reply.code).to.equal(201));
        pm.test("id header", () => pm.expect(reply.headers.get("x-id")).to.equal("7"));
        pm.test("body", () => pm.expect(reply.json().id).to.equal(7));
    "#;

    for kind in IN_PROCESS {
        let stub = Arc::new(StubSender {
            seen: Mutex::new(Vec::new()),
        });
        let report = sandbox(kind)
            .await
            .with_request_sender(stub.clone())
            .run(source, SurfaceInputs::default())
            .await
            .unwrap();
        assert_eq!(report.tests.len(), 3, "{kind}: {report:?}");
        assert!(report.passed(), "{kind}: {report:?}");

        let seen = stub.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].url, "https://api.test/items");
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].headers.get("content-type"), Some("application/json"));
        assert_eq!(seen[0].body.as_deref(), Some(r#"{"name":"x"}"#));
    }
}

#[tokio::test]
async fn send_request_without_sender_reports_request_error() {
    let source = r#"
        let callbackError = null;
        const reply = await pm.sendRequest("https://api.test/", (err) => { callbackError = err; });
        pm.test("no reply", () => pm.expect(reply).to.equal(undefined));
        pm.test("callback saw error", () => pm.expect(callbackError).to.be.a("string"));
    "#;
    let reports = run_everywhere(source, SurfaceInputs::default()).await;
    for (kind, report) in &reports {
        assert_eq!(report.tests.len(), 2, "{kind}");
        assert!(report.passed(), "{kind}: {report:?}");
        assert_eq!(report.request_errors.len(), 1, "{kind}");
        assert!(report.request_errors[0].starts_with("UNAVAILABLE"));
        assert!(report.error.is_none());
    }
    assert_equivalent(&reports);
}

#[tokio::test]
async fn listener_streams_messages_in_order() {
    let sandbox = sandbox(StrategyKind::Compartment).await;
    let mut listener = sandbox
        .submit(
            r#"pm.test("a", () => {}); pm.environment.set("n", 1); pm.test("b", () => {});"#,
            SurfaceInputs::default(),
        )
        .unwrap();

    let mut kinds = Vec::new();
    while let Some(message) = listener.recv().await {
        kinds.push(serde_json::to_value(&message).unwrap()["type"].clone());
    }
    assert_eq!(kinds, vec![json!("testResult"), json!("setEnv"), json!("testResult")]);
}
