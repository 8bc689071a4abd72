//! The background worker against the in-process strategies.
//!
//! Every scenario runs through all four strategies and the reports must
//! match exactly.

use postcheck_sandbox::host::WORKER_BIN_ENV;
use postcheck_sandbox::{
    ConsoleLevel, EnvSnapshot, EnvValue, MockResponse, Report, Sandbox, SandboxConfig,
    StrategyKind, SurfaceInputs, TestStatus,
};
use serde_json::json;
use serial_test::serial;

const ALL: [StrategyKind; 4] = [
    StrategyKind::Compartment,
    StrategyKind::Embedded,
    StrategyKind::Direct,
    StrategyKind::Worker,
];

async fn sandbox(strategy: StrategyKind) -> Sandbox {
    std::env::set_var(WORKER_BIN_ENV, env!("CARGO_BIN_EXE_postcheck-worker"));
    let sandbox = Sandbox::new(SandboxConfig {
        strategy,
        ..SandboxConfig::default()
    })
    .await;
    std::env::remove_var(WORKER_BIN_ENV);
    sandbox.unwrap()
}

async fn run_everywhere(source: &str, inputs: SurfaceInputs) -> Vec<(StrategyKind, Report)> {
    let mut reports = Vec::new();
    for kind in ALL {
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
#[serial]
async fn failing_assertion() {
    let inputs = SurfaceInputs::new(
        MockResponse::json(json!({ "message": "Nope" })).with_status(404),
        Default::default(),
    );
    let source = r#"
        pm.test("code is 200", () => pm.expect(pm.response.code).to.equal(200));
        pm.test("after", () => {});
    "#;
    let reports = run_everywhere(source, inputs).await;
    for (kind, report) in &reports {
        assert_eq!(report.tests.len(), 2, "{kind}");
        assert_eq!(report.tests[0].status, TestStatus::Fail, "{kind}");
        assert_eq!(report.tests[0].message, "expected 404 to equal 200", "{kind}");
        assert_eq!(report.tests[1].status, TestStatus::Success, "{kind}");
        assert!(report.error.is_none(), "{kind}: {:?}", report.error);
    }
    assert_equivalent(&reports);
}

#[tokio::test]
#[serial]
async fn uncaught_error() {
    let source = r#"
        pm.test("first", () => {});
        await Promise.resolve();
        throw new Error("broken after tests");
    "#;
    let reports = run_everywhere(source, SurfaceInputs::default()).await;
    for (kind, report) in &reports {
        assert_eq!(report.tests.len(), 1, "{kind}");
        assert_eq!(report.error.as_deref(), Some("broken after tests"), "{kind}");
    }
    assert_equivalent(&reports);
}

#[tokio::test]
#[serial]
async fn console_output() {
    let source = r#"console.info("id", 42); console.error({ ok: false });"#;
    let reports = run_everywhere(source, SurfaceInputs::default()).await;
    for (kind, report) in &reports {
        assert_eq!(report.console.len(), 2, "{kind}");
        assert_eq!(report.console[0].level, ConsoleLevel::Info, "{kind}");
        assert_eq!(report.console[0].args, vec![json!("id"), json!(42)], "{kind}");
        assert_eq!(report.console[1].level, ConsoleLevel::Error, "{kind}");
        assert_eq!(report.console[1].args, vec![json!({ "ok": false })], "{kind}");
    }
    assert_equivalent(&reports);
}

#[tokio::test]
#[serial]
async fn environment_round_trip() {
    let mut environment = EnvSnapshot::new();
    environment.insert("base".into(), EnvValue::String("api.test".into()));
    let inputs = SurfaceInputs::new(MockResponse::default(), environment);
    let source = r#"
        pm.test("reads input", () => pm.expect(pm.environment.get("base")).to.equal("api.test"));
        pm.environment.set("count", 3);
        pm.test("sees own write", () => pm.expect(pm.environment.get("count")).to.equal(3));
    "#;
    let reports = run_everywhere(source, inputs).await;
    for (kind, report) in &reports {
        assert!(report.passed(), "{kind}: {report:?}");
        assert_eq!(report.env_changes.len(), 1, "{kind}");
        assert_eq!(report.env_changes[0].0, "count", "{kind}");
        assert_eq!(report.env_changes[0].1.to_json(), json!(3), "{kind}");
    }
    assert_equivalent(&reports);
}

#[tokio::test]
#[serial]
async fn parse_html() {
    let source = r#"
        const doc = pm.parseHTML('<ul><li class="a">one</li><li>two</li></ul>');
        pm.test("counts items", () => pm.expect(doc.querySelectorAll("li").length).to.equal(2));
        pm.test("reads text", () => pm.expect(doc.querySelector("li.a").textContent).to.equal("one"));
    "#;
    let reports = run_everywhere(source, SurfaceInputs::default()).await;
    for (kind, report) in &reports {
        assert_eq!(report.tests.len(), 2, "{kind}");
        assert!(report.passed(), "{kind}: {report:?}");
    }
    assert_equivalent(&reports);
}

#[tokio::test]
#[serial]
async fn response_html() {
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
