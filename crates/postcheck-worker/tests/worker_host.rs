//! Integration tests for the background worker strategy.
//!
//! Each test points `POSTCHECK_WORKER_BIN` at the freshly built worker and
//! drives it through [`Sandbox`] with [`StrategyKind::Worker`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use postcheck_sandbox::host::WORKER_BIN_ENV;
use postcheck_sandbox::{
    MockResponse, OutboundRequest, RequestReply, RequestSender, Sandbox, SandboxConfig,
    SandboxError, StrategyKind, SurfaceInputs, TestStatus,
};
use serde_json::json;
use serial_test::serial;

async fn worker_sandbox(timeout: Option<Duration>) -> Sandbox {
    std::env::set_var(WORKER_BIN_ENV, env!("CARGO_BIN_EXE_postcheck-worker"));
    let sandbox = Sandbox::new(SandboxConfig {
        strategy: StrategyKind::Worker,
        timeout,
        ..SandboxConfig::default()
    })
    .await;
    std::env::remove_var(WORKER_BIN_ENV);
    sandbox.unwrap()
}

#[tokio::test]
#[serial]
async fn success_scenario_in_worker() {
    let sandbox = worker_sandbox(Some(Duration::from_secs(5))).await;
    assert_eq!(sandbox.strategy(), StrategyKind::Worker);

    let inputs = SurfaceInputs::new(
        MockResponse::json(json!({ "message": "Success" })),
        Default::default(),
    );
    let report = sandbox
        .run(
            r#"
            pm.test("code is 200", () => pm.expect(pm.response.code).to.equal(200));
            const r = await pm.response.json();
            pm.test("has message", () => pm.expect(r).to.have.property("message", "Success"));
            "#,
            inputs,
        )
        .await
        .unwrap();

    assert_eq!(report.tests.len(), 2, "{report:?}");
    assert!(report.tests.iter().all(|t| t.status == TestStatus::Success));
    assert!(report.error.is_none());
}

#[tokio::test]
#[serial]
async fn concurrent_jobs_keep_their_own_inputs() {
    let sandbox = worker_sandbox(Some(Duration::from_secs(5))).await;
    let source = r#"
        pm.environment.set("seen", pm.response.code);
        pm.test("ok", () => pm.expect(pm.response.code).to.be.below(600));
    "#;

    let mut listeners = Vec::new();
    for code in [200u16, 404, 503] {
        let inputs =
            SurfaceInputs::new(MockResponse::default().with_status(code), Default::default());
        listeners.push((code, sandbox.submit(source, inputs).unwrap()));
    }

    for (code, listener) in listeners {
        let report = listener.collect().await;
        assert!(report.passed(), "{code}: {report:?}");
        assert_eq!(report.env_changes.len(), 1);
        assert_eq!(report.env_changes[0].1.to_json(), json!(code));
    }
}

#[tokio::test]
#[serial]
async fn worker_survives_timed_out_job() {
    let sandbox = worker_sandbox(Some(Duration::from_millis(300))).await;

    let report = sandbox
        .run("while (true) {}", SurfaceInputs::default())
        .await
        .unwrap();
    assert_eq!(report.error.as_deref(), Some("script timed out after 300ms"));

    let report = sandbox
        .run(r#"pm.test("after", () => {});"#, SurfaceInputs::default())
        .await
        .unwrap();
    assert_eq!(report.tests.len(), 1);
    assert!(report.passed(), "{report:?}");
}

#[tokio::test]
#[serial]
async fn rejected_script_never_reaches_worker() {
    let sandbox = worker_sandbox(None).await;
    let err = sandbox
        .submit(r#"fetch("/x");"#, SurfaceInputs::default())
        .unwrap_err();
    assert!(matches!(err, SandboxError::Rejected { .. }), "{err}");
}

struct RecordingSender {
    urls: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl RequestSender for RecordingSender {
    async fn send(
        &self,
        request: OutboundRequest,
    ) -> Result<RequestReply, postcheck_error::RequestError> {
        self.urls.lock().unwrap().push(request.url.clone());
        if request.url.contains("down") {
            return Err(postcheck_error::RequestError::Unavailable("host is down".into()));
        }
        Ok(RequestReply {
            code: 200,
            status: "OK".into(),
            headers: Default::default(),
            body: "pong".into(),
            response_time: 1,
        })
    }
}

#[tokio::test]
#[serial]
async fn send_request_is_proxied_to_parent() {
    let sender = Arc::new(RecordingSender {
        urls: Mutex::new(Vec::new()),
    });
    let sandbox = worker_sandbox(Some(Duration::from_secs(5)))
        .await
        .with_request_sender(sender.clone());

    let report = sandbox
        .run(
            r#"
            const up = await pm.sendRequest("https://api.test/ping");
            pm.test("pong", () => pm.expect(up.text()).to.equal("pong"));
            const down = await pm.sendRequest("https://down.test/");
            pm.test("no reply", () => pm.expect(down).to.equal(undefined));
            "#,
            SurfaceInputs::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.tests.len(), 2, "{report:?}");
    assert!(report.passed(), "{report:?}");
    assert_eq!(
        report.request_errors,
        vec!["UNAVAILABLE: sendRequest is not available: host is down".to_string()]
    );
    assert_eq!(
        *sender.urls.lock().unwrap(),
        vec!["https://api.test/ping", "https://down.test/"]
    );
}

#[tokio::test]
#[serial]
async fn each_job_starts_from_a_fresh_scope() {
    let sandbox = worker_sandbox(Some(Duration::from_secs(5))).await;
    let first = sandbox
        .run(
            r#"var leaked = 1;
               try { Array.prototype.includes = () => true; } catch (e) {}
               pm.test("first", () => {});"#,
            SurfaceInputs::default(),
        )
        .await
        .unwrap();
    assert!(first.passed(), "{first:?}");

    let second = sandbox
        .run(
            r#"pm.test("fresh", () => {
                   pm.expect(typeof leaked).to.equal("undefined");
                   pm.expect([1].includes(2)).to.equal(false);
               });"#,
            SurfaceInputs::default(),
        )
        .await
        .unwrap();
    assert_eq!(second.tests.len(), 1, "{second:?}");
    assert!(second.passed(), "{second:?}");
}
