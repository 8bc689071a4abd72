//! Embedded document host: one persistent isolate behind a job queue.

use super::context::{PersistentContext, SurfaceEnvelope};
use super::{IsolationStrategy, StrategyKind};
use crate::error::SandboxError;
use crate::runtime::Hardening;
use crate::sandbox::SandboxConfig;
use crate::surface::Surface;
use crate::validator::ValidatedScript;

/// Runs scripts in a long-lived isolate reachable only through its queue.
///
/// Surface inputs cross into the context as JSON. `Deno` and `eval` are
/// removed and the intrinsics are frozen, so nothing a script does to the
/// realm is visible to later jobs.
pub struct EmbeddedDocumentHost {
    context: PersistentContext,
}

impl EmbeddedDocumentHost {
    /// Start the context thread.
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        Ok(Self {
            context: PersistentContext::start("embedded", Hardening::Embedded, config.timeout)?,
        })
    }
}

impl IsolationStrategy for EmbeddedDocumentHost {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Embedded
    }

    fn execute(&self, script: ValidatedScript, surface: Surface) -> Result<(), SandboxError> {
        self.context
            .submit(script, SurfaceEnvelope::serialize(surface)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::result_channel;
    use crate::environment::EnvValue;
    use crate::response::MockResponse;
    use crate::surface::SurfaceInputs;
    use crate::validator::Validator;

    fn submit(host: &EmbeddedDocumentHost, source: &str) -> crate::channel::ResultListener {
        let (reporter, listener) = result_channel();
        let mut inputs = SurfaceInputs::new(MockResponse::default(), Default::default());
        inputs.environment.insert("token".into(), EnvValue::from("abc"));
        let script = Validator::default().accept(source).unwrap();
        host.execute(script, Surface::from_inputs(inputs, reporter))
            .unwrap();
        listener
    }

    #[tokio::test]
    async fn jobs_run_in_order_with_fresh_inputs() {
        let host = EmbeddedDocumentHost::new(&SandboxConfig::default()).unwrap();
        let first = submit(
            &host,
            r#"pm.environment.set("token", "changed");
               pm.test("first", () => pm.expect(pm.environment.get("token")).to.equal("changed"));"#,
        );
        let second = submit(
            &host,
            r#"pm.test("second", () => pm.expect(pm.environment.get("token")).to.equal("abc"));"#,
        );

        let first = first.collect().await;
        let second = second.collect().await;
        assert!(first.passed(), "{first:?}");
        assert_eq!(first.env_changes.len(), 1);
        assert_eq!(second.tests.len(), 1);
        assert!(second.passed(), "{second:?}");
    }

    #[tokio::test]
    async fn context_survives_a_timeout() {
        let config = SandboxConfig {
            timeout: Some(Duration::from_millis(200)),
            ..SandboxConfig::default()
        };
        let host = EmbeddedDocumentHost::new(&config).unwrap();
        let stuck = submit(&host, "while (true) {}").collect().await;
        assert_eq!(stuck.error.as_deref(), Some("script timed out after 200ms"));

        let next = submit(&host, "pm.test('alive', () => {});").collect().await;
        assert_eq!(next.tests.len(), 1);
        assert!(next.passed(), "{next:?}");
    }
}
