use async_trait::async_trait;
use catalyst_core::error::AgentError;
use catalyst_core::event::{event_types, Envelope};
use catalyst_core::sandbox::Sandbox;
use catalyst_core::types::TestResults;
use std::sync::Arc;

pub struct Tester {
    sandbox: Arc<Sandbox>,
    coverage_threshold: Option<u32>,
}

impl Tester {
    pub fn new(sandbox: Arc<Sandbox>, coverage_threshold: Option<u32>) -> Self {
        Tester { sandbox, coverage_threshold }
    }

    fn parse_results(stdout: &str, exit_code: i32) -> TestResults {
        // pytest-style summary line: "3 passed, 1 failed, 0 skipped"
        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for segment in stdout.split(',') {
            let segment = segment.trim();
            if let Some(n) = segment.strip_suffix(" passed").and_then(|s| s.trim().parse::<u32>().ok()) {
                passed = n;
            } else if let Some(n) = segment.strip_suffix(" failed").and_then(|s| s.trim().parse::<u32>().ok()) {
                failed = n;
            } else if let Some(n) = segment.strip_suffix(" skipped").and_then(|s| s.trim().parse::<u32>().ok()) {
                skipped = n;
            }
        }
        if failed == 0 && passed == 0 && exit_code != 0 {
            // No parseable summary but a nonzero exit: treat as a single
            // opaque failure rather than silently reporting success.
            failed = 1;
        }
        let coverage_percent = stdout
            .lines()
            .find_map(|l| l.trim().strip_prefix("coverage: "))
            .and_then(|s| s.trim_end_matches('%').parse::<u32>().ok());
        TestResults { passed, failed, skipped, coverage_percent }
    }

    /// Shape of a `test.results` payload when the sandbox itself fails to
    /// run (missing image, timeout, exec error) rather than the tests
    /// inside it failing.
    fn sandbox_failure_payload(error: &str, project_id: Option<&serde_json::Value>) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "passed": 0,
            "failed": 0,
            "skipped": 0,
            "coverage_percent": null,
            "passed_overall": false,
            "reason": "sandbox",
            "findings": error,
        });
        if let Some(project_id) = project_id {
            payload["project_id"] = project_id.clone();
        }
        payload
    }
}

#[async_trait]
impl catalyst_core::agent::Agent for Tester {
    fn name(&self) -> &'static str {
        "tester"
    }

    async fn handle_event(&self, envelope: &Envelope) -> Result<Envelope, AgentError> {
        // The repository checkout this runs against is out of this
        // module's scope to materialize from scratch here; the coder's
        // commit already wrote the files into the project's working
        // tree, so the sandbox mounts an empty test fixture unless the
        // caller supplies file contents via the envelope payload.
        let files = envelope
            .payload
            .get("files")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let result = match self.sandbox.run_python_tests(files, Default::default(), vec![]).await {
            Ok(result) => result,
            Err(e) => {
                let payload =
                    Self::sandbox_failure_payload(&e.to_string(), envelope.payload.get("project_id"));
                return Ok(Envelope::new(
                    envelope.trace_id,
                    envelope.task_id,
                    self.name(),
                    event_types::TEST_RESULTS,
                    payload,
                ));
            }
        };

        let results = Self::parse_results(&result.stdout, result.exit_code);
        let ok = results.ok(self.coverage_threshold);
        let event_type = event_types::TEST_RESULTS;
        let mut payload = serde_json::to_value(&results).unwrap_or_default();
        payload["passed_overall"] = serde_json::json!(ok);
        payload["findings"] = serde_json::json!(result.stderr);
        // re-attach pass-through fields the reviewer/orchestrator need
        if let Some(project_id) = envelope.payload.get("project_id") {
            payload["project_id"] = project_id.clone();
        }

        Ok(Envelope::new(envelope.trace_id, envelope.task_id, self.name(), event_type, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_results_reads_pytest_summary_line() {
        let r = Tester::parse_results("3 passed, 1 failed, 0 skipped", 1);
        assert_eq!(r.passed, 3);
        assert_eq!(r.failed, 1);
        assert_eq!(r.skipped, 0);
    }

    #[test]
    fn parse_results_with_zero_test_files_is_ok() {
        let r = Tester::parse_results("0 passed, 0 failed, 0 skipped", 0);
        assert!(r.ok(None));
    }

    #[test]
    fn nonzero_exit_without_summary_counts_as_one_failure() {
        let r = Tester::parse_results("collection error", 2);
        assert_eq!(r.failed, 1);
        assert!(!r.ok(None));
    }

    #[test]
    fn coverage_gate_applies_when_reported() {
        let r = TestResults { passed: 5, failed: 0, skipped: 0, coverage_percent: Some(70) };
        assert!(!r.ok(Some(80)));
        assert!(r.ok(Some(60)));
    }

    #[test]
    fn coverage_gate_skipped_when_not_reported() {
        let r = TestResults { passed: 5, failed: 0, skipped: 0, coverage_percent: None };
        assert!(r.ok(Some(80)));
    }

    #[test]
    fn sandbox_failure_payload_reports_fail_with_reason() {
        let payload = Tester::sandbox_failure_payload("sandbox runner image missing", None);
        assert_eq!(payload["passed_overall"], serde_json::json!(false));
        assert_eq!(payload["reason"], serde_json::json!("sandbox"));
        assert_eq!(payload["findings"], serde_json::json!("sandbox runner image missing"));
    }
}
