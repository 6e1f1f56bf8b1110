//! Sequential evaluation of a run's assertions against shared state.
//!
//! The orchestrator seeds one [`CapabilityContext`] from the run input,
//! evaluates every assertion in list order against it and the run's
//! single measurement, and folds each [`AssertionResult`] into a
//! [`RunReport`]. A failed assertion stops the run unless it opted into
//! `continueOnStepFailure`.
//!
//! Execution is strictly sequential: the context is handed to each
//! assertion by `&mut`, and mutations one assertion makes are visible to
//! every later one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};

use crate::capability_context::CapabilityContext;
use crate::config::EngineConfig;
use crate::input::{AssertionSpec, RunInput};
use crate::sandbox_executor::{self, AssertionResult};

const COMPONENT: &str = "test_orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    /// Assertion `index` is next to run.
    Running { index: usize },
    /// Assertion `index` failed without `continueOnStepFailure`.
    Stopped { index: usize },
    Completed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped { .. } | Self::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_name: String,
    #[serde(flatten)]
    pub result: AssertionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub initial_variables: Map<String, Json>,
    pub test_results: Vec<TestResult>,
    pub all_tests_passed: bool,
    pub accumulated_failure_reasons: Vec<String>,
    /// Orchestration-level failure; assertion faults stay in their result.
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub final_variables: Map<String, Json>,
}

impl RunReport {
    fn empty() -> Self {
        Self {
            initial_variables: Map::new(),
            test_results: Vec::new(),
            all_tests_passed: true,
            accumulated_failure_reasons: Vec::new(),
            error: None,
            error_code: None,
            final_variables: Map::new(),
        }
    }

    pub fn passed_count(&self) -> usize {
        self.test_results
            .iter()
            .filter(|test| test.result.success)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.test_results.len() - self.passed_count()
    }
}

/// Structured record of one orchestration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub trace_id: String,
    pub assertion: Option<String>,
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub error_code: Option<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct TestOrchestrator {
    config: EngineConfig,
    state: RunState,
    context: CapabilityContext,
    events: Vec<OrchestratorEvent>,
    trace_id: String,
}

impl TestOrchestrator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: RunState::Idle,
            context: CapabilityContext::new(),
            events: Vec::new(),
            trace_id: String::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn events(&self) -> &[OrchestratorEvent] {
        &self.events
    }

    /// Variables as the last run left them.
    pub fn context(&self) -> &CapabilityContext {
        &self.context
    }

    /// Run every assertion of `input`. Any earlier run's state is reset.
    pub fn execute(&mut self, input: &RunInput) -> RunReport {
        self.state = RunState::Idle;
        self.events.clear();
        self.trace_id = format!("{}-{}", self.config.trace_id_prefix, run_id(input));
        let mut report = RunReport::empty();

        self.context = CapabilityContext::new();
        let seeded = CapabilityContext::from_initial_variables(&input.initial_variables);
        self.context = match seeded {
            Ok(context) => context,
            Err(error) => {
                tracing::warn!(trace_id = %self.trace_id, %error, "run aborted during setup");
                self.push_event(None, "context_seeded", "fail", Some(error.code()));
                report.error = Some(error.to_string());
                report.error_code = Some(error.code().to_string());
                report.all_tests_passed = false;
                self.state = RunState::Completed;
                return report;
            }
        };
        report.initial_variables = self.context.variables().clone();
        self.push_event(None, "context_seeded", "pass", None);
        tracing::info!(
            trace_id = %self.trace_id,
            assertions = input.assertions.len(),
            variables = self.context.len(),
            "run started"
        );

        self.state = if input.assertions.is_empty() {
            RunState::Completed
        } else {
            RunState::Running { index: 0 }
        };
        while let RunState::Running { index } = self.state {
            let spec = &input.assertions[index];
            let result = self.evaluate(index, spec, &input.measurement);
            let passed = result.success;
            if !passed {
                report.all_tests_passed = false;
                report
                    .accumulated_failure_reasons
                    .extend(result.failure_reasons.iter().cloned());
            }
            report.test_results.push(TestResult {
                test_name: spec.name.clone(),
                result,
            });
            self.state = if !passed && !spec.continue_on_step_failure {
                RunState::Stopped { index }
            } else if index + 1 < input.assertions.len() {
                RunState::Running { index: index + 1 }
            } else {
                RunState::Completed
            };
        }

        report.accumulated_failure_reasons = dedup_first_seen(report.accumulated_failure_reasons);
        report.final_variables = self.context.variables().clone();

        let event = match self.state {
            RunState::Stopped { .. } => "run_stopped",
            _ => "run_completed",
        };
        let outcome = if report.all_tests_passed { "pass" } else { "fail" };
        self.push_event(None, event, outcome, None);
        tracing::info!(
            trace_id = %self.trace_id,
            passed = report.passed_count(),
            failed = report.failed_count(),
            all_tests_passed = report.all_tests_passed,
            "{}",
            event.replace('_', " ")
        );
        report
    }

    fn evaluate(&mut self, index: usize, spec: &AssertionSpec, measurement: &Json) -> AssertionResult {
        let assertion_trace = self.assertion_trace(index);
        let _span = tracing::debug_span!("assertion", trace_id = %assertion_trace, assertion = %spec.name)
            .entered();
        let result = sandbox_executor::execute_payload(
            &mut self.context,
            measurement,
            &spec.body,
            &self.config,
        );
        if result.success {
            tracing::debug!("assertion passed");
            self.push_event(
                Some((index, spec.name.as_str())),
                "assertion_evaluated",
                "pass",
                None,
            );
        } else {
            tracing::warn!(
                reasons = ?result.failure_reasons,
                error = result.error.as_deref().unwrap_or(""),
                "assertion failed"
            );
            let code = result.error_code.clone();
            self.push_event(
                Some((index, spec.name.as_str())),
                "assertion_evaluated",
                "fail",
                code.as_deref(),
            );
        }
        result
    }

    fn assertion_trace(&self, index: usize) -> String {
        format!("{}-{index:04}", self.trace_id)
    }

    /// `assertion` is the position and name of the assertion the event
    /// belongs to; run-level events carry the bare run trace id.
    fn push_event(
        &mut self,
        assertion: Option<(usize, &str)>,
        event: &str,
        outcome: &str,
        error_code: Option<&str>,
    ) {
        let trace_id = match assertion {
            Some((index, _)) => self.assertion_trace(index),
            None => self.trace_id.clone(),
        };
        self.events.push(OrchestratorEvent {
            trace_id,
            assertion: assertion.map(|(_, name)| name.to_string()),
            component: COMPONENT.to_string(),
            event: event.to_string(),
            outcome: outcome.to_string(),
            error_code: error_code.map(str::to_string),
        });
    }
}

/// Run `input` with a fresh orchestrator.
pub fn run_tests(input: &RunInput, config: &EngineConfig) -> RunReport {
    TestOrchestrator::new(config.clone()).execute(input)
}

/// Human-readable one-line-per-assertion view of a report.
pub fn render_summary(report: &RunReport) -> String {
    let mut lines = vec![format!(
        "pulsecheck run: {}/{} passed, all_tests_passed={}",
        report.passed_count(),
        report.test_results.len(),
        report.all_tests_passed
    )];
    if let Some(error) = &report.error {
        lines.push(format!("run error: {error}"));
    }
    for test in &report.test_results {
        if test.result.success {
            lines.push(format!("  [PASS] {}", test.test_name));
            continue;
        }
        lines.push(format!("  [FAIL] {}", test.test_name));
        if let Some(error) = &test.result.error {
            lines.push(format!("         error: {error}"));
        }
        for reason in &test.result.failure_reasons {
            lines.push(format!("         - {reason}"));
        }
    }
    lines.join("\n")
}

/// Short content digest of the input, so trace ids are reproducible.
fn run_id(input: &RunInput) -> String {
    let canonical = serde_json::to_vec(input).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    hex::encode(&digest[..6])
}

/// Drop repeated reasons, keeping each at its first position.
pub fn dedup_first_seen(reasons: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(reasons.len());
    for reason in reasons {
        if !out.contains(&reason) {
            out.push(reason);
        }
    }
    out
}
