//! Integration tests for the `test_orchestrator` module: run sequencing,
//! shared variable state, failure aggregation and report shape.

#![forbid(unsafe_code)]

use proptest::prelude::*;
use serde_json::{Value as Json, json};

use pulsecheck_engine::test_orchestrator::dedup_first_seen;
use pulsecheck_engine::{
    AssertionSpec, EngineConfig, RunInput, RunState, TestOrchestrator, encode_source, run_tests,
};

fn assertion(name: &str, source: &str, continue_on_step_failure: bool) -> AssertionSpec {
    AssertionSpec {
        name: name.to_string(),
        body: encode_source(source),
        continue_on_step_failure,
    }
}

fn failing_with(reason: &str) -> String {
    format!("function main() {{ return {{ success: false, failureReasons: ['{reason}'] }}; }}")
}

const PASSING: &str = "function main() { return { success: true }; }";

// ---------------------------------------------------------------------------
// Input document
// ---------------------------------------------------------------------------

#[test]
fn snake_case_input_document_runs_end_to_end() {
    let input = RunInput::from_json_str(&format!(
        r#"{{
            "variables": [{{"name": "baseUrl", "value": "https://example.com"}}],
            "test_config": [
                {{"name": "status", "evaluation_function": "{status}", "continue_on_step_failure": true}},
                {{"name": "dns", "evaluation_function": "{dns}"}}
            ],
            "metrics": [{{"status_code": "200", "dnsTime": 2}}]
        }}"#,
        status = encode_source(
            "function main(params) {\n  const success = params.metrics[0].status_code === '200';\n  return { success };\n}"
        ),
        dns = encode_source(
            "function main(params) {\n  const dnsTime = params.metrics[0].dnsTime;\n  const success = dnsTime < 1;\n  return { success };\n}"
        ),
    ))
    .expect("valid input");

    let report = run_tests(&input, &EngineConfig::default());
    assert!(!report.all_tests_passed);
    assert_eq!(report.test_results.len(), 2);
    assert!(report.test_results[0].result.success);
    assert_eq!(report.accumulated_failure_reasons, vec!["dnsTime < 1 is false"]);
    assert_eq!(
        Json::Object(report.initial_variables.clone()),
        json!({"baseUrl": "https://example.com"})
    );
    assert_eq!(report.initial_variables, report.final_variables);
}

// ---------------------------------------------------------------------------
// Sequencing
// ---------------------------------------------------------------------------

#[test]
fn stop_semantics_follow_the_failing_assertion_flag() {
    let stop = RunInput {
        initial_variables: json!([]),
        assertions: vec![
            assertion("a", &failing_with("a broke"), false),
            assertion("b", PASSING, false),
        ],
        measurement: Json::Null,
    };
    let mut orchestrator = TestOrchestrator::new(EngineConfig::default());
    let report = orchestrator.execute(&stop);
    assert_eq!(orchestrator.state(), RunState::Stopped { index: 0 });
    assert!(orchestrator.state().is_terminal());
    assert_eq!(report.test_results.len(), 1);

    let keep_going = RunInput {
        assertions: vec![
            assertion("a", &failing_with("a broke"), true),
            assertion("b", PASSING, false),
        ],
        ..stop
    };
    let report = orchestrator.execute(&keep_going);
    assert_eq!(orchestrator.state(), RunState::Completed);
    assert_eq!(report.test_results.len(), 2);
    assert!(!report.all_tests_passed);
}

#[test]
fn faulting_assertion_does_not_abort_the_run() {
    let input = RunInput {
        initial_variables: json!([]),
        assertions: vec![
            assertion("throws", "function main() { null.x; }", true),
            assertion("garbage", "not even a function", true),
            assertion("fine", PASSING, false),
        ],
        measurement: json!({}),
    };
    let report = run_tests(&input, &EngineConfig::default());
    assert_eq!(report.error, None);
    assert_eq!(report.test_results.len(), 3);
    assert_eq!(
        report.test_results[0].result.error.as_deref(),
        Some("Cannot read properties of null (reading 'x')")
    );
    assert_eq!(
        report.test_results[1].result.error_code.as_deref(),
        Some("PC-BODY-0002")
    );
    assert!(report.test_results[2].result.success);
    assert_eq!(
        report.accumulated_failure_reasons,
        vec!["Test failed without specific failure reasons"]
    );
}

#[test]
fn variable_mutations_flow_into_later_assertions_and_final_variables() {
    let input = RunInput {
        initial_variables: json!([{"name": "attempt", "value": "1"}]),
        assertions: vec![
            assertion(
                "login",
                "function main() {\n  pfAddVariable('token', 'T-' + attempt);\n  pfDeleteVariable('attempt');\n  return { success: true };\n}",
                false,
            ),
            assertion(
                "use token",
                "function main() {\n  const success = token === 'T-1' && typeof attempt === 'undefined';\n  return { success };\n}",
                false,
            ),
        ],
        measurement: Json::Null,
    };
    let report = run_tests(&input, &EngineConfig::default());
    assert!(report.all_tests_passed, "{report:#?}");
    assert_eq!(Json::Object(report.final_variables), json!({"token": "T-1"}));
    assert_eq!(Json::Object(report.initial_variables), json!({"attempt": "1"}));
}

#[test]
fn rejected_mutation_leaves_context_untouched() {
    let input = RunInput {
        initial_variables: json!([]),
        assertions: vec![assertion(
            "bad name",
            "function main() { pfAddVariable('{{x}}', 'v'); return { success: true }; }",
            true,
        )],
        measurement: Json::Null,
    };
    let report = run_tests(&input, &EngineConfig::default());
    assert!(!report.all_tests_passed);
    assert!(report.final_variables.is_empty());
}

// ---------------------------------------------------------------------------
// Setup failures
// ---------------------------------------------------------------------------

#[test]
fn malformed_variable_lists_abort_with_a_run_error() {
    for (variables, message) in [
        (
            json!({"a": 1}),
            "No variables found or variables format is incorrect in the response payload.",
        ),
        (json!([{"a": 1, "b": 2}]), r#"Invalid variable format: {"a":1,"b":2}"#),
        (json!([{"a": 1}, {"a": 2}]), "Duplicate variable name: a"),
    ] {
        let input = RunInput {
            initial_variables: variables,
            assertions: vec![assertion("never runs", PASSING, false)],
            measurement: Json::Null,
        };
        let report = run_tests(&input, &EngineConfig::default());
        assert_eq!(report.error.as_deref(), Some(message));
        assert!(!report.all_tests_passed);
        assert!(report.test_results.is_empty());
    }
}

// ---------------------------------------------------------------------------
// Report shape
// ---------------------------------------------------------------------------

#[test]
fn report_json_shape_is_stable() {
    let input = RunInput {
        initial_variables: json!([{"k": "v"}]),
        assertions: vec![assertion("only", &failing_with("why"), false)],
        measurement: Json::Null,
    };
    let report = run_tests(&input, &EngineConfig::default());
    let json = serde_json::to_value(&report).expect("serializes");
    let keys: Vec<&str> = json
        .as_object()
        .expect("object")
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(
        keys,
        [
            "initialVariables",
            "testResults",
            "allTestsPassed",
            "accumulatedFailureReasons",
            "error",
            "finalVariables"
        ]
    );
    let result_keys: Vec<&str> = json["testResults"][0]
        .as_object()
        .expect("object")
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(
        result_keys,
        [
            "testName",
            "success",
            "failureReasons",
            "variableStates",
            "conditionTrace",
            "error",
            "stack"
        ]
    );
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    /// Accumulated reasons are exactly the distinct failure reasons in
    /// first-seen order.
    #[test]
    fn accumulated_reasons_are_deduplicated(picks in prop::collection::vec(0usize..4, 1..8)) {
        let pool = ["alpha", "beta", "gamma", "delta"];
        let assertions: Vec<AssertionSpec> = picks
            .iter()
            .enumerate()
            .map(|(index, pick)| assertion(&format!("t{index}"), &failing_with(pool[*pick]), true))
            .collect();
        let input = RunInput { initial_variables: json!([]), assertions, measurement: Json::Null };
        let report = run_tests(&input, &EngineConfig::default());

        let expected = dedup_first_seen(picks.iter().map(|pick| pool[*pick].to_string()).collect());
        prop_assert_eq!(&report.accumulated_failure_reasons, &expected);
        prop_assert_eq!(report.test_results.len(), picks.len());
    }

    #[test]
    fn dedup_preserves_membership(reasons in prop::collection::vec("[a-c]{1,2}", 0..20)) {
        let deduped = dedup_first_seen(reasons.clone());
        for reason in &reasons {
            prop_assert!(deduped.contains(reason));
        }
        let mut sorted = deduped.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(sorted.len(), deduped.len());
    }
}
