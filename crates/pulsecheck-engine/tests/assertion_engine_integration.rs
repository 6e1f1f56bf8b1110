//! Integration tests for the single-assertion pipeline: decoding,
//! instrumentation and sandboxed execution.

#![forbid(unsafe_code)]

use proptest::prelude::*;
use serde_json::{Value as Json, json};

use pulsecheck_engine::sandbox_executor;
use pulsecheck_engine::{
    AssertionResult, CapabilityContext, EngineConfig, decode, encode_source, execute_payload,
    instrument,
};

fn measurement() -> Json {
    json!([{"status_code": "200", "dnsTime": 2, "connectTime": 12.5, "body": "{\"ok\":true}"}])
}

fn evaluate(context: &mut CapabilityContext, source: &str) -> AssertionResult {
    execute_payload(
        context,
        &measurement(),
        &encode_source(source),
        &EngineConfig::default(),
    )
}

const DNS_ASSERTION: &str = "\
function main(params) {
  const metric = params?.metrics?.[0] || {};
  const statusCode = Number(metric.status_code);
  const dnsTime = metric.dnsTime;
  const success = (statusCode === 200) && (dnsTime < 1);
  return { success };
}
";

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[test]
fn dns_threshold_failure_reports_the_failing_term() {
    let mut context = CapabilityContext::new();
    let result = evaluate(&mut context, DNS_ASSERTION);
    assert!(!result.success);
    assert_eq!(result.failure_reasons, vec!["dnsTime < 1 is false"]);
    assert_eq!(result.variable_states["dnsTime"], json!(2));
    assert_eq!(result.variable_states["statusCode"], json!(200));
    assert_eq!(result.error, None);
}

#[test]
fn if_conditions_are_traced_with_decoded_lines() {
    let mut context = CapabilityContext::new();
    let result = evaluate(
        &mut context,
        "// uptime check\n\
         function main(params) {\n\
           const metric = params.metrics[0];\n\
           let success = true;\n\
           if (metric.connectTime > 20) {\n\
             success = false;\n\
           } else if (metric.dnsTime > 1) {\n\
             success = false;\n\
           }\n\
           return { success };\n\
         }",
    );
    assert!(!result.success);
    assert_eq!(
        result.failure_reasons,
        vec![
            "Condition at line 5: \"metric.connectTime > 20\" is false",
            "false is false",
        ]
    );
    let trace: Vec<(&str, u64, Option<bool>)> = result
        .condition_trace
        .iter()
        .map(|record| (record.condition_text.as_str(), record.source_line, record.result))
        .collect();
    assert_eq!(
        trace,
        vec![
            ("true", 4, Some(true)),
            ("metric.connectTime > 20", 5, Some(false)),
            ("metric.dnsTime > 1", 7, Some(true)),
            ("false", 8, Some(false)),
        ]
    );
}

#[test]
fn condition_errors_are_recorded_without_a_result() {
    let mut context = CapabilityContext::new();
    let result = evaluate(
        &mut context,
        "function main() {\n\
           let success = true;\n\
           try {\n\
             if (metrics[3].dnsTime > 1) { success = false; }\n\
           } catch (e) {\n\
             success = false;\n\
           }\n\
           return { success };\n\
         }",
    );
    assert!(!result.success);
    assert_eq!(result.condition_trace.len(), 3);
    assert_eq!(result.condition_trace[1].condition_text, "metrics[3].dnsTime > 1");
    assert_eq!(result.condition_trace[1].result, None);
    assert_eq!(
        result.failure_reasons,
        vec![
            "Error evaluating condition at line 4: \"metrics[3].dnsTime > 1\"",
            "false is false",
        ]
    );
}

#[test]
fn side_effecting_conditions_run_exactly_once() {
    let mut context = CapabilityContext::from_initial_variables(&json!([{"tmp": "x"}])).expect("seed");
    let result = evaluate(
        &mut context,
        "function main() {\n\
           let removed = false;\n\
           if (pfDeleteVariable('tmp') === 'OK') {\n\
             removed = true;\n\
           }\n\
           return { success: removed };\n\
         }",
    );
    assert!(result.success, "{result:?}");
    assert_eq!(result.error, None);
    assert_eq!(result.condition_trace.len(), 1);
    assert_eq!(
        result.condition_trace[0].condition_text,
        "pfDeleteVariable('tmp') === 'OK'"
    );
    assert_eq!(result.condition_trace[0].source_line, 3);
    assert_eq!(result.condition_trace[0].result, Some(true));
    assert_eq!(result.variable_states["removed"], json!(true));
    assert_eq!(context.snapshot(), json!({}));
}

#[test]
fn variable_states_hold_final_values_of_loop_and_nested_bindings() {
    let mut context = CapabilityContext::new();
    let result = evaluate(
        &mut context,
        "function main(params) {\n\
           let last;\n\
           let total = 0;\n\
           params.metrics.forEach(m => last = m.dnsTime);\n\
           for (const metric of params.metrics) { total += metric.dnsTime; }\n\
           for (var i = 0; i < 2; i++) {}\n\
           let code;\n\
           if ((code = params.metrics[0].status_code)) {}\n\
           const registered = pfAddVariable('token', 't') === 'OK';\n\
           return { success: true };\n\
         }",
    );
    assert!(result.success, "{result:?}");
    let states = &result.variable_states;
    assert_eq!(states["last"], json!(2));
    assert_eq!(states["total"], json!(2));
    assert_eq!(states["metric"]["dnsTime"], json!(2));
    assert_eq!(states["i"], json!(2));
    assert_eq!(states["code"], json!("200"));
    assert_eq!(states["registered"], json!(true));
    assert_eq!(states["token"], json!("t"));
    assert!(!states.contains_key("m"));
}

#[test]
fn json_bodies_can_be_inspected() {
    let mut context = CapabilityContext::new();
    let result = evaluate(
        &mut context,
        "function main(params) {\n\
           const metrics = params.metrics;\n\
           const body = JSON.parse(metrics[0].body);\n\
           const success = body.ok === true && typeof metrics[0].connectTime === 'number';\n\
           return { success, details: { checked: Object.keys(body) } };\n\
         }",
    );
    assert!(result.success, "{result:?}");
    assert_eq!(result.variable_states["body"], json!({"ok": true}));
}

#[test]
fn scripts_read_variables_and_this_view_of_the_context() {
    let mut context =
        CapabilityContext::from_initial_variables(&json!([{"threshold": 5}, {"name": "env", "value": "prod"}]))
            .expect("seed");
    let result = evaluate(
        &mut context,
        "function main(params) {\n\
           const limit = this.threshold;\n\
           const success = params.metrics[0].dnsTime < limit && env === 'prod';\n\
           return { success };\n\
         }",
    );
    assert!(result.success, "{result:?}");
}

#[test]
fn registration_and_deletion_mutate_the_shared_context() {
    let mut context = CapabilityContext::from_initial_variables(&json!([{"stale": "x"}])).expect("seed");
    let result = evaluate(
        &mut context,
        "function main() {\n\
           const status = pfAddVariable('sessionId', 'abc-123');\n\
           pfDeleteVariable('stale');\n\
           return { success: status === 'OK' };\n\
         }",
    );
    assert!(result.success, "{result:?}");
    assert_eq!(result.variable_states["sessionId"], json!("abc-123"));
    assert_eq!(context.snapshot(), json!({"sessionId": "abc-123"}));
}

#[test]
fn capability_errors_can_be_caught_by_the_script() {
    let mut context = CapabilityContext::new();
    let result = evaluate(
        &mut context,
        "function main() {\n\
           let message = '';\n\
           try { pfDeleteVariable('ghost'); } catch (e) { message = e.message; }\n\
           return { success: message === \"Variable 'ghost' not found\" };\n\
         }",
    );
    assert!(result.success, "{result:?}");
}

#[test]
fn syntax_errors_point_at_the_decoded_line() {
    let mut context = CapabilityContext::new();
    let result = evaluate(
        &mut context,
        "function main(params) {\n\
           const a = 1;\n\
           const b = ;\n\
           return { success: true };\n\
         }",
    );
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("PC-PARSE-0003"));
    let stack = result.stack.expect("syntax errors carry a location");
    assert!(stack.ends_with("at main (assertion:3)"), "{stack}");
}

#[test]
fn step_budget_turns_hangs_into_failures() {
    let config = EngineConfig {
        max_steps: 5_000,
        ..EngineConfig::default()
    };
    let mut context = CapabilityContext::new();
    let result = execute_payload(
        &mut context,
        &measurement(),
        &encode_source("function main() { let i = 0; for (;;) { i++; } }"),
        &config,
    );
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("PC-RUNTIME-0004"));
    assert!(result.error.unwrap_or_default().contains("step budget"));
}

#[test]
fn prepared_bodies_can_be_rerun() {
    let instrumented = sandbox_executor::prepare(&encode_source(DNS_ASSERTION)).expect("prepares");
    let direct = instrument(&decode(&encode_source(DNS_ASSERTION)).expect("decodes")).expect("instruments");
    assert_eq!(instrumented.fingerprint, direct.fingerprint);

    let mut context = CapabilityContext::new();
    let first = sandbox_executor::run(&mut context, &measurement(), &instrumented);
    let second = sandbox_executor::run(&mut context, &measurement(), &instrumented);
    assert_eq!(first, second);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    /// Same assertion, same untouched context, same result.
    #[test]
    fn evaluation_is_idempotent(dns in 0u32..10, status in prop::sample::select(vec!["200", "404", "500"])) {
        let metrics = json!([{"status_code": status, "dnsTime": dns}]);
        let payload = encode_source(DNS_ASSERTION);
        let mut context = CapabilityContext::new();
        let first = execute_payload(&mut context, &metrics, &payload, &EngineConfig::default());
        let second = execute_payload(&mut context, &metrics, &payload, &EngineConfig::default());
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.success, status == "200" && dns < 1);
    }

    /// Values folded across loop iterations and callbacks are reported at
    /// their final state.
    #[test]
    fn folded_values_are_reported_at_their_final_state(values in prop::collection::vec(0u32..100, 0..6)) {
        let metrics: Vec<Json> = values.iter().map(|value| json!({"v": value})).collect();
        let source = "function main(params) {\n\
           let max = 0;\n\
           for (const m of params.metrics) { if (m.v > max) max = m.v; }\n\
           let count = 0;\n\
           params.metrics.forEach(m => count += 1);\n\
           return { success: true };\n\
         }";
        let mut context = CapabilityContext::new();
        let result = execute_payload(
            &mut context,
            &Json::Array(metrics),
            &encode_source(source),
            &EngineConfig::default(),
        );
        prop_assert!(result.success);
        prop_assert_eq!(&result.variable_states["max"], &json!(values.iter().copied().max().unwrap_or(0)));
        prop_assert_eq!(&result.variable_states["count"], &json!(values.len()));
    }

    /// Arbitrary payload text never escapes the assertion boundary.
    #[test]
    fn arbitrary_payloads_yield_results(source in "\\PC{0,80}") {
        let mut context = CapabilityContext::new();
        let result = execute_payload(
            &mut context,
            &Json::Null,
            &encode_source(&source),
            &EngineConfig { max_steps: 10_000, ..EngineConfig::default() },
        );
        if !result.success {
            prop_assert!(!result.failure_reasons.is_empty());
        }
    }
}
