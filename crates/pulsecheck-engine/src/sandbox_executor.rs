//! Isolated execution of one instrumented assertion.
//!
//! Every path out of [`run`] is an [`AssertionResult`]: thrown values,
//! budget aborts and malformed return values are folded into a failed
//! result here and never reach the orchestrator as errors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::capability_context::CapabilityContext;
use crate::config::EngineConfig;
use crate::decoder;
use crate::error::AssertionError;
use crate::instrumentor::{self, InstrumentedBody};
use crate::interpreter::{Interpreter, Interrupt, ProbeLog, RuntimeAbort};
use crate::value::{ObjectClass, PropertyMap, Value};

pub const NO_SPECIFIC_REASON: &str = "Test failed without specific failure reasons";

/// One evaluated branch condition or `success` sub-expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRecord {
    pub condition_text: String,
    pub source_line: u64,
    /// Absent when evaluating the condition threw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub success: bool,
    pub failure_reasons: Vec<String>,
    pub variable_states: Map<String, Json>,
    pub condition_trace: Vec<ConditionRecord>,
    pub error: Option<String>,
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl AssertionResult {
    /// Failed result for an assertion that never ran, e.g. one whose
    /// payload did not decode or parse.
    pub fn from_error(error: &AssertionError) -> Self {
        Self::failed(error, ProbeLog::default())
    }

    /// Failed result carrying whatever the probes saw before the failure.
    fn failed(error: &AssertionError, probes: ProbeLog) -> Self {
        let failure_reasons = if probes.failure_reasons.is_empty() {
            vec![NO_SPECIFIC_REASON.to_string()]
        } else {
            probes.failure_reasons
        };
        Self {
            success: false,
            failure_reasons,
            variable_states: probes.variable_states,
            condition_trace: probes.condition_trace,
            error: Some(error.to_string()),
            stack: error.stack(),
            error_code: Some(error.code().to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

pub fn run(
    context: &mut CapabilityContext,
    measurement: &Json,
    instrumented: &InstrumentedBody,
) -> AssertionResult {
    run_with_config(context, measurement, instrumented, &EngineConfig::default())
}

pub fn run_with_config(
    context: &mut CapabilityContext,
    measurement: &Json,
    instrumented: &InstrumentedBody,
    config: &EngineConfig,
) -> AssertionResult {
    let mut interpreter = Interpreter::new(context, config.limits(), instrumented.line_offset);

    let metrics = Value::from_json(measurement);
    let mut params = PropertyMap::new();
    params.insert(config.measurement_field.as_str(), metrics.clone());
    let params = Value::object(params);
    interpreter.define_global(&config.measurement_field, metrics);
    interpreter.define_global(&config.parameter_name, params.clone());

    let outcome = interpreter.run_main(
        &instrumented.program,
        instrumented.parameter.as_deref(),
        params,
    );
    let steps = interpreter.steps();
    let probes = interpreter.into_probes();
    tracing::debug!(
        steps,
        fingerprint = %instrumented.fingerprint,
        conditions = probes.condition_trace.len(),
        "assertion body finished"
    );

    match outcome {
        Ok(value) => match value.try_to_json() {
            Ok(json) => normalize(json, probes),
            Err(cycle) => AssertionResult::failed(
                &AssertionError::RuntimeFault {
                    message: cycle.to_string(),
                    stack: None,
                },
                probes,
            ),
        },
        Err(Interrupt::Throw(thrown)) => AssertionResult::failed(&thrown_fault(&thrown), probes),
        Err(Interrupt::Abort(abort)) => AssertionResult::failed(&abort_fault(abort), probes),
        Err(Interrupt::ShortCircuit) => normalize(None, probes),
    }
}

/// Decode, instrument and run one encoded assertion.
pub fn execute_payload(
    context: &mut CapabilityContext,
    measurement: &Json,
    payload: &str,
    config: &EngineConfig,
) -> AssertionResult {
    let instrumented = match prepare(payload) {
        Ok(instrumented) => instrumented,
        Err(error) => return AssertionResult::from_error(&error),
    };
    run_with_config(context, measurement, &instrumented, config)
}

pub fn prepare(payload: &str) -> Result<InstrumentedBody, AssertionError> {
    let body = decoder::decode(payload)?;
    Ok(instrumentor::instrument(&body)?)
}

fn thrown_fault(thrown: &Value) -> AssertionError {
    if let Value::Object(object) = thrown {
        let object = object.borrow();
        if let Some(message) = object.properties.get("message") {
            let stack = if object.class == ObjectClass::Error {
                object.properties.get("stack").map(Value::to_js_string)
            } else {
                None
            };
            return AssertionError::RuntimeFault {
                message: message.to_js_string(),
                stack,
            };
        }
    }
    AssertionError::RuntimeFault {
        message: thrown.to_js_string(),
        stack: None,
    }
}

fn abort_fault(abort: RuntimeAbort) -> AssertionError {
    AssertionError::RuntimeFault {
        message: abort.reason.message(),
        stack: Some(abort.stack),
    }
}

// ---------------------------------------------------------------------------
// Result normalization
// ---------------------------------------------------------------------------

fn normalize(returned: Option<Json>, probes: ProbeLog) -> AssertionResult {
    let Some(Json::Object(payload)) = returned else {
        return AssertionResult::failed(&AssertionError::InvalidResultShape, probes);
    };
    let Some(Json::Bool(success)) = payload.get("success") else {
        return AssertionResult::failed(&AssertionError::InvalidResultShape, probes);
    };
    let success = *success;

    let declared = declared_reasons(&payload);
    let failure_reasons = if success {
        declared.unwrap_or_default()
    } else if let Some(reasons) = declared.filter(|reasons| !reasons.is_empty()) {
        reasons
    } else if !probes.failure_reasons.is_empty() {
        probes.failure_reasons
    } else {
        vec![NO_SPECIFIC_REASON.to_string()]
    };

    let variable_states = match payload.get("variableStates") {
        Some(Json::Object(states)) => states.clone(),
        _ => probes.variable_states,
    };

    AssertionResult {
        success,
        failure_reasons,
        variable_states,
        condition_trace: probes.condition_trace,
        error: None,
        stack: None,
        error_code: None,
    }
}

/// Reasons the script reported itself, at the top level or under
/// `details`. The top-level list wins when non-empty.
fn declared_reasons(payload: &Map<String, Json>) -> Option<Vec<String>> {
    let top = payload.get("failureReasons").and_then(string_list);
    let nested = payload
        .get("details")
        .and_then(|details| details.get("failureReasons"))
        .and_then(string_list);
    match (top, nested) {
        (Some(top), _) if !top.is_empty() => Some(top),
        (_, Some(nested)) if !nested.is_empty() => Some(nested),
        (top, nested) => top.or(nested),
    }
}

fn string_list(value: &Json) -> Option<Vec<String>> {
    let Json::Array(items) = value else {
        return None;
    };
    Some(
        items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::encode_source;
    use crate::interpreter::DEFAULT_MAX_CALL_DEPTH;
    use serde_json::json;

    fn measurement() -> Json {
        json!([{"status_code": "200", "dnsTime": 2}])
    }

    fn execute(source: &str) -> AssertionResult {
        let mut context = CapabilityContext::new();
        execute_in(&mut context, source)
    }

    fn execute_in(context: &mut CapabilityContext, source: &str) -> AssertionResult {
        execute_payload(
            context,
            &measurement(),
            &encode_source(source),
            &EngineConfig::default(),
        )
    }

    #[test]
    fn failing_success_term_becomes_the_reason() {
        let result = execute(
            "function main(params) {\n\
             const metric = params.metrics[0];\n\
             const statusCode = Number(metric.status_code);\n\
             const dnsTime = metric.dnsTime;\n\
             const success = (statusCode === 200) && (dnsTime < 1);\n\
             return { success };\n\
             }",
        );
        assert!(!result.success);
        assert_eq!(result.failure_reasons, vec!["dnsTime < 1 is false"]);
        assert_eq!(
            Json::Object(result.variable_states.clone()),
            json!({
                "metric": {"status_code": "200", "dnsTime": 2},
                "statusCode": 200,
                "dnsTime": 2,
                "success": false
            })
        );
        assert_eq!(
            result.condition_trace,
            vec![
                ConditionRecord {
                    condition_text: "statusCode === 200".into(),
                    source_line: 5,
                    result: Some(true),
                },
                ConditionRecord {
                    condition_text: "dnsTime < 1".into(),
                    source_line: 5,
                    result: Some(false),
                },
            ]
        );
        assert_eq!(result.error, None);
        assert_eq!(result.error_code, None);
    }

    #[test]
    fn script_reasons_win_over_probe_reasons() {
        let result = execute(
            "function main(params) {\n\
             const success = metrics.length > 5;\n\
             return { success, failureReasons: ['custom'] };\n\
             }",
        );
        assert_eq!(result.failure_reasons, vec!["custom"]);

        let nested = execute(
            "function main() {\n\
             return { success: false, details: { failureReasons: ['nested', 7] } };\n\
             }",
        );
        assert_eq!(nested.failure_reasons, vec!["nested"]);
    }

    #[test]
    fn false_without_any_reason_gets_the_placeholder() {
        let result = execute("function main() { return { success: false }; }");
        assert_eq!(result.failure_reasons, vec![NO_SPECIFIC_REASON]);
    }

    #[test]
    fn passing_result_keeps_the_reasons_it_returned() {
        let clean = execute("function main() { return { success: true }; }");
        assert!(clean.failure_reasons.is_empty());

        let result = execute(
            "function main() {\n\
             if (metrics.length > 3) { }\n\
             return { success: true };\n\
             }",
        );
        assert!(result.success);
        assert_eq!(
            result.failure_reasons,
            vec!["Condition at line 2: \"metrics.length > 3\" is false"]
        );
        assert_eq!(result.condition_trace.len(), 1);
        assert_eq!(result.condition_trace[0].result, Some(false));

        let bare = execute("function main() { const r = { success: true }; return r; }");
        assert!(bare.failure_reasons.is_empty());
    }

    #[test]
    fn returned_variable_states_override_the_trace() {
        let result = execute(
            "function main() {\n\
             let seen = 1;\n\
             return { success: true, variableStates: { custom: true } };\n\
             }",
        );
        assert_eq!(Json::Object(result.variable_states), json!({"custom": true}));
    }

    #[test]
    fn invalid_shapes_fail_with_a_fixed_message() {
        for source in [
            "function main() { return 42; }",
            "function main() { return { success: 'yes' }; }",
            "function main() { return [true]; }",
            "function main() { }",
        ] {
            let result = execute(source);
            assert!(!result.success, "{source}");
            assert_eq!(result.error.as_deref(), Some("Invalid assertion result format"));
            assert_eq!(result.error_code.as_deref(), Some("PC-SHAPE-0005"));
            assert_eq!(result.stack, None);
        }
    }

    #[test]
    fn thrown_errors_are_caught_with_stack_and_partial_trace() {
        let result = execute(
            "function main(params) {\n\
             const before = 'set';\n\
             if (metrics[0].dnsTime > 1) {\n\
             throw new Error('too slow');\n\
             }\n\
             return { success: true };\n\
             }",
        );
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("too slow"));
        assert_eq!(
            result.stack.as_deref(),
            Some("Error: too slow\n    at main (assertion:4)")
        );
        assert_eq!(Json::Object(result.variable_states), json!({"before": "set"}));
        assert_eq!(result.failure_reasons, vec![NO_SPECIFIC_REASON]);
        assert_eq!(result.error_code.as_deref(), Some("PC-RUNTIME-0004"));
    }

    #[test]
    fn thrown_primitives_report_their_string_form() {
        let result = execute("function main() { throw 'plain'; }");
        assert_eq!(result.error.as_deref(), Some("plain"));
        assert_eq!(result.stack, None);
    }

    #[test]
    fn failed_conditions_survive_a_later_fault() {
        let result = execute(
            "function main() {\n\
             if (metrics.length === 0) { }\n\
             return missing.value;\n\
             }",
        );
        assert_eq!(
            result.failure_reasons,
            vec!["Condition at line 2: \"metrics.length === 0\" is false"]
        );
        assert_eq!(result.error.as_deref(), Some("missing is not defined"));
    }

    #[test]
    fn uncaught_capability_errors_stay_local() {
        let mut context = CapabilityContext::new();
        let result = execute_in(
            &mut context,
            "function main() {\n\
             pfAddVariable('bad', '{{oops}}');\n\
             return { success: true };\n\
             }",
        );
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(context.is_empty());
    }

    #[test]
    fn runaway_loops_hit_the_step_budget() {
        let config = EngineConfig {
            max_steps: 10_000,
            ..EngineConfig::default()
        };
        let mut context = CapabilityContext::new();
        let result = execute_payload(
            &mut context,
            &measurement(),
            &encode_source("function main() { while (true) {} }"),
            &config,
        );
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Assertion exceeded the step budget of 10000 steps")
        );
    }

    #[test]
    fn unbounded_recursion_hits_the_call_depth_limit() {
        let result = execute("function main() { function f() { return f(); } return f(); }");
        assert_eq!(result.error.as_deref(), Some("Maximum call stack size exceeded"));
        let stack = result.stack.unwrap_or_default();
        assert!(stack.matches("at f").count() >= DEFAULT_MAX_CALL_DEPTH - 1);
    }

    #[test]
    fn decode_and_parse_failures_become_failed_results() {
        let mut context = CapabilityContext::new();
        let decode = execute_payload(&mut context, &json!(null), "%%%", &EngineConfig::default());
        assert_eq!(decode.error_code.as_deref(), Some("PC-DECODE-0001"));
        assert_eq!(decode.failure_reasons, vec![NO_SPECIFIC_REASON]);

        let parse = execute("function main() {\n\n  let = ;\n}");
        assert_eq!(parse.error_code.as_deref(), Some("PC-PARSE-0003"));
        assert!(parse.error.unwrap_or_default().starts_with("SyntaxError: "));
    }

    #[test]
    fn custom_parameter_and_measurement_names_are_bound() {
        let config = EngineConfig {
            parameter_name: "input".into(),
            measurement_field: "samples".into(),
            ..EngineConfig::default()
        };
        let mut context = CapabilityContext::new();
        let result = execute_payload(
            &mut context,
            &json!([1, 2, 3]),
            &encode_source(
                "function main(args) {\n\
                 return { success: args.samples.length === 3 && input.samples === samples };\n\
                 }",
            ),
            &config,
        );
        assert!(result.success, "{result:?}");
    }

    #[test]
    fn serialized_result_uses_camel_case_and_null_errors() {
        let result = execute("function main() { return { success: true }; }");
        assert_eq!(
            serde_json::to_value(&result).expect("serializes"),
            json!({
                "success": true,
                "failureReasons": [],
                "variableStates": {},
                "conditionTrace": [],
                "error": null,
                "stack": null
            })
        );
    }
}
