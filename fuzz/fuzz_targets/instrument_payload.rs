#![no_main]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use libfuzzer_sys::fuzz_target;
use pulsecheck_engine::printer::print_program;
use pulsecheck_engine::{CapabilityContext, EngineConfig, decode, execute_payload, instrument};

const MAX_STEPS: u64 = 20_000;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // Raw bytes as a payload exercise the base64 and UTF-8 rejection paths;
    // the encoded form reaches the parser and the interpreter.
    let raw = String::from_utf8_lossy(data);
    let _ = decode(&raw);

    let payload = STANDARD.encode(data);
    let Ok(body) = decode(&payload) else {
        return;
    };
    if let Ok(first) = instrument(&body) {
        let second = instrument(&body).expect("instrumentation is deterministic");
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(print_program(&first.program), print_program(&second.program));
    }

    let config = EngineConfig {
        max_steps: MAX_STEPS,
        ..EngineConfig::default()
    };
    let mut context = CapabilityContext::new();
    let measurement = serde_json::json!([{"status_code": "200", "dnsTime": 1}]);
    let result = execute_payload(&mut context, &measurement, &payload, &config);
    if !result.success {
        assert!(!result.failure_reasons.is_empty());
    }
});
