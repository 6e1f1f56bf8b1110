//! Run input document.
//!
//! Field names are camelCase; the snake_case names used by older
//! producers are accepted as aliases.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionSpec {
    pub name: String,
    /// Base64-encoded `function main(params) { ... }` source.
    #[serde(alias = "evaluation_function")]
    pub body: String,
    #[serde(default, alias = "continue_on_step_failure")]
    pub continue_on_step_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInput {
    /// Kept raw: its shape is validated when the context is seeded, so a
    /// malformed list aborts the run with a report instead of failing
    /// deserialization.
    #[serde(default = "empty_array", alias = "variables")]
    pub initial_variables: Json,
    #[serde(default, alias = "test_config")]
    pub assertions: Vec<AssertionSpec>,
    #[serde(default, alias = "metrics")]
    pub measurement: Json,
}

fn empty_array() -> Json {
    Json::Array(Vec::new())
}

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to read run input `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid run input: {detail}")]
    Parse { detail: String },
}

impl RunInput {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InputError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| InputError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, InputError> {
        serde_json::from_str(content).map_err(|error| InputError::Parse {
            detail: error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_camel_case_fields() {
        let input = RunInput::from_json_str(
            r#"{
                "initialVariables": [{"name": "a", "value": 1}],
                "assertions": [{"name": "t", "body": "e30=", "continueOnStepFailure": true}],
                "measurement": {"x": 1}
            }"#,
        )
        .expect("valid input");
        assert_eq!(input.initial_variables, json!([{"name": "a", "value": 1}]));
        assert!(input.assertions[0].continue_on_step_failure);
        assert_eq!(input.measurement, json!({"x": 1}));
    }

    #[test]
    fn accepts_snake_case_aliases_and_defaults() {
        let input = RunInput::from_json_str(
            r#"{
                "variables": [],
                "test_config": [
                    {"name": "t", "evaluation_function": "e30=", "continue_on_step_failure": true},
                    {"name": "u", "evaluation_function": "e30="}
                ],
                "metrics": [1]
            }"#,
        )
        .expect("valid input");
        assert_eq!(input.assertions[0].body, "e30=");
        assert!(input.assertions[0].continue_on_step_failure);
        assert!(!input.assertions[1].continue_on_step_failure);
        assert_eq!(input.measurement, json!([1]));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let input = RunInput::from_json_str("{}").expect("empty input");
        assert_eq!(input.initial_variables, json!([]));
        assert!(input.assertions.is_empty());
        assert_eq!(input.measurement, Json::Null);
    }

    #[test]
    fn malformed_variables_survive_deserialization() {
        let input = RunInput::from_json_str(r#"{"variables": {"not": "a list"}}"#).expect("raw");
        assert_eq!(input.initial_variables, json!({"not": "a list"}));
    }

    #[test]
    fn assertion_without_body_is_rejected() {
        let error = RunInput::from_json_str(r#"{"assertions": [{"name": "t"}]}"#).expect_err("no body");
        assert!(error.to_string().contains("body"));
    }
}
