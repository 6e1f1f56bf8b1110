//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! yields the stock engine. Unknown keys are rejected so a typo in a
//! config file does not silently fall back to a default.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::interpreter::{DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STEPS, ExecutionLimits};

pub const DEFAULT_PARAMETER_NAME: &str = "params";
pub const DEFAULT_MEASUREMENT_FIELD: &str = "metrics";
pub const DEFAULT_TRACE_ID_PREFIX: &str = "pulsecheck";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Global through which the script sees `{ <measurement_field> }`.
    pub parameter_name: String,
    /// Name of the measurement both as a global and inside the parameter.
    pub measurement_field: String,
    pub max_steps: u64,
    pub max_call_depth: usize,
    pub trace_id_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parameter_name: DEFAULT_PARAMETER_NAME.to_string(),
            measurement_field: DEFAULT_MEASUREMENT_FIELD.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            trace_id_prefix: DEFAULT_TRACE_ID_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config JSON: {detail}")]
    Parse { detail: String },
    #[error("invalid config value for `{field}`: {detail}")]
    InvalidValue { field: &'static str, detail: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "PC-CONFIG-IO-0007",
            Self::Parse { .. } => "PC-CONFIG-PARSE-0008",
            Self::InvalidValue { .. } => "PC-CONFIG-VALUE-0009",
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content).map_err(|error| ConfigError::Parse {
            detail: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, name) in [
            ("parameter_name", &self.parameter_name),
            ("measurement_field", &self.measurement_field),
        ] {
            if !is_identifier(name) {
                return Err(ConfigError::InvalidValue {
                    field,
                    detail: format!("`{name}` is not an identifier"),
                });
            }
        }
        if self.max_steps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_steps",
                detail: "must be positive".to_string(),
            });
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_call_depth",
                detail: "must be positive".to_string(),
            });
        }
        if self.trace_id_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "trace_id_prefix",
                detail: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_steps: self.max_steps,
            max_call_depth: self.max_call_depth,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|ch| ch.is_alphabetic() || ch == '_' || ch == '$')
        && chars.all(|ch| ch.is_alphanumeric() || ch == '_' || ch == '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = EngineConfig::from_json_str("{}").expect("defaults");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.limits(), ExecutionLimits::default());
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let config = EngineConfig::from_json_str(r#"{"max_steps": 500, "trace_id_prefix": "ci"}"#)
            .expect("valid");
        assert_eq!(config.max_steps, 500);
        assert_eq!(config.trace_id_prefix, "ci");
        assert_eq!(config.parameter_name, "params");
        assert_eq!(config.limits().max_call_depth, DEFAULT_MAX_CALL_DEPTH);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = EngineConfig::from_json_str(r#"{"max_step": 5}"#).expect_err("typo");
        assert_eq!(error.code(), "PC-CONFIG-PARSE-0008");
        assert!(error.to_string().contains("max_step"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (content, field) in [
            (r#"{"max_steps": 0}"#, "max_steps"),
            (r#"{"max_call_depth": 0}"#, "max_call_depth"),
            (r#"{"parameter_name": "not valid"}"#, "parameter_name"),
            (r#"{"measurement_field": ""}"#, "measurement_field"),
            (r#"{"trace_id_prefix": " "}"#, "trace_id_prefix"),
        ] {
            match EngineConfig::from_json_str(content) {
                Err(ConfigError::InvalidValue { field: got, .. }) => assert_eq!(got, field),
                other => panic!("{content}: expected invalid value, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let error = EngineConfig::from_file("/nonexistent/pulsecheck.json").expect_err("missing");
        assert_eq!(error.code(), "PC-CONFIG-IO-0007");
    }
}
