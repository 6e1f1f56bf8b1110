//! Shared variable registry exposed to assertion scripts.
//!
//! One `CapabilityContext` lives for a whole run. It is seeded from the
//! run's initial variables and afterwards changes only through the two
//! host capabilities scripts can call: `pfAddVariable(name, value)` and
//! `pfDeleteVariable(name)`. Mutations persist into later assertions.

use serde_json::{Map, Value as Json};

/// Characters that may not appear in variable names or string values;
/// they would collide with `{{ name }}` template placeholders.
const RESERVED_CHARACTERS: [char; 2] = ['{', '}'];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Initial-variable setup failure. Aborts the run before any assertion.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("No variables found or variables format is incorrect in the response payload.")]
    NotAnArray,
    #[error("Invalid variable format: {entry}")]
    InvalidEntry { entry: String },
    #[error("Duplicate variable name: {name}")]
    DuplicateName { name: String },
}

impl ConfigurationError {
    pub fn code(&self) -> &'static str {
        "PC-CONFIG-0006"
    }
}

/// Capability misuse from inside a script; surfaces as a thrown `Error`.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Name must be a string")]
    NameNotString,
    #[error("Invalid characters: '{{' and '}}' are not allowed in key or value")]
    ReservedCharacter,
    #[error("Variable '{name}' not found")]
    NotFound { name: String },
}

// ---------------------------------------------------------------------------
// CapabilityContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityContext {
    variables: Map<String, Json>,
}

impl CapabilityContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the context from the run input's initial variable list.
    ///
    /// Accepts `{ "name": <string>, "value": <any> }` entries and
    /// single-key objects `{ "<name>": <value> }`. Seeded values are not
    /// subject to the reserved-character check; only script mutations are.
    pub fn from_initial_variables(list: &Json) -> Result<Self, ConfigurationError> {
        let Json::Array(entries) = list else {
            return Err(ConfigurationError::NotAnArray);
        };
        let mut variables = Map::new();
        for entry in entries {
            let (name, value) = parse_entry(entry)?;
            if variables.contains_key(&name) {
                return Err(ConfigurationError::DuplicateName { name });
            }
            variables.insert(name, value);
        }
        Ok(Self { variables })
    }

    pub fn get(&self, name: &str) -> Option<&Json> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn variables(&self) -> &Map<String, Json> {
        &self.variables
    }

    /// Context as a JSON object, in registration order.
    pub fn snapshot(&self) -> Json {
        Json::Object(self.variables.clone())
    }

    /// Upsert `name`. An existing variable keeps its position.
    pub fn add_variable(&mut self, name: &str, value: Json) -> Result<(), CapabilityError> {
        if contains_reserved(name) || value_contains_reserved(&value) {
            return Err(CapabilityError::ReservedCharacter);
        }
        self.variables.insert(name.to_string(), value);
        Ok(())
    }

    pub fn delete_variable(&mut self, name: &str) -> Result<Json, CapabilityError> {
        self.variables
            .shift_remove(name)
            .ok_or_else(|| CapabilityError::NotFound {
                name: name.to_string(),
            })
    }
}

fn parse_entry(entry: &Json) -> Result<(String, Json), ConfigurationError> {
    let invalid = || ConfigurationError::InvalidEntry {
        entry: entry.to_string(),
    };
    let Json::Object(map) = entry else {
        return Err(invalid());
    };
    if map.contains_key("name") && map.contains_key("value") {
        return match map.get("name") {
            Some(Json::String(name)) if !name.is_empty() => Ok((
                name.clone(),
                map.get("value").cloned().unwrap_or(Json::Null),
            )),
            _ => Err(invalid()),
        };
    }
    let mut fields = map.iter();
    match (fields.next(), fields.next()) {
        (Some((name, value)), None) if !name.is_empty() => Ok((name.clone(), value.clone())),
        _ => Err(invalid()),
    }
}

fn contains_reserved(text: &str) -> bool {
    text.contains(RESERVED_CHARACTERS)
}

fn value_contains_reserved(value: &Json) -> bool {
    match value {
        Json::String(text) => contains_reserved(text),
        Json::Array(items) => items.iter().any(value_contains_reserved),
        Json::Object(map) => map
            .iter()
            .any(|(key, inner)| contains_reserved(key) || value_contains_reserved(inner)),
        Json::Null | Json::Bool(_) | Json::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seeds_from_both_entry_shapes_in_order() {
        let context = CapabilityContext::from_initial_variables(&json!([
            {"name": "method", "value": "GET"},
            {"retries": 3},
        ]))
        .expect("valid variables");
        assert_eq!(context.snapshot(), json!({"method": "GET", "retries": 3}));
        let names: Vec<&String> = context.variables().keys().collect();
        assert_eq!(names, ["method", "retries"]);
    }

    #[test]
    fn rejects_non_array_and_malformed_entries() {
        assert_eq!(
            CapabilityContext::from_initial_variables(&json!({"method": "GET"})),
            Err(ConfigurationError::NotAnArray)
        );
        for bad in [json!([42]), json!([{}]), json!([{"a": 1, "b": 2}]), json!([{"name": 7, "value": 1}])] {
            let err = CapabilityContext::from_initial_variables(&bad).expect_err("malformed");
            assert!(matches!(err, ConfigurationError::InvalidEntry { .. }), "{bad}");
            assert_eq!(err.code(), "PC-CONFIG-0006");
        }
    }

    #[test]
    fn invalid_entry_message_carries_the_entry() {
        let err = CapabilityContext::from_initial_variables(&json!([["x"]])).expect_err("array entry");
        assert_eq!(err.to_string(), r#"Invalid variable format: ["x"]"#);
    }

    #[test]
    fn duplicate_names_abort_setup() {
        let err = CapabilityContext::from_initial_variables(&json!([
            {"name": "a", "value": 1},
            {"a": 2},
        ]))
        .expect_err("duplicate");
        assert_eq!(err, ConfigurationError::DuplicateName { name: "a".into() });
    }

    #[test]
    fn add_variable_upserts_in_place() {
        let mut context = CapabilityContext::new();
        context.add_variable("a", json!("1")).expect("add");
        context.add_variable("b", json!("2")).expect("add");
        context.add_variable("a", json!("3")).expect("update");
        assert_eq!(context.snapshot(), json!({"a": "3", "b": "2"}));
    }

    #[test]
    fn reserved_characters_are_rejected_in_names_and_nested_strings() {
        let mut context = CapabilityContext::new();
        assert_eq!(
            context.add_variable("{bad}", json!("x")),
            Err(CapabilityError::ReservedCharacter)
        );
        assert_eq!(
            context.add_variable("ok", json!({"nested": ["fine", "{{ no }}"]})),
            Err(CapabilityError::ReservedCharacter)
        );
        assert_eq!(
            context.add_variable("ok", json!({"{key}": 1})),
            Err(CapabilityError::ReservedCharacter)
        );
        assert!(context.is_empty());
    }

    #[test]
    fn delete_unknown_variable_fails() {
        let mut context = CapabilityContext::new();
        context.add_variable("a", json!(1)).expect("add");
        assert_eq!(context.delete_variable("a"), Ok(json!(1)));
        let err = context.delete_variable("a").expect_err("already gone");
        assert_eq!(err.to_string(), "Variable 'a' not found");
    }
}
