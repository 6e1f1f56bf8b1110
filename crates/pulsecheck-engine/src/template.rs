//! `{{ name }}` placeholder substitution over JSON documents.
//!
//! Used to render request templates against the variables a run leaves
//! behind. Strings get every known placeholder replaced; unknown
//! placeholders are left exactly as written.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value as Json};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(.*?)\s*\}\}").expect("placeholder pattern is valid")
});

/// Render `template` against `variables`.
///
/// Numbers and booleans go through the same substitution on their text
/// form and keep their type only when the result parses back; objects
/// and arrays are rendered member by member, keys untouched.
pub fn render(template: &Json, variables: &Map<String, Json>) -> Json {
    match template {
        Json::Null => Json::Null,
        Json::String(text) => Json::String(render_str(text, variables)),
        Json::Number(number) => {
            let rendered = render_str(&number.to_string(), variables);
            serde_json::from_str::<serde_json::Number>(rendered.trim())
                .map(Json::Number)
                .unwrap_or_else(|_| template.clone())
        }
        Json::Bool(flag) => match render_str(&flag.to_string(), variables).as_str() {
            "true" => Json::Bool(true),
            "false" => Json::Bool(false),
            _ => template.clone(),
        },
        Json::Array(items) => Json::Array(items.iter().map(|item| render(item, variables)).collect()),
        Json::Object(fields) => Json::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), render(value, variables)))
                .collect(),
        ),
    }
}

pub fn render_str(text: &str, variables: &Map<String, Json>) -> String {
    PLACEHOLDER
        .replace_all(text, |captures: &Captures<'_>| {
            let whole = captures.get(0).map_or("", |m| m.as_str());
            let name = captures.get(1).map_or("", |m| m.as_str());
            variables
                .get(name)
                .map_or_else(|| whole.to_string(), substitution_text)
        })
        .into_owned()
}

/// Names referenced by placeholders in `template`, first occurrence first.
pub fn placeholders(template: &Json) -> Vec<String> {
    let mut names = Vec::new();
    collect_placeholders(template, &mut names);
    names
}

fn collect_placeholders(template: &Json, names: &mut Vec<String>) {
    match template {
        Json::String(text) => {
            for captures in PLACEHOLDER.captures_iter(text) {
                if let Some(name) = captures.get(1) {
                    if !names.iter().any(|seen| seen == name.as_str()) {
                        names.push(name.as_str().to_string());
                    }
                }
            }
        }
        Json::Array(items) => items.iter().for_each(|item| collect_placeholders(item, names)),
        Json::Object(fields) => fields
            .values()
            .for_each(|value| collect_placeholders(value, names)),
        Json::Null | Json::Bool(_) | Json::Number(_) => {}
    }
}

/// Strings are inserted raw; everything else as compact JSON.
fn substitution_text(value: &Json) -> String {
    match value {
        Json::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn variables() -> Map<String, Json> {
        match json!({"host": "api.example.com", "token": "abc", "retries": 3, "verbose": true}) {
            Json::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn replaces_known_placeholders_with_flexible_spacing() {
        assert_eq!(
            render_str("https://{{host}}/v1?t={{  token }}", &variables()),
            "https://api.example.com/v1?t=abc"
        );
    }

    #[test]
    fn unknown_placeholders_are_left_intact() {
        assert_eq!(
            render_str("{{ host }} {{ missing }}", &variables()),
            "api.example.com {{ missing }}"
        );
    }

    #[test]
    fn non_string_variables_are_inserted_as_json() {
        assert_eq!(
            render_str("retries={{retries}} verbose={{verbose}}", &variables()),
            "retries=3 verbose=true"
        );
    }

    #[test]
    fn renders_nested_documents_keeping_keys_and_scalars() {
        let template = json!({
            "url": "https://{{host}}",
            "headers": [{"{{token}}": "Bearer {{token}}"}],
            "timeout": 30,
            "follow": false,
            "body": null
        });
        assert_eq!(
            render(&template, &variables()),
            json!({
                "url": "https://api.example.com",
                "headers": [{"{{token}}": "Bearer abc"}],
                "timeout": 30,
                "follow": false,
                "body": null
            })
        );
    }

    #[test]
    fn lists_placeholders_in_first_seen_order() {
        let template = json!({"a": "{{ b }}{{a}}", "c": ["{{b}}", "{{ c }}"]});
        assert_eq!(placeholders(&template), vec!["b", "a", "c"]);
    }
}
