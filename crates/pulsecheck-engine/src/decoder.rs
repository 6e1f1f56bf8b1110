//! Payload decoding: base64 text to the body of the `main` declaration.
//!
//! The decoder is purely textual. It does not check that the text before
//! the first `{` is really `function main(...)`; the instrumentor's parser
//! is the first stage that looks at syntax.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::AssertionError;

/// Body of the decoded `main` function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBody {
    /// Text strictly between the first `{` and the last `}`.
    pub text: String,
    /// Parameter declared in the header, when there is exactly one name.
    pub parameter: Option<String>,
    /// One-based line of the decoded source on which `text` starts.
    pub first_line: u64,
}

impl SourceBody {
    /// Offset added to body-relative lines to report decoded-source lines.
    pub fn line_offset(&self) -> u64 {
        self.first_line.saturating_sub(1)
    }
}

pub fn decode(payload: &str) -> Result<SourceBody, AssertionError> {
    let compact: String = payload
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|error| AssertionError::Decode {
            detail: error.to_string(),
        })?;
    let source = String::from_utf8(bytes).map_err(|error| AssertionError::Decode {
        detail: error.to_string(),
    })?;
    extract_body(&source)
}

/// Base64-encode `source` the way payloads arrive.
pub fn encode_source(source: &str) -> String {
    STANDARD.encode(source.as_bytes())
}

pub fn extract_body(source: &str) -> Result<SourceBody, AssertionError> {
    let open = source.find('{').ok_or_else(|| AssertionError::MalformedBody {
        detail: "no opening `{`".to_string(),
    })?;
    let close = source.rfind('}').ok_or_else(|| AssertionError::MalformedBody {
        detail: "no closing `}`".to_string(),
    })?;
    if close < open {
        return Err(AssertionError::MalformedBody {
            detail: "closing `}` precedes opening `{`".to_string(),
        });
    }
    let header = &source[..open];
    let first_line = 1 + header.matches('\n').count() as u64;
    Ok(SourceBody {
        text: source[open + 1..close].to_string(),
        parameter: header_parameter(header),
        first_line,
    })
}

/// Single identifier between the header's parentheses, if any.
fn header_parameter(header: &str) -> Option<String> {
    let start = header.find('(')?;
    let end = header[start..].find(')')? + start;
    let name = header[start + 1..end].trim();
    let is_identifier = name
        .chars()
        .next()
        .is_some_and(|ch| ch.is_alphabetic() || ch == '_' || ch == '$')
        && name
            .chars()
            .all(|ch| ch.is_alphanumeric() || ch == '_' || ch == '$');
    is_identifier.then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_body_parameter_and_first_line() {
        let source = "// header\nfunction main(input) {\n  return { success: true };\n}\n";
        let body = decode(&encode_source(source)).expect("decodes");
        assert_eq!(body.text, "\n  return { success: true };\n");
        assert_eq!(body.parameter.as_deref(), Some("input"));
        assert_eq!(body.first_line, 2);
        assert_eq!(body.line_offset(), 1);
    }

    #[test]
    fn whitespace_in_payload_is_ignored() {
        let encoded = encode_source("function main(params) { return 1; }");
        let wrapped: String = encoded
            .as_bytes()
            .chunks(8)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join("\n ");
        let body = decode(&wrapped).expect("decodes");
        assert_eq!(body.text, " return 1; ");
    }

    #[test]
    fn body_spans_first_open_to_last_close() {
        let body = extract_body("function main() { if (a) { b(); } }").expect("extracts");
        assert_eq!(body.text, " if (a) { b(); } ");
        assert_eq!(body.parameter, None);
    }

    #[test]
    fn invalid_base64_is_a_decode_error() {
        let error = decode("not base64!").expect_err("invalid");
        assert_eq!(error.code(), "PC-DECODE-0001");
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let error = decode(&STANDARD.encode([0xff, 0xfe, b'{', b'}'])).expect_err("invalid utf-8");
        assert!(matches!(error, AssertionError::Decode { .. }));
    }

    #[test]
    fn missing_or_misordered_braces_are_malformed() {
        for source in ["function main() return 1;", "function main() { return 1;", "} main {"] {
            let error = decode(&encode_source(source)).expect_err(source);
            assert_eq!(error.code(), "PC-BODY-0002", "{source}");
        }
    }
}
