//! Per-assertion error taxonomy.
//!
//! Every variant is downgraded at the assertion boundary into a failed
//! `AssertionResult`; none of them stops the run.

use crate::parser::ParseError;

pub const DECODE_ERROR_CODE: &str = "PC-DECODE-0001";
pub const MALFORMED_BODY_ERROR_CODE: &str = "PC-BODY-0002";
pub const PARSE_ERROR_CODE: &str = "PC-PARSE-0003";
pub const RUNTIME_FAULT_ERROR_CODE: &str = "PC-RUNTIME-0004";
pub const INVALID_SHAPE_ERROR_CODE: &str = "PC-SHAPE-0005";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AssertionError {
    #[error("failed to decode assertion payload: {detail}")]
    Decode { detail: String },
    #[error("assertion source has no function body: {detail}")]
    MalformedBody { detail: String },
    #[error("SyntaxError: {}", .0.message)]
    Parse(#[from] ParseError),
    #[error("{message}")]
    RuntimeFault {
        message: String,
        stack: Option<String>,
    },
    #[error("Invalid assertion result format")]
    InvalidResultShape,
}

impl AssertionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode { .. } => DECODE_ERROR_CODE,
            Self::MalformedBody { .. } => MALFORMED_BODY_ERROR_CODE,
            Self::Parse(_) => PARSE_ERROR_CODE,
            Self::RuntimeFault { .. } => RUNTIME_FAULT_ERROR_CODE,
            Self::InvalidResultShape => INVALID_SHAPE_ERROR_CODE,
        }
    }

    /// Stack text reported alongside the error message, if any.
    pub fn stack(&self) -> Option<String> {
        match self {
            Self::RuntimeFault { stack, .. } => stack.clone(),
            Self::Parse(error) => Some(match error.line() {
                Some(line) => format!("SyntaxError: {}\n    at main (assertion:{line})", error.message),
                None => format!("SyntaxError: {}", error.message),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SourceSpan;
    use crate::parser::ParseErrorCode;

    #[test]
    fn codes_are_stable() {
        let cases = [
            (
                AssertionError::Decode {
                    detail: "x".into(),
                },
                "PC-DECODE-0001",
            ),
            (
                AssertionError::MalformedBody {
                    detail: "x".into(),
                },
                "PC-BODY-0002",
            ),
            (
                AssertionError::RuntimeFault {
                    message: "boom".into(),
                    stack: None,
                },
                "PC-RUNTIME-0004",
            ),
            (AssertionError::InvalidResultShape, "PC-SHAPE-0005"),
        ];
        for (error, code) in cases {
            assert_eq!(error.code(), code);
        }
    }

    #[test]
    fn parse_errors_render_as_syntax_errors_with_location() {
        let error = AssertionError::from(ParseError::new(
            ParseErrorCode::UnexpectedToken,
            "unexpected `)`",
            "assertion",
            Some(SourceSpan::new(4, 5, 3, 2, 3, 3)),
        ));
        assert_eq!(error.code(), "PC-PARSE-0003");
        assert_eq!(error.to_string(), "SyntaxError: unexpected `)`");
        assert_eq!(
            error.stack().as_deref(),
            Some("SyntaxError: unexpected `)`\n    at main (assertion:3)")
        );
    }

    #[test]
    fn invalid_shape_uses_the_fixed_message() {
        assert_eq!(
            AssertionError::InvalidResultShape.to_string(),
            "Invalid assertion result format"
        );
    }
}
