//! Tokenizer for assertion script source.
//!
//! Keywords are emitted as identifiers; the parser decides by position.
//! Template literals are lexed eagerly: each `${...}` hole becomes its own
//! token vector, which the parser hands to a nested parser.

use crate::ast::SourceSpan;
use crate::parser::{ParseError, ParseErrorCode, ParseResult};

/// Punctuators ordered longest first so the scanner can take the first hit.
const PUNCTUATORS: [&str; 54] = [
    ">>>=", "===", "!==", "**=", "<<=", ">>=", ">>>", "...", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "<<", ">>", "**", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-",
    "*", "/", "%", "&", "|", "^", "!", "~", "?",
];

/// Single-character punctuators not covered by the table above.
const TAIL_PUNCTUATORS: [&str; 3] = [":", "=", "."];

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Number(f64),
    String(String),
    Template(TemplateToken),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateToken {
    /// Cooked text chunks; always one more than `expressions`.
    pub quasis: Vec<String>,
    /// Token streams of each `${...}` hole, each terminated by `Eof`.
    pub expressions: Vec<Vec<Token>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: SourceSpan,
    /// A line terminator appeared between the previous token and this one.
    pub newline_before: bool,
}

impl Token {
    pub fn is_punct(&self, punct: &str) -> bool {
        matches!(self.kind, TokenKind::Punct(p) if p == punct)
    }

    pub fn is_identifier(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Identifier(id) if id == name)
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Identifier(name) => format!("`{name}`"),
            TokenKind::Number(value) => format!("number `{value}`"),
            TokenKind::String(_) => "string literal".to_string(),
            TokenKind::Template(_) => "template literal".to_string(),
            TokenKind::Punct(p) => format!("`{p}`"),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

/// Tokenize `source`, appending a trailing `Eof` token.
pub fn tokenize(source: &str, label: &str) -> ParseResult<Vec<Token>> {
    let mut lexer = Lexer::new(source, label);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    tokens.push(lexer.eof_token());
    Ok(tokens)
}

struct Lexer<'a> {
    source: &'a str,
    label: &'a str,
    pos: usize,
    line: u64,
    column: u64,
    saw_newline: bool,
}

#[derive(Clone, Copy)]
struct Mark {
    offset: usize,
    line: u64,
    column: u64,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str, label: &'a str) -> Self {
        Self {
            source,
            label,
            pos: 0,
            line: 1,
            column: 1,
            saw_newline: false,
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_at(&self, skip: usize) -> Option<char> {
        self.source[self.pos..].chars().nth(skip)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn mark(&self) -> Mark {
        Mark {
            offset: self.pos,
            line: self.line,
            column: self.column,
        }
    }

    fn span_from(&self, start: Mark) -> SourceSpan {
        SourceSpan::new(
            start.offset as u64,
            self.pos as u64,
            start.line,
            start.column,
            self.line,
            self.column,
        )
    }

    fn error(&self, code: ParseErrorCode, message: impl Into<String>, start: Mark) -> ParseError {
        ParseError::new(code, message, self.label, Some(self.span_from(start)))
    }

    fn eof_token(&self) -> Token {
        let here = self.mark();
        Token {
            kind: TokenKind::Eof,
            span: self.span_from(here),
            newline_before: self.saw_newline,
        }
    }

    fn skip_trivia(&mut self) -> ParseResult<()> {
        loop {
            match self.peek() {
                Some('\n') | Some('\u{2028}') | Some('\u{2029}') => {
                    self.saw_newline = true;
                    self.bump();
                }
                Some(ch) if ch.is_whitespace() || ch == '\u{feff}' => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(ch) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let start = self.mark();
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some('\n') => self.saw_newline = true,
                            Some(_) => {}
                            None => {
                                return Err(self.error(
                                    ParseErrorCode::UnexpectedEnd,
                                    "unterminated block comment",
                                    start,
                                ));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> ParseResult<Option<Token>> {
        self.skip_trivia()?;
        let newline_before = std::mem::take(&mut self.saw_newline);
        let start = self.mark();
        let Some(ch) = self.peek() else {
            self.saw_newline = newline_before;
            return Ok(None);
        };

        let kind = if is_identifier_start(ch) {
            TokenKind::Identifier(self.lex_identifier())
        } else if ch.is_ascii_digit()
            || (ch == '.' && self.peek_at(1).is_some_and(|next| next.is_ascii_digit()))
        {
            TokenKind::Number(self.lex_number(start)?)
        } else if ch == '"' || ch == '\'' {
            TokenKind::String(self.lex_string(ch, start)?)
        } else if ch == '`' {
            TokenKind::Template(self.lex_template(start)?)
        } else {
            TokenKind::Punct(self.lex_punct(start)?)
        };

        Ok(Some(Token {
            kind,
            span: self.span_from(start),
            newline_before,
        }))
    }

    fn lex_identifier(&mut self) -> String {
        let begin = self.pos;
        while let Some(ch) = self.peek() {
            if !is_identifier_part(ch) {
                break;
            }
            self.bump();
        }
        self.source[begin..self.pos].to_string()
    }

    fn lex_number(&mut self, start: Mark) -> ParseResult<f64> {
        let radix = match (self.peek(), self.peek_at(1)) {
            (Some('0'), Some('x' | 'X')) => Some(16),
            (Some('0'), Some('o' | 'O')) => Some(8),
            (Some('0'), Some('b' | 'B')) => Some(2),
            _ => None,
        };

        let value = if let Some(radix) = radix {
            self.bump();
            self.bump();
            let mut value = 0f64;
            let mut digits = 0usize;
            while let Some(ch) = self.peek() {
                if ch == '_' {
                    self.bump();
                    continue;
                }
                let Some(digit) = ch.to_digit(radix) else {
                    break;
                };
                value = value * f64::from(radix) + f64::from(digit);
                digits += 1;
                self.bump();
            }
            if digits == 0 {
                return Err(self.error(
                    ParseErrorCode::InvalidToken,
                    "numeric literal is missing digits",
                    start,
                ));
            }
            value
        } else {
            let mut text = String::new();
            self.take_digits(&mut text);
            if self.peek() == Some('.') {
                text.push('.');
                self.bump();
                self.take_digits(&mut text);
            }
            if matches!(self.peek(), Some('e' | 'E')) {
                text.push('e');
                self.bump();
                if let Some(sign @ ('+' | '-')) = self.peek() {
                    text.push(sign);
                    self.bump();
                }
                if !self.take_digits(&mut text) {
                    return Err(self.error(
                        ParseErrorCode::InvalidToken,
                        "exponent is missing digits",
                        start,
                    ));
                }
            }
            text.parse::<f64>().map_err(|_| {
                self.error(
                    ParseErrorCode::InvalidToken,
                    format!("invalid numeric literal `{text}`"),
                    start,
                )
            })?
        };

        if self.peek() == Some('n') {
            return Err(self.error(
                ParseErrorCode::UnsupportedSyntax,
                "BigInt literals are not supported",
                start,
            ));
        }
        if self.peek().is_some_and(is_identifier_start) {
            return Err(self.error(
                ParseErrorCode::InvalidToken,
                "identifier starts immediately after numeric literal",
                start,
            ));
        }
        Ok(value)
    }

    fn take_digits(&mut self, text: &mut String) -> bool {
        let mut any = false;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
                any = true;
            } else if ch != '_' {
                break;
            }
            self.bump();
        }
        any
    }

    fn lex_string(&mut self, quote: char, start: Mark) -> ParseResult<String> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                Some(ch) if ch == quote => return Ok(value),
                Some('\\') => self.lex_escape(&mut value, start)?,
                Some('\n') | None => {
                    return Err(self.error(
                        ParseErrorCode::InvalidToken,
                        "unterminated string literal",
                        start,
                    ));
                }
                Some(ch) => value.push(ch),
            }
        }
    }

    fn lex_escape(&mut self, out: &mut String, start: Mark) -> ParseResult<()> {
        let Some(ch) = self.bump() else {
            return Err(self.error(
                ParseErrorCode::UnexpectedEnd,
                "unterminated escape sequence",
                start,
            ));
        };
        match ch {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' if !self.peek().is_some_and(|next| next.is_ascii_digit()) => out.push('\0'),
            '\n' => {}
            'x' => {
                let code = self.lex_hex_digits(2, start)?;
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            'u' => {
                let code = if self.peek() == Some('{') {
                    self.bump();
                    let mut code = 0u32;
                    loop {
                        match self.bump() {
                            Some('}') => break,
                            Some(digit) if digit.is_ascii_hexdigit() => {
                                code = code
                                    .saturating_mul(16)
                                    .saturating_add(digit.to_digit(16).unwrap_or(0));
                            }
                            _ => {
                                return Err(self.error(
                                    ParseErrorCode::InvalidToken,
                                    "malformed unicode escape",
                                    start,
                                ));
                            }
                        }
                    }
                    code
                } else {
                    self.lex_hex_digits(4, start)?
                };
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            other => out.push(other),
        }
        Ok(())
    }

    fn lex_hex_digits(&mut self, count: usize, start: Mark) -> ParseResult<u32> {
        let mut code = 0u32;
        for _ in 0..count {
            match self.bump().and_then(|digit| digit.to_digit(16)) {
                Some(digit) => code = code * 16 + digit,
                None => {
                    return Err(self.error(
                        ParseErrorCode::InvalidToken,
                        "malformed hexadecimal escape",
                        start,
                    ));
                }
            }
        }
        Ok(code)
    }

    fn lex_template(&mut self, start: Mark) -> ParseResult<TemplateToken> {
        self.bump();
        let mut quasis = Vec::new();
        let mut expressions = Vec::new();
        let mut current = String::new();
        loop {
            match self.bump() {
                Some('`') => {
                    quasis.push(current);
                    return Ok(TemplateToken {
                        quasis,
                        expressions,
                    });
                }
                Some('\\') => self.lex_escape(&mut current, start)?,
                Some('$') if self.peek() == Some('{') => {
                    self.bump();
                    quasis.push(std::mem::take(&mut current));
                    expressions.push(self.lex_template_hole(start)?);
                }
                Some(ch) => current.push(ch),
                None => {
                    return Err(self.error(
                        ParseErrorCode::UnexpectedEnd,
                        "unterminated template literal",
                        start,
                    ));
                }
            }
        }
    }

    fn lex_template_hole(&mut self, start: Mark) -> ParseResult<Vec<Token>> {
        let mut depth = 0usize;
        let mut tokens = Vec::new();
        loop {
            let Some(token) = self.next_token()? else {
                return Err(self.error(
                    ParseErrorCode::UnexpectedEnd,
                    "unterminated template expression",
                    start,
                ));
            };
            if token.is_punct("{") {
                depth += 1;
            } else if token.is_punct("}") {
                if depth == 0 {
                    tokens.push(Token {
                        kind: TokenKind::Eof,
                        span: token.span,
                        newline_before: false,
                    });
                    return Ok(tokens);
                }
                depth -= 1;
            }
            tokens.push(token);
        }
    }

    fn lex_punct(&mut self, start: Mark) -> ParseResult<&'static str> {
        let rest = &self.source[self.pos..];
        let found = PUNCTUATORS
            .iter()
            .chain(TAIL_PUNCTUATORS.iter())
            .copied()
            .find(|punct| rest.starts_with(punct))
            // `a?.5:b` is a conditional, not an optional chain.
            .filter(|punct| {
                *punct != "?."
                    || !rest[2..]
                        .chars()
                        .next()
                        .is_some_and(|next| next.is_ascii_digit())
            })
            .or_else(|| rest.starts_with('?').then_some("?"));
        match found {
            Some(punct) => {
                for _ in 0..punct.len() {
                    self.bump();
                }
                Ok(punct)
            }
            None => {
                let ch = self.peek().unwrap_or(' ');
                self.bump();
                Err(self.error(
                    ParseErrorCode::InvalidToken,
                    format!("unexpected character `{ch}`"),
                    start,
                ))
            }
        }
    }
}

fn is_identifier_start(ch: char) -> bool {
    ch == '_' || ch == '$' || ch.is_alphabetic()
}

fn is_identifier_part(ch: char) -> bool {
    ch == '_' || ch == '$' || ch.is_alphanumeric() || ch == '\u{200c}' || ch == '\u{200d}'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source, "<test>")
            .expect("tokenize")
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn punctuators_prefer_longest_match() {
        assert_eq!(
            kinds("a === b >>>= c ?? d"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Punct("==="),
                TokenKind::Identifier("b".into()),
                TokenKind::Punct(">>>="),
                TokenKind::Identifier("c".into()),
                TokenKind::Punct("??"),
                TokenKind::Identifier("d".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn optional_chain_is_not_taken_before_a_digit() {
        assert_eq!(
            kinds("a?.5:b"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Punct("?"),
                TokenKind::Number(0.5),
                TokenKind::Punct(":"),
                TokenKind::Identifier("b".into()),
                TokenKind::Eof,
            ]
        );
        assert_eq!(kinds("a?.b")[1], TokenKind::Punct("?."));
    }

    #[test]
    fn numeric_forms_are_decoded() {
        assert_eq!(kinds("0x1F")[0], TokenKind::Number(31.0));
        assert_eq!(kinds("0b101")[0], TokenKind::Number(5.0));
        assert_eq!(kinds("1_000")[0], TokenKind::Number(1000.0));
        assert_eq!(kinds("2.5e3")[0], TokenKind::Number(2500.0));
        assert_eq!(kinds(".25")[0], TokenKind::Number(0.25));
    }

    #[test]
    fn string_escapes_are_cooked() {
        assert_eq!(
            kinds(r#""a\n\x41B\u{43}""#)[0],
            TokenKind::String("a\nABC".into())
        );
    }

    #[test]
    fn newline_flag_tracks_line_terminators_and_comments() {
        let tokens = tokenize("a /* x\n */ b\nc // tail", "<test>").expect("tokenize");
        assert!(!tokens[0].newline_before);
        assert!(tokens[1].newline_before);
        assert!(tokens[2].newline_before);
        assert_eq!(tokens[2].span.start_line, 3);
    }

    #[test]
    fn template_holes_are_tokenized_separately() {
        let tokens = tokenize("`x=${ {a:1}.a } y`", "<test>").expect("tokenize");
        let TokenKind::Template(template) = &tokens[0].kind else {
            panic!("expected template token");
        };
        assert_eq!(template.quasis, vec!["x=".to_string(), " y".to_string()]);
        assert_eq!(template.expressions.len(), 1);
        assert!(matches!(
            template.expressions[0].last().map(|t| &t.kind),
            Some(TokenKind::Eof)
        ));
    }

    #[test]
    fn unterminated_string_is_rejected() {
        let err = tokenize("'open", "<test>").expect_err("must fail");
        assert_eq!(err.code, ParseErrorCode::InvalidToken);
    }

    #[test]
    fn stray_character_is_rejected() {
        let err = tokenize("a # b", "<test>").expect_err("must fail");
        assert_eq!(err.code, ParseErrorCode::InvalidToken);
    }
}
