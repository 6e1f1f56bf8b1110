//! Deterministic recursive-descent parser for assertion script bodies.
//!
//! Consumes the token stream from `lexer.rs` and emits the syntax tree in
//! `crate::ast`. The `FunctionBody` goal accepts top-level `return`, which
//! is how decoded `main` bodies are parsed without re-wrapping them.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::ast::{
    Argument, ArrayElement, AssignmentOperator, BinaryOperator, CatchClause, DeclarationKind,
    Expression, ExpressionKind, ForEachKind, ForEachTarget, ForInit, FunctionBody, FunctionDef,
    LogicalOperator, MemberProperty, ObjectMember, ObjectPatternProperty, Pattern, Program,
    PropertyKey, ReturnStatement, SourceSpan, Statement, StatementKind, SwitchCase, UnaryOperator,
    UpdateOperator, VariableDeclaration, VariableDeclarator,
};
use crate::lexer::{Token, TokenKind, tokenize};

pub type ParseResult<T> = Result<T, ParseError>;

/// Statement/expression nesting beyond this depth is rejected.
pub const MAX_NESTING_DEPTH: usize = 96;

const RESERVED_WORDS: [&str; 36] = [
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do",
    "else", "export", "extends", "finally", "for", "function", "if", "import", "in", "instanceof",
    "new", "return", "super", "switch", "this", "throw", "try", "typeof", "var", "void", "while",
    "with", "yield", "null", "true", "false",
];

/// Stable parse error codes for deterministic diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseErrorCode {
    EmptySource,
    InvalidToken,
    UnexpectedToken,
    UnexpectedEnd,
    InvalidAssignmentTarget,
    UnsupportedSyntax,
    NestingTooDeep,
}

/// Deterministic parse error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub code: ParseErrorCode,
    pub message: String,
    pub source_label: String,
    pub span: Option<SourceSpan>,
}

impl ParseError {
    pub fn new(
        code: ParseErrorCode,
        message: impl Into<String>,
        source_label: impl Into<String>,
        span: Option<SourceSpan>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source_label: source_label.into(),
            span,
        }
    }

    pub fn line(&self) -> Option<u64> {
        self.span.map(|span| span.start_line)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            Some(span) => write!(
                f,
                "{:?}: {} (source={}, line={}, column={})",
                self.code, self.message, self.source_label, span.start_line, span.start_column
            ),
            None => write!(
                f,
                "{:?}: {} (source={})",
                self.code, self.message, self.source_label
            ),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse goal: whether `return` is legal at the top level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseGoal {
    Script,
    FunctionBody,
}

/// Parse `source` as the inside of a function.
pub fn parse_function_body(source: &str, source_label: &str) -> ParseResult<Program> {
    parse_program(source, source_label, ParseGoal::FunctionBody)
}

pub fn parse_program(source: &str, source_label: &str, goal: ParseGoal) -> ParseResult<Program> {
    if source.trim().is_empty() {
        return Err(ParseError::new(
            ParseErrorCode::EmptySource,
            "source is empty after whitespace normalization",
            source_label,
            None,
        ));
    }
    let tokens = tokenize(source, source_label)?;
    let mut parser = Parser::new(tokens, source_label, goal);
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.parse_statement()?);
    }
    let span = SourceSpan::new(
        0,
        source.len() as u64,
        1,
        1,
        parser.peek().span.end_line,
        parser.peek().span.end_column,
    );
    Ok(Program { body, span })
}

/// Parse a standalone expression (used by tooling and tests).
pub fn parse_expression(source: &str, source_label: &str) -> ParseResult<Expression> {
    let tokens = tokenize(source, source_label)?;
    let mut parser = Parser::new(tokens, source_label, ParseGoal::Script);
    let expression = parser.parse_expression()?;
    parser.expect_eof()?;
    Ok(expression)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    label: &'a str,
    goal: ParseGoal,
    function_depth: usize,
    nesting: usize,
    no_in: bool,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, label: &'a str, goal: ParseGoal) -> Self {
        Self {
            tokens,
            pos: 0,
            label,
            goal,
            function_depth: 0,
            nesting: 0,
            no_in: false,
        }
    }

    // -- Token cursor --------------------------------------------------------

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + offset).min(last)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn check_punct(&self, punct: &str) -> bool {
        self.peek().is_punct(punct)
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        self.peek().is_identifier(keyword)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.check_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.check_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> ParseResult<Token> {
        if self.check_punct(punct) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("expected `{punct}`")))
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> ParseResult<Token> {
        if self.check_keyword(keyword) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("expected `{keyword}`")))
        }
    }

    fn expect_eof(&self) -> ParseResult<()> {
        if self.at_eof() {
            Ok(())
        } else {
            Err(self.unexpected("expected end of input"))
        }
    }

    fn previous_span(&self) -> SourceSpan {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|token| token.span)
            .unwrap_or_default()
    }

    fn error(&self, code: ParseErrorCode, message: impl Into<String>, span: SourceSpan) -> ParseError {
        ParseError::new(code, message, self.label, Some(span))
    }

    fn unexpected(&self, context: &str) -> ParseError {
        let token = self.peek();
        let code = if matches!(token.kind, TokenKind::Eof) {
            ParseErrorCode::UnexpectedEnd
        } else {
            ParseErrorCode::UnexpectedToken
        };
        self.error(
            code,
            format!("unexpected {}: {context}", token.describe()),
            token.span,
        )
    }

    fn unsupported(&self, what: &str) -> ParseError {
        self.error(
            ParseErrorCode::UnsupportedSyntax,
            format!("{what} is not supported in assertion scripts"),
            self.peek().span,
        )
    }

    fn descend(&mut self) -> ParseResult<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING_DEPTH {
            return Err(self.error(
                ParseErrorCode::NestingTooDeep,
                format!("nesting exceeds {MAX_NESTING_DEPTH} levels"),
                self.peek().span,
            ));
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.nesting = self.nesting.saturating_sub(1);
    }

    fn consume_semicolon(&mut self) -> ParseResult<()> {
        if self.eat_punct(";") {
            return Ok(());
        }
        let next = self.peek();
        if next.is_punct("}") || matches!(next.kind, TokenKind::Eof) || next.newline_before {
            return Ok(());
        }
        Err(self.unexpected("expected `;`"))
    }

    fn expect_binding_identifier(&mut self) -> ParseResult<String> {
        let token = self.advance();
        match token.kind {
            TokenKind::Identifier(name) if !is_reserved(&name) => Ok(name),
            _ => {
                self.pos -= 1;
                Err(self.unexpected("expected identifier"))
            }
        }
    }

    // -- Statements ----------------------------------------------------------

    fn parse_statement(&mut self) -> ParseResult<Statement> {
        self.descend()?;
        let result = self.parse_statement_inner();
        self.ascend();
        result
    }

    fn parse_statement_inner(&mut self) -> ParseResult<Statement> {
        let start = self.peek().span;
        let keyword = match &self.peek().kind {
            TokenKind::Punct("{") => {
                let body = self.parse_block()?;
                return Ok(Statement::new(
                    StatementKind::Block(body),
                    start.to(self.previous_span()),
                ));
            }
            TokenKind::Punct(";") => {
                self.advance();
                return Ok(Statement::new(StatementKind::Empty, start));
            }
            TokenKind::Identifier(name) => name.clone(),
            _ => return self.parse_expression_statement(),
        };

        match keyword.as_str() {
            "var" => self.parse_declaration_statement(DeclarationKind::Var),
            "const" => self.parse_declaration_statement(DeclarationKind::Const),
            "let" if self.let_starts_declaration() => {
                self.parse_declaration_statement(DeclarationKind::Let)
            }
            "function" => {
                let function = self.parse_function(true)?;
                Ok(Statement::new(
                    StatementKind::Function(Rc::new(function)),
                    start.to(self.previous_span()),
                ))
            }
            "if" => self.parse_if(),
            "for" => self.parse_for(),
            "while" => {
                self.advance();
                self.expect_punct("(")?;
                let test = self.parse_expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.parse_statement()?);
                Ok(Statement::new(
                    StatementKind::While { test, body },
                    start.to(self.previous_span()),
                ))
            }
            "do" => {
                self.advance();
                let body = Box::new(self.parse_statement()?);
                self.expect_keyword("while")?;
                self.expect_punct("(")?;
                let test = self.parse_expression()?;
                self.expect_punct(")")?;
                self.eat_punct(";");
                Ok(Statement::new(
                    StatementKind::DoWhile { body, test },
                    start.to(self.previous_span()),
                ))
            }
            "return" => self.parse_return(),
            "break" | "continue" => {
                self.advance();
                if matches!(self.peek().kind, TokenKind::Identifier(_)) && !self.peek().newline_before
                {
                    return Err(self.unsupported("labelled jump"));
                }
                self.consume_semicolon()?;
                let kind = if keyword == "break" {
                    StatementKind::Break
                } else {
                    StatementKind::Continue
                };
                Ok(Statement::new(kind, start.to(self.previous_span())))
            }
            "throw" => {
                self.advance();
                if self.peek().newline_before {
                    return Err(self.unexpected("line break after `throw`"));
                }
                let argument = self.parse_expression()?;
                self.consume_semicolon()?;
                Ok(Statement::new(
                    StatementKind::Throw(argument),
                    start.to(self.previous_span()),
                ))
            }
            "try" => self.parse_try(),
            "switch" => self.parse_switch(),
            "class" => Err(self.unsupported("class declaration")),
            "import" | "export" => Err(self.unsupported("module syntax")),
            "with" => Err(self.unsupported("`with` statement")),
            "async" if self.peek_at(1).is_identifier("function") => {
                Err(self.unsupported("async function"))
            }
            _ if self.peek_at(1).is_punct(":") && !is_reserved(&keyword) => {
                Err(self.unsupported("labelled statement"))
            }
            _ => self.parse_expression_statement(),
        }
    }

    fn let_starts_declaration(&self) -> bool {
        let next = self.peek_at(1);
        next.is_punct("[")
            || next.is_punct("{")
            || matches!(&next.kind, TokenKind::Identifier(name) if !is_reserved(name) || name == "yield")
    }

    fn parse_block(&mut self) -> ParseResult<Vec<Statement>> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.check_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected("expected `}`"));
            }
            body.push(self.parse_statement()?);
        }
        self.advance();
        Ok(body)
    }

    fn parse_expression_statement(&mut self) -> ParseResult<Statement> {
        let start = self.peek().span;
        let expression = self.parse_expression()?;
        self.consume_semicolon()?;
        Ok(Statement::new(
            StatementKind::Expression(expression),
            start.to(self.previous_span()),
        ))
    }

    fn parse_declaration_statement(&mut self, kind: DeclarationKind) -> ParseResult<Statement> {
        let start = self.peek().span;
        self.advance();
        let declaration = self.parse_declarators(kind, true)?;
        self.consume_semicolon()?;
        Ok(Statement::new(
            StatementKind::Variable(declaration),
            start.to(self.previous_span()),
        ))
    }

    fn parse_declarators(
        &mut self,
        kind: DeclarationKind,
        require_const_init: bool,
    ) -> ParseResult<VariableDeclaration> {
        let mut declarators = Vec::new();
        loop {
            let start = self.peek().span;
            let target = self.parse_binding_target()?;
            let init = if self.eat_punct("=") {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            if init.is_none() && require_const_init {
                if kind == DeclarationKind::Const {
                    return Err(self.error(
                        ParseErrorCode::UnexpectedToken,
                        "missing initializer in const declaration",
                        start,
                    ));
                }
                if !matches!(target, Pattern::Identifier(_)) {
                    return Err(self.error(
                        ParseErrorCode::UnexpectedToken,
                        "missing initializer in destructuring declaration",
                        start,
                    ));
                }
            }
            declarators.push(VariableDeclarator {
                target,
                init,
                span: start.to(self.previous_span()),
            });
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(VariableDeclaration { kind, declarators })
    }

    fn parse_if(&mut self) -> ParseResult<Statement> {
        let start = self.advance().span;
        self.expect_punct("(")?;
        let test = self.parse_expression()?;
        self.expect_punct(")")?;
        let consequent = Box::new(self.parse_statement()?);
        let alternate = if self.eat_keyword("else") {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Statement::new(
            StatementKind::If {
                test,
                consequent,
                alternate,
                condition: None,
            },
            start.to(self.previous_span()),
        ))
    }

    fn parse_for(&mut self) -> ParseResult<Statement> {
        let start = self.advance().span;
        if self.check_keyword("await") {
            return Err(self.unsupported("`for await`"));
        }
        self.expect_punct("(")?;

        let declaration_kind = match &self.peek().kind {
            TokenKind::Identifier(name) if name == "var" => Some(DeclarationKind::Var),
            TokenKind::Identifier(name) if name == "const" => Some(DeclarationKind::Const),
            TokenKind::Identifier(name) if name == "let" && self.let_starts_declaration() => {
                Some(DeclarationKind::Let)
            }
            _ => None,
        };

        let saved_no_in = std::mem::replace(&mut self.no_in, true);
        let init = if self.check_punct(";") {
            None
        } else if let Some(kind) = declaration_kind {
            self.advance();
            Some(ForInit::Variable(self.parse_declarators(kind, false)?))
        } else {
            Some(ForInit::Expression(self.parse_expression()?))
        };
        self.no_in = saved_no_in;

        let each_kind = if self.check_keyword("of") {
            Some(ForEachKind::Of)
        } else if self.check_keyword("in") {
            Some(ForEachKind::In)
        } else {
            None
        };

        if let Some(each_kind) = each_kind {
            let left = match init {
                Some(ForInit::Variable(mut declaration))
                    if declaration.declarators.len() == 1
                        && declaration.declarators[0].init.is_none() =>
                {
                    let declarator = declaration.declarators.remove(0);
                    ForEachTarget::Declaration {
                        kind: declaration.kind,
                        pattern: declarator.target,
                    }
                }
                Some(ForInit::Expression(expression)) => {
                    ForEachTarget::Pattern(self.expression_to_pattern(expression, true)?)
                }
                _ => return Err(self.unexpected("invalid left-hand side in for-each loop")),
            };
            self.advance();
            let right = if each_kind == ForEachKind::Of {
                self.parse_assignment()?
            } else {
                self.parse_expression()?
            };
            self.expect_punct(")")?;
            let body = Box::new(self.parse_statement()?);
            return Ok(Statement::new(
                StatementKind::ForEach {
                    kind: each_kind,
                    left,
                    right,
                    body,
                },
                start.to(self.previous_span()),
            ));
        }

        if let Some(ForInit::Variable(declaration)) = &init {
            for declarator in &declaration.declarators {
                if declarator.init.is_none()
                    && (declaration.kind == DeclarationKind::Const
                        || !matches!(declarator.target, Pattern::Identifier(_)))
                {
                    return Err(self.error(
                        ParseErrorCode::UnexpectedToken,
                        "missing initializer in for-loop declaration",
                        declarator.span,
                    ));
                }
            }
        }

        self.expect_punct(";")?;
        let test = if self.check_punct(";") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.check_punct(")") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Statement::new(
            StatementKind::For {
                init,
                test,
                update,
                body,
            },
            start.to(self.previous_span()),
        ))
    }

    fn parse_return(&mut self) -> ParseResult<Statement> {
        let start = self.advance().span;
        if self.function_depth == 0 && self.goal != ParseGoal::FunctionBody {
            return Err(self.error(
                ParseErrorCode::UnexpectedToken,
                "`return` outside of a function",
                start,
            ));
        }
        let next = self.peek();
        let argument = if next.is_punct(";")
            || next.is_punct("}")
            || matches!(next.kind, TokenKind::Eof)
            || next.newline_before
        {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume_semicolon()?;
        Ok(Statement::new(
            StatementKind::Return(ReturnStatement {
                argument,
                splice_diagnostics: false,
            }),
            start.to(self.previous_span()),
        ))
    }

    fn parse_try(&mut self) -> ParseResult<Statement> {
        let start = self.advance().span;
        let block = self.parse_block()?;
        let handler = if self.eat_keyword("catch") {
            let param = if self.eat_punct("(") {
                let param = self.parse_binding_target()?;
                self.expect_punct(")")?;
                Some(param)
            } else {
                None
            };
            let body = self.parse_block()?;
            Some(CatchClause { param, body })
        } else {
            None
        };
        let finalizer = if self.eat_keyword("finally") {
            Some(self.parse_block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.unexpected("expected `catch` or `finally`"));
        }
        Ok(Statement::new(
            StatementKind::Try {
                block,
                handler,
                finalizer,
            },
            start.to(self.previous_span()),
        ))
    }

    fn parse_switch(&mut self) -> ParseResult<Statement> {
        let start = self.advance().span;
        self.expect_punct("(")?;
        let discriminant = self.parse_expression()?;
        self.expect_punct(")")?;
        self.expect_punct("{")?;
        let mut cases = Vec::new();
        let mut saw_default = false;
        while !self.eat_punct("}") {
            let test = if self.eat_keyword("case") {
                Some(self.parse_expression()?)
            } else if self.check_keyword("default") {
                if saw_default {
                    return Err(self.unexpected("duplicate `default` clause"));
                }
                saw_default = true;
                self.advance();
                None
            } else {
                return Err(self.unexpected("expected `case` or `default`"));
            };
            self.expect_punct(":")?;
            let mut consequent = Vec::new();
            while !self.check_keyword("case")
                && !self.check_keyword("default")
                && !self.check_punct("}")
            {
                if self.at_eof() {
                    return Err(self.unexpected("expected `}`"));
                }
                consequent.push(self.parse_statement()?);
            }
            cases.push(SwitchCase { test, consequent });
        }
        Ok(Statement::new(
            StatementKind::Switch {
                discriminant,
                cases,
            },
            start.to(self.previous_span()),
        ))
    }

    // -- Functions -----------------------------------------------------------

    fn parse_function(&mut self, require_name: bool) -> ParseResult<FunctionDef> {
        let start = self.expect_keyword("function")?.span;
        if self.check_punct("*") {
            return Err(self.unsupported("generator function"));
        }
        let name = if matches!(self.peek().kind, TokenKind::Identifier(_)) {
            Some(self.expect_binding_identifier()?)
        } else if require_name {
            return Err(self.unexpected("expected function name"));
        } else {
            None
        };
        let params = self.parse_parameters()?;
        let body = self.parse_function_block()?;
        Ok(FunctionDef {
            name,
            params,
            body: FunctionBody::Block(body),
            is_arrow: false,
            span: start.to(self.previous_span()),
        })
    }

    fn parse_parameters(&mut self) -> ParseResult<Vec<Pattern>> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                params.push(Pattern::Rest(Box::new(self.parse_binding_target()?)));
                self.expect_punct(")")?;
                break;
            }
            params.push(self.parse_binding_element()?);
            if !self.check_punct(")") {
                self.expect_punct(",")?;
            }
        }
        Ok(params)
    }

    fn parse_function_block(&mut self) -> ParseResult<Vec<Statement>> {
        self.function_depth += 1;
        let saved_no_in = std::mem::replace(&mut self.no_in, false);
        let body = self.parse_block();
        self.no_in = saved_no_in;
        self.function_depth -= 1;
        body
    }

    fn arrow_ahead(&self) -> bool {
        let first = self.peek();
        match &first.kind {
            TokenKind::Identifier(name) if !is_reserved(name) => {
                let next = self.peek_at(1);
                next.is_punct("=>") && !next.newline_before
            }
            TokenKind::Punct("(") => {
                let mut depth = 0usize;
                let mut offset = 0usize;
                loop {
                    let token = self.peek_at(offset);
                    match &token.kind {
                        TokenKind::Eof => return false,
                        TokenKind::Punct("(" | "[" | "{") => depth += 1,
                        TokenKind::Punct(")" | "]" | "}") => {
                            depth = depth.saturating_sub(1);
                            if depth == 0 {
                                let after = self.peek_at(offset + 1);
                                return after.is_punct("=>") && !after.newline_before;
                            }
                        }
                        _ => {}
                    }
                    offset += 1;
                }
            }
            _ => false,
        }
    }

    fn parse_arrow(&mut self) -> ParseResult<Expression> {
        let start = self.peek().span;
        let params = if self.check_punct("(") {
            self.parse_parameters()?
        } else {
            vec![Pattern::Identifier(self.expect_binding_identifier()?)]
        };
        self.expect_punct("=>")?;
        let body = if self.check_punct("{") {
            FunctionBody::Block(self.parse_function_block()?)
        } else {
            self.function_depth += 1;
            let body = self.parse_assignment();
            self.function_depth -= 1;
            FunctionBody::Expression(Box::new(body?))
        };
        let span = start.to(self.previous_span());
        Ok(Expression::new(
            ExpressionKind::Function(Rc::new(FunctionDef {
                name: None,
                params,
                body,
                is_arrow: true,
                span,
            })),
            span,
        ))
    }

    // -- Patterns ------------------------------------------------------------

    fn parse_binding_element(&mut self) -> ParseResult<Pattern> {
        let target = self.parse_binding_target()?;
        if self.eat_punct("=") {
            let default = self.parse_assignment()?;
            return Ok(Pattern::Default {
                target: Box::new(target),
                default: Box::new(default),
            });
        }
        Ok(target)
    }

    fn parse_binding_target(&mut self) -> ParseResult<Pattern> {
        if self.eat_punct("[") {
            let mut elements = Vec::new();
            while !self.eat_punct("]") {
                if self.eat_punct(",") {
                    elements.push(None);
                    continue;
                }
                if self.eat_punct("...") {
                    elements.push(Some(Pattern::Rest(Box::new(self.parse_binding_target()?))));
                    self.expect_punct("]")?;
                    break;
                }
                elements.push(Some(self.parse_binding_element()?));
                if !self.check_punct("]") {
                    self.expect_punct(",")?;
                }
            }
            return Ok(Pattern::Array(elements));
        }

        if self.eat_punct("{") {
            let mut properties = Vec::new();
            let mut rest = None;
            while !self.eat_punct("}") {
                if self.eat_punct("...") {
                    rest = Some(Box::new(Pattern::Identifier(
                        self.expect_binding_identifier()?,
                    )));
                    self.expect_punct("}")?;
                    break;
                }
                let key = self.parse_property_key()?;
                let (value, shorthand) = if self.eat_punct(":") {
                    (self.parse_binding_element()?, false)
                } else {
                    let PropertyKey::Identifier(name) = &key else {
                        return Err(self.unexpected("expected `:` in object pattern"));
                    };
                    if is_reserved(name) {
                        return Err(self.unexpected("reserved word in shorthand pattern"));
                    }
                    let mut value = Pattern::Identifier(name.clone());
                    if self.eat_punct("=") {
                        value = Pattern::Default {
                            target: Box::new(value),
                            default: Box::new(self.parse_assignment()?),
                        };
                    }
                    (value, true)
                };
                properties.push(ObjectPatternProperty {
                    key,
                    value,
                    shorthand,
                });
                if !self.check_punct("}") {
                    self.expect_punct(",")?;
                }
            }
            return Ok(Pattern::Object { properties, rest });
        }

        Ok(Pattern::Identifier(self.expect_binding_identifier()?))
    }

    /// Reinterpret an already-parsed expression as an assignment target.
    fn expression_to_pattern(
        &self,
        expression: Expression,
        allow_destructuring: bool,
    ) -> ParseResult<Pattern> {
        let span = expression.span;
        match expression.kind {
            ExpressionKind::Identifier(name) if !is_reserved(&name) => Ok(Pattern::Identifier(name)),
            ExpressionKind::Member {
                optional: false, ..
            } => Ok(Pattern::Member(Box::new(expression))),
            ExpressionKind::Array(elements) if allow_destructuring => {
                let mut patterns = Vec::new();
                for element in elements {
                    patterns.push(match element {
                        ArrayElement::Hole => None,
                        ArrayElement::Item(item) => Some(self.element_to_pattern(item)?),
                        ArrayElement::Spread(item) => Some(Pattern::Rest(Box::new(
                            self.expression_to_pattern(item, true)?,
                        ))),
                    });
                }
                Ok(Pattern::Array(patterns))
            }
            ExpressionKind::Object(members) if allow_destructuring => {
                let mut properties = Vec::new();
                let mut rest = None;
                for member in members {
                    match member {
                        ObjectMember::Property {
                            key,
                            value,
                            shorthand,
                        } => properties.push(ObjectPatternProperty {
                            key,
                            value: self.element_to_pattern(value)?,
                            shorthand,
                        }),
                        ObjectMember::Spread(item) => {
                            rest = Some(Box::new(self.expression_to_pattern(item, false)?));
                        }
                    }
                }
                Ok(Pattern::Object { properties, rest })
            }
            _ => Err(self.error(
                ParseErrorCode::InvalidAssignmentTarget,
                "invalid assignment target",
                span,
            )),
        }
    }

    fn element_to_pattern(&self, expression: Expression) -> ParseResult<Pattern> {
        match expression.kind {
            ExpressionKind::Assignment {
                operator: AssignmentOperator::Assign,
                target,
                value,
            } => Ok(Pattern::Default {
                target,
                default: value,
            }),
            _ => self.expression_to_pattern(expression, true),
        }
    }

    // -- Expressions ---------------------------------------------------------

    fn parse_expression(&mut self) -> ParseResult<Expression> {
        let first = self.parse_assignment()?;
        if !self.check_punct(",") {
            return Ok(first);
        }
        let start = first.span;
        let mut expressions = vec![first];
        while self.eat_punct(",") {
            expressions.push(self.parse_assignment()?);
        }
        Ok(Expression::new(
            ExpressionKind::Sequence(expressions),
            start.to(self.previous_span()),
        ))
    }

    fn parse_assignment(&mut self) -> ParseResult<Expression> {
        self.descend()?;
        let result = self.parse_assignment_inner();
        self.ascend();
        result
    }

    fn parse_assignment_inner(&mut self) -> ParseResult<Expression> {
        if self.check_keyword("async") && (self.peek_at(1).is_punct("(") || self.peek_at(2).is_punct("=>")) {
            return Err(self.unsupported("async function"));
        }
        if self.arrow_ahead() {
            return self.parse_arrow();
        }

        let left = self.parse_conditional()?;
        let Some(operator) = assignment_operator(self.peek()) else {
            return Ok(left);
        };
        self.advance();
        let start = left.span;
        let target = self.expression_to_pattern(left, operator == AssignmentOperator::Assign)?;
        let value = self.parse_assignment()?;
        Ok(Expression::new(
            ExpressionKind::Assignment {
                operator,
                target: Box::new(target),
                value: Box::new(value),
            },
            start.to(self.previous_span()),
        ))
    }

    fn parse_conditional(&mut self) -> ParseResult<Expression> {
        let test = self.parse_binary(1)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let saved_no_in = std::mem::replace(&mut self.no_in, false);
        let consequent = self.parse_assignment();
        self.no_in = saved_no_in;
        let consequent = consequent?;
        self.expect_punct(":")?;
        let alternate = self.parse_assignment()?;
        let span = test.span.to(self.previous_span());
        Ok(Expression::new(
            ExpressionKind::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            },
            span,
        ))
    }

    fn parse_binary(&mut self, min_precedence: u8) -> ParseResult<Expression> {
        let mut left = self.parse_unary()?;
        loop {
            let Some((precedence, operator)) = binary_operator(self.peek(), self.no_in) else {
                break;
            };
            if precedence < min_precedence {
                break;
            }
            self.advance();
            let right_associative = matches!(operator, InfixOperator::Binary(BinaryOperator::Exp));
            let next_min = if right_associative {
                precedence
            } else {
                precedence + 1
            };
            let right = self.parse_binary(next_min)?;
            let span = left.span.to(right.span);
            let kind = match operator {
                InfixOperator::Binary(operator) => ExpressionKind::Binary {
                    operator,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                InfixOperator::Logical(operator) => ExpressionKind::Logical {
                    operator,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
            left = Expression::new(kind, span);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expression> {
        self.descend()?;
        let result = self.parse_unary_inner();
        self.ascend();
        result
    }

    fn parse_unary_inner(&mut self) -> ParseResult<Expression> {
        let token = self.peek().clone();
        let operator = match &token.kind {
            TokenKind::Punct("!") => Some(UnaryOperator::Not),
            TokenKind::Punct("-") => Some(UnaryOperator::Minus),
            TokenKind::Punct("+") => Some(UnaryOperator::Plus),
            TokenKind::Punct("~") => Some(UnaryOperator::BitNot),
            TokenKind::Identifier(name) if name == "typeof" => Some(UnaryOperator::Typeof),
            TokenKind::Identifier(name) if name == "void" => Some(UnaryOperator::Void),
            TokenKind::Identifier(name) if name == "delete" => Some(UnaryOperator::Delete),
            _ => None,
        };
        if let Some(operator) = operator {
            self.advance();
            let argument = self.parse_unary()?;
            let span = token.span.to(argument.span);
            return Ok(Expression::new(
                ExpressionKind::Unary {
                    operator,
                    argument: Box::new(argument),
                },
                span,
            ));
        }

        if token.is_punct("++") || token.is_punct("--") {
            self.advance();
            let argument = self.parse_unary()?;
            self.check_update_target(&argument)?;
            let span = token.span.to(argument.span);
            return Ok(Expression::new(
                ExpressionKind::Update {
                    operator: update_operator(&token),
                    prefix: true,
                    argument: Box::new(argument),
                },
                span,
            ));
        }

        if token.is_identifier("await") {
            return Err(self.unsupported("`await`"));
        }

        let expression = self.parse_left_hand_side()?;
        let next = self.peek().clone();
        if (next.is_punct("++") || next.is_punct("--")) && !next.newline_before {
            self.advance();
            self.check_update_target(&expression)?;
            let span = expression.span.to(next.span);
            return Ok(Expression::new(
                ExpressionKind::Update {
                    operator: update_operator(&next),
                    prefix: false,
                    argument: Box::new(expression),
                },
                span,
            ));
        }
        Ok(expression)
    }

    fn check_update_target(&self, expression: &Expression) -> ParseResult<()> {
        match &expression.kind {
            ExpressionKind::Identifier(_) | ExpressionKind::Member { optional: false, .. } => Ok(()),
            _ => Err(self.error(
                ParseErrorCode::InvalidAssignmentTarget,
                "invalid update target",
                expression.span,
            )),
        }
    }

    fn parse_left_hand_side(&mut self) -> ParseResult<Expression> {
        let mut expression = if self.check_keyword("new") {
            self.parse_new()?
        } else {
            self.parse_primary()?
        };
        let start = expression.span;
        let mut in_chain = false;

        loop {
            if self.eat_punct(".") {
                let name = self.parse_property_name()?;
                expression = member(expression, MemberProperty::Named(name), false, self.previous_span());
            } else if self.eat_punct("?.") {
                in_chain = true;
                if self.check_punct("(") {
                    let arguments = self.parse_arguments()?;
                    expression = call(expression, arguments, true, self.previous_span());
                } else if self.eat_punct("[") {
                    let property = self.parse_computed_property()?;
                    expression = member(expression, property, true, self.previous_span());
                } else {
                    let name = self.parse_property_name()?;
                    expression = member(expression, MemberProperty::Named(name), true, self.previous_span());
                }
            } else if self.eat_punct("[") {
                let property = self.parse_computed_property()?;
                expression = member(expression, property, false, self.previous_span());
            } else if self.check_punct("(") {
                let arguments = self.parse_arguments()?;
                expression = call(expression, arguments, false, self.previous_span());
            } else if matches!(self.peek().kind, TokenKind::Template(_)) {
                return Err(self.unsupported("tagged template"));
            } else {
                break;
            }
        }

        if in_chain {
            let span = start.to(self.previous_span());
            expression = Expression::new(ExpressionKind::Chain(Box::new(expression)), span);
        }
        Ok(expression)
    }

    fn parse_new(&mut self) -> ParseResult<Expression> {
        let start = self.advance().span;
        if self.check_punct(".") {
            return Err(self.unsupported("`new.target`"));
        }
        let mut callee = if self.check_keyword("new") {
            self.parse_new()?
        } else {
            self.parse_primary()?
        };
        loop {
            if self.eat_punct(".") {
                let name = self.parse_property_name()?;
                callee = member(callee, MemberProperty::Named(name), false, self.previous_span());
            } else if self.eat_punct("[") {
                let property = self.parse_computed_property()?;
                callee = member(callee, property, false, self.previous_span());
            } else {
                break;
            }
        }
        let arguments = if self.check_punct("(") {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        Ok(Expression::new(
            ExpressionKind::New {
                callee: Box::new(callee),
                arguments,
            },
            start.to(self.previous_span()),
        ))
    }

    fn parse_property_name(&mut self) -> ParseResult<String> {
        match self.advance().kind {
            TokenKind::Identifier(name) => Ok(name),
            _ => {
                self.pos -= 1;
                Err(self.unexpected("expected property name"))
            }
        }
    }

    fn parse_computed_property(&mut self) -> ParseResult<MemberProperty> {
        let saved_no_in = std::mem::replace(&mut self.no_in, false);
        let property = self.parse_expression();
        self.no_in = saved_no_in;
        let property = property?;
        self.expect_punct("]")?;
        Ok(MemberProperty::Computed(Box::new(property)))
    }

    fn parse_arguments(&mut self) -> ParseResult<Vec<Argument>> {
        self.expect_punct("(")?;
        let saved_no_in = std::mem::replace(&mut self.no_in, false);
        let mut arguments = Vec::new();
        let result = loop {
            if self.eat_punct(")") {
                break Ok(());
            }
            let argument = if self.eat_punct("...") {
                self.parse_assignment().map(Argument::Spread)
            } else {
                self.parse_assignment().map(Argument::Item)
            };
            match argument {
                Ok(argument) => arguments.push(argument),
                Err(error) => break Err(error),
            }
            if !self.check_punct(")") {
                if let Err(error) = self.expect_punct(",") {
                    break Err(error);
                }
            }
        };
        self.no_in = saved_no_in;
        result.map(|()| arguments)
    }

    fn parse_primary(&mut self) -> ParseResult<Expression> {
        let token = self.peek().clone();
        let span = token.span;
        match token.kind {
            TokenKind::Identifier(name) => match name.as_str() {
                "function" => {
                    let function = self.parse_function(false)?;
                    let span = function.span;
                    Ok(Expression::new(
                        ExpressionKind::Function(Rc::new(function)),
                        span,
                    ))
                }
                "this" => {
                    self.advance();
                    Ok(Expression::new(ExpressionKind::This, span))
                }
                "null" => {
                    self.advance();
                    Ok(Expression::new(ExpressionKind::Null, span))
                }
                "true" | "false" => {
                    self.advance();
                    Ok(Expression::new(ExpressionKind::Boolean(name == "true"), span))
                }
                "class" => Err(self.unsupported("class expression")),
                "super" | "import" => Err(self.unsupported(&format!("`{name}`"))),
                _ if is_reserved(&name) => Err(self.unexpected("expected expression")),
                _ => {
                    self.advance();
                    Ok(Expression::new(ExpressionKind::Identifier(name), span))
                }
            },
            TokenKind::Number(value) => {
                self.advance();
                Ok(Expression::new(ExpressionKind::Number(value), span))
            }
            TokenKind::String(value) => {
                self.advance();
                Ok(Expression::new(ExpressionKind::String(value), span))
            }
            TokenKind::Template(template) => {
                self.advance();
                let mut expressions = Vec::with_capacity(template.expressions.len());
                for tokens in template.expressions {
                    let mut nested = Parser::new(tokens, self.label, self.goal);
                    nested.nesting = self.nesting;
                    nested.function_depth = self.function_depth;
                    let expression = nested.parse_expression()?;
                    nested.expect_eof()?;
                    expressions.push(expression);
                }
                Ok(Expression::new(
                    ExpressionKind::Template {
                        quasis: template.quasis,
                        expressions,
                    },
                    span,
                ))
            }
            TokenKind::Punct("(") => {
                self.advance();
                let saved_no_in = std::mem::replace(&mut self.no_in, false);
                let inner = self.parse_expression();
                self.no_in = saved_no_in;
                let mut inner = inner?;
                self.expect_punct(")")?;
                inner.span = span.to(self.previous_span());
                Ok(inner)
            }
            TokenKind::Punct("[") => self.parse_array_literal(),
            TokenKind::Punct("{") => self.parse_object_literal(),
            _ => Err(self.unexpected("expected expression")),
        }
    }

    fn parse_array_literal(&mut self) -> ParseResult<Expression> {
        let start = self.expect_punct("[")?.span;
        let saved_no_in = std::mem::replace(&mut self.no_in, false);
        let mut elements = Vec::new();
        let result = loop {
            if self.eat_punct("]") {
                break Ok(());
            }
            if self.eat_punct(",") {
                elements.push(ArrayElement::Hole);
                continue;
            }
            let element = if self.eat_punct("...") {
                self.parse_assignment().map(ArrayElement::Spread)
            } else {
                self.parse_assignment().map(ArrayElement::Item)
            };
            match element {
                Ok(element) => elements.push(element),
                Err(error) => break Err(error),
            }
            if !self.check_punct("]") {
                if let Err(error) = self.expect_punct(",") {
                    break Err(error);
                }
            }
        };
        self.no_in = saved_no_in;
        result?;
        Ok(Expression::new(
            ExpressionKind::Array(elements),
            start.to(self.previous_span()),
        ))
    }

    fn parse_object_literal(&mut self) -> ParseResult<Expression> {
        let start = self.expect_punct("{")?.span;
        let saved_no_in = std::mem::replace(&mut self.no_in, false);
        let result = self.parse_object_members();
        self.no_in = saved_no_in;
        let members = result?;
        Ok(Expression::new(
            ExpressionKind::Object(members),
            start.to(self.previous_span()),
        ))
    }

    fn parse_object_members(&mut self) -> ParseResult<Vec<ObjectMember>> {
        let mut members = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct("...") {
                members.push(ObjectMember::Spread(self.parse_assignment()?));
            } else {
                let key_start = self.peek().span;
                if (self.check_keyword("get") || self.check_keyword("set") || self.check_keyword("async"))
                    && !self.peek_at(1).is_punct(":")
                    && !self.peek_at(1).is_punct("(")
                    && !self.peek_at(1).is_punct(",")
                    && !self.peek_at(1).is_punct("}")
                {
                    return Err(self.unsupported("accessor or async method"));
                }
                let key = self.parse_property_key()?;
                if self.eat_punct(":") {
                    let value = self.parse_assignment()?;
                    members.push(ObjectMember::Property {
                        key,
                        value,
                        shorthand: false,
                    });
                } else if self.check_punct("(") {
                    let params = self.parse_parameters()?;
                    let body = self.parse_function_block()?;
                    let span = key_start.to(self.previous_span());
                    let name = match &key {
                        PropertyKey::Identifier(name) | PropertyKey::String(name) => {
                            Some(name.clone())
                        }
                        _ => None,
                    };
                    let function = FunctionDef {
                        name,
                        params,
                        body: FunctionBody::Block(body),
                        is_arrow: false,
                        span,
                    };
                    members.push(ObjectMember::Property {
                        key,
                        value: Expression::new(ExpressionKind::Function(Rc::new(function)), span),
                        shorthand: false,
                    });
                } else {
                    let PropertyKey::Identifier(name) = &key else {
                        return Err(self.unexpected("expected `:` after property key"));
                    };
                    if is_reserved(name) {
                        return Err(self.unexpected("reserved word used as shorthand property"));
                    }
                    if self.check_punct("=") {
                        return Err(self.unsupported("shorthand default outside a pattern"));
                    }
                    let value =
                        Expression::new(ExpressionKind::Identifier(name.clone()), key_start);
                    members.push(ObjectMember::Property {
                        key,
                        value,
                        shorthand: true,
                    });
                }
            }
            if !self.check_punct("}") {
                self.expect_punct(",")?;
            }
        }
        Ok(members)
    }

    fn parse_property_key(&mut self) -> ParseResult<PropertyKey> {
        let token = self.advance();
        match token.kind {
            TokenKind::Identifier(name) => Ok(PropertyKey::Identifier(name)),
            TokenKind::String(value) => Ok(PropertyKey::String(value)),
            TokenKind::Number(value) => Ok(PropertyKey::Number(value)),
            TokenKind::Punct("[") => {
                let key = self.parse_assignment()?;
                self.expect_punct("]")?;
                Ok(PropertyKey::Computed(Box::new(key)))
            }
            _ => {
                self.pos -= 1;
                Err(self.unexpected("expected property key"))
            }
        }
    }
}

enum InfixOperator {
    Binary(BinaryOperator),
    Logical(LogicalOperator),
}

fn binary_operator(token: &Token, no_in: bool) -> Option<(u8, InfixOperator)> {
    use BinaryOperator as B;
    use InfixOperator::{Binary, Logical};
    let entry = match &token.kind {
        TokenKind::Punct(punct) => match *punct {
            "??" => (1, Logical(LogicalOperator::Coalesce)),
            "||" => (1, Logical(LogicalOperator::Or)),
            "&&" => (2, Logical(LogicalOperator::And)),
            "|" => (3, Binary(B::BitOr)),
            "^" => (4, Binary(B::BitXor)),
            "&" => (5, Binary(B::BitAnd)),
            "==" => (6, Binary(B::Eq)),
            "!=" => (6, Binary(B::NotEq)),
            "===" => (6, Binary(B::StrictEq)),
            "!==" => (6, Binary(B::StrictNotEq)),
            "<" => (7, Binary(B::Lt)),
            ">" => (7, Binary(B::Gt)),
            "<=" => (7, Binary(B::LtEq)),
            ">=" => (7, Binary(B::GtEq)),
            "<<" => (8, Binary(B::Shl)),
            ">>" => (8, Binary(B::Shr)),
            ">>>" => (8, Binary(B::UShr)),
            "+" => (9, Binary(B::Add)),
            "-" => (9, Binary(B::Sub)),
            "*" => (10, Binary(B::Mul)),
            "/" => (10, Binary(B::Div)),
            "%" => (10, Binary(B::Rem)),
            "**" => (11, Binary(B::Exp)),
            _ => return None,
        },
        TokenKind::Identifier(name) if name == "instanceof" => (7, Binary(B::Instanceof)),
        TokenKind::Identifier(name) if name == "in" && !no_in => (7, Binary(B::In)),
        _ => return None,
    };
    Some(entry)
}

fn assignment_operator(token: &Token) -> Option<AssignmentOperator> {
    use AssignmentOperator::{Assign, Compound, Logical};
    let TokenKind::Punct(punct) = &token.kind else {
        return None;
    };
    Some(match *punct {
        "=" => Assign,
        "+=" => Compound(BinaryOperator::Add),
        "-=" => Compound(BinaryOperator::Sub),
        "*=" => Compound(BinaryOperator::Mul),
        "/=" => Compound(BinaryOperator::Div),
        "%=" => Compound(BinaryOperator::Rem),
        "**=" => Compound(BinaryOperator::Exp),
        "&=" => Compound(BinaryOperator::BitAnd),
        "|=" => Compound(BinaryOperator::BitOr),
        "^=" => Compound(BinaryOperator::BitXor),
        "<<=" => Compound(BinaryOperator::Shl),
        ">>=" => Compound(BinaryOperator::Shr),
        ">>>=" => Compound(BinaryOperator::UShr),
        "&&=" => Logical(LogicalOperator::And),
        "||=" => Logical(LogicalOperator::Or),
        "??=" => Logical(LogicalOperator::Coalesce),
        _ => return None,
    })
}

fn update_operator(token: &Token) -> UpdateOperator {
    if token.is_punct("++") {
        UpdateOperator::Increment
    } else {
        UpdateOperator::Decrement
    }
}

fn member(object: Expression, property: MemberProperty, optional: bool, end: SourceSpan) -> Expression {
    let span = object.span.to(end);
    Expression::new(
        ExpressionKind::Member {
            object: Box::new(object),
            property,
            optional,
        },
        span,
    )
}

fn call(callee: Expression, arguments: Vec<Argument>, optional: bool, end: SourceSpan) -> Expression {
    let span = callee.span.to(end);
    Expression::new(
        ExpressionKind::Call {
            callee: Box::new(callee),
            arguments,
            optional,
        },
        span,
    )
}

fn is_reserved(name: &str) -> bool {
    RESERVED_WORDS.contains(&name)
}
