//! Syntax tree for assertion script bodies.
//!
//! The parser in `parser.rs` emits this representation. The instrumentor
//! rewrites it by inserting [`Probe`] statements and the interpreter walks
//! the rewritten tree directly, so the same types describe both the
//! caller's script and its instrumented form.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Source-span with byte offsets and one-based line/column markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start_offset: u64,
    pub end_offset: u64,
    pub start_line: u64,
    pub start_column: u64,
    pub end_line: u64,
    pub end_column: u64,
}

impl SourceSpan {
    pub fn new(
        start_offset: u64,
        end_offset: u64,
        start_line: u64,
        start_column: u64,
        end_line: u64,
        end_column: u64,
    ) -> Self {
        Self {
            start_offset,
            end_offset,
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }

    /// Span covering `self` through the end of `end`.
    pub fn to(self, end: SourceSpan) -> SourceSpan {
        SourceSpan {
            end_offset: end.end_offset,
            end_line: end.end_line,
            end_column: end.end_column,
            ..self
        }
    }
}

/// Parsed function body: the statements between `main`'s braces.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Statement>,
    pub span: SourceSpan,
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: SourceSpan,
}

impl Statement {
    pub fn new(kind: StatementKind, span: SourceSpan) -> Self {
        Self { kind, span }
    }

    pub fn line(&self) -> u64 {
        self.span.start_line
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Variable(VariableDeclaration),
    Function(Rc<FunctionDef>),
    Expression(Expression),
    If {
        test: Expression,
        consequent: Box<Statement>,
        alternate: Option<Box<Statement>>,
        /// Set by the instrumentor; the interpreter records the test outcome
        /// while evaluating it.
        condition: Option<ConditionTag>,
    },
    Block(Vec<Statement>),
    For {
        init: Option<ForInit>,
        test: Option<Expression>,
        update: Option<Expression>,
        body: Box<Statement>,
    },
    ForEach {
        kind: ForEachKind,
        left: ForEachTarget,
        right: Expression,
        body: Box<Statement>,
    },
    While {
        test: Expression,
        body: Box<Statement>,
    },
    DoWhile {
        body: Box<Statement>,
        test: Expression,
    },
    Return(ReturnStatement),
    Break,
    Continue,
    Throw(Expression),
    Try {
        block: Vec<Statement>,
        handler: Option<CatchClause>,
        finalizer: Option<Vec<Statement>>,
    },
    Switch {
        discriminant: Expression,
        cases: Vec<SwitchCase>,
    },
    Empty,
    /// Instrumentation hook; never produced by the parser.
    Probe(Probe),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclarationKind {
    Var,
    Let,
    Const,
}

impl DeclarationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Var => "var",
            Self::Let => "let",
            Self::Const => "const",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDeclaration {
    pub kind: DeclarationKind,
    pub declarators: Vec<VariableDeclarator>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDeclarator {
    pub target: Pattern,
    pub init: Option<Expression>,
    pub span: SourceSpan,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForInit {
    Variable(VariableDeclaration),
    Expression(Expression),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForEachKind {
    Of,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForEachTarget {
    Declaration {
        kind: DeclarationKind,
        pattern: Pattern,
    },
    Pattern(Pattern),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStatement {
    pub argument: Option<Expression>,
    /// Set by the instrumentor on the one return that carries diagnostics.
    pub splice_diagnostics: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    pub param: Option<Pattern>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub test: Option<Expression>,
    pub consequent: Vec<Statement>,
}

/// Printed test text and decoded line of an instrumented `if`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionTag {
    pub text: String,
    pub line: u64,
}

/// Instrumentation node injected by the static instrumentor.
///
/// Probes carry already-printed text for diagnostics and, for success terms,
/// a clone of the side-effect-free sub-tree they re-evaluate, so the
/// interpreter never evaluates source strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    TraceVariable {
        name: String,
    },
    SuccessTerm {
        text: String,
        line: u64,
        term: Expression,
    },
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<Pattern>,
    pub body: FunctionBody,
    pub is_arrow: bool,
    pub span: SourceSpan,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Block(Vec<Statement>),
    Expression(Box<Expression>),
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub kind: ExpressionKind,
    pub span: SourceSpan,
}

impl Expression {
    pub fn new(kind: ExpressionKind, span: SourceSpan) -> Self {
        Self { kind, span }
    }

    pub fn as_identifier(&self) -> Option<&str> {
        match &self.kind {
            ExpressionKind::Identifier(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionKind {
    Identifier(String),
    This,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Template {
        quasis: Vec<String>,
        expressions: Vec<Expression>,
    },
    Array(Vec<ArrayElement>),
    Object(Vec<ObjectMember>),
    Function(Rc<FunctionDef>),
    Unary {
        operator: UnaryOperator,
        argument: Box<Expression>,
    },
    Update {
        operator: UpdateOperator,
        prefix: bool,
        argument: Box<Expression>,
    },
    Binary {
        operator: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Logical {
        operator: LogicalOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Conditional {
        test: Box<Expression>,
        consequent: Box<Expression>,
        alternate: Box<Expression>,
    },
    Assignment {
        operator: AssignmentOperator,
        target: Box<Pattern>,
        value: Box<Expression>,
    },
    Sequence(Vec<Expression>),
    Member {
        object: Box<Expression>,
        property: MemberProperty,
        optional: bool,
    },
    Call {
        callee: Box<Expression>,
        arguments: Vec<Argument>,
        optional: bool,
    },
    New {
        callee: Box<Expression>,
        arguments: Vec<Argument>,
    },
    /// Boundary of an optional chain (`a?.b.c`): short-circuits land here.
    Chain(Box<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemberProperty {
    Named(String),
    Computed(Box<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayElement {
    Hole,
    Item(Expression),
    Spread(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Item(Expression),
    Spread(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectMember {
    Property {
        key: PropertyKey,
        value: Expression,
        shorthand: bool,
    },
    Spread(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKey {
    Identifier(String),
    String(String),
    Number(f64),
    Computed(Box<Expression>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Minus,
    Plus,
    BitNot,
    Typeof,
    Void,
    Delete,
}

impl UnaryOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Not => "!",
            Self::Minus => "-",
            Self::Plus => "+",
            Self::BitNot => "~",
            Self::Typeof => "typeof",
            Self::Void => "void",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOperator {
    Increment,
    Decrement,
}

impl UpdateOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Increment => "++",
            Self::Decrement => "--",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Exp,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
    In,
    Instanceof,
}

impl BinaryOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Exp => "**",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::StrictEq => "===",
            Self::StrictNotEq => "!==",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::UShr => ">>>",
            Self::In => "in",
            Self::Instanceof => "instanceof",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
    Coalesce,
}

impl LogicalOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::And => "&&",
            Self::Or => "||",
            Self::Coalesce => "??",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentOperator {
    Assign,
    Compound(BinaryOperator),
    Logical(LogicalOperator),
}

impl AssignmentOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assign => "=",
            Self::Compound(op) => match op {
                BinaryOperator::Add => "+=",
                BinaryOperator::Sub => "-=",
                BinaryOperator::Mul => "*=",
                BinaryOperator::Div => "/=",
                BinaryOperator::Rem => "%=",
                BinaryOperator::Exp => "**=",
                BinaryOperator::BitAnd => "&=",
                BinaryOperator::BitOr => "|=",
                BinaryOperator::BitXor => "^=",
                BinaryOperator::Shl => "<<=",
                BinaryOperator::Shr => ">>=",
                BinaryOperator::UShr => ">>>=",
                _ => "=",
            },
            Self::Logical(op) => match op {
                LogicalOperator::And => "&&=",
                LogicalOperator::Or => "||=",
                LogicalOperator::Coalesce => "??=",
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// Binding or assignment target.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Identifier(String),
    /// Member expression target; only valid in assignments.
    Member(Box<Expression>),
    Object {
        properties: Vec<ObjectPatternProperty>,
        rest: Option<Box<Pattern>>,
    },
    Array(Vec<Option<Pattern>>),
    Default {
        target: Box<Pattern>,
        default: Box<Expression>,
    },
    Rest(Box<Pattern>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPatternProperty {
    pub key: PropertyKey,
    pub value: Pattern,
    pub shorthand: bool,
}

impl Pattern {
    /// Identifier names bound by this pattern, in source order.
    pub fn bound_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, names: &mut Vec<String>) {
        match self {
            Self::Identifier(name) => names.push(name.clone()),
            Self::Member(_) => {}
            Self::Object { properties, rest } => {
                for property in properties {
                    property.value.collect_names(names);
                }
                if let Some(rest) = rest {
                    rest.collect_names(names);
                }
            }
            Self::Array(elements) => {
                for element in elements.iter().flatten() {
                    element.collect_names(names);
                }
            }
            Self::Default { target, .. } | Self::Rest(target) => target.collect_names(names),
        }
    }
}

// ---------------------------------------------------------------------------
// Visitors
// ---------------------------------------------------------------------------

/// Read-only traversal over the syntax tree.
///
/// Override a hook and call the matching `walk_*` function to keep
/// descending; skip the call to prune the subtree.
pub trait Visitor {
    fn visit_block(&mut self, statements: &[Statement]) {
        for statement in statements {
            self.visit_statement(statement);
        }
    }

    fn visit_statement(&mut self, statement: &Statement) {
        walk_statement(self, statement);
    }

    fn visit_expression(&mut self, expression: &Expression) {
        walk_expression(self, expression);
    }

    fn visit_pattern(&mut self, pattern: &Pattern) {
        walk_pattern(self, pattern);
    }

    fn visit_function(&mut self, function: &FunctionDef) {
        walk_function(self, function);
    }
}

pub fn walk_statement<V: Visitor + ?Sized>(visitor: &mut V, statement: &Statement) {
    match &statement.kind {
        StatementKind::Variable(declaration) => walk_declaration(visitor, declaration),
        StatementKind::Function(function) => visitor.visit_function(function),
        StatementKind::Expression(expression) | StatementKind::Throw(expression) => {
            visitor.visit_expression(expression);
        }
        StatementKind::If {
            test,
            consequent,
            alternate,
            ..
        } => {
            visitor.visit_expression(test);
            visitor.visit_statement(consequent);
            if let Some(alternate) = alternate {
                visitor.visit_statement(alternate);
            }
        }
        StatementKind::Block(statements) => visitor.visit_block(statements),
        StatementKind::For {
            init,
            test,
            update,
            body,
        } => {
            match init {
                Some(ForInit::Variable(declaration)) => walk_declaration(visitor, declaration),
                Some(ForInit::Expression(expression)) => visitor.visit_expression(expression),
                None => {}
            }
            if let Some(test) = test {
                visitor.visit_expression(test);
            }
            if let Some(update) = update {
                visitor.visit_expression(update);
            }
            visitor.visit_statement(body);
        }
        StatementKind::ForEach {
            left, right, body, ..
        } => {
            match left {
                ForEachTarget::Declaration { pattern, .. } | ForEachTarget::Pattern(pattern) => {
                    visitor.visit_pattern(pattern);
                }
            }
            visitor.visit_expression(right);
            visitor.visit_statement(body);
        }
        StatementKind::While { test, body } | StatementKind::DoWhile { body, test } => {
            visitor.visit_expression(test);
            visitor.visit_statement(body);
        }
        StatementKind::Return(ret) => {
            if let Some(argument) = &ret.argument {
                visitor.visit_expression(argument);
            }
        }
        StatementKind::Try {
            block,
            handler,
            finalizer,
        } => {
            visitor.visit_block(block);
            if let Some(handler) = handler {
                if let Some(param) = &handler.param {
                    visitor.visit_pattern(param);
                }
                visitor.visit_block(&handler.body);
            }
            if let Some(finalizer) = finalizer {
                visitor.visit_block(finalizer);
            }
        }
        StatementKind::Switch {
            discriminant,
            cases,
        } => {
            visitor.visit_expression(discriminant);
            for case in cases {
                if let Some(test) = &case.test {
                    visitor.visit_expression(test);
                }
                visitor.visit_block(&case.consequent);
            }
        }
        StatementKind::Probe(probe) => match probe {
            Probe::TraceVariable { .. } => {}
            Probe::SuccessTerm { term, .. } => visitor.visit_expression(term),
        },
        StatementKind::Break | StatementKind::Continue | StatementKind::Empty => {}
    }
}

pub fn walk_declaration<V: Visitor + ?Sized>(visitor: &mut V, declaration: &VariableDeclaration) {
    for declarator in &declaration.declarators {
        visitor.visit_pattern(&declarator.target);
        if let Some(init) = &declarator.init {
            visitor.visit_expression(init);
        }
    }
}

pub fn walk_function<V: Visitor + ?Sized>(visitor: &mut V, function: &FunctionDef) {
    for param in &function.params {
        visitor.visit_pattern(param);
    }
    match &function.body {
        FunctionBody::Block(statements) => visitor.visit_block(statements),
        FunctionBody::Expression(expression) => visitor.visit_expression(expression),
    }
}

pub fn walk_pattern<V: Visitor + ?Sized>(visitor: &mut V, pattern: &Pattern) {
    match pattern {
        Pattern::Identifier(_) => {}
        Pattern::Member(expression) => visitor.visit_expression(expression),
        Pattern::Object { properties, rest } => {
            for property in properties {
                if let PropertyKey::Computed(key) = &property.key {
                    visitor.visit_expression(key);
                }
                visitor.visit_pattern(&property.value);
            }
            if let Some(rest) = rest {
                visitor.visit_pattern(rest);
            }
        }
        Pattern::Array(elements) => {
            for element in elements.iter().flatten() {
                visitor.visit_pattern(element);
            }
        }
        Pattern::Default { target, default } => {
            visitor.visit_pattern(target);
            visitor.visit_expression(default);
        }
        Pattern::Rest(target) => visitor.visit_pattern(target),
    }
}

pub fn walk_expression<V: Visitor + ?Sized>(visitor: &mut V, expression: &Expression) {
    match &expression.kind {
        ExpressionKind::Identifier(_)
        | ExpressionKind::This
        | ExpressionKind::Null
        | ExpressionKind::Boolean(_)
        | ExpressionKind::Number(_)
        | ExpressionKind::String(_) => {}
        ExpressionKind::Template { expressions, .. } | ExpressionKind::Sequence(expressions) => {
            for inner in expressions {
                visitor.visit_expression(inner);
            }
        }
        ExpressionKind::Array(elements) => {
            for element in elements {
                match element {
                    ArrayElement::Hole => {}
                    ArrayElement::Item(inner) | ArrayElement::Spread(inner) => {
                        visitor.visit_expression(inner);
                    }
                }
            }
        }
        ExpressionKind::Object(members) => {
            for member in members {
                match member {
                    ObjectMember::Property { key, value, .. } => {
                        if let PropertyKey::Computed(key) = key {
                            visitor.visit_expression(key);
                        }
                        visitor.visit_expression(value);
                    }
                    ObjectMember::Spread(inner) => visitor.visit_expression(inner),
                }
            }
        }
        ExpressionKind::Function(function) => visitor.visit_function(function),
        ExpressionKind::Unary { argument, .. } | ExpressionKind::Update { argument, .. } => {
            visitor.visit_expression(argument);
        }
        ExpressionKind::Binary { left, right, .. } | ExpressionKind::Logical { left, right, .. } => {
            visitor.visit_expression(left);
            visitor.visit_expression(right);
        }
        ExpressionKind::Conditional {
            test,
            consequent,
            alternate,
        } => {
            visitor.visit_expression(test);
            visitor.visit_expression(consequent);
            visitor.visit_expression(alternate);
        }
        ExpressionKind::Assignment { target, value, .. } => {
            visitor.visit_pattern(target);
            visitor.visit_expression(value);
        }
        ExpressionKind::Member {
            object, property, ..
        } => {
            visitor.visit_expression(object);
            if let MemberProperty::Computed(property) = property {
                visitor.visit_expression(property);
            }
        }
        ExpressionKind::Call {
            callee, arguments, ..
        }
        | ExpressionKind::New { callee, arguments } => {
            visitor.visit_expression(callee);
            for argument in arguments {
                match argument {
                    Argument::Item(inner) | Argument::Spread(inner) => {
                        visitor.visit_expression(inner);
                    }
                }
            }
        }
        ExpressionKind::Chain(inner) => visitor.visit_expression(inner),
    }
}

/// Rewriting traversal. Statement lists are exposed as `&mut Vec` so a
/// visitor can splice new statements around the ones it walks.
pub trait VisitorMut {
    fn visit_block_mut(&mut self, statements: &mut Vec<Statement>) {
        for statement in statements.iter_mut() {
            self.visit_statement_mut(statement);
        }
    }

    fn visit_statement_mut(&mut self, statement: &mut Statement) {
        walk_statement_mut(self, statement);
    }

    fn visit_expression_mut(&mut self, expression: &mut Expression) {
        walk_expression_mut(self, expression);
    }

    fn visit_function_mut(&mut self, function: &mut FunctionDef) {
        walk_function_mut(self, function);
    }
}

pub fn walk_statement_mut<V: VisitorMut + ?Sized>(visitor: &mut V, statement: &mut Statement) {
    match &mut statement.kind {
        StatementKind::Variable(declaration) => walk_declaration_mut(visitor, declaration),
        StatementKind::Function(function) => visitor.visit_function_mut(Rc::make_mut(function)),
        StatementKind::Expression(expression) | StatementKind::Throw(expression) => {
            visitor.visit_expression_mut(expression);
        }
        StatementKind::If {
            test,
            consequent,
            alternate,
            ..
        } => {
            visitor.visit_expression_mut(test);
            visitor.visit_statement_mut(consequent);
            if let Some(alternate) = alternate {
                visitor.visit_statement_mut(alternate);
            }
        }
        StatementKind::Block(statements) => visitor.visit_block_mut(statements),
        StatementKind::For {
            init,
            test,
            update,
            body,
        } => {
            match init {
                Some(ForInit::Variable(declaration)) => walk_declaration_mut(visitor, declaration),
                Some(ForInit::Expression(expression)) => visitor.visit_expression_mut(expression),
                None => {}
            }
            if let Some(test) = test {
                visitor.visit_expression_mut(test);
            }
            if let Some(update) = update {
                visitor.visit_expression_mut(update);
            }
            visitor.visit_statement_mut(body);
        }
        StatementKind::ForEach { right, body, .. } => {
            visitor.visit_expression_mut(right);
            visitor.visit_statement_mut(body);
        }
        StatementKind::While { test, body } | StatementKind::DoWhile { body, test } => {
            visitor.visit_expression_mut(test);
            visitor.visit_statement_mut(body);
        }
        StatementKind::Return(ret) => {
            if let Some(argument) = &mut ret.argument {
                visitor.visit_expression_mut(argument);
            }
        }
        StatementKind::Try {
            block,
            handler,
            finalizer,
        } => {
            visitor.visit_block_mut(block);
            if let Some(handler) = handler {
                visitor.visit_block_mut(&mut handler.body);
            }
            if let Some(finalizer) = finalizer {
                visitor.visit_block_mut(finalizer);
            }
        }
        StatementKind::Switch {
            discriminant,
            cases,
        } => {
            visitor.visit_expression_mut(discriminant);
            for case in cases {
                if let Some(test) = &mut case.test {
                    visitor.visit_expression_mut(test);
                }
                visitor.visit_block_mut(&mut case.consequent);
            }
        }
        StatementKind::Probe(_)
        | StatementKind::Break
        | StatementKind::Continue
        | StatementKind::Empty => {}
    }
}

fn walk_declaration_mut<V: VisitorMut + ?Sized>(
    visitor: &mut V,
    declaration: &mut VariableDeclaration,
) {
    for declarator in &mut declaration.declarators {
        if let Some(init) = &mut declarator.init {
            visitor.visit_expression_mut(init);
        }
    }
}

pub fn walk_function_mut<V: VisitorMut + ?Sized>(visitor: &mut V, function: &mut FunctionDef) {
    match &mut function.body {
        FunctionBody::Block(statements) => visitor.visit_block_mut(statements),
        FunctionBody::Expression(expression) => visitor.visit_expression_mut(expression),
    }
}

pub fn walk_expression_mut<V: VisitorMut + ?Sized>(visitor: &mut V, expression: &mut Expression) {
    match &mut expression.kind {
        ExpressionKind::Identifier(_)
        | ExpressionKind::This
        | ExpressionKind::Null
        | ExpressionKind::Boolean(_)
        | ExpressionKind::Number(_)
        | ExpressionKind::String(_) => {}
        ExpressionKind::Template { expressions, .. } | ExpressionKind::Sequence(expressions) => {
            for inner in expressions {
                visitor.visit_expression_mut(inner);
            }
        }
        ExpressionKind::Array(elements) => {
            for element in elements {
                match element {
                    ArrayElement::Hole => {}
                    ArrayElement::Item(inner) | ArrayElement::Spread(inner) => {
                        visitor.visit_expression_mut(inner);
                    }
                }
            }
        }
        ExpressionKind::Object(members) => {
            for member in members {
                match member {
                    ObjectMember::Property { key, value, .. } => {
                        if let PropertyKey::Computed(key) = key {
                            visitor.visit_expression_mut(key);
                        }
                        visitor.visit_expression_mut(value);
                    }
                    ObjectMember::Spread(inner) => visitor.visit_expression_mut(inner),
                }
            }
        }
        ExpressionKind::Function(function) => visitor.visit_function_mut(Rc::make_mut(function)),
        ExpressionKind::Unary { argument, .. } | ExpressionKind::Update { argument, .. } => {
            visitor.visit_expression_mut(argument);
        }
        ExpressionKind::Binary { left, right, .. } | ExpressionKind::Logical { left, right, .. } => {
            visitor.visit_expression_mut(left);
            visitor.visit_expression_mut(right);
        }
        ExpressionKind::Conditional {
            test,
            consequent,
            alternate,
        } => {
            visitor.visit_expression_mut(test);
            visitor.visit_expression_mut(consequent);
            visitor.visit_expression_mut(alternate);
        }
        ExpressionKind::Assignment { value, .. } => visitor.visit_expression_mut(value),
        ExpressionKind::Member {
            object, property, ..
        } => {
            visitor.visit_expression_mut(object);
            if let MemberProperty::Computed(property) = property {
                visitor.visit_expression_mut(property);
            }
        }
        ExpressionKind::Call {
            callee, arguments, ..
        }
        | ExpressionKind::New { callee, arguments } => {
            visitor.visit_expression_mut(callee);
            for argument in arguments {
                match argument {
                    Argument::Item(inner) | Argument::Spread(inner) => {
                        visitor.visit_expression_mut(inner);
                    }
                }
            }
        }
        ExpressionKind::Chain(inner) => visitor.visit_expression_mut(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Expression {
        Expression::new(
            ExpressionKind::Identifier(name.to_string()),
            SourceSpan::default(),
        )
    }

    #[test]
    fn bound_names_follow_source_order_through_nested_patterns() {
        let pattern = Pattern::Object {
            properties: vec![
                ObjectPatternProperty {
                    key: PropertyKey::Identifier("a".to_string()),
                    value: Pattern::Identifier("a".to_string()),
                    shorthand: true,
                },
                ObjectPatternProperty {
                    key: PropertyKey::Identifier("b".to_string()),
                    value: Pattern::Array(vec![
                        Some(Pattern::Identifier("first".to_string())),
                        None,
                        Some(Pattern::Default {
                            target: Box::new(Pattern::Identifier("third".to_string())),
                            default: Box::new(ident("fallback")),
                        }),
                    ]),
                    shorthand: false,
                },
            ],
            rest: Some(Box::new(Pattern::Identifier("others".to_string()))),
        };
        assert_eq!(pattern.bound_names(), vec!["a", "first", "third", "others"]);
    }

    #[test]
    fn member_patterns_bind_nothing() {
        let pattern = Pattern::Member(Box::new(ident("obj")));
        assert!(pattern.bound_names().is_empty());
    }

    #[test]
    fn span_merge_keeps_start_and_takes_end() {
        let start = SourceSpan::new(0, 3, 1, 1, 1, 4);
        let end = SourceSpan::new(10, 12, 2, 3, 2, 5);
        let merged = start.to(end);
        assert_eq!(merged.start_offset, 0);
        assert_eq!(merged.end_offset, 12);
        assert_eq!(merged.start_line, 1);
        assert_eq!(merged.end_line, 2);
    }

    struct IdentifierCounter(usize);

    impl Visitor for IdentifierCounter {
        fn visit_expression(&mut self, expression: &Expression) {
            if expression.as_identifier().is_some() {
                self.0 += 1;
            }
            walk_expression(self, expression);
        }
    }

    #[test]
    fn visitor_reaches_nested_expressions() {
        let expression = Expression::new(
            ExpressionKind::Logical {
                operator: LogicalOperator::And,
                left: Box::new(ident("a")),
                right: Box::new(Expression::new(
                    ExpressionKind::Binary {
                        operator: BinaryOperator::Lt,
                        left: Box::new(ident("b")),
                        right: Box::new(ident("c")),
                    },
                    SourceSpan::default(),
                )),
            },
            SourceSpan::default(),
        );
        let mut counter = IdentifierCounter(0);
        counter.visit_expression(&expression);
        assert_eq!(counter.0, 3);
    }
}
