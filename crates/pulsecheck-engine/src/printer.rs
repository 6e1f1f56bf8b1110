//! Source printer for the assertion syntax tree.
//!
//! Output follows the conventional code-generator layout: spaces around
//! binary operators, single-quoted strings, parentheses only where
//! precedence requires them. Condition text in failure reasons is produced
//! here, so `(dnsTime < 1)` in a script is reported as `dnsTime < 1`.

use crate::ast::{
    Argument, ArrayElement, BinaryOperator, Expression, ExpressionKind, ForEachKind,
    ForEachTarget, ForInit, FunctionBody, FunctionDef, LogicalOperator, MemberProperty,
    ObjectMember, Pattern, Probe, Program, PropertyKey, Statement, StatementKind, UnaryOperator,
    VariableDeclaration,
};
use crate::value::number_to_string;

const INDENT: &str = "    ";

// Expression precedence, loosest first.
const SEQUENCE: u8 = 0;
const ASSIGNMENT: u8 = 1;
const CONDITIONAL: u8 = 2;
const LOGICAL_OR: u8 = 3;
const LOGICAL_AND: u8 = 4;
const UNARY: u8 = 14;
const POSTFIX: u8 = 15;
const CALL: u8 = 16;
const MEMBER: u8 = 18;
const PRIMARY: u8 = 19;

pub fn print_expression(expression: &Expression) -> String {
    Printer::default().expression(expression, SEQUENCE)
}

pub fn print_pattern(pattern: &Pattern) -> String {
    Printer::default().pattern(pattern)
}

/// Print a whole program, one top-level statement per line.
pub fn print_program(program: &Program) -> String {
    let mut printer = Printer::default();
    let mut out = String::new();
    for statement in &program.body {
        out.push_str(&printer.statement(statement));
        out.push('\n');
    }
    out
}

/// JavaScript string literal in single quotes.
pub fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\u{b}' => out.push_str("\\v"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            ch if (ch as u32) < 0x20 => out.push_str(&format!("\\x{:02X}", ch as u32)),
            ch => out.push(ch),
        }
    }
    out.push('\'');
    out
}

fn binary_precedence(operator: BinaryOperator) -> u8 {
    match operator {
        BinaryOperator::BitOr => 5,
        BinaryOperator::BitXor => 6,
        BinaryOperator::BitAnd => 7,
        BinaryOperator::Eq
        | BinaryOperator::NotEq
        | BinaryOperator::StrictEq
        | BinaryOperator::StrictNotEq => 8,
        BinaryOperator::Lt
        | BinaryOperator::LtEq
        | BinaryOperator::Gt
        | BinaryOperator::GtEq
        | BinaryOperator::In
        | BinaryOperator::Instanceof => 9,
        BinaryOperator::Shl | BinaryOperator::Shr | BinaryOperator::UShr => 10,
        BinaryOperator::Add | BinaryOperator::Sub => 11,
        BinaryOperator::Mul | BinaryOperator::Div | BinaryOperator::Rem => 12,
        BinaryOperator::Exp => 13,
    }
}

fn logical_precedence(operator: LogicalOperator) -> u8 {
    match operator {
        LogicalOperator::And => LOGICAL_AND,
        LogicalOperator::Or | LogicalOperator::Coalesce => LOGICAL_OR,
    }
}

fn precedence(expression: &Expression) -> u8 {
    match &expression.kind {
        ExpressionKind::Sequence(_) => SEQUENCE,
        ExpressionKind::Assignment { .. } => ASSIGNMENT,
        ExpressionKind::Function(function) if function.is_arrow => ASSIGNMENT,
        ExpressionKind::Conditional { .. } => CONDITIONAL,
        ExpressionKind::Logical { operator, .. } => logical_precedence(*operator),
        ExpressionKind::Binary { operator, .. } => binary_precedence(*operator),
        ExpressionKind::Unary { .. } => UNARY,
        ExpressionKind::Update { prefix: true, .. } => UNARY,
        ExpressionKind::Update { prefix: false, .. } => POSTFIX,
        ExpressionKind::Call { .. } | ExpressionKind::New { .. } => CALL,
        ExpressionKind::Member { .. } | ExpressionKind::Chain(_) => MEMBER,
        _ => PRIMARY,
    }
}

fn is_identifier_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first == '_' || first == '$' || first.is_alphabetic())
        && chars.all(|ch| ch == '_' || ch == '$' || ch.is_alphanumeric())
}

#[derive(Default)]
struct Printer {
    indent: usize,
}

impl Printer {
    fn pad(&self) -> String {
        INDENT.repeat(self.indent)
    }

    // -- Expressions ---------------------------------------------------------

    fn expression(&mut self, expression: &Expression, required: u8) -> String {
        let own = precedence(expression);
        let text = self.expression_text(expression);
        if own < required {
            format!("({text})")
        } else {
            text
        }
    }

    fn expression_text(&mut self, expression: &Expression) -> String {
        match &expression.kind {
            ExpressionKind::Identifier(name) => name.clone(),
            ExpressionKind::This => "this".to_string(),
            ExpressionKind::Null => "null".to_string(),
            ExpressionKind::Boolean(value) => value.to_string(),
            ExpressionKind::Number(value) => number_to_string(*value),
            ExpressionKind::String(value) => quote_string(value),
            ExpressionKind::Template {
                quasis,
                expressions,
            } => {
                let mut out = String::from("`");
                for (index, quasi) in quasis.iter().enumerate() {
                    out.push_str(
                        &quasi
                            .replace('\\', "\\\\")
                            .replace('`', "\\`")
                            .replace("${", "\\${"),
                    );
                    if let Some(inner) = expressions.get(index) {
                        out.push_str("${");
                        out.push_str(&self.expression(inner, SEQUENCE));
                        out.push('}');
                    }
                }
                out.push('`');
                out
            }
            ExpressionKind::Array(elements) => {
                let items: Vec<String> = elements
                    .iter()
                    .map(|element| match element {
                        ArrayElement::Hole => String::new(),
                        ArrayElement::Item(item) => self.expression(item, ASSIGNMENT),
                        ArrayElement::Spread(item) => {
                            format!("...{}", self.expression(item, ASSIGNMENT))
                        }
                    })
                    .collect();
                let trailing_hole = matches!(elements.last(), Some(ArrayElement::Hole));
                format!(
                    "[{}{}]",
                    items.join(", "),
                    if trailing_hole { "," } else { "" }
                )
            }
            ExpressionKind::Object(members) => {
                if members.is_empty() {
                    return "{}".to_string();
                }
                let items: Vec<String> = members
                    .iter()
                    .map(|member| self.object_member(member))
                    .collect();
                format!("{{ {} }}", items.join(", "))
            }
            ExpressionKind::Function(function) => self.function(function),
            ExpressionKind::Unary { operator, argument } => {
                let inner = self.expression(argument, UNARY);
                match operator {
                    UnaryOperator::Typeof | UnaryOperator::Void | UnaryOperator::Delete => {
                        format!("{} {inner}", operator.as_str())
                    }
                    UnaryOperator::Minus | UnaryOperator::Plus
                        if inner.starts_with(operator.as_str()) =>
                    {
                        format!("{} {inner}", operator.as_str())
                    }
                    _ => format!("{}{inner}", operator.as_str()),
                }
            }
            ExpressionKind::Update {
                operator,
                prefix,
                argument,
            } => {
                let inner = self.expression(argument, POSTFIX);
                if *prefix {
                    format!("{}{inner}", operator.as_str())
                } else {
                    format!("{inner}{}", operator.as_str())
                }
            }
            ExpressionKind::Binary {
                operator,
                left,
                right,
            } => {
                let level = binary_precedence(*operator);
                let (left_level, right_level) = if *operator == BinaryOperator::Exp {
                    (level + 1, level)
                } else {
                    (level, level + 1)
                };
                format!(
                    "{} {} {}",
                    self.expression(left, left_level),
                    operator.as_str(),
                    self.expression(right, right_level)
                )
            }
            ExpressionKind::Logical {
                operator,
                left,
                right,
            } => {
                let level = logical_precedence(*operator);
                format!(
                    "{} {} {}",
                    self.logical_operand(*operator, left, level),
                    operator.as_str(),
                    self.logical_operand(*operator, right, level + 1)
                )
            }
            ExpressionKind::Conditional {
                test,
                consequent,
                alternate,
            } => format!(
                "{} ? {} : {}",
                self.expression(test, LOGICAL_OR),
                self.expression(consequent, ASSIGNMENT),
                self.expression(alternate, ASSIGNMENT)
            ),
            ExpressionKind::Assignment {
                operator,
                target,
                value,
            } => format!(
                "{} {} {}",
                self.pattern(target),
                operator.as_str(),
                self.expression(value, ASSIGNMENT)
            ),
            ExpressionKind::Sequence(expressions) => expressions
                .iter()
                .map(|inner| self.expression(inner, ASSIGNMENT))
                .collect::<Vec<_>>()
                .join(", "),
            ExpressionKind::Member {
                object,
                property,
                optional,
            } => {
                let mut out = self.expression(object, CALL);
                if matches!(object.kind, ExpressionKind::Number(_)) && !out.contains('.') {
                    out = format!("({out})");
                }
                match property {
                    MemberProperty::Named(name) => {
                        out.push_str(if *optional { "?." } else { "." });
                        out.push_str(name);
                    }
                    MemberProperty::Computed(key) => {
                        if *optional {
                            out.push_str("?.");
                        }
                        out.push('[');
                        out.push_str(&self.expression(key, SEQUENCE));
                        out.push(']');
                    }
                }
                out
            }
            ExpressionKind::Call {
                callee,
                arguments,
                optional,
            } => format!(
                "{}{}({})",
                self.expression(callee, CALL),
                if *optional { "?." } else { "" },
                self.arguments(arguments)
            ),
            ExpressionKind::New { callee, arguments } => format!(
                "new {}({})",
                self.expression(callee, MEMBER),
                self.arguments(arguments)
            ),
            ExpressionKind::Chain(inner) => self.expression_text(inner),
        }
    }

    fn arguments(&mut self, arguments: &[Argument]) -> String {
        arguments
            .iter()
            .map(|argument| match argument {
                Argument::Item(item) => self.expression(item, ASSIGNMENT),
                Argument::Spread(item) => format!("...{}", self.expression(item, ASSIGNMENT)),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn property_key(&mut self, key: &PropertyKey) -> String {
        match key {
            PropertyKey::Identifier(name) => name.clone(),
            PropertyKey::String(value) if is_identifier_name(value) => value.clone(),
            PropertyKey::String(value) => quote_string(value),
            PropertyKey::Number(value) => number_to_string(*value),
            PropertyKey::Computed(expression) => {
                format!("[{}]", self.expression(expression, ASSIGNMENT))
            }
        }
    }

    /// `??` cannot be mixed with `&&`/`||` without parentheses.
    fn logical_operand(
        &mut self,
        operator: LogicalOperator,
        operand: &Expression,
        level: u8,
    ) -> String {
        let mixes = match &operand.kind {
            ExpressionKind::Logical { operator: inner, .. } => {
                (operator == LogicalOperator::Coalesce) != (*inner == LogicalOperator::Coalesce)
            }
            _ => false,
        };
        if mixes {
            format!("({})", self.expression(operand, SEQUENCE))
        } else {
            self.expression(operand, level)
        }
    }

    fn object_member(&mut self, member: &ObjectMember) -> String {
        match member {
            ObjectMember::Spread(inner) => format!("...{}", self.expression(inner, ASSIGNMENT)),
            ObjectMember::Property {
                key,
                value,
                shorthand,
            } => {
                if *shorthand {
                    return self.property_key(key);
                }
                if let ExpressionKind::Function(function) = &value.kind {
                    if !function.is_arrow && function.name.is_some() {
                        if let FunctionBody::Block(body) = &function.body {
                            let params = self.params(&function.params);
                            let key = self.property_key(key);
                            return format!("{key}({params}) {}", self.block(body));
                        }
                    }
                }
                format!(
                    "{}: {}",
                    self.property_key(key),
                    self.expression(value, ASSIGNMENT)
                )
            }
        }
    }

    fn params(&mut self, params: &[Pattern]) -> String {
        params
            .iter()
            .map(|param| self.pattern(param))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn function(&mut self, function: &FunctionDef) -> String {
        if function.is_arrow {
            let params = match function.params.as_slice() {
                [Pattern::Identifier(name)] => name.clone(),
                params => format!("({})", self.params(params)),
            };
            let body = match &function.body {
                FunctionBody::Block(body) => self.block(body),
                FunctionBody::Expression(body) => {
                    let text = self.expression(body, ASSIGNMENT);
                    if matches!(body.kind, ExpressionKind::Object(_)) {
                        format!("({text})")
                    } else {
                        text
                    }
                }
            };
            return format!("{params} => {body}");
        }
        let name = function.name.as_deref().unwrap_or_default();
        let separator = if name.is_empty() { "" } else { " " };
        let params = self.params(&function.params);
        let body = match &function.body {
            FunctionBody::Block(body) => self.block(body),
            FunctionBody::Expression(body) => {
                format!("{{ return {}; }}", self.expression(body, SEQUENCE))
            }
        };
        format!("function{separator}{name}({params}) {body}")
    }

    fn pattern(&mut self, pattern: &Pattern) -> String {
        match pattern {
            Pattern::Identifier(name) => name.clone(),
            Pattern::Member(expression) => self.expression(expression, MEMBER),
            Pattern::Object { properties, rest } => {
                let mut items: Vec<String> = properties
                    .iter()
                    .map(|property| {
                        if property.shorthand {
                            self.pattern(&property.value)
                        } else {
                            format!(
                                "{}: {}",
                                self.property_key(&property.key),
                                self.pattern(&property.value)
                            )
                        }
                    })
                    .collect();
                if let Some(rest) = rest {
                    items.push(format!("...{}", self.pattern(rest)));
                }
                if items.is_empty() {
                    "{}".to_string()
                } else {
                    format!("{{ {} }}", items.join(", "))
                }
            }
            Pattern::Array(elements) => {
                let items: Vec<String> = elements
                    .iter()
                    .map(|element| match element {
                        Some(element) => self.pattern(element),
                        None => String::new(),
                    })
                    .collect();
                let trailing_hole = matches!(elements.last(), Some(None));
                format!(
                    "[{}{}]",
                    items.join(", "),
                    if trailing_hole { "," } else { "" }
                )
            }
            Pattern::Default { target, default } => format!(
                "{} = {}",
                self.pattern(target),
                self.expression(default, ASSIGNMENT)
            ),
            Pattern::Rest(target) => format!("...{}", self.pattern(target)),
        }
    }

    // -- Statements ----------------------------------------------------------

    fn block(&mut self, statements: &[Statement]) -> String {
        if statements.is_empty() {
            return "{\n".to_string() + &self.pad() + "}";
        }
        self.indent += 1;
        let mut out = String::from("{\n");
        for statement in statements {
            out.push_str(&self.pad());
            out.push_str(&self.statement(statement));
            out.push('\n');
        }
        self.indent -= 1;
        out.push_str(&self.pad());
        out.push('}');
        out
    }

    fn declaration(&mut self, declaration: &VariableDeclaration) -> String {
        let declarators: Vec<String> = declaration
            .declarators
            .iter()
            .map(|declarator| match &declarator.init {
                Some(init) => format!(
                    "{} = {}",
                    self.pattern(&declarator.target),
                    self.expression(init, ASSIGNMENT)
                ),
                None => self.pattern(&declarator.target),
            })
            .collect();
        format!("{} {}", declaration.kind.as_str(), declarators.join(", "))
    }

    fn statement(&mut self, statement: &Statement) -> String {
        match &statement.kind {
            StatementKind::Variable(declaration) => format!("{};", self.declaration(declaration)),
            StatementKind::Function(function) => self.function(function),
            StatementKind::Expression(expression) => {
                let text = self.expression(expression, SEQUENCE);
                if text.starts_with('{') || text.starts_with("function") {
                    format!("({text});")
                } else {
                    format!("{text};")
                }
            }
            StatementKind::If {
                test,
                consequent,
                alternate,
                condition,
            } => {
                let mut out = match condition {
                    Some(tag) => format!("/* @condition line {}: {} */ ", tag.line, tag.text),
                    None => String::new(),
                };
                out.push_str(&format!(
                    "if ({}) {}",
                    self.expression(test, SEQUENCE),
                    self.statement(consequent)
                ));
                if let Some(alternate) = alternate {
                    out.push_str(" else ");
                    out.push_str(&self.statement(alternate));
                }
                out
            }
            StatementKind::Block(statements) => self.block(statements),
            StatementKind::For {
                init,
                test,
                update,
                body,
            } => {
                let init = match init {
                    Some(ForInit::Variable(declaration)) => self.declaration(declaration),
                    Some(ForInit::Expression(expression)) => self.expression(expression, SEQUENCE),
                    None => String::new(),
                };
                let test = test
                    .as_ref()
                    .map(|test| format!(" {}", self.expression(test, SEQUENCE)))
                    .unwrap_or_default();
                let update = update
                    .as_ref()
                    .map(|update| format!(" {}", self.expression(update, SEQUENCE)))
                    .unwrap_or_default();
                format!("for ({init};{test};{update}) {}", self.statement(body))
            }
            StatementKind::ForEach {
                kind,
                left,
                right,
                body,
            } => {
                let left = match left {
                    ForEachTarget::Declaration { kind, pattern } => {
                        format!("{} {}", kind.as_str(), self.pattern(pattern))
                    }
                    ForEachTarget::Pattern(pattern) => self.pattern(pattern),
                };
                let keyword = match kind {
                    ForEachKind::Of => "of",
                    ForEachKind::In => "in",
                };
                format!(
                    "for ({left} {keyword} {}) {}",
                    self.expression(right, ASSIGNMENT),
                    self.statement(body)
                )
            }
            StatementKind::While { test, body } => format!(
                "while ({}) {}",
                self.expression(test, SEQUENCE),
                self.statement(body)
            ),
            StatementKind::DoWhile { body, test } => format!(
                "do {} while ({});",
                self.statement(body),
                self.expression(test, SEQUENCE)
            ),
            StatementKind::Return(ret) => {
                let marker = if ret.splice_diagnostics {
                    "/* +diagnostics */ "
                } else {
                    ""
                };
                match &ret.argument {
                    Some(argument) => {
                        format!("return {marker}{};", self.expression(argument, SEQUENCE))
                    }
                    None => "return;".to_string(),
                }
            }
            StatementKind::Break => "break;".to_string(),
            StatementKind::Continue => "continue;".to_string(),
            StatementKind::Throw(argument) => {
                format!("throw {};", self.expression(argument, SEQUENCE))
            }
            StatementKind::Try {
                block,
                handler,
                finalizer,
            } => {
                let mut out = format!("try {}", self.block(block));
                if let Some(handler) = handler {
                    out.push_str(" catch ");
                    if let Some(param) = &handler.param {
                        out.push_str(&format!("({}) ", self.pattern(param)));
                    }
                    out.push_str(&self.block(&handler.body));
                }
                if let Some(finalizer) = finalizer {
                    out.push_str(" finally ");
                    out.push_str(&self.block(finalizer));
                }
                out
            }
            StatementKind::Switch {
                discriminant,
                cases,
            } => {
                let mut out = format!("switch ({}) {{\n", self.expression(discriminant, SEQUENCE));
                self.indent += 1;
                for case in cases {
                    out.push_str(&self.pad());
                    match &case.test {
                        Some(test) => {
                            out.push_str(&format!("case {}:\n", self.expression(test, SEQUENCE)));
                        }
                        None => out.push_str("default:\n"),
                    }
                    self.indent += 1;
                    for statement in &case.consequent {
                        out.push_str(&self.pad());
                        out.push_str(&self.statement(statement));
                        out.push('\n');
                    }
                    self.indent -= 1;
                }
                self.indent -= 1;
                out.push_str(&self.pad());
                out.push('}');
                out
            }
            StatementKind::Empty => ";".to_string(),
            StatementKind::Probe(probe) => match probe {
                Probe::TraceVariable { name } => format!("/* @trace {name} */"),
                Probe::SuccessTerm { text, line, .. } => {
                    format!("/* @success-term line {line}: {text} */")
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_expression, parse_function_body};

    fn round(source: &str) -> String {
        print_expression(&parse_expression(source, "<test>").expect("parse"))
    }

    #[test]
    fn redundant_parentheses_are_dropped() {
        assert_eq!(round("(dnsTime < 1)"), "dnsTime < 1");
        assert_eq!(round("(a) && ((b))"), "a && b");
    }

    #[test]
    fn required_parentheses_are_kept() {
        assert_eq!(round("(a + b) * c"), "(a + b) * c");
        assert_eq!(round("a - (b - c)"), "a - (b - c)");
        assert_eq!(round("(a || b) && c"), "(a || b) && c");
        assert_eq!(round("(2 ** 3) ** 2"), "(2 ** 3) ** 2");
        assert_eq!(round("2 ** 3 ** 2"), "2 ** 3 ** 2");
    }

    #[test]
    fn operators_are_spaced_and_strings_single_quoted() {
        assert_eq!(
            round("metric.status_code!==200||!ssl"),
            "metric.status_code !== 200 || !ssl"
        );
        assert_eq!(round("name===\"ali\""), "name === 'ali'");
        assert_eq!(round("typeof x==='number'"), "typeof x === 'number'");
    }

    #[test]
    fn member_calls_and_optional_chains_print_compactly() {
        assert_eq!(round("params?.metrics?.[0]"), "params?.metrics?.[0]");
        assert_eq!(round("Number(code) === 200"), "Number(code) === 200");
        assert_eq!(round("list.filter(x => x > 1).length"), "list.filter(x => x > 1).length");
        assert_eq!(round("fn?.(1, ...rest)"), "fn?.(1, ...rest)");
    }

    #[test]
    fn literals_print_in_canonical_form() {
        assert_eq!(round("0x10"), "16");
        assert_eq!(round("1.50"), "1.5");
        assert_eq!(round("[1, , 'a']"), "[1, , 'a']");
        assert_eq!(round("{a: 1, 'b-c': 2, d}"), "{ a: 1, 'b-c': 2, d }");
        assert_eq!(round("`code ${code}`"), "`code ${code}`");
    }

    #[test]
    fn program_printing_indents_nested_blocks() {
        let program = parse_function_body(
            "if (a) { b = 1; } else { for (const x of y) { z(x); } }",
            "<test>",
        )
        .expect("parse");
        let printed = print_program(&program);
        assert_eq!(
            printed,
            "if (a) {\n    b = 1;\n} else {\n    for (const x of y) {\n        z(x);\n    }\n}\n"
        );
    }

    #[test]
    fn string_escapes_are_reencoded() {
        assert_eq!(quote_string("it's\n"), "'it\\'s\\n'");
    }
}
