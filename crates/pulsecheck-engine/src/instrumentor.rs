//! Static instrumentation of assertion bodies.
//!
//! The instrumentor parses a decoded body and rewrites the tree with
//! [`Probe`] statements:
//!
//! - a trace probe after every statement that declares or assigns a bare
//!   name anywhere in its own expressions, or registers one through
//!   `pfAddVariable('<literal>', ...)`;
//! - trace probes at the top of each loop body for loop bindings, and at
//!   the top of each branch for names assigned inside an `if` test;
//! - a [`ConditionTag`] on every `if`, so the interpreter records the test
//!   outcome during its one real evaluation;
//! - one success-term probe per `&&`/`||` operand of any expression bound
//!   to `success`;
//! - a diagnostics splice on the first object-literal `return` of `main`.
//!
//! Probes hold cloned sub-trees, so re-evaluation never goes through
//! source text. Reported lines are decoded-source lines.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ast::{
    Argument, AssignmentOperator, ConditionTag, DeclarationKind, Expression, ExpressionKind,
    ForEachTarget, ForInit, FunctionBody, FunctionDef, LogicalOperator, Pattern, Probe, Program,
    SourceSpan, Statement, StatementKind, VariableDeclaration, Visitor, VisitorMut,
    walk_expression, walk_function_mut, walk_statement_mut,
};
use crate::decoder::SourceBody;
use crate::parser::{ParseError, parse_function_body};
use crate::printer::{print_expression, print_program};

pub const SOURCE_LABEL: &str = "assertion";

const SUCCESS_BINDING: &str = "success";
const REGISTRATION_FUNCTION: &str = "pfAddVariable";

/// Static record of one instrumented `if`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSite {
    pub condition_text: String,
    pub source_line: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentedBody {
    pub program: Program,
    pub parameter: Option<String>,
    /// `decoded line = body line + line_offset`.
    pub line_offset: u64,
    pub condition_sites: Vec<ConditionSite>,
    pub tracked_names: Vec<String>,
    pub spliced_return: bool,
    /// `sha256:` digest of the printed instrumented program.
    pub fingerprint: String,
}

pub fn instrument(body: &SourceBody) -> Result<InstrumentedBody, ParseError> {
    let line_offset = body.line_offset();
    let mut program = parse_function_body(&body.text, SOURCE_LABEL).map_err(|mut error| {
        error.span = error.span.map(|span| shift_span(span, line_offset));
        error
    })?;

    let mut instrumentor = Instrumentor {
        line_offset,
        function_depth: 0,
        condition_sites: Vec::new(),
        tracked_names: Vec::new(),
        spliced_return: false,
    };
    instrumentor.visit_block_mut(&mut program.body);

    let digest = Sha256::digest(print_program(&program).as_bytes());
    Ok(InstrumentedBody {
        program,
        parameter: body.parameter.clone(),
        line_offset,
        condition_sites: instrumentor.condition_sites,
        tracked_names: instrumentor.tracked_names,
        spliced_return: instrumentor.spliced_return,
        fingerprint: format!("sha256:{}", hex::encode(digest)),
    })
}

fn shift_span(span: SourceSpan, offset: u64) -> SourceSpan {
    SourceSpan {
        start_line: span.start_line + offset,
        end_line: span.end_line + offset,
        ..span
    }
}

/// Where a statement's probes go.
#[derive(Default)]
struct Placement {
    /// After the statement, when it completes normally.
    after: Vec<Statement>,
    /// First in every loop body or `if` branch of the statement.
    entry: Vec<Statement>,
}

struct Instrumentor {
    line_offset: u64,
    function_depth: usize,
    condition_sites: Vec<ConditionSite>,
    tracked_names: Vec<String>,
    spliced_return: bool,
}

impl Instrumentor {
    fn track(&mut self, name: &str) -> Statement {
        if !self.tracked_names.iter().any(|tracked| tracked == name) {
            self.tracked_names.push(name.to_string());
        }
        probe(Probe::TraceVariable {
            name: name.to_string(),
        })
    }

    fn track_all(&mut self, names: &[String], out: &mut Vec<Statement>) {
        for name in names {
            out.push(self.track(name));
        }
    }

    fn success_probes(&self, value: &Expression, out: &mut Vec<Statement>) {
        let mut terms = Vec::new();
        success_terms(value, &mut terms);
        for term in terms {
            out.push(probe(Probe::SuccessTerm {
                text: print_expression(term),
                line: term.span.start_line + self.line_offset,
                term: term.clone(),
            }));
        }
    }

    /// Computed before the statement's children are instrumented so probe
    /// sub-trees stay probe-free. Also tags `if` tests and marks the
    /// diagnostics return.
    fn placement_for(&mut self, statement: &mut Statement) -> Placement {
        let mut placement = Placement::default();
        match &mut statement.kind {
            StatementKind::Variable(declaration) => {
                let mut effects = Effects::default();
                let mut names = declaration_effects(declaration, &mut effects);
                for name in effects.names {
                    push_unique(&mut names, name);
                }
                self.track_all(&names, &mut placement.after);
                for declarator in &declaration.declarators {
                    if let (Pattern::Identifier(name), Some(init)) =
                        (&declarator.target, &declarator.init)
                    {
                        if name == SUCCESS_BINDING {
                            self.success_probes(init, &mut placement.after);
                        }
                    }
                }
                for value in &effects.success_values {
                    self.success_probes(value, &mut placement.after);
                }
            }
            StatementKind::Expression(expression) => {
                let effects = Effects::of(expression);
                self.trace_effects(&effects, &mut placement.after);
            }
            StatementKind::If {
                test, condition, ..
            } => {
                let text = print_expression(test);
                let line = test.span.start_line + self.line_offset;
                self.condition_sites.push(ConditionSite {
                    condition_text: text.clone(),
                    source_line: line,
                });
                *condition = Some(ConditionTag { text, line });
                let effects = Effects::of(test);
                self.track_all(&effects.names, &mut placement.entry);
                self.trace_effects(&effects, &mut placement.after);
            }
            StatementKind::For {
                init, test, update, ..
            } => {
                let mut effects = Effects::default();
                let mut lexical = Vec::new();
                match init {
                    Some(ForInit::Variable(declaration)) => {
                        let bound = declaration_effects(declaration, &mut effects);
                        if declaration.kind == DeclarationKind::Var {
                            for name in bound {
                                push_unique(&mut effects.names, name);
                            }
                        } else {
                            lexical = bound;
                        }
                    }
                    Some(ForInit::Expression(expression)) => effects.visit_expression(expression),
                    None => {}
                }
                for expression in [test.as_ref(), update.as_ref()].into_iter().flatten() {
                    effects.visit_expression(expression);
                }
                let mut entry = lexical.clone();
                for name in &effects.names {
                    push_unique(&mut entry, name.clone());
                }
                self.track_all(&entry, &mut placement.entry);
                // Lexical loop bindings are out of scope after the loop.
                effects.names.retain(|name| !lexical.contains(name));
                self.trace_effects(&effects, &mut placement.after);
            }
            StatementKind::ForEach { left, right, .. } => {
                let mut effects = Effects::of(right);
                let entry = match left {
                    ForEachTarget::Declaration { kind, pattern } => {
                        let bound = pattern.bound_names();
                        if *kind == DeclarationKind::Var {
                            for name in &bound {
                                push_unique(&mut effects.names, name.clone());
                            }
                        }
                        bound
                    }
                    ForEachTarget::Pattern(pattern) => {
                        effects.visit_pattern(pattern);
                        let bound = pattern.bound_names();
                        for name in &bound {
                            push_unique(&mut effects.names, name.clone());
                        }
                        bound
                    }
                };
                self.track_all(&entry, &mut placement.entry);
                self.trace_effects(&effects, &mut placement.after);
            }
            StatementKind::While { test, .. } | StatementKind::DoWhile { test, .. } => {
                let effects = Effects::of(test);
                self.track_all(&effects.names, &mut placement.entry);
                self.trace_effects(&effects, &mut placement.after);
            }
            StatementKind::Switch { discriminant, .. } => {
                let effects = Effects::of(discriminant);
                self.trace_effects(&effects, &mut placement.after);
            }
            StatementKind::Return(ret) => {
                let returns_object = matches!(
                    ret.argument.as_ref().map(|argument| &argument.kind),
                    Some(ExpressionKind::Object(_))
                );
                if returns_object && self.function_depth == 0 && !self.spliced_return {
                    ret.splice_diagnostics = true;
                    self.spliced_return = true;
                }
            }
            _ => {}
        }
        placement
    }

    fn trace_effects(&mut self, effects: &Effects, out: &mut Vec<Statement>) {
        self.track_all(&effects.names, out);
        for value in &effects.success_values {
            self.success_probes(value, out);
        }
    }
}

impl VisitorMut for Instrumentor {
    fn visit_block_mut(&mut self, statements: &mut Vec<Statement>) {
        let original = std::mem::take(statements);
        statements.reserve(original.len());
        for mut statement in original {
            let placement = self.placement_for(&mut statement);
            walk_statement_mut(self, &mut statement);
            place_entry(&mut statement, placement.entry);
            statements.push(statement);
            statements.extend(placement.after);
        }
    }

    /// Reached only for single-statement bodies (`if (x) y = 1;`); wraps
    /// the statement in a block when it needs trailing probes.
    fn visit_statement_mut(&mut self, statement: &mut Statement) {
        let placement = self.placement_for(statement);
        walk_statement_mut(self, statement);
        place_entry(statement, placement.entry);
        if placement.after.is_empty() {
            return;
        }
        let span = statement.span;
        let inner = std::mem::replace(statement, Statement::new(StatementKind::Empty, span));
        let mut block = vec![inner];
        block.extend(placement.after);
        *statement = Statement::new(StatementKind::Block(block), span);
    }

    fn visit_function_mut(&mut self, function: &mut FunctionDef) {
        self.function_depth += 1;
        walk_function_mut(self, function);
        self.function_depth -= 1;
    }
}

fn probe(probe: Probe) -> Statement {
    Statement::new(StatementKind::Probe(probe), SourceSpan::default())
}

/// Inserts `probes` at the top of every loop body or `if` branch. Runs after
/// the statement's children are instrumented, so the probes are not.
fn place_entry(statement: &mut Statement, probes: Vec<Statement>) {
    if probes.is_empty() {
        return;
    }
    match &mut statement.kind {
        StatementKind::If {
            consequent,
            alternate,
            ..
        } => {
            if let Some(alternate) = alternate {
                prepend(alternate, probes.clone());
            }
            prepend(consequent, probes);
        }
        StatementKind::For { body, .. }
        | StatementKind::ForEach { body, .. }
        | StatementKind::While { body, .. }
        | StatementKind::DoWhile { body, .. } => prepend(body, probes),
        _ => {}
    }
}

fn prepend(body: &mut Statement, mut probes: Vec<Statement>) {
    if let StatementKind::Block(statements) = &mut body.kind {
        probes.append(statements);
        *statements = probes;
        return;
    }
    let span = body.span;
    let inner = std::mem::replace(body, Statement::new(StatementKind::Empty, span));
    probes.push(inner);
    *body = Statement::new(StatementKind::Block(probes), span);
}

fn push_unique(names: &mut Vec<String>, name: String) {
    if !names.contains(&name) {
        names.push(name);
    }
}

/// Bound names of `declaration`; effects of its initializers land in
/// `effects`.
fn declaration_effects(declaration: &VariableDeclaration, effects: &mut Effects) -> Vec<String> {
    let mut bound = Vec::new();
    for declarator in &declaration.declarators {
        for name in declarator.target.bound_names() {
            push_unique(&mut bound, name);
        }
        effects.visit_pattern(&declarator.target);
        if let Some(init) = &declarator.init {
            effects.visit_expression(init);
        }
    }
    bound
}

/// Names assigned or registered anywhere inside one statement's own
/// expressions. Block-bodied functions are instrumented separately and are
/// not entered; expression-bodied arrows are, minus their parameters.
#[derive(Default)]
struct Effects {
    names: Vec<String>,
    success_values: Vec<Expression>,
    shadowed: Vec<String>,
    arrow_depth: usize,
}

impl Effects {
    fn of(expression: &Expression) -> Self {
        let mut effects = Self::default();
        effects.visit_expression(expression);
        effects
    }

    fn note(&mut self, name: &str) {
        if !self.shadowed.iter().any(|shadowed| shadowed == name) {
            push_unique(&mut self.names, name.to_string());
        }
    }
}

impl Visitor for Effects {
    fn visit_expression(&mut self, expression: &Expression) {
        match &expression.kind {
            ExpressionKind::Assignment {
                operator,
                target,
                value,
            } => {
                for name in target.bound_names() {
                    self.note(&name);
                }
                // Terms inside an arrow reference its parameters, which are
                // out of scope where the probes run.
                if *operator == AssignmentOperator::Assign
                    && self.arrow_depth == 0
                    && matches!(target.as_ref(), Pattern::Identifier(name) if name == SUCCESS_BINDING)
                {
                    self.success_values.push(value.as_ref().clone());
                }
            }
            ExpressionKind::Update { argument, .. } => {
                if let Some(name) = argument.as_identifier() {
                    self.note(name);
                }
            }
            ExpressionKind::Call {
                callee, arguments, ..
            } if callee.as_identifier() == Some(REGISTRATION_FUNCTION) => {
                if let Some(Argument::Item(Expression {
                    kind: ExpressionKind::String(name),
                    ..
                })) = arguments.first()
                {
                    self.note(name);
                }
            }
            _ => {}
        }
        walk_expression(self, expression);
    }

    fn visit_function(&mut self, function: &FunctionDef) {
        let FunctionBody::Expression(body) = &function.body else {
            return;
        };
        let depth = self.shadowed.len();
        for param in &function.params {
            self.shadowed.extend(param.bound_names());
        }
        self.arrow_depth += 1;
        self.visit_expression(body);
        self.arrow_depth -= 1;
        self.shadowed.truncate(depth);
    }
}

/// Operands of `&&`/`||`, flattened left to right. Any other operator,
/// `??` included, is a leaf.
fn success_terms<'a>(expression: &'a Expression, out: &mut Vec<&'a Expression>) {
    match &expression.kind {
        ExpressionKind::Logical {
            operator: LogicalOperator::And | LogicalOperator::Or,
            left,
            right,
        } => {
            success_terms(left, out);
            success_terms(right, out);
        }
        _ => out.push(expression),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::extract_body;
    use crate::parser::ParseErrorCode;

    fn instrument_source(source: &str) -> InstrumentedBody {
        let body = extract_body(source).expect("body");
        instrument(&body).expect("instruments")
    }

    fn probes(statements: &[Statement]) -> Vec<String> {
        statements
            .iter()
            .map(|statement| match &statement.kind {
                StatementKind::Probe(Probe::TraceVariable { name }) => format!("trace {name}"),
                StatementKind::Probe(Probe::SuccessTerm { text, line, .. }) => {
                    format!("term {line} {text}")
                }
                _ => "stmt".to_string(),
            })
            .collect()
    }

    #[test]
    fn success_is_decomposed_at_logical_boundaries() {
        let instrumented = instrument_source(
            "function main(params) {\n\
             const statusCode = 200;\n\
             const dnsTime = 2;\n\
             const success = (statusCode === 200) && (dnsTime < 1 || dnsTime > 5);\n\
             return { success };\n\
             }",
        );
        assert_eq!(
            probes(&instrumented.program.body),
            vec![
                "stmt",
                "trace statusCode",
                "stmt",
                "trace dnsTime",
                "stmt",
                "trace success",
                "term 4 statusCode === 200",
                "term 4 dnsTime < 1",
                "term 4 dnsTime > 5",
                "stmt",
            ]
        );
        assert!(instrumented.spliced_return);
        assert_eq!(
            instrumented.tracked_names,
            vec!["statusCode", "dnsTime", "success"]
        );
    }

    #[test]
    fn nullish_coalescing_is_not_split() {
        let instrumented = instrument_source("function main() {\nsuccess = a ?? (b && c);\n}");
        assert_eq!(
            probes(&instrumented.program.body),
            vec!["stmt", "trace success", "term 2 a ?? (b && c)"]
        );
    }

    fn block(statement: &Statement) -> &[Statement] {
        match &statement.kind {
            StatementKind::Block(statements) => statements,
            other => panic!("expected block, got {other:?}"),
        }
    }

    fn tag(statement: &Statement) -> Option<&ConditionTag> {
        match &statement.kind {
            StatementKind::If { condition, .. } => condition.as_ref(),
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn every_if_in_an_else_chain_is_tagged_in_place() {
        let instrumented = instrument_source(
            "function main() {\n\
             if (a > 1) {\n\
               x = 1;\n\
             } else if (b) y = 2;\n\
             }",
        );
        let body = &instrumented.program.body;
        assert_eq!(probes(body), vec!["stmt"]);
        assert_eq!(
            tag(&body[0]),
            Some(&ConditionTag {
                text: "a > 1".into(),
                line: 2,
            })
        );
        assert_eq!(
            instrumented.condition_sites,
            vec![
                ConditionSite {
                    condition_text: "a > 1".into(),
                    source_line: 2,
                },
                ConditionSite {
                    condition_text: "b".into(),
                    source_line: 4,
                },
            ]
        );
        let StatementKind::If {
            consequent,
            alternate: Some(alternate),
            ..
        } = &body[0].kind
        else {
            panic!("expected if/else");
        };
        assert_eq!(probes(block(consequent)), vec!["stmt", "trace x"]);
        assert_eq!(tag(alternate).map(|tag| tag.line), Some(4));
        let StatementKind::If { consequent, .. } = &alternate.kind else {
            panic!("expected else-if");
        };
        assert_eq!(probes(block(consequent)), vec!["stmt", "trace y"]);
    }

    #[test]
    fn conditions_are_not_cloned_into_probes() {
        let instrumented = instrument_source(
            "function main() {\n\
             if (pfDeleteVariable('tmp') === 'OK') { removed = true; }\n\
             }",
        );
        let printed = print_program(&instrumented.program);
        assert_eq!(printed.matches("pfDeleteVariable").count(), 1, "{printed}");
        assert!(
            printed.contains("/* @condition line 2: pfDeleteVariable('tmp') === 'OK' */ if"),
            "{printed}"
        );
    }

    #[test]
    fn lines_are_mapped_to_decoded_source() {
        let instrumented = instrument_source(
            "// leading comment\n\n/* doc */\nfunction main(params) {\n  if (params.ok) {}\n}",
        );
        assert_eq!(instrumented.line_offset, 3);
        assert_eq!(instrumented.condition_sites[0].source_line, 5);
    }

    #[test]
    fn only_the_first_object_return_in_main_is_spliced() {
        let instrumented = instrument_source(
            "function main() {\n\
             const f = () => { return { inner: true }; };\n\
             if (x) return 1;\n\
             if (y) return { success: false };\n\
             return { success: true };\n\
             }",
        );
        let printed = print_program(&instrumented.program);
        assert_eq!(printed.matches("/* +diagnostics */").count(), 1);
        assert!(
            printed.contains("return /* +diagnostics */ { success: false };"),
            "{printed}"
        );
        assert!(!printed.contains("return /* +diagnostics */ { inner"), "{printed}");
    }

    #[test]
    fn registration_calls_and_destructuring_are_traced() {
        let instrumented = instrument_source(
            "function main() {\n\
             pfAddVariable('token', 'abc');\n\
             const { a, b: [c] } = obj;\n\
             [d, e] = pair;\n\
             counter++;\n\
             }",
        );
        assert_eq!(
            instrumented.tracked_names,
            vec!["token", "a", "c", "d", "e", "counter"]
        );
    }

    #[test]
    fn loop_bindings_are_traced_at_the_top_of_each_body() {
        let instrumented = instrument_source(
            "function main() {\n\
             for (const m of metrics) { total += m.dnsTime; }\n\
             for (let i = 0; i < 3; i++) count = i;\n\
             for (var key in obj) {}\n\
             while ((next = queue.shift())) {}\n\
             }",
        );
        let body = &instrumented.program.body;
        assert_eq!(
            probes(body),
            vec!["stmt", "stmt", "stmt", "trace key", "stmt", "trace next"]
        );
        let loop_body = |statement: &Statement| -> Vec<String> {
            match &statement.kind {
                StatementKind::For { body, .. }
                | StatementKind::ForEach { body, .. }
                | StatementKind::While { body, .. } => probes(block(body)),
                other => panic!("expected loop, got {other:?}"),
            }
        };
        assert_eq!(loop_body(&body[0]), vec!["trace m", "stmt", "trace total"]);
        assert_eq!(loop_body(&body[1]), vec!["trace i", "stmt", "trace count"]);
        assert_eq!(loop_body(&body[2]), vec!["trace key"]);
        assert_eq!(loop_body(&body[4]), vec!["trace next"]);
        assert_eq!(
            instrumented.tracked_names,
            vec!["m", "total", "i", "count", "key", "next"]
        );
    }

    #[test]
    fn assignments_nested_in_expressions_are_traced_after_the_statement() {
        let instrumented = instrument_source(
            "function main() {\n\
             metrics.forEach(m => last = m.dnsTime);\n\
             if ((x = f())) { return x; }\n\
             const ok = pfAddVariable('token', 'abc') === 'OK';\n\
             log(n++, pfAddVariable('other', 1));\n\
             metrics.forEach(m => { seen = m; });\n\
             }",
        );
        let body = &instrumented.program.body;
        assert_eq!(
            probes(body),
            vec![
                "stmt",
                "trace last",
                "stmt",
                "trace x",
                "stmt",
                "trace ok",
                "trace token",
                "stmt",
                "trace n",
                "trace other",
                "stmt",
            ]
        );
        let StatementKind::If { consequent, .. } = &body[2].kind else {
            panic!("expected if");
        };
        assert_eq!(probes(block(consequent)), vec!["trace x", "stmt"]);
        assert!(!instrumented.tracked_names.contains(&"m".to_string()));
        assert!(instrumented.tracked_names.contains(&"seen".to_string()));
    }

    #[test]
    fn success_assigned_inside_an_arrow_gets_no_terms() {
        let instrumented = instrument_source(
            "function main() {\n\
             metrics.forEach(m => success = m.ok && m.fast);\n\
             }",
        );
        assert_eq!(
            probes(&instrumented.program.body),
            vec!["stmt", "trace success"]
        );
    }

    #[test]
    fn nested_function_bodies_are_instrumented() {
        let instrumented = instrument_source(
            "function main() {\n\
             function check(v) {\n\
               let seen = v;\n\
               if (seen) { return 1; }\n\
             }\n\
             }",
        );
        assert_eq!(instrumented.tracked_names, vec!["seen"]);
        assert_eq!(instrumented.condition_sites.len(), 1);
        assert!(!instrumented.spliced_return);
    }

    #[test]
    fn fingerprint_is_stable_and_content_addressed() {
        let first = instrument_source("function main() { if (a) { b = 1; } }");
        let second = instrument_source("function main() { if (a) { b = 1; } }");
        let third = instrument_source("function main() { if (a) { b = 2; } }");
        assert!(first.fingerprint.starts_with("sha256:"));
        assert_eq!(first.fingerprint.len(), "sha256:".len() + 64);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_ne!(first.fingerprint, third.fingerprint);
    }

    #[test]
    fn parse_errors_report_decoded_lines() {
        let body = extract_body("\n\nfunction main() {\n  const = 1;\n}").expect("body");
        let error = instrument(&body).expect_err("syntax error");
        assert_eq!(error.code, ParseErrorCode::UnexpectedToken);
        assert_eq!(error.line(), Some(4));
    }
}
