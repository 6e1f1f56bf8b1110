//! Tree-walking interpreter for instrumented assertion bodies.
//!
//! Name resolution order is: local frames, the per-assertion global frame
//! (`params`, `metrics`, implicit globals), the shared capability context,
//! then host builtins. Probe statements inserted by the instrumentor are
//! executed here as callbacks that fill a [`ProbeLog`].
//!
//! Every statement and every script call costs one step. Exhausting the
//! step budget or the call-depth limit raises an [`Interrupt::Abort`],
//! which `try`/`catch` in the script cannot intercept.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Map, Value as Json};

use crate::ast::{
    Argument, ArrayElement, AssignmentOperator, BinaryOperator, CatchClause, ConditionTag,
    DeclarationKind, Expression, ExpressionKind, ForEachKind, ForEachTarget, ForInit,
    FunctionBody, FunctionDef, LogicalOperator, MemberProperty, ObjectMember, Pattern, Probe,
    Program, PropertyKey, ReturnStatement, Statement, StatementKind, SwitchCase, UnaryOperator,
    UpdateOperator, VariableDeclaration, Visitor, walk_statement,
};
use crate::builtins;
use crate::capability_context::CapabilityContext;
use crate::printer::print_expression;
use crate::sandbox_executor::ConditionRecord;
use crate::value::{
    Function, JsObject, ObjectClass, PropertyMap, ScriptFunction, Value, array_index,
    number_to_string,
};

pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;

/// Longest array the interpreter will grow through index or length writes.
const MAX_ARRAY_LENGTH: usize = 1 << 24;

// ---------------------------------------------------------------------------
// Limits and interrupts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_steps: u64,
    pub max_call_depth: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    StepBudgetExhausted { limit: u64 },
    CallDepthExceeded { limit: usize },
}

impl AbortReason {
    pub fn message(&self) -> String {
        match self {
            Self::StepBudgetExhausted { limit } => {
                format!("Assertion exceeded the step budget of {limit} steps")
            }
            Self::CallDepthExceeded { .. } => "Maximum call stack size exceeded".to_string(),
        }
    }
}

/// Uncatchable termination of the running assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeAbort {
    pub reason: AbortReason,
    pub stack: String,
}

#[derive(Debug)]
pub enum Interrupt {
    /// Script-level exception; catchable.
    Throw(Value),
    /// An optional link saw `null`/`undefined`; caught at the chain boundary.
    ShortCircuit,
    Abort(RuntimeAbort),
}

pub type Eval<T> = Result<T, Interrupt>;

enum Completion {
    Normal,
    Return(Value),
    Break,
    Continue,
}

/// Diagnostics gathered by probe statements during one assertion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeLog {
    pub variable_states: Map<String, Json>,
    pub condition_trace: Vec<ConditionRecord>,
    pub failure_reasons: Vec<String>,
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

pub type ScopeRef = Rc<Scope>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingKind {
    Var,
    Let,
    Const,
    Function,
    Parameter,
    Implicit,
}

impl BindingKind {
    fn is_lexical(self) -> bool {
        matches!(self, Self::Let | Self::Const)
    }
}

impl From<DeclarationKind> for BindingKind {
    fn from(kind: DeclarationKind) -> Self {
        match kind {
            DeclarationKind::Var => Self::Var,
            DeclarationKind::Let => Self::Let,
            DeclarationKind::Const => Self::Const,
        }
    }
}

#[derive(Clone)]
struct Binding {
    value: Value,
    kind: BindingKind,
}

enum AssignOutcome {
    Assigned,
    Constant,
    Missing,
}

pub struct Scope {
    bindings: RefCell<Vec<(String, Binding)>>,
    parent: Option<ScopeRef>,
    /// `Some` on non-arrow function scopes; arrows resolve `this` lexically.
    this: Option<Value>,
}

impl Scope {
    fn new(parent: Option<ScopeRef>, this: Option<Value>) -> ScopeRef {
        Rc::new(Self {
            bindings: RefCell::new(Vec::new()),
            parent,
            this,
        })
    }

    fn local(&self, name: &str) -> Option<Binding> {
        self.bindings
            .borrow()
            .iter()
            .find(|(bound, _)| bound == name)
            .map(|(_, binding)| binding.clone())
    }

    fn declare(&self, name: &str, value: Value, kind: BindingKind) {
        let mut bindings = self.bindings.borrow_mut();
        match bindings.iter_mut().find(|(bound, _)| bound == name) {
            Some((_, binding)) => *binding = Binding { value, kind },
            None => bindings.push((name.to_string(), Binding { value, kind })),
        }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(binding) = scope.local(name) {
                return Some(binding.value);
            }
            current = scope.parent.as_deref();
        }
        None
    }

    fn assign(&self, name: &str, value: Value) -> AssignOutcome {
        let mut current = Some(self);
        while let Some(scope) = current {
            let mut bindings = scope.bindings.borrow_mut();
            if let Some((_, binding)) = bindings.iter_mut().find(|(bound, _)| bound == name) {
                if binding.kind == BindingKind::Const {
                    return AssignOutcome::Constant;
                }
                binding.value = value;
                return AssignOutcome::Assigned;
            }
            drop(bindings);
            current = scope.parent.as_deref();
        }
        AssignOutcome::Missing
    }

    fn this_value(&self) -> Option<Value> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(this) = &scope.this {
                return Some(this.clone());
            }
            current = scope.parent.as_deref();
        }
        None
    }
}

/// Names declared with `var` anywhere in a function body, excluding
/// nested functions.
#[derive(Default)]
struct VarCollector {
    names: Vec<String>,
}

impl VarCollector {
    fn push_all(&mut self, pattern: &Pattern) {
        for name in pattern.bound_names() {
            if !self.names.contains(&name) {
                self.names.push(name);
            }
        }
    }
}

impl Visitor for VarCollector {
    fn visit_statement(&mut self, statement: &Statement) {
        match &statement.kind {
            StatementKind::Variable(declaration) if declaration.kind == DeclarationKind::Var => {
                for declarator in &declaration.declarators {
                    self.push_all(&declarator.target);
                }
            }
            StatementKind::For {
                init: Some(ForInit::Variable(declaration)),
                ..
            } if declaration.kind == DeclarationKind::Var => {
                for declarator in &declaration.declarators {
                    self.push_all(&declarator.target);
                }
            }
            StatementKind::ForEach {
                left:
                    ForEachTarget::Declaration {
                        kind: DeclarationKind::Var,
                        pattern,
                    },
                ..
            } => self.push_all(pattern),
            _ => {}
        }
        walk_statement(self, statement);
    }

    fn visit_expression(&mut self, _expression: &Expression) {}

    fn visit_function(&mut self, _function: &FunctionDef) {}
}

#[derive(Clone, Copy)]
enum BindMode {
    Declare(DeclarationKind),
    Parameter,
    Assign,
}

enum Reference {
    Name(String),
    Property(Value, String),
}

struct CallFrame {
    function: String,
    line: u64,
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

pub struct Interpreter<'ctx> {
    context: &'ctx mut CapabilityContext,
    globals: HashMap<&'static str, Value>,
    global_scope: ScopeRef,
    limits: ExecutionLimits,
    line_offset: u64,
    steps: u64,
    call_stack: Vec<CallFrame>,
    probes: ProbeLog,
}

impl<'ctx> Interpreter<'ctx> {
    /// `line_offset` maps body lines back to the decoded source
    /// (`line = parsed_line + line_offset`).
    pub fn new(
        context: &'ctx mut CapabilityContext,
        limits: ExecutionLimits,
        line_offset: u64,
    ) -> Self {
        Self {
            context,
            globals: builtins::globals().into_iter().collect(),
            global_scope: Scope::new(None, None),
            limits,
            line_offset,
            steps: 0,
            call_stack: Vec::new(),
            probes: ProbeLog::default(),
        }
    }

    /// Bind `name` in the per-assertion global frame.
    pub fn define_global(&mut self, name: &str, value: Value) {
        self.global_scope.declare(name, value, BindingKind::Var);
    }

    /// Run `program` as the body of `main(<parameter>)`.
    pub fn run_main(
        &mut self,
        program: &Program,
        parameter: Option<&str>,
        argument: Value,
    ) -> Eval<Value> {
        let scope = Scope::new(Some(self.global_scope.clone()), None);
        if let Some(parameter) = parameter {
            scope.declare(parameter, argument, BindingKind::Parameter);
        }
        self.hoist_declarations(&program.body, &scope);
        self.call_stack.push(CallFrame {
            function: "main".to_string(),
            line: 1 + self.line_offset,
        });
        let completion = self.exec_statements(&program.body, &scope);
        self.call_stack.pop();
        match completion {
            Ok(Completion::Return(value)) => Ok(value),
            Ok(_) | Err(Interrupt::ShortCircuit) => Ok(Value::Undefined),
            Err(interrupt) => Err(interrupt),
        }
    }

    pub fn probes(&self) -> &ProbeLog {
        &self.probes
    }

    pub fn into_probes(self) -> ProbeLog {
        self.probes
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub(crate) fn context(&self) -> &CapabilityContext {
        &*self.context
    }

    pub(crate) fn context_mut(&mut self) -> &mut CapabilityContext {
        &mut *self.context
    }

    // -- Errors --------------------------------------------------------------

    fn capture_stack(&self, header: &str) -> String {
        let mut stack = header.to_string();
        for frame in self.call_stack.iter().rev() {
            stack.push_str(&format!(
                "\n    at {} (assertion:{})",
                frame.function, frame.line
            ));
        }
        stack
    }

    /// Error object with `name`, `message` and a captured `stack`.
    pub(crate) fn make_error(&self, name: &str, message: &str) -> Value {
        let header = if message.is_empty() {
            name.to_string()
        } else {
            format!("{name}: {message}")
        };
        let mut properties = PropertyMap::new();
        properties.insert("name", Value::string(name));
        properties.insert("message", Value::string(message));
        properties.insert("stack", Value::string(self.capture_stack(&header)));
        Value::Object(Rc::new(RefCell::new(JsObject {
            properties,
            class: ObjectClass::Error,
            frozen: false,
        })))
    }

    pub(crate) fn throw_error(&self, name: &str, message: impl Into<String>) -> Interrupt {
        Interrupt::Throw(self.make_error(name, &message.into()))
    }

    pub(crate) fn type_error(&self, message: impl Into<String>) -> Interrupt {
        self.throw_error("TypeError", message)
    }

    pub(crate) fn range_error(&self, message: impl Into<String>) -> Interrupt {
        self.throw_error("RangeError", message)
    }

    fn reference_error(&self, message: impl Into<String>) -> Interrupt {
        self.throw_error("ReferenceError", message)
    }

    fn abort(&self, reason: AbortReason) -> Interrupt {
        let stack = self.capture_stack(&format!("RangeError: {}", reason.message()));
        Interrupt::Abort(RuntimeAbort { reason, stack })
    }

    fn tick(&mut self) -> Eval<()> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(self.abort(AbortReason::StepBudgetExhausted {
                limit: self.limits.max_steps,
            }));
        }
        Ok(())
    }

    // -- Names ---------------------------------------------------------------

    fn lookup(&self, name: &str, scope: &Scope) -> Option<Value> {
        if let Some(value) = scope.lookup(name) {
            return Some(value);
        }
        if let Some(json) = self.context.get(name) {
            return Some(Value::from_json(json));
        }
        self.globals.get(name).cloned()
    }

    fn resolve(&self, name: &str, scope: &Scope) -> Eval<Value> {
        self.lookup(name, scope)
            .ok_or_else(|| self.reference_error(format!("{name} is not defined")))
    }

    fn assign_name(&mut self, name: &str, value: Value, scope: &Scope) -> Eval<()> {
        match scope.assign(name, value.clone()) {
            AssignOutcome::Assigned => Ok(()),
            AssignOutcome::Constant => Err(self.type_error("Assignment to constant variable.")),
            AssignOutcome::Missing => {
                self.global_scope.declare(name, value, BindingKind::Implicit);
                Ok(())
            }
        }
    }

    /// Read-only object view of the capability context.
    fn context_view(&self) -> Value {
        let view = Value::from_json(&self.context.snapshot());
        if let Value::Object(object) = &view {
            object.borrow_mut().frozen = true;
        }
        view
    }

    fn resolve_this(&self, scope: &Scope) -> Value {
        scope
            .this_value()
            .unwrap_or_else(|| self.context_view())
    }

    fn make_closure(&self, def: &Rc<FunctionDef>, scope: &ScopeRef, inferred: Option<&str>) -> Value {
        let name = def
            .name
            .clone()
            .or_else(|| inferred.map(str::to_string))
            .unwrap_or_else(|| "anonymous".to_string());
        Value::Function(Rc::new(Function::Script(ScriptFunction {
            def: def.clone(),
            scope: scope.clone(),
            name,
        })))
    }

    fn hoist_declarations(&self, statements: &[Statement], scope: &ScopeRef) {
        let mut collector = VarCollector::default();
        collector.visit_block(statements);
        for name in collector.names {
            if scope.local(&name).is_none() {
                scope.declare(&name, Value::Undefined, BindingKind::Var);
            }
        }
        self.hoist_functions(statements, scope);
    }

    fn hoist_functions(&self, statements: &[Statement], scope: &ScopeRef) {
        for statement in statements {
            if let StatementKind::Function(def) = &statement.kind {
                if let Some(name) = &def.name {
                    let closure = self.make_closure(def, scope, None);
                    scope.declare(name, closure, BindingKind::Function);
                }
            }
        }
    }

    // -- Statements ----------------------------------------------------------

    fn exec_statements(&mut self, statements: &[Statement], scope: &ScopeRef) -> Eval<Completion> {
        for statement in statements {
            match self.exec_statement(statement, scope)? {
                Completion::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Completion::Normal)
    }

    fn exec_block(&mut self, statements: &[Statement], scope: &ScopeRef) -> Eval<Completion> {
        let block = Scope::new(Some(scope.clone()), None);
        self.hoist_functions(statements, &block);
        self.exec_statements(statements, &block)
    }

    fn exec_statement(&mut self, statement: &Statement, scope: &ScopeRef) -> Eval<Completion> {
        if let StatementKind::Probe(probe) = &statement.kind {
            self.exec_probe(probe, scope)?;
            return Ok(Completion::Normal);
        }
        self.tick()?;
        let line = statement.line() + self.line_offset;
        if let Some(frame) = self.call_stack.last_mut() {
            frame.line = line;
        }

        match &statement.kind {
            StatementKind::Variable(declaration) => {
                self.exec_declaration(declaration, scope)?;
                Ok(Completion::Normal)
            }
            StatementKind::Function(_) | StatementKind::Empty | StatementKind::Probe(_) => {
                Ok(Completion::Normal)
            }
            StatementKind::Expression(expression) => {
                self.eval(expression, scope)?;
                Ok(Completion::Normal)
            }
            StatementKind::If {
                test,
                consequent,
                alternate,
                condition,
            } => {
                let passed = match condition {
                    Some(tag) => self.eval_traced_condition(tag, test, scope)?,
                    None => self.eval(test, scope)?.truthy(),
                };
                if passed {
                    self.exec_statement(consequent, scope)
                } else if let Some(alternate) = alternate {
                    self.exec_statement(alternate, scope)
                } else {
                    Ok(Completion::Normal)
                }
            }
            StatementKind::Block(statements) => self.exec_block(statements, scope),
            StatementKind::For {
                init,
                test,
                update,
                body,
            } => self.exec_for(init.as_ref(), test.as_ref(), update.as_ref(), body, scope),
            StatementKind::ForEach {
                kind,
                left,
                right,
                body,
            } => self.exec_for_each(*kind, left, right, body, scope),
            StatementKind::While { test, body } => {
                while self.eval(test, scope)?.truthy() {
                    match self.exec_statement(body, scope)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Continue | Completion::Normal => {}
                    }
                    self.tick()?;
                }
                Ok(Completion::Normal)
            }
            StatementKind::DoWhile { body, test } => {
                loop {
                    match self.exec_statement(body, scope)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Continue | Completion::Normal => {}
                    }
                    if !self.eval(test, scope)?.truthy() {
                        break;
                    }
                    self.tick()?;
                }
                Ok(Completion::Normal)
            }
            StatementKind::Return(ret) => self.exec_return(ret, scope),
            StatementKind::Break => Ok(Completion::Break),
            StatementKind::Continue => Ok(Completion::Continue),
            StatementKind::Throw(argument) => {
                let value = self.eval(argument, scope)?;
                Err(Interrupt::Throw(value))
            }
            StatementKind::Try {
                block,
                handler,
                finalizer,
            } => self.exec_try(block, handler.as_ref(), finalizer.as_deref(), scope),
            StatementKind::Switch {
                discriminant,
                cases,
            } => self.exec_switch(discriminant, cases, scope),
        }
    }

    fn exec_declaration(&mut self, declaration: &VariableDeclaration, scope: &ScopeRef) -> Eval<()> {
        for declarator in &declaration.declarators {
            let value = match &declarator.init {
                Some(init) => self.eval_named(init, &declarator.target, scope)?,
                None if declaration.kind == DeclarationKind::Var => continue,
                None => Value::Undefined,
            };
            self.bind_pattern(
                &declarator.target,
                value,
                scope,
                BindMode::Declare(declaration.kind),
            )?;
        }
        Ok(())
    }

    fn exec_return(&mut self, ret: &ReturnStatement, scope: &ScopeRef) -> Eval<Completion> {
        let value = match &ret.argument {
            Some(argument) => self.eval(argument, scope)?,
            None => Value::Undefined,
        };
        if !ret.splice_diagnostics {
            return Ok(Completion::Return(value));
        }
        let Value::Object(object) = &value else {
            return Ok(Completion::Return(value));
        };
        let mut properties = PropertyMap::new();
        properties.insert(
            "variableStates",
            Value::from_json(&Json::Object(self.probes.variable_states.clone())),
        );
        properties.insert(
            "failureReasons",
            Value::array(
                self.probes
                    .failure_reasons
                    .iter()
                    .map(Value::string)
                    .collect(),
            ),
        );
        for (key, field) in object.borrow().properties.entries() {
            properties.insert(key, field);
        }
        Ok(Completion::Return(Value::object(properties)))
    }

    fn exec_for(
        &mut self,
        init: Option<&ForInit>,
        test: Option<&Expression>,
        update: Option<&Expression>,
        body: &Statement,
        scope: &ScopeRef,
    ) -> Eval<Completion> {
        let loop_scope = Scope::new(Some(scope.clone()), None);
        let mut per_iteration = Vec::new();
        match init {
            Some(ForInit::Variable(declaration)) => {
                if declaration.kind != DeclarationKind::Var {
                    for declarator in &declaration.declarators {
                        per_iteration.extend(declarator.target.bound_names());
                    }
                }
                self.exec_declaration(declaration, &loop_scope)?;
            }
            Some(ForInit::Expression(expression)) => {
                self.eval(expression, &loop_scope)?;
            }
            None => {}
        }

        let mut iteration = fork_scope(&loop_scope, &per_iteration, scope);
        loop {
            if let Some(test) = test {
                if !self.eval(test, &iteration)?.truthy() {
                    break;
                }
            }
            match self.exec_statement(body, &iteration)? {
                Completion::Break => break,
                Completion::Return(value) => return Ok(Completion::Return(value)),
                Completion::Continue | Completion::Normal => {}
            }
            iteration = fork_scope(&iteration, &per_iteration, scope);
            if let Some(update) = update {
                self.eval(update, &iteration)?;
            }
            self.tick()?;
        }
        Ok(Completion::Normal)
    }

    fn exec_for_each(
        &mut self,
        kind: ForEachKind,
        left: &ForEachTarget,
        right: &Expression,
        body: &Statement,
        scope: &ScopeRef,
    ) -> Eval<Completion> {
        let source = self.eval(right, scope)?;
        let items = match kind {
            ForEachKind::Of => self.iterate(&source, right)?,
            ForEachKind::In => own_keys(&source).into_iter().map(Value::string).collect(),
        };
        for item in items {
            let iteration = Scope::new(Some(scope.clone()), None);
            match left {
                ForEachTarget::Declaration { kind, pattern } => {
                    self.bind_pattern(pattern, item, &iteration, BindMode::Declare(*kind))?;
                }
                ForEachTarget::Pattern(pattern) => {
                    self.bind_pattern(pattern, item, &iteration, BindMode::Assign)?;
                }
            }
            match self.exec_statement(body, &iteration)? {
                Completion::Break => break,
                Completion::Return(value) => return Ok(Completion::Return(value)),
                Completion::Continue | Completion::Normal => {}
            }
            self.tick()?;
        }
        Ok(Completion::Normal)
    }

    fn exec_try(
        &mut self,
        block: &[Statement],
        handler: Option<&CatchClause>,
        finalizer: Option<&[Statement]>,
        scope: &ScopeRef,
    ) -> Eval<Completion> {
        let result = match (self.exec_block(block, scope), handler) {
            (Err(Interrupt::Throw(thrown)), Some(handler)) => {
                let catch_scope = Scope::new(Some(scope.clone()), None);
                let bound = match &handler.param {
                    Some(param) => self.bind_pattern(
                        param,
                        thrown,
                        &catch_scope,
                        BindMode::Declare(DeclarationKind::Let),
                    ),
                    None => Ok(()),
                };
                bound.and_then(|()| self.exec_block(&handler.body, &catch_scope))
            }
            (result, _) => result,
        };
        if matches!(result, Err(Interrupt::Abort(_))) {
            return result;
        }
        if let Some(finalizer) = finalizer {
            match self.exec_block(finalizer, scope)? {
                Completion::Normal => {}
                other => return Ok(other),
            }
        }
        result
    }

    fn exec_switch(
        &mut self,
        discriminant: &Expression,
        cases: &[SwitchCase],
        scope: &ScopeRef,
    ) -> Eval<Completion> {
        let value = self.eval(discriminant, scope)?;
        let block = Scope::new(Some(scope.clone()), None);
        let mut start = None;
        for (index, case) in cases.iter().enumerate() {
            if let Some(test) = &case.test {
                if self.eval(test, &block)?.strict_equals(&value) {
                    start = Some(index);
                    break;
                }
            }
        }
        let Some(start) = start.or_else(|| cases.iter().position(|case| case.test.is_none()))
        else {
            return Ok(Completion::Normal);
        };
        for case in &cases[start..] {
            match self.exec_statements(&case.consequent, &block)? {
                Completion::Normal => {}
                Completion::Break => return Ok(Completion::Normal),
                other => return Ok(other),
            }
        }
        Ok(Completion::Normal)
    }

    // -- Probes --------------------------------------------------------------

    fn exec_probe(&mut self, probe: &Probe, scope: &ScopeRef) -> Eval<()> {
        match probe {
            Probe::TraceVariable { name } => {
                if let Some(value) = self.lookup(name, scope) {
                    match value.to_json() {
                        Some(json) => {
                            self.probes.variable_states.insert(name.clone(), json);
                        }
                        None => {
                            self.probes.variable_states.shift_remove(name);
                        }
                    }
                }
            }
            Probe::SuccessTerm { text, line, term } => {
                let result = self.guarded_truthiness(term, scope)?;
                self.probes.condition_trace.push(ConditionRecord {
                    condition_text: text.clone(),
                    source_line: *line,
                    result,
                });
                match result {
                    Some(true) => {}
                    Some(false) => self.probes.failure_reasons.push(format!("{text} is false")),
                    None => self
                        .probes
                        .failure_reasons
                        .push(format!("Error evaluating: {text}")),
                }
            }
        }
        Ok(())
    }

    /// Evaluates an instrumented `if` test once, recording its outcome. A
    /// throwing test is recorded without a result and then propagates.
    fn eval_traced_condition(
        &mut self,
        tag: &ConditionTag,
        test: &Expression,
        scope: &ScopeRef,
    ) -> Eval<bool> {
        let (result, outcome) = match self.eval(test, scope) {
            Ok(value) => {
                let truthy = value.truthy();
                (Some(truthy), Ok(truthy))
            }
            Err(Interrupt::Throw(thrown)) => (None, Err(Interrupt::Throw(thrown))),
            Err(other) => return Err(other),
        };
        self.probes.condition_trace.push(ConditionRecord {
            condition_text: tag.text.clone(),
            source_line: tag.line,
            result,
        });
        let ConditionTag { text, line } = tag;
        match result {
            Some(true) => {}
            Some(false) => self
                .probes
                .failure_reasons
                .push(format!("Condition at line {line}: \"{text}\" is false")),
            None => self.probes.failure_reasons.push(format!(
                "Error evaluating condition at line {line}: \"{text}\""
            )),
        }
        outcome
    }

    /// `Some(truthiness)`, or `None` when evaluation threw.
    fn guarded_truthiness(&mut self, expression: &Expression, scope: &ScopeRef) -> Eval<Option<bool>> {
        match self.eval(expression, scope) {
            Ok(value) => Ok(Some(value.truthy())),
            Err(Interrupt::Throw(_)) => Ok(None),
            Err(Interrupt::ShortCircuit) => Ok(Some(false)),
            Err(abort) => Err(abort),
        }
    }

    // -- Patterns ------------------------------------------------------------

    fn bind_pattern(
        &mut self,
        pattern: &Pattern,
        value: Value,
        scope: &ScopeRef,
        mode: BindMode,
    ) -> Eval<()> {
        match pattern {
            Pattern::Identifier(name) => self.bind_name(name, value, scope, mode),
            Pattern::Member(expression) => match &expression.kind {
                ExpressionKind::Member {
                    object, property, ..
                } => {
                    let target = self.eval(object, scope)?;
                    let key = self.member_key(property, scope)?;
                    self.set_property(&target, &key, value)
                }
                _ => Err(self.throw_error("SyntaxError", "Invalid destructuring assignment target")),
            },
            Pattern::Default { target, default } => {
                let value = if matches!(value, Value::Undefined) {
                    self.eval_named(default, target, scope)?
                } else {
                    value
                };
                self.bind_pattern(target, value, scope, mode)
            }
            Pattern::Rest(target) => self.bind_pattern(target, value, scope, mode),
            Pattern::Object { properties, rest } => {
                if value.is_nullish() {
                    let shown = value.to_js_string();
                    return Err(self.type_error(format!(
                        "Cannot destructure '{shown}' as it is {shown}."
                    )));
                }
                let mut used = Vec::with_capacity(properties.len());
                for property in properties {
                    let key = self.property_key(&property.key, scope)?;
                    let field = self.get_property(&value, &key)?;
                    used.push(key);
                    self.bind_pattern(&property.value, field, scope, mode)?;
                }
                if let Some(rest) = rest {
                    let mut remaining = PropertyMap::new();
                    for (key, field) in own_entries(&value) {
                        if !used.contains(&key) {
                            remaining.insert(key, field);
                        }
                    }
                    self.bind_pattern(rest, Value::object(remaining), scope, mode)?;
                }
                Ok(())
            }
            Pattern::Array(elements) => {
                let items = match &value {
                    Value::Array(items) => items.borrow().clone(),
                    Value::String(text) => text.chars().map(|ch| Value::string(ch.to_string())).collect(),
                    other => {
                        return Err(
                            self.type_error(format!("{} is not iterable", other.to_js_string()))
                        );
                    }
                };
                for (index, element) in elements.iter().enumerate() {
                    match element {
                        None => {}
                        Some(Pattern::Rest(target)) => {
                            let rest = items.get(index..).unwrap_or_default().to_vec();
                            self.bind_pattern(target, Value::array(rest), scope, mode)?;
                        }
                        Some(element) => {
                            let item = items.get(index).cloned().unwrap_or(Value::Undefined);
                            self.bind_pattern(element, item, scope, mode)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn bind_name(&mut self, name: &str, value: Value, scope: &ScopeRef, mode: BindMode) -> Eval<()> {
        match mode {
            BindMode::Declare(kind @ (DeclarationKind::Let | DeclarationKind::Const)) => {
                if scope.local(name).is_some_and(|binding| binding.kind.is_lexical()) {
                    return Err(self.throw_error(
                        "SyntaxError",
                        format!("Identifier '{name}' has already been declared"),
                    ));
                }
                scope.declare(name, value, kind.into());
                Ok(())
            }
            BindMode::Declare(DeclarationKind::Var) | BindMode::Assign => {
                self.assign_name(name, value, scope)
            }
            BindMode::Parameter => {
                scope.declare(name, value, BindingKind::Parameter);
                Ok(())
            }
        }
    }

    // -- Expressions ---------------------------------------------------------

    /// Evaluate `expression`, naming anonymous functions after `target`.
    fn eval_named(&mut self, expression: &Expression, target: &Pattern, scope: &ScopeRef) -> Eval<Value> {
        match (&expression.kind, target) {
            (ExpressionKind::Function(def), Pattern::Identifier(name)) => {
                Ok(self.make_closure(def, scope, Some(name)))
            }
            _ => self.eval(expression, scope),
        }
    }

    pub(crate) fn eval(&mut self, expression: &Expression, scope: &ScopeRef) -> Eval<Value> {
        match &expression.kind {
            ExpressionKind::Identifier(name) => self.resolve(name, scope),
            ExpressionKind::This => Ok(self.resolve_this(scope)),
            ExpressionKind::Null => Ok(Value::Null),
            ExpressionKind::Boolean(value) => Ok(Value::Bool(*value)),
            ExpressionKind::Number(value) => Ok(Value::Number(*value)),
            ExpressionKind::String(value) => Ok(Value::string(value)),
            ExpressionKind::Template {
                quasis,
                expressions,
            } => {
                let mut out = String::new();
                for (index, quasi) in quasis.iter().enumerate() {
                    out.push_str(quasi);
                    if let Some(inner) = expressions.get(index) {
                        out.push_str(&self.eval(inner, scope)?.to_js_string());
                    }
                }
                Ok(Value::string(out))
            }
            ExpressionKind::Array(elements) => {
                let mut items = Vec::with_capacity(elements.len());
                for element in elements {
                    match element {
                        ArrayElement::Hole => items.push(Value::Undefined),
                        ArrayElement::Item(item) => items.push(self.eval(item, scope)?),
                        ArrayElement::Spread(item) => {
                            let spread = self.eval(item, scope)?;
                            items.extend(self.iterate(&spread, item)?);
                        }
                    }
                }
                Ok(Value::array(items))
            }
            ExpressionKind::Object(members) => {
                let mut properties = PropertyMap::new();
                for member in members {
                    match member {
                        ObjectMember::Property { key, value, .. } => {
                            let key = self.property_key(key, scope)?;
                            let value = match &value.kind {
                                ExpressionKind::Function(def) => {
                                    self.make_closure(def, scope, Some(&key))
                                }
                                _ => self.eval(value, scope)?,
                            };
                            properties.insert(key, value);
                        }
                        ObjectMember::Spread(inner) => {
                            let spread = self.eval(inner, scope)?;
                            for (key, value) in own_entries(&spread) {
                                properties.insert(key, value);
                            }
                        }
                    }
                }
                Ok(Value::object(properties))
            }
            ExpressionKind::Function(def) => Ok(self.make_closure(def, scope, None)),
            ExpressionKind::Unary { operator, argument } => {
                self.eval_unary(*operator, argument, scope)
            }
            ExpressionKind::Update {
                operator,
                prefix,
                argument,
            } => {
                let reference = self.expression_reference(argument, scope)?;
                let old = self.read_reference(&reference, scope)?.to_number();
                let new = match operator {
                    UpdateOperator::Increment => old + 1.0,
                    UpdateOperator::Decrement => old - 1.0,
                };
                self.write_reference(&reference, Value::Number(new), scope)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            ExpressionKind::Binary {
                operator,
                left,
                right,
            } => {
                let left = self.eval(left, scope)?;
                let right_value = self.eval(right, scope)?;
                self.binary(*operator, &left, &right_value)
            }
            ExpressionKind::Logical {
                operator,
                left,
                right,
            } => {
                let left = self.eval(left, scope)?;
                let take_left = match operator {
                    LogicalOperator::And => !left.truthy(),
                    LogicalOperator::Or => left.truthy(),
                    LogicalOperator::Coalesce => !left.is_nullish(),
                };
                if take_left {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            ExpressionKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(consequent, scope)
                } else {
                    self.eval(alternate, scope)
                }
            }
            ExpressionKind::Assignment {
                operator,
                target,
                value,
            } => self.eval_assignment(*operator, target, value, scope),
            ExpressionKind::Sequence(expressions) => {
                let mut last = Value::Undefined;
                for inner in expressions {
                    last = self.eval(inner, scope)?;
                }
                Ok(last)
            }
            ExpressionKind::Member {
                object,
                property,
                optional,
            } => {
                let target = self.eval(object, scope)?;
                if *optional && target.is_nullish() {
                    return Err(Interrupt::ShortCircuit);
                }
                let key = self.member_key(property, scope)?;
                self.get_property(&target, &key)
            }
            ExpressionKind::Call {
                callee,
                arguments,
                optional,
            } => self.eval_call(callee, arguments, *optional, scope),
            ExpressionKind::New { callee, arguments } => {
                let constructor = self.eval(callee, scope)?;
                let arguments = self.eval_arguments(arguments, scope)?;
                self.construct(&constructor, arguments, callee)
            }
            ExpressionKind::Chain(inner) => match self.eval(inner, scope) {
                Err(Interrupt::ShortCircuit) => Ok(Value::Undefined),
                other => other,
            },
        }
    }

    fn eval_unary(
        &mut self,
        operator: UnaryOperator,
        argument: &Expression,
        scope: &ScopeRef,
    ) -> Eval<Value> {
        match operator {
            UnaryOperator::Typeof => {
                if let ExpressionKind::Identifier(name) = &argument.kind {
                    if self.lookup(name, scope).is_none() {
                        return Ok(Value::string("undefined"));
                    }
                }
                Ok(Value::string(self.eval(argument, scope)?.type_of()))
            }
            UnaryOperator::Delete => {
                if let ExpressionKind::Member {
                    object, property, ..
                } = &argument.kind
                {
                    let target = self.eval(object, scope)?;
                    let key = self.member_key(property, scope)?;
                    match &target {
                        Value::Object(object) => {
                            let mut object = object.borrow_mut();
                            if object.frozen {
                                drop(object);
                                return Err(self.type_error(format!(
                                    "Cannot delete property '{key}' of object"
                                )));
                            }
                            object.properties.remove(&key);
                        }
                        Value::Array(items) => {
                            if let Some(index) = array_index(&key) {
                                if let Some(slot) = items.borrow_mut().get_mut(index as usize) {
                                    *slot = Value::Undefined;
                                }
                            }
                        }
                        _ => {}
                    }
                    return Ok(Value::Bool(true));
                }
                self.eval(argument, scope)?;
                Ok(Value::Bool(true))
            }
            UnaryOperator::Not => Ok(Value::Bool(!self.eval(argument, scope)?.truthy())),
            UnaryOperator::Minus => Ok(Value::Number(-self.eval(argument, scope)?.to_number())),
            UnaryOperator::Plus => Ok(Value::Number(self.eval(argument, scope)?.to_number())),
            UnaryOperator::BitNot => Ok(Value::Number(f64::from(
                !self.eval(argument, scope)?.to_int32(),
            ))),
            UnaryOperator::Void => {
                self.eval(argument, scope)?;
                Ok(Value::Undefined)
            }
        }
    }

    fn eval_assignment(
        &mut self,
        operator: AssignmentOperator,
        target: &Pattern,
        value: &Expression,
        scope: &ScopeRef,
    ) -> Eval<Value> {
        match operator {
            AssignmentOperator::Assign => match target {
                Pattern::Identifier(name) => {
                    let value = self.eval_named(value, target, scope)?;
                    self.assign_name(name, value.clone(), scope)?;
                    Ok(value)
                }
                Pattern::Member(_) => {
                    let reference = self.pattern_reference(target, scope)?;
                    let value = self.eval(value, scope)?;
                    self.write_reference(&reference, value.clone(), scope)?;
                    Ok(value)
                }
                pattern => {
                    let value = self.eval(value, scope)?;
                    self.bind_pattern(pattern, value.clone(), scope, BindMode::Assign)?;
                    Ok(value)
                }
            },
            AssignmentOperator::Compound(binary) => {
                let reference = self.pattern_reference(target, scope)?;
                let current = self.read_reference(&reference, scope)?;
                let right = self.eval(value, scope)?;
                let result = self.binary(binary, &current, &right)?;
                self.write_reference(&reference, result.clone(), scope)?;
                Ok(result)
            }
            AssignmentOperator::Logical(logical) => {
                let reference = self.pattern_reference(target, scope)?;
                let current = self.read_reference(&reference, scope)?;
                let assign = match logical {
                    LogicalOperator::And => current.truthy(),
                    LogicalOperator::Or => !current.truthy(),
                    LogicalOperator::Coalesce => current.is_nullish(),
                };
                if !assign {
                    return Ok(current);
                }
                let value = self.eval(value, scope)?;
                self.write_reference(&reference, value.clone(), scope)?;
                Ok(value)
            }
        }
    }

    fn pattern_reference(&mut self, target: &Pattern, scope: &ScopeRef) -> Eval<Reference> {
        match target {
            Pattern::Identifier(name) => Ok(Reference::Name(name.clone())),
            Pattern::Member(expression) => self.expression_reference(expression, scope),
            _ => Err(self.throw_error("SyntaxError", "Invalid left-hand side in assignment")),
        }
    }

    fn expression_reference(&mut self, expression: &Expression, scope: &ScopeRef) -> Eval<Reference> {
        match &expression.kind {
            ExpressionKind::Identifier(name) => Ok(Reference::Name(name.clone())),
            ExpressionKind::Member {
                object, property, ..
            } => {
                let target = self.eval(object, scope)?;
                let key = self.member_key(property, scope)?;
                Ok(Reference::Property(target, key))
            }
            _ => Err(self.throw_error("SyntaxError", "Invalid left-hand side in assignment")),
        }
    }

    fn read_reference(&mut self, reference: &Reference, scope: &ScopeRef) -> Eval<Value> {
        match reference {
            Reference::Name(name) => self.resolve(name, scope),
            Reference::Property(target, key) => self.get_property(target, key),
        }
    }

    fn write_reference(&mut self, reference: &Reference, value: Value, scope: &ScopeRef) -> Eval<()> {
        match reference {
            Reference::Name(name) => self.assign_name(name, value, scope),
            Reference::Property(target, key) => self.set_property(target, key, value),
        }
    }

    fn member_key(&mut self, property: &MemberProperty, scope: &ScopeRef) -> Eval<String> {
        match property {
            MemberProperty::Named(name) => Ok(name.clone()),
            MemberProperty::Computed(expression) => {
                Ok(self.eval(expression, scope)?.to_property_key())
            }
        }
    }

    fn property_key(&mut self, key: &PropertyKey, scope: &ScopeRef) -> Eval<String> {
        match key {
            PropertyKey::Identifier(name) | PropertyKey::String(name) => Ok(name.clone()),
            PropertyKey::Number(value) => Ok(number_to_string(*value)),
            PropertyKey::Computed(expression) => {
                Ok(self.eval(expression, scope)?.to_property_key())
            }
        }
    }

    fn eval_arguments(&mut self, arguments: &[Argument], scope: &ScopeRef) -> Eval<Vec<Value>> {
        let mut values = Vec::with_capacity(arguments.len());
        for argument in arguments {
            match argument {
                Argument::Item(item) => values.push(self.eval(item, scope)?),
                Argument::Spread(item) => {
                    let spread = self.eval(item, scope)?;
                    values.extend(self.iterate(&spread, item)?);
                }
            }
        }
        Ok(values)
    }

    fn eval_call(
        &mut self,
        callee: &Expression,
        arguments: &[Argument],
        optional: bool,
        scope: &ScopeRef,
    ) -> Eval<Value> {
        let (function, this) = match &callee.kind {
            ExpressionKind::Member {
                object,
                property,
                optional: optional_member,
            } => {
                let receiver = self.eval(object, scope)?;
                if *optional_member && receiver.is_nullish() {
                    return Err(Interrupt::ShortCircuit);
                }
                let key = self.member_key(property, scope)?;
                let function = self.get_property(&receiver, &key)?;
                (function, receiver)
            }
            _ => (self.eval(callee, scope)?, Value::Undefined),
        };
        if optional && function.is_nullish() {
            return Err(Interrupt::ShortCircuit);
        }
        let arguments = self.eval_arguments(arguments, scope)?;
        if !matches!(function, Value::Function(_)) {
            return Err(self.type_error(format!("{} is not a function", print_expression(callee))));
        }
        self.call_function(&function, this, arguments)
    }

    /// Invoke a script or host function.
    pub(crate) fn call_function(&mut self, function: &Value, this: Value, arguments: Vec<Value>) -> Eval<Value> {
        let Value::Function(function) = function else {
            return Err(self.type_error(format!("{} is not a function", function.to_js_string())));
        };
        match function.as_ref() {
            Function::Script(script) => self.call_script(script, this, arguments),
            Function::Native(native) => builtins::call_native(self, native, this, arguments),
        }
    }

    fn call_script(&mut self, script: &ScriptFunction, this: Value, arguments: Vec<Value>) -> Eval<Value> {
        if self.call_stack.len() >= self.limits.max_call_depth {
            return Err(self.abort(AbortReason::CallDepthExceeded {
                limit: self.limits.max_call_depth,
            }));
        }
        self.tick()?;
        let def = &script.def;
        let this = if def.is_arrow { None } else { Some(this) };
        let scope = Scope::new(Some(script.scope.clone()), this);
        if !def.is_arrow {
            scope.declare(
                "arguments",
                Value::array(arguments.clone()),
                BindingKind::Parameter,
            );
        }
        for (index, param) in def.params.iter().enumerate() {
            match param {
                Pattern::Rest(target) => {
                    let rest = arguments.get(index..).unwrap_or_default().to_vec();
                    self.bind_pattern(target, Value::array(rest), &scope, BindMode::Parameter)?;
                }
                param => {
                    let argument = arguments.get(index).cloned().unwrap_or(Value::Undefined);
                    self.bind_pattern(param, argument, &scope, BindMode::Parameter)?;
                }
            }
        }

        self.call_stack.push(CallFrame {
            function: script.name.clone(),
            line: def.span.start_line + self.line_offset,
        });
        let result = match &def.body {
            FunctionBody::Block(statements) => {
                self.hoist_declarations(statements, &scope);
                self.exec_statements(statements, &scope)
                    .map(|completion| match completion {
                        Completion::Return(value) => value,
                        _ => Value::Undefined,
                    })
            }
            FunctionBody::Expression(body) => self.eval(body, &scope),
        };
        self.call_stack.pop();
        result
    }

    fn construct(&mut self, constructor: &Value, arguments: Vec<Value>, callee: &Expression) -> Eval<Value> {
        if let Value::Function(function) = constructor {
            match function.as_ref() {
                Function::Native(native) => {
                    return builtins::construct_native(self, native, arguments);
                }
                Function::Script(script) if !script.def.is_arrow => {
                    let instance = Value::object(PropertyMap::new());
                    let result = self.call_script(script, instance.clone(), arguments)?;
                    return Ok(match result {
                        Value::Object(_) | Value::Array(_) => result,
                        _ => instance,
                    });
                }
                Function::Script(_) => {}
            }
        }
        Err(self.type_error(format!("{} is not a constructor", print_expression(callee))))
    }

    // -- Properties ----------------------------------------------------------

    pub(crate) fn get_property(&mut self, target: &Value, key: &str) -> Eval<Value> {
        let bound = |name: Option<&'static str>| {
            name.map_or(Value::Undefined, |name| Value::bound_native(name, target.clone()))
        };
        match target {
            Value::Undefined | Value::Null => Err(self.type_error(format!(
                "Cannot read properties of {} (reading '{key}')",
                target.to_js_string()
            ))),
            Value::String(text) => {
                if key == "length" {
                    return Ok(Value::Number(text.chars().count() as f64));
                }
                if let Some(index) = array_index(key) {
                    return Ok(text
                        .chars()
                        .nth(index as usize)
                        .map_or(Value::Undefined, |ch| Value::string(ch.to_string())));
                }
                Ok(bound(builtins::string_method(key)))
            }
            Value::Number(_) => Ok(bound(builtins::number_method(key))),
            Value::Bool(_) => Ok(bound(builtins::boolean_method(key))),
            Value::Array(items) => {
                if key == "length" {
                    return Ok(Value::Number(items.borrow().len() as f64));
                }
                if let Some(index) = array_index(key) {
                    return Ok(items
                        .borrow()
                        .get(index as usize)
                        .cloned()
                        .unwrap_or(Value::Undefined));
                }
                Ok(bound(builtins::array_method(key)))
            }
            Value::Object(object) => {
                if let Some(value) = object.borrow().properties.get(key) {
                    return Ok(value.clone());
                }
                Ok(bound(builtins::object_method(key)))
            }
            Value::Function(function) => Ok(match key {
                "name" => Value::string(function.name()),
                "length" => Value::Number(match function.as_ref() {
                    Function::Script(script) => script.def.params.len() as f64,
                    Function::Native(_) => 1.0,
                }),
                "call" => Value::bound_native("function.call", target.clone()),
                "apply" => Value::bound_native("function.apply", target.clone()),
                _ => match function.as_ref() {
                    Function::Native(native) if native.receiver.is_none() => {
                        builtins::static_member(native.name, key).unwrap_or(Value::Undefined)
                    }
                    _ => Value::Undefined,
                },
            }),
        }
    }

    pub(crate) fn set_property(&mut self, target: &Value, key: &str, value: Value) -> Eval<()> {
        match target {
            Value::Undefined | Value::Null => Err(self.type_error(format!(
                "Cannot set properties of {} (setting '{key}')",
                target.to_js_string()
            ))),
            Value::Array(items) => {
                if key == "length" {
                    let length = value.to_number();
                    if length < 0.0 || length.fract() != 0.0 || length > MAX_ARRAY_LENGTH as f64 {
                        return Err(self.range_error("Invalid array length"));
                    }
                    items.borrow_mut().resize(length as usize, Value::Undefined);
                    return Ok(());
                }
                if let Some(index) = array_index(key) {
                    let index = index as usize;
                    if index >= MAX_ARRAY_LENGTH {
                        return Err(self.range_error("Invalid array length"));
                    }
                    let mut items = items.borrow_mut();
                    if index >= items.len() {
                        items.resize(index + 1, Value::Undefined);
                    }
                    items[index] = value;
                }
                Ok(())
            }
            Value::Object(object) => {
                let mut object = object.borrow_mut();
                if object.frozen {
                    drop(object);
                    return Err(self.type_error(format!(
                        "Cannot assign to read only property '{key}' of object"
                    )));
                }
                object.properties.insert(key, value);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Items produced by spreading or `for...of` over `value`.
    pub(crate) fn iterate(&self, value: &Value, source: &Expression) -> Eval<Vec<Value>> {
        match value {
            Value::Array(items) => Ok(items.borrow().clone()),
            Value::String(text) => Ok(text.chars().map(|ch| Value::string(ch.to_string())).collect()),
            _ => Err(self.type_error(format!("{} is not iterable", print_expression(source)))),
        }
    }

    // -- Operators -----------------------------------------------------------

    fn binary(&self, operator: BinaryOperator, left: &Value, right: &Value) -> Eval<Value> {
        use BinaryOperator as B;
        Ok(match operator {
            B::Add => {
                let left = to_primitive(left);
                let right = to_primitive(right);
                if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) {
                    Value::string(format!("{}{}", left.to_js_string(), right.to_js_string()))
                } else {
                    Value::Number(left.to_number() + right.to_number())
                }
            }
            B::Sub => Value::Number(left.to_number() - right.to_number()),
            B::Mul => Value::Number(left.to_number() * right.to_number()),
            B::Div => Value::Number(left.to_number() / right.to_number()),
            B::Rem => Value::Number(left.to_number() % right.to_number()),
            B::Exp => Value::Number(js_pow(left.to_number(), right.to_number())),
            B::Eq => Value::Bool(left.loose_equals(right)),
            B::NotEq => Value::Bool(!left.loose_equals(right)),
            B::StrictEq => Value::Bool(left.strict_equals(right)),
            B::StrictNotEq => Value::Bool(!left.strict_equals(right)),
            B::Lt => Value::Bool(less_than(left, right) == Some(true)),
            B::Gt => Value::Bool(less_than(right, left) == Some(true)),
            B::LtEq => Value::Bool(less_than(right, left) == Some(false)),
            B::GtEq => Value::Bool(less_than(left, right) == Some(false)),
            B::BitAnd => Value::Number(f64::from(left.to_int32() & right.to_int32())),
            B::BitOr => Value::Number(f64::from(left.to_int32() | right.to_int32())),
            B::BitXor => Value::Number(f64::from(left.to_int32() ^ right.to_int32())),
            B::Shl => Value::Number(f64::from(
                left.to_int32().wrapping_shl(right.to_uint32() & 31),
            )),
            B::Shr => Value::Number(f64::from(left.to_int32() >> (right.to_uint32() & 31))),
            B::UShr => Value::Number(f64::from(left.to_uint32() >> (right.to_uint32() & 31))),
            B::In => {
                let key = left.to_property_key();
                match right {
                    Value::Object(object) => Value::Bool(object.borrow().properties.contains_key(&key)),
                    Value::Array(items) => Value::Bool(
                        key == "length"
                            || array_index(&key)
                                .is_some_and(|index| (index as usize) < items.borrow().len()),
                    ),
                    Value::Function(_) => Value::Bool(matches!(key.as_str(), "name" | "length")),
                    other => {
                        return Err(self.type_error(format!(
                            "Cannot use 'in' operator to search for '{key}' in {}",
                            other.to_js_string()
                        )));
                    }
                }
            }
            B::Instanceof => match right {
                Value::Function(function) => match function.as_ref() {
                    Function::Native(native) => Value::Bool(builtins::instance_of(left, native.name)),
                    Function::Script(_) => Value::Bool(false),
                },
                _ => {
                    return Err(self.type_error("Right-hand side of 'instanceof' is not callable"));
                }
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Copy the per-iteration `let` bindings of a `for` loop into a fresh scope.
fn fork_scope(from: &ScopeRef, names: &[String], parent: &ScopeRef) -> ScopeRef {
    if names.is_empty() {
        return from.clone();
    }
    let fresh = Scope::new(Some(parent.clone()), None);
    for name in names {
        if let Some(binding) = from.local(name) {
            fresh.declare(name, binding.value, binding.kind);
        }
    }
    fresh
}

pub(crate) fn to_primitive(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) | Value::Function(_) => {
            Value::string(value.to_js_string())
        }
        other => other.clone(),
    }
}

/// Abstract relational comparison; `None` when either side is `NaN`.
fn less_than(left: &Value, right: &Value) -> Option<bool> {
    let left = to_primitive(left);
    let right = to_primitive(right);
    if let (Value::String(a), Value::String(b)) = (&left, &right) {
        return Some(a < b);
    }
    let (a, b) = (left.to_number(), right.to_number());
    if a.is_nan() || b.is_nan() {
        None
    } else {
        Some(a < b)
    }
}

pub(crate) fn js_pow(base: f64, exponent: f64) -> f64 {
    if exponent.is_nan() || (base.abs() == 1.0 && exponent.is_infinite()) {
        return f64::NAN;
    }
    base.powf(exponent)
}

/// Own enumerable `(key, value)` pairs, as seen by spread and `Object.entries`.
pub(crate) fn own_entries(value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Object(object) => {
            let object = object.borrow();
            if object.class == ObjectClass::Error {
                Vec::new()
            } else {
                object.properties.entries()
            }
        }
        Value::Array(items) => items
            .borrow()
            .iter()
            .enumerate()
            .map(|(index, item)| (index.to_string(), item.clone()))
            .collect(),
        Value::String(text) => text
            .chars()
            .enumerate()
            .map(|(index, ch)| (index.to_string(), Value::string(ch.to_string())))
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn own_keys(value: &Value) -> Vec<String> {
    own_entries(value).into_iter().map(|(key, _)| key).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_function_body;
    use serde_json::json;

    fn run_with(source: &str, context: &mut CapabilityContext, limits: ExecutionLimits) -> (Eval<Value>, ProbeLog) {
        let program = parse_function_body(source, "<test>").expect("parse");
        let mut interpreter = Interpreter::new(context, limits, 0);
        let metrics = Value::from_json(&json!([{"status_code": "200", "dnsTime": 2}]));
        let mut params = PropertyMap::new();
        params.insert("metrics", metrics.clone());
        let params = Value::object(params);
        interpreter.define_global("metrics", metrics);
        interpreter.define_global("params", params.clone());
        let result = interpreter.run_main(&program, Some("params"), params);
        (result, interpreter.into_probes())
    }

    fn run(source: &str) -> Json {
        let mut context = CapabilityContext::new();
        let (result, _) = run_with(source, &mut context, ExecutionLimits::default());
        match result {
            Ok(value) => value.to_json().unwrap_or(Json::Null),
            Err(interrupt) => panic!("script failed: {interrupt:?}"),
        }
    }

    fn thrown_message(source: &str) -> String {
        let mut context = CapabilityContext::new();
        match run_with(source, &mut context, ExecutionLimits::default()).0 {
            Err(Interrupt::Throw(value)) => {
                let Value::Object(object) = value else {
                    panic!("expected error object");
                };
                let object = object.borrow();
                crate::value::error_summary(&object.properties)
            }
            other => panic!("expected throw, got {other:?}"),
        }
    }

    #[test]
    fn reads_measurement_through_params_and_destructuring() {
        let result = run(
            "const metric = params?.metrics?.[0] || {};\n\
             const { status_code, dnsTime = 0 } = metric;\n\
             return { code: Number(status_code), dns: dnsTime, same: params.metrics === metrics };",
        );
        assert_eq!(result, json!({"code": 200, "dns": 2, "same": true}));
    }

    #[test]
    fn closures_capture_per_iteration_bindings() {
        let result = run(
            "const fns = [];\n\
             for (let i = 0; i < 3; i++) { fns.push(() => i); }\n\
             return fns.map(f => f());",
        );
        assert_eq!(result, json!([0, 1, 2]));
    }

    #[test]
    fn var_and_function_declarations_are_hoisted() {
        let result = run(
            "total = add(1, 2);\n\
             var total;\n\
             function add(a, b) { return a + b; }\n\
             return total;",
        );
        assert_eq!(result, json!(3));
    }

    #[test]
    fn try_catch_finally_and_error_objects() {
        let result = run(
            "let log = [];\n\
             try { null.x; } catch (e) { log.push(e.name, e instanceof TypeError); }\n\
             finally { log.push('done'); }\n\
             try { throw new Error('boom'); } catch ({ message }) { log.push(message); }\n\
             return log;",
        );
        assert_eq!(result, json!(["TypeError", true, "done", "boom"]));
    }

    #[test]
    fn switch_falls_through_until_break() {
        let result = run(
            "const out = [];\n\
             switch (2) { case 1: out.push(1); case 2: out.push(2); case 3: out.push(3); break; default: out.push(0); }\n\
             return out;",
        );
        assert_eq!(result, json!([2, 3]));
    }

    #[test]
    fn loose_and_strict_comparisons_follow_coercion_rules() {
        let result = run(
            "return [ '200' == 200, '200' === 200, null == undefined, 'b' > 'a', 2 < '10', NaN <= NaN, 7 % -3, 2 ** 10, -7 >> 1, -1 >>> 28 ];",
        );
        assert_eq!(result, json!([true, false, true, true, true, false, 1, 1024, -4, 15]));
    }

    #[test]
    fn assignment_to_const_is_a_type_error() {
        assert_eq!(
            thrown_message("const a = 1;\na = 2;"),
            "TypeError: Assignment to constant variable."
        );
    }

    #[test]
    fn unknown_identifier_is_a_reference_error() {
        assert_eq!(thrown_message("return missing + 1;"), "ReferenceError: missing is not defined");
    }

    #[test]
    fn calling_a_non_function_names_the_callee() {
        assert_eq!(
            thrown_message("metrics.nope();"),
            "TypeError: metrics.nope is not a function"
        );
    }

    #[test]
    fn optional_chain_short_circuits_whole_chain() {
        let result = run("const a = null;\nreturn [a?.b.c.d, a?.(), typeof undeclared];");
        assert_eq!(result, json!([null, null, "undefined"]));
    }

    #[test]
    fn this_is_a_read_only_view_of_context_variables() {
        let mut context = CapabilityContext::from_initial_variables(&json!([{"method": "GET"}]))
            .expect("context");
        let (result, _) = run_with(
            "const seen = this.method;\ntry { this.method = 'POST'; } catch (e) { return [seen, e.name]; }",
            &mut context,
            ExecutionLimits::default(),
        );
        let value = result.expect("runs").to_json();
        assert_eq!(value, Some(json!(["GET", "TypeError"])));
    }

    #[test]
    fn step_budget_aborts_and_cannot_be_caught() {
        let mut context = CapabilityContext::new();
        let limits = ExecutionLimits {
            max_steps: 500,
            max_call_depth: 16,
        };
        let (result, _) = run_with("try { while (true) {} } catch (e) { return 1; }", &mut context, limits);
        match result {
            Err(Interrupt::Abort(abort)) => {
                assert_eq!(abort.reason, AbortReason::StepBudgetExhausted { limit: 500 });
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn call_depth_limit_aborts_with_stack() {
        let mut context = CapabilityContext::new();
        let limits = ExecutionLimits {
            max_steps: 10_000,
            max_call_depth: 8,
        };
        let (result, _) = run_with(
            "function dive(n) {\n  return dive(n + 1);\n}\nreturn dive(0);",
            &mut context,
            limits,
        );
        match result {
            Err(Interrupt::Abort(abort)) => {
                assert_eq!(abort.reason, AbortReason::CallDepthExceeded { limit: 8 });
                assert!(abort.stack.starts_with("RangeError: Maximum call stack size exceeded"));
                assert!(abort.stack.contains("at dive (assertion:2)"));
                assert!(abort.stack.ends_with("at main (assertion:4)"));
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn error_stack_lists_frames_innermost_first() {
        let mut context = CapabilityContext::new();
        let (result, _) = run_with(
            "const check = () => {\n  throw new Error('bad');\n};\ncheck();",
            &mut context,
            ExecutionLimits::default(),
        );
        let Err(Interrupt::Throw(Value::Object(error))) = result else {
            panic!("expected thrown error");
        };
        let stack = error.borrow().properties.get("stack").map(Value::to_js_string);
        assert_eq!(
            stack.as_deref(),
            Some("Error: bad\n    at check (assertion:2)\n    at main (assertion:4)")
        );
    }

    #[test]
    fn implicit_globals_do_not_leak_into_context() {
        let mut context = CapabilityContext::new();
        let (result, _) = run_with("leaked = 5;\nreturn leaked;", &mut context, ExecutionLimits::default());
        assert_eq!(result.expect("runs").to_json(), Some(json!(5)));
        assert!(context.is_empty());
    }
}
