//! Runtime values for the assertion interpreter.
//!
//! Arrays and objects are shared, interior-mutable handles so that aliasing
//! behaves like the scripts expect (`const m = metrics[0]; m.x = 1` is
//! visible through `metrics`). Conversions to and from `serde_json::Value`
//! follow `JSON.stringify`/`JSON.parse` semantics.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde_json::{Map, Number, Value as Json};

use crate::ast::FunctionDef;
use crate::interpreter::ScopeRef;

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;
pub type ObjectRef = Rc<RefCell<JsObject>>;

/// Largest integer magnitude that survives the `f64` round trip.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(ArrayRef),
    Object(ObjectRef),
    Function(Rc<Function>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Ordinary,
    Error,
}

pub struct JsObject {
    pub properties: PropertyMap,
    pub class: ObjectClass,
    /// Writes are rejected with a `TypeError`.
    pub frozen: bool,
}

impl JsObject {
    pub fn new(properties: PropertyMap) -> Self {
        Self {
            properties,
            class: ObjectClass::Ordinary,
            frozen: false,
        }
    }
}

/// Insertion-ordered own properties.
#[derive(Clone, Default)]
pub struct PropertyMap {
    entries: Vec<(String, Value)>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(name, _)| name == key)
    }

    /// Overwrites in place, keeping the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(name, _)| *name == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(name, _)| name == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Own keys in enumeration order: integer-like keys ascending, then the
    /// rest in insertion order.
    pub fn keys(&self) -> Vec<String> {
        let mut indices: Vec<(u32, &String)> = self
            .entries
            .iter()
            .filter_map(|(name, _)| array_index(name).map(|index| (index, name)))
            .collect();
        indices.sort_by_key(|(index, _)| *index);
        let mut keys: Vec<String> = indices.into_iter().map(|(_, name)| name.clone()).collect();
        keys.extend(
            self.entries
                .iter()
                .filter(|(name, _)| array_index(name).is_none())
                .map(|(name, _)| name.clone()),
        );
        keys
    }

    /// `(key, value)` pairs in enumeration order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.get(&key).cloned().map(|value| (key, value)))
            .collect()
    }
}

/// Canonical array index (`"0"`, `"17"`), rejecting `"01"` and `"-1"`.
pub fn array_index(key: &str) -> Option<u32> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse::<u32>().ok().filter(|index| *index != u32::MAX)
}

pub enum Function {
    Script(ScriptFunction),
    Native(NativeFunction),
}

pub struct ScriptFunction {
    pub def: Rc<FunctionDef>,
    pub scope: ScopeRef,
    /// Declared or inferred (`const f = () => ...`) name, for stack frames.
    pub name: String,
}

/// Host function dispatched by name; `receiver` is the bound `this` for
/// methods such as `"abc".toUpperCase`.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: &'static str,
    pub receiver: Option<Value>,
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Self::Script(function) => &function.name,
            Self::Native(native) => native
                .name
                .rsplit('.')
                .next()
                .unwrap_or(native.name),
        }
    }
}

impl Value {
    pub fn string(text: impl AsRef<str>) -> Self {
        Self::String(Rc::from(text.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(properties: PropertyMap) -> Self {
        Self::Object(Rc::new(RefCell::new(JsObject::new(properties))))
    }

    pub fn native(name: &'static str) -> Self {
        Self::Function(Rc::new(Function::Native(NativeFunction {
            name,
            receiver: None,
        })))
    }

    pub fn bound_native(name: &'static str, receiver: Value) -> Self {
        Self::Function(Rc::new(Function::Native(NativeFunction {
            name,
            receiver: Some(receiver),
        })))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Object(object) if object.borrow().class == ObjectClass::Error)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(value) => *value,
            Self::Number(value) => *value != 0.0 && !value.is_nan(),
            Self::String(text) => !text.is_empty(),
            Self::Array(_) | Self::Object(_) | Self::Function(_) => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null | Self::Array(_) | Self::Object(_) => "object",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Function(_) => "function",
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Null => 0.0,
            Self::Bool(value) => f64::from(u8::from(*value)),
            Self::Number(value) => *value,
            Self::String(text) => string_to_number(text),
            Self::Array(_) => string_to_number(&self.to_js_string()),
            Self::Object(_) | Self::Function(_) => f64::NAN,
        }
    }

    pub fn to_int32(&self) -> i32 {
        to_int32(self.to_number())
    }

    pub fn to_uint32(&self) -> u32 {
        to_int32(self.to_number()) as u32
    }

    /// `String(value)`.
    pub fn to_js_string(&self) -> String {
        let mut seen = Vec::new();
        self.to_js_string_guarded(&mut seen)
    }

    fn to_js_string_guarded(&self, seen: &mut Vec<*const RefCell<Vec<Value>>>) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(value) => value.to_string(),
            Self::Number(value) => number_to_string(*value),
            Self::String(text) => text.to_string(),
            Self::Array(items) => {
                let pointer = Rc::as_ptr(items);
                if seen.contains(&pointer) {
                    return String::new();
                }
                seen.push(pointer);
                let joined = items
                    .borrow()
                    .iter()
                    .map(|item| {
                        if item.is_nullish() {
                            String::new()
                        } else {
                            item.to_js_string_guarded(seen)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                seen.pop();
                joined
            }
            Self::Object(object) => {
                let object = object.borrow();
                if object.class == ObjectClass::Error {
                    error_summary(&object.properties)
                } else {
                    "[object Object]".to_string()
                }
            }
            Self::Function(function) => match function.as_ref() {
                Function::Script(script) => {
                    format!("function {}() {{ [script code] }}", script.name)
                }
                Function::Native(native) => {
                    format!("function {}() {{ [native code] }}", function_short_name(native.name))
                }
            },
        }
    }

    pub fn to_property_key(&self) -> String {
        match self {
            Self::String(text) => text.to_string(),
            other => other.to_js_string(),
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Self::Number(_), Self::String(_)) | (Self::String(_), Self::Number(_)) => {
                self.to_number() == other.to_number()
            }
            (Self::Bool(_), _) => Value::Number(self.to_number()).loose_equals(other),
            (_, Self::Bool(_)) => self.loose_equals(&Value::Number(other.to_number())),
            (Self::Array(_) | Self::Object(_), Self::Number(_) | Self::String(_)) => {
                Value::string(self.to_js_string()).loose_equals(other)
            }
            (Self::Number(_) | Self::String(_), Self::Array(_) | Self::Object(_)) => {
                self.loose_equals(&Value::string(other.to_js_string()))
            }
            _ => self.strict_equals(other),
        }
    }

    /// SameValueZero, as used by `includes`.
    pub fn same_value_zero(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) if a.is_nan() && b.is_nan() => true,
            _ => self.strict_equals(other),
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(value) => Value::Bool(*value),
            Json::Number(number) => Value::Number(number.as_f64().unwrap_or(f64::NAN)),
            Json::String(text) => Value::string(text),
            Json::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                let mut properties = PropertyMap::new();
                for (key, value) in map {
                    properties.insert(key.clone(), Value::from_json(value));
                }
                Value::object(properties)
            }
        }
    }

    /// `JSON.stringify` view of the value; `None` where the key would be
    /// dropped (`undefined`, functions) or the graph is cyclic.
    pub fn to_json(&self) -> Option<Json> {
        self.try_to_json().ok().flatten()
    }

    pub fn try_to_json(&self) -> Result<Option<Json>, JsonCycleError> {
        let mut stack = Vec::new();
        self.to_json_guarded(&mut stack)
    }

    fn to_json_guarded(&self, stack: &mut Vec<usize>) -> Result<Option<Json>, JsonCycleError> {
        Ok(Some(match self {
            Self::Undefined | Self::Function(_) => return Ok(None),
            Self::Null => Json::Null,
            Self::Bool(value) => Json::Bool(*value),
            Self::Number(value) => number_to_json(*value),
            Self::String(text) => Json::String(text.to_string()),
            Self::Array(items) => {
                let address = Rc::as_ptr(items) as *const () as usize;
                if stack.contains(&address) {
                    return Err(JsonCycleError);
                }
                stack.push(address);
                let mut out = Vec::new();
                for item in items.borrow().iter() {
                    out.push(item.to_json_guarded(stack)?.unwrap_or(Json::Null));
                }
                stack.pop();
                Json::Array(out)
            }
            Self::Object(object) => {
                let address = Rc::as_ptr(object) as *const () as usize;
                if stack.contains(&address) {
                    return Err(JsonCycleError);
                }
                stack.push(address);
                let mut out = Map::new();
                let object = object.borrow();
                if object.class == ObjectClass::Error {
                    stack.pop();
                    return Ok(Some(Json::Object(out)));
                }
                for (key, value) in object.properties.entries() {
                    if let Some(json) = value.to_json_guarded(stack)? {
                        out.insert(key, json);
                    }
                }
                stack.pop();
                Json::Object(out)
            }
        }))
    }
}

/// Cyclic structure reached during JSON conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonCycleError;

impl fmt::Display for JsonCycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Converting circular structure to JSON")
    }
}

impl std::error::Error for JsonCycleError {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(text) => write!(f, "String({text:?})"),
            Self::Function(function) => write!(f, "Function({})", function.name()),
            other => write!(f, "{}({})", other.type_of(), other.to_js_string()),
        }
    }
}

/// `"Name: message"` for error objects.
pub fn error_summary(properties: &PropertyMap) -> String {
    let name = properties
        .get("name")
        .map(Value::to_js_string)
        .unwrap_or_else(|| "Error".to_string());
    let message = properties
        .get("message")
        .map(Value::to_js_string)
        .unwrap_or_default();
    if message.is_empty() {
        name
    } else {
        format!("{name}: {message}")
    }
}

fn function_short_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn number_to_json(value: f64) -> Json {
    if !value.is_finite() {
        return Json::Null;
    }
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        return Json::Number(Number::from(value as i64));
    }
    Number::from_f64(value).map_or(Json::Null, Json::Number)
}

pub fn to_int32(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    let truncated = value.trunc();
    let modulo = truncated.rem_euclid(4_294_967_296.0);
    if modulo >= 2_147_483_648.0 {
        (modulo - 4_294_967_296.0) as i32
    } else {
        modulo as i32
    }
}

/// `Number(text)` for string operands.
pub fn string_to_number(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    let (sign, unsigned) = match trimmed.as_bytes()[0] {
        b'-' => (-1.0, &trimmed[1..]),
        b'+' => (1.0, &trimmed[1..]),
        _ => (1.0, trimmed),
    };
    if unsigned == "Infinity" {
        return sign * f64::INFINITY;
    }
    let radix = match unsigned.get(..2) {
        Some("0x" | "0X") => Some(16),
        Some("0o" | "0O") => Some(8),
        Some("0b" | "0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        // Signed radix literals are NaN.
        if sign < 0.0 || trimmed.starts_with('+') {
            return f64::NAN;
        }
        let digits = &unsigned[2..];
        if digits.is_empty() {
            return f64::NAN;
        }
        let mut total = 0.0f64;
        for ch in digits.chars() {
            let Some(digit) = ch.to_digit(radix) else {
                return f64::NAN;
            };
            total = total * f64::from(radix) + f64::from(digit);
        }
        return total;
    }
    let valid = unsigned
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
        && unsigned.bytes().next().is_some_and(|b| b.is_ascii_digit() || b == b'.');
    if !valid {
        return f64::NAN;
    }
    unsigned.parse::<f64>().map_or(f64::NAN, |value| sign * value)
}

/// `Number.prototype.toString()` with radix 10.
pub fn number_to_string(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let sign = if value < 0.0 { "-" } else { "" };
    // Shortest round-trip digits in scientific form, e.g. `1.2345e3`.
    let scientific = format!("{:e}", value.abs());
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(|ch| *ch != '.').collect();
    let k = digits.len() as i32;
    let n = exponent + 1;

    let body = if k <= n && n <= 21 {
        format!("{digits}{}", "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        format!("{}.{}", &digits[..n as usize], &digits[n as usize..])
    } else if -6 < n && n <= 0 {
        format!("0.{}{digits}", "0".repeat((-n) as usize))
    } else {
        let exponent_sign = if n - 1 < 0 { "-" } else { "+" };
        let fraction = if k > 1 {
            format!("{}.{}", &digits[..1], &digits[1..])
        } else {
            digits.clone()
        };
        format!("{fraction}e{exponent_sign}{}", (n - 1).abs())
    };
    format!("{sign}{body}")
}

/// `Number.prototype.toString(radix)` for radix other than 10.
pub fn number_to_radix_string(value: f64, radix: u32) -> String {
    if radix == 10 || !value.is_finite() {
        return number_to_string(value);
    }
    let negative = value < 0.0;
    let mut integer = value.abs().trunc();
    let mut fraction = value.abs() - integer;
    let mut digits = Vec::new();
    if integer == 0.0 {
        digits.push('0');
    }
    while integer >= 1.0 {
        let digit = (integer % f64::from(radix)) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('0'));
        integer = (integer / f64::from(radix)).trunc();
    }
    digits.reverse();
    let mut out: String = digits.into_iter().collect();
    if fraction > 0.0 {
        out.push('.');
        for _ in 0..20 {
            fraction *= f64::from(radix);
            let digit = fraction.trunc() as u32;
            out.push(std::char::from_digit(digit, radix).unwrap_or('0'));
            fraction -= f64::from(digit);
            if fraction <= 0.0 {
                break;
            }
        }
    }
    if negative {
        format!("-{out}")
    } else {
        out
    }
}
