//! Host builtins visible to assertion scripts.
//!
//! Every host function is a [`NativeFunction`] dispatched by its dotted
//! name (`"Math.max"`, `"array.map"`, `"pfAddVariable"`). Prototype
//! methods are looked up per receiver type and bound to the receiver at
//! property-access time, so `const f = text.trim; f()` keeps working.

use serde::Serialize;
use serde_json::Value as Json;

use crate::capability_context::CapabilityError;
use crate::interpreter::{Eval, Interpreter, js_pow, own_entries, own_keys};
use crate::value::{
    ArrayRef, NativeFunction, ObjectClass, PropertyMap, Value, error_summary,
    number_to_radix_string, number_to_string,
};

const SCRIPT_LOG_TARGET: &str = "pulsecheck::script";
const CAPABILITY_LOG_TARGET: &str = "pulsecheck::capability";

/// Longest string `repeat`/`padStart`/`padEnd` may produce.
const MAX_STRING_LENGTH: usize = 1 << 24;

const ERROR_CONSTRUCTORS: &[&str] = &[
    "Error",
    "TypeError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
];

const GLOBAL_FUNCTIONS: &[&str] = &[
    "Number",
    "String",
    "Boolean",
    "Object",
    "Array",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "pfAddVariable",
    "pfDeleteVariable",
];

const MATH_FUNCTIONS: &[&str] = &[
    "Math.abs",
    "Math.acos",
    "Math.asin",
    "Math.atan",
    "Math.atan2",
    "Math.cbrt",
    "Math.ceil",
    "Math.cos",
    "Math.exp",
    "Math.floor",
    "Math.hypot",
    "Math.log",
    "Math.log10",
    "Math.log2",
    "Math.max",
    "Math.min",
    "Math.pow",
    "Math.round",
    "Math.sign",
    "Math.sin",
    "Math.sqrt",
    "Math.tan",
    "Math.trunc",
];

const JSON_FUNCTIONS: &[&str] = &["JSON.parse", "JSON.stringify"];

const CONSOLE_FUNCTIONS: &[&str] = &[
    "console.log",
    "console.info",
    "console.warn",
    "console.error",
    "console.debug",
];

const NUMBER_STATICS: &[&str] = &[
    "Number.isFinite",
    "Number.isInteger",
    "Number.isNaN",
    "Number.isSafeInteger",
    "Number.parseFloat",
    "Number.parseInt",
];

const OBJECT_STATICS: &[&str] = &[
    "Object.assign",
    "Object.entries",
    "Object.freeze",
    "Object.fromEntries",
    "Object.isFrozen",
    "Object.keys",
    "Object.values",
];

const ARRAY_STATICS: &[&str] = &["Array.from", "Array.isArray", "Array.of"];

const STRING_STATICS: &[&str] = &["String.fromCharCode"];

const ARRAY_METHODS: &[&str] = &[
    "array.at",
    "array.concat",
    "array.every",
    "array.fill",
    "array.filter",
    "array.find",
    "array.findIndex",
    "array.findLast",
    "array.flat",
    "array.flatMap",
    "array.forEach",
    "array.includes",
    "array.indexOf",
    "array.join",
    "array.lastIndexOf",
    "array.map",
    "array.pop",
    "array.push",
    "array.reduce",
    "array.reverse",
    "array.shift",
    "array.slice",
    "array.some",
    "array.sort",
    "array.splice",
    "array.toString",
    "array.unshift",
];

const STRING_METHODS: &[&str] = &[
    "string.at",
    "string.charAt",
    "string.charCodeAt",
    "string.codePointAt",
    "string.concat",
    "string.endsWith",
    "string.includes",
    "string.indexOf",
    "string.lastIndexOf",
    "string.padEnd",
    "string.padStart",
    "string.repeat",
    "string.replace",
    "string.replaceAll",
    "string.slice",
    "string.split",
    "string.startsWith",
    "string.substr",
    "string.substring",
    "string.toLowerCase",
    "string.toString",
    "string.toUpperCase",
    "string.trim",
    "string.trimEnd",
    "string.trimStart",
    "string.valueOf",
];

const NUMBER_METHODS: &[&str] = &[
    "number.toFixed",
    "number.toPrecision",
    "number.toString",
    "number.valueOf",
];

const BOOLEAN_METHODS: &[&str] = &["boolean.toString", "boolean.valueOf"];

const OBJECT_METHODS: &[&str] = &["object.hasOwnProperty", "object.toString"];

fn find_method(table: &'static [&'static str], key: &str) -> Option<&'static str> {
    table
        .iter()
        .copied()
        .find(|name| name.rsplit('.').next() == Some(key))
}

pub(crate) fn array_method(key: &str) -> Option<&'static str> {
    find_method(ARRAY_METHODS, key)
}

pub(crate) fn string_method(key: &str) -> Option<&'static str> {
    find_method(STRING_METHODS, key)
}

pub(crate) fn number_method(key: &str) -> Option<&'static str> {
    find_method(NUMBER_METHODS, key)
}

pub(crate) fn boolean_method(key: &str) -> Option<&'static str> {
    find_method(BOOLEAN_METHODS, key)
}

pub(crate) fn object_method(key: &str) -> Option<&'static str> {
    find_method(OBJECT_METHODS, key)
}

/// Static members of the global constructors (`Number.isInteger`,
/// `Number.MAX_SAFE_INTEGER`, `Object.keys`, ...).
pub(crate) fn static_member(constructor: &str, key: &str) -> Option<Value> {
    let table = match constructor {
        "Number" => {
            if let Some(constant) = number_constant(key) {
                return Some(Value::Number(constant));
            }
            NUMBER_STATICS
        }
        "Object" => OBJECT_STATICS,
        "Array" => ARRAY_STATICS,
        "String" => STRING_STATICS,
        _ => return None,
    };
    find_method(table, key).map(Value::native)
}

fn number_constant(key: &str) -> Option<f64> {
    Some(match key {
        "MAX_SAFE_INTEGER" => 9_007_199_254_740_991.0,
        "MIN_SAFE_INTEGER" => -9_007_199_254_740_991.0,
        "EPSILON" => f64::EPSILON,
        "MAX_VALUE" => f64::MAX,
        "MIN_VALUE" => 5e-324,
        "POSITIVE_INFINITY" => f64::INFINITY,
        "NEGATIVE_INFINITY" => f64::NEG_INFINITY,
        "NaN" => f64::NAN,
        _ => return None,
    })
}

fn namespace(table: &'static [&'static str]) -> Value {
    let mut properties = PropertyMap::new();
    for name in table.iter().copied() {
        let short = name.rsplit('.').next().unwrap_or(name);
        properties.insert(short, Value::native(name));
    }
    Value::object(properties)
}

/// Global bindings installed into every interpreter.
pub(crate) fn globals() -> Vec<(&'static str, Value)> {
    let mut globals = vec![
        ("undefined", Value::Undefined),
        ("NaN", Value::Number(f64::NAN)),
        ("Infinity", Value::Number(f64::INFINITY)),
    ];

    let math = namespace(MATH_FUNCTIONS);
    if let Value::Object(object) = &math {
        let mut object = object.borrow_mut();
        for (name, constant) in [
            ("PI", std::f64::consts::PI),
            ("E", std::f64::consts::E),
            ("LN2", std::f64::consts::LN_2),
            ("LN10", std::f64::consts::LN_10),
            ("LOG2E", std::f64::consts::LOG2_E),
            ("LOG10E", std::f64::consts::LOG10_E),
            ("SQRT2", std::f64::consts::SQRT_2),
            ("SQRT1_2", std::f64::consts::FRAC_1_SQRT_2),
        ] {
            object.properties.insert(name, Value::Number(constant));
        }
    }
    globals.push(("Math", math));
    globals.push(("JSON", namespace(JSON_FUNCTIONS)));
    globals.push(("console", namespace(CONSOLE_FUNCTIONS)));
    for name in GLOBAL_FUNCTIONS.iter().chain(ERROR_CONSTRUCTORS).copied() {
        globals.push((name, Value::native(name)));
    }
    globals
}

/// `value instanceof <constructor>` for the host constructors.
pub(crate) fn instance_of(value: &Value, constructor: &str) -> bool {
    match constructor {
        "Error" => value.is_error(),
        name if ERROR_CONSTRUCTORS.contains(&name) => match value {
            Value::Object(object) => {
                let object = object.borrow();
                object.class == ObjectClass::Error
                    && object.properties.get("name").and_then(Value::as_str) == Some(name)
            }
            _ => false,
        },
        "Array" => matches!(value, Value::Array(_)),
        "Object" => matches!(
            value,
            Value::Array(_) | Value::Object(_) | Value::Function(_)
        ),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub(crate) fn call_native(
    interp: &mut Interpreter<'_>,
    native: &NativeFunction,
    this: Value,
    args: Vec<Value>,
) -> Eval<Value> {
    let this = native.receiver.clone().unwrap_or(this);
    match native.name.split_once('.') {
        Some(("array", method)) => {
            let Value::Array(items) = &this else {
                return Err(interp.type_error(format!("Array.prototype.{method} called on non-array")));
            };
            call_array_method(interp, method, items, &this, args)
        }
        Some(("string", method)) => {
            let text = this.to_js_string();
            call_string_method(interp, method, &text, args)
        }
        Some(("number", method)) => call_number_method(interp, method, this.to_number(), args),
        Some(("boolean", _)) => Ok(match native.name {
            "boolean.toString" => Value::string(this.to_js_string()),
            _ => Value::Bool(this.truthy()),
        }),
        Some(("object", method)) => call_object_method(method, &this, &args),
        Some(("function", method)) => call_function_method(interp, method, &this, args),
        Some(("Math", method)) => Ok(Value::Number(call_math(method, &args))),
        Some(("JSON", method)) => call_json(interp, method, &args),
        Some(("console", method)) => {
            console(method, &args);
            Ok(Value::Undefined)
        }
        Some(("Number", method)) => call_number_static(method, &args),
        Some(("Object", method)) => call_object_static(interp, method, args),
        Some(("Array", method)) => call_array_static(interp, method, args),
        Some(("String", "fromCharCode")) => Ok(Value::string(
            args.iter()
                .map(|code| {
                    char::from_u32(u32::from(code.to_uint32() as u16)).unwrap_or('\u{FFFD}')
                })
                .collect::<String>(),
        )),
        Some(_) => Err(interp.type_error(format!("{} is not a function", native.name))),
        None => call_global(interp, native.name, args),
    }
}

/// `new <native>(...)`.
pub(crate) fn construct_native(
    interp: &mut Interpreter<'_>,
    native: &NativeFunction,
    args: Vec<Value>,
) -> Eval<Value> {
    match native.name {
        "Error" | "TypeError" | "RangeError" | "ReferenceError" | "SyntaxError" | "Object"
        | "Array" | "Number" | "String" | "Boolean" => {
            call_global(interp, native.name, args)
        }
        name => Err(interp.type_error(format!("{name} is not a constructor"))),
    }
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

/// ToIntegerOrInfinity.
fn to_integer(value: &Value) -> f64 {
    let number = value.to_number();
    if number.is_nan() { 0.0 } else { number.trunc() }
}

/// Search position argument clamped to `0..=len`; `undefined` and `NaN`
/// map to `default`.
fn clamped_position(value: &Value, len: usize, default: usize) -> usize {
    let number = value.to_number();
    if number.is_nan() {
        return default;
    }
    number.trunc().clamp(0.0, len as f64) as usize
}

/// Resolve a possibly negative relative index against `len`, clamped to
/// `0..=len`; `undefined` maps to `default`.
fn relative_index(value: &Value, len: usize, default: usize) -> usize {
    if matches!(value, Value::Undefined) {
        return default;
    }
    let index = to_integer(value);
    let len_f = len as f64;
    let resolved = if index < 0.0 {
        (len_f + index).max(0.0)
    } else {
        index.min(len_f)
    };
    resolved as usize
}

fn callable(interp: &Interpreter<'_>, value: &Value) -> Eval<Value> {
    match value {
        Value::Function(_) => Ok(value.clone()),
        other => Err(interp.type_error(format!("{} is not a function", other.to_js_string()))),
    }
}

fn capability_error(interp: &Interpreter<'_>, error: CapabilityError) -> crate::interpreter::Interrupt {
    interp.throw_error("Error", error.to_string())
}

// ---------------------------------------------------------------------------
// Globals
// ---------------------------------------------------------------------------

fn call_global(interp: &mut Interpreter<'_>, name: &str, args: Vec<Value>) -> Eval<Value> {
    match name {
        "Number" => Ok(Value::Number(
            args.first().map_or(0.0, Value::to_number),
        )),
        "String" => Ok(Value::string(
            args.first().map(Value::to_js_string).unwrap_or_default(),
        )),
        "Boolean" => Ok(Value::Bool(args.first().is_some_and(Value::truthy))),
        "Object" => Ok(match arg(&args, 0) {
            value @ (Value::Object(_) | Value::Array(_) | Value::Function(_)) => value,
            _ => Value::object(PropertyMap::new()),
        }),
        "Array" => match args.as_slice() {
            [Value::Number(length)] => {
                if *length < 0.0 || length.fract() != 0.0 || *length > MAX_STRING_LENGTH as f64 {
                    return Err(interp.range_error("Invalid array length"));
                }
                Ok(Value::array(vec![Value::Undefined; *length as usize]))
            }
            _ => Ok(Value::array(args)),
        },
        "parseInt" => Ok(Value::Number(parse_int(
            &arg(&args, 0).to_js_string(),
            &arg(&args, 1),
        ))),
        "parseFloat" => Ok(Value::Number(parse_float(&arg(&args, 0).to_js_string()))),
        "isNaN" => Ok(Value::Bool(arg(&args, 0).to_number().is_nan())),
        "isFinite" => Ok(Value::Bool(arg(&args, 0).to_number().is_finite())),
        "pfAddVariable" => add_variable(interp, &args),
        "pfDeleteVariable" => delete_variable(interp, &args),
        name if ERROR_CONSTRUCTORS.contains(&name) => {
            let message = match arg(&args, 0) {
                Value::Undefined => String::new(),
                other => other.to_js_string(),
            };
            Ok(interp.make_error(name, &message))
        }
        name => Err(interp.type_error(format!("{name} is not a function"))),
    }
}

fn add_variable(interp: &mut Interpreter<'_>, args: &[Value]) -> Eval<Value> {
    let Value::String(name) = arg(args, 0) else {
        return Err(capability_error(interp, CapabilityError::NameNotString));
    };
    let value = match arg(args, 1).try_to_json() {
        Ok(json) => json.unwrap_or(Json::Null),
        Err(cycle) => return Err(interp.type_error(cycle.to_string())),
    };
    if let Err(error) = interp.context_mut().add_variable(&name, value) {
        tracing::warn!(target: CAPABILITY_LOG_TARGET, variable = %name, %error, "variable rejected");
        return Err(capability_error(interp, error));
    }
    tracing::debug!(target: CAPABILITY_LOG_TARGET, variable = %name, "variable registered");
    Ok(Value::string("OK"))
}

fn delete_variable(interp: &mut Interpreter<'_>, args: &[Value]) -> Eval<Value> {
    let Value::String(name) = arg(args, 0) else {
        return Err(capability_error(interp, CapabilityError::NameNotString));
    };
    if let Err(error) = interp.context_mut().delete_variable(&name) {
        return Err(capability_error(interp, error));
    }
    tracing::debug!(target: CAPABILITY_LOG_TARGET, variable = %name, "variable deleted");
    Ok(Value::string("OK"))
}

fn parse_int(text: &str, radix: &Value) -> f64 {
    let trimmed = text.trim_start();
    let (sign, mut digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (-1.0, &trimmed[1..]),
        Some(b'+') => (1.0, &trimmed[1..]),
        _ => (1.0, trimmed),
    };
    let mut radix = match radix {
        Value::Undefined => 0,
        other => other.to_int32(),
    };
    if radix != 0 && !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let has_hex_prefix = digits.starts_with("0x") || digits.starts_with("0X");
    if (radix == 0 || radix == 16) && has_hex_prefix {
        digits = &digits[2..];
        radix = 16;
    }
    if radix == 0 {
        radix = 10;
    }
    let radix = radix as u32;
    let mut total = 0.0f64;
    let mut seen = false;
    for ch in digits.chars() {
        let Some(digit) = ch.to_digit(radix) else {
            break;
        };
        total = total * f64::from(radix) + f64::from(digit);
        seen = true;
    }
    if seen { sign * total } else { f64::NAN }
}

fn parse_float(text: &str) -> f64 {
    let trimmed = text.trim_start();
    let unsigned = trimmed.trim_start_matches(['+', '-']);
    if unsigned.starts_with("Infinity") {
        return if trimmed.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }
    // Longest prefix that is a decimal literal.
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let mut mantissa_digits = 0;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
        mantissa_digits += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
            mantissa_digits += 1;
        }
    }
    if mantissa_digits == 0 {
        return f64::NAN;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exponent_end = end + 1;
        if exponent_end < bytes.len() && matches!(bytes[exponent_end], b'+' | b'-') {
            exponent_end += 1;
        }
        let digits_start = exponent_end;
        while exponent_end < bytes.len() && bytes[exponent_end].is_ascii_digit() {
            exponent_end += 1;
        }
        if exponent_end > digits_start {
            end = exponent_end;
        }
    }
    trimmed[..end].trim_end_matches('.').parse().unwrap_or(f64::NAN)
}

// ---------------------------------------------------------------------------
// Math, JSON, console
// ---------------------------------------------------------------------------

fn call_math(method: &str, args: &[Value]) -> f64 {
    let x = arg(args, 0).to_number();
    match method {
        "abs" => x.abs(),
        "acos" => x.acos(),
        "asin" => x.asin(),
        "atan" => x.atan(),
        "atan2" => x.atan2(arg(args, 1).to_number()),
        "cbrt" => x.cbrt(),
        "ceil" => x.ceil(),
        "cos" => x.cos(),
        "exp" => x.exp(),
        "floor" => x.floor(),
        "hypot" => args
            .iter()
            .map(Value::to_number)
            .fold(0.0, |acc: f64, value| acc.hypot(value)),
        "log" => x.ln(),
        "log10" => x.log10(),
        "log2" => x.log2(),
        "max" => args.iter().map(Value::to_number).fold(f64::NEG_INFINITY, |acc, value| {
            if acc.is_nan() || value.is_nan() { f64::NAN } else { acc.max(value) }
        }),
        "min" => args.iter().map(Value::to_number).fold(f64::INFINITY, |acc, value| {
            if acc.is_nan() || value.is_nan() { f64::NAN } else { acc.min(value) }
        }),
        "pow" => js_pow(x, arg(args, 1).to_number()),
        // Halves round toward +Infinity.
        "round" => {
            if x.is_finite() && x.fract() != 0.0 {
                (x + 0.5).floor()
            } else {
                x
            }
        }
        "sign" => {
            if x.is_nan() || x == 0.0 {
                x
            } else {
                x.signum()
            }
        }
        "sin" => x.sin(),
        "sqrt" => x.sqrt(),
        "tan" => x.tan(),
        "trunc" => x.trunc(),
        _ => f64::NAN,
    }
}

fn call_json(interp: &mut Interpreter<'_>, method: &str, args: &[Value]) -> Eval<Value> {
    match method {
        "parse" => {
            let text = arg(args, 0).to_js_string();
            serde_json::from_str::<Json>(&text)
                .map(|json| Value::from_json(&json))
                .map_err(|error| interp.throw_error("SyntaxError", format!("{error} in JSON")))
        }
        "stringify" => {
            let json = match arg(args, 0).try_to_json() {
                Ok(Some(json)) => json,
                Ok(None) => return Ok(Value::Undefined),
                Err(cycle) => return Err(interp.type_error(cycle.to_string())),
            };
            let indent = match arg(args, 2) {
                Value::Number(width) if width >= 1.0 => " ".repeat(width.min(10.0) as usize),
                Value::String(text) => text.chars().take(10).collect(),
                _ => String::new(),
            };
            stringify(&json, &indent)
                .map(Value::string)
                .map_err(|error| interp.type_error(error.to_string()))
        }
        _ => Err(interp.type_error(format!("JSON.{method} is not a function"))),
    }
}

fn stringify(json: &Json, indent: &str) -> Result<String, serde_json::Error> {
    if indent.is_empty() {
        return serde_json::to_string(json);
    }
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    json.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn inspect(value: &Value) -> String {
    match value {
        Value::String(text) => text.to_string(),
        Value::Array(_) | Value::Object(_) if !value.is_error() => value
            .to_json()
            .map_or_else(|| value.to_js_string(), |json| json.to_string()),
        other => other.to_js_string(),
    }
}

fn console(method: &str, args: &[Value]) {
    let line = args.iter().map(inspect).collect::<Vec<_>>().join(" ");
    match method {
        "warn" => tracing::warn!(target: SCRIPT_LOG_TARGET, "{line}"),
        "error" => tracing::error!(target: SCRIPT_LOG_TARGET, "{line}"),
        "debug" => tracing::debug!(target: SCRIPT_LOG_TARGET, "{line}"),
        _ => tracing::info!(target: SCRIPT_LOG_TARGET, "{line}"),
    }
}

// ---------------------------------------------------------------------------
// Constructors' static members
// ---------------------------------------------------------------------------

fn call_number_static(method: &str, args: &[Value]) -> Eval<Value> {
    let value = arg(args, 0);
    let number = match value {
        Value::Number(number) => Some(number),
        _ => None,
    };
    Ok(match method {
        "isFinite" => Value::Bool(number.is_some_and(f64::is_finite)),
        "isNaN" => Value::Bool(number.is_some_and(f64::is_nan)),
        "isInteger" => Value::Bool(number.is_some_and(|n| n.is_finite() && n.fract() == 0.0)),
        "isSafeInteger" => Value::Bool(number.is_some_and(|n| {
            n.is_finite() && n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0
        })),
        "parseFloat" => Value::Number(parse_float(&value.to_js_string())),
        "parseInt" => Value::Number(parse_int(&value.to_js_string(), &arg(args, 1))),
        _ => Value::Undefined,
    })
}

fn require_object_coercible(interp: &Interpreter<'_>, value: &Value) -> Eval<()> {
    if value.is_nullish() {
        return Err(interp.type_error("Cannot convert undefined or null to object"));
    }
    Ok(())
}

fn call_object_static(interp: &mut Interpreter<'_>, method: &str, args: Vec<Value>) -> Eval<Value> {
    let target = arg(&args, 0);
    match method {
        "keys" => {
            require_object_coercible(interp, &target)?;
            Ok(Value::array(own_keys(&target).into_iter().map(Value::string).collect()))
        }
        "values" => {
            require_object_coercible(interp, &target)?;
            Ok(Value::array(
                own_entries(&target).into_iter().map(|(_, value)| value).collect(),
            ))
        }
        "entries" => {
            require_object_coercible(interp, &target)?;
            Ok(Value::array(
                own_entries(&target)
                    .into_iter()
                    .map(|(key, value)| Value::array(vec![Value::string(key), value]))
                    .collect(),
            ))
        }
        "assign" => {
            require_object_coercible(interp, &target)?;
            for source in args.iter().skip(1) {
                for (key, value) in own_entries(source) {
                    interp.set_property(&target, &key, value)?;
                }
            }
            Ok(target)
        }
        "freeze" => {
            if let Value::Object(object) = &target {
                object.borrow_mut().frozen = true;
            }
            Ok(target)
        }
        "isFrozen" => Ok(Value::Bool(match &target {
            Value::Object(object) => object.borrow().frozen,
            Value::Array(_) => false,
            _ => true,
        })),
        "fromEntries" => {
            let mut properties = PropertyMap::new();
            let Value::Array(pairs) = &target else {
                return Err(interp.type_error(format!("{} is not iterable", target.to_js_string())));
            };
            let pairs = pairs.borrow().clone();
            for pair in pairs {
                let key = interp.get_property(&pair, "0")?.to_property_key();
                let value = interp.get_property(&pair, "1")?;
                properties.insert(key, value);
            }
            Ok(Value::object(properties))
        }
        _ => Err(interp.type_error(format!("Object.{method} is not a function"))),
    }
}

fn call_array_static(interp: &mut Interpreter<'_>, method: &str, args: Vec<Value>) -> Eval<Value> {
    match method {
        "isArray" => Ok(Value::Bool(matches!(arg(&args, 0), Value::Array(_)))),
        "of" => Ok(Value::array(args)),
        "from" => {
            let source = arg(&args, 0);
            let items = match &source {
                Value::Array(items) => items.borrow().clone(),
                Value::String(text) => text.chars().map(|ch| Value::string(ch.to_string())).collect(),
                Value::Object(_) => {
                    let length = to_integer(&interp.get_property(&source, "length")?).max(0.0);
                    if length > MAX_STRING_LENGTH as f64 {
                        return Err(interp.range_error("Invalid array length"));
                    }
                    let mut items = Vec::with_capacity(length as usize);
                    for index in 0..length as usize {
                        items.push(interp.get_property(&source, &index.to_string())?);
                    }
                    items
                }
                _ => Vec::new(),
            };
            let mapper = arg(&args, 1);
            if matches!(mapper, Value::Undefined) {
                return Ok(Value::array(items));
            }
            let mapper = callable(interp, &mapper)?;
            let mut mapped = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                mapped.push(interp.call_function(
                    &mapper,
                    Value::Undefined,
                    vec![item, Value::Number(index as f64)],
                )?);
            }
            Ok(Value::array(mapped))
        }
        _ => Err(interp.type_error(format!("Array.{method} is not a function"))),
    }
}

// ---------------------------------------------------------------------------
// Prototype methods
// ---------------------------------------------------------------------------

fn call_function_method(
    interp: &mut Interpreter<'_>,
    method: &str,
    function: &Value,
    mut args: Vec<Value>,
) -> Eval<Value> {
    let this = if args.is_empty() {
        Value::Undefined
    } else {
        args.remove(0)
    };
    let forwarded = match method {
        "apply" => match args.first() {
            Some(Value::Array(items)) => items.borrow().clone(),
            Some(Value::Undefined | Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(interp.type_error("CreateListFromArrayLike called on non-object"));
            }
        },
        _ => args,
    };
    interp.call_function(function, this, forwarded)
}

fn call_object_method(method: &str, this: &Value, args: &[Value]) -> Eval<Value> {
    match method {
        "hasOwnProperty" => {
            let key = arg(args, 0).to_property_key();
            Ok(Value::Bool(match this {
                Value::Object(object) => object.borrow().properties.contains_key(&key),
                _ => false,
            }))
        }
        _ => Ok(Value::string(match this {
            Value::Object(object) if object.borrow().class == ObjectClass::Error => {
                error_summary(&object.borrow().properties)
            }
            _ => "[object Object]".to_string(),
        })),
    }
}

fn call_number_method(
    interp: &mut Interpreter<'_>,
    method: &str,
    number: f64,
    args: Vec<Value>,
) -> Eval<Value> {
    match method {
        "toFixed" => {
            let digits = to_integer(&arg(&args, 0));
            if !(0.0..=100.0).contains(&digits) {
                return Err(interp.range_error("toFixed() digits argument must be between 0 and 100"));
            }
            Ok(Value::string(to_fixed(number, digits as usize)))
        }
        "toPrecision" => {
            let precision = match arg(&args, 0) {
                Value::Undefined => return Ok(Value::string(number_to_string(number))),
                other => to_integer(&other),
            };
            if !number.is_finite() {
                return Ok(Value::string(number_to_string(number)));
            }
            if !(1.0..=100.0).contains(&precision) {
                return Err(interp.range_error("toPrecision() argument must be between 1 and 100"));
            }
            Ok(Value::string(to_precision(number, precision as usize)))
        }
        "toString" => {
            let radix = match arg(&args, 0) {
                Value::Undefined => 10.0,
                other => to_integer(&other),
            };
            if !(2.0..=36.0).contains(&radix) {
                return Err(interp.range_error("toString() radix must be between 2 and 36"));
            }
            Ok(Value::string(number_to_radix_string(number, radix as u32)))
        }
        _ => Ok(Value::Number(number)),
    }
}

fn to_fixed(number: f64, digits: usize) -> String {
    if !number.is_finite() || number.abs() >= 1e21 {
        return number_to_string(number);
    }
    let scale = 10f64.powi(digits as i32);
    let scaled = number.abs() * scale;
    // Exact ties round away from zero rather than to even.
    let rounded = if scaled.fract() == 0.5 {
        (scaled.trunc() + 1.0) / scale * number.signum()
    } else {
        number
    };
    let text = format!("{rounded:.digits$}");
    if text.starts_with('-') && text.trim_start_matches(['-', '0', '.']).is_empty() {
        return text.trim_start_matches('-').to_string();
    }
    text
}

/// `number` finite, `precision` in `1..=100`.
fn to_precision(number: f64, precision: usize) -> String {
    if number == 0.0 {
        return match precision {
            1 => "0".to_string(),
            _ => format!("0.{}", "0".repeat(precision - 1)),
        };
    }
    let sign = if number < 0.0 { "-" } else { "" };
    let magnitude = number.abs();
    let estimate = magnitude.log10().floor() as i32;
    let scaled = magnitude / 10f64.powi(estimate - precision as i32 + 1);
    // Exact ties round away from zero rather than to even.
    let (mut digits, mut exponent) = if scaled.fract() == 0.5 {
        (format!("{:.0}", scaled.trunc() + 1.0), estimate)
    } else {
        let formatted = format!("{:.*e}", precision - 1, magnitude);
        let Some((mantissa, exponent)) = formatted.split_once('e') else {
            return number_to_string(number);
        };
        (mantissa.replace('.', ""), exponent.parse().unwrap_or(estimate))
    };
    if digits.len() > precision {
        digits.truncate(precision);
        exponent += 1;
    }

    if exponent < -6 || exponent >= precision as i32 {
        let (lead, rest) = digits.split_at(1);
        let fraction = if rest.is_empty() { String::new() } else { format!(".{rest}") };
        let exponent_sign = if exponent < 0 { '-' } else { '+' };
        return format!("{sign}{lead}{fraction}e{exponent_sign}{}", exponent.abs());
    }
    if exponent >= 0 {
        let (whole, fraction) = digits.split_at(exponent as usize + 1);
        if fraction.is_empty() {
            return format!("{sign}{whole}");
        }
        return format!("{sign}{whole}.{fraction}");
    }
    let zeros = "0".repeat((-exponent - 1) as usize);
    format!("{sign}0.{zeros}{digits}")
}

fn call_string_method(
    interp: &mut Interpreter<'_>,
    method: &str,
    text: &str,
    args: Vec<Value>,
) -> Eval<Value> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let slice = |start: usize, end: usize| -> Value {
        if start >= end {
            Value::string("")
        } else {
            Value::string(chars[start..end].iter().collect::<String>())
        }
    };
    let search = || arg(&args, 0).to_js_string();
    Ok(match method {
        "at" => {
            let index = to_integer(&arg(&args, 0));
            let index = if index < 0.0 { len as f64 + index } else { index };
            if index < 0.0 || index >= len as f64 {
                Value::Undefined
            } else {
                Value::string(chars[index as usize].to_string())
            }
        }
        "charAt" => {
            let index = to_integer(&arg(&args, 0));
            if index < 0.0 || index >= len as f64 {
                Value::string("")
            } else {
                Value::string(chars[index as usize].to_string())
            }
        }
        "charCodeAt" => {
            let index = to_integer(&arg(&args, 0));
            if index < 0.0 || index >= len as f64 {
                Value::Number(f64::NAN)
            } else {
                Value::Number(f64::from(u32::from(chars[index as usize])))
            }
        }
        "codePointAt" => {
            let index = to_integer(&arg(&args, 0));
            if index < 0.0 || index >= len as f64 {
                Value::Undefined
            } else {
                Value::Number(f64::from(u32::from(chars[index as usize])))
            }
        }
        "concat" => {
            let mut out = text.to_string();
            for value in &args {
                out.push_str(&value.to_js_string());
            }
            Value::string(out)
        }
        "endsWith" => Value::Bool(text.ends_with(&search())),
        "startsWith" => {
            let position = clamped_position(&arg(&args, 1), len, 0);
            let rest: String = chars[position.min(len)..].iter().collect();
            Value::Bool(rest.starts_with(&search()))
        }
        "includes" => Value::Bool(text.contains(&search())),
        "indexOf" => {
            let needle: Vec<char> = search().chars().collect();
            let from = clamped_position(&arg(&args, 1), len, 0);
            Value::Number(find_chars(&chars, &needle, from).map_or(-1.0, |index| index as f64))
        }
        "lastIndexOf" => {
            let needle: Vec<char> = search().chars().collect();
            let position = clamped_position(&arg(&args, 1), len, len);
            let found = len.checked_sub(needle.len()).and_then(|last| {
                (0..=position.min(last))
                    .rev()
                    .find(|start| chars[*start..].starts_with(&needle))
            });
            Value::Number(found.map_or(-1.0, |index| index as f64))
        }
        "padStart" | "padEnd" => {
            let target = to_integer(&arg(&args, 0));
            if target > MAX_STRING_LENGTH as f64 {
                return Err(interp.range_error("Invalid string length"));
            }
            let filler: Vec<char> = match arg(&args, 1) {
                Value::Undefined => vec![' '],
                other => other.to_js_string().chars().collect(),
            };
            let target = target.max(0.0) as usize;
            if target <= len || filler.is_empty() {
                return Ok(Value::string(text));
            }
            let pad: String = filler.iter().cycle().take(target - len).collect();
            if method == "padStart" {
                Value::string(format!("{pad}{text}"))
            } else {
                Value::string(format!("{text}{pad}"))
            }
        }
        "repeat" => {
            let count = to_integer(&arg(&args, 0));
            if count < 0.0 || (count * len as f64) > MAX_STRING_LENGTH as f64 {
                return Err(interp.range_error("Invalid string length"));
            }
            Value::string(text.repeat(count as usize))
        }
        "replace" | "replaceAll" => {
            let pattern = search();
            let replacement = arg(&args, 1);
            let all = method == "replaceAll";
            return replace(interp, text, &pattern, &replacement, all).map(Value::string);
        }
        "slice" => {
            let start = relative_index(&arg(&args, 0), len, 0);
            let end = relative_index(&arg(&args, 1), len, len);
            slice(start, end)
        }
        "substring" => {
            let clamp = |value: Value, default: usize| match value {
                Value::Undefined => default,
                other => to_integer(&other).clamp(0.0, len as f64) as usize,
            };
            let start = clamp(arg(&args, 0), 0);
            let end = clamp(arg(&args, 1), len);
            slice(start.min(end), start.max(end))
        }
        "substr" => {
            let start = relative_index(&arg(&args, 0), len, 0);
            let count = match arg(&args, 1) {
                Value::Undefined => len,
                other => to_integer(&other).max(0.0) as usize,
            };
            slice(start, start.saturating_add(count).min(len))
        }
        "split" => {
            let limit = match arg(&args, 1) {
                Value::Undefined => usize::MAX,
                other => other.to_uint32() as usize,
            };
            let parts: Vec<Value> = match arg(&args, 0) {
                Value::Undefined => vec![Value::string(text)],
                separator => {
                    let separator = separator.to_js_string();
                    if separator.is_empty() {
                        chars.iter().map(|ch| Value::string(ch.to_string())).collect()
                    } else {
                        text.split(separator.as_str()).map(Value::string).collect()
                    }
                }
            };
            Value::array(parts.into_iter().take(limit).collect())
        }
        "toLowerCase" => Value::string(text.to_lowercase()),
        "toUpperCase" => Value::string(text.to_uppercase()),
        "trim" => Value::string(text.trim()),
        "trimStart" => Value::string(text.trim_start()),
        "trimEnd" => Value::string(text.trim_end()),
        _ => Value::string(text),
    })
}

fn find_chars(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(haystack.len()));
    }
    (from..haystack.len())
        .find(|start| haystack[*start..].starts_with(needle))
}

fn replace(
    interp: &mut Interpreter<'_>,
    text: &str,
    pattern: &str,
    replacement: &Value,
    all: bool,
) -> Eval<String> {
    let mut out = String::new();
    let mut rest = 0;
    let mut matches: Vec<usize> = if pattern.is_empty() {
        vec![0]
    } else {
        text.match_indices(pattern).map(|(index, _)| index).collect()
    };
    if !all {
        matches.truncate(1);
    }
    for index in matches {
        out.push_str(&text[rest..index]);
        let substitute = match replacement {
            Value::Function(_) => {
                let offset = text[..index].chars().count();
                interp
                    .call_function(
                        replacement,
                        Value::Undefined,
                        vec![
                            Value::string(pattern),
                            Value::Number(offset as f64),
                            Value::string(text),
                        ],
                    )?
                    .to_js_string()
            }
            other => other.to_js_string().replace("$&", pattern),
        };
        out.push_str(&substitute);
        rest = index + pattern.len();
    }
    out.push_str(&text[rest..]);
    Ok(out)
}

fn call_array_method(
    interp: &mut Interpreter<'_>,
    method: &str,
    items: &ArrayRef,
    this: &Value,
    args: Vec<Value>,
) -> Eval<Value> {
    let snapshot = || items.borrow().clone();
    let len = items.borrow().len();
    match method {
        "push" => {
            let mut items = items.borrow_mut();
            items.extend(args);
            Ok(Value::Number(items.len() as f64))
        }
        "pop" => Ok(items.borrow_mut().pop().unwrap_or(Value::Undefined)),
        "shift" => {
            let mut items = items.borrow_mut();
            if items.is_empty() {
                Ok(Value::Undefined)
            } else {
                Ok(items.remove(0))
            }
        }
        "unshift" => {
            let mut items = items.borrow_mut();
            items.splice(0..0, args);
            Ok(Value::Number(items.len() as f64))
        }
        "at" => {
            let index = to_integer(&arg(&args, 0));
            let index = if index < 0.0 { len as f64 + index } else { index };
            if index < 0.0 || index >= len as f64 {
                Ok(Value::Undefined)
            } else {
                Ok(items.borrow()[index as usize].clone())
            }
        }
        "slice" => {
            let start = relative_index(&arg(&args, 0), len, 0);
            let end = relative_index(&arg(&args, 1), len, len);
            let items = items.borrow();
            Ok(Value::array(
                items.get(start..end.max(start)).unwrap_or_default().to_vec(),
            ))
        }
        "splice" => {
            let start = relative_index(&arg(&args, 0), len, 0);
            let delete = match args.len() {
                0 => 0,
                1 => len - start,
                _ => (to_integer(&args[1]).max(0.0) as usize).min(len - start),
            };
            let inserted: Vec<Value> = args.into_iter().skip(2).collect();
            let removed: Vec<Value> = items
                .borrow_mut()
                .splice(start..start + delete, inserted)
                .collect();
            Ok(Value::array(removed))
        }
        "concat" => {
            let mut out = snapshot();
            for value in args {
                match value {
                    Value::Array(other) => out.extend(other.borrow().iter().cloned()),
                    other => out.push(other),
                }
            }
            Ok(Value::array(out))
        }
        "join" => {
            let separator = match arg(&args, 0) {
                Value::Undefined => ",".to_string(),
                other => other.to_js_string(),
            };
            Ok(Value::string(join(&snapshot(), &separator)))
        }
        "toString" => Ok(Value::string(this.to_js_string())),
        "reverse" => {
            items.borrow_mut().reverse();
            Ok(this.clone())
        }
        "fill" => {
            let value = arg(&args, 0);
            let start = relative_index(&arg(&args, 1), len, 0);
            let end = relative_index(&arg(&args, 2), len, len);
            for slot in items.borrow_mut().iter_mut().take(end).skip(start) {
                *slot = value.clone();
            }
            Ok(this.clone())
        }
        "includes" => {
            let needle = arg(&args, 0);
            Ok(Value::Bool(snapshot().iter().any(|item| item.same_value_zero(&needle))))
        }
        "indexOf" => {
            let needle = arg(&args, 0);
            let from = relative_index(&arg(&args, 1), len, 0);
            let found = snapshot()
                .iter()
                .enumerate()
                .skip(from)
                .find(|(_, item)| item.strict_equals(&needle))
                .map(|(index, _)| index);
            Ok(Value::Number(found.map_or(-1.0, |index| index as f64)))
        }
        "lastIndexOf" => {
            let needle = arg(&args, 0);
            let found = snapshot().iter().rposition(|item| item.strict_equals(&needle));
            Ok(Value::Number(found.map_or(-1.0, |index| index as f64)))
        }
        "flat" => {
            let depth = match arg(&args, 0) {
                Value::Undefined => 1.0,
                other => to_integer(&other),
            };
            let mut out = Vec::new();
            flatten_into(&snapshot(), depth, &mut out);
            Ok(Value::array(out))
        }
        "sort" => {
            let comparator = match arg(&args, 0) {
                Value::Undefined => None,
                other => Some(callable(interp, &other)?),
            };
            let (mut defined, undefined): (Vec<Value>, Vec<Value>) = snapshot()
                .into_iter()
                .partition(|item| !matches!(item, Value::Undefined));
            defined = merge_sort(defined, &mut |a, b| match &comparator {
                Some(comparator) => {
                    let order = interp
                        .call_function(comparator, Value::Undefined, vec![a.clone(), b.clone()])?
                        .to_number();
                    Ok(order > 0.0)
                }
                None => Ok(a.to_js_string() > b.to_js_string()),
            })?;
            defined.extend(undefined);
            *items.borrow_mut() = defined;
            Ok(this.clone())
        }
        "reduce" => {
            let reducer = callable(interp, &arg(&args, 0))?;
            let values = snapshot();
            let mut iter = values.into_iter().enumerate();
            let mut accumulator = match args.get(1) {
                Some(initial) => initial.clone(),
                None => match iter.next() {
                    Some((_, first)) => first,
                    None => {
                        return Err(interp.type_error("Reduce of empty array with no initial value"));
                    }
                },
            };
            for (index, item) in iter {
                accumulator = interp.call_function(
                    &reducer,
                    Value::Undefined,
                    vec![accumulator, item, Value::Number(index as f64), this.clone()],
                )?;
            }
            Ok(accumulator)
        }
        "every" | "filter" | "find" | "findIndex" | "findLast" | "flatMap" | "forEach" | "map"
        | "some" => {
            let callback = callable(interp, &arg(&args, 0))?;
            let this_arg = arg(&args, 1);
            let values = snapshot();
            let mut mapped = Vec::new();
            let indices: Vec<usize> = if method == "findLast" {
                (0..values.len()).rev().collect()
            } else {
                (0..values.len()).collect()
            };
            for index in indices {
                let item = values[index].clone();
                let result = interp.call_function(
                    &callback,
                    this_arg.clone(),
                    vec![item.clone(), Value::Number(index as f64), this.clone()],
                )?;
                match method {
                    "every" if !result.truthy() => return Ok(Value::Bool(false)),
                    "some" if result.truthy() => return Ok(Value::Bool(true)),
                    "find" | "findLast" if result.truthy() => return Ok(item),
                    "findIndex" if result.truthy() => return Ok(Value::Number(index as f64)),
                    "filter" if result.truthy() => mapped.push(item),
                    "map" => mapped.push(result),
                    "flatMap" => match result {
                        Value::Array(inner) => mapped.extend(inner.borrow().iter().cloned()),
                        other => mapped.push(other),
                    },
                    _ => {}
                }
            }
            Ok(match method {
                "every" => Value::Bool(true),
                "some" => Value::Bool(false),
                "find" | "findLast" | "forEach" => Value::Undefined,
                "findIndex" => Value::Number(-1.0),
                _ => Value::array(mapped),
            })
        }
        _ => Err(interp.type_error(format!("Array.prototype.{method} is not a function"))),
    }
}

fn join(items: &[Value], separator: &str) -> String {
    items
        .iter()
        .map(|item| {
            if item.is_nullish() {
                String::new()
            } else {
                item.to_js_string()
            }
        })
        .collect::<Vec<_>>()
        .join(separator)
}

fn flatten_into(items: &[Value], depth: f64, out: &mut Vec<Value>) {
    for item in items {
        match item {
            Value::Array(inner) if depth >= 1.0 => {
                let inner = inner.borrow().clone();
                flatten_into(&inner, depth - 1.0, out);
            }
            other => out.push(other.clone()),
        }
    }
}

/// Stable merge sort with a fallible `greater(a, b)` comparator.
fn merge_sort(
    mut items: Vec<Value>,
    greater: &mut dyn FnMut(&Value, &Value) -> Eval<bool>,
) -> Eval<Vec<Value>> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, greater)?;
    let right = merge_sort(right, greater)?;
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(a), Some(b)) => greater(a, b)?,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_right { right.next() } else { left.next() };
        merged.extend(next);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability_context::CapabilityContext;
    use crate::interpreter::{ExecutionLimits, Interrupt};
    use crate::parser::parse_function_body;
    use serde_json::json;

    fn eval_in(source: &str, context: &mut CapabilityContext) -> Result<Json, String> {
        let program = parse_function_body(source, "<builtins>").map_err(|e| e.to_string())?;
        let mut interpreter = Interpreter::new(context, ExecutionLimits::default(), 0);
        match interpreter.run_main(&program, None, Value::Undefined) {
            Ok(value) => Ok(value.to_json().unwrap_or(Json::Null)),
            Err(Interrupt::Throw(value)) => Err(value.to_js_string()),
            Err(other) => Err(format!("{other:?}")),
        }
    }

    fn eval(source: &str) -> Json {
        let mut context = CapabilityContext::new();
        eval_in(source, &mut context).expect("script runs")
    }

    #[test]
    fn global_conversions() {
        assert_eq!(
            eval("return [Number('42'), Number(''), String(12.5), Boolean('x'), parseInt('08px'), parseInt('ff', 16), parseFloat('3.5e2kg'), isNaN('abc')];"),
            json!([42, 0, "12.5", true, 8, 255, 350, true])
        );
    }

    #[test]
    fn math_functions_and_constants() {
        assert_eq!(
            eval("return [Math.max(1, 5, 3), Math.min(), Math.round(2.5), Math.round(-2.5), Math.floor(-1.5), Math.abs(-3), Math.PI > 3];"),
            json!([5, null, 3, -2, -2, 3, true])
        );
    }

    #[test]
    fn number_statics_do_not_coerce() {
        assert_eq!(
            eval("return [Number.isInteger(5), Number.isInteger('5'), Number.isNaN('x'), Number.MAX_SAFE_INTEGER];"),
            json!([true, false, false, 9_007_199_254_740_991_i64])
        );
    }

    #[test]
    fn to_fixed_rounds_ties_away_from_zero() {
        assert_eq!(
            eval("return [(2.5).toFixed(0), (1.005).toFixed(2), (0).toFixed(2), (255).toString(16)];"),
            json!(["3", "1.00", "0.00", "ff"])
        );
    }

    #[test]
    fn array_methods_with_callbacks() {
        assert_eq!(
            eval(
                "const xs = [3, 1, 2];\n\
                 return [xs.map(x => x * 2), xs.filter(x => x > 1), xs.reduce((a, b) => a + b, 0),\n\
                 xs.some(x => x > 2), xs.every(x => x > 2), xs.find(x => x < 3), xs.findIndex(x => x === 2),\n\
                 [...xs].sort(), xs.slice(-2), xs.join('-'), [[1, [2]], 3].flat(), xs.includes(NaN)];"
            ),
            json!([[6, 2, 4], [3, 2], 6, true, false, 1, 2, [1, 2, 3], [1, 2], "3-1-2", [1, [2], 3], false])
        );
    }

    #[test]
    fn sort_with_comparator_is_stable() {
        assert_eq!(
            eval(
                "const rows = [{k: 2, n: 'a'}, {k: 1, n: 'b'}, {k: 2, n: 'c'}, {k: 1, n: 'd'}];\n\
                 rows.sort((x, y) => x.k - y.k);\n\
                 return rows.map(r => r.n);"
            ),
            json!(["b", "d", "a", "c"])
        );
    }

    #[test]
    fn splice_and_mutators() {
        assert_eq!(
            eval(
                "const xs = [1, 2, 3, 4];\n\
                 const removed = xs.splice(1, 2, 'a');\n\
                 xs.push(5); xs.unshift(0);\n\
                 return [removed, xs, xs.pop(), xs.shift(), xs.length];"
            ),
            json!([[2, 3], [0, 1, "a", 4, 5], 5, 0, 3])
        );
    }

    #[test]
    fn string_methods_use_character_indices() {
        assert_eq!(
            eval(
                "const s = ' héllo wörld ';\n\
                 const t = s.trim();\n\
                 return [t.length, t.charAt(1), t.indexOf('w'), t.slice(-5), t.toUpperCase(), t.split(' '),\n\
                 t.replace('l', 'L'), t.replaceAll('l', 'L'), 'ab'.repeat(2), '7'.padStart(3, '0'), t.substring(4, 1)];"
            ),
            json!([11, "é", 6, "wörld", "HÉLLO WÖRLD", ["héllo", "wörld"], "héLlo wörld", "héLLo wörLd", "abab", "007", "éll"])
        );
    }

    #[test]
    fn search_positions_are_clamped_not_relative() {
        assert_eq!(
            eval(
                "return ['é✓'.lastIndexOf('✓', -5), 'é✓'.lastIndexOf('✓'), 'abcabc'.lastIndexOf('c', 4),\n\
                 'ab'.lastIndexOf('abc'), 'abc'.indexOf('a', -1), 'abc'.startsWith('a', -2),\n\
                 'é✓'.codePointAt(1), 'x'.codePointAt(3) === undefined];"
            ),
            json!([-1, 1, 2, -1, 0, true, 10003, true])
        );
    }

    #[test]
    fn to_precision_switches_notation_like_js() {
        assert_eq!(
            eval(
                "return [(123.456).toPrecision(4), (0.000123).toPrecision(2), (123456).toPrecision(2),\n\
                 (2.5).toPrecision(1), (0).toPrecision(3), (-1.5).toPrecision(3), (42).toPrecision()];"
            ),
            json!(["123.5", "0.00012", "1.2e+5", "3", "0.00", "-1.50", "42"])
        );
        let mut context = CapabilityContext::new();
        let error = eval_in("return (1).toPrecision(0);", &mut context).expect_err("out of range");
        assert_eq!(error, "RangeError: toPrecision() argument must be between 1 and 100");
    }

    #[test]
    fn repeat_is_bounded() {
        let mut context = CapabilityContext::new();
        let error = eval_in("return 'x'.repeat(1e12);", &mut context).expect_err("too long");
        assert_eq!(error, "RangeError: Invalid string length");
    }

    #[test]
    fn object_statics() {
        assert_eq!(
            eval(
                "const o = {b: 1, a: 2};\n\
                 const merged = Object.assign({}, o, {c: 3});\n\
                 return [Object.keys(o), Object.values(o), Object.entries(o), merged,\n\
                 Object.fromEntries([['x', 1]]), o.hasOwnProperty('a'), Array.isArray([]), Array.from('ab')];"
            ),
            json!([["b", "a"], [1, 2], [["b", 1], ["a", 2]], {"b": 1, "a": 2, "c": 3}, {"x": 1}, true, true, ["a", "b"]])
        );
    }

    #[test]
    fn frozen_objects_reject_writes() {
        let mut context = CapabilityContext::new();
        let error = eval_in("const o = Object.freeze({a: 1});\no.a = 2;", &mut context)
            .expect_err("frozen");
        assert_eq!(error, "TypeError: Cannot assign to read only property 'a' of object");
    }

    #[test]
    fn json_round_trip_and_indent() {
        assert_eq!(
            eval("return [JSON.stringify({a: [1, 'x'], u: undefined}), JSON.parse('{\"n\": 2}').n, JSON.stringify({a: 1}, null, 2)];"),
            json!(["{\"a\":[1,\"x\"]}", 2, "{\n  \"a\": 1\n}"])
        );
    }

    #[test]
    fn json_parse_failure_is_a_syntax_error() {
        let mut context = CapabilityContext::new();
        let error = eval_in("JSON.parse('{');", &mut context).expect_err("bad json");
        assert!(error.starts_with("SyntaxError: "), "{error}");
    }

    #[test]
    fn function_call_and_apply_bind_this() {
        assert_eq!(
            eval(
                "function who(suffix) { return this.name + suffix; }\n\
                 return [who.call({name: 'a'}, '!'), who.apply({name: 'b'}, ['?']), Math.max.apply(null, [1, 9, 4])];"
            ),
            json!(["a!", "b?", 9])
        );
    }

    #[test]
    fn error_constructors_and_instanceof() {
        assert_eq!(
            eval(
                "const e = new RangeError('out');\n\
                 const plain = Error('plain');\n\
                 return [e.name, e.message, e instanceof RangeError, e instanceof Error, e instanceof TypeError, String(plain), [] instanceof Array];"
            ),
            json!(["RangeError", "out", true, true, false, "Error: plain", true])
        );
    }

    #[test]
    fn capabilities_mutate_the_shared_context() {
        let mut context = CapabilityContext::from_initial_variables(&json!([{"old": 1}]))
            .expect("context");
        let result = eval_in(
            "const added = pfAddVariable('token', 'abc');\n\
             pfDeleteVariable('old');\n\
             return [added, token];",
            &mut context,
        )
        .expect("runs");
        assert_eq!(result, json!(["OK", "abc"]));
        assert_eq!(context.snapshot(), json!({"token": "abc"}));
    }

    #[test]
    fn capability_errors_are_catchable() {
        let mut context = CapabilityContext::new();
        let result = eval_in(
            "const errors = [];\n\
             try { pfAddVariable(1, 'x'); } catch (e) { errors.push(e.message); }\n\
             try { pfAddVariable('k', '{{ v }}'); } catch (e) { errors.push(e.message); }\n\
             try { pfDeleteVariable('missing'); } catch (e) { errors.push(e.message); }\n\
             return errors;",
            &mut context,
        )
        .expect("runs");
        assert_eq!(
            result,
            json!([
                "Name must be a string",
                "Invalid characters: '{' and '}' are not allowed in key or value",
                "Variable 'missing' not found"
            ])
        );
        assert!(context.is_empty());
    }

    #[test]
    fn parse_float_prefixes() {
        assert_eq!(parse_float("  -1.5abc"), -1.5);
        assert_eq!(parse_float(".5"), 0.5);
        assert_eq!(parse_float("1e"), 1.0);
        assert!(parse_float("abc").is_nan());
        assert_eq!(parse_float("-Infinityx"), f64::NEG_INFINITY);
    }
}
