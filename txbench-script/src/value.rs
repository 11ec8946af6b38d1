//! The dynamically typed values that script expressions compute and variables hold.

use std::fmt;

use crate::error::EvalError;

/// A script value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
}

impl Value {
    /// Name of the value's type, as printed by `debug()`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Strict boolean coercion: only booleans are accepted.
    pub fn to_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Null => Err(EvalError::Coercion("cannot coerce NULL to boolean".into())),
            v => Err(EvalError::Coercion(format!(
                "cannot coerce {} to boolean",
                v.type_name()
            ))),
        }
    }

    /// Truthiness for `CASE` and conditionals: NULL, false, 0 and 0.0 are false.
    pub fn truth(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Double(d) => *d != 0.0,
        }
    }

    /// Integer coercion. Doubles are rounded half to even and must fit in an `i64`.
    pub fn to_int(&self) -> Result<i64, EvalError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Double(d) => {
                let r = round_half_even(*d);
                // i64::MAX as f64 rounds up to 2^63, which is out of range
                if r.is_nan() || r < i64::MIN as f64 || r >= i64::MAX as f64 {
                    Err(EvalError::Coercion(format!(
                        "double to int overflow for {}",
                        format_double(*d)
                    )))
                } else {
                    Ok(r as i64)
                }
            }
            Value::Bool(_) => Err(EvalError::Coercion("cannot coerce boolean to int".into())),
            Value::Null => Err(EvalError::Coercion("cannot coerce NULL to int".into())),
        }
    }

    pub fn to_double(&self) -> Result<f64, EvalError> {
        match self {
            Value::Double(d) => Ok(*d),
            Value::Int(i) => Ok(*i as f64),
            Value::Bool(_) => Err(EvalError::Coercion(
                "cannot coerce boolean to double".into(),
            )),
            Value::Null => Err(EvalError::Coercion("cannot coerce NULL to double".into())),
        }
    }

    /// Parses the textual form a variable was given on the command line or captured from a
    /// query result. Returns `None` if the text is not a valid literal of any type.
    pub fn parse_literal(s: &str) -> Option<Value> {
        if s.eq_ignore_ascii_case("null") {
            return Some(Value::Null);
        }
        if let Some(b) = parse_bool(s) {
            return Some(Value::Bool(b));
        }
        if let Some(i) = parse_int(s) {
            return Some(Value::Int(i));
        }
        parse_double(s).map(Value::Double)
    }
}

/// The string form used for substitution into SQL and for `\gset` round trips.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => f.write_str(&format_double(*d)),
        }
    }
}

fn round_half_even(d: f64) -> f64 {
    let r = d.round();
    if (d - d.trunc()).abs() == 0.5 {
        2.0 * (d / 2.0).round()
    } else {
        r
    }
}

/// Accepts non-empty case-insensitive prefixes of `true`, `false`, `yes` and `no`, plus `on`,
/// `off` and the two letter prefix `of`.
fn parse_bool(s: &str) -> Option<bool> {
    let lower = s.to_ascii_lowercase();
    let is_prefix = |word: &str| !lower.is_empty() && word.starts_with(lower.as_str());
    if is_prefix("true") || is_prefix("yes") {
        Some(true)
    } else if is_prefix("false") || is_prefix("no") {
        Some(false)
    } else if lower == "on" {
        Some(true)
    } else if lower.len() >= 2 && "off".starts_with(lower.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Integer literal with optional surrounding whitespace and sign.
pub(crate) fn parse_int(s: &str) -> Option<i64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let digits = t.strip_prefix(|c| c == '+' || c == '-').unwrap_or(t);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    t.strip_prefix('+').unwrap_or(t).parse().ok()
}

fn parse_double(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok()
}

/// Formats a double like C's `%.15g`.
pub fn format_double(d: f64) -> String {
    const PRECISION: i32 = 15;
    if d.is_nan() {
        return "nan".into();
    }
    if d.is_infinite() {
        return if d > 0.0 { "inf" } else { "-inf" }.into();
    }

    let sci = format!("{:.*e}", (PRECISION - 1) as usize, d);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exp < -4 || exp >= PRECISION {
        let mantissa = trim_fraction(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    } else {
        let fixed = format!("{:.*}", (PRECISION - 1 - exp) as usize, d);
        trim_fraction(&fixed).to_owned()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
