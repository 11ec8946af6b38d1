//! Per-client variable store.
//!
//! A variable keeps its textual form (from `-D`, `\gset` or `\setshell`) and/or its typed
//! [`Value`]. The text is promoted to a value on first typed use and cached; the value is
//! rendered back to text whenever it is substituted into SQL.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::error::EvalError;
use crate::value::Value;

#[derive(Debug, Clone, Default, PartialEq)]
struct Variable {
    string: Option<String>,
    value: Option<Value>,
}

/// Named variables belonging to one client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    vars: HashMap<String, Variable>,
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_name_char(b: u8) -> bool {
    is_name_start(b) || b.is_ascii_digit()
}

/// Length in bytes of the variable name at the start of `s`, or 0 if `s` does not start with
/// one.
pub fn name_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    match bytes.first() {
        Some(&b) if is_name_start(b) => {
            1 + bytes[1..].iter().take_while(|&&b| is_name_char(b)).count()
        }
        _ => 0,
    }
}

/// Whether `name` is a valid variable name: an identifier whose characters are ASCII letters,
/// digits, underscores or any non-ASCII character, not starting with a digit.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name_len(name) == name.len()
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    fn entry(&mut self, name: &str) -> Result<&mut Variable, EvalError> {
        if !self.vars.contains_key(name) {
            if !is_valid_name(name) {
                return Err(EvalError::InvalidVariableName(name.to_owned()));
            }
            self.vars.insert(name.to_owned(), Variable::default());
        }
        // just inserted if it was missing
        Ok(self.vars.entry(name.to_owned()).or_default())
    }

    /// Assigns the textual form of a variable, discarding any typed value.
    pub fn set_string(&mut self, name: &str, value: impl Into<String>) -> Result<(), EvalError> {
        let var = self.entry(name)?;
        var.string = Some(value.into());
        var.value = None;
        Ok(())
    }

    /// Assigns a typed value, discarding any textual form.
    pub fn set_value(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
        let var = self.entry(name)?;
        var.string = None;
        var.value = Some(value);
        Ok(())
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> Result<(), EvalError> {
        self.set_value(name, Value::Int(value))
    }

    /// The textual form of a variable, for substitution into SQL or shell commands.
    pub fn get_string(&self, name: &str) -> Option<Cow<'_, str>> {
        let var = self.vars.get(name)?;
        match (&var.string, &var.value) {
            (Some(s), _) => Some(Cow::Borrowed(s)),
            (None, Some(v)) => Some(Cow::Owned(v.to_string())),
            (None, None) => None,
        }
    }

    /// The typed value of a variable, promoting its textual form if needed.
    pub fn get_value(&mut self, name: &str) -> Result<Value, EvalError> {
        let var = self
            .vars
            .get_mut(name)
            .ok_or_else(|| EvalError::UndefinedVariable(name.to_owned()))?;
        if let Some(v) = var.value {
            return Ok(v);
        }
        let text = var.string.as_deref().unwrap_or_default();
        let value = Value::parse_literal(text).ok_or_else(|| EvalError::MalformedVariable {
            name: name.to_owned(),
            value: text.to_owned(),
        })?;
        var.value = Some(value);
        Ok(value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
}
