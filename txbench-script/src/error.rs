use std::fmt;

/// Errors raised while evaluating expressions or reading variables at run time. These abort the
/// client that hit them, never the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("undefined variable \"{0}\"")]
    UndefinedVariable(String),

    #[error("malformed variable \"{name}\" value: \"{value}\"")]
    MalformedVariable { name: String, value: String },

    #[error("invalid variable name: \"{0}\"")]
    InvalidVariableName(String),

    #[error("{0}")]
    Coercion(String),

    #[error("bigint {0} out of range")]
    Overflow(&'static str),

    #[error("division by zero")]
    DivisionByZero,

    #[error("{0}")]
    InvalidArgument(String),
}

/// A script that could not be parsed. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Script name, e.g. a file path or `<builtin: select only>`
    pub source: String,
    pub line: usize,
    pub message: String,
    /// Additional detail appended in parentheses
    pub detail: Option<String>,
    /// The offending command text, printed under the message
    pub command: Option<String>,
    /// Byte offset into `command` to point a caret at
    pub column: Option<usize>,
}

impl ParseError {
    pub fn new(source: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            line,
            message: message.into(),
            detail: None,
            command: None,
            column: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>, column: Option<usize>) -> Self {
        self.command = Some(command.into());
        self.column = column;
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.source, self.line, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        if let Some(command) = &self.command {
            write!(f, "\n{command}")?;
            if let Some(column) = self.column {
                let pad = command
                    .char_indices()
                    .take_while(|(i, _)| *i < column)
                    .count();
                write!(f, "\n{}^ error found here", " ".repeat(pad))?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_error_report() {
        let err = ParseError::new("bench.sql", 3, "unexpected character")
            .with_detail("'$'")
            .with_command("\\set x 1 $ 2", Some(9));
        assert_eq!(
            err.to_string(),
            "bench.sql:3: unexpected character ('$')\n\\set x 1 $ 2\n         ^ error found here"
        );
    }

    #[test]
    fn eval_error_messages() {
        assert_eq!(
            EvalError::Overflow("add").to_string(),
            "bigint add out of range"
        );
        assert_eq!(
            EvalError::MalformedVariable {
                name: "x".into(),
                value: "abc".into()
            }
            .to_string(),
            "malformed variable \"x\" value: \"abc\""
        );
    }
}
