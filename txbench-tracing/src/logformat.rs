use clap::ValueEnum;

/// How diagnostic events are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One line per event, span fields abbreviated
    Compact,
    /// One line per event with every span's fields
    Full,
    /// Multi-line, for reading by eye while debugging a script
    Pretty,
    /// Newline-delimited JSON objects
    Json,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_from_the_command_line() {
        assert_eq!(LogFormat::from_str("json", false), Ok(LogFormat::Json));
        assert_eq!(LogFormat::from_str("PRETTY", true), Ok(LogFormat::Pretty));
        assert!(LogFormat::from_str("yaml", false).is_err());
    }
}
