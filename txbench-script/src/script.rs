//! Parsed benchmark scripts.
//!
//! A script is an ordered list of [`Command`]s. SQL statements are stored ready to send for the
//! configured [`QueryMode`]: verbatim for the simple protocol (variables are substituted at run
//! time), or with each `:name` replaced by a positional parameter for the extended and prepared
//! protocols.

use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;
use crate::expr::{parse_expression, Expr};
use crate::random::BenchRng;
use crate::scan::{scan, Item};
use crate::variables::{is_valid_name, name_len, Variables};

/// Most positional parameters a single statement may use.
pub const MAX_PARAMS: usize = 255;

/// How SQL is sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Simple query protocol, with variables substituted into the query text
    #[default]
    Simple,
    /// Extended query protocol with unnamed statements
    Extended,
    /// Extended query protocol with named statements prepared once per connection
    Prepared,
}

impl FromStr for QueryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "extended" => Ok(Self::Extended),
            "prepared" => Ok(Self::Prepared),
            _ => Err(format!("invalid query mode (-M): \"{s}\"")),
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryMode::Simple => "simple",
            QueryMode::Extended => "extended",
            QueryMode::Prepared => "prepared",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// Store the single row of the last result
    Gset,
    /// Store every row of every result, the last row winning
    Aset,
}

/// A `\gset` or `\aset` attached to the SQL command it follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub kind: CaptureKind,
    /// Prepended to column names to form variable names
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlCommand {
    /// Statement text. Contains `$n` placeholders outside of the simple protocol.
    pub text: String,
    /// Variables bound to `$1`, `$2`, ...
    pub params: Vec<String>,
    /// Statement name used with the prepared protocol
    pub prepared_name: String,
    pub capture: Option<Capture>,
}

impl SqlCommand {
    /// The statement with every `:name` of a defined variable replaced by its value. Unknown
    /// variables and `::` casts are left alone.
    pub fn substitute(&self, vars: &Variables) -> String {
        rewrite_variables(&self.text, |name| {
            vars.get_string(name).map(|v| v.into_owned())
        })
    }

    /// Parameter values to send; undefined variables are bound as NULL.
    pub fn bind(&self, vars: &Variables) -> Vec<Option<String>> {
        self.params
            .iter()
            .map(|name| vars.get_string(name).map(|v| v.into_owned()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepUnit {
    Micros,
    Millis,
    Seconds,
}

impl SleepUnit {
    pub fn micros(self) -> i64 {
        match self {
            SleepUnit::Micros => 1,
            SleepUnit::Millis => 1_000,
            SleepUnit::Seconds => 1_000_000,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "us" => Some(SleepUnit::Micros),
            "ms" => Some(SleepUnit::Millis),
            "s" => Some(SleepUnit::Seconds),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SleepDuration {
    Literal(i64),
    Variable(String),
}

/// A backslash command.
#[derive(Debug, Clone, PartialEq)]
pub enum Meta {
    Set { variable: String, expr: Expr },
    SetShell { variable: String, command: Vec<String> },
    Shell { command: Vec<String> },
    Sleep { duration: SleepDuration, unit: SleepUnit },
    If(Expr),
    Elif(Expr),
    Else,
    Endif,
    StartPipeline,
    SyncPipeline,
    EndPipeline,
}

impl Meta {
    pub fn is_conditional(&self) -> bool {
        matches!(self, Meta::If(_) | Meta::Elif(_) | Meta::Else | Meta::Endif)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Sql(SqlCommand),
    Meta(Meta),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Line of the script the command starts on
    pub line: usize,
    /// First line of the command's source text, for reports and error messages
    pub first_line: String,
    pub kind: CommandKind,
}

impl Command {
    pub fn sql(&self) -> Option<&SqlCommand> {
        match &self.kind {
            CommandKind::Sql(sql) => Some(sql),
            CommandKind::Meta(_) => None,
        }
    }

    pub fn meta(&self) -> Option<&Meta> {
        match &self.kind {
            CommandKind::Meta(meta) => Some(meta),
            CommandKind::Sql(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub description: String,
    pub weight: u32,
    pub commands: Vec<Command>,
}

/// All scripts of a run, chosen from by weight.
#[derive(Debug, Clone, Default)]
pub struct ScriptSet {
    scripts: Vec<Script>,
}

impl ScriptSet {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self { scripts }
    }

    pub fn scripts(&self) -> &[Script] {
        &self.scripts
    }

    pub fn get(&self, index: usize) -> &Script {
        &self.scripts[index]
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.scripts.iter().map(|s| s.weight as u64).sum()
    }

    /// Picks a script with probability proportional to its weight. Requires a positive total
    /// weight. A lone script is returned without consuming randomness.
    pub fn choose(&self, rng: &mut BenchRng) -> usize {
        if self.scripts.len() == 1 {
            return 0;
        }
        let mut w = rng.uniform(0, self.total_weight() as i64 - 1);
        for (i, script) in self.scripts.iter().enumerate() {
            w -= script.weight as i64;
            if w < 0 {
                return i;
            }
        }
        self.scripts.len() - 1
    }
}

/// Calls `replace` for every `:name` in `sql`, splicing in the returned text. When it returns
/// `None` the reference is left untouched. Runs of colons never start a reference, so `::type`
/// casts survive.
fn rewrite_variables(sql: &str, mut replace: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(i) = rest.find(':') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        let len = name_len(&rest[1..]);
        if len == 0 {
            let colons = rest.len() - rest.trim_start_matches(':').len();
            out.push_str(&rest[..colons]);
            rest = &rest[colons..];
            continue;
        }
        let name = &rest[1..=len];
        match replace(name) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[..=len]),
        }
        rest = &rest[len + 1..];
    }
    out.push_str(rest);
    out
}

enum ParsedMeta {
    Meta(Meta),
    Capture(Capture),
}

/// Parses scripts for one run. Prepared statement names are unique across every script parsed
/// by the same parser.
#[derive(Debug)]
pub struct ScriptParser {
    mode: QueryMode,
    prepared_count: usize,
}

struct MetaLine<'a> {
    source: &'a str,
    line: usize,
    body: &'a str,
    /// Words of the body and their byte offsets
    words: Vec<(usize, &'a str)>,
}

impl<'a> MetaLine<'a> {
    fn new(source: &'a str, line: usize, body: &'a str) -> Self {
        let mut words = vec![];
        let mut offset = 0;
        for word in body.split_whitespace() {
            let at = offset + body[offset..].find(word).unwrap_or(0);
            words.push((at, word));
            offset = at + word.len();
        }
        Self {
            source,
            line,
            body,
            words,
        }
    }

    fn name(&self) -> &'a str {
        self.words.first().map(|(_, w)| *w).unwrap_or_default()
    }

    fn argc(&self) -> usize {
        self.words.len()
    }

    fn arg(&self, i: usize) -> &'a str {
        self.words[i].1
    }

    fn error(&self, message: impl Into<String>, word: Option<usize>) -> ParseError {
        // + 1 for the backslash
        let column = word.and_then(|w| self.words.get(w)).map(|(o, _)| o + 1);
        ParseError::new(self.source, self.line, message).with_command(format!("\\{}", self.body), column)
    }

    /// Text following word `i`, where an expression starts.
    fn rest_after(&self, i: usize) -> (usize, &'a str) {
        let (offset, word) = self.words[i];
        let start = offset + word.len();
        let rest = &self.body[start..];
        let trimmed = rest.trim_start();
        (start + rest.len() - trimmed.len(), trimmed)
    }

    fn expression(&self, after_word: usize) -> Result<Expr, ParseError> {
        let (start, text) = self.rest_after(after_word);
        if text.is_empty() {
            return Err(self.error("missing expression", None));
        }
        parse_expression(text).map_err(|e| {
            ParseError::new(self.source, self.line, e.message)
                .with_command(format!("\\{}", self.body), Some(start + e.offset + 1))
        })
    }

    fn variable(&self, i: usize) -> Result<String, ParseError> {
        let name = self.arg(i);
        if !is_valid_name(name) {
            return Err(self.error(format!("invalid variable name: \"{name}\""), Some(i)));
        }
        Ok(name.to_owned())
    }

    fn no_arguments(&self, meta: Meta) -> Result<ParsedMeta, ParseError> {
        if self.argc() > 1 {
            return Err(self.error("unexpected argument", Some(1)));
        }
        Ok(ParsedMeta::Meta(meta))
    }

    fn parse(&self) -> Result<ParsedMeta, ParseError> {
        let name = self.name().to_ascii_lowercase();
        match name.as_str() {
            "set" => {
                if self.argc() < 3 {
                    return Err(self.error("missing argument", None));
                }
                Ok(ParsedMeta::Meta(Meta::Set {
                    variable: self.variable(1)?,
                    expr: self.expression(1)?,
                }))
            }
            "setshell" => {
                if self.argc() < 3 {
                    return Err(self.error("missing argument", None));
                }
                Ok(ParsedMeta::Meta(Meta::SetShell {
                    variable: self.variable(1)?,
                    command: self.words[2..].iter().map(|(_, w)| w.to_string()).collect(),
                }))
            }
            "shell" => {
                if self.argc() < 2 {
                    return Err(self.error("missing command", None));
                }
                Ok(ParsedMeta::Meta(Meta::Shell {
                    command: self.words[1..].iter().map(|(_, w)| w.to_string()).collect(),
                }))
            }
            "sleep" => self.sleep(),
            "if" => Ok(ParsedMeta::Meta(Meta::If(self.expression(0)?))),
            "elif" => Ok(ParsedMeta::Meta(Meta::Elif(self.expression(0)?))),
            "else" => self.no_arguments(Meta::Else),
            "endif" => self.no_arguments(Meta::Endif),
            "startpipeline" => self.no_arguments(Meta::StartPipeline),
            "syncpipeline" => self.no_arguments(Meta::SyncPipeline),
            "endpipeline" => self.no_arguments(Meta::EndPipeline),
            "gset" | "aset" => {
                if self.argc() > 2 {
                    return Err(self.error("too many arguments", Some(2)));
                }
                Ok(ParsedMeta::Capture(Capture {
                    kind: if name == "gset" {
                        CaptureKind::Gset
                    } else {
                        CaptureKind::Aset
                    },
                    prefix: self.words.get(1).map(|(_, w)| w.to_string()).unwrap_or_default(),
                }))
            }
            _ => Err(self.error("invalid command", Some(0))),
        }
    }

    fn sleep(&self) -> Result<ParsedMeta, ParseError> {
        if self.argc() < 2 {
            return Err(self.error("missing argument", None));
        }
        if self.argc() > 3 {
            return Err(self.error("too many arguments", Some(3)));
        }

        let arg = self.arg(1);
        // "10ms" is the same as "10 ms"
        let (number, unit) = if self.argc() == 2 && !arg.starts_with(':') {
            let digits = arg
                .char_indices()
                .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && *c == '-')))
                .map_or(arg.len(), |(i, _)| i);
            (&arg[..digits], (digits < arg.len()).then(|| &arg[digits..]))
        } else {
            (arg, self.words.get(2).map(|(_, w)| *w))
        };

        let unit = match unit {
            None => SleepUnit::Seconds,
            Some(u) => SleepUnit::parse(u).ok_or_else(|| {
                self.error("unrecognized time unit, must be us, ms or s", Some(self.argc() - 1))
            })?,
        };

        let duration = if let Some(var) = number.strip_prefix(':') {
            if !is_valid_name(var) {
                return Err(self.error(format!("invalid variable name: \"{var}\""), Some(1)));
            }
            SleepDuration::Variable(var.to_owned())
        } else {
            let usecs = number
                .parse::<i64>()
                .map_err(|_| self.error(format!("invalid sleep time \"{number}\""), Some(1)))?;
            if usecs < 0 {
                return Err(self.error("sleep time must not be negative", Some(1)));
            }
            SleepDuration::Literal(usecs)
        };

        Ok(ParsedMeta::Meta(Meta::Sleep { duration, unit }))
    }
}

impl ScriptParser {
    pub fn new(mode: QueryMode) -> Self {
        Self {
            mode,
            prepared_count: 0,
        }
    }

    pub fn mode(&self) -> QueryMode {
        self.mode
    }

    fn sql_command(&mut self, source: &str, line: usize, text: String) -> Result<SqlCommand, ParseError> {
        let prepared_name = format!("P_{}", self.prepared_count);
        self.prepared_count += 1;

        if self.mode == QueryMode::Simple {
            return Ok(SqlCommand {
                text,
                params: vec![],
                prepared_name,
                capture: None,
            });
        }

        let mut params: Vec<String> = vec![];
        let rewritten = rewrite_variables(&text, |name| {
            params.push(name.to_owned());
            Some(format!("${}", params.len()))
        });
        if params.len() > MAX_PARAMS {
            return Err(ParseError::new(
                source,
                line,
                format!("statement has too many arguments (maximum is {MAX_PARAMS})"),
            )
            .with_command(text, None));
        }
        Ok(SqlCommand {
            text: rewritten,
            params,
            prepared_name,
            capture: None,
        })
    }

    /// Parses one script. `source` names it in error messages and reports.
    pub fn parse(&mut self, source: &str, text: &str, weight: u32) -> Result<Script, ParseError> {
        let mut commands: Vec<Command> = vec![];

        for item in scan(text) {
            match item {
                Item::Sql { line, text } => {
                    let first_line = text.lines().next().unwrap_or_default().to_owned();
                    let sql = self.sql_command(source, line, text)?;
                    commands.push(Command {
                        line,
                        first_line,
                        kind: CommandKind::Sql(sql),
                    });
                }
                Item::Meta { line, body } => {
                    let meta = MetaLine::new(source, line, &body);
                    match meta.parse()? {
                        ParsedMeta::Meta(m) => commands.push(Command {
                            line,
                            first_line: format!("\\{body}"),
                            kind: CommandKind::Meta(m),
                        }),
                        ParsedMeta::Capture(capture) => {
                            let target = match commands.last_mut().map(|c| &mut c.kind) {
                                Some(CommandKind::Sql(sql)) if sql.capture.is_none() => sql,
                                _ => {
                                    return Err(meta.error(
                                        format!("\\{} must follow an SQL command", meta.name()),
                                        Some(0),
                                    ))
                                }
                            };
                            target.capture = Some(capture);
                        }
                    }
                }
            }
        }

        check_conditionals(source, &commands)?;

        Ok(Script {
            description: source.to_owned(),
            weight,
            commands,
        })
    }
}

/// Checks that `\if`, `\elif`, `\else` and `\endif` are properly nested.
fn check_conditionals(source: &str, commands: &[Command]) -> Result<(), ParseError> {
    // (line of the \if, whether \else was seen)
    let mut stack: Vec<(usize, bool)> = vec![];
    for cmd in commands {
        let err = |msg: &str| {
            Err(ParseError::new(source, cmd.line, msg).with_command(cmd.first_line.clone(), None))
        };
        match cmd.meta() {
            Some(Meta::If(_)) => stack.push((cmd.line, false)),
            Some(Meta::Elif(_)) => match stack.last() {
                None => return err("\\elif without matching \\if"),
                Some((_, true)) => return err("\\elif after \\else"),
                _ => {}
            },
            Some(Meta::Else) => match stack.last_mut() {
                None => return err("\\else without matching \\if"),
                Some((_, true)) => return err("\\else after \\else"),
                Some((_, seen_else)) => *seen_else = true,
            },
            Some(Meta::Endif) => {
                if stack.pop().is_none() {
                    return err("\\endif without matching \\if");
                }
            }
            _ => {}
        }
    }
    match stack.last() {
        Some((line, _)) => Err(ParseError::new(
            source,
            *line,
            "\\if without matching \\endif",
        )),
        None => Ok(()),
    }
}

/// Splits `file@weight` into its parts. Without `@`, the weight is 1.
pub fn parse_weight(spec: &str) -> Result<(&str, u32), String> {
    match spec.rsplit_once('@') {
        None => Ok((spec, 1)),
        Some((name, w)) => {
            let weight = w
                .parse::<i64>()
                .map_err(|_| format!("invalid weight specification: {spec}"))?;
            if !(0..=i32::MAX as i64).contains(&weight) {
                return Err(format!(
                    "weight specification out of range (0 .. {}): {weight}",
                    i32::MAX
                ));
            }
            Ok((name, weight as u32))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::value::Value;

    fn parse(mode: QueryMode, text: &str) -> Result<Script, ParseError> {
        ScriptParser::new(mode).parse("test.sql", text, 1)
    }

    fn sql_texts(script: &Script) -> Vec<&str> {
        script
            .commands
            .iter()
            .filter_map(|c| c.sql())
            .map(|s| s.text.as_str())
            .collect()
    }

    #[test]
    fn set_then_select() {
        let script = parse(QueryMode::Simple, "\\set x 5\nSELECT :x;").unwrap();
        assert_eq!(script.commands.len(), 2);
        assert!(matches!(
            script.commands[0].meta(),
            Some(Meta::Set { variable, expr: Expr::Constant(Value::Int(5)) }) if variable == "x"
        ));
        assert_eq!(sql_texts(&script), vec!["SELECT :x;"]);

        let mut vars = Variables::new();
        vars.set_int("x", 5).unwrap();
        assert_eq!(script.commands[1].sql().unwrap().substitute(&vars), "SELECT 5;");
    }

    #[test]
    fn extended_mode_uses_placeholders() {
        let script = parse(
            QueryMode::Extended,
            "UPDATE t SET v = v + :delta WHERE id = :id AND x::text = ':id';",
        )
        .unwrap();
        let sql = script.commands[0].sql().unwrap();
        assert_eq!(
            sql.text,
            "UPDATE t SET v = v + $1 WHERE id = $2 AND x::text = '$3';"
        );
        assert_eq!(sql.params, vec!["delta", "id", "id"]);

        let mut vars = Variables::new();
        vars.set_int("delta", -3).unwrap();
        assert_eq!(
            sql.bind(&vars),
            vec![Some("-3".to_owned()), None, None]
        );
    }

    #[test]
    fn simple_substitution_keeps_unknowns_and_casts() {
        let script = parse(QueryMode::Simple, "SELECT :a::int, :b, 'x:', :1;").unwrap();
        let mut vars = Variables::new();
        vars.set_string("a", "12").unwrap();
        assert_eq!(
            script.commands[0].sql().unwrap().substitute(&vars),
            "SELECT 12::int, :b, 'x:', :1;"
        );
    }

    #[test]
    fn prepared_names_are_unique_across_scripts() {
        let mut parser = ScriptParser::new(QueryMode::Prepared);
        let a = parser.parse("a", "SELECT 1;\nSELECT 2;", 1).unwrap();
        let b = parser.parse("b", "SELECT 3;", 1).unwrap();
        let names: Vec<_> = a
            .commands
            .iter()
            .chain(&b.commands)
            .map(|c| c.sql().unwrap().prepared_name.as_str())
            .collect();
        assert_eq!(names, vec!["P_0", "P_1", "P_2"]);
    }

    #[test]
    fn gset_merges_into_previous_sql() {
        let script = parse(
            QueryMode::Simple,
            "SELECT 1 AS one \\gset p_\nSELECT 2 AS two;\n\\aset\n\\set y :p_one",
        )
        .unwrap();
        assert_eq!(script.commands.len(), 3);
        assert_eq!(
            script.commands[0].sql().unwrap().capture,
            Some(Capture {
                kind: CaptureKind::Gset,
                prefix: "p_".into()
            })
        );
        assert_eq!(
            script.commands[1].sql().unwrap().capture,
            Some(Capture {
                kind: CaptureKind::Aset,
                prefix: String::new()
            })
        );
    }

    #[test]
    fn gset_must_follow_sql() {
        let err = parse(QueryMode::Simple, "\\set x 1\n\\gset").unwrap_err();
        assert_eq!(err.message, "\\gset must follow an SQL command");
        assert_eq!(err.line, 2);

        let err = parse(QueryMode::Simple, "SELECT 1 \\gset\n\\gset").unwrap_err();
        assert_eq!(err.message, "\\gset must follow an SQL command");
    }

    #[test]
    fn first_lines_round_trip() {
        let text = "\\set aid random(1, 10)\nSELECT abalance FROM a WHERE aid = :aid;\n\\sleep 10 ms\nEND;";
        let script = parse(QueryMode::Extended, text).unwrap();
        let lines: Vec<_> = script.commands.iter().map(|c| c.first_line.as_str()).collect();
        assert_eq!(lines, text.lines().collect::<Vec<_>>());
    }

    #[test]
    fn sleep_forms() {
        let sleep = |text: &str| match parse(QueryMode::Simple, text).unwrap().commands[0].meta() {
            Some(Meta::Sleep { duration, unit }) => (duration.clone(), *unit),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(sleep("\\sleep 3"), (SleepDuration::Literal(3), SleepUnit::Seconds));
        assert_eq!(sleep("\\sleep 10ms"), (SleepDuration::Literal(10), SleepUnit::Millis));
        assert_eq!(sleep("\\sleep 10 US"), (SleepDuration::Literal(10), SleepUnit::Micros));
        assert_eq!(
            sleep("\\sleep :t ms"),
            (SleepDuration::Variable("t".into()), SleepUnit::Millis)
        );

        for bad in ["\\sleep", "\\sleep -5", "\\sleep 5 hours", "\\sleep 1 s extra", "\\sleep x"] {
            assert!(parse(QueryMode::Simple, bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn meta_argument_errors() {
        let msg = |text: &str| parse(QueryMode::Simple, text).unwrap_err().message;
        assert_eq!(msg("\\set x"), "missing argument");
        assert_eq!(msg("\\set 1x 2"), "invalid variable name: \"1x\"");
        assert_eq!(msg("\\setshell x"), "missing argument");
        assert_eq!(msg("\\shell"), "missing command");
        assert_eq!(msg("\\else 1"), "unexpected argument");
        assert_eq!(msg("\\endpipeline now"), "unexpected argument");
        assert_eq!(msg("\\frobnicate"), "invalid command");
        assert_eq!(msg("\\if"), "missing expression");
    }

    #[test]
    fn expression_error_points_into_command() {
        let err = parse(QueryMode::Simple, "\\set x 1 + foo(2)").unwrap_err();
        assert_eq!(err.message, "unexpected function name");
        // "\set x 1 + " is 11 characters
        assert_eq!(err.column, Some(11));
    }

    #[test]
    fn conditional_structure() {
        let msg = |text: &str| parse(QueryMode::Simple, text).unwrap_err().message;
        assert_eq!(msg("\\elif true"), "\\elif without matching \\if");
        assert_eq!(msg("\\else"), "\\else without matching \\if");
        assert_eq!(msg("\\endif"), "\\endif without matching \\if");
        assert_eq!(msg("\\if true\n\\else\n\\elif false\n\\endif"), "\\elif after \\else");
        assert_eq!(msg("\\if true\n\\else\n\\else\n\\endif"), "\\else after \\else");
        assert_eq!(msg("\\if true\nSELECT 1;"), "\\if without matching \\endif");

        let ok = "\\if 0\nSELECT 'skipped';\n\\else\nSELECT 'run';\n\\endif";
        assert_eq!(parse(QueryMode::Simple, ok).unwrap().commands.len(), 5);
    }

    #[test]
    fn weight_specs() {
        assert_eq!(parse_weight("bench.sql"), Ok(("bench.sql", 1)));
        assert_eq!(parse_weight("bench.sql@5"), Ok(("bench.sql", 5)));
        assert_eq!(parse_weight("a@b.sql@0"), Ok(("a@b.sql", 0)));
        assert!(parse_weight("bench.sql@x").is_err());
        assert!(parse_weight("bench.sql@-1").is_err());
    }

    #[test]
    fn weighted_choice() {
        let mut parser = ScriptParser::new(QueryMode::Simple);
        let set = ScriptSet::new(vec![
            parser.parse("a", "SELECT 1;", 1).unwrap(),
            parser.parse("b", "SELECT 2;", 0).unwrap(),
            parser.parse("c", "SELECT 3;", 3).unwrap(),
        ]);
        assert_eq!(set.total_weight(), 4);
        let mut rng = BenchRng::seed(1);
        let mut counts = [0usize; 3];
        for _ in 0..8000 {
            counts[set.choose(&mut rng)] += 1;
        }
        assert_eq!(counts[1], 0);
        assert!(counts[2] > counts[0] * 2, "{counts:?}");
    }
}
