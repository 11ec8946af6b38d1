//! Splits script text into SQL statements and backslash meta-commands.
//!
//! An SQL statement ends at a `;` outside parentheses, quotes, dollar quotes and comments, or at
//! the start of a meta-command. A meta-command runs from its backslash to the end of the line;
//! a backslash at the very end of a line continues it onto the next.

/// One lexical unit of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Item {
    Sql {
        /// 1-based line the statement starts on
        line: usize,
        text: String,
    },
    Meta {
        line: usize,
        /// Everything after the backslash, with continuation lines joined by a space
        body: String,
    },
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    buf: String,
    buf_line: usize,
    depth: usize,
    items: Vec<Item>,
}

impl Scanner {
    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    /// Consumes one character, appending it to the current statement.
    fn take(&mut self) {
        if let Some(c) = self.peek_at(0) {
            if c == '\n' {
                self.line += 1;
            }
            self.buf.push(c);
            self.pos += 1;
        }
    }

    fn flush(&mut self) {
        let text = self.buf.trim_end();
        if !text.is_empty() {
            self.items.push(Item::Sql {
                line: self.buf_line,
                text: text.to_owned(),
            });
        }
        self.buf.clear();
        self.depth = 0;
    }

    /// Skips whitespace and comments preceding a statement.
    fn skip_leading(&mut self) {
        loop {
            match (self.peek_at(0), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    self.pos += 1;
                }
                (Some('-'), Some('-')) => {
                    while let Some(c) = self.peek_at(0) {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                (Some('/'), Some('*')) => {
                    let start = self.buf.len();
                    self.block_comment();
                    self.buf.truncate(start);
                }
                _ => return,
            }
        }
    }

    fn block_comment(&mut self) {
        let mut nesting = 0usize;
        while let Some(c) = self.peek_at(0) {
            match (c, self.peek_at(1)) {
                ('/', Some('*')) => {
                    nesting += 1;
                    self.take();
                    self.take();
                }
                ('*', Some('/')) => {
                    self.take();
                    self.take();
                    nesting -= 1;
                    if nesting == 0 {
                        return;
                    }
                }
                _ => self.take(),
            }
        }
    }

    fn line_comment(&mut self) {
        while let Some(c) = self.peek_at(0) {
            if c == '\n' {
                return;
            }
            self.take();
        }
    }

    /// A quoted literal or identifier, starting at its opening quote. `backslash_escapes`
    /// selects `E'...'` semantics.
    fn quoted(&mut self, quote: char, backslash_escapes: bool) {
        self.take();
        while let Some(c) = self.peek_at(0) {
            if backslash_escapes && c == '\\' {
                self.take();
                self.take();
            } else if c == quote {
                self.take();
                // doubled quote is an escaped quote
                if self.peek_at(0) == Some(quote) {
                    self.take();
                } else {
                    return;
                }
            } else {
                self.take();
            }
        }
    }

    /// If a dollar-quote tag starts here, returns it, including both dollar signs.
    fn dollar_tag(&self) -> Option<String> {
        let mut tag = String::from("$");
        let mut i = 1;
        loop {
            let c = self.peek_at(i)?;
            if c == '$' {
                tag.push('$');
                return Some(tag);
            }
            let ok = if i == 1 {
                c.is_alphabetic() || c == '_'
            } else {
                c.is_alphanumeric() || c == '_'
            };
            if !ok {
                return None;
            }
            tag.push(c);
            i += 1;
        }
    }

    fn dollar_quoted(&mut self, tag: &str) {
        let tag: Vec<char> = tag.chars().collect();
        for _ in 0..tag.len() {
            self.take();
        }
        while self.peek_at(0).is_some() {
            let closes = tag
                .iter()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(*c));
            if closes {
                for _ in 0..tag.len() {
                    self.take();
                }
                return;
            }
            self.take();
        }
    }

    fn meta_command(&mut self) {
        let line = self.line;
        // skip the backslash
        self.pos += 1;
        let mut body = String::new();
        while let Some(c) = self.peek_at(0) {
            self.pos += 1;
            match c {
                '\n' => {
                    self.line += 1;
                    break;
                }
                '\\' if matches!(self.peek_at(0), Some('\n') | None)
                    || (self.peek_at(0) == Some('\r') && self.peek_at(1) == Some('\n')) =>
                {
                    // continuation
                    while let Some(c) = self.peek_at(0) {
                        self.pos += 1;
                        if c == '\n' {
                            self.line += 1;
                            break;
                        }
                    }
                    body.push(' ');
                }
                c => body.push(c),
            }
        }
        self.items.push(Item::Meta {
            line,
            body: body.trim_end().to_owned(),
        });
    }

    fn prev_is_word_char(&self) -> bool {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.chars.get(i))
            .map_or(false, |c| c.is_alphanumeric() || *c == '_')
    }

    fn run(mut self) -> Vec<Item> {
        loop {
            if self.buf.is_empty() {
                self.skip_leading();
                self.buf_line = self.line;
            }
            let Some(c) = self.peek_at(0) else {
                break;
            };
            match (c, self.peek_at(1)) {
                ('\\', Some(';')) => {
                    self.pos += 2;
                    self.buf.push(';');
                }
                ('\\', _) => {
                    self.flush();
                    self.meta_command();
                }
                ('-', Some('-')) => self.line_comment(),
                ('/', Some('*')) => self.block_comment(),
                ('\'', _) => {
                    let escapes = matches!(self.buf.chars().last(), Some('e' | 'E'))
                        && !self.buf[..self.buf.len() - 1]
                            .chars()
                            .last()
                            .map_or(false, |c| c.is_alphanumeric() || c == '_');
                    self.quoted('\'', escapes);
                }
                ('"', _) => self.quoted('"', false),
                ('$', _) if !self.prev_is_word_char() => match self.dollar_tag() {
                    Some(tag) => self.dollar_quoted(&tag),
                    None => self.take(),
                },
                ('(', _) => {
                    self.depth += 1;
                    self.take();
                }
                (')', _) => {
                    self.depth = self.depth.saturating_sub(1);
                    self.take();
                }
                (';', _) if self.depth == 0 => {
                    self.take();
                    self.flush();
                }
                _ => self.take(),
            }
        }
        self.flush();
        self.items
    }
}

pub(crate) fn scan(text: &str) -> Vec<Item> {
    Scanner {
        chars: text.chars().collect(),
        pos: 0,
        line: 1,
        buf: String::new(),
        buf_line: 1,
        depth: 0,
        items: vec![],
    }
    .run()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sql(line: usize, text: &str) -> Item {
        Item::Sql {
            line,
            text: text.into(),
        }
    }

    fn meta(line: usize, body: &str) -> Item {
        Item::Meta {
            line,
            body: body.into(),
        }
    }

    #[test]
    fn statements_and_meta_commands() {
        let items = scan("\\set x 5\nSELECT :x;\n\n  UPDATE t SET a = 1;\n");
        assert_eq!(
            items,
            vec![
                meta(1, "set x 5"),
                sql(2, "SELECT :x;"),
                sql(4, "UPDATE t SET a = 1;")
            ]
        );
    }

    #[test]
    fn semicolons_inside_literals_and_parens() {
        let items = scan(
            "SELECT ';', \"a;b\", $$x;y$$, $fn$ ; $fn$, E'\\';' FROM f(1;2);\nSELECT 2;",
        );
        assert_eq!(
            items,
            vec![
                sql(
                    1,
                    "SELECT ';', \"a;b\", $$x;y$$, $fn$ ; $fn$, E'\\';' FROM f(1;2);"
                ),
                sql(2, "SELECT 2;"),
            ]
        );
    }

    #[test]
    fn comments() {
        let items = scan("-- leading\n/* a /* nested */ ; */ SELECT 1 -- tail;\n, 2;");
        assert_eq!(items, vec![sql(2, "SELECT 1 -- tail;\n, 2;")]);
    }

    #[test]
    fn meta_command_ends_pending_statement() {
        let items = scan("SELECT 1 AS one \\gset p_\nSELECT 2");
        assert_eq!(
            items,
            vec![
                sql(1, "SELECT 1 AS one"),
                meta(1, "gset p_"),
                sql(2, "SELECT 2")
            ]
        );
    }

    #[test]
    fn continuation_and_escaped_semicolon() {
        let items = scan("\\set x 1 + \\\n 2\nBEGIN\\; SELECT 1;\n");
        assert_eq!(
            items,
            vec![meta(1, "set x 1 +   2"), sql(3, "BEGIN; SELECT 1;")]
        );
    }

    #[test]
    fn bare_semicolon_is_a_statement() {
        assert_eq!(scan(";"), vec![sql(1, ";")]);
        assert_eq!(scan("  \n -- nothing\n"), vec![]);
    }

    #[test]
    fn positional_parameters_are_not_dollar_quotes() {
        let items = scan("SELECT $1, a$b$c;");
        assert_eq!(items, vec![sql(1, "SELECT $1, a$b$c;")]);
    }
}
