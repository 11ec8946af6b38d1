//! Expression parser for `\set` and `\if`.
//!
//! Input is first split into tokens with nom, then parsed by precedence climbing over the token
//! list. Operators, from loosest to tightest binding:
//!
//! | operators                      | associativity |
//! |--------------------------------|---------------|
//! | `OR`                           | right         |
//! | `AND`                          | right         |
//! | `NOT`                          | prefix        |
//! | `IS`, `ISNULL`, `NOTNULL`      | none          |
//! | `<` `<=` `>` `>=` `=` `<>` `!=` | none         |
//! | `\|` `#` `^` `&` `<<` `>>` `~` | left          |
//! | `+` `-`                        | left          |
//! | `*` `/` `%`                    | left          |
//! | unary `+` `-`                  | prefix        |

use std::fmt;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char, digit0, digit1, multispace0, one_of};
use nom::combinator::{map, opt, recognize};
use nom::sequence::{pair, preceded, tuple};
use nom::IResult;
use nom_locate::LocatedSpan;

use crate::expr::ast::{Expr, Function};
use crate::value::Value;

type Span<'a> = LocatedSpan<&'a str>;

/// A syntax error, with the byte offset into the parsed text where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprError {
    pub message: String,
    pub offset: usize,
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at column {}", self.message, self.offset + 1)
    }
}

impl std::error::Error for ExprError {}

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Number(&'a str),
    Ident(&'a str),
    Variable(&'a str),
    Op(&'a str),
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || !c.is_ascii()
}

fn is_ident_char(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

fn identifier(i: Span) -> IResult<Span, Span> {
    recognize(pair(take_while1(is_ident_start), take_while(is_ident_char)))(i)
}

fn number(i: Span) -> IResult<Span, Span> {
    recognize(tuple((
        alt((
            recognize(pair(digit1, opt(pair(char('.'), digit0)))),
            recognize(pair(char('.'), digit1)),
        )),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(i)
}

fn operator(i: Span) -> IResult<Span, Span> {
    alt((
        alt((tag("<="), tag(">="), tag("<>"), tag("!="), tag("<<"), tag(">>"))),
        recognize(one_of("+-*/%=<>&|#^~(),")),
    ))(i)
}

fn token(i: Span) -> IResult<Span, (usize, Token)> {
    preceded(
        multispace0,
        alt((
            map(number, |s: Span| (s.location_offset(), Token::Number(*s.fragment()))),
            map(identifier, |s: Span| {
                (s.location_offset(), Token::Ident(*s.fragment()))
            }),
            map(preceded(char(':'), identifier), |s: Span| {
                (s.location_offset() - 1, Token::Variable(*s.fragment()))
            }),
            map(operator, |s: Span| (s.location_offset(), Token::Op(*s.fragment()))),
        )),
    )(i)
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token<'_>)>, ExprError> {
    let mut tokens = vec![];
    let mut rest = Span::new(text);
    loop {
        let (after_ws, _) = multispace0::<_, nom::error::Error<Span>>(rest)
            .map_err(|_| ExprError {
                message: "unexpected character".into(),
                offset: rest.location_offset(),
            })?;
        if after_ws.fragment().is_empty() {
            return Ok(tokens);
        }
        match token(after_ws) {
            Ok((next, tok)) => {
                tokens.push(tok);
                rest = next;
            }
            Err(_) => {
                return Err(ExprError {
                    message: "unexpected character".into(),
                    offset: after_ws.location_offset(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assoc {
    Left,
    Right,
    Non,
}

const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_NOT: u8 = 3;
const PREC_IS: u8 = 4;
const PREC_CMP: u8 = 5;
const PREC_BIT: u8 = 6;
const PREC_ADD: u8 = 7;
const PREC_MUL: u8 = 8;

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "is", "isnull", "notnull", "true", "false", "null", "case", "when",
    "then", "else", "end",
];

fn binding(tok: &Token) -> Option<(u8, Assoc)> {
    match tok {
        Token::Ident(kw) if kw.eq_ignore_ascii_case("or") => Some((PREC_OR, Assoc::Right)),
        Token::Ident(kw) if kw.eq_ignore_ascii_case("and") => Some((PREC_AND, Assoc::Right)),
        Token::Ident(kw)
            if kw.eq_ignore_ascii_case("is")
                || kw.eq_ignore_ascii_case("isnull")
                || kw.eq_ignore_ascii_case("notnull") =>
        {
            Some((PREC_IS, Assoc::Non))
        }
        Token::Op("<" | "<=" | ">" | ">=" | "=" | "<>" | "!=") => Some((PREC_CMP, Assoc::Non)),
        Token::Op("|" | "#" | "^" | "&" | "<<" | ">>") => Some((PREC_BIT, Assoc::Left)),
        Token::Op("+" | "-") => Some((PREC_ADD, Assoc::Left)),
        Token::Op("*" | "/" | "%") => Some((PREC_MUL, Assoc::Left)),
        _ => None,
    }
}

struct Parser<'a> {
    tokens: Vec<(usize, Token<'a>)>,
    pos: usize,
    end: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token<'a>> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError {
            message: message.into(),
            offset: self.offset(),
        }
    }

    fn advance(&mut self) -> Option<Token<'a>> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(i)) if i.eq_ignore_ascii_case(kw))
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ExprError> {
        if self.at_keyword(kw) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", kw.to_ascii_uppercase())))
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ExprError> {
        if self.peek() == Some(&Token::Op(op)) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected \"{op}\"")))
        }
    }

    fn expr(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.prefix()?;
        let mut last_nonassoc = None;

        while let Some((prec, assoc)) = self.peek().and_then(binding) {
            if prec < min_prec {
                break;
            }
            if assoc == Assoc::Non && last_nonassoc == Some(prec) {
                return Err(self.error("syntax error"));
            }
            let op = self.advance().ok_or_else(|| self.error("syntax error"))?;
            let next_min = match assoc {
                Assoc::Right => prec,
                Assoc::Left | Assoc::Non => prec + 1,
            };

            lhs = match op {
                Token::Ident(kw) if kw.eq_ignore_ascii_case("isnull") => is(lhs, Value::Null),
                Token::Ident(kw) if kw.eq_ignore_ascii_case("notnull") => {
                    not(is(lhs, Value::Null))
                }
                Token::Ident(kw) if kw.eq_ignore_ascii_case("is") => self.is_tail(lhs)?,
                Token::Ident(kw) if kw.eq_ignore_ascii_case("and") => {
                    Expr::op(Function::And, lhs, self.expr(next_min)?)
                }
                Token::Ident(_) => Expr::op(Function::Or, lhs, self.expr(next_min)?),
                Token::Op(op) => {
                    let rhs = self.expr(next_min)?;
                    binary(op, lhs, rhs)
                }
                _ => return Err(self.error("syntax error")),
            };
            last_nonassoc = (assoc == Assoc::Non).then_some(prec);
        }

        Ok(lhs)
    }

    /// After `IS`: `[NOT] NULL | TRUE | FALSE`
    fn is_tail(&mut self, lhs: Expr) -> Result<Expr, ExprError> {
        let negate = if self.at_keyword("not") {
            self.pos += 1;
            true
        } else {
            false
        };
        let rhs = if self.at_keyword("null") {
            Value::Null
        } else if self.at_keyword("true") {
            Value::Bool(true)
        } else if self.at_keyword("false") {
            Value::Bool(false)
        } else {
            return Err(self.error("expected NULL, TRUE or FALSE after IS"));
        };
        self.pos += 1;
        let e = is(lhs, rhs);
        Ok(if negate { not(e) } else { e })
    }

    fn prefix(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        let tok = self
            .advance()
            .ok_or_else(|| self.error("unexpected end of expression"))?;

        match tok {
            Token::Number(text) => {
                number_literal(text).map_err(|message| ExprError { message, offset })
            }
            Token::Variable(name) => Ok(Expr::var(name)),
            Token::Op("(") => {
                let e = self.expr(0)?;
                self.expect_op(")")?;
                Ok(e)
            }
            Token::Op("-") => {
                if self.peek() == Some(&Token::Number("9223372036854775808")) {
                    self.pos += 1;
                    return Ok(Expr::int(i64::MIN));
                }
                let operand = self.prefix()?;
                Ok(Expr::op(Function::Sub, Expr::int(0), operand))
            }
            Token::Op("+") => self.prefix(),
            Token::Op("~") => {
                let operand = self.expr(PREC_BIT + 1)?;
                Ok(Expr::op(Function::BitXor, Expr::int(-1), operand))
            }
            Token::Ident(kw) if kw.eq_ignore_ascii_case("not") => {
                Ok(not(self.expr(PREC_NOT + 1)?))
            }
            Token::Ident(kw) if kw.eq_ignore_ascii_case("true") => Ok(Expr::bool(true)),
            Token::Ident(kw) if kw.eq_ignore_ascii_case("false") => Ok(Expr::bool(false)),
            Token::Ident(kw) if kw.eq_ignore_ascii_case("null") => Ok(Expr::null()),
            Token::Ident(kw) if kw.eq_ignore_ascii_case("case") => self.case(),
            Token::Ident(kw) if KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(kw)) => {
                Err(ExprError {
                    message: "syntax error".into(),
                    offset,
                })
            }
            Token::Ident(name) => self.function(name, offset),
            Token::Op(_) => Err(ExprError {
                message: "syntax error".into(),
                offset,
            }),
        }
    }

    fn case(&mut self) -> Result<Expr, ExprError> {
        let mut args = vec![];
        loop {
            self.expect_keyword("when")?;
            args.push(self.expr(0)?);
            self.expect_keyword("then")?;
            args.push(self.expr(0)?);
            if !self.at_keyword("when") {
                break;
            }
        }
        if self.at_keyword("else") {
            self.pos += 1;
            args.push(self.expr(0)?);
        } else {
            args.push(Expr::null());
        }
        self.expect_keyword("end")?;
        Ok(Expr::call(Function::Case, args))
    }

    fn function(&mut self, name: &str, offset: usize) -> Result<Expr, ExprError> {
        let func = Function::from_name(name).ok_or_else(|| ExprError {
            message: "unexpected function name".into(),
            offset,
        })?;
        self.expect_op("(")?;

        let mut args = vec![];
        if self.peek() == Some(&Token::Op(")")) {
            self.pos += 1;
        } else {
            loop {
                args.push(self.expr(0)?);
                match self.advance() {
                    Some(Token::Op(",")) => continue,
                    Some(Token::Op(")")) => break,
                    _ => return Err(self.error("expected \",\" or \")\"")),
                }
            }
        }

        if !func.arity().accepts(args.len()) {
            return Err(ExprError {
                message: format!("unexpected number of arguments ({name})"),
                offset,
            });
        }

        // seeded functions default to the shared :default_seed
        match func {
            Function::HashFnv1a | Function::HashMurmur2 if args.len() == 1 => {
                args.push(Expr::var("default_seed"))
            }
            Function::Permute if args.len() == 2 => args.push(Expr::var("default_seed")),
            _ => {}
        }

        Ok(Expr::call(func, args))
    }
}

fn is(lhs: Expr, rhs: Value) -> Expr {
    Expr::op(Function::Is, lhs, Expr::Constant(rhs))
}

fn not(e: Expr) -> Expr {
    Expr::call(Function::Not, vec![e])
}

fn binary(op: &str, lhs: Expr, rhs: Expr) -> Expr {
    let func = match op {
        "+" => Function::Add,
        "-" => Function::Sub,
        "*" => Function::Mul,
        "/" => Function::Div,
        "%" => Function::Mod,
        "=" => Function::Eq,
        "<>" | "!=" => Function::Ne,
        "<" => Function::Lt,
        "<=" => Function::Le,
        ">" => return Expr::op(Function::Lt, rhs, lhs),
        ">=" => return Expr::op(Function::Le, rhs, lhs),
        "&" => Function::BitAnd,
        "|" => Function::BitOr,
        "<<" => Function::LeftShift,
        ">>" => Function::RightShift,
        // "#" and "^"
        _ => Function::BitXor,
    };
    Expr::op(func, lhs, rhs)
}

fn number_literal(text: &str) -> Result<Expr, String> {
    if text.contains(|c| matches!(c, '.' | 'e' | 'E')) {
        text.parse::<f64>()
            .map(Expr::double)
            .map_err(|_| format!("invalid number \"{text}\""))
    } else {
        text.parse::<i64>()
            .map(Expr::int)
            .map_err(|_| format!("bigint constant overflow \"{text}\""))
    }
}

/// Parses the text of a `\set` or `\if` expression.
pub fn parse_expression(text: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: text.len(),
    };
    let expr = parser.expr(0)?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("syntax error"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::expr::ast::Function::*;

    fn parse(s: &str) -> Expr {
        parse_expression(s).unwrap()
    }

    #[test]
    fn precedence() {
        assert_eq!(
            parse("1 + 2 * 3"),
            Expr::op(Add, Expr::int(1), Expr::op(Mul, Expr::int(2), Expr::int(3)))
        );
        assert_eq!(
            parse("(1 + 2) * 3"),
            Expr::op(Mul, Expr::op(Add, Expr::int(1), Expr::int(2)), Expr::int(3))
        );
        assert_eq!(
            parse("1 - 2 - 3"),
            Expr::op(Sub, Expr::op(Sub, Expr::int(1), Expr::int(2)), Expr::int(3))
        );
    }

    #[test]
    fn comparisons_are_lowered() {
        assert_eq!(parse(":a > 1"), Expr::op(Lt, Expr::int(1), Expr::var("a")));
        assert_eq!(parse(":a >= 1"), Expr::op(Le, Expr::int(1), Expr::var("a")));
        assert_eq!(parse(":a != 1"), Expr::op(Ne, Expr::var("a"), Expr::int(1)));
    }

    #[test]
    fn comparisons_do_not_chain() {
        assert!(parse_expression("1 < 2 < 3").is_err());
        assert!(parse_expression("1 < 2 = true").is_err());
    }

    #[test]
    fn unary_operators() {
        assert_eq!(parse("-:x"), Expr::op(Sub, Expr::int(0), Expr::var("x")));
        assert_eq!(parse("-9223372036854775808"), Expr::int(i64::MIN));
        assert_eq!(parse("~ 5"), Expr::op(BitXor, Expr::int(-1), Expr::int(5)));
        assert_eq!(
            parse("-2 * 3"),
            Expr::op(Mul, Expr::op(Sub, Expr::int(0), Expr::int(2)), Expr::int(3))
        );
        assert!(parse_expression("9223372036854775808").is_err());
    }

    #[test]
    fn boolean_keywords() {
        assert_eq!(
            parse("NOT true OR false AND :b"),
            Expr::op(
                Or,
                Expr::call(Not, vec![Expr::bool(true)]),
                Expr::op(And, Expr::bool(false), Expr::var("b"))
            )
        );
        assert_eq!(parse(":x is null"), Expr::op(Is, Expr::var("x"), Expr::null()));
        assert_eq!(
            parse(":x IS NOT TRUE"),
            Expr::call(Not, vec![Expr::op(Is, Expr::var("x"), Expr::bool(true))])
        );
        assert_eq!(
            parse(":x notnull"),
            Expr::call(Not, vec![Expr::op(Is, Expr::var("x"), Expr::null())])
        );
    }

    #[test]
    fn case_expression() {
        assert_eq!(
            parse("CASE WHEN :a = 1 THEN 10 WHEN :a = 2 THEN 20 END"),
            Expr::call(
                Case,
                vec![
                    Expr::op(Eq, Expr::var("a"), Expr::int(1)),
                    Expr::int(10),
                    Expr::op(Eq, Expr::var("a"), Expr::int(2)),
                    Expr::int(20),
                    Expr::null(),
                ]
            )
        );
        assert!(parse_expression("case when true then 1").is_err());
    }

    #[test]
    fn functions() {
        assert_eq!(
            parse("random(1, 100000 * :scale)"),
            Expr::op(
                Random,
                Expr::int(1),
                Expr::op(Mul, Expr::int(100000), Expr::var("scale"))
            )
        );
        assert_eq!(parse("pi()"), Expr::call(Pi, vec![]));
        assert_eq!(
            parse("hash(:x)"),
            Expr::op(HashMurmur2, Expr::var("x"), Expr::var("default_seed"))
        );
        assert_eq!(
            parse("permute(1, 10)"),
            Expr::call(
                Permute,
                vec![Expr::int(1), Expr::int(10), Expr::var("default_seed")]
            )
        );
        assert_eq!(parse("mod(7, 3)"), Expr::op(Mod, Expr::int(7), Expr::int(3)));
    }

    #[test]
    fn literals() {
        assert_eq!(parse("1.5"), Expr::double(1.5));
        assert_eq!(parse(".5"), Expr::double(0.5));
        assert_eq!(parse("1e3"), Expr::double(1000.0));
        assert_eq!(parse("TRUE"), Expr::bool(true));
    }

    #[test]
    fn errors_carry_offsets() {
        let err = parse_expression("1 + foo(2)").unwrap_err();
        assert_eq!(err.message, "unexpected function name");
        assert_eq!(err.offset, 4);

        let err = parse_expression("abs(1, 2)").unwrap_err();
        assert_eq!(err.message, "unexpected number of arguments (abs)");

        let err = parse_expression("1 $ 2").unwrap_err();
        assert_eq!(err.offset, 2);

        let err = parse_expression("1 2").unwrap_err();
        assert_eq!(err.offset, 2);

        assert!(parse_expression("").is_err());
        assert!(parse_expression("(1").is_err());
    }
}
