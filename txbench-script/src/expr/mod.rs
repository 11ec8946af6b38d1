//! The expression language of `\set` and `\if`.

mod ast;
mod eval;
mod parse;

pub use ast::{Arity, Expr, Function};
pub use eval::EvalContext;
pub use parse::{parse_expression, ExprError};
