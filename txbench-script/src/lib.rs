//! The benchmark script language.
//!
//! Scripts mix SQL statements with backslash meta-commands that set variables from arithmetic
//! expressions, call out to the shell, sleep, branch with `\if`, and batch statements into
//! pipelines. This crate parses scripts into [`Script`]s and evaluates their expressions; running
//! them against a database is the job of the `txbench` driver.

pub mod builtin;
pub mod conditional;
mod error;
pub mod expr;
pub mod random;
mod scan;
pub mod script;
pub mod value;
pub mod variables;

pub use crate::builtin::{find_builtin, Builtin, BuiltinError, BUILTINS};
pub use crate::conditional::{ConditionalStack, IfState};
pub use crate::error::{EvalError, ParseError};
pub use crate::expr::{parse_expression, EvalContext, Expr, ExprError, Function};
pub use crate::random::BenchRng;
pub use crate::script::{
    parse_weight, Capture, CaptureKind, Command, CommandKind, Meta, QueryMode, Script,
    ScriptParser, ScriptSet, SleepDuration, SleepUnit, SqlCommand,
};
pub use crate::value::Value;
pub use crate::variables::Variables;
