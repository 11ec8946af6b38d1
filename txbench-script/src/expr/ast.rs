use std::fmt;

use crate::value::Value;

/// A parsed expression. Surface syntax such as `a > b`, `-x` or `x IS NULL` is lowered to
/// function calls by the parser, so evaluation only ever sees these three node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(Value),
    Variable(String),
    Function { func: Function, args: Vec<Expr> },
}

impl Expr {
    pub fn int(i: i64) -> Self {
        Expr::Constant(Value::Int(i))
    }

    pub fn double(d: f64) -> Self {
        Expr::Constant(Value::Double(d))
    }

    pub fn bool(b: bool) -> Self {
        Expr::Constant(Value::Bool(b))
    }

    pub fn null() -> Self {
        Expr::Constant(Value::Null)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    pub fn call(func: Function, args: Vec<Expr>) -> Self {
        Expr::Function { func, args }
    }

    pub fn op(func: Function, lhs: Expr, rhs: Expr) -> Self {
        Expr::Function {
            func,
            args: vec![lhs, rhs],
        }
    }
}

/// How many arguments a function accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::Between(lo, hi) => (lo..=hi).contains(&n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Le,
    Lt,
    BitAnd,
    BitOr,
    BitXor,
    LeftShift,
    RightShift,
    Not,
    And,
    Or,
    Case,
    Is,
    Abs,
    Debug,
    Pi,
    Sqrt,
    Ln,
    Exp,
    Pow,
    Int,
    Double,
    Least,
    Greatest,
    Random,
    RandomExponential,
    RandomGaussian,
    RandomZipfian,
    HashFnv1a,
    HashMurmur2,
    Permute,
}

/// Functions callable by name from scripts, with the name they are called by.
const NAMED: &[(&str, Function)] = &[
    ("abs", Function::Abs),
    ("debug", Function::Debug),
    ("double", Function::Double),
    ("exp", Function::Exp),
    ("greatest", Function::Greatest),
    ("hash", Function::HashMurmur2),
    ("hash_fnv1a", Function::HashFnv1a),
    ("hash_murmur2", Function::HashMurmur2),
    ("int", Function::Int),
    ("least", Function::Least),
    ("ln", Function::Ln),
    ("mod", Function::Mod),
    ("permute", Function::Permute),
    ("pi", Function::Pi),
    ("pow", Function::Pow),
    ("power", Function::Pow),
    ("random", Function::Random),
    ("random_exponential", Function::RandomExponential),
    ("random_gaussian", Function::RandomGaussian),
    ("random_zipfian", Function::RandomZipfian),
    ("sqrt", Function::Sqrt),
];

impl Function {
    /// Looks up a function by the (case-insensitive) name scripts call it by.
    pub fn from_name(name: &str) -> Option<Function> {
        NAMED
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, f)| *f)
    }

    pub fn arity(self) -> Arity {
        use Function::*;
        match self {
            Pi => Arity::Exactly(0),
            Abs | Debug | Sqrt | Ln | Exp | Int | Double | Not => Arity::Exactly(1),
            Least | Greatest => Arity::AtLeast(1),
            Case => Arity::AtLeast(2),
            HashFnv1a | HashMurmur2 => Arity::Between(1, 2),
            Permute => Arity::Between(2, 3),
            RandomExponential | RandomGaussian | RandomZipfian => Arity::Exactly(3),
            Add | Sub | Mul | Div | Mod | Eq | Ne | Le | Lt | BitAnd | BitOr | BitXor
            | LeftShift | RightShift | And | Or | Is | Pow | Random => Arity::Exactly(2),
        }
    }

    /// Whether arguments are evaluated on demand rather than up front.
    pub fn is_lazy(self) -> bool {
        matches!(self, Function::And | Function::Or | Function::Case)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Function::*;
        let s = match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "mod",
            Eq => "=",
            Ne => "<>",
            Le => "<=",
            Lt => "<",
            BitAnd => "&",
            BitOr => "|",
            BitXor => "#",
            LeftShift => "<<",
            RightShift => ">>",
            Not => "not",
            And => "and",
            Or => "or",
            Case => "case",
            Is => "is",
            other => {
                return match NAMED.iter().find(|(_, func)| func == other) {
                    Some((name, _)) => f.write_str(name),
                    None => write!(f, "{other:?}"),
                }
            }
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(Function::from_name("RANDOM"), Some(Function::Random));
        assert_eq!(Function::from_name("power"), Some(Function::Pow));
        assert_eq!(Function::from_name("hash"), Some(Function::HashMurmur2));
        assert_eq!(Function::from_name("and"), None);
    }

    #[test]
    fn arity() {
        assert!(Function::Permute.arity().accepts(2));
        assert!(Function::Permute.arity().accepts(3));
        assert!(!Function::Permute.arity().accepts(4));
        assert!(!Function::Least.arity().accepts(0));
        assert!(Function::Pi.arity().accepts(0));
    }
}
