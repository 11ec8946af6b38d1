use std::f64::consts::PI;

use crate::error::EvalError;
use crate::expr::ast::{Expr, Function};
use crate::random::{
    self, BenchRng, MAX_ZIPFIAN_PARAM, MIN_GAUSSIAN_PARAM, MIN_ZIPFIAN_PARAM,
};
use crate::value::Value;
use crate::variables::Variables;

/// Everything an expression can read or mutate while being evaluated.
pub struct EvalContext<'a> {
    pub variables: &'a mut Variables,
    pub rng: &'a mut BenchRng,
    /// Script and command index, reported by `debug()`
    pub location: (usize, usize),
}

impl Expr {
    pub fn evaluate(&self, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
        match self {
            Expr::Constant(v) => Ok(*v),
            Expr::Variable(name) => ctx.variables.get_value(name),
            Expr::Function { func, args } if func.is_lazy() => eval_lazy(*func, args, ctx),
            Expr::Function { func, args } => {
                let values = args
                    .iter()
                    .map(|a| a.evaluate(ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                eval_standard(*func, &values, ctx)
            }
        }
    }
}

fn eval_lazy(
    func: Function,
    args: &[Expr],
    ctx: &mut EvalContext<'_>,
) -> Result<Value, EvalError> {
    match func {
        Function::And | Function::Or => {
            let short_circuit = func == Function::Or;
            let first = args[0].evaluate(ctx)?;
            if first.is_null() {
                return Ok(Value::Null);
            }
            if first.to_bool()? == short_circuit {
                return Ok(Value::Bool(short_circuit));
            }
            let second = args[1].evaluate(ctx)?;
            if second.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Bool(second.to_bool()?))
        }
        Function::Case => {
            // (when, then) pairs followed by an optional default
            let mut pairs = args.chunks_exact(2);
            for pair in pairs.by_ref() {
                if pair[0].evaluate(ctx)?.truth() {
                    return pair[1].evaluate(ctx);
                }
            }
            match pairs.remainder() {
                [default] => default.evaluate(ctx),
                _ => Ok(Value::Null),
            }
        }
        _ => unreachable!("{func} is not lazy"),
    }
}

fn int_args(values: &[Value]) -> Result<Vec<i64>, EvalError> {
    values.iter().map(Value::to_int).collect()
}

fn random_range(min: i64, max: i64) -> Result<(), EvalError> {
    if max < min {
        return Err(EvalError::InvalidArgument(
            "empty range given to random".into(),
        ));
    }
    if max.checked_sub(min).and_then(|w| w.checked_add(1)).is_none() {
        return Err(EvalError::InvalidArgument(
            "random range is too large".into(),
        ));
    }
    Ok(())
}

fn shift(value: i64, amount: i64, left: bool) -> Result<Value, EvalError> {
    if amount < 0 {
        return Err(EvalError::InvalidArgument(format!(
            "negative shift amount {amount}"
        )));
    }
    Ok(Value::Int(match (left, amount) {
        (true, a) if a >= 64 => 0,
        (true, a) => value << a,
        (false, a) if a >= 64 => value >> 63,
        (false, a) => value >> a,
    }))
}

fn arithmetic(func: Function, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    let doubles = func != Function::Mod
        && (matches!(lhs, Value::Double(_)) || matches!(rhs, Value::Double(_)));

    if doubles {
        let (l, r) = (lhs.to_double()?, rhs.to_double()?);
        return Ok(match func {
            Function::Add => Value::Double(l + r),
            Function::Sub => Value::Double(l - r),
            Function::Mul => Value::Double(l * r),
            Function::Div => Value::Double(l / r),
            Function::Eq => Value::Bool(l == r),
            Function::Ne => Value::Bool(l != r),
            Function::Le => Value::Bool(l <= r),
            Function::Lt => Value::Bool(l < r),
            _ => unreachable!(),
        });
    }

    let (l, r) = (lhs.to_int()?, rhs.to_int()?);
    Ok(match func {
        Function::Add => Value::Int(l.checked_add(r).ok_or(EvalError::Overflow("add"))?),
        Function::Sub => Value::Int(l.checked_sub(r).ok_or(EvalError::Overflow("sub"))?),
        Function::Mul => Value::Int(l.checked_mul(r).ok_or(EvalError::Overflow("mul"))?),
        Function::Div | Function::Mod => {
            if r == 0 {
                return Err(EvalError::DivisionByZero);
            }
            if r == -1 {
                if func == Function::Mod {
                    return Ok(Value::Int(0));
                }
                return l
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or(EvalError::Overflow("div"));
            }
            Value::Int(if func == Function::Div { l / r } else { l % r })
        }
        Function::Eq => Value::Bool(l == r),
        Function::Ne => Value::Bool(l != r),
        Function::Le => Value::Bool(l <= r),
        Function::Lt => Value::Bool(l < r),
        _ => unreachable!(),
    })
}

fn eval_standard(
    func: Function,
    args: &[Value],
    ctx: &mut EvalContext<'_>,
) -> Result<Value, EvalError> {
    use Function::*;

    // NULL in, NULL out, except for the two functions that look at NULLs
    if func != Is && func != Debug && args.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }

    match func {
        Add | Sub | Mul | Div | Mod | Eq | Ne | Le | Lt => arithmetic(func, args[0], args[1]),

        BitAnd | BitOr | BitXor | LeftShift | RightShift => {
            let (l, r) = (args[0].to_int()?, args[1].to_int()?);
            match func {
                BitAnd => Ok(Value::Int(l & r)),
                BitOr => Ok(Value::Int(l | r)),
                BitXor => Ok(Value::Int(l ^ r)),
                LeftShift => shift(l, r, true),
                _ => shift(l, r, false),
            }
        }

        Not => Ok(Value::Bool(!args[0].to_bool()?)),

        Is => Ok(Value::Bool(match (args[0], args[1]) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            _ => false,
        })),

        Abs => match args[0] {
            Value::Double(d) => Ok(Value::Double(d.abs())),
            v => v
                .to_int()?
                .checked_abs()
                .map(Value::Int)
                .ok_or(EvalError::Overflow("abs")),
        },

        Debug => {
            let v = args[0];
            let shown = match v {
                Value::Null => "null".to_owned(),
                v => format!("{} {v}", v.type_name()),
            };
            tracing::info!(
                target: "txbench::debug",
                "debug(script={},command={}): {shown}",
                ctx.location.0,
                ctx.location.1,
            );
            Ok(v)
        }

        Double => Ok(Value::Double(args[0].to_double()?)),
        Int => Ok(Value::Int(args[0].to_int()?)),
        Pi => Ok(Value::Double(PI)),
        Sqrt => Ok(Value::Double(args[0].to_double()?.sqrt())),
        Ln => Ok(Value::Double(args[0].to_double()?.ln())),
        Exp => Ok(Value::Double(args[0].to_double()?.exp())),
        Pow => Ok(Value::Double(
            args[0].to_double()?.powf(args[1].to_double()?),
        )),

        Least | Greatest => {
            let pick_first = |a, b| if func == Least { a < b } else { a > b };
            if args.iter().any(|v| matches!(v, Value::Double(_))) {
                let mut best = args[0].to_double()?;
                for v in &args[1..] {
                    let d = v.to_double()?;
                    if pick_first(d, best) {
                        best = d;
                    }
                }
                Ok(Value::Double(best))
            } else {
                let ints = int_args(args)?;
                let best = if func == Least {
                    ints.iter().min()
                } else {
                    ints.iter().max()
                };
                Ok(Value::Int(*best.unwrap_or(&0)))
            }
        }

        Random | RandomExponential | RandomGaussian | RandomZipfian => {
            let (min, max) = (args[0].to_int()?, args[1].to_int()?);
            random_range(min, max)?;
            match func {
                Random => Ok(Value::Int(ctx.rng.uniform(min, max))),
                RandomExponential => {
                    let param = args[2].to_double()?;
                    if param <= 0.0 {
                        return Err(EvalError::InvalidArgument(format!(
                            "exponential parameter must be greater than zero (got {param:.6})"
                        )));
                    }
                    Ok(Value::Int(ctx.rng.exponential(min, max, param)))
                }
                RandomGaussian => {
                    let param = args[2].to_double()?;
                    if param < MIN_GAUSSIAN_PARAM {
                        return Err(EvalError::InvalidArgument(format!(
                            "gaussian parameter must be at least {MIN_GAUSSIAN_PARAM:.6} (got {param:.6})"
                        )));
                    }
                    Ok(Value::Int(ctx.rng.gaussian(min, max, param)))
                }
                _ => {
                    let param = args[2].to_double()?;
                    if !(MIN_ZIPFIAN_PARAM..=MAX_ZIPFIAN_PARAM).contains(&param) {
                        return Err(EvalError::InvalidArgument(format!(
                            "zipfian parameter must be in range [{MIN_ZIPFIAN_PARAM:.3}, {MAX_ZIPFIAN_PARAM:.0}] (got {param})"
                        )));
                    }
                    Ok(Value::Int(ctx.rng.zipfian(min, max, param)))
                }
            }
        }

        HashFnv1a | HashMurmur2 => {
            let ints = int_args(args)?;
            let seed = ints.get(1).copied().unwrap_or(0);
            Ok(Value::Int(if func == HashFnv1a {
                random::hash_fnv1a(ints[0], seed)
            } else {
                random::hash_murmur2(ints[0], seed)
            }))
        }

        Permute => {
            let ints = int_args(args)?;
            let (val, size) = (ints[0], ints[1]);
            let seed = ints.get(2).copied().unwrap_or(0);
            if size <= 0 {
                return Err(EvalError::InvalidArgument(
                    "permute size parameter must be greater than zero".into(),
                ));
            }
            Ok(Value::Int(random::permute(val, size, seed)))
        }

        And | Or | Case => unreachable!("{func} arguments are evaluated lazily"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::expr::parse::parse_expression;
    use Function::*;

    fn eval_with(expr: &Expr, variables: &mut Variables) -> Result<Value, EvalError> {
        let mut rng = BenchRng::seed(7);
        let mut ctx = EvalContext {
            variables,
            rng: &mut rng,
            location: (0, 0),
        };
        expr.evaluate(&mut ctx)
    }

    fn eval(expr: &Expr) -> Result<Value, EvalError> {
        eval_with(expr, &mut Variables::new())
    }

    fn eval_str(s: &str) -> Result<Value, EvalError> {
        let mut vars = Variables::new();
        vars.set_int("default_seed", 12345).unwrap();
        eval_with(&parse_expression(s).unwrap(), &mut vars)
    }

    fn div_by_zero() -> Expr {
        Expr::op(Div, Expr::int(1), Expr::int(0))
    }

    #[test]
    fn lazy_boolean_operators_skip_second_operand() {
        assert_eq!(
            eval(&Expr::op(Or, Expr::bool(true), div_by_zero())),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            eval(&Expr::op(And, Expr::bool(false), div_by_zero())),
            Ok(Value::Bool(false))
        );
        assert_eq!(
            eval(&Expr::op(And, Expr::bool(true), div_by_zero())),
            Err(EvalError::DivisionByZero)
        );
        assert_eq!(
            eval(&Expr::op(Or, Expr::null(), div_by_zero())),
            Ok(Value::Null)
        );
    }

    #[test]
    fn case_returns_first_true_branch() {
        let case = Expr::call(
            Case,
            vec![
                Expr::bool(false),
                Expr::var("x"),
                Expr::bool(true),
                Expr::var("y"),
                Expr::var("z"),
            ],
        );
        let mut vars = Variables::new();
        vars.set_int("x", 1).unwrap();
        vars.set_int("y", 2).unwrap();
        vars.set_int("z", 3).unwrap();
        assert_eq!(eval_with(&case, &mut vars), Ok(Value::Int(2)));

        // unselected branches are never evaluated
        let case = Expr::call(Case, vec![Expr::int(0), div_by_zero(), Expr::int(9)]);
        assert_eq!(eval(&case), Ok(Value::Int(9)));
        let case = Expr::call(Case, vec![Expr::null(), Expr::int(1)]);
        assert_eq!(eval(&case), Ok(Value::Null));
    }

    #[test]
    fn integer_overflow_raises() {
        assert_eq!(eval_str("9223372036854775807 + 1"), Err(EvalError::Overflow("add")));
        assert_eq!(eval_str("-9223372036854775808 - 1"), Err(EvalError::Overflow("sub")));
        assert_eq!(eval_str("4611686018427387904 * 2"), Err(EvalError::Overflow("mul")));
        assert_eq!(eval_str("-9223372036854775808 / -1"), Err(EvalError::Overflow("div")));
        assert_eq!(eval_str("abs(-9223372036854775808)"), Err(EvalError::Overflow("abs")));
        assert_eq!(eval_str("-9223372036854775808 % -1"), Ok(Value::Int(0)));
    }

    #[test]
    fn division_and_modulo() {
        assert_eq!(eval_str("7 / 2"), Ok(Value::Int(3)));
        assert_eq!(eval_str("-7 % 3"), Ok(Value::Int(-1)));
        assert_eq!(eval_str("7 % 0"), Err(EvalError::DivisionByZero));
        assert_eq!(eval_str("7 / 0"), Err(EvalError::DivisionByZero));
        assert_eq!(eval_str("7.0 / 2"), Ok(Value::Double(3.5)));
        assert_eq!(eval_str("mod(7.4, 3)"), Ok(Value::Int(1)));
    }

    #[test]
    fn int_of_nan_raises() {
        let nan = Expr::call(Function::Int, vec![Expr::double(f64::NAN)]);
        assert!(matches!(eval(&nan), Err(EvalError::Coercion(_))));
        assert_eq!(eval_str("int(2.5)"), Ok(Value::Int(2)));
        assert_eq!(eval_str("int(-3.5)"), Ok(Value::Int(-4)));
    }

    #[test]
    fn null_propagation() {
        assert_eq!(
            eval(&Expr::op(Add, Expr::null(), Expr::int(1))),
            Ok(Value::Null)
        );
        assert_eq!(
            eval(&Expr::op(Is, Expr::null(), Expr::null())),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            eval(&Expr::call(Not, vec![Expr::null()])),
            Ok(Value::Null)
        );
        assert_eq!(
            eval(&Expr::call(Debug, vec![Expr::null()])),
            Ok(Value::Null)
        );
        assert_eq!(eval_str("1 is null"), Ok(Value::Bool(false)));
        assert_eq!(eval_str("null notnull"), Ok(Value::Bool(false)));
    }

    #[test]
    fn promotion_and_comparison() {
        assert_eq!(eval_str("1 + 2.5"), Ok(Value::Double(3.5)));
        assert_eq!(eval_str("3 > 2.5"), Ok(Value::Bool(true)));
        assert_eq!(eval_str("2 <> 2"), Ok(Value::Bool(false)));
        assert!(eval_str("true = true").is_err());
        assert_eq!(eval_str("true is true"), Ok(Value::Bool(true)));
        assert_eq!(eval_str("1 is true"), Ok(Value::Bool(false)));
    }

    #[test]
    fn bitwise() {
        assert_eq!(eval_str("6 & 3"), Ok(Value::Int(2)));
        assert_eq!(eval_str("6 | 3"), Ok(Value::Int(7)));
        assert_eq!(eval_str("6 # 3"), Ok(Value::Int(5)));
        assert_eq!(eval_str("~0"), Ok(Value::Int(-1)));
        assert_eq!(eval_str("1 << 4"), Ok(Value::Int(16)));
        assert_eq!(eval_str("-16 >> 2"), Ok(Value::Int(-4)));
        assert_eq!(eval_str("1 << 64"), Ok(Value::Int(0)));
        assert!(eval_str("1 << -1").is_err());
    }

    #[test]
    fn math_functions() {
        assert_eq!(eval_str("abs(-5)"), Ok(Value::Int(5)));
        assert_eq!(eval_str("abs(-5.5)"), Ok(Value::Double(5.5)));
        assert_eq!(eval_str("least(5, 2, 9)"), Ok(Value::Int(2)));
        assert_eq!(eval_str("greatest(5, 2.5, 9)"), Ok(Value::Double(9.0)));
        assert_eq!(eval_str("pow(2, 10)"), Ok(Value::Double(1024.0)));
        assert_eq!(eval_str("sqrt(16)"), Ok(Value::Double(4.0)));
        assert_eq!(eval_str("double(3)"), Ok(Value::Double(3.0)));
        assert_eq!(eval_str("pi()"), Ok(Value::Double(PI)));
        assert_eq!(eval_str("exp(0)"), Ok(Value::Double(1.0)));
        assert_eq!(eval_str("ln(1)"), Ok(Value::Double(0.0)));
    }

    #[test]
    fn boolean_coercion_in_logic() {
        assert!(matches!(eval_str("1 and true"), Err(EvalError::Coercion(_))));
        assert_eq!(eval_str("not false"), Ok(Value::Bool(true)));
        assert_eq!(
            eval_str("case when 0 then 1 when 2 then 3 else 4 end"),
            Ok(Value::Int(3))
        );
    }

    #[test]
    fn random_bounds() {
        assert_eq!(eval_str("random(5, 5)"), Ok(Value::Int(5)));
        assert_eq!(
            eval_str("random(6, 5)"),
            Err(EvalError::InvalidArgument("empty range given to random".into()))
        );
        assert_eq!(
            eval_str("random(-9223372036854775808, 9223372036854775807)"),
            Err(EvalError::InvalidArgument("random range is too large".into()))
        );
        let Ok(Value::Int(v)) = eval_str("random_exponential(1, 10, 3.0)") else {
            panic!("expected int");
        };
        assert!((1..=10).contains(&v));
    }

    #[test]
    fn distribution_parameters_are_checked() {
        assert!(eval_str("random_exponential(1, 10, 0)").is_err());
        assert!(eval_str("random_gaussian(1, 10, 1.9)").is_err());
        assert!(eval_str("random_gaussian(1, 10, 2.0)").is_ok());
        assert!(eval_str("random_zipfian(1, 10, 1.0)").is_err());
        assert!(eval_str("random_zipfian(1, 10, 1000.5)").is_err());
        assert!(eval_str("random_zipfian(1, 10, 1.001)").is_ok());
    }

    #[test]
    fn hashes_use_default_seed() {
        assert_eq!(
            eval_str("hash(42)"),
            Ok(Value::Int(random::hash_murmur2(42, 12345)))
        );
        assert_eq!(
            eval_str("hash_fnv1a(42, 1)"),
            Ok(Value::Int(random::hash_fnv1a(42, 1)))
        );
        assert_eq!(
            eval_str("permute(3, 10)"),
            Ok(Value::Int(random::permute(3, 10, 12345)))
        );
        assert!(eval_str("permute(3, 0)").is_err());
    }

    #[test]
    fn variables_are_read() {
        let mut vars = Variables::new();
        vars.set_string("aid", "41").unwrap();
        let e = parse_expression(":aid + 1").unwrap();
        assert_eq!(eval_with(&e, &mut vars), Ok(Value::Int(42)));
        let e = parse_expression(":nope + 1").unwrap();
        assert_eq!(
            eval_with(&e, &mut vars),
            Err(EvalError::UndefinedVariable("nope".into()))
        );
    }
}
