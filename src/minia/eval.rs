use super::ast::{Assignment, BinaryOp, Expr};
use super::error::MiniaError;
use super::parser::Parser;
use crate::feature::{hash_str_to_i64, FeatureMap, FeatureValue};

/// A compiled `name = expr;` list: the ordered output names plus the AST
/// needed to evaluate them.
#[derive(Debug, Clone)]
pub struct Program {
    assignments: Vec<Assignment>,
    output_names: Vec<String>,
}

impl Program {
    pub fn compile(text: &str) -> Result<Self, MiniaError> {
        let assignments = Parser::new(text)?.parse()?;
        let output_names = assignments.iter().map(|a| a.name.clone()).collect();
        Ok(Self {
            assignments,
            output_names,
        })
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Evaluates every assignment in declaration order, writing each result
    /// back into `map`.
    pub fn call(&self, map: &mut FeatureMap) -> Result<(), MiniaError> {
        for assign in &self.assignments {
            let value = eval_expr(&assign.expr, map, None)?;
            map.insert(assign.name.clone(), value);
        }
        Ok(())
    }

    /// Cross form: `a` and `b` stay read-only; every produced name is
    /// written into `out`. Identifier lookup checks `a` first, then `b`.
    pub fn call_cross(
        &self,
        out: &mut FeatureMap,
        a: &FeatureMap,
        b: &FeatureMap,
    ) -> Result<(), MiniaError> {
        for assign in &self.assignments {
            let value = eval_expr(&assign.expr, a, Some(b))?;
            out.insert(assign.name.clone(), value);
        }
        Ok(())
    }
}

fn lookup(name: &str, primary: &FeatureMap, secondary: Option<&FeatureMap>) -> FeatureValue {
    primary
        .get(name)
        .or_else(|| secondary.and_then(|m| m.get(name)))
        .cloned()
        .unwrap_or(FeatureValue::Int(0))
}

fn eval_expr(
    expr: &Expr,
    primary: &FeatureMap,
    secondary: Option<&FeatureMap>,
) -> Result<FeatureValue, MiniaError> {
    match expr {
        Expr::IntLit(n) => Ok(FeatureValue::Int(*n)),
        Expr::FloatLit(f) => Ok(FeatureValue::Float(*f as f32)),
        Expr::StrLit(s) => Ok(FeatureValue::Int(hash_str_to_i64(s))),
        Expr::Ident(name) => Ok(lookup(name, primary, secondary)),
        Expr::Neg(inner) => Ok(neg(eval_expr(inner, primary, secondary)?)),
        Expr::Binary { left, op, right } => {
            let l = eval_expr(left, primary, secondary)?;
            let r = eval_expr(right, primary, secondary)?;
            Ok(apply_binary(*op, l, r))
        }
        Expr::Call { func, args } => eval_call(func, args, primary, secondary),
    }
}

fn eval_call(
    func: &str,
    args: &[Expr],
    primary: &FeatureMap,
    secondary: Option<&FeatureMap>,
) -> Result<FeatureValue, MiniaError> {
    match func {
        "hash" => {
            if args.len() != 1 {
                return Err(MiniaError::ArityMismatch("hash", 1));
            }
            // A literal string hashes directly; anything that evaluates to
            // an int is already a hashed key and passes through unchanged.
            if let Expr::StrLit(s) = &args[0] {
                return Ok(FeatureValue::Int(hash_str_to_i64(s)));
            }
            Ok(hash_value(eval_expr(&args[0], primary, secondary)?))
        }
        "identity" => {
            if args.len() != 1 {
                return Err(MiniaError::ArityMismatch("identity", 1));
            }
            eval_expr(&args[0], primary, secondary)
        }
        "cross" => {
            if args.len() != 2 {
                return Err(MiniaError::ArityMismatch("cross", 2));
            }
            let a = eval_expr(&args[0], primary, secondary)?;
            let b = eval_expr(&args[1], primary, secondary)?;
            Ok(cross_combine(a, b))
        }
        other => Err(MiniaError::UnknownFunction(other.to_string())),
    }
}

/// Hashes a value already in the pipeline. Ints pass through (they are
/// assumed to already be hash keys); floats and arrays hash their decimal
/// text representation element-wise, matching the "hash(string) -> int64"
/// contract for values that didn't arrive as a literal.
fn hash_value(value: FeatureValue) -> FeatureValue {
    match value {
        FeatureValue::Int(v) => FeatureValue::Int(v),
        FeatureValue::Float(f) => FeatureValue::Int(hash_str_to_i64(&f.to_string())),
        FeatureValue::IntArray(v) => FeatureValue::IntArray(v),
        FeatureValue::FloatArray(v) => FeatureValue::IntArray(
            v.into_iter()
                .map(|f| hash_str_to_i64(&f.to_string()))
                .collect(),
        ),
    }
}

/// Combines two int keys into one via multiplicative hash-combine, modulo
/// 2^64 (wrapping). Used to build cross-feature embedding keys from two
/// already-hashed identifiers.
fn cross_combine(a: FeatureValue, b: FeatureValue) -> FeatureValue {
    const MULT: i64 = 1_000_003;
    match (a, b) {
        (FeatureValue::IntArray(a), FeatureValue::IntArray(b)) => {
            FeatureValue::IntArray(a.iter().zip(b.iter()).map(|(x, y)| combine_i64(*x, *y, MULT)).collect())
        }
        (a, b) => {
            let x = a.as_int().unwrap_or(0);
            let y = b.as_int().unwrap_or(0);
            FeatureValue::Int(combine_i64(x, y, MULT))
        }
    }
}

fn combine_i64(x: i64, y: i64, mult: i64) -> i64 {
    x.wrapping_mul(mult) ^ y
}

fn neg(value: FeatureValue) -> FeatureValue {
    match value {
        FeatureValue::Int(v) => FeatureValue::Int(v.wrapping_neg()),
        FeatureValue::Float(v) => FeatureValue::Float(-v),
        FeatureValue::IntArray(v) => FeatureValue::IntArray(v.iter().map(|x| x.wrapping_neg()).collect()),
        FeatureValue::FloatArray(v) => FeatureValue::FloatArray(v.iter().map(|x| -x).collect()),
    }
}

fn apply_binary(op: BinaryOp, left: FeatureValue, right: FeatureValue) -> FeatureValue {
    use FeatureValue::*;
    match (left, right) {
        (Int(l), Int(r)) => Int(apply_int(op, l, r)),
        (IntArray(l), IntArray(r)) => {
            IntArray(l.iter().zip(r.iter()).map(|(a, b)| apply_int(op, *a, *b)).collect())
        }
        (FloatArray(l), FloatArray(r)) => {
            FloatArray(l.iter().zip(r.iter()).map(|(a, b)| apply_float(op, *a, *b)).collect())
        }
        (l, r) => {
            let lf = l.as_float().unwrap_or(0.0);
            let rf = r.as_float().unwrap_or(0.0);
            Float(apply_float(op, lf, rf))
        }
    }
}

fn apply_int(op: BinaryOp, l: i64, r: i64) -> i64 {
    match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::Div => {
            if r == 0 {
                0
            } else {
                l.wrapping_div(r)
            }
        }
    }
}

fn apply_float(op: BinaryOp, l: f32, r: f32) -> f32 {
    match op {
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Mul => l * r,
        BinaryOp::Div => {
            if r == 0.0 {
                0.0
            } else {
                l / r
            }
        }
    }
}
