// AST interpreter for the arithmetic grammar.

use std::time::Instant;

use super::parser::{parse_with_limits, Expr, Op};
use super::EvalLimits;
use crate::error::{EngineError, EngineResult};

/// Parse and evaluate `text` on the calling thread.
pub fn evaluate(text: &str, limits: &EvalLimits) -> EngineResult<f64> {
    let expr = parse_with_limits(text, limits)?;
    let value = eval_expr(&expr)?;
    check_range(value, limits.max_magnitude)
}

/// Evaluate on the blocking pool under the configured hard deadline.
///
/// The interpreter checks the deadline at every node, so a run that overruns
/// stops on its own; the outer timeout only covers a stalled blocking pool.
pub async fn evaluate_with_timeout(text: &str, limits: &EvalLimits) -> EngineResult<f64> {
    let owned = text.to_string();
    let limits = *limits;
    let deadline = Instant::now() + limits.timeout;
    let task = tokio::task::spawn_blocking(move || evaluate_until(&owned, &limits, deadline));

    match tokio::time::timeout(limits.timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(EngineError::Evaluation(format!(
            "evaluator task failed: {}",
            join_err
        ))),
        Err(_) => Err(timed_out(&limits)),
    }
}

/// Like [`evaluate`], failing with `EvaluationTimeout` once `deadline` passes.
pub fn evaluate_until(text: &str, limits: &EvalLimits, deadline: Instant) -> EngineResult<f64> {
    let expr = parse_with_limits(text, limits)?;
    let walker = Walker {
        deadline: Some(deadline),
        limits,
    };
    let value = walker.eval(&expr)?;
    check_range(value, limits.max_magnitude)
}

pub fn eval_expr(expr: &Expr) -> EngineResult<f64> {
    let limits = EvalLimits::default();
    Walker {
        deadline: None,
        limits: &limits,
    }
    .eval(expr)
}

fn timed_out(limits: &EvalLimits) -> EngineError {
    EngineError::EvaluationTimeout(limits.timeout.as_millis() as u64)
}

struct Walker<'a> {
    deadline: Option<Instant>,
    limits: &'a EvalLimits,
}

impl Walker<'_> {
    fn eval(&self, expr: &Expr) -> EngineResult<f64> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(timed_out(self.limits));
        }
        match expr {
            Expr::Number(n) => Ok(*n),
            Expr::BinaryOp { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                match op {
                    Op::Add => Ok(l + r),
                    Op::Sub => Ok(l - r),
                    Op::Mul => Ok(l * r),
                    Op::Div => {
                        if r == 0.0 {
                            Err(EngineError::Evaluation("division by zero".to_string()))
                        } else {
                            Ok(l / r)
                        }
                    }
                }
            }
            Expr::Function { func, args } => {
                let values = args.iter().map(|a| self.eval(a)).collect::<EngineResult<Vec<f64>>>()?;
                func.apply(&values)
            }
        }
    }
}

fn check_range(value: f64, max_magnitude: f64) -> EngineResult<f64> {
    if !value.is_finite() || value.abs() > max_magnitude {
        return Err(EngineError::ResultOutOfRange(value));
    }
    // Normalize -0 so "0 - 0" formats as "0".
    if value == 0.0 {
        return Ok(0.0);
    }
    Ok(value)
}
