// Allow-listed functions callable from formula text.

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Abs,
    Round,
    Floor,
    Ceil,
    Pow,
    Sqrt,
    Min,
    Max,
}

pub const ALL_FUNCTIONS: &[Function] = &[
    Function::Abs,
    Function::Round,
    Function::Floor,
    Function::Ceil,
    Function::Pow,
    Function::Sqrt,
    Function::Min,
    Function::Max,
];

impl Function {
    /// Case-insensitive name lookup. `None` means the identifier is not allowed.
    pub fn from_name(name: &str) -> Option<Function> {
        match name.to_ascii_lowercase().as_str() {
            "abs" => Some(Function::Abs),
            "round" => Some(Function::Round),
            "floor" => Some(Function::Floor),
            "ceil" => Some(Function::Ceil),
            "pow" => Some(Function::Pow),
            "sqrt" => Some(Function::Sqrt),
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Abs => "abs",
            Function::Round => "round",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
            Function::Pow => "pow",
            Function::Sqrt => "sqrt",
            Function::Min => "min",
            Function::Max => "max",
        }
    }

    pub fn signature(self) -> &'static str {
        match self {
            Function::Abs => "abs(x)",
            Function::Round => "round(x[, digits])",
            Function::Floor => "floor(x)",
            Function::Ceil => "ceil(x)",
            Function::Pow => "pow(base, exponent)",
            Function::Sqrt => "sqrt(x)",
            Function::Min => "min(x, ...)",
            Function::Max => "max(x, ...)",
        }
    }

    /// Apply to already-evaluated arguments.
    pub fn apply(self, args: &[f64]) -> EngineResult<f64> {
        match self {
            Function::Abs => Ok(self.unary(args)?.abs()),
            Function::Floor => Ok(self.unary(args)?.floor()),
            Function::Ceil => Ok(self.unary(args)?.ceil()),
            Function::Sqrt => {
                let x = self.unary(args)?;
                if x < 0.0 {
                    return Err(EngineError::Evaluation("sqrt of a negative number".to_string()));
                }
                Ok(x.sqrt())
            }
            Function::Round => match args {
                [x] => Ok(x.round()),
                [x, digits] => {
                    if digits.fract() != 0.0 || !(0.0..=10.0).contains(digits) {
                        return Err(EngineError::Evaluation(
                            "round digits must be a whole number between 0 and 10".to_string(),
                        ));
                    }
                    let factor = 10f64.powi(*digits as i32);
                    Ok((x * factor).round() / factor)
                }
                _ => Err(self.arity_error()),
            },
            Function::Pow => match args {
                [base, exp] => Ok(base.powf(*exp)),
                _ => Err(self.arity_error()),
            },
            Function::Min => args
                .iter()
                .copied()
                .reduce(f64::min)
                .ok_or_else(|| self.arity_error()),
            Function::Max => args
                .iter()
                .copied()
                .reduce(f64::max)
                .ok_or_else(|| self.arity_error()),
        }
    }

    fn unary(self, args: &[f64]) -> EngineResult<f64> {
        match args {
            [x] => Ok(*x),
            _ => Err(self.arity_error()),
        }
    }

    fn arity_error(self) -> EngineError {
        EngineError::Evaluation(format!("wrong number of arguments: {}", self.signature()))
    }
}
