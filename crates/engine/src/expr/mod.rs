//! Restricted arithmetic: tokenizer, recursive-descent parser, AST interpreter.
//!
//! Input reaching this module has had every shortcode substituted, so field
//! values typed by end users flow straight in. Nothing here executes text;
//! anything outside the grammar is rejected at tokenization.

pub mod eval;
pub mod functions;
pub mod parser;

use std::time::Duration;

pub use eval::{evaluate, evaluate_until, evaluate_with_timeout};
pub use parser::{parse, Expr, Op};

/// Resource caps applied to every evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalLimits {
    pub max_length: usize,
    pub max_nesting: usize,
    /// Results with a larger absolute value are rejected.
    pub max_magnitude: f64,
    pub timeout: Duration,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            max_length: 4096,
            max_nesting: 64,
            max_magnitude: 1e15,
            timeout: Duration::from_millis(500),
        }
    }
}

/// True when `text` is a pure arithmetic string worth evaluating.
///
/// Requires a clean tokenization with at least one number. Commas only count
/// as arithmetic inside a function call, so `1,234.5` stays plain text.
pub fn is_arithmetic(text: &str) -> bool {
    let Ok(tokens) = parser::tokenize(text) else {
        return false;
    };
    let has_number = tokens.iter().any(|t| matches!(t, parser::Token::Number(_)));
    let has_comma = tokens.iter().any(|t| matches!(t, parser::Token::Comma));
    let has_func = tokens.iter().any(|t| matches!(t, parser::Token::Func(_)));
    has_number && (!has_comma || has_func)
}

/// Loose shape check for raw input: digits, identifiers and operators only,
/// with at least one operator or parenthesis. Anything passing this is sent
/// to the evaluator even when it does not tokenize, so foreign identifiers
/// are rejected rather than echoed back.
pub fn looks_like_expression(text: &str) -> bool {
    let allowed = |c: char| c.is_ascii_alphanumeric() || c.is_ascii_whitespace() || "_+-*/().,".contains(c);
    text.chars().all(allowed)
        && text.chars().any(|c| c.is_ascii_digit())
        && text.chars().any(|c| "+-*/()".contains(c))
}
