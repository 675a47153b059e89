//! Error taxonomy shared by every engine component.
//!
//! Token-level failures are rendered inline as `[Error: <display>]`, so the
//! `Display` strings below are user-facing.

/// Failure reported by a definition store or reference table adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with data the engine cannot use.
    #[error("malformed definition: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// `[field:x]` where `x` is absent, null, or empty.
    #[error("Missing field '{0}'")]
    MissingField(String),
    #[error("Formula '{0}' not found")]
    FormulaNotFound(String),
    #[error("Lookup '{0}' not found")]
    LookupNotFound(String),
    /// No rule matched and the lookup has no default action.
    #[error("No rule matched for lookup '{0}'")]
    NoRuleMatched(String),
    /// An `Error` action fired; carries the authored message.
    #[error("{0}")]
    LookupAction(String),
    #[error("No row in '{table}' where {key_column} = '{key}'")]
    ReferenceRowNotFound {
        table: String,
        key_column: String,
        key: String,
    },
    /// Input contains something outside the arithmetic grammar.
    #[error("Unsafe expression: {0}")]
    UnsafeExpression(String),
    #[error("Unbalanced parentheses in expression")]
    UnbalancedExpression,
    /// Grammar-valid input that cannot be computed (division by zero, bad arity).
    #[error("Evaluation error: {0}")]
    Evaluation(String),
    #[error("Evaluation timed out after {0}ms")]
    EvaluationTimeout(u64),
    #[error("Result out of range: {0}")]
    ResultOutOfRange(f64),
    /// Soft failure: the resolution round budget ran out first.
    #[error("Maximum resolution depth {depth} exceeded")]
    MaxDepthExceeded { depth: usize },
    #[error("Circular dependency: {chain}")]
    CircularDependency { chain: String },
    #[error("Definition store error: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

impl EngineError {
    /// Short machine-readable code, used in execution records and JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::MissingField(_) => "missing_field",
            EngineError::FormulaNotFound(_) => "formula_not_found",
            EngineError::LookupNotFound(_) => "lookup_not_found",
            EngineError::NoRuleMatched(_) => "no_rule_matched",
            EngineError::LookupAction(_) => "lookup_action",
            EngineError::ReferenceRowNotFound { .. } => "reference_row_not_found",
            EngineError::UnsafeExpression(_) => "unsafe_expression",
            EngineError::UnbalancedExpression => "unbalanced_expression",
            EngineError::Evaluation(_) => "evaluation",
            EngineError::EvaluationTimeout(_) => "evaluation_timeout",
            EngineError::ResultOutOfRange(_) => "result_out_of_range",
            EngineError::MaxDepthExceeded { .. } => "max_depth_exceeded",
            EngineError::CircularDependency { .. } => "circular_dependency",
            EngineError::Store(_) => "store",
            EngineError::InvalidContext(_) => "invalid_context",
        }
    }

    /// Soft failures still count as a successful (partial) render.
    pub fn is_soft(&self) -> bool {
        matches!(self, EngineError::MaxDepthExceeded { .. })
    }

    /// Inline marker substituted for a failed shortcode.
    pub fn marker(&self) -> String {
        format!("[Error: {}]", self)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formula_not_found_marker() {
        let err = EngineError::FormulaNotFound("does-not-exist".into());
        assert_eq!(err.marker(), "[Error: Formula 'does-not-exist' not found]");
    }

    #[test]
    fn test_store_error_converts() {
        let err: EngineError = StoreError::Unavailable("timeout".into()).into();
        assert_eq!(err.code(), "store");
        assert_eq!(err.to_string(), "Definition store error: store unavailable: timeout");
    }

    #[test]
    fn test_only_depth_is_soft() {
        assert!(EngineError::MaxDepthExceeded { depth: 10 }.is_soft());
        assert!(!EngineError::UnbalancedExpression.is_soft());
    }
}
