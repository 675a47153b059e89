//! CLI Exit Code Registry
//!
//! This is the single source of truth for all `fcalc` exit codes.
//! Exit codes are part of the shell contract: scripts rely on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain           | Description                              |
//! |---------|------------------|------------------------------------------|
//! | 0       | Universal        | Success                                  |
//! | 1       | Universal        | Evaluation or processing failed          |
//! | 2       | Universal        | CLI usage error (bad args, missing file) |
//! | 3-9     | definitions      | Definitions file and settings codes      |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into the relevant command's error handling

use formcalc_engine::EngineError;

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// Evaluation failed, or `process` reported `success: false`.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, malformed `--field`, unknown locale.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Definitions (3-9)
// =============================================================================

/// `check` found circular calculation groups.
pub const EXIT_CHECK_CYCLES: u8 = 3;

/// Definitions file could not be parsed (bad TOML/JSON, unknown extension).
pub const EXIT_DEFS_PARSE: u8 = 4;

/// Definitions or settings file could not be read.
pub const EXIT_IO: u8 = 5;

/// Settings file present but invalid.
pub const EXIT_SETTINGS: u8 = 6;

/// Map an engine error to its exit code.
pub fn engine_exit_code(err: &EngineError) -> u8 {
    match err {
        EngineError::InvalidContext(_) => EXIT_USAGE,
        EngineError::Store(_) => EXIT_IO,
        _ => EXIT_ERROR,
    }
}

/// Short hint for the common evaluator rejections.
pub fn engine_hint(err: &EngineError) -> Option<String> {
    match err {
        EngineError::UnsafeExpression(_) => {
            Some("only numbers, + - * / ( ) and `fcalc list-functions` are allowed".to_string())
        }
        EngineError::UnbalancedExpression => Some("check that every '(' has a matching ')'".to_string()),
        EngineError::EvaluationTimeout(_) => Some("raise evaluator.timeoutMs in settings".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let codes = [EXIT_SUCCESS, EXIT_ERROR, EXIT_USAGE, EXIT_CHECK_CYCLES, EXIT_DEFS_PARSE, EXIT_IO, EXIT_SETTINGS];
        let mut sorted = codes.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }

    #[test]
    fn test_engine_mapping() {
        assert_eq!(engine_exit_code(&EngineError::UnbalancedExpression), EXIT_ERROR);
        assert_eq!(engine_exit_code(&EngineError::InvalidContext("x".into())), EXIT_USAGE);
        assert!(engine_hint(&EngineError::UnbalancedExpression).is_some());
    }
}
