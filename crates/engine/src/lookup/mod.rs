//! Lookup rule engine: ordered conditional rules, first match wins.

pub mod conditions;
pub mod rules;

pub use conditions::{evaluate_condition, evaluate_logic};
pub use rules::{select_action, select_legacy, Selection};
