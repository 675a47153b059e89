pub mod definition_cache;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod exec_log;
pub mod expr;
pub mod format;
pub mod lookup;
pub mod resolver;
pub mod session;
pub mod shortcode;
pub mod store;
pub mod tracker;
pub mod ttl_cache;

pub use definitions::{FieldValue, FormData};
pub use engine::{EngineBuilder, EngineOptions, ProcessContext, ProcessOutcome, ShortcodeEngine};
pub use error::{EngineError, EngineResult, StoreError};
pub use shortcode::Shortcode;
