//! Per-session state: field values, calculation values, processed-token cache.
//!
//! Sessions are created lazily on first reference and live until the host
//! calls [`SessionStore::end_session`]. There is no TTL here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::definitions::{parse_number, FieldValue, FormData};
use crate::format::format_general;
use crate::shortcode::{normalize_name, Shortcode, ShortcodeKind};

/// A decided token value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedValue {
    /// Text substituted into templates.
    pub display: String,
    /// Number substituted into formula text, when the value is numeric.
    pub numeric: Option<f64>,
    pub unit: Option<String>,
}

impl ResolvedValue {
    pub fn number(n: f64, unit: Option<String>) -> Self {
        Self {
            display: format_general(n),
            numeric: Some(n),
            unit,
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        let display = s.into();
        Self {
            numeric: parse_number(&display),
            display,
            unit: None,
        }
    }

    /// Rendering used inside formula text; negatives are parenthesized so
    /// `10 - [calc:x]` stays well-formed.
    pub fn formula_text(&self) -> String {
        match self.numeric {
            Some(n) if n < 0.0 => format!("({})", format_general(n)),
            Some(n) => format_general(n),
            None => self.display.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalculationValue {
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Cache entry for a calc or lookup token within a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedValue {
    pub token: Shortcode,
    pub kind: ShortcodeKind,
    /// Definition text before substitution.
    pub raw_text: String,
    /// Text after substitution, as evaluated.
    pub processed_text: String,
    pub dependencies: Vec<Shortcode>,
    pub value: ResolvedValue,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Session {
    fields: FormData,
    calculations: BTreeMap<String, CalculationValue>,
    processed: FxHashMap<Shortcode, ProcessedValue>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<FxHashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a field value. Returns true when the stored text changed.
    pub fn write_field(&self, session_id: &str, name: &str, value: FieldValue) -> bool {
        let mut sessions = self.sessions.write();
        let session = sessions.entry(session_id.to_string()).or_default();
        let previous = session.fields.get(name).and_then(FieldValue::as_text);
        let changed = previous != value.as_text();
        session.fields.insert(name, value);
        changed
    }

    /// Forget a field. Returns true when a non-empty value was dropped.
    pub fn remove_field(&self, session_id: &str, name: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        session
            .fields
            .remove(name)
            .is_some_and(|previous| previous.as_text().is_some())
    }

    /// Current field snapshot (empty for unknown sessions).
    pub fn fields(&self, session_id: &str) -> FormData {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.fields.clone())
            .unwrap_or_default()
    }

    pub fn calculation(&self, session_id: &str, name: &str) -> Option<CalculationValue> {
        self.sessions
            .read()
            .get(session_id)?
            .calculations
            .get(&normalize_name(name))
            .cloned()
    }

    pub fn calculations(&self, session_id: &str) -> BTreeMap<String, CalculationValue> {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.calculations.clone())
            .unwrap_or_default()
    }

    /// Record a calculation result. Returns true when the value is new or differs.
    pub fn store_calculation(&self, session_id: &str, name: &str, value: f64, unit: Option<String>) -> bool {
        let mut sessions = self.sessions.write();
        let session = sessions.entry(session_id.to_string()).or_default();
        let key = normalize_name(name);
        let changed = session
            .calculations
            .get(&key)
            .map_or(true, |prev| prev.value != value || prev.unit != unit);
        session.calculations.insert(
            key,
            CalculationValue {
                value,
                unit,
                timestamp: Utc::now(),
            },
        );
        changed
    }

    pub fn processed(&self, session_id: &str, token: &Shortcode) -> Option<ProcessedValue> {
        self.sessions.read().get(session_id)?.processed.get(token).cloned()
    }

    pub fn store_processed(&self, session_id: &str, entry: ProcessedValue) {
        let mut sessions = self.sessions.write();
        let session = sessions.entry(session_id.to_string()).or_default();
        session.processed.insert(entry.token.clone(), entry);
    }

    /// Drop cached values (processed tokens and calculation values) for one
    /// session, or for every session. Field values are kept.
    pub fn clear_cached(&self, session_id: Option<&str>) {
        let mut sessions = self.sessions.write();
        match session_id {
            Some(id) => {
                if let Some(session) = sessions.get_mut(id) {
                    session.processed.clear();
                    session.calculations.clear();
                }
            }
            None => {
                for session in sessions.values_mut() {
                    session.processed.clear();
                    session.calculations.clear();
                }
            }
        }
    }

    /// Tear a session down. Returns false if it did not exist.
    pub fn end_session(&self, session_id: &str) -> bool {
        self.sessions.write().remove(session_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn cached_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .get(session_id)
            .map_or(0, |s| s.processed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_field_reports_change() {
        let store = SessionStore::new();
        assert!(store.write_field("s1", "Square_Meters", FieldValue::from(80.0)));
        assert!(!store.write_field("s1", "square_meters", FieldValue::from("80")));
        assert!(store.write_field("s1", "square_meters", FieldValue::from(120.0)));
        assert_eq!(store.fields("s1").text("SQUARE_METERS"), Some("120".to_string()));
        // Sessions are isolated.
        assert!(store.fields("s2").is_empty());
    }

    #[test]
    fn test_remove_field() {
        let store = SessionStore::new();
        store.write_field("s1", "x", FieldValue::from(3.0));
        assert!(!store.remove_field("s2", "x"));
        assert!(store.remove_field("s1", "X"));
        assert!(!store.remove_field("s1", "x"));
        assert!(store.fields("s1").is_empty());
    }

    #[test]
    fn test_store_calculation_change_detection() {
        let store = SessionStore::new();
        assert!(store.store_calculation("s", "Total", 7.0, None));
        assert!(!store.store_calculation("s", "total", 7.0, None));
        assert!(store.store_calculation("s", "total", 8.0, None));
        assert_eq!(store.calculation("s", "TOTAL").map(|c| c.value), Some(8.0));
    }

    #[test]
    fn test_clear_and_end_session() {
        let store = SessionStore::new();
        store.write_field("a", "x", FieldValue::from("1"));
        store.store_calculation("a", "c", 1.0, None);
        store.store_processed(
            "a",
            ProcessedValue {
                token: Shortcode::calc("c"),
                kind: ShortcodeKind::Calc,
                raw_text: "1".into(),
                processed_text: "1".into(),
                dependencies: vec![],
                value: ResolvedValue::number(1.0, None),
                timestamp: Utc::now(),
            },
        );
        assert_eq!(store.cached_count("a"), 1);

        store.clear_cached(Some("a"));
        assert_eq!(store.cached_count("a"), 0);
        assert!(store.calculation("a", "c").is_none());
        assert_eq!(store.fields("a").text("x"), Some("1".to_string()));

        assert!(store.end_session("a"));
        assert!(!store.end_session("a"));
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn test_resolved_value_formula_text() {
        assert_eq!(ResolvedValue::number(-3.5, None).formula_text(), "(-3.5)");
        assert_eq!(ResolvedValue::text("12").formula_text(), "12");
        assert_eq!(ResolvedValue::text("oil").formula_text(), "oil");
        assert_eq!(ResolvedValue::text("2,5").numeric, Some(2.5));
    }
}
