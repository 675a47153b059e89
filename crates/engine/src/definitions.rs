//! Definition types authored elsewhere and read by the engine.
//!
//! The engine never mutates these. Conditions and actions are closed sum
//! types, so every operator and action kind is matched exhaustively.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::format::format_general;
use crate::shortcode::normalize_name;

fn default_true() -> bool {
    true
}

// ============================================================================
// Field values
// ============================================================================

/// A form field value as the host application submits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Null,
}

impl FieldValue {
    /// Text form, `None` when absent-equivalent (null or blank).
    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) if s.trim().is_empty() => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(n) => Some(format_general(*n)),
            FieldValue::Bool(b) => Some(b.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => parse_number(s),
            FieldValue::Bool(_) | FieldValue::Null => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.as_text().is_none()
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text().unwrap_or_default())
    }
}

/// Lenient numeric parse: trims, accepts a single comma as the decimal mark.
pub fn parse_number(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let parsed = match t.parse::<f64>() {
        Ok(n) => Some(n),
        Err(_) if t.matches(',').count() == 1 && !t.contains('.') => {
            t.replace(',', ".").parse::<f64>().ok()
        }
        Err(_) => None,
    };
    parsed.filter(|n| n.is_finite())
}

/// Field snapshot keyed case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, FieldValue>", into = "BTreeMap<String, FieldValue>")]
pub struct FormData {
    values: BTreeMap<String, FieldValue>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<FieldValue>) -> Option<FieldValue> {
        self.values.insert(normalize_name(name), value.into())
    }

    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(&normalize_name(name))
    }

    /// Present and non-blank.
    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).and_then(FieldValue::as_text)
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.values.remove(&normalize_name(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<BTreeMap<String, FieldValue>> for FormData {
    fn from(map: BTreeMap<String, FieldValue>) -> Self {
        map.into_iter().collect()
    }
}

impl From<FormData> for BTreeMap<String, FieldValue> {
    fn from(data: FormData) -> Self {
        data.values
    }
}

impl<K: AsRef<str>, V: Into<FieldValue>> FromIterator<(K, V)> for FormData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut data = FormData::new();
        for (k, v) in iter {
            data.insert(k.as_ref(), v);
        }
        data
    }
}

// ============================================================================
// Formulas
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    pub formula_text: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl Formula {
    pub fn new(name: &str, formula_text: &str) -> Self {
        Self {
            name: name.to_string(),
            formula_text: formula_text.to_string(),
            unit: None,
            is_active: true,
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    /// Case-insensitive exact match, or match after hyphenating spaces/underscores.
    pub fn matches_name(&self, name: &str) -> bool {
        let mine = normalize_name(&self.name);
        let wanted = normalize_name(name);
        mine == wanted || hyphenate(&mine) == hyphenate(&wanted)
    }
}

pub fn hyphenate(name: &str) -> String {
    name.chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .collect()
}

// ============================================================================
// Lookups
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupDefinition {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRule {
    pub order_index: i32,
    #[serde(default, alias = "conditions")]
    pub condition_logic: ConditionLogic,
    pub action: Action,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupDefault {
    pub action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    #[default]
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConditionLogic {
    #[serde(default)]
    pub combinator: Combinator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionLogic {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self { combinator: Combinator::And, conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self { combinator: Combinator::Or, conditions }
    }

    /// Unconditional match.
    pub fn always() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default = "ConditionValue::empty")]
    pub value: ConditionValue,
}

impl Condition {
    pub fn new(field: &str, operator: Operator, value: impl Into<ConditionValue>) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(alias = "==", alias = "=", alias = "eq")]
    Equals,
    #[serde(alias = "!=", alias = "<>", alias = "ne")]
    NotEquals,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
}

/// Right-hand side of a condition: scalar or list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    List(Vec<FieldValue>),
    Scalar(FieldValue),
}

impl ConditionValue {
    pub fn empty() -> Self {
        ConditionValue::Scalar(FieldValue::Null)
    }

    pub fn text(&self) -> String {
        match self {
            ConditionValue::Scalar(v) => v.as_text().unwrap_or_default(),
            ConditionValue::List(items) => items
                .iter()
                .filter_map(FieldValue::as_text)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn number(&self) -> Option<f64> {
        match self {
            ConditionValue::Scalar(v) => v.as_number(),
            ConditionValue::List(_) => None,
        }
    }

    /// Members for `in` / `not_in`: list items, or a comma-separated string.
    pub fn members(&self) -> Vec<String> {
        match self {
            ConditionValue::List(items) => items.iter().filter_map(FieldValue::as_text).collect(),
            ConditionValue::Scalar(v) => v
                .as_text()
                .map(|s| {
                    s.split(',')
                        .map(|part| part.trim().to_string())
                        .filter(|part| !part.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

impl From<&str> for ConditionValue {
    fn from(s: &str) -> Self {
        ConditionValue::Scalar(FieldValue::from(s))
    }
}

impl From<f64> for ConditionValue {
    fn from(n: f64) -> Self {
        ConditionValue::Scalar(FieldValue::Number(n))
    }
}

impl From<Vec<&str>> for ConditionValue {
    fn from(items: Vec<&str>) -> Self {
        ConditionValue::List(items.into_iter().map(FieldValue::from).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Literal returned as-is.
    Value { value: FieldValue },
    /// Formula text resolved like a calculation, formatted with its unit.
    Formula { formula: String },
    /// Keyed row fetch from a reference table.
    Lookup {
        table: String,
        key_field: String,
        value_field: String,
        /// Column matched against the key; defaults to `key_field`.
        #[serde(default)]
        key_column: Option<String>,
    },
    /// Guardrail: fails with the authored message.
    Error { message: String },
}

impl Action {
    pub fn value(literal: &str) -> Self {
        Action::Value { value: FieldValue::from(literal) }
    }

    pub fn formula(text: &str) -> Self {
        Action::Formula { formula: text.to_string() }
    }

    pub fn error(message: &str) -> Self {
        Action::Error { message: message.to_string() }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Action::Value { .. } => "value",
            Action::Formula { .. } => "formula",
            Action::Lookup { .. } => "lookup",
            Action::Error { .. } => "error",
        }
    }
}

/// A lookup with its active rules sorted by `order_index` and its default.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedLookup {
    pub definition: LookupDefinition,
    pub rules: Vec<LookupRule>,
    pub default: Option<LookupDefault>,
}

impl LoadedLookup {
    pub fn new(definition: LookupDefinition, rules: Vec<LookupRule>, default: Option<LookupDefault>) -> Self {
        let mut rules: Vec<LookupRule> = rules.into_iter().filter(|r| r.is_active).collect();
        rules.sort_by_key(|r| r.order_index);
        Self { definition, rules, default }
    }

    /// Every action this lookup can select, rules first.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.rules
            .iter()
            .map(|r| &r.action)
            .chain(self.default.as_ref().map(|d| &d.action))
    }

    pub fn condition_fields(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .flat_map(|r| r.condition_logic.conditions.iter())
            .map(|c| c.field.as_str())
    }
}

// ============================================================================
// Legacy tables and reference tables
// ============================================================================

/// Pre-rule-engine lookup: ordered rows, all conditions of a row ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyLookupTable {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<LegacyRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRow {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub result: String,
}

pub type ReferenceRow = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReferenceTable {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<ReferenceRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formula_name_matching() {
        let f = Formula::new("Energy_Need", "1");
        assert!(f.matches_name("energy_need"));
        assert!(f.matches_name("energy-need"));
        assert!(f.matches_name("ENERGY NEED"));
        assert!(!f.matches_name("energy"));
    }

    #[test]
    fn test_field_value_text() {
        assert_eq!(FieldValue::Number(3.0).as_text(), Some("3".to_string()));
        assert_eq!(FieldValue::from("  ").as_text(), None);
        assert_eq!(FieldValue::Null.as_text(), None);
        assert_eq!(FieldValue::from("2,5").as_number(), Some(2.5));
        assert_eq!(FieldValue::from("1,234.5").as_number(), None);
    }

    #[test]
    fn test_form_data_case_insensitive() {
        let data = FormData::new().with("Square_Meters", 80.0);
        assert_eq!(data.text("square_meters"), Some("80".to_string()));
        let json: FormData = serde_json::from_str(r#"{"Valitse": "oil", "N": 2}"#).unwrap();
        assert_eq!(json.text("valitse"), Some("oil".to_string()));
        assert_eq!(json.get("n").and_then(FieldValue::as_number), Some(2.0));
    }

    #[test]
    fn test_action_serde_tagged() {
        let action: Action = serde_json::from_str(r#"{"type": "formula", "formula": "[calc:x]"}"#).unwrap();
        assert_eq!(action, Action::formula("[calc:x]"));
        let action: Action = serde_json::from_str(r#"{"type": "value", "value": 12}"#).unwrap();
        assert_eq!(action, Action::Value { value: FieldValue::Number(12.0) });
    }

    #[test]
    fn test_operator_aliases() {
        let op: Operator = serde_json::from_str(r#"">=""#).unwrap();
        assert_eq!(op, Operator::Gte);
        let op: Operator = serde_json::from_str(r#""not_in""#).unwrap();
        assert_eq!(op, Operator::NotIn);
        let c: Combinator = serde_json::from_str(r#""or""#).unwrap();
        assert_eq!(c, Combinator::Or);
    }

    #[test]
    fn test_members_from_list_or_csv() {
        assert_eq!(ConditionValue::from("a, b ,c").members(), vec!["a", "b", "c"]);
        assert_eq!(ConditionValue::from(vec!["x", "y"]).members(), vec!["x", "y"]);
    }

    #[test]
    fn test_loaded_lookup_sorts_and_filters() {
        let def = LookupDefinition { id: 1, name: "l".into(), title: String::new(), is_active: true };
        let rule = |idx: i32, active: bool| LookupRule {
            order_index: idx,
            condition_logic: ConditionLogic::always(),
            action: Action::value(&idx.to_string()),
            is_active: active,
        };
        let loaded = LoadedLookup::new(def, vec![rule(3, true), rule(1, true), rule(2, false)], None);
        let order: Vec<i32> = loaded.rules.iter().map(|r| r.order_index).collect();
        assert_eq!(order, vec![1, 3]);
    }
}
