//! Read-only definition store contracts and the in-memory implementation.
//!
//! Persistence lives behind these traits. The engine only reads through
//! them, and always via [`crate::definition_cache::DefinitionCache`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::definitions::{
    hyphenate, Action, FieldValue, Formula, LegacyLookupTable, LookupDefault, LookupDefinition,
    LookupRule, ReferenceRow, ReferenceTable,
};
use crate::error::StoreError;
use crate::shortcode::normalize_name;

#[async_trait]
pub trait FormulaStore: Send + Sync {
    async fn active_formulas(&self) -> Result<Vec<Formula>, StoreError>;
}

#[async_trait]
pub trait LookupStore: Send + Sync {
    /// Active lookup definition by name.
    async fn lookup(&self, name: &str) -> Result<Option<LookupDefinition>, StoreError>;
    async fn rules(&self, lookup_id: u64) -> Result<Vec<LookupRule>, StoreError>;
    async fn default_action(&self, lookup_id: u64) -> Result<Option<LookupDefault>, StoreError>;

    /// Pre-rule-engine table consulted when no definition exists.
    async fn legacy_table(&self, _name: &str) -> Result<Option<LegacyLookupTable>, StoreError> {
        Ok(None)
    }
}

/// Generic keyed-table reader backing `Lookup` actions.
#[async_trait]
pub trait ReferenceTableReader: Send + Sync {
    async fn fetch_row(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
    ) -> Result<Option<ReferenceRow>, StoreError>;
}

// ============================================================================
// File-backed definition set
// ============================================================================

/// Serde root of a definitions file (TOML or JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionSet {
    #[serde(default)]
    pub formulas: Vec<Formula>,
    #[serde(default)]
    pub lookups: Vec<LookupSpec>,
    #[serde(default)]
    pub legacy_tables: Vec<LegacyLookupTable>,
    #[serde(default)]
    pub tables: Vec<ReferenceTable>,
}

/// Authoring form of a lookup: definition, rules, and default in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupSpec {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub rules: Vec<LookupRule>,
    #[serde(default)]
    pub default: Option<Action>,
}

fn default_active() -> bool {
    true
}

impl DefinitionSet {
    pub fn into_store(self) -> MemoryStore {
        let store = MemoryStore::new();
        {
            let mut state = store.state.write();
            state.formulas = self.formulas;
            for spec in self.lookups {
                state.push_lookup(spec);
            }
            state.legacy_tables = self.legacy_tables;
            state.tables = self.tables;
        }
        store
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    formulas: Vec<Formula>,
    lookups: Vec<StoredLookup>,
    legacy_tables: Vec<LegacyLookupTable>,
    tables: Vec<ReferenceTable>,
    next_id: u64,
}

struct StoredLookup {
    definition: LookupDefinition,
    rules: Vec<LookupRule>,
    default: Option<LookupDefault>,
}

impl MemoryState {
    fn push_lookup(&mut self, spec: LookupSpec) {
        self.next_id += 1;
        self.lookups.retain(|l| !same_name(&l.definition.name, &spec.name));
        self.lookups.push(StoredLookup {
            definition: LookupDefinition {
                id: self.next_id,
                name: spec.name,
                title: spec.title,
                is_active: spec.is_active,
            },
            rules: spec.rules,
            default: spec.default.map(|action| LookupDefault { action }),
        });
    }

    fn check_online(&self, offline: bool) -> Result<(), StoreError> {
        if offline {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

fn same_name(a: &str, b: &str) -> bool {
    hyphenate(&normalize_name(a)) == hyphenate(&normalize_name(b))
}

/// Definition store held in memory. Backs the CLI and tests; it can be
/// switched offline to simulate an unreachable backend.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    offline: AtomicBool,
    formula_fetches: AtomicUsize,
    lookup_fetches: AtomicUsize,
    row_fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_formula(self, formula: Formula) -> Self {
        self.put_formula(formula);
        self
    }

    pub fn with_lookup(self, name: &str, rules: Vec<LookupRule>, default: Option<Action>) -> Self {
        self.state.write().push_lookup(LookupSpec {
            name: name.to_string(),
            title: String::new(),
            is_active: true,
            rules,
            default,
        });
        self
    }

    pub fn with_legacy_table(self, table: LegacyLookupTable) -> Self {
        self.state.write().legacy_tables.push(table);
        self
    }

    pub fn with_table(self, table: ReferenceTable) -> Self {
        self.state.write().tables.push(table);
        self
    }

    /// Insert or replace a formula by name (admin edit).
    pub fn put_formula(&self, formula: Formula) {
        let mut state = self.state.write();
        let name = normalize_name(&formula.name);
        state.formulas.retain(|f| normalize_name(&f.name) != name);
        state.formulas.push(formula);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn formula_fetches(&self) -> usize {
        self.formula_fetches.load(Ordering::SeqCst)
    }

    pub fn lookup_fetches(&self) -> usize {
        self.lookup_fetches.load(Ordering::SeqCst)
    }

    pub fn row_fetches(&self) -> usize {
        self.row_fetches.load(Ordering::SeqCst)
    }

    pub fn formula_names(&self) -> Vec<String> {
        self.state.read().formulas.iter().map(|f| f.name.clone()).collect()
    }

    pub fn lookup_names(&self) -> Vec<String> {
        self.state
            .read()
            .lookups
            .iter()
            .map(|l| l.definition.name.clone())
            .collect()
    }

    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FormulaStore for MemoryStore {
    async fn active_formulas(&self) -> Result<Vec<Formula>, StoreError> {
        self.formula_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read();
        state.check_online(self.is_offline())?;
        Ok(state.formulas.iter().filter(|f| f.is_active).cloned().collect())
    }
}

#[async_trait]
impl LookupStore for MemoryStore {
    async fn lookup(&self, name: &str) -> Result<Option<LookupDefinition>, StoreError> {
        self.lookup_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read();
        state.check_online(self.is_offline())?;
        Ok(state
            .lookups
            .iter()
            .find(|l| l.definition.is_active && same_name(&l.definition.name, name))
            .map(|l| l.definition.clone()))
    }

    async fn rules(&self, lookup_id: u64) -> Result<Vec<LookupRule>, StoreError> {
        let state = self.state.read();
        state.check_online(self.is_offline())?;
        Ok(state
            .lookups
            .iter()
            .find(|l| l.definition.id == lookup_id)
            .map(|l| l.rules.clone())
            .unwrap_or_default())
    }

    async fn default_action(&self, lookup_id: u64) -> Result<Option<LookupDefault>, StoreError> {
        let state = self.state.read();
        state.check_online(self.is_offline())?;
        Ok(state
            .lookups
            .iter()
            .find(|l| l.definition.id == lookup_id)
            .and_then(|l| l.default.clone()))
    }

    async fn legacy_table(&self, name: &str) -> Result<Option<LegacyLookupTable>, StoreError> {
        let state = self.state.read();
        state.check_online(self.is_offline())?;
        Ok(state
            .legacy_tables
            .iter()
            .find(|t| same_name(&t.name, name))
            .cloned())
    }
}

#[async_trait]
impl ReferenceTableReader for MemoryStore {
    async fn fetch_row(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
    ) -> Result<Option<ReferenceRow>, StoreError> {
        self.row_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read();
        state.check_online(self.is_offline())?;
        let Some(table) = state.tables.iter().find(|t| same_name(&t.name, table)) else {
            return Ok(None);
        };
        let key = key.trim();
        Ok(table
            .rows
            .iter()
            .find(|row| {
                row.get(key_column)
                    .and_then(FieldValue::as_text)
                    .is_some_and(|v| v.trim() == key)
            })
            .cloned())
    }
}
