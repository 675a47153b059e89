//! Process-wide definition cache injected into the engine.
//!
//! Formulas and lookups are read-mostly and shared by every session. Entries
//! live for a fixed TTL (five minutes by default) and are refreshed lazily
//! on the first access after expiry. Store errors are never cached.

use std::sync::Arc;
use std::time::Duration;

use crate::definitions::{Formula, LegacyLookupTable, LoadedLookup, ReferenceRow};
use crate::error::StoreError;
use crate::shortcode::normalize_name;
use crate::store::{FormulaStore, LookupStore, ReferenceTableReader};
use crate::ttl_cache::TtlCache;

pub const DEFAULT_DEFINITION_TTL: Duration = Duration::from_secs(300);

pub struct DefinitionCache {
    formula_store: Arc<dyn FormulaStore>,
    lookup_store: Arc<dyn LookupStore>,
    tables: Arc<dyn ReferenceTableReader>,
    formulas: TtlCache<(), Arc<Vec<Formula>>>,
    lookups: TtlCache<String, Option<Arc<LoadedLookup>>>,
    legacy: TtlCache<String, Option<Arc<LegacyLookupTable>>>,
}

impl DefinitionCache {
    pub fn new(
        formula_store: Arc<dyn FormulaStore>,
        lookup_store: Arc<dyn LookupStore>,
        tables: Arc<dyn ReferenceTableReader>,
        ttl: Duration,
    ) -> Self {
        Self {
            formula_store,
            lookup_store,
            tables,
            formulas: TtlCache::new(ttl),
            lookups: TtlCache::new(ttl),
            legacy: TtlCache::new(ttl),
        }
    }

    pub async fn active_formulas(&self) -> Result<Arc<Vec<Formula>>, StoreError> {
        if let Some(cached) = self.formulas.get(&()) {
            return Ok(cached);
        }
        let fresh = Arc::new(self.formula_store.active_formulas().await?);
        tracing::debug!(count = fresh.len(), "formula cache refreshed");
        self.formulas.insert((), fresh.clone());
        Ok(fresh)
    }

    /// Active formula by name: exact (case-insensitive) match wins over a
    /// hyphen-normalized one.
    pub async fn formula(&self, name: &str) -> Result<Option<Formula>, StoreError> {
        let formulas = self.active_formulas().await?;
        let wanted = normalize_name(name);
        let exact = formulas.iter().find(|f| normalize_name(&f.name) == wanted);
        Ok(exact
            .or_else(|| formulas.iter().find(|f| f.matches_name(name)))
            .cloned())
    }

    /// Definition plus active rules (ordered) and default. `None` when no
    /// active definition exists.
    pub async fn lookup(&self, name: &str) -> Result<Option<Arc<LoadedLookup>>, StoreError> {
        let key = normalize_name(name);
        if let Some(cached) = self.lookups.get(&key) {
            return Ok(cached);
        }

        let loaded = match self.lookup_store.lookup(&key).await? {
            Some(definition) => {
                let rules = self.lookup_store.rules(definition.id).await?;
                let default = self.lookup_store.default_action(definition.id).await?;
                Some(Arc::new(LoadedLookup::new(definition, rules, default)))
            }
            None => None,
        };
        tracing::debug!(lookup = %key, found = loaded.is_some(), "lookup cache refreshed");
        self.lookups.insert(key, loaded.clone());
        Ok(loaded)
    }

    pub async fn legacy_table(&self, name: &str) -> Result<Option<Arc<LegacyLookupTable>>, StoreError> {
        let key = normalize_name(name);
        if let Some(cached) = self.legacy.get(&key) {
            return Ok(cached);
        }
        let table = self.lookup_store.legacy_table(&key).await?.map(Arc::new);
        self.legacy.insert(key, table.clone());
        Ok(table)
    }

    /// Reference rows are live data and bypass the cache.
    pub async fn fetch_row(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
    ) -> Result<Option<ReferenceRow>, StoreError> {
        self.tables.fetch_row(table, key_column, key).await
    }

    pub fn clear(&self) {
        self.formulas.clear();
        self.lookups.clear();
        self.legacy.clear();
        tracing::info!("definition cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{Action, ConditionLogic, LookupRule};
    use crate::store::MemoryStore;

    fn cache_over(store: Arc<MemoryStore>) -> DefinitionCache {
        DefinitionCache::new(store.clone(), store.clone(), store, DEFAULT_DEFINITION_TTL)
    }

    #[tokio::test(start_paused = true)]
    async fn test_formulas_refresh_after_ttl() {
        let store = Arc::new(MemoryStore::new().with_formula(Formula::new("total", "1")));
        let cache = cache_over(store.clone());

        assert_eq!(cache.formula("total").await.unwrap().unwrap().formula_text, "1");
        store.put_formula(Formula::new("total", "2"));
        // Still within the TTL: stale but served from cache.
        assert_eq!(cache.formula("total").await.unwrap().unwrap().formula_text, "1");
        assert_eq!(store.formula_fetches(), 1);

        tokio::time::advance(DEFAULT_DEFINITION_TTL).await;
        assert_eq!(cache.formula("total").await.unwrap().unwrap().formula_text, "2");
        assert_eq!(store.formula_fetches(), 2);
    }

    #[tokio::test]
    async fn test_clear_forces_reload() {
        let store = Arc::new(MemoryStore::new().with_formula(Formula::new("a", "1")));
        let cache = cache_over(store.clone());
        cache.active_formulas().await.unwrap();
        cache.clear();
        cache.active_formulas().await.unwrap();
        assert_eq!(store.formula_fetches(), 2);
    }

    #[tokio::test]
    async fn test_exact_name_beats_hyphenated() {
        let store = Arc::new(
            MemoryStore::new()
                .with_formula(Formula::new("oil form", "1"))
                .with_formula(Formula::new("oil-form", "2")),
        );
        let cache = cache_over(store);
        assert_eq!(cache.formula("OIL-FORM").await.unwrap().unwrap().formula_text, "2");
        assert_eq!(cache.formula("oil_form").await.unwrap().unwrap().formula_text, "1");
    }

    #[tokio::test]
    async fn test_negative_lookup_cached_and_errors_not() {
        let store = Arc::new(MemoryStore::new().with_lookup(
            "tier",
            vec![LookupRule {
                order_index: 0,
                condition_logic: ConditionLogic::always(),
                action: Action::value("x"),
                is_active: true,
            }],
            None,
        ));
        let cache = cache_over(store.clone());

        assert!(cache.lookup("missing").await.unwrap().is_none());
        assert!(cache.lookup("missing").await.unwrap().is_none());
        assert_eq!(store.lookup_fetches(), 1);

        store.set_offline(true);
        assert!(cache.lookup("tier").await.is_err());
        store.set_offline(false);
        let loaded = cache.lookup("tier").await.unwrap().unwrap();
        assert_eq!(loaded.rules.len(), 1);
    }
}
