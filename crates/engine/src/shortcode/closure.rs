// Transitive field-dependency closure, used by hosts to decide which field
// edits should trigger a recompute. Best effort: a store failure stops the
// walk and whatever was found so far is returned.

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;

use super::{extract_ordered, normalize_name, Shortcode};
use crate::definition_cache::DefinitionCache;
use crate::definitions::Action;

pub const DEFAULT_CLOSURE_DEPTH: usize = 5;

pub async fn extract_field_dependencies(
    text: &str,
    definitions: &DefinitionCache,
    max_depth: usize,
) -> Vec<String> {
    let mut fields: BTreeSet<String> = BTreeSet::new();
    let mut visited: FxHashSet<Shortcode> = FxHashSet::default();
    let mut frontier = extract_ordered(text);
    let mut depth = 0;

    while !frontier.is_empty() && depth < max_depth {
        let mut next = Vec::new();
        for code in frontier {
            if !visited.insert(code.clone()) {
                continue;
            }
            match code {
                Shortcode::Field(name) => {
                    fields.insert(name);
                }
                Shortcode::Calc(name) => match definitions.formula(&name).await {
                    Ok(Some(formula)) => next.extend(extract_ordered(&formula.formula_text)),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(calc = %name, error = %e, "field dependency walk stopped early");
                        return fields.into_iter().collect();
                    }
                },
                Shortcode::Lookup(name) => match definitions.lookup(&name).await {
                    Ok(Some(lookup)) => {
                        fields.extend(lookup.condition_fields().map(normalize_name));
                        for action in lookup.actions() {
                            match action {
                                Action::Formula { formula } => next.extend(extract_ordered(formula)),
                                Action::Lookup { key_field, .. } => {
                                    fields.insert(normalize_name(key_field));
                                }
                                Action::Value { .. } | Action::Error { .. } => {}
                            }
                        }
                    }
                    Ok(None) => match definitions.legacy_table(&name).await {
                        Ok(Some(table)) => {
                            let conditions = table.rows.iter().flat_map(|r| r.conditions.iter());
                            fields.extend(conditions.map(|c| normalize_name(&c.field)));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(lookup = %name, error = %e, "field dependency walk stopped early");
                            return fields.into_iter().collect();
                        }
                    },
                    Err(e) => {
                        tracing::warn!(lookup = %name, error = %e, "field dependency walk stopped early");
                        return fields.into_iter().collect();
                    }
                },
            }
        }
        frontier = next;
        depth += 1;
    }

    fields.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition_cache::DEFAULT_DEFINITION_TTL;
    use crate::definitions::{Condition, ConditionLogic, Formula, LookupRule, Operator};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn cache(store: MemoryStore) -> (Arc<MemoryStore>, DefinitionCache) {
        let store = Arc::new(store);
        let cache = DefinitionCache::new(store.clone(), store.clone(), store.clone(), DEFAULT_DEFINITION_TTL);
        (store, cache)
    }

    #[tokio::test]
    async fn test_closure_through_calcs_and_lookups() {
        let (_, defs) = cache(
            MemoryStore::new()
                .with_formula(Formula::new("total", "[calc:base] * [field:Price]"))
                .with_formula(Formula::new("base", "[field:m2] + [lookup:heat]"))
                .with_formula(Formula::new("oil-form", "[field:oil_litres] * 10"))
                .with_lookup(
                    "heat",
                    vec![LookupRule {
                        order_index: 1,
                        condition_logic: ConditionLogic::all(vec![Condition::new(
                            "valitse",
                            Operator::Equals,
                            "oil",
                        )]),
                        action: Action::formula("[calc:oil-form]"),
                        is_active: true,
                    }],
                    None,
                ),
        );

        let fields = extract_field_dependencies("Sum: [calc:total]", &defs, DEFAULT_CLOSURE_DEPTH).await;
        assert_eq!(fields, vec!["m2", "oil_litres", "price", "valitse"]);
    }

    #[tokio::test]
    async fn test_mutual_recursion_terminates() {
        let (_, defs) = cache(
            MemoryStore::new()
                .with_formula(Formula::new("a", "[calc:b] + [field:x]"))
                .with_formula(Formula::new("b", "[calc:a] + [field:y]")),
        );
        let fields = extract_field_dependencies("[calc:a]", &defs, DEFAULT_CLOSURE_DEPTH).await;
        assert_eq!(fields, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_depth_bound() {
        let mut store = MemoryStore::new();
        for i in 0..8 {
            store = store.with_formula(Formula::new(&format!("c{}", i), &format!("[calc:c{}] + [field:f{}]", i + 1, i)));
        }
        let (_, defs) = cache(store);
        let fields = extract_field_dependencies("[calc:c0]", &defs, 5).await;
        // Level 0 is the template; f4 sits one level past the bound.
        assert_eq!(fields, vec!["f0", "f1", "f2", "f3"]);
    }

    #[tokio::test]
    async fn test_store_failure_degrades() {
        let (store, defs) = cache(MemoryStore::new().with_formula(Formula::new("a", "[field:x]")));
        store.set_offline(true);
        let fields = extract_field_dependencies("[field:direct] [calc:a]", &defs, 5).await;
        assert_eq!(fields, vec!["direct"]);
    }
}
