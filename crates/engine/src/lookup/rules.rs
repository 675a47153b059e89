// Rule selection. Rules are tried in ascending order_index and the first
// whose logic holds wins; specificity plays no part.

use super::conditions::{evaluate_condition, evaluate_logic};
use crate::definitions::{Action, FormData, LegacyLookupTable, LoadedLookup};
use crate::error::{EngineError, EngineResult};

/// The action a lookup picked and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub action: Action,
    /// `order_index` of the winning rule; `None` when the default applied.
    pub matched_rule: Option<i32>,
}

impl Selection {
    pub fn used_default(&self) -> bool {
        self.matched_rule.is_none()
    }
}

pub fn select_action(lookup: &LoadedLookup, data: &FormData) -> EngineResult<Selection> {
    for rule in &lookup.rules {
        if evaluate_logic(&rule.condition_logic, data) {
            return Ok(Selection {
                action: rule.action.clone(),
                matched_rule: Some(rule.order_index),
            });
        }
    }
    match &lookup.default {
        Some(default) => Ok(Selection {
            action: default.action.clone(),
            matched_rule: None,
        }),
        None => Err(EngineError::NoRuleMatched(lookup.definition.name.clone())),
    }
}

/// First legacy row whose conditions all hold.
pub fn select_legacy(table: &LegacyLookupTable, data: &FormData) -> Option<String> {
    table
        .rows
        .iter()
        .find(|row| row.conditions.iter().all(|c| evaluate_condition(c, data)))
        .map(|row| row.result.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{
        Condition, ConditionLogic, LegacyRow, LookupDefault, LookupDefinition, LookupRule, Operator,
    };

    fn definition() -> LookupDefinition {
        LookupDefinition {
            id: 7,
            name: "heating-calculation".into(),
            title: "Heating".into(),
            is_active: true,
        }
    }

    fn rule(order_index: i32, logic: ConditionLogic, action: Action) -> LookupRule {
        LookupRule {
            order_index,
            condition_logic: logic,
            action,
            is_active: true,
        }
    }

    fn heating(default: Option<Action>) -> LoadedLookup {
        let is = |v: &str| ConditionLogic::all(vec![Condition::new("valitse", Operator::Equals, v)]);
        LoadedLookup::new(
            definition(),
            vec![
                rule(3, ConditionLogic::always(), Action::formula("[calc:default-form]")),
                rule(1, is("oil"), Action::formula("[calc:oil-form]")),
                rule(2, is("electric"), Action::formula("[calc:elec-form]")),
            ],
            default.map(|action| LookupDefault { action }),
        )
    }

    #[test]
    fn test_first_match_by_order_index() {
        let data = FormData::new().with("valitse", "oil");
        let selection = select_action(&heating(None), &data).unwrap();
        assert_eq!(selection.action, Action::formula("[calc:oil-form]"));
        assert_eq!(selection.matched_rule, Some(1));
    }

    #[test]
    fn test_unconditional_rule_catches_rest() {
        let data = FormData::new().with("valitse", "wood");
        let selection = select_action(&heating(None), &data).unwrap();
        assert_eq!(selection.matched_rule, Some(3));
    }

    #[test]
    fn test_default_and_no_match() {
        let is_gas = ConditionLogic::all(vec![Condition::new("fuel", Operator::Equals, "gas")]);
        let lookup = |default: Option<Action>| {
            LoadedLookup::new(
                definition(),
                vec![rule(1, is_gas.clone(), Action::value("g"))],
                default.map(|action| LookupDefault { action }),
            )
        };
        let data = FormData::new().with("fuel", "oil");

        let selection = select_action(&lookup(Some(Action::value("fallback"))), &data).unwrap();
        assert!(selection.used_default());
        assert_eq!(selection.action, Action::value("fallback"));

        assert_eq!(
            select_action(&lookup(None), &data),
            Err(EngineError::NoRuleMatched("heating-calculation".into()))
        );
    }

    #[test]
    fn test_legacy_first_row_wins() {
        let table = LegacyLookupTable {
            name: "zones".into(),
            rows: vec![
                LegacyRow {
                    conditions: vec![
                        Condition::new("m2", Operator::Gte, 100.0),
                        Condition::new("fuel", Operator::Equals, "oil"),
                    ],
                    result: "big-oil".into(),
                },
                LegacyRow {
                    conditions: vec![Condition::new("m2", Operator::Gte, 50.0)],
                    result: "medium".into(),
                },
                LegacyRow { conditions: vec![], result: "small".into() },
            ],
        };
        let data = FormData::new().with("m2", 120.0).with("fuel", "gas");
        assert_eq!(select_legacy(&table, &data), Some("medium".to_string()));
        let data = FormData::new();
        assert_eq!(select_legacy(&table, &data), Some("small".to_string()));
    }
}
