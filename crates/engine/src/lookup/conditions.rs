// Condition evaluation against a session's field snapshot.
//
// A missing field (absent, null, blank) only satisfies the negative
// operators. Equality is numeric when both sides parse as numbers and
// case-insensitive text otherwise.

use crate::definitions::{
    parse_number, Combinator, Condition, ConditionLogic, ConditionValue, FormData, Operator,
};

pub fn evaluate_logic(logic: &ConditionLogic, data: &FormData) -> bool {
    match logic.combinator {
        Combinator::And => logic.conditions.iter().all(|c| evaluate_condition(c, data)),
        Combinator::Or => {
            logic.conditions.is_empty() || logic.conditions.iter().any(|c| evaluate_condition(c, data))
        }
    }
}

pub fn evaluate_condition(condition: &Condition, data: &FormData) -> bool {
    let Some(actual) = data.text(&condition.field) else {
        return matches!(condition.operator, Operator::NotEquals | Operator::NotIn);
    };
    compare(&actual, condition.operator, &condition.value)
}

fn compare(actual: &str, operator: Operator, expected: &ConditionValue) -> bool {
    match operator {
        Operator::Equals => values_equal(actual, expected),
        Operator::NotEquals => !values_equal(actual, expected),
        Operator::Gt => numeric(actual, expected).is_some_and(|(a, e)| a > e),
        Operator::Gte => numeric(actual, expected).is_some_and(|(a, e)| a >= e),
        Operator::Lt => numeric(actual, expected).is_some_and(|(a, e)| a < e),
        Operator::Lte => numeric(actual, expected).is_some_and(|(a, e)| a <= e),
        Operator::Contains => fold(actual).contains(&fold(&expected.text())),
        Operator::StartsWith => fold(actual).starts_with(&fold(&expected.text())),
        Operator::EndsWith => fold(actual).ends_with(&fold(&expected.text())),
        Operator::In => is_member(actual, expected),
        Operator::NotIn => !is_member(actual, expected),
    }
}

fn values_equal(actual: &str, expected: &ConditionValue) -> bool {
    if let (Some(a), Some(e)) = (parse_number(actual), expected.number()) {
        return (a - e).abs() < f64::EPSILON;
    }
    fold(actual) == fold(&expected.text())
}

fn numeric(actual: &str, expected: &ConditionValue) -> Option<(f64, f64)> {
    Some((parse_number(actual)?, expected.number()?))
}

fn is_member(actual: &str, expected: &ConditionValue) -> bool {
    let needle = fold(actual);
    let needle_num = parse_number(actual);
    expected.members().iter().any(|m| match (needle_num, parse_number(m)) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => fold(m) == needle,
    })
}

fn fold(s: &str) -> String {
    s.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(field: &str, op: Operator, value: impl Into<ConditionValue>) -> Condition {
        Condition::new(field, op, value)
    }

    #[test]
    fn test_equals_numeric_and_text() {
        let data = FormData::new().with("n", "5.0").with("choice", "Oil");
        assert!(evaluate_condition(&cond("n", Operator::Equals, 5.0), &data));
        assert!(evaluate_condition(&cond("N", Operator::Equals, "5"), &data));
        assert!(evaluate_condition(&cond("choice", Operator::Equals, "oil "), &data));
        assert!(evaluate_condition(&cond("choice", Operator::NotEquals, "gas"), &data));
    }

    #[test]
    fn test_ordering_is_numeric_only() {
        let data = FormData::new().with("m2", 120.0).with("word", "abc");
        assert!(evaluate_condition(&cond("m2", Operator::Gt, 100.0), &data));
        assert!(evaluate_condition(&cond("m2", Operator::Gte, "120"), &data));
        assert!(!evaluate_condition(&cond("m2", Operator::Lt, 120.0), &data));
        assert!(evaluate_condition(&cond("m2", Operator::Lte, 120.0), &data));
        assert!(!evaluate_condition(&cond("word", Operator::Gt, "abb"), &data));
    }

    #[test]
    fn test_missing_field_only_satisfies_negatives() {
        let data = FormData::new().with("blank", "  ");
        for op in [
            Operator::Equals,
            Operator::Gt,
            Operator::Gte,
            Operator::Lt,
            Operator::Lte,
            Operator::Contains,
            Operator::StartsWith,
            Operator::EndsWith,
            Operator::In,
        ] {
            assert!(!evaluate_condition(&cond("absent", op, "x"), &data), "{:?}", op);
            assert!(!evaluate_condition(&cond("blank", op, "x"), &data), "{:?}", op);
        }
        assert!(evaluate_condition(&cond("absent", Operator::NotEquals, "x"), &data));
        assert!(evaluate_condition(&cond("blank", Operator::NotIn, "x,y"), &data));
    }

    #[test]
    fn test_string_operators_case_insensitive() {
        let data = FormData::new().with("heat", "Ground Source Heat Pump");
        assert!(evaluate_condition(&cond("heat", Operator::Contains, "source"), &data));
        assert!(evaluate_condition(&cond("heat", Operator::StartsWith, "GROUND"), &data));
        assert!(evaluate_condition(&cond("heat", Operator::EndsWith, "pump"), &data));
        assert!(!evaluate_condition(&cond("heat", Operator::StartsWith, "pump"), &data));
    }

    #[test]
    fn test_in_list_and_csv() {
        let data = FormData::new().with("fuel", "oil").with("rooms", 3.0);
        assert!(evaluate_condition(&cond("fuel", Operator::In, vec!["gas", "OIL"]), &data));
        assert!(evaluate_condition(&cond("fuel", Operator::In, "gas, oil"), &data));
        assert!(evaluate_condition(&cond("rooms", Operator::In, "1,2,3.0"), &data));
        assert!(evaluate_condition(&cond("fuel", Operator::NotIn, "gas,wood"), &data));
    }

    #[test]
    fn test_logic_combinators() {
        let data = FormData::new().with("a", "1").with("b", "2");
        let hit = cond("a", Operator::Equals, "1");
        let miss = cond("b", Operator::Equals, "9");
        assert!(!evaluate_logic(&ConditionLogic::all(vec![hit.clone(), miss.clone()]), &data));
        assert!(evaluate_logic(&ConditionLogic::any(vec![hit, miss]), &data));
        assert!(evaluate_logic(&ConditionLogic::all(vec![]), &data));
        assert!(evaluate_logic(&ConditionLogic::any(vec![]), &data));
    }
}
