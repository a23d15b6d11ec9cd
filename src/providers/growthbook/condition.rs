//! Attribute conditions of GrowthBook feature rules.
//!
//! Conditions are MongoDB-style objects, e.g. `{"userId": "alice"}` or
//! `{"$or": [{"plan": {"$in": ["pro", "team"]}}, {"age": {"$gte": 18}}]}`.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value};

/// Evaluate `condition` against `attributes`. Malformed conditions do not match.
pub(crate) fn eval_condition(attributes: &Map<String, Value>, condition: &Value) -> bool {
    let Value::Object(condition) = condition else {
        return false;
    };
    condition.iter().all(|(key, expected)| match key.as_str() {
        "$or" => as_conditions(expected).is_some_and(|conds| {
            conds.is_empty() || conds.iter().any(|c| eval_condition(attributes, c))
        }),
        "$nor" => as_conditions(expected)
            .is_some_and(|conds| !conds.iter().any(|c| eval_condition(attributes, c))),
        "$and" => as_conditions(expected)
            .is_some_and(|conds| conds.iter().all(|c| eval_condition(attributes, c))),
        "$not" => !eval_condition(attributes, expected),
        path => eval_condition_value(expected, lookup_path(attributes, path)),
    })
}

fn as_conditions(value: &Value) -> Option<&Vec<Value>> {
    value.as_array()
}

/// Attributes are addressed by dotted paths, e.g. `company.plan`.
fn lookup_path<'a>(attributes: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = attributes.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn is_operator_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn eval_condition_value(expected: &Value, actual: Option<&Value>) -> bool {
    match expected {
        Value::Object(operators) if is_operator_object(expected) => operators
            .iter()
            .all(|(operator, operand)| eval_operator(operator, actual, operand)),
        _ => actual.unwrap_or(&Value::Null) == expected,
    }
}

fn eval_operator(operator: &str, actual: Option<&Value>, operand: &Value) -> bool {
    try_eval_operator(operator, actual, operand).unwrap_or(false)
}

/// Returns `None` if the operator cannot be applied to these values.
fn try_eval_operator(operator: &str, actual: Option<&Value>, operand: &Value) -> Option<bool> {
    match operator {
        "$eq" => Some(actual.unwrap_or(&Value::Null) == operand),
        "$ne" => Some(actual.unwrap_or(&Value::Null) != operand),
        "$gt" => Some(compare(actual?, operand)? == Ordering::Greater),
        "$gte" => Some(compare(actual?, operand)? != Ordering::Less),
        "$lt" => Some(compare(actual?, operand)? == Ordering::Less),
        "$lte" => Some(compare(actual?, operand)? != Ordering::Greater),
        "$regex" => {
            let pattern = Regex::new(operand.as_str()?).ok()?;
            Some(pattern.is_match(actual?.as_str()?))
        }
        // A missing attribute reads as null.
        "$in" => Some(is_in(actual.unwrap_or(&Value::Null), operand.as_array()?)),
        "$nin" => Some(!is_in(actual.unwrap_or(&Value::Null), operand.as_array()?)),
        "$exists" => {
            let exists = !matches!(actual, None | Some(Value::Null));
            Some(exists == operand.as_bool()?)
        }
        "$not" => Some(!eval_condition_value(operand, actual)),
        _ => {
            log::debug!(target: "flagswitch", operator = operator; "unsupported GrowthBook condition operator");
            None
        }
    }
}

fn is_in(actual: &Value, candidates: &[Value]) -> bool {
    match actual {
        // Array attributes match if any element is a candidate.
        Value::Array(items) => items.iter().any(|item| candidates.contains(item)),
        _ => candidates.contains(actual),
    }
}

fn compare(actual: &Value, operand: &Value) -> Option<Ordering> {
    match (actual, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::Number(b)) => a.trim().parse::<f64>().ok()?.partial_cmp(&b.as_f64()?),
        (Value::Number(a), Value::String(b)) => a.as_f64()?.partial_cmp(&b.trim().parse::<f64>().ok()?),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::eval_condition;

    fn attributes(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn plain_value_is_equality() {
        let attrs = attributes(json!({"userId": "alice"}));
        assert!(eval_condition(&attrs, &json!({"userId": "alice"})));
        assert!(!eval_condition(&attrs, &json!({"userId": "bob"})));
        assert!(!eval_condition(&attrs, &json!({"plan": "pro"})));
    }

    #[test]
    fn empty_condition_matches() {
        assert!(eval_condition(&Map::new(), &json!({})));
    }

    #[test]
    fn comparison_operators() {
        let attrs = attributes(json!({"age": 21, "version": "2.0"}));
        assert!(eval_condition(&attrs, &json!({"age": {"$gte": 18, "$lt": 65}})));
        assert!(!eval_condition(&attrs, &json!({"age": {"$gt": 21}})));
        assert!(eval_condition(&attrs, &json!({"version": {"$gt": "1.9"}})));
        assert!(!eval_condition(&attrs, &json!({"missing": {"$lt": 10}})));
    }

    #[test]
    fn in_and_nin() {
        let attrs = attributes(json!({"userId": "alice", "tags": ["beta", "staff"]}));
        assert!(eval_condition(&attrs, &json!({"userId": {"$in": ["alice", "bob"]}})));
        assert!(eval_condition(&attrs, &json!({"userId": {"$nin": ["carol"]}})));
        assert!(eval_condition(&attrs, &json!({"tags": {"$in": ["staff"]}})));
        assert!(!eval_condition(&attrs, &json!({"tags": {"$nin": ["beta"]}})));
    }

    #[test]
    fn missing_attribute_is_in_no_list() {
        let attrs = attributes(json!({"userId": "alice"}));
        assert!(eval_condition(&attrs, &json!({"country": {"$nin": ["US"]}})));
        assert!(!eval_condition(&attrs, &json!({"country": {"$in": ["US"]}})));
        // A list that is not an array still fails closed.
        assert!(!eval_condition(&attrs, &json!({"country": {"$nin": "US"}})));
    }

    #[test]
    fn regex_and_exists() {
        let attrs = attributes(json!({"email": "alice@example.com"}));
        assert!(eval_condition(&attrs, &json!({"email": {"$regex": "@example\\.com$"}})));
        assert!(eval_condition(&attrs, &json!({"email": {"$exists": true}})));
        assert!(eval_condition(&attrs, &json!({"phone": {"$exists": false}})));
        assert!(!eval_condition(&attrs, &json!({"email": {"$regex": "("}})));
    }

    #[test]
    fn logical_operators() {
        let attrs = attributes(json!({"userId": "alice", "company": {"plan": "pro"}}));
        assert!(eval_condition(
            &attrs,
            &json!({"$or": [{"userId": "bob"}, {"company.plan": "pro"}]})
        ));
        assert!(!eval_condition(
            &attrs,
            &json!({"$and": [{"userId": "alice"}, {"company.plan": "free"}]})
        ));
        assert!(eval_condition(&attrs, &json!({"$not": {"userId": "bob"}})));
        assert!(!eval_condition(&attrs, &json!({"$nor": [{"userId": "alice"}]})));
        assert!(eval_condition(&attrs, &json!({"userId": {"$not": {"$eq": "bob"}}})));
    }
}
