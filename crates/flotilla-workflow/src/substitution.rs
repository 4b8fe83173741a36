//! Variable substitution and constrained expression evaluation.
//!
//! Strings undergo `${a.b.c}` replacement against the instance scope.
//! Expressions are substituted the same way with each value JSON-encoded
//! before splicing, then evaluated as a boolean by a constrained evaluator
//! (numeric/boolean/string operators and comparisons only, no function
//! calls into the host). Evaluation failure yields `false`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([^}]+)\}").unwrap_or_else(|_| unreachable!("static pattern compiles"))
});

/// Traverse a dotted path through nested objects (and array indices).
/// Returns `None` when any segment is missing.
pub fn lookup_path<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = scope;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Substitute `${...}` placeholders in a string against the scope.
///
/// A string that is exactly one placeholder resolves to the referenced
/// value with its type preserved; partial placeholders splice in the
/// value's display form. Unresolved placeholders are left in place.
pub fn substitute_str(input: &str, scope: &Value) -> Value {
    if let Some(captures) = PLACEHOLDER.captures(input) {
        if let Some(whole) = captures.get(0) {
            if whole.start() == 0 && whole.end() == input.len() {
                let path = &captures[1];
                return match lookup_path(scope, path) {
                    Some(value) => value.clone(),
                    None => Value::String(input.to_string()),
                };
            }
        }
    }

    let replaced = PLACEHOLDER.replace_all(input, |captures: &regex::Captures<'_>| {
        match lookup_path(scope, &captures[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => captures[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

/// Recursively substitute every string inside a JSON value.
pub fn substitute_value(input: &Value, scope: &Value) -> Value {
    match input {
        Value::String(s) => substitute_str(s, scope),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| substitute_value(item, scope)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), substitute_value(value, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Substitute placeholders for an expression: each resolved value is
/// JSON-encoded before splicing so strings stay quoted. Unresolved
/// placeholders are left in place (and will fail evaluation, yielding
/// `false`).
pub fn substitute_expression(expression: &str, scope: &Value) -> String {
    PLACEHOLDER
        .replace_all(expression, |captures: &regex::Captures<'_>| {
            match lookup_path(scope, &captures[1]) {
                Some(value) => serde_json::to_string(value)
                    .unwrap_or_else(|_| captures[0].to_string()),
                None => captures[0].to_string(),
            }
        })
        .into_owned()
}

/// Substitute and evaluate a boolean expression. `===`/`!==` are
/// normalized to `==`/`!=`; any evaluation failure yields `false`.
pub fn evaluate_condition(expression: &str, scope: &Value) -> (bool, String) {
    let substituted = substitute_expression(expression, scope);
    let normalized = substituted.replace("===", "==").replace("!==", "!=");
    let result = evalexpr::eval_boolean(&normalized).unwrap_or(false);
    (result, substituted)
}

/// Fold values with a reduce expression over `acc` and `item`.
/// Only primitive values participate; anything else is an error.
pub fn reduce_values(expression: &str, values: &[Value]) -> Result<Value, String> {
    let normalized = expression.replace("===", "==").replace("!==", "!=");
    let mut iterator = values.iter();
    let Some(first) = iterator.next() else {
        return Ok(Value::Null);
    };
    let mut acc = to_eval(first)?;
    for item in iterator {
        let mut context = evalexpr::HashMapContext::new();
        evalexpr::ContextWithMutableVariables::set_value(&mut context, "acc".into(), acc.clone())
            .map_err(|e| e.to_string())?;
        evalexpr::ContextWithMutableVariables::set_value(&mut context, "item".into(), to_eval(item)?)
            .map_err(|e| e.to_string())?;
        acc = evalexpr::eval_with_context(&normalized, &context).map_err(|e| e.to_string())?;
    }
    from_eval(acc)
}

fn to_eval(value: &Value) -> Result<evalexpr::Value, String> {
    match value {
        Value::Null => Ok(evalexpr::Value::Empty),
        Value::Bool(b) => Ok(evalexpr::Value::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(evalexpr::Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(evalexpr::Value::Float(f))
            } else {
                Err(format!("unsupported number {n}"))
            }
        }
        Value::String(s) => Ok(evalexpr::Value::String(s.clone())),
        other => Err(format!("cannot reduce non-primitive value {other}")),
    }
}

fn from_eval(value: evalexpr::Value) -> Result<Value, String> {
    match value {
        evalexpr::Value::Empty => Ok(Value::Null),
        evalexpr::Value::Boolean(b) => Ok(Value::Bool(b)),
        evalexpr::Value::Int(i) => Ok(Value::from(i)),
        evalexpr::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite reduce result {f}")),
        evalexpr::Value::String(s) => Ok(Value::String(s)),
        other => Err(format!("unsupported reduce result {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "env": { "region": "eu-west-1", "replicas": 3 },
            "flag": true,
            "items": ["a", "b"],
            "result": { "score": 85 }
        })
    }

    #[test]
    fn path_lookup_traverses_objects_and_arrays() {
        let scope = scope();
        assert_eq!(
            lookup_path(&scope, "env.region"),
            Some(&json!("eu-west-1"))
        );
        assert_eq!(lookup_path(&scope, "items.1"), Some(&json!("b")));
        assert_eq!(lookup_path(&scope, "env.missing"), None);
    }

    #[test]
    fn whole_placeholder_preserves_type() {
        let scope = scope();
        assert_eq!(substitute_str("${env.replicas}", &scope), json!(3));
        assert_eq!(substitute_str("${flag}", &scope), json!(true));
    }

    #[test]
    fn partial_placeholder_splices_display_form() {
        let scope = scope();
        assert_eq!(
            substitute_str("deploy to ${env.region} x${env.replicas}", &scope),
            json!("deploy to eu-west-1 x3")
        );
    }

    #[test]
    fn unresolved_placeholders_are_left_in_place() {
        let scope = scope();
        assert_eq!(
            substitute_str("value: ${missing.path}", &scope),
            json!("value: ${missing.path}")
        );
    }

    #[test]
    fn nested_values_are_substituted() {
        let scope = scope();
        let input = json!({
            "region": "${env.region}",
            "nested": { "count": "${env.replicas}" },
            "list": ["${flag}"]
        });
        assert_eq!(
            substitute_value(&input, &scope),
            json!({
                "region": "eu-west-1",
                "nested": { "count": 3 },
                "list": [true]
            })
        );
    }

    #[test]
    fn conditions_json_encode_before_evaluation() {
        let scope = scope();
        let (result, evaluated) = evaluate_condition("${env.region} == \"eu-west-1\"", &scope);
        assert!(result, "evaluated as: {evaluated}");
        let (result, _) = evaluate_condition("${env.replicas} > 5", &scope);
        assert!(!result);
    }

    #[test]
    fn triple_equals_is_normalized() {
        let scope = scope();
        let (result, _) = evaluate_condition("${env.replicas} === 3", &scope);
        assert!(result);
        let (result, _) = evaluate_condition("${env.region} !== \"us-east-1\"", &scope);
        assert!(result);
    }

    #[test]
    fn evaluation_failure_is_false() {
        let scope = scope();
        let (result, _) = evaluate_condition("${missing} > 1", &scope);
        assert!(!result);
        let (result, _) = evaluate_condition("not an expression at all (", &scope);
        assert!(!result);
    }

    #[test]
    fn parent_result_is_reachable_in_conditions() {
        let scope = scope();
        let (result, _) = evaluate_condition("${result.score} >= 80", &scope);
        assert!(result);
    }

    #[test]
    fn reduce_folds_numbers() {
        let values = vec![json!(1), json!(2), json!(3)];
        assert_eq!(reduce_values("acc + item", &values).unwrap(), json!(6));
    }

    #[test]
    fn reduce_rejects_objects() {
        let values = vec![json!({"a": 1}), json!(2)];
        assert!(reduce_values("acc + item", &values).is_err());
    }
}
