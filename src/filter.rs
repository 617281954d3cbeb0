//! The JSON-logic-style filter DSL used by the graph store (C4) to prune
//! edges during path search.
//!
//! A filter is parsed once into a [`Filter`] tree ("compiled") and then
//! evaluated against each edge's metadata, rather than re-walking the raw
//! JSON on every edge.
use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// A compiled filter predicate.
#[derive(Debug, Clone)]
pub enum Filter {
    Var(String),
    Literal(Value),
    Eq(Box<Filter>, Box<Filter>),
    Ne(Box<Filter>, Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Compiles a filter from its JSON-logic representation. Returns
    /// `Err(InvalidInput)` on an unrecognized shape.
    pub fn compile(value: &Value) -> Result<Filter> {
        let obj = match value.as_object() {
            Some(o) => o,
            None => return Ok(Filter::Literal(value.clone())),
        };
        if obj.len() != 1 {
            return Err(Error::InvalidInput(
                "filter node must have exactly one operator key".into(),
            ));
        }
        let (op, args) = obj.iter().next().unwrap();
        match op.as_str() {
            "var" => {
                let name = args
                    .as_str()
                    .ok_or_else(|| Error::InvalidInput("var argument must be a string".into()))?;
                Ok(Filter::Var(name.to_string()))
            }
            "==" => {
                let (a, b) = compile_pair(args)?;
                Ok(Filter::Eq(Box::new(a), Box::new(b)))
            }
            "!=" => {
                let (a, b) = compile_pair(args)?;
                Ok(Filter::Ne(Box::new(a), Box::new(b)))
            }
            "and" => Ok(Filter::And(compile_list(args)?)),
            "or" => Ok(Filter::Or(compile_list(args)?)),
            other => Err(Error::InvalidInput(format!("unknown filter operator {other}"))),
        }
    }

    /// Evaluates the filter against `metadata`, the edge's variable
    /// environment. A name absent from `metadata` resolves to `Value::Null`.
    pub fn evaluate(&self, metadata: &HashMap<String, Value>) -> Result<bool> {
        // a non-boolean result at the top level (including null) is treated
        // as false; every filter this crate compiles bottoms out in Eq/Ne/
        // And/Or, so this only matters for a bare `var`/literal filter.
        Ok(self.eval_value(metadata)?.as_bool().unwrap_or(false))
    }

    fn eval_value(&self, metadata: &HashMap<String, Value>) -> Result<Value> {
        match self {
            Filter::Var(name) => Ok(metadata.get(name).cloned().unwrap_or(Value::Null)),
            Filter::Literal(v) => Ok(v.clone()),
            Filter::Eq(a, b) => Ok(Value::Bool(a.eval_value(metadata)? == b.eval_value(metadata)?)),
            Filter::Ne(a, b) => Ok(Value::Bool(a.eval_value(metadata)? != b.eval_value(metadata)?)),
            Filter::And(parts) => {
                for p in parts {
                    if !p.evaluate(metadata)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Filter::Or(parts) => {
                for p in parts {
                    if p.evaluate(metadata)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
        }
    }
}

fn compile_pair(args: &Value) -> Result<(Filter, Filter)> {
    let arr = args
        .as_array()
        .ok_or_else(|| Error::InvalidInput("== / != expects a 2-element array".into()))?;
    if arr.len() != 2 {
        return Err(Error::InvalidInput("== / != expects exactly 2 arguments".into()));
    }
    Ok((Filter::compile(&arr[0])?, Filter::compile(&arr[1])?))
}

fn compile_list(args: &Value) -> Result<Vec<Filter>> {
    let arr = args
        .as_array()
        .ok_or_else(|| Error::InvalidInput("and / or expects an array".into()))?;
    arr.iter().map(Filter::compile).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn var_equality() {
        let f = Filter::compile(&json!({"==": [{"var": "kind"}, "write"]})).unwrap();
        assert!(f.evaluate(&meta(&[("kind", json!("write"))])).unwrap());
        assert!(!f.evaluate(&meta(&[("kind", json!("read"))])).unwrap());
    }

    #[test]
    fn missing_var_is_null() {
        let f = Filter::compile(&json!({"==": [{"var": "missing"}, null]})).unwrap();
        assert!(f.evaluate(&meta(&[])).unwrap());
    }

    #[test]
    fn and_short_circuits_on_false() {
        let f = Filter::compile(&json!({
            "and": [
                {"==": [{"var": "a"}, 1]},
                {"==": [{"var": "b"}, 2]}
            ]
        }))
        .unwrap();
        assert!(f
            .evaluate(&meta(&[("a", json!(1)), ("b", json!(2))]))
            .unwrap());
        assert!(!f
            .evaluate(&meta(&[("a", json!(1)), ("b", json!(3))]))
            .unwrap());
    }

    #[test]
    fn or_of_ne() {
        let f = Filter::compile(&json!({
            "or": [
                {"!=": [{"var": "role"}, "owner"]},
                {"==": [{"var": "active"}, true]}
            ]
        }))
        .unwrap();
        assert!(f
            .evaluate(&meta(&[("role", json!("owner")), ("active", json!(true))]))
            .unwrap());
        assert!(!f
            .evaluate(&meta(&[("role", json!("owner")), ("active", json!(false))]))
            .unwrap());
    }

    #[test]
    fn unknown_operator_rejected() {
        assert!(Filter::compile(&json!({"nope": []})).is_err());
    }
}
