//! Typed values and coercion (v0.1)
//!
//! The dynamic value carrier is `serde_json::Value`. Every attribute carries
//! a declared [`Type`]; [`coerce`] bridges untyped JSON into the declared
//! type and is the only place that does so.
//!
//! Conversion rules are total for defined pairs:
//! - `bool -> int`: true=1 / false=0
//! - `nil -> string`: ""
//! - numbers dispatch on presence of a fractional part (integer vs float)
//! - `object -> params`: every value coerced to string

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Declared type of an attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "object")]
    Object,
    #[serde(rename = "array")]
    Array,
    #[serde(rename = "params")]
    Params,
    #[serde(rename = "complexObject", alias = "complex_object")]
    ComplexObject,
    #[serde(rename = "any")]
    Any,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::String => "string",
            Type::Integer => "integer",
            Type::Number => "number",
            Type::Boolean => "boolean",
            Type::Object => "object",
            Type::Array => "array",
            Type::Params => "params",
            Type::ComplexObject => "complexObject",
            Type::Any => "any",
        };
        f.write_str(name)
    }
}

/// Coercion failure: the value shape has no defined conversion to the type
#[derive(Debug, Clone, Error, PartialEq)]
#[error("unable to coerce {value} to {to}")]
pub struct CoercionError {
    pub value: String,
    pub to: Type,
}

impl CoercionError {
    fn new(value: &Value, to: Type) -> Self {
        Self {
            value: value.to_string(),
            to,
        }
    }
}

/// Carrier for opaque structured payloads exchanged with activities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexObject {
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub value: Value,
}

impl ComplexObject {
    /// The empty carrier used when coercing nil
    pub fn empty() -> Self {
        Self {
            metadata: String::new(),
            value: Value::Object(Default::default()),
        }
    }
}

/// Coerce a value into the canonical JSON shape of the given type
pub fn coerce(value: &Value, to: Type) -> Result<Value, CoercionError> {
    match to {
        Type::String => to_string(value).map(Value::String),
        Type::Integer => to_integer(value).map(Value::from),
        Type::Number => to_number(value).map(Value::from),
        Type::Boolean => to_boolean(value).map(Value::Bool),
        Type::Object => to_object(value).map(Value::Object),
        Type::Array => to_array(value).map(Value::Array),
        Type::Params => to_params(value).map(|m| {
            Value::Object(m.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
        }),
        Type::ComplexObject => {
            let complex = to_complex_object(value)?;
            serde_json::to_value(&complex).map_err(|_| CoercionError::new(value, to))
        }
        Type::Any => Ok(fix_up_value(value.clone())),
    }
}

/// Coerce a value to a string
pub fn to_string(val: &Value) -> Result<String, CoercionError> {
    match val {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        Value::Object(_) => {
            serde_json::to_string(val).map_err(|_| CoercionError::new(val, Type::String))
        }
        Value::Array(_) => Err(CoercionError::new(val, Type::String)),
    }
}

/// Coerce a value to an integer
pub fn to_integer(val: &Value) -> Result<i64, CoercionError> {
    match val {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64() {
                Ok(f as i64)
            } else {
                Err(CoercionError::new(val, Type::Integer))
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| CoercionError::new(val, Type::Integer)),
        Value::Bool(b) => Ok(if *b { 1 } else { 0 }),
        Value::Null => Ok(0),
        _ => Err(CoercionError::new(val, Type::Integer)),
    }
}

/// Coerce a value to a floating-point number
pub fn to_number(val: &Value) -> Result<f64, CoercionError> {
    match val {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| CoercionError::new(val, Type::Number)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| CoercionError::new(val, Type::Number)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        _ => Err(CoercionError::new(val, Type::Number)),
    }
}

/// Coerce a value to a boolean
pub fn to_boolean(val: &Value) -> Result<bool, CoercionError> {
    match val {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i != 0)
            } else if let Some(f) = n.as_f64() {
                Ok(f != 0.0)
            } else {
                Err(CoercionError::new(val, Type::Boolean))
            }
        }
        Value::String(s) => match s.trim() {
            "true" | "True" | "TRUE" | "t" | "T" | "1" => Ok(true),
            "false" | "False" | "FALSE" | "f" | "F" | "0" => Ok(false),
            _ => Err(CoercionError::new(val, Type::Boolean)),
        },
        Value::Null => Ok(false),
        _ => Err(CoercionError::new(val, Type::Boolean)),
    }
}

/// Coerce a value to an object map
pub fn to_object(val: &Value) -> Result<serde_json::Map<String, Value>, CoercionError> {
    match val {
        Value::Object(m) => Ok(m.clone()),
        _ => Err(CoercionError::new(val, Type::Object)),
    }
}

/// Coerce a value to an array
pub fn to_array(val: &Value) -> Result<Vec<Value>, CoercionError> {
    match val {
        Value::Array(a) => Ok(a.clone()),
        _ => Err(CoercionError::new(val, Type::Array)),
    }
}

/// Coerce a value to params (string-to-string map)
pub fn to_params(val: &Value) -> Result<BTreeMap<String, String>, CoercionError> {
    match val {
        Value::Object(m) => {
            let mut params = BTreeMap::new();
            for (k, v) in m {
                params.insert(k.clone(), to_string(v)?);
            }
            Ok(params)
        }
        _ => Err(CoercionError::new(val, Type::Params)),
    }
}

/// Coerce a value to a complex object carrier
pub fn to_complex_object(val: &Value) -> Result<ComplexObject, CoercionError> {
    match val {
        Value::Null => Ok(ComplexObject::empty()),
        Value::String(s) if s.is_empty() => Ok(ComplexObject::empty()),
        Value::String(s) => {
            serde_json::from_str(s).map_err(|_| CoercionError::new(val, Type::ComplexObject))
        }
        Value::Object(_) => serde_json::from_value(val.clone())
            .map_err(|_| CoercionError::new(val, Type::ComplexObject)),
        _ => Err(CoercionError::new(val, Type::ComplexObject)),
    }
}

/// Normalize a JSON number into integer or floating form.
///
/// Numbers without a fractional part surface as integers, everything else is
/// left untouched.
pub fn fix_up_value(val: Value) -> Value {
    match val {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                Value::from(f)
            } else {
                Value::Number(n)
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_names_round_trip() {
        for (t, name) in [
            (Type::String, "\"string\""),
            (Type::Integer, "\"integer\""),
            (Type::Params, "\"params\""),
            (Type::ComplexObject, "\"complexObject\""),
            (Type::Any, "\"any\""),
        ] {
            assert_eq!(serde_json::to_string(&t).unwrap(), name);
            let back: Type = serde_json::from_str(name).unwrap();
            assert_eq!(back, t);
        }
    }

    #[test]
    fn string_coercion_covers_primitives() {
        assert_eq!(to_string(&json!("x")).unwrap(), "x");
        assert_eq!(to_string(&json!(5)).unwrap(), "5");
        assert_eq!(to_string(&json!(2.5)).unwrap(), "2.5");
        assert_eq!(to_string(&json!(true)).unwrap(), "true");
        assert_eq!(to_string(&Value::Null).unwrap(), "");
        assert_eq!(to_string(&json!({"a": 1})).unwrap(), r#"{"a":1}"#);
        assert!(to_string(&json!([1, 2])).is_err());
    }

    #[test]
    fn integer_coercion_rules() {
        assert_eq!(to_integer(&json!(7)).unwrap(), 7);
        assert_eq!(to_integer(&json!(7.9)).unwrap(), 7); // truncates
        assert_eq!(to_integer(&json!("42")).unwrap(), 42);
        assert_eq!(to_integer(&json!(true)).unwrap(), 1);
        assert_eq!(to_integer(&json!(false)).unwrap(), 0);
        assert_eq!(to_integer(&Value::Null).unwrap(), 0);
        assert!(to_integer(&json!("nope")).is_err());
        assert!(to_integer(&json!({})).is_err());
    }

    #[test]
    fn number_coercion_rules() {
        assert_eq!(to_number(&json!(3)).unwrap(), 3.0);
        assert_eq!(to_number(&json!(3.5)).unwrap(), 3.5);
        assert_eq!(to_number(&json!("1.25")).unwrap(), 1.25);
        assert_eq!(to_number(&json!(true)).unwrap(), 1.0);
        assert_eq!(to_number(&Value::Null).unwrap(), 0.0);
        assert!(to_number(&json!([])).is_err());
    }

    #[test]
    fn boolean_coercion_rules() {
        assert!(to_boolean(&json!(true)).unwrap());
        assert!(to_boolean(&json!(1)).unwrap());
        assert!(!to_boolean(&json!(0)).unwrap());
        assert!(!to_boolean(&json!(0.0)).unwrap());
        assert!(to_boolean(&json!("true")).unwrap());
        assert!(!to_boolean(&json!("false")).unwrap());
        assert!(!to_boolean(&Value::Null).unwrap());
        assert!(to_boolean(&json!("maybe")).is_err());
    }

    #[test]
    fn params_coerce_values_to_strings() {
        let params = to_params(&json!({"a": 1, "b": "x", "c": true})).unwrap();
        assert_eq!(params["a"], "1");
        assert_eq!(params["b"], "x");
        assert_eq!(params["c"], "true");

        assert!(to_params(&json!("not a map")).is_err());
    }

    #[test]
    fn complex_object_from_nil_is_empty_carrier() {
        let c = to_complex_object(&Value::Null).unwrap();
        assert_eq!(c.value, json!({}));
        assert_eq!(to_complex_object(&json!("")).unwrap(), ComplexObject::empty());
    }

    #[test]
    fn complex_object_from_json_string() {
        let c = to_complex_object(&json!(r#"{"metadata":"m","value":{"k":1}}"#)).unwrap();
        assert_eq!(c.metadata, "m");
        assert_eq!(c.value, json!({"k": 1}));
    }

    #[test]
    fn coerce_normalizes_to_declared_type() {
        assert_eq!(coerce(&json!("200"), Type::Integer).unwrap(), json!(200));
        assert_eq!(coerce(&json!(1), Type::Boolean).unwrap(), json!(true));
        assert_eq!(
            coerce(&json!({"a": 2}), Type::Params).unwrap(),
            json!({"a": "2"})
        );
        let err = coerce(&json!([1]), Type::Object).unwrap_err();
        assert_eq!(err.to, Type::Object);
    }

    #[test]
    fn fix_up_value_dispatches_on_fraction() {
        assert_eq!(fix_up_value(json!(4.0)), json!(4.0)); // already float-typed
        assert_eq!(fix_up_value(json!(4)), json!(4));
        assert_eq!(fix_up_value(json!("s")), json!("s"));
    }
}
