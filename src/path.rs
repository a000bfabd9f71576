//! Attribute reference paths (v0.1)
//!
//! A mapping reference like `{A2.result}`, `params.zipCode` or `items[1]`
//! decomposes into a root attribute name, an optional sub-path, and the path
//! kind. [`get_map_value`] walks a sub-path through nested objects and
//! arrays; missing keys and out-of-range indices are errors, never a silent
//! null.

use serde_json::Value;
use thiserror::Error;

/// How a reference addresses into its root attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Plain attribute reference
    Simple,
    /// Keyed access: `root.key[.key…]`
    Map,
    /// Indexed access: `root[i]`
    Array,
}

/// Decomposed attribute reference
#[derive(Debug, Clone, PartialEq)]
pub struct AttrRef {
    pub root: String,
    pub sub: String,
    pub kind: PathKind,
}

/// Path resolution failure inside a mapping
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PathError {
    #[error("invalid mapping [{path}]")]
    Unresolved { path: String },

    #[error("invalid mapping [{path}], index out of range")]
    IndexOutOfRange { path: String },
}

/// Decompose a reference string into `(root, sub, kind)`.
///
/// A braced root (`{A2.result}`) keeps the braces, and everything inside
/// them, as part of the root name.
pub fn parse_attr_ref(reference: &str) -> AttrRef {
    if let Some(rest) = reference.strip_prefix('{') {
        if let Some(close) = rest.find('}') {
            let root = &reference[..close + 2];
            let tail = &rest[close + 1..];

            if let Some(sub) = tail.strip_prefix('.') {
                return AttrRef {
                    root: root.to_string(),
                    sub: sub.to_string(),
                    kind: PathKind::Map,
                };
            }
            if let Some(inner) = tail.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
                return AttrRef {
                    root: root.to_string(),
                    sub: inner.to_string(),
                    kind: PathKind::Array,
                };
            }
            return AttrRef {
                root: root.to_string(),
                sub: String::new(),
                kind: PathKind::Simple,
            };
        }
    }

    if let Some(open) = reference.find('[') {
        if let Some(inner) = reference[open + 1..].strip_suffix(']') {
            return AttrRef {
                root: reference[..open].to_string(),
                sub: inner.to_string(),
                kind: PathKind::Array,
            };
        }
    }

    if let Some(dot) = reference.find('.') {
        return AttrRef {
            root: reference[..dot].to_string(),
            sub: reference[dot + 1..].to_string(),
            kind: PathKind::Map,
        };
    }

    AttrRef {
        root: reference.to_string(),
        sub: String::new(),
        kind: PathKind::Simple,
    }
}

/// Walk a dotted sub-path (with optional `seg[i]` array indexing) through a
/// value and return the addressed element.
pub fn get_map_value(root: &Value, path: &str) -> Result<Value, PathError> {
    let unresolved = || PathError::Unresolved {
        path: path.to_string(),
    };

    let mut current = root;

    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(unresolved());
        }

        if let Some(open) = segment.find('[') {
            let name = &segment[..open];
            let idx: usize = segment[open + 1..]
                .strip_suffix(']')
                .and_then(|s| s.parse().ok())
                .ok_or_else(unresolved)?;

            if !name.is_empty() {
                current = match current.get(name) {
                    Some(v) if !v.is_null() => v,
                    _ => return Err(unresolved()),
                };
            }

            let arr = current.as_array().ok_or_else(unresolved)?;
            current = arr.get(idx).ok_or(PathError::IndexOutOfRange {
                path: path.to_string(),
            })?;
        } else {
            // a null or missing intermediate fails on the next segment's get
            current = match current.get(segment) {
                Some(v) => v,
                None => return Err(unresolved()),
            };
        }
    }

    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_simple_reference() {
        let r = parse_attr_ref("pathParams");
        assert_eq!(r.root, "pathParams");
        assert_eq!(r.kind, PathKind::Simple);
        assert!(r.sub.is_empty());
    }

    #[test]
    fn parse_braced_root_keeps_braces() {
        let r = parse_attr_ref("{A2.result}");
        assert_eq!(r.root, "{A2.result}");
        assert_eq!(r.kind, PathKind::Simple);

        let r = parse_attr_ref("{A2.result}.current_observation");
        assert_eq!(r.root, "{A2.result}");
        assert_eq!(r.sub, "current_observation");
        assert_eq!(r.kind, PathKind::Map);
    }

    #[test]
    fn parse_map_reference() {
        let r = parse_attr_ref("params.zipCode");
        assert_eq!(r.root, "params");
        assert_eq!(r.sub, "zipCode");
        assert_eq!(r.kind, PathKind::Map);
    }

    #[test]
    fn parse_array_reference() {
        let r = parse_attr_ref("items[2]");
        assert_eq!(r.root, "items");
        assert_eq!(r.sub, "2");
        assert_eq!(r.kind, PathKind::Array);

        let r = parse_attr_ref("{A3.out}[0]");
        assert_eq!(r.root, "{A3.out}");
        assert_eq!(r.sub, "0");
        assert_eq!(r.kind, PathKind::Array);
    }

    #[test]
    fn walk_nested_objects() {
        let v = json!({"a": {"b": {"c": 42}}});
        assert_eq!(get_map_value(&v, "a.b.c").unwrap(), json!(42));
    }

    #[test]
    fn walk_array_segment() {
        let v = json!({"users": [{"name": "Ada"}, {"name": "Grace"}]});
        assert_eq!(get_map_value(&v, "users[1].name").unwrap(), json!("Grace"));
    }

    #[test]
    fn missing_key_is_an_error() {
        let v = json!({"a": 1});
        let err = get_map_value(&v, "b").unwrap_err();
        assert_eq!(
            err,
            PathError::Unresolved {
                path: "b".to_string()
            }
        );
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let v = json!({"items": [1, 2]});
        let err = get_map_value(&v, "items[5]").unwrap_err();
        assert!(matches!(err, PathError::IndexOutOfRange { .. }));
    }

    #[test]
    fn null_intermediate_is_an_error() {
        let v = json!({"a": null});
        assert!(get_map_value(&v, "a[0]").is_err());
    }

    #[test]
    fn final_explicit_null_is_returned() {
        let v = json!({"a": {"b": null}});
        assert_eq!(get_map_value(&v, "a.b").unwrap(), Value::Null);
    }

    #[test]
    fn walk_survives_a_serialization_round_trip() {
        let v = json!({
            "observation": {
                "temp_c": 21.5,
                "stations": [{"id": "KSFO"}, {"id": "KOAK"}]
            }
        });

        let round_tripped: Value =
            serde_json::from_str(&serde_json::to_string(&v).unwrap()).unwrap();

        for path in ["observation.temp_c", "observation.stations[1].id"] {
            assert_eq!(
                get_map_value(&round_tripped, path).unwrap(),
                get_map_value(&v, path).unwrap()
            );
        }
    }
}
