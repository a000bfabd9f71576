//! Declarative attribute mapping (v0.1)
//!
//! A [`Mapper`] holds an ordered list of [`Mapping`] records and applies them
//! between two scopes. Missing source attributes skip that mapping (debug
//! log only); a missing destination aborts the remaining mappings of the
//! call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::path::{get_map_value, parse_attr_ref, PathError, PathKind};
use crate::scope::{Scope, ScopeError};
use crate::value::{self, CoercionError, Type};

/// Kind of a mapping record (wire values 1..3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MappingKind {
    /// Attribute-to-attribute assignment
    Assign = 1,
    /// Literal-to-attribute assignment
    Literal = 2,
    /// Expression execution (declared, not supported)
    Expression = 3,
}

impl TryFrom<u8> for MappingKind {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(MappingKind::Assign),
            2 => Ok(MappingKind::Literal),
            3 => Ok(MappingKind::Expression),
            other => Err(format!("unknown mapping type {other}")),
        }
    }
}

impl From<MappingKind> for u8 {
    fn from(k: MappingKind) -> u8 {
        k as u8
    }
}

/// A single declarative transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(rename = "type")]
    pub kind: MappingKind,
    pub value: Value,
    #[serde(rename = "mapTo")]
    pub map_to: String,
}

/// Mapping application failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MappingError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("attribute '{0}' not found in output scope")]
    DestMissing(String),

    #[error("attribute '{0}' is not an array")]
    NotAnArray(String),

    #[error("attribute '{0}' is not a params or object map")]
    NotAMap(String),

    #[error("invalid array index '{0}'")]
    BadIndex(String),

    #[error("assign mapping value must be an attribute reference, got {0}")]
    BadAssignValue(String),

    #[error("expression mappings are not supported")]
    ExpressionUnsupported,

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Coercion(#[from] CoercionError),
}

/// Ordered list of mappings applied atomically to a pair of scopes
#[derive(Debug, Clone, Default)]
pub struct Mapper {
    mappings: Vec<Mapping>,
}

impl Mapper {
    pub fn new(mappings: Vec<Mapping>) -> Self {
        Self { mappings }
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Execute the mappings in declared order, reading from `in_scope` and
    /// writing into `out_scope`.
    pub fn apply(
        &self,
        in_scope: &dyn Scope,
        out_scope: &mut dyn Scope,
    ) -> Result<(), MappingError> {
        for mapping in &self.mappings {
            match mapping.kind {
                MappingKind::Assign => self.apply_assign(mapping, in_scope, out_scope)?,
                MappingKind::Literal => {
                    out_scope.set_attr_value(&mapping.map_to, mapping.value.clone())?;
                }
                MappingKind::Expression => return Err(MappingError::ExpressionUnsupported),
            }
        }
        Ok(())
    }

    fn apply_assign(
        &self,
        mapping: &Mapping,
        in_scope: &dyn Scope,
        out_scope: &mut dyn Scope,
    ) -> Result<(), MappingError> {
        let reference = mapping
            .value
            .as_str()
            .ok_or_else(|| MappingError::BadAssignValue(mapping.value.to_string()))?;
        let src = parse_attr_ref(reference);

        let Some(attr) = in_scope.get_attr(&src.root) else {
            debug!(attr = %src.root, "source attribute missing, skipping mapping");
            return Ok(());
        };

        let mut attr_value = attr.value.clone();

        if !src.sub.is_empty() {
            match attr.value_type {
                Type::Params => {
                    // params hold flat string values
                    match attr_value.get(&src.sub) {
                        Some(v) => attr_value = v.clone(),
                        None => {
                            debug!(attr = %src.root, key = %src.sub, "param missing, skipping mapping");
                            return Ok(());
                        }
                    }
                }
                Type::Array if src.kind == PathKind::Array => {
                    let idx: usize = src
                        .sub
                        .parse()
                        .map_err(|_| MappingError::BadIndex(src.sub.clone()))?;
                    let arr = attr_value
                        .as_array()
                        .ok_or_else(|| MappingError::NotAnArray(src.root.clone()))?;
                    attr_value = arr
                        .get(idx)
                        .cloned()
                        .ok_or(PathError::IndexOutOfRange {
                            path: reference.to_string(),
                        })?;
                }
                _ => {
                    attr_value = get_map_value(&attr_value, &src.sub)?;
                }
            }
        }

        let dst = parse_attr_ref(&mapping.map_to);
        let to_attr = out_scope
            .get_attr(&dst.root)
            .ok_or_else(|| MappingError::DestMissing(dst.root.clone()))?;

        match dst.kind {
            PathKind::Simple => {
                out_scope.set_attr_value(&dst.root, attr_value)?;
            }
            PathKind::Array => {
                if to_attr.value_type != Type::Array {
                    return Err(MappingError::NotAnArray(dst.root.clone()));
                }
                let mut arr = match to_attr.value {
                    Value::Array(a) => a,
                    Value::Null => Vec::new(),
                    _ => return Err(MappingError::NotAnArray(dst.root.clone())),
                };
                let idx: usize = dst
                    .sub
                    .parse()
                    .map_err(|_| MappingError::BadIndex(dst.sub.clone()))?;
                if idx >= arr.len() {
                    arr.resize(idx + 1, Value::Null);
                }
                arr[idx] = attr_value;
                out_scope.set_attr_value(&dst.root, Value::Array(arr))?;
            }
            PathKind::Map => match to_attr.value_type {
                Type::Params => {
                    let mut map = match to_attr.value {
                        Value::Object(m) => m,
                        Value::Null => Default::default(),
                        _ => return Err(MappingError::NotAMap(dst.root.clone())),
                    };
                    let str_val = value::to_string(&attr_value)?;
                    map.insert(dst.sub.clone(), Value::String(str_val));
                    out_scope.set_attr_value(&dst.root, Value::Object(map))?;
                }
                Type::Object => {
                    let mut map = match to_attr.value {
                        Value::Object(m) => m,
                        Value::Null => Default::default(),
                        _ => return Err(MappingError::NotAMap(dst.root.clone())),
                    };
                    map.insert(dst.sub.clone(), attr_value);
                    out_scope.set_attr_value(&dst.root, Value::Object(map))?;
                }
                _ => return Err(MappingError::NotAMap(dst.root.clone())),
            },
        }

        Ok(())
    }
}
