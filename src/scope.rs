//! Attributes and scopes (v0.1)
//!
//! An [`Attribute`] is a named, typed value. A [`Scope`] is a named attribute
//! environment used as a mapping source or destination. Scopes are not
//! thread-safe; callers synchronize at the instance level.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::value::{coerce, CoercionError, Type};

/// A named, typed value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: Type,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl Attribute {
    /// Create an attribute, coercing the value to the declared type.
    ///
    /// A null value stays null (an unset attribute), it is not coerced to the
    /// type's zero value.
    pub fn new(
        name: impl Into<String>,
        value_type: Type,
        value: Value,
    ) -> Result<Self, CoercionError> {
        let value = if value.is_null() {
            value
        } else {
            coerce(&value, value_type)?
        };
        Ok(Self {
            name: name.into(),
            value_type,
            value,
        })
    }

    /// Create an attribute without touching the value
    pub fn raw(name: impl Into<String>, value_type: Type, value: Value) -> Self {
        Self {
            name: name.into(),
            value_type,
            value,
        }
    }
}

impl<'de> Deserialize<'de> for Attribute {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Rep {
            name: String,
            #[serde(rename = "type")]
            value_type: Type,
            #[serde(default)]
            value: Value,
        }

        let rep = Rep::deserialize(deserializer)?;
        Attribute::new(rep.name, rep.value_type, rep.value).map_err(serde::de::Error::custom)
    }
}

/// Scope access failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScopeError {
    #[error("attribute '{0}' does not exist in scope")]
    UndefinedAttr(String),

    #[error("scope is read-only")]
    ReadOnly,

    #[error(transparent)]
    Coercion(#[from] CoercionError),
}

/// A named attribute environment
pub trait Scope {
    /// Get an attribute by name
    fn get_attr(&self, name: &str) -> Option<Attribute>;

    /// Set the value of an existing attribute
    fn set_attr_value(&mut self, name: &str, value: Value) -> Result<(), ScopeError>;
}

/// A plain bag of attributes, used e.g. to expose start attributes as a
/// mapping source
#[derive(Debug, Clone, Default)]
pub struct AttrScope {
    attrs: HashMap<String, Attribute>,
}

impl AttrScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_attrs(attrs: &[Attribute]) -> Self {
        Self {
            attrs: attrs
                .iter()
                .map(|a| (a.name.clone(), a.clone()))
                .collect(),
        }
    }

    pub fn add_attr(&mut self, attr: Attribute) {
        self.attrs.insert(attr.name.clone(), attr);
    }
}

impl Scope for AttrScope {
    fn get_attr(&self, name: &str) -> Option<Attribute> {
        self.attrs.get(name).cloned()
    }

    fn set_attr_value(&mut self, name: &str, value: Value) -> Result<(), ScopeError> {
        match self.attrs.get_mut(name) {
            Some(attr) => {
                attr.value = value;
                Ok(())
            }
            None => Err(ScopeError::UndefinedAttr(name.to_string())),
        }
    }
}

/// A scope with a fixed attribute set, built from an activity's declared
/// inputs or outputs. Task-level attribute values override the declared
/// defaults; setting an undeclared name is an error.
#[derive(Debug, Clone, Default)]
pub struct FixedScope {
    attrs: HashMap<String, Attribute>,
}

impl FixedScope {
    pub fn new(declared: &[Attribute]) -> Self {
        Self {
            attrs: declared
                .iter()
                .map(|a| (a.name.clone(), a.clone()))
                .collect(),
        }
    }

    pub fn with_overrides(declared: &[Attribute], overrides: &[Attribute]) -> Self {
        let mut scope = Self::new(declared);
        for attr in overrides {
            if let Some(existing) = scope.attrs.get_mut(&attr.name) {
                existing.value = attr.value.clone();
            }
        }
        scope
    }

    /// Iterate over all attributes of the scope
    pub fn attrs(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.values()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

impl Scope for FixedScope {
    fn get_attr(&self, name: &str) -> Option<Attribute> {
        self.attrs.get(name).cloned()
    }

    fn set_attr_value(&mut self, name: &str, value: Value) -> Result<(), ScopeError> {
        match self.attrs.get_mut(name) {
            Some(attr) => {
                attr.value = value;
                Ok(())
            }
            None => Err(ScopeError::UndefinedAttr(name.to_string())),
        }
    }
}
