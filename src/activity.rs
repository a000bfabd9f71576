//! Activities (v0.1)
//!
//! Activities are the pluggable units of work a task invokes. They are
//! registered by type id; the executor treats an unknown type as "no
//! activity" and lets the task behavior decide what that means.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mapper::MappingError;
use crate::scope::{Attribute, ScopeError};
use crate::value;

/// Structured error raised by an activity (or converted from a lower-level
/// fault). Routed to the flow's error handler when one is defined.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,
    pub data: Option<Value>,
}

impl ActivityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

impl From<MappingError> for ActivityError {
    fn from(err: MappingError) -> Self {
        ActivityError::new(err.to_string())
    }
}

impl From<ScopeError> for ActivityError {
    fn from(err: ScopeError) -> Self {
        ActivityError::new(err.to_string())
    }
}

/// Declared inputs and outputs of an activity
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityMetadata {
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<Attribute>,
    #[serde(default)]
    pub outputs: Vec<Attribute>,
}

impl ActivityMetadata {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Handler receiving the reply of an explicit-reply flow
pub trait ReplyHandler: Send + Sync {
    fn reply(&self, code: i64, data: Value);
}

/// Execution context an activity runs against
pub trait ActivityContext {
    /// ID of the executing flow instance
    fn flow_instance_id(&self) -> &str;

    /// Name of the flow
    fn flow_name(&self) -> &str;

    /// Name of the task the activity is executing for
    fn task_name(&self) -> &str;

    /// Value of the named input attribute
    fn get_input(&self, name: &str) -> Option<Value>;

    /// Set the named output attribute
    fn set_output(&mut self, name: &str, value: Value) -> Result<(), ScopeError>;

    /// Reply handler of the instance, when the host attached one
    fn reply_handler(&self) -> Option<Arc<dyn ReplyHandler>>;
}

/// A pluggable unit of work
pub trait Activity: Send + Sync {
    /// Declared inputs and outputs
    fn metadata(&self) -> &ActivityMetadata;

    /// Execute against the context; `Ok(true)` means the work finished
    /// synchronously, `Ok(false)` defers completion to a later `PostEval`.
    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError>;
}

/// Registry of activities keyed by activity type
#[derive(Default)]
pub struct ActivityRegistry {
    activities: DashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in activities
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(LogActivity::new()));
        registry.register(Arc::new(ReplyActivity::new()));
        registry
    }

    pub fn register(&self, activity: Arc<dyn Activity>) {
        let id = activity.metadata().id.clone();
        if self.activities.insert(id.clone(), activity).is_some() {
            warn!(activity = %id, "activity re-registered, replacing previous");
        }
    }

    pub fn get(&self, activity_type: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(activity_type).map(|a| Arc::clone(&a))
    }
}

// ============================================================================
// BUILT-IN ACTIVITIES
// ============================================================================

static LOG_METADATA: Lazy<ActivityMetadata> = Lazy::new(|| {
    ActivityMetadata::from_json(
        r#"{
          "id": "log",
          "inputs": [
            {"name": "message", "type": "string"},
            {"name": "flowInfo", "type": "boolean", "value": false}
          ],
          "outputs": [
            {"name": "message", "type": "string"}
          ]
        }"#,
    )
    .expect("built-in log metadata is valid")
});

/// Writes its message input through the logger
pub struct LogActivity {
    metadata: ActivityMetadata,
}

impl LogActivity {
    pub fn new() -> Self {
        Self {
            metadata: LOG_METADATA.clone(),
        }
    }
}

impl Default for LogActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity for LogActivity {
    fn metadata(&self) -> &ActivityMetadata {
        &self.metadata
    }

    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        let message = ctx
            .get_input("message")
            .map(|v| value::to_string(&v))
            .transpose()
            .map_err(|e| ActivityError::new(e.to_string()))?
            .unwrap_or_default();

        let flow_info = ctx
            .get_input("flowInfo")
            .map(|v| value::to_boolean(&v).unwrap_or(false))
            .unwrap_or(false);

        if flow_info {
            info!(flow = %ctx.flow_name(), task = %ctx.task_name(), "{message}");
        } else {
            info!("{message}");
        }

        ctx.set_output("message", Value::String(message))?;
        Ok(true)
    }
}

static REPLY_METADATA: Lazy<ActivityMetadata> = Lazy::new(|| {
    ActivityMetadata::from_json(
        r#"{
          "id": "reply",
          "inputs": [
            {"name": "code", "type": "integer"},
            {"name": "data", "type": "any"}
          ],
          "outputs": []
        }"#,
    )
    .expect("built-in reply metadata is valid")
});

/// Delivers `{code, data}` to the instance's reply handler
pub struct ReplyActivity {
    metadata: ActivityMetadata,
}

impl ReplyActivity {
    pub fn new() -> Self {
        Self {
            metadata: REPLY_METADATA.clone(),
        }
    }
}

impl Default for ReplyActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity for ReplyActivity {
    fn metadata(&self) -> &ActivityMetadata {
        &self.metadata
    }

    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        let code = match ctx.get_input("code") {
            Some(v) => value::to_integer(&v).map_err(|e| ActivityError::new(e.to_string()))?,
            None => 0,
        };
        let data = ctx.get_input("data").unwrap_or(Value::Null);

        match ctx.reply_handler() {
            Some(handler) => handler.reply(code, data),
            None => debug!(task = %ctx.task_name(), "no reply handler attached, dropping reply"),
        }

        Ok(true)
    }
}
