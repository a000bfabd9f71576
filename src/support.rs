//! Test-time execution overrides (v0.1)
//!
//! A [`Patch`] replaces output-mapper results for chosen tasks; an
//! [`Interceptor`] pre-loads task inputs, optionally skips activity
//! evaluation, and collects outputs for harness assertions. Both are
//! attached per instance and deserialize from JSON so external test drivers
//! can supply them.

use serde::{Deserialize, Serialize};

use crate::definition::TaskId;
use crate::scope::Attribute;

/// Output-mapper override for specific tasks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patch {
    #[serde(rename = "tasks", default)]
    task_patches: Vec<TaskPatch>,
}

impl Patch {
    pub fn new(task_patches: Vec<TaskPatch>) -> Self {
        Self { task_patches }
    }

    pub fn get_patch(&self, task_id: TaskId) -> Option<&TaskPatch> {
        self.task_patches.iter().find(|p| p.id == task_id)
    }
}

/// Replacement attributes for one task's output mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPatch {
    pub id: TaskId,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

/// Per-task input overrides, skip flags, and output capture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interceptor {
    #[serde(rename = "tasks", default)]
    task_interceptors: Vec<TaskInterceptor>,
}

impl Interceptor {
    pub fn new(task_interceptors: Vec<TaskInterceptor>) -> Self {
        Self { task_interceptors }
    }

    pub fn get_task_interceptor(&self, task_id: TaskId) -> Option<&TaskInterceptor> {
        self.task_interceptors.iter().find(|i| i.id == task_id)
    }

    pub fn get_task_interceptor_mut(&mut self, task_id: TaskId) -> Option<&mut TaskInterceptor> {
        self.task_interceptors.iter_mut().find(|i| i.id == task_id)
    }
}

/// Override entry for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInterceptor {
    pub id: TaskId,
    /// Report the task done without invoking its activity
    #[serde(default)]
    pub skip: bool,
    /// Values that replace the normal input mapping
    #[serde(default)]
    pub inputs: Vec<Attribute>,
    /// Outputs captured after evaluation, for assertions
    #[serde(default)]
    pub outputs: Vec<Attribute>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_lookup_by_task_id() {
        let patch: Patch = serde_json::from_value(json!({
            "tasks": [
                {"id": 2, "attributes": [{"name": "{A2.x}", "type": "integer", "value": 9}]}
            ]
        }))
        .unwrap();

        let entry = patch.get_patch(2).unwrap();
        assert_eq!(entry.attributes[0].value, json!(9));
        assert!(patch.get_patch(3).is_none());
    }

    #[test]
    fn interceptor_deserializes_skip_and_inputs() {
        let mut interceptor: Interceptor = serde_json::from_value(json!({
            "tasks": [
                {"id": 2, "skip": true, "inputs": [{"name": "message", "type": "string", "value": "injected"}]}
            ]
        }))
        .unwrap();

        let entry = interceptor.get_task_interceptor(2).unwrap();
        assert!(entry.skip);
        assert_eq!(entry.inputs[0].value, json!("injected"));

        interceptor
            .get_task_interceptor_mut(2)
            .unwrap()
            .outputs
            .push(crate::scope::Attribute::raw(
                "message",
                crate::value::Type::String,
                json!("captured"),
            ));
        assert_eq!(
            interceptor.get_task_interceptor(2).unwrap().outputs.len(),
            1
        );
    }
}
