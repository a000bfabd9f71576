//! Per-step change tracking (v0.1)
//!
//! Every mutation of an instance during one `do_step` (status, attributes,
//! task data, link data, work queue) is recorded here. The executor offers
//! the accumulated batch to the state recorder after each step and resets
//! the tracker; a step is the unit of recorded state.

use serde::Serialize;

use crate::definition::{LinkId, TaskId};
use crate::instance::{EnvId, ExecType, LinkState, Status};
use crate::scope::Attribute;

/// Kind of a tracked mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Update,
    Delete,
}

/// Work-queue mutation (push or pop)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemQueueChange {
    pub change_type: ChangeType,
    pub id: u32,
    pub task_id: TaskId,
    pub exec_type: ExecType,
    pub eval_code: i32,
}

/// Task-data mutation with a state snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDataChange {
    pub change_type: ChangeType,
    pub env_id: EnvId,
    pub id: TaskId,
    pub state: i32,
    pub done: bool,
}

/// Link-data mutation with a state snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDataChange {
    pub change_type: ChangeType,
    pub env_id: EnvId,
    pub id: LinkId,
    pub state: LinkState,
}

/// Flow-attribute mutation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttrChange {
    pub change_type: ChangeType,
    pub attribute: Attribute,
}

/// Accumulates the changes of the current step
#[derive(Debug, Default)]
pub struct InstanceChangeTracker {
    status: Option<Status>,
    state: Option<i32>,
    attr_changes: Vec<AttrChange>,
    task_data_changes: Vec<TaskDataChange>,
    link_data_changes: Vec<LinkDataChange>,
    queue_changes: Vec<WorkItemQueueChange>,
}

impl InstanceChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = Some(status);
    }

    pub fn set_state(&mut self, state: i32) {
        self.state = Some(state);
    }

    pub fn track_attr(&mut self, change_type: ChangeType, attribute: Attribute) {
        self.attr_changes.push(AttrChange {
            change_type,
            attribute,
        });
    }

    pub fn track_task_data(&mut self, change: TaskDataChange) {
        self.task_data_changes.push(change);
    }

    pub fn track_link_data(&mut self, change: LinkDataChange) {
        self.link_data_changes.push(change);
    }

    pub fn track_work_item(&mut self, change: WorkItemQueueChange) {
        self.queue_changes.push(change);
    }

    /// Begin a new batch
    pub fn reset_changes(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.state.is_none()
            && self.attr_changes.is_empty()
            && self.task_data_changes.is_empty()
            && self.link_data_changes.is_empty()
            && self.queue_changes.is_empty()
    }

    pub fn attr_changes(&self) -> &[AttrChange] {
        &self.attr_changes
    }

    pub fn task_data_changes(&self) -> &[TaskDataChange] {
        &self.task_data_changes
    }

    pub fn link_data_changes(&self) -> &[LinkDataChange] {
        &self.link_data_changes
    }

    pub fn queue_changes(&self) -> &[WorkItemQueueChange] {
        &self.queue_changes
    }

    /// Snapshot the current changes as a recorder-facing batch
    pub fn batch(&self, instance_id: &str, step_id: u32) -> ChangeBatch {
        ChangeBatch {
            instance_id: instance_id.to_string(),
            step_id,
            status: self.status,
            state: self.state,
            attr_changes: self.attr_changes.clone(),
            task_data_changes: self.task_data_changes.clone(),
            link_data_changes: self.link_data_changes.clone(),
            queue_changes: self.queue_changes.clone(),
        }
    }
}

/// One step's worth of recorded changes, as handed to the state recorder
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub instance_id: String,
    pub step_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<i32>,
    pub attr_changes: Vec<AttrChange>,
    pub task_data_changes: Vec<TaskDataChange>,
    pub link_data_changes: Vec<LinkDataChange>,
    pub queue_changes: Vec<WorkItemQueueChange>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Type;
    use serde_json::json;

    #[test]
    fn tracker_starts_empty_and_accumulates() {
        let mut tracker = InstanceChangeTracker::new();
        assert!(tracker.is_empty());

        tracker.set_status(Status::Active);
        tracker.track_work_item(WorkItemQueueChange {
            change_type: ChangeType::Add,
            id: 1,
            task_id: 2,
            exec_type: ExecType::Eval,
            eval_code: 0,
        });
        assert!(!tracker.is_empty());
        assert_eq!(tracker.queue_changes().len(), 1);
    }

    #[test]
    fn reset_begins_a_new_batch() {
        let mut tracker = InstanceChangeTracker::new();
        tracker.track_attr(
            ChangeType::Add,
            Attribute::raw("x", Type::Integer, json!(1)),
        );
        tracker.reset_changes();
        assert!(tracker.is_empty());
    }

    #[test]
    fn batch_serializes_for_the_recorder() {
        let mut tracker = InstanceChangeTracker::new();
        tracker.set_status(Status::Completed);
        tracker.track_task_data(TaskDataChange {
            change_type: ChangeType::Delete,
            env_id: EnvId::Root,
            id: 3,
            state: 0,
            done: true,
        });

        let batch = tracker.batch("inst-1", 4);
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["instanceId"], "inst-1");
        assert_eq!(json["stepId"], 4);
        assert_eq!(json["status"], "completed");
        assert_eq!(json["taskDataChanges"][0]["changeType"], "delete");
    }
}
