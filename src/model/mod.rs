//! Flow models (v0.1)
//!
//! A model bundles the behaviors that give a flow its execution semantics:
//! one [`FlowBehavior`] and a [`TaskBehavior`] per task type. Models are
//! registered by id; a definition names its model and the executor drives
//! whatever behaviors the model supplies. The [`simple`] model is the
//! default bundle registered by the engine.

pub mod simple;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::activity::ActivityError;
use crate::definition::{Task, TaskId};
use crate::instance::{Instance, TaskCtx};

/// Id of the built-in default model
pub const SIMPLE_MODEL: &str = "simple";

/// A task the model wants entered after another task completed
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEntry {
    pub task_id: TaskId,
    pub enter_code: i32,
}

/// Outcome of a task behavior's `done`
#[derive(Debug, Clone, Default)]
pub struct DoneResult {
    /// The task's completion should be reported to its parent (or, for a
    /// parentless task, to the flow)
    pub notify_parent: bool,
    pub child_done_code: i32,
    /// Tasks to enter next
    pub entries: Vec<TaskEntry>,
}

/// Flow-level semantics of a model
pub trait FlowBehavior: Send + Sync {
    /// Called on instance start; returns whether to schedule the root task
    /// and with which eval code
    fn start(&self, inst: &mut Instance) -> (bool, i32);

    /// Called when the root task (or error-handler root) completed
    fn tasks_done(&self, inst: &mut Instance, done_code: i32);

    /// Called when the flow is done
    fn done(&self, inst: &mut Instance);
}

/// Task-level semantics of a model
pub trait TaskBehavior: Send + Sync {
    /// Decide whether an entered task is ready to be evaluated
    fn enter(&self, ctx: &mut TaskCtx<'_>, enter_code: i32) -> (bool, i32);

    /// Evaluate the task; `(done, done_code)` on success
    fn eval(&self, ctx: &mut TaskCtx<'_>, eval_code: i32) -> Result<(bool, i32), ActivityError>;

    /// Complete a deferred evaluation
    fn post_eval(
        &self,
        ctx: &mut TaskCtx<'_>,
        eval_code: i32,
    ) -> Result<(bool, i32), ActivityError>;

    /// Handle task completion: traverse outgoing links, pick successors
    fn done(&self, ctx: &mut TaskCtx<'_>, done_code: i32) -> DoneResult;

    /// A direct child completed; returns whether the parent itself is done
    fn child_done(
        &self,
        ctx: &mut TaskCtx<'_>,
        child: &Arc<Task>,
        child_done_code: i32,
    ) -> (bool, i32);
}

/// Behavior bundle for one model id
pub struct FlowModel {
    id: String,
    flow_behavior: Arc<dyn FlowBehavior>,
    task_behaviors: HashMap<u32, Arc<dyn TaskBehavior>>,
    default_task_behavior: Arc<dyn TaskBehavior>,
}

impl FlowModel {
    pub fn new(
        id: impl Into<String>,
        flow_behavior: Arc<dyn FlowBehavior>,
        default_task_behavior: Arc<dyn TaskBehavior>,
    ) -> Self {
        Self {
            id: id.into(),
            flow_behavior,
            task_behaviors: HashMap::new(),
            default_task_behavior,
        }
    }

    /// Bind a task behavior to a task type id
    pub fn register_task_behavior(&mut self, type_id: u32, behavior: Arc<dyn TaskBehavior>) {
        self.task_behaviors.insert(type_id, behavior);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn flow_behavior(&self) -> Arc<dyn FlowBehavior> {
        Arc::clone(&self.flow_behavior)
    }

    /// Task behavior for a type id, falling back to the model default
    pub fn task_behavior(&self, type_id: u32) -> Arc<dyn TaskBehavior> {
        self.task_behaviors
            .get(&type_id)
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.default_task_behavior))
    }
}

impl std::fmt::Debug for FlowModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowModel").field("id", &self.id).finish()
    }
}

/// Registry of models keyed by model id
#[derive(Default)]
pub struct ModelRegistry {
    models: DashMap<String, Arc<FlowModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the default simple model
    pub fn with_default() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(simple::new_model()));
        registry
    }

    pub fn register(&self, model: Arc<FlowModel>) {
        self.models.insert(model.id().to_string(), model);
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<FlowModel>> {
        self.models.get(model_id).map(|m| Arc::clone(&m))
    }
}
