//! Flow instance execution (v0.1)
//!
//! An [`Instance`] drives one run of a flow definition: a FIFO work-item
//! queue, per-environment task and link data, and a step loop. `do_step` is
//! the single unit of progress; a driver calls it until it returns false or
//! the status is terminal. Work-item execution runs inside a panic barrier
//! so nothing escapes a step; faults become activity errors routed through
//! the error-handler path.
//!
//! The error handler runs in its own task environment, isolated from the
//! main subgraph's task and link data.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::activity::{ActivityContext, ActivityError, ActivityMetadata, ActivityRegistry, ReplyHandler};
use crate::definition::{Definition, LinkId, Task, TaskId};
use crate::mapper::MappingError;
use crate::model::{FlowModel, TaskBehavior};
use crate::scope::{Attribute, FixedScope, Scope, ScopeError};
use crate::support::{Interceptor, Patch};
use crate::tracker::{
    ChangeType, InstanceChangeTracker, LinkDataChange, TaskDataChange, WorkItemQueueChange,
};
use crate::value::Type;

/// Lifecycle status of a flow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    NotStarted,
    Active,
    Completed,
    Cancelled,
    Failed,
}

/// Identifies a task environment within an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvId {
    /// The error-handler subgraph's environment
    ErrorHandler,
    /// The main subgraph's environment
    Root,
}

/// Evaluation state of a traversed link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    #[default]
    Unknown,
    False,
    True,
}

/// Kind of work a queued item performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecType {
    Eval,
    PostEval,
}

/// A scheduled unit of task execution
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: u32,
    pub env_id: EnvId,
    pub task_id: TaskId,
    pub exec_type: ExecType,
    pub eval_code: i32,
}

/// Live state of one task within an environment. Created lazily on first
/// visit, released when the task completes.
#[derive(Debug)]
pub struct TaskData {
    task: Arc<Task>,
    state: i32,
    done: bool,
    in_scope: Option<FixedScope>,
    out_scope: Option<FixedScope>,
}

impl TaskData {
    fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            state: 0,
            done: false,
            in_scope: None,
            out_scope: None,
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn state(&self) -> i32 {
        self.state
    }

    pub fn done(&self) -> bool {
        self.done
    }

    fn scopes_mut(&mut self) -> (&FixedScope, &mut FixedScope) {
        let TaskData {
            in_scope,
            out_scope,
            ..
        } = self;
        (
            in_scope.get_or_insert_with(FixedScope::default),
            out_scope.get_or_insert_with(FixedScope::default),
        )
    }
}

/// Live state of one traversed link
#[derive(Debug)]
pub struct LinkData {
    link_id: LinkId,
    state: LinkState,
}

impl LinkData {
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }
}

/// Container of the live task/link data of one subgraph
#[derive(Debug)]
pub struct TaskEnv {
    id: EnvId,
    root_task_id: TaskId,
    task_datas: HashMap<TaskId, TaskData>,
    link_datas: HashMap<LinkId, LinkData>,
}

impl TaskEnv {
    fn new(id: EnvId, root_task_id: TaskId) -> Self {
        Self {
            id,
            root_task_id,
            task_datas: HashMap::new(),
            link_datas: HashMap::new(),
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn root_task_id(&self) -> TaskId {
        self.root_task_id
    }

    pub fn task_data(&self, task_id: TaskId) -> Option<&TaskData> {
        self.task_datas.get(&task_id)
    }

    pub fn link_data(&self, link_id: LinkId) -> Option<&LinkData> {
        self.link_datas.get(&link_id)
    }

    fn find_or_create_task_data(
        &mut self,
        task: &Arc<Task>,
        tracker: &mut InstanceChangeTracker,
    ) -> &mut TaskData {
        let env_id = self.id;
        self.task_datas.entry(task.id).or_insert_with(|| {
            tracker.track_task_data(TaskDataChange {
                change_type: ChangeType::Add,
                env_id,
                id: task.id,
                state: 0,
                done: false,
            });
            TaskData::new(Arc::clone(task))
        })
    }

    fn find_or_create_link_data(
        &mut self,
        link_id: LinkId,
        tracker: &mut InstanceChangeTracker,
    ) -> &mut LinkData {
        let env_id = self.id;
        self.link_datas.entry(link_id).or_insert_with(|| {
            tracker.track_link_data(LinkDataChange {
                change_type: ChangeType::Add,
                env_id,
                id: link_id,
                state: LinkState::Unknown,
            });
            LinkData {
                link_id,
                state: LinkState::Unknown,
            }
        })
    }

    /// Drop the completed task's data, its direct children's, and the data
    /// of its incoming links.
    fn release_task(&mut self, task: &Arc<Task>, tracker: &mut InstanceChangeTracker) {
        let env_id = self.id;

        let mut removed = vec![task.id];
        removed.extend(task.children.iter().copied());

        for task_id in removed {
            if let Some(td) = self.task_datas.remove(&task_id) {
                tracker.track_task_data(TaskDataChange {
                    change_type: ChangeType::Delete,
                    env_id,
                    id: task_id,
                    state: td.state,
                    done: td.done,
                });
            }
        }

        for link_id in &task.from_links {
            if let Some(ld) = self.link_datas.remove(link_id) {
                tracker.track_link_data(LinkDataChange {
                    change_type: ChangeType::Delete,
                    env_id,
                    id: *link_id,
                    state: ld.state,
                });
            }
        }
    }
}

/// One run of a flow definition
pub struct Instance {
    id: String,
    step_id: u32,
    status: Status,
    state: i32,
    flow_uri: String,
    flow: Arc<Definition>,
    model: Arc<FlowModel>,
    activities: Arc<ActivityRegistry>,
    root_env: TaskEnv,
    eh_env: Option<TaskEnv>,
    attrs: HashMap<String, Attribute>,
    patch: Option<Patch>,
    interceptor: Option<Interceptor>,
    queue: VecDeque<WorkItem>,
    wi_counter: u32,
    tracker: InstanceChangeTracker,
    reply_handler: Option<Arc<dyn ReplyHandler>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("flow", &self.flow.name())
            .field("status", &self.status)
            .field("step_id", &self.step_id)
            .finish()
    }
}

impl Instance {
    pub fn new(
        id: impl Into<String>,
        flow_uri: impl Into<String>,
        flow: Arc<Definition>,
        model: Arc<FlowModel>,
        activities: Arc<ActivityRegistry>,
    ) -> Self {
        let root_env = TaskEnv::new(EnvId::Root, flow.root_task_id());
        Self {
            id: id.into(),
            step_id: 0,
            status: Status::NotStarted,
            state: 0,
            flow_uri: flow_uri.into(),
            flow,
            model,
            activities,
            root_env,
            eh_env: None,
            attrs: HashMap::new(),
            patch: None,
            interceptor: None,
            queue: VecDeque::new(),
            wi_counter: 0,
            tracker: InstanceChangeTracker::new(),
            reply_handler: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn flow_uri(&self) -> &str {
        &self.flow_uri
    }

    pub fn flow_name(&self) -> &str {
        self.flow.name()
    }

    pub fn flow(&self) -> &Arc<Definition> {
        &self.flow
    }

    pub fn step_id(&self) -> u32 {
        self.step_id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn state(&self) -> i32 {
        self.state
    }

    pub fn set_state(&mut self, state: i32) {
        self.state = state;
        self.tracker.set_state(state);
    }

    pub fn set_patch(&mut self, patch: Patch) {
        self.patch = Some(patch);
    }

    pub fn set_interceptor(&mut self, interceptor: Interceptor) {
        self.interceptor = Some(interceptor);
    }

    /// The attached interceptor, with any captured outputs
    pub fn interceptor(&self) -> Option<&Interceptor> {
        self.interceptor.as_ref()
    }

    pub fn set_reply_handler(&mut self, handler: Arc<dyn ReplyHandler>) {
        self.reply_handler = Some(handler);
    }

    pub fn task_env(&self, env_id: EnvId) -> Option<&TaskEnv> {
        match env_id {
            EnvId::Root => Some(&self.root_env),
            EnvId::ErrorHandler => self.eh_env.as_ref(),
        }
    }

    pub fn work_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.queue.iter()
    }

    /// The change tracker holding the current step's batch
    pub fn changes(&self) -> &InstanceChangeTracker {
        &self.tracker
    }

    pub fn reset_changes(&mut self) {
        self.tracker.reset_changes();
    }

    // ------------------------------------------------------------------
    // attribute scope
    // ------------------------------------------------------------------

    /// Instance attributes overlay the flow's declared attributes
    pub fn get_attr(&self, name: &str) -> Option<Attribute> {
        self.attrs
            .get(name)
            .or_else(|| self.flow.get_attr(name))
            .cloned()
    }

    /// Set the value of an existing attribute (instance or flow-declared)
    pub fn set_attr_value(&mut self, name: &str, value: Value) -> Result<(), ScopeError> {
        let attr = self
            .get_attr(name)
            .ok_or_else(|| ScopeError::UndefinedAttr(name.to_string()))?;

        let updated = Attribute::raw(name, attr.value_type, value);
        self.attrs.insert(name.to_string(), updated.clone());
        self.tracker.track_attr(ChangeType::Update, updated);
        Ok(())
    }

    /// Add an attribute to the instance, overwriting an existing value
    pub fn add_attr(&mut self, name: &str, value_type: Type, value: Value) {
        let attr = Attribute::raw(name, value_type, value);
        let change = if self.get_attr(name).is_some() {
            ChangeType::Update
        } else {
            ChangeType::Add
        };
        debug!(attr = name, "adding instance attribute");
        self.attrs.insert(name.to_string(), attr.clone());
        self.tracker.track_attr(change, attr);
    }

    /// Adopt the given attributes as instance attributes
    pub fn update_attrs(&mut self, attrs: &[Attribute]) {
        for attr in attrs {
            self.add_attr(&attr.name, attr.value_type, attr.value.clone());
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Start the instance: apply input mappings, ask the model to begin, and
    /// schedule the root task. Returns whether the model agreed to start.
    pub fn start(&mut self, start_attrs: &[Attribute]) -> bool {
        self.set_status(Status::Active);
        self.apply_instance_input_mappings(start_attrs);

        let flow_behavior = self.model.flow_behavior();
        let (ok, eval_code) = flow_behavior.start(self);

        if ok {
            if let Some(root) = self.flow.task(self.flow.root_task_id()).cloned() {
                self.find_or_create_task_data(EnvId::Root, &root);
                self.schedule_eval(EnvId::Root, root.id, eval_code);
            }
        }
        ok
    }

    /// Request cancellation; takes effect before the next work item pops
    pub fn cancel(&mut self) {
        if self.status == Status::Active {
            self.set_status(Status::Cancelled);
        }
    }

    /// Perform a single execution step. Returns false when there is nothing
    /// (more) to do: status not active or queue empty.
    pub fn do_step(&mut self) -> bool {
        self.reset_changes();
        self.step_id += 1;

        if self.status != Status::Active {
            return false;
        }

        let Some(item) = self.queue.pop_front() else {
            debug!("work queue empty");
            return false;
        };

        debug!(item = item.id, task = item.task_id, "popped work item");
        self.tracker.track_work_item(WorkItemQueueChange {
            change_type: ChangeType::Delete,
            id: item.id,
            task_id: item.task_id,
            exec_type: item.exec_type,
            eval_code: item.eval_code,
        });

        self.exec_task(item);
        true
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
        self.tracker.set_status(status);
    }

    // ------------------------------------------------------------------
    // work-item execution
    // ------------------------------------------------------------------

    /// Execute a work item inside the panic barrier. Panics and error
    /// results both route into `handle_error`; nothing escapes a step.
    fn exec_task(&mut self, item: WorkItem) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.exec_task_inner(&item)));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.handle_error(item.env_id, item.task_id, err),
            Err(payload) => {
                let task_name = self
                    .flow
                    .task(item.task_id)
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| item.task_id.to_string());
                let message = format!(
                    "unhandled error executing task '{}': {}",
                    task_name,
                    panic_message(payload)
                );
                error!("{message}");
                self.handle_error(item.env_id, item.task_id, ActivityError::new(message));
            }
        }
    }

    fn exec_task_inner(&mut self, item: &WorkItem) -> Result<(), ActivityError> {
        let Some(task) = self.item_task(item.env_id, item.task_id) else {
            // the owning task was released; the item is stale
            debug!(task = item.task_id, "work item references released task, skipping");
            return Ok(());
        };

        let behavior = self.model.task_behavior(task.type_id);

        let (done, done_code) = match item.exec_type {
            ExecType::Eval => {
                let mut eval = true;

                if task.has_attrs() {
                    self.apply_input_mapper(item.env_id, &task)?;
                    eval = self.apply_input_interceptor(item.env_id, &task);
                }

                if eval {
                    let mut ctx = TaskCtx::new(self, item.env_id, Arc::clone(&task));
                    behavior.eval(&mut ctx, item.eval_code)?
                } else {
                    (true, 0)
                }
            }
            ExecType::PostEval => {
                let mut ctx = TaskCtx::new(self, item.env_id, Arc::clone(&task));
                behavior.post_eval(&mut ctx, item.eval_code)?
            }
        };

        if done {
            if task.has_attrs() {
                self.apply_output_interceptor(item.env_id, &task);

                let applied = self.apply_output_mapper(item.env_id, &task)?;
                if !applied && !task.is_scope() {
                    debug!(task = %task.name, "applying default output mapping");
                    self.apply_default_output_mappings(item.env_id, &task);
                }
            }
            self.handle_task_done(&behavior, item.env_id, &task, done_code);
        }

        Ok(())
    }

    /// Handle the completion of a task: let the model traverse links, notify
    /// the parent chain or the flow, enter successors, release the task.
    fn handle_task_done(
        &mut self,
        behavior: &Arc<dyn TaskBehavior>,
        env_id: EnvId,
        task: &Arc<Task>,
        done_code: i32,
    ) {
        let result = {
            let mut ctx = TaskCtx::new(self, env_id, Arc::clone(task));
            behavior.done(&mut ctx, done_code)
        };

        if result.notify_parent {
            match task.parent {
                Some(parent_id) => {
                    if let Some(parent) = self.flow.task(parent_id).cloned() {
                        let parent_behavior = self.model.task_behavior(parent.type_id);
                        let (parent_done, parent_done_code) = {
                            let mut ctx = TaskCtx::new(self, env_id, Arc::clone(&parent));
                            parent_behavior.child_done(&mut ctx, task, result.child_done_code)
                        };
                        if parent_done {
                            self.handle_task_done(
                                &parent_behavior,
                                env_id,
                                &parent,
                                parent_done_code,
                            );
                        }
                    }
                }
                None => {
                    // the subgraph root completed, so the flow is done
                    let flow_behavior = self.model.flow_behavior();
                    flow_behavior.tasks_done(self, result.child_done_code);
                    flow_behavior.done(self);
                    self.set_status(Status::Completed);
                }
            }
        }

        for entry in result.entries {
            let Some(to_enter) = self.flow.task(entry.task_id).cloned() else {
                continue;
            };
            let enter_behavior = self.model.task_behavior(to_enter.type_id);
            self.find_or_create_task_data(env_id, &to_enter);

            let (eval, eval_code) = {
                let mut ctx = TaskCtx::new(self, env_id, Arc::clone(&to_enter));
                enter_behavior.enter(&mut ctx, entry.enter_code)
            };
            if eval {
                self.schedule_eval(env_id, to_enter.id, eval_code);
            }
        }

        self.release_task(env_id, task);
    }

    /// Route a failure: record the `{E.*}` attributes, then either fail the
    /// instance or hand control to the error-handler environment.
    fn handle_error(&mut self, env_id: EnvId, task_id: TaskId, err: ActivityError) {
        let task_name = self
            .flow
            .task(task_id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| task_id.to_string());

        self.add_attr("{E.activity}", Type::String, Value::String(task_name));
        self.add_attr("{E.message}", Type::String, Value::String(err.message.clone()));
        if let Some(data) = err.data {
            self.add_attr("{E.data}", Type::Object, data);
        }

        if env_id == EnvId::ErrorHandler {
            // a fault inside the error handler stops propagation
            error!(instance = %self.id, error = %err.message, "error handler failed");
            self.set_status(Status::Failed);
            return;
        }

        if let Some(eh_task_id) = self.flow.error_handler_task_id() {
            if let Some(eh_task) = self.flow.task(eh_task_id).cloned() {
                if self.eh_env.is_none() {
                    self.eh_env = Some(TaskEnv::new(EnvId::ErrorHandler, eh_task_id));
                }
                self.find_or_create_task_data(EnvId::ErrorHandler, &eh_task);
                // the existing queue is intentionally left intact
                self.schedule_eval(EnvId::ErrorHandler, eh_task_id, 0);
                return;
            }
        }

        warn!(instance = %self.id, error = %err.message, "no error handler, instance failed");
        self.set_status(Status::Failed);
    }

    // ------------------------------------------------------------------
    // scheduling
    // ------------------------------------------------------------------

    pub(crate) fn schedule_eval(&mut self, env_id: EnvId, task_id: TaskId, eval_code: i32) {
        self.schedule(env_id, task_id, ExecType::Eval, eval_code);
    }

    pub(crate) fn schedule_post_eval(&mut self, env_id: EnvId, task_id: TaskId, eval_code: i32) {
        self.schedule(env_id, task_id, ExecType::PostEval, eval_code);
    }

    fn schedule(&mut self, env_id: EnvId, task_id: TaskId, exec_type: ExecType, eval_code: i32) {
        self.wi_counter += 1;
        let item = WorkItem {
            id: self.wi_counter,
            env_id,
            task_id,
            exec_type,
            eval_code,
        };

        debug!(task = task_id, ?exec_type, "scheduling work item");
        self.tracker.track_work_item(WorkItemQueueChange {
            change_type: ChangeType::Add,
            id: item.id,
            task_id,
            exec_type,
            eval_code,
        });
        self.queue.push_back(item);
    }

    // ------------------------------------------------------------------
    // environments
    // ------------------------------------------------------------------

    fn item_task(&self, env_id: EnvId, task_id: TaskId) -> Option<Arc<Task>> {
        self.task_env(env_id)?
            .task_data(task_id)
            .map(|td| Arc::clone(&td.task))
    }

    fn find_or_create_task_data(&mut self, env_id: EnvId, task: &Arc<Task>) {
        let Instance {
            root_env,
            eh_env,
            tracker,
            ..
        } = self;
        let env = match env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_mut() {
                Some(env) => env,
                None => return,
            },
        };
        env.find_or_create_task_data(task, tracker);
    }

    fn release_task(&mut self, env_id: EnvId, task: &Arc<Task>) {
        let Instance {
            root_env,
            eh_env,
            tracker,
            ..
        } = self;
        let env = match env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_mut() {
                Some(env) => env,
                None => return,
            },
        };
        env.release_task(task, tracker);
    }

    // ------------------------------------------------------------------
    // mapping and interception
    // ------------------------------------------------------------------

    fn apply_instance_input_mappings(&mut self, start_attrs: &[Attribute]) {
        match self.flow.input_mapper().cloned() {
            Some(mapper) => {
                let src = crate::scope::AttrScope::from_attrs(start_attrs);
                let Instance {
                    attrs,
                    flow,
                    tracker,
                    ..
                } = self;
                let mut dst = FlowScopeMut {
                    attrs,
                    flow,
                    tracker,
                };
                if let Err(e) = mapper.apply(&src, &mut dst) {
                    warn!(error = %e, "flow input mapping failed");
                }
            }
            None => self.update_attrs(start_attrs),
        }
    }

    fn activity_metadata(&self, task: &Task) -> Option<ActivityMetadata> {
        if task.activity_type.is_empty() {
            return None;
        }
        self.activities
            .get(&task.activity_type)
            .map(|a| a.metadata().clone())
    }

    fn ensure_scopes(&mut self, env_id: EnvId, task: &Arc<Task>) {
        let metadata = self.activity_metadata(task);

        let Instance {
            root_env, eh_env, ..
        } = self;
        let env = match env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_mut() {
                Some(env) => env,
                None => return,
            },
        };
        let Some(td) = env.task_datas.get_mut(&task.id) else {
            return;
        };

        if td.in_scope.is_none() {
            td.in_scope = Some(match &metadata {
                Some(md) => FixedScope::with_overrides(&md.inputs, &task.attrs),
                None => FixedScope::new(&task.attrs),
            });
        }
        if td.out_scope.is_none() {
            td.out_scope = Some(match &metadata {
                Some(md) => FixedScope::new(&md.outputs),
                None => FixedScope::default(),
            });
        }
    }

    /// Fill the task's input scope: explicit mapper when declared, else the
    /// default copy of same-named flow attributes.
    fn apply_input_mapper(&mut self, env_id: EnvId, task: &Arc<Task>) -> Result<(), ActivityError> {
        self.ensure_scopes(env_id, task);

        let Instance {
            attrs,
            flow,
            root_env,
            eh_env,
            ..
        } = self;
        let env = match env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_mut() {
                Some(env) => env,
                None => return Ok(()),
            },
        };
        let Some(td) = env.task_datas.get_mut(&task.id) else {
            return Ok(());
        };
        let Some(in_scope) = td.in_scope.as_mut() else {
            return Ok(());
        };

        match &task.input_mapper {
            Some(mapper) => {
                let src = FlowScopeRef { attrs, flow };
                match mapper.apply(&src, in_scope) {
                    Ok(()) => Ok(()),
                    Err(MappingError::DestMissing(name))
                    | Err(MappingError::Scope(ScopeError::UndefinedAttr(name))) => {
                        // destination not declared: abort the remaining
                        // mappings, the task still runs
                        warn!(task = %task.name, attr = %name,
                            "input mapping destination not found, aborting mapper");
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            None => {
                let names: Vec<String> = in_scope.attrs().map(|a| a.name.clone()).collect();
                for name in names {
                    let flow_attr = attrs.get(&name).or_else(|| flow.get_attr(&name));
                    if let Some(attr) = flow_attr {
                        let _ = in_scope.set_attr_value(&name, attr.value.clone());
                    }
                }
                Ok(())
            }
        }
    }

    /// Interceptor inputs replace the mapped inputs. Returns whether the
    /// task behavior should still be evaluated.
    fn apply_input_interceptor(&mut self, env_id: EnvId, task: &Arc<Task>) -> bool {
        let Instance {
            interceptor,
            root_env,
            eh_env,
            ..
        } = self;
        let Some(task_interceptor) = interceptor
            .as_ref()
            .and_then(|i| i.get_task_interceptor(task.id))
        else {
            return true;
        };

        let env = match env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_mut() {
                Some(env) => env,
                None => return true,
            },
        };
        if let Some(td) = env.task_datas.get_mut(&task.id) {
            if let Some(in_scope) = td.in_scope.as_mut() {
                for attr in &task_interceptor.inputs {
                    if let Err(e) = in_scope.set_attr_value(&attr.name, attr.value.clone()) {
                        warn!(task = %task.name, error = %e, "interceptor input not settable");
                    }
                }
            }
        }

        !task_interceptor.skip
    }

    /// Capture the task's outputs into the interceptor for assertions
    fn apply_output_interceptor(&mut self, env_id: EnvId, task: &Arc<Task>) {
        let Instance {
            interceptor,
            root_env,
            eh_env,
            ..
        } = self;
        let Some(task_interceptor) = interceptor
            .as_mut()
            .and_then(|i| i.get_task_interceptor_mut(task.id))
        else {
            return;
        };

        let env = match env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_ref() {
                Some(env) => env,
                None => return,
            },
        };
        if let Some(out_scope) = env
            .task_datas
            .get(&task.id)
            .and_then(|td| td.out_scope.as_ref())
        {
            task_interceptor.outputs = out_scope.attrs().cloned().collect();
        }
    }

    /// Apply the explicit output mapper (patch attributes take precedence).
    /// Returns whether any mapper was applied.
    fn apply_output_mapper(
        &mut self,
        env_id: EnvId,
        task: &Arc<Task>,
    ) -> Result<bool, ActivityError> {
        if let Some(task_patch) = self.patch.as_ref().and_then(|p| p.get_patch(task.id)) {
            let patched = task_patch.attributes.clone();
            for attr in patched {
                self.add_attr(&attr.name, attr.value_type, attr.value);
            }
            return Ok(true);
        }

        let Some(mapper) = &task.output_mapper else {
            return Ok(false);
        };

        let Instance {
            attrs,
            flow,
            root_env,
            eh_env,
            tracker,
            ..
        } = self;
        let env = match env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_ref() {
                Some(env) => env,
                None => return Ok(true),
            },
        };
        let Some(out_scope) = env
            .task_datas
            .get(&task.id)
            .and_then(|td| td.out_scope.as_ref())
        else {
            return Ok(true);
        };

        let mut dst = FlowScopeMut {
            attrs,
            flow,
            tracker,
        };
        match mapper.apply(out_scope, &mut dst) {
            Ok(()) => Ok(true),
            Err(MappingError::DestMissing(name))
            | Err(MappingError::Scope(ScopeError::UndefinedAttr(name))) => {
                warn!(task = %task.name, attr = %name,
                    "output mapping destination not found, aborting mapper");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Default output mapping: every declared output `Y` becomes the flow
    /// attribute `{A<task_id>.Y}`.
    fn apply_default_output_mappings(&mut self, env_id: EnvId, task: &Arc<Task>) {
        let outputs: Vec<Attribute> = {
            let Some(env) = self.task_env(env_id) else {
                return;
            };
            let Some(out_scope) = env
                .task_data(task.id)
                .and_then(|td| td.out_scope.as_ref())
            else {
                return;
            };
            out_scope.attrs().cloned().collect()
        };

        for attr in outputs {
            let name = format!("{{A{}.{}}}", task.id, attr.name);
            self.add_attr(&name, attr.value_type, attr.value);
        }
    }
}

impl Scope for Instance {
    fn get_attr(&self, name: &str) -> Option<Attribute> {
        Instance::get_attr(self, name)
    }

    fn set_attr_value(&mut self, name: &str, value: Value) -> Result<(), ScopeError> {
        Instance::set_attr_value(self, name, value)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// TASK CONTEXT
// ============================================================================

/// The view a task behavior operates through: the task, its live data, and
/// the instance operations the model is allowed to perform.
pub struct TaskCtx<'a> {
    inst: &'a mut Instance,
    env_id: EnvId,
    task: Arc<Task>,
}

impl<'a> TaskCtx<'a> {
    pub fn new(inst: &'a mut Instance, env_id: EnvId, task: Arc<Task>) -> Self {
        Self { inst, env_id, task }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn env_id(&self) -> EnvId {
        self.env_id
    }

    pub fn state(&self) -> i32 {
        self.inst
            .task_env(self.env_id)
            .and_then(|env| env.task_data(self.task.id))
            .map(|td| td.state)
            .unwrap_or(0)
    }

    pub fn set_state(&mut self, state: i32) {
        self.update_task_data(|td| td.state = state);
    }

    pub fn set_done(&mut self, done: bool) {
        self.update_task_data(|td| td.done = done);
    }

    fn update_task_data(&mut self, f: impl FnOnce(&mut TaskData)) {
        let Instance {
            root_env,
            eh_env,
            tracker,
            ..
        } = &mut *self.inst;
        let env = match self.env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_mut() {
                Some(env) => env,
                None => return,
            },
        };
        if let Some(td) = env.task_datas.get_mut(&self.task.id) {
            f(td);
            tracker.track_task_data(TaskDataChange {
                change_type: ChangeType::Update,
                env_id: self.env_id,
                id: self.task.id,
                state: td.state,
                done: td.done,
            });
        }
    }

    /// States of the incoming links, creating link data on first traversal
    pub fn from_link_states(&mut self) -> Vec<LinkState> {
        let Instance {
            root_env,
            eh_env,
            tracker,
            ..
        } = &mut *self.inst;
        let env = match self.env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_mut() {
                Some(env) => env,
                None => return Vec::new(),
            },
        };

        self.task
            .from_links
            .iter()
            .map(|link_id| env.find_or_create_link_data(*link_id, tracker).state)
            .collect()
    }

    /// Evaluate a link's condition against the instance scope
    pub fn eval_link(&self, link_id: LinkId) -> bool {
        let Some(link) = self.inst.flow.link(link_id) else {
            return false;
        };
        let scope = FlowScopeRef {
            attrs: &self.inst.attrs,
            flow: &self.inst.flow,
        };
        self.inst
            .flow
            .link_expr_mgr()
            .eval_link_expr(link, &scope)
    }

    pub fn set_link_state(&mut self, link_id: LinkId, state: LinkState) {
        let Instance {
            root_env,
            eh_env,
            tracker,
            ..
        } = &mut *self.inst;
        let env = match self.env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_mut() {
                Some(env) => env,
                None => return,
            },
        };
        let link_data = env.find_or_create_link_data(link_id, tracker);
        link_data.state = state;
        let change = LinkDataChange {
            change_type: ChangeType::Update,
            env_id: self.env_id,
            id: link_id,
            state,
        };
        tracker.track_link_data(change);
    }

    pub fn link_target(&self, link_id: LinkId) -> Option<TaskId> {
        self.inst.flow.link(link_id).map(|l| l.to_task)
    }

    /// Enter every child of this task; children guard themselves through
    /// their incoming link states.
    pub fn enter_children(&mut self, enter_code: i32) {
        let children = self.task.children.clone();
        debug!(task = %self.task.name, count = children.len(), "entering children");

        for child_id in children {
            let Some(child) = self.inst.flow.task(child_id).cloned() else {
                continue;
            };
            let behavior = self.inst.model.task_behavior(child.type_id);
            self.inst.find_or_create_task_data(self.env_id, &child);

            let (eval, eval_code) = {
                let mut ctx = TaskCtx::new(&mut *self.inst, self.env_id, Arc::clone(&child));
                behavior.enter(&mut ctx, enter_code)
            };
            if eval {
                self.inst.schedule_eval(self.env_id, child_id, eval_code);
            }
        }
    }

    /// Whether an activity is registered for this task's activity type
    pub fn has_activity(&self) -> bool {
        !self.task.activity_type.is_empty()
            && self.inst.activities.get(&self.task.activity_type).is_some()
    }

    /// Run the task's activity against its input/output scopes
    pub fn eval_activity(&mut self) -> Result<bool, ActivityError> {
        let Some(activity) = self.inst.activities.get(&self.task.activity_type) else {
            return Ok(true);
        };

        self.inst.ensure_scopes(self.env_id, &self.task);

        let Instance {
            id,
            flow,
            root_env,
            eh_env,
            reply_handler,
            ..
        } = &mut *self.inst;
        let env = match self.env_id {
            EnvId::Root => root_env,
            EnvId::ErrorHandler => match eh_env.as_mut() {
                Some(env) => env,
                None => return Ok(true),
            },
        };
        let Some(td) = env.task_datas.get_mut(&self.task.id) else {
            return Ok(true);
        };

        let (in_scope, out_scope) = td.scopes_mut();
        let mut host = ActivityHost {
            instance_id: id.as_str(),
            flow_name: flow.name(),
            task_name: self.task.name.as_str(),
            in_scope,
            out_scope,
            reply_handler: reply_handler.clone(),
        };

        activity.eval(&mut host)
    }

    /// Whether any sibling child (other than `exclude`) is still active: it
    /// holds task data, is not done, and was not skipped by false links.
    pub fn has_active_children(&self, exclude: TaskId) -> bool {
        let Some(env) = self.inst.task_env(self.env_id) else {
            return false;
        };

        for child_id in &self.task.children {
            if *child_id == exclude {
                continue;
            }
            let Some(td) = env.task_data(*child_id) else {
                continue;
            };
            if td.done {
                continue;
            }

            let from_links = &td.task.from_links;
            let all_evaluated = from_links.iter().all(|lid| {
                matches!(
                    env.link_data(*lid).map(|ld| ld.state),
                    Some(LinkState::True) | Some(LinkState::False)
                )
            });
            let any_false = from_links
                .iter()
                .any(|lid| env.link_data(*lid).map(|ld| ld.state) == Some(LinkState::False));

            let skipped = !from_links.is_empty() && all_evaluated && any_false;
            if !skipped {
                return true;
            }
        }
        false
    }

    /// Defer completion of this task to a later `PostEval` work item
    pub fn schedule_post_eval(&mut self, eval_code: i32) {
        self.inst
            .schedule_post_eval(self.env_id, self.task.id, eval_code);
    }
}

// ============================================================================
// SCOPE VIEWS
// ============================================================================

/// Read-only view of the instance attribute scope
struct FlowScopeRef<'a> {
    attrs: &'a HashMap<String, Attribute>,
    flow: &'a Arc<Definition>,
}

impl Scope for FlowScopeRef<'_> {
    fn get_attr(&self, name: &str) -> Option<Attribute> {
        self.attrs
            .get(name)
            .or_else(|| self.flow.get_attr(name))
            .cloned()
    }

    fn set_attr_value(&mut self, _name: &str, _value: Value) -> Result<(), ScopeError> {
        Err(ScopeError::ReadOnly)
    }
}

/// Mutable view of the instance attribute scope with change tracking
struct FlowScopeMut<'a> {
    attrs: &'a mut HashMap<String, Attribute>,
    flow: &'a Arc<Definition>,
    tracker: &'a mut InstanceChangeTracker,
}

impl Scope for FlowScopeMut<'_> {
    fn get_attr(&self, name: &str) -> Option<Attribute> {
        self.attrs
            .get(name)
            .or_else(|| self.flow.get_attr(name))
            .cloned()
    }

    fn set_attr_value(&mut self, name: &str, value: Value) -> Result<(), ScopeError> {
        let attr = self
            .get_attr(name)
            .ok_or_else(|| ScopeError::UndefinedAttr(name.to_string()))?;

        let updated = Attribute::raw(name, attr.value_type, value);
        self.attrs.insert(name.to_string(), updated.clone());
        self.tracker.track_attr(ChangeType::Update, updated);
        Ok(())
    }
}

/// Execution context handed to an activity
struct ActivityHost<'a> {
    instance_id: &'a str,
    flow_name: &'a str,
    task_name: &'a str,
    in_scope: &'a FixedScope,
    out_scope: &'a mut FixedScope,
    reply_handler: Option<Arc<dyn ReplyHandler>>,
}

impl ActivityContext for ActivityHost<'_> {
    fn flow_instance_id(&self) -> &str {
        self.instance_id
    }

    fn flow_name(&self) -> &str {
        self.flow_name
    }

    fn task_name(&self) -> &str {
        self.task_name
    }

    fn get_input(&self, name: &str) -> Option<Value> {
        self.in_scope.get_attr(name).map(|a| a.value)
    }

    fn set_output(&mut self, name: &str, value: Value) -> Result<(), ScopeError> {
        self.out_scope.set_attr_value(name, value)
    }

    fn reply_handler(&self) -> Option<Arc<dyn ReplyHandler>> {
        self.reply_handler.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityRegistry;
    use crate::definition::Definition;
    use crate::model::ModelRegistry;
    use serde_json::json;

    fn one_task_flow() -> Arc<Definition> {
        Definition::from_json(
            json!({
                "name": "single",
                "model": "simple",
                "rootTask": {
                    "id": 1, "type": 1, "name": "root",
                    "tasks": [
                        {"id": 2, "type": 1, "activityType": "log", "name": "say",
                         "attributes": []}
                    ]
                }
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    fn new_instance(flow: Arc<Definition>) -> Instance {
        let models = ModelRegistry::with_default();
        let model = models.get(flow.model_id()).unwrap();
        Instance::new(
            "inst-1",
            "embedded://test",
            flow,
            model,
            Arc::new(ActivityRegistry::with_builtins()),
        )
    }

    #[test]
    fn start_schedules_the_root_task() {
        let mut inst = new_instance(one_task_flow());
        assert_eq!(inst.status(), Status::NotStarted);

        assert!(inst.start(&[]));
        assert_eq!(inst.status(), Status::Active);

        let items: Vec<_> = inst.work_items().collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].task_id, 1);
        assert_eq!(items[0].exec_type, ExecType::Eval);
    }

    #[test]
    fn steps_run_to_completion() {
        let mut inst = new_instance(one_task_flow());
        inst.start(&[]);

        let mut steps = 0;
        while inst.do_step() {
            steps += 1;
            assert!(steps < 10, "did not converge");
        }
        assert_eq!(inst.status(), Status::Completed);
    }

    #[test]
    fn step_on_non_active_instance_is_a_noop() {
        let mut inst = new_instance(one_task_flow());
        assert!(!inst.do_step());
        assert_eq!(inst.step_id(), 1); // the step id still advances
    }

    #[test]
    fn cancel_stops_the_loop_before_the_next_pop() {
        let mut inst = new_instance(one_task_flow());
        inst.start(&[]);
        inst.cancel();
        assert_eq!(inst.status(), Status::Cancelled);
        assert!(!inst.do_step());
    }

    #[test]
    fn add_attr_overwrites_and_tracks() {
        let mut inst = new_instance(one_task_flow());
        inst.reset_changes();

        inst.add_attr("{E.message}", Type::String, json!("first"));
        inst.add_attr("{E.message}", Type::String, json!("second"));

        assert_eq!(
            inst.get_attr("{E.message}").unwrap().value,
            json!("second")
        );
        let changes = inst.changes().attr_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Add);
        assert_eq!(changes[1].change_type, ChangeType::Update);
    }

    #[test]
    fn release_removes_task_and_incoming_link_data() {
        let mut inst = new_instance(one_task_flow());
        inst.start(&[]);

        while inst.do_step() {}

        let env = inst.task_env(EnvId::Root).unwrap();
        assert!(env.task_data(1).is_none());
        assert!(env.task_data(2).is_none());
    }

    #[test]
    fn duplicate_work_item_is_harmless() {
        let mut inst = new_instance(one_task_flow());
        inst.start(&[]);
        // a second item for the same task: by the time it pops, the task
        // has been released and the item is stale
        inst.schedule_eval(EnvId::Root, 2, 0);

        while inst.do_step() {}
        assert_eq!(inst.status(), Status::Completed);
    }
}
