//! End-to-end executor tests: sequencing, link conditions, error handling,
//! interceptors/patches, and change tracking across whole flow runs.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use floe::activity::{Activity, ActivityContext, ActivityError, ActivityMetadata, ActivityRegistry};
use floe::definition::{Definition, TaskId};
use floe::instance::{EnvId, Instance, Status};
use floe::model::ModelRegistry;
use floe::scope::Attribute;
use floe::support::{Interceptor, Patch, TaskInterceptor, TaskPatch};
use floe::tracker::ChangeType;
use floe::value::Type;

// ============================================================================
// TEST ACTIVITIES
// ============================================================================

/// Emits a fixed integer as output `x`
struct EmitActivity {
    metadata: ActivityMetadata,
    value: i64,
}

impl EmitActivity {
    fn new(value: i64) -> Self {
        Self {
            metadata: ActivityMetadata::from_json(
                r#"{"id": "emit", "outputs": [{"name": "x", "type": "integer"}]}"#,
            )
            .unwrap(),
            value,
        }
    }
}

impl Activity for EmitActivity {
    fn metadata(&self) -> &ActivityMetadata {
        &self.metadata
    }

    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        ctx.set_output("x", json!(self.value))?;
        Ok(true)
    }
}

/// Records the `value` input it receives on each invocation
#[derive(Clone)]
struct ProbeActivity {
    metadata: Arc<ActivityMetadata>,
    seen: Arc<Mutex<Vec<Option<Value>>>>,
}

impl ProbeActivity {
    fn new() -> Self {
        Self {
            metadata: Arc::new(
                ActivityMetadata::from_json(
                    r#"{"id": "probe", "inputs": [{"name": "value", "type": "any"}]}"#,
                )
                .unwrap(),
            ),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn seen(&self) -> Vec<Option<Value>> {
        self.seen.lock().unwrap().clone()
    }
}

impl Activity for ProbeActivity {
    fn metadata(&self) -> &ActivityMetadata {
        &self.metadata
    }

    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        self.seen.lock().unwrap().push(ctx.get_input("value"));
        Ok(true)
    }
}

/// Fails with a structured activity error
struct BoomActivity {
    metadata: ActivityMetadata,
}

impl BoomActivity {
    fn new() -> Self {
        Self {
            metadata: ActivityMetadata::from_json(r#"{"id": "boom", "inputs": []}"#).unwrap(),
        }
    }
}

impl Activity for BoomActivity {
    fn metadata(&self) -> &ActivityMetadata {
        &self.metadata
    }

    fn eval(&self, _ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        Err(ActivityError::with_data("boom", json!({"cause": "test"})))
    }
}

/// Panics instead of returning; exercises the executor's fault barrier
struct PanicActivity {
    metadata: ActivityMetadata,
}

impl PanicActivity {
    fn new() -> Self {
        Self {
            metadata: ActivityMetadata::from_json(r#"{"id": "panic", "inputs": []}"#).unwrap(),
        }
    }
}

impl Activity for PanicActivity {
    fn metadata(&self) -> &ActivityMetadata {
        &self.metadata
    }

    fn eval(&self, _ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        panic!("implementation bug");
    }
}

/// Defers completion: `eval` returns not-done, the follow-up post-eval
/// finishes the task
struct DeferActivity {
    metadata: ActivityMetadata,
}

impl DeferActivity {
    fn new() -> Self {
        Self {
            metadata: ActivityMetadata::from_json(
                r#"{"id": "defer", "outputs": [{"name": "x", "type": "integer"}]}"#,
            )
            .unwrap(),
        }
    }
}

impl Activity for DeferActivity {
    fn metadata(&self) -> &ActivityMetadata {
        &self.metadata
    }

    fn eval(&self, ctx: &mut dyn ActivityContext) -> Result<bool, ActivityError> {
        ctx.set_output("x", json!(7))?;
        Ok(false)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn registry_with(probe: &ProbeActivity) -> Arc<ActivityRegistry> {
    let registry = ActivityRegistry::with_builtins();
    registry.register(Arc::new(EmitActivity::new(5)));
    registry.register(Arc::new(probe.clone()));
    registry.register(Arc::new(BoomActivity::new()));
    registry.register(Arc::new(PanicActivity::new()));
    registry.register(Arc::new(DeferActivity::new()));
    Arc::new(registry)
}

fn instance_for(flow_json: Value, activities: Arc<ActivityRegistry>) -> Instance {
    let def = Definition::from_json(flow_json.to_string().as_bytes()).unwrap();
    let models = ModelRegistry::with_default();
    let model = models.get(def.model_id()).unwrap();
    Instance::new("inst-1", "embedded://test", def, model, activities)
}

fn run_to_end(inst: &mut Instance) -> RunTrace {
    let mut trace = RunTrace::default();
    trace.absorb(inst);

    let mut steps = 0;
    while inst.do_step() {
        trace.absorb(inst);
        steps += 1;
        assert!(steps < 50, "flow did not converge");
    }
    trace
}

/// Work-queue history accumulated from the per-step change batches
#[derive(Default)]
struct RunTrace {
    scheduled: Vec<TaskId>,
    executed: Vec<TaskId>,
}

impl RunTrace {
    fn absorb(&mut self, inst: &Instance) {
        for change in inst.changes().queue_changes() {
            match change.change_type {
                ChangeType::Add => self.scheduled.push(change.task_id),
                ChangeType::Delete => self.executed.push(change.task_id),
                ChangeType::Update => {}
            }
        }
    }
}

fn two_task_flow(link: Value) -> Value {
    json!({
        "name": "pair",
        "model": "simple",
        "attributes": [
            {"name": "flag", "type": "boolean", "value": false}
        ],
        "rootTask": {
            "id": 1, "type": 1, "name": "root",
            "tasks": [
                {"id": 2, "type": 1, "activityType": "emit", "name": "A"},
                {"id": 3, "type": 1, "activityType": "probe", "name": "B",
                 "inputMappings": [{"type": 1, "value": "{A2.x}", "mapTo": "value"}]}
            ],
            "links": [link]
        }
    })
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn two_task_sequence_passes_output_downstream() {
    let probe = ProbeActivity::new();
    let flow = two_task_flow(json!({"id": 1, "from": 2, "to": 3, "type": 0}));
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[]);
    let trace = run_to_end(&mut inst);

    assert_eq!(inst.status(), Status::Completed);

    // B saw A's output through {A2.x}
    assert_eq!(probe.seen(), vec![Some(json!(5))]);
    assert_eq!(inst.get_attr("{A2.x}").unwrap().value, json!(5));

    // work items executed strictly in enqueue order: root, A, B
    assert_eq!(trace.executed, vec![1, 2, 3]);
    assert_eq!(trace.scheduled, trace.executed);
}

#[test]
fn false_expression_link_skips_the_target() {
    let probe = ProbeActivity::new();
    let flow = two_task_flow(json!({
        "id": 1, "from": 2, "to": 3, "type": 1, "value": "$flag == true"
    }));
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[Attribute::new("flag", Type::Boolean, json!(false)).unwrap()]);
    let trace = run_to_end(&mut inst);

    assert_eq!(inst.status(), Status::Completed);
    assert!(probe.seen().is_empty(), "B must never run");
    assert!(!trace.scheduled.contains(&3), "B must never be scheduled");
}

#[test]
fn true_expression_link_follows_the_target() {
    let probe = ProbeActivity::new();
    let flow = two_task_flow(json!({
        "id": 1, "from": 2, "to": 3, "type": 1, "value": "$flag == true"
    }));
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[Attribute::new("flag", Type::Boolean, json!(true)).unwrap()]);
    run_to_end(&mut inst);

    assert_eq!(inst.status(), Status::Completed);
    assert_eq!(probe.seen().len(), 1);
}

#[test]
fn activity_error_with_handler_runs_the_handler() {
    let probe = ProbeActivity::new();
    let flow = json!({
        "name": "guarded",
        "model": "simple",
        "rootTask": {
            "id": 1, "type": 1, "name": "root",
            "tasks": [
                {"id": 2, "type": 1, "activityType": "boom", "name": "A"}
            ]
        },
        "errorHandlerTask": {
            "id": 10, "type": 1, "activityType": "probe", "name": "H",
            "inputMappings": [{"type": 1, "value": "{E.message}", "mapTo": "value"}]
        }
    });
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[]);

    // step until the failure lands
    while inst.get_attr("{E.message}").is_none() {
        assert!(inst.do_step(), "failure never surfaced");
    }

    assert_eq!(inst.get_attr("{E.activity}").unwrap().value, json!("A"));
    assert_eq!(inst.get_attr("{E.message}").unwrap().value, json!("boom"));
    assert_eq!(
        inst.get_attr("{E.data}").unwrap().value,
        json!({"cause": "test"})
    );

    // the handler work item is queued in the error-handler env
    assert!(inst
        .work_items()
        .any(|wi| wi.env_id == EnvId::ErrorHandler && wi.task_id == 10));

    while inst.do_step() {}

    assert_eq!(inst.status(), Status::Completed);
    assert_eq!(probe.seen(), vec![Some(json!("boom"))]);
}

#[test]
fn activity_error_without_handler_fails_the_instance() {
    let probe = ProbeActivity::new();
    let flow = json!({
        "name": "unguarded",
        "model": "simple",
        "rootTask": {
            "id": 1, "type": 1, "name": "root",
            "tasks": [{"id": 2, "type": 1, "activityType": "boom", "name": "A"}]
        }
    });
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[]);
    while inst.do_step() {}

    assert_eq!(inst.status(), Status::Failed);
    assert_eq!(inst.get_attr("{E.activity}").unwrap().value, json!("A"));
    assert_eq!(inst.get_attr("{E.message}").unwrap().value, json!("boom"));
}

#[test]
fn panic_is_contained_and_routed_like_an_error() {
    let probe = ProbeActivity::new();
    let flow = json!({
        "name": "panicky",
        "model": "simple",
        "rootTask": {
            "id": 1, "type": 1, "name": "root",
            "tasks": [{"id": 2, "type": 1, "activityType": "panic", "name": "A"}]
        }
    });
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[]);
    while inst.do_step() {}

    assert_eq!(inst.status(), Status::Failed);
    let message = inst.get_attr("{E.message}").unwrap().value;
    assert!(message.as_str().unwrap().contains("implementation bug"));
}

#[test]
fn panic_inside_error_handler_fails_without_rescheduling() {
    let probe = ProbeActivity::new();
    let flow = json!({
        "name": "double-fault",
        "model": "simple",
        "rootTask": {
            "id": 1, "type": 1, "name": "root",
            "tasks": [{"id": 2, "type": 1, "activityType": "boom", "name": "A"}]
        },
        "errorHandlerTask": {
            "id": 10, "type": 1, "activityType": "panic", "name": "H"
        }
    });
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[]);
    while inst.do_step() {}

    assert_eq!(inst.status(), Status::Failed);
    // no second handler run was scheduled
    assert!(inst.work_items().all(|wi| wi.env_id != EnvId::ErrorHandler));
}

#[test]
fn release_invariant_holds_after_completion() {
    let probe = ProbeActivity::new();
    let flow = two_task_flow(json!({"id": 1, "from": 2, "to": 3, "type": 0}));
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[]);
    run_to_end(&mut inst);

    let env = inst.task_env(EnvId::Root).unwrap();
    for task_id in [1, 2, 3] {
        assert!(env.task_data(task_id).is_none(), "task {task_id} not released");
    }
    assert!(env.link_data(1).is_none(), "link data not released");
}

#[test]
fn change_batches_cover_queue_and_attribute_mutations() {
    let probe = ProbeActivity::new();
    let flow = two_task_flow(json!({"id": 1, "from": 2, "to": 3, "type": 0}));
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[]);
    // the start batch carries the root work item and the status change
    assert!(!inst.changes().is_empty());

    // step 1: root evaluation enters A (and B), schedules A
    assert!(inst.do_step());
    let adds: Vec<_> = inst
        .changes()
        .queue_changes()
        .iter()
        .filter(|c| c.change_type == ChangeType::Add)
        .collect();
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].task_id, 2);
    assert!(!inst.changes().task_data_changes().is_empty());

    // step 2: A runs, emits {A2.x}, schedules B, is released
    assert!(inst.do_step());
    let batch = inst.changes().batch(inst.id(), inst.step_id());
    assert!(batch
        .attr_changes
        .iter()
        .any(|c| c.attribute.name == "{A2.x}"));
    assert!(batch
        .queue_changes
        .iter()
        .any(|c| c.change_type == ChangeType::Add && c.task_id == 3));
    assert!(batch
        .task_data_changes
        .iter()
        .any(|c| c.change_type == ChangeType::Delete && c.id == 2));
}

#[test]
fn interceptor_replaces_inputs_and_skips_eval() {
    let probe = ProbeActivity::new();
    let flow = json!({
        "name": "intercepted",
        "model": "simple",
        "rootTask": {
            "id": 1, "type": 1, "name": "root",
            "tasks": [
                {"id": 2, "type": 1, "activityType": "probe", "name": "A"},
                {"id": 3, "type": 1, "activityType": "probe", "name": "B",
                 "inputMappings": [{"type": 1, "value": "{A2.x}", "mapTo": "value"}]}
            ],
            "links": [{"id": 1, "from": 2, "to": 3, "type": 0}]
        }
    });
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.set_interceptor(Interceptor::new(vec![
        TaskInterceptor {
            id: 2,
            skip: true,
            inputs: vec![],
            outputs: vec![],
        },
        TaskInterceptor {
            id: 3,
            skip: false,
            inputs: vec![Attribute::new("value", Type::Any, json!("injected")).unwrap()],
            outputs: vec![],
        },
    ]));

    inst.start(&[]);
    run_to_end(&mut inst);

    assert_eq!(inst.status(), Status::Completed);
    // A was skipped entirely, B ran with the injected input
    assert_eq!(probe.seen(), vec![Some(json!("injected"))]);
}

#[test]
fn patch_overrides_output_mapping() {
    let probe = ProbeActivity::new();
    let flow = two_task_flow(json!({"id": 1, "from": 2, "to": 3, "type": 0}));
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.set_patch(Patch::new(vec![TaskPatch {
        id: 2,
        attributes: vec![Attribute::new("{A2.x}", Type::Integer, json!(99)).unwrap()],
    }]));

    inst.start(&[]);
    run_to_end(&mut inst);

    assert_eq!(inst.status(), Status::Completed);
    assert_eq!(probe.seen(), vec![Some(json!(99))]);
}

#[test]
fn output_mapper_writes_into_array_element() {
    let probe = ProbeActivity::new();
    let flow = json!({
        "name": "array-write",
        "model": "simple",
        "attributes": [
            {"name": "results", "type": "array", "value": ["a", "b", "c"]}
        ],
        "rootTask": {
            "id": 1, "type": 1, "name": "root",
            "tasks": [
                {"id": 2, "type": 1, "activityType": "emit", "name": "A",
                 "ouputMappings": [{"type": 1, "value": "x", "mapTo": "results[1]"}]}
            ]
        }
    });
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[]);
    run_to_end(&mut inst);

    assert_eq!(inst.status(), Status::Completed);
    assert_eq!(
        inst.get_attr("results").unwrap().value,
        json!(["a", 5, "c"])
    );
}

#[test]
fn deferred_activity_completes_through_post_eval() {
    let probe = ProbeActivity::new();
    let flow = json!({
        "name": "deferred",
        "model": "simple",
        "rootTask": {
            "id": 1, "type": 1, "name": "root",
            "tasks": [
                {"id": 2, "type": 1, "activityType": "defer", "name": "A"},
                {"id": 3, "type": 1, "activityType": "probe", "name": "B",
                 "inputMappings": [{"type": 1, "value": "{A2.x}", "mapTo": "value"}]}
            ],
            "links": [{"id": 1, "from": 2, "to": 3, "type": 0}]
        }
    });
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[]);

    let mut post_evals = 0;
    loop {
        let stepped = inst.do_step();
        post_evals += inst
            .changes()
            .queue_changes()
            .iter()
            .filter(|c| {
                c.change_type == ChangeType::Add && c.exec_type == floe::instance::ExecType::PostEval
            })
            .count();
        if !stepped {
            break;
        }
    }

    assert_eq!(post_evals, 1, "A must defer exactly once");
    assert_eq!(inst.status(), Status::Completed);
    assert_eq!(probe.seen(), vec![Some(json!(7))]);
}

#[test]
fn explicit_output_mapper_suppresses_default_mapping() {
    let probe = ProbeActivity::new();
    let flow = json!({
        "name": "suppressed",
        "model": "simple",
        "attributes": [
            {"name": "sink", "type": "integer", "value": 0}
        ],
        "rootTask": {
            "id": 1, "type": 1, "name": "root",
            "tasks": [
                {"id": 2, "type": 1, "activityType": "emit", "name": "A",
                 "ouputMappings": [{"type": 1, "value": "x", "mapTo": "sink"}]}
            ]
        }
    });
    let mut inst = instance_for(flow, registry_with(&probe));

    inst.start(&[]);
    run_to_end(&mut inst);

    assert_eq!(inst.get_attr("sink").unwrap().value, json!(5));
    assert!(inst.get_attr("{A2.x}").is_none(), "default mapping must not run");
}
