//! The default "simple" model (v0.1)
//!
//! Semantics:
//! - a task is ready when all of its incoming links evaluated to true;
//! - a structured task (one with children) enters all of its children and
//!   completes once none of them remains active;
//! - on completion the outgoing links are evaluated in declared order, the
//!   targets of true links are entered, and a task whose outgoing links all
//!   evaluated to false counts as a leaf.

use std::sync::Arc;

use tracing::debug;

use crate::activity::ActivityError;
use crate::definition::Task;
use crate::instance::{Instance, LinkState, TaskCtx};
use crate::model::{DoneResult, FlowBehavior, FlowModel, TaskBehavior, TaskEntry, SIMPLE_MODEL};

/// Build the simple model bundle
pub fn new_model() -> FlowModel {
    FlowModel::new(
        SIMPLE_MODEL,
        Arc::new(SimpleFlowBehavior),
        Arc::new(SimpleTaskBehavior),
    )
}

pub struct SimpleFlowBehavior;

impl FlowBehavior for SimpleFlowBehavior {
    fn start(&self, inst: &mut Instance) -> (bool, i32) {
        debug!(flow = %inst.flow_name(), "flow starting");
        (true, 0)
    }

    fn tasks_done(&self, inst: &mut Instance, done_code: i32) {
        debug!(flow = %inst.flow_name(), done_code, "flow tasks done");
    }

    fn done(&self, inst: &mut Instance) {
        debug!(flow = %inst.flow_name(), "flow done");
    }
}

pub struct SimpleTaskBehavior;

impl TaskBehavior for SimpleTaskBehavior {
    fn enter(&self, ctx: &mut TaskCtx<'_>, _enter_code: i32) -> (bool, i32) {
        let states = ctx.from_link_states();
        let ready = states.iter().all(|s| *s == LinkState::True);

        debug!(task = %ctx.task().name, ready, "task entered");
        (ready, 0)
    }

    fn eval(&self, ctx: &mut TaskCtx<'_>, _eval_code: i32) -> Result<(bool, i32), ActivityError> {
        if !ctx.task().children.is_empty() {
            // structured task: run the children, complete via child_done
            ctx.enter_children(0);
            return Ok((false, 0));
        }

        if ctx.has_activity() {
            let done = ctx.eval_activity()?;
            if !done {
                // deferred activity: completion happens on a later step
                ctx.schedule_post_eval(0);
            }
            return Ok((done, 0));
        }

        Ok((true, 0))
    }

    fn post_eval(
        &self,
        ctx: &mut TaskCtx<'_>,
        _eval_code: i32,
    ) -> Result<(bool, i32), ActivityError> {
        debug!(task = %ctx.task().name, "post-eval completes deferred task");
        Ok((true, 0))
    }

    fn done(&self, ctx: &mut TaskCtx<'_>, _done_code: i32) -> DoneResult {
        ctx.set_done(true);

        let to_links = ctx.task().to_links.clone();
        let mut entries = Vec::new();

        for link_id in to_links {
            let follow = ctx.eval_link(link_id);
            ctx.set_link_state(
                link_id,
                if follow {
                    LinkState::True
                } else {
                    LinkState::False
                },
            );

            if follow {
                if let Some(target) = ctx.link_target(link_id) {
                    entries.push(TaskEntry {
                        task_id: target,
                        enter_code: 0,
                    });
                }
            }
        }

        // no outgoing link was followed: this task ends its branch
        let notify_parent = entries.is_empty();

        DoneResult {
            notify_parent,
            child_done_code: 0,
            entries,
        }
    }

    fn child_done(
        &self,
        ctx: &mut TaskCtx<'_>,
        child: &Arc<Task>,
        _child_done_code: i32,
    ) -> (bool, i32) {
        let parent_done = !ctx.has_active_children(child.id);
        debug!(
            task = %ctx.task().name,
            child = %child.name,
            parent_done,
            "child done"
        );
        (parent_done, 0)
    }
}
