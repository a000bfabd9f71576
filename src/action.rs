//! Flow action (v0.1)
//!
//! Wraps the engine's services into an invokable unit: resolve the flow,
//! build an instance, drive its step loop to a terminal status, offer each
//! step's change batch to the state recorder, and deliver the reply. The
//! driver yields between steps so a host can interleave instances on the
//! same worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::activity::{ActivityRegistry, ReplyHandler};
use crate::error::EngineError;
use crate::instance::{Instance, Status};
use crate::model::ModelRegistry;
use crate::provider::FlowProvider;
use crate::recorder::StateRecorder;
use crate::scope::Attribute;
use crate::support::{Interceptor, Patch};

/// Engine-level action configuration
#[derive(Debug, Clone, Default)]
pub struct ActionOptions {
    /// Offer change batches to the state recorder
    pub record: bool,
}

/// Per-run inputs and overrides
#[derive(Default)]
pub struct RunOptions {
    /// Start attributes handed to the instance
    pub attrs: Vec<Attribute>,
    /// Output-mapper overrides
    pub patch: Option<Patch>,
    /// Input overrides / skips / output capture
    pub interceptor: Option<Interceptor>,
}

/// Outcome of one flow run
#[derive(Debug)]
pub struct RunResult {
    pub instance_id: String,
    pub status: Status,
    /// The interceptor with captured task outputs, when one was attached
    pub interceptor: Option<Interceptor>,
}

/// Runs flow definitions as invokable actions
pub struct FlowAction {
    provider: Arc<dyn FlowProvider>,
    recorder: Arc<dyn StateRecorder>,
    models: Arc<ModelRegistry>,
    activities: Arc<ActivityRegistry>,
    options: ActionOptions,
    instance_counter: AtomicU64,
}

impl FlowAction {
    pub fn new(
        provider: Arc<dyn FlowProvider>,
        recorder: Arc<dyn StateRecorder>,
        models: Arc<ModelRegistry>,
        activities: Arc<ActivityRegistry>,
        options: ActionOptions,
    ) -> Self {
        Self {
            provider,
            recorder,
            models,
            activities,
            options,
            instance_counter: AtomicU64::new(0),
        }
    }

    /// Resolve the flow behind `uri` and run it to a terminal status.
    ///
    /// With `explicit_reply` flows the reply activity delivers outputs to
    /// `handler` as it fires; otherwise the handler is notified once on the
    /// terminal state.
    pub async fn run(
        &self,
        uri: &str,
        options: RunOptions,
        handler: Option<Arc<dyn ReplyHandler>>,
    ) -> Result<RunResult, EngineError> {
        let flow = self.provider.get_flow(uri).await?;
        let model = self
            .models
            .get(flow.model_id())
            .ok_or_else(|| EngineError::ModelNotFound(flow.model_id().to_string()))?;

        let seq = self.instance_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let instance_id = format!("{}-{}", flow.name(), seq);
        info!(instance = %instance_id, uri, "starting flow instance");

        let mut instance = Instance::new(
            instance_id,
            uri,
            flow,
            model,
            Arc::clone(&self.activities),
        );

        if let Some(patch) = options.patch {
            instance.set_patch(patch);
        }
        if let Some(interceptor) = options.interceptor {
            instance.set_interceptor(interceptor);
        }
        if let Some(handler) = &handler {
            instance.set_reply_handler(Arc::clone(handler));
        }

        instance.start(&options.attrs);
        self.record_step(&instance).await;

        while instance.status() == Status::Active {
            let has_next = instance.do_step();
            self.record_step(&instance).await;

            if !has_next {
                break;
            }
            // the natural yield point for hosts time-slicing instances
            tokio::task::yield_now().await;
        }

        let status = instance.status();
        debug!(instance = %instance.id(), ?status, "flow instance finished");

        if !instance.flow().explicit_reply() {
            if let Some(handler) = &handler {
                let code = if status == Status::Completed { 0 } else { -1 };
                handler.reply(code, json!({ "status": status }));
            }
        }

        Ok(RunResult {
            instance_id: instance.id().to_string(),
            status,
            interceptor: instance.interceptor().cloned(),
        })
    }

    async fn record_step(&self, instance: &Instance) {
        if !self.options.record {
            return;
        }
        let changes = instance.changes();
        if changes.is_empty() {
            return;
        }
        let batch = changes.batch(instance.id(), instance.step_id());
        self.recorder.record(&batch).await;
    }
}
