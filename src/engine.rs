//! Engine assembly (v0.1)
//!
//! Ties the services together according to the configuration: flow provider
//! with embedded flows, state recorder (remote or noop), model and activity
//! registries, and the flow action that runs instances.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::action::{ActionOptions, FlowAction};
use crate::activity::ActivityRegistry;
use crate::config::{EngineConfig, SERVICE_STATE_RECORDER, SETTING_URL};
use crate::model::ModelRegistry;
use crate::provider::{EmbeddedFlowManager, FlowProvider, RemoteFlowProvider};
use crate::recorder::{NoopStateRecorder, RemoteStateRecorder, StateRecorder};

/// The assembled engine
pub struct Engine {
    config: EngineConfig,
    models: Arc<ModelRegistry>,
    activities: Arc<ActivityRegistry>,
    provider: Arc<dyn FlowProvider>,
    recorder: Arc<dyn StateRecorder>,
    action: FlowAction,
}

impl Engine {
    /// Assemble an engine from its configuration and the embedded flows
    /// compiled into the host (keyed by `embedded://` URI, gzip+base64).
    pub fn new(config: EngineConfig, embedded_flows: HashMap<String, String>) -> Self {
        let models = Arc::new(ModelRegistry::with_default());
        let activities = Arc::new(ActivityRegistry::with_builtins());

        let embedded = EmbeddedFlowManager::new(true, embedded_flows);
        let provider: Arc<dyn FlowProvider> = Arc::new(RemoteFlowProvider::new(embedded));

        let recorder: Arc<dyn StateRecorder> = match config
            .service(SERVICE_STATE_RECORDER)
            .filter(|s| s.enabled)
            .and_then(|s| s.setting(SETTING_URL))
        {
            Some(url) => Arc::new(RemoteStateRecorder::new(url)),
            None => Arc::new(NoopStateRecorder),
        };

        let action = FlowAction::new(
            Arc::clone(&provider),
            Arc::clone(&recorder),
            Arc::clone(&models),
            Arc::clone(&activities),
            ActionOptions {
                record: recorder.enabled(),
            },
        );

        Self {
            config,
            models,
            activities,
            provider,
            recorder,
            action,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registry for plugging in activity implementations
    pub fn activities(&self) -> &Arc<ActivityRegistry> {
        &self.activities
    }

    /// Registry for plugging in flow models
    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    pub fn provider(&self) -> &Arc<dyn FlowProvider> {
        &self.provider
    }

    /// The action used to run flows
    pub fn action(&self) -> &FlowAction {
        &self.action
    }

    pub fn start(&self) {
        info!(
            recording = self.recorder.enabled(),
            "engine started"
        );
    }

    pub fn stop(&self) {
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::RunOptions;
    use crate::instance::Status;
    use serde_json::json;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip_base64(data: &str) -> String {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data.as_bytes()).unwrap();
        BASE64.encode(encoder.finish().unwrap())
    }

    #[tokio::test]
    async fn engine_runs_embedded_flow_end_to_end() {
        let flow = json!({
            "name": "hello",
            "model": "simple",
            "rootTask": {
                "id": 1, "type": 1, "name": "root",
                "tasks": [{"id": 2, "type": 1, "activityType": "log", "name": "say"}]
            }
        })
        .to_string();

        let mut flows = HashMap::new();
        flows.insert("embedded://hello".to_string(), gzip_base64(&flow));

        let engine = Engine::new(EngineConfig::default_config(), flows);
        engine.start();

        let result = engine
            .action()
            .run("embedded://hello", RunOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(result.status, Status::Completed);

        engine.stop();
    }
}
