//! State recording (v0.1)
//!
//! After each step the executor offers the step's change batch to a
//! [`StateRecorder`]. Recording is best-effort: failures are logged and
//! never fail execution.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::tracker::ChangeBatch;

/// Receives per-step change batches
#[async_trait]
pub trait StateRecorder: Send + Sync {
    fn enabled(&self) -> bool;

    /// Record one step's changes. Best-effort; implementations log their
    /// own failures.
    async fn record(&self, batch: &ChangeBatch);
}

/// Discards every batch
#[derive(Debug, Default)]
pub struct NoopStateRecorder;

#[async_trait]
impl StateRecorder for NoopStateRecorder {
    fn enabled(&self) -> bool {
        false
    }

    async fn record(&self, batch: &ChangeBatch) {
        debug!(
            instance = %batch.instance_id,
            step = batch.step_id,
            "state recording disabled, dropping batch"
        );
    }
}

/// POSTs batches to a remote state service
pub struct RemoteStateRecorder {
    client: reqwest::Client,
    url: String,
}

impl RemoteStateRecorder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl StateRecorder for RemoteStateRecorder {
    fn enabled(&self) -> bool {
        true
    }

    async fn record(&self, batch: &ChangeBatch) {
        debug!(
            instance = %batch.instance_id,
            step = batch.step_id,
            "recording step changes"
        );

        let result = self.client.post(&self.url).json(batch).send().await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    status = response.status().as_u16(),
                    "state recorder rejected batch"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "state recorder unreachable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::InstanceChangeTracker;

    #[tokio::test]
    async fn noop_recorder_is_disabled_and_silent() {
        let recorder = NoopStateRecorder;
        assert!(!recorder.enabled());

        let batch = InstanceChangeTracker::new().batch("inst-1", 1);
        recorder.record(&batch).await;
    }

    #[tokio::test]
    async fn remote_recorder_swallows_network_errors() {
        // nothing listens here; record must not fail
        let recorder = RemoteStateRecorder::new("http://127.0.0.1:1/state");
        assert!(recorder.enabled());

        let batch = InstanceChangeTracker::new().batch("inst-1", 1);
        recorder.record(&batch).await;
    }
}
