//! Flow provider (v0.1)
//!
//! Resolves a flow URI to an immutable [`Definition`]:
//!
//! - `embedded://<key>` - payloads registered at startup, gzip-then-base64
//! - `file://<path>` - local flow files
//! - any HTTP(S) URL - remote flows; status >= 300 means not found
//!
//! Definitions are cached; the cache is the one process-wide mutable
//! resource shared across instances, and cached definitions are immutable.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::definition::Definition;

const URI_SCHEME_FILE: &str = "file://";
const URI_SCHEME_EMBEDDED: &str = "embedded://";

/// Flow resolution failure
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("flow not found: {0}")]
    NotFound(String),

    #[error("invalid flow uri '{0}'")]
    InvalidUri(String),

    #[error("failed to decode embedded flow '{uri}': {reason}")]
    Decode { uri: String, reason: String },

    #[error("failed to read flow file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Resolves a flow URI to a definition
#[async_trait]
pub trait FlowProvider: Send + Sync {
    async fn get_flow(&self, uri: &str) -> Result<Arc<Definition>, ProviderError>;
}

/// Holds flows compiled into the host application, keyed by full
/// `embedded://` URI. Payloads are gzip-compressed JSON in base64.
#[derive(Debug, Default)]
pub struct EmbeddedFlowManager {
    compressed: bool,
    flows: HashMap<String, String>,
}

impl EmbeddedFlowManager {
    pub fn new(compressed: bool, flows: HashMap<String, String>) -> Self {
        Self { compressed, flows }
    }

    /// The JSON bytes of an embedded flow
    pub fn get_flow_json(&self, uri: &str) -> Option<Result<Vec<u8>, ProviderError>> {
        let payload = self.flows.get(uri)?;

        if !self.compressed {
            return Some(Ok(payload.clone().into_bytes()));
        }

        let decode = || -> Result<Vec<u8>, String> {
            let compressed = BASE64.decode(payload.trim()).map_err(|e| e.to_string())?;
            let mut decoder = GzDecoder::new(compressed.as_slice());
            let mut json = Vec::new();
            decoder
                .read_to_end(&mut json)
                .map_err(|e| e.to_string())?;
            Ok(json)
        };

        Some(decode().map_err(|reason| ProviderError::Decode {
            uri: uri.to_string(),
            reason,
        }))
    }
}

/// Provider serving embedded, local, and remote flows with a shared cache
pub struct RemoteFlowProvider {
    client: reqwest::Client,
    cache: DashMap<String, Arc<Definition>>,
    embedded: EmbeddedFlowManager,
}

impl RemoteFlowProvider {
    pub fn new(embedded: EmbeddedFlowManager) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache: DashMap::new(),
            embedded,
        }
    }

    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, ProviderError> {
        if uri.starts_with(URI_SCHEME_EMBEDDED) {
            info!(uri, "loading embedded flow");
            return self
                .embedded
                .get_flow_json(uri)
                .unwrap_or_else(|| Err(ProviderError::NotFound(uri.to_string())));
        }

        if uri.starts_with(URI_SCHEME_FILE) {
            info!(uri, "loading local flow");
            let path = url::Url::parse(uri)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .ok_or_else(|| ProviderError::InvalidUri(uri.to_string()))?;
            return Ok(tokio::fs::read(path).await?);
        }

        info!(uri, "loading remote flow");
        let response = self.client.get(uri).send().await?;
        if response.status().as_u16() >= 300 {
            return Err(ProviderError::NotFound(uri.to_string()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl FlowProvider for RemoteFlowProvider {
    async fn get_flow(&self, uri: &str) -> Result<Arc<Definition>, ProviderError> {
        if let Some(flow) = self.cache.get(uri) {
            debug!(uri, "serving cached flow");
            return Ok(Arc::clone(&flow));
        }

        let json = self.fetch(uri).await?;

        // a definition that fails to load or validate is not-found to the
        // caller; the cause only surfaces in the log
        let def = match Definition::from_json(&json) {
            Ok(def) => def,
            Err(e) => {
                error!(uri, error = %e, "error loading flow definition");
                return Err(ProviderError::NotFound(uri.to_string()));
            }
        };

        self.cache.insert(uri.to_string(), Arc::clone(&def));
        Ok(def)
    }
}
