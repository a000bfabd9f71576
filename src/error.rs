//! Top-level error type (v0.1)
//!
//! Module-level errors stay where they are raised (coercion, path, mapping,
//! definition, provider); [`EngineError`] wraps the ones that cross the
//! engine's public surface.

use thiserror::Error;

use crate::definition::DefinitionError;
use crate::provider::ProviderError;

/// Errors surfaced by the engine's public operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Flow could not be resolved or loaded
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Definition failed to load or validate
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// The definition names a model that is not registered
    #[error("model '{0}' is not registered")]
    ModelNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
