use tidepool_core::DomainError;

use crate::config::ConfigError;
use crate::store::JobStoreError;
use crate::types::JobId;

/// Errors surfaced by the engine's public API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("job not found: {0}")]
    NotFound(JobId),
}

pub type EngineResult<T> = Result<T, EngineError>;
