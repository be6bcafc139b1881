use thiserror::Error;

use crate::storage::StorageError;

pub type Result<T, E = ImagerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ImagerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid input: {0}")]
    Input(String),

    #[error("unsupported content type: {0}")]
    UnsupportedType(String),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("{backend} backend failed: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: StorageError,
    },
}

impl ImagerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    pub fn backend(backend: &'static str, source: StorageError) -> Self {
        Self::Backend { backend, source }
    }
}
