use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by the HTTP layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller named a model or LoRA that does not exist.
    NotFound,
    /// The artifact is known but has not been provisioned on disk.
    Unavailable,
    /// The request body failed validation.
    Invalid,
    /// Inference or encoding failed.
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown model: {name}. Available: {available:?}")]
    UnknownModel { name: String, available: Vec<String> },

    #[error("Model file not found: {}. Download the checkpoint or provision it manually.", .path.display())]
    CheckpointMissing { model: String, path: PathBuf },

    #[error("LoRA not found: {name}. Available: {available:?}")]
    UnknownLora { name: String, available: Vec<String> },

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Inference(#[from] anyhow::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownModel { .. } | Self::UnknownLora { .. } => ErrorKind::NotFound,
            Self::CheckpointMissing { .. } => ErrorKind::Unavailable,
            Self::InvalidRequest(_) => ErrorKind::Invalid,
            Self::Inference(_) => ErrorKind::Internal,
        }
    }
}
