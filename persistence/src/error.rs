//! FILENAME: core/persistence/src/error.rs

use engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported file version: {0}")]
    UnsupportedVersion(u32),
}
