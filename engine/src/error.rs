//! FILENAME: core/engine/src/error.rs
//! PURPOSE: Error taxonomy shared by every cube operation.
//! CONTEXT: Validation errors abort a single operation and are returned to the
//! caller unchanged. Journal replay catches them per entry.

use thiserror::Error;

use crate::cell::{CellPath, ElementId};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("Element type mismatch: {0}")]
    ElementTypeMismatch(String),

    #[error("Element {element} not found in dimension '{dimension}'")]
    ElementNotFound { dimension: String, element: ElementId },

    #[error("Dimension not found: {0}")]
    DimensionNotFound(String),

    #[error("Cube not found: {0}")]
    CubeNotFound(String),

    #[error("Cube '{0}' is not loaded")]
    NotLoaded(String),

    #[error("Cell {path:?} is locked by another user")]
    LockConflict { path: CellPath },

    #[error("Cell {path:?} belongs to a lock held by '{owner}'")]
    WrongUser { path: CellPath, owner: String },

    #[error("Requested lock overlaps lock {0}")]
    OverlappingLock(u32),

    #[error("Operation blocked by lock {0}")]
    BlockedByLock(u32),

    #[error("Lock {0} not found")]
    LockNotFound(u32),

    #[error("Splashing is disabled for consolidated cell {0:?}")]
    SplashDisabled(CellPath),

    #[error("Splash not possible: {0}")]
    SplashNotPossible(String),

    #[error("Rollback capacity exceeded for lock {0}")]
    RollbackCapacityExceeded(u32),

    #[error("Rule {0} not found")]
    RuleNotFound(u32),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("File format error: {0}")]
    FileFormatError(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Goal seek could not converge: {0}")]
    CouldNotConverge(String),

    #[error("Goal seek failed: {0}")]
    GoalSeek(String),

    #[error("Copy not possible: {0}")]
    CopyNotPossible(String),

    #[error("Storage backend failure: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
