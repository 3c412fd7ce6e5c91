//! FILENAME: core/engine/src/config.rs
//! PURPOSE: Tunable limits for splashing, goal seek, markers and rollback.
//! CONTEXT: One `CubeConfig` is shared (behind an `Arc`) by the database, its
//! cubes, the lock managers and the marker engine. Values can be loaded from JSON.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CubeConfig {
    /// Projected splash working set (MB) above which the write is refused.
    pub splash_limit_error_mb: f64,
    /// Projected splash working set (MB) that is logged as a warning.
    pub splash_limit_warning_mb: f64,
    /// Projected splash working set (MB) that is logged as info.
    pub splash_limit_info_mb: f64,
    /// Maximum number of cells in a complete goal-seek slice.
    pub goalseek_cell_limit: usize,
    /// Wall-clock limit for the goal-seek solver, in milliseconds. Zero disables it.
    pub goalseek_timeout_ms: u64,
    /// Deleted cells tolerated before markers of a cube are rebuilt immediately.
    pub marker_rebuild_limit: usize,
    /// Markers a splash is assumed to create at most when its working set is
    /// projected. Only the size estimate uses it; marker creation is not capped.
    pub max_new_marker_count: usize,
    /// Rollback bytes kept in memory per lock before a page is spilled to disk.
    pub max_memory_rollback_size: usize,
    /// Rollback bytes allowed on disk per lock.
    pub max_file_rollback_size: usize,
    /// Directory receiving spilled rollback pages. `None` means the system temp dir.
    pub rollback_dir: Option<PathBuf>,
    /// Nesting depth after which rule evaluation yields a recursion error.
    pub rule_recursion_limit: usize,
    /// Cells one read may materialize before it fails as resource exhausted.
    pub max_evaluated_cells: usize,
}

impl CubeConfig {
    pub fn new() -> Self {
        CubeConfig {
            splash_limit_error_mb: 1000.0,
            splash_limit_warning_mb: 500.0,
            splash_limit_info_mb: 100.0,
            goalseek_cell_limit: 1000,
            goalseek_timeout_ms: 10_000,
            marker_rebuild_limit: 100_000,
            max_new_marker_count: 1_000_000,
            max_memory_rollback_size: 10 * MIB,
            max_file_rollback_size: 100 * MIB,
            rollback_dir: None,
            rule_recursion_limit: 64,
            max_evaluated_cells: 50_000_000,
        }
    }

    pub fn rollback_dir(&self) -> PathBuf {
        self.rollback_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for CubeConfig {
    fn default() -> Self {
        Self::new()
    }
}
