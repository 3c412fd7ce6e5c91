//! FILENAME: core/engine/src/lib.rs
//! PURPOSE: Main library entry point for the cube engine.
//! CONTEXT: Re-exports public types and modules for use by other crates.

pub mod area;
pub mod backend;
pub mod cell;
pub mod config;
pub mod cube;
pub mod database;
pub mod dimension;
pub mod error;
pub mod goal_seek;
pub mod journal;
pub mod lock;
pub mod logging;
pub mod marker;
pub mod plan;
pub mod rights;
pub mod rollback;
pub mod rule;
pub mod snapshot;
pub mod storage;

// Re-export commonly used types at the crate root
pub use area::{Area, ElementSet};
pub use backend::{Backend, MirrorBackend, PendingWrite, StorageBackend};
pub use cell::{
    CellPath, CellReading, CellTypes, CellValue, CubeId, DimensionId, ElementId, ErrorCode, LockId, LockStatus,
    MarkerId, PathType, RuleId, StorageKind,
};
pub use config::CubeConfig;
pub use cube::{BulkOptions, BulkResult, CopyValue, Cube, CubeStatus, SplashMode, WriteOptions, WriteOutcome};
pub use database::Database;
pub use dimension::{Dimension, Element, ElementType};
pub use error::{EngineError, Result};
pub use goal_seek::GoalSeekKind;
pub use journal::{JournalCommand, JournalEntry, JournalSink, MemoryJournal, COMMAND_NAMES, JOURNAL_VERSION};
pub use lock::{LockInfo, LockManager};
pub use marker::{MarkerEngine, MarkerStorage};
pub use plan::{CellEntry, CellStream, Plan, PlanNode, Planner, RulesMode};
pub use rights::{AllowAll, FixedRight, Right, RightsChecker};
pub use rule::{BinaryOp, CellReference, Rule, RuleDefinition, RuleExpr, RuleScope, SourceCoordinate};
pub use snapshot::{CubeResolver, CubeSnapshot, CubeView, NoCubes};
pub use storage::{CellChange, WriteMode};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn it_reads_back_written_cells() {
        let mut dim = Dimension::new(0, "Account");
        let a = dim.add_element("A", ElementType::Numeric).unwrap();
        let cube_dims = vec![Arc::new(dim)];
        let mut cube = Cube::new(1, "Tiny", cube_dims, Arc::new(CubeConfig::default()));
        cube.set_cell_value(&[a], CellValue::Number(42.0), &[], "admin", WriteOptions::default(), &NoCubes)
            .unwrap();
        let reading = cube.get_cell_value(&[a], RulesMode::AllRules, "admin", &NoCubes).unwrap();
        assert_eq!(reading.value, CellValue::Number(42.0));
        assert_eq!(reading.lock_status, LockStatus::Unlocked);
    }

    #[test]
    fn integration_test_database_workflow() {
        let mut db = Database::new("demo", CubeConfig::default());
        let mut region = Dimension::new(0, "Region");
        let north = region.add_element("North", ElementType::Numeric).unwrap();
        let south = region.add_element("South", ElementType::Numeric).unwrap();
        let total = region.add_element("Total", ElementType::Consolidated).unwrap();
        region.add_child(total, north, 1.0).unwrap();
        region.add_child(total, south, 1.0).unwrap();
        db.add_dimension(region).unwrap();
        let cube = db.create_cube("Revenue", &["Region"]).unwrap();

        db.set_cell_value(cube, &[north], CellValue::Number(10.0), &[], "admin", WriteOptions::default())
            .unwrap();
        db.set_cell_value(cube, &[south], CellValue::Number(30.0), &[], "admin", WriteOptions::default())
            .unwrap();
        db.set_cell_value(cube, &[total], CellValue::Number(80.0), &[], "admin", WriteOptions::default())
            .unwrap();

        let north_value = db.get_cell_value(cube, &[north], RulesMode::NoRules, "admin").unwrap();
        assert_eq!(north_value.value, CellValue::Number(20.0));
    }
}
