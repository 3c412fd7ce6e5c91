//! FILENAME: core/persistence/src/lib.rs
//! Cube Persistence Module
//!
//! Saves and loads cube values, rules and journals. A cube lives in four
//! files of one directory: `<name>.cube` (text, authoritative),
//! `<name>.cube.bin` (binary cache), `<name>.rules` and `<name>.log` (journal).

mod cube_file;
mod error;
mod journal_file;
mod replay;
mod rule_file;

pub use cube_file::{
    load_cube_file, read_binary, read_text, save_cube_file, write_binary, write_text, CubeFile, ElementAlias,
    CUBE_FILE_VERSION,
};
pub use error::PersistenceError;
pub use journal_file::{archive_journal, read_journal, JournalFile, JournalRecord};
pub use replay::{replay_journal, ReplayReport};
pub use rule_file::{load_rules, save_rules, RULE_FILE_VERSION};

use std::path::{Path, PathBuf};

use engine::{log_info, log_warn};
use engine::{Cube, CubeId, CubeResolver, CubeStatus, Database, EngineError, JournalCommand};

// ============================================================================
// FILE LOCATIONS
// ============================================================================

/// Files belonging to one cube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubePaths {
    pub text: PathBuf,
    pub binary: PathBuf,
    pub rules: PathBuf,
    pub journal: PathBuf,
}

impl CubePaths {
    pub fn new(dir: &Path, cube_name: &str) -> Self {
        CubePaths {
            text: dir.join(format!("{}.cube", cube_name)),
            binary: dir.join(format!("{}.cube.bin", cube_name)),
            rules: dir.join(format!("{}.rules", cube_name)),
            journal: dir.join(format!("{}.log", cube_name)),
        }
    }
}

// ============================================================================
// SAVE / LOAD / UNLOAD
// ============================================================================

/// Writes values and rules, archives the journal and starts a fresh one.
/// Afterwards the cube counts as cleanly loaded.
pub fn save_cube(cube: &mut Cube, dir: &Path) -> Result<(), PersistenceError> {
    if !cube.is_loaded() {
        return Err(EngineError::NotLoaded(cube.name().to_string()).into());
    }
    let paths = CubePaths::new(dir, cube.name());
    cube.flush_journal()?;

    let file = CubeFile::from_cube(cube);
    save_cube_file(&file, &paths.text, &paths.binary)?;
    save_rules(cube, &paths.rules)?;

    drop(cube.take_journal());
    archive_journal(&paths.journal)?;
    cube.set_journal(Some(Box::new(JournalFile::open(&paths.journal)?)));
    cube.set_status(CubeStatus::Loaded, CubeStatus::Loaded);
    log_info!("FILE", "cube '{}' saved: {} cells", cube.name(), file.cell_count());
    Ok(())
}

/// Loads values and rules of `cube` from `dir` and replays its journal.
///
/// Journal entries are only present when the cube was changed after its last
/// save; in that case the cube stays `Changed` after the replay.
pub fn load_cube(cube: &mut Cube, dir: &Path, others: &dyn CubeResolver) -> Result<ReplayReport, PersistenceError> {
    let paths = CubePaths::new(dir, cube.name());
    drop(cube.take_journal());

    if paths.text.exists() {
        let file = load_cube_file(&paths.text, &paths.binary)?;
        if file.dim_count != cube.dim_count() {
            return Err(PersistenceError::InvalidFormat(format!(
                "{} has {} dimensions, cube '{}' has {}",
                paths.text.display(),
                file.dim_count,
                cube.name(),
                cube.dim_count()
            )));
        }
        cube.load_cells(file.into_cells())?;
    } else {
        log_warn!("FILE", "no cube file for '{}', starting empty", cube.name());
        cube.load_cells(Vec::new())?;
    }
    cube.load_rules(load_rules(&paths.rules)?)?;
    cube.set_status(CubeStatus::Loaded, CubeStatus::Loaded);

    let records = read_journal(&paths.journal)?;
    let dirty = records.iter().any(|r| {
        !matches!(r, JournalRecord::Entry { entry, .. } if matches!(entry.command, JournalCommand::Version { .. }))
    });
    let report = if dirty {
        let report = replay_journal(cube, records, others)?;
        cube.set_status(CubeStatus::Changed, CubeStatus::Changed);
        report
    } else {
        ReplayReport::default()
    };

    cube.set_journal(Some(Box::new(JournalFile::open(&paths.journal)?)));
    log_info!("FILE", "cube '{}' loaded: {} cells, {} rules", cube.name(), cube.cell_count(), cube.rules().count());
    Ok(report)
}

/// Saves the cube and drops its value storages.
pub fn unload_cube(cube: &mut Cube, dir: &Path) -> Result<(), PersistenceError> {
    save_cube(cube, dir)?;
    cube.unload();
    Ok(())
}

/// Loads a cube that belongs to `db`, letting the other cubes serve rule
/// reads during replay, then re-registers the markers of all cubes.
pub fn load_database_cube(db: &mut Database, id: CubeId, dir: &Path) -> Result<ReplayReport, PersistenceError> {
    let mut cube = db.remove_cube(id)?;
    let result = load_cube(&mut cube, dir, &*db);
    db.insert_cube(cube)?;
    let report = result?;
    let ids: Vec<CubeId> = db.cubes().map(|c| c.id()).collect();
    for cube_id in ids {
        db.register_markers(cube_id)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{CellValue, CubeConfig, Dimension, ElementType, NoCubes, RulesMode, WriteOptions};
    use std::sync::Arc;
    use tempfile::TempDir;

    // Account: A=0, B=1, Total=2 (A+B)
    fn cube() -> Cube {
        let mut dim = Dimension::new(0, "Account");
        let a = dim.add_element("A", ElementType::Numeric).unwrap();
        let b = dim.add_element("B", ElementType::Numeric).unwrap();
        let total = dim.add_element("Total", ElementType::Consolidated).unwrap();
        dim.add_child(total, a, 1.0).unwrap();
        dim.add_child(total, b, 1.0).unwrap();
        Cube::new(1, "Accounts", vec![Arc::new(dim)], Arc::new(CubeConfig::default()))
    }

    fn number(cube: &Cube, element: u32) -> f64 {
        cube.get_cell_value(&[element], RulesMode::NoRules, "admin", &NoCubes)
            .unwrap()
            .value
            .number_or_zero()
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut original = cube();
        load_cube(&mut original, dir.path(), &NoCubes).unwrap();
        original
            .set_cell_value(&[0], CellValue::Number(5.0), &[], "admin", WriteOptions::default(), &NoCubes)
            .unwrap();
        save_cube(&mut original, dir.path()).unwrap();
        assert_eq!(original.cell_status(), CubeStatus::Loaded);

        let mut loaded = cube();
        let report = load_cube(&mut loaded, dir.path(), &NoCubes).unwrap();
        assert_eq!(report, ReplayReport::default());
        assert_eq!(number(&loaded, 0), 5.0);
        assert_eq!(loaded.cell_status(), CubeStatus::Loaded);
    }

    #[test]
    fn test_unsaved_changes_come_back_from_the_journal() {
        let dir = TempDir::new().unwrap();
        let mut original = cube();
        load_cube(&mut original, dir.path(), &NoCubes).unwrap();
        original
            .set_cell_value(&[0], CellValue::Number(5.0), &[], "admin", WriteOptions::default(), &NoCubes)
            .unwrap();
        save_cube(&mut original, dir.path()).unwrap();
        original
            .set_cell_value(&[2], CellValue::Number(20.0), &[], "admin", WriteOptions::default(), &NoCubes)
            .unwrap();
        original.flush_journal().unwrap();
        drop(original);

        let mut loaded = cube();
        let report = load_cube(&mut loaded, dir.path(), &NoCubes).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(number(&loaded, 0), 20.0);
        assert_eq!(loaded.cell_status(), CubeStatus::Changed);
    }

    #[test]
    fn test_unload_requires_reload() {
        let dir = TempDir::new().unwrap();
        let mut c = cube();
        load_cube(&mut c, dir.path(), &NoCubes).unwrap();
        c.set_cell_value(&[1], CellValue::Number(2.0), &[], "admin", WriteOptions::default(), &NoCubes)
            .unwrap();
        unload_cube(&mut c, dir.path()).unwrap();
        assert_eq!(c.cell_status(), CubeStatus::Unloaded);
        assert!(matches!(save_cube(&mut c, dir.path()), Err(PersistenceError::Engine(EngineError::NotLoaded(_)))));

        load_cube(&mut c, dir.path(), &NoCubes).unwrap();
        assert_eq!(number(&c, 1), 2.0);
    }
}
