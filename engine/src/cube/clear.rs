//! FILENAME: core/engine/src/cube/clear.rs
//! PURPOSE: Deleting cells of an area, a single cell or the whole cube.

use super::{Cube, WriteOutcome};
use crate::area::{Area, ElementSet};
use crate::cell::{CellPath, ElementId, StorageKind};
use crate::error::Result;
use crate::journal::JournalCommand;
use crate::rights::Right;
use crate::storage::StagedWrite;

impl Cube {
    /// Deletes every base cell inside `area`. Consolidated elements stand for
    /// all their base descendants.
    pub fn clear_cells(&mut self, area: &Area, user: &str) -> Result<WriteOutcome> {
        self.clear_area(area, user, JournalCommand::CubeAreaClear { area: area.clone() })
    }

    pub fn clear_cell(&mut self, path: &[ElementId], user: &str) -> Result<WriteOutcome> {
        let command = JournalCommand::CellClear { path: CellPath::from_slice(path) };
        self.clear_area(&Area::from_path(path), user, command)
    }

    pub fn clear_cube(&mut self, user: &str) -> Result<WriteOutcome> {
        self.clear_area(&Area::all(self.dim_count()), user, JournalCommand::CubeClear)
    }

    fn clear_area(&mut self, area: &Area, user: &str, command: JournalCommand) -> Result<WriteOutcome> {
        self.ensure_loaded()?;
        self.check_right(user, area, Right::Delete)?;
        let base = self.base_cover(area)?;
        let writes = vec![
            (StorageKind::Numeric, StagedWrite::Clear { area: base.clone() }),
            (StorageKind::Text, StagedWrite::Clear { area: base }),
        ];
        self.locks.begin_step(user);
        let result = self.apply(writes, self.commit_options(), user, true);
        self.locks.end_step(user);
        let outcome = result?;
        self.write_journal(user, command);
        Ok(outcome)
    }

    /// `area` with every consolidated element replaced by its base descendants.
    /// Unrestricted dimensions stay unrestricted.
    pub(super) fn base_cover(&self, area: &Area) -> Result<Area> {
        let mut sets = Vec::with_capacity(self.dim_count());
        for (i, dim) in self.dimensions.iter().enumerate() {
            let mut set = ElementSet::new();
            if let Some(elements) = area.elements(i) {
                for e in elements {
                    if dim.is_consolidated(*e) {
                        set.extend(dim.base_elements(*e)?.into_keys());
                    } else {
                        dim.lookup_element(*e)?;
                        set.insert(*e);
                    }
                }
            }
            sets.push(set);
        }
        Ok(Area::from_sets(sets))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::sales;
    use super::super::WriteOptions;
    use super::*;
    use crate::cell::CellValue;
    use crate::journal::MemoryJournal;
    use crate::plan::RulesMode;
    use crate::snapshot::NoCubes;

    fn filled() -> Cube {
        let mut cube = sales();
        for p in [0, 1] {
            for r in [0, 1] {
                cube.set_cell_value(&[p, r], CellValue::Number(1.0), &[], "admin", WriteOptions::default(), &NoCubes)
                    .unwrap();
            }
        }
        cube.set_cell_value(&[3, 0], CellValue::Text("x".into()), &[], "admin", WriteOptions::default(), &NoCubes)
            .unwrap();
        cube
    }

    #[test]
    fn test_clear_consolidated_area_expands_to_base() {
        let mut cube = filled();
        let area = Area::from_sets(vec![ElementSet::from([2]), ElementSet::from([0])]);
        let outcome = cube.clear_cells(&area, "admin").unwrap();
        assert_eq!(outcome.deleted_paths().len(), 2);
        assert_eq!(cube.cell_count(), 3);
        let total = cube.get_cell_value(&[2, 2], RulesMode::NoRules, "admin", &NoCubes).unwrap();
        assert_eq!(total.value, CellValue::Number(2.0));
    }

    #[test]
    fn test_clear_cube_and_cell() {
        let mut cube = filled();
        let journal = MemoryJournal::new();
        cube.set_journal(Some(Box::new(journal.clone())));
        cube.clear_cell(&[3, 0], "admin").unwrap();
        assert_eq!(cube.cell_count(), 4);
        cube.clear_cube("admin").unwrap();
        assert_eq!(cube.cell_count(), 0);
        let names: Vec<&str> = journal.entries().iter().map(|e| e.command.name()).collect();
        assert_eq!(names, vec!["CELL_CLEAR", "CUBE_CLEAR"]);
    }
}
