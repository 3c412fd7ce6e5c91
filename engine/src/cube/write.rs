//! FILENAME: core/engine/src/cube/write.rs
//! PURPOSE: Cell writes: base cells, splashing onto consolidated cells and bulk replace.
//! CONTEXT: A consolidated write is turned into staged base writes here and
//! committed through `Cube::apply`. Default splashing scales the existing base
//! cells by one factor so the aggregate becomes the new value; cells held by
//! the caller or locked by other users are left untouched and the factor is
//! computed over the remaining part.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::{restore_command, Cube, WriteOutcome};
use crate::area::{Area, ElementSet};
use crate::cell::{CellPath, CellValue, ElementId, PathType, StorageKind};
use crate::dimension::ElementType;
use crate::error::{EngineError, Result};
use crate::journal::JournalCommand;
use crate::plan::RulesMode;
use crate::rights::Right;
use crate::snapshot::CubeResolver;
use crate::storage::{StagedWrite, WriteMode};
use crate::{log_error, log_info, log_warn};

const MIB: f64 = 1024.0 * 1024.0;
/// Bytes of one staged cell in the working-set estimate.
const BYTES_PER_CELL: f64 = 16.0;

/// How a write to a consolidated cell reaches the base cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SplashMode {
    /// Consolidated writes are rejected.
    Disabled,
    /// Scale the existing base values proportionally.
    #[default]
    Default,
    /// Write the value into every base cell.
    SetBase,
    /// Add the value to every base cell.
    AddBase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Add to the current value instead of replacing it.
    pub add: bool,
    pub splash: SplashMode,
    /// Check the user's rights on the written area.
    pub check_area: bool,
    /// Off during journal replay.
    pub write_journal: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            add: false,
            splash: SplashMode::Default,
            check_area: true,
            write_journal: true,
        }
    }
}

impl WriteOptions {
    pub fn splash(mode: SplashMode) -> Self {
        WriteOptions { splash: mode, ..Self::default() }
    }

    pub fn replay() -> Self {
        WriteOptions { check_area: false, write_journal: false, ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOptions {
    /// Each write sees the values from before the bulk (last write wins).
    pub disjunctive: bool,
    /// Repeated writes to one cell are summed.
    pub additive: bool,
}

/// Result of a bulk write. Failed cells do not abort the others.
#[derive(Debug, Default)]
pub struct BulkResult {
    pub outcome: WriteOutcome,
    /// Index into the input and the error of each rejected cell.
    pub failures: Vec<(usize, EngineError)>,
}

/// Base cells below a consolidated cell, with the product weight per dimension.
struct SplashTarget {
    area: Area,
    weights: Vec<FxHashMap<ElementId, f64>>,
}

impl SplashTarget {
    fn weight(&self, path: &[ElementId]) -> f64 {
        path.iter()
            .zip(self.weights.iter())
            .map(|(e, w)| w.get(e).copied().unwrap_or(0.0))
            .product()
    }
}

fn is_zero(value: f64, scale: f64) -> bool {
    value.abs() <= 1e-12 * scale.abs().max(1.0)
}

impl Cube {
    // ========================================================================
    // SINGLE CELL
    // ========================================================================

    /// Writes one cell. `held` lists cells (base or consolidated) a splash must not touch.
    pub fn set_cell_value(
        &mut self,
        path: &[ElementId],
        value: CellValue,
        held: &[CellPath],
        user: &str,
        options: WriteOptions,
        others: &dyn CubeResolver,
    ) -> Result<WriteOutcome> {
        self.ensure_loaded()?;
        let path = CellPath::from_slice(path);
        let path_type = self.classify(&path)?;
        if options.check_area {
            self.check_write_right(&path, path_type, user)?;
        }
        let writes = self.cell_writes(&path, path_type, &value, held, user, options, others)?;
        self.locks.begin_step(user);
        let result = self.apply(writes, self.commit_options(), user, true);
        self.locks.end_step(user);
        let outcome = result?;
        if options.write_journal {
            // additions and splashes around held or locked cells are journaled as their results
            let replayable = !options.add
                && options.splash != SplashMode::AddBase
                && (path_type != PathType::Consolidated || (held.is_empty() && self.locks.is_empty()));
            if replayable {
                self.write_journal(user, value_command(&path, &value, options));
            } else if path_type != PathType::Consolidated {
                for change in outcome.numeric.iter().chain(outcome.text.iter()) {
                    self.write_journal(user, restore_command(&change.path, &change.current));
                }
            } else {
                self.journal_results(user, &outcome);
            }
        }
        Ok(outcome)
    }

    fn check_write_right(&self, path: &CellPath, path_type: PathType, user: &str) -> Result<()> {
        let right = if path_type == PathType::Consolidated { Right::Splash } else { Right::Write };
        self.check_right(user, &Area::from_path(path), right)
    }

    /// Staged writes implementing a single cell write.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn cell_writes(
        &self,
        path: &CellPath,
        path_type: PathType,
        value: &CellValue,
        held: &[CellPath],
        user: &str,
        options: WriteOptions,
        others: &dyn CubeResolver,
    ) -> Result<Vec<(StorageKind, StagedWrite)>> {
        if value.is_error() {
            return Err(EngineError::ElementTypeMismatch(format!("cannot write an error value to {:?}", path)));
        }
        match path_type {
            PathType::BaseString => {
                if options.add || matches!(value, CellValue::Number(_)) {
                    return Err(EngineError::ElementTypeMismatch(format!("{:?} is a string cell", path)));
                }
                self.locks.lookup(path, None, user)?;
                Ok(vec![(
                    StorageKind::Text,
                    StagedWrite::Cell { path: path.clone(), value: value.clone(), mode: WriteMode::Set },
                )])
            }
            PathType::BaseNumeric => {
                if matches!(value, CellValue::Text(_)) {
                    return Err(EngineError::ElementTypeMismatch(format!("{:?} is a numeric cell", path)));
                }
                self.locks.lookup(path, None, user)?;
                if options.add && value.is_empty() {
                    return Ok(Vec::new());
                }
                let mode = if options.add { WriteMode::AddAll } else { WriteMode::Set };
                Ok(vec![(
                    StorageKind::Numeric,
                    StagedWrite::Cell { path: path.clone(), value: value.clone(), mode },
                )])
            }
            PathType::Consolidated => self.splash_writes(path, value, held, user, options, others),
        }
    }

    // ========================================================================
    // SPLASH
    // ========================================================================

    /// Numeric base cells below `path`. Elements with weight zero cannot receive
    /// a share and are left out.
    fn splash_target(&self, path: &CellPath) -> Result<SplashTarget> {
        let mut sets = Vec::with_capacity(path.len());
        let mut weights = Vec::with_capacity(path.len());
        for (dim, element) in self.dimensions.iter().zip(path.iter()) {
            let mut set = ElementSet::new();
            let mut map = FxHashMap::default();
            for (base, weight) in dim.base_elements(*element)? {
                if dim.element_type(base)? != ElementType::Numeric {
                    continue;
                }
                if weight == 0.0 {
                    log_warn!(
                        "SPLASH",
                        "element {} of '{}' has weight 0 below {} and is excluded from the splash",
                        base,
                        dim.name,
                        element
                    );
                    continue;
                }
                set.insert(base);
                map.insert(base, weight);
            }
            if set.is_empty() {
                return Err(EngineError::SplashNotPossible(format!(
                    "element {} of '{}' has no numeric base element with non-zero weight",
                    element, dim.name
                )));
            }
            sets.push(set);
            weights.push(map);
        }
        Ok(SplashTarget { area: Area::from_sets(sets), weights })
    }

    /// Base area below a cell, used for held cells.
    pub(super) fn held_area(&self, path: &CellPath) -> Result<Area> {
        let mut sets = Vec::with_capacity(path.len());
        for (dim, element) in self.dimensions.iter().zip(path.iter()) {
            let set: ElementSet = dim.base_elements(*element)?.into_keys().collect();
            sets.push(set);
        }
        Ok(Area::from_sets(sets))
    }

    /// Refuses splashes whose projected working set is above the error tier.
    fn check_splash_size(&self, path: &CellPath, cells: u64) -> Result<()> {
        let n = cells as f64;
        let markers = cells.min(self.config.max_new_marker_count as u64) as f64;
        let mb = (BYTES_PER_CELL * n + markers * (8.0 + 4.0 * self.dim_count() as f64)) / MIB;
        if mb > self.config.splash_limit_error_mb {
            log_error!("SPLASH", "splash to {:?} in '{}' would need {:.1} MB, refused", path, self.name, mb);
            return Err(EngineError::SplashNotPossible(format!(
                "{} base cells ({:.1} MB) exceed the splash limit",
                cells, mb
            )));
        }
        if mb > self.config.splash_limit_warning_mb {
            log_warn!("SPLASH", "splash to {:?} in '{}' touches {} cells ({:.1} MB)", path, self.name, cells, mb);
        } else if mb > self.config.splash_limit_info_mb {
            log_info!("SPLASH", "splash to {:?} in '{}' touches {} cells ({:.1} MB)", path, self.name, cells, mb);
        }
        Ok(())
    }

    fn splash_writes(
        &self,
        path: &CellPath,
        value: &CellValue,
        held: &[CellPath],
        user: &str,
        options: WriteOptions,
        others: &dyn CubeResolver,
    ) -> Result<Vec<(StorageKind, StagedWrite)>> {
        if options.splash == SplashMode::Disabled {
            return Err(EngineError::SplashDisabled(path.clone()));
        }
        if matches!(value, CellValue::Text(_)) {
            return Err(EngineError::ElementTypeMismatch(format!("{:?} is a consolidated cell", path)));
        }
        if value.is_empty() && (options.add || options.splash == SplashMode::AddBase) {
            return Ok(Vec::new());
        }
        let target = self.splash_target(path)?;
        self.check_splash_size(path, target.area.size(&self.dimensions)?)?;

        let mut held_areas = Vec::with_capacity(held.len());
        for cell in held {
            held_areas.push(self.held_area(cell)?);
        }

        let mode = if value.is_empty() { SplashMode::SetBase } else { options.splash };
        match mode {
            SplashMode::Default => {
                self.locks.lookup(path, None, user)?;
                held_areas.extend(
                    self.locks
                        .iter()
                        .filter(|l| l.user != user && l.area.intersects(&target.area))
                        .map(|l| l.area.clone()),
                );
                self.proportional_writes(path, value.number_or_zero(), options.add, &target, &held_areas, others)
            }
            _ => {
                self.locks.lookup(path, Some(&target.area), user)?;
                let write_mode = if mode == SplashMode::AddBase || options.add { WriteMode::AddAll } else { WriteMode::Set };
                if held_areas.is_empty() {
                    return Ok(vec![(
                        StorageKind::Numeric,
                        StagedWrite::Area { area: target.area, value: value.clone(), mode: write_mode },
                    )]);
                }
                Ok(target
                    .area
                    .paths()?
                    .into_iter()
                    .filter(|p| !held_areas.iter().any(|a| a.contains(p)))
                    .map(|p| (StorageKind::Numeric, StagedWrite::Cell { path: p, value: value.clone(), mode: write_mode }))
                    .collect())
            }
        }
    }

    /// Default splash: scale the unheld base cells so the aggregate becomes the new total.
    fn proportional_writes(
        &self,
        path: &CellPath,
        value: f64,
        add: bool,
        target: &SplashTarget,
        held_areas: &[Area],
        others: &dyn CubeResolver,
    ) -> Result<Vec<(StorageKind, StagedWrite)>> {
        let previous = self.read_number(path, RulesMode::NoRules, others)?;
        let new_total = if add { previous + value } else { value };
        let is_held = |p: &[ElementId]| held_areas.iter().any(|a| a.contains(p));

        let stored = self.data.numeric.scan(&target.area);
        let held_sum: f64 = stored
            .iter()
            .filter(|(p, _)| is_held(p))
            .map(|(p, v)| target.weight(p) * v.number_or_zero())
            .sum();
        let free = previous - held_sum;

        if !is_zero(free, previous) {
            let factor = (new_total - held_sum) / free;
            if held_areas.is_empty() {
                return Ok(vec![(
                    StorageKind::Numeric,
                    StagedWrite::Area {
                        area: target.area.clone(),
                        value: CellValue::Number(factor),
                        mode: WriteMode::MultiplyExisting,
                    },
                )]);
            }
            return Ok(stored
                .into_iter()
                .filter(|(p, _)| !is_held(p))
                .map(|(p, v)| {
                    let scaled = CellValue::Number(v.number_or_zero() * factor);
                    (StorageKind::Numeric, StagedWrite::Cell { path: p, value: scaled, mode: WriteMode::Set })
                })
                .collect());
        }

        // Nothing to scale: every free cell gets the same share.
        let free_paths: Vec<CellPath> = target.area.paths()?.into_iter().filter(|p| !is_held(p)).collect();
        let weight_sum: f64 = free_paths.iter().map(|p| target.weight(p)).sum();
        if weight_sum == 0.0 {
            return Err(EngineError::SplashNotPossible(format!(
                "no unlocked base cell with non-zero weight below {:?}",
                path
            )));
        }
        let share = CellValue::Number((new_total - held_sum) / weight_sum);
        if held_areas.is_empty() {
            return Ok(vec![(
                StorageKind::Numeric,
                StagedWrite::Area { area: target.area.clone(), value: share, mode: WriteMode::Set },
            )]);
        }
        Ok(free_paths
            .into_iter()
            .map(|p| (StorageKind::Numeric, StagedWrite::Cell { path: p, value: share.clone(), mode: WriteMode::Set }))
            .collect())
    }

    // ========================================================================
    // BULK
    // ========================================================================

    /// Writes many cells. Base cells are committed together; consolidated cells
    /// are splashed one by one before that.
    pub fn set_cell_values(
        &mut self,
        cells: Vec<(CellPath, CellValue)>,
        user: &str,
        options: WriteOptions,
        bulk: BulkOptions,
        others: &dyn CubeResolver,
    ) -> Result<BulkResult> {
        self.ensure_loaded()?;
        let mut result = BulkResult::default();
        let mut base_writes = Vec::new();

        self.locks.begin_step(user);
        for (i, (path, value)) in cells.into_iter().enumerate() {
            let path_type = match self.classify(&path) {
                Ok(t) => t,
                Err(e) => {
                    result.failures.push((i, e));
                    continue;
                }
            };
            if options.check_area {
                if let Err(e) = self.check_write_right(&path, path_type, user) {
                    result.failures.push((i, e));
                    continue;
                }
            }
            let writes = match self.cell_writes(&path, path_type, &value, &[], user, options, others) {
                Ok(w) => w,
                Err(e) => {
                    result.failures.push((i, e));
                    continue;
                }
            };
            if path_type != PathType::Consolidated {
                base_writes.extend(writes);
                continue;
            }
            match self.apply(writes, self.commit_options(), user, true) {
                Ok(outcome) => result.outcome.merge(outcome),
                Err(e) => result.failures.push((i, e)),
            }
        }

        let mut commit = self.commit_options();
        commit.disjunctive = bulk.disjunctive;
        commit.additive = bulk.additive;
        let base = self.apply(base_writes, commit, user, true);
        self.locks.end_step(user);
        let base = base?;

        result.outcome.merge(base);
        if options.write_journal {
            self.journal_results(user, &result.outcome);
        }
        Ok(result)
    }
}

/// Journal command replaying a single cell write.
fn value_command(path: &CellPath, value: &CellValue, options: WriteOptions) -> JournalCommand {
    match value {
        CellValue::Number(n) => JournalCommand::CellReplaceDouble {
            path: path.clone(),
            value: *n,
            add: options.add,
            splash: options.splash,
        },
        CellValue::Text(s) => JournalCommand::CellReplaceString { path: path.clone(), value: s.clone() },
        _ => JournalCommand::CellClear { path: path.clone() },
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::sales;
    use super::*;
    use crate::area::ElementSet;
    use crate::cell::CellTypes;
    use crate::journal::MemoryJournal;
    use crate::snapshot::NoCubes;
    use smallvec::smallvec;

    // Product: P1=0, P2=1, AllProducts=2, Label=3; Region: EU=0, US=1, World=2
    fn write(cube: &mut Cube, path: &[ElementId], value: f64, options: WriteOptions) -> Result<WriteOutcome> {
        cube.set_cell_value(path, CellValue::Number(value), &[], "admin", options, &NoCubes)
    }

    fn number(cube: &Cube, path: &[ElementId]) -> f64 {
        cube.get_cell_value(path, RulesMode::NoRules, "admin", &NoCubes)
            .unwrap()
            .value
            .number_or_zero()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_proportional_splash_scales_existing_cells() {
        let mut cube = sales();
        write(&mut cube, &[0, 0], 10.0, WriteOptions::default()).unwrap();
        write(&mut cube, &[1, 0], 5.0, WriteOptions::default()).unwrap();
        write(&mut cube, &[2, 0], 30.0, WriteOptions::default()).unwrap();
        assert!(close(number(&cube, &[0, 0]), 20.0));
        assert!(close(number(&cube, &[1, 0]), 10.0));
        assert!(close(number(&cube, &[2, 0]), 30.0));
    }

    #[test]
    fn test_proportional_splash_single_contributor() {
        let mut cube = sales();
        write(&mut cube, &[0, 0], 10.0, WriteOptions::default()).unwrap();
        write(&mut cube, &[2, 0], 30.0, WriteOptions::default()).unwrap();
        // factor 3 over the only stored cell
        assert!(close(number(&cube, &[0, 0]), 30.0));
        assert_eq!(number(&cube, &[1, 0]), 0.0);
        assert!(close(number(&cube, &[2, 0]), 30.0));
    }

    #[test]
    fn test_empty_aggregate_falls_back_to_equal_shares() {
        let mut cube = sales();
        write(&mut cube, &[2, 2], 40.0, WriteOptions::default()).unwrap();
        for p in [0, 1] {
            for r in [0, 1] {
                assert!(close(number(&cube, &[p, r]), 10.0));
            }
        }
    }

    #[test]
    fn test_splash_add_and_base_modes() {
        let mut cube = sales();
        write(&mut cube, &[0, 0], 10.0, WriteOptions::default()).unwrap();
        write(&mut cube, &[1, 0], 10.0, WriteOptions::default()).unwrap();

        let mut add = WriteOptions::default();
        add.add = true;
        write(&mut cube, &[2, 0], 10.0, add).unwrap();
        assert!(close(number(&cube, &[2, 0]), 30.0));

        write(&mut cube, &[2, 0], 7.0, WriteOptions::splash(SplashMode::SetBase)).unwrap();
        assert!(close(number(&cube, &[0, 0]), 7.0));
        assert!(close(number(&cube, &[1, 0]), 7.0));

        write(&mut cube, &[2, 0], 1.0, WriteOptions::splash(SplashMode::AddBase)).unwrap();
        assert!(close(number(&cube, &[0, 0]), 8.0));
        assert!(close(number(&cube, &[2, 0]), 16.0));
    }

    #[test]
    fn test_splash_disabled() {
        let mut cube = sales();
        let err = write(&mut cube, &[2, 0], 1.0, WriteOptions::splash(SplashMode::Disabled)).unwrap_err();
        assert!(matches!(err, EngineError::SplashDisabled(_)));
        write(&mut cube, &[0, 0], 1.0, WriteOptions::splash(SplashMode::Disabled)).unwrap();
    }

    #[test]
    fn test_held_cells_stay_untouched() {
        let mut cube = sales();
        write(&mut cube, &[0, 0], 10.0, WriteOptions::default()).unwrap();
        write(&mut cube, &[1, 0], 10.0, WriteOptions::default()).unwrap();
        let held: Vec<CellPath> = vec![smallvec![0, 0]];
        cube.set_cell_value(&[2, 0], CellValue::Number(50.0), &held, "admin", WriteOptions::default(), &NoCubes)
            .unwrap();
        assert!(close(number(&cube, &[0, 0]), 10.0));
        assert!(close(number(&cube, &[1, 0]), 40.0));
    }

    #[test]
    fn test_foreign_lock_is_excluded_or_blocks() {
        let mut cube = sales();
        write(&mut cube, &[0, 0], 10.0, WriteOptions::default()).unwrap();
        write(&mut cube, &[1, 0], 10.0, WriteOptions::default()).unwrap();
        let area = Area::from_sets(vec![ElementSet::from([0]), ElementSet::new()]);
        cube.lock(&area, "alice").unwrap();

        cube.set_cell_value(&[2, 0], CellValue::Number(30.0), &[], "bob", WriteOptions::default(), &NoCubes)
            .unwrap();
        assert!(close(number(&cube, &[0, 0]), 10.0));
        assert!(close(number(&cube, &[1, 0]), 20.0));

        let err = cube
            .set_cell_value(&[2, 0], CellValue::Number(1.0), &[], "bob", WriteOptions::splash(SplashMode::SetBase), &NoCubes)
            .unwrap_err();
        assert!(matches!(err, EngineError::BlockedByLock(_)));
    }

    #[test]
    fn test_string_cells() {
        let mut cube = sales();
        cube.set_cell_value(&[3, 0], CellValue::Text("north".into()), &[], "admin", WriteOptions::default(), &NoCubes)
            .unwrap();
        let reading = cube.get_cell_value(&[3, 0], RulesMode::NoRules, "admin", &NoCubes).unwrap();
        assert_eq!(reading.value, CellValue::Text("north".into()));

        let mut add = WriteOptions::default();
        add.add = true;
        let err = cube
            .set_cell_value(&[3, 0], CellValue::Text("x".into()), &[], "admin", add, &NoCubes)
            .unwrap_err();
        assert!(matches!(err, EngineError::ElementTypeMismatch(_)));
        assert!(write(&mut cube, &[3, 0], 1.0, WriteOptions::default()).is_err());
    }

    #[test]
    fn test_splash_size_limit() {
        let mut cube = sales();
        let mut config = (**cube.config()).clone();
        config.splash_limit_error_mb = 0.0;
        cube.config = std::sync::Arc::new(config);
        let err = write(&mut cube, &[2, 2], 1.0, WriteOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::SplashNotPossible(_)));
    }

    #[test]
    fn test_marker_estimate_is_capped() {
        let mut cube = sales();
        let cells = 1_000_000u64;
        // room for the cells and half a marker per cell (two dims: 16 bytes each)
        let mut config = (**cube.config()).clone();
        config.splash_limit_error_mb = (16.0 * cells as f64 + 8.0 * cells as f64) / (1024.0 * 1024.0);
        config.max_new_marker_count = (cells / 4) as usize;
        cube.config = std::sync::Arc::new(config.clone());
        let path: CellPath = smallvec![2, 2];
        cube.check_splash_size(&path, cells).unwrap();

        config.max_new_marker_count = cells as usize;
        cube.config = std::sync::Arc::new(config);
        let err = cube.check_splash_size(&path, cells).unwrap_err();
        assert!(matches!(err, EngineError::SplashNotPossible(_)));
    }

    #[test]
    fn test_bulk_reports_failures_and_journals_once() {
        let mut cube = sales();
        let journal = MemoryJournal::new();
        cube.set_journal(Some(Box::new(journal.clone())));
        let cells = vec![
            (smallvec![0, 0], CellValue::Number(1.0)),
            (smallvec![9, 0], CellValue::Number(1.0)),
            (smallvec![2, 1], CellValue::Number(8.0)),
            (smallvec![0, 0], CellValue::Number(2.0)),
        ];
        let bulk = BulkOptions { disjunctive: false, additive: true };
        let result = cube.set_cell_values(cells, "admin", WriteOptions::default(), bulk, &NoCubes).unwrap();
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0, 1);
        assert!(close(number(&cube, &[0, 0]), 3.0));
        assert!(close(number(&cube, &[1, 1]), 4.0));

        let names: Vec<&str> = journal.entries().iter().map(|e| e.command.name()).collect();
        assert_eq!(names.first(), Some(&"CELL_REPLACE_BULK_START"));
        assert_eq!(names.last(), Some(&"CELL_REPLACE_BULK_STOP"));
    }

    #[test]
    fn test_additions_are_journaled_as_results() {
        let mut cube = sales();
        write(&mut cube, &[0, 0], 10.0, WriteOptions::default()).unwrap();
        write(&mut cube, &[1, 0], 10.0, WriteOptions::default()).unwrap();
        let journal = MemoryJournal::new();
        cube.set_journal(Some(Box::new(journal.clone())));

        write(&mut cube, &[2, 0], 10.0, WriteOptions { add: true, ..WriteOptions::default() }).unwrap();
        write(&mut cube, &[2, 0], 1.0, WriteOptions::splash(SplashMode::AddBase)).unwrap();
        write(&mut cube, &[0, 0], 1.0, WriteOptions { add: true, ..WriteOptions::default() }).unwrap();
        write(&mut cube, &[2, 0], 40.0, WriteOptions::default()).unwrap();

        let commands: Vec<JournalCommand> = journal.entries().into_iter().map(|e| e.command).collect();
        let mut values: Vec<(ElementId, f64, bool)> = commands
            .iter()
            .filter_map(|c| match c {
                JournalCommand::CellReplaceDouble { path, value, add, .. } => Some((path[0], *value, *add)),
                _ => None,
            })
            .collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(
            values,
            vec![(0, 15.0, false), (0, 16.0, false), (0, 17.0, false), (1, 15.0, false), (1, 16.0, false), (2, 40.0, false)]
        );
        assert_eq!(commands.iter().filter(|c| c.name() == "CELL_REPLACE_BULK_START").count(), 2);
    }

    #[test]
    fn test_area_read_after_splash() {
        let mut cube = sales();
        write(&mut cube, &[2, 2], 8.0, WriteOptions::default()).unwrap();
        let area = Area::from_sets(vec![ElementSet::from([0, 1]), ElementSet::from([0, 1])]);
        let cells: Vec<_> = cube
            .get_cell_values(&area, CellTypes::NUMERIC, RulesMode::NoRules, true, None, "admin", &NoCubes)
            .unwrap()
            .collect();
        assert_eq!(cells.len(), 4);
    }
}
