//! FILENAME: core/engine/src/cube/mod.rs
//! PURPOSE: A cube: value storages, rules, markers and locks over a fixed
//! list of dimensions, with the read and write API built on top of them.
//! CONTEXT: The cube is the single writer of its `CubeSnapshot`. Readers get
//! `Arc` clones through `view()`/`snapshot()`; every mutation goes through
//! `apply()`, which stages writes, commits them under the lock guard, records
//! rollback entries, bumps the value token and feeds the accelerated backend.
//! Marker propagation across cubes is left to the owning `Database`, which
//! receives the committed changes in a `WriteOutcome`.

mod clear;
mod copy;
mod goal_seek;
mod rules;
mod write;

pub use copy::CopyValue;
pub use write::{BulkOptions, BulkResult, SplashMode, WriteOptions};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::area::{Area, ElementSet};
use crate::backend::Backend;
use crate::cell::{CellPath, CellReading, CellTypes, CellValue, CubeId, ElementId, LockId, LockStatus, PathType, StorageKind};
use crate::config::CubeConfig;
use crate::dimension::Dimension;
use crate::error::{EngineError, Result};
use crate::journal::{JournalCommand, JournalEntry, JournalSink};
use crate::lock::{LockInfo, LockManager, RollbackAction};
use crate::plan::{CellStream, EvalContext, Planner, RulesMode};
use crate::rights::{AllowAll, Right, RightsChecker};
use crate::snapshot::{classify_path, CubeResolver, CubeSnapshot, CubeView, OverlayResolver};
use crate::storage::{CellChange, CommitOptions, StagedWrite, WriteMode};
use crate::{log_error, log_info, log_warn};

/// Persistence state of a cube's cells or rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CubeStatus {
    /// Matches the files on disk.
    Loaded,
    /// Modified since the last save.
    Changed,
    /// Not in memory.
    Unloaded,
}

/// Changes committed by one cube operation.
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    pub numeric: Vec<CellChange>,
    pub text: Vec<CellChange>,
    /// The whole content was replaced (whole-cube rollback); markers must be rebuilt.
    pub replaced: bool,
}

impl WriteOutcome {
    pub fn is_empty(&self) -> bool {
        self.numeric.is_empty() && self.text.is_empty() && !self.replaced
    }

    pub fn merge(&mut self, other: WriteOutcome) {
        self.numeric.extend(other.numeric);
        self.text.extend(other.text);
        self.replaced |= other.replaced;
    }

    /// Numeric cells that hold a value after the operation.
    pub fn written_paths(&self) -> impl Iterator<Item = &CellPath> {
        self.numeric.iter().filter(|c| c.current.is_materialized()).map(|c| &c.path)
    }

    /// Numeric cells that lost their value.
    pub fn deleted_paths(&self) -> Vec<CellPath> {
        self.numeric.iter().filter(|c| c.is_deletion()).map(|c| c.path.clone()).collect()
    }
}

pub struct Cube {
    id: CubeId,
    name: String,
    dimensions: Arc<[Arc<Dimension>]>,
    data: Arc<CubeSnapshot>,
    locks: LockManager,
    journal: Option<Box<dyn JournalSink>>,
    backend: Backend,
    config: Arc<CubeConfig>,
    rights: Arc<dyn RightsChecker>,
    cell_status: CubeStatus,
    rule_status: CubeStatus,
}

impl std::fmt::Debug for Cube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cube")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dimensions", &self.dimensions.len())
            .field("token", &self.data.token)
            .field("cells", &(self.data.numeric.len() + self.data.text.len()))
            .field("locks", &self.locks.len())
            .field("backend", &self.backend)
            .field("cell_status", &self.cell_status)
            .finish()
    }
}

impl Cube {
    pub fn new(id: CubeId, name: impl Into<String>, dimensions: Vec<Arc<Dimension>>, config: Arc<CubeConfig>) -> Self {
        let name = name.into();
        let dim_count = dimensions.len();
        Cube {
            id,
            locks: LockManager::new(name.clone(), Arc::clone(&config)),
            name,
            dimensions: dimensions.into(),
            data: Arc::new(CubeSnapshot::new(dim_count)),
            journal: None,
            backend: Backend::Cpu,
            config,
            rights: Arc::new(AllowAll),
            cell_status: CubeStatus::Changed,
            rule_status: CubeStatus::Changed,
        }
    }

    pub fn with_rights(mut self, rights: Arc<dyn RightsChecker>) -> Self {
        self.rights = rights;
        self
    }

    pub fn set_journal(&mut self, journal: Option<Box<dyn JournalSink>>) {
        self.journal = journal;
    }

    pub fn take_journal(&mut self) -> Option<Box<dyn JournalSink>> {
        self.journal.take()
    }

    pub fn set_backend(&mut self, backend: Backend) {
        self.backend = backend;
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> CubeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> &Arc<[Arc<Dimension>]> {
        &self.dimensions
    }

    pub fn dim_count(&self) -> usize {
        self.dimensions.len()
    }

    pub fn config(&self) -> &Arc<CubeConfig> {
        &self.config
    }

    /// Value token; changes on every committed mutation and never decreases.
    pub fn token(&self) -> u64 {
        self.data.token
    }

    pub fn cell_status(&self) -> CubeStatus {
        self.cell_status
    }

    pub fn rule_status(&self) -> CubeStatus {
        self.rule_status
    }

    pub fn set_status(&mut self, cells: CubeStatus, rules: CubeStatus) {
        self.cell_status = cells;
        self.rule_status = rules;
    }

    pub fn is_loaded(&self) -> bool {
        self.cell_status != CubeStatus::Unloaded
    }

    pub fn snapshot(&self) -> Arc<CubeSnapshot> {
        Arc::clone(&self.data)
    }

    pub fn view(&self) -> CubeView {
        CubeView {
            id: self.id,
            dimensions: Arc::clone(&self.dimensions),
            snapshot: Arc::clone(&self.data),
        }
    }

    pub fn classify(&self, path: &[ElementId]) -> Result<PathType> {
        classify_path(&self.dimensions, path)
    }

    pub fn cell_count(&self) -> usize {
        self.data.numeric.len() + self.data.text.len()
    }

    pub fn is_marked(&self, path: &[ElementId]) -> bool {
        self.data.markers.is_marked(path)
    }

    pub fn marked_count(&self) -> usize {
        self.data.markers.len()
    }

    pub(crate) fn snapshot_mut(&mut self) -> &mut CubeSnapshot {
        Arc::make_mut(&mut self.data)
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(EngineError::NotLoaded(self.name.clone()))
        }
    }

    fn check_right(&self, user: &str, area: &Area, min: Right) -> Result<()> {
        self.rights.check_area_access(user, &self.name, area, min)
    }

    fn eval_context<'r>(&self, resolver: &'r dyn CubeResolver) -> EvalContext<'r> {
        EvalContext::new(resolver, self.config.rule_recursion_limit).with_cell_limit(self.config.max_evaluated_cells)
    }

    // ========================================================================
    // LOAD / UNLOAD
    // ========================================================================

    /// Replaces all cells by loaded content. Nothing is journaled or logged for rollback.
    pub fn load_cells(&mut self, cells: Vec<(CellPath, CellValue)>) -> Result<()> {
        let dims = Arc::clone(&self.dimensions);
        let data = Arc::make_mut(&mut self.data);
        data.numeric.reset();
        data.text.reset();
        data.markers.clear();
        for (path, value) in cells {
            let kind = classify_path(&dims, &path)?.storage_kind();
            data.storage_mut(kind).insert_loaded(path, value)?;
        }
        data.token += 1;
        self.cell_status = CubeStatus::Loaded;
        Ok(())
    }

    /// Drops the value storages. The caller saves first.
    pub fn unload(&mut self) {
        self.locks.release_all();
        let dim_count = self.dim_count();
        let token = self.data.token;
        let rules = self.data.rules.clone();
        let mut fresh = CubeSnapshot::new(dim_count);
        fresh.rules = rules;
        fresh.token = token + 1;
        self.data = Arc::new(fresh);
        self.cell_status = CubeStatus::Unloaded;
        log_info!("CUBE", "cube '{}' unloaded", self.name);
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Value of one cell.
    pub fn get_cell_value(
        &self,
        path: &[ElementId],
        rules: RulesMode,
        user: &str,
        others: &dyn CubeResolver,
    ) -> Result<CellReading> {
        self.ensure_loaded()?;
        let path = CellPath::from_slice(path);
        let area = Area::from_path(&path);
        self.check_right(user, &area, Right::Read)?;
        let view = self.view();
        let plan = Planner::new(&view).create_plan(&area, CellTypes::ALL, rules, false, None)?;
        let resolver = OverlayResolver { own: view.clone(), others };
        let ctx = self.eval_context(&resolver);
        let entry = plan.evaluate(&view, &ctx)?.next();
        Ok(CellReading {
            value: entry.as_ref().map(|e| e.value.clone()).unwrap_or_default(),
            rule_id: entry.and_then(|e| e.rule_id),
            lock_status: self.locks.lock_status(&path, user),
        })
    }

    /// Cells of an area.
    ///
    /// # Arguments
    /// * `types` - which kinds of cells to return
    /// * `skip_empty` - leave out empty cells
    /// * `block_size` - `Some(n)` returns at most n rows sorted by path
    #[allow(clippy::too_many_arguments)]
    pub fn get_cell_values(
        &self,
        area: &Area,
        types: CellTypes,
        rules: RulesMode,
        skip_empty: bool,
        block_size: Option<usize>,
        user: &str,
        others: &dyn CubeResolver,
    ) -> Result<CellStream> {
        self.ensure_loaded()?;
        self.check_right(user, area, Right::Read)?;
        let view = self.view();
        let plan = Planner::new(&view).create_plan(area, types, rules, skip_empty, block_size)?;
        let resolver = OverlayResolver { own: view.clone(), others };
        let ctx = self.eval_context(&resolver);
        plan.evaluate(&view, &ctx)
    }

    /// Numeric value of a cell without rights or lock decoration.
    fn read_number(&self, path: &CellPath, rules: RulesMode, others: &dyn CubeResolver) -> Result<f64> {
        let view = self.view();
        let area = Area::from_path(path);
        let plan = Planner::new(&view).create_plan(&area, CellTypes::NUMERIC, rules, true, None)?;
        let resolver = OverlayResolver { own: view.clone(), others };
        let ctx = self.eval_context(&resolver);
        let value = plan.evaluate(&view, &ctx)?.next().map(|e| e.value).unwrap_or_default();
        match value {
            CellValue::Error(code) => Err(EngineError::ElementTypeMismatch(format!(
                "cell {:?} evaluates to error {:?}",
                path, code
            ))),
            other => Ok(other.number_or_zero()),
        }
    }

    // ========================================================================
    // COMMIT
    // ========================================================================

    fn commit_options(&self) -> CommitOptions {
        CommitOptions {
            check_locks: !self.locks.is_empty(),
            additive: false,
            disjunctive: false,
        }
    }

    /// Stages and commits writes as one unit. With `record` set, changes inside
    /// locks of `user` go to their rollback logs.
    fn apply(
        &mut self,
        writes: Vec<(StorageKind, StagedWrite)>,
        options: CommitOptions,
        user: &str,
        record: bool,
    ) -> Result<WriteOutcome> {
        self.ensure_loaded()?;
        if writes.is_empty() {
            return Ok(WriteOutcome::default());
        }
        let data = Arc::make_mut(&mut self.data);
        for (kind, write) in writes {
            if let Err(e) = data.storage_mut(kind).stage(write) {
                data.numeric.discard_staged();
                data.text.discard_staged();
                return Err(e);
            }
        }

        let guard = self.locks.guard(user);
        let numeric = match data.numeric.commit(options, Some(&guard)) {
            Ok(changes) => changes,
            Err(e) => {
                data.text.discard_staged();
                return Err(e);
            }
        };
        let text = match data.text.commit(options, Some(&guard)) {
            Ok(changes) => changes,
            Err(e) => {
                revert(data, StorageKind::Numeric, &numeric);
                return Err(e);
            }
        };

        let outcome = WriteOutcome { numeric, text, replaced: false };
        if outcome.is_empty() {
            return Ok(outcome);
        }
        if record {
            let all: Vec<CellChange> = outcome.numeric.iter().chain(outcome.text.iter()).cloned().collect();
            if let Err(e) = self.locks.record_changes(&all, user) {
                let data = Arc::make_mut(&mut self.data);
                revert(data, StorageKind::Numeric, &outcome.numeric);
                revert(data, StorageKind::Text, &outcome.text);
                return Err(e);
            }
        }

        Arc::make_mut(&mut self.data).token += 1;
        self.cell_status = CubeStatus::Changed;
        self.mirror(&outcome);
        Ok(outcome)
    }

    /// Puts back the previous values of an outcome committed by earlier `apply` calls.
    fn undo(&mut self, outcome: &WriteOutcome, user: &str) {
        let writes: Vec<(StorageKind, StagedWrite)> = outcome
            .numeric
            .iter()
            .rev()
            .map(|c| (StorageKind::Numeric, c))
            .chain(outcome.text.iter().rev().map(|c| (StorageKind::Text, c)))
            .map(|(kind, change)| {
                let path = change.path.clone();
                (kind, StagedWrite::Cell { path, value: change.previous.clone(), mode: WriteMode::Set })
            })
            .collect();
        if let Err(e) = self.apply(writes, CommitOptions::default(), user, false) {
            let count = outcome.numeric.len() + outcome.text.len();
            log_error!("STORAGE", "cube '{}': undo of {} cells failed: {}", self.name, count, e);
        }
    }

    /// Feeds committed changes to the accelerated backend and waits for it.
    fn mirror(&mut self, outcome: &WriteOutcome) {
        let Backend::Accelerated(backend) = &self.backend else {
            return;
        };
        let mut pending = Vec::new();
        if !outcome.numeric.is_empty() {
            pending.push(backend.submit(StorageKind::Numeric, Arc::new(outcome.numeric.clone())));
        }
        if !outcome.text.is_empty() {
            pending.push(backend.submit(StorageKind::Text, Arc::new(outcome.text.clone())));
        }
        let mut failed = None;
        for write in pending {
            if let Err(e) = write.wait() {
                failed = Some(e);
            }
        }
        if let Some(e) = failed {
            log_warn!(
                "STORAGE",
                "backend '{}' of cube '{}' failed ({}); continuing on cpu storage",
                backend.name(),
                self.name,
                e
            );
            self.backend = Backend::Cpu;
        }
    }

    fn write_journal(&mut self, user: &str, command: JournalCommand) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        let entry = JournalEntry::new(user, command);
        if let Err(e) = journal.append(&entry) {
            log_error!("JOURNAL", "cube '{}': failed to journal {}: {}", self.name, entry.command.name(), e);
        }
    }

    /// Journals committed changes as their resulting values in one bulk block.
    fn journal_results(&mut self, user: &str, outcome: &WriteOutcome) {
        if outcome.numeric.is_empty() && outcome.text.is_empty() {
            return;
        }
        let commands: Vec<JournalCommand> = outcome
            .numeric
            .iter()
            .chain(outcome.text.iter())
            .map(|change| restore_command(&change.path, &change.current))
            .collect();
        self.write_journal(user, JournalCommand::CellReplaceBulkStart { disjunctive: false });
        for command in commands {
            self.write_journal(user, command);
        }
        self.write_journal(user, JournalCommand::CellReplaceBulkStop);
    }

    /// Flushes the journal sink, if any.
    pub fn flush_journal(&mut self) -> Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.flush(),
            None => Ok(()),
        }
    }

    // ========================================================================
    // LOCKS
    // ========================================================================

    /// Locks an area for `user`. Consolidated elements lock their descendants too.
    pub fn lock(&mut self, area: &Area, user: &str) -> Result<LockId> {
        self.ensure_loaded()?;
        self.check_right(user, area, Right::Write)?;
        let mut sets = Vec::with_capacity(self.dim_count());
        for (i, dim) in self.dimensions.iter().enumerate() {
            match area.elements(i) {
                None => sets.push(None),
                Some(set) => {
                    let mut expanded = ElementSet::new();
                    for e in set {
                        expanded.insert(*e);
                        expanded.extend(dim.descendants(*e)?);
                    }
                    sets.push(Some(expanded));
                }
            }
        }
        let area = Area::from_sets(sets.into_iter().map(|s| s.unwrap_or_default()).collect());
        self.locks.lock_area(area, user)
    }

    /// Locks the whole cube, remembering the current content for a full rollback.
    pub fn lock_cube(&mut self, user: &str) -> Result<LockId> {
        self.ensure_loaded()?;
        self.check_right(user, &Area::all(self.dim_count()), Right::Write)?;
        let baseline = Arc::clone(&self.data);
        self.locks.lock_cube(self.dim_count(), user, baseline)
    }

    pub fn locks(&self) -> Vec<LockInfo> {
        self.locks.iter().map(|l| l.info()).collect()
    }

    pub fn lock_status(&self, path: &[ElementId], user: &str) -> LockStatus {
        self.locks.lock_status(&CellPath::from_slice(path), user)
    }

    /// Releases a lock keeping its changes.
    pub fn commit_lock(&mut self, id: LockId, user: &str) -> Result<()> {
        self.locks.commit(id, user)
    }

    /// Undoes the last `steps` write calls made under a lock (all when 0).
    pub fn rollback(&mut self, id: LockId, user: &str, steps: usize) -> Result<WriteOutcome> {
        self.ensure_loaded()?;
        match self.locks.rollback(id, user, steps)? {
            RollbackAction::Restore { entries } => {
                let mut writes = Vec::with_capacity(entries.len());
                for entry in entries {
                    let kind = self.classify(&entry.path)?.storage_kind();
                    writes.push((
                        kind,
                        StagedWrite::Cell { path: entry.path, value: entry.previous, mode: WriteMode::Set },
                    ));
                }
                let outcome = self.apply(writes, self.commit_options(), user, false)?;
                let release = self.locks.finish_rollback(id, steps)?;
                self.journal_results(user, &outcome);
                log_info!("ROLLBACK", "lock {} of '{}': restored {} cells{}", id, self.name,
                    outcome.numeric.len() + outcome.text.len(), if release { ", lock released" } else { "" });
                Ok(outcome)
            }
            RollbackAction::Baseline(baseline) => {
                self.locks.finish_rollback(id, steps)?;
                let mut restored = (*baseline).clone();
                restored.rules = self.data.rules.clone();
                restored.token = self.data.token + 1;
                self.data = Arc::new(restored);
                self.cell_status = CubeStatus::Changed;

                let cells: Vec<(CellPath, CellValue)> = self
                    .data
                    .numeric
                    .entries_sorted()
                    .into_iter()
                    .chain(self.data.text.entries_sorted())
                    .collect();
                self.write_journal(user, JournalCommand::CellReplaceBulkStart { disjunctive: false });
                self.write_journal(user, JournalCommand::CubeClear);
                for (path, value) in &cells {
                    self.write_journal(user, restore_command(path, value));
                }
                self.write_journal(user, JournalCommand::CellReplaceBulkStop);
                log_info!("ROLLBACK", "whole-cube lock {} of '{}' rolled back", id, self.name);
                Ok(WriteOutcome { replaced: true, ..WriteOutcome::default() })
            }
        }
    }
}

fn restore_command(path: &CellPath, value: &CellValue) -> JournalCommand {
    match value {
        CellValue::Number(n) => JournalCommand::CellReplaceDouble {
            path: path.clone(),
            value: *n,
            add: false,
            splash: SplashMode::Default,
        },
        CellValue::Text(s) => JournalCommand::CellReplaceString { path: path.clone(), value: s.clone() },
        _ => JournalCommand::CellClear { path: path.clone() },
    }
}

/// Puts back the previous values of committed changes.
fn revert(data: &mut CubeSnapshot, kind: StorageKind, changes: &[CellChange]) {
    if changes.is_empty() {
        return;
    }
    let storage = data.storage_mut(kind);
    for change in changes.iter().rev() {
        if let Err(e) = storage.set(change.path.clone(), change.previous.clone(), WriteMode::Set) {
            log_error!("STORAGE", "revert of {:?} failed: {}", change.path, e);
        }
    }
    if let Err(e) = storage.commit(CommitOptions::default(), None) {
        log_error!("STORAGE", "revert commit failed: {}", e);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::sales;
    use super::*;
    use crate::backend::{MirrorBackend, PendingWrite, StorageBackend};
    use crate::journal::MemoryJournal;
    use crate::rights::FixedRight;
    use crate::snapshot::NoCubes;

    fn set(cube: &mut Cube, path: &[ElementId], value: f64, user: &str) -> Result<WriteOutcome> {
        cube.set_cell_value(path, CellValue::Number(value), &[], user, WriteOptions::default(), &NoCubes)
    }

    fn get(cube: &Cube, path: &[ElementId]) -> CellValue {
        cube.get_cell_value(path, RulesMode::AllRules, "admin", &NoCubes).unwrap().value
    }

    #[test]
    fn test_base_write_and_token() {
        let mut cube = sales();
        let token = cube.token();
        set(&mut cube, &[0, 0], 10.0, "admin").unwrap();
        assert_eq!(get(&cube, &[0, 0]), CellValue::Number(10.0));
        assert_eq!(get(&cube, &[2, 2]), CellValue::Number(10.0));
        assert!(cube.token() > token);
        assert_eq!(cube.cell_status(), CubeStatus::Changed);
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let mut cube = sales();
        set(&mut cube, &[0, 0], 1.0, "admin").unwrap();
        let before = cube.snapshot();
        set(&mut cube, &[0, 0], 2.0, "admin").unwrap();
        assert_eq!(before.numeric.get(&[0, 0]).unwrap(), CellValue::Number(1.0));
        assert_eq!(cube.snapshot().numeric.get(&[0, 0]).unwrap(), CellValue::Number(2.0));
    }

    #[test]
    fn test_lock_blocks_other_user() {
        let mut cube = sales();
        let area = Area::from_sets(vec![ElementSet::from([2]), ElementSet::new()]);
        cube.lock(&area, "alice").unwrap();
        let err = set(&mut cube, &[0, 0], 99.0, "bob").unwrap_err();
        assert!(matches!(err, EngineError::WrongUser { .. } | EngineError::LockConflict { .. }));
        assert_eq!(cube.lock_status(&[0, 0], "bob"), LockStatus::LockedByOther);
        set(&mut cube, &[0, 0], 99.0, "alice").unwrap();
    }

    #[test]
    fn test_rollback_restores_pre_lock_values() {
        let mut cube = sales();
        set(&mut cube, &[0, 0], 1.0, "alice").unwrap();
        let area = Area::from_sets(vec![ElementSet::from([2]), ElementSet::new()]);
        let id = cube.lock(&area, "alice").unwrap();
        set(&mut cube, &[0, 0], 2.0, "alice").unwrap();
        set(&mut cube, &[1, 1], 3.0, "alice").unwrap();
        set(&mut cube, &[0, 0], 4.0, "alice").unwrap();
        assert_eq!(cube.locks()[0].steps, 3);

        cube.rollback(id, "alice", 1).unwrap();
        assert_eq!(get(&cube, &[0, 0]), CellValue::Number(2.0));
        cube.rollback(id, "alice", 2).unwrap();
        assert_eq!(get(&cube, &[0, 0]), CellValue::Number(1.0));
        assert_eq!(get(&cube, &[1, 1]), CellValue::Empty);
        assert!(cube.locks().is_empty());
    }

    #[test]
    fn test_whole_cube_rollback_restores_baseline() {
        let mut cube = sales();
        set(&mut cube, &[0, 0], 1.0, "alice").unwrap();
        let id = cube.lock_cube("alice").unwrap();
        set(&mut cube, &[0, 0], 5.0, "alice").unwrap();
        set(&mut cube, &[1, 0], 6.0, "alice").unwrap();
        assert!(matches!(set(&mut cube, &[1, 1], 1.0, "bob"), Err(EngineError::WrongUser { .. })));
        assert!(matches!(cube.rollback(id, "alice", 1), Err(EngineError::BlockedByLock(_))));
        let token = cube.token();
        let outcome = cube.rollback(id, "alice", 0).unwrap();
        assert!(outcome.replaced);
        assert!(cube.token() > token);
        assert_eq!(get(&cube, &[0, 0]), CellValue::Number(1.0));
        assert_eq!(get(&cube, &[1, 0]), CellValue::Empty);
    }

    #[test]
    fn test_journal_written_after_apply() {
        let mut cube = sales();
        let journal = MemoryJournal::new();
        cube.set_journal(Some(Box::new(journal.clone())));
        set(&mut cube, &[0, 0], 1.0, "admin").unwrap();
        let mut options = WriteOptions::default();
        options.write_journal = false;
        cube.set_cell_value(&[1, 0], CellValue::Number(1.0), &[], "admin", options, &NoCubes).unwrap();
        let entries = journal.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].command.name(), "CELL_REPLACE_DOUBLE");
    }

    #[test]
    fn test_rights_checked() {
        let cube = sales().with_rights(Arc::new(FixedRight(Right::Read)));
        let mut cube = cube;
        assert!(matches!(set(&mut cube, &[0, 0], 1.0, "u"), Err(EngineError::NotAuthorized(_))));
        assert!(cube.get_cell_value(&[0, 0], RulesMode::NoRules, "u", &NoCubes).is_ok());
    }

    struct BrokenBackend;

    impl StorageBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }
        fn submit(&self, _kind: StorageKind, _changes: Arc<Vec<CellChange>>) -> PendingWrite {
            PendingWrite::spawn(|| Err(EngineError::Backend("device lost".to_string())))
        }
        fn get(&self, _kind: StorageKind, _path: &[u32]) -> Option<CellValue> {
            None
        }
    }

    #[test]
    fn test_backend_mirrors_and_demotes() {
        let mut cube = sales();
        let mirror = Arc::new(MirrorBackend::new());
        cube.set_backend(Backend::Accelerated(mirror.clone()));
        set(&mut cube, &[0, 0], 3.0, "admin").unwrap();
        assert_eq!(mirror.get(StorageKind::Numeric, &[0, 0]), Some(CellValue::Number(3.0)));

        cube.set_backend(Backend::Accelerated(Arc::new(BrokenBackend)));
        set(&mut cube, &[0, 1], 4.0, "admin").unwrap();
        assert!(!cube.backend().is_accelerated());
        assert_eq!(get(&cube, &[0, 1]), CellValue::Number(4.0));
    }

    #[test]
    fn test_unload_then_load() {
        let mut cube = sales();
        set(&mut cube, &[0, 0], 3.0, "admin").unwrap();
        cube.unload();
        assert!(matches!(
            cube.get_cell_value(&[0, 0], RulesMode::NoRules, "admin", &NoCubes),
            Err(EngineError::NotLoaded(_))
        ));
        cube.load_cells(vec![(CellPath::from_slice(&[0, 0]), CellValue::Number(3.0))]).unwrap();
        assert_eq!(cube.cell_status(), CubeStatus::Loaded);
        assert_eq!(get(&cube, &[0, 0]), CellValue::Number(3.0));
    }
}
