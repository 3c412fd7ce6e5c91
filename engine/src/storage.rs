//! FILENAME: core/engine/src/storage.rs
//! PURPOSE: Sparse path -> value store for one cell kind of one cube.
//! CONTEXT: Writes are staged first and applied by `commit`, which reports the
//! previous value of every key that changed (the lock rollback log and the
//! marker engine consume that list). Empty values are never materialized.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::area::Area;
use crate::cell::{CellPath, CellValue, StorageKind};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Overwrite the cell.
    Set,
    /// Add to the existing value, empty counts as zero.
    AddAll,
    /// Scale an existing value by a factor. Absent cells stay absent.
    MultiplyExisting,
}

/// A write waiting for the next commit.
#[derive(Debug, Clone)]
pub enum StagedWrite {
    Cell { path: CellPath, value: CellValue, mode: WriteMode },
    /// `Set`/`AddAll` touch every path of the (explicit) area,
    /// `MultiplyExisting` only the materialized ones.
    Area { area: Area, value: CellValue, mode: WriteMode },
    /// Deletes every materialized cell of the area.
    Clear { area: Area },
}

/// One key changed by a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellChange {
    pub path: CellPath,
    pub previous: CellValue,
    pub current: CellValue,
}

impl CellChange {
    /// The cell went from a value to nothing.
    pub fn is_deletion(&self) -> bool {
        self.previous.is_materialized() && !self.current.is_materialized()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOptions {
    /// Run every touched key through the lock guard before applying anything.
    pub check_locks: bool,
    /// Repeated `Set` writes to one key accumulate instead of replacing.
    pub additive: bool,
    /// Each staged write is evaluated against the committed state only;
    /// conflicting writes to one key resolve last-write-wins.
    pub disjunctive: bool,
}

/// Consulted by `commit` for every key it is about to change.
pub trait LockGuard {
    fn check_write(&self, path: &CellPath) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CellStorage {
    kind: StorageKind,
    dim_count: usize,
    cells: FxHashMap<CellPath, CellValue>,
    staged: Vec<StagedWrite>,
    last_deletions: usize,
}

impl CellStorage {
    pub fn new(kind: StorageKind, dim_count: usize) -> Self {
        CellStorage {
            kind,
            dim_count,
            cells: FxHashMap::default(),
            staged: Vec::new(),
            last_deletions: 0,
        }
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of keys removed by the last commit.
    pub fn last_deletions(&self) -> usize {
        self.last_deletions
    }

    fn check_path(&self, path: &[u32]) -> Result<()> {
        if path.len() != self.dim_count {
            return Err(EngineError::InvalidCoordinates(format!(
                "path has {} coordinates, cube has {} dimensions",
                path.len(),
                self.dim_count
            )));
        }
        Ok(())
    }

    fn check_value(&self, value: &CellValue, mode: WriteMode) -> Result<()> {
        let ok = match (self.kind, value) {
            (_, CellValue::Empty) => true,
            (StorageKind::Numeric, CellValue::Number(_)) => true,
            (StorageKind::Numeric, CellValue::Error(_)) => mode == WriteMode::Set,
            (StorageKind::Text, CellValue::Text(_)) => mode == WriteMode::Set,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::ElementTypeMismatch(format!(
                "{:?} storage cannot take {:?} with mode {:?}",
                self.kind, value, mode
            )))
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Committed value of a path, `Empty` if absent.
    pub fn get(&self, path: &[u32]) -> Result<CellValue> {
        self.check_path(path)?;
        Ok(self.cells.get(path).cloned().unwrap_or_default())
    }

    /// Materialized cells inside an area, unsorted.
    pub fn scan(&self, area: &Area) -> Vec<(CellPath, CellValue)> {
        if let Some(paths) = self.point_lookup_paths(area) {
            return paths
                .into_iter()
                .filter_map(|p| self.cells.get(&p).map(|v| (p, v.clone())))
                .collect();
        }
        self.cells
            .iter()
            .filter(|(k, _)| area.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Probing individual keys is cheaper than a full scan for small explicit areas.
    fn point_lookup_paths(&self, area: &Area) -> Option<Vec<CellPath>> {
        let mut size: usize = 1;
        for i in 0..area.dim_count() {
            size = size.saturating_mul(area.elements(i)?.len());
        }
        if size < self.cells.len() {
            area.paths().ok()
        } else {
            None
        }
    }

    /// Every materialized cell, sorted by path.
    pub fn entries_sorted(&self) -> Vec<(CellPath, CellValue)> {
        let mut entries: Vec<_> = self.cells.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Inserts a value read from a cube file, bypassing staging.
    pub fn insert_loaded(&mut self, path: CellPath, value: CellValue) -> Result<()> {
        self.check_path(&path)?;
        self.check_value(&value, WriteMode::Set)?;
        if value.is_materialized() {
            self.cells.insert(path, value);
        }
        Ok(())
    }

    /// Drops all values and staged writes.
    pub fn reset(&mut self) {
        self.cells = FxHashMap::default();
        self.staged.clear();
        self.last_deletions = 0;
    }

    // ========================================================================
    // STAGING
    // ========================================================================

    pub fn stage(&mut self, write: StagedWrite) -> Result<()> {
        match &write {
            StagedWrite::Cell { path, value, mode } => {
                self.check_path(path)?;
                self.check_value(value, *mode)?;
            }
            StagedWrite::Area { area, value, mode } => {
                if area.dim_count() != self.dim_count {
                    return Err(EngineError::InvalidCoordinates("area arity mismatch".to_string()));
                }
                self.check_value(value, *mode)?;
            }
            StagedWrite::Clear { area } => {
                if area.dim_count() != self.dim_count {
                    return Err(EngineError::InvalidCoordinates("area arity mismatch".to_string()));
                }
            }
        }
        self.staged
            .try_reserve(1)
            .map_err(|e| EngineError::ResourceExhausted(format!("staging write: {}", e)))?;
        self.staged.push(write);
        Ok(())
    }

    pub fn set(&mut self, path: CellPath, value: CellValue, mode: WriteMode) -> Result<()> {
        self.stage(StagedWrite::Cell { path, value, mode })
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn discard_staged(&mut self) {
        self.staged.clear();
    }

    /// Paths the staged writes will touch, with their values after commit.
    fn resolve(&self, options: CommitOptions) -> Result<(Vec<CellPath>, FxHashMap<CellPath, CellValue>)> {
        let mut order: Vec<CellPath> = Vec::new();
        let mut pending: FxHashMap<CellPath, CellValue> = FxHashMap::default();

        for write in &self.staged {
            let targets: Vec<(CellPath, CellValue, WriteMode)> = match write {
                StagedWrite::Cell { path, value, mode } => vec![(path.clone(), value.clone(), *mode)],
                StagedWrite::Area { area, value, mode } => match mode {
                    WriteMode::MultiplyExisting => {
                        let mut keys: Vec<CellPath> = self.scan(area).into_iter().map(|(k, _)| k).collect();
                        if !options.disjunctive {
                            keys.extend(
                                pending
                                    .iter()
                                    .filter(|(k, v)| area.contains(k) && !self.cells.contains_key(*k) && v.is_materialized())
                                    .map(|(k, _)| k.clone()),
                            );
                        }
                        keys.into_iter().map(|k| (k, value.clone(), *mode)).collect()
                    }
                    _ => area.paths()?.into_iter().map(|k| (k, value.clone(), *mode)).collect(),
                },
                StagedWrite::Clear { area } => {
                    let mut keys: Vec<CellPath> = self.scan(area).into_iter().map(|(k, _)| k).collect();
                    keys.extend(pending.keys().filter(|k| area.contains(k)).cloned());
                    keys.into_iter().map(|k| (k, CellValue::Empty, WriteMode::Set)).collect()
                }
            };

            for (path, value, mode) in targets {
                let base = if options.disjunctive {
                    self.cells.get(&path).cloned().unwrap_or_default()
                } else {
                    pending
                        .get(&path)
                        .cloned()
                        .or_else(|| self.cells.get(&path).cloned())
                        .unwrap_or_default()
                };
                let already_pending = pending.contains_key(&path);
                let next = match mode {
                    WriteMode::Set if options.additive && already_pending => add(&base, &value)?,
                    WriteMode::Set => value,
                    WriteMode::AddAll => add(&base, &value)?,
                    WriteMode::MultiplyExisting => match (&base, &value) {
                        (CellValue::Number(old), CellValue::Number(factor)) => CellValue::Number(old * factor),
                        (CellValue::Number(_), CellValue::Empty) => CellValue::Empty,
                        _ => continue,
                    },
                };
                if !already_pending {
                    order.push(path.clone());
                }
                pending.insert(path, next);
            }
        }
        Ok((order, pending))
    }

    /// Applies all staged writes and returns every key whose value changed.
    /// Nothing is applied if the lock guard rejects any touched key.
    pub fn commit(&mut self, options: CommitOptions, guard: Option<&dyn LockGuard>) -> Result<Vec<CellChange>> {
        let resolved = self.resolve(options);
        let (order, mut pending) = match resolved {
            Ok(r) => r,
            Err(e) => {
                self.staged.clear();
                return Err(e);
            }
        };

        if options.check_locks {
            if let Some(guard) = guard {
                for path in &order {
                    let previous = self.cells.get(path).cloned().unwrap_or_default();
                    let unchanged = pending.get(path).map_or(true, |v| same_content(v, &previous));
                    if unchanged {
                        continue;
                    }
                    if let Err(e) = guard.check_write(path) {
                        self.staged.clear();
                        return Err(e);
                    }
                }
            }
        }

        let mut changes = Vec::new();
        let mut deletions = 0;
        for path in order {
            let current = pending.remove(&path).unwrap_or_default();
            let previous = self.cells.get(&path).cloned().unwrap_or_default();
            if same_content(&current, &previous) {
                continue;
            }
            if current.is_materialized() {
                self.cells.insert(path.clone(), current.clone());
            } else {
                self.cells.remove(&path);
                deletions += 1;
            }
            changes.push(CellChange { path, previous, current });
        }
        self.staged.clear();
        self.last_deletions = deletions;
        Ok(changes)
    }
}

/// Equality under the sparsity rule: zero, empty string and `Empty` coincide.
fn same_content(a: &CellValue, b: &CellValue) -> bool {
    match (a.is_materialized(), b.is_materialized()) {
        (false, false) => true,
        (true, true) => a == b,
        _ => false,
    }
}

fn add(base: &CellValue, value: &CellValue) -> Result<CellValue> {
    match (base.as_number(), value.as_number()) {
        (Some(a), Some(b)) => Ok(CellValue::Number(a + b)),
        _ => Err(EngineError::ElementTypeMismatch(format!(
            "cannot add {:?} to {:?}",
            value, base
        ))),
    }
}
