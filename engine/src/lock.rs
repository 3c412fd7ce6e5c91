//! FILENAME: core/engine/src/lock.rs
//! PURPOSE: Exclusive write locks over sub-areas of a cube.
//! CONTEXT: Locks of one cube never overlap. A user writing inside its own lock
//! gets every overwritten value recorded in the lock's rollback log; writing
//! into someone else's lock fails. A whole-cube lock keeps the snapshot taken
//! when it was granted instead of a log and can only be rolled back as a whole.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::area::Area;
use crate::cell::{CellPath, LockId, LockStatus};
use crate::config::CubeConfig;
use crate::error::{EngineError, Result};
use crate::rollback::{RollbackEntry, RollbackLog};
use crate::snapshot::CubeSnapshot;
use crate::storage::{CellChange, LockGuard};
use crate::{log_info, log_warn};

#[derive(Debug)]
enum LockScope {
    Area(RollbackLog),
    WholeCube { baseline: Arc<CubeSnapshot>, steps: usize },
}

#[derive(Debug)]
pub struct Lock {
    pub id: LockId,
    /// Locked cells, expanded to base elements.
    pub area: Area,
    pub user: String,
    scope: LockScope,
}

impl Lock {
    pub fn is_whole_cube(&self) -> bool {
        matches!(self.scope, LockScope::WholeCube { .. })
    }

    pub fn step_count(&self) -> usize {
        match &self.scope {
            LockScope::Area(log) => log.step_count(),
            LockScope::WholeCube { steps, .. } => *steps,
        }
    }

    pub fn rollback_log(&self) -> Option<&RollbackLog> {
        match &self.scope {
            LockScope::Area(log) => Some(log),
            LockScope::WholeCube { .. } => None,
        }
    }

    pub fn info(&self) -> LockInfo {
        LockInfo {
            id: self.id,
            area: self.area.clone(),
            user: self.user.clone(),
            whole_cube: self.is_whole_cube(),
            steps: self.step_count(),
        }
    }
}

/// Client-facing description of a lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: LockId,
    pub area: Area,
    pub user: String,
    pub whole_cube: bool,
    pub steps: usize,
}

/// What the cube must do to roll a lock back.
#[derive(Debug)]
pub enum RollbackAction {
    /// Re-apply these values, most recent first.
    Restore { entries: Vec<RollbackEntry> },
    /// Replace the cube contents by the snapshot taken at lock time; the lock is gone.
    Baseline(Arc<CubeSnapshot>),
}

#[derive(Debug)]
pub struct LockManager {
    cube_name: String,
    locks: Vec<Lock>,
    next_id: LockId,
    config: Arc<CubeConfig>,
}

impl LockManager {
    pub fn new(cube_name: impl Into<String>, config: Arc<CubeConfig>) -> Self {
        LockManager {
            cube_name: cube_name.into(),
            locks: Vec::new(),
            next_id: 1,
            config,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lock> {
        self.locks.iter()
    }

    pub fn get(&self, id: LockId) -> Result<&Lock> {
        self.locks.iter().find(|l| l.id == id).ok_or(EngineError::LockNotFound(id))
    }

    pub fn has_whole_cube_lock(&self) -> bool {
        self.locks.iter().any(|l| l.is_whole_cube())
    }

    // ========================================================================
    // GRANT / RELEASE
    // ========================================================================

    fn check_overlap(&self, area: &Area) -> Result<()> {
        if let Some(existing) = self.locks.iter().find(|l| l.area.intersects(area)) {
            log_info!("LOCK", "lock request on '{}' overlaps lock {}", self.cube_name, existing.id);
            return Err(EngineError::OverlappingLock(existing.id));
        }
        Ok(())
    }

    pub fn lock_area(&mut self, area: Area, user: &str) -> Result<LockId> {
        self.check_overlap(&area)?;
        let id = self.next_id;
        self.next_id += 1;
        let log = RollbackLog::new(&self.cube_name, id, &self.config);
        self.locks.push(Lock {
            id,
            area,
            user: user.to_string(),
            scope: LockScope::Area(log),
        });
        log_info!("LOCK", "user '{}' locked area of '{}' as lock {}", user, self.cube_name, id);
        Ok(id)
    }

    pub fn lock_cube(&mut self, dim_count: usize, user: &str, baseline: Arc<CubeSnapshot>) -> Result<LockId> {
        let area = Area::all(dim_count);
        self.check_overlap(&area)?;
        let id = self.next_id;
        self.next_id += 1;
        self.locks.push(Lock {
            id,
            area,
            user: user.to_string(),
            scope: LockScope::WholeCube { baseline, steps: 0 },
        });
        log_info!("LOCK", "user '{}' locked cube '{}' as lock {}", user, self.cube_name, id);
        Ok(id)
    }

    fn owned_index(&self, id: LockId, user: &str) -> Result<usize> {
        let idx = self
            .locks
            .iter()
            .position(|l| l.id == id)
            .ok_or(EngineError::LockNotFound(id))?;
        if self.locks[idx].user != user {
            return Err(EngineError::NotAuthorized(format!(
                "lock {} is held by '{}'",
                id, self.locks[idx].user
            )));
        }
        Ok(idx)
    }

    /// Releases a lock keeping every change made under it.
    pub fn commit(&mut self, id: LockId, user: &str) -> Result<()> {
        let idx = self.owned_index(id, user)?;
        self.locks.remove(idx);
        log_info!("LOCK", "lock {} of '{}' committed", id, self.cube_name);
        Ok(())
    }

    /// Drops all locks (cube unload or clear).
    pub fn release_all(&mut self) {
        if !self.locks.is_empty() {
            log_warn!("LOCK", "releasing {} locks of '{}'", self.locks.len(), self.cube_name);
        }
        self.locks.clear();
    }

    /// What rolling back `steps` steps of a lock (all when 0) restores. The
    /// lock is left untouched until `finish_rollback`.
    pub fn rollback(&mut self, id: LockId, user: &str, steps: usize) -> Result<RollbackAction> {
        let idx = self.owned_index(id, user)?;
        match &mut self.locks[idx].scope {
            LockScope::Area(log) => Ok(RollbackAction::Restore { entries: log.peek_steps(steps)? }),
            LockScope::WholeCube { baseline, steps: taken } => {
                if steps != 0 && steps < *taken {
                    return Err(EngineError::BlockedByLock(id));
                }
                Ok(RollbackAction::Baseline(Arc::clone(baseline)))
            }
        }
    }

    /// Drops the rolled back steps once the cube holds the restored values.
    /// Returns whether the lock was released.
    pub fn finish_rollback(&mut self, id: LockId, steps: usize) -> Result<bool> {
        let idx = self
            .locks
            .iter()
            .position(|l| l.id == id)
            .ok_or(EngineError::LockNotFound(id))?;
        let release = match &mut self.locks[idx].scope {
            LockScope::Area(log) => {
                log.discard_steps(steps)?;
                log.is_empty()
            }
            LockScope::WholeCube { .. } => true,
        };
        if release {
            self.locks.remove(idx);
            log_info!("LOCK", "lock {} of '{}' rolled back and released", id, self.cube_name);
        }
        Ok(release)
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    /// Lock covering `path` for `user`.
    ///
    /// Returns `None` for an unlocked path, the lock id if `user` holds it,
    /// `WrongUser` if another user does. For a consolidated path, `splash_area`
    /// is the base area a write would spread into; a foreign lock intersecting
    /// it yields `BlockedByLock`.
    pub fn lookup(&self, path: &CellPath, splash_area: Option<&Area>, user: &str) -> Result<Option<LockId>> {
        if let Some(lock) = self.locks.iter().find(|l| l.area.contains(path)) {
            if lock.user == user {
                return Ok(Some(lock.id));
            }
            return Err(EngineError::WrongUser {
                path: path.clone(),
                owner: lock.user.clone(),
            });
        }
        if let Some(area) = splash_area {
            if let Some(lock) = self.locks.iter().find(|l| l.user != user && l.area.intersects(area)) {
                return Err(EngineError::BlockedByLock(lock.id));
            }
        }
        Ok(None)
    }

    pub fn lock_status(&self, path: &CellPath, user: &str) -> LockStatus {
        match self.locks.iter().find(|l| l.area.contains(path)) {
            None => LockStatus::Unlocked,
            Some(l) if l.user == user => LockStatus::LockedBySelf,
            Some(_) => LockStatus::LockedByOther,
        }
    }

    /// Guard rejecting writes into locks of anyone but `user`.
    pub fn guard<'a>(&'a self, user: &'a str) -> ForeignLockGuard<'a> {
        ForeignLockGuard { manager: self, user }
    }

    // ========================================================================
    // RECORDING
    // ========================================================================

    pub fn begin_step(&mut self, user: &str) {
        for lock in self.locks.iter_mut().filter(|l| l.user == user) {
            if let LockScope::Area(log) = &mut lock.scope {
                log.begin_step();
            }
        }
    }

    pub fn end_step(&mut self, user: &str) {
        for lock in self.locks.iter_mut().filter(|l| l.user == user) {
            if let LockScope::Area(log) = &mut lock.scope {
                log.end_step();
            }
        }
    }

    /// Appends committed changes falling inside locks of `user` to their logs.
    /// Either every log takes its entries or none keeps any.
    pub fn record_changes(&mut self, changes: &[CellChange], user: &str) -> Result<()> {
        let mut routed: Vec<Vec<RollbackEntry>> = self.locks.iter().map(|_| Vec::new()).collect();
        let mut whole_cube_touched = false;
        for change in changes {
            let Some(idx) = self
                .locks
                .iter()
                .position(|l| l.user == user && l.area.contains(&change.path))
            else {
                continue;
            };
            match &self.locks[idx].scope {
                LockScope::Area(_) => routed[idx].push(RollbackEntry {
                    path: change.path.clone(),
                    previous: change.previous.clone(),
                }),
                LockScope::WholeCube { .. } => whole_cube_touched = true,
            }
        }

        for (lock, entries) in self.locks.iter().zip(&routed) {
            if let LockScope::Area(log) = &lock.scope {
                log.check_capacity(entries)?;
            }
        }

        let mut marks = Vec::new();
        let mut failure = None;
        for (idx, entries) in routed.into_iter().enumerate() {
            if entries.is_empty() {
                continue;
            }
            let LockScope::Area(log) = &mut self.locks[idx].scope else {
                continue;
            };
            marks.push((idx, log.entry_count()));
            if let Err(e) = log.record_all(entries) {
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            for (idx, mark) in marks {
                let lock = &mut self.locks[idx];
                if let LockScope::Area(log) = &mut lock.scope {
                    if let Err(rewind) = log.rewind(mark) {
                        log_warn!("ROLLBACK", "lock {} could not drop a partial step: {}", lock.id, rewind);
                    }
                }
            }
            return Err(e);
        }

        if whole_cube_touched {
            for lock in self.locks.iter_mut() {
                if let LockScope::WholeCube { steps, .. } = &mut lock.scope {
                    *steps += 1;
                }
            }
        }
        Ok(())
    }
}

pub struct ForeignLockGuard<'a> {
    manager: &'a LockManager,
    user: &'a str,
}

impl LockGuard for ForeignLockGuard<'_> {
    fn check_write(&self, path: &CellPath) -> Result<()> {
        match self.manager.locks.iter().find(|l| l.area.contains(path)) {
            Some(lock) if lock.user != self.user => Err(EngineError::LockConflict { path: path.clone() }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::ElementSet;
    use crate::cell::CellValue;
    use smallvec::smallvec;

    fn manager() -> LockManager {
        let mut config = CubeConfig::default();
        config.rollback_dir = Some(std::env::temp_dir());
        LockManager::new("Sales", Arc::new(config))
    }

    fn row(element: u32) -> Area {
        Area::from_sets(vec![ElementSet::from([element]), ElementSet::new()])
    }

    #[test]
    fn test_overlap_rejected() {
        let mut m = manager();
        let id = m.lock_area(row(0), "alice").unwrap();
        assert!(matches!(m.lock_area(row(0), "bob"), Err(EngineError::OverlappingLock(x)) if x == id));
        m.lock_area(row(1), "bob").unwrap();
        let err = m.lock_cube(2, "carol", Arc::new(CubeSnapshot::new(2))).unwrap_err();
        assert!(matches!(err, EngineError::OverlappingLock(_)));
    }

    #[test]
    fn test_lookup_and_guard() {
        let mut m = manager();
        let id = m.lock_area(row(0), "alice").unwrap();
        assert_eq!(m.lookup(&smallvec![0, 5], None, "alice").unwrap(), Some(id));
        assert!(matches!(
            m.lookup(&smallvec![0, 5], None, "bob"),
            Err(EngineError::WrongUser { owner, .. }) if owner == "alice"
        ));
        assert_eq!(m.lookup(&smallvec![1, 5], None, "bob").unwrap(), None);
        let splash = Area::from_sets(vec![ElementSet::from([0, 1]), ElementSet::from([5])]);
        assert!(matches!(m.lookup(&smallvec![2, 5], Some(&splash), "bob"), Err(EngineError::BlockedByLock(_))));

        assert!(m.guard("alice").check_write(&smallvec![0, 1]).is_ok());
        assert!(matches!(m.guard("bob").check_write(&smallvec![0, 1]), Err(EngineError::LockConflict { .. })));
        assert_eq!(m.lock_status(&smallvec![0, 1], "bob"), LockStatus::LockedByOther);
    }

    #[test]
    fn test_rollback_releases_when_empty() {
        let mut m = manager();
        let id = m.lock_area(row(0), "alice").unwrap();
        for v in [1.0, 2.0] {
            m.begin_step("alice");
            let change = CellChange {
                path: smallvec![0, 0],
                previous: CellValue::Number(v),
                current: CellValue::Number(v + 1.0),
            };
            m.record_changes(&[change], "alice").unwrap();
            m.end_step("alice");
        }
        assert_eq!(m.get(id).unwrap().step_count(), 2);
        assert!(matches!(m.rollback(id, "bob", 1), Err(EngineError::NotAuthorized(_))));
        match m.rollback(id, "alice", 1).unwrap() {
            RollbackAction::Restore { entries } => assert_eq!(entries[0].previous, CellValue::Number(2.0)),
            other => panic!("unexpected {:?}", other),
        }
        // nothing is dropped before the rollback is finished
        assert_eq!(m.get(id).unwrap().step_count(), 2);
        assert!(!m.finish_rollback(id, 1).unwrap());
        assert_eq!(m.get(id).unwrap().step_count(), 1);
        m.rollback(id, "alice", 5).unwrap();
        assert!(m.finish_rollback(id, 5).unwrap());
        assert!(m.is_empty());
    }

    #[test]
    fn test_whole_cube_partial_rollback_blocked() {
        let mut m = manager();
        let id = m.lock_cube(2, "alice", Arc::new(CubeSnapshot::new(2))).unwrap();
        for _ in 0..2 {
            let change = CellChange { path: smallvec![0, 0], previous: CellValue::Empty, current: CellValue::Number(1.0) };
            m.record_changes(&[change], "alice").unwrap();
        }
        assert!(matches!(m.rollback(id, "alice", 1), Err(EngineError::BlockedByLock(_))));
        assert!(matches!(m.rollback(id, "alice", 0).unwrap(), RollbackAction::Baseline(_)));
        assert!(m.finish_rollback(id, 0).unwrap());
        assert!(m.is_empty());
    }

    #[test]
    fn test_full_log_takes_no_part_of_a_write() {
        let mut config = CubeConfig::default();
        config.rollback_dir = Some(std::env::temp_dir());
        config.max_memory_rollback_size = 64;
        config.max_file_rollback_size = 0;
        let mut m = LockManager::new("Sales", Arc::new(config));
        let id = m.lock_area(row(0), "alice").unwrap();
        let change = |e: u32| CellChange { path: smallvec![0, e], previous: CellValue::Number(1.0), current: CellValue::Number(2.0) };

        m.begin_step("alice");
        m.record_changes(&[change(0)], "alice").unwrap();
        m.end_step("alice");
        m.begin_step("alice");
        let err = m.record_changes(&[change(1), change(2)], "alice").unwrap_err();
        m.end_step("alice");
        assert!(matches!(err, EngineError::RollbackCapacityExceeded(x) if x == id));
        let log = m.get(id).unwrap().rollback_log().unwrap();
        assert_eq!(log.entry_count(), 1);
        assert_eq!(log.step_count(), 1);
    }
}
