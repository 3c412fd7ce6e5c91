//! FILENAME: core/engine/src/backend.rs
//! PURPOSE: Optional accelerated storage backend fed asynchronously.
//! CONTEXT: A cube runs either on the CPU storages alone or additionally
//! mirrors every committed change into an accelerated backend. Backend writes
//! run off the critical path and return a `PendingWrite` that the committing
//! call joins before it returns. A failed join demotes the cube to CPU only.

use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::cell::{CellPath, CellValue, StorageKind};
use crate::error::{EngineError, Result};
use crate::storage::CellChange;

/// Handle of a deferred backend write.
pub struct PendingWrite {
    handle: Option<JoinHandle<Result<()>>>,
}

impl PendingWrite {
    pub fn spawn<F>(job: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        PendingWrite {
            handle: Some(std::thread::spawn(job)),
        }
    }

    /// A write that has already completed.
    pub fn ready() -> Self {
        PendingWrite { handle: None }
    }

    pub fn wait(mut self) -> Result<()> {
        match self.handle.take() {
            None => Ok(()),
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(EngineError::Backend("backend write panicked".to_string())),
            },
        }
    }
}

impl fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWrite").field("pending", &self.handle.is_some()).finish()
    }
}

/// Storage reachable through the same change stream as the CPU storages.
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;
    /// Schedules the changes of one commit.
    fn submit(&self, kind: StorageKind, changes: Arc<Vec<CellChange>>) -> PendingWrite;
    fn get(&self, kind: StorageKind, path: &[u32]) -> Option<CellValue>;
}

/// Backend selection of a cube, checked once per commit.
#[derive(Clone, Default)]
pub enum Backend {
    #[default]
    Cpu,
    Accelerated(Arc<dyn StorageBackend>),
}

impl Backend {
    pub fn is_accelerated(&self) -> bool {
        matches!(self, Backend::Accelerated(_))
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "Cpu"),
            Backend::Accelerated(b) => write!(f, "Accelerated({})", b.name()),
        }
    }
}

// ============================================================================
// MIRROR BACKEND
// ============================================================================

type MirrorMap = FxHashMap<(StorageKind, CellPath), CellValue>;

/// Keeps a copy of every committed value, applied on a worker thread.
#[derive(Default)]
pub struct MirrorBackend {
    cells: Arc<Mutex<MirrorMap>>,
}

impl MirrorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MirrorBackend {
    fn name(&self) -> &str {
        "mirror"
    }

    fn submit(&self, kind: StorageKind, changes: Arc<Vec<CellChange>>) -> PendingWrite {
        let cells = Arc::clone(&self.cells);
        PendingWrite::spawn(move || {
            let mut map = cells
                .lock()
                .map_err(|_| EngineError::Backend("mirror map poisoned".to_string()))?;
            for change in changes.iter() {
                let key = (kind, change.path.clone());
                if change.current.is_materialized() {
                    map.insert(key, change.current.clone());
                } else {
                    map.remove(&key);
                }
            }
            Ok(())
        })
    }

    fn get(&self, kind: StorageKind, path: &[u32]) -> Option<CellValue> {
        let map = self.cells.lock().ok()?;
        map.get(&(kind, CellPath::from_slice(path))).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_mirror_applies_changes() {
        let backend = MirrorBackend::new();
        let changes = Arc::new(vec![CellChange {
            path: smallvec![1, 2],
            previous: CellValue::Empty,
            current: CellValue::Number(4.0),
        }]);
        backend.submit(StorageKind::Numeric, changes).wait().unwrap();
        assert_eq!(backend.get(StorageKind::Numeric, &[1, 2]), Some(CellValue::Number(4.0)));
        assert_eq!(backend.get(StorageKind::Text, &[1, 2]), None);
    }

    #[test]
    fn test_failed_job_surfaces_error() {
        let pending = PendingWrite::spawn(|| Err(EngineError::Backend("device lost".to_string())));
        assert!(matches!(pending.wait(), Err(EngineError::Backend(_))));
        assert!(PendingWrite::ready().wait().is_ok());
    }
}
