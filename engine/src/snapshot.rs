//! FILENAME: core/engine/src/snapshot.rs
//! PURPOSE: Immutable versions of a cube's contents handed to readers.
//! CONTEXT: A cube keeps its stores in an `Arc<CubeSnapshot>`. Readers clone
//! the `Arc` and keep a consistent view for as long as they like; the single
//! writer mutates through `Arc::make_mut`, which copies only while an older
//! version is still being read.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::cell::{CellPath, CubeId, ElementId, PathType, StorageKind};
use crate::dimension::{Dimension, ElementType};
use crate::error::{EngineError, Result};
use crate::marker::MarkerStorage;
use crate::rule::RuleList;
use crate::storage::CellStorage;

#[derive(Debug, Clone)]
pub struct CubeSnapshot {
    pub numeric: CellStorage,
    pub text: CellStorage,
    pub markers: MarkerStorage,
    pub rules: RuleList,
    /// Bumped on every committed mutation.
    pub token: u64,
}

impl CubeSnapshot {
    pub fn new(dim_count: usize) -> Self {
        CubeSnapshot {
            numeric: CellStorage::new(StorageKind::Numeric, dim_count),
            text: CellStorage::new(StorageKind::Text, dim_count),
            markers: MarkerStorage::new(),
            rules: RuleList::new(),
            token: 1,
        }
    }

    pub fn storage(&self, kind: StorageKind) -> &CellStorage {
        match kind {
            StorageKind::Numeric => &self.numeric,
            StorageKind::Text => &self.text,
        }
    }

    pub fn storage_mut(&mut self, kind: StorageKind) -> &mut CellStorage {
        match kind {
            StorageKind::Numeric => &mut self.numeric,
            StorageKind::Text => &mut self.text,
        }
    }
}

/// What plan evaluation needs to know about one cube.
#[derive(Debug, Clone)]
pub struct CubeView {
    pub id: CubeId,
    pub dimensions: Arc<[Arc<Dimension>]>,
    pub snapshot: Arc<CubeSnapshot>,
}

impl CubeView {
    pub fn dim_count(&self) -> usize {
        self.dimensions.len()
    }

    pub fn classify(&self, path: &[ElementId]) -> Result<PathType> {
        classify_path(&self.dimensions, path)
    }
}

/// Classifies a path by the element types on it.
pub fn classify_path(dimensions: &[Arc<Dimension>], path: &[ElementId]) -> Result<PathType> {
    if path.len() != dimensions.len() {
        return Err(EngineError::InvalidCoordinates(format!(
            "path has {} coordinates, cube has {} dimensions",
            path.len(),
            dimensions.len()
        )));
    }
    let mut consolidated = false;
    for (dim, element) in dimensions.iter().zip(path.iter()) {
        match dim.element_type(*element)? {
            ElementType::String => return Ok(PathType::BaseString),
            ElementType::Consolidated => consolidated = true,
            ElementType::Numeric => {}
        }
    }
    Ok(if consolidated { PathType::Consolidated } else { PathType::BaseNumeric })
}

/// Looks up other cubes while evaluating cross-cube rules.
pub trait CubeResolver {
    fn resolve(&self, id: CubeId) -> Option<CubeView>;
}

/// Resolver for a cube evaluated on its own.
pub struct NoCubes;

impl CubeResolver for NoCubes {
    fn resolve(&self, _id: CubeId) -> Option<CubeView> {
        None
    }
}

impl CubeResolver for FxHashMap<CubeId, CubeView> {
    fn resolve(&self, id: CubeId) -> Option<CubeView> {
        self.get(&id).cloned()
    }
}

/// Resolves one cube to a given view and everything else through `others`.
pub struct OverlayResolver<'a> {
    pub own: CubeView,
    pub others: &'a dyn CubeResolver,
}

impl CubeResolver for OverlayResolver<'_> {
    fn resolve(&self, id: CubeId) -> Option<CubeView> {
        if id == self.own.id {
            Some(self.own.clone())
        } else {
            self.others.resolve(id)
        }
    }
}

/// Convenience for tests and callers that build paths from slices.
pub fn path_of(ids: &[ElementId]) -> CellPath {
    CellPath::from_slice(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Vec<Arc<Dimension>> {
        let mut d = Dimension::new(0, "D");
        let n = d.add_element("n", ElementType::Numeric).unwrap();
        let _s = d.add_element("s", ElementType::String).unwrap();
        let c = d.add_element("c", ElementType::Consolidated).unwrap();
        d.add_child(c, n, 1.0).unwrap();
        let d = Arc::new(d);
        vec![d.clone(), d]
    }

    #[test]
    fn test_classify() {
        let dims = dims();
        assert_eq!(classify_path(&dims, &[0, 0]).unwrap(), PathType::BaseNumeric);
        assert_eq!(classify_path(&dims, &[2, 1]).unwrap(), PathType::BaseString);
        assert_eq!(classify_path(&dims, &[0, 2]).unwrap(), PathType::Consolidated);
        assert!(classify_path(&dims, &[0]).is_err());
        assert!(classify_path(&dims, &[0, 9]).is_err());
    }

    #[test]
    fn test_overlay_resolver() {
        let dims: Arc<[Arc<Dimension>]> = dims().into();
        let view = CubeView { id: 4, dimensions: dims, snapshot: Arc::new(CubeSnapshot::new(2)) };
        let overlay = OverlayResolver { own: view, others: &NoCubes };
        assert!(overlay.resolve(4).is_some());
        assert!(overlay.resolve(5).is_none());
    }
}
