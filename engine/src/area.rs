//! FILENAME: core/engine/src/area.rs
//! PURPOSE: Immutable description of a multidimensional region of a cube.
//! CONTEXT: Each dimension is either unrestricted ("all elements") or an
//! explicit, sorted identifier set. Sets are shared behind `Arc` so that
//! deriving a sub-area only copies the dimension that changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cell::{CellPath, ElementId};
use crate::dimension::Dimension;
use crate::error::{EngineError, Result};

pub type ElementSet = BTreeSet<ElementId>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Area {
    dims: Vec<Option<Arc<ElementSet>>>,
}

impl Area {
    /// An area covering every element of every dimension.
    pub fn all(dim_count: usize) -> Self {
        Area { dims: vec![None; dim_count] }
    }

    /// A single-cell area.
    pub fn from_path(path: &[ElementId]) -> Self {
        Area {
            dims: path
                .iter()
                .map(|e| Some(Arc::new(std::iter::once(*e).collect())))
                .collect(),
        }
    }

    /// Builds an area from explicit sets. An empty set means "all elements".
    pub fn from_sets(sets: Vec<ElementSet>) -> Self {
        Area {
            dims: sets
                .into_iter()
                .map(|s| if s.is_empty() { None } else { Some(Arc::new(s)) })
                .collect(),
        }
    }

    pub fn dim_count(&self) -> usize {
        self.dims.len()
    }

    /// Returns a copy with dimension `dim` restricted to `set`.
    pub fn with_dim(&self, dim: usize, set: ElementSet) -> Self {
        let mut next = self.clone();
        next.dims[dim] = if set.is_empty() { None } else { Some(Arc::new(set)) };
        next
    }

    /// Explicit set of a dimension, `None` when unrestricted.
    pub fn elements(&self, dim: usize) -> Option<&ElementSet> {
        self.dims.get(dim).and_then(|d| d.as_deref())
    }

    pub fn is_restricted(&self, dim: usize) -> bool {
        self.elements(dim).is_some()
    }

    pub fn contains_element(&self, dim: usize, element: ElementId) -> bool {
        match self.elements(dim) {
            Some(set) => set.contains(&element),
            None => true,
        }
    }

    pub fn contains(&self, path: &[ElementId]) -> bool {
        path.len() == self.dims.len()
            && path.iter().enumerate().all(|(i, e)| self.contains_element(i, *e))
    }

    /// True if some path lies in both areas.
    pub fn intersects(&self, other: &Area) -> bool {
        self.dims.len() == other.dims.len()
            && self.dims.iter().zip(other.dims.iter()).all(|(a, b)| match (a, b) {
                (Some(a), Some(b)) => a.iter().any(|e| b.contains(e)),
                _ => true,
            })
    }

    pub fn intersection(&self, other: &Area) -> Option<Area> {
        if !self.intersects(other) {
            return None;
        }
        let dims = self
            .dims
            .iter()
            .zip(other.dims.iter())
            .map(|(a, b)| match (a, b) {
                (Some(a), Some(b)) => Some(Arc::new(a.intersection(b).copied().collect())),
                (Some(a), None) => Some(a.clone()),
                (None, b) => b.clone(),
            })
            .collect();
        Some(Area { dims })
    }

    /// True if every path of `other` is also in `self`.
    pub fn covers(&self, other: &Area) -> bool {
        self.dims.len() == other.dims.len()
            && self.dims.iter().zip(other.dims.iter()).all(|(a, b)| match (a, b) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(a), Some(b)) => b.is_subset(a),
            })
    }

    pub fn is_whole(&self) -> bool {
        self.dims.iter().all(|d| d.is_none())
    }

    /// Replaces every unrestricted dimension with the full element list.
    pub fn expand(&self, dimensions: &[Arc<Dimension>]) -> Result<Area> {
        self.check_dims(dimensions)?;
        let dims = self
            .dims
            .iter()
            .zip(dimensions.iter())
            .map(|(d, dim)| match d {
                Some(set) => Some(set.clone()),
                None => Some(Arc::new(dim.element_ids().into_iter().collect())),
            })
            .collect();
        Ok(Area { dims })
    }

    /// Number of paths in the area.
    pub fn size(&self, dimensions: &[Arc<Dimension>]) -> Result<u64> {
        self.check_dims(dimensions)?;
        Ok(self
            .dims
            .iter()
            .zip(dimensions.iter())
            .map(|(d, dim)| match d {
                Some(set) => set.len() as u64,
                None => dim.element_count() as u64,
            })
            .product())
    }

    /// Enumerates every path of an explicit area in sorted order.
    /// Unrestricted dimensions must be expanded first.
    pub fn paths(&self) -> Result<Vec<CellPath>> {
        let mut sets: Vec<Vec<ElementId>> = Vec::with_capacity(self.dims.len());
        for (i, d) in self.dims.iter().enumerate() {
            match d {
                Some(set) => sets.push(set.iter().copied().collect()),
                None => {
                    return Err(EngineError::InvalidCoordinates(format!(
                        "dimension {} of area is unrestricted",
                        i
                    )))
                }
            }
        }
        Ok(cartesian(&sets))
    }

    fn check_dims(&self, dimensions: &[Arc<Dimension>]) -> Result<()> {
        if dimensions.len() != self.dims.len() {
            return Err(EngineError::InvalidCoordinates(format!(
                "area has {} dimensions, cube has {}",
                self.dims.len(),
                dimensions.len()
            )));
        }
        Ok(())
    }
}

/// Cartesian product of per-dimension lists, first dimension varying slowest.
pub fn cartesian(sets: &[Vec<ElementId>]) -> Vec<CellPath> {
    if sets.iter().any(|s| s.is_empty()) {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(sets.iter().map(|s| s.len()).product());
    let mut current: CellPath = sets.iter().map(|s| s[0]).collect();
    let mut idx = vec![0usize; sets.len()];
    loop {
        out.push(current.clone());
        let mut d = sets.len();
        loop {
            if d == 0 {
                return out;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < sets[d].len() {
                current[d] = sets[d][idx[d]];
                break;
            }
            idx[d] = 0;
            current[d] = sets[d][0];
        }
    }
}
