//! FILENAME: core/engine/src/marker.rs
//! PURPOSE: Precomputed rule dependencies between cubes ("markers").
//! CONTEXT: A marker rule in cube T reading cube S yields a `Marker`: any base
//! cell of S inside `from_base_area` maps, through a per-dimension permutation,
//! to one or more cells of T that the rule may produce a value for. Those
//! target cells are recorded in T's `MarkerStorage`, so rule cells can be
//! enumerated without evaluating the rule over its whole target area.
//!
//! TERMINOLOGY:
//! - from side: the cube whose writes trigger marking (S).
//! - to side: the cube holding the rule and the marked cells (T).
//! - multiplicating: a target dimension not bound to any source coordinate,
//!   so one source cell fans out over that dimension's base elements.
//!
//! USAGE:
//! 1. `add_rule_markers()` when a marker rule is activated or created.
//! 2. `on_write()` after every committed non-zero base write.
//! 3. `on_deletions()` before/after clearing cells; rebuilds are batched.
//! 4. `remove_rule_markers()` when the rule is deactivated, changed or deleted.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::area::{cartesian, Area, ElementSet};
use crate::cell::{CellPath, CubeId, ElementId, MarkerId, RuleId};
use crate::config::CubeConfig;
use crate::dimension::{Dimension, ElementType};
use crate::error::Result;
use crate::plan::ElementMultiMap;
use crate::rule::{Rule, SourceCoordinate};
use crate::{log_debug, log_info};

// ============================================================================
// MARKER STORAGE
// ============================================================================

/// Set of marked (rule-relevant) cells of one cube.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkerStorage {
    marked: FxHashSet<CellPath>,
}

impl MarkerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a cell. Returns true if it was not marked before.
    pub fn set_marker(&mut self, path: CellPath) -> bool {
        self.marked.insert(path)
    }

    pub fn is_marked(&self, path: &[ElementId]) -> bool {
        self.marked.contains(path)
    }

    pub fn len(&self) -> usize {
        self.marked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    pub fn clear(&mut self) {
        self.marked.clear();
    }

    pub fn marked_in(&self, area: &Area) -> Vec<CellPath> {
        let mut out: Vec<CellPath> = self.marked.iter().filter(|p| area.contains(p)).cloned().collect();
        out.sort();
        out
    }
}

// ============================================================================
// MARKER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Permutation {
    /// Target coordinate copied from this source dimension.
    Source(usize),
    /// Target coordinate is a constant.
    Fixed(ElementId),
    /// Target coordinate fans out over a list of base elements.
    AllElements,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub id: MarkerId,
    pub rule_id: RuleId,
    pub from_cube: CubeId,
    pub to_cube: CubeId,
    /// Base cells of the from cube that feed the marker.
    pub from_base_area: Area,
    /// Cells of the to cube the rule may compute.
    pub to_area: Area,
    /// One entry per target dimension.
    pub permutations: Vec<Permutation>,
    /// Elements used by `AllElements` dimensions (empty otherwise).
    pub fan_out: Vec<Vec<ElementId>>,
    /// Source element -> target elements, for `Source` dimensions whose
    /// source and target dimensions differ.
    pub mapping: Vec<Option<ElementMultiMap>>,
}

impl Marker {
    pub fn is_multiplicating(&self) -> bool {
        self.permutations.iter().any(|p| *p == Permutation::AllElements)
    }

    pub fn multiplicating_dimensions(&self) -> Vec<bool> {
        self.permutations.iter().map(|p| *p == Permutation::AllElements).collect()
    }

    /// Target cells for a changed source cell.
    pub fn target_paths(&self, source: &[ElementId]) -> Vec<CellPath> {
        let mut per_dim: Vec<Vec<ElementId>> = Vec::with_capacity(self.permutations.len());
        for (t, permutation) in self.permutations.iter().enumerate() {
            let elements = match permutation {
                Permutation::Fixed(e) => vec![*e],
                Permutation::AllElements => self.fan_out[t].clone(),
                Permutation::Source(j) => {
                    let Some(element) = source.get(*j) else {
                        return Vec::new();
                    };
                    match &self.mapping[t] {
                        Some(map) => map.get(element).cloned().unwrap_or_default(),
                        None => vec![*element],
                    }
                }
            };
            per_dim.push(elements);
        }
        cartesian(&per_dim)
            .into_iter()
            .filter(|p| self.to_area.contains(p))
            .collect()
    }
}

/// Builds the markers of one rule of cube `to_cube`.
///
/// # Arguments
/// * `to_dims` - dimensions of the cube holding the rule
/// * `dims_of` - dimensions of any referenced cube
pub fn build_rule_markers(
    to_cube: CubeId,
    to_dims: &[Arc<Dimension>],
    rule: &Rule,
    dims_of: &dyn Fn(CubeId) -> Option<Arc<[Arc<Dimension>]>>,
) -> Result<Vec<Marker>> {
    let mut markers = Vec::new();
    let target = &rule.definition.target;

    for reference in rule.definition.expression.references() {
        let from_cube = reference.cube.unwrap_or(to_cube);
        let Some(from_dims) = dims_of(from_cube) else {
            continue;
        };
        if reference.coordinates.len() != from_dims.len() {
            continue;
        }

        // source side: restrict by constants and by restricted target dims
        let mut from_sets: Vec<ElementSet> = Vec::with_capacity(from_dims.len());
        for (j, coordinate) in reference.coordinates.iter().enumerate() {
            let source_dim = &from_dims[j];
            let mut set = ElementSet::new();
            match coordinate {
                SourceCoordinate::Element(e) => {
                    set.extend(numeric_base(source_dim, *e)?);
                }
                SourceCoordinate::Variable(t) => {
                    if let (Some(restricted), Some(target_dim)) = (target.elements(*t), to_dims.get(*t)) {
                        for te in restricted {
                            if let Some(se) = translate(target_dim, source_dim, *te) {
                                set.extend(numeric_base(source_dim, se)?);
                            }
                        }
                        if set.is_empty() {
                            // restricted to elements unknown on the source side
                            set.insert(ElementId::MAX);
                        }
                    }
                }
            }
            from_sets.push(set);
        }

        // target side
        let mut permutations = Vec::with_capacity(to_dims.len());
        let mut fan_out = Vec::with_capacity(to_dims.len());
        let mut mapping = Vec::with_capacity(to_dims.len());
        for (t, target_dim) in to_dims.iter().enumerate() {
            let bound = reference
                .coordinates
                .iter()
                .position(|c| *c == SourceCoordinate::Variable(t));
            match bound {
                Some(j) => {
                    permutations.push(Permutation::Source(j));
                    fan_out.push(Vec::new());
                    let source_dim = &from_dims[j];
                    if Arc::ptr_eq(source_dim, target_dim) || source_dim.id == target_dim.id {
                        mapping.push(None);
                    } else {
                        mapping.push(Some(name_mapping(source_dim, target_dim)?));
                    }
                }
                None => {
                    let mut elements = Vec::new();
                    match target.elements(t) {
                        Some(set) => {
                            for e in set {
                                elements.extend(numeric_base(target_dim, *e)?);
                            }
                        }
                        None => elements = target_dim.base_element_ids(),
                    }
                    elements.sort_unstable();
                    elements.dedup();
                    if elements.len() == 1 {
                        permutations.push(Permutation::Fixed(elements[0]));
                        fan_out.push(Vec::new());
                    } else {
                        permutations.push(Permutation::AllElements);
                        fan_out.push(elements);
                    }
                    mapping.push(None);
                }
            }
        }

        markers.push(Marker {
            id: 0,
            rule_id: rule.id,
            from_cube,
            to_cube,
            from_base_area: Area::from_sets(from_sets),
            to_area: target.clone(),
            permutations,
            fan_out,
            mapping,
        });
    }
    Ok(markers)
}

fn numeric_base(dim: &Dimension, element: ElementId) -> Result<Vec<ElementId>> {
    let mut out = Vec::new();
    for base in dim.base_elements(element)?.into_keys() {
        if dim.element_type(base)? == ElementType::Numeric {
            out.push(base);
        }
    }
    Ok(out)
}

fn translate(from: &Dimension, to: &Dimension, element: ElementId) -> Option<ElementId> {
    if from.id == to.id {
        return Some(element);
    }
    let name = &from.lookup_element(element).ok()?.name;
    to.find_element_by_name(name).ok().map(|e| e.id)
}

/// Source base elements -> same-named target base elements. A consolidated
/// source element maps its base descendants onto the target element.
fn name_mapping(source: &Dimension, target: &Dimension) -> Result<ElementMultiMap> {
    let mut map = ElementMultiMap::default();
    for id in source.element_ids() {
        let elem = source.lookup_element(id)?;
        let Ok(te) = target.find_element_by_name(&elem.name) else {
            continue;
        };
        if te.is_consolidated() {
            continue;
        }
        for base in numeric_base(source, id)? {
            let entry = map.entry(base).or_default();
            if !entry.contains(&te.id) {
                entry.push(te.id);
            }
        }
    }
    Ok(map)
}

// ============================================================================
// MARKER ENGINE
// ============================================================================

/// Access to the cubes the engine marks.
pub trait MarkerHost {
    /// Non-empty base cells (stored numeric values and marked cells) of a cube inside an area.
    fn source_cells(&self, cube: CubeId, area: &Area) -> Vec<CellPath>;
    /// Marks a cell. Returns true if it was newly marked.
    fn set_marker(&mut self, cube: CubeId, path: CellPath) -> bool;
    fn clear_markers(&mut self, cube: CubeId);
}

#[derive(Debug)]
pub struct MarkerEngine {
    markers: FxHashMap<MarkerId, Marker>,
    from_markers: FxHashMap<CubeId, Vec<MarkerId>>,
    to_markers: FxHashMap<CubeId, Vec<MarkerId>>,
    /// Deleted source cells per from cube since the last rebuild.
    deletions: FxHashMap<CubeId, usize>,
    /// To cubes whose marker storage may hold stale marks.
    pending_rebuild: FxHashSet<CubeId>,
    next_id: MarkerId,
    config: Arc<CubeConfig>,
}

impl MarkerEngine {
    pub fn new(config: Arc<CubeConfig>) -> Self {
        MarkerEngine {
            markers: FxHashMap::default(),
            from_markers: FxHashMap::default(),
            to_markers: FxHashMap::default(),
            deletions: FxHashMap::default(),
            pending_rebuild: FxHashSet::default(),
            next_id: 1,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn get(&self, id: MarkerId) -> Option<&Marker> {
        self.markers.get(&id)
    }

    pub fn has_from_markers(&self, cube: CubeId) -> bool {
        self.from_markers.get(&cube).map_or(false, |v| !v.is_empty())
    }

    pub fn markers_from(&self, cube: CubeId) -> Vec<&Marker> {
        self.ids(&self.from_markers, cube).iter().filter_map(|id| self.markers.get(id)).collect()
    }

    pub fn markers_to(&self, cube: CubeId) -> Vec<&Marker> {
        self.ids(&self.to_markers, cube).iter().filter_map(|id| self.markers.get(id)).collect()
    }

    pub fn needs_rebuild(&self, cube: CubeId) -> bool {
        self.pending_rebuild.contains(&cube)
    }

    fn ids(&self, index: &FxHashMap<CubeId, Vec<MarkerId>>, cube: CubeId) -> Vec<MarkerId> {
        index.get(&cube).cloned().unwrap_or_default()
    }

    /// Registers markers and marks every target reachable from existing source cells.
    /// Returns the number of newly marked cells.
    pub fn add_markers(&mut self, markers: Vec<Marker>, host: &mut dyn MarkerHost) -> usize {
        let mut marked = 0;
        for mut marker in markers {
            marker.id = self.next_id;
            self.next_id += 1;
            let id = marker.id;
            self.from_markers.entry(marker.from_cube).or_default().push(id);
            self.to_markers.entry(marker.to_cube).or_default().push(id);
            self.markers.insert(id, marker);
            marked += self.populate(id, host);
        }
        marked
    }

    /// Drops all markers of a rule and rebuilds the marks of its cube.
    pub fn remove_rule_markers(&mut self, to_cube: CubeId, rule_id: RuleId, host: &mut dyn MarkerHost) {
        let doomed: Vec<MarkerId> = self
            .markers
            .values()
            .filter(|m| m.to_cube == to_cube && m.rule_id == rule_id)
            .map(|m| m.id)
            .collect();
        if doomed.is_empty() {
            return;
        }
        for id in &doomed {
            if let Some(marker) = self.markers.remove(id) {
                if let Some(list) = self.from_markers.get_mut(&marker.from_cube) {
                    list.retain(|m| m != id);
                }
                if let Some(list) = self.to_markers.get_mut(&marker.to_cube) {
                    list.retain(|m| m != id);
                }
            }
        }
        self.rebuild_cube(to_cube, host);
    }

    /// Removes every marker touching a cube (cube deletion).
    pub fn remove_cube(&mut self, cube: CubeId) {
        self.markers.retain(|_, m| m.from_cube != cube && m.to_cube != cube);
        let alive: FxHashSet<MarkerId> = self.markers.keys().copied().collect();
        for list in self.from_markers.values_mut().chain(self.to_markers.values_mut()) {
            list.retain(|id| alive.contains(id));
        }
        self.from_markers.remove(&cube);
        self.to_markers.remove(&cube);
        self.deletions.remove(&cube);
        self.pending_rebuild.remove(&cube);
    }

    fn populate(&self, id: MarkerId, host: &mut dyn MarkerHost) -> usize {
        let Some(marker) = self.markers.get(&id) else {
            return 0;
        };
        let mut newly = Vec::new();
        for source in host.source_cells(marker.from_cube, &marker.from_base_area) {
            for target in marker.target_paths(&source) {
                if host.set_marker(marker.to_cube, target.clone()) {
                    newly.push((marker.to_cube, target));
                }
            }
        }
        let mut count = newly.len();
        for (cube, path) in newly {
            count += self.on_write(cube, &path, host);
        }
        count
    }

    /// Marks every cell reachable from a changed base cell, following chains
    /// of markers depth-first until no new cell is marked.
    /// Returns the number of newly marked cells.
    pub fn on_write(&self, cube: CubeId, path: &[ElementId], host: &mut dyn MarkerHost) -> usize {
        let mut count = 0;
        let mut stack: Vec<(CubeId, CellPath)> = vec![(cube, CellPath::from_slice(path))];
        while let Some((from, key)) = stack.pop() {
            let Some(ids) = self.from_markers.get(&from) else {
                continue;
            };
            for id in ids {
                let Some(marker) = self.markers.get(id) else {
                    continue;
                };
                if !marker.from_base_area.contains(&key) {
                    continue;
                }
                for target in marker.target_paths(&key) {
                    if host.set_marker(marker.to_cube, target.clone()) {
                        count += 1;
                        stack.push((marker.to_cube, target));
                    }
                }
            }
        }
        count
    }

    /// True if any deleted path feeds a marker of `cube`.
    pub fn deletion_requires_invalidation(&self, cube: CubeId, deleted: &[CellPath]) -> bool {
        self.ids(&self.from_markers, cube).iter().any(|id| {
            self.markers
                .get(id)
                .map_or(false, |m| deleted.iter().any(|p| m.from_base_area.contains(p)))
        })
    }

    /// Records deleted source cells. Affected target cubes are flagged for a
    /// rebuild, which runs immediately once the deletion count passes the limit.
    /// Returns true if a rebuild ran.
    pub fn on_deletions(&mut self, cube: CubeId, deleted: &[CellPath], host: &mut dyn MarkerHost) -> bool {
        if deleted.is_empty() || !self.deletion_requires_invalidation(cube, deleted) {
            return false;
        }
        for id in self.ids(&self.from_markers, cube) {
            if let Some(marker) = self.markers.get(&id) {
                self.pending_rebuild.insert(marker.to_cube);
            }
        }
        let count = self.deletions.entry(cube).or_insert(0);
        *count += deleted.len();
        log_debug!("MARKER", "cube {} deleted {} marker source cells ({} total)", cube, deleted.len(), *count);
        if *count > self.config.marker_rebuild_limit {
            self.deletions.insert(cube, 0);
            self.rebuild_pending(host);
            return true;
        }
        false
    }

    /// Flags every cube fed by `cube` for a rebuild. Used when the content of
    /// `cube` was replaced wholesale.
    pub fn invalidate_source(&mut self, cube: CubeId) {
        for id in self.ids(&self.from_markers, cube) {
            if let Some(marker) = self.markers.get(&id) {
                self.pending_rebuild.insert(marker.to_cube);
            }
        }
    }

    /// Defers a rebuild of the marks of `cube` to the next read.
    pub fn schedule_rebuild(&mut self, cube: CubeId) {
        if self.to_markers.get(&cube).map_or(false, |v| !v.is_empty()) {
            self.pending_rebuild.insert(cube);
        }
    }

    pub fn has_pending_rebuilds(&self) -> bool {
        !self.pending_rebuild.is_empty()
    }

    /// Runs every deferred rebuild.
    pub fn rebuild_pending(&mut self, host: &mut dyn MarkerHost) {
        let pending: Vec<CubeId> = self.pending_rebuild.drain().collect();
        for cube in pending {
            self.rebuild_cube(cube, host);
        }
    }

    /// Clears and regenerates the marks of one to cube.
    pub fn rebuild_cube(&mut self, cube: CubeId, host: &mut dyn MarkerHost) {
        self.pending_rebuild.remove(&cube);
        host.clear_markers(cube);
        let ids = self.ids(&self.to_markers, cube);
        let mut marked = 0;
        for id in &ids {
            marked += self.populate(*id, host);
        }
        log_info!("MARKER", "rebuilt markers of cube {}: {} markers, {} cells", cube, ids.len(), marked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{RuleDefinition, RuleExpr, RuleList, RuleScope};

    /// Two cubes with stored cells and markers kept in plain maps.
    #[derive(Default)]
    struct Host {
        cells: FxHashMap<CubeId, Vec<CellPath>>,
        marks: FxHashMap<CubeId, MarkerStorage>,
    }

    impl MarkerHost for Host {
        fn source_cells(&self, cube: CubeId, area: &Area) -> Vec<CellPath> {
            let mut out: Vec<CellPath> = self
                .cells
                .get(&cube)
                .map(|c| c.iter().filter(|p| area.contains(p)).cloned().collect())
                .unwrap_or_default();
            if let Some(m) = self.marks.get(&cube) {
                out.extend(m.marked_in(area));
            }
            out
        }
        fn set_marker(&mut self, cube: CubeId, path: CellPath) -> bool {
            self.marks.entry(cube).or_default().set_marker(path)
        }
        fn clear_markers(&mut self, cube: CubeId) {
            self.marks.entry(cube).or_default().clear();
        }
    }

    fn dim(id: u32, names: &[&str]) -> Arc<Dimension> {
        let mut d = Dimension::new(id, format!("D{}", id));
        for n in names {
            d.add_element(*n, ElementType::Numeric).unwrap();
        }
        Arc::new(d)
    }

    fn rule(expression: RuleExpr, target: Area) -> Rule {
        let mut list = RuleList::new();
        let def = RuleDefinition {
            definition: String::new(),
            expression,
            target,
            scope: RuleScope::BaseOnly,
            uses_markers: true,
            external_id: None,
            comment: None,
        };
        let id = list.create(None, def, true, None).unwrap();
        list.find(id).unwrap().clone()
    }

    #[test]
    fn test_permutation_and_fan_out() {
        // to cube T[A,B] = S[A] (source has one dim shared with T's first)
        let a = dim(0, &["a0", "a1"]);
        let b = dim(1, &["b0", "b1", "b2"]);
        let to_dims = vec![a.clone(), b.clone()];
        let r = rule(
            RuleExpr::reference(Some(2), vec![SourceCoordinate::Variable(0)]),
            Area::all(2),
        );
        let source_dims: Arc<[Arc<Dimension>]> = vec![a.clone()].into();
        let markers = build_rule_markers(1, &to_dims, &r, &|c| (c == 2).then(|| source_dims.clone())).unwrap();
        assert_eq!(markers.len(), 1);
        let m = &markers[0];
        assert!(m.is_multiplicating());
        assert_eq!(m.multiplicating_dimensions(), vec![false, true]);
        assert_eq!(m.target_paths(&[1]).len(), 3);
    }

    #[test]
    fn test_fixed_target_and_chained_propagation() {
        let a = dim(0, &["a0", "a1"]);
        let dims = vec![a.clone()];
        let dims_arc: Arc<[Arc<Dimension>]> = dims.clone().into();
        let mut engine = MarkerEngine::new(Arc::new(CubeConfig::default()));
        let mut host = Host::default();
        host.cells.insert(1, vec![CellPath::from_slice(&[0])]);

        // cube 2: ['a1'] = cube1['a0'] ; cube 3: [] = cube2[!a]
        let r2 = rule(
            RuleExpr::reference(Some(1), vec![SourceCoordinate::Element(0)]),
            Area::from_path(&[1]),
        );
        let r3 = rule(
            RuleExpr::reference(Some(2), vec![SourceCoordinate::Variable(0)]),
            Area::all(1),
        );
        let m2 = build_rule_markers(2, &dims, &r2, &|_| Some(dims_arc.clone())).unwrap();
        assert_eq!(m2[0].permutations, vec![Permutation::Fixed(1)]);
        let m3 = build_rule_markers(3, &dims, &r3, &|_| Some(dims_arc.clone())).unwrap();
        engine.add_markers(m3, &mut host);
        let marked = engine.add_markers(m2, &mut host);
        // cube2 [a1] marked, which in turn marks cube3 [a1]
        assert_eq!(marked, 2);
        assert!(host.marks[&3].is_marked(&[1]));

        // a new source cell that is not in the from area does nothing
        assert_eq!(engine.on_write(1, &[1], &mut host), 0);
    }

    #[test]
    fn test_deletions_defer_then_force_rebuild() {
        let a = dim(0, &["a0", "a1"]);
        let dims = vec![a.clone()];
        let dims_arc: Arc<[Arc<Dimension>]> = dims.clone().into();
        let mut config = CubeConfig::default();
        config.marker_rebuild_limit = 1;
        let mut engine = MarkerEngine::new(Arc::new(config));
        let mut host = Host::default();
        host.cells.insert(1, vec![CellPath::from_slice(&[0]), CellPath::from_slice(&[1])]);
        let r = rule(
            RuleExpr::reference(Some(1), vec![SourceCoordinate::Variable(0)]),
            Area::all(1),
        );
        let markers = build_rule_markers(2, &dims, &r, &|_| Some(dims_arc.clone())).unwrap();
        engine.add_markers(markers, &mut host);
        assert_eq!(host.marks[&2].len(), 2);

        host.cells.insert(1, vec![CellPath::from_slice(&[1])]);
        let gone = vec![CellPath::from_slice(&[0])];
        assert!(!engine.on_deletions(1, &gone, &mut host));
        assert!(engine.needs_rebuild(2));
        // stale mark kept until the rebuild
        assert_eq!(host.marks[&2].len(), 2);

        host.cells.insert(1, Vec::new());
        let gone = vec![CellPath::from_slice(&[1])];
        assert!(engine.on_deletions(1, &gone, &mut host));
        assert!(host.marks[&2].is_empty());
        assert!(!engine.needs_rebuild(2));
    }

    #[test]
    fn test_remove_rule_markers() {
        let a = dim(0, &["a0"]);
        let dims = vec![a.clone()];
        let dims_arc: Arc<[Arc<Dimension>]> = dims.clone().into();
        let mut engine = MarkerEngine::new(Arc::new(CubeConfig::default()));
        let mut host = Host::default();
        host.cells.insert(1, vec![CellPath::from_slice(&[0])]);
        let r = rule(RuleExpr::reference(Some(1), vec![SourceCoordinate::Variable(0)]), Area::all(1));
        let markers = build_rule_markers(2, &dims, &r, &|_| Some(dims_arc.clone())).unwrap();
        engine.add_markers(markers, &mut host);
        assert!(engine.has_from_markers(1));
        engine.remove_rule_markers(2, r.id, &mut host);
        assert!(engine.is_empty());
        assert!(host.marks[&2].is_empty());
    }
}
