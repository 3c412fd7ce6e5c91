//! FILENAME: core/engine/src/database.rs
//! PURPOSE: A set of cubes over shared dimensions, with cross-cube rule
//! dependencies kept up to date.
//! CONTEXT: The database owns the `MarkerEngine`. Every mutating call runs the
//! cube operation with the other cubes available for rule reads, then settles
//! marker propagation from the committed changes. Deferred marker rebuilds run
//! before the next read.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::area::Area;
use crate::cell::{CellPath, CellReading, CellTypes, CellValue, CubeId, ElementId, LockId, RuleId};
use crate::config::CubeConfig;
use crate::cube::{BulkOptions, BulkResult, CopyValue, Cube, WriteOptions, WriteOutcome};
use crate::dimension::Dimension;
use crate::error::{EngineError, Result};
use crate::goal_seek::GoalSeekKind;
use crate::marker::{build_rule_markers, MarkerEngine, MarkerHost};
use crate::plan::{CellStream, RulesMode};
use crate::rights::{AllowAll, RightsChecker};
use crate::rule::{Rule, RuleDefinition};
use crate::snapshot::{CubeResolver, CubeView};
use crate::{log_debug, log_info};

/// Marker access to the cubes of a database.
struct CubeHost<'a> {
    cubes: &'a mut BTreeMap<CubeId, Cube>,
}

impl MarkerHost for CubeHost<'_> {
    fn source_cells(&self, cube: CubeId, area: &Area) -> Vec<CellPath> {
        let Some(cube) = self.cubes.get(&cube) else {
            return Vec::new();
        };
        let snapshot = cube.snapshot();
        let mut cells: Vec<CellPath> = snapshot.numeric.scan(area).into_iter().map(|(p, _)| p).collect();
        cells.extend(snapshot.markers.marked_in(area));
        cells
    }

    fn set_marker(&mut self, cube: CubeId, path: CellPath) -> bool {
        match self.cubes.get_mut(&cube) {
            Some(cube) if !cube.is_marked(&path) => cube.snapshot_mut().markers.set_marker(path),
            _ => false,
        }
    }

    fn clear_markers(&mut self, cube: CubeId) {
        if let Some(cube) = self.cubes.get_mut(&cube) {
            cube.snapshot_mut().markers.clear();
        }
    }
}

pub struct Database {
    name: String,
    config: Arc<CubeConfig>,
    dimensions: Vec<Arc<Dimension>>,
    cubes: BTreeMap<CubeId, Cube>,
    cube_names: FxHashMap<String, CubeId>,
    markers: MarkerEngine,
    rights: Arc<dyn RightsChecker>,
    next_cube_id: CubeId,
}

impl CubeResolver for Database {
    fn resolve(&self, id: CubeId) -> Option<CubeView> {
        self.cubes.get(&id).filter(|c| c.is_loaded()).map(|c| c.view())
    }
}

impl Database {
    pub fn new(name: impl Into<String>, config: CubeConfig) -> Self {
        let config = Arc::new(config);
        Database {
            name: name.into(),
            markers: MarkerEngine::new(Arc::clone(&config)),
            config,
            dimensions: Vec::new(),
            cubes: BTreeMap::new(),
            cube_names: FxHashMap::default(),
            rights: Arc::new(AllowAll),
            next_cube_id: 1,
        }
    }

    pub fn with_rights(mut self, rights: Arc<dyn RightsChecker>) -> Self {
        self.rights = rights;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Arc<CubeConfig> {
        &self.config
    }

    pub fn markers(&self) -> &MarkerEngine {
        &self.markers
    }

    // ========================================================================
    // DIMENSIONS AND CUBES
    // ========================================================================

    pub fn add_dimension(&mut self, dimension: Dimension) -> Result<Arc<Dimension>> {
        if self.dimensions.iter().any(|d| d.name == dimension.name || d.id == dimension.id) {
            return Err(EngineError::InvalidCoordinates(format!(
                "dimension '{}' already exists",
                dimension.name
            )));
        }
        let dimension = Arc::new(dimension);
        self.dimensions.push(Arc::clone(&dimension));
        Ok(dimension)
    }

    pub fn dimension(&self, name: &str) -> Result<&Arc<Dimension>> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| EngineError::DimensionNotFound(name.to_string()))
    }

    pub fn create_cube(&mut self, name: &str, dimensions: &[&str]) -> Result<CubeId> {
        let dims = dimensions
            .iter()
            .map(|n| self.dimension(n).map(Arc::clone))
            .collect::<Result<Vec<_>>>()?;
        let id = self.next_cube_id;
        let cube = Cube::new(id, name, dims, Arc::clone(&self.config));
        self.insert_cube(cube)
    }

    /// Adds a cube built elsewhere (cube file load). The cube keeps its id.
    pub fn insert_cube(&mut self, cube: Cube) -> Result<CubeId> {
        let id = cube.id();
        if self.cubes.contains_key(&id) || self.cube_names.contains_key(cube.name()) {
            return Err(EngineError::InvalidCoordinates(format!("cube '{}' already exists", cube.name())));
        }
        let cube = cube.with_rights(Arc::clone(&self.rights));
        self.next_cube_id = self.next_cube_id.max(id + 1);
        self.cube_names.insert(cube.name().to_string(), id);
        self.cubes.insert(id, cube);
        log_info!("CUBE", "cube '{}' ({}) added to '{}'", self.cubes[&id].name(), id, self.name);
        Ok(id)
    }

    pub fn remove_cube(&mut self, id: CubeId) -> Result<Cube> {
        let cube = self.cubes.remove(&id).ok_or_else(|| EngineError::CubeNotFound(id.to_string()))?;
        self.cube_names.remove(cube.name());
        self.markers.remove_cube(id);
        Ok(cube)
    }

    pub fn cube(&self, id: CubeId) -> Result<&Cube> {
        self.cubes.get(&id).ok_or_else(|| EngineError::CubeNotFound(id.to_string()))
    }

    pub fn cube_mut(&mut self, id: CubeId) -> Result<&mut Cube> {
        self.cubes.get_mut(&id).ok_or_else(|| EngineError::CubeNotFound(id.to_string()))
    }

    pub fn cube_id(&self, name: &str) -> Result<CubeId> {
        self.cube_names
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::CubeNotFound(name.to_string()))
    }

    pub fn cubes(&self) -> impl Iterator<Item = &Cube> {
        self.cubes.values()
    }

    /// Runs `f` on a cube while the remaining cubes serve rule reads.
    fn with_cube<T>(&mut self, id: CubeId, f: impl FnOnce(&mut Cube, &dyn CubeResolver) -> Result<T>) -> Result<T> {
        let mut cube = self.cubes.remove(&id).ok_or_else(|| EngineError::CubeNotFound(id.to_string()))?;
        let result = f(&mut cube, &*self);
        self.cubes.insert(id, cube);
        result
    }

    // ========================================================================
    // MARKERS
    // ========================================================================

    /// Propagates committed changes of `cube` to the marker storages.
    fn settle(&mut self, cube: CubeId, outcome: &WriteOutcome) {
        if outcome.replaced {
            self.markers.invalidate_source(cube);
            self.markers.schedule_rebuild(cube);
            return;
        }
        if !self.markers.has_from_markers(cube) {
            return;
        }
        let mut host = CubeHost { cubes: &mut self.cubes };
        let mut marked = 0;
        for path in outcome.written_paths() {
            marked += self.markers.on_write(cube, path, &mut host);
        }
        let deleted = outcome.deleted_paths();
        let rebuilt = self.markers.on_deletions(cube, &deleted, &mut host);
        if marked > 0 || rebuilt {
            log_debug!("MARKER", "write to cube {} marked {} cells{}", cube, marked, if rebuilt { ", rebuilt" } else { "" });
        }
    }

    fn run_pending_rebuilds(&mut self) {
        if self.markers.has_pending_rebuilds() {
            let mut host = CubeHost { cubes: &mut self.cubes };
            self.markers.rebuild_pending(&mut host);
        }
    }

    /// Clears and regenerates the marks of a cube.
    pub fn rebuild_markers(&mut self, cube: CubeId) -> Result<()> {
        self.cube(cube)?;
        let mut host = CubeHost { cubes: &mut self.cubes };
        self.markers.rebuild_cube(cube, &mut host);
        Ok(())
    }

    fn add_rule_markers(&mut self, cube_id: CubeId, rule_id: RuleId) -> Result<()> {
        let markers = {
            let cube = self.cube(cube_id)?;
            let rule = cube.rule(rule_id)?;
            if !rule.active || !rule.definition.uses_markers {
                return Ok(());
            }
            let dims_of = |id: CubeId| self.cubes.get(&id).map(|c| Arc::clone(c.dimensions()));
            build_rule_markers(cube_id, cube.dimensions(), rule, &dims_of)?
        };
        let mut host = CubeHost { cubes: &mut self.cubes };
        let marked = self.markers.add_markers(markers, &mut host);
        log_debug!("MARKER", "rule {} of cube {} marked {} cells", rule_id, cube_id, marked);
        Ok(())
    }

    fn remove_rule_markers(&mut self, cube_id: CubeId, rule_id: RuleId) {
        let mut host = CubeHost { cubes: &mut self.cubes };
        self.markers.remove_rule_markers(cube_id, rule_id, &mut host);
    }

    /// Registers the markers of every active marker rule of a cube (after loading it).
    pub fn register_markers(&mut self, cube_id: CubeId) -> Result<()> {
        let ids: Vec<RuleId> = self.cube(cube_id)?.rules().map(|r| r.id).collect();
        for id in ids {
            self.remove_rule_markers(cube_id, id);
            self.add_rule_markers(cube_id, id)?;
        }
        Ok(())
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn get_cell_value(&mut self, cube: CubeId, path: &[ElementId], rules: RulesMode, user: &str) -> Result<CellReading> {
        self.run_pending_rebuilds();
        let db: &Database = self;
        db.cube(cube)?.get_cell_value(path, rules, user, db)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_cell_values(
        &mut self,
        cube: CubeId,
        area: &Area,
        types: CellTypes,
        rules: RulesMode,
        skip_empty: bool,
        block_size: Option<usize>,
        user: &str,
    ) -> Result<CellStream> {
        self.run_pending_rebuilds();
        let db: &Database = self;
        db.cube(cube)?
            .get_cell_values(area, types, rules, skip_empty, block_size, user, db)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub fn set_cell_value(
        &mut self,
        cube: CubeId,
        path: &[ElementId],
        value: CellValue,
        held: &[CellPath],
        user: &str,
        options: WriteOptions,
    ) -> Result<WriteOutcome> {
        let outcome = self.with_cube(cube, |c, others| c.set_cell_value(path, value, held, user, options, others))?;
        self.settle(cube, &outcome);
        Ok(outcome)
    }

    pub fn set_cell_values(
        &mut self,
        cube: CubeId,
        cells: Vec<(CellPath, CellValue)>,
        user: &str,
        options: WriteOptions,
        bulk: BulkOptions,
    ) -> Result<BulkResult> {
        let result = self.with_cube(cube, |c, others| c.set_cell_values(cells, user, options, bulk, others))?;
        self.settle(cube, &result.outcome);
        Ok(result)
    }

    pub fn clear_cells(&mut self, cube: CubeId, area: &Area, user: &str) -> Result<WriteOutcome> {
        let outcome = self.with_cube(cube, |c, _| c.clear_cells(area, user))?;
        self.settle(cube, &outcome);
        Ok(outcome)
    }

    pub fn clear_cube(&mut self, cube: CubeId, user: &str) -> Result<WriteOutcome> {
        let outcome = self.with_cube(cube, |c, _| c.clear_cube(user))?;
        self.settle(cube, &outcome);
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_cells(
        &mut self,
        cube: CubeId,
        from: &[ElementId],
        to: &[ElementId],
        value: CopyValue,
        use_rules: bool,
        held: &[CellPath],
        user: &str,
    ) -> Result<WriteOutcome> {
        let outcome = self.with_cube(cube, |c, others| c.copy_cells(from, to, value, use_rules, held, user, others))?;
        self.settle(cube, &outcome);
        Ok(outcome)
    }

    pub fn goal_seek(&mut self, cube: CubeId, path: &[ElementId], value: f64, kind: GoalSeekKind, user: &str) -> Result<WriteOutcome> {
        let outcome = self.with_cube(cube, |c, others| c.goal_seek(path, value, kind, user, others))?;
        self.settle(cube, &outcome);
        Ok(outcome)
    }

    // ========================================================================
    // LOCKS
    // ========================================================================

    pub fn lock(&mut self, cube: CubeId, area: &Area, user: &str) -> Result<LockId> {
        self.cube_mut(cube)?.lock(area, user)
    }

    pub fn lock_cube(&mut self, cube: CubeId, user: &str) -> Result<LockId> {
        self.cube_mut(cube)?.lock_cube(user)
    }

    pub fn commit_lock(&mut self, cube: CubeId, lock: LockId, user: &str) -> Result<()> {
        self.cube_mut(cube)?.commit_lock(lock, user)
    }

    pub fn rollback(&mut self, cube: CubeId, lock: LockId, user: &str, steps: usize) -> Result<WriteOutcome> {
        let outcome = self.cube_mut(cube)?.rollback(lock, user, steps)?;
        self.settle(cube, &outcome);
        Ok(outcome)
    }

    // ========================================================================
    // RULES
    // ========================================================================

    pub fn create_rule(
        &mut self,
        cube: CubeId,
        definition: RuleDefinition,
        active: bool,
        position: Option<f64>,
        user: &str,
    ) -> Result<RuleId> {
        let id = self.cube_mut(cube)?.create_rule(None, definition, active, position, user)?;
        self.add_rule_markers(cube, id)?;
        Ok(id)
    }

    pub fn modify_rule(
        &mut self,
        cube: CubeId,
        id: RuleId,
        definition: RuleDefinition,
        active: Option<bool>,
        position: Option<f64>,
        user: &str,
    ) -> Result<()> {
        self.cube_mut(cube)?.modify_rule(id, definition, active, position, user)?;
        self.remove_rule_markers(cube, id);
        self.add_rule_markers(cube, id)
    }

    pub fn destroy_rule(&mut self, cube: CubeId, id: RuleId, user: &str) -> Result<Rule> {
        let rule = self.cube_mut(cube)?.destroy_rule(id, user)?;
        self.remove_rule_markers(cube, id);
        Ok(rule)
    }

    pub fn activate_rules(&mut self, cube: CubeId, ids: &[RuleId], active: bool, user: &str) -> Result<()> {
        self.cube_mut(cube)?.activate_rules(ids, active, user)?;
        for id in ids {
            self.remove_rule_markers(cube, *id);
            self.add_rule_markers(cube, *id)?;
        }
        Ok(())
    }

    pub fn move_rule(&mut self, cube: CubeId, id: RuleId, position: f64, user: &str) -> Result<()> {
        self.cube_mut(cube)?.move_rule(id, position, user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::ElementSet;
    use crate::dimension::ElementType;
    use crate::rule::{RuleExpr, RuleScope, SourceCoordinate};

    // Product: P1=0, P2=1, All=2; Month: Jan=0, Feb=1
    fn database() -> (Database, CubeId, CubeId) {
        let mut db = Database::new("demo", CubeConfig::default());
        let mut product = Dimension::new(0, "Product");
        let p1 = product.add_element("P1", ElementType::Numeric).unwrap();
        let p2 = product.add_element("P2", ElementType::Numeric).unwrap();
        let all = product.add_element("All", ElementType::Consolidated).unwrap();
        product.add_child(all, p1, 1.0).unwrap();
        product.add_child(all, p2, 1.0).unwrap();
        let mut month = Dimension::new(1, "Month");
        month.add_element("Jan", ElementType::Numeric).unwrap();
        month.add_element("Feb", ElementType::Numeric).unwrap();
        db.add_dimension(product).unwrap();
        db.add_dimension(month).unwrap();
        let sales = db.create_cube("Sales", &["Product", "Month"]).unwrap();
        let plan = db.create_cube("Plan", &["Product", "Month"]).unwrap();
        (db, sales, plan)
    }

    /// Plan[p, m] = Sales[p, m], enumerated through markers.
    fn mirror_rule(source: CubeId) -> RuleDefinition {
        RuleDefinition {
            definition: "[] = PALO.DATA(\"Sales\", !'Product', !'Month')".to_string(),
            expression: RuleExpr::reference(
                Some(source),
                vec![SourceCoordinate::Variable(0), SourceCoordinate::Variable(1)],
            ),
            target: Area::all(2),
            scope: RuleScope::BaseOnly,
            uses_markers: true,
            external_id: None,
            comment: None,
        }
    }

    #[test]
    fn test_cross_cube_rule_reads_other_cube() {
        let (mut db, sales, plan) = database();
        db.set_cell_value(sales, &[0, 0], CellValue::Number(7.0), &[], "admin", WriteOptions::default())
            .unwrap();
        db.create_rule(plan, mirror_rule(sales), true, None, "admin").unwrap();
        let reading = db.get_cell_value(plan, &[0, 0], RulesMode::AllRules, "admin").unwrap();
        assert_eq!(reading.value, CellValue::Number(7.0));
        assert!(db.cube(plan).unwrap().is_marked(&[0, 0]));
    }

    #[test]
    fn test_writes_mark_and_deletions_rebuild() {
        let (mut db, sales, plan) = database();
        db.create_rule(plan, mirror_rule(sales), true, None, "admin").unwrap();
        assert_eq!(db.cube(plan).unwrap().marked_count(), 0);

        db.set_cell_value(sales, &[1, 1], CellValue::Number(3.0), &[], "admin", WriteOptions::default())
            .unwrap();
        assert!(db.cube(plan).unwrap().is_marked(&[1, 1]));

        let area = Area::from_sets(vec![ElementSet::from([2]), ElementSet::new()]);
        let values: Vec<_> = db
            .get_cell_values(plan, &area, CellTypes::ALL, RulesMode::AllRules, true, None, "admin")
            .unwrap()
            .collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, CellValue::Number(3.0));

        db.clear_cube(sales, "admin").unwrap();
        assert!(db.markers().needs_rebuild(plan));
        db.get_cell_value(plan, &[1, 1], RulesMode::AllRules, "admin").unwrap();
        assert_eq!(db.cube(plan).unwrap().marked_count(), 0);
    }

    #[test]
    fn test_rule_deactivation_drops_marks() {
        let (mut db, sales, plan) = database();
        db.set_cell_value(sales, &[0, 1], CellValue::Number(1.0), &[], "admin", WriteOptions::default())
            .unwrap();
        let id = db.create_rule(plan, mirror_rule(sales), true, None, "admin").unwrap();
        assert_eq!(db.cube(plan).unwrap().marked_count(), 1);
        db.activate_rules(plan, &[id], false, "admin").unwrap();
        assert_eq!(db.cube(plan).unwrap().marked_count(), 0);
        db.activate_rules(plan, &[id], true, "admin").unwrap();
        assert_eq!(db.cube(plan).unwrap().marked_count(), 1);
        db.destroy_rule(plan, id, "admin").unwrap();
        assert!(db.markers().is_empty());
    }

    #[test]
    fn test_unknown_cube() {
        let (mut db, _, _) = database();
        assert!(matches!(db.cube(99), Err(EngineError::CubeNotFound(_))));
        assert!(matches!(db.create_cube("X", &["Nope"]), Err(EngineError::DimensionNotFound(_))));
        assert!(db
            .set_cell_value(42, &[0, 0], CellValue::Number(1.0), &[], "admin", WriteOptions::default())
            .is_err());
    }
}
