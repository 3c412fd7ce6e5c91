//! FILENAME: core/engine/src/cube/copy.rs
//! PURPOSE: Copy/like: write the base cells below one cell onto the base cells below another.
//! CONTEXT: Source and target are paired dimension by dimension. Equal
//! elements map onto themselves, consolidated pairs map child by child and
//! base pairs map directly. The source plan is run through a Transformation
//! node with the resulting multimaps and a scale factor.

use serde::{Deserialize, Serialize};

use super::{Cube, WriteOutcome};
use crate::cell::{CellPath, CellTypes, CellValue, ElementId, PathType, StorageKind};
use crate::dimension::{Dimension, ElementType};
use crate::error::{EngineError, Result};
use crate::journal::JournalCommand;
use crate::plan::{ElementMultiMap, Plan, PlanNode, Planner, RulesMode};
use crate::rights::Right;
use crate::snapshot::{CubeResolver, OverlayResolver};
use crate::storage::{StagedWrite, WriteMode};
use crate::{log_debug, log_info};

/// Scaling of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CopyValue {
    /// Multiply every source value by this factor.
    Factor(f64),
    /// Scale so that the target aggregate becomes this value.
    Value(f64),
}

/// Pairs `source` with `target` below one dimension.
fn pair_elements(dim: &Dimension, source: ElementId, target: ElementId, map: &mut ElementMultiMap) -> Result<()> {
    let source_type = dim.element_type(source)?;
    let target_type = dim.element_type(target)?;
    match (source_type, target_type) {
        (ElementType::Consolidated, ElementType::Consolidated) => {
            let from = dim.children(source)?;
            let to = dim.children(target)?;
            if from.len() != to.len() {
                return Err(EngineError::CopyNotPossible(format!(
                    "elements {} and {} of '{}' have {} and {} children",
                    source,
                    target,
                    dim.name,
                    from.len(),
                    to.len()
                )));
            }
            for ((s, _), (t, _)) in from.iter().zip(to.iter()) {
                if s == t {
                    for base in dim.base_elements(*s)?.into_keys() {
                        map.entry(base).or_default().push(base);
                    }
                } else {
                    pair_elements(dim, *s, *t, map)?;
                }
            }
            Ok(())
        }
        (ElementType::Numeric, ElementType::Numeric) => {
            map.entry(source).or_default().push(target);
            Ok(())
        }
        // string children of consolidations carry no numeric value
        (ElementType::String, ElementType::String) => Ok(()),
        _ => Err(EngineError::ElementTypeMismatch(format!(
            "cannot copy element {} ({:?}) of '{}' onto {} ({:?})",
            source, source_type, dim.name, target, target_type
        ))),
    }
}

impl Cube {
    /// Copies the cells below `from` onto the cells below `to`.
    ///
    /// With `CopyValue::Value(v)` the values are scaled by `v / value(from)`;
    /// a zero source is only accepted for `v == 0`, which clears the target.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_cells(
        &mut self,
        from: &[ElementId],
        to: &[ElementId],
        value: CopyValue,
        use_rules: bool,
        held: &[CellPath],
        user: &str,
        others: &dyn CubeResolver,
    ) -> Result<WriteOutcome> {
        self.ensure_loaded()?;
        let from = CellPath::from_slice(from);
        let to = CellPath::from_slice(to);
        let from_type = self.classify(&from)?;
        let to_type = self.classify(&to)?;
        if from_type == PathType::BaseString || to_type == PathType::BaseString {
            return Err(EngineError::ElementTypeMismatch("copy needs numeric cells".to_string()));
        }
        if from == to {
            return Err(EngineError::CopyNotPossible("source and target are the same cell".to_string()));
        }
        let source_area = self.held_area(&from)?;
        let target_area = self.held_area(&to)?;
        if source_area.intersects(&target_area) {
            return Err(EngineError::CopyNotPossible(format!("{:?} and {:?} overlap", from, to)));
        }
        self.check_right(user, &source_area, Right::Read)?;
        let target_right = if to_type == PathType::Consolidated { Right::Splash } else { Right::Write };
        self.check_right(user, &target_area, target_right)?;

        let mut maps = Vec::with_capacity(self.dim_count());
        for (dim, (s, t)) in self.dimensions.iter().zip(from.iter().zip(to.iter())) {
            if s == t {
                maps.push(None);
            } else {
                let mut map = ElementMultiMap::default();
                pair_elements(dim, *s, *t, &mut map)?;
                maps.push(Some(map));
            }
        }

        let rules = if use_rules { RulesMode::AllRules } else { RulesMode::NoRules };
        let factor = match value {
            CopyValue::Factor(f) => f,
            CopyValue::Value(v) => {
                let source = self.read_number(&from, rules, others)?;
                if source == 0.0 {
                    if v != 0.0 {
                        return Err(EngineError::CopyNotPossible(format!(
                            "source {:?} is zero, cannot scale to {}",
                            from, v
                        )));
                    }
                    0.0
                } else {
                    v / source
                }
            }
        };
        self.locks.lookup(&to, Some(&target_area), user)?;

        let view = self.view();
        let source_plan = Planner::new(&view).create_plan(&source_area, CellTypes::BASE_NUMERIC, rules, true, None)?;
        let plan = Plan {
            root: PlanNode::Transformation { child: Box::new(source_plan.root), maps, factor },
            rules,
            skip_empty: true,
            block_size: None,
        };
        let resolver = OverlayResolver { own: view.clone(), others };
        let ctx = self.eval_context(&resolver);
        let results: Vec<_> = plan.evaluate(&view, &ctx)?.collect();

        let mut held_areas = Vec::with_capacity(held.len());
        for cell in held {
            held_areas.push(self.held_area(cell)?);
        }
        let is_held = |p: &[ElementId]| held_areas.iter().any(|a| a.contains(p));

        let mut writes = Vec::new();
        for (path, _) in self.data.numeric.scan(&target_area) {
            if !is_held(&path) {
                writes.push((StorageKind::Numeric, StagedWrite::Cell { path, value: CellValue::Empty, mode: WriteMode::Set }));
            }
        }
        let mut skipped = 0usize;
        for entry in results {
            if is_held(&entry.path) {
                continue;
            }
            let value = match entry.value {
                CellValue::Number(n) => CellValue::Number(n),
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            writes.push((StorageKind::Numeric, StagedWrite::Cell { path: entry.path, value, mode: WriteMode::Set }));
        }
        if skipped > 0 {
            log_debug!("COPY", "{} non-numeric source values not copied", skipped);
        }

        self.locks.begin_step(user);
        let result = self.apply(writes, self.commit_options(), user, true);
        self.locks.end_step(user);
        let outcome = result?;
        log_info!(
            "COPY",
            "copied {:?} -> {:?} in '{}' (factor {}), {} cells changed",
            from,
            to,
            self.name,
            factor,
            outcome.numeric.len()
        );
        self.write_journal(user, JournalCommand::CellCopy { from, to, value, use_rules });
        Ok(outcome)
    }
}
