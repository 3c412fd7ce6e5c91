//! FILENAME: core/engine/src/cube/goal_seek.rs
//! PURPOSE: Goal seek on a cube cell: force a value and rebalance the siblings.
//! CONTEXT: For every dimension the siblings of the path element (children of
//! its single parent) form one axis. Equal and Relative move the delta onto
//! the sibling cells of each axis; Complete hands the whole grid to the
//! linear solver in `crate::goal_seek`. All writes form one rollback step.

use std::time::Duration;

use super::{Cube, WriteOptions, WriteOutcome};
use crate::area::{cartesian, Area};
use crate::cell::{CellPath, CellValue, ElementId, PathType};
use crate::dimension::ElementType;
use crate::error::{EngineError, Result};
use crate::goal_seek::{solve, GoalSeekKind, GoalSeekProblem};
use crate::journal::JournalCommand;
use crate::plan::RulesMode;
use crate::rights::Right;
use crate::snapshot::CubeResolver;
use crate::storage::CellChange;
use crate::{log_debug, log_info};

/// Sibling axis of one dimension.
struct Axis {
    dim: usize,
    /// Siblings with their weight in the common parent.
    elements: Vec<(ElementId, f64)>,
    /// Position of the path element in `elements`.
    position: usize,
}

impl Cube {
    pub fn goal_seek(
        &mut self,
        path: &[ElementId],
        value: f64,
        kind: GoalSeekKind,
        user: &str,
        others: &dyn CubeResolver,
    ) -> Result<WriteOutcome> {
        self.ensure_loaded()?;
        let path = CellPath::from_slice(path);
        if self.classify(&path)? == PathType::BaseString {
            return Err(EngineError::ElementTypeMismatch(format!("cannot goal seek string cell {:?}", path)));
        }
        self.check_right(user, &Area::from_path(&path), Right::Splash)?;
        let axes = self.sibling_axes(&path)?;

        let targets = match kind {
            GoalSeekKind::Complete => self.complete_targets(&path, value, &axes, others)?,
            GoalSeekKind::Equal | GoalSeekKind::Relative => self.delta_targets(&path, value, kind, &axes, others)?,
        };
        log_debug!("GOALSEEK", "{:?} = {} in '{}': {} cells to write", path, value, self.name, targets.len());

        self.locks.begin_step(user);
        let result = self.write_targets(targets, user, others);
        self.locks.end_step(user);
        let outcome = result?;
        log_info!("GOALSEEK", "{:?} goal seek on {:?} in '{}' done", kind, path, self.name);
        self.write_journal(user, JournalCommand::CellGoalseek { path, value, kind });
        Ok(outcome)
    }

    /// One axis per dimension whose element has siblings. An element with
    /// more than one parent makes the sibling line ambiguous.
    fn sibling_axes(&self, path: &CellPath) -> Result<Vec<Axis>> {
        let mut axes = Vec::new();
        for (i, (dim, element)) in self.dimensions.iter().zip(path.iter()).enumerate() {
            let parents = dim.parents(*element)?;
            if parents.len() > 1 {
                return Err(EngineError::GoalSeek(format!(
                    "element {} of '{}' has {} parents",
                    element,
                    dim.name,
                    parents.len()
                )));
            }
            let Some(parent) = parents.first() else {
                continue;
            };
            let mut elements = Vec::new();
            for (child, weight) in dim.children(*parent)? {
                if dim.element_type(*child)? != ElementType::String {
                    elements.push((*child, *weight));
                }
            }
            if elements.len() < 2 {
                continue;
            }
            let Some(position) = elements.iter().position(|(e, _)| e == element) else {
                continue;
            };
            axes.push(Axis { dim: i, elements, position });
        }
        Ok(axes)
    }

    /// Equal/Relative: the target takes the value, the siblings on each axis absorb the difference.
    fn delta_targets(
        &self,
        path: &CellPath,
        value: f64,
        kind: GoalSeekKind,
        axes: &[Axis],
        others: &dyn CubeResolver,
    ) -> Result<Vec<(CellPath, f64)>> {
        let original = self.read_number(path, RulesMode::AllRules, others)?;
        let delta = original - value;
        let mut targets = vec![(path.clone(), value)];
        for axis in axes {
            let own_weight = axis.elements[axis.position].1;
            let mut siblings = Vec::with_capacity(axis.elements.len() - 1);
            for (i, (element, weight)) in axis.elements.iter().enumerate() {
                if i == axis.position {
                    continue;
                }
                let mut sibling = path.clone();
                sibling[axis.dim] = *element;
                let current = self.read_number(&sibling, RulesMode::AllRules, others)?;
                siblings.push((sibling, *weight, current));
            }
            let sum: f64 = match kind {
                GoalSeekKind::Relative => siblings.iter().map(|(_, w, v)| w * v).sum(),
                _ => siblings.iter().map(|(_, w, _)| w).sum(),
            };
            if sum == 0.0 {
                return Err(EngineError::GoalSeek(format!(
                    "siblings of {:?} along dimension {} sum to zero",
                    path, axis.dim
                )));
            }
            for (sibling, _, current) in siblings {
                let share = match kind {
                    GoalSeekKind::Relative => delta * own_weight * current / sum,
                    _ => delta * own_weight / sum,
                };
                targets.push((sibling, current + share));
            }
        }
        Ok(targets)
    }

    /// Complete: solve the grid spanned by all axes so every line keeps its total.
    fn complete_targets(
        &self,
        path: &CellPath,
        value: f64,
        axes: &[Axis],
        others: &dyn CubeResolver,
    ) -> Result<Vec<(CellPath, f64)>> {
        if axes.is_empty() {
            return Ok(vec![(path.clone(), value)]);
        }
        let cell_count: usize = axes.iter().map(|a| a.elements.len()).product();
        if cell_count > self.config.goalseek_cell_limit {
            return Err(EngineError::CouldNotConverge(format!(
                "{} cells exceed the goal-seek limit of {}",
                cell_count, self.config.goalseek_cell_limit
            )));
        }

        let coordinates: Vec<Vec<ElementId>> = axes.iter().map(|a| a.elements.iter().map(|(e, _)| *e).collect()).collect();
        let mut paths = Vec::with_capacity(cell_count);
        let mut values = Vec::with_capacity(cell_count);
        for combination in cartesian(&coordinates) {
            let mut cell = path.clone();
            for (axis, element) in axes.iter().zip(combination.iter()) {
                cell[axis.dim] = *element;
            }
            values.push(self.read_number(&cell, RulesMode::AllRules, others)?);
            paths.push(cell);
        }

        let problem = GoalSeekProblem {
            weights: axes.iter().map(|a| a.elements.iter().map(|(_, w)| *w).collect()).collect(),
            values,
            fixed: axes.iter().map(|a| a.position).collect(),
            fixed_value: value,
        };
        let timeout = match self.config.goalseek_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let solution = solve(&problem, timeout)?;
        Ok(paths
            .into_iter()
            .zip(solution)
            .zip(problem.values.iter())
            .filter(|((_, new), old)| (new - *old).abs() > f64::EPSILON * old.abs().max(1.0))
            .map(|((p, new), _)| (p, new))
            .collect())
    }

    /// Writes the computed values one by one; consolidated targets are splashed.
    /// A failing target undoes the ones already written, so the goal seek
    /// changes all cells or none.
    fn write_targets(&mut self, targets: Vec<(CellPath, f64)>, user: &str, others: &dyn CubeResolver) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        let options = WriteOptions { check_area: false, write_journal: false, ..WriteOptions::default() };
        let commit = self.commit_options();
        for (path, value) in targets {
            let written = self
                .classify(&path)
                .and_then(|path_type| self.cell_writes(&path, path_type, &CellValue::Number(value), &[], user, options, others))
                .and_then(|writes| self.apply(writes, commit, user, false));
            match written {
                Ok(step) => outcome.merge(step),
                Err(e) => {
                    let count = outcome.numeric.len() + outcome.text.len();
                    log_debug!("GOALSEEK", "target {:?} of '{}' failed ({}), undoing {} cells", path, self.name, e, count);
                    self.undo(&outcome, user);
                    return Err(e);
                }
            }
        }
        let changes: Vec<CellChange> = outcome.numeric.iter().chain(outcome.text.iter()).cloned().collect();
        if let Err(e) = self.locks.record_changes(&changes, user) {
            self.undo(&outcome, user);
            return Err(e);
        }
        Ok(outcome)
    }
}
