//! FILENAME: core/engine/src/goal_seek.rs
//! PURPOSE: Linear solver behind the "complete" goal-seek strategy.
//! CONTEXT: The cells of a goal-seek slice form a dense grid: one axis per
//! dimension whose element has siblings. Every line of the grid (all siblings
//! along one axis, other coordinates fixed) must keep its weighted total while
//! one cell is forced to a new value. The system is reduced to echelon form;
//! variables it leaves free are estimated from the relative change of the
//! fixed cell and the system is solved again.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

const EPS: f64 = 1e-7;
/// Above this many variables free variables get the single-path estimate.
const SIMPLE_ESTIMATE_THRESHOLD: usize = 50;

/// Reallocation strategy of a goal seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GoalSeekKind {
    /// Solve for every sibling combination, keeping all line totals.
    #[default]
    Complete,
    /// Spread the delta evenly (by weight) over the siblings.
    Equal,
    /// Spread the delta proportionally to the siblings' current values.
    Relative,
}

fn zero(a: f64) -> bool {
    a.abs() < EPS
}

fn equal(a: f64, b: f64) -> bool {
    zero(a - b)
}

/// Input of the complete solver.
#[derive(Debug, Clone)]
pub struct GoalSeekProblem {
    /// Per axis: weight of each sibling element.
    pub weights: Vec<Vec<f64>>,
    /// Current values, row-major over the axis sizes (last axis fastest).
    pub values: Vec<f64>,
    /// Grid coordinate of the cell being forced.
    pub fixed: Vec<usize>,
    pub fixed_value: f64,
}

impl GoalSeekProblem {
    pub fn cell_count(&self) -> usize {
        self.weights.iter().map(|w| w.len()).product()
    }

    pub fn index(&self, coord: &[usize]) -> usize {
        coord
            .iter()
            .zip(self.weights.iter())
            .fold(0, |acc, (c, w)| acc * w.len() + c)
    }

    pub fn coords(&self, mut index: usize) -> Vec<usize> {
        let mut coord = vec![0; self.weights.len()];
        for d in (0..self.weights.len()).rev() {
            let len = self.weights[d].len();
            coord[d] = index % len;
            index /= len;
        }
        coord
    }
}

struct Solver<'a> {
    p: &'a GoalSeekProblem,
    /// Weighted sum of all cells per axis element.
    element_sums: Vec<Vec<f64>>,
    /// Augmented matrix, last column is the right-hand side.
    m: Vec<Vec<f64>>,
    variable: Vec<f64>,
    variable_set: Vec<bool>,
    deadline: Option<Instant>,
}

impl<'a> Solver<'a> {
    fn new(p: &'a GoalSeekProblem, timeout: Option<Duration>) -> Self {
        let n = p.values.len();
        let mut element_sums: Vec<Vec<f64>> = p.weights.iter().map(|w| vec![0.0; w.len()]).collect();
        let mut lines: Vec<BTreeMap<usize, Vec<f64>>> = vec![BTreeMap::new(); p.weights.len()];

        for cell in 0..n {
            let mut coord = p.coords(cell);
            let value = p.values[cell];
            for d in 0..coord.len() {
                let element = coord[d];
                coord[d] = 0;
                let start = p.index(&coord);
                coord[d] = element;
                let row = lines[d].entry(start).or_insert_with(|| vec![0.0; n + 1]);
                let weight = p.weights[d][element];
                row[cell] = weight;
                row[n] += weight * value;
                element_sums[d][element] += weight * value;
            }
        }

        Solver {
            p,
            element_sums,
            m: lines.into_iter().flat_map(|l| l.into_values()).collect(),
            variable: vec![0.0; n],
            variable_set: vec![false; n],
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    fn check_timeout(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => {
                Err(EngineError::CouldNotConverge("goal seek timed out".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn set_variable(&mut self, c: usize, v: f64, diagonal: bool) {
        self.variable[c] = v;
        self.variable_set[c] = true;
        let sc = self.variable.len();
        let rows = if diagonal { self.m.len().min(c + 1) } else { self.m.len() };
        for row in self.m.iter_mut().take(rows) {
            row[sc] -= row[c] * v;
            row[c] = 0.0;
        }
    }

    /// Forward elimination over the columns of unset variables.
    fn make_diagonal(&mut self) -> Result<()> {
        let cols = self.variable.len();
        let mut cr = 0;
        for c in 0..cols {
            if self.variable_set[c] {
                continue;
            }
            self.check_timeout()?;
            let Some(r) = (cr..self.m.len()).find(|r| !zero(self.m[*r][c])) else {
                continue;
            };
            self.m.swap(r, cr);
            for r in cr + 1..self.m.len() {
                let f = self.m[r][c] / self.m[cr][c];
                if f == 0.0 {
                    continue;
                }
                let (head, tail) = self.m.split_at_mut(r);
                let pivot = &head[cr];
                for (x, p) in tail[0].iter_mut().zip(pivot.iter()) {
                    *x -= p * f;
                }
            }
            cr += 1;
        }
        while self.m.last().map_or(false, |row| row.iter().all(|x| zero(*x))) {
            self.m.pop();
        }
        Ok(())
    }

    /// Back substitution. Marks pivots with 1 and variables still needed
    /// by some pivot row with 2. Fails on an inconsistent row.
    fn check_state(&mut self, state: &mut Vec<u8>) -> bool {
        let sc = self.variable.len();
        state.clear();
        state.resize(sc, 0);
        for r in (0..self.m.len()).rev() {
            let mut pc = r.min(sc);
            while pc < sc && zero(self.m[r][pc]) {
                pc += 1;
            }
            if pc == sc {
                if zero(self.m[r][sc]) {
                    continue;
                }
                return false;
            }
            state[pc] = 1;
            let mut v = 0.0;
            let mut all = true;
            for c in pc + 1..sc {
                if !zero(self.m[r][c]) {
                    if state[c] == 0 {
                        state[c] = 2;
                    }
                    all &= self.variable_set[c];
                    if all {
                        v += self.variable[c] * self.m[r][c];
                    }
                }
            }
            if all {
                self.variable[pc] = (self.m[r][sc] - v) / self.m[r][pc];
                self.variable_set[pc] = true;
            }
        }
        true
    }

    /// Value of `target` after moving `change` to `new_value` along axis `d`.
    fn estimate_step(&self, d: usize, change: &[usize], new_value: f64, target: &[usize]) -> f64 {
        let old = self.p.values[self.p.index(change)];
        let dsum = self.element_sums[d][change[d]];
        let factor = if equal(dsum, old) {
            1.0 / self.p.weights[d].len() as f64
        } else {
            (dsum - new_value) / (dsum - old)
        };
        self.p.values[self.p.index(target)] * factor
    }

    /// Walks from the fixed cell to `target` one axis at a time, in axis order.
    fn estimate(&self, target: &[usize]) -> f64 {
        let mut value = self.p.fixed_value;
        let mut coord = self.p.fixed.clone();
        for d in 0..coord.len() {
            if coord[d] != target[d] {
                let mut next = coord.clone();
                next[d] = target[d];
                value = self.estimate_step(d, &coord, value, &next);
                coord = next;
            }
        }
        value
    }

    /// Average of the walk over every order of the differing axes.
    fn estimate_all_paths(&self, target: &[usize]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        self.walk(&self.p.fixed, self.p.fixed_value, target, &mut sum, &mut count);
        if count == 0 {
            self.p.fixed_value
        } else {
            sum / count as f64
        }
    }

    fn walk(&self, coord: &[usize], value: f64, target: &[usize], sum: &mut f64, count: &mut usize) {
        let differing: Vec<usize> = (0..coord.len()).filter(|d| coord[*d] != target[*d]).collect();
        if differing.is_empty() {
            *sum += value;
            *count += 1;
            return;
        }
        for d in differing {
            let mut next = coord.to_vec();
            next[d] = target[d];
            let v = self.estimate_step(d, coord, value, &next);
            self.walk(&next, v, target, sum, count);
        }
    }
}

/// Solves a goal-seek slice. Returns the new value of every grid cell.
pub fn solve(problem: &GoalSeekProblem, timeout: Option<Duration>) -> Result<Vec<f64>> {
    if problem.values.len() != problem.cell_count() || problem.fixed.len() != problem.weights.len() {
        return Err(EngineError::GoalSeek("inconsistent goal-seek problem".to_string()));
    }
    let mut s = Solver::new(problem, timeout);
    let fixed = problem.index(&problem.fixed);
    let simple = problem.values.len() > SIMPLE_ESTIMATE_THRESHOLD;

    s.set_variable(fixed, problem.fixed_value, false);
    s.make_diagonal()?;

    let mut state = Vec::new();
    if !s.check_state(&mut state) {
        return Err(EngineError::CouldNotConverge("system has no solution".to_string()));
    }
    for (i, st) in state.clone().into_iter().enumerate() {
        if st == 2 && !s.variable_set[i] {
            s.check_timeout()?;
            let coord = problem.coords(i);
            let estimate = if simple { s.estimate(&coord) } else { s.estimate_all_paths(&coord) };
            s.set_variable(i, estimate, true);
        }
    }
    s.make_diagonal()?;
    if !s.check_state(&mut state) {
        return Err(EngineError::CouldNotConverge("system has no solution after estimation".to_string()));
    }

    Ok((0..problem.values.len())
        .map(|i| if s.variable_set[i] { s.variable[i] } else { problem.values[i] })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_sum(p: &GoalSeekProblem, values: &[f64], d: usize, fixed: &[usize]) -> f64 {
        (0..p.weights[d].len())
            .map(|e| {
                let mut c = fixed.to_vec();
                c[d] = e;
                p.weights[d][e] * values[p.index(&c)]
            })
            .sum()
    }

    #[test]
    fn test_index_roundtrip() {
        let p = GoalSeekProblem {
            weights: vec![vec![1.0; 2], vec![1.0; 3]],
            values: vec![0.0; 6],
            fixed: vec![0, 0],
            fixed_value: 0.0,
        };
        assert_eq!(p.index(&[1, 2]), 5);
        assert_eq!(p.coords(4), vec![1, 1]);
    }

    #[test]
    fn test_single_axis_keeps_total() {
        let p = GoalSeekProblem {
            weights: vec![vec![1.0, 1.0]],
            values: vec![10.0, 5.0],
            fixed: vec![0],
            fixed_value: 20.0,
        };
        let out = solve(&p, None).unwrap();
        assert!((out[0] - 20.0).abs() < 1e-9);
        assert!((out[1] + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_grid_keeps_every_line() {
        // 3 x 3 grid leaves free variables that must be estimated
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let p = GoalSeekProblem {
            weights: vec![vec![1.0; 3], vec![1.0; 3]],
            values: values.clone(),
            fixed: vec![1, 1],
            fixed_value: 11.0,
        };
        let out = solve(&p, None).unwrap();
        assert!((out[p.index(&[1, 1])] - 11.0).abs() < 1e-9);
        for i in 0..3 {
            assert!((line_sum(&p, &out, 0, &[0, i]) - line_sum(&p, &values, 0, &[0, i])).abs() < 1e-6);
            assert!((line_sum(&p, &out, 1, &[i, 0]) - line_sum(&p, &values, 1, &[i, 0])).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rejects_malformed_problem() {
        let p = GoalSeekProblem {
            weights: vec![vec![1.0, 1.0]],
            values: vec![1.0],
            fixed: vec![0],
            fixed_value: 2.0,
        };
        assert!(matches!(solve(&p, None), Err(EngineError::GoalSeek(_))));
    }
}
