//! FILENAME: core/engine/src/plan.rs
//! PURPOSE: Query planner and plan evaluator.
//! CONTEXT: `Planner::create_plan` splits a requested area into base-numeric,
//! string and consolidated pieces, builds a node tree for each (storage scans,
//! weighted aggregations over base descendants, rule overlays) and joins them.
//! `Plan::evaluate` walks the tree and yields a forward-only stream of cells.
//!
//! NODE KINDS:
//! - Source: scan of the numeric or string storage inside an area.
//! - Rule: values computed by one rule over an area (all paths, or only the
//!   marked ones for marker rules).
//! - Aggregation: weighted sum of a child plan onto consolidated targets.
//! - Union: children merged, earlier children win on equal paths.
//! - Transformation: coordinates remapped through per-dimension multimaps,
//!   values scaled by a factor (copy/like).
//! - Complete: adds empty entries for every path the child did not produce.
//! - Constant: one value for every path of an area.

use std::cell::RefCell;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::area::{cartesian, Area, ElementSet};
use crate::cell::{CellPath, CellTypes, CellValue, CubeId, ElementId, ErrorCode, PathType, RuleId, StorageKind};
use crate::dimension::ElementType;
use crate::error::{EngineError, Result};
use crate::rule::{BinaryOp, CellReference, Rule, RuleExpr, SourceCoordinate};
use crate::snapshot::{CubeResolver, CubeView};

/// Per dimension: base element -> consolidated targets with weight.
pub type AggregationMap = FxHashMap<ElementId, Vec<(ElementId, f64)>>;
/// Per dimension: source element -> target elements.
pub type ElementMultiMap = FxHashMap<ElementId, Vec<ElementId>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RulesMode {
    NoRules,
    AllRules,
    /// Use rules but do not report which rule produced a value.
    AllRulesNoIds,
}

impl RulesMode {
    pub fn uses_rules(self) -> bool {
        self != RulesMode::NoRules
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanNodeType {
    Source,
    Rule,
    Aggregation,
    Union,
    Transformation,
    Complete,
    Constant,
}

#[derive(Debug, Clone)]
pub enum PlanNode {
    Source {
        kind: StorageKind,
        area: Area,
    },
    Rule {
        rule_id: RuleId,
        area: Area,
        use_markers: bool,
    },
    Aggregation {
        area: Area,
        maps: Vec<AggregationMap>,
        child: Box<PlanNode>,
    },
    Union {
        children: Vec<PlanNode>,
    },
    Transformation {
        child: Box<PlanNode>,
        maps: Vec<Option<ElementMultiMap>>,
        factor: f64,
    },
    Complete {
        child: Box<PlanNode>,
        area: Area,
    },
    Constant {
        area: Area,
        value: CellValue,
    },
}

impl PlanNode {
    pub fn node_type(&self) -> PlanNodeType {
        match self {
            PlanNode::Source { .. } => PlanNodeType::Source,
            PlanNode::Rule { .. } => PlanNodeType::Rule,
            PlanNode::Aggregation { .. } => PlanNodeType::Aggregation,
            PlanNode::Union { .. } => PlanNodeType::Union,
            PlanNode::Transformation { .. } => PlanNodeType::Transformation,
            PlanNode::Complete { .. } => PlanNodeType::Complete,
            PlanNode::Constant { .. } => PlanNodeType::Constant,
        }
    }

    fn empty() -> Self {
        PlanNode::Union { children: Vec::new() }
    }

    fn union(mut children: Vec<PlanNode>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            PlanNode::Union { children }
        }
    }
}

/// One row of a cell stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CellEntry {
    pub path: CellPath,
    pub value: CellValue,
    pub rule_id: Option<RuleId>,
}

/// Forward-only, non-restartable sequence of evaluated cells.
#[derive(Debug)]
pub struct CellStream {
    inner: std::vec::IntoIter<CellEntry>,
}

impl Iterator for CellStream {
    type Item = CellEntry;

    fn next(&mut self) -> Option<CellEntry> {
        self.inner.next()
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub root: PlanNode,
    pub rules: RulesMode,
    pub skip_empty: bool,
    /// `None` requests an unsorted, unbounded stream.
    pub block_size: Option<usize>,
}

impl Plan {
    pub fn node_type(&self) -> PlanNodeType {
        self.root.node_type()
    }

    /// Runs the plan. Every cell a node produces counts against the cell limit
    /// of `ctx`; going past it fails with `ResourceExhausted`.
    pub fn evaluate(&self, view: &CubeView, ctx: &EvalContext) -> Result<CellStream> {
        let mut entries = Vec::new();
        let mut budget = Budget { left: ctx.cell_limit, limit: ctx.cell_limit };
        eval_node(&self.root, view, ctx, &mut budget, &mut entries)?;
        if self.skip_empty {
            entries.retain(|e| e.value.is_materialized());
        }
        if self.rules == RulesMode::AllRulesNoIds {
            for entry in &mut entries {
                entry.rule_id = None;
            }
        }
        if let Some(limit) = self.block_size {
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            entries.truncate(limit);
        }
        Ok(CellStream { inner: entries.into_iter() })
    }
}

// ============================================================================
// PLANNER
// ============================================================================

/// Area of one homogeneous piece of a request.
struct Piece {
    path_type: PathType,
    area: Area,
}

pub struct Planner<'a> {
    view: &'a CubeView,
}

impl<'a> Planner<'a> {
    pub fn new(view: &'a CubeView) -> Self {
        Planner { view }
    }

    /// Builds the evaluation plan for `area`.
    ///
    /// # Arguments
    /// * `types` - which kinds of cells to return
    /// * `rules` - whether rule values overlay stored values
    /// * `skip_empty` - drop empty cells instead of reporting every path
    /// * `block_size` - sorted, bounded stream of at most this many rows
    pub fn create_plan(
        &self,
        area: &Area,
        types: CellTypes,
        rules: RulesMode,
        skip_empty: bool,
        block_size: Option<usize>,
    ) -> Result<Plan> {
        let pieces = self.split(area)?;
        let mut nodes = Vec::new();
        for piece in pieces {
            if !types.accepts(piece.path_type) {
                continue;
            }
            let node = match piece.path_type {
                PathType::BaseNumeric => self.base_node(&piece.area, StorageKind::Numeric, PathType::BaseNumeric, rules),
                PathType::BaseString => self.base_node(&piece.area, StorageKind::Text, PathType::BaseString, rules),
                PathType::Consolidated => self.consolidated_node(&piece.area, rules)?,
            };
            nodes.push(if skip_empty {
                node
            } else {
                PlanNode::Complete {
                    child: Box::new(node),
                    area: piece.area,
                }
            });
        }
        Ok(Plan {
            root: if nodes.is_empty() { PlanNode::empty() } else { PlanNode::union(nodes) },
            rules,
            skip_empty,
            block_size,
        })
    }

    /// Splits an area into disjoint pieces of uniform path type.
    fn split(&self, area: &Area) -> Result<Vec<Piece>> {
        let expanded = area.expand(&self.view.dimensions)?;
        let n = expanded.dim_count();
        let mut numeric: Vec<ElementSet> = Vec::with_capacity(n);
        let mut strings: Vec<ElementSet> = Vec::with_capacity(n);
        let mut consolidated: Vec<ElementSet> = Vec::with_capacity(n);
        for (i, dim) in self.view.dimensions.iter().enumerate() {
            let (mut num, mut st, mut cons) = (ElementSet::new(), ElementSet::new(), ElementSet::new());
            for e in expanded.elements(i).into_iter().flatten() {
                match dim.element_type(*e)? {
                    ElementType::Numeric => num.insert(*e),
                    ElementType::String => st.insert(*e),
                    ElementType::Consolidated => cons.insert(*e),
                };
            }
            numeric.push(num);
            strings.push(st);
            consolidated.push(cons);
        }
        let union = |a: &ElementSet, b: &ElementSet| -> ElementSet { a.union(b).copied().collect() };

        let mut pieces = Vec::new();
        let mut push = |path_type: PathType, sets: Vec<ElementSet>| {
            if sets.iter().all(|s| !s.is_empty()) {
                pieces.push(Piece { path_type, area: Area::from_sets(sets) });
            }
        };

        push(PathType::BaseNumeric, numeric.clone());
        for k in 0..n {
            let sets = (0..n)
                .map(|j| match j.cmp(&k) {
                    std::cmp::Ordering::Less => union(&numeric[j], &consolidated[j]),
                    std::cmp::Ordering::Equal => strings[j].clone(),
                    std::cmp::Ordering::Greater => expanded.elements(j).cloned().unwrap_or_default(),
                })
                .collect();
            push(PathType::BaseString, sets);
        }
        for k in 0..n {
            let sets = (0..n)
                .map(|j| match j.cmp(&k) {
                    std::cmp::Ordering::Less => numeric[j].clone(),
                    std::cmp::Ordering::Equal => consolidated[j].clone(),
                    std::cmp::Ordering::Greater => union(&numeric[j], &consolidated[j]),
                })
                .collect();
            push(PathType::Consolidated, sets);
        }
        Ok(pieces)
    }

    fn rule_nodes(&self, area: &Area, path_type: PathType, rules: RulesMode) -> Vec<PlanNode> {
        if !rules.uses_rules() {
            return Vec::new();
        }
        self.view
            .snapshot
            .rules
            .active()
            .filter(|r| r.scope_accepts(path_type))
            .filter_map(|r| {
                r.definition.target.intersection(area).map(|a| PlanNode::Rule {
                    rule_id: r.id,
                    area: a,
                    use_markers: r.definition.uses_markers,
                })
            })
            .collect()
    }

    fn base_node(&self, area: &Area, kind: StorageKind, path_type: PathType, rules: RulesMode) -> PlanNode {
        let mut nodes = self.rule_nodes(area, path_type, rules);
        nodes.push(PlanNode::Source { kind, area: area.clone() });
        PlanNode::union(nodes)
    }

    fn consolidated_node(&self, area: &Area, rules: RulesMode) -> Result<PlanNode> {
        let (base_area, maps) = self.aggregation_maps(area)?;
        let child = match base_area {
            Some(base) => self.base_node(&base, StorageKind::Numeric, PathType::BaseNumeric, rules),
            None => PlanNode::empty(),
        };
        let mut nodes = self.rule_nodes(area, PathType::Consolidated, rules);
        nodes.push(PlanNode::Aggregation {
            area: area.clone(),
            maps,
            child: Box::new(child),
        });
        Ok(PlanNode::union(nodes))
    }

    /// Base area below an explicit target area and, per dimension, which
    /// targets each base element contributes to. Zero weights contribute
    /// nothing and are left out. `None` if some dimension has no numeric base.
    pub fn aggregation_maps(&self, area: &Area) -> Result<(Option<Area>, Vec<AggregationMap>)> {
        let mut maps = Vec::with_capacity(area.dim_count());
        let mut base_sets = Vec::with_capacity(area.dim_count());
        for (i, dim) in self.view.dimensions.iter().enumerate() {
            let mut map = AggregationMap::default();
            let mut base_set = ElementSet::new();
            let targets: Vec<ElementId> = match area.elements(i) {
                Some(set) => set.iter().copied().collect(),
                None => dim.element_ids(),
            };
            for target in targets {
                for (base, weight) in dim.base_elements(target)? {
                    if weight == 0.0 || dim.element_type(base)? != ElementType::Numeric {
                        continue;
                    }
                    map.entry(base).or_default().push((target, weight));
                    base_set.insert(base);
                }
            }
            maps.push(map);
            base_sets.push(base_set);
        }
        let base = if base_sets.iter().all(|s| !s.is_empty()) {
            Some(Area::from_sets(base_sets))
        } else {
            None
        };
        Ok((base, maps))
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

/// State shared by one evaluation, including nested cross-cube reads.
pub struct EvalContext<'a> {
    resolver: &'a dyn CubeResolver,
    recursion_limit: usize,
    cell_limit: usize,
    stack: RefCell<Vec<(CubeId, CellPath)>>,
}

impl<'a> EvalContext<'a> {
    pub fn new(resolver: &'a dyn CubeResolver, recursion_limit: usize) -> Self {
        EvalContext {
            resolver,
            recursion_limit,
            cell_limit: usize::MAX,
            stack: RefCell::new(Vec::new()),
        }
    }

    /// Caps the cells one plan evaluation may materialize.
    pub fn with_cell_limit(mut self, limit: usize) -> Self {
        self.cell_limit = limit;
        self
    }

    /// Reads one cell of `view` with rules applied.
    pub fn read_cell(&self, view: &CubeView, path: &CellPath) -> CellValue {
        let area = Area::from_path(path);
        let plan = match Planner::new(view).create_plan(&area, CellTypes::ALL, RulesMode::AllRules, false, None) {
            Ok(plan) => plan,
            Err(_) => return CellValue::Error(ErrorCode::Ref),
        };
        match plan.evaluate(view, self) {
            Ok(mut stream) => stream.next().map(|e| e.value).unwrap_or_default(),
            Err(_) => CellValue::Error(ErrorCode::Ref),
        }
    }

    /// Evaluates `rule` at `path`, guarding against self-reference.
    pub fn eval_rule(&self, view: &CubeView, rule: &Rule, path: &CellPath) -> CellValue {
        {
            let stack = self.stack.borrow();
            if stack.len() >= self.recursion_limit || stack.iter().any(|(c, p)| *c == view.id && p == path) {
                return CellValue::Error(ErrorCode::Recursion);
            }
        }
        self.stack.borrow_mut().push((view.id, path.clone()));
        let value = self.eval_expr(view, &rule.definition.expression, path);
        self.stack.borrow_mut().pop();
        value
    }

    fn eval_expr(&self, view: &CubeView, expr: &RuleExpr, path: &CellPath) -> CellValue {
        match expr {
            RuleExpr::Number(n) => CellValue::Number(*n),
            RuleExpr::Text(s) => CellValue::Text(s.clone()),
            RuleExpr::Reference(reference) => self.eval_reference(view, reference, path),
            RuleExpr::Binary { op, lhs, rhs } => {
                let l = self.eval_expr(view, lhs, path);
                let r = self.eval_expr(view, rhs, path);
                if let CellValue::Error(e) = l {
                    return CellValue::Error(e);
                }
                if let CellValue::Error(e) = r {
                    return CellValue::Error(e);
                }
                match (l.as_number(), r.as_number()) {
                    (Some(a), Some(b)) => match op {
                        BinaryOp::Add => CellValue::Number(a + b),
                        BinaryOp::Sub => CellValue::Number(a - b),
                        BinaryOp::Mul => CellValue::Number(a * b),
                        BinaryOp::Div if b == 0.0 => CellValue::Error(ErrorCode::Div0),
                        BinaryOp::Div => CellValue::Number(a / b),
                    },
                    _ => CellValue::Error(ErrorCode::Value),
                }
            }
        }
    }

    fn eval_reference(&self, view: &CubeView, reference: &CellReference, path: &CellPath) -> CellValue {
        let source = match reference.cube {
            None => view.clone(),
            Some(id) if id == view.id => view.clone(),
            Some(id) => match self.resolver.resolve(id) {
                Some(v) => v,
                None => return CellValue::Error(ErrorCode::Ref),
            },
        };
        match map_source_path(view, &source, &reference.coordinates, path) {
            Some(source_path) => self.read_cell(&source, &source_path),
            None => CellValue::Error(ErrorCode::Ref),
        }
    }
}

/// Source path of a reference for the target cell `path`. Variables copy the
/// target element, translated by name when the dimensions differ.
pub fn map_source_path(
    target: &CubeView,
    source: &CubeView,
    coordinates: &[SourceCoordinate],
    path: &[ElementId],
) -> Option<CellPath> {
    if coordinates.len() != source.dim_count() {
        return None;
    }
    let mut out = CellPath::with_capacity(coordinates.len());
    for (j, coordinate) in coordinates.iter().enumerate() {
        let element = match coordinate {
            SourceCoordinate::Element(e) => *e,
            SourceCoordinate::Variable(t) => {
                let target_dim = target.dimensions.get(*t)?;
                let element = *path.get(*t)?;
                let source_dim = &source.dimensions[j];
                if Arc::ptr_eq(target_dim, source_dim) || target_dim.id == source_dim.id {
                    element
                } else {
                    let name = &target_dim.lookup_element(element).ok()?.name;
                    source_dim.find_element_by_name(name).ok()?.id
                }
            }
        };
        out.push(element);
    }
    Some(out)
}

/// Cells one evaluation may still materialize.
struct Budget {
    left: usize,
    limit: usize,
}

impl Budget {
    fn take(&mut self, count: usize) -> Result<()> {
        if count > self.left {
            return Err(EngineError::ResourceExhausted(format!(
                "plan evaluation exceeds the limit of {} cells",
                self.limit
            )));
        }
        self.left -= count;
        Ok(())
    }

    /// Charges every path of `area` before it is expanded.
    fn take_area(&mut self, area: &Area, view: &CubeView) -> Result<()> {
        let size = area.size(&view.dimensions)?;
        self.take(usize::try_from(size).unwrap_or(usize::MAX))
    }
}

fn eval_node(
    node: &PlanNode,
    view: &CubeView,
    ctx: &EvalContext,
    budget: &mut Budget,
    out: &mut Vec<CellEntry>,
) -> Result<()> {
    match node {
        PlanNode::Source { kind, area } => {
            let cells = view.snapshot.storage(*kind).scan(area);
            budget.take(cells.len())?;
            out.extend(cells.into_iter().map(|(path, value)| CellEntry { path, value, rule_id: None }));
        }
        PlanNode::Rule { rule_id, area, use_markers } => {
            let rule = view.snapshot.rules.find(*rule_id)?;
            let single = (0..area.dim_count()).all(|i| area.elements(i).map_or(false, |s| s.len() == 1));
            let paths = if *use_markers && !single {
                let marked = view.snapshot.markers.marked_in(area);
                budget.take(marked.len())?;
                marked
            } else {
                let expanded = area.expand(&view.dimensions)?;
                budget.take_area(&expanded, view)?;
                expanded.paths()?
            };
            for path in paths {
                let value = ctx.eval_rule(view, rule, &path);
                if !value.is_empty() {
                    out.push(CellEntry { path, value, rule_id: Some(*rule_id) });
                }
            }
        }
        PlanNode::Aggregation { maps, child, .. } => {
            let mut input = Vec::new();
            eval_node(child, view, ctx, budget, &mut input)?;
            let mut order: Vec<CellPath> = Vec::new();
            let mut sums: FxHashMap<CellPath, CellValue> = FxHashMap::default();
            for entry in input {
                let mut targets: Vec<Vec<ElementId>> = Vec::with_capacity(maps.len());
                let mut weights: Vec<FxHashMap<ElementId, f64>> = Vec::with_capacity(maps.len());
                let mut reachable = true;
                for (i, map) in maps.iter().enumerate() {
                    match map.get(&entry.path[i]) {
                        Some(list) => {
                            targets.push(list.iter().map(|(t, _)| *t).collect());
                            weights.push(list.iter().copied().collect());
                        }
                        None => {
                            reachable = false;
                            break;
                        }
                    }
                }
                if !reachable {
                    continue;
                }
                for target in cartesian(&targets) {
                    let weight: f64 = target.iter().enumerate().map(|(i, t)| weights[i][t]).product();
                    if !sums.contains_key(&target) {
                        budget.take(1)?;
                        order.push(target.clone());
                    }
                    let slot = sums.entry(target).or_insert(CellValue::Number(0.0));
                    *slot = match (&*slot, &entry.value) {
                        (CellValue::Error(e), _) => CellValue::Error(*e),
                        (_, CellValue::Error(e)) => CellValue::Error(*e),
                        (acc, v) => match v.as_number() {
                            Some(n) => CellValue::Number(acc.number_or_zero() + weight * n),
                            None => acc.clone(),
                        },
                    };
                }
            }
            for path in order {
                if let Some(value) = sums.remove(&path) {
                    out.push(CellEntry { path, value, rule_id: None });
                }
            }
        }
        PlanNode::Union { children } => {
            let mut seen: FxHashMap<CellPath, ()> = FxHashMap::default();
            for child in children {
                let mut part = Vec::new();
                eval_node(child, view, ctx, budget, &mut part)?;
                for entry in part {
                    if seen.insert(entry.path.clone(), ()).is_none() {
                        out.push(entry);
                    }
                }
            }
        }
        PlanNode::Transformation { child, maps, factor } => {
            let mut input = Vec::new();
            eval_node(child, view, ctx, budget, &mut input)?;
            let mut order: Vec<CellPath> = Vec::new();
            let mut results: FxHashMap<CellPath, CellValue> = FxHashMap::default();
            for entry in input {
                let mut targets: Vec<Vec<ElementId>> = Vec::with_capacity(maps.len());
                for (i, map) in maps.iter().enumerate() {
                    match map {
                        None => targets.push(vec![entry.path[i]]),
                        Some(m) => targets.push(m.get(&entry.path[i]).cloned().unwrap_or_default()),
                    }
                }
                let scaled = match &entry.value {
                    CellValue::Number(n) => CellValue::Number(n * factor),
                    other => other.clone(),
                };
                for target in cartesian(&targets) {
                    match results.get_mut(&target) {
                        Some(existing) => {
                            if let (Some(a), Some(b)) = (existing.as_number(), scaled.as_number()) {
                                *existing = CellValue::Number(a + b);
                            }
                        }
                        None => {
                            budget.take(1)?;
                            order.push(target.clone());
                            results.insert(target, scaled.clone());
                        }
                    }
                }
            }
            for path in order {
                if let Some(value) = results.remove(&path) {
                    out.push(CellEntry { path, value, rule_id: None });
                }
            }
        }
        PlanNode::Complete { child, area } => {
            let mut part = Vec::new();
            eval_node(child, view, ctx, budget, &mut part)?;
            let present: FxHashMap<CellPath, ()> = part.iter().map(|e| (e.path.clone(), ())).collect();
            out.extend(part);
            let expanded = area.expand(&view.dimensions)?;
            budget.take_area(&expanded, view)?;
            for path in expanded.paths()? {
                if !present.contains_key(&path) {
                    out.push(CellEntry { path, value: CellValue::Empty, rule_id: None });
                }
            }
        }
        PlanNode::Constant { area, value } => {
            let expanded = area.expand(&view.dimensions)?;
            budget.take_area(&expanded, view)?;
            for path in expanded.paths()? {
                out.push(CellEntry { path, value: value.clone(), rule_id: None });
            }
        }
    }
    Ok(())
}
