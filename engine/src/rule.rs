//! FILENAME: core/engine/src/rule.rs
//! PURPOSE: Rules attached to a cube and their ordered list.
//! CONTEXT: Rule text is parsed outside the engine; the engine receives the
//! resulting `RuleExpr` tree together with the target area the rule writes.
//! References to other cubes are what the marker engine turns into markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::area::Area;
use crate::cell::{CellPath, CubeId, ElementId, PathType, RuleId};
use crate::error::{EngineError, Result};

/// Which cells of the target area a rule computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RuleScope {
    #[default]
    All,
    BaseOnly,
    ConsolidatedOnly,
}

/// One coordinate of a referenced source cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceCoordinate {
    /// A fixed element of the source dimension.
    Element(ElementId),
    /// Takes the element of the given target dimension (matched by name when
    /// source and target dimensions differ).
    Variable(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellReference {
    /// `None` reads the cube the rule belongs to.
    pub cube: Option<CubeId>,
    pub coordinates: Vec<SourceCoordinate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Parsed rule expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleExpr {
    Number(f64),
    Text(String),
    Reference(CellReference),
    Binary {
        op: BinaryOp,
        lhs: Box<RuleExpr>,
        rhs: Box<RuleExpr>,
    },
}

impl RuleExpr {
    pub fn reference(cube: Option<CubeId>, coordinates: Vec<SourceCoordinate>) -> Self {
        RuleExpr::Reference(CellReference { cube, coordinates })
    }

    pub fn binary(op: BinaryOp, lhs: RuleExpr, rhs: RuleExpr) -> Self {
        RuleExpr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// All cell references in evaluation order.
    pub fn references(&self) -> Vec<&CellReference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a CellReference>) {
        match self {
            RuleExpr::Reference(r) => out.push(r),
            RuleExpr::Binary { lhs, rhs, .. } => {
                lhs.collect_references(out);
                rhs.collect_references(out);
            }
            _ => {}
        }
    }
}

/// Everything a client supplies when creating or modifying a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Rule text as typed by the user.
    pub definition: String,
    pub expression: RuleExpr,
    pub target: Area,
    #[serde(default)]
    pub scope: RuleScope,
    /// Enumerate rule cells through markers instead of the full target area.
    #[serde(default)]
    pub uses_markers: bool,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    #[serde(flatten)]
    pub definition: RuleDefinition,
    pub active: bool,
    pub position: f64,
    pub created: DateTime<Utc>,
}

impl Rule {
    /// True if the rule computes the cell at `path`.
    pub fn applies_to(&self, path: &[ElementId], path_type: PathType) -> bool {
        self.active && self.scope_accepts(path_type) && self.definition.target.contains(path)
    }

    pub fn scope_accepts(&self, path_type: PathType) -> bool {
        match (self.definition.scope, path_type) {
            (RuleScope::All, _) => true,
            (RuleScope::BaseOnly, PathType::Consolidated) => false,
            (RuleScope::BaseOnly, _) => true,
            (RuleScope::ConsolidatedOnly, PathType::Consolidated) => true,
            (RuleScope::ConsolidatedOnly, _) => false,
        }
    }

    /// Ids of other cubes read by this rule.
    pub fn source_cubes(&self, own: CubeId) -> Vec<CubeId> {
        let mut cubes: Vec<CubeId> = self
            .definition
            .expression
            .references()
            .iter()
            .map(|r| r.cube.unwrap_or(own))
            .collect();
        cubes.sort_unstable();
        cubes.dedup();
        cubes
    }
}

// ============================================================================
// RULE LIST
// ============================================================================

/// Rules of one cube, kept sorted by position (ties by id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleList {
    rules: Vec<Rule>,
    next_id: RuleId,
}

impl RuleList {
    pub fn new() -> Self {
        RuleList {
            rules: Vec::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn active(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.active)
    }

    pub fn next_id(&self) -> RuleId {
        self.next_id
    }

    pub fn find(&self, id: RuleId) -> Result<&Rule> {
        self.rules.iter().find(|r| r.id == id).ok_or(EngineError::RuleNotFound(id))
    }

    fn find_mut(&mut self, id: RuleId) -> Result<&mut Rule> {
        self.rules.iter_mut().find(|r| r.id == id).ok_or(EngineError::RuleNotFound(id))
    }

    /// First active rule computing `path`.
    pub fn rule_for(&self, path: &CellPath, path_type: PathType) -> Option<&Rule> {
        self.rules.iter().find(|r| r.applies_to(path, path_type))
    }

    /// Adds a rule. `id` is honoured when replaying a journal or loading a rule file.
    pub fn create(
        &mut self,
        id: Option<RuleId>,
        definition: RuleDefinition,
        active: bool,
        position: Option<f64>,
    ) -> Result<RuleId> {
        let id = match id {
            Some(id) if self.rules.iter().any(|r| r.id == id) => {
                return Err(EngineError::InvalidCoordinates(format!("rule {} already exists", id)))
            }
            Some(id) => id,
            None => self.next_id,
        };
        self.next_id = self.next_id.max(id + 1);
        let position = position.unwrap_or_else(|| self.rules.last().map_or(1.0, |r| r.position + 1.0));
        self.rules.push(Rule {
            id,
            definition,
            active,
            position,
            created: Utc::now(),
        });
        self.sort();
        Ok(id)
    }

    /// Inserts a fully formed rule (rule file load).
    pub fn insert_loaded(&mut self, rule: Rule) -> Result<()> {
        if self.rules.iter().any(|r| r.id == rule.id) {
            return Err(EngineError::FileFormatError(format!("duplicate rule id {}", rule.id)));
        }
        self.next_id = self.next_id.max(rule.id + 1);
        self.rules.push(rule);
        self.sort();
        Ok(())
    }

    pub fn modify(&mut self, id: RuleId, definition: RuleDefinition, active: Option<bool>, position: Option<f64>) -> Result<()> {
        let rule = self.find_mut(id)?;
        rule.definition = definition;
        if let Some(active) = active {
            rule.active = active;
        }
        if let Some(position) = position {
            rule.position = position;
        }
        self.sort();
        Ok(())
    }

    pub fn destroy(&mut self, id: RuleId) -> Result<Rule> {
        let idx = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or(EngineError::RuleNotFound(id))?;
        Ok(self.rules.remove(idx))
    }

    /// Sets the activation flag of several rules. All ids must exist.
    pub fn activate(&mut self, ids: &[RuleId], active: bool) -> Result<()> {
        for id in ids {
            self.find(*id)?;
        }
        for id in ids {
            self.find_mut(*id)?.active = active;
        }
        Ok(())
    }

    pub fn move_rule(&mut self, id: RuleId, position: f64) -> Result<()> {
        self.find_mut(id)?.position = position;
        self.sort();
        Ok(())
    }

    fn sort(&mut self) {
        self.rules.sort_by(|a, b| {
            a.position
                .partial_cmp(&b.position)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
    }
}

impl Default for RuleList {
    fn default() -> Self {
        Self::new()
    }
}
