//! FILENAME: core/engine/src/cell.rs
//! PURPOSE: Defines the fundamental data structures for a single cube cell.
//! CONTEXT: A cell is addressed by a `CellPath` (one element identifier per
//! cube dimension) and holds a `CellValue`. Reads additionally report which rule
//! produced the value and whether the cell sits inside a lock.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type ElementId = u32;
pub type DimensionId = u32;
pub type CubeId = u32;
pub type RuleId = u32;
pub type LockId = u32;
pub type MarkerId = u32;

/// Canonical key of the sparse stores. Most cubes have fewer than nine dimensions.
pub type CellPath = SmallVec<[ElementId; 8]>;

/// Error codes a cell value can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Division by zero inside a rule expression
    Div0,
    /// Rule references a cube or element that does not exist
    Ref,
    /// Rule evaluation recursed into itself
    Recursion,
    /// Arithmetic on a string operand
    Value,
}

/// Represents the stored or calculated content of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
    Error(ErrorCode),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Numeric view: empty counts as 0, text and errors have no number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Empty => Some(0.0),
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn number_or_zero(&self) -> f64 {
        self.as_number().unwrap_or(0.0)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error(_))
    }

    /// True for values that should be stored in the sparse maps.
    /// Zero numbers and empty strings are treated as absent.
    pub fn is_materialized(&self) -> bool {
        match self {
            CellValue::Empty => false,
            CellValue::Number(n) => *n != 0.0,
            CellValue::Text(s) => !s.is_empty(),
            CellValue::Error(_) => true,
        }
    }

    /// Returns the display value of the cell as a String.
    pub fn display_value(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{:.0}", n)
                } else {
                    format!("{}", n)
                }
            }
            CellValue::Text(s) => s.clone(),
            CellValue::Error(e) => format!("#{:?}", e).to_uppercase(),
        }
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

/// Lock state of a cell relative to the reading user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LockStatus {
    #[default]
    Unlocked,
    LockedBySelf,
    LockedByOther,
}

/// Result of a single cell read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CellReading {
    pub value: CellValue,
    /// Rule that produced the value, when rules were used and ids requested.
    pub rule_id: Option<RuleId>,
    pub lock_status: LockStatus,
}

/// Kind of values held by one storage of a cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    Numeric,
    Text,
}

/// Classification of a path according to the element types on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    /// Only numeric base elements
    BaseNumeric,
    /// At least one string element
    BaseString,
    /// No string element, at least one consolidated element
    Consolidated,
}

impl PathType {
    pub fn storage_kind(self) -> StorageKind {
        match self {
            PathType::BaseString => StorageKind::Text,
            _ => StorageKind::Numeric,
        }
    }
}

/// Filter for plan construction: which kinds of cells a request wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellTypes {
    pub numeric: bool,
    pub string: bool,
    pub consolidated: bool,
}

impl CellTypes {
    pub const ALL: CellTypes = CellTypes { numeric: true, string: true, consolidated: true };
    pub const NUMERIC: CellTypes = CellTypes { numeric: true, string: false, consolidated: true };
    pub const STRING: CellTypes = CellTypes { numeric: false, string: true, consolidated: false };
    pub const BASE: CellTypes = CellTypes { numeric: true, string: true, consolidated: false };
    pub const BASE_NUMERIC: CellTypes = CellTypes { numeric: true, string: false, consolidated: false };
    pub const CONSOLIDATED: CellTypes = CellTypes { numeric: false, string: false, consolidated: true };

    pub fn accepts(&self, path_type: PathType) -> bool {
        match path_type {
            PathType::BaseNumeric => self.numeric,
            PathType::BaseString => self.string,
            PathType::Consolidated => self.consolidated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_views() {
        assert_eq!(CellValue::Empty.as_number(), Some(0.0));
        assert_eq!(CellValue::Number(2.5).number_or_zero(), 2.5);
        assert_eq!(CellValue::from("x").as_number(), None);
    }

    #[test]
    fn test_materialization() {
        assert!(!CellValue::Number(0.0).is_materialized());
        assert!(!CellValue::Text(String::new()).is_materialized());
        assert!(CellValue::Number(-1.0).is_materialized());
        assert!(CellValue::Error(ErrorCode::Ref).is_materialized());
    }

    #[test]
    fn test_display_value() {
        assert_eq!(CellValue::Number(42.0).display_value(), "42");
        assert_eq!(CellValue::Number(1.5).display_value(), "1.5");
        assert_eq!(CellValue::Error(ErrorCode::Div0).display_value(), "#DIV0");
    }

    #[test]
    fn test_cell_type_filter() {
        assert!(CellTypes::ALL.accepts(PathType::BaseString));
        assert!(!CellTypes::NUMERIC.accepts(PathType::BaseString));
        assert!(CellTypes::NUMERIC.accepts(PathType::Consolidated));
        assert!(!CellTypes::BASE.accepts(PathType::Consolidated));
    }
}
