//! FILENAME: core/engine/src/rights.rs
//! PURPOSE: Contract of the rights layer consulted before reads and writes.
//! CONTEXT: Right computation lives outside the engine. A cube only asks
//! whether a user may access an area with at least a given right.

use crate::area::Area;
use crate::error::{EngineError, Result};

/// Access levels, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Right {
    None,
    Read,
    Write,
    /// Write through consolidated cells.
    Splash,
    Delete,
}

pub trait RightsChecker: Send + Sync {
    /// Strongest right `user` holds on `area` of cube `cube`.
    fn area_right(&self, user: &str, cube: &str, area: &Area) -> Right;

    fn check_area_access(&self, user: &str, cube: &str, area: &Area, min: Right) -> Result<()> {
        let held = self.area_right(user, cube, area);
        if held < min {
            return Err(EngineError::NotAuthorized(format!(
                "user '{}' needs {:?} on cube '{}' but has {:?}",
                user, min, cube, held
            )));
        }
        Ok(())
    }
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl RightsChecker for AllowAll {
    fn area_right(&self, _user: &str, _cube: &str, _area: &Area) -> Right {
        Right::Delete
    }
}

/// Grants one fixed right to every user.
#[derive(Debug, Clone, Copy)]
pub struct FixedRight(pub Right);

impl RightsChecker for FixedRight {
    fn area_right(&self, _user: &str, _cube: &str, _area: &Area) -> Right {
        self.0
    }
}
