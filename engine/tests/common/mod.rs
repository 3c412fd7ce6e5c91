//! FILENAME: tests/common/mod.rs
//! Test harness and fixtures for cube engine integration tests.

#![allow(dead_code)]

use cube_engine::{
    Area, CellValue, CubeConfig, CubeId, Database, Dimension, ElementId, ElementType, Result, RuleDefinition,
    RuleExpr, RuleScope, RulesMode, SourceCoordinate, WriteOptions, WriteOutcome,
};
use tempfile::TempDir;

// Product dimension
pub const P1: ElementId = 0;
pub const P2: ElementId = 1;
pub const ALL_PRODUCTS: ElementId = 2;
pub const LABEL: ElementId = 3;

// Region dimension
pub const EU: ElementId = 0;
pub const US: ElementId = 1;
pub const WORLD: ElementId = 2;

pub const ADMIN: &str = "admin";

/// Test harness holding a database with a `Sales[Product, Region]` cube.
pub struct TestHarness {
    pub db: Database,
    pub sales: CubeId,
    /// Receives spilled rollback pages.
    pub dir: TempDir,
}

impl TestHarness {
    /// Create a harness with an empty Sales cube.
    pub fn new() -> Self {
        Self::with_config(CubeConfig::default())
    }

    /// Create a harness with custom limits. The rollback directory is always a temp dir.
    pub fn with_config(mut config: CubeConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        config.rollback_dir = Some(dir.path().to_path_buf());
        let mut db = Database::new("test", config);
        db.add_dimension(product_dimension()).expect("product dimension");
        db.add_dimension(region_dimension()).expect("region dimension");
        let sales = db.create_cube("Sales", &["Product", "Region"]).expect("sales cube");
        TestHarness { db, sales, dir }
    }

    /// Create a harness with sample values:
    /// (P1,EU)=10, (P2,EU)=5, (P1,US)=20, (P2,US)=40, (LABEL,EU)="north".
    pub fn with_sample_data() -> Self {
        let mut harness = Self::new();
        harness.populate_sample_data();
        harness
    }

    pub fn populate_sample_data(&mut self) {
        for (path, value) in [([P1, EU], 10.0), ([P2, EU], 5.0), ([P1, US], 20.0), ([P2, US], 40.0)] {
            self.set(&path, value).expect("sample value");
        }
        let sales = self.sales;
        self.db
            .set_cell_value(sales, &[LABEL, EU], CellValue::from("north"), &[], ADMIN, WriteOptions::default())
            .expect("sample text");
    }

    /// Adds a cube `name[Product, Region]` whose base cells mirror `source`
    /// through a marker rule.
    pub fn add_mirror_cube(&mut self, name: &str, source: CubeId) -> CubeId {
        let cube = self.db.create_cube(name, &["Product", "Region"]).expect("mirror cube");
        self.db
            .create_rule(cube, mirror_rule(source), true, None, ADMIN)
            .expect("mirror rule");
        cube
    }

    pub fn set(&mut self, path: &[ElementId], value: f64) -> Result<WriteOutcome> {
        self.set_as(ADMIN, path, value)
    }

    pub fn set_as(&mut self, user: &str, path: &[ElementId], value: f64) -> Result<WriteOutcome> {
        let sales = self.sales;
        self.db
            .set_cell_value(sales, path, CellValue::Number(value), &[], user, WriteOptions::default())
    }

    /// Stored or aggregated value of a Sales cell, ignoring rules.
    pub fn number(&mut self, path: &[ElementId]) -> f64 {
        self.number_in(self.sales, path, RulesMode::NoRules)
    }

    pub fn number_in(&mut self, cube: CubeId, path: &[ElementId], rules: RulesMode) -> f64 {
        self.db
            .get_cell_value(cube, path, rules, ADMIN)
            .expect("readable cell")
            .value
            .number_or_zero()
    }
}

/// Product: P1, P2, AllProducts = P1 + P2, Label (string)
pub fn product_dimension() -> Dimension {
    let mut product = Dimension::new(0, "Product");
    let p1 = product.add_element("P1", ElementType::Numeric).expect("P1");
    let p2 = product.add_element("P2", ElementType::Numeric).expect("P2");
    let all = product.add_element("AllProducts", ElementType::Consolidated).expect("AllProducts");
    product.add_element("Label", ElementType::String).expect("Label");
    product.add_child(all, p1, 1.0).expect("P1 edge");
    product.add_child(all, p2, 1.0).expect("P2 edge");
    product
}

/// Region: EU, US, World = EU + US
pub fn region_dimension() -> Dimension {
    let mut region = Dimension::new(1, "Region");
    let eu = region.add_element("EU", ElementType::Numeric).expect("EU");
    let us = region.add_element("US", ElementType::Numeric).expect("US");
    let world = region.add_element("World", ElementType::Consolidated).expect("World");
    region.add_child(world, eu, 1.0).expect("EU edge");
    region.add_child(world, us, 1.0).expect("US edge");
    region
}

/// target[p, r] = source[p, r] on base cells, enumerated through markers.
pub fn mirror_rule(source: CubeId) -> RuleDefinition {
    RuleDefinition {
        definition: "[] = PALO.DATA(\"Sales\", !'Product', !'Region')".to_string(),
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
