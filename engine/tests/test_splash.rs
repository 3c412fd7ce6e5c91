//! FILENAME: tests/test_splash.rs
//! Integration tests for consolidated reads and splashing.

mod common;

use common::*;
use cube_engine::{
    Area, CellPath, CellTypes, CellValue, ElementSet, EngineError, RulesMode, SplashMode, WriteOptions,
};

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// ============================================================================
// AGGREGATION
// ============================================================================

#[test]
fn test_consolidated_value_is_weighted_sum() {
    let mut harness = TestHarness::with_sample_data();
    assert_eq!(harness.number(&[ALL_PRODUCTS, EU]), 15.0);
    assert_eq!(harness.number(&[P1, WORLD]), 30.0);
    assert_eq!(harness.number(&[ALL_PRODUCTS, WORLD]), 75.0);
}

#[test]
fn test_empty_write_removes_cell() {
    let mut harness = TestHarness::with_sample_data();
    let before = harness.db.cube(harness.sales).unwrap().cell_count();
    harness
        .db
        .set_cell_value(harness.sales, &[P1, EU], CellValue::Empty, &[], ADMIN, WriteOptions::default())
        .unwrap();
    assert_eq!(harness.db.cube(harness.sales).unwrap().cell_count(), before - 1);
    assert_eq!(harness.number(&[P1, EU]), 0.0);
}

#[test]
fn test_area_read_is_sorted_with_block_size() {
    let mut harness = TestHarness::with_sample_data();
    let area = Area::from_sets(vec![ElementSet::from([P1, P2, ALL_PRODUCTS]), ElementSet::from([EU, US])]);
    let rows: Vec<_> = harness
        .db
        .get_cell_values(harness.sales, &area, CellTypes::NUMERIC, RulesMode::NoRules, true, Some(3), ADMIN)
        .unwrap()
        .collect();
    assert_eq!(rows.len(), 3);
    let paths: Vec<CellPath> = rows.iter().map(|r| r.path.clone()).collect();
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
}

// ============================================================================
// SPLASH
// ============================================================================

#[test]
fn test_default_splash_is_proportional() {
    let mut harness = TestHarness::with_sample_data();
    harness.set(&[ALL_PRODUCTS, EU], 30.0).unwrap();
    assert!(close(harness.number(&[P1, EU]), 20.0));
    assert!(close(harness.number(&[P2, EU]), 10.0));
    assert!(close(harness.number(&[ALL_PRODUCTS, EU]), 30.0));
    // other region untouched
    assert_eq!(harness.number(&[P1, US]), 20.0);
}

#[test]
fn test_default_splash_over_two_dimensions_keeps_ratios() {
    let mut harness = TestHarness::with_sample_data();
    harness.set(&[ALL_PRODUCTS, WORLD], 150.0).unwrap();
    for (path, old) in [([P1, EU], 10.0), ([P2, EU], 5.0), ([P1, US], 20.0), ([P2, US], 40.0)] {
        assert!(close(harness.number(&path), old * 2.0));
    }
}

#[test]
fn test_splash_into_empty_area_distributes_equally() {
    let mut harness = TestHarness::new();
    harness.set(&[ALL_PRODUCTS, US], 8.0).unwrap();
    assert!(close(harness.number(&[P1, US]), 4.0));
    assert!(close(harness.number(&[P2, US]), 4.0));
}

#[test]
fn test_set_base_and_add_base() {
    let mut harness = TestHarness::with_sample_data();
    let sales = harness.sales;
    harness
        .db
        .set_cell_value(sales, &[P1, WORLD], CellValue::Number(3.0), &[], ADMIN, WriteOptions::splash(SplashMode::SetBase))
        .unwrap();
    assert_eq!(harness.number(&[P1, EU]), 3.0);
    assert_eq!(harness.number(&[P1, US]), 3.0);

    harness
        .db
        .set_cell_value(sales, &[P1, WORLD], CellValue::Number(1.0), &[], ADMIN, WriteOptions::splash(SplashMode::AddBase))
        .unwrap();
    assert_eq!(harness.number(&[P1, EU]), 4.0);
    assert_eq!(harness.number(&[P1, WORLD]), 8.0);
}

#[test]
fn test_splash_disabled() {
    let mut harness = TestHarness::with_sample_data();
    let sales = harness.sales;
    let err = harness
        .db
        .set_cell_value(sales, &[ALL_PRODUCTS, EU], CellValue::Number(1.0), &[], ADMIN, WriteOptions::splash(SplashMode::Disabled))
        .unwrap_err();
    assert!(matches!(err, EngineError::SplashDisabled(_)));
    assert_eq!(harness.number(&[P1, EU]), 10.0);
}

#[test]
fn test_held_cell_is_left_alone() {
    let mut harness = TestHarness::with_sample_data();
    let sales = harness.sales;
    let held: Vec<CellPath> = vec![CellPath::from_slice(&[P1, EU])];
    harness
        .db
        .set_cell_value(sales, &[ALL_PRODUCTS, EU], CellValue::Number(25.0), &held, ADMIN, WriteOptions::default())
        .unwrap();
    assert_eq!(harness.number(&[P1, EU]), 10.0);
    assert!(close(harness.number(&[P2, EU]), 15.0));
}

#[test]
fn test_type_mismatches() {
    let mut harness = TestHarness::with_sample_data();
    let sales = harness.sales;
    let err = harness
        .db
        .set_cell_value(sales, &[LABEL, EU], CellValue::Number(1.0), &[], ADMIN, WriteOptions::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::ElementTypeMismatch(_)));
    let err = harness
        .db
        .set_cell_value(sales, &[P1, EU], CellValue::from("x"), &[], ADMIN, WriteOptions::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::ElementTypeMismatch(_)));
    let err = harness.set(&[P1], 1.0).unwrap_err();
    assert!(matches!(err, EngineError::InvalidCoordinates(_)));
}

#[test]
fn test_token_increases_on_every_write() {
    let mut harness = TestHarness::new();
    let mut last = harness.db.cube(harness.sales).unwrap().token();
    for value in [1.0, 2.0, 3.0] {
        harness.set(&[P1, EU], value).unwrap();
        let token = harness.db.cube(harness.sales).unwrap().token();
        assert!(token > last);
        last = token;
    }
}
