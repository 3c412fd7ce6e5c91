//! FILENAME: core/persistence/src/rule_file.rs
//! PURPOSE: Reading and writing the rule file of a cube.
//! CONTEXT: One JSON document per cube holding every rule with its id,
//! definition, external id, comment, creation time, active flag and position.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use engine::{Cube, Rule};
use serde::{Deserialize, Serialize};

use crate::PersistenceError;

pub const RULE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleFile {
    version: u32,
    cube: String,
    #[serde(default)]
    rules: Vec<Rule>,
}

pub fn save_rules(cube: &Cube, path: &Path) -> Result<(), PersistenceError> {
    let file = RuleFile {
        version: RULE_FILE_VERSION,
        cube: cube.name().to_string(),
        rules: cube.rules().cloned().collect(),
    };
    let mut out = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut out, &file)?;
    out.flush()?;
    Ok(())
}

/// Rules stored in `path`. A missing file means the cube has no rules.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>, PersistenceError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file: RuleFile = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    if file.version > RULE_FILE_VERSION {
        return Err(PersistenceError::UnsupportedVersion(file.version));
    }
    Ok(file.rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{Area, ElementSet, RuleDefinition, RuleExpr, RuleScope};
    use tempfile::TempDir;

    fn definition() -> RuleDefinition {
        RuleDefinition {
            definition: "['B'] = 7".to_string(),
            expression: RuleExpr::Number(7.0),
            target: Area::from_sets(vec![ElementSet::from([1])]),
            scope: RuleScope::All,
            uses_markers: false,
            external_id: Some("ext-1".to_string()),
            comment: Some("constant".to_string()),
        }
    }

    #[test]
    fn test_rules_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Tiny.rules");
        let mut dim = engine::Dimension::new(0, "Account");
        dim.add_element("A", engine::ElementType::Numeric).unwrap();
        dim.add_element("B", engine::ElementType::Numeric).unwrap();
        let mut cube = Cube::new(1, "Tiny", vec![std::sync::Arc::new(dim)], Default::default());
        let id = cube.create_rule(None, definition(), false, Some(3.0), "admin").unwrap();

        save_rules(&cube, &path).unwrap();
        let rules = load_rules(&path).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, id);
        assert!(!rules[0].active);
        assert_eq!(rules[0].position, 3.0);
        assert_eq!(rules[0].definition.external_id.as_deref(), Some("ext-1"));
        assert_eq!(rules[0], *cube.rule(id).unwrap());
    }

    #[test]
    fn test_missing_and_future_files() {
        let dir = TempDir::new().unwrap();
        assert!(load_rules(&dir.path().join("none.rules")).unwrap().is_empty());

        let path = dir.path().join("future.rules");
        std::fs::write(&path, r#"{"version": 7, "cube": "X", "rules": []}"#).unwrap();
        assert!(matches!(load_rules(&path), Err(PersistenceError::UnsupportedVersion(7))));
    }
}
