//! FILENAME: core/engine/src/cube/rules.rs
//! PURPOSE: Rule management on a cube.
//! CONTEXT: Rules live in the snapshot next to the values, so readers holding
//! an older snapshot keep the rules they started with. Every change bumps the
//! token. Marker rebuilds for changed rules are done by the `Database`.

use std::sync::Arc;

use super::{Cube, CubeStatus};
use crate::cell::RuleId;
use crate::error::{EngineError, Result};
use crate::journal::JournalCommand;
use crate::rights::Right;
use crate::rule::{Rule, RuleDefinition};
use crate::log_info;

impl Cube {
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.data.rules.iter()
    }

    pub fn rule(&self, id: RuleId) -> Result<&Rule> {
        self.data.rules.find(id)
    }

    fn check_rule_definition(&self, definition: &RuleDefinition, user: &str) -> Result<()> {
        if definition.target.dim_count() != self.dim_count() {
            return Err(EngineError::InvalidCoordinates(format!(
                "rule target has {} dimensions, cube '{}' has {}",
                definition.target.dim_count(),
                self.name,
                self.dim_count()
            )));
        }
        self.check_right(user, &definition.target, Right::Write)
    }

    fn rules_changed(&mut self) {
        Arc::make_mut(&mut self.data).token += 1;
        self.rule_status = CubeStatus::Changed;
    }

    /// Adds a rule. `id` is taken as given when replaying or loading.
    pub fn create_rule(
        &mut self,
        id: Option<RuleId>,
        definition: RuleDefinition,
        active: bool,
        position: Option<f64>,
        user: &str,
    ) -> Result<RuleId> {
        self.check_rule_definition(&definition, user)?;
        let id = Arc::make_mut(&mut self.data).rules.create(id, definition, active, position)?;
        self.rules_changed();
        let rule = self.data.rules.find(id)?;
        let command = JournalCommand::RuleCreate {
            id,
            definition: rule.definition.clone(),
            active: rule.active,
            position: rule.position,
        };
        log_info!("RULE", "rule {} created in '{}'", id, self.name);
        self.write_journal(user, command);
        Ok(id)
    }

    pub fn modify_rule(
        &mut self,
        id: RuleId,
        definition: RuleDefinition,
        active: Option<bool>,
        position: Option<f64>,
        user: &str,
    ) -> Result<()> {
        self.check_rule_definition(&definition, user)?;
        Arc::make_mut(&mut self.data).rules.modify(id, definition, active, position)?;
        self.rules_changed();
        let rule = self.data.rules.find(id)?;
        let command = JournalCommand::RuleModify {
            id,
            definition: rule.definition.clone(),
            active: rule.active,
            position: rule.position,
        };
        self.write_journal(user, command);
        Ok(())
    }

    pub fn destroy_rule(&mut self, id: RuleId, user: &str) -> Result<Rule> {
        let target = self.data.rules.find(id)?.definition.target.clone();
        self.check_right(user, &target, Right::Write)?;
        let rule = Arc::make_mut(&mut self.data).rules.destroy(id)?;
        self.rules_changed();
        log_info!("RULE", "rule {} destroyed in '{}'", id, self.name);
        self.write_journal(user, JournalCommand::RuleDestroy { id });
        Ok(rule)
    }

    pub fn activate_rules(&mut self, ids: &[RuleId], active: bool, user: &str) -> Result<()> {
        for id in ids {
            let target = &self.data.rules.find(*id)?.definition.target;
            self.check_right(user, target, Right::Write)?;
        }
        Arc::make_mut(&mut self.data).rules.activate(ids, active)?;
        self.rules_changed();
        self.write_journal(user, JournalCommand::RuleActivate { ids: ids.to_vec(), active });
        Ok(())
    }

    pub fn move_rule(&mut self, id: RuleId, position: f64, user: &str) -> Result<()> {
        let target = self.data.rules.find(id)?.definition.target.clone();
        self.check_right(user, &target, Right::Write)?;
        Arc::make_mut(&mut self.data).rules.move_rule(id, position)?;
        self.rules_changed();
        self.write_journal(user, JournalCommand::RuleMove { id, position });
        Ok(())
    }

    /// Installs rules read from a rule file without journaling.
    pub fn load_rules(&mut self, rules: Vec<Rule>) -> Result<()> {
        let data = Arc::make_mut(&mut self.data);
        data.rules = Default::default();
        for rule in rules {
            data.rules.insert_loaded(rule)?;
        }
        data.token += 1;
        self.rule_status = CubeStatus::Loaded;
        Ok(())
    }
}
