//! FILENAME: core/engine/src/journal.rs
//! PURPOSE: Journal records of cube mutations and the sink they are written to.
//! CONTEXT: A cube appends one `JournalEntry` after each mutation has been
//! applied in memory. The persistence crate provides the file-backed sink and
//! replays entries at load time; `MemoryJournal` serves tests and embedders.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::area::Area;
use crate::cell::{CellPath, RuleId};
use crate::cube::{CopyValue, SplashMode};
use crate::error::{EngineError, Result};
use crate::goal_seek::GoalSeekKind;
use crate::rule::RuleDefinition;

/// Current journal format version, written as the first entry of every file.
pub const JOURNAL_VERSION: u32 = 1;

/// One journaled operation. Serialized with a `command` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalCommand {
    Version {
        version: u32,
    },
    CellReplaceDouble {
        path: CellPath,
        value: f64,
        #[serde(default)]
        add: bool,
        #[serde(default)]
        splash: SplashMode,
    },
    CellReplaceString {
        path: CellPath,
        value: String,
    },
    CellClear {
        path: CellPath,
    },
    CubeClear,
    CubeAreaClear {
        area: Area,
    },
    CellReplaceBulkStart {
        #[serde(default)]
        disjunctive: bool,
    },
    CellReplaceBulkStop,
    CellGoalseek {
        path: CellPath,
        value: f64,
        kind: GoalSeekKind,
    },
    CellCopy {
        from: CellPath,
        to: CellPath,
        value: CopyValue,
        #[serde(default)]
        use_rules: bool,
    },
    RuleCreate {
        id: RuleId,
        definition: RuleDefinition,
        active: bool,
        position: f64,
    },
    RuleModify {
        id: RuleId,
        definition: RuleDefinition,
        active: bool,
        position: f64,
    },
    RuleDestroy {
        id: RuleId,
    },
    RuleActivate {
        ids: Vec<RuleId>,
        active: bool,
    },
    RuleMove {
        id: RuleId,
        position: f64,
    },
}

/// Every value of the `command` field this version understands.
pub const COMMAND_NAMES: &[&str] = &[
    "VERSION",
    "CELL_REPLACE_DOUBLE",
    "CELL_REPLACE_STRING",
    "CELL_CLEAR",
    "CUBE_CLEAR",
    "CUBE_AREA_CLEAR",
    "CELL_REPLACE_BULK_START",
    "CELL_REPLACE_BULK_STOP",
    "CELL_GOALSEEK",
    "CELL_COPY",
    "RULE_CREATE",
    "RULE_MODIFY",
    "RULE_DESTROY",
    "RULE_ACTIVATE",
    "RULE_MOVE",
];

impl JournalCommand {
    pub fn is_known_name(name: &str) -> bool {
        COMMAND_NAMES.contains(&name)
    }

    /// Name written in the `command` field.
    pub fn name(&self) -> &'static str {
        match self {
            JournalCommand::Version { .. } => "VERSION",
            JournalCommand::CellReplaceDouble { .. } => "CELL_REPLACE_DOUBLE",
            JournalCommand::CellReplaceString { .. } => "CELL_REPLACE_STRING",
            JournalCommand::CellClear { .. } => "CELL_CLEAR",
            JournalCommand::CubeClear => "CUBE_CLEAR",
            JournalCommand::CubeAreaClear { .. } => "CUBE_AREA_CLEAR",
            JournalCommand::CellReplaceBulkStart { .. } => "CELL_REPLACE_BULK_START",
            JournalCommand::CellReplaceBulkStop => "CELL_REPLACE_BULK_STOP",
            JournalCommand::CellGoalseek { .. } => "CELL_GOALSEEK",
            JournalCommand::CellCopy { .. } => "CELL_COPY",
            JournalCommand::RuleCreate { .. } => "RULE_CREATE",
            JournalCommand::RuleModify { .. } => "RULE_MODIFY",
            JournalCommand::RuleDestroy { .. } => "RULE_DESTROY",
            JournalCommand::RuleActivate { .. } => "RULE_ACTIVATE",
            JournalCommand::RuleMove { .. } => "RULE_MOVE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub user: String,
    /// Client event that caused the mutation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub command: JournalCommand,
}

impl JournalEntry {
    pub fn new(user: &str, command: JournalCommand) -> Self {
        JournalEntry {
            user: user.to_string(),
            event: None,
            timestamp: Utc::now(),
            command,
        }
    }
}

/// Destination of journal entries.
pub trait JournalSink: Send {
    fn append(&mut self, entry: &JournalEntry) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps entries in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JournalSink for MemoryJournal {
    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| EngineError::ResourceExhausted("journal buffer poisoned".to_string()))?
            .push(entry.clone());
        Ok(())
    }
}
