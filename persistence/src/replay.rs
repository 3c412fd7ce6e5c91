//! FILENAME: core/persistence/src/replay.rs
//! PURPOSE: Re-applies journal records to a cube after loading it.
//! CONTEXT: Replay is tolerant: an entry that fails (a path or rule that no
//! longer exists) is logged and skipped, unknown commands are logged and
//! skipped. Only a journal written by a newer version stops the replay.
//! The cube's own journal sink is detached so nothing is journaled twice.

use engine::{log_debug, log_error, log_info, log_warn};
use engine::{
    BulkOptions, CellPath, CellValue, Cube, CubeResolver, JournalCommand, JournalEntry, SplashMode, WriteOptions,
    JOURNAL_VERSION,
};

use crate::journal_file::JournalRecord;
use crate::PersistenceError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Cell writes collected between CELL_REPLACE_BULK_START and _STOP.
struct PendingBulk {
    line: usize,
    user: String,
    disjunctive: bool,
    cells: Vec<(CellPath, CellValue)>,
    /// Entries that need their own write options.
    singles: Vec<(CellPath, CellValue, WriteOptions)>,
}

pub fn replay_journal(
    cube: &mut Cube,
    records: Vec<JournalRecord>,
    others: &dyn CubeResolver,
) -> Result<ReplayReport, PersistenceError> {
    let sink = cube.take_journal();
    let result = replay_records(cube, records, others);
    cube.set_journal(sink);
    result
}

fn replay_records(
    cube: &mut Cube,
    records: Vec<JournalRecord>,
    others: &dyn CubeResolver,
) -> Result<ReplayReport, PersistenceError> {
    let mut report = ReplayReport::default();
    let mut bulk: Option<PendingBulk> = None;

    for record in records {
        let (line, entry) = match record {
            JournalRecord::Entry { line, entry } => (line, entry),
            JournalRecord::Unknown { line, command } => {
                log_info!("JOURNAL", "cube '{}' line {}: unknown command {} skipped", cube.name(), line, command);
                report.skipped += 1;
                continue;
            }
            JournalRecord::Invalid { line, command, error } => {
                log_error!("JOURNAL", "cube '{}' line {}: {} unreadable: {}", cube.name(), line, command, error);
                report.failed += 1;
                continue;
            }
        };
        let JournalEntry { user, command, .. } = entry;

        match command {
            JournalCommand::Version { version } => {
                if version > JOURNAL_VERSION {
                    return Err(PersistenceError::UnsupportedVersion(version));
                }
            }
            JournalCommand::CellReplaceBulkStart { disjunctive } => {
                if let Some(open) = bulk.take() {
                    log_warn!("JOURNAL", "cube '{}' line {}: bulk without stop", cube.name(), open.line);
                    finish_bulk(cube, open, others, &mut report);
                }
                bulk = Some(PendingBulk { line, user, disjunctive, cells: Vec::new(), singles: Vec::new() });
            }
            JournalCommand::CellReplaceBulkStop => match bulk.take() {
                Some(open) => finish_bulk(cube, open, others, &mut report),
                None => log_warn!("JOURNAL", "cube '{}' line {}: bulk stop without start", cube.name(), line),
            },
            command => {
                if let Some(open) = bulk.as_mut() {
                    if collect_bulk_cell(open, &command) {
                        continue;
                    }
                }
                let name = command.name();
                match apply_command(cube, &user, command, others) {
                    Ok(()) => report.applied += 1,
                    Err(e) => {
                        log_error!("JOURNAL", "cube '{}' line {}: {} failed: {}", cube.name(), line, name, e);
                        report.failed += 1;
                    }
                }
            }
        }
    }

    if let Some(open) = bulk.take() {
        log_warn!("JOURNAL", "cube '{}' line {}: bulk without stop", cube.name(), open.line);
        finish_bulk(cube, open, others, &mut report);
    }
    log_info!(
        "JOURNAL",
        "cube '{}': {} entries replayed, {} skipped, {} failed",
        cube.name(),
        report.applied,
        report.skipped,
        report.failed
    );
    Ok(report)
}

/// Buffers a cell write of an open bulk. Returns false for other commands.
fn collect_bulk_cell(bulk: &mut PendingBulk, command: &JournalCommand) -> bool {
    let (path, value, options) = match command {
        JournalCommand::CellReplaceDouble { path, value, add, splash } => (
            path.clone(),
            CellValue::Number(*value),
            WriteOptions { add: *add, splash: *splash, ..WriteOptions::replay() },
        ),
        JournalCommand::CellReplaceString { path, value } => {
            (path.clone(), CellValue::Text(value.clone()), WriteOptions::replay())
        }
        JournalCommand::CellClear { path } => (path.clone(), CellValue::Empty, WriteOptions::replay()),
        _ => return false,
    };
    if options.add || options.splash != SplashMode::Default {
        bulk.singles.push((path, value, options));
    } else {
        bulk.cells.push((path, value));
    }
    true
}

fn finish_bulk(cube: &mut Cube, bulk: PendingBulk, others: &dyn CubeResolver, report: &mut ReplayReport) {
    for (path, value, options) in bulk.singles {
        match cube.set_cell_value(&path, value, &[], &bulk.user, options, others) {
            Ok(_) => report.applied += 1,
            Err(e) => {
                log_error!("JOURNAL", "cube '{}' bulk at line {}: {:?} failed: {}", cube.name(), bulk.line, path, e);
                report.failed += 1;
            }
        }
    }
    if bulk.cells.is_empty() {
        return;
    }
    let count = bulk.cells.len();
    let options = BulkOptions { disjunctive: bulk.disjunctive, additive: false };
    match cube.set_cell_values(bulk.cells, &bulk.user, WriteOptions::replay(), options, others) {
        Ok(result) => {
            for (index, error) in &result.failures {
                log_error!("JOURNAL", "cube '{}' bulk at line {}: cell {} failed: {}", cube.name(), bulk.line, index, error);
            }
            report.failed += result.failures.len();
            report.applied += count - result.failures.len();
        }
        Err(e) => {
            log_error!("JOURNAL", "cube '{}' bulk at line {}: failed: {}", cube.name(), bulk.line, e);
            report.failed += count;
        }
    }
}

fn apply_command(cube: &mut Cube, user: &str, command: JournalCommand, others: &dyn CubeResolver) -> engine::Result<()> {
    match command {
        JournalCommand::CellReplaceDouble { path, value, add, splash } => {
            let options = WriteOptions { add, splash, ..WriteOptions::replay() };
            cube.set_cell_value(&path, CellValue::Number(value), &[], user, options, others)?;
        }
        JournalCommand::CellReplaceString { path, value } => {
            cube.set_cell_value(&path, CellValue::Text(value), &[], user, WriteOptions::replay(), others)?;
        }
        JournalCommand::CellClear { path } => {
            cube.clear_cell(&path, user)?;
        }
        JournalCommand::CubeClear => {
            cube.clear_cube(user)?;
        }
        JournalCommand::CubeAreaClear { area } => {
            cube.clear_cells(&area, user)?;
        }
        JournalCommand::CellGoalseek { path, value, kind } => {
            cube.goal_seek(&path, value, kind, user, others)?;
        }
        JournalCommand::CellCopy { from, to, value, use_rules } => {
            cube.copy_cells(&from, &to, value, use_rules, &[], user, others)?;
        }
        JournalCommand::RuleCreate { id, definition, active, position } => {
            if cube.rule(id).is_ok() {
                log_debug!("JOURNAL", "rule {} of '{}' exists, replaying create as modify", id, cube.name());
                cube.modify_rule(id, definition, Some(active), Some(position), user)?;
            } else {
                cube.create_rule(Some(id), definition, active, Some(position), user)?;
            }
        }
        JournalCommand::RuleModify { id, definition, active, position } => {
            cube.modify_rule(id, definition, Some(active), Some(position), user)?;
        }
        JournalCommand::RuleDestroy { id } => {
            cube.destroy_rule(id, user)?;
        }
        JournalCommand::RuleActivate { ids, active } => {
            cube.activate_rules(&ids, active, user)?;
        }
        JournalCommand::RuleMove { id, position } => {
            cube.move_rule(id, position, user)?;
        }
        JournalCommand::Version { .. } | JournalCommand::CellReplaceBulkStart { .. } | JournalCommand::CellReplaceBulkStop => {}
    }
    Ok(())
}
