//! FILENAME: core/persistence/src/journal_file.rs
//! PURPOSE: File-backed journal: append, read back and archive.
//! CONTEXT: One JSON object per line. A fresh file starts with a VERSION
//! entry. Reading keeps unknown commands as `JournalRecord::Unknown` so the
//! replayer can skip them; a torn last line (crash while appending) is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use engine::{log_info, log_warn};
use engine::{EngineError, JournalCommand, JournalEntry, JournalSink, JOURNAL_VERSION};

use crate::PersistenceError;

/// Appends entries to a journal file.
#[derive(Debug)]
pub struct JournalFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JournalFile {
    /// Opens `path` for appending, creating it with a VERSION entry if needed.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut journal = JournalFile { path: path.to_path_buf(), writer: BufWriter::new(file) };
        if fresh {
            let entry = JournalEntry::new("", JournalCommand::Version { version: JOURNAL_VERSION });
            journal.write_entry(&entry)?;
            journal.writer.flush()?;
        }
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entry(&mut self, entry: &JournalEntry) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")
    }
}

impl JournalSink for JournalFile {
    fn append(&mut self, entry: &JournalEntry) -> engine::Result<()> {
        self.write_entry(entry)?;
        Ok(())
    }

    fn flush(&mut self) -> engine::Result<()> {
        self.writer.flush().map_err(EngineError::from)
    }
}

/// One line of a journal file.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    Entry { line: usize, entry: JournalEntry },
    /// A command this version does not know.
    Unknown { line: usize, command: String },
    /// A known command whose arguments could not be read.
    Invalid { line: usize, command: String, error: String },
}

impl JournalRecord {
    pub fn line(&self) -> usize {
        match self {
            JournalRecord::Entry { line, .. }
            | JournalRecord::Unknown { line, .. }
            | JournalRecord::Invalid { line, .. } => *line,
        }
    }
}

/// Reads every record of a journal file. A missing file is an empty journal.
pub fn read_journal(path: &Path) -> Result<Vec<JournalRecord>, PersistenceError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let lines = BufReader::new(File::open(path)?).lines().collect::<std::io::Result<Vec<String>>>()?;
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    let mut records = Vec::with_capacity(lines.len());

    for (index, line) in lines.iter().enumerate() {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let number = index + 1;
        let value: Option<serde_json::Value> = serde_json::from_str(text).ok();
        let command = value
            .as_ref()
            .and_then(|v| v.get("command"))
            .and_then(|c| c.as_str())
            .map(str::to_string);
        let (Some(value), Some(command)) = (value, command) else {
            if Some(index) == last {
                log_warn!("JOURNAL", "{}:{}: incomplete last entry dropped", path.display(), number);
                break;
            }
            return Err(PersistenceError::InvalidFormat(format!(
                "{}:{}: not a journal entry",
                path.display(),
                number
            )));
        };
        let record = match serde_json::from_value::<JournalEntry>(value) {
            Ok(entry) => JournalRecord::Entry { line: number, entry },
            Err(e) if JournalCommand::is_known_name(&command) => {
                JournalRecord::Invalid { line: number, command, error: e.to_string() }
            }
            Err(_) => JournalRecord::Unknown { line: number, command },
        };
        records.push(record);
    }
    Ok(records)
}

/// Moves a journal aside after a clean save. Returns the archive path, or
/// `None` when there was nothing to archive.
pub fn archive_journal(path: &Path) -> Result<Option<PathBuf>, PersistenceError> {
    if !path.exists() {
        return Ok(None);
    }
    let has_entries = read_journal(path)?
        .iter()
        .any(|r| !matches!(r, JournalRecord::Entry { entry, .. } if matches!(entry.command, JournalCommand::Version { .. })));
    if !has_entries {
        fs::remove_file(path)?;
        return Ok(None);
    }
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("journal");
    let archive = path.with_file_name(format!("{}.{}.archive", file_name, Utc::now().format("%Y%m%d%H%M%S%3f")));
    fs::rename(path, &archive)?;
    log_info!("JOURNAL", "journal archived to {}", archive.display());
    Ok(Some(archive))
}
