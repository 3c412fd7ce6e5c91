//! FILENAME: core/engine/src/rollback.rs
//! PURPOSE: Per-lock log of overwritten values, undoable step by step.
//! CONTEXT: Every commit inside a lock appends `(path, previous)` pairs. One
//! external write call forms one step. Older pages spill to CSV files once the
//! in-memory part grows past `max_memory_rollback_size`; the log refuses new
//! entries once memory plus disk would pass both limits combined.

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cell::{CellPath, CellValue, ErrorCode, LockId};
use crate::config::CubeConfig;
use crate::error::{EngineError, Result};
use crate::{log_debug, log_warn};

/// A single overwritten value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub path: CellPath,
    pub previous: CellValue,
}

impl RollbackEntry {
    fn estimated_size(&self) -> usize {
        let value = match &self.previous {
            CellValue::Text(s) => s.len(),
            _ => 8,
        };
        16 + self.path.len() * 4 + value
    }
}

/// A page written to disk.
#[derive(Debug)]
struct SpilledPage {
    file: PathBuf,
    entries: usize,
    bytes: usize,
}

#[derive(Debug)]
pub struct RollbackLog {
    lock_id: LockId,
    file_prefix: String,
    dir: PathBuf,
    /// Newest entries, oldest first.
    memory: Vec<RollbackEntry>,
    memory_bytes: usize,
    /// Spilled pages, oldest first. Together with `memory` they form one sequence.
    pages: Vec<SpilledPage>,
    file_bytes: usize,
    /// Total entry count at the start of every step.
    steps: Vec<usize>,
    open_step: bool,
    page_counter: usize,
    max_memory: usize,
    max_file: usize,
}

impl RollbackLog {
    pub fn new(cube_name: &str, lock_id: LockId, config: &CubeConfig) -> Self {
        RollbackLog {
            lock_id,
            file_prefix: format!("{}_lock_{}", sanitize(cube_name), lock_id),
            dir: config.rollback_dir(),
            memory: Vec::new(),
            memory_bytes: 0,
            pages: Vec::new(),
            file_bytes: 0,
            steps: Vec::new(),
            open_step: false,
            page_counter: 0,
            max_memory: config.max_memory_rollback_size,
            max_file: config.max_file_rollback_size,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.memory.len() + self.pages.iter().map(|p| p.entries).sum::<usize>()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub fn file_bytes(&self) -> usize {
        self.file_bytes
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    // ========================================================================
    // RECORDING
    // ========================================================================

    /// Opens a step. Entries recorded until `end_step` belong to it.
    pub fn begin_step(&mut self) {
        if !self.open_step {
            self.steps.push(self.entry_count());
            self.open_step = true;
        }
    }

    /// Closes the open step, dropping it if nothing was recorded.
    pub fn end_step(&mut self) {
        if self.open_step {
            self.open_step = false;
            if self.steps.last() == Some(&self.entry_count()) {
                self.steps.pop();
            }
        }
    }

    pub fn record(&mut self, path: CellPath, previous: CellValue) -> Result<()> {
        let entry = RollbackEntry { path, previous };
        let size = entry.estimated_size();
        if self.memory_bytes + self.file_bytes + size > self.max_memory + self.max_file {
            log_warn!("ROLLBACK", "lock {} rollback log is full", self.lock_id);
            return Err(EngineError::RollbackCapacityExceeded(self.lock_id));
        }
        let implicit_step = !self.open_step;
        if implicit_step {
            self.begin_step();
        }
        self.memory.push(entry);
        self.memory_bytes += size;
        if implicit_step {
            self.end_step();
        }
        if self.memory_bytes > self.max_memory {
            self.spill()?;
        }
        Ok(())
    }

    /// Fails when `entries` would not fit into memory and disk together.
    pub fn check_capacity(&self, entries: &[RollbackEntry]) -> Result<()> {
        let needed: usize = entries.iter().map(|e| e.estimated_size()).sum();
        if self.memory_bytes + self.file_bytes + needed > self.max_memory + self.max_file {
            log_warn!("ROLLBACK", "lock {} rollback log is full", self.lock_id);
            return Err(EngineError::RollbackCapacityExceeded(self.lock_id));
        }
        Ok(())
    }

    pub fn record_all(&mut self, entries: Vec<RollbackEntry>) -> Result<()> {
        for entry in entries {
            self.record(entry.path, entry.previous)?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        self.page_counter += 1;
        let file = self.dir.join(format!("{}_{}.csv", self.file_prefix, self.page_counter));
        let entries = std::mem::take(&mut self.memory);
        let bytes = std::mem::replace(&mut self.memory_bytes, 0);
        write_page(&file, &entries)?;
        log_debug!("ROLLBACK", "lock {} spilled {} entries to {}", self.lock_id, entries.len(), file.display());
        self.file_bytes += bytes;
        self.pages.push(SpilledPage { file, entries: entries.len(), bytes });
        Ok(())
    }

    // ========================================================================
    // ROLLBACK
    // ========================================================================

    /// Number of newest steps `steps` stands for (all of them when 0 or too large).
    fn resolve_steps(&self, steps: usize) -> usize {
        if steps == 0 || steps > self.steps.len() {
            self.steps.len()
        } else {
            steps
        }
    }

    /// Reloads spilled pages until memory holds every entry from `mark` on.
    fn load_back(&mut self, mark: usize) -> Result<()> {
        while self.entry_count() - self.memory.len() > mark {
            let Some(page) = self.pages.last() else {
                break;
            };
            let mut entries = read_page(&page.file)?;
            let _ = fs::remove_file(&page.file);
            let bytes = page.bytes;
            self.pages.pop();
            self.file_bytes -= bytes;
            entries.append(&mut self.memory);
            self.memory = entries;
            self.memory_bytes += bytes;
        }
        Ok(())
    }

    /// Position in `memory` of entry number `mark`.
    fn memory_index(&self, mark: usize) -> usize {
        let in_memory_start = self.entry_count() - self.memory.len();
        mark.saturating_sub(in_memory_start).min(self.memory.len())
    }

    /// Entries of the newest `steps` steps, most recent first. The log keeps
    /// them until `discard_steps`.
    pub fn peek_steps(&mut self, steps: usize) -> Result<Vec<RollbackEntry>> {
        self.end_step();
        let count = self.resolve_steps(steps);
        if count == 0 {
            return Ok(Vec::new());
        }
        let keep = self.steps[self.steps.len() - count];
        self.load_back(keep)?;
        let split = self.memory_index(keep);
        Ok(self.memory[split..].iter().rev().cloned().collect())
    }

    /// Forgets the newest `steps` steps once their values are restored.
    pub fn discard_steps(&mut self, steps: usize) -> Result<()> {
        self.end_step();
        let count = self.resolve_steps(steps);
        if count == 0 {
            return Ok(());
        }
        let keep = self.steps[self.steps.len() - count];
        self.rewind(keep)
    }

    /// Removes the newest `steps` steps and returns their entries most-recent-first.
    pub fn pop_steps(&mut self, steps: usize) -> Result<Vec<RollbackEntry>> {
        let entries = self.peek_steps(steps)?;
        self.discard_steps(steps)?;
        Ok(entries)
    }

    /// Drops every entry from number `mark` on, and the steps starting there.
    pub fn rewind(&mut self, mark: usize) -> Result<()> {
        self.load_back(mark)?;
        let split = self.memory_index(mark);
        let dropped = self.memory.split_off(split);
        let dropped_bytes: usize = dropped.iter().map(|e| e.estimated_size()).sum();
        self.memory_bytes = self.memory_bytes.saturating_sub(dropped_bytes);
        while let Some(&start) = self.steps.last() {
            let open = self.open_step && start == mark;
            if start < mark || open {
                break;
            }
            self.steps.pop();
        }
        Ok(())
    }

    /// Deletes spilled pages and forgets every step.
    pub fn clear(&mut self) {
        for page in self.pages.drain(..) {
            let _ = fs::remove_file(&page.file);
        }
        self.memory.clear();
        self.memory_bytes = 0;
        self.file_bytes = 0;
        self.steps.clear();
        self.open_step = false;
    }
}

impl Drop for RollbackLog {
    fn drop(&mut self) {
        self.clear();
    }
}

fn sanitize(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}

// ============================================================================
// PAGE FILES
// ============================================================================

// Format:
//   VALUES
//   <id>,<id>,...;<N|S|E|X>;<value>

fn write_page(file: &PathBuf, entries: &[RollbackEntry]) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(file)?);
    writeln!(out, "VALUES")?;
    for entry in entries {
        let path: Vec<String> = entry.path.iter().map(|e| e.to_string()).collect();
        let (tag, value) = match &entry.previous {
            CellValue::Empty => ("X", String::new()),
            CellValue::Number(n) => ("N", n.to_string()),
            CellValue::Text(s) => ("S", escape(s)),
            CellValue::Error(code) => ("E", format!("{:?}", code)),
        };
        writeln!(out, "{};{};{}", path.join(","), tag, value)?;
    }
    out.flush()?;
    Ok(())
}

fn read_page(file: &PathBuf) -> Result<Vec<RollbackEntry>> {
    let reader = BufReader::new(fs::File::open(file)?);
    let mut entries = Vec::new();
    let mut in_values = false;
    for line in reader.lines() {
        let line = line?;
        if line == "VALUES" {
            in_values = true;
            continue;
        }
        if !in_values || line.is_empty() {
            continue;
        }
        entries.push(parse_line(&line).ok_or_else(|| {
            EngineError::FileFormatError(format!("bad rollback line in {}: {}", file.display(), line))
        })?);
    }
    Ok(entries)
}

fn parse_line(line: &str) -> Option<RollbackEntry> {
    let mut parts = line.splitn(3, ';');
    let path_text = parts.next()?;
    let tag = parts.next()?;
    let value = parts.next().unwrap_or("");
    let mut path = CellPath::new();
    for id in path_text.split(',').filter(|s| !s.is_empty()) {
        path.push(id.parse().ok()?);
    }
    let previous = match tag {
        "X" => CellValue::Empty,
        "N" => CellValue::Number(value.parse().ok()?),
        "S" => CellValue::Text(unescape(value)),
        "E" => CellValue::Error(match value {
            "Div0" => ErrorCode::Div0,
            "Ref" => ErrorCode::Ref,
            "Recursion" => ErrorCode::Recursion,
            _ => ErrorCode::Value,
        }),
        _ => return None,
    };
    Some(RollbackEntry { path, previous })
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\n', "\\n").replace('\r', "\\r")
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn config(dir: &std::path::Path, memory: usize, file: usize) -> CubeConfig {
        let mut config = CubeConfig::default();
        config.rollback_dir = Some(dir.to_path_buf());
        config.max_memory_rollback_size = memory;
        config.max_file_rollback_size = file;
        config
    }

    #[test]
    fn test_steps_pop_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RollbackLog::new("Sales", 1, &config(dir.path(), 1 << 20, 1 << 20));
        log.begin_step();
        log.record(smallvec![0, 0], CellValue::Number(1.0)).unwrap();
        log.record(smallvec![0, 1], CellValue::Empty).unwrap();
        log.end_step();
        log.begin_step();
        log.end_step();
        log.begin_step();
        log.record(smallvec![0, 0], CellValue::Number(2.0)).unwrap();
        log.end_step();
        assert_eq!(log.step_count(), 2);

        let last = log.pop_steps(1).unwrap();
        assert_eq!(last, vec![RollbackEntry { path: smallvec![0, 0], previous: CellValue::Number(2.0) }]);
        let rest = log.pop_steps(0).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].path.as_slice(), &[0, 1]);
        assert!(log.is_empty());
    }

    #[test]
    fn test_spill_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        // each entry is 28 bytes, so a page spills every 2 entries
        let mut log = RollbackLog::new("Sales cube", 3, &config(dir.path(), 40, 1 << 20));
        for i in 0..5u32 {
            log.begin_step();
            log.record(smallvec![i, 0], CellValue::Text(format!("v;{}\n", i))).unwrap();
            log.end_step();
        }
        assert!(log.page_count() > 0);
        assert!(dir.path().join("Sales_cube_lock_3_1.csv").exists());

        let entries = log.pop_steps(0).unwrap();
        let paths: Vec<u32> = entries.iter().map(|e| e.path[0]).collect();
        assert_eq!(paths, vec![4, 3, 2, 1, 0]);
        assert_eq!(entries[4].previous, CellValue::Text("v;0\n".to_string()));
        assert_eq!(log.page_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_capacity_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RollbackLog::new("Sales", 9, &config(dir.path(), 40, 40));
        log.record(smallvec![0, 0], CellValue::Number(1.0)).unwrap();
        log.record(smallvec![0, 1], CellValue::Number(1.0)).unwrap();
        let err = log.record(smallvec![0, 2], CellValue::Number(1.0)).unwrap_err();
        assert!(matches!(err, EngineError::RollbackCapacityExceeded(9)));

        let one = RollbackEntry { path: smallvec![1, 0], previous: CellValue::Empty };
        assert!(log.check_capacity(&[]).is_ok());
        assert!(matches!(log.check_capacity(&[one]), Err(EngineError::RollbackCapacityExceeded(9))));
    }

    #[test]
    fn test_peek_keeps_entries_until_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RollbackLog::new("Sales", 2, &config(dir.path(), 40, 1 << 20));
        for i in 0..3u32 {
            log.begin_step();
            log.record(smallvec![i, 0], CellValue::Number(i as f64)).unwrap();
            log.end_step();
        }
        assert!(log.page_count() > 0);

        let peeked = log.peek_steps(2).unwrap();
        assert_eq!(peeked.iter().map(|e| e.path[0]).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(log.step_count(), 3);
        assert_eq!(log.peek_steps(2).unwrap(), peeked);

        log.discard_steps(2).unwrap();
        assert_eq!(log.step_count(), 1);
        assert_eq!(log.entry_count(), 1);
        assert_eq!(log.pop_steps(0).unwrap()[0].previous, CellValue::Number(0.0));
    }

    #[test]
    fn test_rewind_drops_a_partial_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RollbackLog::new("Sales", 4, &config(dir.path(), 1 << 20, 1 << 20));
        log.record(smallvec![0, 0], CellValue::Number(1.0)).unwrap();
        log.begin_step();
        let mark = log.entry_count();
        log.record(smallvec![0, 1], CellValue::Number(2.0)).unwrap();
        log.record(smallvec![0, 2], CellValue::Number(3.0)).unwrap();
        log.rewind(mark).unwrap();
        log.end_step();

        assert_eq!(log.entry_count(), 1);
        assert_eq!(log.step_count(), 1);
        assert_eq!(log.memory_bytes(), 32);
    }
}
