//! FILENAME: core/engine/src/logging.rs
//! PURPOSE: Category-based logging macros for the cube engine.
//! CONTEXT: Every line carries a sequence number and a subsystem category
//! (SPLASH, MARKER, JOURNAL, ...). Lines are forwarded to the `log` facade
//! with the category as target, so the embedding process decides where they go.

use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// SEQUENCED LOG LINES
// ============================================================================

/// Global sequence counter, shared by all cubes of the process.
static LOG_SEQ: AtomicU64 = AtomicU64::new(0);

/// Get next sequence number
pub fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst) + 1
}

/// Maps the one-letter level used by the macros onto `log::Level`.
fn level_of(level: &str) -> log::Level {
    match level {
        "E" => log::Level::Error,
        "W" => log::Level::Warn,
        "I" => log::Level::Info,
        "T" => log::Level::Trace,
        _ => log::Level::Debug,
    }
}

/// Formats a line as `seq|level|category|message`.
pub fn format_line(seq: u64, level: &str, category: &str, message: &str) -> String {
    format!("{}|{}|{}|{}", seq, level, category, message)
}

/// `log` target of a category, e.g. `cube_engine::SPLASH`.
pub fn target_of(category: &str) -> String {
    format!("cube_engine::{}", category)
}

pub fn write_log(level: &str, category: &str, message: &str) {
    let lvl = level_of(level);
    let target = target_of(category);
    if !log::log_enabled!(target: &target, lvl) {
        return;
    }
    let seq = next_seq();
    log::log!(target: &target, lvl, "{}", format_line(seq, level, category, message));
}

#[macro_export]
macro_rules! log_debug {
    ($cat:expr, $($arg:tt)*) => {
        $crate::logging::write_log("D", $cat, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($cat:expr, $($arg:tt)*) => {
        $crate::logging::write_log("I", $cat, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($cat:expr, $($arg:tt)*) => {
        $crate::logging::write_log("W", $cat, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($cat:expr, $($arg:tt)*) => {
        $crate::logging::write_log("E", $cat, &format!($($arg)*))
    };
}
