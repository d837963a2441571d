//! Free-form diagnostic log: plain text lines appended to a single file,
//! truncated at attach. Not structured, not rotated, and not a contract
//! surface for anything else; purely a developer side channel.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};

static SINK: Mutex<Option<File>> = Mutex::new(None);
static MIRROR: AtomicBool = AtomicBool::new(false);

/// Truncate and open the log file, creating its directory if absent.
/// `mirror` additionally echoes every line to stderr.
pub fn init(path: &Path, mirror: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating diagnostics directory {}", parent.display()))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    if let Ok(mut sink) = SINK.lock() {
        *sink = Some(file);
    }
    MIRROR.store(mirror, Ordering::Relaxed);
    Ok(())
}

/// Append one line. Before `init` (and in unit tests) lines simply go
/// nowhere unless mirroring is on; logging must never be a reason to fail.
pub fn line(args: fmt::Arguments<'_>) {
    if MIRROR.load(Ordering::Relaxed) {
        eprintln!("[raven_engine] {args}");
    }
    if let Ok(mut sink) = SINK.lock() {
        if let Some(file) = sink.as_mut() {
            let _ = writeln!(file, "{args}");
        }
    }
}

#[macro_export]
macro_rules! diag {
    ($($arg:tt)*) => {
        $crate::logging::line(format_args!($($arg)*))
    };
}
