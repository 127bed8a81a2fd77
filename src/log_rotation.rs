//! Console log rotation.
//!
//! Guests write their serial console into `machine.log` inside the state
//! directory. An oversized log is rotated when the machine is started
//! again; rotated generations follow the pattern `machine.log.1`,
//! `machine.log.2`, ... and are removed together with the machine.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Maximum log file size before rotation (10 MiB).
pub const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Maximum number of rotated log files to keep.
pub const MAX_LOG_FILES: usize = 3;

fn generation(log_path: &Path, n: usize) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

/// Rotate a log file if it is at least `max_size` bytes.
///
/// Returns `Ok(true)` if rotation occurred. A missing log is not an error.
pub fn rotate_if_larger(log_path: &Path, max_size: u64) -> io::Result<bool> {
    let metadata = match fs::metadata(log_path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if metadata.len() < max_size {
        return Ok(false);
    }

    rotate(log_path)?;
    Ok(true)
}

/// Rotate a log file if it exceeds [`MAX_LOG_SIZE`].
pub fn rotate_if_needed(log_path: &Path) -> io::Result<bool> {
    rotate_if_larger(log_path, MAX_LOG_SIZE)
}

/// Rotate a log file regardless of size.
///
/// The current log becomes `.1`, `.1` becomes `.2` and so on; the oldest
/// generation is dropped.
pub fn rotate(log_path: &Path) -> io::Result<()> {
    let oldest = generation(log_path, MAX_LOG_FILES);
    match fs::remove_file(&oldest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    for i in (1..MAX_LOG_FILES).rev() {
        let from = generation(log_path, i);
        if from.exists() {
            fs::rename(&from, generation(log_path, i + 1))?;
        }
    }

    fs::rename(log_path, generation(log_path, 1))
}

/// Remove the log and every rotated generation.
///
/// Files that are already gone are skipped.
pub fn cleanup_logs(log_path: &Path) -> io::Result<()> {
    let paths = std::iter::once(log_path.to_path_buf())
        .chain((1..=MAX_LOG_FILES).map(|i| generation(log_path, i)));

    for path in paths {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
