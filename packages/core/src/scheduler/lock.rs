//! Cross-process guard so only one process runs scheduled jobs.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// An exclusive OS lock on a file. Released when dropped.
#[derive(Debug)]
pub struct SchedulerLock {
    file: File,
    path: PathBuf,
}

impl SchedulerLock {
    /// Try to take the lock without waiting. `Ok(None)` means another
    /// process (or another handle in this one) already holds it.
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Error(e)) => return Err(e),
        }

        // Owner pid, for operators inspecting the file.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Some(Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release scheduler lock");
        }
    }
}
