use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::TrackerError;

/// Advisory lock: an exclusively created file, removed when dropped.
///
/// Only one cycle per symbol may run the read-decide-write sequence. A lock file
/// left behind by a crashed process has to be removed by the operator.
#[derive(Debug)]
pub struct TrackerLock {
    path: PathBuf,
}

impl TrackerLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        Self::acquire_with(path.into(), write_owner)
    }

    /// Create the lock file and stamp it; a failed stamp removes the file again
    fn acquire_with(
        path: PathBuf,
        stamp: impl FnOnce(&mut File) -> std::io::Result<()>,
    ) -> Result<Self, TrackerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TrackerError::io(parent, e))?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(TrackerError::Locked { path });
            }
            Err(e) => return Err(TrackerError::io(&path, e)),
        };

        if let Err(e) = stamp(&mut file) {
            drop(file);
            let _ = std::fs::remove_file(&path);
            return Err(TrackerError::io(&path, e));
        }

        debug!("Tracker lock acquired: {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_owner(out: &mut File) -> std::io::Result<()> {
    writeln!(
        out,
        "pid={} acquired_at={}",
        std::process::id(),
        chrono::Utc::now().to_rfc3339()
    )
}

impl Drop for TrackerLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release tracker lock {}: {}", self.path.display(), e);
        } else {
            debug!("Tracker lock released: {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::test_support::temp_state_dir;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let dir = temp_state_dir();
        let path = dir.join("tracker_BTC-USDT.json.lock");

        let first = TrackerLock::acquire(&path).unwrap();
        assert!(matches!(
            TrackerLock::acquire(&path),
            Err(TrackerError::Locked { .. })
        ));

        drop(first);
        assert!(!path.exists());
        assert!(TrackerLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_failed_stamp_leaves_no_lock_behind() {
        let dir = temp_state_dir();
        let path = dir.join("tracker_BTC-USDT.json.lock");

        let result = TrackerLock::acquire_with(path.clone(), |_| {
            Err(std::io::Error::new(ErrorKind::Other, "disk full"))
        });

        assert!(matches!(result, Err(TrackerError::Io { .. })));
        assert!(!path.exists());
        assert!(TrackerLock::acquire(&path).is_ok());
    }
}
