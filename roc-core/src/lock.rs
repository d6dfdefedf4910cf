use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Composite crash-safe channel lock: a `flock`'d file plus a
/// marker file standing in for a named OS mutex. Both are checked on
/// acquisition so a crashed process (which drops its `flock` automatically
/// but leaves the marker file behind) is distinguishable from a live one
/// (which holds both).
#[derive(Debug)]
pub struct ChannelLock {
    file: File,
    lock_path: PathBuf,
    mutex_path: PathBuf,
}

impl ChannelLock {
    /// `try_lock_together`: acquires `lock_path` via `flock(LOCK_EX | LOCK_NB)`
    /// and creates `mutex_path` with `O_CREAT | O_EXCL`.
    ///
    /// - Both acquire → locked.
    /// - Only the file lock acquires (mutex file already exists) → the
    ///   mutex was orphaned by a crashed process: `NamedMutexLocked`,
    ///   unless `force_unlock` is set, in which case the stale mutex file
    ///   is removed once and the acquisition is retried.
    /// - The file lock itself is held by another live process → `FileLocked`.
    pub fn acquire(
        lock_path: impl AsRef<Path>,
        mutex_path: impl AsRef<Path>,
        force_unlock: bool,
    ) -> Result<Self> {
        let lock_path = lock_path.as_ref().to_path_buf();
        let mutex_path = mutex_path.as_ref().to_path_buf();

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::LockFailed {
                reason: format!("could not create {}: {e}", parent.display()),
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|e| Error::LockFailed {
                reason: format!("could not open {}: {e}", lock_path.display()),
            })?;

        if !try_flock(&file) {
            return Err(Error::FileLocked);
        }

        match try_create_mutex_marker(&mutex_path) {
            Ok(()) => Ok(Self {
                file,
                lock_path,
                mutex_path,
            }),
            Err(MutexMarkerError::AlreadyExists) => {
                if force_unlock {
                    fs::remove_file(&mutex_path).map_err(|e| Error::LockFailed {
                        reason: format!(
                            "force-unlock: could not remove stale mutex marker {}: {e}",
                            mutex_path.display()
                        ),
                    })?;
                    try_create_mutex_marker(&mutex_path).map_err(|e| Error::LockFailed {
                        reason: format!("force-unlock retry failed: {e}"),
                    })?;
                    Ok(Self {
                        file,
                        lock_path,
                        mutex_path,
                    })
                } else {
                    Err(Error::NamedMutexLocked)
                }
            }
            Err(MutexMarkerError::Io(e)) => Err(Error::LockFailed {
                reason: format!("could not create {}: {e}", mutex_path.display()),
            }),
        }
    }
}

impl Drop for ChannelLock {
    fn drop(&mut self) {
        // SAFETY: `self.file` owns an `flock`; unlocking it before removing
        // the files avoids a window where the lock file exists unlocked
        // while the mutex marker is still present (which a racing opener
        // could misread as "locked by a live process").
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        let _ = fs::remove_file(&self.mutex_path);
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn try_flock(file: &File) -> bool {
    // SAFETY: `file`'s raw fd is valid for the duration of this call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    rc == 0
}

enum MutexMarkerError {
    AlreadyExists,
    Io(std::io::Error),
}

impl std::fmt::Display for MutexMarkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutexMarkerError::AlreadyExists => write!(f, "mutex marker already exists"),
            MutexMarkerError::Io(e) => write!(f, "{e}"),
        }
    }
}

fn try_create_mutex_marker(mutex_path: &Path) -> std::result::Result<(), MutexMarkerError> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(mutex_path)
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(MutexMarkerError::AlreadyExists)
        }
        Err(e) => Err(MutexMarkerError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_paths() -> (PathBuf, PathBuf) {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let base = std::env::temp_dir().join(format!("roc-core-lock-test-{}-{n}", std::process::id()));
        (base.with_extension("lock"), base.with_extension("lock.mutex"))
    }

    #[test]
    fn second_acquire_fails_with_file_locked_while_first_is_held() {
        let (lock_path, mutex_path) = scratch_paths();
        let first = ChannelLock::acquire(&lock_path, &mutex_path, false).unwrap();
        let err = ChannelLock::acquire(&lock_path, &mutex_path, false).unwrap_err();
        assert!(matches!(err, Error::FileLocked));
        drop(first);
    }

    #[test]
    fn orphaned_mutex_marker_requires_force_unlock() {
        let (lock_path, mutex_path) = scratch_paths();
        let lock = ChannelLock::acquire(&lock_path, &mutex_path, false).unwrap();
        // Simulate a crash: drop the flock without running our Drop impl,
        // leaving the mutex marker file behind.
        unsafe {
            libc::flock(lock.file.as_raw_fd(), libc::LOCK_UN);
        }
        std::mem::forget(lock);

        let err = ChannelLock::acquire(&lock_path, &mutex_path, false).unwrap_err();
        assert!(matches!(err, Error::NamedMutexLocked));

        let recovered = ChannelLock::acquire(&lock_path, &mutex_path, true).unwrap();
        drop(recovered);
    }

    #[test]
    fn acquire_and_drop_cleans_up_both_files() {
        let (lock_path, mutex_path) = scratch_paths();
        let lock = ChannelLock::acquire(&lock_path, &mutex_path, false).unwrap();
        assert!(lock_path.exists());
        assert!(mutex_path.exists());
        drop(lock);
        assert!(!lock_path.exists());
        assert!(!mutex_path.exists());
    }
}
