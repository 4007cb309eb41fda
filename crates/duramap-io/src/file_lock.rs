//! Recursive, deadlock-avoiding shared/exclusive advisory file lock.
//!
//! Wraps a POSIX `flock` on a file descriptor with two additions the OS
//! primitive doesn't provide on its own:
//!
//! - **Recursive in-process reference counts.** Acquiring the same mode
//!   twice from the same process increments a counter instead of
//!   re-entering the OS call; the underlying `flock` is taken only on
//!   the first acquisition of a mode and released only when both
//!   counters drop to zero.
//! - **Deadlock-avoiding upgrade.** Requesting exclusive while already
//!   holding shared first tries a non-blocking exclusive `flock`; if
//!   that fails, it releases the shared lock and blocks for exclusive,
//!   restoring the shared lock if the exclusive attempt ultimately
//!   fails.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use crate::error::IoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// The result of a non-blocking lock attempt: whether the lock was
/// acquired, and — when it wasn't — whether the caller should retry
/// (a transient OS condition) as opposed to genuine contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryLockResult {
    pub acquired: bool,
    pub try_again: bool,
}

/// A recursive shared/exclusive lock over one open file.
pub struct FileLock {
    fd: std::os::unix::io::RawFd,
    shared_count: u32,
    exclusive_count: u32,
}

impl FileLock {
    pub fn new(file: &File) -> Self {
        FileLock {
            fd: file.as_raw_fd(),
            shared_count: 0,
            exclusive_count: 0,
        }
    }

    pub fn shared_count(&self) -> u32 {
        self.shared_count
    }

    pub fn exclusive_count(&self) -> u32 {
        self.exclusive_count
    }

    /// Blocking acquire.
    pub fn lock(&mut self, kind: LockKind) -> Result<(), IoError> {
        self.do_lock(kind, true).map(|_| ())
    }

    /// Non-blocking acquire.
    pub fn try_lock(&mut self, kind: LockKind) -> Result<TryLockResult, IoError> {
        self.do_lock(kind, false)
    }

    fn do_lock(&mut self, kind: LockKind, wait: bool) -> Result<TryLockResult, IoError> {
        let mut unlock_shared_first = false;

        match kind {
            LockKind::Shared => {
                self.shared_count += 1;
                // A shared lock already held (in any mode) never needs
                // a new OS call.
                if self.shared_count > 1 || self.exclusive_count > 0 {
                    return Ok(TryLockResult {
                        acquired: true,
                        try_again: false,
                    });
                }
            }
            LockKind::Exclusive => {
                self.exclusive_count += 1;
                if self.exclusive_count > 1 {
                    return Ok(TryLockResult {
                        acquired: true,
                        try_again: false,
                    });
                }
                if self.shared_count > 0 {
                    unlock_shared_first = true;
                }
            }
        }

        let flock_kind = match kind {
            LockKind::Shared => libc::LOCK_SH,
            LockKind::Exclusive => libc::LOCK_EX,
        };

        if unlock_shared_first {
            // Try to upgrade without giving up the shared lock first.
            if flock_call(self.fd, flock_kind | libc::LOCK_NB) {
                return Ok(TryLockResult {
                    acquired: true,
                    try_again: false,
                });
            }
            // Be a good citizen: release the shared lock so we don't
            // deadlock against another process waiting to go exclusive.
            if unsafe { libc::flock(self.fd, libc::LOCK_UN) } != 0 {
                tracing::warn!(fd = self.fd, "failed to release shared lock before upgrade");
            }
        }

        let cmd = if wait {
            flock_kind
        } else {
            flock_kind | libc::LOCK_NB
        };
        let ok = flock_call(self.fd, cmd);
        if ok {
            return Ok(TryLockResult {
                acquired: true,
                try_again: false,
            });
        }

        // The upgrade attempt failed: restore the shared lock we gave
        // up, and undo the counter bump for the mode we failed to get.
        if unlock_shared_first {
            if !flock_call(self.fd, libc::LOCK_SH) {
                tracing::error!(fd = self.fd, "failed to restore shared lock after failed upgrade");
            }
        }
        match kind {
            LockKind::Shared => self.shared_count -= 1,
            LockKind::Exclusive => self.exclusive_count -= 1,
        }

        let try_again = last_errno_is_retryable();
        Ok(TryLockResult {
            acquired: false,
            try_again,
        })
    }

    /// Releases one acquisition of `kind`. Returns `Ok(false)` if the
    /// lock wasn't held in that mode (a caller bug, not an I/O error).
    pub fn unlock(&mut self, kind: LockKind) -> Result<bool, IoError> {
        let mut unlock_to_shared = false;

        match kind {
            LockKind::Shared => {
                if self.shared_count == 0 {
                    return Ok(false);
                }
                self.shared_count -= 1;
                if self.shared_count > 0 || self.exclusive_count > 0 {
                    return Ok(true);
                }
            }
            LockKind::Exclusive => {
                if self.exclusive_count == 0 {
                    return Ok(false);
                }
                self.exclusive_count -= 1;
                if self.exclusive_count > 0 {
                    return Ok(true);
                }
                if self.shared_count > 0 {
                    unlock_to_shared = true;
                }
            }
        }

        let cmd = if unlock_to_shared {
            libc::LOCK_SH
        } else {
            libc::LOCK_UN
        };
        if flock_call(self.fd, cmd) {
            Ok(true)
        } else {
            Err(std::io::Error::last_os_error().into())
        }
    }
}

fn flock_call(fd: std::os::unix::io::RawFd, cmd: libc::c_int) -> bool {
    // SAFETY: `fd` is owned by the `File` this `FileLock` was built
    // from, which outlives the lock; `flock` itself has no memory-safety
    // preconditions beyond a valid descriptor.
    unsafe { libc::flock(fd, cmd) == 0 }
}

fn last_errno_is_retryable() -> bool {
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(path: &std::path::Path) -> File {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn shared_lock_recursion_uses_one_os_call() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let file = open(&path);
        let mut lock = FileLock::new(&file);

        lock.lock(LockKind::Shared).unwrap();
        lock.lock(LockKind::Shared).unwrap();
        assert_eq!(lock.shared_count(), 2);

        assert!(lock.unlock(LockKind::Shared).unwrap());
        assert_eq!(lock.shared_count(), 1);
        assert!(lock.unlock(LockKind::Shared).unwrap());
        assert_eq!(lock.shared_count(), 0);
    }

    #[test]
    fn exclusive_lock_recursion() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let file = open(&path);
        let mut lock = FileLock::new(&file);

        lock.lock(LockKind::Exclusive).unwrap();
        lock.lock(LockKind::Exclusive).unwrap();
        assert_eq!(lock.exclusive_count(), 2);
        lock.unlock(LockKind::Exclusive).unwrap();
        assert_eq!(lock.exclusive_count(), 1);
        lock.unlock(LockKind::Exclusive).unwrap();
        assert_eq!(lock.exclusive_count(), 0);
    }

    #[test]
    fn upgrade_from_shared_to_exclusive_then_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let file = open(&path);
        let mut lock = FileLock::new(&file);

        lock.lock(LockKind::Shared).unwrap();
        let result = lock.try_lock(LockKind::Exclusive).unwrap();
        assert!(result.acquired);
        assert_eq!(lock.exclusive_count(), 1);
        assert_eq!(lock.shared_count(), 1);

        lock.unlock(LockKind::Exclusive).unwrap();
        assert_eq!(lock.exclusive_count(), 0);
        assert_eq!(lock.shared_count(), 1);

        lock.unlock(LockKind::Shared).unwrap();
        assert_eq!(lock.shared_count(), 0);
    }

    #[test]
    fn unlock_without_holding_returns_false() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let file = open(&path);
        let mut lock = FileLock::new(&file);
        assert!(!lock.unlock(LockKind::Shared).unwrap());
        assert!(!lock.unlock(LockKind::Exclusive).unwrap());
    }
}
