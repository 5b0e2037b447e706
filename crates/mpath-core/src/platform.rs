//! Platform-specific file primitives
//!
//! The persistent stores (bindings, prkeys, PID file) rely on three POSIX
//! facilities: fdatasync for durable appends, fsync of the parent directory
//! after a rename, and advisory flock so concurrent daemon/tool processes
//! serialize file rewrites. Readers take a shared lock, writers exclusive.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Ensures file data is durably written to persistent storage.
///
/// Linux: fdatasync() — syncs data but not metadata, sufficient for
/// line-oriented append files whose size change rides along with the data.
pub fn durable_sync(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: fdatasync is a POSIX system call on a valid file descriptor.
    // The fd comes from a live File reference, so it is open.
    let result = unsafe { libc::fdatasync(fd) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Sync the directory containing `path` so a completed rename survives a
/// crash. Called after the temp-file + rename rewrite cycle.
pub fn fsync_dir(path: &Path) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let dirfile = File::open(dir)?;
    dirfile.sync_all()
}

/// Advisory lock kind for [`FileLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Multiple concurrent readers
    Shared,
    /// Single writer
    Exclusive,
}

/// RAII advisory file lock. The lock is released when the guard drops.
///
/// flock locks are per open-file-description; keeping the guard alive for
/// the whole read/rewrite cycle is what provides the cross-process
/// serialization of the bindings and prkeys files.
pub struct FileLock {
    fd: std::os::unix::io::RawFd,
}

impl FileLock {
    /// Block until the requested advisory lock is acquired.
    pub fn new(file: &File, kind: LockKind) -> io::Result<Self> {
        let op = match kind {
            LockKind::Shared => libc::LOCK_SH,
            LockKind::Exclusive => libc::LOCK_EX,
        };
        let fd = file.as_raw_fd();
        // SAFETY: flock on a valid open descriptor; LOCK_SH/LOCK_EX block
        // until granted and cannot corrupt process state.
        let rv = unsafe { libc::flock(fd, op) };
        if rv != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(FileLock { fd })
    }

    /// Non-blocking acquisition; Err(WouldBlock) when contended.
    pub fn try_new(file: &File, kind: LockKind) -> io::Result<Self> {
        let op = match kind {
            LockKind::Shared => libc::LOCK_SH,
            LockKind::Exclusive => libc::LOCK_EX,
        } | libc::LOCK_NB;
        let fd = file.as_raw_fd();
        // SAFETY: see new()
        let rv = unsafe { libc::flock(fd, op) };
        if rv != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(FileLock { fd })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: unlocking an fd we hold a lock on; failure is ignored,
        // the lock dies with the descriptor anyway.
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"alias wwid\n").unwrap();
        let result = durable_sync(file.as_file());
        assert!(result.is_ok(), "durable_sync failed: {:?}", result.err());
    }

    #[test]
    fn test_fsync_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bindings");
        std::fs::write(&path, b"").unwrap();
        assert!(fsync_dir(&path).is_ok());
    }

    #[test]
    fn test_lock_exclusive_blocks_try() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let second = file.reopen().unwrap();

        let guard = FileLock::new(file.as_file(), LockKind::Exclusive).unwrap();
        let contended = FileLock::try_new(&second, LockKind::Exclusive);
        assert!(contended.is_err());
        drop(guard);

        let after = FileLock::try_new(&second, LockKind::Exclusive);
        assert!(after.is_ok());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let second = file.reopen().unwrap();

        let _a = FileLock::new(file.as_file(), LockKind::Shared).unwrap();
        let b = FileLock::try_new(&second, LockKind::Shared);
        assert!(b.is_ok());
    }
}
