//! POSIX advisory byte-range locking on bytes `[0, 1)` of a spool file,
//! via raw `fcntl(F_SETLKW)`. Cooperates across processes the same way as
//! `makelock`/`unlock` in the original C server: a blocking lock request is
//! retried automatically on `EINTR` rather than surfaced to the caller.
//!
//! Modeled on `makelock`/`unlock`/`ufclose` (fcntl-based branch) plus the
//! `EDLK` command's non-blocking `F_SETLK` probe, which needs to observe
//! `EACCES`/`EAGAIN` rather than block.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockKind {
    Read,
    Write,
}

impl LockKind {
    fn as_fcntl(self) -> libc::c_short {
        match self {
            LockKind::Read => libc::F_RDLCK as libc::c_short,
            LockKind::Write => libc::F_WRLCK as libc::c_short,
        }
    }
}

fn flock_on_range(kind_or_unlock: libc::c_short, start: libc::off_t, len: libc::off_t) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind_or_unlock;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start;
    fl.l_len = len;
    fl
}

/// Blocks until an advisory lock on bytes `[start, start+len)` of `file` is
/// acquired, retrying transparently across signal interruptions.
pub fn lock_range(file: &File, kind: LockKind, start: i64, len: i64) -> io::Result<()> {
    let mut fl = flock_on_range(kind.as_fcntl(), start as libc::off_t, len as libc::off_t);
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &mut fl as *mut _) };
        if rc != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Non-blocking probe used by `EDLK`: attempts the lock once, returning
/// `Ok(false)` (not `Err`) on contention so the caller can report who
/// holds it instead of treating contention as a failure.
pub fn try_lock_range(file: &File, kind: LockKind, start: i64, len: i64) -> io::Result<bool> {
    let mut fl = flock_on_range(kind.as_fcntl(), start as libc::off_t, len as libc::off_t);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl as *mut _) };
    if rc != -1 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(e) if e == libc::EACCES || e == libc::EAGAIN => Ok(false),
        _ => Err(err),
    }
}

/// Releases a previously acquired byte-range lock. fcntl locks are
/// released automatically when every fd referring to the open file
/// description is closed, but an explicit unlock lets a long-lived
/// handle keep the file open without holding the lock.
pub fn unlock_range(file: &File, start: i64, len: i64) -> io::Result<()> {
    let mut fl = flock_on_range(libc::F_UNLCK as libc::c_short, start as libc::off_t, len as libc::off_t);
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl as *mut _) };
        if rc != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// An open spool file holding the byte `[0,1)` lock documented in
/// spec.md §4.1, released on drop.
pub struct LockedFile {
    pub file: File,
    locked: bool,
}

impl LockedFile {
    pub fn open(file: File, kind: LockKind) -> io::Result<Self> {
        lock_range(&file, kind, 0, 1)?;
        Ok(LockedFile { file, locked: true })
    }

    pub fn unlock(&mut self) -> io::Result<()> {
        if self.locked {
            unlock_range(&self.file, 0, 1)?;
            self.locked = false;
        }
        Ok(())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}

impl std::ops::Deref for LockedFile {
    type Target = File;
    fn deref(&self) -> &File {
        &self.file
    }
}

impl std::ops::DerefMut for LockedFile {
    fn deref_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn lock_then_unlock_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockme");
        std::fs::write(&path, b"x").unwrap();
        let f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut lf = LockedFile::open(f, LockKind::Write).unwrap();
        lf.unlock().unwrap();
    }

    #[test]
    fn try_lock_succeeds_when_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockme2");
        std::fs::write(&path, b"x").unwrap();
        let f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let got = try_lock_range(&f, LockKind::Write, 0, 75).unwrap();
        assert!(got);
    }
}
