//! Non-blocking advisory file locks.
//!
//! Thin wrapper over `fcntl(F_SETLK)` record locks. The lock belongs to
//! the open handle, not the process: closing the file releases it, and a
//! second handle within the same process can still steal the record. Used
//! to guard `tags.dat` and the password file across cooperating
//! processes.

use std::fs::File;
use std::os::fd::AsRawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::libc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlockError {
    #[error("file is already locked")]
    Locked,

    #[error("lock operation failed: {0}")]
    Os(#[from] Errno),
}

/// Take an exclusive lock on the whole file, failing immediately on
/// contention.
pub fn lock_exclusive(file: &File) -> Result<(), FlockError> {
    apply(file, libc::F_WRLCK)
}

/// Take a shared lock on the whole file, failing immediately on
/// contention.
pub fn lock_shared(file: &File) -> Result<(), FlockError> {
    apply(file, libc::F_RDLCK)
}

/// Release a lock held on the file.
pub fn unlock(file: &File) -> Result<(), FlockError> {
    apply(file, libc::F_UNLCK)
}

fn apply(file: &File, kind: libc::c_int) -> Result<(), FlockError> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;
    match fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&fl)) {
        Ok(_) => Ok(()),
        Err(Errno::EAGAIN) | Err(Errno::EACCES) => Err(FlockError::Locked),
        Err(e) => Err(FlockError::Os(e)),
    }
}
