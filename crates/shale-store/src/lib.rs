//! Storage backends for the shale archive.
//!
//! The HTTP layer drives everything through the [`ShardStore`] contract.
//! Two implementations exist: [`FileStore`] persists directly to a local
//! directory tree, and [`FtpStore`] persists to a remote FTP server while
//! staging `tags.dat` files and pack scratch space locally. Both uphold
//! the same invariants: at most one in-flight transfer per shard,
//! partially written shard directories removed on failure, and collision
//! suffixes for repeated shard names.

mod error;
mod ftp;
mod local;
mod pack;
mod traits;

pub use error::StoreError;
pub use ftp::{FtpStore, FtpStoreConfig};
pub use local::FileStore;
pub use pack::add_shard_files;
pub use traits::ShardStore;

use std::path::Path;

use nix::unistd::AccessFlags;

/// Check that `path` exists, is a directory, and is readable.
pub fn readable_dir(path: &Path) -> Result<(), StoreError> {
    let md = std::fs::metadata(path)?;
    if !md.is_dir() {
        return Err(StoreError::NotADirectory(path.to_path_buf()));
    }
    nix::unistd::access(path, AccessFlags::R_OK)
        .map_err(|_| StoreError::NotReadable(path.to_path_buf()))?;
    Ok(())
}

/// Check that `path` exists, is a directory, and is read/write.
pub fn writable_dir(path: &Path) -> Result<(), StoreError> {
    readable_dir(path)?;
    nix::unistd::access(path, AccessFlags::W_OK)
        .map_err(|_| StoreError::NotWritable(path.to_path_buf()))?;
    Ok(())
}

/// Split a codec-relative entry path into an optional single directory
/// level and a file name, discarding any relative components.
pub(crate) fn clean_entry_path(path: &str) -> (Option<String>, String) {
    let mut parts: Vec<&str> = path
        .split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .collect();
    let file = parts.pop().unwrap_or_default().to_string();
    let dir = parts.pop().map(str::to_string);
    (dir, file)
}
