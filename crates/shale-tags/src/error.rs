use std::path::PathBuf;

use thiserror::Error;

use crate::pair::TagId;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("tag not found")]
    NotFound,

    #[error("tag manager is not active")]
    NotActive,

    #[error("tag cannot be an empty string")]
    EmptyName,

    #[error("tag {0:?} contains forbidden characters")]
    InvalidName(String),

    #[error("tag {0:?} is already present")]
    AlreadyPresent(String),

    #[error("no tag ids available")]
    Exhausted,

    #[error("too many tags specified")]
    TooManyTags,

    #[error("invalid value for reserved tag {0:?}")]
    ReservedMismatch(String),

    #[error("tag {name} is not {id:#x} when required")]
    EnsureConflict { name: String, id: TagId },

    #[error("tag {0:?} exists in current set and does not match provided set")]
    MergeConflict(String),

    #[error("duplicate tag id {0} in dictionary")]
    DuplicateId(TagId),

    #[error("duplicate tag name {0:?} in dictionary")]
    DuplicateName(String),

    #[error("malformed dictionary line {0:?}")]
    MalformedLine(String),

    #[error("{0} is not a regular file")]
    NotARegularFile(PathBuf),

    #[error("tag registry is closed")]
    RegistryClosed,

    #[error("tag registry has open handles")]
    OpenHandles,

    #[error("tag manager handle is not active")]
    NoActiveHandles,

    #[error(transparent)]
    Lock(#[from] shale_core::flock::FlockError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
