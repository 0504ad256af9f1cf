use thiserror::Error;

use crate::kind::FileKind;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec already closed")]
    Closed,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("archive entry is not a regular file")]
    InvalidEntryType,

    #[error("unknown archive entry {0:?}")]
    UnknownEntry(String),

    #[error("{} already added", .0.label())]
    Duplicate(FileKind),

    #[error("accelerator already added in a conflicting form")]
    AcceleratorConflict,

    #[error("{} missing", .0.label())]
    Missing(FileKind),

    #[error("{} shorter than its declared size", .0.label())]
    ShortFile(FileKind),

    #[error("tag encoding: {0}")]
    TagCodec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Handler(String),
}
