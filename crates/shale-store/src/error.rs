use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("empty base directory for store")]
    MissingBaseDir,

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("{0} is not a regular file")]
    NotARegularFile(PathBuf),

    #[error("{0} is not readable")]
    NotReadable(PathBuf),

    #[error("{0} is not writable")]
    NotWritable(PathBuf),

    #[error("shard directory {0} does not exist")]
    NoSuchShard(String),

    #[error("collision suffixes exhausted for shard {0}")]
    CollisionExhausted(String),

    #[error("pack worker panicked")]
    WorkerPanic,

    #[error("ftp: {0}")]
    Ftp(String),

    #[error(transparent)]
    Upload(#[from] shale_core::upload::UploadError),

    #[error(transparent)]
    Tag(#[from] shale_tags::TagError),

    #[error(transparent)]
    Codec(#[from] shale_codec::CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
