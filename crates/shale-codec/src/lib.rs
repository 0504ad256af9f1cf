//! Shard transport codec.
//!
//! The on-wire shard is a zlib-compressed tar stream multiplexing the
//! shard's component files, a tag-dictionary update, and the well's tag
//! list into one stream. At most one entry of each semantic kind may
//! appear; the two indexed-accelerator entries may only coexist with each
//! other and never with the flat accelerator file.
//!
//! [`Packer`] converts on-disk shard form into the stream and exposes the
//! stream through a paired [`PackerReader`]; [`Unpacker`] drives the
//! reverse direction through an [`UnpackHandler`] provided by the storage
//! backend. Both sides carry a cancellation signal that fails in-flight
//! reads and writes promptly.

mod error;
mod kind;
mod packer;
mod pipe;
mod unpacker;

pub use error::CodecError;
pub use kind::{FileKind, TAGS_UPDATE_NAME, WELL_TAGS_NAME};
pub use packer::{Packer, PackerReader};
pub use unpacker::{UnpackCancel, UnpackHandler, Unpacker};

#[cfg(test)]
mod tests;
