//! Shard unpacker: compressed tar stream in, backend handler calls out.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use shale_tags::TagPair;

use crate::error::CodecError;
use crate::kind::{FileKind, Tracker, TAGS_UPDATE_NAME};

/// Callbacks a storage backend provides to receive an unpacked shard.
pub trait UnpackHandler {
    /// Persist one component. `rel_path` is the placement relative to the
    /// shard directory (the indexed-accelerator halves arrive as
    /// `<id>.accel/keys` and `<id>.accel/data`).
    fn handle_file(&mut self, rel_path: &str, rdr: &mut dyn Read) -> Result<(), CodecError>;

    /// Merge a tag-dictionary update. Never written to shard storage.
    fn handle_tag_update(&mut self, pairs: Vec<TagPair>) -> Result<(), CodecError>;
}

/// Cancellation handle for an in-flight unpack.
#[derive(Clone)]
pub struct UnpackCancel(Arc<AtomicBool>);

impl UnpackCancel {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Decodes one shard stream, mapping entries to semantic kinds and
/// enforcing structural validity. Completeness at end of stream is
/// checked leniently by default (only the store file is required);
/// strict mode additionally requires index, verify, the well tag list,
/// and the tag update.
pub struct Unpacker<R> {
    id: String,
    rdr: R,
    cancel: Arc<AtomicBool>,
    strict: bool,
}

impl<R: Read> Unpacker<R> {
    /// A trailing collision suffix on `id` is ignored so that versioned
    /// shard names place files under the bare shard id.
    pub fn new(id: &str, rdr: R) -> Self {
        Self {
            id: shale_core::shard::trim_version(id).to_string(),
            rdr,
            cancel: Arc::new(AtomicBool::new(false)),
            strict: false,
        }
    }

    /// Enable or disable strict completeness validation.
    pub fn strict(mut self, on: bool) -> Self {
        self.strict = on;
        self
    }

    pub fn cancel_handle(&self) -> UnpackCancel {
        UnpackCancel(self.cancel.clone())
    }

    /// Drive the stream to completion through `handler`.
    ///
    /// Any structural violation aborts immediately: a non-regular entry,
    /// an unknown name, a duplicate kind, or a failed handler call. The
    /// caller owns cleanup of partially persisted state.
    pub fn unpack<H: UnpackHandler>(self, handler: &mut H) -> Result<(), CodecError> {
        let cancel = self.cancel.clone();
        let rdr = CancelReader {
            inner: self.rdr,
            cancel,
        };
        let mut archive = tar::Archive::new(ZlibDecoder::new(rdr));
        let mut tracker = Tracker::default();

        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type() != tar::EntryType::Regular {
                return Err(CodecError::InvalidEntryType);
            }
            let name = entry.path()?.to_string_lossy().into_owned();

            if name == TAGS_UPDATE_NAME {
                let pairs: Vec<TagPair> = serde_json::from_reader(&mut entry)?;
                handler.handle_tag_update(pairs)?;
                tracker.hit(FileKind::TagsUpdate)?;
                continue;
            }

            let kind = FileKind::from_entry_name(&name)?;
            tracker.hit(kind)?;
            handler.handle_file(&kind.disk_path(&self.id), &mut entry)?;
        }

        tracker.complete(self.strict)
    }
}

struct CancelReader<R> {
    inner: R,
    cancel: Arc<AtomicBool>,
}

impl<R: Read> Read for CancelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(io::Error::other("transfer cancelled"));
        }
        self.inner.read(buf)
    }
}
