//! Shard packer: disk components in, compressed tar stream out.

use std::io::{self, Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use shale_tags::TagPair;

use crate::error::CodecError;
use crate::kind::{FileKind, Tracker};
use crate::pipe::{pipe, PipeHandle, PipeReader, PipeWriter};

type Stream = tar::Builder<ZlibEncoder<PipeWriter>>;

/// Producer half of the shard stream.
///
/// Components are appended with [`Packer::add_file`] (plus the dedicated
/// tag helpers) and flow through `tar -> zlib -> pipe` to the paired
/// [`PackerReader`]. A packer is driven by one task while a second task
/// copies the reader side toward the peer; either side can tear the
/// stream down with [`Packer::close_with_error`] or [`Packer::cancel`]
/// without blocking on the other.
pub struct Packer {
    id: String,
    stream: Mutex<Option<Stream>>,
    tracker: Mutex<Tracker>,
    handle: PipeHandle,
}

/// Consumer half of the shard stream.
pub struct PackerReader {
    inner: PipeReader,
}

impl Read for PackerReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Packer {
    /// Wire up a packer for the shard named `id` and hand back both
    /// halves of the stream.
    pub fn new(id: impl Into<String>) -> (Self, PackerReader) {
        let (writer, reader, handle) = pipe();
        let encoder = ZlibEncoder::new(writer, Compression::default());
        let builder = tar::Builder::new(encoder);
        (
            Self {
                id: id.into(),
                stream: Mutex::new(Some(builder)),
                tracker: Mutex::new(Tracker::default()),
                handle,
            },
            PackerReader { inner: reader },
        )
    }

    /// Append the tag-dictionary update entry: the complete name-to-id
    /// mapping the indexer knows, which the receiving side merges.
    pub fn add_tags(&self, pairs: &[TagPair]) -> Result<(), CodecError> {
        let body = serde_json::to_vec(pairs)?;
        self.add_bytes(FileKind::TagsUpdate, &body)
    }

    /// Append the well tag list entry. The default well carries an empty
    /// list.
    pub fn add_well_tags(&self, tags: &[String]) -> Result<(), CodecError> {
        let body = tags.join("\n");
        self.add_bytes(FileKind::WellTags, body.as_bytes())
    }

    fn add_bytes(&self, kind: FileKind, data: &[u8]) -> Result<(), CodecError> {
        self.add_file(kind, data.len() as u64, &mut &data[..])
    }

    /// Append one component of exactly `size` bytes read from `rdr`.
    /// Each kind may be added once; the indexed-accelerator halves may
    /// only coexist with each other.
    pub fn add_file(
        &self,
        kind: FileKind,
        size: u64,
        rdr: &mut dyn Read,
    ) -> Result<(), CodecError> {
        self.tracker.lock().unwrap().hit(kind)?;

        let mut guard = self.stream.lock().unwrap();
        let builder = guard.as_mut().ok_or(CodecError::Closed)?;

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o600);
        header.set_size(size);

        let mut counted = CountingReader {
            inner: (&mut *rdr).take(size),
            count: 0,
        };
        builder.append_data(&mut header, kind.entry_name(&self.id), &mut counted)?;
        if counted.count != size {
            return Err(CodecError::ShortFile(kind));
        }
        Ok(())
    }

    /// Flush buffered tar and zlib state through to the reader side.
    pub fn flush(&self) -> Result<(), CodecError> {
        let mut guard = self.stream.lock().unwrap();
        let builder = guard.as_mut().ok_or(CodecError::Closed)?;
        builder.get_mut().flush()?;
        Ok(())
    }

    /// Nominal close: finish the tar archive, then the zlib stream, then
    /// deliver EOF to the reader.
    pub fn close(&self) -> Result<(), CodecError> {
        let builder = self
            .stream
            .lock()
            .unwrap()
            .take()
            .ok_or(CodecError::Closed)?;
        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        self.handle.close();
        Ok(())
    }

    /// Close and deliver `msg` as the read-side error instead of EOF.
    pub fn close_with_error(&self, msg: impl Into<String>) -> Result<(), CodecError> {
        let mut guard = self.stream.lock().unwrap();
        if guard.is_none() {
            return Err(CodecError::Closed);
        }
        self.handle.close_with_error(msg.into());
        self.handle.cancel();
        // discard the writer stack; its teardown writes land on the
        // poisoned pipe and are ignored
        *guard = None;
        Ok(())
    }

    /// Trip the cancellation signal; in-flight reads and writes fail
    /// promptly.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Close, scheduling a [`Packer::cancel`] if the close has not
    /// completed by the deadline.
    pub fn close_with_timeout(&self, timeout: Duration) -> Result<(), CodecError> {
        if timeout.is_zero() {
            return self.close();
        }
        let handle = self.handle.clone();
        let (armed_tx, armed_rx) = std::sync::mpsc::channel::<()>();
        let watchdog = std::thread::spawn(move || {
            if armed_rx.recv_timeout(timeout).is_err() {
                handle.cancel();
            }
        });
        let result = self.close();
        let _ = armed_tx.send(());
        let _ = watchdog.join();
        result
    }
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
