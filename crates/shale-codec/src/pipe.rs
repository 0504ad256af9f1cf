//! Bounded in-memory byte pipe connecting the packer's compressor stack
//! to its exposed reader.
//!
//! The pipe supports the three teardown paths the cooperating-task
//! pattern needs: a clean close (reader drains then sees EOF), a close
//! with error (the error takes precedence over buffered bytes), and
//! cancellation (both sides fail promptly). A blocked writer is always
//! woken by any of the three, and by the reader going away.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct State {
    buf: VecDeque<u8>,
    write_closed: bool,
    reader_gone: bool,
    error: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    cancelled: AtomicBool,
}

impl Shared {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub(crate) fn pipe() -> (PipeWriter, PipeReader, PipeHandle) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::default()),
        readable: Condvar::new(),
        writable: Condvar::new(),
        cancelled: AtomicBool::new(false),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader {
            shared: shared.clone(),
        },
        PipeHandle { shared },
    )
}

pub(crate) struct PipeWriter {
    shared: Arc<Shared>,
}

pub(crate) struct PipeReader {
    shared: Arc<Shared>,
}

/// Control handle usable while the writer half is buried inside the
/// compressor stack.
#[derive(Clone)]
pub(crate) struct PipeHandle {
    shared: Arc<Shared>,
}

fn cancelled_err() -> io::Error {
    io::Error::other("transfer cancelled")
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut st = self.shared.state.lock().unwrap();
        loop {
            if self.shared.cancelled() {
                return Err(cancelled_err());
            }
            if let Some(msg) = &st.error {
                return Err(io::Error::other(msg.clone()));
            }
            if st.write_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write side closed",
                ));
            }
            if st.reader_gone {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "read side gone"));
            }
            let space = PIPE_CAPACITY - st.buf.len();
            if space > 0 {
                let n = space.min(data.len());
                st.buf.extend(&data[..n]);
                self.shared.readable.notify_one();
                return Ok(n);
            }
            st = self.shared.writable.wait(st).unwrap();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut st = self.shared.state.lock().unwrap();
        loop {
            if self.shared.cancelled() {
                return Err(cancelled_err());
            }
            // an error poisons the stream even if bytes are buffered
            if let Some(msg) = &st.error {
                return Err(io::Error::other(msg.clone()));
            }
            if !st.buf.is_empty() {
                let n = out.len().min(st.buf.len());
                for b in out.iter_mut().take(n) {
                    *b = st.buf.pop_front().unwrap();
                }
                self.shared.writable.notify_one();
                return Ok(n);
            }
            if st.write_closed {
                return Ok(0);
            }
            st = self.shared.readable.wait(st).unwrap();
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock().unwrap();
        st.reader_gone = true;
        self.shared.writable.notify_all();
    }
}

impl PipeHandle {
    /// Clean end of stream: the reader drains buffered bytes then EOFs.
    pub(crate) fn close(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.write_closed = true;
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    /// Poison the stream: both sides fail with the message immediately.
    pub(crate) fn close_with_error(&self, msg: String) {
        let mut st = self.shared.state.lock().unwrap();
        st.write_closed = true;
        st.error.get_or_insert(msg);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    /// Trip the cancellation signal observed by both sides.
    pub(crate) fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        let _st = self.shared.state.lock().unwrap();
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn write_then_read_then_eof() {
        let (mut w, mut r, h) = pipe();
        w.write_all(b"hello").unwrap();
        h.close();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn error_beats_buffered_bytes() {
        let (mut w, mut r, h) = pipe();
        w.write_all(b"doomed").unwrap();
        h.close_with_error("boom".to_string());
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn cancel_unblocks_a_full_writer() {
        let (mut w, _r, h) = pipe();
        let filler = vec![0u8; PIPE_CAPACITY];
        w.write_all(&filler).unwrap();
        let t = thread::spawn(move || w.write_all(b"x"));
        thread::sleep(std::time::Duration::from_millis(50));
        h.cancel();
        assert!(t.join().unwrap().is_err());
    }

    #[test]
    fn reader_drop_fails_the_writer() {
        let (mut w, r, _h) = pipe();
        let filler = vec![0u8; PIPE_CAPACITY];
        w.write_all(&filler).unwrap();
        let t = thread::spawn(move || w.write_all(b"x"));
        thread::sleep(std::time::Duration::from_millis(50));
        drop(r);
        assert!(t.join().unwrap().is_err());
    }

    #[test]
    fn streaming_across_threads() {
        let (mut w, mut r, h) = pipe();
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| i as u8).collect();
        let expect = payload.clone();
        let t = thread::spawn(move || {
            w.write_all(&payload).unwrap();
            h.close();
        });
        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        t.join().unwrap();
        assert_eq!(got, expect);
    }
}
