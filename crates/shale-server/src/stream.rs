//! Idle-tick timeout adapters for streaming transfers.
//!
//! Both transfer directions wrap the HTTP body in an adapter that fails
//! any single read or write making no progress within the idle window.
//! There is no portable way to yank an in-flight HTTP body read out from
//! under a handler, so the per-operation deadline is the teardown
//! mechanism: when it fires, the blocked codec thread sees an I/O error
//! promptly, the pipeline collapses, and the upload claim is released.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

fn idle_err() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "transfer idle timeout")
}

pin_project! {
    /// Reader that fails when no bytes arrive within the idle window.
    pub struct IdleTimeoutReader<R> {
        #[pin]
        inner: R,
        #[pin]
        deadline: Sleep,
        timeout: Duration,
        expired: bool,
    }
}

impl<R> IdleTimeoutReader<R> {
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: tokio::time::sleep(timeout),
            timeout,
            expired: false,
        }
    }
}

impl<R: AsyncRead> AsyncRead for IdleTimeoutReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        if *this.expired {
            return Poll::Ready(Err(idle_err()));
        }
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.deadline
                    .as_mut()
                    .reset(Instant::now() + *this.timeout);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    *this.expired = true;
                    Poll::Ready(Err(idle_err()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

pin_project! {
    /// Writer that fails when the peer accepts no bytes within the idle
    /// window.
    pub struct IdleTimeoutWriter<W> {
        #[pin]
        inner: W,
        #[pin]
        deadline: Sleep,
        timeout: Duration,
        expired: bool,
    }
}

impl<W> IdleTimeoutWriter<W> {
    pub fn new(inner: W, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: tokio::time::sleep(timeout),
            timeout,
            expired: false,
        }
    }
}

impl<W: AsyncWrite> AsyncWrite for IdleTimeoutWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        if *this.expired {
            return Poll::Ready(Err(idle_err()));
        }
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.deadline
                    .as_mut()
                    .reset(Instant::now() + *this.timeout);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    *this.expired = true;
                    Poll::Ready(Err(idle_err()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
