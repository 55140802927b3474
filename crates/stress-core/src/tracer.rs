//! Per-phase timing of a single outbound request.
//!
//! The five phases are back-to-back and mutually exclusive:
//!
//! ```text
//! | dns | connect | write | wait (ttfb) | read |
//! ```
//!
//! `dns` and `connect` are measured by the client around name resolution and
//! connection acquisition. `write`, `wait` and `read` come from a
//! [`TracedStream`] wrapped around every connection, which stamps the last
//! request byte written and the first response byte read. A phase that was
//! not completed (because the request failed or timed out) stays zero.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::ops::AddAssign;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Decomposed network time of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phases {
    pub dns: Duration,
    pub connect: Duration,
    pub write: Duration,
    pub wait: Duration,
    pub read: Duration,
}

impl Phases {
    pub fn total(&self) -> Duration {
        self.dns + self.connect + self.write + self.wait + self.read
    }
}

impl AddAssign for Phases {
    fn add_assign(&mut self, rhs: Self) {
        self.dns += rhs.dns;
        self.connect += rhs.connect;
        self.write += rhs.write;
        self.wait += rhs.wait;
        self.read += rhs.read;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Marks {
    armed: bool,
    pub(crate) last_write: Option<Instant>,
    pub(crate) first_read: Option<Instant>,
}

/// Wire-level timestamps of the exchange currently running on a connection.
#[derive(Debug, Default)]
pub(crate) struct WireMarks {
    marks: Mutex<Marks>,
}

impl WireMarks {
    /// Starts a new exchange; earlier stamps are discarded.
    pub(crate) fn arm(&self) {
        *self.marks.lock() = Marks {
            armed: true,
            ..Marks::default()
        };
    }

    pub(crate) fn snapshot(&self) -> Marks {
        *self.marks.lock()
    }

    fn on_write(&self) {
        let mut marks = self.marks.lock();
        // Bytes written after the reply started belong to the next exchange.
        if marks.armed && marks.first_read.is_none() {
            marks.last_write = Some(Instant::now());
        }
    }

    fn on_read(&self) {
        let mut marks = self.marks.lock();
        if marks.armed && marks.first_read.is_none() {
            marks.first_read = Some(Instant::now());
        }
    }
}

/// Byte stream that reports write and read activity to its [`WireMarks`].
pub(crate) struct TracedStream<S> {
    inner: S,
    marks: Arc<WireMarks>,
}

impl<S> TracedStream<S> {
    pub(crate) fn new(inner: S, marks: Arc<WireMarks>) -> Self {
        Self { inner, marks }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TracedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            if buf.filled().len() > before {
                self.marks.on_read();
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TracedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 {
                self.marks.on_write();
            }
        }
        poll
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 {
                self.marks.on_write();
            }
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[derive(Debug, Default)]
struct Hop {
    dns: Duration,
    connect: Duration,
    ready_at: Option<Instant>,
    wire: Option<Arc<WireMarks>>,
    multiplexed: bool,
    head_at: Option<Instant>,
    done_at: Option<Instant>,
}

impl Hop {
    fn phases(&self) -> Phases {
        let mut phases = Phases {
            dns: self.dns,
            connect: self.connect,
            ..Phases::default()
        };
        let Some(ready_at) = self.ready_at else {
            return phases;
        };

        if self.multiplexed {
            // Streams share the socket, so only the head/body boundaries are ours.
            if let Some(head_at) = self.head_at {
                phases.wait = head_at.saturating_duration_since(ready_at);
                if let Some(done_at) = self.done_at {
                    phases.read = done_at.saturating_duration_since(head_at);
                }
            }
            return phases;
        }

        let marks = self.wire.as_ref().map(|w| w.snapshot()).unwrap_or_default();
        let Some(last_write) = marks.last_write else {
            return phases;
        };
        phases.write = last_write.saturating_duration_since(ready_at);
        if let Some(first_read) = marks.first_read {
            phases.wait = first_read.saturating_duration_since(last_write);
            if let Some(done_at) = self.done_at {
                phases.read = done_at.saturating_duration_since(first_read);
            }
        }
        phases
    }
}

/// Timing state of one request, possibly spanning several redirect hops.
#[derive(Debug, Default)]
pub(crate) struct Trace {
    completed: Phases,
    hop: Hop,
}

impl Trace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn dns_done(&mut self, elapsed: Duration) {
        self.hop.dns = elapsed;
    }

    /// A connection is ready to carry the request; arms its wire marks.
    pub(crate) fn connected(
        &mut self,
        elapsed: Duration,
        wire: Arc<WireMarks>,
        multiplexed: bool,
    ) {
        if !multiplexed {
            wire.arm();
        }
        self.hop.connect = elapsed;
        self.hop.ready_at = Some(Instant::now());
        self.hop.wire = Some(wire);
        self.hop.multiplexed = multiplexed;
    }

    pub(crate) fn head_received(&mut self) {
        self.hop.head_at = Some(Instant::now());
    }

    pub(crate) fn body_read(&mut self) {
        self.hop.done_at = Some(Instant::now());
    }

    /// Closes the current hop before following a redirect.
    pub(crate) fn next_hop(&mut self) {
        let hop = std::mem::take(&mut self.hop);
        self.completed += hop.phases();
    }

    pub(crate) fn finish(mut self) -> Phases {
        self.next_hop();
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_traced_stream_stamps_write_then_read() {
        let (client, mut server) = tokio::io::duplex(64);
        let wire = Arc::new(WireMarks::default());
        let mut traced = TracedStream::new(client, wire.clone());

        let mut trace = Trace::new();
        trace.dns_done(Duration::from_millis(1));
        trace.connected(Duration::from_millis(2), wire.clone(), false);

        traced.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(b"pong").await.unwrap();
        traced.read_exact(&mut buf).await.unwrap();
        trace.head_received();
        trace.body_read();

        let marks = wire.snapshot();
        assert!(marks.last_write.is_some());
        assert!(marks.first_read.is_some());

        let phases = trace.finish();
        assert_eq!(phases.dns, Duration::from_millis(1));
        assert_eq!(phases.connect, Duration::from_millis(2));
        assert!(phases.wait >= Duration::from_millis(15), "wait = {:?}", phases.wait);
    }

    #[test]
    fn test_unreached_phases_stay_zero() {
        let mut trace = Trace::new();
        trace.dns_done(Duration::from_millis(3));
        let phases = trace.finish();
        assert_eq!(phases.dns, Duration::from_millis(3));
        assert_eq!(phases.connect, Duration::ZERO);
        assert_eq!(phases.write, Duration::ZERO);
        assert_eq!(phases.wait, Duration::ZERO);
        assert_eq!(phases.read, Duration::ZERO);
    }

    #[test]
    fn test_hops_accumulate() {
        let wire = Arc::new(WireMarks::default());
        let mut trace = Trace::new();
        trace.dns_done(Duration::from_millis(1));
        trace.connected(Duration::from_millis(1), wire.clone(), true);
        trace.head_received();
        trace.body_read();
        trace.next_hop();
        trace.dns_done(Duration::from_millis(2));
        let phases = trace.finish();
        assert_eq!(phases.dns, Duration::from_millis(3));
        assert_eq!(phases.write, Duration::ZERO);
    }
}
