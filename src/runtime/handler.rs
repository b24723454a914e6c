//! Per-event echo logic.
//!
//! Connections are registered edge-triggered, so a readable event must be
//! drained until the socket reports would-block; otherwise bytes already
//! queued in the kernel never produce another edge.
//!
//! Bytes the socket refuses to take are kept in the connection's pending
//! queue and flushed on the next writable event, ahead of anything read later.

use crate::runtime::connection::Connection;
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::io::{self, Read, Write};
use tracing::trace;

/// One item of a drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Bytes),
    /// The peer shut down its write side.
    Eof,
}

/// Lazy read-until-would-block sequence over a non-blocking stream.
///
/// Yields every chunk currently buffered by the kernel and ends at
/// would-block. `Eof` and errors are terminal.
pub struct Drain<'a, S> {
    stream: &'a mut S,
    buf: BytesMut,
    capacity: usize,
    finished: bool,
}

impl<'a, S: Read> Drain<'a, S> {
    pub fn new(stream: &'a mut S, capacity: usize) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            finished: false,
        }
    }

    /// The underlying stream, for writing between reads.
    pub fn get_mut(&mut self) -> &mut S {
        &mut *self.stream
    }
}

impl<S: Read> Iterator for Drain<'_, S> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        self.buf.resize(self.capacity, 0);
        loop {
            match self.stream.read(&mut self.buf[..]) {
                Ok(0) => {
                    self.finished = true;
                    return Some(Ok(Chunk::Eof));
                }
                Ok(n) => {
                    self.buf.truncate(n);
                    return Some(Ok(Chunk::Data(self.buf.split().freeze())));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.finished = true;
                    return None;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<S: Read> std::iter::FusedIterator for Drain<'_, S> {}

/// Why a connection is being torn down.
#[derive(Debug)]
pub enum CloseReason {
    PeerClosed,
    ReadError(io::Error),
    WriteError(io::Error),
    /// Re-enabling the one-shot registration failed.
    Rearm(io::Error),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::ReadError(e) => write!(f, "read failed: {e}"),
            CloseReason::WriteError(e) => write!(f, "write failed: {e}"),
            CloseReason::Rearm(e) => write!(f, "re-arm failed: {e}"),
        }
    }
}

/// Result of handling one event.
#[derive(Debug)]
pub enum Outcome {
    /// Connection stays open; re-arm with [`Connection::interest`].
    Open,
    Close(CloseReason),
}

impl<S: Read + Write> Connection<S> {
    /// Drain readable data and echo it back.
    ///
    /// Stops early once `max_pending` unsent bytes are queued; the caller
    /// then arms writable interest only.
    ///
    /// A zero-length read closes the connection straight away. Anything still
    /// in the pending queue at that point is discarded rather than flushed, so
    /// a peer that half-closes before reading its echo can lose the tail.
    pub fn on_readable(&mut self, buffer_size: usize, max_pending: usize) -> Outcome {
        let Some(stream) = self.stream.as_mut() else {
            return Outcome::Open;
        };
        let pending = &mut self.pending;

        let mut chunks = Drain::new(stream, buffer_size);
        while let Some(chunk) = chunks.next() {
            match chunk {
                Ok(Chunk::Data(data)) => {
                    trace!(bytes = data.len(), "Received");
                    if let Err(e) = echo(chunks.get_mut(), pending, &data) {
                        return Outcome::Close(CloseReason::WriteError(e));
                    }
                    if pending.len() >= max_pending {
                        trace!(pending = pending.len(), "Output backlog full, pausing reads");
                        return Outcome::Open;
                    }
                }
                Ok(Chunk::Eof) => return Outcome::Close(CloseReason::PeerClosed),
                Err(e) => return Outcome::Close(CloseReason::ReadError(e)),
            }
        }

        Outcome::Open
    }

    /// Flush queued echo bytes.
    pub fn on_writable(&mut self) -> Outcome {
        let Some(stream) = self.stream.as_mut() else {
            return Outcome::Open;
        };
        if self.pending.is_empty() {
            return Outcome::Open;
        }

        match write_some(stream, &self.pending) {
            Ok(n) => {
                self.pending.advance(n);
                trace!(written = n, remaining = self.pending.len(), "Flushed backlog");
                Outcome::Open
            }
            Err(e) => Outcome::Close(CloseReason::WriteError(e)),
        }
    }
}

/// Write `data` back, queueing whatever the socket does not accept.
fn echo<W: Write>(out: &mut W, pending: &mut BytesMut, data: &[u8]) -> io::Result<()> {
    // Earlier bytes are still queued; keep order.
    if !pending.is_empty() {
        pending.extend_from_slice(data);
        return Ok(());
    }

    let written = write_some(out, data)?;
    if written < data.len() {
        pending.extend_from_slice(&data[written..]);
    }
    Ok(())
}

/// Write as much of `data` as the socket takes without blocking.
fn write_some<W: Write>(out: &mut W, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match out.write(&data[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
