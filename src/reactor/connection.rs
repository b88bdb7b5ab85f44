//! Per-connection state machine.
//!
//! Each connection tracks where it is in the read/respond/write cycle and
//! owns the queue of write requests still in flight. Transitions are
//! enumerated here; the I/O that drives them lives in the handler.

use crate::reactor::Transport;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the peer to send data.
    AwaitingRead,
    /// Bytes received, response being built.
    Processing,
    /// Response queued, waiting for write completion.
    AwaitingWrite,
    /// Teardown initiated; no new work accepted.
    Closing,
    /// Terminal. Reached exactly once.
    Closed,
}

/// Completion state of a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Pending,
    Done,
    Failed,
}

/// A response payload queued for writing.
///
/// The payload is owned and stays alive until the request reaches `Done` or
/// `Failed`; it is never dropped while the write is still outstanding.
#[derive(Debug)]
pub struct WriteRequest {
    payload: Bytes,
    written: usize,
    state: WriteState,
}

impl WriteRequest {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            written: 0,
            state: WriteState::Pending,
        }
    }

    /// Bytes not yet written.
    pub fn remaining(&self) -> &[u8] {
        &self.payload[self.written..]
    }

    /// Record `n` more bytes written; flips to `Done` when the payload is
    /// fully flushed. Returns `true` on completion.
    pub fn advance(&mut self, n: usize) -> bool {
        debug_assert_eq!(self.state, WriteState::Pending);
        self.written += n;
        debug_assert!(self.written <= self.payload.len());
        if self.written >= self.payload.len() {
            self.state = WriteState::Done;
        }
        self.state == WriteState::Done
    }

    /// Mark the write as failed; terminal like `Done`.
    pub fn fail(&mut self) {
        self.state = WriteState::Failed;
    }

    pub fn state(&self) -> WriteState {
        self.state
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    transport: Transport,
    peer: SocketAddr,
    state: ConnState,
    pending_writes: VecDeque<WriteRequest>,
}

impl Connection {
    /// Create a connection in the initial reading state.
    pub fn new(transport: Transport, peer: SocketAddr) -> Self {
        Self {
            transport,
            peer,
            state: ConnState::AwaitingRead,
            pending_writes: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Bytes arrived; a response is being built.
    pub fn begin_processing(&mut self) {
        debug_assert_eq!(self.state, ConnState::AwaitingRead);
        self.state = ConnState::Processing;
    }

    /// Queue a response payload and wait for its write to complete.
    pub fn enqueue_write(&mut self, payload: Bytes) {
        debug_assert!(matches!(
            self.state,
            ConnState::Processing | ConnState::AwaitingWrite
        ));
        self.pending_writes.push_back(WriteRequest::new(payload));
        self.state = ConnState::AwaitingWrite;
    }

    /// Oldest write still in flight.
    #[cfg(test)]
    pub fn front_write_mut(&mut self) -> Option<&mut WriteRequest> {
        self.pending_writes.front_mut()
    }

    /// One non-blocking write of the front request's remaining bytes.
    ///
    /// Returns whether that request completed. No-op returning `Ok(true)`
    /// when nothing is queued.
    pub fn write_front(&mut self) -> io::Result<bool> {
        let req = match self.pending_writes.front_mut() {
            Some(req) => req,
            None => return Ok(true),
        };
        let n = self.transport.write(req.remaining())?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
        }
        Ok(req.advance(n))
    }

    /// Pop the front request once it has reached a terminal write state.
    ///
    /// The payload is dropped by the caller, strictly after completion.
    pub fn pop_completed_write(&mut self) -> Option<WriteRequest> {
        match self.pending_writes.front() {
            Some(req) if req.state() != WriteState::Pending => self.pending_writes.pop_front(),
            _ => None,
        }
    }

    /// Whether every queued write has been popped.
    pub fn writes_drained(&self) -> bool {
        self.pending_writes.is_empty()
    }

    /// All writes flushed; go back to waiting for the next read.
    pub fn resume_reading(&mut self) {
        debug_assert_eq!(self.state, ConnState::AwaitingWrite);
        debug_assert!(self.pending_writes.is_empty());
        self.state = ConnState::AwaitingRead;
    }

    /// Initiate teardown from any non-terminal state.
    pub fn begin_close(&mut self) {
        if self.state != ConnState::Closed {
            self.state = ConnState::Closing;
        }
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnState::Closing
    }

    /// Complete teardown. Idempotent: returns `true` only on the first
    /// transition to `Closed`. Any write still pending is marked failed
    /// before its payload is dropped.
    pub fn finish_close(&mut self) -> bool {
        if self.state == ConnState::Closed {
            return false;
        }
        for req in &mut self.pending_writes {
            if req.state() == WriteState::Pending {
                req.fail();
            }
        }
        self.state = ConnState::Closed;
        true
    }
}
