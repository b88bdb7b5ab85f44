//! Per-event connection handlers.
//!
//! The reactor calls `on_readable`/`on_writable` for a ready connection and
//! applies the returned `Next` to its registration table. Handlers never
//! block: a would-block result leaves the connection untouched until the
//! next readiness event.
//!
//! Buffer ownership: every readable event acquires exactly one pool buffer
//! and releases it at a single point before the outcome is acted on, so the
//! data, EOF, error and would-block paths cannot leak or double-release.

use crate::reactor::{BufferPool, ConnState, Connection};
use bytes::Bytes;
use std::io;
use tracing::{debug, trace};

/// Fixed response written after every successful read.
pub const GREETING: &[u8] = b"Hello\n";

/// What the loop should do with a connection after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// No registration change.
    Continue,
    /// Switch interest to writable; a response is queued.
    AwaitWrite,
    /// Switch interest back to readable; all writes flushed.
    AwaitRead,
    /// Tear the connection down.
    Close,
}

/// Outcome of a single read attempt, decided before the buffer goes back
/// to the pool.
enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
    Error(io::Error),
}

/// Readable event: one non-blocking read, then respond, close, or wait.
pub fn on_readable(conn: &mut Connection, pool: &mut BufferPool, greeting: &Bytes) -> Next {
    if conn.state() != ConnState::AwaitingRead {
        return Next::Continue;
    }

    let hint = pool.buffer_size();
    let buf_idx = pool.acquire(hint);
    let outcome = match conn.transport_mut().read(pool.get_mut(buf_idx)) {
        Ok(0) => ReadOutcome::Eof,
        Ok(n) => ReadOutcome::Data(n),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::WouldBlock,
        Err(e) => ReadOutcome::Error(e),
    };
    // Single release point for every path out of this handler.
    pool.release(buf_idx);

    match outcome {
        ReadOutcome::Data(n) => {
            trace!(peer = %conn.peer(), bytes = n, "Read");
            conn.begin_processing();
            conn.enqueue_write(greeting.clone());
            Next::AwaitWrite
        }
        ReadOutcome::WouldBlock => Next::Continue,
        ReadOutcome::Eof => {
            trace!(peer = %conn.peer(), "EOF");
            conn.begin_close();
            Next::Close
        }
        ReadOutcome::Error(e) => {
            debug!(peer = %conn.peer(), error = %e, "Read error");
            conn.begin_close();
            Next::Close
        }
    }
}

/// Writable event: flush queued writes in order until done or would-block.
///
/// A request's payload is popped (and only then dropped) strictly after its
/// write completes or fails.
pub fn on_writable(conn: &mut Connection) -> Next {
    if conn.state() != ConnState::AwaitingWrite {
        return Next::Continue;
    }

    while !conn.writes_drained() {
        match conn.write_front() {
            Ok(true) => {
                let _completed = conn.pop_completed_write();
            }
            Ok(false) => {} // partial progress, write again
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Next::Continue,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(peer = %conn.peer(), error = %e, "Write error");
                conn.begin_close();
                return Next::Close;
            }
        }
    }

    if conn.is_closing() {
        Next::Close
    } else {
        conn.resume_reading();
        Next::AwaitRead
    }
}
