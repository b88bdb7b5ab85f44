//! Event-driven reactor core.
//!
//! A single thread owns the event loop; readiness events on the listening
//! socket and on each connection are dispatched through per-event handlers,
//! and nothing blocks waiting on any one connection.
//!
//! Shared pieces:
//! - `BufferPool`: read scratch buffers with exact acquire/release pairing
//! - `Connection`: per-socket state machine and write queue
//! - `Acceptor`: bound listener and bounded accept loop
//! - `Reactor`: the poll/dispatch loop tying it together

mod acceptor;
mod buffer;
mod connection;
mod event_loop;
mod handler;
mod transport;

pub(crate) use acceptor::{Acceptor, ListenerConfig};
pub(crate) use buffer::BufferPool;
pub(crate) use connection::{ConnState, Connection};
pub(crate) use event_loop::Reactor;
pub(crate) use transport::Transport;
