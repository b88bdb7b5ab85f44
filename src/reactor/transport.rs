//! Byte-level transport for a connection.
//!
//! The handler state machine reads and writes through this seam rather than
//! touching the socket directly. Plain TCP is the only variant today; an
//! encrypted transport would be a second arm selected at accept time, with
//! the state machine unchanged.

use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};

/// Transport over which a connection moves bytes.
#[derive(Debug)]
pub enum Transport {
    /// Unencrypted TCP stream.
    Plain(TcpStream),
}

impl Transport {
    /// Wrap a plain TCP stream.
    pub fn plain(stream: TcpStream) -> Self {
        Transport::Plain(stream)
    }

    /// Non-blocking read into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
        }
    }

    /// Non-blocking write from `buf`.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
        }
    }
}

impl Source for Transport {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.deregister(registry),
        }
    }
}
