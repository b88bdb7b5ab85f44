//! The reactor event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS.
//!
//! One explicitly constructed `Reactor` owns the poll instance, the
//! listening socket, the connection table, and the buffer pool. Everything
//! runs on the calling thread; handlers cooperate by returning to the loop
//! after each non-blocking operation.

use crate::reactor::handler::{self, Next};
use crate::reactor::{Acceptor, BufferPool, Connection, ListenerConfig, Transport};
use bytes::Bytes;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Maximum number of concurrent connections.
const MAX_CONNECTIONS: usize = 10000;

/// Size of each pooled read buffer.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Read buffers pre-allocated at startup; the pool grows past this on demand.
const INITIAL_POOL_BUFFERS: usize = 64;

/// Readiness events drained per poll call.
const EVENTS_CAPACITY: usize = 1024;

/// Single-threaded reactor serving the greeting protocol.
pub struct Reactor {
    poll: Poll,
    events: Events,
    acceptor: Acceptor,
    connections: Slab<Connection>,
    pool: BufferPool,
    greeting: Bytes,
    max_connections: usize,
}

impl Reactor {
    /// Bind the listener and set up the readiness machinery.
    ///
    /// A bind failure (port in use, bad address) surfaces here; the run
    /// loop is never entered.
    pub fn new(config: ListenerConfig) -> io::Result<Self> {
        let mut acceptor = Acceptor::bind(&config)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(acceptor.listener_mut(), LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            acceptor,
            connections: Slab::with_capacity(1024),
            pool: BufferPool::new(INITIAL_POOL_BUFFERS, READ_BUFFER_SIZE),
            greeting: Bytes::from_static(handler::GREETING),
            max_connections: MAX_CONNECTIONS,
        })
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn buffers_in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Block the calling thread dispatching readiness events.
    ///
    /// Returns only on a listener-fatal error: a failure of the poll
    /// primitive itself or listener corruption in the accept path.
    /// Per-connection errors terminate that connection and stay inside the
    /// loop.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            pool_buffers = self.pool.capacity(),
            buffer_size = self.pool.buffer_size(),
            "Listening for connections"
        );
        loop {
            self.turn(None)?;
        }
    }

    /// One poll/dispatch iteration. `run` calls this in a loop; tests call
    /// it directly to drive an isolated reactor deterministically.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        // Tokens are snapshotted so closing a connection mid-batch cannot
        // invalidate the iteration; stale tokens are dropped by the
        // membership check in dispatch.
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER_TOKEN {
                self.accept_ready()?;
            } else {
                self.dispatch(token.0, readable, writable);
            }
        }

        Ok(())
    }

    /// Drain the accept queue, registering each new connection for reads.
    fn accept_ready(&mut self) -> io::Result<()> {
        for (stream, peer_addr) in self.acceptor.accept_ready()? {
            if self.connections.len() >= self.max_connections {
                warn!(peer = %peer_addr, "Connection limit reached, dropping connection");
                continue;
            }

            let conn_id = self
                .connections
                .insert(Connection::new(Transport::plain(stream), peer_addr));

            let registered = {
                let registry = self.poll.registry();
                let conn = &mut self.connections[conn_id];
                registry.register(conn.transport_mut(), Token(conn_id), Interest::READABLE)
            };

            match registered {
                Ok(()) => debug!(conn_id, peer = %peer_addr, "Accepted connection"),
                Err(e) => {
                    debug!(conn_id, peer = %peer_addr, error = %e, "Register failed");
                    self.close_connection(conn_id);
                }
            }
        }
        Ok(())
    }

    /// Deliver readiness to one connection's handlers.
    ///
    /// Per-connection errors are fully absorbed here; only the registration
    /// table changes escape.
    fn dispatch(&mut self, conn_id: usize, readable: bool, writable: bool) {
        // Closed earlier in this batch; the token is stale.
        if !self.connections.contains(conn_id) {
            return;
        }

        if readable {
            let next = handler::on_readable(
                &mut self.connections[conn_id],
                &mut self.pool,
                &self.greeting,
            );
            self.apply(conn_id, next);
        }

        // The readable path may have closed the connection.
        if !self.connections.contains(conn_id) {
            return;
        }

        if writable {
            let next = handler::on_writable(&mut self.connections[conn_id]);
            self.apply(conn_id, next);
        }
    }

    /// Apply a handler's verdict to the registration table.
    fn apply(&mut self, conn_id: usize, next: Next) {
        match next {
            Next::Continue => {}
            Next::AwaitWrite => self.reregister(conn_id, Interest::WRITABLE),
            Next::AwaitRead => self.reregister(conn_id, Interest::READABLE),
            Next::Close => self.close_connection(conn_id),
        }
    }

    fn reregister(&mut self, conn_id: usize, interest: Interest) {
        let result = {
            let registry = self.poll.registry();
            match self.connections.get_mut(conn_id) {
                Some(conn) => registry.reregister(conn.transport_mut(), Token(conn_id), interest),
                None => return,
            }
        };
        if let Err(e) = result {
            debug!(conn_id, error = %e, "Reregister failed");
            if let Some(conn) = self.connections.get_mut(conn_id) {
                conn.begin_close();
            }
            self.close_connection(conn_id);
        }
    }

    /// Remove a connection from the table, deregister it, and release its
    /// resources. A no-op for ids already closed.
    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(conn.transport_mut());
            conn.finish_close();
            debug!(conn_id, peer = %conn.peer(), "Connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn test_reactor() -> Reactor {
        Reactor::new(ListenerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        })
        .unwrap()
    }

    /// Run a handful of short poll iterations.
    fn drive(reactor: &mut Reactor, iterations: usize) {
        for _ in 0..iterations {
            reactor.turn(Some(Duration::from_millis(10))).unwrap();
        }
    }

    fn connect(reactor: &Reactor) -> std::net::TcpStream {
        let client = std::net::TcpStream::connect(reactor.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client
    }

    fn read_greeting(client: &mut std::net::TcpStream) {
        let mut buf = [0u8; handler::GREETING.len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, handler::GREETING);
    }

    #[test]
    fn ping_gets_hello_and_connection_stays_open() {
        let mut reactor = test_reactor();
        let mut client = connect(&reactor);

        client.write_all(b"ping").unwrap();
        drive(&mut reactor, 20);
        read_greeting(&mut client);

        assert_eq!(reactor.connection_count(), 1);
        assert_eq!(reactor.buffers_in_flight(), 0);

        // The loop repeats: another message, another greeting.
        client.write_all(b"again").unwrap();
        drive(&mut reactor, 20);
        read_greeting(&mut client);
        assert_eq!(reactor.connection_count(), 1);
        assert_eq!(reactor.buffers_in_flight(), 0);
    }

    #[test]
    fn immediate_close_goes_straight_to_closed() {
        let mut reactor = test_reactor();
        let client = connect(&reactor);
        drive(&mut reactor, 10);
        assert_eq!(reactor.connection_count(), 1);

        drop(client);
        drive(&mut reactor, 20);

        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(reactor.buffers_in_flight(), 0);
    }

    #[test]
    fn each_client_gets_exactly_one_greeting() {
        let mut reactor = test_reactor();

        let mut clients: Vec<_> = (0..100).map(|_| connect(&reactor)).collect();
        drive(&mut reactor, 20);
        assert_eq!(reactor.connection_count(), 100);

        for client in &mut clients {
            client.write_all(b"hi").unwrap();
        }
        drive(&mut reactor, 50);

        for client in &mut clients {
            read_greeting(client);

            // Exactly one: a second read must time out, not yield bytes.
            client
                .set_read_timeout(Some(Duration::from_millis(50)))
                .unwrap();
            let mut extra = [0u8; 1];
            match client.read(&mut extra) {
                Err(e) => assert!(matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                )),
                Ok(n) => assert_eq!(n, 0, "unexpected extra response byte"),
            }
        }

        assert_eq!(reactor.buffers_in_flight(), 0);
    }

    #[test]
    fn port_in_use_fails_before_the_run_loop() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = Reactor::new(ListenerConfig {
            bind_address: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn client_close_with_write_in_flight_is_safe() {
        let mut reactor = test_reactor();

        let mut client = connect(&reactor);
        client.write_all(b"ping").unwrap();
        // Close without ever reading the response.
        drop(client);

        // The reactor observes some mix of data, reset, and EOF; whatever
        // the order, teardown must not double-release or dispatch to a
        // removed connection.
        drive(&mut reactor, 40);

        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(reactor.buffers_in_flight(), 0);
    }
}
