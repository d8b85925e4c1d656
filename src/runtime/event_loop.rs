//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! A single thread owns the poll, every client socket and the [`Store`].
//! Requests from all connections are therefore applied one at a time and the
//! store needs no locking.
//!
//! mio readiness is edge-triggered: a readable socket is drained with bounded
//! reads until `WouldBlock`, and a pending response is written until it is
//! flushed or the socket stops accepting data.

use crate::config::Config;
use crate::runtime::connection::{ConnPhase, ConnectionState};
use crate::store::Store;
use bytes::BytesMut;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 1024;

/// A client socket and its protocol state.
struct ClientConnection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnectionState,
}

/// Stops a running [`Reactor`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the loop to exit. It finishes the current batch of events first.
    pub fn stop(&self) -> io::Result<()> {
        self.stopped.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Single-threaded connection multiplexer serving one [`Store`].
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    stopped: Arc<AtomicBool>,
    connections: Slab<ClientConnection>,
    store: Store,
    /// Reusable buffer for a single bounded read.
    scratch: Vec<u8>,
    events_capacity: usize,
    max_connections: usize,
    max_frame_size: usize,
}

impl Reactor {
    /// Bind the listening socket and set up the poll.
    ///
    /// A bind failure is returned to the caller; there is no retry.
    pub fn bind(config: &Config, store: Store) -> io::Result<Self> {
        let addr = resolve(&config.listen)?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        info!(addr = %listener.local_addr()?, "Listening");

        Ok(Self {
            poll,
            listener,
            waker,
            stopped: Arc::new(AtomicBool::new(false)),
            connections: Slab::with_capacity(config.max_connections.min(4096)),
            store,
            scratch: vec![0u8; config.read_buffer_size.max(1)],
            events_capacity: config.events_capacity.max(1),
            max_connections: config.max_connections,
            max_frame_size: config.max_frame_size,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stopped: Arc::clone(&self.stopped),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Mutable access for setup, e.g. registering callbacks before [`Reactor::run`].
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until [`ShutdownHandle::stop`] is called.
    ///
    /// Every connection and the listener are released before the store is
    /// handed back.
    pub fn run(mut self) -> io::Result<Store> {
        let mut events = Events::with_capacity(self.events_capacity);

        info!(
            read_buffer_size = self.scratch.len(),
            max_frame_size = self.max_frame_size,
            max_connections = self.max_connections,
            "Reactor started"
        );

        while !self.stopped.load(Ordering::Acquire) {
            self.turn(&mut events, None)?;
        }

        self.shutdown();
        Ok(self.store)
    }

    /// Wait up to `timeout` for readiness and handle whatever arrived.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);
        self.turn(&mut events, timeout)
    }

    fn turn(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        if let Err(e) = self.poll.poll(events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => trace!("Woken"),
                LISTENER_TOKEN => self.accept_connections(),
                Token(conn_id) => {
                    if let Err(e) = self.handle_connection_event(conn_id, event) {
                        log_connection_error(conn_id, &e);
                        self.close_connection(conn_id);
                    }
                }
            }
        }

        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.connections.len() >= self.max_connections {
                        warn!(peer = %peer, limit = self.max_connections, "Connection limit reached");
                        continue;
                    }

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let entry = self.connections.vacant_entry();
                    let conn_id = entry.key();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, Token(conn_id), Interest::READABLE)
                    {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }

                    let mut state = ConnectionState::new(self.max_frame_size);
                    state.begin_reading();
                    entry.insert(ClientConnection {
                        stream,
                        peer,
                        state,
                    });

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Event) -> io::Result<()> {
        if !self.connections.contains(conn_id) {
            return Ok(());
        }

        if event.is_readable() || event.is_read_closed() {
            self.handle_readable(conn_id)?;
        }

        if event.is_writable() {
            self.handle_writable(conn_id)?;
        }

        Ok(())
    }

    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        loop {
            match conn.stream.read(&mut self.scratch) {
                Ok(0) => {
                    trace!(conn_id, "Peer shut down writes");
                    conn.state.mark_peer_closed();
                    break;
                }
                Ok(n) => {
                    trace!(conn_id, bytes = n, "Read");
                    conn.state.receive(&self.scratch[..n])?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let peer_closed = conn.state.is_peer_closed();
        self.process_frames(conn_id)?;

        // No further readable events will arrive; answer what was received and close.
        if peer_closed {
            self.handle_writable(conn_id)?;
        }
        Ok(())
    }

    /// Dispatch every buffered frame and queue the combined response.
    fn process_frames(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        let frames = conn.state.take_frames();
        if frames.is_empty() {
            return Ok(());
        }

        let mut response = BytesMut::new();
        for frame in &frames {
            response.extend_from_slice(&self.store.dispatch(frame));
        }
        trace!(conn_id, frames = frames.len(), bytes = response.len(), "Dispatched");

        conn.state.queue_response(response.freeze());
        self.poll.registry().reregister(
            &mut conn.stream,
            Token(conn_id),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        Ok(())
    }

    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        if conn.state.phase() != ConnPhase::AwaitingWrite {
            return close_if_drained(&conn.state);
        }

        while !conn.state.is_sent() {
            match conn.stream.write(conn.state.unsent()) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    conn.state.advance(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        conn.state.finish_write();
        self.poll
            .registry()
            .reregister(&mut conn.stream, Token(conn_id), Interest::READABLE)?;
        trace!(conn_id, "Response flushed");

        // Requests pipelined behind the one just answered.
        self.process_frames(conn_id)?;

        match self.connections.get(conn_id) {
            Some(conn) => close_if_drained(&conn.state),
            None => Ok(()),
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.try_remove(conn_id) {
            if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                debug!(conn_id, error = %e, "Failed to deregister connection");
            }
            conn.state.close();
            debug!(conn_id, peer = %conn.peer, "Connection closed");
        }
    }

    fn shutdown(&mut self) {
        let open: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for conn_id in open {
            self.close_connection(conn_id);
        }
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "Failed to deregister listener");
        }

        info!(entries = self.store.len(), "Reactor stopped");
    }
}

/// Close once the peer is gone and every request has been answered.
fn close_if_drained(state: &ConnectionState) -> io::Result<()> {
    if state.is_drained() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
    }
    Ok(())
}

fn log_connection_error(conn_id: usize, e: &io::Error) {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => debug!(conn_id, "Peer closed connection"),
        io::ErrorKind::InvalidData => warn!(conn_id, error = %e, "Dropping connection"),
        _ => debug!(conn_id, error = %e, "Connection error"),
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address for '{listen}'"),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
