//! A non-blocking, poll-driven event loop.
//!
//! Nothing here runs on its own: operations are armed on the loop and only make progress while
//! the owner calls [`EventLoop::poll_once`]. Each pass runs the completions that are ready and
//! returns without waiting for new events, so the owner decides the cadence.
//!
//! Completions are delivered to callbacks. A callback never blocks; it only decides which
//! operation, if any, to arm next.

use std::io;
use std::net::{self, Shutdown, SocketAddr, ToSocketAddrs};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{self, JoinHandle};
use tracing::debug;

/// What an accept callback wants after handling a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Arm the same operation again.
    Rearm,
    /// Leave the operation disarmed.
    Disarm,
}

/// The next operation of a connection. A connection has at most one operation in flight.
#[derive(Debug, PartialEq, Eq)]
pub enum Op {
    Read,
    Write(Vec<u8>),
    Stop,
}

/// Receives the completions of a single connection.
pub trait ConnHandler: Send + 'static {
    /// A read finished. An empty slice means the peer closed its side.
    fn on_read(&mut self, result: io::Result<&[u8]>) -> Op;

    /// A write of the whole buffer finished.
    fn on_write(&mut self, result: io::Result<()>) -> Op;
}

pub struct EventLoop {
    runtime: Runtime,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;

        Ok(EventLoop { runtime })
    }

    /// Runs one pass: every operation that is ready completes and the I/O driver is polled for
    /// new readiness with a zero timeout.
    ///
    /// Must not be called from within an async context.
    pub fn poll_once(&self) {
        // `yield_now` defers its own wakeup until the driver has been polled, so the pass ends
        // right after the ready tasks ran instead of parking.
        self.runtime.block_on(task::yield_now());
    }

    /// Releases the loop. Operations still armed are dropped, which closes their sockets.
    pub fn close(self) {
        self.runtime.shutdown_background();
    }

    fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }
}

/// A listening socket registered with an [`EventLoop`].
pub struct Listener {
    local_addr: SocketAddr,
    handle: Handle,
    listener: Option<tokio::net::TcpListener>,
    accept: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds `addr`. Binding port 0 picks an ephemeral port, see [`Listener::local_addr`].
    pub fn bind<A: ToSocketAddrs>(event_loop: &EventLoop, addr: A) -> io::Result<Listener> {
        let listener = net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let handle = event_loop.handle();
        let listener = {
            let _guard = handle.enter();
            tokio::net::TcpListener::from_std(listener)?
        };

        Ok(Listener {
            local_addr,
            handle,
            listener: Some(listener),
            accept: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Arms the accept operation. `callback` runs once per accepted socket or accept error and
    /// keeps running for as long as it returns [`Action::Rearm`].
    pub fn accept<F>(&mut self, mut callback: F) -> io::Result<()>
    where
        F: FnMut(io::Result<Conn>) -> Action + Send + 'static,
    {
        let listener = self.listener.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "accept is already armed or closed")
        })?;
        let handle = self.handle.clone();

        self.accept = Some(self.handle.spawn(async move {
            loop {
                let accepted = listener.accept().await;
                let failed = accepted.is_err();
                let conn = accepted.and_then(|(stream, peer_addr)| {
                    Conn::new(stream, peer_addr, handle.clone())
                });

                if callback(conn) == Action::Disarm {
                    break;
                }
                if failed {
                    // Errors such as running out of descriptors are reported again right away,
                    // give the other operations a turn first.
                    task::yield_now().await;
                }
            }
        }));

        Ok(())
    }

    /// Stops accepting and closes the socket once the loop drops the accept operation.
    pub fn close(&mut self) {
        if let Some(accept) = self.accept.take() {
            accept.abort();
        }
        self.listener.take();
    }
}

/// An accepted connection that has no operation armed yet.
pub struct Conn {
    stream: tokio::net::TcpStream,
    control: net::TcpStream,
    peer_addr: SocketAddr,
    handle: Handle,
}

impl Conn {
    fn new(stream: tokio::net::TcpStream, peer_addr: SocketAddr, handle: Handle) -> io::Result<Conn> {
        // Keep a second handle to the socket outside of the operation that owns the stream, so
        // the socket can be shut down while a read or write is in flight.
        let stream = stream.into_std()?;
        let control = stream.try_clone()?;
        let stream = {
            let _guard = handle.enter();
            tokio::net::TcpStream::from_std(stream)?
        };

        Ok(Conn {
            stream,
            control,
            peer_addr,
            handle,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Hands the connection over to `handler`, arming a first read of up to `buffer_size` bytes.
    ///
    /// The returned handle controls the socket from outside the loop.
    pub fn start<H: ConnHandler>(self, buffer_size: usize, mut handler: H) -> ConnHandle {
        let Conn {
            mut stream,
            control,
            peer_addr,
            handle,
        } = self;

        handle.spawn(async move {
            let mut buf = vec![0u8; buffer_size.max(1)];
            let mut op = Op::Read;

            loop {
                op = match op {
                    Op::Read => {
                        let result = stream.read(&mut buf).await;
                        handler.on_read(result.map(|n| &buf[..n]))
                    }
                    Op::Write(data) => {
                        let result = stream.write_all(&data).await;
                        handler.on_write(result)
                    }
                    Op::Stop => break,
                };
            }
        });

        ConnHandle { control, peer_addr }
    }
}

/// Out-of-band control over a connection's socket. Dropping it closes this handle's descriptor.
#[derive(Debug)]
pub struct ConnHandle {
    control: net::TcpStream,
    peer_addr: SocketAddr,
}

impl ConnHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Shuts down both directions. Operations in flight on the socket complete with an error or
    /// end of stream on their next pass.
    pub fn shutdown(&self) {
        if let Err(err) = self.control.shutdown(Shutdown::Both) {
            // The peer may have reset the connection already.
            debug!(peer = %self.peer_addr, "shutdown failed: {}", err);
        }
    }
}
