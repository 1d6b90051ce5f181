use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::Connection;
use crate::event_loop::{Action, Conn, ConnHandle, EventLoop, Listener};
use crate::frame::Limits;
use crate::store::Store;
use crate::Result;

/// A running server. The listener, the connections and the event loop are all driven by one
/// control thread; dropping the server shuts it down.
pub struct Server {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    control: Option<thread::JoinHandle<()>>,
}

impl Server {
    /// Binds `config.addr`, arms the accept operation and starts the control loop.
    pub fn start(config: &Config) -> Result<Server> {
        let event_loop = EventLoop::new()?;

        // The loop may be created from within an async context, where dropping it would panic.
        let listener = match Listener::bind(&event_loop, config.addr.as_str()) {
            Ok(listener) => listener,
            Err(err) => {
                event_loop.close();
                return Err(err.into());
            }
        };
        let local_addr = listener.local_addr();
        let shared = Arc::new(Shared::new(Store::new()));

        let mut control = ControlLoop {
            event_loop,
            listener,
            shared: shared.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            poll_interval: config.poll_interval(),
            shutdown_passes: config.shutdown_passes,
        };

        let accept_shared = shared.clone();
        let limits = config.parser_limits();
        let buffer_size = config.read_buffer_size;
        let armed = control.listener.accept(move |accepted| {
            match accepted {
                Ok(conn) => accept_connection(conn, &accept_shared, limits, buffer_size),
                Err(err) => error!("failed to accept connection: {}", err),
            }
            Action::Rearm
        });
        if let Err(err) = armed {
            control.event_loop.close();
            return Err(err.into());
        }

        let stop = control.stop.clone();
        let control = thread::Builder::new()
            .name("respkv-control".to_string())
            .spawn(move || control.run())?;

        info!("server listening on {}", local_addr);

        Ok(Server {
            local_addr,
            shared,
            stop,
            control: Some(control),
        })
    }

    /// The bound address, with the actual port when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle to the keyspace shared by every connection.
    pub fn store(&self) -> Store {
        self.shared.store.clone()
    }

    /// Number of connections that are registered and not yet closing.
    pub fn connection_count(&self) -> usize {
        self.shared.registry().connections.len()
    }

    /// Stops accepting, closes every connection and releases the event loop. Blocks until done.
    ///
    /// Calling it more than once is a no-op.
    pub fn close(&mut self) {
        let Some(control) = self.control.take() else {
            return;
        };

        self.stop.store(true, Ordering::Release);
        if control.join().is_err() {
            error!("control loop panicked");
        }

        info!("server on {} closed", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_connection(conn: Conn, shared: &Arc<Shared>, limits: Limits, buffer_size: usize) {
    let id = Uuid::new_v4();
    let client_address = conn.peer_addr();
    info!(connection_id = %id, "accepted connection from {}", client_address);

    let connection = Connection::new(id, client_address, shared.clone(), limits);
    let handle = conn.start(buffer_size, connection);

    // The first read cannot complete before this returns, both run on the control thread.
    shared.register(id, handle);
}

/// State shared by the control loop and the connections.
pub(crate) struct Shared {
    pub(crate) store: Store,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<Uuid, ConnHandle>,
    // Handles of quiesced connections, waiting for the control loop to close them.
    pending_close: Vec<ConnHandle>,
}

impl Shared {
    pub(crate) fn new(store: Store) -> Shared {
        Shared {
            store,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub(crate) fn register(&self, id: Uuid, handle: ConnHandle) {
        self.registry().connections.insert(id, handle);
    }

    /// Shuts the socket down, forgets the connection and queues its handle to be closed.
    ///
    /// Returns `false` if the connection was already quiesced.
    pub(crate) fn quiesce(&self, id: &Uuid) -> bool {
        let mut registry = self.registry();

        match registry.connections.remove(id) {
            Some(handle) => {
                handle.shutdown();
                registry.pending_close.push(handle);
                true
            }
            None => false,
        }
    }

    fn quiesce_all(&self) -> usize {
        let mut registry = self.registry();
        let Registry {
            connections,
            pending_close,
        } = &mut *registry;

        let count = connections.len();
        for (_, handle) in connections.drain() {
            handle.shutdown();
            pending_close.push(handle);
        }

        count
    }

    fn drain_pending(&self) -> usize {
        let pending = std::mem::take(&mut self.registry().pending_close);
        let count = pending.len();

        for handle in pending {
            debug!("closing socket of {}", handle.peer_addr());
        }

        count
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ControlLoop {
    event_loop: EventLoop,
    listener: Listener,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    shutdown_passes: usize,
}

impl ControlLoop {
    fn run(self) {
        while !self.stop.load(Ordering::Acquire) {
            self.event_loop.poll_once();
            self.shared.drain_pending();
            thread::sleep(self.poll_interval);
        }

        self.shutdown();
    }

    fn shutdown(mut self) {
        self.listener.close();

        let quiesced = self.shared.quiesce_all();
        info!("shutting down, closing {} connection(s)", quiesced);

        // In-flight operations observe the shutdown and stop on their own.
        for _ in 0..self.shutdown_passes {
            self.event_loop.poll_once();
            self.shared.drain_pending();
        }

        let remaining = self.shared.quiesce_all() + self.shared.drain_pending();
        if remaining > 0 {
            warn!("force closing {} connection(s)", remaining);
        }

        // Drops whatever operations are still armed, closing their sockets.
        self.event_loop.close();
    }
}
