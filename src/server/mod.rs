//! The reactor.
//!
//! One thread owns the poll loop, the connection table and the idle timer. It accepts clients,
//! hands readiness to the worker pool and closes connections. Workers never touch the table, they
//! re-arm the connection they were given or ask the reactor to close it.

use config::{Config, TriggerMode};
use connection::{Connection, Handle, Next};
use credentials::CredentialStore;
use error::Result;
use pool::WorkerPool;
use timer::{self, Timer};

use std::io::{self, Write};
use std::mem;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::TcpStream;
use mio::unix::UnixReady;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use slab::Slab;

mod acceptor;
use self::acceptor::Acceptor;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
/// Connection tokens are their slab slot shifted past the fixed tokens.
const FIRST_CONNECTION: usize = 2;

const LINGER: Duration = Duration::from_secs(1);

const BUSY: &[u8] = b"Server busy!";

/// Close requests from workers and timers, carried out by the reactor.
struct Closer {
    pending: Mutex<Vec<Handle>>,
    waker: SetReadiness,
}

impl Closer {
    fn request(&self, handle: Handle) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(handle);
        }
        let _ = self.waker.set_readiness(Ready::readable());
    }

    fn take(&self) -> Vec<Handle> {
        match self.pending.lock() {
            Ok(mut pending) => mem::replace(&mut *pending, Vec::new()),
            Err(_) => Vec::new(),
        }
    }
}

/// Stops a running server from any thread.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    waker: SetReadiness,
}

impl Shutdown {
    /// Ask the reactor to stop. `run` returns once it notices.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.set_readiness(Ready::readable());
    }
}

/// Internal state of the entire server.
pub struct Server {
    events: Events,
    poll: Arc<Poll>,
    acceptor: Acceptor,
    config: Arc<Config>,
    trigger: TriggerMode,
    root: Arc<PathBuf>,
    users: Arc<dyn CredentialStore>,
    connections: Slab<Arc<Connection>>,
    next_serial: u64,
    timer: Option<Box<dyn Timer>>,
    pool: WorkerPool,
    closer: Arc<Closer>,
    stopped: Arc<AtomicBool>,
    // kept alive so the waker stays registered
    _registration: Registration,
    waker: SetReadiness,
}

impl Server {
    /// Create a new server. Binds the listening socket and starts the workers, so may fail.
    pub fn new(config: Arc<Config>, users: Arc<dyn CredentialStore>) -> Result<Self> {
        let events = Events::with_capacity(config.events_capacity);
        let poll = Poll::new()?;
        let acceptor = Acceptor::new(config.port)?;
        let trigger = config.trigger();

        let listen_opts = if trigger.listener_edge {
            PollOpt::edge()
        } else {
            PollOpt::level()
        };
        poll.register(&acceptor, LISTENER, Ready::readable(), listen_opts)?;

        let (registration, waker) = Registration::new2();
        poll.register(&registration, WAKER, Ready::readable(), PollOpt::edge())?;

        let timer = if config.timeout_ms > 0 {
            Some(timer::new_timer(
                config.timer,
                Duration::from_millis(config.wheel_cadence_ms),
            ))
        } else {
            None
        };

        let pool = WorkerPool::new(config.workers)?;

        info!("========== Server init ==========");
        info!(
            "Port: {}, linger: {}, listener edge: {}, connection edge: {}",
            config.port, config.linger, trigger.listener_edge, trigger.connection_edge
        );
        info!("Timer: {:?}, timeout: {}ms", config.timer, config.timeout_ms);
        info!(
            "Workers: {}, max connections: {}",
            config.workers, config.max_connections
        );
        info!("Serving {:?}", config.root_dir);

        Ok(Server {
            events,
            poll: Arc::new(poll),
            acceptor,
            root: Arc::new(config.root_dir.clone()),
            config,
            trigger,
            users,
            connections: Slab::new(),
            next_serial: 0,
            timer,
            pool,
            closer: Arc::new(Closer {
                pending: Mutex::new(Vec::new()),
                waker: waker.clone(),
            }),
            stopped: Arc::new(AtomicBool::new(false)),
            _registration: registration,
            waker,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// A handle that stops `run` from another thread.
    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown {
            flag: self.stopped.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Run the event loop until shut down.
    pub fn run(&mut self) -> Result<()> {
        while !self.stopped.load(Ordering::SeqCst) {
            let timeout = match self.timer {
                Some(ref mut timer) => timer.next_deadline(),
                None => None,
            };
            self.reap();

            let events = match self.poll(timeout) {
                Ok(events) => events,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Polling failed: {}", e);
                    return Err(e.into());
                }
            };

            for event in events {
                match event {
                    Event::Acceptor => self.accept(),
                    Event::Waker => {
                        let _ = self.waker.set_readiness(Ready::empty());
                    }
                    Event::Connection(slot, ready) => self.dispatch(slot, ready),
                }
            }
            self.reap();
        }

        info!("Server stopping, closing {} clients", self.connections.len());
        let handles: Vec<Handle> = self.connections.iter().map(|(_, conn)| conn.handle()).collect();
        for handle in handles {
            self.close(handle);
        }
        Ok(())
    }

    /// Poll for events. This is a blocking call. Will return a vector of all the events that have
    /// occured.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        let &mut Server {
            ref poll,
            ref mut events,
            ..
        } = self;
        poll.poll(events, timeout)?;

        let output = events
            .iter()
            .map(|event| match event.token() {
                LISTENER => Event::Acceptor,
                WAKER => Event::Waker,
                Token(n) => Event::Connection(n - FIRST_CONNECTION, event.readiness()),
            })
            .collect();

        Ok(output)
    }

    /// Accept pending clients. In edge triggered mode this keeps going until the listener runs
    /// dry, otherwise one client per event.
    fn accept(&mut self) {
        loop {
            let (sock, peer) = match self.acceptor.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    return;
                }
            };

            if self.connections.len() >= self.config.max_connections {
                warn!("Clients are full, turning away {}", peer);
                reject(sock);
            } else {
                self.add_client(sock, peer);
            }

            if !self.trigger.listener_edge {
                return;
            }
        }
    }

    fn add_client(&mut self, sock: TcpStream, peer: SocketAddr) {
        if self.config.linger {
            if let Err(e) = sock.set_linger(Some(LINGER)) {
                warn!("Could not set linger on {}: {}", peer, e);
            }
        }

        let serial = self.next_serial;
        self.next_serial += 1;

        let handle = {
            let entry = self.connections.vacant_entry();
            let handle = Handle {
                slot: entry.key(),
                serial,
            };
            let conn = Connection::new(
                handle,
                Token(handle.slot + FIRST_CONNECTION),
                sock,
                peer,
                self.trigger.connection_edge,
                self.root.clone(),
                self.users.clone(),
            );
            if let Err(e) = conn.register(&self.poll) {
                warn!("Could not register {}: {}", peer, e);
                return;
            }
            entry.insert(Arc::new(conn));
            handle
        };

        if let Some(ref mut timer) = self.timer {
            let closer = self.closer.clone();
            timer.add(
                handle.slot,
                Duration::from_millis(self.config.timeout_ms),
                Box::new(move || closer.request(handle)),
            );
        }
        info!("Client[{}] in, {} connected", peer, self.connections.len());
    }

    /// Hand a ready connection to a worker.
    fn dispatch(&mut self, slot: usize, ready: Ready) {
        let conn = match self.connections.get(slot) {
            Some(conn) => conn.clone(),
            None => return,
        };

        let unix = UnixReady::from(ready);
        if unix.is_hup() || unix.is_error() {
            self.close(conn.handle());
            return;
        }
        if !conn.try_begin() {
            trace!("Client[{}] already has a task running", conn.peer());
            return;
        }

        if let Some(ref mut timer) = self.timer {
            timer.adjust(slot, Duration::from_millis(self.config.timeout_ms));
        }

        let handle = conn.handle();
        let poll = self.poll.clone();
        let closer = self.closer.clone();
        let submitted = if ready.is_readable() {
            self.pool.submit(move || {
                let next = conn.on_read();
                resume(&conn, next, &poll, &closer);
            })
        } else if ready.is_writable() {
            self.pool.submit(move || {
                let next = conn.on_write();
                resume(&conn, next, &poll, &closer);
            })
        } else {
            conn.finish();
            return;
        };

        if let Err(e) = submitted {
            warn!("Could not hand Client[{}] to a worker: {}", slot, e);
            self.close(handle);
        }
    }

    /// Carry out close requests.
    fn reap(&mut self) {
        for handle in self.closer.take() {
            self.close(handle);
        }
    }

    /// Remove a connection from the table, the timer and the poll set. Requests for a connection
    /// that has already gone, or whose slot now holds another client, are ignored.
    fn close(&mut self, handle: Handle) {
        let current = self
            .connections
            .get(handle.slot)
            .map_or(false, |conn| conn.handle() == handle);
        if !current {
            return;
        }

        let conn = self.connections.remove(handle.slot);
        if let Some(ref mut timer) = self.timer {
            timer.cancel(handle.slot);
        }
        conn.close(&self.poll);
        info!(
            "Client[{}] quit, {} connected",
            conn.peer(),
            self.connections.len()
        );
    }
}

/// Possible events that can happen to the server.
enum Event {
    /// The acceptor has clients waiting.
    Acceptor,
    /// A worker, timer or shutdown handle wants the reactor's attention.
    Waker,
    /// One of the connections, by slab slot, is ready.
    Connection(usize, Ready),
}

/// Turn a client away when the table is full.
fn reject(mut sock: TcpStream) {
    if let Err(e) = sock.write(BUSY) {
        debug!("Could not tell client the server is busy: {}", e);
    }
}

/// Run on a worker once its task is done: re-arm for what the connection wants next, or hand it
/// back to the reactor to close.
fn resume(conn: &Connection, next: Next, poll: &Poll, closer: &Closer) {
    conn.finish();
    match next {
        Next::Close => closer.request(conn.handle()),
        next => {
            if let Err(e) = conn.rearm(poll, next) {
                debug!("Could not re-arm Client[{}]: {}", conn.peer(), e);
                closer.request(conn.handle());
            }
        }
    }
}
