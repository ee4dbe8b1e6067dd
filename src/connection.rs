//! A single client connection.
//!
//! The reactor owns connections through their slab slot and only ever hands a clone of the `Arc`
//! to one worker at a time. Sockets are registered one-shot, so no further events arrive for a
//! connection until the worker that handled the last one has re-armed it.

use iovec::IoVec;

use mio::net::TcpStream;
use mio::unix::UnixReady;
use mio::{Poll, PollOpt, Ready, Token};

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use buffer::Buffer;
use credentials::CredentialStore;
use http::{Progress, Request, Response, Status};

/// In level triggered mode, a write task hands the rest back to the reactor once no more than this
/// many bytes remain.
const WRITE_CHUNK: usize = 10_240;

/// Identifies one connection for as long as it lives. Slots are reused, serials are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub slot: usize,
    pub serial: u64,
}

/// What a connection wants to wait for after a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    AwaitRead,
    AwaitWrite,
    Close,
}

/// Parser and response state, only touched by the worker currently running a task.
struct Session {
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Response,
    keep_alive: bool,
    /// How much of the mapped file has been written.
    sent: usize,
}

impl Session {
    /// Parse what has been read so far and stage a response if a request is complete. Returns
    /// whether there is a response to write.
    fn process(&mut self, root: &Path) -> bool {
        if self.read_buf.readable() == 0 {
            return false;
        }

        let hint = match self.request.parse(&mut self.read_buf) {
            Progress::Incomplete => return false,
            Progress::Complete => {
                self.keep_alive = self.request.keep_alive();
                None
            }
            Progress::Failed => {
                self.keep_alive = false;
                self.read_buf.retrieve_all();
                Some(Status::BadRequest)
            }
        };

        self.response
            .init(root, self.request.path(), self.keep_alive, hint);
        self.write_buf.retrieve_all();
        self.response.build(&mut self.write_buf);
        self.sent = 0;
        self.request.reset();
        true
    }

    fn remaining(&self) -> usize {
        self.write_buf.readable() + self.response.file_len() - self.sent
    }

    /// One gather write of the staged headers followed by the unsent part of the file.
    fn write_to(&mut self, sock: &TcpStream) -> io::Result<usize> {
        let head = self.write_buf.readable();
        let len = {
            let body = match self.response.file() {
                Some(file) => &file[self.sent..],
                None => &[][..],
            };
            if body.is_empty() {
                return self.write_buf.write_fd(sock);
            }

            let header = self.write_buf.peek();
            if header.is_empty() {
                let vectors: [&IoVec; 1] = [body.into()];
                sock.write_bufs(&vectors)?
            } else {
                let vectors: [&IoVec; 2] = [header.into(), body.into()];
                sock.write_bufs(&vectors)?
            }
        };

        if len > head {
            self.write_buf.retrieve_all();
            self.sent += len - head;
        } else {
            self.write_buf.retrieve(len);
        }
        Ok(len)
    }
}

pub struct Connection {
    handle: Handle,
    token: Token,
    peer: SocketAddr,
    sock: TcpStream,
    edge: bool,
    root: Arc<PathBuf>,
    closed: AtomicBool,
    busy: AtomicBool,
    session: Mutex<Session>,
}

impl Connection {
    pub fn new(
        handle: Handle,
        token: Token,
        sock: TcpStream,
        peer: SocketAddr,
        edge: bool,
        root: Arc<PathBuf>,
        users: Arc<dyn CredentialStore>,
    ) -> Self {
        Connection {
            handle,
            token,
            peer,
            sock,
            edge,
            root,
            closed: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            session: Mutex::new(Session {
                read_buf: Buffer::new(),
                write_buf: Buffer::new(),
                request: Request::new(users),
                response: Response::new(),
                keep_alive: false,
                sent: 0,
            }),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn opts(&self) -> PollOpt {
        if self.edge {
            PollOpt::edge() | PollOpt::oneshot()
        } else {
            PollOpt::level() | PollOpt::oneshot()
        }
    }

    fn interest(next: Next) -> Ready {
        let hup = Ready::from(UnixReady::hup());
        match next {
            Next::AwaitWrite => Ready::writable() | hup,
            _ => Ready::readable() | hup,
        }
    }

    /// Start watching the socket for the first request.
    pub fn register(&self, poll: &Poll) -> io::Result<()> {
        poll.register(
            &self.sock,
            self.token,
            Connection::interest(Next::AwaitRead),
            self.opts(),
        )
    }

    /// Arm the one-shot registration again for whatever the last task asked for.
    pub fn rearm(&self, poll: &Poll, next: Next) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        poll.reregister(&self.sock, self.token, Connection::interest(next), self.opts())
    }

    /// Claim the connection for a task. Fails if a task is already running.
    pub fn try_begin(&self) -> bool {
        !self.busy.swap(true, Ordering::SeqCst)
    }

    pub fn finish(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Deregister and shut the socket down. The descriptor itself goes when the last `Arc` does.
    pub fn close(&self, poll: &Poll) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = poll.deregister(&self.sock) {
            trace!("Deregistering {} failed: {}", self.peer, e);
        }
        let _ = self.sock.shutdown(Shutdown::Both);
        // a worker still holding the session drops the mapping when it is done
        if let Ok(mut session) = self.session.try_lock() {
            session.response.release();
        }
    }

    /// Read whatever the socket has, then try to stage a response.
    pub fn on_read(&self) -> Next {
        let mut session = match self.session.lock() {
            Ok(session) => session,
            Err(_) => return Next::Close,
        };

        loop {
            match session.read_buf.read_fd(&self.sock) {
                Ok(0) => {
                    debug!("Client[{}] closed the connection", self.peer);
                    return Next::Close;
                }
                Ok(_) => {
                    if !self.edge {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Reading from {} failed: {}", self.peer, e);
                    return Next::Close;
                }
            }
        }

        if session.process(&self.root) {
            Next::AwaitWrite
        } else {
            Next::AwaitRead
        }
    }

    /// Write the staged response. Once it is flushed, a keep-alive connection goes straight on to
    /// any request that was already read behind it.
    pub fn on_write(&self) -> Next {
        let mut guard = match self.session.lock() {
            Ok(session) => session,
            Err(_) => return Next::Close,
        };
        let session = &mut *guard;

        loop {
            match session.write_to(&self.sock) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Next::AwaitWrite,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Writing to {} failed: {}", self.peer, e);
                    return Next::Close;
                }
            }

            let remaining = session.remaining();
            if remaining == 0 {
                session.response.release();
                if !session.keep_alive {
                    return Next::Close;
                }
                if session.process(&self.root) {
                    continue;
                }
                return Next::AwaitRead;
            }
            if !self.edge && remaining <= WRITE_CHUNK {
                return Next::AwaitWrite;
            }
        }
    }
}
