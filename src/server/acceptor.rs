use error::Result;

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use mio::net::{TcpListener, TcpStream};
use mio::{Evented, Poll, PollOpt, Ready, Token};

/// Internal state of the socket acceptor.
pub struct Acceptor {
    sock: TcpListener,
}

impl Acceptor {
    /// Creates a new acceptor listening on every interface at `port`. Will bind to the port, so
    /// may fail.
    pub fn new(port: u16) -> Result<Self> {
        let sock = throw!(TcpListener::bind(&SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port,
        )));
        Ok(Acceptor { sock })
    }

    /// Take the next pending connection. Fails with `WouldBlock` once there are none left.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.sock.accept()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }
}

impl Evented for Acceptor {
    fn register(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.sock.register(poll, token, interest, opts)
    }

    fn reregister(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.sock.reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        self.sock.deregister(poll)
    }
}
