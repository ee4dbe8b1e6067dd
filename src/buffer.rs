//! A growable byte buffer with independent read and write cursors.
//!
//! The storage is split into three regions:
//!
//! ```text
//! | prependable | readable | writable |
//! 0          read_pos  write_pos  capacity
//! ```
//!
//! Space freed at the front by retrieving data is reused by sliding the unread bytes back to the
//! start before the storage is ever reallocated.

use iovec::IoVec;

use mio::net::TcpStream;

use std::io::{self, Write};

/// Default size of a fresh buffer.
const INITIAL_SIZE: usize = 1024;

/// Size of the stack overflow area used by `read_fd`.
const SCRATCH_SIZE: usize = 65535;

#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    /// Create an empty buffer of the default size.
    pub fn new() -> Self {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Create an empty buffer with `size` bytes of writable space.
    pub fn with_capacity(size: usize) -> Self {
        Buffer {
            storage: vec![0; size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes that can be written without growing or compacting.
    pub fn writable(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    /// Bytes written but not yet retrieved.
    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes already retrieved from the front, reusable on compaction.
    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    /// The unread bytes, starting at the read cursor.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Offset of the first `\r\n` within `peek()`, if there is one.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|window| window == b"\r\n")
    }

    /// Make sure at least `len` bytes can be appended.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() < len {
            self.make_space(len);
        }
        assert!(self.writable() >= len);
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let end = self.write_pos + data.len();
        self.storage[self.write_pos..end].copy_from_slice(data);
        self.write_pos = end;
    }

    pub fn append_str(&mut self, data: &str) {
        self.append(data.as_bytes());
    }

    /// Advance the read cursor by `len` bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable(),
            "retrieving {} bytes with only {} readable",
            len,
            self.readable()
        );
        self.read_pos += len;
    }

    /// Advance the read cursor up to `end`, an offset into `peek()`.
    pub fn retrieve_until(&mut self, end: usize) {
        assert!(end <= self.readable(), "retrieve_until past the write cursor");
        self.retrieve(end);
    }

    /// Discard everything, zeroing the storage and resetting both cursors.
    pub fn retrieve_all(&mut self) {
        for byte in self.storage.iter_mut() {
            *byte = 0;
        }
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Drain the unread bytes into a string, then reset the buffer.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let output = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        output
    }

    /// Read whatever the socket has buffered in a single scatter read.
    ///
    /// The first vector is the writable tail of the buffer and the second a stack scratch area,
    /// so a single call can take in more than the tail has room for. Anything that landed in the
    /// scratch area is appended afterwards, growing the buffer. Returns the number of bytes read,
    /// where `0` means the peer closed its end.
    pub fn read_fd(&mut self, source: &TcpStream) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable();

        let len = {
            let tail = &mut self.storage[self.write_pos..];
            // an iovec may not be empty
            if tail.is_empty() {
                let mut vectors: [&mut IoVec; 1] = [(&mut scratch[..]).into()];
                source.read_bufs(&mut vectors)?
            } else {
                let mut vectors: [&mut IoVec; 2] = [tail.into(), (&mut scratch[..]).into()];
                source.read_bufs(&mut vectors)?
            }
        };

        if len <= writable {
            self.write_pos += len;
        } else {
            self.write_pos = self.storage.len();
            self.append(&scratch[..len - writable]);
        }
        Ok(len)
    }

    /// Write the unread bytes to `sink` with a single `write` call, retrieving however many were
    /// accepted. Partial writes are left for the caller to deal with.
    pub fn write_fd<W: Write>(&mut self, mut sink: W) -> io::Result<usize> {
        let len = sink.write(self.peek())?;
        self.retrieve(len);
        Ok(len)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable() + self.prependable() < len {
            let size = self.write_pos + len + 1;
            self.storage.resize(size, 0);
        } else {
            let readable = self.readable();
            self.storage.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
            debug_assert_eq!(readable, self.readable());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{ErrorKind, Read, Write};
    use std::net::{self, TcpListener};
    use std::thread;
    use std::time::Duration;

    /// A plain client and the non-blocking server end of a loopback connection.
    fn loopback() -> (net::TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, TcpStream::from_stream(server).unwrap())
    }

    /// `read_fd` until it stops blocking.
    fn read_ready(buffer: &mut Buffer, sock: &TcpStream) -> usize {
        for _ in 0..500 {
            match buffer.read_fd(sock) {
                Ok(len) => return len,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }
        panic!("socket never became readable");
    }

    fn check_invariant(buffer: &Buffer) {
        assert!(buffer.read_pos <= buffer.write_pos);
        assert!(buffer.write_pos <= buffer.capacity());
        assert_eq!(
            buffer.readable() + buffer.prependable() + buffer.writable(),
            buffer.capacity()
        );
    }

    #[test]
    fn cursors_stay_in_bounds() {
        let mut buffer = Buffer::with_capacity(8);
        // small linear congruential generator so the sequence is reproducible
        let mut seed: u32 = 7;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let amount = (seed >> 16) as usize % 40;
            if seed & 1 == 0 {
                let data = vec![b'x'; amount];
                buffer.append(&data);
            } else {
                let amount = amount.min(buffer.readable());
                buffer.retrieve(amount);
            }
            check_invariant(&buffer);
        }
    }

    #[test]
    fn append_then_retrieve_returns_the_same_bytes() {
        let mut buffer = Buffer::with_capacity(4);
        buffer.append(b"hello, ");
        buffer.append_str("world");
        assert_eq!(buffer.peek(), b"hello, world");

        buffer.retrieve(7);
        assert_eq!(buffer.peek(), b"world");
        assert_eq!(buffer.retrieve_all_to_string(), "world");
        assert_eq!(buffer.readable(), 0);
        check_invariant(&buffer);
    }

    #[test]
    fn compacts_before_growing() {
        let mut buffer = Buffer::with_capacity(16);
        buffer.append(b"0123456789abcdef");
        buffer.retrieve(10);
        buffer.append(b"ghijklmn");

        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.prependable(), 0);
        assert_eq!(buffer.peek(), b"abcdefghijklmn");
    }

    #[test]
    fn grows_to_fit_large_appends() {
        let mut buffer = Buffer::with_capacity(4);
        buffer.append(b"ab");
        buffer.append(b"cdefgh");
        assert_eq!(buffer.capacity(), 2 + 6 + 1);
        assert_eq!(buffer.peek(), b"abcdefgh");
    }

    #[test]
    fn finds_line_terminators() {
        let mut buffer = Buffer::new();
        buffer.append(b"GET / HTTP/1.1\r\nHost: a\r\n");
        assert_eq!(buffer.find_crlf(), Some(14));
        buffer.retrieve_until(16);
        assert_eq!(buffer.find_crlf(), Some(7));
        buffer.retrieve_until(9);
        assert_eq!(buffer.find_crlf(), None);
    }

    #[test]
    #[should_panic]
    fn retrieving_past_the_write_cursor_panics() {
        let mut buffer = Buffer::new();
        buffer.append(b"abc");
        buffer.retrieve(4);
    }

    #[test]
    fn read_fd_spills_into_scratch_space() {
        let (mut client, sock) = loopback();
        let payload = vec![b'z'; 3000];
        client.write_all(&payload).unwrap();

        let mut buffer = Buffer::with_capacity(16);
        while buffer.readable() < payload.len() {
            assert!(read_ready(&mut buffer, &sock) > 0);
        }
        assert_eq!(buffer.peek(), &payload[..]);
        assert!(buffer.capacity() >= payload.len());
        check_invariant(&buffer);
    }

    #[test]
    fn read_fd_into_a_full_buffer() {
        let (mut client, sock) = loopback();
        client.write_all(b"efgh").unwrap();

        let mut buffer = Buffer::with_capacity(4);
        buffer.append(b"abcd");
        assert_eq!(buffer.writable(), 0);

        while buffer.readable() < 8 {
            assert!(read_ready(&mut buffer, &sock) > 0);
        }
        assert_eq!(buffer.peek(), b"abcdefgh");
        check_invariant(&buffer);
    }

    #[test]
    fn read_fd_reports_closed_peer() {
        let (client, sock) = loopback();
        drop(client);

        let mut buffer = Buffer::new();
        assert_eq!(read_ready(&mut buffer, &sock), 0);
    }

    #[test]
    fn write_fd_advances_read_cursor() {
        let (mut client, sock) = loopback();
        let mut buffer = Buffer::new();
        buffer.append(b"ping");

        assert_eq!(buffer.write_fd(&sock).unwrap(), 4);
        assert_eq!(buffer.readable(), 0);

        let mut received = [0u8; 4];
        client.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"ping");
    }
}
