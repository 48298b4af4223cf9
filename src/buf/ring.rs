use std::io;
use std::ops::Range;

use tokio::net::TcpStream;

use crate::error::{ProxyError, ProxyResult};

/// Reference size of one direction's backing region.
pub const RING_CAPACITY: usize = 4096;

/// Outcome of a non-blocking receive into the ring.
#[derive(Debug)]
pub enum RecvStatus {
    /// Bytes were appended; the range names exactly the bytes just received,
    /// in backing-region coordinates.
    Ok(Range<usize>),
    /// The window already reaches the end of the backing region.
    BufferFull,
    /// The peer shut down its sending half (recv returned 0). Never retried.
    Shutdown,
    /// Nothing to read right now.
    WouldBlock,
    /// Any other socket error.
    Error(io::Error),
}

/// Outcome of a non-blocking send from the ring.
#[derive(Debug)]
pub enum SendStatus {
    /// `n` bytes left the front of the window.
    Ok(usize),
    /// The socket's send buffer is full.
    WouldBlock,
    /// Any other socket error.
    Error(io::Error),
}

/// A fixed backing region with a monotone-forward live window `[b, e)`.
///
/// `recv` appends at `e`, `send` drains from `b`, `reset` empties the window
/// back to the start of the region. The window never wraps: a session drains
/// a ring completely before reusing it, so the "ring" is a swap-recycled
/// buffer rather than a circular one. Swapping two rings transfers a full
/// window from producer to consumer without copying.
pub struct IoRing {
    buf: Box<[u8]>,
    b: usize,
    e: usize,
}

impl IoRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            b: 0,
            e: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.b == self.e
    }

    pub fn len(&self) -> usize {
        self.e - self.b
    }

    /// Free space remaining behind the window.
    pub fn spare(&self) -> usize {
        self.buf.len() - self.e
    }

    /// The live window in backing coordinates.
    pub fn window(&self) -> Range<usize> {
        self.b..self.e
    }

    /// Borrow a sub-range of the backing region.
    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// Return the window to `[0, 0)`.
    pub fn reset(&mut self) {
        self.b = 0;
        self.e = 0;
    }

    /// Advance the window front to the absolute offset `to`.
    pub fn consume_to(&mut self, to: usize) {
        debug_assert!(self.b <= to && to <= self.e);
        self.b = to;
    }

    /// Append bytes behind the window, growing it forward.
    pub fn append(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        if bytes.len() > self.spare() {
            return Err(ProxyError::BufferFull);
        }
        self.buf[self.e..self.e + bytes.len()].copy_from_slice(bytes);
        self.e += bytes.len();
        Ok(())
    }

    /// Receive once from `stream` into the space behind the window.
    pub fn recv(&mut self, stream: &TcpStream) -> RecvStatus {
        if self.e == self.buf.len() {
            return RecvStatus::BufferFull;
        }
        match stream.try_read(&mut self.buf[self.e..]) {
            Ok(0) => RecvStatus::Shutdown,
            Ok(n) => {
                let range = self.e..self.e + n;
                self.e += n;
                RecvStatus::Ok(range)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => RecvStatus::WouldBlock,
            Err(err) => RecvStatus::Error(err),
        }
    }

    /// Send once from the front of the window, shrinking it by the bytes
    /// actually written.
    pub fn send(&mut self, stream: &TcpStream) -> SendStatus {
        match stream.try_write(&self.buf[self.b..self.e]) {
            Ok(n) => {
                self.b += n;
                SendStatus::Ok(n)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => SendStatus::WouldBlock,
            Err(err) => SendStatus::Error(err),
        }
    }

    /// Exchange windows (and backing regions) with `other`. The session owns
    /// both rings, so swapping the structs hands the full buffer from the
    /// producer to the consumer without copying a byte.
    pub fn swap(&mut self, other: &mut IoRing) {
        std::mem::swap(self, other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_window_arithmetic() {
        let mut ring = IoRing::new(16);
        assert!(ring.is_empty());
        assert_eq!(ring.spare(), 16);

        ring.append(b"hello").unwrap();
        assert_eq!(ring.window(), 0..5);
        assert_eq!(ring.slice(ring.window()), b"hello");

        ring.consume_to(3);
        assert_eq!(ring.window(), 3..5);
        assert_eq!(ring.slice(ring.window()), b"lo");

        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.window(), 0..0);
    }

    #[test]
    fn test_append_respects_capacity() {
        let mut ring = IoRing::new(4);
        ring.append(b"abc").unwrap();
        assert!(matches!(ring.append(b"de"), Err(ProxyError::BufferFull)));
        ring.append(b"d").unwrap();
        assert_eq!(ring.spare(), 0);
    }

    #[test]
    fn test_swap_transfers_ownership() {
        let mut full = IoRing::new(8);
        let mut empty = IoRing::new(8);
        full.append(b"payload").unwrap();
        full.consume_to(3);

        full.swap(&mut empty);
        assert!(full.is_empty());
        assert_eq!(empty.window(), 3..7);
        assert_eq!(empty.slice(empty.window()), b"load");
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_recv_classifies_status() {
        let (mut client, server) = connected_pair().await;
        let mut ring = IoRing::new(8);

        assert!(matches!(ring.recv(&server), RecvStatus::WouldBlock));

        client.write_all(b"abcd").await.unwrap();
        server.readable().await.unwrap();
        match ring.recv(&server) {
            RecvStatus::Ok(range) => {
                assert_eq!(range, 0..4);
                assert_eq!(ring.slice(range), b"abcd");
            }
            other => panic!("unexpected status: {other:?}"),
        }

        client.write_all(b"efghijkl").await.unwrap();
        server.readable().await.unwrap();
        match ring.recv(&server) {
            RecvStatus::Ok(range) => assert_eq!(range, 4..8),
            other => panic!("unexpected status: {other:?}"),
        }
        assert!(matches!(ring.recv(&server), RecvStatus::BufferFull));

        ring.reset();
        server.readable().await.unwrap();
        match ring.recv(&server) {
            RecvStatus::Ok(range) => assert_eq!(ring.slice(range), b"ijkl"),
            other => panic!("unexpected status: {other:?}"),
        }

        drop(client);
        server.readable().await.unwrap();
        assert!(matches!(ring.recv(&server), RecvStatus::Shutdown));
    }

    #[tokio::test]
    async fn test_send_drains_window() {
        let (client, server) = connected_pair().await;
        let mut ring = IoRing::new(16);
        ring.append(b"response!").unwrap();

        client.writable().await.unwrap();
        match ring.send(&client) {
            SendStatus::Ok(n) => assert_eq!(n, 9),
            other => panic!("unexpected status: {other:?}"),
        }
        assert!(ring.is_empty());

        let mut got = [0u8; 9];
        server.readable().await.unwrap();
        let n = server.try_read(&mut got).unwrap();
        assert_eq!(&got[..n], b"response!");
    }
}
