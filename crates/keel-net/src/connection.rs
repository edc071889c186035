//! Page-backed buffered line I/O over a byte stream.
//!
//! A [`Connection`] owns two pages from the shared [`PagePool`]: one for
//! receiving and one for sending. Incoming bytes land in the low region
//! of the receive page and lines are framed in place, so the codec never
//! holds more than one partial line beyond what the socket delivered.
//! Outgoing lines are queued in the send page, short control lines in the
//! high region and bulk lines (records, payloads) in the low region, and
//! written out on [`Connection::flush`] or when a region fills up.
//!
//! Both pages go back to the pool when the connection drops, on every
//! exit path.

use std::net::SocketAddr;

use bytes::BytesMut;
use keel_core::{PagePool, PooledPage, Priority};
use keel_protocol::{check_literal, find_line, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::ConnectionError;

/// Region of the receive page that incoming bytes are framed in.
const RECV_REGION: Priority = Priority::Low;

/// Maximum bytes of an unexpected line quoted in an error.
const MAX_ECHO: usize = 64;

/// Buffered line connection over any async byte stream.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: S,
    recv: PooledPage,
    send: PooledPage,
    /// Serialization buffer reused across [`Connection::send_with`] calls.
    scratch: BytesMut,
    /// Bytes of the last returned line still sitting in the receive page.
    pending: usize,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps `stream`, taking a receive and a send page from `pool`.
    ///
    /// Returns [`ConnectionError::Backpressure`] when the pool can't spare
    /// both pages; anything already taken goes straight back.
    pub fn new(stream: S, pool: &PagePool) -> Result<Self, ConnectionError> {
        let recv = pool.acquire()?;
        let send = pool.acquire()?;
        Ok(Self::from_pages(stream, recv, send))
    }

    pub(crate) fn from_pages(stream: S, recv: PooledPage, send: PooledPage) -> Self {
        Self {
            stream,
            recv,
            send,
            scratch: BytesMut::with_capacity(256),
            pending: 0,
            peer: None,
            closed: false,
        }
    }

    /// Records the remote address, for logs.
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Largest line [`Connection::read_line`] can frame.
    pub fn max_line_len(&self) -> usize {
        self.recv.capacity(RECV_REGION)
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    /// Reads the next line, without its terminator.
    ///
    /// The returned slice points into the receive page and stays valid
    /// until the next call on this connection. A line longer than the
    /// receive region is a protocol violation and closes the connection.
    pub async fn read_line(&mut self) -> Result<&[u8], ConnectionError> {
        self.ensure_open()?;
        if self.pending > 0 {
            self.recv.consume(RECV_REGION, self.pending);
            self.pending = 0;
        }

        loop {
            if let Some((len, consumed)) = find_line(self.recv.filled(RECV_REGION)) {
                self.pending = consumed;
                let line = &self.recv.filled(RECV_REGION)[..len];
                trace!(peer = ?self.peer, len, "line received");
                return Ok(line);
            }

            if self.recv.remaining(RECV_REGION) == 0 {
                self.closed = true;
                return Err(ProtocolError::LineTooLong(self.recv.capacity(RECV_REGION)).into());
            }

            let n = match self.stream.read(self.recv.spare_mut(RECV_REGION)).await {
                Ok(n) => n,
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            };
            if n == 0 {
                self.closed = true;
                return Err(ConnectionError::Disconnected);
            }
            self.recv.advance(RECV_REGION, n);
        }
    }

    /// Reads one line and requires it to equal `literal` exactly.
    pub async fn receive_expected_literal(&mut self, literal: &str) -> Result<(), ConnectionError> {
        let line = self.read_line().await?;
        if check_literal(line, literal) {
            return Ok(());
        }
        let got = String::from_utf8_lossy(&line[..line.len().min(MAX_ECHO)]).into_owned();
        Err(ProtocolError::UnexpectedLiteral {
            expected: literal.to_owned(),
            got,
        }
        .into())
    }

    /// Queues raw bytes in one region of the send page, writing out
    /// whatever is queued whenever the region fills.
    ///
    /// Only one region holds data at a time: switching regions writes the
    /// other one out first, so lines leave in the order they were queued.
    pub async fn write(&mut self, priority: Priority, mut bytes: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let other = match priority {
            Priority::High => Priority::Low,
            Priority::Low => Priority::High,
        };
        if self.send.fill(other) > 0 {
            self.write_pending().await?;
        }

        while !bytes.is_empty() {
            let room = self.send.remaining(priority);
            if room == 0 {
                self.write_pending().await?;
                continue;
            }
            let n = room.min(bytes.len());
            self.send.spare_mut(priority)[..n].copy_from_slice(&bytes[..n]);
            self.send.advance(priority, n);
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Queues `line` followed by the line terminator.
    pub async fn write_line(&mut self, priority: Priority, line: &[u8]) -> Result<(), ConnectionError> {
        self.write(priority, line).await?;
        self.write(priority, b"\n").await
    }

    /// Queues a bare control literal such as `list stop`.
    pub async fn send_literal(&mut self, literal: &str) -> Result<(), ConnectionError> {
        self.write_line(Priority::High, literal.as_bytes()).await
    }

    /// Serializes through `f` into a scratch buffer and queues the result.
    /// `f` writes complete, terminated lines.
    pub async fn send_with<F>(&mut self, priority: Priority, f: F) -> Result<(), ConnectionError>
    where
        F: FnOnce(&mut BytesMut),
    {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        f(&mut scratch);
        let result = self.write(priority, &scratch).await;
        self.scratch = scratch;
        result
    }

    /// Writes out everything queued and flushes the stream.
    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.write_pending().await?;
        if let Err(e) = self.stream.flush().await {
            self.closed = true;
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_pending(&mut self) -> Result<(), ConnectionError> {
        for priority in [Priority::High, Priority::Low] {
            if self.send.fill(priority) == 0 {
                continue;
            }
            if let Err(e) = self.stream.write_all(self.send.filled(priority)).await {
                self.closed = true;
                return Err(e.into());
            }
            self.send.clear(priority);
        }
        Ok(())
    }

    /// Marks the connection closed without touching the socket. Every
    /// later read or write returns [`ConnectionError::Closed`].
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Shuts down the write side and marks the connection closed. Queued
    /// but unflushed bytes are discarded.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::PoolConfig;
    use tokio::io::duplex;

    fn small_pool(page_count: usize) -> PagePool {
        PagePool::new(PoolConfig {
            page_size: 256,
            page_count,
            high_priority_size: 64,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn frames_lines_across_partial_reads() {
        let pool = small_pool(2);
        let (local, mut remote) = duplex(4096);
        let mut conn = Connection::new(local, &pool).unwrap();

        remote.write_all(b"list\r\nlist ne").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), b"list");

        let reader = tokio::spawn(async move {
            let line = conn.read_line().await.unwrap().to_vec();
            (conn, line)
        });
        remote.write_all(b"xt\n").await.unwrap();
        let (mut conn, line) = reader.await.unwrap();
        assert_eq!(line, b"list next");

        drop(remote);
        assert!(matches!(
            conn.read_line().await,
            Err(ConnectionError::Disconnected)
        ));
        assert!(matches!(conn.read_line().await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn overlong_line_is_a_violation() {
        let pool = small_pool(2);
        let (local, mut remote) = duplex(4096);
        let mut conn = Connection::new(local, &pool).unwrap();
        let limit = conn.max_line_len();

        remote.write_all(&vec![b'a'; limit + 10]).await.unwrap();
        assert!(matches!(
            conn.read_line().await,
            Err(ConnectionError::Protocol(ProtocolError::LineTooLong(n))) if n == limit
        ));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn writes_larger_than_a_region_arrive_in_order() {
        let pool = small_pool(2);
        let (local, mut remote) = duplex(8192);
        let mut conn = Connection::new(local, &pool).unwrap();

        let bulk: Vec<u8> = (0..1000u32).map(|i| b'a' + (i % 26) as u8).collect();
        conn.send_literal("ok 3").await.unwrap();
        conn.write_line(Priority::Low, &bulk).await.unwrap();
        conn.send_literal("list stop").await.unwrap();
        conn.flush().await.unwrap();
        drop(conn);

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();

        let mut expected = b"ok 3\n".to_vec();
        expected.extend_from_slice(&bulk);
        expected.extend_from_slice(b"\nlist stop\n");
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn expected_literal_mismatch() {
        let pool = small_pool(2);
        let (local, mut remote) = duplex(4096);
        let mut conn = Connection::new(local, &pool).unwrap();

        remote.write_all(b"list stop\nlist nxt\n").await.unwrap();
        conn.receive_expected_literal("list stop").await.unwrap();
        assert!(matches!(
            conn.receive_expected_literal("list next").await,
            Err(ConnectionError::Protocol(ProtocolError::UnexpectedLiteral { .. }))
        ));
    }

    #[tokio::test]
    async fn closed_connection_refuses_io() {
        let pool = small_pool(2);
        let (local, _remote) = duplex(4096);
        let mut conn = Connection::new(local, &pool).unwrap();

        conn.close().await;
        assert!(matches!(conn.read_line().await, Err(ConnectionError::Closed)));
        assert!(matches!(
            conn.send_literal("ok").await,
            Err(ConnectionError::Closed)
        ));
    }

    #[test]
    fn pool_exhaustion_is_backpressure() {
        let pool = small_pool(1);
        let (local, _remote) = duplex(64);
        let result = Connection::new(local, &pool);
        assert!(matches!(result, Err(ConnectionError::Backpressure(_))));
        // the first page went back when construction failed
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn pages_return_on_drop() {
        let pool = small_pool(4);
        let (local, _remote) = duplex(64);
        let conn = Connection::new(local, &pool).unwrap();
        assert_eq!(pool.in_use(), 2);
        drop(conn);
        assert_eq!(pool.in_use(), 0);
    }
}
