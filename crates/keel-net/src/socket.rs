//! Client connect with bounded retry, and server listen/accept.
//!
//! Only the connect step is retried, and only on errors that say "not
//! yet" (interrupted, refused). Socket creation and local bind failures
//! are fatal. A tokio socket is consumed by a failed connect, so each
//! attempt creates (and, when asked, binds) a fresh one.
//!
//! The server side stops at a one-shot [`Listener::accept`]; looping over
//! it belongs to whoever runs sessions.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use keel_core::PagePool;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{is_peer_io, is_transient_io, ConnectionError};

/// Default number of connect attempts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// How hard [`connect_client`] tries before giving up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connect attempts, including the first. Zero counts as one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt. Doubles each time.
    pub initial_backoff: Duration,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONNECT_ATTEMPTS,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `failed + 1`, after `failed` failures.
    fn backoff(&self, failed: u32) -> Duration {
        let shift = failed.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

fn new_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

fn setup(step: &'static str, addr: SocketAddr) -> impl FnOnce(io::Error) -> ConnectionError {
    move |source| ConnectionError::Setup { step, addr, source }
}

/// Connects to `server`, optionally from a fixed `local` address.
///
/// Buffer pages are taken before any network work, so an exhausted pool
/// fails fast with [`ConnectionError::Backpressure`].
pub async fn connect_client(
    server: SocketAddr,
    local: Option<SocketAddr>,
    retry: &RetryPolicy,
    pool: &PagePool,
) -> Result<Connection<TcpStream>, ConnectionError> {
    let recv = pool.acquire()?;
    let send = pool.acquire()?;
    let max_attempts = retry.max_attempts.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;

        let socket = new_socket(server).map_err(setup("create", server))?;
        if let Some(local) = local {
            socket.set_reuseaddr(true).map_err(setup("configure", local))?;
            socket.bind(local).map_err(setup("bind", local))?;
        }

        match socket.connect(server).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(%server, attempt, "connected");
                return Ok(Connection::from_pages(stream, recv, send).with_peer(server));
            }
            Err(e) if is_transient_io(&e) && attempt < max_attempts => {
                let delay = retry.backoff(attempt);
                debug!(%server, attempt, ?delay, "connect failed ({e}), retrying");
                tokio::time::sleep(delay).await;
            }
            Err(source) => {
                return Err(ConnectionError::Connect {
                    addr: server,
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

/// Creates, binds and listens on `bind`. Each step's failure drops the
/// socket and reports which step failed.
///
/// Must be called from within a tokio runtime.
pub fn listen_server(
    bind: SocketAddr,
    backlog: u32,
    pool: PagePool,
) -> Result<Listener, ConnectionError> {
    let socket = new_socket(bind).map_err(setup("create", bind))?;
    socket.set_reuseaddr(true).map_err(setup("configure", bind))?;
    socket.bind(bind).map_err(setup("bind", bind))?;
    let inner = socket.listen(backlog).map_err(setup("listen", bind))?;
    let local = inner.local_addr().map_err(setup("listen", bind))?;

    debug!(%local, backlog, "listening");
    Ok(Listener { inner, pool, local })
}

/// A bound, listening server socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    pool: PagePool,
    local: SocketAddr,
}

impl Listener {
    /// The address actually bound, with the real port when bound to 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    /// Accepts one connection and gives it buffer pages.
    ///
    /// When the pool is empty the new socket is dropped and
    /// [`ConnectionError::Backpressure`] returned; the listener stays
    /// usable.
    pub async fn accept(&self) -> Result<Connection<TcpStream>, ConnectionError> {
        let (stream, peer) = self.inner.accept().await.map_err(accept_error)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "dropping connection: {e}");
            return Err(ConnectionError::Accept(e));
        }
        match Connection::new(stream, &self.pool) {
            Ok(conn) => Ok(conn.with_peer(peer)),
            Err(e) => {
                warn!(%peer, "dropping connection: {e}");
                Err(e)
            }
        }
    }
}

/// Failures of a single pending connection leave the listener usable;
/// anything else is reported as is.
fn accept_error(e: io::Error) -> ConnectionError {
    if is_peer_io(&e) {
        ConnectionError::Accept(e)
    } else {
        ConnectionError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::PoolConfig;
    use keel_core::Priority;

    fn pool() -> PagePool {
        PagePool::new(PoolConfig {
            page_size: 1024,
            page_count: 8,
            high_priority_size: 256,
        })
        .unwrap()
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// A loopback address that nothing is listening on.
    fn unused_addr() -> SocketAddr {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn listen_accept_exchange() {
        let listener = listen_server(loopback(), DEFAULT_BACKLOG, pool()).unwrap();
        let addr = listener.local_addr();
        let client_pool = pool();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let line = conn.read_line().await.unwrap().to_vec();
            conn.send_literal("ok").await.unwrap();
            conn.flush().await.unwrap();
            line
        });

        let mut client = connect_client(addr, None, &RetryPolicy::once(), &client_pool)
            .await
            .unwrap();
        assert_eq!(client.peer_addr(), Some(addr));
        client
            .write_line(Priority::High, b"identify client")
            .await
            .unwrap();
        client.flush().await.unwrap();
        client.receive_expected_literal("ok").await.unwrap();

        assert_eq!(server.await.unwrap(), b"identify client");
    }

    #[tokio::test]
    async fn refused_connect_uses_every_attempt() {
        let addr = unused_addr();
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let pool = pool();
        let err = connect_client(addr, None, &policy, &pool).await.unwrap_err();
        match err {
            ConnectionError::Connect { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected connect error, got {other:?}"),
        }
        // pages taken for the attempt went back
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn retry_reaches_late_listener() {
        let addr = unused_addr();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = listen_server(addr, DEFAULT_BACKLOG, pool()).unwrap();
            let _conn = listener.accept().await.unwrap();
        });

        let policy = RetryPolicy {
            max_attempts: 50,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(40),
        };
        let conn = connect_client(addr, None, &policy, &pool()).await;
        assert!(conn.is_ok());
        late.await.unwrap();
    }

    #[test]
    fn aborted_accept_is_per_connection() {
        let aborted = accept_error(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(matches!(aborted, ConnectionError::Accept(_)));
        let reset = accept_error(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(reset, ConnectionError::Accept(_)));

        let denied = accept_error(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(denied, ConnectionError::Io(_)));
    }

    #[tokio::test]
    async fn second_listener_fails_at_bind() {
        let first = listen_server(loopback(), DEFAULT_BACKLOG, pool()).unwrap();
        let err = listen_server(first.local_addr(), DEFAULT_BACKLOG, pool()).unwrap_err();
        assert!(matches!(err, ConnectionError::Setup { step: "bind", .. }));
    }

    #[tokio::test]
    async fn exhausted_pool_fails_before_connecting() {
        let tiny = PagePool::new(PoolConfig {
            page_size: 1024,
            page_count: 1,
            high_priority_size: 256,
        })
        .unwrap();
        let err = connect_client(unused_addr(), None, &RetryPolicy::once(), &tiny)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, ConnectionError::Backpressure(_)));
    }
}
