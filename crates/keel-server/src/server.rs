//! Accept loop and process-wide shared state.
//!
//! Handles graceful shutdown: on the shutdown signal the server stops
//! accepting, tells every session to finish, and waits for them to drain.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keel_core::{ArenaConfig, PagePool, PoolConfigError};
use keel_net::{listen_server, ConnectionError, Listener};
use keel_persistence::{ConfigStore, FileConfigStore, StoreError};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::hardware::{HardwareInfo, SystemHardware};
use crate::process::{LocalProcesses, ProcessControl};
use crate::session::Session;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("configuration store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Pool(#[from] PoolConfigError),
}

/// Backends and limits shared by every session.
#[derive(Clone)]
pub struct ServerContext {
    pub store: Arc<dyn ConfigStore>,
    pub processes: Arc<dyn ProcessControl>,
    pub hardware: Arc<dyn HardwareInfo>,
    /// Per-session parse arena.
    pub arena: ArenaConfig,
    /// How long a session may wait for its next command.
    pub idle_timeout: Option<Duration>,
    /// Cap on the bytes of one `update config` payload.
    pub max_payload: usize,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("arena", &self.arena)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_payload", &self.max_payload)
            .finish_non_exhaustive()
    }
}

/// Runs the accept loop on `listener` until `shutdown` resolves, then
/// waits for the open sessions to end.
///
/// At most `max_connections` sessions run at once; connections past the
/// limit, or past what the page pool can back, are dropped on accept.
pub async fn serve<F>(
    listener: Listener,
    ctx: Arc<ServerContext>,
    max_connections: usize,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let semaphore = Arc::new(Semaphore::new(max_connections));
    let (stop_tx, stop_rx) = watch::channel(false);

    info!(
        "listening on {} (max {max_connections} connections)",
        listener.local_addr()
    );

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, draining sessions...");
                break;
            }

            result = listener.accept() => {
                let conn = match result {
                    Ok(conn) => conn,
                    Err(e) if e.is_transient() => continue,
                    Err(ConnectionError::Accept(e)) => {
                        debug!("dropped incoming connection: {e}");
                        continue;
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                        return Err(e.into());
                    }
                };
                let peer = conn.peer_addr();

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(?peer, "connection limit reached, dropping connection");
                        drop(conn);
                        continue;
                    }
                };

                let session = match Session::new(conn, Arc::clone(&ctx)) {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(?peer, "failed to set up session: {e}");
                        continue;
                    }
                };

                let stop = stop_rx.clone();
                tokio::spawn(async move {
                    session.run(stop).await;
                    drop(permit);
                });
            }
        }
    }

    let _ = stop_tx.send(true);
    debug!("waiting for active sessions to close...");
    let _ = semaphore.acquire_many(max_connections as u32).await;
    info!("all sessions drained, shutting down");
    Ok(())
}

/// Opens the store, binds the listener and serves until ctrl-c.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    config.validate()?;
    let addr = config.socket_addr()?;

    let store_dir = config.store.config_dir.clone();
    let policy = config.recovery_policy();
    let (store, report) =
        tokio::task::spawn_blocking(move || FileConfigStore::open(store_dir, policy))
            .await
            .map_err(|e| ConfigError::Invalid(format!("store open task failed: {e}")))??;
    info!(
        dir = %store.dir().display(),
        index = store.index_version(),
        clusters = report.loaded,
        "configuration store open"
    );
    for path in &report.skipped_indexes {
        warn!(path = %path.display(), "skipped undecodable index file");
    }
    for (cluster_id, reason) in &report.unavailable {
        warn!(cluster_id, "cluster unavailable: {reason}");
    }

    let pool = PagePool::new(config.pool_config())?;
    if config.session_capacity() < config.max_connections {
        warn!(
            sessions = config.session_capacity(),
            max_connections = config.max_connections,
            "page pool backs fewer sessions than max_connections"
        );
    }

    if config.controller.program.is_none() {
        info!("no node program configured, lifecycle requests will be refused");
    }

    let ctx = Arc::new(ServerContext {
        store: Arc::new(store),
        processes: Arc::new(LocalProcesses::new(
            config.controller.program.clone(),
            config.controller.args.clone(),
        )),
        hardware: Arc::new(SystemHardware),
        arena: config.arena_config(),
        idle_timeout: config.idle_timeout(),
        max_payload: keel_persistence::format::MAX_FIELD_LEN,
    });

    let listener = listen_server(addr, config.backlog, pool)?;
    serve(listener, ctx, config.max_connections, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use keel_core::PoolConfig;
    use keel_net::{ControlClient, RetryPolicy};
    use keel_persistence::MemoryConfigStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn context() -> Arc<ServerContext> {
        let store = MemoryConfigStore::new();
        store
            .insert(1, "main", Bytes::from_static(b"a=1\n"))
            .unwrap();
        Arc::new(ServerContext {
            store: Arc::new(store),
            processes: Arc::new(LocalProcesses::disabled()),
            hardware: Arc::new(SystemHardware),
            arena: ArenaConfig::default(),
            idle_timeout: None,
            max_payload: 4096,
        })
    }

    fn listener(page_count: usize) -> Listener {
        let pool = PagePool::new(PoolConfig {
            page_size: 2048,
            page_count,
            high_priority_size: 512,
        })
        .unwrap();
        listen_server("127.0.0.1:0".parse().unwrap(), 16, pool).unwrap()
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let listener = listener(8);
        let addr = listener.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, context(), 4, async {
            let _ = rx.await;
        }));

        let pool = PagePool::new(PoolConfig::default()).unwrap();
        let mut client = ControlClient::connect(addr, &RetryPolicy::default(), &pool)
            .await
            .unwrap();
        let clusters = client.clusters().await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "main");

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lifecycle_without_program_is_an_error_reply() {
        let listener = listener(8);
        let addr = listener.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, context(), 4, async {
            let _ = rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"start node g c n\n").await.unwrap();
        let mut buf = [0u8; 128];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"error "));

        drop(stream);
        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn vanished_peers_do_not_stop_the_server() {
        // room for every session at once, so none is shed for capacity
        let listener = listener(64);
        let addr = listener.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, context(), 32, async {
            let _ = rx.await;
        }));

        for _ in 0..16 {
            let stream = TcpStream::connect(addr).await.unwrap();
            drop(stream);
        }

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"cpu info request\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"cpu info "));
        assert!(!server.is_finished());

        drop(stream);
        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connections_past_the_limit_are_dropped() {
        let listener = listener(8);
        let addr = listener.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, context(), 1, async {
            let _ = rx.await;
        }));

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"cpu info request\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = first.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"cpu info "));

        let mut second = TcpStream::connect(addr).await.unwrap();
        let _ = second.write_all(b"cpu info request\n").await;
        let n = second.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        drop(first);
        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
