//! Test helpers for running a keel server in-process and talking to it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use keel_core::{ArenaConfig, PagePool, PoolConfig};
use keel_net::{listen_server, ControlClient, RetryPolicy};
use keel_persistence::{FileConfigStore, RecoveryPolicy};
use keel_server::{LocalProcesses, ServerContext, SystemHardware};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A keel server running on an ephemeral loopback port inside the test's
/// runtime.
pub struct TestServer {
    pub addr: SocketAddr,
    pub config_dir: PathBuf,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    _dir: Option<tempfile::TempDir>,
}

/// Options for starting a test server.
#[derive(Default)]
pub struct ServerOptions {
    /// Use an existing store directory without taking ownership.
    pub config_dir: Option<PathBuf>,
    /// Launch nodes as `sh -c 'sleep 30'`. Without it lifecycle requests
    /// are refused.
    pub sleeper_nodes: bool,
    pub max_connections: Option<usize>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerOptions::default()).await
    }

    pub async fn start_with(opts: ServerOptions) -> Self {
        let (dir, config_dir) = match opts.config_dir {
            Some(path) => (None, path),
            None => {
                let dir = tempfile::tempdir().unwrap();
                let path = dir.path().join("store");
                (Some(dir), path)
            }
        };

        let (store, _) = FileConfigStore::open(&config_dir, RecoveryPolicy::Strict)
            .unwrap_or_else(|e| panic!("failed to open store at {}: {e}", config_dir.display()));

        let processes = if opts.sleeper_nodes {
            LocalProcesses::new(
                Some("sh".into()),
                vec!["-c".into(), "sleep 30".into(), "keel-node".into()],
            )
        } else {
            LocalProcesses::disabled()
        };

        let ctx = Arc::new(ServerContext {
            store: Arc::new(store),
            processes: Arc::new(processes),
            hardware: Arc::new(SystemHardware),
            arena: ArenaConfig::default(),
            idle_timeout: None,
            max_payload: 64 * 1024,
        });

        let pool = PagePool::new(PoolConfig {
            page_count: 32,
            ..PoolConfig::default()
        })
        .unwrap();
        let listener = listen_server("127.0.0.1:0".parse().unwrap(), 64, pool).unwrap();
        let addr = listener.local_addr();

        let (stop, stopped) = oneshot::channel::<()>();
        let max_connections = opts.max_connections.unwrap_or(8);
        let task = tokio::spawn(async move {
            keel_server::serve(listener, ctx, max_connections, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            config_dir,
            stop: Some(stop),
            task: Some(task),
            _dir: dir,
        }
    }

    /// Shuts the server down and waits until every session has drained
    /// and the store directory is unlocked.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap();
        }
    }

    /// Connects a control client.
    pub async fn client(&self) -> ControlClient {
        let pool = PagePool::new(PoolConfig {
            page_count: 2,
            ..PoolConfig::default()
        })
        .unwrap();
        ControlClient::connect(self.addr, &RetryPolicy::default(), &pool)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to {}: {e}", self.addr))
    }

    /// Connects a raw line client.
    pub async fn raw(&self) -> LineClient {
        LineClient::connect(self.addr).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Writes protocol lines by hand and reads replies one line at a time.
pub struct LineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to {addr}: {e}"));
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Next reply line without its terminator, or `None` once the server
    /// has closed the connection.
    pub async fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches('\n').to_string()),
        }
    }

    pub async fn expect(&mut self, want: &str) {
        assert_eq!(self.recv().await.as_deref(), Some(want));
    }
}
