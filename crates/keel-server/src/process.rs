//! Node process control behind the `start`, `stop`, `kill` and `list`
//! directives.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use keel_protocol::{NodeDetails, NodeKey, NodeRecord, OwnedNodeKey};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no node program configured")]
    NotConfigured,

    #[error("node {0} is not running")]
    NotRunning(OwnedNodeKey),

    #[error("failed to launch node {key}: {source}")]
    Spawn {
        key: OwnedNodeKey,
        source: std::io::Error,
    },

    #[error("failed to signal node {key}: {source}")]
    Signal {
        key: OwnedNodeKey,
        source: std::io::Error,
    },
}

/// Result of a `start node` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// A new process was started.
    Started(u32),
    /// The node was already running under this pid.
    AlreadyRunning(u32),
}

/// Starts, stops and lists the node processes of one host.
///
/// Called from session tasks, so implementations must not block for
/// long.
pub trait ProcessControl: Send + Sync {
    fn start(&self, key: NodeKey<'_>) -> Result<Launch, ProcessError>;

    /// Terminates the node and collects its exit status.
    fn stop(&self, key: NodeKey<'_>) -> Result<(), ProcessError>;

    /// Terminates the node without waiting for it.
    fn kill(&self, key: NodeKey<'_>) -> Result<(), ProcessError>;

    /// Running nodes, ordered by key.
    fn list(&self) -> Vec<NodeRecord>;
}

#[derive(Debug)]
struct Managed {
    child: Child,
    pid: u32,
    started_at: u64,
}

/// Launches the configured program as a child of this process, with
/// `--grid <g> --cluster <c> --node <n>` appended to its arguments.
///
/// Children are killed when the controller drops. Must be used from
/// within a tokio runtime.
#[derive(Debug)]
pub struct LocalProcesses {
    program: Option<String>,
    args: Vec<String>,
    nodes: Mutex<BTreeMap<OwnedNodeKey, Managed>>,
}

impl LocalProcesses {
    pub fn new(program: Option<String>, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// A controller that answers every lifecycle request with
    /// [`ProcessError::NotConfigured`].
    pub fn disabled() -> Self {
        Self::new(None, Vec::new())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<OwnedNodeKey, Managed>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drops entries whose process has exited.
    fn reap_exited(nodes: &mut BTreeMap<OwnedNodeKey, Managed>) {
        nodes.retain(|key, managed| match managed.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(node = %key, pid = managed.pid, %status, "node exited");
                false
            }
            Err(e) => {
                warn!(node = %key, pid = managed.pid, "failed to poll node: {e}");
                false
            }
        });
    }

    fn remove(&self, key: NodeKey<'_>) -> Result<(OwnedNodeKey, Managed), ProcessError> {
        let owned = key.to_owned_key();
        let mut nodes = self.lock();
        Self::reap_exited(&mut nodes);
        match nodes.remove(&owned) {
            Some(managed) => Ok((owned, managed)),
            None => Err(ProcessError::NotRunning(owned)),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ProcessControl for LocalProcesses {
    fn start(&self, key: NodeKey<'_>) -> Result<Launch, ProcessError> {
        let Some(program) = self.program.as_deref() else {
            return Err(ProcessError::NotConfigured);
        };

        let owned = key.to_owned_key();
        let mut nodes = self.lock();
        Self::reap_exited(&mut nodes);
        if let Some(managed) = nodes.get(&owned) {
            return Ok(Launch::AlreadyRunning(managed.pid));
        }

        let child = Command::new(program)
            .args(&self.args)
            .args(["--grid", key.grid, "--cluster", key.cluster, "--node", key.node])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                key: owned.clone(),
                source,
            })?;

        // a child that has not been polled to completion always has a pid
        let pid = child.id().unwrap_or_default();
        info!(node = %owned, pid, program, "node started");
        nodes.insert(
            owned,
            Managed {
                child,
                pid,
                started_at: now_secs(),
            },
        );
        Ok(Launch::Started(pid))
    }

    fn stop(&self, key: NodeKey<'_>) -> Result<(), ProcessError> {
        let (owned, mut managed) = self.remove(key)?;
        managed
            .child
            .start_kill()
            .map_err(|source| ProcessError::Signal {
                key: owned.clone(),
                source,
            })?;
        info!(node = %owned, pid = managed.pid, "node stopped");

        tokio::spawn(async move {
            match managed.child.wait().await {
                Ok(status) => debug!(node = %owned, %status, "node reaped"),
                Err(e) => warn!(node = %owned, "failed to reap node: {e}"),
            }
        });
        Ok(())
    }

    fn kill(&self, key: NodeKey<'_>) -> Result<(), ProcessError> {
        let (owned, mut managed) = self.remove(key)?;
        managed
            .child
            .start_kill()
            .map_err(|source| ProcessError::Signal {
                key: owned.clone(),
                source,
            })?;
        info!(node = %owned, pid = managed.pid, "node killed");
        Ok(())
    }

    fn list(&self) -> Vec<NodeRecord> {
        let program = self.program.clone().unwrap_or_default();
        let mut nodes = self.lock();
        Self::reap_exited(&mut nodes);
        nodes
            .iter()
            .map(|(key, managed)| NodeRecord {
                key: key.clone(),
                details: Some(NodeDetails {
                    pid: managed.pid,
                    program: program.clone(),
                    started_at: managed.started_at,
                }),
            })
            .collect()
    }
}
