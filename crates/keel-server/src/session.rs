//! Server side of one control session.
//!
//! Each request line is copied out of the connection's receive page into
//! the session arena, parsed there, and dispatched. The arena is reset
//! before every command, so nothing parsed outlives the command it came
//! from.
//!
//! Failure policy: a line that doesn't parse, or a violation in the
//! middle of a command, closes the session without a reply. A
//! well-formed request whose backend fails gets `error <msg>` and the
//! session carries on.

use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use keel_core::{ArenaContainer, ArenaRef, ByteArena, Priority};
use keel_net::{Connection, ConnectionError};
use keel_protocol::{
    check_literal, literal, payload_lines, write_payload, ClusterLine, Command, ConfigHeader,
    NodeKey, NodeRecord, NodeRole, ProtocolError, SessionState, StateMachine, Status,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::process::Launch;
use crate::server::ServerContext;

/// Maximum bytes of an offending line quoted in a log or error.
const MAX_ECHO: usize = 64;

/// One accepted connection and everything it parses into.
pub(crate) struct Session<S> {
    arena: ArenaContainer,
    handler: Handler<S>,
}

/// The parts of a session a command handler touches. Kept apart from the
/// arena so a parsed command can borrow the arena while its handler runs.
struct Handler<S> {
    conn: Connection<S>,
    machine: StateMachine,
    ctx: Arc<ServerContext>,
    role: Option<NodeRole>,
    served: u64,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(conn: Connection<S>, ctx: Arc<ServerContext>) -> Result<Self, ConnectionError> {
        let arena = ArenaContainer::new(ctx.arena)?;
        Ok(Self {
            arena,
            handler: Handler {
                conn,
                machine: StateMachine::new(),
                ctx,
                role: None,
                served: 0,
            },
        })
    }

    /// Serves commands until the peer leaves, the session idles out, the
    /// server shuts down, or a violation closes it.
    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let peer = self.handler.conn.peer_addr();
        debug!(?peer, "session opened");

        let result = self.serve(&mut shutdown).await;
        match &result {
            Ok(()) | Err(ConnectionError::Disconnected) => {}
            Err(ConnectionError::Protocol(e)) => {
                warn!(?peer, state = %self.handler.machine.state(), "protocol violation, closing session: {e}");
            }
            Err(e) => warn!(?peer, "closing session: {e}"),
        }

        self.handler.machine.close();
        self.handler.conn.close().await;
        self.arena.release();
        debug!(?peer, commands = self.handler.served, role = ?self.handler.role, "session closed");
    }

    async fn serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ConnectionError> {
        self.handler.enter(SessionState::Established)?;

        loop {
            self.handler.enter(SessionState::AwaitCommand)?;
            self.arena.reset();

            let read = tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    debug!("server shutting down, ending session");
                    return Ok(());
                }

                read = next_line(&mut self.handler.conn, &mut self.arena, self.handler.ctx.idle_timeout) => read?,
            };
            let Some(handle) = read else {
                debug!(peer = ?self.handler.conn.peer_addr(), "idle timeout");
                return Ok(());
            };

            let line = self.arena.get(handle).unwrap_or_default();
            let cmd = Command::parse(line)?;
            self.handler.dispatch(cmd).await?;
            self.handler.served += 1;
        }
    }
}

/// Reads one line and copies it into the arena. `None` means the idle
/// timeout passed first.
async fn next_line<S>(
    conn: &mut Connection<S>,
    arena: &mut ArenaContainer,
    idle: Option<Duration>,
) -> Result<Option<ArenaRef>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match idle {
        Some(limit) => match tokio::time::timeout(limit, conn.read_line()).await {
            Ok(read) => read?,
            Err(_) => return Ok(None),
        },
        None => conn.read_line().await?,
    };
    Ok(Some(arena.copy_from_slice(line)?))
}

fn echo(line: &[u8]) -> String {
    String::from_utf8_lossy(&line[..line.len().min(MAX_ECHO)]).into_owned()
}

impl<S> Handler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn enter(&mut self, to: SessionState) -> Result<(), ProtocolError> {
        let from = self.machine.state();
        self.machine.transition(to)?;
        trace!(peer = ?self.conn.peer_addr(), %from, %to, "session state");
        Ok(())
    }

    async fn dispatch(&mut self, cmd: Command<'_>) -> Result<(), ConnectionError> {
        self.enter(SessionState::Dispatching)?;
        trace!(command = cmd.name(), "dispatching");

        match cmd {
            Command::Identify(role) => self.identify(role).await,
            Command::List { full } => self.list(full).await,
            Command::Start(key) => self.start(key).await,
            Command::Stop(key) => {
                let status = match self.ctx.processes.stop(key) {
                    Ok(()) => Status::Ok,
                    Err(e) => failure("stop node", e),
                };
                self.reply(&status).await
            }
            Command::Kill(key) => {
                let status = match self.ctx.processes.kill(key) {
                    Ok(()) => Status::Ok,
                    Err(e) => failure("kill node", e),
                };
                self.reply(&status).await
            }
            Command::GetClusterList => self.cluster_list().await,
            Command::GetConfig { cluster_id } => self.get_config(cluster_id).await,
            Command::UpdateConfig {
                cluster_id,
                line_count,
            } => self.update_config(cluster_id, line_count).await,
            Command::MemInfo => match self.ctx.hardware.mem_info() {
                Ok(info) => self.single(|buf| info.serialize(buf)).await,
                Err(e) => self.reply(&failure("mem info", e)).await,
            },
            Command::CpuInfo => match self.ctx.hardware.cpu_info() {
                Ok(info) => self.single(|buf| info.serialize(buf)).await,
                Err(e) => self.reply(&failure("cpu info", e)).await,
            },
            Command::DiskInfo { dir } => match self.ctx.hardware.disk_info(Path::new(dir)) {
                Ok(info) => self.single(|buf| info.serialize(buf)).await,
                Err(e) => self.reply(&failure("disk info", format!("{dir}: {e}"))).await,
            },
        }
    }

    /// Queues and flushes a single-line (or single-block) reply.
    async fn single<F>(&mut self, f: F) -> Result<(), ConnectionError>
    where
        F: FnOnce(&mut BytesMut),
    {
        self.enter(SessionState::RespondingSingle)?;
        self.conn.send_with(Priority::High, f).await?;
        self.conn.flush().await
    }

    async fn reply(&mut self, status: &Status) -> Result<(), ConnectionError> {
        self.single(|buf| status.serialize(buf)).await
    }

    async fn identify(&mut self, role: NodeRole) -> Result<(), ConnectionError> {
        if self.served > 0 || self.role.is_some() {
            return Err(ProtocolError::UnexpectedLiteral {
                expected: "a command".into(),
                got: format!("{}{role}", literal::IDENTIFY),
            }
            .into());
        }
        debug!(peer = ?self.conn.peer_addr(), %role, "peer identified");
        self.role = Some(role);
        self.reply(&Status::Ok).await
    }

    /// Streams node records, one per `list next` from the peer, and ends
    /// with `list stop` unless the peer stopped first.
    async fn list(&mut self, full: bool) -> Result<(), ConnectionError> {
        let records = self.ctx.processes.list();
        self.enter(SessionState::RespondingStream)?;

        for mut record in records {
            if !full {
                record.details = None;
            }
            self.send_record(&record).await?;

            let line = self.conn.read_line().await?;
            if check_literal(line, literal::LIST_NEXT) {
                continue;
            }
            if check_literal(line, literal::LIST_STOP) {
                trace!("list stopped by peer");
                return Ok(());
            }
            return Err(ProtocolError::UnexpectedLiteral {
                expected: literal::LIST_NEXT.into(),
                got: echo(line),
            }
            .into());
        }

        self.conn.send_literal(literal::LIST_STOP).await?;
        self.conn.flush().await
    }

    async fn send_record(&mut self, record: &NodeRecord) -> Result<(), ConnectionError> {
        self.conn
            .send_with(Priority::Low, |buf| record.serialize(buf))
            .await?;
        self.conn.flush().await
    }

    async fn start(&mut self, key: NodeKey<'_>) -> Result<(), ConnectionError> {
        let status = match self.ctx.processes.start(key) {
            Ok(Launch::Started(pid)) => Status::Value(u64::from(pid)),
            Ok(Launch::AlreadyRunning(pid)) => Status::Started(u64::from(pid)),
            Err(e) => failure("start node", e),
        };
        self.reply(&status).await
    }

    async fn cluster_list(&mut self) -> Result<(), ConnectionError> {
        let clusters = self.ctx.store.clusters();
        self.enter(SessionState::RespondingSingle)?;
        let count = Status::Value(clusters.len() as u64);
        self.conn
            .send_with(Priority::High, |buf| count.serialize(buf))
            .await?;
        self.conn
            .send_with(Priority::Low, |buf| {
                for c in &clusters {
                    ClusterLine {
                        cluster_id: c.cluster_id,
                        version: c.version,
                        name: c.name.clone(),
                    }
                    .serialize(buf);
                }
            })
            .await?;
        self.conn.flush().await
    }

    async fn get_config(&mut self, cluster_id: u32) -> Result<(), ConnectionError> {
        let version = match self.ctx.store.get_configuration(cluster_id) {
            Ok(v) => v,
            Err(e) => {
                if e.is_corruption() {
                    error!(cluster_id, "serving configuration failed: {e}");
                }
                return self.reply(&failure("get config", e)).await;
            }
        };

        let lines = payload_lines(&version.payload);
        let line_count = u32::try_from(lines.len()).map_err(|_| ProtocolError::InvalidInteger)?;
        let header = ConfigHeader {
            cluster_id,
            version: version.version,
            line_count,
        };

        self.enter(SessionState::RespondingSingle)?;
        self.conn
            .send_with(Priority::High, |buf| header.serialize(buf))
            .await?;
        self.conn
            .send_with(Priority::Low, |buf| write_payload(buf, &lines))
            .await?;
        self.conn.flush().await
    }

    async fn update_config(&mut self, cluster_id: u32, line_count: u32) -> Result<(), ConnectionError> {
        let limit = self.ctx.max_payload;
        let mut payload = BytesMut::new();
        for _ in 0..line_count {
            let line = self.conn.read_line().await?;
            if payload.len() + line.len() + 1 > limit {
                return Err(ProtocolError::PayloadTooLarge(limit).into());
            }
            payload.extend_from_slice(line);
            payload.extend_from_slice(b"\n");
        }

        let store = Arc::clone(&self.ctx.store);
        let payload = payload.freeze();
        let committed =
            tokio::task::spawn_blocking(move || store.commit_update(cluster_id, payload)).await;

        let status = match committed {
            Ok(Ok(version)) => Status::Value(u64::from(version)),
            Ok(Err(e)) => {
                if e.is_corruption() {
                    error!(cluster_id, "commit failed: {e}");
                }
                failure("update config", e)
            }
            Err(e) => failure("update config", format!("commit task failed: {e}")),
        };
        self.reply(&status).await
    }
}

/// An `error <msg>` reply for a request whose backend failed.
fn failure(command: &str, e: impl Display) -> Status {
    let msg = e.to_string();
    debug!(command, "request failed: {msg}");
    Status::Error(msg)
}
