//! Request side of the control protocol.
//!
//! A [`ControlClient`] drives one connection through the same session
//! states the server walks: it moves to `DISPATCHING` once a request is
//! on the wire, to `RESPONDING_SINGLE` or `RESPONDING_STREAM` when the
//! first reply line arrives, and back to `AWAIT_COMMAND` once the reply
//! is complete. `error <msg>` replies come back as
//! [`ConnectionError::Remote`] and leave the session usable; every other
//! failure closes it.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use keel_core::{PagePool, Priority};
use keel_protocol::{
    literal, payload_lines, write_payload, ClusterLine, Command, ConfigHeader, CpuInfo, DiskInfo,
    MemInfo, NodeDetails, NodeKey, NodeRecord, NodeRole, ProtocolError, SessionState,
    StateMachine, Status,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::socket::{connect_client, RetryPolicy};

/// Result of a `start node` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was launched.
    Launched(u32),
    /// The node was already running under this pid.
    AlreadyRunning(u32),
}

impl StartOutcome {
    pub fn pid(&self) -> u32 {
        match self {
            StartOutcome::Launched(pid) | StartOutcome::AlreadyRunning(pid) => *pid,
        }
    }
}

/// A configuration payload as served by `get config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedConfig {
    pub cluster_id: u32,
    pub version: u32,
    /// Payload lines, each terminated by `\n`.
    pub payload: Bytes,
}

/// What to do after each record of a `list` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListControl {
    Next,
    Stop,
}

/// Client end of a control session.
#[derive(Debug)]
pub struct ControlClient<S = TcpStream> {
    conn: Connection<S>,
    machine: StateMachine,
}

impl ControlClient<TcpStream> {
    /// Connects to `server` with the given retry policy.
    pub async fn connect(
        server: SocketAddr,
        retry: &RetryPolicy,
        pool: &PagePool,
    ) -> Result<Self, ConnectionError> {
        let conn = connect_client(server, None, retry, pool).await?;
        Self::new(conn)
    }
}

impl<S> ControlClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established connection.
    pub fn new(conn: Connection<S>) -> Result<Self, ConnectionError> {
        let mut machine = StateMachine::new();
        machine.transition(SessionState::Established)?;
        Ok(Self { conn, machine })
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// States visited so far, oldest first.
    pub fn history(&self) -> &[SessionState] {
        self.machine.history()
    }

    /// Sends `identify <role>`. Only valid as the first request.
    pub async fn identify(&mut self, role: NodeRole) -> Result<(), ConnectionError> {
        if self.machine.state() != SessionState::Established {
            return Err(ProtocolError::InvalidTransition {
                from: self.machine.state(),
                to: SessionState::AwaitCommand,
            }
            .into());
        }
        let result = self.identify_inner(role).await;
        self.settle(result)
    }

    async fn identify_inner(&mut self, role: NodeRole) -> Result<(), ConnectionError> {
        self.send_request(&Command::Identify(role)).await?;
        self.expect_ok().await
    }

    /// Lists every node, paging through the whole stream.
    pub async fn list(&mut self, full: bool) -> Result<Vec<NodeRecord>, ConnectionError> {
        let mut records = Vec::new();
        self.list_with(full, |record| {
            records.push(record);
            ListControl::Next
        })
        .await?;
        Ok(records)
    }

    /// Streams node records to `on_record`, which decides after each one
    /// whether to ask for the next.
    pub async fn list_with<F>(&mut self, full: bool, on_record: F) -> Result<(), ConnectionError>
    where
        F: FnMut(NodeRecord) -> ListControl,
    {
        let result = self.list_inner(full, on_record).await;
        self.settle(result)
    }

    async fn list_inner<F>(&mut self, full: bool, mut on_record: F) -> Result<(), ConnectionError>
    where
        F: FnMut(NodeRecord) -> ListControl,
    {
        self.send_request(&Command::List { full }).await?;

        loop {
            let line = self.conn.read_line().await?;
            if self.machine.state() == SessionState::Dispatching {
                self.machine.transition(SessionState::RespondingStream)?;
            }
            if line == literal::LIST_STOP.as_bytes() {
                return Ok(());
            }

            let (key, has_details) = NodeRecord::parse_header(line)?;
            let details = if has_details {
                let pid = NodeRecord::parse_pid(self.conn.read_line().await?)?;
                let program = NodeRecord::parse_program(self.conn.read_line().await?)?;
                let started_at = NodeRecord::parse_start_time(self.conn.read_line().await?)?;
                Some(NodeDetails {
                    pid,
                    program,
                    started_at,
                })
            } else {
                None
            };

            match on_record(NodeRecord { key, details }) {
                ListControl::Next => {
                    self.conn.send_literal(literal::LIST_NEXT).await?;
                    self.conn.flush().await?;
                }
                ListControl::Stop => {
                    self.conn.send_literal(literal::LIST_STOP).await?;
                    self.conn.flush().await?;
                    return Ok(());
                }
            }
        }
    }

    /// Sends `start node`.
    pub async fn start(&mut self, key: NodeKey<'_>) -> Result<StartOutcome, ConnectionError> {
        let result = self.start_inner(key).await;
        self.settle(result)
    }

    async fn start_inner(&mut self, key: NodeKey<'_>) -> Result<StartOutcome, ConnectionError> {
        self.send_request(&Command::Start(key)).await?;
        match self.read_status().await? {
            Status::Value(pid) => Ok(StartOutcome::Launched(narrow_pid(pid)?)),
            Status::Started(pid) => Ok(StartOutcome::AlreadyRunning(narrow_pid(pid)?)),
            other => Err(unexpected_status("ok <pid>", &other)),
        }
    }

    /// Sends `stop node`.
    pub async fn stop(&mut self, key: NodeKey<'_>) -> Result<(), ConnectionError> {
        let result = self.simple(&Command::Stop(key)).await;
        self.settle(result)
    }

    /// Sends `kill node`.
    pub async fn kill(&mut self, key: NodeKey<'_>) -> Result<(), ConnectionError> {
        let result = self.simple(&Command::Kill(key)).await;
        self.settle(result)
    }

    async fn simple(&mut self, cmd: &Command<'_>) -> Result<(), ConnectionError> {
        self.send_request(cmd).await?;
        self.expect_ok().await
    }

    /// Sends `get cluster list`.
    pub async fn clusters(&mut self) -> Result<Vec<ClusterLine>, ConnectionError> {
        let result = self.clusters_inner().await;
        self.settle(result)
    }

    async fn clusters_inner(&mut self) -> Result<Vec<ClusterLine>, ConnectionError> {
        self.send_request(&Command::GetClusterList).await?;
        let count = match self.read_status().await? {
            Status::Value(n) => n,
            other => return Err(unexpected_status("ok <count>", &other)),
        };
        let mut clusters = Vec::new();
        for _ in 0..count {
            clusters.push(ClusterLine::parse(self.conn.read_line().await?)?);
        }
        Ok(clusters)
    }

    /// Sends `get config <cluster_id>` and collects the payload lines.
    pub async fn get_config(&mut self, cluster_id: u32) -> Result<FetchedConfig, ConnectionError> {
        let result = self.get_config_inner(cluster_id).await;
        self.settle(result)
    }

    async fn get_config_inner(&mut self, cluster_id: u32) -> Result<FetchedConfig, ConnectionError> {
        self.send_request(&Command::GetConfig { cluster_id }).await?;
        let header = self.read_reply(ConfigHeader::parse).await?;
        if header.cluster_id != cluster_id {
            return Err(ProtocolError::UnexpectedLiteral {
                expected: format!("config {cluster_id}"),
                got: format!("config {}", header.cluster_id),
            }
            .into());
        }

        let mut payload = BytesMut::new();
        for _ in 0..header.line_count {
            let line = self.conn.read_line().await?;
            payload.extend_from_slice(line);
            payload.extend_from_slice(b"\n");
        }
        Ok(FetchedConfig {
            cluster_id,
            version: header.version,
            payload: payload.freeze(),
        })
    }

    /// Sends `update config` with `payload` split into lines. Returns the
    /// newly committed version.
    pub async fn update_config(
        &mut self,
        cluster_id: u32,
        payload: &[u8],
    ) -> Result<u32, ConnectionError> {
        let result = self.update_config_inner(cluster_id, payload).await;
        self.settle(result)
    }

    async fn update_config_inner(
        &mut self,
        cluster_id: u32,
        payload: &[u8],
    ) -> Result<u32, ConnectionError> {
        let lines = payload_lines(payload);
        if lines.iter().any(|l| l.contains(&b'\r')) {
            return Err(ConnectionError::InvalidPayload(
                "lines must not contain carriage returns".into(),
            ));
        }
        let line_count = u32::try_from(lines.len()).map_err(|_| ProtocolError::InvalidInteger)?;

        self.begin()?;
        let cmd = Command::UpdateConfig {
            cluster_id,
            line_count,
        };
        self.conn
            .send_with(Priority::High, |buf| cmd.serialize(buf))
            .await?;
        self.conn
            .send_with(Priority::Low, |buf| write_payload(buf, &lines))
            .await?;
        self.conn.flush().await?;
        self.machine.transition(SessionState::Dispatching)?;

        match self.read_status().await? {
            Status::Value(version) => {
                Ok(u32::try_from(version).map_err(|_| ProtocolError::InvalidInteger)?)
            }
            other => Err(unexpected_status("ok <version>", &other)),
        }
    }

    /// Sends `mem info request`.
    pub async fn mem_info(&mut self) -> Result<MemInfo, ConnectionError> {
        let result = self.query(&Command::MemInfo, MemInfo::parse).await;
        self.settle(result)
    }

    /// Sends `cpu info request`.
    pub async fn cpu_info(&mut self) -> Result<CpuInfo, ConnectionError> {
        let result = self.query(&Command::CpuInfo, CpuInfo::parse).await;
        self.settle(result)
    }

    /// Sends `disk info request <dir>`.
    pub async fn disk_info(&mut self, dir: &str) -> Result<DiskInfo, ConnectionError> {
        let result = self.query(&Command::DiskInfo { dir }, DiskInfo::parse).await;
        self.settle(result)
    }

    async fn query<T>(
        &mut self,
        cmd: &Command<'_>,
        parse: fn(&[u8]) -> Result<T, ProtocolError>,
    ) -> Result<T, ConnectionError> {
        self.send_request(cmd).await?;
        self.read_reply(parse).await
    }

    /// Shuts the connection down.
    pub async fn close(mut self) {
        self.machine.close();
        self.conn.close().await;
    }

    /// Moves to `AWAIT_COMMAND` if the session hasn't sent anything yet,
    /// then requires that state.
    fn begin(&mut self) -> Result<(), ConnectionError> {
        if self.machine.is_closed() || self.conn.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if self.machine.state() == SessionState::Established {
            self.machine.transition(SessionState::AwaitCommand)?;
        }
        if self.machine.state() != SessionState::AwaitCommand {
            return Err(ProtocolError::InvalidTransition {
                from: self.machine.state(),
                to: SessionState::Dispatching,
            }
            .into());
        }
        Ok(())
    }

    async fn send_request(&mut self, cmd: &Command<'_>) -> Result<(), ConnectionError> {
        self.begin()?;
        trace!(command = cmd.name(), "sending request");
        self.conn
            .send_with(Priority::High, |buf| cmd.serialize(buf))
            .await?;
        self.conn.flush().await?;
        self.machine.transition(SessionState::Dispatching)?;
        Ok(())
    }

    /// Reads a single-line reply, turning `error <msg>` into
    /// [`ConnectionError::Remote`].
    async fn read_reply<T>(
        &mut self,
        parse: fn(&[u8]) -> Result<T, ProtocolError>,
    ) -> Result<T, ConnectionError> {
        let line = self.conn.read_line().await?;
        self.machine.transition(SessionState::RespondingSingle)?;
        if is_error_line(line) {
            if let Status::Error(msg) = Status::parse(line)? {
                return Err(ConnectionError::Remote(msg));
            }
        }
        Ok(parse(line)?)
    }

    async fn read_status(&mut self) -> Result<Status, ConnectionError> {
        match self.read_reply(Status::parse).await? {
            Status::Error(msg) => Err(ConnectionError::Remote(msg)),
            status => Ok(status),
        }
    }

    async fn expect_ok(&mut self) -> Result<(), ConnectionError> {
        match self.read_status().await? {
            Status::Ok => Ok(()),
            other => Err(unexpected_status("ok", &other)),
        }
    }

    /// Returns the session to `AWAIT_COMMAND` after a complete reply or an
    /// `error` reply, and closes it on anything else.
    fn settle<T>(&mut self, result: Result<T, ConnectionError>) -> Result<T, ConnectionError> {
        match &result {
            Err(e) if !e.keeps_session() => {
                self.machine.close();
                self.conn.mark_closed();
            }
            _ => {
                if self.machine.state() != SessionState::AwaitCommand {
                    if let Err(e) = self.machine.transition(SessionState::AwaitCommand) {
                        self.machine.close();
                        self.conn.mark_closed();
                        return Err(e.into());
                    }
                }
            }
        }
        result
    }
}

fn is_error_line(line: &[u8]) -> bool {
    line == literal::ERROR.trim_end().as_bytes() || line.starts_with(literal::ERROR.as_bytes())
}

fn narrow_pid(pid: u64) -> Result<u32, ConnectionError> {
    u32::try_from(pid).map_err(|_| ProtocolError::InvalidInteger.into())
}

fn unexpected_status(expected: &str, got: &Status) -> ConnectionError {
    ProtocolError::UnexpectedLiteral {
        expected: expected.to_owned(),
        got: format!("{got:?}"),
    }
    .into()
}
