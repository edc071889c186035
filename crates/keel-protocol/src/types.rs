//! Values carried by control protocol lines.
//!
//! Request-side names ([`NodeKey`]) borrow from the line they were parsed
//! from; reply-side values ([`Status`], [`NodeRecord`], [`ClusterLine`])
//! are owned so a client can keep them after the next read.

use std::fmt;
use std::str::FromStr;

use crate::command::literal;
use crate::error::{echo, ProtocolError};
use crate::parse::{
    check_literal, check_literal_with_int, check_literal_with_int_list, check_literal_with_text,
    parse_u64, strip_literal, to_u32,
};

/// The function a process performs in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// API client.
    Client,
    /// Data node.
    Data,
    /// Replication node.
    Replication,
    /// Process controller.
    Controller,
    /// Configuration server.
    Config,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Client => "client",
            NodeRole::Data => "data",
            NodeRole::Replication => "replication",
            NodeRole::Controller => "controller",
            NodeRole::Config => "config",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(NodeRole::Client),
            "data" => Ok(NodeRole::Data),
            "replication" => Ok(NodeRole::Replication),
            "controller" => Ok(NodeRole::Controller),
            "config" => Ok(NodeRole::Config),
            other => Err(ProtocolError::UnknownRole(other.to_owned())),
        }
    }
}

/// Identifies one node process: `<grid> <cluster> <node>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey<'a> {
    pub grid: &'a str,
    pub cluster: &'a str,
    pub node: &'a str,
}

impl<'a> NodeKey<'a> {
    pub fn new(grid: &'a str, cluster: &'a str, node: &'a str) -> Self {
        Self {
            grid,
            cluster,
            node,
        }
    }

    pub fn to_owned_key(&self) -> OwnedNodeKey {
        OwnedNodeKey {
            grid: self.grid.to_owned(),
            cluster: self.cluster.to_owned(),
            node: self.node.to_owned(),
        }
    }
}

impl fmt::Display for NodeKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.grid, self.cluster, self.node)
    }
}

/// Owned form of [`NodeKey`], for tables that outlive a parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnedNodeKey {
    pub grid: String,
    pub cluster: String,
    pub node: String,
}

impl OwnedNodeKey {
    pub fn as_key(&self) -> NodeKey<'_> {
        NodeKey::new(&self.grid, &self.cluster, &self.node)
    }
}

impl fmt::Display for OwnedNodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_key().fmt(f)
    }
}

/// A single-line status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// `ok`
    Ok,
    /// `ok <n>`: a pid, a count or a version number depending on the request.
    Value(u64),
    /// `ok <pid> started`: the node was already running.
    Started(u64),
    /// `error <message>`
    Error(String),
}

impl Status {
    /// Parses a status line.
    pub fn parse(line: &[u8]) -> Result<Status, ProtocolError> {
        if check_literal(line, literal::OK) {
            return Ok(Status::Ok);
        }
        if check_literal(line, literal::ERROR.trim_end()) {
            return Ok(Status::Error(String::new()));
        }
        if let Ok(msg) = strip_literal(line, literal::ERROR) {
            return Ok(Status::Error(String::from_utf8_lossy(msg).into_owned()));
        }
        let rest = strip_literal(line, literal::OK_ARG).map_err(|_| {
            ProtocolError::UnexpectedLiteral {
                expected: literal::OK.to_owned(),
                got: echo(line),
            }
        })?;
        match rest.strip_suffix(literal::STARTED_SUFFIX.as_bytes()) {
            Some(pid) => Ok(Status::Started(parse_u64(pid)?)),
            None => Ok(Status::Value(parse_u64(rest)?)),
        }
    }
}

/// Extra fields sent for each node by `list full`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDetails {
    pub pid: u32,
    pub program: String,
    /// Unix seconds at which the process was started.
    pub started_at: u64,
}

/// One node in a `list` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub key: OwnedNodeKey,
    pub details: Option<NodeDetails>,
}

impl NodeRecord {
    /// Parses the `list node <grid> <cluster> <node> [full]` line. Returns
    /// the key and whether detail lines follow.
    pub fn parse_header(line: &[u8]) -> Result<(OwnedNodeKey, bool), ProtocolError> {
        let text = check_literal_with_text(line, literal::LIST_NODE)?;
        let words: Vec<&str> = text.split(' ').collect();
        if words.iter().any(|w| w.is_empty()) {
            return Err(ProtocolError::InvalidSeparator);
        }
        let full = match words.len() {
            3 => false,
            4 if words[3] == literal::FULL => true,
            4 => return Err(ProtocolError::InvalidSeparator),
            got => return Err(ProtocolError::WrongArgumentCount { expected: 3, got }),
        };
        let key = NodeKey::new(words[0], words[1], words[2]).to_owned_key();
        Ok((key, full))
    }

    /// Parses the `pid` line of a full record.
    pub fn parse_pid(line: &[u8]) -> Result<u32, ProtocolError> {
        to_u32(check_literal_with_int(line, literal::PID)?)
    }

    /// Parses the `program` line of a full record.
    pub fn parse_program(line: &[u8]) -> Result<String, ProtocolError> {
        Ok(check_literal_with_text(line, literal::PROGRAM)?.to_owned())
    }

    /// Parses the `start time` line of a full record.
    pub fn parse_start_time(line: &[u8]) -> Result<u64, ProtocolError> {
        check_literal_with_int(line, literal::START_TIME)
    }
}

/// One entry of the `get cluster list` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLine {
    pub cluster_id: u32,
    pub version: u32,
    pub name: String,
}

impl ClusterLine {
    /// Parses `cluster <id> <version> <name>`.
    pub fn parse(line: &[u8]) -> Result<ClusterLine, ProtocolError> {
        let text = check_literal_with_text(line, literal::CLUSTER)?;
        let mut parts = text.splitn(3, ' ');
        let (Some(id), Some(version), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::WrongArgumentCount {
                expected: 3,
                got: text.split(' ').count(),
            });
        };
        if name.is_empty() || name.contains(' ') {
            return Err(ProtocolError::InvalidSeparator);
        }
        Ok(ClusterLine {
            cluster_id: to_u32(parse_u64(id.as_bytes())?)?,
            version: to_u32(parse_u64(version.as_bytes())?)?,
            name: name.to_owned(),
        })
    }
}

/// Header line of a `get config` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigHeader {
    pub cluster_id: u32,
    pub version: u32,
    /// Number of payload lines that follow.
    pub line_count: u32,
}

impl ConfigHeader {
    /// Parses `config <cluster_id> <version> <line_count>`.
    pub fn parse(line: &[u8]) -> Result<ConfigHeader, ProtocolError> {
        let v = check_literal_with_int_list(line, literal::CONFIG, 3)?;
        Ok(ConfigHeader {
            cluster_id: to_u32(v[0])?,
            version: to_u32(v[1])?,
            line_count: to_u32(v[2])?,
        })
    }
}

/// Reply to `mem info request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub free_kb: u64,
}

impl MemInfo {
    pub fn parse(line: &[u8]) -> Result<MemInfo, ProtocolError> {
        let v = check_literal_with_int_list(line, literal::MEM_INFO, 2)?;
        Ok(MemInfo {
            total_kb: v[0],
            free_kb: v[1],
        })
    }
}

/// Reply to `cpu info request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub cpu_count: u64,
}

impl CpuInfo {
    pub fn parse(line: &[u8]) -> Result<CpuInfo, ProtocolError> {
        Ok(CpuInfo {
            cpu_count: check_literal_with_int(line, literal::CPU_INFO)?,
        })
    }
}

/// Reply to `disk info request <dir>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskInfo {
    pub fn parse(line: &[u8]) -> Result<DiskInfo, ProtocolError> {
        let v = check_literal_with_int_list(line, literal::DISK_INFO, 2)?;
        Ok(DiskInfo {
            total_bytes: v[0],
            available_bytes: v[1],
        })
    }
}
