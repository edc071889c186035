//! Request classification.
//!
//! Turns one request line into a typed [`Command`] by its literal
//! prefix. Text arguments borrow from the line, so the caller decides
//! where the line lives (the server keeps it in the session arena).

use crate::error::{echo, ProtocolError};
use crate::parse::{
    check_literal, check_literal_with_int, check_literal_with_int_list, check_literal_with_text,
    check_literal_with_words, to_u32,
};
use crate::types::{NodeKey, NodeRole};

/// Every literal token of the protocol. Fixed and versionless.
pub mod literal {
    pub const OK: &str = "ok";
    pub const OK_ARG: &str = "ok ";
    pub const STARTED_SUFFIX: &str = " started";
    pub const ERROR: &str = "error ";

    pub const IDENTIFY: &str = "identify ";

    pub const LIST: &str = "list";
    pub const LIST_FULL: &str = "list full";
    pub const LIST_NEXT: &str = "list next";
    pub const LIST_STOP: &str = "list stop";
    pub const LIST_NODE: &str = "list node ";
    pub const FULL: &str = "full";
    pub const PID: &str = "pid ";
    pub const PROGRAM: &str = "program ";
    pub const START_TIME: &str = "start time ";

    pub const START_NODE: &str = "start node ";
    pub const STOP_NODE: &str = "stop node ";
    pub const KILL_NODE: &str = "kill node ";

    pub const GET_CLUSTER_LIST: &str = "get cluster list";
    pub const CLUSTER: &str = "cluster ";
    pub const GET_CONFIG: &str = "get config ";
    pub const CONFIG: &str = "config ";
    pub const UPDATE_CONFIG: &str = "update config ";

    pub const MEM_INFO_REQUEST: &str = "mem info request";
    pub const MEM_INFO: &str = "mem info ";
    pub const CPU_INFO_REQUEST: &str = "cpu info request";
    pub const CPU_INFO: &str = "cpu info ";
    pub const DISK_INFO_REQUEST: &str = "disk info request ";
    pub const DISK_INFO: &str = "disk info ";
}

/// A parsed request, ready for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// `identify <role>`. Only valid as the first line of a session.
    Identify(NodeRole),

    /// `list` or `list full`. Answered with a paged record stream.
    List { full: bool },

    /// `start node <grid> <cluster> <node>`.
    Start(NodeKey<'a>),

    /// `stop node <grid> <cluster> <node>`.
    Stop(NodeKey<'a>),

    /// `kill node <grid> <cluster> <node>`.
    Kill(NodeKey<'a>),

    /// `get cluster list`.
    GetClusterList,

    /// `get config <cluster_id>`.
    GetConfig { cluster_id: u32 },

    /// `update config <cluster_id> <line_count>`, followed by the payload.
    UpdateConfig { cluster_id: u32, line_count: u32 },

    /// `mem info request`.
    MemInfo,

    /// `cpu info request`.
    CpuInfo,

    /// `disk info request <dir>`.
    DiskInfo { dir: &'a str },
}

impl<'a> Command<'a> {
    /// Classifies a request line. Unknown literals are a protocol
    /// violation, never a recoverable error reply.
    pub fn parse(line: &'a [u8]) -> Result<Command<'a>, ProtocolError> {
        use literal::*;

        // exact-match directives first so "list full" never reads as a prefix
        if check_literal(line, LIST) {
            return Ok(Command::List { full: false });
        }
        if check_literal(line, LIST_FULL) {
            return Ok(Command::List { full: true });
        }
        if check_literal(line, GET_CLUSTER_LIST) {
            return Ok(Command::GetClusterList);
        }
        if check_literal(line, MEM_INFO_REQUEST) {
            return Ok(Command::MemInfo);
        }
        if check_literal(line, CPU_INFO_REQUEST) {
            return Ok(Command::CpuInfo);
        }

        if line.starts_with(START_NODE.as_bytes()) {
            return Ok(Command::Start(node_key(line, START_NODE)?));
        }
        if line.starts_with(STOP_NODE.as_bytes()) {
            return Ok(Command::Stop(node_key(line, STOP_NODE)?));
        }
        if line.starts_with(KILL_NODE.as_bytes()) {
            return Ok(Command::Kill(node_key(line, KILL_NODE)?));
        }
        if line.starts_with(GET_CONFIG.as_bytes()) {
            let cluster_id = to_u32(check_literal_with_int(line, GET_CONFIG)?)?;
            return Ok(Command::GetConfig { cluster_id });
        }
        if line.starts_with(UPDATE_CONFIG.as_bytes()) {
            let v = check_literal_with_int_list(line, UPDATE_CONFIG, 2)?;
            return Ok(Command::UpdateConfig {
                cluster_id: to_u32(v[0])?,
                line_count: to_u32(v[1])?,
            });
        }
        if line.starts_with(DISK_INFO_REQUEST.as_bytes()) {
            let dir = check_literal_with_text(line, DISK_INFO_REQUEST)?;
            return Ok(Command::DiskInfo { dir });
        }
        if line.starts_with(IDENTIFY.as_bytes()) {
            let [role] = check_literal_with_words::<1>(line, IDENTIFY)?;
            return Ok(Command::Identify(role.parse()?));
        }

        Err(ProtocolError::UnknownDirective(echo(line)))
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "identify",
            Command::List { full: false } => "list",
            Command::List { full: true } => "list full",
            Command::Start(_) => "start node",
            Command::Stop(_) => "stop node",
            Command::Kill(_) => "kill node",
            Command::GetClusterList => "get cluster list",
            Command::GetConfig { .. } => "get config",
            Command::UpdateConfig { .. } => "update config",
            Command::MemInfo => "mem info request",
            Command::CpuInfo => "cpu info request",
            Command::DiskInfo { .. } => "disk info request",
        }
    }

    /// Whether the reply is a paged record stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, Command::List { .. })
    }
}

fn node_key<'a>(line: &'a [u8], literal: &str) -> Result<NodeKey<'a>, ProtocolError> {
    let [grid, cluster, node] = check_literal_with_words::<3>(line, literal)?;
    Ok(NodeKey::new(grid, cluster, node))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_directives() {
        assert_eq!(Command::parse(b"list").unwrap(), Command::List { full: false });
        assert_eq!(
            Command::parse(b"list full").unwrap(),
            Command::List { full: true }
        );
        assert_eq!(
            Command::parse(b"get cluster list").unwrap(),
            Command::GetClusterList
        );
        assert_eq!(Command::parse(b"mem info request").unwrap(), Command::MemInfo);
        assert_eq!(Command::parse(b"cpu info request").unwrap(), Command::CpuInfo);
    }

    #[test]
    fn lifecycle_directives() {
        let key = NodeKey::new("gridA", "clusterB", "node3");
        assert_eq!(
            Command::parse(b"start node gridA clusterB node3").unwrap(),
            Command::Start(key)
        );
        assert_eq!(
            Command::parse(b"stop node gridA clusterB node3").unwrap(),
            Command::Stop(key)
        );
        assert_eq!(
            Command::parse(b"kill node gridA clusterB node3").unwrap(),
            Command::Kill(key)
        );
    }

    #[test]
    fn config_directives() {
        assert_eq!(
            Command::parse(b"get config 7").unwrap(),
            Command::GetConfig { cluster_id: 7 }
        );
        assert_eq!(
            Command::parse(b"update config 7 12").unwrap(),
            Command::UpdateConfig {
                cluster_id: 7,
                line_count: 12
            }
        );
    }

    #[test]
    fn disk_info_keeps_whole_path() {
        assert_eq!(
            Command::parse(b"disk info request /data/keel node").unwrap(),
            Command::DiskInfo {
                dir: "/data/keel node"
            }
        );
    }

    #[test]
    fn identify_roles() {
        assert_eq!(
            Command::parse(b"identify controller").unwrap(),
            Command::Identify(NodeRole::Controller)
        );
        assert!(matches!(
            Command::parse(b"identify wizard"),
            Err(ProtocolError::UnknownRole(_))
        ));
    }

    #[test]
    fn unknown_literal() {
        assert!(matches!(
            Command::parse(b"reboot everything"),
            Err(ProtocolError::UnknownDirective(_))
        ));
        assert!(matches!(
            Command::parse(b"list nodes"),
            Err(ProtocolError::UnknownDirective(_))
        ));
        assert!(matches!(
            Command::parse(b""),
            Err(ProtocolError::UnknownDirective(_))
        ));
    }

    #[test]
    fn malformed_arguments() {
        assert!(matches!(
            Command::parse(b"start node gridA clusterB"),
            Err(ProtocolError::WrongArgumentCount { .. })
        ));
        assert_eq!(
            Command::parse(b"get config seven"),
            Err(ProtocolError::InvalidInteger)
        );
        assert_eq!(
            Command::parse(b"get config 4294967296"),
            Err(ProtocolError::InvalidInteger)
        );
    }

    #[test]
    fn stream_classification() {
        assert!(Command::List { full: true }.is_stream());
        assert!(!Command::MemInfo.is_stream());
    }
}
