//! Direct-to-buffer line serialization.
//!
//! Each `serialize` writes one or more complete lines, `\n` terminated,
//! straight into a `BytesMut`. Integers go through `itoa` on the stack.

use bytes::{BufMut, BytesMut};

use crate::command::{literal, Command};
use crate::types::{
    ClusterLine, ConfigHeader, CpuInfo, DiskInfo, MemInfo, NodeDetails, NodeKey, NodeRecord,
    Status,
};

/// Line terminator written by this end. Readers also accept `\r\n`.
pub const LINE_END: u8 = b'\n';

impl Command<'_> {
    /// Writes the request line.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Command::Identify(role) => {
                dst.put_slice(literal::IDENTIFY.as_bytes());
                dst.put_slice(role.as_str().as_bytes());
            }
            Command::List { full: false } => dst.put_slice(literal::LIST.as_bytes()),
            Command::List { full: true } => dst.put_slice(literal::LIST_FULL.as_bytes()),
            Command::Start(key) => write_node_key(dst, literal::START_NODE, key),
            Command::Stop(key) => write_node_key(dst, literal::STOP_NODE, key),
            Command::Kill(key) => write_node_key(dst, literal::KILL_NODE, key),
            Command::GetClusterList => dst.put_slice(literal::GET_CLUSTER_LIST.as_bytes()),
            Command::GetConfig { cluster_id } => {
                dst.put_slice(literal::GET_CONFIG.as_bytes());
                write_u64(dst, u64::from(*cluster_id));
            }
            Command::UpdateConfig {
                cluster_id,
                line_count,
            } => {
                dst.put_slice(literal::UPDATE_CONFIG.as_bytes());
                write_u64(dst, u64::from(*cluster_id));
                dst.put_u8(b' ');
                write_u64(dst, u64::from(*line_count));
            }
            Command::MemInfo => dst.put_slice(literal::MEM_INFO_REQUEST.as_bytes()),
            Command::CpuInfo => dst.put_slice(literal::CPU_INFO_REQUEST.as_bytes()),
            Command::DiskInfo { dir } => {
                dst.put_slice(literal::DISK_INFO_REQUEST.as_bytes());
                dst.put_slice(dir.as_bytes());
            }
        }
        dst.put_u8(LINE_END);
    }
}

impl Status {
    /// Writes the status line. Newlines inside an error message are
    /// flattened so the reply stays one line.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Status::Ok => dst.put_slice(literal::OK.as_bytes()),
            Status::Value(n) => {
                dst.put_slice(literal::OK_ARG.as_bytes());
                write_u64(dst, *n);
            }
            Status::Started(pid) => {
                dst.put_slice(literal::OK_ARG.as_bytes());
                write_u64(dst, *pid);
                dst.put_slice(literal::STARTED_SUFFIX.as_bytes());
            }
            Status::Error(msg) => {
                dst.put_slice(literal::ERROR.as_bytes());
                for b in msg.bytes() {
                    dst.put_u8(if b == b'\n' || b == b'\r' { b' ' } else { b });
                }
            }
        }
        dst.put_u8(LINE_END);
    }
}

impl NodeRecord {
    /// Writes the record header and, for full records, its detail lines.
    pub fn serialize(&self, dst: &mut BytesMut) {
        write_node_key(dst, literal::LIST_NODE, &self.key.as_key());
        if let Some(details) = &self.details {
            dst.put_u8(b' ');
            dst.put_slice(literal::FULL.as_bytes());
            dst.put_u8(LINE_END);
            details.serialize(dst);
        } else {
            dst.put_u8(LINE_END);
        }
    }
}

impl NodeDetails {
    fn serialize(&self, dst: &mut BytesMut) {
        dst.put_slice(literal::PID.as_bytes());
        write_u64(dst, u64::from(self.pid));
        dst.put_u8(LINE_END);
        dst.put_slice(literal::PROGRAM.as_bytes());
        dst.put_slice(self.program.as_bytes());
        dst.put_u8(LINE_END);
        dst.put_slice(literal::START_TIME.as_bytes());
        write_u64(dst, self.started_at);
        dst.put_u8(LINE_END);
    }
}

impl ClusterLine {
    pub fn serialize(&self, dst: &mut BytesMut) {
        dst.put_slice(literal::CLUSTER.as_bytes());
        write_u64(dst, u64::from(self.cluster_id));
        dst.put_u8(b' ');
        write_u64(dst, u64::from(self.version));
        dst.put_u8(b' ');
        dst.put_slice(self.name.as_bytes());
        dst.put_u8(LINE_END);
    }
}

impl ConfigHeader {
    pub fn serialize(&self, dst: &mut BytesMut) {
        dst.put_slice(literal::CONFIG.as_bytes());
        write_u64(dst, u64::from(self.cluster_id));
        dst.put_u8(b' ');
        write_u64(dst, u64::from(self.version));
        dst.put_u8(b' ');
        write_u64(dst, u64::from(self.line_count));
        dst.put_u8(LINE_END);
    }
}

impl MemInfo {
    pub fn serialize(&self, dst: &mut BytesMut) {
        dst.put_slice(literal::MEM_INFO.as_bytes());
        write_u64(dst, self.total_kb);
        dst.put_u8(b' ');
        write_u64(dst, self.free_kb);
        dst.put_u8(LINE_END);
    }
}

impl CpuInfo {
    pub fn serialize(&self, dst: &mut BytesMut) {
        dst.put_slice(literal::CPU_INFO.as_bytes());
        write_u64(dst, self.cpu_count);
        dst.put_u8(LINE_END);
    }
}

impl DiskInfo {
    pub fn serialize(&self, dst: &mut BytesMut) {
        dst.put_slice(literal::DISK_INFO.as_bytes());
        write_u64(dst, self.total_bytes);
        dst.put_u8(b' ');
        write_u64(dst, self.available_bytes);
        dst.put_u8(LINE_END);
    }
}

/// Writes a bare literal line such as `list stop` or `list next`.
pub fn write_literal(dst: &mut BytesMut, literal: &str) {
    dst.put_slice(literal.as_bytes());
    dst.put_u8(LINE_END);
}

/// Splits a configuration payload into the lines sent after a `config`
/// header or an `update config` request. A trailing newline does not
/// produce an extra empty line.
pub fn payload_lines(payload: &[u8]) -> Vec<&[u8]> {
    if payload.is_empty() {
        return Vec::new();
    }
    let body = payload.strip_suffix(b"\n").unwrap_or(payload);
    body.split(|&b| b == LINE_END).collect()
}

/// Writes payload lines, each terminated by `\n`.
pub fn write_payload(dst: &mut BytesMut, lines: &[&[u8]]) {
    for line in lines {
        dst.put_slice(line);
        dst.put_u8(LINE_END);
    }
}

fn write_node_key(dst: &mut BytesMut, literal: &str, key: &NodeKey<'_>) {
    dst.put_slice(literal.as_bytes());
    dst.put_slice(key.grid.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(key.cluster.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(key.node.as_bytes());
}

fn write_u64(dst: &mut BytesMut, val: u64) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::find_line;
    use crate::types::NodeRole;

    fn serialize_cmd(cmd: &Command<'_>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        cmd.serialize(&mut buf);
        buf.to_vec()
    }

    /// Splits serialized output back into lines without terminators.
    fn lines(buf: &[u8]) -> Vec<&[u8]> {
        let mut out = Vec::new();
        let mut rest = buf;
        while let Some((len, consumed)) = find_line(rest) {
            out.push(&rest[..len]);
            rest = &rest[consumed..];
        }
        assert!(rest.is_empty(), "unterminated trailing bytes");
        out
    }

    #[test]
    fn commands_parse_back() {
        let key = NodeKey::new("g", "c", "n1");
        let cmds = [
            Command::Identify(NodeRole::Data),
            Command::List { full: true },
            Command::Start(key),
            Command::Kill(key),
            Command::GetConfig { cluster_id: 9 },
            Command::UpdateConfig {
                cluster_id: 9,
                line_count: 3,
            },
            Command::DiskInfo { dir: "/tmp" },
        ];
        for cmd in cmds {
            let bytes = serialize_cmd(&cmd);
            let line = lines(&bytes)[0];
            assert_eq!(Command::parse(line).unwrap(), cmd);
        }
    }

    #[test]
    fn status_wire_format() {
        let mut buf = BytesMut::new();
        Status::Value(1234).serialize(&mut buf);
        Status::Started(1234).serialize(&mut buf);
        Status::Error("no such\nnode".into()).serialize(&mut buf);
        assert_eq!(&buf[..], b"ok 1234\nok 1234 started\nerror no such node\n");
    }

    #[test]
    fn full_record_lines() {
        let record = NodeRecord {
            key: NodeKey::new("g", "c", "n").to_owned_key(),
            details: Some(NodeDetails {
                pid: 77,
                program: "keel-data".into(),
                started_at: 1_700_000_000,
            }),
        };
        let mut buf = BytesMut::new();
        record.serialize(&mut buf);
        assert_eq!(
            lines(&buf),
            vec![
                &b"list node g c n full"[..],
                b"pid 77",
                b"program keel-data",
                b"start time 1700000000",
            ]
        );
    }

    #[test]
    fn payload_line_split() {
        assert!(payload_lines(b"").is_empty());
        assert_eq!(payload_lines(b"a=1\nb=2\n"), vec![&b"a=1"[..], b"b=2"]);
        assert_eq!(payload_lines(b"a=1\nb=2"), vec![&b"a=1"[..], b"b=2"]);
        assert_eq!(payload_lines(b"a=1\n\nb=2\n").len(), 3);
    }
}
