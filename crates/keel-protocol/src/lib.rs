//! keel-protocol: line-oriented control protocol.
//!
//! Nodes, process controllers and clients talk to each other with one
//! directive per line: a fixed literal, optionally followed by
//! space-separated positional arguments whose types are implied by the
//! literal. There are no type tags and no capability negotiation.
//!
//! This crate is purely synchronous. It validates and classifies lines
//! that the caller has already framed out of its receive buffer, and it
//! serializes replies straight into a `BytesMut`.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use keel_protocol::{find_line, Command, NodeKey, Status};
//!
//! let input = b"start node gridA clusterB node3\r\n";
//! let (len, consumed) = find_line(input).unwrap();
//! assert_eq!(consumed, input.len());
//!
//! let cmd = Command::parse(&input[..len]).unwrap();
//! assert_eq!(cmd, Command::Start(NodeKey::new("gridA", "clusterB", "node3")));
//!
//! let mut buf = BytesMut::new();
//! Status::Value(4711).serialize(&mut buf);
//! assert_eq!(&buf[..], b"ok 4711\n");
//! ```

pub mod command;
pub mod error;
pub mod parse;
mod serialize;
pub mod session;
pub mod types;

pub use command::{literal, Command};
pub use error::ProtocolError;
pub use parse::{
    check_literal, check_literal_with_int, check_literal_with_int_list, check_literal_with_text,
    check_literal_with_words, find_line,
};
pub use serialize::{payload_lines, write_literal, write_payload, LINE_END};
pub use session::{SessionState, StateMachine};
pub use types::{
    ClusterLine, ConfigHeader, CpuInfo, DiskInfo, MemInfo, NodeDetails, NodeKey, NodeRecord,
    NodeRole, OwnedNodeKey, Status,
};
