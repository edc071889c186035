//! keel-net: connection layer for the keel control protocol.
//!
//! Establishes TCP connections (client connect with bounded retry,
//! server listen and one-shot accept) and wraps each socket in a
//! [`Connection`] whose read and write buffering lives in pages borrowed
//! from a shared [`keel_core::PagePool`]. [`ControlClient`] speaks the
//! request side of the protocol on top of it.

pub mod client;
pub mod connection;
pub mod error;
pub mod socket;

pub use client::{ControlClient, FetchedConfig, ListControl, StartOutcome};
pub use connection::Connection;
pub use error::ConnectionError;
pub use socket::{
    connect_client, listen_server, Listener, RetryPolicy, DEFAULT_BACKLOG,
    DEFAULT_CONNECT_ATTEMPTS,
};
