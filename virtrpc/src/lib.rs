//! Client-side RPC transport core for a remote hypervisor-management
//! client: transport establishment, authentication handshake, message
//! framing, the multi-threaded "passing the buck" dispatch loop, stream
//! multiplexing, asynchronous event delivery, and an optional per-message
//! security layer.
//!
//! The several hundred individual remote-procedure wrappers that sit on
//! top of [`Connection::call`] are out of scope for this crate; they are
//! assumed to be generated from a protocol definition elsewhere, the same
//! way the surrounding `nfs3`/`rpcbind` binaries sit on top of
//! `rpc_protocol` in the sibling crates this workspace is descended from.

pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod framer;
pub mod proto;
pub mod registry;
pub mod security;
pub mod streams;
pub mod transport;
pub mod uri;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use auth::{CredentialCallback, CredentialKind, NoCredentials, StaticCredentials};
pub use connection::Connection;
pub use error::{Error, Result};
pub use events::{Event, EventLoopHandle, NullEventLoopHandle};
pub use uri::{ConnectConfig, TransportKind};
