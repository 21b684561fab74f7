//! Polymorphic byte pipe over TLS, plain TCP, UNIX, or an external command
//! (spec.md §3/§4.2).
//!
//! Re-expressed, per spec.md §9's design note, as a sum type over `Transport`
//! variants rather than preprocessor branches on one struct: `AnyTransport`
//! enumerates the four concrete implementations and forwards the shared
//! capability set (non-blocking read/write, a pollable fd, an optional
//! stderr fd, close) to whichever one is active.

pub mod external;
pub mod tcp;
pub mod tls;
pub mod unix;

use std::io;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::uri::{ConnectConfig, TransportKind};

/// The shared capability set every transport variant exposes.
pub trait Transport: Send {
    /// Non-blocking read. `Ok(0)` means EOF (peer closed cleanly); a
    /// `WouldBlock` io error means "try again once the fd is readable" and
    /// must be translated by the caller, not treated as EOF.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write. A `WouldBlock` io error means "try again once
    /// the fd is writable".
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// File descriptor the dispatcher polls for readiness.
    fn pollable_fd(&self) -> RawFd;

    /// External/SSH transports additionally expose the child's stderr so
    /// failures can be enriched with its last output.
    fn stderr_fd(&self) -> Option<RawFd> {
        None
    }

    /// Whether this transport has ciphertext buffered internally that
    /// still needs a writable fd to flush (only meaningful for
    /// `SecuredTransport`; plain transports never buffer, so the default
    /// is `false`).
    fn wants_write(&self) -> bool {
        false
    }

    /// Whether this transport is considered secure (TLS, or a local UNIX
    /// socket where the kernel enforces peer identity). External/SSH
    /// transports report `false` regardless of what they tunnel, per
    /// spec.md §4.2.
    fn is_secure(&self) -> bool;

    /// Tear down the transport, reaping any child process.
    fn close(&mut self) -> Result<()>;
}

/// Sum type over the concrete transport implementations.
pub enum AnyTransport {
    Tls(tls::TlsTransport),
    Tcp(tcp::TcpTransport),
    Unix(unix::UnixTransport),
    External(external::ExternalTransport),
}

impl AnyTransport {
    /// Establish a transport per `config.transport`, following the URI
    /// dispatch table in spec.md §4.2. SSH is a convenience wrapper around
    /// `External` that synthesizes the `ssh ... netcat -U SOCKET` command
    /// line.
    pub fn connect(config: &ConnectConfig) -> Result<Self> {
        match config.transport {
            TransportKind::Tls => Ok(AnyTransport::Tls(tls::TlsTransport::connect(config)?)),
            TransportKind::Tcp => Ok(AnyTransport::Tcp(tcp::TcpTransport::connect(config)?)),
            TransportKind::Unix => Ok(AnyTransport::Unix(unix::UnixTransport::connect(config)?)),
            TransportKind::Ext => Ok(AnyTransport::External(external::ExternalTransport::connect(config)?)),
            TransportKind::Ssh => Ok(AnyTransport::External(external::ExternalTransport::connect_ssh(config)?)),
        }
    }
}

impl Transport for AnyTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            AnyTransport::Tls(t) => t.try_read(buf),
            AnyTransport::Tcp(t) => t.try_read(buf),
            AnyTransport::Unix(t) => t.try_read(buf),
            AnyTransport::External(t) => t.try_read(buf),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            AnyTransport::Tls(t) => t.try_write(buf),
            AnyTransport::Tcp(t) => t.try_write(buf),
            AnyTransport::Unix(t) => t.try_write(buf),
            AnyTransport::External(t) => t.try_write(buf),
        }
    }

    fn pollable_fd(&self) -> RawFd {
        match self {
            AnyTransport::Tls(t) => t.pollable_fd(),
            AnyTransport::Tcp(t) => t.pollable_fd(),
            AnyTransport::Unix(t) => t.pollable_fd(),
            AnyTransport::External(t) => t.pollable_fd(),
        }
    }

    fn stderr_fd(&self) -> Option<RawFd> {
        match self {
            AnyTransport::External(t) => t.stderr_fd(),
            _ => None,
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            AnyTransport::Tls(t) => t.wants_write(),
            AnyTransport::Tcp(t) => t.wants_write(),
            AnyTransport::Unix(t) => t.wants_write(),
            AnyTransport::External(t) => t.wants_write(),
        }
    }

    fn is_secure(&self) -> bool {
        match self {
            AnyTransport::Tls(t) => t.is_secure(),
            AnyTransport::Tcp(t) => t.is_secure(),
            AnyTransport::Unix(t) => t.is_secure(),
            AnyTransport::External(t) => t.is_secure(),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            AnyTransport::Tls(t) => t.close(),
            AnyTransport::Tcp(t) => t.close(),
            AnyTransport::Unix(t) => t.close(),
            AnyTransport::External(t) => t.close(),
        }
    }
}

/// Translate a `WouldBlock` io error into "no bytes moved", and any other
/// error into a fatal `Error::Transport`.
pub fn would_block_is_zero(result: io::Result<usize>) -> Result<usize> {
    match result {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(Error::transport(e.to_string())),
    }
}
