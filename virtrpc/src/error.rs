//! Error taxonomy for the RPC core.
//!
//! Mirrors the seven kinds in the error-handling design: configuration,
//! transport, authentication, protocol, remote, stream and resource errors.
//! `Transport` and `Protocol` are fatal to the whole `Connection`; `Remote`
//! and `Stream` are per-operation.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// The single public error type returned by fallible operations in this
/// crate.
#[derive(Debug)]
pub enum Error {
    /// Malformed URI, unknown transport, missing required query parameter.
    Configuration(String),

    /// DNS, connect, socket creation, TLS handshake, peer-closed, HUP.
    /// Fatal: poisons the owning `Connection`.
    Transport(String),

    /// Mechanism unsupported by server, mechanism rejected, missing
    /// credential callback, insufficient negotiated strength.
    Authentication(String),

    /// Short/oversized frame, unknown program/version/type, serial with no
    /// matching slot, reply procedure mismatch. Fatal like `Transport`.
    Protocol(String),

    /// An ERROR-status reply decoded from the server for one call. Does not
    /// poison the connection.
    Remote { procedure: u32, message: String },

    /// Decoded from a STREAM ERROR frame; attached to the stream.
    Stream(String),

    /// Allocation failure, mutex/condvar init failure.
    Resource(String),

    /// Wraps the underlying `io::Error` for transparent `?` use; callers
    /// that need a `TransportError` should wrap it explicitly instead.
    Io(io::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Error::Authentication(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn remote(procedure: u32, message: impl Into<String>) -> Self {
        Error::Remote {
            procedure,
            message: message.into(),
        }
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Error::Resource(msg.into())
    }

    /// Whether this error, raised by the dispatcher, must poison the whole
    /// connection rather than just the one call or stream that saw it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Protocol(_) | Error::Io(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Error::Transport(msg) => write!(f, "transport error: {msg}"),
            Error::Authentication(msg) => write!(f, "authentication error: {msg}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Remote { procedure, message } => {
                write!(f, "remote error (procedure {procedure}): {message}")
            }
            Error::Stream(msg) => write!(f, "stream error: {msg}"),
            Error::Resource(msg) => write!(f, "resource error: {msg}"),
            Error::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        match err {
            // Certificate chain/hostname verification failures are an
            // authentication outcome (spec.md §8 scenario 6: hostname
            // mismatch must surface as AuthenticationError), not a
            // transport-level failure.
            rustls::Error::InvalidCertificate(_) => Error::Authentication(format!("tls: {err}")),
            other => Error::Transport(format!("tls: {other}")),
        }
    }
}
