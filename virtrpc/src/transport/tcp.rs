//! Plain TCP transport: resolve the server name, try each address in turn,
//! disable Nagle's algorithm, and hand back a non-blocking pipe.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use log::debug;

use super::Transport;
use crate::error::{Error, Result};
use crate::uri::ConnectConfig;

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(config: &ConnectConfig) -> Result<Self> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| Error::configuration("tcp transport requires a host"))?;
        let port = config.port.unwrap_or(16509);

        let stream = connect_first_reachable(host, port)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;

        debug!("tcp transport connected to {host}:{port}");
        Ok(TcpTransport { stream })
    }

    /// Wrap an already-connected stream (used by the TLS transport, which
    /// layers on top of a plain TCP connection).
    pub(super) fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(TcpTransport { stream })
    }

    pub(super) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Try every address the name resolves to, in order, returning the first
/// one that accepts a connection.
pub(super) fn connect_first_reachable(host: &str, port: u16) -> Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::transport(format!("resolving {host}:{port}: {e}")))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(Error::transport(format!(
        "could not connect to any address for {host}:{port}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_else(|| "no addresses resolved".into())
    )))
}

impl Transport for TcpTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use io::Read;
        self.stream.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use io::Write;
        self.stream.write(buf)
    }

    fn pollable_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }
}
