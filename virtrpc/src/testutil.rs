//! Fake-peer test harness: a socketpair-based `Transport` plus a plain,
//! blocking `UnixStream` handle for driving the other end from test code.
//!
//! Grounded on `rpc_protocol::pipe::{Endpoint, pipe}`, which does the same
//! socketpair(2) trick for testing `rpc_protocol`'s client/server halves
//! against each other without a real network.

use std::io;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::error::Result;
use crate::transport::Transport;

/// The client-facing half of a test socketpair, implementing `Transport`
/// the same way `transport::unix::UnixTransport` does for a real UNIX
/// socket.
pub struct PairTransport {
    stream: UnixStream,
}

impl PairTransport {
    fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(PairTransport { stream })
    }
}

impl Transport for PairTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn pollable_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Build a connected pair: the boxed `Transport` half for the code under
/// test, and a blocking `UnixStream` for test code to act as the fake
/// server peer (read CALL/STREAM frames, write REPLY/STREAM/MESSAGE
/// frames back).
pub fn transport_pair() -> io::Result<(Box<dyn Transport>, UnixStream)> {
    let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let client_stream = unsafe { UnixStream::from_raw_fd(a.into_raw_fd()) };
    let server_stream = unsafe { UnixStream::from_raw_fd(b.into_raw_fd()) };

    let transport = PairTransport::new(client_stream)?;
    Ok((Box::new(transport), server_stream))
}

/// Read exactly one frame off `peer` (used by the fake-server side of a
/// test) and return its decoded header plus payload.
pub fn read_frame(peer: &mut UnixStream) -> io::Result<(crate::framer::Header, Vec<u8>)> {
    let mut length_bytes = [0u8; crate::framer::LENGTH_SIZE];
    peer.read_exact(&mut length_bytes)?;
    let total = crate::framer::decode_length(&length_bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))? as usize;

    let mut rest = vec![0u8; total - crate::framer::LENGTH_SIZE];
    peer.read_exact(&mut rest)?;

    let header = crate::framer::decode_header(&rest[..crate::framer::HEADER_SIZE])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let payload = rest[crate::framer::HEADER_SIZE..].to_vec();
    Ok((header, payload))
}

/// Write a full frame to `peer` (used by the fake-server side of a test).
pub fn write_frame(peer: &mut UnixStream, frame: &[u8]) -> io::Result<()> {
    peer.write_all(frame)
}
