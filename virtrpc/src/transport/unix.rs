//! UNIX domain socket transport: connects to a named path, or, when the
//! path starts with `@`, to a Linux abstract socket (leading NUL byte, no
//! filesystem entry). On refusal, optionally spawns a local daemon and
//! retries with linear backoff.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};

use super::Transport;
use crate::error::{Error, Result};
use crate::uri::ConnectConfig;

const MAX_CONNECT_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    pub fn connect(config: &ConnectConfig) -> Result<Self> {
        let path = socket_path(config)?;

        match connect_once(&path) {
            Ok(stream) => return Self::from_stream(stream),
            Err(e) if config.autostart && is_refused(&e) => {
                warn!("unix socket {path} refused connection, attempting to spawn daemon");
                spawn_daemon(config)?;
            }
            Err(e) => return Err(e),
        }

        let mut last_err = None;
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            thread::sleep(RETRY_BACKOFF * attempt);
            match connect_once(&path) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::transport("failed to connect to unix socket")))
    }

    fn from_stream(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(UnixTransport { stream })
    }
}

fn socket_path(config: &ConnectConfig) -> Result<String> {
    if let Some(socket) = &config.socket {
        return Ok(socket.clone());
    }
    if let Some(path) = &config.path {
        return Ok(path.clone());
    }
    Err(Error::configuration("unix transport requires a socket path"))
}

fn is_refused(err: &Error) -> bool {
    matches!(err, Error::Transport(msg) if msg.contains("refused") || msg.contains("No such file"))
}

fn connect_once(path: &str) -> Result<UnixStream> {
    if let Some(name) = path.strip_prefix('@') {
        connect_abstract(name)
    } else {
        UnixStream::connect(path).map_err(|e| Error::transport(format!("connecting to {path}: {e}")))
    }
}

/// Abstract sockets (Linux-only) are addressed with a leading NUL byte.
/// `std::os::unix::net` cannot express this directly, so the connection is
/// established with `nix` and handed back as a standard `UnixStream`.
fn connect_abstract(name: &str) -> Result<UnixStream> {
    let fd: OwnedFd = socket::socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)
        .map_err(|e| Error::transport(format!("creating unix socket: {e}")))?;

    let addr = UnixAddr::new_abstract(name.as_bytes())
        .map_err(|e| Error::configuration(format!("invalid abstract socket name {name:?}: {e}")))?;

    socket::connect(fd.as_raw_fd(), &addr)
        .map_err(|e| Error::transport(format!("connecting to abstract socket @{name}: {e}")))?;

    debug!("connected to abstract unix socket @{name}");
    Ok(unsafe { UnixStream::from_raw_fd(fd.into_raw_fd()) })
}

/// Spawn the local daemon binary (overridden by `LIBVIRTD_PATH`) with an
/// idle-exit timeout, then return; the caller retries the connect.
fn spawn_daemon(config: &ConnectConfig) -> Result<()> {
    let path = config.libvirtd_path.as_deref().unwrap_or("/usr/sbin/libvirtd");

    Command::new(path)
        .arg("--timeout")
        .arg("30")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::transport(format!("spawning local daemon {path}: {e}")))?;

    Ok(())
}

impl Transport for UnixTransport {
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
        // The kernel enforces that only local peers can connect; treated
        // as secure per spec.md §4.2.
        true
    }

    fn close(&mut self) -> Result<()> {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }
}
