//! External-command transport: launches a user-supplied command connected
//! via a socket pair, collects stderr on a separate pipe. Also the basis
//! for the SSH convenience wrapper, which synthesizes a `ssh ... netcat`
//! command line.
//!
//! Grounded on `rpc_protocol::pipe`'s use of `nix::sys::socket::socketpair`
//! for an in-process duplex byte pipe, generalized here to wrap a real
//! child process instead of a same-process test peer.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};

use log::debug;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};

use super::Transport;
use crate::error::{Error, Result};
use crate::uri::ConnectConfig;

pub struct ExternalTransport {
    child: Child,
    socket: UnixStream,
    stderr: Option<std::process::ChildStderr>,
    stderr_tail: Vec<u8>,
}

impl ExternalTransport {
    /// Launch `command` with `args`, connected to our end of a freshly
    /// created socket pair.
    pub fn spawn(command: &str, args: &[String]) -> Result<Self> {
        let (parent, child_end) =
            socket::socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
                .map_err(|e| Error::transport(format!("creating socketpair: {e}")))?;

        let child_fd: OwnedFd = child_end;
        let parent_fd: OwnedFd = parent;

        let child_stdio = Stdio::from(dup_for_stdio(&child_fd)?);
        let child_stdio_out = Stdio::from(dup_for_stdio(&child_fd)?);

        debug!("spawning external transport command: {command} {args:?}");

        let mut child = Command::new(command)
            .args(args)
            .stdin(child_stdio)
            .stdout(child_stdio_out)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::transport(format!("spawning {command}: {e}")))?;

        let stderr = child.stderr.take();

        let parent_raw = parent_fd.into_raw_fd();
        let socket = unsafe { UnixStream::from_raw_fd(parent_raw) };
        socket.set_nonblocking(true)?;

        if let Some(stderr) = &stderr {
            set_nonblocking(stderr.as_raw_fd())?;
        }

        Ok(ExternalTransport {
            child,
            socket,
            stderr,
            stderr_tail: Vec::new(),
        })
    }

    pub fn connect(config: &ConnectConfig) -> Result<Self> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| Error::configuration("ext transport requires a command= query parameter"))?;
        Self::spawn(command, &[])
    }

    /// Synthesize `ssh [-p PORT] [-l USER] [-T ...] HOST netcat -U SOCKET`.
    pub fn connect_ssh(config: &ConnectConfig) -> Result<Self> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| Error::configuration("ssh transport requires a host"))?;
        let socket_path = config
            .socket
            .as_deref()
            .unwrap_or("/var/run/libvirt/libvirt-sock");
        let netcat = config.netcat.as_deref().unwrap_or("nc");
        let command = config.command.as_deref().unwrap_or("ssh");

        let mut args = Vec::new();
        if let Some(port) = config.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(user) = &config.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        if config.no_tty {
            args.push("-T".to_string());
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        args.push(host.to_string());
        args.push(netcat.to_string());
        args.push("-U".to_string());
        args.push(socket_path.to_string());

        Self::spawn(command, &args)
    }

    /// Drain whatever the child has written to stderr since the last call,
    /// without blocking. Used to enrich a fatal `Error::Transport` when the
    /// child exits abruptly (spec.md §9, "stderr is drained into the final
    /// error message").
    fn drain_stderr(&mut self) {
        if let Some(stderr) = &mut self.stderr {
            let mut buf = [0u8; 4096];
            loop {
                match stderr.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => self.stderr_tail.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
    }

    pub fn stderr_tail(&self) -> String {
        String::from_utf8_lossy(&self.stderr_tail).into_owned()
    }
}

fn dup_for_stdio(fd: &OwnedFd) -> Result<OwnedFd> {
    nix::unistd::dup(fd).map_err(|e| Error::transport(format!("dup: {e}")))
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::transport(format!("fcntl(F_GETFL): {e}")))?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::transport(format!("fcntl(F_SETFL): {e}")))?;
    Ok(())
}

impl Transport for ExternalTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use io::Read as _;
        let result = self.socket.read(buf);
        if let Ok(0) = result {
            self.drain_stderr();
        }
        result
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use io::Write as _;
        self.socket.write(buf)
    }

    fn pollable_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn stderr_fd(&self) -> Option<RawFd> {
        self.stderr.as_ref().map(|s| s.as_raw_fd())
    }

    fn is_secure(&self) -> bool {
        // Security is delegated to (and not attested by) the child
        // command; report "not secure" regardless of what it tunnels.
        false
    }

    fn close(&mut self) -> Result<()> {
        self.drain_stderr();
        let _ = self.child.kill();
        let _ = self.child.wait();
        Ok(())
    }
}
