//! Connection & ConnectionFactory (spec.md §3 "Connection", §4.4, §6).
//! Ties Transport, the Authenticator, CallRegistry, StreamRegistry, and
//! EventQueue together behind the single mutex spec.md §5 requires, and
//! exposes the public `call`/`open_stream` API that generated per-procedure
//! wrappers (out of scope here) would sit on top of.
//!
//! The blocking single-mutex-plus-condvar shape is grounded on
//! `rpc_protocol::client::do_rpc_call`, generalized from "one blocking
//! stream, one caller" to "one Connection, many caller threads sharing the
//! buck" per spec.md §4.4.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Condvar, Mutex};

use log::{debug, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{pipe, read as nix_read, write as nix_write};

use crate::auth::{Authenticator, CredentialCallback};
use crate::dispatch;
use crate::error::{Error, Result};
use crate::events::{Event, EventLoopHandle, EventQueue, NullEventLoopHandle};
use crate::framer::{self, Header, MessageType, Status};
use crate::proto::{PROGRAM, PROTOCOL_VERSION};
use crate::registry::{CallRegistry, CallSlot};
use crate::security::SecuredTransport;
use crate::streams::{StreamFree, StreamInvoke, StreamRegistry};
use crate::transport::{AnyTransport, Transport};
use crate::uri::ConnectConfig;

/// Interval, in milliseconds, of the readiness timer `on_event` registers
/// through the `EventLoopHandle` (spec.md §4.6: "a short-interval timer").
const STREAM_EVENT_POLL_INTERVAL_MS: u64 = 50;

/// Everything guarded by the Connection's single mutex (spec.md §5: "A
/// single mutex guards the Connection's entire mutable state: both
/// registries, the receive buffer, transport state, and SecurityLayer
/// buffers").
pub(crate) struct ConnectionState {
    pub transport: Box<dyn Transport>,
    pub calls: CallRegistry,
    pub streams: StreamRegistry,
    pub events: EventQueue,
    pub recv_buffer: Vec<u8>,
    pub next_serial: u32,
    /// Set once the Transport or the protocol itself is unrecoverably
    /// broken (spec.md §7: Transport/Protocol/Io errors are "fatal to the
    /// Connection").
    pub poison: Option<Error>,
    /// Server MESSAGE frames received before the Authenticator has
    /// finished are dropped rather than queued (spec.md §4.5: "If received
    /// while the connection is still opening, ignore").
    pub opening: bool,
    pub wakeup_read: OwnedFd,
    pub wakeup_write: OwnedFd,
    pub event_loop: Box<dyn EventLoopHandle>,
}

impl ConnectionState {
    pub fn is_poisoned(&self) -> bool {
        self.poison.is_some()
    }

    pub fn next_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        serial
    }
}

pub(crate) struct Inner {
    pub state: Mutex<ConnectionState>,
    pub cvar: Condvar,
}

/// A reference-counted handle to one transport connection (spec.md §3:
/// "Reference-counted by sub-driver opens; secondary drivers share the same
/// Connection").
#[derive(Clone)]
pub struct Connection {
    inner: std::sync::Arc<Inner>,
}

impl Connection {
    /// Establish the transport, run the Authenticator, and return a ready
    /// Connection. Equivalent to spec.md's ConnectionFactory.
    pub fn open(uri: &str, credentials: &dyn CredentialCallback) -> Result<Self> {
        Self::open_with_event_loop(uri, credentials, Box::new(NullEventLoopHandle))
    }

    pub fn open_with_event_loop(
        uri: &str,
        credentials: &dyn CredentialCallback,
        event_loop: Box<dyn EventLoopHandle>,
    ) -> Result<Self> {
        let config = ConnectConfig::parse(uri)?;
        debug!("connecting to {:?} via {:?}", config.host, config.transport);

        let transport: Box<dyn Transport> = Box::new(AnyTransport::connect(&config)?);
        let preferred_auth = config.auth.clone();
        Self::from_transport(transport, preferred_auth.as_deref(), credentials, event_loop)
    }

    /// The common core of `open`/`open_with_event_loop`: wire up a
    /// already-established Transport, run the Authenticator, and return a
    /// ready Connection. Exposed directly so tests can exercise the
    /// dispatcher against a fake in-process peer instead of a real
    /// network/daemon.
    pub fn from_transport(
        transport: Box<dyn Transport>,
        preferred_auth: Option<&str>,
        credentials: &dyn CredentialCallback,
        event_loop: Box<dyn EventLoopHandle>,
    ) -> Result<Self> {
        let (read_fd, write_fd) = pipe().map_err(|e| Error::resource(format!("wakeup pipe: {e}")))?;
        set_nonblocking(read_fd.as_raw_fd())?;

        let state = ConnectionState {
            transport,
            calls: CallRegistry::new(),
            streams: StreamRegistry::new(),
            events: EventQueue::new(),
            recv_buffer: Vec::new(),
            next_serial: 1,
            poison: None,
            opening: true,
            wakeup_read: read_fd,
            wakeup_write: write_fd,
            event_loop,
        };

        let connection = Connection {
            inner: std::sync::Arc::new(Inner { state: Mutex::new(state), cvar: Condvar::new() }),
        };

        let transport_is_secure = connection.inner.state.lock().unwrap().transport.is_secure();

        let codec = {
            let conn = connection.clone();
            let mut call_fn = move |procedure: u32, payload: &[u8]| conn.call_raw(procedure, payload, true);
            Authenticator::negotiate(&mut call_fn, transport_is_secure, preferred_auth, credentials)?
        };

        {
            let mut guard = connection.inner.state.lock().unwrap();
            if let Some(codec) = codec {
                let old = std::mem::replace(&mut guard.transport, Box::new(NullTransportPlaceholder));
                guard.transport = Box::new(SecuredTransport::new(old, codec));
            }
            guard.opening = false;
        }

        Ok(connection)
    }

    /// Issue a synchronous RPC and block until it completes, fails, or the
    /// Connection is torn down. This is the primitive every generated
    /// per-procedure wrapper (out of scope) sits on top of.
    pub fn call(&self, procedure: u32, payload: &[u8]) -> Result<Vec<u8>> {
        self.call_raw(procedure, payload, true)
    }

    /// Open a new multiplexed data stream (spec.md §4.6). The returned
    /// handle owns the stream's serial for its lifetime; dropping it
    /// without calling `finish`/`abort` leaves the stream registered until
    /// the Connection itself closes.
    pub fn open_stream(&self, procedure: u32) -> Result<StreamHandle> {
        let mut guard = self.inner.state.lock().unwrap();
        if let Some(err) = &guard.poison {
            return Err(clone_fatal(err));
        }
        let serial = guard.next_serial();
        guard.streams.open(serial, procedure)?;
        drop(guard);
        Ok(StreamHandle { connection: self.clone(), serial, procedure })
    }

    fn call_raw(&self, procedure: u32, payload: &[u8], want_reply: bool) -> Result<Vec<u8>> {
        let serial = {
            let mut guard = self.inner.state.lock().unwrap();
            if let Some(err) = &guard.poison {
                return Err(clone_fatal(err));
            }
            guard.next_serial()
        };
        let header = Header {
            program: PROGRAM,
            version: PROTOCOL_VERSION,
            procedure,
            message_type: MessageType::Call,
            serial,
            status: Status::Ok,
        };
        let outbound = framer::encode_frame(header, payload)?;
        self.run_slot(CallSlot::new(serial, PROGRAM, procedure, outbound, want_reply))
    }

    /// Fire-and-forget send on an existing serial, used by stream CONTINUE
    /// frames (spec.md §4.4: "WAIT_TX -> COMPLETE upon last-byte write").
    pub(crate) fn send_stream_frame(&self, procedure: u32, serial: u32, status: Status, payload: &[u8]) -> Result<()> {
        let header = Header {
            program: PROGRAM,
            version: PROTOCOL_VERSION,
            procedure,
            message_type: MessageType::Stream,
            serial,
            status,
        };
        let outbound = framer::encode_frame(header, payload)?;
        // `finish` awaits confirmation (spec.md §4.6); everything else is
        // fire-and-forget.
        let want_reply = status == Status::Ok;
        self.run_slot(CallSlot::new(serial, PROGRAM, procedure, outbound, want_reply)).map(|_| ())
    }

    /// Drive the dispatcher on behalf of a wait-only call sharing a
    /// stream's serial, used by `StreamHandle::recv`'s blocking path
    /// (spec.md §4.6).
    pub(crate) fn wait_for_stream_activity(&self, serial: u32, procedure: u32) -> Result<()> {
        self.run_slot(CallSlot::new_wait_only(serial, PROGRAM, procedure)).map(|_| ())
    }

    /// Register `slot`, become or wait for the dispatcher, and return the
    /// slot's result once it is COMPLETE or ERROR. This is the shared core
    /// behind ordinary calls, fire-and-forget stream sends, and wait-only
    /// stream reads.
    fn run_slot(&self, slot: CallSlot) -> Result<Vec<u8>> {
        let serial = slot.serial;
        let mut guard = self.inner.state.lock().unwrap();

        let was_empty = guard.calls.is_empty();
        guard.calls.register(slot);

        if !was_empty {
            wake_dispatcher(&guard);
            guard = self
                .inner
                .cvar
                .wait_while(guard, |state| {
                    state.poison.is_none()
                        && !state.calls.is_head(serial)
                        && !state.calls.find_mut(serial).map(|s| s.is_done()).unwrap_or(true)
                })
                .unwrap();
        }

        if let Some(err) = &guard.poison {
            if !guard.calls.find_mut(serial).map(|s| s.is_done()).unwrap_or(false) {
                return Err(clone_fatal(err));
            }
        }

        if !guard.calls.find_mut(serial).map(|s| s.is_done()).unwrap_or(false) {
            guard = dispatch::run(&self.inner, guard, serial);
        }

        let slot = guard.calls.remove(serial).expect("our own slot must still be present when done");
        // Unconditional: removing our own slot may have promoted a new head,
        // and that waiter's wait_while predicate only re-checks on a signal
        // (a dropped MutexGuard alone does not wake it).
        self.inner.cvar.notify_all();
        drop(guard);

        match slot.result {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(e)) => Err(e),
            None => Err(Error::protocol("call slot completed without a result")),
        }
    }

    /// Drain and deliver queued server-push events to `handler`, per
    /// spec.md §4.7. Meant to be invoked from whatever timer the embedding
    /// `EventLoopHandle` manages; released from the Connection lock before
    /// `handler` runs so a callback issuing another RPC cannot deadlock.
    pub fn dispatch_events(&self, mut handler: impl FnMut(Event)) {
        loop {
            let next = {
                let mut guard = self.inner.state.lock().unwrap();
                guard.events.pop()
            };
            match next {
                Some(event) => handler(event),
                None => break,
            }
        }
    }

    /// Register (replacing any existing) a readiness callback for a
    /// stream's serial, and arm the short-interval timer that drives it
    /// (spec.md §4.6: `on_event(slot, mask, cb)`).
    pub(crate) fn stream_on_event(&self, serial: u32, mask: u32, invoke: StreamInvoke, free: Option<StreamFree>) -> Result<()> {
        let mut guard = self.inner.state.lock().unwrap();
        let timer_id = guard.event_loop.add_timeout(STREAM_EVENT_POLL_INTERVAL_MS);
        guard.streams.on_event(serial, mask, timer_id, invoke, free)
    }

    pub(crate) fn stream_remove_event(&self, serial: u32) {
        let mut guard = self.inner.state.lock().unwrap();
        if let Some(timer_id) = guard.streams.remove_event(serial) {
            guard.event_loop.remove_timeout(timer_id);
        }
    }

    /// Fire every stream readiness callback currently due, one at a time,
    /// each released from the Connection lock before it runs (spec.md
    /// §4.6: "the callback runs with the Connection lock released").
    /// Meant to be invoked from whatever fires the timer `stream_on_event`
    /// registers, the same way `dispatch_events` is driven for MESSAGE
    /// events.
    pub fn dispatch_stream_events(&self) {
        loop {
            let due = {
                let mut guard = self.inner.state.lock().unwrap();
                guard.streams.next_due_callback()
            };
            let Some((serial, gen, mask, mut invoke)) = due else {
                break;
            };
            invoke(serial, mask);
            let mut guard = self.inner.state.lock().unwrap();
            guard.streams.return_callback(serial, gen, invoke);
        }
    }

    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.state.lock().unwrap();
        guard.calls.fail_all(|| Error::transport("connection closed"));
        guard.streams.abort_all(|| Error::transport("connection closed"));
        guard.poison = Some(Error::transport("connection closed"));
        let result = guard.transport.close();
        drop(guard);
        self.inner.cvar.notify_all();
        result
    }

    pub(crate) fn inner(&self) -> &std::sync::Arc<Inner> {
        &self.inner
    }
}

/// A handle to one multiplexed stream, returned by [`Connection::open_stream`]
/// (spec.md §4.6). Outbound data goes through `send`, and the upload is
/// closed off with exactly one of `finish`/`abort`.
pub struct StreamHandle {
    connection: Connection,
    serial: u32,
    procedure: u32,
}

impl StreamHandle {
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Register a readiness callback, fired with `(serial, matched_mask)`
    /// whenever `mask` matches current readiness (spec.md §4.6). `free`,
    /// if given, runs exactly once: either when the callback is replaced
    /// or removed, or when the stream itself closes.
    pub fn on_event(&self, mask: u32, callback: impl FnMut(u32, u32) + Send + 'static, free: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        self.connection.stream_on_event(self.serial, mask, Box::new(callback), free)
    }

    /// Unregister this stream's readiness callback, if any.
    pub fn remove_event(&self) {
        self.connection.stream_remove_event(self.serial);
    }

    /// Send one CONTINUE packet. Fire-and-forget: the outbound CallSlot
    /// completes as soon as the bytes are written, with no reply expected.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        self.connection.send_stream_frame(self.procedure, self.serial, Status::Continue, bytes)
    }

    /// Send the closing OK packet and block for the server's confirmation
    /// (spec.md §4.6: the OK frame, unlike CONTINUE, is a synchronous call
    /// sharing the stream's serial).
    pub fn finish(&self) -> Result<()> {
        self.connection.send_stream_frame(self.procedure, self.serial, Status::Ok, &[])
    }

    /// Abort the stream with an ERROR packet. Fire-and-forget, like `send`.
    pub fn abort(&self, message: &str) -> Result<()> {
        self.connection.send_stream_frame(self.procedure, self.serial, Status::Error, message.as_bytes())
    }

    /// Read up to `buf.len()` bytes of buffered incoming data. If nothing is
    /// buffered and `blocking` is true, drives the dispatcher with a
    /// wait-only call sharing the stream's serial until a STREAM packet
    /// arrives (spec.md §4.6); if `blocking` is false, returns immediately
    /// with `Error::Stream` instead ("non-blocking recv returns 'would
    /// block' rather than driving the dispatcher").
    pub fn recv(&self, buf: &mut [u8], blocking: bool) -> Result<usize> {
        loop {
            let mut guard = self.connection.inner().state.lock().unwrap();
            if let Some(err) = &guard.poison {
                return Err(clone_fatal(err));
            }
            let Some(slot) = guard.streams.get_mut(self.serial) else {
                return Err(Error::protocol(format!("stream {} is no longer registered", self.serial)));
            };
            let has_activity = slot.buffered_len() > 0 || !slot.is_open();
            if has_activity {
                let pending_error = slot.error.as_ref().map(err_clone);
                let data = slot.take(buf.len());
                if let Some(err) = pending_error {
                    if data.is_empty() {
                        guard.streams.close(self.serial);
                        return Err(err);
                    }
                }
                let n = data.len();
                buf[..n].copy_from_slice(&data);
                return Ok(n);
            }
            drop(guard);

            if !blocking {
                return Err(Error::stream("recv would block"));
            }

            self.connection.wait_for_stream_activity(self.serial, self.procedure)?;
        }
    }
}

fn err_clone(err: &Error) -> Error {
    match err {
        Error::Transport(m) => Error::Transport(m.clone()),
        Error::Protocol(m) => Error::Protocol(m.clone()),
        Error::Stream(m) => Error::Stream(m.clone()),
        other => Error::Stream(other.to_string()),
    }
}

fn clone_fatal(err: &Error) -> Error {
    match err {
        Error::Transport(m) => Error::Transport(m.clone()),
        Error::Protocol(m) => Error::Protocol(m.clone()),
        Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        other => Error::Transport(other.to_string()),
    }
}

pub(crate) fn wake_dispatcher(state: &ConnectionState) {
    if let Err(e) = nix_write(&state.wakeup_write, &[1u8]) {
        warn!("failed to write wakeup byte: {e}");
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::resource(e.to_string()))?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::resource(e.to_string()))?;
    Ok(())
}

/// Drain the wakeup pipe (spec.md §5: "drained each time the dispatcher
/// observes it"). Best-effort: `WouldBlock` just means nothing was pending.
pub(crate) fn drain_wakeup_pipe(fd: &OwnedFd) {
    let mut scratch = [0u8; 64];
    loop {
        match nix_read(fd, &mut scratch) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

/// Placeholder used only for the instant between taking ownership of the
/// pre-security transport and installing the `SecuredTransport` that wraps
/// it; never observed outside `Connection::open_with_event_loop`.
struct NullTransportPlaceholder;

impl Transport for NullTransportPlaceholder {
    fn try_read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "placeholder transport"))
    }

    fn try_write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "placeholder transport"))
    }

    fn pollable_fd(&self) -> RawFd {
        -1
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
