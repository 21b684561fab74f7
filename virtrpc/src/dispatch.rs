//! The dispatcher loop: "passing the buck" (spec.md §4.4). No teacher
//! precedent exists for this exact design (the closest relative,
//! `rpc_protocol::client::do_rpc_call`, is a single blocking
//! request/response with no contention to arbitrate), so this is built
//! directly from spec.md's numbered algorithm, using `nix::poll` for the
//! readiness wait and `std::sync::{Mutex, Condvar}` for the handoff — the
//! same primitives the rest of this crate reaches for instead of pulling in
//! an async runtime.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::MutexGuard;

use log::{debug, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

use crate::connection::{drain_wakeup_pipe, ConnectionState, Inner};
use crate::error::Error;
use crate::framer::{self, MessageType, Status, HEADER_SIZE, LENGTH_SIZE};
use crate::registry::CallState;

/// Signals that would otherwise interrupt the blocking poll call
/// (spec.md §5: "signals known to interrupt interactive consumers
/// (window-change, child, broken-pipe)").
fn intrusive_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGWINCH);
    set.add(Signal::SIGCHLD);
    set.add(Signal::SIGPIPE);
    set
}

/// Run the dispatcher loop on behalf of `my_serial` until that call's slot
/// reaches `COMPLETE`/`ERROR`. Other callers' slots may finish along the
/// way; each is signalled as it does so its own owning thread can unlink
/// and read it back (spec.md §4.4 step 4b "after each iteration, walk the
/// wait list"). Returns with the lock held.
pub(crate) fn run<'a>(inner: &'a Inner, mut guard: MutexGuard<'a, ConnectionState>, my_serial: u32) -> MutexGuard<'a, ConnectionState> {
    guard.event_loop.toggle_socket_watch(false);

    loop {
        if guard.poison.is_some() {
            break;
        }
        if guard.calls.find_mut(my_serial).map(|s| s.is_done()).unwrap_or(true) {
            break;
        }

        let want_write = guard.calls.any_waiting_to_send() || guard.transport.wants_write();

        let transport_fd = guard.transport.pollable_fd();
        let wakeup_fd = guard.wakeup_read.as_raw_fd();

        drop(guard);

        let outcome = poll_once(transport_fd, wakeup_fd, want_write);

        guard = inner.state.lock().unwrap();

        match outcome {
            Ok((readable, writable, hup, wakeup_readable)) => {
                if wakeup_readable {
                    drain_wakeup_pipe(&guard.wakeup_read);
                }

                if hup {
                    fail_connection(&mut guard, Error::transport("transport reported HUP/ERR"));
                    break;
                }

                if writable {
                    step_write(&mut guard);
                }

                if readable {
                    if let Err(e) = step_read(&mut guard) {
                        let fatal = e;
                        fail_connection(&mut guard, fatal);
                        break;
                    }
                }
            }
            Err(e) => {
                fail_connection(&mut guard, Error::transport(format!("poll failed: {e}")));
                break;
            }
        }

        // Wake any other thread whose slot just finished; each removes its
        // own slot once woken rather than having the dispatcher drop it
        // (the slot's `result` would otherwise be discarded unread).
        if guard.calls.any_other_done(my_serial) {
            inner.cvar.notify_all();
        }
    }

    guard.event_loop.toggle_socket_watch(true);

    // Pass the buck: whoever is left at the head (if anyone) becomes the
    // next dispatcher once we release the lock.
    inner.cvar.notify_all();

    guard
}

/// One poll(2) call with the intrusive signal mask blocked for its duration
/// (spec.md §5, §4.4 step 4a/4d). Returns (transport_readable,
/// transport_writable, transport_hup, wakeup_pipe_readable).
fn poll_once(transport_fd: RawFd, wakeup_fd: RawFd, want_write: bool) -> nix::Result<(bool, bool, bool, bool)> {
    let blocked = intrusive_signals();
    let mut previous = SigSet::empty();
    unsafe {
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))?;
    }

    let transport_borrowed = unsafe { BorrowedFd::borrow_raw(transport_fd) };
    let wakeup_borrowed = unsafe { BorrowedFd::borrow_raw(wakeup_fd) };

    let mut transport_events = PollFlags::POLLIN;
    if want_write {
        transport_events |= PollFlags::POLLOUT;
    }

    let mut fds = [
        PollFd::new(transport_borrowed, transport_events),
        PollFd::new(wakeup_borrowed, PollFlags::POLLIN),
    ];

    let result = poll(&mut fds, PollTimeout::NONE);

    let outcome = result.map(|_| {
        let transport_revents = fds[0].revents().unwrap_or(PollFlags::empty());
        let wakeup_revents = fds[1].revents().unwrap_or(PollFlags::empty());
        let hup = transport_revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL);
        let readable = transport_revents.contains(PollFlags::POLLIN);
        let writable = transport_revents.contains(PollFlags::POLLOUT);
        let wakeup_readable = wakeup_revents.contains(PollFlags::POLLIN);
        (readable, writable, hup, wakeup_readable)
    });

    unsafe {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
    }

    outcome
}

/// Write as much of every `WAIT_TX` slot's outbound buffer as the transport
/// will accept right now, in wait-list order; transition each WAIT_TX ->
/// WAIT_RX (or COMPLETE for fire-and-forget sends) once fully written.
/// Several calls may be pipelined on the wire awaiting distinct replies
/// (spec.md §4.4), so this is not limited to the wait-list head.
fn step_write(state: &mut ConnectionState) {
    for slot in state.calls.iter_mut() {
        if slot.state != CallState::WaitTx {
            continue;
        }

        loop {
            if slot.offset >= slot.outbound.len() {
                break;
            }
            match state.transport.try_write(&slot.outbound[slot.offset..]) {
                Ok(0) => break,
                Ok(n) => slot.offset += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    slot.fail(Error::transport(e.to_string()));
                    break;
                }
            }
        }

        if slot.offset >= slot.outbound.len() {
            if slot.want_reply {
                slot.state = CallState::WaitRx;
            } else {
                slot.complete(Vec::new());
            }
        } else {
            // This slot's frame didn't fully flush (blocked or errored).
            // Stop rather than starting a later slot's bytes on a wire that
            // may still hold this slot's unfinished frame — interleaving
            // would corrupt the framing for both.
            break;
        }
    }
}

/// Read whatever the transport has available, then decode and route as
/// many complete frames as the receive buffer now contains.
fn step_read(state: &mut ConnectionState) -> Result<(), Error> {
    let mut scratch = [0u8; 65536];
    match state.transport.try_read(&mut scratch) {
        Ok(0) => {
            return Err(Error::transport("peer closed the connection"));
        }
        Ok(n) => state.recv_buffer.extend_from_slice(&scratch[..n]),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(Error::transport(e.to_string())),
    }

    loop {
        if state.recv_buffer.len() < LENGTH_SIZE {
            break;
        }
        let length_bytes: [u8; LENGTH_SIZE] = state.recv_buffer[0..LENGTH_SIZE].try_into().unwrap();
        let total_length = framer::decode_length(&length_bytes)? as usize;

        if state.recv_buffer.len() < total_length {
            break;
        }

        let header_bytes = state.recv_buffer[LENGTH_SIZE..LENGTH_SIZE + HEADER_SIZE].to_vec();
        let header = framer::decode_header(&header_bytes)?;
        let payload = state.recv_buffer[LENGTH_SIZE + HEADER_SIZE..total_length].to_vec();
        state.recv_buffer.drain(0..total_length);

        route(state, header, payload)?;
    }

    Ok(())
}

fn route(state: &mut ConnectionState, header: framer::Header, payload: Vec<u8>) -> Result<(), Error> {
    if header.program != crate::proto::PROGRAM {
        return Err(Error::protocol(format!("unexpected program id {}", header.program)));
    }

    match header.message_type {
        MessageType::Reply => route_reply(state, header, payload),
        MessageType::Message => {
            if !state.opening {
                state.events.push(crate::events::Event { procedure: header.procedure, payload });
                debug!("queued event for procedure {}", header.procedure);
            }
            Ok(())
        }
        MessageType::Stream => route_stream(state, header, payload),
        MessageType::Call => Err(Error::protocol("received a CALL frame from the server")),
    }
}

fn route_reply(state: &mut ConnectionState, header: framer::Header, payload: Vec<u8>) -> Result<(), Error> {
    let Some(slot) = state.calls.find_mut(header.serial) else {
        return Err(Error::protocol(format!("reply for unknown serial {}", header.serial)));
    };

    if slot.procedure != header.procedure {
        return Err(Error::protocol(format!(
            "reply procedure {} does not match call procedure {}",
            header.procedure, slot.procedure
        )));
    }

    match header.status {
        Status::Ok => slot.complete(payload),
        Status::Error => slot.fail(Error::remote(header.procedure, String::from_utf8_lossy(&payload).into_owned())),
        Status::Continue => return Err(Error::protocol("REPLY frame carried CONTINUE status")),
    }

    Ok(())
}

fn route_stream(state: &mut ConnectionState, header: framer::Header, payload: Vec<u8>) -> Result<(), Error> {
    let has_waiting_call = state.calls.contains(header.serial);

    match header.status {
        Status::Continue => {
            // Readiness callbacks registered via `Connection::stream_on_event`
            // (spec.md §4.6) are polled by `Connection::dispatch_stream_events`,
            // not fired inline here — the dispatcher never invokes caller
            // code while holding this lock.
            state.streams.on_data(header.serial, &payload);
        }
        Status::Ok => {
            state.streams.on_finish(header.serial);
        }
        Status::Error => {
            let err = Error::stream(String::from_utf8_lossy(&payload).into_owned());
            state.streams.on_abort(header.serial, err);
        }
    }

    if has_waiting_call {
        if let Some(slot) = state.calls.find_mut(header.serial) {
            if slot.state == CallState::WaitRx {
                match header.status {
                    Status::Error => {
                        slot.fail(Error::stream(String::from_utf8_lossy(&payload).into_owned()));
                    }
                    _ => slot.complete(Vec::new()),
                }
            }
        }
    }

    if !state.streams.contains(header.serial) && !has_waiting_call {
        return Err(Error::protocol(format!("stream frame for unknown serial {}", header.serial)));
    }

    Ok(())
}

fn fail_connection(state: &mut ConnectionState, err: Error) {
    warn!("connection failed: {err}");
    state.calls.fail_all(|| clone_for_fanout(&err));
    state.streams.abort_all(|| clone_for_fanout(&err));
    let _ = state.transport.close();
    state.poison = Some(err);
}

fn clone_for_fanout(err: &Error) -> Error {
    match err {
        Error::Transport(m) => Error::Transport(m.clone()),
        Error::Protocol(m) => Error::Protocol(m.clone()),
        other => Error::Transport(other.to_string()),
    }
}
