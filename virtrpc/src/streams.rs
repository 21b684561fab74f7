//! StreamRegistry & StreamSlot: multiplexed byte streams riding on top of a
//! single Connection (spec.md §4.6). Grounded, like `registry.rs`, directly
//! on spec.md's prose rather than a teacher precedent — none of the five
//! example repos multiplex independent byte streams over one RPC channel.
//!
//! Per DESIGN.md's Open Question #1 decision, incoming data is held in a
//! hard-capped buffer (`MAX_BUFFERED_BYTES`): a slow consumer that lets the
//! buffer fill is aborted with `Error::Stream` rather than the dispatcher
//! applying backpressure by stalling other traffic on the connection.

use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};

/// Hard cap on unconsumed incoming stream data. Chosen as a conservative
/// fixed bound rather than exposing it as a tunable: this crate has no
/// configuration surface wired end to end yet, and one generous fixed
/// number is preferable to an unbounded buffer.
pub const MAX_BUFFERED_BYTES: usize = 4 * 1024 * 1024;

/// `on_event` readiness bits (spec.md §4.6: "readable iff incoming buffer
/// non-empty, writable always").
pub const STREAM_EVENT_READABLE: u32 = 1 << 0;
pub const STREAM_EVENT_WRITABLE: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Finished,
    Aborted,
}

pub type StreamInvoke = Box<dyn FnMut(u32, u32) + Send>;
pub type StreamFree = Box<dyn FnOnce() + Send>;

/// The registered callback descriptor (spec.md §3: "optional callback
/// descriptor {event-mask, callback, opaque, free, timer-id,
/// dispatch-in-progress}"). `opaque` has no counterpart here: idiomatic
/// Rust closures capture their own state instead of carrying a `void*`
/// alongside a bare function pointer.
struct StreamCallback {
    mask: u32,
    timer_id: i32,
    invoke: StreamInvoke,
    free: Option<StreamFree>,
}

pub struct StreamSlot {
    pub serial: u32,
    pub procedure: u32,
    pub state: StreamState,
    incoming: VecDeque<u8>,
    pub error: Option<Error>,
    callback: Option<StreamCallback>,
    /// Set while a callback invocation is out on loan to the caller with
    /// the Connection lock released (spec.md §4.6: "the callback runs with
    /// the Connection lock released"). Guards against a racing `on_event`
    /// immediately freeing a descriptor that is still mid-call.
    dispatch_in_progress: bool,
    /// Bumped on every `set_callback`/`clear_callback`, so a callback
    /// returning from an unlocked invocation can tell whether its
    /// descriptor is still the one installed, or was replaced/cleared
    /// while it ran.
    generation: u64,
    /// Free callbacks for descriptors replaced or cleared while
    /// `dispatch_in_progress`, run once the in-flight call returns
    /// (spec.md §4.6: "re-entrant removal during dispatch is handled by
    /// deferring the free until after the callback returns").
    pending_free: Vec<StreamFree>,
}

impl StreamSlot {
    fn new(serial: u32, procedure: u32) -> Self {
        StreamSlot {
            serial,
            procedure,
            state: StreamState::Open,
            incoming: VecDeque::new(),
            error: None,
            callback: None,
            dispatch_in_progress: false,
            generation: 0,
            pending_free: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn buffered_len(&self) -> usize {
        self.incoming.len()
    }

    /// Current readiness bitmask: always writable, readable once data is
    /// buffered (spec.md §4.6).
    pub fn readiness_mask(&self) -> u32 {
        let mut mask = STREAM_EVENT_WRITABLE;
        if self.buffered_len() > 0 {
            mask |= STREAM_EVENT_READABLE;
        }
        mask
    }

    /// Install a callback descriptor, replacing any existing one (its
    /// `free`, if present, runs now unless a call is currently mid-flight).
    fn set_callback(&mut self, mask: u32, timer_id: i32, invoke: StreamInvoke, free: Option<StreamFree>) {
        self.replace_callback(Some(StreamCallback { mask, timer_id, invoke, free }));
    }

    /// Remove the callback descriptor, returning its timer id so the
    /// caller can cancel the matching `EventLoopHandle` timer.
    fn clear_callback(&mut self) -> Option<i32> {
        let timer_id = self.callback.as_ref().map(|cb| cb.timer_id);
        self.replace_callback(None);
        timer_id
    }

    fn replace_callback(&mut self, new: Option<StreamCallback>) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(old) = self.callback.take() {
            if let Some(free) = old.free {
                if self.dispatch_in_progress {
                    self.pending_free.push(free);
                } else {
                    free();
                }
            }
        }
        self.callback = new;
    }

    /// If a callback is registered, not already mid-flight, and due per
    /// current readiness, take its invocable closure out for the caller to
    /// run with the Connection lock released. Returns the generation token
    /// needed to hand the closure back via `return_callback`.
    fn take_due_callback(&mut self) -> Option<(u64, u32, StreamInvoke)> {
        if self.dispatch_in_progress {
            return None;
        }
        let ready = self.readiness_mask();
        let cb = self.callback.as_mut()?;
        let matched = cb.mask & ready;
        if matched == 0 {
            return None;
        }
        self.dispatch_in_progress = true;
        let invoke = std::mem::replace(&mut cb.invoke, Box::new(|_, _| {}));
        Some((self.generation, matched, invoke))
    }

    /// Hand back a closure taken by `take_due_callback` once it has run.
    /// If the descriptor was replaced or cleared while unlocked, `gen` no
    /// longer matches: the closure is simply dropped, and any frees queued
    /// during the call now run.
    fn return_callback(&mut self, gen: u64, invoke: StreamInvoke) {
        if self.generation == gen {
            if let Some(cb) = self.callback.as_mut() {
                cb.invoke = invoke;
            }
        }
        self.dispatch_in_progress = false;
        for free in self.pending_free.drain(..) {
            free();
        }
    }

    /// Append data arriving from the server (an inbound STREAM message).
    /// Enforces `MAX_BUFFERED_BYTES`: exceeding it aborts the stream rather
    /// than silently growing without bound.
    pub fn push_incoming(&mut self, data: &[u8]) {
        if !self.is_open() {
            return;
        }
        if self.incoming.len() + data.len() > MAX_BUFFERED_BYTES {
            self.state = StreamState::Aborted;
            self.error = Some(Error::stream(format!(
                "stream {} exceeded the {}-byte buffer cap and was aborted",
                self.serial, MAX_BUFFERED_BYTES
            )));
            self.incoming.clear();
            return;
        }
        self.incoming.extend(data);
    }

    /// Drain up to `max` bytes of buffered data for the consumer.
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let n = self.incoming.len().min(max);
        self.incoming.drain(0..n).collect()
    }

    pub fn finish(&mut self) {
        if self.state == StreamState::Open {
            self.state = StreamState::Finished;
        }
    }

    pub fn abort(&mut self, err: Error) {
        self.state = StreamState::Aborted;
        self.error = Some(err);
        self.incoming.clear();
    }
}

/// Open streams keyed by the serial of the CALL that opened them, per
/// spec.md §4.6 ("a stream's lifetime is anchored to the serial number of
/// the call that opened it; subsequent STREAM messages carry that same
/// serial").
#[derive(Default)]
pub struct StreamRegistry {
    streams: HashMap<u32, StreamSlot>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        StreamRegistry { streams: HashMap::new() }
    }

    pub fn open(&mut self, serial: u32, procedure: u32) -> Result<()> {
        if self.streams.contains_key(&serial) {
            return Err(Error::protocol(format!("stream already open for serial {serial}")));
        }
        self.streams.insert(serial, StreamSlot::new(serial, procedure));
        Ok(())
    }

    pub fn get_mut(&mut self, serial: u32) -> Option<&mut StreamSlot> {
        self.streams.get_mut(&serial)
    }

    pub fn contains(&self, serial: u32) -> bool {
        self.streams.contains_key(&serial)
    }

    /// Route an inbound STREAM payload to the matching open stream. Unknown
    /// serials are tolerated (the stream may have just been locally closed)
    /// rather than treated as a protocol error.
    pub fn on_data(&mut self, serial: u32, data: &[u8]) {
        if let Some(slot) = self.streams.get_mut(&serial) {
            slot.push_incoming(data);
        }
    }

    pub fn on_finish(&mut self, serial: u32) {
        if let Some(slot) = self.streams.get_mut(&serial) {
            slot.finish();
        }
    }

    pub fn on_abort(&mut self, serial: u32, err: Error) {
        if let Some(slot) = self.streams.get_mut(&serial) {
            slot.abort(err);
        }
    }

    pub fn close(&mut self, serial: u32) -> Option<StreamSlot> {
        if let Some(slot) = self.streams.get_mut(&serial) {
            slot.clear_callback();
        }
        self.streams.remove(&serial)
    }

    /// Register (replacing any existing) a readiness callback for `serial`
    /// (spec.md §4.6: `on_event(slot, mask, cb)`).
    pub fn on_event(&mut self, serial: u32, mask: u32, timer_id: i32, invoke: StreamInvoke, free: Option<StreamFree>) -> Result<()> {
        let slot = self
            .streams
            .get_mut(&serial)
            .ok_or_else(|| Error::protocol(format!("stream {serial} is not open")))?;
        slot.set_callback(mask, timer_id, invoke, free);
        Ok(())
    }

    /// Unregister `serial`'s callback, if any, returning its timer id so
    /// the caller can cancel the matching `EventLoopHandle` timer.
    pub fn remove_event(&mut self, serial: u32) -> Option<i32> {
        self.streams.get_mut(&serial).and_then(|slot| slot.clear_callback())
    }

    /// Find one stream whose callback is due given current readiness and
    /// take it out for the caller to invoke with the Connection lock
    /// released. Iteration order over open streams is otherwise
    /// unspecified; each call surfaces at most one due callback.
    pub fn next_due_callback(&mut self) -> Option<(u32, u64, u32, StreamInvoke)> {
        for (&serial, slot) in self.streams.iter_mut() {
            if let Some((gen, mask, invoke)) = slot.take_due_callback() {
                return Some((serial, gen, mask, invoke));
            }
        }
        None
    }

    /// Hand back a closure taken by `next_due_callback` once it has run.
    pub fn return_callback(&mut self, serial: u32, gen: u64, invoke: StreamInvoke) {
        if let Some(slot) = self.streams.get_mut(&serial) {
            slot.return_callback(gen, invoke);
        }
    }

    /// Abort every still-open stream (the Transport died).
    pub fn abort_all(&mut self, make_err: impl Fn() -> Error) {
        for slot in self.streams.values_mut() {
            if slot.is_open() {
                slot.abort(make_err());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_accumulates_until_drained() {
        let mut registry = StreamRegistry::new();
        registry.open(1, 42).unwrap();
        registry.on_data(1, b"hello ");
        registry.on_data(1, b"world");

        let slot = registry.get_mut(1).unwrap();
        assert_eq!(slot.buffered_len(), 11);
        assert_eq!(slot.take(5), b"hello");
        assert_eq!(slot.take(100), b" world");
        assert_eq!(slot.buffered_len(), 0);
    }

    #[test]
    fn finish_marks_closed_but_keeps_buffered_data_readable() {
        let mut registry = StreamRegistry::new();
        registry.open(2, 7).unwrap();
        registry.on_data(2, b"tail");
        registry.on_finish(2);

        let slot = registry.get_mut(2).unwrap();
        assert_eq!(slot.state, StreamState::Finished);
        assert_eq!(slot.take(100), b"tail");
    }

    #[test]
    fn overflowing_the_cap_aborts_the_stream() {
        let mut registry = StreamRegistry::new();
        registry.open(3, 1).unwrap();
        registry.on_data(3, &vec![0u8; MAX_BUFFERED_BYTES + 1]);

        let slot = registry.get_mut(3).unwrap();
        assert_eq!(slot.state, StreamState::Aborted);
        assert!(slot.error.is_some());
        assert_eq!(slot.buffered_len(), 0);
    }

    #[test]
    fn duplicate_open_is_rejected() {
        let mut registry = StreamRegistry::new();
        registry.open(4, 1).unwrap();
        assert!(registry.open(4, 1).is_err());
    }

    #[test]
    fn data_for_unknown_serial_is_dropped_silently() {
        let mut registry = StreamRegistry::new();
        registry.on_data(99, b"orphan");
        assert!(!registry.contains(99));
    }

    #[test]
    fn on_event_fires_once_data_arrives() {
        let mut registry = StreamRegistry::new();
        registry.open(5, 1).unwrap();
        registry.on_event(5, STREAM_EVENT_READABLE, 7, Box::new(|_, _| {}), None).unwrap();

        assert!(registry.next_due_callback().is_none(), "nothing buffered yet, not readable");

        registry.on_data(5, b"x");
        let (serial, gen, mask, mut invoke) = registry.next_due_callback().expect("readable now");
        assert_eq!(serial, 5);
        assert_eq!(mask, STREAM_EVENT_READABLE);
        invoke(serial, mask);
        registry.return_callback(serial, gen, invoke);

        assert!(registry.next_due_callback().is_none(), "already dispatched, no second due callback");
    }

    #[test]
    fn replacing_a_callback_runs_the_old_free() {
        let mut registry = StreamRegistry::new();
        registry.open(6, 1).unwrap();

        let freed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let freed_clone = freed.clone();
        registry
            .on_event(6, STREAM_EVENT_WRITABLE, 1, Box::new(|_, _| {}), Some(Box::new(move || freed_clone.store(true, std::sync::atomic::Ordering::SeqCst))))
            .unwrap();

        registry.on_event(6, STREAM_EVENT_WRITABLE, 2, Box::new(|_, _| {}), None).unwrap();
        assert!(freed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn free_replaced_mid_dispatch_is_deferred_until_return() {
        let mut registry = StreamRegistry::new();
        registry.open(7, 1).unwrap();

        let freed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let freed_clone = freed.clone();
        registry
            .on_event(7, STREAM_EVENT_WRITABLE, 1, Box::new(|_, _| {}), Some(Box::new(move || freed_clone.store(true, std::sync::atomic::Ordering::SeqCst))))
            .unwrap();

        let (serial, gen, mask, invoke) = registry.next_due_callback().expect("always writable");

        // Simulate the callback itself replacing the descriptor while its
        // own invocation is still "in flight" (Connection lock released).
        registry.on_event(7, STREAM_EVENT_WRITABLE, 3, Box::new(|_, _| {}), None).unwrap();
        assert!(!freed.load(std::sync::atomic::Ordering::SeqCst), "free must wait for return_callback");

        registry.return_callback(serial, gen, invoke);
        assert!(freed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
