//! CallRegistry & CallSlot (spec.md §3/§4.4): the ordered wait list that
//! arbitrates "the buck" among caller threads.
//!
//! No example-pack repo implements this pattern (the closest relative,
//! `other_examples/.../pulseaudio-rs/reactor.rs`, uses a dedicated reactor
//! thread and a `BTreeMap` of oneshot handlers instead), so this module is
//! built directly from spec.md §4.4's numbered algorithm and the state
//! machine in spec.md §3, using `std::sync::Condvar` the way the rest of
//! this crate uses blocking `std::sync`/`std::net` primitives throughout.

use std::collections::VecDeque;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    WaitTx,
    WaitRx,
    Complete,
    Error,
}

/// One outstanding request. Constructed by the calling thread, registered
/// in `CallRegistry` before the first I/O attempt, removed when `state`
/// becomes `Complete` or `Error`.
pub struct CallSlot {
    pub serial: u32,
    pub program: u32,
    pub procedure: u32,
    /// `false` for fire-and-forget sends (stream CONTINUE packets).
    pub want_reply: bool,
    pub state: CallState,
    /// The fully framed outbound message.
    pub outbound: Vec<u8>,
    pub offset: usize,
    pub result: Option<Result<Vec<u8>, Error>>,
}

impl CallSlot {
    pub fn new(serial: u32, program: u32, procedure: u32, outbound: Vec<u8>, want_reply: bool) -> Self {
        CallSlot {
            serial,
            program,
            procedure,
            want_reply,
            state: CallState::WaitTx,
            outbound,
            offset: 0,
            result: None,
        }
    }

    /// A slot with nothing to write: used by `StreamHandle::recv`'s
    /// blocking path (spec.md §4.6: "issue a wait-only call that drives the
    /// dispatcher until a stream packet arrives"). Starts directly in
    /// `WAIT_RX` so the dispatcher never attempts to write on its behalf.
    pub fn new_wait_only(serial: u32, program: u32, procedure: u32) -> Self {
        CallSlot {
            serial,
            program,
            procedure,
            want_reply: true,
            state: CallState::WaitRx,
            outbound: Vec::new(),
            offset: 0,
            result: None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, CallState::Complete | CallState::Error)
    }

    pub fn complete(&mut self, payload: Vec<u8>) {
        self.result = Some(Ok(payload));
        self.state = CallState::Complete;
    }

    pub fn fail(&mut self, err: Error) {
        self.result = Some(Err(err));
        self.state = CallState::Error;
    }
}

/// The ordered wait list. The front element is always either the active
/// dispatcher's own slot or the slot about to become the new dispatcher
/// once signalled ("passing the buck").
#[derive(Default)]
pub struct CallRegistry {
    wait_list: VecDeque<CallSlot>,
}

impl CallRegistry {
    pub fn new() -> Self {
        CallRegistry { wait_list: VecDeque::new() }
    }

    /// Append to the tail of the wait list (spec.md §4.4 step 1).
    pub fn register(&mut self, slot: CallSlot) {
        self.wait_list.push_back(slot);
    }

    pub fn is_head(&self, serial: u32) -> bool {
        self.wait_list.front().map(|s| s.serial == serial).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.wait_list.is_empty()
    }

    pub fn head_serial(&self) -> Option<u32> {
        self.wait_list.front().map(|s| s.serial)
    }

    pub fn head_mut(&mut self) -> Option<&mut CallSlot> {
        self.wait_list.front_mut()
    }

    pub fn find_mut(&mut self, serial: u32) -> Option<&mut CallSlot> {
        self.wait_list.iter_mut().find(|s| s.serial == serial)
    }

    /// Every slot in wait-list order, mutably. The dispatcher writes every
    /// `WAIT_TX` slot it finds here, not just the head: several calls may be
    /// pipelined on the wire awaiting distinct replies (spec.md §4.4).
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CallSlot> {
        self.wait_list.iter_mut()
    }

    pub fn any_waiting_to_send(&self) -> bool {
        self.wait_list.iter().any(|s| s.state == CallState::WaitTx)
    }

    pub fn contains(&self, serial: u32) -> bool {
        self.wait_list.iter().any(|s| s.serial == serial)
    }

    /// Whether some slot other than `except_serial` is done. Each CallSlot
    /// is owned by the thread that registered it and is removed only by
    /// that thread (via `remove`) once it wakes; the dispatcher never
    /// unlinks another thread's slot on its behalf, since the slot (and
    /// its `result`) is the only copy of that call's outcome.
    pub fn any_other_done(&self, except_serial: u32) -> bool {
        self.wait_list.iter().any(|s| s.serial != except_serial && s.is_done())
    }

    /// Remove a specific slot (used by the caller once it has read out its
    /// own result) and return it.
    pub fn remove(&mut self, serial: u32) -> Option<CallSlot> {
        let index = self.wait_list.iter().position(|s| s.serial == serial)?;
        self.wait_list.remove(index)
    }

    /// Fail every slot with a fatal error (used when the Transport dies).
    pub fn fail_all(&mut self, make_err: impl Fn() -> Error) {
        for slot in self.wait_list.iter_mut() {
            if !slot.is_done() {
                slot.fail(make_err());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.wait_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(serial: u32) -> CallSlot {
        CallSlot::new(serial, 1, 1, vec![0u8; 4], true)
    }

    #[test]
    fn registration_preserves_fifo_order() {
        let mut registry = CallRegistry::new();
        registry.register(slot(1));
        registry.register(slot(2));
        registry.register(slot(3));

        assert_eq!(registry.head_serial(), Some(1));
        assert!(registry.is_head(1));
        assert!(!registry.is_head(2));
    }

    #[test]
    fn any_other_done_ignores_the_except_serial() {
        let mut registry = CallRegistry::new();
        registry.register(slot(1));
        registry.register(slot(2));
        registry.register(slot(3));

        assert!(!registry.any_other_done(1));

        registry.find_mut(2).unwrap().complete(vec![]);
        assert!(registry.any_other_done(1));
        assert!(!registry.any_other_done(2));

        registry.find_mut(3).unwrap().fail(Error::protocol("boom"));
        assert!(registry.any_other_done(1));

        // Each owning thread removes its own slot once woken; the
        // registry itself never drops another thread's result.
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn fire_and_forget_transitions_directly_to_complete() {
        let mut s = CallSlot::new(9, 1, 1, vec![1, 2, 3], false);
        assert_eq!(s.state, CallState::WaitTx);
        s.offset = s.outbound.len();
        s.complete(vec![]);
        assert_eq!(s.state, CallState::Complete);
    }

    #[test]
    fn fail_all_poisons_every_unfinished_slot() {
        let mut registry = CallRegistry::new();
        registry.register(slot(1));
        registry.register(slot(2));
        registry.find_mut(1).unwrap().complete(vec![]);

        registry.fail_all(|| Error::transport("connection reset"));

        assert!(matches!(registry.find_mut(1).unwrap().state, CallState::Complete));
        assert!(matches!(registry.find_mut(2).unwrap().state, CallState::Error));
    }
}
