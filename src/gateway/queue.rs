//! FIFO of submitted messages plus the single-flight drain flag.
//!
//! Items and the `draining` flag live under one mutex so that "queue became
//! empty, drain ends" and "new item arrives, drain needed" can never interleave
//! into a stranded message or a second drain loop.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::QueuedMessage;

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedMessage>,
    draining: bool,
}

#[derive(Default)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a message. Returns true when the caller now owns the drain and
    /// must start the loop (`may_start` is false while the link is down).
    pub fn push(&self, msg: QueuedMessage, may_start: bool) -> bool {
        let mut state = self.lock();
        state.items.push_back(msg);
        if may_start && !state.draining {
            state.draining = true;
            return true;
        }
        false
    }

    /// Claim the drain for pending items, e.g. after a (re)connect.
    pub fn try_begin_drain(&self) -> bool {
        let mut state = self.lock();
        if state.draining || state.items.is_empty() {
            return false;
        }
        state.draining = true;
        true
    }

    /// Pop the next message for the drain owner. An empty queue ends the drain.
    pub fn next(&self) -> Option<QueuedMessage> {
        let mut state = self.lock();
        let next = state.items.pop_front();
        if next.is_none() {
            state.draining = false;
        }
        next
    }

    /// Give up the drain without consuming items (link lost).
    pub fn halt(&self) {
        self.lock().draining = false;
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }
}
