//! Timer queue for deadline management.
//!
//! A min-heap ordered by `(deadline, sequence)`, so timers sharing a deadline
//! fire in submission order. Cancelled timers are not removed eagerly, they are
//! skipped when they reach the top of the heap.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

pub(crate) enum TimerCallback {
    Once(Box<dyn FnOnce()>),
    Repeat { period: Duration, callback: Box<dyn FnMut()> },
}

#[derive(Debug, Default)]
pub(crate) struct TimerFlags {
    cancelled: Cell<bool>,
    fired: Cell<bool>,
}

/// A handle to a scheduled timer.
///
/// Cancelling a timer that already fired, or cancelling twice, does nothing.
/// Handles are cheap to clone; every clone controls the same timer.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    flags: Rc<TimerFlags>,
}

impl TimerHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self { id, flags: Rc::new(TimerFlags::default()) }
    }

    /// A handle for a timer that was never scheduled.
    pub(crate) fn inert() -> Self {
        let handle = Self::new(u64::MAX);
        handle.flags.cancelled.set(true);
        handle
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancels the timer. Returns `true` only for the call that actually
    /// prevented a pending timer from firing.
    pub fn cancel(&self) -> bool {
        if self.flags.cancelled.get() || self.flags.fired.get() {
            return false;
        }
        self.flags.cancelled.set(true);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.get()
    }

    pub fn has_fired(&self) -> bool {
        self.flags.fired.get()
    }

    /// Whether the timer may still fire.
    pub fn is_active(&self) -> bool {
        !self.flags.cancelled.get() && !self.flags.fired.get()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("cancelled", &self.flags.cancelled.get())
            .field("fired", &self.flags.fired.get())
            .finish()
    }
}

pub(crate) struct TimerEntry {
    pub(crate) deadline: Duration,
    sequence: u64,
    pub(crate) handle: TimerHandle,
    pub(crate) callback: TimerCallback,
}

impl TimerEntry {
    /// Marks a one-shot timer as fired. Interval timers stay armed.
    pub(crate) fn mark_fired(&self) {
        if matches!(self.callback, TimerCallback::Once(_)) {
            self.handle.flags.fired.set(true);
        }
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed for a min-heap: earliest deadline first, then lowest sequence
        other.deadline.cmp(&self.deadline).then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_sequence: u64,
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue").field("len", &self.heap.len()).field("next_sequence", &self.next_sequence).finish()
    }
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, deadline: Duration, callback: TimerCallback) -> TimerHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let handle = TimerHandle::new(sequence);
        self.heap.push(TimerEntry { deadline, sequence, handle: handle.clone(), callback });
        handle
    }

    /// Re-arms an interval timer under its original handle.
    pub(crate) fn rearm(&mut self, deadline: Duration, handle: TimerHandle, callback: TimerCallback) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(TimerEntry { deadline, sequence, handle, callback });
    }

    fn discard_cancelled(&mut self) {
        while self.heap.peek().is_some_and(|entry| entry.handle.is_cancelled()) {
            self.heap.pop();
        }
    }

    /// Returns the earliest deadline of a timer that can still fire.
    pub(crate) fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Pops the next live timer whose deadline is `<= now`.
    pub(crate) fn pop_due(&mut self, now: Duration) -> Option<TimerEntry> {
        self.discard_cancelled();
        if self.heap.peek()?.deadline <= now { self.heap.pop() } else { None }
    }

    /// Number of timers that can still fire.
    pub(crate) fn live(&self) -> usize {
        self.heap.iter().filter(|entry| !entry.handle.is_cancelled()).count()
    }

    /// Cancels every timer and hands the entries back so their callbacks can
    /// be dropped outside of the queue's borrow.
    pub(crate) fn clear(&mut self) -> Vec<TimerEntry> {
        let entries = std::mem::take(&mut self.heap).into_vec();
        for entry in &entries {
            entry.handle.cancel();
        }
        entries
    }
}
