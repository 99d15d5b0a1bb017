//! Per-service FIFO mailbox with overload detection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handle::Handle;
use crate::message::Message;

const INITIAL_OVERLOAD_THRESHOLD: usize = 1024;

/// Outcome of a [`Mailbox::pop`].
pub enum Pop {
    /// A message was dequeued. `overload` is `Some(len)` the first time, after this pop,
    /// that the mailbox's length has crossed its current overload threshold.
    Message { message: Message, overload: Option<usize> },
    /// The mailbox is empty; it has been unlinked from the global ready queue.
    Empty,
}

struct State {
    queue: VecDeque<Message>,
    in_global: bool,
    release: bool,
    overload_threshold: usize,
    /// Intrusive link for the global ready queue. Kept inside the mailbox's own lock so the
    /// queue never needs a separate allocation per node (see SPEC_FULL.md §9 design notes).
    next: Option<Arc<Mailbox>>,
}

/// A growing FIFO of [`Message`]s belonging to one service.
///
/// `in_global` is true iff the mailbox is presently linked in the global ready queue *or*
/// is being drained by a worker — the single flag intentionally covers both states, since a
/// mailbox detached from the queue for dispatch must not be re-linked by a concurrent push.
pub struct Mailbox {
    /// Lock-free so `dispatch_one` can read it off a just-popped `Arc<Mailbox>` without
    /// touching `state`'s mutex. Set once at construction with a placeholder (spec §4.4 step
    /// 3 creates the mailbox *before* a handle exists) and once more by
    /// [`Self::set_handle`] once the registry hands one out (step 4, "attach the handle to
    /// the mailbox").
    handle: AtomicU32,
    state: Mutex<State>,
}

impl Mailbox {
    /// Creates a mailbox with `in_global` already set, so nothing dispatches it until the
    /// caller explicitly publishes it (used during service bootstrap, spec §4.4 step 3).
    pub fn new(handle: Handle) -> Self {
        Mailbox {
            handle: AtomicU32::new(handle.0),
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(64),
                in_global: true,
                release: false,
                overload_threshold: INITIAL_OVERLOAD_THRESHOLD,
                next: None,
            }),
        }
    }

    pub fn handle(&self) -> Handle {
        Handle(self.handle.load(Ordering::Relaxed))
    }

    /// Attaches the handle the registry assigned this mailbox's owning service (spec §4.4
    /// step 4). Called exactly once, by whoever just registered the owning context.
    pub fn set_handle(&self, handle: Handle) {
        self.handle.store(handle.0, Ordering::Relaxed);
    }

    /// Clears the "suppressed" state set at construction (spec §4.4 step 5): a service's
    /// mailbox starts with `in_global = true` so nothing can dispatch it mid-`init`. If
    /// `init` itself caused messages to land here, link it so a worker picks them up;
    /// otherwise just mark it idle so the next ordinary `push` links it normally.
    pub fn publish(self: &Arc<Self>, queue: &ReadyQueue) {
        let mut state = self.state.lock();
        if state.queue.is_empty() {
            state.in_global = false;
        } else {
            drop(state);
            queue.push(self.clone());
        }
    }

    /// Appends `msg`. If the mailbox was idle, links it onto `queue` and reports so the
    /// caller can wake a worker.
    ///
    /// Returns `true` if this push is the one that transitioned the mailbox idle → queued
    /// (the caller should wake a sleeping worker).
    pub fn push(self: &Arc<Self>, msg: Message, queue: &ReadyQueue) -> bool {
        let mut state = self.state.lock();
        state.queue.push_back(msg);
        if !state.in_global {
            state.in_global = true;
            drop(state);
            queue.push(self.clone());
            true
        } else {
            false
        }
    }

    /// Dequeues one message. Clears `in_global` (unlinking from the ready queue) when the
    /// mailbox becomes empty.
    pub fn pop(&self) -> Pop {
        let mut state = self.state.lock();
        match state.queue.pop_front() {
            Some(message) => {
                let len = state.queue.len();
                let mut overload = None;
                while len > state.overload_threshold {
                    overload = Some(len);
                    state.overload_threshold *= 2;
                }
                Pop::Message { message, overload }
            }
            None => {
                state.in_global = false;
                state.overload_threshold = INITIAL_OVERLOAD_THRESHOLD;
                Pop::Empty
            }
        }
    }

    pub fn length(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().release
    }

    /// Marks the mailbox for release. If it isn't currently linked into the ready queue, the
    /// caller must link it (via the returned bool) so a worker observes and drains it.
    pub fn mark_release(self: &Arc<Self>, queue: &ReadyQueue) {
        let mut state = self.state.lock();
        assert!(!state.release, "mailbox released twice");
        state.release = true;
        let needs_link = !state.in_global;
        if needs_link {
            state.in_global = true;
        }
        drop(state);
        if needs_link {
            queue.push(self.clone());
        }
    }

    /// Drains every remaining message through `drop_fn`. Used once, after `mark_release`,
    /// by whichever worker next observes the `release` flag.
    pub fn drain_on_release<F: FnMut(Message)>(&self, mut drop_fn: F) {
        loop {
            let msg = {
                let mut state = self.state.lock();
                state.queue.pop_front()
            };
            match msg {
                Some(m) => drop_fn(m),
                None => break,
            }
        }
    }

    fn take_next(&self) -> Option<Arc<Mailbox>> {
        self.state.lock().next.take()
    }

    fn set_next(&self, next: Option<Arc<Mailbox>>) {
        self.state.lock().next = next;
    }
}

/// The global FIFO of mailboxes that currently hold work and are not being dispatched.
///
/// Intrusive: each node *is* a [`Mailbox`], linked via the `next` field embedded in its own
/// mutex-guarded state, so pushing never allocates a separate queue node.
pub struct ReadyQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    head: Option<Arc<Mailbox>>,
    tail: Option<Arc<Mailbox>>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        ReadyQueue {
            inner: Mutex::new(Inner { head: None, tail: None }),
        }
    }

    pub fn push(&self, mailbox: Arc<Mailbox>) {
        debug_assert!(mailbox.take_next().is_none(), "pushing an already-linked mailbox");
        let mut inner = self.inner.lock();
        match inner.tail.take() {
            Some(old_tail) => {
                old_tail.set_next(Some(mailbox.clone()));
                inner.tail = Some(mailbox);
            }
            None => {
                inner.head = Some(mailbox.clone());
                inner.tail = Some(mailbox);
            }
        }
    }

    pub fn pop(&self) -> Option<Arc<Mailbox>> {
        let mut inner = self.inner.lock();
        let head = inner.head.take()?;
        inner.head = head.take_next();
        if inner.head.is_none() {
            inner.tail = None;
        }
        Some(head)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().head.is_none()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn msg(n: u32) -> Message {
        Message {
            source: Handle(n),
            session: 0,
            type_: MessageType::Text,
            payload: None,
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let mb = Arc::new(Mailbox::new(Handle(1)));
        let q = ReadyQueue::new();
        // Mailbox starts suppressed (in_global = true per `new`); emulate the bootstrap
        // publish step so push() actually links it, matching real usage.
        for i in 0..5 {
            mb.push(msg(i), &q);
        }
        let mut seen = Vec::new();
        loop {
            match mb.pop() {
                Pop::Message { message, .. } => seen.push(message.source.0),
                Pop::Empty => break,
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn in_global_tracks_queue_membership() {
        let mb = Arc::new(Mailbox::new(Handle(1)));
        let q = ReadyQueue::new();
        // Force the mailbox to idle state first.
        assert!(matches!(mb.pop(), Pop::Empty));
        assert!(q.is_empty());

        let woke = mb.push(msg(1), &q);
        assert!(woke, "idle -> non-idle transition must link the mailbox");
        assert!(!q.is_empty());

        let woke2 = mb.push(msg(2), &q);
        assert!(!woke2, "second push while already queued must not re-link");

        let popped = q.pop().unwrap();
        assert!(Arc::ptr_eq(&popped, &mb));
        assert!(q.is_empty(), "queue had only one mailbox");
    }

    #[test]
    fn overload_reported_once_per_doubling() {
        // The check lives on `pop` (skynet_mq.c:185-188): it compares the *live length
        // remaining after the dequeue* against the current threshold. A producer that
        // outpaces a consumer by only a little crosses one threshold per pop; a consumer
        // that never drains at all (as a prior version of this test did, pushing 3000
        // messages up front before popping any) sees the whole backlog on its very first
        // pop and so can only ever cross however many thresholds that one length clears —
        // it can't demonstrate two *separate* reports. Interleave pushes and pops here so
        // each threshold is crossed by exactly one pop, matching testable property 8.
        let mb = Arc::new(Mailbox::new(Handle(1)));
        let q = ReadyQueue::new();
        let mut reports = Vec::new();

        // Cross 1024 by a hair: push 1026, pop once -> 1025 remain (> 1024).
        for i in 0..1026u32 {
            mb.push(msg(i), &q);
        }
        if let Pop::Message { overload: Some(n), .. } = mb.pop() {
            reports.push(n);
        }
        assert_eq!(reports, vec![1025], "first breach must report the post-pop length, not the round threshold");

        // Drain most of the backlog without coming anywhere near the new threshold (2048).
        for _ in 0..1000 {
            assert!(matches!(mb.pop(), Pop::Message { overload: None, .. }));
        }
        assert_eq!(mb.length(), 25);

        // Cross 2048 by a hair the same way.
        for i in 0..2026u32 {
            mb.push(msg(i), &q);
        }
        if let Pop::Message { overload: Some(n), .. } = mb.pop() {
            reports.push(n);
        }
        assert_eq!(reports, vec![1025, 2050], "second breach must only fire once, at the new threshold");

        // No further report until 4096 is actually crossed.
        for _ in 0..2000 {
            assert!(matches!(mb.pop(), Pop::Message { overload: None, .. }));
        }
        assert_eq!(reports.len(), 2);
    }

    #[test]
    fn mark_release_links_idle_mailbox() {
        let mb = Arc::new(Mailbox::new(Handle(1)));
        let q = ReadyQueue::new();
        assert!(matches!(mb.pop(), Pop::Empty));
        mb.push(msg(1), &q);
        q.pop(); // simulate a worker detaching it for dispatch
        assert!(matches!(mb.pop(), Pop::Empty)); // drains the one message, goes idle

        mb.mark_release(&q);
        assert!(!q.is_empty(), "mark_release must re-link an idle mailbox");
        assert!(mb.is_released());
    }

    #[test]
    fn drain_on_release_visits_every_remaining_message_once() {
        let mb = Arc::new(Mailbox::new(Handle(1)));
        let q = ReadyQueue::new();
        for i in 0..10u32 {
            mb.push(msg(i), &q);
        }
        mb.mark_release(&q);
        let mut dropped = Vec::new();
        mb.drain_on_release(|m| dropped.push(m.source.0));
        assert_eq!(dropped, (0..10).collect::<Vec<_>>());
        assert_eq!(mb.length(), 0);
    }
}
