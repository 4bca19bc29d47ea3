//! # Transmission Scheduler
//!
//! Bounded priority queue of outbound messages shared between callers
//! (enqueue) and the transmitter (dequeue).
//!
//! Dispatch order:
//! ```text
//! 1. priority, highest first
//! 2. timeout, shortest first (closest to expiry)
//! 3. enqueue order, oldest first
//! ```
//!
//! A full queue rejects new messages instead of growing. Consumers block on a
//! condition variable that is signalled when the queue goes from empty to
//! non-empty, and on stop.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use quanta::{Clock, Instant};
use tracing::{debug, warn};

use crate::error::{DeliveryError, EnqueueError};
use crate::message::{DeliveryState, Message};

/// A message owned by the scheduler or, after dequeue, by the transmitter.
///
/// Carries the queue bookkeeping a [`Message`] itself does not: when it was
/// enqueued, its insertion sequence number and its delivery state.
#[derive(Debug)]
pub struct PendingMessage {
    message: Message,
    created_at: Instant,
    seq: u64,
    state: DeliveryState,
}

impl PendingMessage {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Enqueue time, read from the scheduler's clock.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Insertion sequence number, unique per scheduler.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// True once more than `timeout` has passed since enqueue.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.age(now) > self.message.timeout()
    }

    /// Moves a pending message into a terminal state. Returns false, leaving
    /// the state untouched, if it already left `Pending` or `to` is `Pending`.
    pub(crate) fn settle(&mut self, to: DeliveryState) -> bool {
        if self.state.is_terminal() || !to.is_terminal() {
            return false;
        }
        self.state = to;
        true
    }
}

/// Heap entry; the greatest entry is dispatched first.
struct Queued(PendingMessage);

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        let (a, b) = (&self.0, &other.0);
        a.message
            .priority()
            .cmp(&b.message.priority())
            .then_with(|| b.message.timeout().cmp(&a.message.timeout()))
            .then_with(|| b.seq.cmp(&a.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Queued {}

/// Outcome of a dequeue attempt.
#[derive(Debug)]
pub enum Dequeue {
    Message(PendingMessage),
    /// The bounded wait elapsed with the queue still empty.
    TimedOut,
    /// The scheduler was stopped; no further messages will be handed out.
    Stopped,
}

struct QueueState {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    stopped: bool,
}

pub struct TransmissionScheduler {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
    clock: Clock,
    rejected: AtomicU64,
}

impl TransmissionScheduler {
    /// Creates a scheduler holding at most `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Clock::new())
    }

    /// Creates a scheduler stamping enqueue times from `clock`.
    pub fn with_clock(capacity: usize, clock: Clock) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::with_capacity(capacity),
                next_seq: 0,
                stopped: false,
            }),
            ready: Condvar::new(),
            capacity,
            clock,
            rejected: AtomicU64::new(0),
        }
    }

    /// Adds a message. On `Full` the queue is unchanged and the message is
    /// handed back inside the error.
    pub fn enqueue(&self, message: Message) -> Result<(), EnqueueError> {
        let mut state = self.lock();
        if state.stopped {
            return Err(EnqueueError::Stopped(message));
        }
        if state.heap.len() >= self.capacity {
            drop(state);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                receiver = message.receiver(),
                capacity = self.capacity,
                reason = %DeliveryError::BufferFull,
                "message rejected"
            );
            return Err(EnqueueError::Full(message));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let was_empty = state.heap.is_empty();
        debug!(
            seq,
            priority = message.priority(),
            receiver = message.receiver(),
            "message queued"
        );
        state.heap.push(Queued(PendingMessage {
            message,
            created_at: self.clock.now(),
            seq,
            state: DeliveryState::Pending,
        }));
        drop(state);

        if was_empty {
            self.ready.notify_one();
        }
        Ok(())
    }

    /// Waits up to `wait` for a message.
    pub fn dequeue_timeout(&self, wait: Duration) -> Dequeue {
        let guard = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(guard, wait, |s| s.heap.is_empty() && !s.stopped)
            .unwrap_or_else(|e| e.into_inner());
        Self::take(&mut state)
    }

    /// Waits until a message is available or the scheduler is stopped.
    pub fn dequeue_blocking(&self) -> Dequeue {
        let guard = self.lock();
        let mut state = self
            .ready
            .wait_while(guard, |s| s.heap.is_empty() && !s.stopped)
            .unwrap_or_else(|e| e.into_inner());
        Self::take(&mut state)
    }

    /// Pops the next message without waiting.
    pub fn try_dequeue(&self) -> Option<PendingMessage> {
        match Self::take(&mut self.lock()) {
            Dequeue::Message(pending) => Some(pending),
            Dequeue::TimedOut | Dequeue::Stopped => None,
        }
    }

    /// Refuses further enqueues, wakes every waiting consumer and drops
    /// whatever is still queued. Returns how many messages were dropped.
    pub fn stop(&self) -> usize {
        let mut state = self.lock();
        if state.stopped {
            return 0;
        }
        state.stopped = true;
        let abandoned = state.heap.len();
        state.heap.clear();
        drop(state);
        self.ready.notify_all();
        abandoned
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueues rejected because the buffer was full.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    fn take(state: &mut QueueState) -> Dequeue {
        if state.stopped {
            return Dequeue::Stopped;
        }
        match state.heap.pop() {
            Some(Queued(pending)) => Dequeue::Message(pending),
            None => Dequeue::TimedOut,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
