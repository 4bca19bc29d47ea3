//! # Transmitter
//!
//! Background loop that takes the next message from the
//! [`TransmissionScheduler`] and drives it to a terminal state.
//!
//! **Per-message pipeline:**
//! ```text
//! 1. expired?            → Expired, never attempted
//! 2. resolve file path   → Discarded (MalformedFilePath) if unreadable
//! 3. plan candidates     → preferred (if available), then fixed fallback order
//! 4. send in plan order  → first success is Delivered
//! 5. plan exhausted      → next pass (up to max_passes), else Discarded
//! ```
//!
//! Sends over modem-backed adapters hold a [`ModemLease`](crate::arbiter::ModemLease)
//! for the duration of the call.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, TrySendError};
use quanta::Instant;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterSet, ResolvedPayload, TransportAdapter};
use crate::arbiter::{LeaseHolder, ModemArbiter};
use crate::config::{PreferredPolicy, TransmitterConfig};
use crate::contacts::ContactDirectory;
use crate::error::DeliveryError;
use crate::health::{HealthView, StatusTable};
use crate::message::{DeliveryState, Message, Payload, TransportKind};
use crate::scheduler::{Dequeue, PendingMessage, TransmissionScheduler};

// ─── Reports & counters ─────────────────────────────────────────────────

/// One send attempt made for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub transport: TransportKind,
    /// `None` when the attempt delivered the message.
    pub error: Option<DeliveryError>,
}

/// Terminal outcome of one dequeued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub seq: u64,
    pub receiver: String,
    pub priority: u8,
    pub state: DeliveryState,
    /// Transport that accepted the message.
    pub delivered_via: Option<TransportKind>,
    /// Why the message was not delivered.
    pub reason: Option<DeliveryError>,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    expired: AtomicU64,
    discarded: AtomicU64,
    malformed: AtomicU64,
    attempts: AtomicU64,
    send_failures: AtomicU64,
    slow_sends: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub delivered: u64,
    pub expired: u64,
    /// Includes `malformed`.
    pub discarded: u64,
    pub malformed: u64,
    pub attempts: u64,
    pub send_failures: u64,
    /// Sends that ran past `send_timeout` once the modem lease was held.
    pub slow_sends: u64,
}

impl DeliveryCounts {
    /// Messages that reached a terminal state.
    pub fn settled(&self) -> u64 {
        self.delivered + self.expired + self.discarded
    }
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryCounts {
        DeliveryCounts {
            delivered: self.delivered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            slow_sends: self.slow_sends.load(Ordering::Relaxed),
        }
    }
}

// ─── Candidate planning ─────────────────────────────────────────────────

/// Ordered list of transports to try for one pass.
///
/// The preferred transport goes first when it is available. Under
/// [`PreferredPolicy::PreferredOnly`] a message with a preference is never
/// tried anywhere else. Unavailable transports are left out.
pub fn fallback_plan(
    preferred: Option<TransportKind>,
    table: &StatusTable,
    order: &[TransportKind],
    policy: PreferredPolicy,
) -> Vec<TransportKind> {
    let mut plan = Vec::with_capacity(order.len() + 1);
    if let Some(p) = preferred {
        if table.is_available(p) {
            plan.push(p);
        }
        if policy == PreferredPolicy::PreferredOnly {
            return plan;
        }
    }
    plan.extend(
        order
            .iter()
            .copied()
            .filter(|&k| Some(k) != preferred && table.is_available(k)),
    );
    plan
}

/// Checks that a file payload points at a readable regular file.
/// Relative references are taken relative to `root`.
pub fn resolve_file(reference: &Path, root: &Path) -> Result<PathBuf, DeliveryError> {
    let path = if reference.is_absolute() {
        reference.to_path_buf()
    } else {
        root.join(reference)
    };
    let readable = std::fs::metadata(&path).is_ok_and(|m| m.is_file())
        && std::fs::File::open(&path).is_ok();
    if readable {
        Ok(path)
    } else {
        Err(DeliveryError::MalformedFilePath(path))
    }
}

enum Outcome {
    Delivered(TransportKind),
    Expired(DeliveryError),
    Discarded(DeliveryError),
}

// ─── Transmitter ────────────────────────────────────────────────────────

pub struct Transmitter {
    scheduler: Arc<TransmissionScheduler>,
    adapters: AdapterSet,
    arbiter: Arc<ModemArbiter>,
    health: HealthView,
    config: TransmitterConfig,
    file_root: PathBuf,
    stats: Arc<DeliveryStats>,
    reports: Option<Sender<DeliveryReport>>,
    contacts: Option<Arc<dyn ContactDirectory>>,
}

impl Transmitter {
    pub fn new(
        scheduler: Arc<TransmissionScheduler>,
        adapters: AdapterSet,
        arbiter: Arc<ModemArbiter>,
        health: HealthView,
        config: TransmitterConfig,
        file_root: PathBuf,
    ) -> Self {
        Self {
            scheduler,
            adapters,
            arbiter,
            health,
            config,
            file_root,
            stats: Arc::new(DeliveryStats::default()),
            reports: None,
            contacts: None,
        }
    }

    /// Looks up the receiver's per-transport address before every attempt.
    pub fn with_contacts(mut self, contacts: Arc<dyn ContactDirectory>) -> Self {
        self.contacts = Some(contacts);
        self
    }

    /// Publishes a [`DeliveryReport`] per settled message. Reports are
    /// dropped when the channel is full.
    pub fn with_reports(mut self, tx: Sender<DeliveryReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        self.stats.clone()
    }

    /// Drives one dequeued message to its terminal state.
    pub fn process(&self, mut pending: PendingMessage) -> DeliveryReport {
        let mut attempts = Vec::new();
        let outcome = self.deliver(&pending, &mut attempts);

        let msg = pending.message();
        let (state, delivered_via, reason) = match outcome {
            Outcome::Delivered(kind) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                info!(
                    seq = pending.seq(),
                    receiver = msg.receiver(),
                    transport = %kind,
                    "message delivered"
                );
                (DeliveryState::Delivered, Some(kind), None)
            }
            Outcome::Expired(reason) => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                info!(
                    seq = pending.seq(),
                    receiver = msg.receiver(),
                    %reason,
                    "message expired, discarded"
                );
                (DeliveryState::Expired, None, Some(reason))
            }
            Outcome::Discarded(reason) => {
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                if matches!(reason, DeliveryError::MalformedFilePath(_)) {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                }
                warn!(
                    seq = pending.seq(),
                    receiver = msg.receiver(),
                    attempts = attempts.len(),
                    %reason,
                    "message discarded"
                );
                (DeliveryState::Discarded, None, Some(reason))
            }
        };

        let report = DeliveryReport {
            seq: pending.seq(),
            receiver: msg.receiver().to_string(),
            priority: msg.priority(),
            state,
            delivered_via,
            reason,
            attempts,
        };
        pending.settle(state);
        report
    }

    /// Runs the dequeue loop on a background thread.
    pub fn start(self) -> Result<TransmitterHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let scheduler = self.scheduler.clone();
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("commlink-tx".into())
            .spawn(move || self.run(stop_flag))
            .context("failed to spawn transmitter thread")?;

        Ok(TransmitterHandle {
            scheduler,
            stop,
            handle: Some(handle),
        })
    }

    fn run(self, stop: Arc<AtomicBool>) {
        debug!("transmitter running");
        while !stop.load(Ordering::Acquire) {
            match self.scheduler.dequeue_timeout(self.config.dequeue_wait) {
                Dequeue::Message(pending) => {
                    let report = self.process(pending);
                    self.publish(report);
                }
                Dequeue::TimedOut => {}
                Dequeue::Stopped => break,
            }
        }
        debug!("transmitter stopped");
    }

    fn publish(&self, report: DeliveryReport) {
        if let Some(tx) = &self.reports {
            match tx.try_send(report) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(r)) => {
                    debug!(seq = r.seq, "report channel full, report dropped");
                }
            }
        }
    }

    fn deliver(&self, pending: &PendingMessage, attempts: &mut Vec<Attempt>) -> Outcome {
        let clock = self.scheduler.clock();
        let msg = pending.message();

        if let Some(reason) = expiry(pending, clock.now()) {
            return Outcome::Expired(reason);
        }

        let mut file = None;
        let payload = match resolve_payload(msg.payload(), &self.file_root, &mut file) {
            Ok(p) => p,
            Err(reason) => return Outcome::Discarded(reason),
        };

        let mut last_error = None;
        for pass in 0..self.config.max_passes {
            if pass > 0 {
                if let Some(reason) = expiry(pending, clock.now()) {
                    return Outcome::Expired(reason);
                }
            }

            let table = self.health.snapshot();
            let plan = fallback_plan(
                msg.preferred_transport(),
                &table,
                &self.config.fallback_order,
                self.config.preferred_policy,
            );
            if plan.is_empty() {
                debug!(seq = pending.seq(), pass, "no transport available");
                if last_error.is_none() {
                    last_error = Some(DeliveryError::TransportUnavailable(self.nominal(msg)));
                }
                continue;
            }

            for kind in plan {
                match self.attempt(kind, msg, payload) {
                    Ok(()) => {
                        attempts.push(Attempt {
                            transport: kind,
                            error: None,
                        });
                        return Outcome::Delivered(kind);
                    }
                    Err(err) => {
                        attempts.push(Attempt {
                            transport: kind,
                            error: Some(err.clone()),
                        });
                        last_error = Some(err);
                    }
                }
            }
        }

        Outcome::Discarded(
            last_error.unwrap_or_else(|| DeliveryError::TransportUnavailable(self.nominal(msg))),
        )
    }

    /// Transport named in "unavailable" reasons when nothing was attempted.
    fn nominal(&self, msg: &Message) -> TransportKind {
        msg.preferred_transport()
            .or_else(|| self.config.fallback_order.first().copied())
            .unwrap_or(TransportKind::Network)
    }

    fn attempt(
        &self,
        kind: TransportKind,
        msg: &Message,
        payload: ResolvedPayload<'_>,
    ) -> Result<(), DeliveryError> {
        let Some(adapter) = self.adapters.get(kind) else {
            return Err(DeliveryError::TransportUnavailable(kind));
        };
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);

        let address = self
            .contacts
            .as_ref()
            .and_then(|c| c.address(msg.receiver(), kind));
        let send = || self.timed_send(adapter.as_ref(), msg, address.as_deref(), payload);

        // Contention only delays the attempt, it never fails it.
        let result = if adapter.requires_exclusive_hardware() {
            let holder = LeaseHolder::Send(kind);
            let _lease = match self.arbiter.try_acquire(holder) {
                Some(lease) => lease,
                None => {
                    debug!(
                        transport = %kind,
                        reason = %DeliveryError::ResourceContention,
                        "send waiting for modem"
                    );
                    self.arbiter.acquire(holder)
                }
            };
            send()
        } else {
            send()
        };

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                debug!(transport = %kind, receiver = msg.receiver(), "send failed, trying next transport");
                Err(DeliveryError::SendFailed(kind))
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                error!(transport = %kind, error = %e, "adapter fault during send");
                Err(DeliveryError::SendFailed(kind))
            }
        }
    }

    fn timed_send(
        &self,
        adapter: &dyn TransportAdapter,
        msg: &Message,
        address: Option<&str>,
        payload: ResolvedPayload<'_>,
    ) -> Result<bool> {
        let start = Instant::now();
        let result = adapter.send(msg, address, payload);
        if warn_if_slow(adapter.id(), start.elapsed(), self.config.send_timeout) {
            self.stats.slow_sends.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

fn expiry(pending: &PendingMessage, now: Instant) -> Option<DeliveryError> {
    pending.is_expired(now).then(|| DeliveryError::MessageExpired {
        age: pending.age(now),
        timeout: pending.message().timeout(),
    })
}

fn resolve_payload<'a>(
    payload: &'a Payload,
    root: &Path,
    resolved: &'a mut Option<PathBuf>,
) -> Result<ResolvedPayload<'a>, DeliveryError> {
    match payload {
        Payload::Text(text) => Ok(ResolvedPayload::Text(text)),
        Payload::File(reference) => {
            let path = resolve_file(reference, root)?;
            Ok(ResolvedPayload::File(resolved.insert(path).as_path()))
        }
    }
}

fn warn_if_slow(kind: TransportKind, elapsed: Duration, limit: Duration) -> bool {
    let slow = elapsed > limit;
    if slow {
        warn!(
            transport = %kind,
            elapsed_ms = elapsed.as_millis() as u64,
            limit_ms = limit.as_millis() as u64,
            "send exceeded its timeout"
        );
    }
    slow
}

/// Owns the transmitter thread. Dropping it stops the loop.
pub struct TransmitterHandle {
    scheduler: Arc<TransmissionScheduler>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TransmitterHandle {
    /// Stops the scheduler, waits for the in-flight message (if any) to
    /// settle and joins the thread. Returns how many queued messages were
    /// dropped. Idempotent.
    pub fn stop(&mut self) -> usize {
        self.stop.store(true, Ordering::Release);
        let abandoned = self.scheduler.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        abandoned
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TransmitterHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
