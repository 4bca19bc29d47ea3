//! # Transport Health Monitor
//!
//! Background loop that probes every adapter once per poll interval and
//! publishes an availability table. The monitor is the only writer; readers
//! get immutable snapshots through a [`HealthView`], so a reader never sees
//! a half-updated table.
//!
//! Probes of modem-backed adapters run under a [`ModemLease`](crate::arbiter::ModemLease).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use quanta::Instant;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterSet, TransportAdapter};
use crate::arbiter::{LeaseHolder, ModemArbiter};
use crate::config::HealthConfig;
use crate::message::TransportKind;

/// Last known availability of one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    pub transport: TransportKind,
    pub available: bool,
    /// Wall-clock time of the last completed probe; `None` until the first one.
    pub last_checked_at: Option<DateTime<Utc>>,
    pub probes: u64,
}

impl TransportStatus {
    fn unprobed(transport: TransportKind) -> Self {
        Self {
            transport,
            available: false,
            last_checked_at: None,
            probes: 0,
        }
    }
}

/// One entry per known transport, created at startup and never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusTable {
    entries: BTreeMap<TransportKind, TransportStatus>,
}

impl StatusTable {
    pub fn new(kinds: impl IntoIterator<Item = TransportKind>) -> Self {
        Self {
            entries: kinds
                .into_iter()
                .map(|k| (k, TransportStatus::unprobed(k)))
                .collect(),
        }
    }

    pub fn get(&self, kind: TransportKind) -> Option<&TransportStatus> {
        self.entries.get(&kind)
    }

    /// Unknown transports are unavailable.
    pub fn is_available(&self, kind: TransportKind) -> bool {
        self.entries.get(&kind).is_some_and(|s| s.available)
    }

    pub fn any_available(&self) -> bool {
        self.entries.values().any(|s| s.available)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransportStatus> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn mark(&mut self, kind: TransportKind, available: bool) {
        self.record(kind, available, Utc::now());
    }

    fn record(&mut self, kind: TransportKind, available: bool, at: DateTime<Utc>) -> Option<HealthEvent> {
        let entry = self
            .entries
            .entry(kind)
            .or_insert_with(|| TransportStatus::unprobed(kind));
        let was = entry.available;
        entry.available = available;
        entry.last_checked_at = Some(at);
        entry.probes += 1;
        match (was, available) {
            (false, true) => Some(HealthEvent::TransportUp { transport: kind }),
            (true, false) => Some(HealthEvent::TransportDown { transport: kind }),
            _ => None,
        }
    }
}

/// Availability transitions observed during a probe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    TransportUp { transport: TransportKind },
    TransportDown { transport: TransportKind },
}

/// Read-only, cloneable access to the latest published status table.
#[derive(Clone)]
pub struct HealthView {
    table: Arc<ArcSwap<StatusTable>>,
}

impl HealthView {
    /// Consistent copy of the whole table.
    pub fn snapshot(&self) -> Arc<StatusTable> {
        self.table.load_full()
    }

    pub fn is_transport_available(&self, kind: TransportKind) -> bool {
        self.table.load().is_available(kind)
    }

    pub fn any_transport_available(&self) -> bool {
        self.table.load().any_available()
    }

    pub fn status(&self, kind: TransportKind) -> Option<TransportStatus> {
        self.table.load().get(kind).cloned()
    }
}

pub struct HealthMonitor {
    adapters: AdapterSet,
    arbiter: Arc<ModemArbiter>,
    config: HealthConfig,
    table: Arc<ArcSwap<StatusTable>>,
}

impl HealthMonitor {
    pub fn new(adapters: AdapterSet, arbiter: Arc<ModemArbiter>, config: HealthConfig) -> Self {
        let table = StatusTable::new(adapters.kinds());
        Self {
            adapters,
            arbiter,
            config,
            table: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    pub fn view(&self) -> HealthView {
        HealthView {
            table: self.table.clone(),
        }
    }

    /// Probes every adapter once, publishing after each probe.
    pub fn probe_all(&self) -> Vec<HealthEvent> {
        self.probe_cycle(None)
    }

    /// Probes once, then runs the poll loop on a background thread until the
    /// returned handle is stopped.
    pub fn start(self) -> Result<MonitorHandle> {
        log_events(&self.probe_all());

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("commlink-health".into())
            .spawn(move || self.run(stop_rx))
            .context("failed to spawn health monitor thread")?;

        Ok(MonitorHandle {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    fn run(self, stop_rx: Receiver<()>) {
        debug!(poll_interval = ?self.config.poll_interval, "health monitor running");
        loop {
            match stop_rx.recv_timeout(self.config.poll_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            log_events(&self.probe_cycle(Some(&stop_rx)));
        }
        debug!("health monitor stopped");
    }

    fn probe_cycle(&self, stop_rx: Option<&Receiver<()>>) -> Vec<HealthEvent> {
        let mut events = Vec::new();
        for adapter in self.adapters.iter() {
            if stop_rx.is_some_and(stop_requested) {
                break;
            }
            let available = self.probe(adapter.as_ref());

            let mut next = StatusTable::clone(&self.table.load());
            if let Some(event) = next.record(adapter.id(), available, Utc::now()) {
                events.push(event);
            }
            self.table.store(Arc::new(next));
        }
        events
    }

    fn probe(&self, adapter: &dyn TransportAdapter) -> bool {
        let kind = adapter.id();
        // Timed from inside the lease; waiting for the modem is not probe time.
        let timed = || {
            let start = Instant::now();
            let available = adapter.is_available();
            (available, start.elapsed())
        };
        let (available, elapsed) = if adapter.requires_exclusive_hardware() {
            self.arbiter.with_lease(LeaseHolder::Probe(kind), timed)
        } else {
            timed()
        };
        if elapsed > self.config.probe_timeout {
            warn!(
                transport = %kind,
                elapsed_ms = elapsed.as_millis() as u64,
                limit_ms = self.config.probe_timeout.as_millis() as u64,
                "probe exceeded its timeout"
            );
        }
        debug!(transport = %kind, available, "probe complete");
        available
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

fn log_events(events: &[HealthEvent]) {
    for event in events {
        match event {
            HealthEvent::TransportUp { transport } => {
                info!(transport = %transport, "transport available");
            }
            HealthEvent::TransportDown { transport } => {
                warn!(transport = %transport, "transport lost");
            }
        }
    }
}

/// Owns the monitor thread. Dropping it stops the loop.
pub struct MonitorHandle {
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MonitorHandle {
    /// Wakes the loop out of its poll wait and joins it. Idempotent.
    pub fn stop(&mut self) {
        // Disconnecting the channel is observed by both the poll wait and
        // the between-probe check.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ResolvedPayload;
    use crate::message::Message;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    const TEST_POLL: Duration = Duration::from_millis(20);

    struct Toggle {
        kind: TransportKind,
        up: AtomicBool,
        probes: AtomicU64,
        exclusive: bool,
        delay: Duration,
    }

    impl Toggle {
        fn new(kind: TransportKind, up: bool) -> Arc<Self> {
            Self::slow(kind, up, Duration::ZERO)
        }

        fn slow(kind: TransportKind, up: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                kind,
                up: AtomicBool::new(up),
                probes: AtomicU64::new(0),
                exclusive: false,
                delay,
            })
        }
    }

    impl TransportAdapter for Toggle {
        fn id(&self) -> TransportKind {
            self.kind
        }
        fn is_available(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.up.load(Ordering::SeqCst)
        }
        fn send(&self, _m: &Message, _a: Option<&str>, _p: ResolvedPayload<'_>) -> Result<bool> {
            Ok(true)
        }
        fn requires_exclusive_hardware(&self) -> bool {
            self.exclusive
        }
    }

    fn monitor(adapters: Vec<Arc<dyn TransportAdapter>>) -> (HealthMonitor, Arc<ModemArbiter>) {
        let arbiter = Arc::new(ModemArbiter::new());
        let config = HealthConfig {
            poll_interval: TEST_POLL,
            probe_timeout: Duration::from_millis(100),
        };
        (
            HealthMonitor::new(AdapterSet::new(adapters).unwrap(), arbiter.clone(), config),
            arbiter,
        )
    }

    #[test]
    fn table_starts_unprobed() {
        let email = Toggle::new(TransportKind::Email, true);
        let (mon, _) = monitor(vec![email]);
        let snap = mon.view().snapshot();
        assert_eq!(snap.len(), 1);
        let status = snap.get(TransportKind::Email).unwrap();
        assert!(!status.available);
        assert!(status.last_checked_at.is_none());
        assert!(!mon.view().any_transport_available());
    }

    #[test]
    fn probe_all_publishes_and_reports_transitions() {
        let email = Toggle::new(TransportKind::Email, true);
        let sms = Toggle::new(TransportKind::Sms, false);
        let (mon, _) = monitor(vec![email.clone(), sms.clone()]);
        let view = mon.view();

        let events = mon.probe_all();
        assert_eq!(
            events,
            vec![HealthEvent::TransportUp {
                transport: TransportKind::Email
            }]
        );
        assert!(view.is_transport_available(TransportKind::Email));
        assert!(!view.is_transport_available(TransportKind::Sms));
        assert!(view.any_transport_available());
        assert!(view.status(TransportKind::Sms).unwrap().last_checked_at.is_some());

        email.up.store(false, Ordering::SeqCst);
        sms.up.store(true, Ordering::SeqCst);
        let events = mon.probe_all();
        assert_eq!(
            events,
            vec![
                HealthEvent::TransportDown {
                    transport: TransportKind::Email
                },
                HealthEvent::TransportUp {
                    transport: TransportKind::Sms
                },
            ]
        );
        assert_eq!(view.status(TransportKind::Email).unwrap().probes, 2);
    }

    #[test]
    fn unknown_transport_is_unavailable() {
        let (mon, _) = monitor(vec![Toggle::new(TransportKind::Email, true)]);
        mon.probe_all();
        assert!(!mon.view().is_transport_available(TransportKind::Radio));
    }

    #[test]
    fn exclusive_probe_goes_through_arbiter() {
        let modem = Arc::new(Toggle {
            kind: TransportKind::Sms,
            up: AtomicBool::new(true),
            probes: AtomicU64::new(0),
            exclusive: true,
            delay: Duration::ZERO,
        });
        let (mon, arbiter) = monitor(vec![modem, Toggle::new(TransportKind::Email, true)]);
        mon.probe_all();
        assert_eq!(arbiter.stats().acquisitions, 1);
        assert_eq!(arbiter.stats().releases, 1);
    }

    #[test]
    fn loop_keeps_probing_until_stopped() {
        let email = Toggle::new(TransportKind::Email, true);
        let (mon, _) = monitor(vec![email.clone()]);
        let view = mon.view();
        let mut handle = mon.start().unwrap();
        assert!(view.any_transport_available());

        thread::sleep(Duration::from_millis(120));
        assert!(handle.is_running());
        handle.stop();
        assert!(!handle.is_running());

        let probes = email.probes.load(Ordering::SeqCst);
        assert!(probes >= 3, "expected several probe cycles, got {probes}");
        thread::sleep(Duration::from_millis(60));
        assert_eq!(email.probes.load(Ordering::SeqCst), probes);
    }

    #[test]
    fn stop_wakes_long_poll_wait() {
        let arbiter = Arc::new(ModemArbiter::new());
        let mon = HealthMonitor::new(
            AdapterSet::new(vec![Toggle::new(TransportKind::Email, false)]).unwrap(),
            arbiter,
            HealthConfig {
                poll_interval: Duration::from_secs(30),
                probe_timeout: Duration::from_millis(100),
            },
        );
        let mut handle = mon.start().unwrap();
        let start = std::time::Instant::now();
        handle.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stop_during_slow_probe_skips_rest_of_cycle() {
        let poll = Duration::from_millis(50);
        let probe_timeout = Duration::from_millis(300);
        let email = Toggle::slow(TransportKind::Email, true, Duration::from_millis(150));
        let sms = Toggle::slow(TransportKind::Sms, true, Duration::from_millis(150));
        let mon = HealthMonitor::new(
            AdapterSet::new(vec![email.clone(), sms.clone()]).unwrap(),
            Arc::new(ModemArbiter::new()),
            HealthConfig {
                poll_interval: poll,
                probe_timeout,
            },
        );
        let mut handle = mon.start().unwrap();

        // Second email call means the loop is inside its first cycle.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while email.probes.load(Ordering::SeqCst) < 2 {
            assert!(std::time::Instant::now() < deadline, "loop never probed again");
            thread::sleep(Duration::from_millis(2));
        }

        let start = std::time::Instant::now();
        handle.stop();
        let elapsed = start.elapsed();
        assert!(elapsed < poll + probe_timeout, "stop took {elapsed:?}");

        assert_eq!(email.probes.load(Ordering::SeqCst), 2);
        assert_eq!(sms.probes.load(Ordering::SeqCst), 1);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(sms.probes.load(Ordering::SeqCst), 1);
    }
}
