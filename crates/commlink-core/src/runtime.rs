//! # Runtime
//!
//! [`CommlinkRuntime`] owns every shared component and both background
//! loops. It is the single context object handed to callers; nothing in the
//! crate is process-global.
//!
//! ```text
//!  caller ──send/enqueue──▶ TransmissionScheduler ──▶ Transmitter ──▶ adapters
//!                                                        │   ▲
//!                                       ModemArbiter ◀───┘   │ HealthView
//!  adapters ──is_available──▶ HealthMonitor ──publish──────────┘
//!  listeners ──push──▶ ReceptionSink ──receive──▶ caller
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, bounded};
use quanta::Clock;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterSet, TransportAdapter};
use crate::arbiter::{ArbiterStats, LeaseHolder, ModemArbiter};
use crate::config::CommlinkConfig;
use crate::contacts::{ContactDirectory, StaticContacts};
use crate::error::{DeliveryError, EnqueueError};
use crate::health::{HealthMonitor, HealthView, MonitorHandle, StatusTable, TransportStatus};
use crate::message::{Message, Payload, PayloadKind, TransportKind};
use crate::reception::{ReceivedMessage, ReceptionHandle, ReceptionSink};
use crate::scheduler::TransmissionScheduler;
use crate::transmitter::{
    DeliveryCounts, DeliveryReport, DeliveryStats, Transmitter, TransmitterHandle,
};

/// Caller-facing send request. Unset fields take the configured defaults
/// for the payload kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub receiver: String,
    pub payload: Payload,
    pub preferred: Option<TransportKind>,
    pub priority: Option<u8>,
    pub timeout: Option<Duration>,
}

impl SendRequest {
    pub fn text(receiver: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(receiver, Payload::Text(text.into()))
    }

    pub fn file(receiver: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(receiver, Payload::File(path.into()))
    }

    fn new(receiver: impl Into<String>, payload: Payload) -> Self {
        Self {
            receiver: receiver.into(),
            payload,
            preferred: None,
            priority: None,
            timeout: None,
        }
    }

    pub fn preferred(mut self, transport: TransportKind) -> Self {
        self.preferred = Some(transport);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct CommlinkRuntime {
    config: CommlinkConfig,
    adapters: AdapterSet,
    arbiter: Arc<ModemArbiter>,
    scheduler: Arc<TransmissionScheduler>,
    reception: ReceptionSink,
    contacts: Arc<dyn ContactDirectory>,
    health: HealthView,
    stats: Arc<DeliveryStats>,
    // Consumed by `start()`.
    monitor: Option<HealthMonitor>,
    transmitter: Option<Transmitter>,
    monitor_handle: Option<MonitorHandle>,
    transmitter_handle: Option<TransmitterHandle>,
    stopped: bool,
}

impl CommlinkRuntime {
    /// Wires every component from `config`. Fails when no adapter is given,
    /// two adapters share a transport tag, or the fallback order names no
    /// registered adapter.
    pub fn new(config: CommlinkConfig, adapters: Vec<Arc<dyn TransportAdapter>>) -> Result<Self> {
        Self::with_clock(config, adapters, Clock::new())
    }

    /// Same as [`new`](Self::new) with an injected clock for message expiry.
    pub fn with_clock(
        config: CommlinkConfig,
        adapters: Vec<Arc<dyn TransportAdapter>>,
        clock: Clock,
    ) -> Result<Self> {
        let adapters = AdapterSet::new(adapters).context("invalid adapter set")?;
        let order = &config.transmitter.fallback_order;
        if !order.iter().any(|&k| adapters.contains(k)) {
            error!(?order, registered = ?adapters.kinds(), "fallback order names no registered adapter");
            bail!("fallback order {order:?} names no registered adapter");
        }
        for kind in order.iter().filter(|&&k| !adapters.contains(k)) {
            debug!(transport = %kind, "no adapter registered, skipped in fallback order");
        }

        let arbiter = Arc::new(ModemArbiter::new());
        let scheduler = Arc::new(TransmissionScheduler::with_clock(
            config.transmission_capacity,
            clock,
        ));
        let monitor = HealthMonitor::new(adapters.clone(), arbiter.clone(), config.health.clone());
        let health = monitor.view();
        let contacts: Arc<dyn ContactDirectory> =
            Arc::new(StaticContacts::new(config.contacts.clone()));
        let transmitter = Transmitter::new(
            scheduler.clone(),
            adapters.clone(),
            arbiter.clone(),
            health.clone(),
            config.transmitter.clone(),
            config.file_root.clone(),
        )
        .with_contacts(contacts.clone());
        let stats = transmitter.stats();

        Ok(Self {
            reception: ReceptionSink::new(config.reception_capacity),
            config,
            adapters,
            arbiter,
            scheduler,
            contacts,
            health,
            stats,
            monitor: Some(monitor),
            transmitter: Some(transmitter),
            monitor_handle: None,
            transmitter_handle: None,
            stopped: false,
        })
    }

    /// Replaces the directory built from the `[contacts]` table. Adapters
    /// see addresses from the new directory only if this runs before
    /// [`start`](Self::start).
    pub fn with_contacts(mut self, contacts: Arc<dyn ContactDirectory>) -> Self {
        self.transmitter = self
            .transmitter
            .take()
            .map(|t| t.with_contacts(contacts.clone()));
        self.contacts = contacts;
        self
    }

    /// Subscribes to one [`DeliveryReport`] per settled message. Must be
    /// called before [`start`](Self::start).
    pub fn delivery_reports(&mut self, capacity: usize) -> Result<Receiver<DeliveryReport>> {
        let Some(transmitter) = self.transmitter.take() else {
            bail!("delivery reports must be requested before start");
        };
        let (tx, rx) = bounded(capacity.max(1));
        self.transmitter = Some(transmitter.with_reports(tx));
        Ok(rx)
    }

    /// Runs the initial probe cycle, then starts the health and transmit
    /// loops. Returns whether any transport came up; having none is not an
    /// error.
    pub fn start(&mut self) -> Result<bool> {
        if self.stopped {
            bail!("runtime was stopped");
        }
        let (Some(monitor), Some(transmitter)) = (self.monitor.take(), self.transmitter.take())
        else {
            bail!("runtime already started");
        };

        self.monitor_handle = Some(monitor.start()?);
        self.transmitter_handle = Some(transmitter.start()?);

        let any = self.health.any_transport_available();
        if any {
            info!(
                adapters = self.adapters.len(),
                capacity = self.scheduler.capacity(),
                "commlink started"
            );
        } else {
            warn!(adapters = self.adapters.len(), "commlink started with no transport available");
        }
        Ok(any)
    }

    /// Stops both loops and drops whatever is still queued. A send already
    /// in progress is allowed to finish. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let abandoned = match self.transmitter_handle.take() {
            Some(mut handle) => handle.stop(),
            None => self.scheduler.stop(),
        };
        if abandoned > 0 {
            warn!(abandoned, "stopping with queued messages, dropped");
        }
        if let Some(mut handle) = self.monitor_handle.take() {
            handle.stop();
        }
        info!(delivered = self.stats.snapshot().delivered, "commlink stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.stopped && self.transmitter_handle.is_some()
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Queues a fully built message. False when the buffer is full or the
    /// runtime is stopped.
    pub fn enqueue(&self, message: Message) -> bool {
        match self.scheduler.enqueue(message) {
            Ok(()) => true,
            Err(EnqueueError::Full(_)) => false,
            Err(EnqueueError::Stopped(m)) => {
                debug!(receiver = m.receiver(), "runtime stopped, message refused");
                false
            }
        }
    }

    /// Builds a message from `request` and the configured defaults, then
    /// queues it. Unknown receivers never reach the scheduler.
    pub fn send(&self, request: SendRequest) -> bool {
        let receiver = request.receiver.trim();
        if receiver.is_empty() || !self.contacts.knows(receiver) {
            let reason = DeliveryError::UnknownReceiver(receiver.to_string());
            warn!(%reason, "send rejected");
            return false;
        }

        let defaults = match request.payload.kind() {
            PayloadKind::Text => self.config.text_defaults,
            PayloadKind::File => self.config.file_defaults,
        };
        let mut builder = Message::builder(
            receiver,
            self.config.default_sender.as_str(),
            request.payload,
            defaults,
        )
        .preferred(request.preferred);
        if let Some(priority) = request.priority {
            builder = builder.priority(priority);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        self.enqueue(builder.build())
    }

    pub fn queue_len(&self) -> usize {
        self.scheduler.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.scheduler.capacity()
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    pub fn receive(&self) -> Option<ReceivedMessage> {
        self.reception.pop()
    }

    pub fn received_len(&self) -> usize {
        self.reception.len()
    }

    /// Producer handle for adapter listener threads.
    pub fn reception_handle(&self) -> ReceptionHandle {
        self.reception.handle()
    }

    // ── Health ──────────────────────────────────────────────────────────

    pub fn is_transport_available(&self, kind: TransportKind) -> bool {
        self.health.is_transport_available(kind)
    }

    pub fn any_transport_available(&self) -> bool {
        self.health.any_transport_available()
    }

    pub fn transport_status(&self, kind: TransportKind) -> Option<TransportStatus> {
        self.health.status(kind)
    }

    pub fn health_snapshot(&self) -> Arc<StatusTable> {
        self.health.snapshot()
    }

    // ── Data link ───────────────────────────────────────────────────────

    /// Brings up the modem data link. False when no data-link adapter is
    /// registered or the adapter could not connect.
    pub fn connect_data_link(&self) -> bool {
        self.data_link_call(LeaseHolder::DataLinkConnect, |a| a.connect())
    }

    pub fn disconnect_data_link(&self) -> bool {
        self.data_link_call(LeaseHolder::DataLinkDisconnect, |a| a.disconnect())
    }

    fn data_link_call(
        &self,
        holder: LeaseHolder,
        call: impl FnOnce(&dyn TransportAdapter) -> Result<bool>,
    ) -> bool {
        let Some(adapter) = self.adapters.get(TransportKind::DataLink) else {
            warn!(%holder, "no data link adapter registered");
            return false;
        };
        let result = if adapter.requires_exclusive_hardware() {
            self.arbiter.with_lease(holder, || call(adapter.as_ref()))
        } else {
            call(adapter.as_ref())
        };
        match result {
            Ok(done) => {
                info!(%holder, ok = done, "data link request finished");
                done
            }
            Err(e) => {
                error!(%holder, error = %e, "data link adapter fault");
                false
            }
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn delivery_stats(&self) -> DeliveryCounts {
        self.stats.snapshot()
    }

    /// Enqueues refused because the transmission buffer was full.
    pub fn rejected(&self) -> u64 {
        self.scheduler.rejected()
    }

    pub fn arbiter_stats(&self) -> ArbiterStats {
        self.arbiter.stats()
    }

    pub fn config(&self) -> &CommlinkConfig {
        &self.config
    }
}

impl Drop for CommlinkRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}
