//! Shared mock adapters and fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use commlink_core::adapter::{ResolvedPayload, TransportAdapter};
use commlink_core::config::CommlinkConfig;
use commlink_core::message::{Message, MessageDefaults, Payload, TransportKind};

/// Scripted result of one `send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendScript {
    Accept,
    Reject,
    Fault,
}

/// One recorded `send` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub receiver: String,
    pub priority: u8,
    pub address: Option<String>,
    pub file: Option<std::path::PathBuf>,
}

/// Concurrency tracker shared between adapters that talk to the same modem.
#[derive(Debug, Default)]
pub struct ModemGauge {
    inside: AtomicUsize,
    peak: AtomicUsize,
    entries: AtomicU64,
}

impl ModemGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(&self) {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.entries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.inside.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of calls ever inside the modem at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }
}

pub struct MockAdapter {
    kind: TransportKind,
    up: AtomicBool,
    exclusive: bool,
    /// Consumed front to back; `default_send` once empty.
    script: Mutex<VecDeque<SendScript>>,
    default_send: SendScript,
    work: Duration,
    modem: Option<Arc<ModemGauge>>,
    sent: Mutex<Vec<SentRecord>>,
    probes: AtomicU64,
    send_calls: AtomicU64,
    connects: AtomicU64,
}

impl MockAdapter {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            up: AtomicBool::new(true),
            exclusive: false,
            script: Mutex::new(VecDeque::new()),
            default_send: SendScript::Accept,
            work: Duration::ZERO,
            modem: None,
            sent: Mutex::new(Vec::new()),
            probes: AtomicU64::new(0),
            send_calls: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    pub fn available(self, up: bool) -> Self {
        self.up.store(up, Ordering::SeqCst);
        self
    }

    /// Marks the adapter as modem-backed and tracks overlap in `modem`.
    pub fn on_modem(mut self, modem: Arc<ModemGauge>) -> Self {
        self.exclusive = true;
        self.modem = Some(modem);
        self
    }

    pub fn sends(mut self, default: SendScript) -> Self {
        self.default_send = default;
        self
    }

    pub fn script(self, steps: impl IntoIterator<Item = SendScript>) -> Self {
        self.script.lock().unwrap().extend(steps);
        self
    }

    /// Time spent inside every probe and send.
    pub fn work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap().clone()
    }

    pub fn send_calls(&self) -> u64 {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    fn busy(&self) {
        if let Some(m) = &self.modem {
            m.enter();
        }
        if !self.work.is_zero() {
            std::thread::sleep(self.work);
        }
        if let Some(m) = &self.modem {
            m.exit();
        }
    }
}

impl TransportAdapter for MockAdapter {
    fn id(&self) -> TransportKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.busy();
        self.up.load(Ordering::SeqCst)
    }

    fn send(
        &self,
        message: &Message,
        address: Option<&str>,
        payload: ResolvedPayload<'_>,
    ) -> anyhow::Result<bool> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.busy();
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_send);
        match step {
            SendScript::Accept => {
                self.sent.lock().unwrap().push(SentRecord {
                    receiver: message.receiver().to_string(),
                    priority: message.priority(),
                    address: address.map(str::to_string),
                    file: match payload {
                        ResolvedPayload::File(p) => Some(p.to_path_buf()),
                        ResolvedPayload::Text(_) => None,
                    },
                });
                Ok(true)
            }
            SendScript::Reject => Ok(false),
            SendScript::Fault => Err(anyhow!("{} adapter misconfigured", self.kind)),
        }
    }

    fn requires_exclusive_hardware(&self) -> bool {
        self.exclusive
    }

    fn connect(&self) -> anyhow::Result<bool> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.busy();
        Ok(self.up.load(Ordering::SeqCst))
    }
}

pub fn as_dyn(adapters: &[Arc<MockAdapter>]) -> Vec<Arc<dyn TransportAdapter>> {
    adapters
        .iter()
        .map(|a| a.clone() as Arc<dyn TransportAdapter>)
        .collect()
}

pub fn text(receiver: &str, priority: u8, timeout: Duration) -> Message {
    Message::builder(
        receiver,
        "node-1",
        Payload::Text("status ok".into()),
        MessageDefaults { priority, timeout },
    )
    .build()
}

pub const BASE_CONFIG: &str = r#"
[buffers]
transmission = 16
reception = 8

[defaults]
sender = "node-1"
text = { priority = 50, timeout_s = 60 }
file = { priority = 20, timeout_s = 600 }

[health]
poll_interval_ms = 50
probe_timeout_ms = 500

[transmitter]
send_timeout_ms = 1000
dequeue_wait_ms = 20

[files]
root = "/tmp"

[contacts.base]
number = "+15550100"
email = "base@example.org"
ip = "10.0.0.1"
"#;

pub fn config() -> CommlinkConfig {
    CommlinkConfig::from_toml_str(BASE_CONFIG).unwrap()
}

/// Polls `cond` every few milliseconds until it holds or `limit` passes.
pub fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
