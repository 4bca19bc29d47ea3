//! # Message Model
//!
//! Immutable outbound message values and the transport tags they can be
//! routed over. Everything a message carries is fixed when it is built;
//! queue bookkeeping (enqueue time, delivery state) lives on
//! [`crate::scheduler::PendingMessage`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Highest accepted priority. Values above are clamped.
pub const MAX_PRIORITY: u8 = 99;

/// One of the fixed set of physical transports the system can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    /// IP network (ethernet / wifi).
    Network,
    /// Short-range radio (bluetooth).
    Radio,
    Email,
    /// SMS over the cellular modem.
    Sms,
    /// Packet data link over the cellular modem (GPRS).
    DataLink,
}

impl TransportKind {
    pub const ALL: [TransportKind; 5] = [
        TransportKind::Network,
        TransportKind::Radio,
        TransportKind::Email,
        TransportKind::Sms,
        TransportKind::DataLink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Network => "network",
            TransportKind::Radio => "radio",
            TransportKind::Email => "email",
            TransportKind::Sms => "sms",
            TransportKind::DataLink => "data_link",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "network" | "ethernet" => Ok(TransportKind::Network),
            "radio" | "bluetooth" => Ok(TransportKind::Radio),
            "email" => Ok(TransportKind::Email),
            "sms" => Ok(TransportKind::Sms),
            "data_link" | "datalink" | "gprs" => Ok(TransportKind::DataLink),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// What a message carries.
///
/// The caller-facing layer decides between text and file; the core never
/// inspects a string to guess which one it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    /// Reference to a file, absolute or relative to the configured file root.
    /// Resolved lazily, right before the first send attempt.
    File(PathBuf),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Text(_) => PayloadKind::Text,
            Payload::File(_) => PayloadKind::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    File,
}

/// Terminal and non-terminal delivery states of a queued message.
///
/// `Pending` is the only non-terminal state; every message leaves it
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Expired,
    Discarded,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Expired => "expired",
            DeliveryState::Discarded => "discarded",
        }
    }
}

/// Priority and time-to-live applied when the caller leaves them unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDefaults {
    pub priority: u8,
    pub timeout: Duration,
}

/// An outbound message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    receiver: String,
    sender: String,
    payload: Payload,
    priority: u8,
    timeout: Duration,
    preferred: Option<TransportKind>,
}

impl Message {
    /// Starts building a message for `receiver` with kind-specific defaults.
    pub fn builder(
        receiver: impl Into<String>,
        sender: impl Into<String>,
        payload: Payload,
        defaults: MessageDefaults,
    ) -> MessageBuilder {
        MessageBuilder {
            receiver: receiver.into(),
            sender: sender.into(),
            payload,
            priority: defaults.priority,
            timeout: defaults.timeout,
            preferred: None,
        }
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    /// Urgency in `[0, 99]`, higher is more urgent.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Time-to-live measured from enqueue.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn preferred_transport(&self) -> Option<TransportKind> {
        self.preferred
    }
}

/// Collects every field of a [`Message`] before it exists.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    receiver: String,
    sender: String,
    payload: Payload,
    priority: u8,
    timeout: Duration,
    preferred: Option<TransportKind>,
}

impl MessageBuilder {
    /// Sets the priority; values above [`MAX_PRIORITY`] are clamped.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the time-to-live. A zero timeout is raised to one millisecond.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn preferred(mut self, transport: Option<TransportKind>) -> Self {
        self.preferred = transport;
        self
    }

    pub fn build(self) -> Message {
        Message {
            receiver: self.receiver,
            sender: self.sender,
            payload: self.payload,
            priority: self.priority.min(MAX_PRIORITY),
            timeout: self.timeout.max(Duration::from_millis(1)),
            preferred: self.preferred,
        }
    }
}
