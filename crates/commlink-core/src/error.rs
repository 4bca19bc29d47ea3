//! Error taxonomy for the delivery core.
//!
//! None of these cross the scheduler/transmitter boundary as a failure of
//! the caller's operation: enqueue rejections come back as values, and
//! everything after dequeue ends up in logs and [`crate::transmitter::DeliveryReport`]s.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::message::{Message, TransportKind};

// ── Delivery ────────────────────────────────────────────────────────

/// Conditions a message can hit on its way through the core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("transmission buffer is full")]
    BufferFull,
    #[error("receiver '{0}' is not registered")]
    UnknownReceiver(String),
    #[error("transport {0} is unavailable")]
    TransportUnavailable(TransportKind),
    #[error("send over {0} failed")]
    SendFailed(TransportKind),
    #[error("message expired after {age:?} (timeout {timeout:?})")]
    MessageExpired { age: Duration, timeout: Duration },
    #[error("file payload '{}' is not a readable file", .0.display())]
    MalformedFilePath(PathBuf),
    #[error("modem is held by another caller")]
    ResourceContention,
}

/// Rejected enqueue. The message is handed back untouched.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("transmission buffer is full")]
    Full(Message),
    #[error("scheduler is stopped")]
    Stopped(Message),
}

impl EnqueueError {
    pub fn into_message(self) -> Message {
        match self {
            EnqueueError::Full(m) | EnqueueError::Stopped(m) => m,
        }
    }

    /// Delivery condition behind the rejection. A stopped scheduler is a
    /// lifecycle state, not a delivery condition.
    pub fn reason(&self) -> Option<DeliveryError> {
        match self {
            EnqueueError::Full(_) => Some(DeliveryError::BufferFull),
            EnqueueError::Stopped(_) => None,
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing required setting '{0}'")]
    Missing(&'static str),
    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageDefaults, Payload};

    #[test]
    fn enqueue_error_returns_message() {
        let msg = Message::builder(
            "bob",
            "node",
            Payload::Text("x".into()),
            MessageDefaults {
                priority: 1,
                timeout: Duration::from_secs(1),
            },
        )
        .build();
        let err = EnqueueError::Full(msg.clone());
        assert_eq!(err.to_string(), "transmission buffer is full");
        assert_eq!(err.reason(), Some(DeliveryError::BufferFull));
        assert_eq!(err.into_message(), msg);
        assert_eq!(EnqueueError::Stopped(msg.clone()).reason(), None);
    }

    #[test]
    fn delivery_error_messages_name_the_transport() {
        assert_eq!(
            DeliveryError::SendFailed(TransportKind::Sms).to_string(),
            "send over sms failed"
        );
        assert_eq!(
            DeliveryError::MalformedFilePath(PathBuf::from("/tmp/missing.bin")).to_string(),
            "file payload '/tmp/missing.bin' is not a readable file"
        );
    }
}
