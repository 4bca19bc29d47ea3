//! Bounded buffer for inbound traffic.
//!
//! Adapter listener threads push through a cloneable [`ReceptionHandle`];
//! the caller-facing side pops from the [`ReceptionSink`]. A full buffer
//! drops the newest arrival.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, warn};

use crate::message::{Payload, TransportKind};

/// A message received by one of the adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub transport: TransportKind,
    /// Sender address as seen by the transport (number, email, ip, mac).
    pub sender: String,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

impl ReceivedMessage {
    pub fn new(transport: TransportKind, sender: impl Into<String>, payload: Payload) -> Self {
        Self {
            transport,
            sender: sender.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

pub struct ReceptionSink {
    tx: Sender<ReceivedMessage>,
    rx: Receiver<ReceivedMessage>,
    capacity: usize,
}

impl ReceptionSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Producer side for adapter listeners.
    pub fn handle(&self) -> ReceptionHandle {
        ReceptionHandle {
            tx: self.tx.clone(),
        }
    }

    /// Oldest received message, if any.
    pub fn pop(&self) -> Option<ReceivedMessage> {
        let msg = self.rx.try_recv().ok();
        if msg.is_none() {
            debug!("reception buffer empty");
        }
        msg
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Clone)]
pub struct ReceptionHandle {
    tx: Sender<ReceivedMessage>,
}

impl ReceptionHandle {
    /// Returns false when the buffer is full; the message is dropped.
    pub fn push(&self, msg: ReceivedMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                warn!(
                    transport = %msg.transport,
                    sender = %msg.sender,
                    "reception buffer full, message dropped"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
