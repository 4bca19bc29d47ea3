//! Transport adapter seam.
//!
//! The wire side of every transport (AT command sequences, SMTP, sockets,
//! radio pairing) lives behind [`TransportAdapter`]. The core only asks an
//! adapter whether it is reachable and hands it messages to send.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};

use crate::message::{Message, TransportKind};

/// Payload as handed to an adapter: text, or a file path that was checked
/// to be a readable file right before the hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedPayload<'a> {
    Text(&'a str),
    File(&'a Path),
}

/// Abstraction for one physical transport capable of sending messages and
/// reporting availability.
///
/// Implemented by the per-transport drivers outside this crate and by mock
/// adapters in tests.
///
/// None of these methods may block past the bound configured for it
/// (probe timeout for [`is_available`](Self::is_available), send timeout for
/// [`send`](Self::send)). Ordinary failures are `Ok(false)`; an `Err` means
/// the adapter is misconfigured beyond recovery.
pub trait TransportAdapter: Send + Sync {
    /// Stable transport tag; unique within one runtime.
    fn id(&self) -> TransportKind;

    /// Availability probe. Called by the health monitor once per cycle,
    /// under a modem lease when [`requires_exclusive_hardware`](Self::requires_exclusive_hardware)
    /// is true.
    fn is_available(&self) -> bool;

    /// Delivers one message. Returns `Ok(true)` once the transport accepted it.
    ///
    /// `address` is the receiver's address on this transport (phone number,
    /// email, ip, mac) when the contact directory has one.
    fn send(
        &self,
        message: &Message,
        address: Option<&str>,
        payload: ResolvedPayload<'_>,
    ) -> Result<bool>;

    /// Whether this adapter talks to the shared cellular modem.
    fn requires_exclusive_hardware(&self) -> bool {
        false
    }

    /// Brings up a connection-oriented link (the modem data link).
    ///
    /// The default treats the adapter as connectionless.
    fn connect(&self) -> Result<bool> {
        Ok(true)
    }

    /// Tears down what [`connect`](Self::connect) brought up.
    fn disconnect(&self) -> Result<bool> {
        Ok(true)
    }
}

/// The fixed set of adapters a runtime was built with, at most one per
/// [`TransportKind`].
#[derive(Clone)]
pub struct AdapterSet {
    adapters: Vec<Arc<dyn TransportAdapter>>,
}

impl AdapterSet {
    /// Fails when `adapters` is empty or two adapters share an id.
    pub fn new(adapters: Vec<Arc<dyn TransportAdapter>>) -> Result<Self> {
        if adapters.is_empty() {
            bail!("no transport adapters configured");
        }
        let mut seen = HashSet::new();
        for adapter in &adapters {
            if !seen.insert(adapter.id()) {
                bail!("duplicate adapter for transport {}", adapter.id());
            }
        }
        Ok(Self { adapters })
    }

    pub fn get(&self, kind: TransportKind) -> Option<&Arc<dyn TransportAdapter>> {
        self.adapters.iter().find(|a| a.id() == kind)
    }

    pub fn contains(&self, kind: TransportKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TransportAdapter>> {
        self.adapters.iter()
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        self.adapters.iter().map(|a| a.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet")
            .field("transports", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(TransportKind);

    impl TransportAdapter for Fixed {
        fn id(&self) -> TransportKind {
            self.0
        }
        fn is_available(&self) -> bool {
            true
        }
        fn send(
            &self,
            _message: &Message,
            _address: Option<&str>,
            _payload: ResolvedPayload<'_>,
        ) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn empty_set_is_rejected() {
        assert!(AdapterSet::new(Vec::new()).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = AdapterSet::new(vec![
            Arc::new(Fixed(TransportKind::Email)),
            Arc::new(Fixed(TransportKind::Email)),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn lookup_by_kind() {
        let set = AdapterSet::new(vec![
            Arc::new(Fixed(TransportKind::Email)),
            Arc::new(Fixed(TransportKind::Sms)),
        ])
        .unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(TransportKind::Sms));
        assert!(!set.contains(TransportKind::Radio));
        assert_eq!(set.kinds(), vec![TransportKind::Email, TransportKind::Sms]);
        assert!(!set.get(TransportKind::Email).unwrap().requires_exclusive_hardware());
    }
}
