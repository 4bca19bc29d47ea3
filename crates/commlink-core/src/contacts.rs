//! Receiver allow-list.
//!
//! Messages to receivers the directory does not know are rejected before
//! they reach the scheduler.

use std::collections::BTreeMap;

use crate::config::ContactConfig;
use crate::message::TransportKind;

pub trait ContactDirectory: Send + Sync {
    /// Whether `receiver` has at least one address on any transport.
    fn knows(&self, receiver: &str) -> bool;

    /// Address of `receiver` on `transport`, if registered.
    fn address(&self, receiver: &str, transport: TransportKind) -> Option<String>;
}

/// Directory loaded once from the `[contacts]` config table.
#[derive(Debug, Clone, Default)]
pub struct StaticContacts {
    entries: BTreeMap<String, ContactConfig>,
}

impl StaticContacts {
    pub fn new(entries: BTreeMap<String, ContactConfig>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|(_, c)| {
                c.number.is_some() || c.email.is_some() || c.ip.is_some() || c.mac.is_some()
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ContactDirectory for StaticContacts {
    fn knows(&self, receiver: &str) -> bool {
        self.entries.contains_key(receiver)
    }

    fn address(&self, receiver: &str, transport: TransportKind) -> Option<String> {
        let c = self.entries.get(receiver)?;
        match transport {
            TransportKind::Sms => c.number.clone(),
            TransportKind::Email => c.email.clone(),
            TransportKind::Network | TransportKind::DataLink => c.ip.clone(),
            TransportKind::Radio => c.mac.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticContacts {
        let mut entries = BTreeMap::new();
        entries.insert(
            "alice".to_string(),
            ContactConfig {
                number: Some("+5493511234567".into()),
                email: Some("alice@example.org".into()),
                ..Default::default()
            },
        );
        entries.insert("ghost".to_string(), ContactConfig::default());
        StaticContacts::new(entries)
    }

    #[test]
    fn contacts_without_addresses_are_unknown() {
        let dir = directory();
        assert_eq!(dir.len(), 1);
        assert!(dir.knows("alice"));
        assert!(!dir.knows("ghost"));
        assert!(!dir.knows("mallory"));
    }

    #[test]
    fn address_per_transport() {
        let dir = directory();
        assert_eq!(
            dir.address("alice", TransportKind::Email).as_deref(),
            Some("alice@example.org")
        );
        assert_eq!(
            dir.address("alice", TransportKind::Sms).as_deref(),
            Some("+5493511234567")
        );
        assert_eq!(dir.address("alice", TransportKind::Radio), None);
    }
}
