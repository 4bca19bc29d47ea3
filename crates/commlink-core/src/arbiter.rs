//! # Modem Arbiter
//!
//! Binary mutual exclusion over the one physical cellular modem shared by
//! SMS sends, data-link connects and the health probes of both. Two
//! overlapping command sequences leave the modem in an undefined state, so
//! every modem touch goes through a [`ModemLease`].
//!
//! Leases are scoped: dropping one releases the modem, whichever way the
//! holder exits.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::message::TransportKind;

/// Who currently holds the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseHolder {
    /// Health probe of a modem-backed transport.
    Probe(TransportKind),
    /// Outbound send over a modem-backed transport.
    Send(TransportKind),
    DataLinkConnect,
    DataLinkDisconnect,
}

impl fmt::Display for LeaseHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseHolder::Probe(kind) => write!(f, "probe:{kind}"),
            LeaseHolder::Send(kind) => write!(f, "send:{kind}"),
            LeaseHolder::DataLinkConnect => f.write_str("data_link:connect"),
            LeaseHolder::DataLinkDisconnect => f.write_str("data_link:disconnect"),
        }
    }
}

/// Counters describing arbiter usage since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    pub acquisitions: u64,
    pub releases: u64,
    /// Highest number of simultaneous holders ever observed. Always 1 once
    /// the modem has been used.
    pub peak_holders: usize,
    /// Acquisitions that had to wait for another holder.
    pub contended: u64,
}

#[derive(Default)]
pub struct ModemArbiter {
    holder: Mutex<Option<LeaseHolder>>,
    released: Condvar,
    active: AtomicUsize,
    peak: AtomicUsize,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    contended: AtomicU64,
}

impl ModemArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the modem is free and takes it.
    pub fn acquire(&self, holder: LeaseHolder) -> ModemLease<'_> {
        let mut guard = self.lock();
        if let Some(current) = *guard {
            self.contended.fetch_add(1, Ordering::Relaxed);
            debug!(%holder, %current, "modem busy, waiting");
        }
        guard = self
            .released
            .wait_while(guard, |h| h.is_some())
            .unwrap_or_else(|e| e.into_inner());
        self.grant(guard, holder)
    }

    /// Takes the modem only if nobody holds it.
    pub fn try_acquire(&self, holder: LeaseHolder) -> Option<ModemLease<'_>> {
        let guard = self.lock();
        if guard.is_some() {
            return None;
        }
        Some(self.grant(guard, holder))
    }

    /// Runs `f` while holding the modem.
    pub fn with_lease<R>(&self, holder: LeaseHolder, f: impl FnOnce() -> R) -> R {
        let _lease = self.acquire(holder);
        f()
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<LeaseHolder> {
        *self.lock()
    }

    pub fn stats(&self) -> ArbiterStats {
        ArbiterStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            peak_holders: self.peak.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<LeaseHolder>> {
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn grant(
        &self,
        mut guard: MutexGuard<'_, Option<LeaseHolder>>,
        holder: LeaseHolder,
    ) -> ModemLease<'_> {
        *guard = Some(holder);
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        drop(guard);
        trace!(%holder, "modem acquired");
        ModemLease {
            arbiter: self,
            holder,
        }
    }

    fn release(&self, holder: LeaseHolder) {
        let mut guard = self.lock();
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.releases.fetch_add(1, Ordering::Relaxed);
        *guard = None;
        drop(guard);
        self.released.notify_one();
        trace!(%holder, "modem released");
    }
}

/// Exclusive right to talk to the modem. Released on drop.
#[must_use = "dropping the lease releases the modem immediately"]
pub struct ModemLease<'a> {
    arbiter: &'a ModemArbiter,
    holder: LeaseHolder,
}

impl ModemLease<'_> {
    pub fn holder(&self) -> LeaseHolder {
        self.holder
    }
}

impl Drop for ModemLease<'_> {
    fn drop(&mut self) {
        self.arbiter.release(self.holder);
    }
}

impl fmt::Debug for ModemLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModemLease")
            .field("holder", &self.holder)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn lease_releases_on_drop() {
        let arbiter = ModemArbiter::new();
        {
            let lease = arbiter.acquire(LeaseHolder::DataLinkConnect);
            assert_eq!(lease.holder(), LeaseHolder::DataLinkConnect);
            assert_eq!(arbiter.holder(), Some(LeaseHolder::DataLinkConnect));
        }
        assert_eq!(arbiter.holder(), None);
        let stats = arbiter.stats();
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.peak_holders, 1);
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let arbiter = ModemArbiter::new();
        let _lease = arbiter.acquire(LeaseHolder::Send(TransportKind::Sms));
        assert!(arbiter.try_acquire(LeaseHolder::Probe(TransportKind::Sms)).is_none());
    }

    #[test]
    fn lease_released_when_holder_panics() {
        let arbiter = Arc::new(ModemArbiter::new());
        let a = arbiter.clone();
        let result = thread::spawn(move || {
            a.with_lease(LeaseHolder::Send(TransportKind::Sms), || -> u32 {
                panic!("adapter blew up")
            })
        })
        .join();
        assert!(result.is_err());
        assert_eq!(arbiter.holder(), None);
        assert!(arbiter.try_acquire(LeaseHolder::DataLinkConnect).is_some());
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let arbiter = Arc::new(ModemArbiter::new());
        let lease = arbiter.acquire(LeaseHolder::Send(TransportKind::Sms));

        let a = arbiter.clone();
        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let _l = a.acquire(LeaseHolder::Probe(TransportKind::DataLink));
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(80));
        drop(lease);
        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(60), "waited only {waited:?}");
        assert_eq!(arbiter.stats().peak_holders, 1);
    }
}
