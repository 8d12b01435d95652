//! PeerSet: sorted, deduplicated neighbour addresses observed on the link.
//!
//! This is "StatLock" in the concurrency model — a single lock guarding the
//! set. Entries are never evicted; a peer that drops off the network stays
//! listed until the process restarts (an explicit design decision, not an
//! oversight — see the open questions on peer-set aging).

use std::net::Ipv4Addr;
use std::sync::RwLock;

/// Sorted by raw host-byte-order `u32`, strictly increasing, no duplicates.
#[derive(Default)]
pub struct PeerSet {
    inner: RwLock<Vec<u32>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }

    /// Insert `ip` if absent, keeping the list sorted. Returns whether it
    /// was newly added.
    pub fn add(&self, ip: Ipv4Addr) -> bool {
        let key = u32::from(ip);
        let mut guard = self.inner.write().expect("peer set lock poisoned");
        match guard.binary_search(&key) {
            Ok(_) => false,
            Err(pos) => {
                guard.insert(pos, key);
                true
            }
        }
    }

    pub fn reset(&self) {
        self.inner.write().expect("peer set lock poisoned").clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().expect("peer set lock poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("peer set lock poisoned").len()
    }

    /// Snapshot of peers in sorted order, for sync/iteration callers. The
    /// returned list does not track subsequent mutation.
    pub fn snapshot(&self) -> Vec<Ipv4Addr> {
        self.inner
            .read()
            .expect("peer set lock poisoned")
            .iter()
            .map(|&ip| Ipv4Addr::from(ip))
            .collect()
    }
}
