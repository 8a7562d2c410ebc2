// Lock-free publish statistics using atomic operations
//
// Shared between a Publisher and whoever reports on it; every counter is
// monotonic and updated with relaxed ordering.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PublishStats {
    batches: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    non_indexable: AtomicU64,
    duplicates: AtomicU64,
    too_many: AtomicU64,
    encode_failures: AtomicU64,
    transport_failures: AtomicU64,
}

impl PublishStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self, n: u64) {
        self.acked.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_retried(&self, n: u64) {
        self.retried.fetch_add(n, Ordering::Relaxed);
    }

    /// Event dropped because the store refused its content.
    pub fn record_non_indexable(&self) {
        self.non_indexable.fetch_add(1, Ordering::Relaxed);
    }

    /// `create` of an id that already exists.
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_too_many(&self) {
        self.too_many.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PublishStatsSnapshot {
        PublishStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            non_indexable: self.non_indexable.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            too_many: self.too_many.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PublishStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishStatsSnapshot {
    pub batches: u64,
    pub acked: u64,
    pub retried: u64,
    pub non_indexable: u64,
    pub duplicates: u64,
    pub too_many: u64,
    pub encode_failures: u64,
    pub transport_failures: u64,
}

impl PublishStatsSnapshot {
    /// Events that will never be delivered.
    pub fn dropped(&self) -> u64 {
        self.non_indexable + self.encode_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate() {
        let stats = PublishStats::new();
        stats.record_batch();
        stats.record_acked(5);
        stats.record_retried(2);
        stats.record_non_indexable();
        stats.record_encode_failure();
        stats.record_duplicate();

        let snap = stats.snapshot();
        assert_eq!(snap.batches, 1);
        assert_eq!(snap.acked, 5);
        assert_eq!(snap.retried, 2);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.dropped(), 2);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(PublishStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_acked(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().acked, 8000);
    }
}
