//! Pool-wide counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PoolStats {
    connected_miners: AtomicU64,
    valid_shares: AtomicU64,
    invalid_shares: AtomicU64,
    blocks_submitted: AtomicU64,
    blocks_rejected: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub connected_miners: u64,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub blocks_submitted: u64,
    pub blocks_rejected: u64,
}

impl PoolStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a connected miner until the returned guard drops.
    pub fn miner_connected(self: &Arc<Self>) -> ConnectedMiner {
        self.connected_miners.fetch_add(1, Ordering::Relaxed);
        ConnectedMiner {
            stats: Arc::clone(self),
        }
    }

    pub fn record_share(&self, valid: bool) {
        let counter = if valid {
            &self.valid_shares
        } else {
            &self.invalid_shares
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block(&self, accepted: bool) {
        self.blocks_submitted.fetch_add(1, Ordering::Relaxed);
        if !accepted {
            self.blocks_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            connected_miners: self.connected_miners.load(Ordering::Relaxed),
            valid_shares: self.valid_shares.load(Ordering::Relaxed),
            invalid_shares: self.invalid_shares.load(Ordering::Relaxed),
            blocks_submitted: self.blocks_submitted.load(Ordering::Relaxed),
            blocks_rejected: self.blocks_rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct ConnectedMiner {
    stats: Arc<PoolStats>,
}

impl Drop for ConnectedMiner {
    fn drop(&mut self) {
        self.stats.connected_miners.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_miner_guard() {
        let stats = PoolStats::new();
        let first = stats.miner_connected();
        let second = stats.miner_connected();
        assert_eq!(stats.snapshot().connected_miners, 2);

        drop(first);
        assert_eq!(stats.snapshot().connected_miners, 1);
        drop(second);
        assert_eq!(stats.snapshot().connected_miners, 0);
    }

    #[test]
    fn test_counters() {
        let stats = PoolStats::new();
        stats.record_share(true);
        stats.record_share(true);
        stats.record_share(false);
        stats.record_block(true);
        stats.record_block(false);

        assert_eq!(
            stats.snapshot(),
            PoolStatsSnapshot {
                connected_miners: 0,
                valid_shares: 2,
                invalid_shares: 1,
                blocks_submitted: 2,
                blocks_rejected: 1,
            }
        );
    }
}
