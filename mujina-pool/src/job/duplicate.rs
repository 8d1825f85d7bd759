//! Duplicate share detection.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Set of submission fingerprints already seen.
///
/// Fingerprints are coin-specific strings composed from the variable fields
/// of a submission (extranonce, time, nonce, version bits, solution). A
/// tracker normally lives inside its [`Job`](super::Job), so its memory is
/// released together with the job once every worker's window has moved past
/// it. Coins that deduplicate across jobs use the job manager's long-lived
/// tracker instead, which is cleared whenever the block template changes.
#[derive(Debug, Default)]
pub struct DuplicateTracker {
    seen: Mutex<HashSet<String>>,
}

impl DuplicateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker pre-sized for `capacity` fingerprints.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashSet::with_capacity(capacity)),
        }
    }

    /// Insert a fingerprint if absent.
    ///
    /// Returns `true` the first time a fingerprint is seen and `false` for
    /// every later insert of the same value. Check and insert happen under one
    /// lock acquisition, so two concurrent submissions of the same work can
    /// never both observe `true`.
    pub fn insert(&self, fingerprint: impl Into<String>) -> bool {
        self.seen.lock().insert(fingerprint.into())
    }

    /// Forget every fingerprint, returning how many were held.
    pub fn clear(&self) -> usize {
        std::mem::take(&mut *self.seen.lock()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_second_insert_is_duplicate() {
        let tracker = DuplicateTracker::new();
        assert!(tracker.insert("00000001:5f5e1000:deadbeef"));
        assert!(!tracker.insert("00000001:5f5e1000:deadbeef"));
        assert!(tracker.insert("00000002:5f5e1000:deadbeef"));
        assert_eq!(tracker.clear(), 2);
    }

    #[test]
    fn test_clear() {
        let tracker = DuplicateTracker::with_capacity(16);
        tracker.insert("a");
        assert_eq!(tracker.clear(), 1);
        assert!(tracker.insert("a"));
        assert_eq!(tracker.clear(), 1);
    }

    #[test]
    fn test_concurrent_inserts_admit_exactly_one() {
        let tracker = Arc::new(DuplicateTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.insert("same-work"))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|inserted| *inserted)
            .count();
        assert_eq!(admitted, 1);
    }
}
