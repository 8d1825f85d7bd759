//! Mining jobs handed out to connected miners.
//!
//! A [`Job`] combines a coin's block template (in whatever shape the coin
//! adapter prepared it) with a pool-assigned id and the network target. Jobs
//! are immutable once built and shared as `Arc<Job<W>>` between the job
//! manager's current slot and every worker's job window. A new template, or a
//! forced rebroadcast, supersedes a job with a new one; nothing ever mutates
//! an existing job.

mod duplicate;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use duplicate::DuplicateTracker;

use crate::types::DifficultyMath;
use crate::u256::U256;

/// Expected fingerprints per job, used to pre-size duplicate trackers.
const DUPLICATE_TRACKER_CAPACITY: usize = 1024;

/// Identity of a block template.
///
/// Two templates with the same identity build on the same chain tip, so a
/// template refresh with an unchanged identity does not produce a new job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateIdentity {
    pub height: u64,
    pub prev_hash: String,
}

impl fmt::Display for TemplateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.height, self.prev_hash)
    }
}

/// Issues job ids.
///
/// Ids are lowercase hex renderings of a monotonically increasing counter,
/// unique for the lifetime of the pool process.
#[derive(Debug, Default)]
pub struct JobIdSource {
    next: AtomicU64,
}

impl JobIdSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        format!("{:x}", self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// One unit of assignable work.
#[derive(Debug)]
pub struct Job<W> {
    id: String,
    identity: TemplateIdentity,
    network_target: U256,
    network_difficulty: f64,
    work: W,
    duplicates: DuplicateTracker,
}

impl<W> Job<W> {
    /// Build a job from a coin adapter's prepared work.
    pub fn new(
        id: String,
        identity: TemplateIdentity,
        network_target: U256,
        math: &DifficultyMath,
        work: W,
    ) -> Self {
        Self {
            id,
            identity,
            network_target,
            network_difficulty: math.difficulty_for(network_target),
            work,
            duplicates: DuplicateTracker::with_capacity(DUPLICATE_TRACKER_CAPACITY),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &TemplateIdentity {
        &self.identity
    }

    pub fn height(&self) -> u64 {
        self.identity.height
    }

    /// A hash at or below this value is a block candidate.
    pub fn network_target(&self) -> U256 {
        self.network_target
    }

    /// Network difficulty at the time the job was built.
    pub fn network_difficulty(&self) -> f64 {
        self.network_difficulty
    }

    /// Coin-specific work: template, coinbase parts, merkle branches, ...
    pub fn work(&self) -> &W {
        &self.work
    }

    /// Fingerprints submitted against this job.
    pub fn duplicates(&self) -> &DuplicateTracker {
        &self.duplicates
    }

    /// Whether a hash value meets the network target.
    pub fn is_block_candidate(&self, hash: U256) -> bool {
        hash <= self.network_target
    }
}

/// A job published by the job manager.
///
/// `clean_jobs` tells miners whether work on earlier jobs is now worthless
/// (a new chain tip) or merely refreshed (a forced rebroadcast).
#[derive(Debug)]
pub struct JobBroadcast<W> {
    pub job: Arc<Job<W>>,
    pub clean_jobs: bool,
}

// Derived Clone would require `W: Clone`; the job itself is shared.
impl<W> Clone for JobBroadcast<W> {
    fn clone(&self) -> Self {
        Self {
            job: self.job.clone(),
            clean_jobs: self.clean_jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(height: u64) -> TemplateIdentity {
        TemplateIdentity {
            height,
            prev_hash: format!("{:064x}", height - 1),
        }
    }

    #[test]
    fn test_job_ids_are_monotonic_and_unique() {
        let ids = JobIdSource::new();
        assert_eq!(ids.next_id(), "0");
        assert_eq!(ids.next_id(), "1");
        let rest: Vec<_> = (0..254).map(|_| ids.next_id()).collect();
        assert_eq!(rest.last().map(String::as_str), Some("ff"));
        assert_eq!(ids.next_id(), "100");
    }

    #[test]
    fn test_block_candidate_is_inclusive() {
        let math = DifficultyMath::bitcoin();
        let target = math.target_for(50_000.0);
        let job = Job::new("1".into(), identity(100), target, &math, ());

        assert!(job.is_block_candidate(target));
        assert!(job.is_block_candidate(target >> 1));
        assert!(!job.is_block_candidate(math.target_for(40_000.0)));
        assert!((job.network_difficulty() - 50_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_each_job_has_its_own_duplicates() {
        let math = DifficultyMath::bitcoin();
        let first = Job::new("1".into(), identity(100), U256::MAX, &math, ());
        let second = Job::new("2".into(), identity(100), U256::MAX, &math, ());

        assert!(first.duplicates().insert("work"));
        assert!(second.duplicates().insert("work"));
        assert!(!first.duplicates().insert("work"));
    }

    #[test]
    fn test_identity_display() {
        let id = TemplateIdentity {
            height: 840_000,
            prev_hash: "abcd".into(),
        };
        assert_eq!(id.to_string(), "840000@abcd");
    }
}
