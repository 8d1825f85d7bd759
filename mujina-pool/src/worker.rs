//! Per-connection worker state.
//!
//! A [`WorkerContext`] is owned by the task driving its connection. The job
//! broadcast path (adding the newest job) and the submission path (looking up
//! a job by id) both run on that task, one message at a time, so the context
//! needs no lock: `&mut self` is the exclusion.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::job::Job;

/// Share statistics for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub last_activity: Option<Instant>,
}

/// Mutable state of one connected miner.
#[derive(Debug)]
pub struct WorkerContext<W> {
    connection_id: u64,
    remote_addr: SocketAddr,

    subscribed: bool,
    authorized: bool,
    user_agent: Option<String>,

    /// Leased for the connection's lifetime; see `stratum::extranonce`.
    extranonce1: Vec<u8>,
    extranonce2_size: usize,

    miner: Option<String>,
    worker: Option<String>,

    difficulty: f64,
    previous_difficulty: Option<f64>,
    pending_difficulty: Option<f64>,
    retargeted_at: Option<Instant>,
    /// How long after a retarget shares may still meet the previous difficulty.
    grace_period: Duration,
    static_difficulty: bool,

    version_mask: Option<u32>,

    /// Most recent jobs sent to this worker, oldest first.
    jobs: VecDeque<Arc<Job<W>>>,

    stats: WorkerStats,
}

impl<W> WorkerContext<W> {
    pub fn new(
        connection_id: u64,
        remote_addr: SocketAddr,
        difficulty: f64,
        grace_period: Duration,
    ) -> Self {
        Self {
            connection_id,
            remote_addr,
            subscribed: false,
            authorized: false,
            user_agent: None,
            extranonce1: Vec::new(),
            extranonce2_size: 0,
            miner: None,
            worker: None,
            difficulty,
            previous_difficulty: None,
            pending_difficulty: None,
            retargeted_at: None,
            grace_period,
            static_difficulty: false,
            version_mask: None,
            jobs: VecDeque::new(),
            stats: WorkerStats::default(),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// Record a successful `mining.subscribe`.
    pub fn subscribe(
        &mut self,
        extranonce1: Vec<u8>,
        extranonce2_size: usize,
        user_agent: Option<String>,
    ) {
        self.extranonce1 = extranonce1;
        self.extranonce2_size = extranonce2_size;
        self.user_agent = user_agent;
        self.subscribed = true;
    }

    /// Record a successful `mining.authorize`.
    ///
    /// The login is `<miner>[.<worker>]`; only the first `.` separates.
    pub fn authorize(&mut self, login: &str) {
        let (miner, worker) = split_login(login);
        self.miner = Some(miner.to_string());
        self.worker = worker.map(str::to_string);
        self.authorized = true;
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn extranonce1(&self) -> &[u8] {
        &self.extranonce1
    }

    pub fn extranonce2_size(&self) -> usize {
        self.extranonce2_size
    }

    pub fn miner(&self) -> Option<&str> {
        self.miner.as_deref()
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    pub fn version_mask(&self) -> Option<u32> {
        self.version_mask
    }

    pub fn set_version_mask(&mut self, mask: u32) {
        self.version_mask = Some(mask);
    }

    /// Current effective difficulty.
    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    /// Make `difficulty` effective now.
    ///
    /// The replaced value becomes the previous difficulty, honoured for
    /// `grace_period` after `now`. Setting the current value again is a no-op.
    pub fn set_difficulty(&mut self, difficulty: f64, now: Instant) {
        if difficulty == self.difficulty {
            return;
        }
        self.previous_difficulty = Some(self.difficulty);
        self.difficulty = difficulty;
        self.retargeted_at = Some(now);
    }

    /// Schedule a difficulty change for the next job boundary.
    pub fn set_pending_difficulty(&mut self, difficulty: f64) {
        self.pending_difficulty = Some(difficulty);
    }

    pub fn pending_difficulty(&self) -> Option<f64> {
        self.pending_difficulty
    }

    /// Apply a pending difficulty, if any.
    ///
    /// Called immediately before sending the next job or difficulty
    /// notification. Returns whether the effective difficulty changed.
    pub fn apply_pending_difficulty(&mut self, now: Instant) -> bool {
        match self.pending_difficulty.take() {
            Some(pending) if pending != self.difficulty => {
                self.set_difficulty(pending, now);
                true
            }
            _ => false,
        }
    }

    /// Previous difficulty while the grace window after the last retarget
    /// is still open.
    pub fn previous_difficulty(&self, now: Instant) -> Option<f64> {
        let retargeted_at = self.retargeted_at?;
        if now.saturating_duration_since(retargeted_at) <= self.grace_period {
            self.previous_difficulty
        } else {
            None
        }
    }

    /// Pin the difficulty a miner asked for; VarDiff leaves it alone from
    /// then on.
    pub fn set_static_difficulty(&mut self, difficulty: f64, now: Instant) {
        self.static_difficulty = true;
        self.pending_difficulty = None;
        self.set_difficulty(difficulty, now);
    }

    pub fn has_static_difficulty(&self) -> bool {
        self.static_difficulty
    }

    /// Add a job to the window.
    ///
    /// Adding a job that is already in the window does nothing. Once the
    /// window holds more than `max_active_jobs` jobs the oldest ones are
    /// evicted, after which submissions naming them are "job not found".
    pub fn add_job(&mut self, job: Arc<Job<W>>, max_active_jobs: usize) {
        if self.jobs.iter().any(|j| j.id() == job.id()) {
            return;
        }
        self.jobs.push_back(job);
        while self.jobs.len() > max_active_jobs {
            self.jobs.pop_front();
        }
    }

    /// Look up a job in the window.
    pub fn get_job(&self, id: &str) -> Option<Arc<Job<W>>> {
        self.jobs.iter().find(|j| j.id() == id).cloned()
    }

    /// Number of jobs in the window.
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn record_valid_share(&mut self, now: Instant) {
        self.stats.valid_shares += 1;
        self.stats.last_activity = Some(now);
    }

    pub fn record_invalid_share(&mut self, now: Instant) {
        self.stats.invalid_shares += 1;
        self.stats.last_activity = Some(now);
    }
}

/// Split a login into miner and optional worker name.
pub fn split_login(login: &str) -> (&str, Option<&str>) {
    match login.split_once('.') {
        Some((miner, worker)) if !worker.is_empty() => (miner.trim(), Some(worker.trim())),
        Some((miner, _)) => (miner.trim(), None),
        None => (login.trim(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TemplateIdentity;
    use crate::types::DifficultyMath;
    use crate::u256::U256;

    const GRACE: Duration = Duration::from_secs(90);

    fn context() -> WorkerContext<()> {
        WorkerContext::new(1, "127.0.0.1:4000".parse().unwrap(), 1000.0, GRACE)
    }

    fn job(id: &str) -> Arc<Job<()>> {
        let identity = TemplateIdentity {
            height: 1,
            prev_hash: "00".into(),
        };
        Arc::new(Job::new(
            id.into(),
            identity,
            U256::MAX,
            &DifficultyMath::bitcoin(),
            (),
        ))
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut ctx = context();
        for id in ["j1", "j2", "j3", "j4", "j5"] {
            ctx.add_job(job(id), 4);
        }

        assert_eq!(ctx.active_jobs(), 4);
        assert!(ctx.get_job("j1").is_none());
        assert!(ctx.get_job("j2").is_some());
        assert!(ctx.get_job("j5").is_some());
    }

    #[test]
    fn test_add_job_is_idempotent() {
        let mut ctx = context();
        let j1 = job("j1");
        ctx.add_job(j1.clone(), 2);
        ctx.add_job(job("j2"), 2);
        ctx.add_job(j1, 2);

        assert_eq!(ctx.active_jobs(), 2);
        assert!(ctx.get_job("j1").is_some());
    }

    #[test]
    fn test_pending_difficulty_applies_once() {
        let mut ctx = context();
        let now = Instant::now();

        assert!(!ctx.apply_pending_difficulty(now));

        ctx.set_pending_difficulty(2000.0);
        assert_eq!(ctx.difficulty(), 1000.0);
        assert!(ctx.apply_pending_difficulty(now));
        assert_eq!(ctx.difficulty(), 2000.0);
        assert_eq!(ctx.previous_difficulty(now), Some(1000.0));
        assert!(!ctx.apply_pending_difficulty(now));
    }

    #[test]
    fn test_pending_equal_to_current_is_not_applied() {
        let mut ctx = context();
        ctx.set_pending_difficulty(1000.0);
        assert!(!ctx.apply_pending_difficulty(Instant::now()));
        assert_eq!(ctx.pending_difficulty(), None);
    }

    #[test]
    fn test_grace_window_closes() {
        let mut ctx = context();
        let now = Instant::now();
        assert_eq!(ctx.previous_difficulty(now), None);

        ctx.set_difficulty(4000.0, now);
        assert_eq!(ctx.previous_difficulty(now + GRACE), Some(1000.0));
        assert_eq!(ctx.previous_difficulty(now + GRACE + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_static_difficulty_clears_pending() {
        let mut ctx = context();
        ctx.set_pending_difficulty(3000.0);
        ctx.set_static_difficulty(500.0, Instant::now());

        assert!(ctx.has_static_difficulty());
        assert_eq!(ctx.difficulty(), 500.0);
        assert!(!ctx.apply_pending_difficulty(Instant::now()));
    }

    #[test]
    fn test_authorize_splits_login() {
        let mut ctx = context();
        ctx.authorize("bc1qminer.rig.01");
        assert!(ctx.is_authorized());
        assert_eq!(ctx.miner(), Some("bc1qminer"));
        assert_eq!(ctx.worker(), Some("rig.01"));

        assert_eq!(split_login("bc1qminer"), ("bc1qminer", None));
        assert_eq!(split_login("bc1qminer."), ("bc1qminer", None));
    }

    #[test]
    fn test_share_stats() {
        let mut ctx = context();
        let now = Instant::now();
        ctx.record_valid_share(now);
        ctx.record_valid_share(now);
        ctx.record_invalid_share(now);

        assert_eq!(ctx.stats().valid_shares, 2);
        assert_eq!(ctx.stats().invalid_shares, 1);
        assert_eq!(ctx.stats().last_activity, Some(now));
    }
}
