//! Job production.
//!
//! The [`JobManager`] owns the pool's current job. Several producers decide
//! *when* to look for a new one:
//!
//! - a bootstrap timer, repeating until the first template arrives,
//! - a block refresh timer polling the daemon,
//! - a long-poll loop, when the daemon can push templates,
//! - a "block found" signal fired right after the pool's own block is
//!   accepted,
//! - a rebroadcast timer that refreshes work when the chain is quiet.
//!
//! All of them send an [`UpdateTrigger`] into one bounded channel, and a
//! single updater task drains it, so template fetches never overlap.
//!
//! ```text
//! bootstrap ─┐
//! poll ──────┤
//! long-poll ─┼──> mpsc ──> updater ──> update_job() ──> watch (current job)
//! found ─────┤                                              │
//! rebroadcast┘                                              └──> connections
//! ```
//!
//! The current job lives in a `watch` channel: replacing it is a single
//! atomic swap, and the same swap wakes every connection so it can push the
//! job to its miner. A job is only published once fully built.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::coin::{BlockSubmission, CoinAdapter};
use crate::error::Result;
use crate::job::{DuplicateTracker, Job, JobBroadcast, JobIdSource};
use crate::rpc::{DaemonClient, SubmitOutcome};
use crate::share::Share;
use crate::tracing::prelude::*;
use crate::types::{DifficultyMath, DisplayDifficulty};

/// Queued triggers beyond this are dropped; the queued ones already cover
/// them.
const TRIGGER_QUEUE_DEPTH: usize = 16;

/// Delay before retrying a failed long poll.
const LONG_POLL_RETRY: Duration = Duration::from_secs(1);

/// Why an update was requested.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateTrigger {
    Bootstrap,
    Poll,
    /// Template pushed by the daemon; no fetch needed.
    Push(Value),
    BlockFound,
    /// Refresh work even if the template is unchanged.
    Rebroadcast,
}

impl UpdateTrigger {
    pub fn is_forced(&self) -> bool {
        matches!(self, UpdateTrigger::Rebroadcast)
    }

    fn name(&self) -> &'static str {
        match self {
            UpdateTrigger::Bootstrap => "bootstrap",
            UpdateTrigger::Poll => "poll",
            UpdateTrigger::Push(_) => "push",
            UpdateTrigger::BlockFound => "block-found",
            UpdateTrigger::Rebroadcast => "rebroadcast",
        }
    }
}

/// Result of [`JobManager::update_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// A template with a new identity became current.
    pub is_new: bool,
    /// The update was a forced rebroadcast.
    pub forced: bool,
}

/// Timers driving job production.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub block_refresh_interval: Duration,
    pub job_rebroadcast_timeout: Duration,
    pub bootstrap_interval: Duration,
    pub health_check_interval: Duration,
    pub network_stats_interval: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            block_refresh_interval: Duration::from_millis(1000),
            job_rebroadcast_timeout: Duration::from_secs(55),
            bootstrap_interval: Duration::from_millis(1000),
            health_check_interval: Duration::from_secs(5),
            network_stats_interval: Duration::from_secs(600),
        }
    }
}

/// Network state as last reported by the daemon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    pub height: u64,
    pub network_difficulty: f64,
    pub connections: u32,
    pub synced: bool,
    pub last_update: Option<OffsetDateTime>,
}

pub struct JobManager<C: CoinAdapter, D: DaemonClient> {
    coin: Arc<C>,
    daemon: Arc<D>,
    config: JobManagerConfig,
    math: DifficultyMath,
    ids: JobIdSource,

    current: watch::Sender<Option<JobBroadcast<C::Work>>>,

    /// Serializes `update_job` even when called outside the updater task.
    update_lock: tokio::sync::Mutex<()>,
    last_broadcast: Mutex<Option<Instant>>,
    longpoll_id: Mutex<Option<String>>,

    /// Cleared while the daemon is disconnected or syncing.
    ready: AtomicBool,
    network: Mutex<NetworkStats>,

    /// Fingerprints for coins that deduplicate across jobs.
    duplicates: Arc<DuplicateTracker>,

    triggers: mpsc::Sender<UpdateTrigger>,
    trigger_rx: Mutex<Option<mpsc::Receiver<UpdateTrigger>>>,
}

impl<C: CoinAdapter, D: DaemonClient> JobManager<C, D> {
    pub fn new(coin: Arc<C>, daemon: Arc<D>, config: JobManagerConfig) -> Self {
        let (current, _) = watch::channel(None);
        let (triggers, trigger_rx) = mpsc::channel(TRIGGER_QUEUE_DEPTH);
        let math = coin.difficulty_math();

        Self {
            coin,
            daemon,
            config,
            math,
            ids: JobIdSource::new(),
            current,
            update_lock: tokio::sync::Mutex::new(()),
            last_broadcast: Mutex::new(None),
            longpoll_id: Mutex::new(None),
            ready: AtomicBool::new(true),
            network: Mutex::new(NetworkStats::default()),
            duplicates: Arc::new(DuplicateTracker::new()),
            triggers,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    pub fn coin(&self) -> &Arc<C> {
        &self.coin
    }

    /// The current job, if one has been produced yet.
    pub fn current_job(&self) -> Option<Arc<Job<C::Work>>> {
        self.current.borrow().as_ref().map(|b| b.job.clone())
    }

    /// Watch the current job. The receiver wakes on every broadcast.
    pub fn subscribe(&self) -> watch::Receiver<Option<JobBroadcast<C::Work>>> {
        self.current.subscribe()
    }

    pub fn network_stats(&self) -> NetworkStats {
        self.network.lock().clone()
    }

    pub fn duplicates(&self) -> Arc<DuplicateTracker> {
        self.duplicates.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Queue an update without waiting for it.
    pub fn trigger(&self, trigger: UpdateTrigger) {
        if let Err(e) = self.triggers.try_send(trigger) {
            debug!(error = %e, "Update trigger dropped");
        }
    }

    /// Fetch (or accept a pushed) template and replace the current job if
    /// warranted.
    ///
    /// A template whose identity matches the current job is ignored unless
    /// the trigger is forced, in which case the same template is reissued
    /// under a new job id without `clean_jobs`. Errors leave the current job
    /// in place.
    pub async fn update_job(&self, trigger: UpdateTrigger) -> Result<UpdateOutcome> {
        let _guard = self.update_lock.lock().await;
        let forced = trigger.is_forced();
        let unchanged = UpdateOutcome {
            is_new: false,
            forced,
        };

        if !self.is_ready() {
            debug!(trigger = trigger.name(), "Daemon not ready, job production suspended");
            return Ok(unchanged);
        }

        let trigger_name = trigger.name();
        let raw = match trigger {
            UpdateTrigger::Push(template) => template,
            _ => self.daemon.get_block_template().await?,
        };

        let template = self.coin.parse_template(&raw)?;
        if let Some(id) = self.coin.long_poll_id(&template) {
            *self.longpoll_id.lock() = Some(id);
        }

        let identity = self.coin.template_identity(&template);
        let is_new = self
            .current
            .borrow()
            .as_ref()
            .is_none_or(|current| *current.job.identity() != identity);

        if !is_new && !forced {
            trace!(trigger = trigger_name, "Template unchanged");
            return Ok(unchanged);
        }

        let prepared = self.coin.build_job(template)?;
        let job = Arc::new(Job::new(
            self.ids.next_id(),
            identity,
            prepared.network_target,
            &self.math,
            prepared.work,
        ));

        if is_new {
            info!(
                job_id = job.id(),
                height = job.height(),
                network_difficulty = %DisplayDifficulty(job.network_difficulty()),
                trigger = trigger_name,
                "New block template"
            );
            let mut network = self.network.lock();
            network.height = job.height();
            network.network_difficulty = job.network_difficulty();
            drop(network);

            let forgotten = self.duplicates.clear();
            trace!(forgotten, "Cleared manager duplicate fingerprints");
        } else {
            debug!(job_id = job.id(), height = job.height(), "Rebroadcasting job");
        }

        self.current.send_replace(Some(JobBroadcast {
            job,
            clean_jobs: is_new,
        }));
        *self.last_broadcast.lock() = Some(Instant::now());

        Ok(UpdateOutcome { is_new, forced })
    }

    /// Submit a block candidate to the daemon.
    ///
    /// On acceptance the share receives the block's confirmation data and a
    /// `BlockFound` update is queued. On rejection or error the share is
    /// downgraded to an ordinary share. Returns whether the daemon accepted.
    pub async fn submit_block(&self, share: &mut Share, block: &BlockSubmission) -> bool {
        match self.daemon.submit_block(&block.payload).await {
            Ok(SubmitOutcome::Accepted) => {
                info!(
                    block_hash = %block.block_hash,
                    height = share.block_height,
                    miner = %share.miner,
                    "Block accepted by daemon"
                );
                share.transaction_confirmation_data = block.confirmation_data.clone();
                self.trigger(UpdateTrigger::BlockFound);
                true
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                error!(
                    block_hash = %block.block_hash,
                    height = share.block_height,
                    reason = %reason,
                    "Daemon rejected block"
                );
                share.is_block_candidate = false;
                false
            }
            Err(e) => {
                error!(
                    block_hash = %block.block_hash,
                    height = share.block_height,
                    error = %e,
                    "Block submission failed"
                );
                share.is_block_candidate = false;
                false
            }
        }
    }

    /// Query the daemon and record its state. Returns whether it is ready.
    pub async fn refresh_network_stats(&self) -> bool {
        match self.daemon.status().await {
            Ok(status) => {
                let ready = status.is_ready();
                {
                    let mut network = self.network.lock();
                    network.connections = status.connections;
                    network.synced = status.synced;
                    network.network_difficulty = status.difficulty;
                    network.height = network.height.max(status.blocks + 1);
                    network.last_update = Some(OffsetDateTime::now_utc());
                }

                let was_ready = self.ready.swap(ready, Ordering::AcqRel);
                match (was_ready, ready) {
                    (true, false) => warn!(
                        connections = status.connections,
                        synced = status.synced,
                        "Daemon not ready, suspending job production"
                    ),
                    (false, true) => {
                        info!("Daemon ready, resuming job production");
                        self.trigger(UpdateTrigger::Poll);
                    }
                    _ => {}
                }
                ready
            }
            Err(e) => {
                warn!(error = %e, "Failed to query daemon status");
                false
            }
        }
    }

    /// Wait until the daemon reports connected and synced.
    ///
    /// Returns `false` if shutdown was requested first.
    pub async fn wait_for_daemons(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.daemon.status().await {
                Ok(status) if status.is_ready() => {
                    self.refresh_network_stats().await;
                    info!(
                        height = status.blocks,
                        connections = status.connections,
                        "Daemon online"
                    );
                    return true;
                }
                Ok(status) if !status.synced => {
                    info!(height = status.blocks, "Daemon is still syncing, waiting");
                }
                Ok(_) => info!("Daemon has no peers, waiting"),
                Err(e) => warn!(error = %e, "Daemon unreachable, waiting"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.health_check_interval) => {}
                _ = shutdown.cancelled() => return false,
            }
        }
    }

    /// Start the update pipeline and its producers on `tracker`.
    pub fn start(self: &Arc<Self>, tracker: &TaskTracker, shutdown: CancellationToken) {
        let Some(trigger_rx) = self.trigger_rx.lock().take() else {
            warn!("Job manager already started");
            return;
        };

        tracker.spawn(self.clone().updater(trigger_rx, shutdown.clone()));
        tracker.spawn(self.clone().bootstrap(shutdown.clone()));
        if self.daemon.supports_long_poll() {
            tracker.spawn(self.clone().long_poll(shutdown.clone()));
        } else {
            tracker.spawn(self.clone().poll(shutdown.clone()));
        }
        tracker.spawn(self.clone().rebroadcast(shutdown.clone()));
        tracker.spawn(self.clone().network_stats_loop(shutdown));
    }

    async fn updater(
        self: Arc<Self>,
        mut trigger_rx: mpsc::Receiver<UpdateTrigger>,
        shutdown: CancellationToken,
    ) {
        loop {
            let trigger = tokio::select! {
                trigger = trigger_rx.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let name = trigger.name();
            tokio::select! {
                result = self.update_job(trigger) => {
                    if let Err(e) = result {
                        warn!(trigger = name, error = %e, "Job update failed, keeping current job");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Job updater stopped");
    }

    fn has_job(&self) -> bool {
        self.current.borrow().is_some()
    }

    async fn bootstrap(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.bootstrap_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            if self.has_job() {
                break;
            }
            self.trigger(UpdateTrigger::Bootstrap);
        }
        debug!("Bootstrap complete");
    }

    async fn poll(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.block_refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.trigger(UpdateTrigger::Poll),
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn long_poll(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let id = self.longpoll_id.lock().clone();
            let Some(id) = id else {
                // No template yet; bootstrap will fetch one.
                tokio::select! {
                    _ = tokio::time::sleep(self.config.bootstrap_interval) => {}
                    _ = shutdown.cancelled() => return,
                }
                continue;
            };

            let result = tokio::select! {
                result = self.daemon.long_poll(&id) => result,
                _ = shutdown.cancelled() => return,
            };

            match result {
                Ok(Some(template)) => self.trigger(UpdateTrigger::Push(template)),
                Ok(None) => {
                    info!("Daemon has no long poll, falling back to polling");
                    return self.poll(shutdown).await;
                }
                Err(e) => {
                    warn!(error = %e, "Long poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(LONG_POLL_RETRY) => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn rebroadcast(self: Arc<Self>, shutdown: CancellationToken) {
        let timeout = self.config.job_rebroadcast_timeout;
        loop {
            let deadline = self
                .last_broadcast
                .lock()
                .map_or_else(|| Instant::now() + timeout, |last| last + timeout);

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shutdown.cancelled() => return,
            }

            let quiet = self
                .last_broadcast
                .lock()
                .is_some_and(|last| last.elapsed() >= timeout);
            if quiet {
                self.trigger(UpdateTrigger::Rebroadcast);
                // Give the updater a full period before looking again.
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }

    async fn network_stats_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.network_stats_interval);
        // The first tick completes immediately; wait_for_daemons just refreshed.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh_network_stats().await;
                }
                _ = shutdown.cancelled() => return,
            }
        }
    }
}
