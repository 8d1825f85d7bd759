//! Share validation.
//!
//! Every `mining.submit` runs through the same pipeline:
//!
//! ```text
//! received -> format checked -> job resolved -> dedup checked -> hashed
//!          -> difficulty checked -> classified -> accepted | rejected
//! ```
//!
//! The block-candidate check comes before the difficulty gate: a hash that
//! meets the network target is a block candidate no matter what the ratio
//! arithmetic against the worker's difficulty says.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use time::OffsetDateTime;

use crate::coin::{CoinAdapter, DedupScope, SubmitRequest};
use crate::job::DuplicateTracker;
use crate::share::{Share, ShareError, ValidatedShare};
use crate::tracing::prelude::*;
use crate::types::{DifficultyMath, DisplayDifficulty};
use crate::worker::WorkerContext;

/// Shares proving at least this fraction of the required difficulty are
/// accepted. Absorbs rounding between target encoding and decoding.
pub const DIFFICULTY_TOLERANCE: f64 = 0.99;

pub struct ShareValidator<C: CoinAdapter> {
    coin: Arc<C>,
    math: DifficultyMath,
    /// Used instead of per-job trackers when the coin dedups across jobs.
    manager_duplicates: Arc<DuplicateTracker>,
    pool_id: String,
}

impl<C: CoinAdapter> ShareValidator<C> {
    pub fn new(coin: Arc<C>, manager_duplicates: Arc<DuplicateTracker>, pool_id: String) -> Self {
        let math = coin.difficulty_math();
        Self {
            coin,
            math,
            manager_duplicates,
            pool_id,
        }
    }

    /// Validate a submission from the worker behind `ctx`.
    ///
    /// Once the fingerprint has been recorded the remaining steps always run
    /// to completion, so a recorded fingerprint always has a verdict.
    pub async fn validate(
        &self,
        ctx: &WorkerContext<C::Work>,
        params: &[Value],
        now: Instant,
    ) -> Result<ValidatedShare, ShareError> {
        if !ctx.is_subscribed() {
            return Err(ShareError::NotSubscribed);
        }
        if !ctx.is_authorized() {
            return Err(ShareError::Unauthorized);
        }

        let request = SubmitRequest {
            params,
            extranonce1: ctx.extranonce1(),
            extranonce2_size: ctx.extranonce2_size(),
            version_mask: ctx.version_mask(),
        };
        let submission = self.coin.parse_submission(&request)?;

        let job = ctx
            .get_job(&submission.job_id)
            .ok_or(ShareError::JobNotFound)?;
        self.coin.check_submission(&job, &submission.fields)?;

        let fingerprint = self.coin.fingerprint(&submission.fields);
        let first_seen = match self.coin.dedup_scope() {
            DedupScope::Job => job.duplicates().insert(fingerprint),
            DedupScope::Manager => self.manager_duplicates.insert(fingerprint),
        };
        if !first_seen {
            return Err(ShareError::Duplicate);
        }

        let (outcome, fields) = {
            let coin = self.coin.clone();
            let job = job.clone();
            let fields = submission.fields;
            tokio::task::spawn_blocking(move || {
                let outcome = coin.hash(&job, &fields);
                (outcome, fields)
            })
            .await
            .map_err(|e| ShareError::Other(format!("hashing task failed: {}", e)))?
        };
        let outcome = outcome?;
        if !outcome.verified {
            return Err(ShareError::InvalidSolution);
        }

        let share_difficulty = self.math.difficulty_from_hash(outcome.hash);
        let mut is_block_candidate = job.is_block_candidate(outcome.hash);

        let credited = if is_block_candidate {
            ctx.difficulty()
        } else {
            self.credited_difficulty(ctx, share_difficulty, now)?
        };

        let block = if is_block_candidate {
            match self.coin.serialize_block(&job, &fields, &outcome) {
                Ok(block) => Some(block),
                Err(e) => {
                    error!(
                        job_id = job.id(),
                        block_hash = %outcome.block_hash,
                        error = %e,
                        "Failed to serialize block candidate"
                    );
                    is_block_candidate = false;
                    None
                }
            }
        } else {
            None
        };

        let share = Share {
            pool_id: self.pool_id.clone(),
            miner: ctx.miner().unwrap_or_default().to_string(),
            worker: ctx.worker().map(str::to_string),
            user_agent: ctx.user_agent().map(str::to_string),
            ip_address: ctx.remote_addr().ip().to_string(),
            job_id: job.id().to_string(),
            difficulty: credited,
            network_difficulty: job.network_difficulty(),
            block_height: job.height(),
            is_block_candidate,
            block_hash: is_block_candidate.then(|| outcome.block_hash.clone()),
            transaction_confirmation_data: None,
            created: OffsetDateTime::now_utc(),
        };

        if is_block_candidate {
            info!(
                connection = ctx.connection_id(),
                job_id = job.id(),
                height = job.height(),
                block_hash = %outcome.block_hash,
                "Block candidate"
            );
        } else {
            trace!(
                connection = ctx.connection_id(),
                job_id = job.id(),
                share_difficulty = %DisplayDifficulty(share_difficulty),
                credited = %DisplayDifficulty(credited),
                "Share accepted"
            );
        }

        Ok(ValidatedShare { share, block })
    }

    /// Difficulty to credit for a share that is not a block candidate.
    ///
    /// The current difficulty applies first; shortly after a retarget a share
    /// may still be credited at the previous difficulty.
    fn credited_difficulty(
        &self,
        ctx: &WorkerContext<C::Work>,
        share_difficulty: f64,
        now: Instant,
    ) -> Result<f64, ShareError> {
        let current = ctx.difficulty();
        if share_difficulty / current >= DIFFICULTY_TOLERANCE {
            return Ok(current);
        }

        if let Some(previous) = ctx.previous_difficulty(now) {
            if share_difficulty / previous >= DIFFICULTY_TOLERANCE {
                debug!(
                    connection = ctx.connection_id(),
                    previous,
                    current,
                    "Share accepted at previous difficulty"
                );
                return Ok(previous);
            }
        }

        Err(ShareError::LowDifficulty { share_difficulty })
    }
}
