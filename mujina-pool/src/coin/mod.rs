//! Per-coin capabilities.
//!
//! The job manager and share validator are generic over a [`CoinAdapter`],
//! which knows how to turn a daemon's block template into work for miners,
//! how to read a miner's submission, how to hash it, and how to assemble a
//! block when a submission meets the network target. Everything
//! coin-specific lives behind this trait; nothing else in the pool looks
//! inside a template.

pub mod bitcoin;

#[cfg(test)]
pub mod testing;

use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::job::{Job, TemplateIdentity};
use crate::share::ShareError;
use crate::types::DifficultyMath;
use crate::u256::U256;

/// Coin adapter errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoinError {
    #[error("invalid block template: {0}")]
    InvalidTemplate(String),

    #[error("invalid pool address: {0}")]
    InvalidAddress(String),

    #[error("block serialization failed: {0}")]
    Serialization(String),
}

/// Coin families the pool can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CoinFamily {
    #[default]
    Bitcoin,
}

/// Lifetime of the duplicate-share fingerprints for a coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupScope {
    /// Fingerprints live in each job's own tracker.
    Job,
    /// Fingerprints live in the job manager's tracker for its whole lifetime.
    Manager,
}

/// Work prepared from a template, ready to become a [`Job`].
#[derive(Debug)]
pub struct PreparedWork<W> {
    pub network_target: U256,
    pub work: W,
}

/// A raw `mining.submit` together with the connection state needed to
/// interpret it.
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    pub params: &'a [Value],
    pub extranonce1: &'a [u8],
    pub extranonce2_size: usize,
    /// Version bits the connection negotiated through `mining.configure`.
    pub version_mask: Option<u32>,
}

/// A submission that passed the format check.
#[derive(Debug, Clone)]
pub struct Submission<F> {
    pub job_id: String,
    pub fields: F,
}

/// Result of hashing a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PowOutcome {
    /// Hash as a number, compared against share and network targets.
    pub hash: U256,
    /// Block hash in the coin's display format.
    pub block_hash: String,
    /// False when the coin's own verification rejected the solution.
    pub verified: bool,
}

/// A serialized block ready for the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSubmission {
    /// Hex-encoded block, as passed to `submitblock`.
    pub payload: String,
    pub block_hash: String,
    /// Data that later lets payment processing confirm the block, e.g. the
    /// coinbase transaction id.
    pub confirmation_data: Option<String>,
}

/// Coin-specific behaviour plugged into the generic pool engine.
pub trait CoinAdapter: Send + Sync + 'static {
    type Template: fmt::Debug + Send + Sync + 'static;
    type Work: fmt::Debug + Send + Sync + 'static;
    type SubmitFields: fmt::Debug + Send + 'static;

    fn family(&self) -> CoinFamily;

    fn difficulty_math(&self) -> DifficultyMath;

    fn dedup_scope(&self) -> DedupScope {
        DedupScope::Job
    }

    /// Whether `address` is a valid payout address on the configured network.
    fn validate_address(&self, address: &str) -> bool;

    /// Parse a daemon's block template.
    fn parse_template(&self, raw: &Value) -> Result<Self::Template, CoinError>;

    /// The chain tip a template builds on.
    fn template_identity(&self, template: &Self::Template) -> TemplateIdentity;

    /// Long-poll id to pass back to the daemon, if it supports long polling.
    fn long_poll_id(&self, _template: &Self::Template) -> Option<String> {
        None
    }

    /// Prepare miner work from a template.
    fn build_job(&self, template: Self::Template) -> Result<PreparedWork<Self::Work>, CoinError>;

    /// Parameters of the `mining.notify` sent for a job.
    fn notify_params(&self, job: &Job<Self::Work>, clean_jobs: bool) -> Value;

    /// Check the format of a submission.
    fn parse_submission(
        &self,
        request: &SubmitRequest<'_>,
    ) -> Result<Submission<Self::SubmitFields>, ShareError>;

    /// Check a submission against the job it names.
    fn check_submission(
        &self,
        _job: &Job<Self::Work>,
        _fields: &Self::SubmitFields,
    ) -> Result<(), ShareError> {
        Ok(())
    }

    /// Key identifying the work a submission covers.
    fn fingerprint(&self, fields: &Self::SubmitFields) -> String;

    /// Hash a submission against its job. CPU bound; callers run it on the
    /// blocking pool.
    fn hash(&self, job: &Job<Self::Work>, fields: &Self::SubmitFields) -> Result<PowOutcome, ShareError>;

    /// Serialize the block for a submission that met the network target.
    fn serialize_block(
        &self,
        job: &Job<Self::Work>,
        fields: &Self::SubmitFields,
        outcome: &PowOutcome,
    ) -> Result<BlockSubmission, CoinError>;
}
