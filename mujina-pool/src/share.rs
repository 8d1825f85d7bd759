//! Share records and rejection reasons.

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::coin::BlockSubmission;

/// Why a submission was rejected.
///
/// Every variant maps onto a Stratum error code via [`ShareError::code`].
/// Rejections are answered on the connection and counted against the
/// worker's invalid-share statistic; none of them closes the connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShareError {
    #[error("Not subscribed")]
    NotSubscribed,

    #[error("Unauthorized worker")]
    Unauthorized,

    /// Submission fields with the wrong count, length or encoding.
    #[error("{0}")]
    Malformed(String),

    #[error("Job not found")]
    JobNotFound,

    #[error("Duplicate share")]
    Duplicate,

    #[error("ntime out of range")]
    NtimeOutOfRange,

    /// The coin's verification step rejected the solution.
    #[error("Invalid solution")]
    InvalidSolution,

    #[error("Low difficulty share ({share_difficulty})")]
    LowDifficulty { share_difficulty: f64 },

    #[error("{0}")]
    Other(String),
}

impl ShareError {
    /// Stratum error code.
    pub fn code(&self) -> i32 {
        match self {
            ShareError::JobNotFound => 21,
            ShareError::Duplicate => 22,
            ShareError::LowDifficulty { .. } => 23,
            ShareError::Unauthorized => 24,
            ShareError::NotSubscribed => 25,
            ShareError::Malformed(_)
            | ShareError::NtimeOutOfRange
            | ShareError::InvalidSolution
            | ShareError::Other(_) => 20,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        ShareError::Malformed(message.into())
    }
}

/// An accepted share.
///
/// `difficulty` is the credited difficulty: the worker's difficulty when the
/// share was accepted (or the previous difficulty when the share was accepted
/// inside the retarget grace window), never the raw difficulty the hash
/// happened to prove.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub pool_id: String,
    pub miner: String,
    pub worker: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: String,
    pub job_id: String,
    pub difficulty: f64,
    pub network_difficulty: f64,
    pub block_height: u64,
    pub is_block_candidate: bool,
    pub block_hash: Option<String>,
    pub transaction_confirmation_data: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

/// Outcome of a successful validation.
///
/// `block` is present exactly when the share is a block candidate; the caller
/// hands it to the job manager for submission to the daemon.
#[derive(Debug, Clone)]
pub struct ValidatedShare {
    pub share: Share,
    pub block: Option<BlockSubmission>,
}
