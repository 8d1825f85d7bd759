//! Blockchain daemon access.
//!
//! The job manager talks to its daemon through the [`DaemonClient`] trait:
//! fetch block templates, submit blocks, and ask whether the node is
//! connected and synced. Templates travel as raw JSON; only the coin adapter
//! interprets them.

mod bitcoind;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use bitcoind::{BitcoindClient, BitcoindConfig};

/// Daemon communication errors.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    Http(u16),

    #[error("daemon error {code}: {message}")]
    Daemon { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Daemon verdict on a submitted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

/// Health and chain state reported by a daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonStatus {
    /// Peer connections.
    pub connections: u32,
    /// False while the node is still downloading the chain.
    pub synced: bool,
    /// Height of the best block.
    pub blocks: u64,
    pub difficulty: f64,
}

impl DaemonStatus {
    /// Whether the daemon can serve work worth mining.
    pub fn is_ready(&self) -> bool {
        self.connections > 0 && self.synced
    }
}

#[async_trait]
pub trait DaemonClient: Send + Sync + 'static {
    /// Fetch a fresh block template.
    async fn get_block_template(&self) -> Result<Value, RpcError>;

    /// Submit a hex-encoded block.
    async fn submit_block(&self, payload: &str) -> Result<SubmitOutcome, RpcError>;

    async fn status(&self) -> Result<DaemonStatus, RpcError>;

    /// Whether [`long_poll`](Self::long_poll) can push templates.
    fn supports_long_poll(&self) -> bool {
        false
    }

    /// Wait for a template newer than the one identified by `longpoll_id`.
    ///
    /// Returns `None` when the daemon has no push channel.
    async fn long_poll(&self, _longpoll_id: &str) -> Result<Option<Value>, RpcError> {
        Ok(None)
    }
}
