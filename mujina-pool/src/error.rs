//! Common error types for mujina-pool.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from the module-level error types used throughout the crate.

use thiserror::Error;

use crate::coin::CoinError;
use crate::rpc::RpcError;

/// Main error type for mujina-pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Daemon communication errors
    #[error("Daemon error: {0}")]
    Rpc(#[from] RpcError),

    /// Coin adapter errors (templates, addresses, serialization)
    #[error("Coin error: {0}")]
    Coin(#[from] CoinError),

    /// Malformed JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Line framing errors on a Stratum connection
    #[error("Codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
