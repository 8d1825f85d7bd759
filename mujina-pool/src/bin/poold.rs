//! Daemon for mujina-pool.
//!
//! Usage: `mujina-poold [config.json]`. Without an argument the path is
//! read from `MUJINA_POOL_CONFIG`.

use std::env;

use anyhow::Result;

use mujina_pool::config::PoolConfig;
use mujina_pool::pool::Pool;
use mujina_pool::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let config = match PoolConfig::load(env::args().nth(1)) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    Pool::new(config).run().await
}
