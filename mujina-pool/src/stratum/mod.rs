//! Stratum v1 server.
//!
//! Miners speak line-delimited JSON-RPC over TCP. Each accepted socket gets
//! a [`Connection`] task; all of them share one [`StratumContext`] holding
//! the job manager, the share validator and the other pool-wide services.

mod connection;
pub mod extranonce;
pub mod messages;
pub mod password;
mod server;

pub use connection::{Connection, MAX_LINE_LENGTH};
pub use server::StratumServer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::ban::{BanManager, BanningConfig};
use crate::coin::CoinAdapter;
use crate::job_manager::JobManager;
use crate::rpc::DaemonClient;
use crate::share::Share;
use crate::stats::PoolStats;
use crate::validator::ShareValidator;
use crate::vardiff::VarDiffConfig;

use self::extranonce::ExtranonceAllocator;

/// Grace period after a retarget when VarDiff is off.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(90);

/// Services shared by every connection of a pool.
pub struct StratumContext<C: CoinAdapter, D: DaemonClient> {
    pub manager: Arc<JobManager<C, D>>,
    pub validator: ShareValidator<C>,
    pub extranonces: Arc<ExtranonceAllocator>,
    pub bans: Arc<dyn BanManager>,
    /// Accepted shares, for the share recorder.
    pub shares: mpsc::Sender<Share>,
    pub stats: Arc<PoolStats>,
}

/// Per-port connection settings.
#[derive(Debug, Clone)]
pub struct PortSettings {
    /// Starting difficulty.
    pub difficulty: f64,
    pub vardiff: Option<VarDiffConfig>,
    pub max_active_jobs: usize,
    pub extranonce2_size: usize,
    /// Connections silent for this long are closed.
    pub idle_timeout: Duration,
    pub banning: BanningConfig,
}

impl PortSettings {
    /// How long the previous difficulty stays acceptable after a retarget:
    /// one VarDiff retarget interval.
    pub fn grace_period(&self) -> Duration {
        self.vardiff
            .as_ref()
            .map(VarDiffConfig::retarget_interval)
            .unwrap_or(DEFAULT_GRACE_PERIOD)
    }

    /// Period of the timer that lets idle miners retarget.
    fn vardiff_check_interval(&self) -> Duration {
        (self.grace_period() / 4).max(Duration::from_secs(1))
    }
}
