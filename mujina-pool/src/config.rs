//! Pool configuration.
//!
//! The daemon reads one JSON document describing the pool: identity, the
//! coin daemon, the Stratum ports and the tuning knobs of the job pipeline.
//! The file path comes from the first command-line argument or
//! `MUJINA_POOL_CONFIG`. Daemon location and credentials can be overridden
//! from the environment so secrets need not live in the file:
//!
//! - `MUJINA_DAEMON_URL`
//! - `MUJINA_DAEMON_USER`
//! - `MUJINA_DAEMON_PASSWORD`

use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bitcoin::Network;
use serde::Deserialize;

use crate::ban::BanningConfig;
use crate::coin::CoinFamily;
use crate::error::{Error, Result};
use crate::job_manager::JobManagerConfig;
use crate::rpc::BitcoindConfig;
use crate::stratum::PortSettings;
use crate::stratum::extranonce::EXTRANONCE1_SIZE;
use crate::vardiff::VarDiffConfig;

pub const CONFIG_PATH_VAR: &str = "MUJINA_POOL_CONFIG";
pub const DAEMON_URL_VAR: &str = "MUJINA_DAEMON_URL";
pub const DAEMON_USER_VAR: &str = "MUJINA_DAEMON_USER";
pub const DAEMON_PASSWORD_VAR: &str = "MUJINA_DAEMON_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Pool identifier stamped on every share.
    pub id: String,
    pub coin: CoinFamily,
    /// `bitcoin`, `testnet`, `signet` or `regtest`.
    pub network: String,
    /// Payout address receiving the block reward.
    pub address: String,
    /// Tag embedded in every coinbase script.
    pub coinbase_signature: String,
    pub daemon: DaemonConfig,
    pub ports: Vec<PortConfig>,
    pub job_manager: JobManagerSection,
    /// Jobs a connection keeps valid for submission.
    pub max_active_jobs: usize,
    pub extranonce2_size: usize,
    /// First byte of every extranonce1, distinguishing pool instances.
    pub instance_id: u8,
    pub client_connection_timeout_secs: u64,
    pub banning: BanningConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            id: "mujina".into(),
            coin: CoinFamily::Bitcoin,
            network: "bitcoin".into(),
            address: String::new(),
            coinbase_signature: "/mujina-pool/".into(),
            daemon: DaemonConfig::default(),
            ports: Vec::new(),
            job_manager: JobManagerSection::default(),
            max_active_jobs: 8,
            extranonce2_size: 4,
            instance_id: 0,
            client_connection_timeout_secs: 600,
            banning: BanningConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Use `getblocktemplate` long polling when the daemon offers it.
    pub long_polling: bool,
    pub request_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".into(),
            user: None,
            password: None,
            long_polling: true,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,
    pub port: u16,
    /// Starting difficulty for connections on this port.
    pub difficulty: f64,
    #[serde(default)]
    pub vardiff: Option<VarDiffConfig>,
}

fn default_listen_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobManagerSection {
    pub block_refresh_interval_ms: u64,
    pub job_rebroadcast_timeout_secs: u64,
    pub bootstrap_interval_ms: u64,
    pub health_check_interval_secs: u64,
    pub network_stats_interval_secs: u64,
}

impl Default for JobManagerSection {
    fn default() -> Self {
        let defaults = JobManagerConfig::default();
        Self {
            block_refresh_interval_ms: defaults.block_refresh_interval.as_millis() as u64,
            job_rebroadcast_timeout_secs: defaults.job_rebroadcast_timeout.as_secs(),
            bootstrap_interval_ms: defaults.bootstrap_interval.as_millis() as u64,
            health_check_interval_secs: defaults.health_check_interval.as_secs(),
            network_stats_interval_secs: defaults.network_stats_interval.as_secs(),
        }
    }
}

impl PoolConfig {
    /// Locate, read, override and validate the configuration.
    ///
    /// `arg` is the first command-line argument, if any; it takes precedence
    /// over `MUJINA_POOL_CONFIG`.
    pub fn load(arg: Option<String>) -> Result<Self> {
        let path = arg
            .map(PathBuf::from)
            .or_else(|| env::var_os(CONFIG_PATH_VAR).map(PathBuf::from))
            .ok_or_else(|| {
                Error::Config(format!(
                    "no configuration file given (pass a path or set {CONFIG_PATH_VAR})"
                ))
            })?;

        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Replace daemon settings with values from `lookup`, normally the
    /// process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(DAEMON_URL_VAR) {
            self.daemon.url = url;
        }
        if let Some(user) = lookup(DAEMON_USER_VAR) {
            self.daemon.user = Some(user);
        }
        if let Some(password) = lookup(DAEMON_PASSWORD_VAR) {
            self.daemon.password = Some(password);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(Error::Config("no ports configured".into()));
        }
        if self.max_active_jobs == 0 {
            return Err(Error::Config("max_active_jobs must be at least 1".into()));
        }
        if self.extranonce2_size == 0 || self.extranonce2_size > 8 {
            return Err(Error::Config(format!(
                "extranonce2_size must be between 1 and 8, got {}",
                self.extranonce2_size
            )));
        }
        if self.daemon.url.trim().is_empty() {
            return Err(Error::Config("daemon url is empty".into()));
        }
        if self.address.trim().is_empty() {
            return Err(Error::Config("pool address is empty".into()));
        }
        self.network()?;

        for port in &self.ports {
            if !port.difficulty.is_finite() || port.difficulty <= 0.0 {
                return Err(Error::Config(format!(
                    "port {}: difficulty must be positive",
                    port.port
                )));
            }
            if let Some(vardiff) = &port.vardiff {
                if vardiff.min_difficulty <= 0.0 {
                    return Err(Error::Config(format!(
                        "port {}: vardiff min_difficulty must be positive",
                        port.port
                    )));
                }
                if vardiff.max_difficulty.is_some_and(|max| max < vardiff.min_difficulty) {
                    return Err(Error::Config(format!(
                        "port {}: vardiff min_difficulty exceeds max_difficulty",
                        port.port
                    )));
                }
                if vardiff.target_time_secs <= 0.0 || vardiff.retarget_time_secs <= 0.0 {
                    return Err(Error::Config(format!(
                        "port {}: vardiff times must be positive",
                        port.port
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn network(&self) -> Result<Network> {
        self.network
            .parse()
            .map_err(|_| Error::Config(format!("unknown network {:?}", self.network)))
    }

    /// Bytes reserved in the coinbase for extranonce1 and extranonce2.
    pub fn extranonce_size(&self) -> usize {
        EXTRANONCE1_SIZE + self.extranonce2_size
    }

    pub fn job_manager_config(&self) -> JobManagerConfig {
        let section = &self.job_manager;
        JobManagerConfig {
            block_refresh_interval: Duration::from_millis(section.block_refresh_interval_ms),
            job_rebroadcast_timeout: Duration::from_secs(section.job_rebroadcast_timeout_secs),
            bootstrap_interval: Duration::from_millis(section.bootstrap_interval_ms),
            health_check_interval: Duration::from_secs(section.health_check_interval_secs),
            network_stats_interval: Duration::from_secs(section.network_stats_interval_secs),
        }
    }

    pub fn bitcoind_config(&self) -> BitcoindConfig {
        BitcoindConfig {
            url: self.daemon.url.clone(),
            user: self.daemon.user.clone(),
            password: self.daemon.password.clone(),
            long_polling: self.daemon.long_polling,
            request_timeout: Duration::from_secs(self.daemon.request_timeout_secs),
        }
    }

    pub fn port_settings(&self, port: &PortConfig) -> PortSettings {
        PortSettings {
            difficulty: port.difficulty,
            vardiff: port.vardiff.clone(),
            max_active_jobs: self.max_active_jobs,
            extranonce2_size: self.extranonce2_size,
            idle_timeout: Duration::from_secs(self.client_connection_timeout_secs),
            banning: self.banning.clone(),
        }
    }
}
