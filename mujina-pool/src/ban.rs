//! Address bans.
//!
//! Connections are refused while their address is banned. Bans come from two
//! places: a connection whose invalid-share ratio crosses the configured
//! threshold, and (optionally) a failed `mining.authorize`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;

use crate::tracing::prelude::*;

pub trait BanManager: Send + Sync + 'static {
    fn is_banned(&self, address: IpAddr) -> bool;

    fn ban(&self, address: IpAddr, duration: Duration);
}

/// In-memory ban list. Bans do not survive a restart.
#[derive(Debug, Default)]
pub struct IntegratedBanManager {
    bans: Mutex<HashMap<IpAddr, Instant>>,
}

impl IntegratedBanManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `address` is banned at `now`. Expired bans are dropped.
    pub fn is_banned_at(&self, address: IpAddr, now: Instant) -> bool {
        let mut bans = self.bans.lock();
        match bans.get(&address) {
            Some(until) if *until > now => true,
            Some(_) => {
                bans.remove(&address);
                false
            }
            None => false,
        }
    }

    /// Ban `address` until `now + duration`. Expired bans are dropped.
    pub fn ban_at(&self, address: IpAddr, duration: Duration, now: Instant) {
        let until = now + duration;
        let mut bans = self.bans.lock();
        bans.retain(|_, expiry| *expiry > now);
        let entry = bans.entry(address).or_insert(until);
        // A shorter ban never cuts an existing one short.
        if *entry < until {
            *entry = until;
        }
    }

    pub fn len(&self) -> usize {
        self.bans.lock().len()
    }
}

impl BanManager for IntegratedBanManager {
    fn is_banned(&self, address: IpAddr) -> bool {
        self.is_banned_at(address, Instant::now())
    }

    fn ban(&self, address: IpAddr, duration: Duration) {
        self.ban_at(address, duration, Instant::now());
        warn!(
            %address,
            secs = duration.as_secs(),
            active_bans = self.len(),
            "Banning address"
        );
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BanningConfig {
    pub enabled: bool,
    /// Shares between two evaluations of the invalid ratio.
    pub check_threshold: u64,
    /// Invalid share percentage at which the address is banned.
    pub invalid_percent: f64,
    pub time_secs: u64,
    /// Ban length after a failed authorization; no ban when unset.
    pub auth_failure_ban_secs: Option<u64>,
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_threshold: 100,
            invalid_percent: 50.0,
            time_secs: 600,
            auth_failure_ban_secs: None,
        }
    }
}

impl BanningConfig {
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.time_secs)
    }

    pub fn auth_failure_ban(&self) -> Option<Duration> {
        self.auth_failure_ban_secs.map(Duration::from_secs)
    }
}

/// Invalid-share policy for one connection.
#[derive(Debug, Default)]
pub struct InvalidShareBanPolicy {
    valid: u64,
    invalid: u64,
}

impl InvalidShareBanPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a share. Returns true when the connection should be banned.
    ///
    /// Every `check_threshold` shares the invalid percentage is evaluated
    /// and the counters start over.
    pub fn record(&mut self, valid: bool, config: &BanningConfig) -> bool {
        if !config.enabled || config.check_threshold == 0 {
            return false;
        }

        if valid {
            self.valid += 1;
        } else {
            self.invalid += 1;
        }

        let total = self.valid + self.invalid;
        if total < config.check_threshold {
            return false;
        }

        let percent = self.invalid as f64 / total as f64 * 100.0;
        self.valid = 0;
        self.invalid = 0;
        percent >= config.invalid_percent
    }
}
