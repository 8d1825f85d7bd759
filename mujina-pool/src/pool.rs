//! Pool lifecycle.
//!
//! [`Pool::run`] wires the configured coin and daemon into a job manager,
//! opens one Stratum listener per port and runs until SIGINT or SIGTERM.
//! Every task is spawned on one `TaskTracker` and stops with one
//! `CancellationToken`, so shutdown waits for connections to close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::ban::{BanManager, IntegratedBanManager};
use crate::coin::bitcoin::BitcoinAdapter;
use crate::coin::{CoinAdapter, CoinFamily};
use crate::config::PoolConfig;
use crate::job_manager::JobManager;
use crate::rpc::{BitcoindClient, DaemonClient};
use crate::share::Share;
use crate::stats::PoolStats;
use crate::stratum::extranonce::ExtranonceAllocator;
use crate::stratum::{StratumContext, StratumServer};
use crate::tracing::prelude::*;
use crate::types::DisplayDifficulty;
use crate::validator::ShareValidator;

/// Period of the pool statistics log line.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Accepted shares waiting for the recorder.
const SHARE_QUEUE_DEPTH: usize = 1024;

/// The pool daemon.
pub struct Pool {
    config: PoolConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<PoolStats>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stats: PoolStats::new(),
        }
    }

    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    /// Run the pool until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        match self.config.coin {
            CoinFamily::Bitcoin => {
                let network = self.config.network()?;
                let coin = BitcoinAdapter::new(
                    network,
                    &self.config.address,
                    self.config.coinbase_signature.as_bytes(),
                    self.config.extranonce_size(),
                )
                .context("pool address rejected")?;
                let daemon = BitcoindClient::new(self.config.bitcoind_config())
                    .context("failed to create daemon client")?;
                info!(%network, daemon = daemon.url(), "Bitcoin pool");

                self.run_with(Arc::new(coin), Arc::new(daemon)).await
            }
        }
    }

    async fn run_with<C: CoinAdapter, D: DaemonClient>(
        self,
        coin: Arc<C>,
        daemon: Arc<D>,
    ) -> anyhow::Result<()> {
        // Install signal handlers before the potentially long wait for the
        // daemon so an early Ctrl-C is honored.
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let signals = {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigint.recv() => info!("Received SIGINT."),
                    _ = sigterm.recv() => info!("Received SIGTERM."),
                    _ = shutdown.cancelled() => {}
                }
                shutdown.cancel();
            })
        };

        let started = self.start(coin, daemon).await;
        if let Err(e) = &started {
            error!(error = %e, "Startup failed");
            self.shutdown.cancel();
        }
        self.tracker.close();

        if started.is_ok() {
            info!("Started.");
            info!("For debugging, set RUST_LOG=mujina_pool=debug or trace.");
        }

        self.shutdown.cancelled().await;
        let _ = signals.await;

        self.tracker.wait().await;
        info!("Exiting.");

        started.map(|_| ())
    }

    /// Bring the pool up: wait for the daemon, start the job pipeline and
    /// bind every port. Returns the bound addresses; an empty list means
    /// shutdown was requested while waiting for the daemon.
    pub async fn start<C: CoinAdapter, D: DaemonClient>(
        &self,
        coin: Arc<C>,
        daemon: Arc<D>,
    ) -> anyhow::Result<Vec<SocketAddr>> {
        let manager = Arc::new(JobManager::new(
            coin.clone(),
            daemon,
            self.config.job_manager_config(),
        ));

        info!(coin = %coin.family(), pool_id = %self.config.id, "Waiting for daemon");
        if !manager.wait_for_daemons(&self.shutdown).await {
            return Ok(Vec::new());
        }
        manager.start(&self.tracker, self.shutdown.clone());

        let (share_tx, share_rx) = mpsc::channel(SHARE_QUEUE_DEPTH);
        self.tracker
            .spawn(record_shares(share_rx, self.shutdown.clone()));
        self.tracker.spawn(log_stats(
            self.stats.clone(),
            manager.clone(),
            self.shutdown.clone(),
        ));

        let bans: Arc<dyn BanManager> = Arc::new(IntegratedBanManager::new());
        let context = Arc::new(StratumContext {
            validator: ShareValidator::new(coin, manager.duplicates(), self.config.id.clone()),
            manager,
            extranonces: ExtranonceAllocator::new(self.config.instance_id),
            bans,
            shares: share_tx,
            stats: self.stats.clone(),
        });
        let server = StratumServer::new(context);

        let mut bound = Vec::with_capacity(self.config.ports.len());
        for port in &self.config.ports {
            let addr = SocketAddr::new(port.listen_address, port.port);
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {}", addr))?;
            bound.push(listener.local_addr()?);

            let settings = Arc::new(self.config.port_settings(port));
            self.tracker.spawn(server.clone().serve(
                listener,
                settings,
                self.tracker.clone(),
                self.shutdown.clone(),
            ));
        }

        Ok(bound)
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every task to finish after [`Pool::shutdown`].
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Log accepted shares until shutdown, then drain whatever is still queued.
/// Persistence hooks in here. Returns the number of shares recorded.
async fn record_shares(mut shares: mpsc::Receiver<Share>, shutdown: CancellationToken) -> u64 {
    let mut recorded = 0;
    loop {
        let share = tokio::select! {
            share = shares.recv() => match share {
                Some(share) => share,
                None => break,
            },
            _ = shutdown.cancelled() => {
                shares.close();
                while let Some(share) = shares.recv().await {
                    record_share(&share);
                    recorded += 1;
                }
                break;
            }
        };
        record_share(&share);
        recorded += 1;
    }
    debug!(recorded, "Share recorder stopped");
    recorded
}

fn record_share(share: &Share) {
    if share.is_block_candidate {
        info!(
            height = share.block_height,
            hash = share.block_hash.as_deref().unwrap_or_default(),
            miner = %share.miner,
            worker = share.worker.as_deref().unwrap_or_default(),
            "Block found"
        );
    } else {
        debug!(
            miner = %share.miner,
            worker = share.worker.as_deref().unwrap_or_default(),
            job_id = %share.job_id,
            difficulty = %DisplayDifficulty(share.difficulty),
            "Share accepted"
        );
    }
}

async fn log_stats<C: CoinAdapter, D: DaemonClient>(
    stats: Arc<PoolStats>,
    manager: Arc<JobManager<C, D>>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(STATS_LOG_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }

        let snapshot = stats.snapshot();
        let network = manager.network_stats();
        info!(
            miners = snapshot.connected_miners,
            valid = snapshot.valid_shares,
            invalid = snapshot.invalid_shares,
            blocks = snapshot.blocks_submitted,
            rejected_blocks = snapshot.blocks_rejected,
            height = network.height,
            network_difficulty = %DisplayDifficulty(network.network_difficulty),
            "Pool status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin::testing::{TestCoin, template_json};
    use crate::config::PortConfig;
    use crate::rpc::DaemonStatus;
    use crate::rpc::mock::MockDaemon;
    use futures::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio::net::TcpStream;
    use tokio_util::codec::{Framed, LinesCodec};

    fn config() -> PoolConfig {
        PoolConfig {
            address: "bc1qpool".into(),
            ports: vec![PortConfig {
                listen_address: "127.0.0.1".parse().unwrap(),
                port: 0,
                difficulty: 4.0,
                vardiff: None,
            }],
            ..Default::default()
        }
    }

    async fn request(client: &mut Framed<TcpStream, LinesCodec>, message: Value) -> Value {
        client.send(message.to_string()).await.unwrap();
        let line = client.next().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_pool_serves_miners_and_shuts_down() {
        let pool = Pool::new(config());
        let daemon = Arc::new(MockDaemon::new(template_json(100, 50_000.0)));
        let bound = pool
            .start(Arc::new(TestCoin::default()), daemon)
            .await
            .unwrap();
        assert_eq!(bound.len(), 1);

        let stream = TcpStream::connect(bound[0]).await.unwrap();
        let mut client = Framed::new(stream, LinesCodec::new());

        let reply = request(
            &mut client,
            json!({"id": 1, "method": "mining.subscribe", "params": ["test/1.0"]}),
        )
        .await;
        assert_eq!(reply["id"], 1);
        assert!(reply["error"].is_null());

        let reply = request(
            &mut client,
            json!({"id": 2, "method": "mining.authorize", "params": ["bc1qminer.rig1", "x"]}),
        )
        .await;
        assert_eq!(reply["result"], true);

        let difficulty = client.next().await.unwrap().unwrap();
        let difficulty: Value = serde_json::from_str(&difficulty).unwrap();
        assert_eq!(difficulty["method"], "mining.set_difficulty");
        assert_eq!(difficulty["params"][0], 4.0);
        assert_eq!(pool.stats().snapshot().connected_miners, 1);

        pool.shutdown();
        tokio::time::timeout(Duration::from_secs(5), pool.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_daemon() {
        let pool = Pool::new(config());
        let daemon = MockDaemon::new(template_json(100, 50_000.0));
        daemon.set_status(DaemonStatus {
            connections: 0,
            synced: false,
            blocks: 0,
            difficulty: 1.0,
        });

        let shutdown = pool.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });

        let bound = pool
            .start(Arc::new(TestCoin::default()), Arc::new(daemon))
            .await
            .unwrap();
        assert!(bound.is_empty());
        pool.wait().await;
    }

    #[tokio::test]
    async fn test_port_in_use_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = config();
        config.ports[0].port = taken.local_addr().unwrap().port();

        let pool = Pool::new(config);
        let daemon = Arc::new(MockDaemon::new(template_json(100, 50_000.0)));
        let result = pool.start(Arc::new(TestCoin::default()), daemon).await;
        assert!(result.is_err());

        pool.shutdown();
        pool.wait().await;
    }

    fn share(job_id: &str, is_block_candidate: bool) -> Share {
        Share {
            pool_id: "test".into(),
            miner: "bc1qminer".into(),
            worker: Some("rig1".into()),
            user_agent: None,
            ip_address: "127.0.0.1".into(),
            job_id: job_id.into(),
            difficulty: 4.0,
            network_difficulty: 50_000.0,
            block_height: 100,
            is_block_candidate,
            block_hash: is_block_candidate.then(|| "00ff".to_string()),
            transaction_confirmation_data: None,
            created: time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_recorder_drains_queue_on_shutdown() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(share("1", false)).await.unwrap();
        tx.send(share("1", true)).await.unwrap();
        tx.send(share("2", false)).await.unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        // Senders are still alive, so only the drain can end the recorder.
        assert_eq!(record_shares(rx, shutdown).await, 3);
        assert!(tx.send(share("3", false)).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_pool_address_is_fatal() {
        let mut config = config();
        config.network = "regtest".into();
        config.address = "not-an-address".into();

        let result = Pool::new(config).run().await;
        assert!(result.is_err());
    }
}
