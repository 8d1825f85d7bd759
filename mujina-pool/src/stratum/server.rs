//! TCP listener for one Stratum port.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::{Connection, PortSettings, StratumContext};
use crate::coin::CoinAdapter;
use crate::rpc::DaemonClient;
use crate::tracing::prelude::*;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct StratumServer<C: CoinAdapter, D: DaemonClient> {
    pool: Arc<StratumContext<C, D>>,
    /// Shared by all ports so ids are unique pool-wide.
    connection_ids: AtomicU64,
}

impl<C: CoinAdapter, D: DaemonClient> StratumServer<C, D> {
    pub fn new(pool: Arc<StratumContext<C, D>>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            connection_ids: AtomicU64::new(1),
        })
    }

    /// Accept connections until shutdown. Connection tasks are spawned on
    /// `tracker` and stop with `shutdown` too.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        settings: Arc<PortSettings>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!(
                %addr,
                difficulty = settings.difficulty,
                vardiff = settings.vardiff.is_some(),
                "Stratum port listening"
            );
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, remote_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            if self.pool.bans.is_banned(remote_addr.ip()) {
                debug!(%remote_addr, "Refusing banned address");
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                trace!(error = %e, "Failed to set TCP_NODELAY");
            }

            let connection_id = self.connection_ids.fetch_add(1, Ordering::Relaxed);
            debug!(connection_id, %remote_addr, "Miner connected");

            let connection = Connection::new(
                stream,
                connection_id,
                remote_addr,
                self.pool.clone(),
                settings.clone(),
                shutdown.child_token(),
            );
            tracker.spawn(
                async move {
                    if let Err(e) = connection.run().await {
                        debug!(connection_id, error = %e, "Connection ended with error");
                    }
                }
                .instrument(tracing::info_span!("conn", id = connection_id)),
            );
        }

        debug!("Stratum port stopped");
    }
}
