//! One miner connection.
//!
//! A [`Connection`] is an actor: a single task owns the socket, the
//! [`WorkerContext`] and the VarDiff controller, and reacts to four kinds of
//! events one at a time:
//!
//! - a line from the miner (subscribe, authorize, configure, submit)
//! - a new job on the job manager's watch channel
//! - the VarDiff timer
//! - the idle timer
//!
//! Because job broadcasts and submissions are handled on the same task, the
//! job window never sees a concurrent reader and writer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::extranonce::ExtranonceLease;
use super::messages::{self, JsonRpcMessage, OTHER_ERROR, str_param};
use super::password::PasswordVars;
use super::{PortSettings, StratumContext};
use crate::ban::InvalidShareBanPolicy;
use crate::coin::CoinAdapter;
use crate::error::Result;
use crate::job::{Job, JobBroadcast};
use crate::rpc::DaemonClient;
use crate::share::ShareError;
use crate::stats::ConnectedMiner;
use crate::tracing::prelude::*;
use crate::types::DisplayDifficulty;
use crate::vardiff::VarDiffController;
use crate::worker::{WorkerContext, split_login};

/// Longest line accepted from a miner.
pub const MAX_LINE_LENGTH: usize = 1 << 16;

/// Version bits miners may roll (BIP320).
const VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

enum Event {
    Line(Option<std::result::Result<String, LinesCodecError>>),
    /// False once the job manager is gone.
    JobChanged(bool),
    VarDiffTick,
    Idle,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Current time on the tokio clock, so paused-time tests drive VarDiff and
/// grace windows too.
fn now() -> Instant {
    time::Instant::now().into_std()
}

pub struct Connection<C: CoinAdapter, D: DaemonClient, S> {
    framed: Framed<S, LinesCodec>,
    ctx: WorkerContext<C::Work>,
    pool: Arc<StratumContext<C, D>>,
    settings: Arc<PortSettings>,
    jobs: watch::Receiver<Option<JobBroadcast<C::Work>>>,
    vardiff: Option<VarDiffController>,
    ban_policy: InvalidShareBanPolicy,
    extranonce: Option<ExtranonceLease>,
    _miner: ConnectedMiner,
    shutdown: CancellationToken,
}

impl<C, D, S> Connection<C, D, S>
where
    C: CoinAdapter,
    D: DaemonClient,
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        connection_id: u64,
        remote_addr: SocketAddr,
        pool: Arc<StratumContext<C, D>>,
        settings: Arc<PortSettings>,
        shutdown: CancellationToken,
    ) -> Self {
        let ctx = WorkerContext::new(
            connection_id,
            remote_addr,
            settings.difficulty,
            settings.grace_period(),
        );
        let vardiff = settings
            .vardiff
            .clone()
            .map(|config| VarDiffController::new(config, now()));

        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            ctx,
            jobs: pool.manager.subscribe(),
            vardiff,
            ban_policy: InvalidShareBanPolicy::new(),
            extranonce: None,
            _miner: pool.stats.miner_connected(),
            pool,
            settings,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let idle = time::sleep(self.settings.idle_timeout);
        tokio::pin!(idle);

        let mut vardiff_timer = time::interval(self.settings.vardiff_check_interval());
        vardiff_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        vardiff_timer.tick().await;

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => Event::Shutdown,
                line = self.framed.next() => Event::Line(line),
                changed = self.jobs.changed() => Event::JobChanged(changed.is_ok()),
                _ = vardiff_timer.tick(), if self.vardiff.is_some() => Event::VarDiffTick,
                _ = &mut idle => Event::Idle,
            };

            let flow = match event {
                Event::Shutdown => Flow::Close,
                Event::Idle => {
                    info!(
                        connection_id = self.ctx.connection_id(),
                        "Closing idle connection"
                    );
                    Flow::Close
                }
                Event::Line(None) => {
                    debug!(connection_id = self.ctx.connection_id(), "Miner disconnected");
                    Flow::Close
                }
                Event::Line(Some(Err(e))) => {
                    warn!(
                        connection_id = self.ctx.connection_id(),
                        error = %e,
                        "Read failed"
                    );
                    Flow::Close
                }
                Event::Line(Some(Ok(line))) => {
                    idle.as_mut()
                        .reset(time::Instant::now() + self.settings.idle_timeout);
                    self.handle_line(&line).await?
                }
                Event::JobChanged(true) => {
                    self.on_new_job().await?;
                    Flow::Continue
                }
                Event::JobChanged(false) => Flow::Close,
                Event::VarDiffTick => {
                    self.on_vardiff_tick().await?;
                    Flow::Continue
                }
            };

            if flow == Flow::Close {
                break;
            }
        }

        let stats = self.ctx.stats();
        debug!(
            connection_id = self.ctx.connection_id(),
            valid_shares = stats.valid_shares,
            invalid_shares = stats.invalid_shares,
            "Connection closed"
        );
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Flow::Continue);
        }
        trace!(connection_id = self.ctx.connection_id(), %line, "Received");

        let message = match serde_json::from_str::<JsonRpcMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    connection_id = self.ctx.connection_id(),
                    error = %e,
                    "Malformed request"
                );
                self.send(JsonRpcMessage::error(
                    Value::Null,
                    OTHER_ERROR,
                    "Malformed request",
                ))
                .await?;
                return Ok(Flow::Continue);
            }
        };

        let JsonRpcMessage::Request { id, method, params } = message else {
            trace!("Ignoring response from miner");
            return Ok(Flow::Continue);
        };

        match method.as_str() {
            "mining.subscribe" => self.handle_subscribe(id, &params).await,
            "mining.extranonce.subscribe" => {
                self.send(JsonRpcMessage::result(id, json!(true))).await?;
                Ok(Flow::Continue)
            }
            "mining.authorize" => self.handle_authorize(id, &params).await,
            "mining.configure" => self.handle_configure(id, &params).await,
            "mining.submit" => self.handle_submit(id, &params).await,
            other => {
                debug!(
                    connection_id = self.ctx.connection_id(),
                    method = other,
                    "Unsupported method"
                );
                self.send(JsonRpcMessage::error(id, OTHER_ERROR, "Unsupported method"))
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_subscribe(&mut self, id: Value, params: &Value) -> Result<Flow> {
        let extranonce1 = match &self.extranonce {
            Some(lease) => lease.bytes(),
            None => {
                let Some(lease) = self.pool.extranonces.lease() else {
                    warn!("Extranonce space exhausted");
                    self.send(JsonRpcMessage::error(id, OTHER_ERROR, "Pool is full"))
                        .await?;
                    return Ok(Flow::Close);
                };
                let bytes = lease.bytes();
                self.extranonce = Some(lease);
                bytes
            }
        };

        let user_agent = str_param(params, 0).map(str::to_string);
        self.ctx.subscribe(
            extranonce1.to_vec(),
            self.settings.extranonce2_size,
            user_agent,
        );

        let subscription = format!("{:016x}", self.ctx.connection_id());
        self.send(JsonRpcMessage::result(
            id,
            json!([
                [
                    ["mining.set_difficulty", subscription],
                    ["mining.notify", subscription]
                ],
                hex::encode(extranonce1),
                self.settings.extranonce2_size,
            ]),
        ))
        .await?;

        debug!(
            connection_id = self.ctx.connection_id(),
            extranonce1 = %hex::encode(extranonce1),
            user_agent = self.ctx.user_agent().unwrap_or_default(),
            "Miner subscribed"
        );

        if self.ctx.is_authorized() {
            self.send_initial_work().await?;
        }
        Ok(Flow::Continue)
    }

    async fn handle_authorize(&mut self, id: Value, params: &Value) -> Result<Flow> {
        let login = str_param(params, 0).unwrap_or_default().trim().to_string();
        let password = str_param(params, 1).unwrap_or_default().to_string();

        let (miner, _) = split_login(&login);
        if !self.pool.manager.coin().validate_address(miner) {
            warn!(
                connection_id = self.ctx.connection_id(),
                remote_addr = %self.ctx.remote_addr(),
                login = %login,
                "Authorization failed"
            );
            self.send(JsonRpcMessage::share_error(id, &ShareError::Unauthorized))
                .await?;

            if let Some(duration) = self.settings.banning.auth_failure_ban() {
                self.pool.bans.ban(self.ctx.remote_addr().ip(), duration);
                return Ok(Flow::Close);
            }
            return Ok(Flow::Continue);
        }

        self.ctx.authorize(&login);
        self.send(JsonRpcMessage::result(id, json!(true))).await?;
        info!(
            connection_id = self.ctx.connection_id(),
            miner = self.ctx.miner().unwrap_or_default(),
            worker = self.ctx.worker().unwrap_or_default(),
            "Miner authorized"
        );

        if let Some(difficulty) = PasswordVars::parse(&password).static_difficulty() {
            self.apply_static_difficulty(difficulty);
        }

        if self.ctx.is_subscribed() {
            self.send_initial_work().await?;
        }
        Ok(Flow::Continue)
    }

    fn apply_static_difficulty(&mut self, difficulty: f64) {
        let minimum = self.vardiff.as_ref().map(|v| v.config().min_difficulty);
        if let Some(minimum) = minimum.filter(|minimum| difficulty < *minimum) {
            debug!(
                connection_id = self.ctx.connection_id(),
                requested = difficulty,
                minimum,
                "Requested difficulty below VarDiff minimum, ignoring"
            );
            return;
        }

        self.ctx.set_static_difficulty(difficulty, now());
        self.vardiff = None;
        info!(
            connection_id = self.ctx.connection_id(),
            difficulty = %DisplayDifficulty(difficulty),
            "Static difficulty"
        );
    }

    /// BIP310 `mining.configure`. Only version rolling is supported; other
    /// extensions are declined.
    async fn handle_configure(&mut self, id: Value, params: &Value) -> Result<Flow> {
        let extensions: Vec<String> = params
            .get(0)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let options = params.get(1);

        let mut result = Map::new();
        for extension in extensions {
            if extension == "version-rolling" {
                let requested = options
                    .and_then(|o| o.get("version-rolling.mask"))
                    .and_then(Value::as_str)
                    .and_then(|mask| u32::from_str_radix(mask, 16).ok())
                    .unwrap_or(u32::MAX);
                let mask = requested & VERSION_ROLLING_MASK;
                self.ctx.set_version_mask(mask);

                result.insert("version-rolling".into(), json!(true));
                result.insert("version-rolling.mask".into(), json!(format!("{:08x}", mask)));
                debug!(
                    connection_id = self.ctx.connection_id(),
                    mask = %format!("{:08x}", mask),
                    "Version rolling enabled"
                );
            } else {
                result.insert(extension, json!(false));
            }
        }

        self.send(JsonRpcMessage::result(id, Value::Object(result)))
            .await?;
        Ok(Flow::Continue)
    }

    async fn handle_submit(&mut self, id: Value, params: &Value) -> Result<Flow> {
        let now = now();
        let fields = params.as_array().map(Vec::as_slice).unwrap_or_default();

        match self.pool.validator.validate(&self.ctx, fields, now).await {
            Ok(validated) => {
                self.ctx.record_valid_share(now);
                self.pool.stats.record_share(true);
                // The share is recorded and any block submitted even if the
                // miner is already gone.
                let reply = self.send(JsonRpcMessage::result(id, json!(true))).await;

                let mut share = validated.share;
                debug!(
                    connection_id = self.ctx.connection_id(),
                    job_id = %share.job_id,
                    difficulty = %DisplayDifficulty(share.difficulty),
                    "Share accepted"
                );

                if let Some(block) = validated.block {
                    let accepted = self.pool.manager.submit_block(&mut share, &block).await;
                    self.pool.stats.record_block(accepted);
                }
                if self.pool.shares.send(share).await.is_err() {
                    warn!("Share recorder stopped");
                }

                self.ban_policy.record(true, &self.settings.banning);
                reply?;

                let current = self.ctx.difficulty();
                let retarget = self.vardiff.as_mut().and_then(|vardiff| {
                    vardiff.record_share();
                    vardiff.tick(now, current)
                });
                if let Some(difficulty) = retarget {
                    self.retarget(difficulty, now).await?;
                }
                Ok(Flow::Continue)
            }
            Err(error) => {
                self.ctx.record_invalid_share(now);
                self.pool.stats.record_share(false);
                debug!(
                    connection_id = self.ctx.connection_id(),
                    code = error.code(),
                    %error,
                    "Share rejected"
                );
                self.send(JsonRpcMessage::share_error(id, &error)).await?;

                if self.ban_policy.record(false, &self.settings.banning) {
                    self.pool.bans.ban(
                        self.ctx.remote_addr().ip(),
                        self.settings.banning.ban_duration(),
                    );
                    return Ok(Flow::Close);
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_vardiff_tick(&mut self) -> Result<()> {
        let now = now();
        let current = self.ctx.difficulty();
        let retarget = self
            .vardiff
            .as_mut()
            .and_then(|vardiff| vardiff.tick(now, current));
        if let Some(difficulty) = retarget {
            self.retarget(difficulty, now).await?;
        }
        Ok(())
    }

    /// Queue a new difficulty and, for a working miner, apply it right away
    /// together with a fresh copy of the current job.
    async fn retarget(&mut self, difficulty: f64, now: Instant) -> Result<()> {
        let previous = self.ctx.difficulty();
        self.ctx.set_pending_difficulty(difficulty);
        if !self.is_working() {
            return Ok(());
        }

        if self.ctx.apply_pending_difficulty(now) {
            info!(
                connection_id = self.ctx.connection_id(),
                from = %DisplayDifficulty(previous),
                to = %DisplayDifficulty(self.ctx.difficulty()),
                "Difficulty retargeted"
            );
            self.send(messages::set_difficulty(self.ctx.difficulty()))
                .await?;
            if let Some(job) = self.pool.manager.current_job() {
                self.send_job(&job, false).await?;
            }
        }
        Ok(())
    }

    async fn on_new_job(&mut self) -> Result<()> {
        let Some(broadcast) = self.latest_job() else {
            return Ok(());
        };
        if !self.is_working() {
            return Ok(());
        }

        if self.ctx.apply_pending_difficulty(now()) {
            self.send(messages::set_difficulty(self.ctx.difficulty()))
                .await?;
        }
        self.send_job(&broadcast.job, broadcast.clean_jobs).await
    }

    /// Difficulty and current job for a miner that just became ready.
    async fn send_initial_work(&mut self) -> Result<()> {
        self.ctx.apply_pending_difficulty(now());
        self.send(messages::set_difficulty(self.ctx.difficulty()))
            .await?;
        if let Some(broadcast) = self.latest_job() {
            self.send_job(&broadcast.job, true).await?;
        }
        Ok(())
    }

    async fn send_job(&mut self, job: &Arc<Job<C::Work>>, clean_jobs: bool) -> Result<()> {
        self.ctx
            .add_job(job.clone(), self.settings.max_active_jobs);
        let params = self.pool.manager.coin().notify_params(job, clean_jobs);
        trace!(
            connection_id = self.ctx.connection_id(),
            job_id = job.id(),
            clean_jobs,
            "Sending job"
        );
        self.send(messages::notify(params)).await
    }

    fn latest_job(&mut self) -> Option<JobBroadcast<C::Work>> {
        self.jobs.borrow_and_update().clone()
    }

    fn is_working(&self) -> bool {
        self.ctx.is_subscribed() && self.ctx.is_authorized()
    }

    async fn send(&mut self, message: JsonRpcMessage) -> Result<()> {
        let line = serde_json::to_string(&message)?;
        trace!(connection_id = self.ctx.connection_id(), %line, "Sending");
        self.framed.send(line).await?;
        Ok(())
    }
}
