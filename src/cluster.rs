use crate::config::ClusterConfig;
use crate::connection::gateway_url;
use crate::error::Error;
use crate::handler::EventHandler;
use crate::metrics::Metrics;
use crate::model::GatewayBotInfo;
use crate::session::{ClusterSnapshot, ShardInfo, ShardSessionInfo, ShardSnapshot};
use crate::shard::{Shard, ShardCommand, ShardRunner, COMMAND_CHANNEL_SIZE};
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

/// Which path [`Cluster::start_or_resume`] took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPlan {
    /// Every shard identifies from scratch
    Fresh,
    /// Shards were rebuilt from the snapshot and attempt to resume
    Resume,
}

/// Honor `snapshot` only when it describes exactly `expected` shards
pub fn plan_startup(snapshot: Option<&ClusterSnapshot>, expected: u32) -> StartPlan {
    match snapshot {
        Some(snapshot) if snapshot.matches(expected) => StartPlan::Resume,
        _ => StartPlan::Fresh,
    }
}

/// Startup concurrency: the configured override, never above what the
/// platform recommends, and never below one
pub fn effective_concurrency(configured: Option<u32>, recommended: u32) -> u32 {
    configured
        .map_or(recommended, |c| c.min(recommended))
        .max(1)
}

/// Admits shard startups in batches of `concurrency`, spacing batch starts
/// by at least `window`.
#[derive(Debug)]
pub struct StartupStager {
    concurrency: u32,
    window: Duration,
    batch_started: Option<Instant>,
    in_batch: u32,
}

impl StartupStager {
    pub fn new(concurrency: u32, window: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            window,
            batch_started: None,
            in_batch: 0,
        }
    }

    /// Wait until the next shard may start.
    ///
    /// Cancel safe: a cancelled wait leaves the batch as it was.
    pub async fn admit(&mut self) {
        if let Some(started) = self.batch_started {
            if self.in_batch >= self.concurrency {
                sleep_until(started + self.window).await;
                self.batch_started = None;
            }
        }

        if self.batch_started.is_none() {
            self.batch_started = Some(Instant::now());
            self.in_batch = 0;
        }
        self.in_batch += 1;
    }
}

/// Owns every shard of one bot and keeps them connected.
///
/// # Thread Safety
///
/// `Cluster` is `Send + Sync`; all methods may be called from multiple tasks.
/// Start and stop are serialized through a lifecycle lock.
pub struct Cluster<H: EventHandler> {
    config: Arc<ClusterConfig>,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    shards: RwLock<BTreeMap<u32, Shard>>,
    /// Startup task; owns the shard tasks
    launcher: RwLock<Option<JoinHandle<()>>>,
    /// Mutex to serialize start/stop operations.
    /// This is a tokio::Mutex so it can be held across await points.
    lifecycle_lock: Mutex<()>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl<H: EventHandler> Cluster<H> {
    pub fn new(config: ClusterConfig, handler: H) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            metrics: Arc::new(Metrics::new()),
            shards: RwLock::new(BTreeMap::new()),
            launcher: RwLock::new(None),
            lifecycle_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Startup concurrency for a platform recommendation
    pub fn effective_concurrency(&self, recommended: u32) -> u32 {
        effective_concurrency(self.config.max_concurrency, recommended)
    }

    /// Start `shard_count` fresh shards against `url`
    pub async fn start(&self, url: &str, shard_count: u32, recommended_concurrency: u32) -> Result<(), Error> {
        let shards = (0..shard_count)
            .map(|index| Ok((ShardInfo::new(index, shard_count)?, ShardSessionInfo::default())))
            .collect::<Result<Vec<_>, Error>>()?;
        self.launch(url, shards, recommended_concurrency).await
    }

    /// Rebuild shards from `snapshot` and start them; each attempts to resume
    pub async fn resume(
        &self,
        url: &str,
        snapshot: &ClusterSnapshot,
        recommended_concurrency: u32,
    ) -> Result<(), Error> {
        let total = snapshot.shards.first().map_or(0, |s| s.info.total);
        if !snapshot.matches(total) {
            return Err(Error::InvalidSnapshot {
                shards: snapshot.shard_count(),
                total,
            });
        }

        let mut shards = snapshot
            .shards
            .iter()
            .map(|s| Ok((ShardInfo::new(s.info.index, s.info.total)?, s.session.clone())))
            .collect::<Result<Vec<_>, Error>>()?;
        shards.sort_by_key(|(info, _)| info.index);
        self.launch(url, shards, recommended_concurrency).await
    }

    /// Resume from `snapshot` if it matches `expected_shards`, otherwise start fresh
    pub async fn start_or_resume(
        &self,
        url: &str,
        expected_shards: u32,
        recommended_concurrency: u32,
        snapshot: Option<&ClusterSnapshot>,
    ) -> Result<StartPlan, Error> {
        let plan = plan_startup(snapshot, expected_shards);
        match (plan, snapshot) {
            (StartPlan::Resume, Some(snapshot)) => {
                info!("Resuming {} shards from snapshot", expected_shards);
                self.resume(url, snapshot, recommended_concurrency).await?;
            }
            _ => {
                if let Some(snapshot) = snapshot {
                    warn!(
                        "Snapshot with {} entries does not cover shards 0..{}, starting fresh",
                        snapshot.shard_count(),
                        expected_shards
                    );
                }
                self.start(url, expected_shards, recommended_concurrency).await?;
            }
        }
        Ok(plan)
    }

    /// Start with the layout returned by the gateway-bot endpoint
    pub async fn start_from_gateway_info(
        &self,
        info: &GatewayBotInfo,
        snapshot: Option<&ClusterSnapshot>,
    ) -> Result<StartPlan, Error> {
        if info.session_start_limit.remaining < info.shards {
            warn!(
                "Only {} session starts remaining for {} shards (resets in {:?})",
                info.session_start_limit.remaining,
                info.shards,
                Duration::from_millis(info.session_start_limit.reset_after)
            );
        }
        self.start_or_resume(
            &info.url,
            info.shards,
            info.session_start_limit.max_concurrency,
            snapshot,
        )
        .await
    }

    /// Current session of every shard, for a later warm restart
    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            shards: self
                .shards
                .read()
                .values()
                .map(|shard| ShardSnapshot {
                    info: shard.info(),
                    session: shard.session(),
                })
                .collect(),
        }
    }

    pub fn shard(&self, id: u32) -> Option<Shard> {
        self.shards.read().get(&id).cloned()
    }

    /// All shards in index order
    pub fn shards(&self) -> Vec<Shard> {
        self.shards.read().values().cloned().collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Stop all shards gracefully.
    ///
    /// Interrupts staged startup, closes every connection and waits for the
    /// shard tasks to finish. Shards stay registered so `snapshot()` still
    /// reports their final sessions; the cluster can be started again.
    pub async fn stop(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Stopping cluster");
        self.shutdown.send_replace(true);

        // Collect handles while holding lock briefly
        let shards: Vec<Shard> = self.shards.read().values().cloned().collect();
        for shard in shards {
            if let Err(e) = shard.close().await {
                debug!("[SHARD-{}] Close command not delivered: {}", shard.id(), e);
            }
        }

        let launcher = self.launcher.write().take();
        if let Some(handle) = launcher {
            if let Err(e) = handle.await {
                warn!("Launcher task failed: {}", e);
            }
        }

        info!("Cluster stopped");
        Ok(())
    }

    async fn launch(
        &self,
        url: &str,
        shards: Vec<(ShardInfo, ShardSessionInfo)>,
        recommended_concurrency: u32,
    ) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if self.running.load(Ordering::Acquire) {
            return Err(Error::AlreadyRunning);
        }
        if shards.is_empty() {
            return Err(Error::InvalidShard { index: 0, total: 0 });
        }

        let url = gateway_url(url, self.config.gateway_version)?;
        let concurrency = self.effective_concurrency(recommended_concurrency);

        info!(
            "Starting {} shards against {} (concurrency {})",
            shards.len(),
            url,
            concurrency
        );

        self.shards.write().clear();
        let mut runners = Vec::with_capacity(shards.len());

        for (info, session) in shards {
            let (tx, rx) = mpsc::channel::<ShardCommand>(COMMAND_CHANNEL_SIZE);
            let shard = Shard::new(info, tx);

            debug!(
                "[SHARD-{}] Creating shard {} (resumable: {})",
                info.index,
                info,
                session.can_resume()
            );

            let runner = ShardRunner::new(
                shard.clone(),
                session,
                url.clone(),
                &self.config,
                self.handler.clone(),
                self.metrics.clone(),
                rx,
            );

            self.shards.write().insert(info.index, shard.clone());
            self.handler.on_shard_created(&shard).await;
            runners.push(runner);
        }

        self.shutdown.send_replace(false);
        let stager = StartupStager::new(concurrency, self.config.startup_window);
        let handle = tokio::spawn(Self::run_staged(
            runners,
            stager,
            self.shutdown.subscribe(),
            self.metrics.clone(),
        ));
        *self.launcher.write() = Some(handle);
        self.running.store(true, Ordering::Release);

        Ok(())
    }

    /// Spawn runners as the stager admits them, then wait for all of them
    async fn run_staged(
        runners: Vec<ShardRunner<H>>,
        mut stager: StartupStager,
        mut shutdown: watch::Receiver<bool>,
        metrics: Arc<Metrics>,
    ) {
        // Dropping the set aborts every shard task
        let mut tasks = JoinSet::new();

        for runner in runners {
            let id = runner.id();
            tokio::select! {
                _ = stager.admit() => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    debug!("[SHARD-{}] Startup interrupted by shutdown", id);
                    break;
                }
            }
            debug!("[SHARD-{}] Starting", id);
            tasks.spawn(Self::run_with_recovery(runner, metrics.clone()));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Shard task failed: {}", e);
            }
        }
    }

    /// Run a shard with panic recovery
    async fn run_with_recovery(runner: ShardRunner<H>, metrics: Arc<Metrics>) {
        let id = runner.id();
        if let Err(panic_err) = AssertUnwindSafe(runner.run()).catch_unwind().await {
            // Extract panic message if possible
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(
                "[SHARD-{}] Shard task PANICKED: {}. Shard is now dead.",
                id, panic_msg
            );
            metrics.record_error();
        }
    }
}

impl<H: EventHandler> Drop for Cluster<H> {
    fn drop(&mut self) {
        // Aborting the launcher drops its JoinSet, which aborts the shards
        if let Some(handle) = self.launcher.write().take() {
            handle.abort();
        }
    }
}
