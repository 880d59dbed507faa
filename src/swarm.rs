//! Swarm - Registry and lifecycle of many bots
//!
//! Each bot owns its state and runs in its own task; the swarm only holds
//! handles, profiles and snapshot receivers. Start and stop are idempotent,
//! and bots that were active when the process went down resume on `initialize`.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::clob::ExecutorFactory;
use crate::config::{AppConfig, ConfigProfile};
use crate::engine::{run_bot, BotDeps, BotExit, BotInstance, BotSnapshot, ResolutionEvent};
use crate::error::SwarmError;
use crate::persistence::{BotRecord, Persistence};
use crate::polymarket::{CachedMarketData, MarketDataProvider};
use crate::types::{BotId, BotStatus};

const RESOLUTION_CHANNEL_CAPACITY: usize = 256;

struct BotHandle {
    name: String,
    profile: Arc<RwLock<ConfigProfile>>,
    snapshots: Arc<watch::Sender<BotSnapshot>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<BotExit>>,
    /// Set while `stop` waits for the task to finish
    stopping: bool,
}

impl BotHandle {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn profile(&self) -> ConfigProfile {
        match self.profile.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct Swarm {
    config: AppConfig,
    market: Arc<dyn MarketDataProvider>,
    executors: Arc<dyn ExecutorFactory>,
    persistence: Arc<dyn Persistence>,
    resolutions: broadcast::Sender<ResolutionEvent>,
    bots: Mutex<HashMap<BotId, BotHandle>>,
}

impl Swarm {
    pub fn new(
        config: AppConfig,
        market: Arc<dyn MarketDataProvider>,
        executors: Arc<dyn ExecutorFactory>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let market: Arc<dyn MarketDataProvider> = if config.swarm.candle_cache_ttl_ms > 0 {
            Arc::new(CachedMarketData::new(
                market,
                Duration::from_millis(config.swarm.candle_cache_ttl_ms),
            ))
        } else {
            market
        };
        let (resolutions, _) = broadcast::channel(RESOLUTION_CHANNEL_CAPACITY);
        Self {
            config,
            market,
            executors,
            persistence,
            resolutions,
            bots: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted bots and resume the ones that were active
    pub async fn initialize(&self) -> Result<Vec<BotId>, SwarmError> {
        let records = self.persistence.list_bot_records().await?;
        let mut resumable = Vec::new();
        {
            let mut bots = self.bots.lock().await;
            for record in records {
                if record.should_resume() {
                    resumable.push(record.bot_id);
                }
                let snapshot = BotSnapshot::idle(record.bot_id, &record.name, record.profile.profile.mode, Utc::now());
                let snapshot = BotSnapshot {
                    status: record.status,
                    last_error: record.last_error.clone(),
                    ..snapshot
                };
                bots.insert(record.bot_id, new_handle(record.name, record.profile, snapshot));
            }
            tracing::info!(bots = bots.len(), resumable = resumable.len(), "Swarm state loaded");
        }

        if !self.config.swarm.resume_on_start {
            return Ok(Vec::new());
        }
        let mut resumed = Vec::new();
        for bot_id in resumable {
            match self.start(bot_id).await {
                Ok(()) => resumed.push(bot_id),
                Err(err) => tracing::error!(bot_id = bot_id, error = %err, "❌ Failed to resume bot"),
            }
        }
        Ok(resumed)
    }

    /// Register a bot; without a profile it runs on the configured defaults
    pub async fn register_bot(
        &self,
        bot_id: BotId,
        name: impl Into<String>,
        profile: Option<ConfigProfile>,
    ) -> Result<(), SwarmError> {
        let name = name.into();
        let profile = profile.unwrap_or_else(|| ConfigProfile::new(self.config.bot_defaults.clone()));
        profile
            .profile
            .validate()
            .map_err(|reason| SwarmError::InvalidConfig { bot_id, reason })?;

        let mut bots = self.bots.lock().await;
        if bots.contains_key(&bot_id) {
            return Err(SwarmError::AlreadyRegistered(bot_id));
        }
        self.persistence
            .save_bot_record(&BotRecord::new(bot_id, name.clone(), profile.clone()))
            .await?;

        let snapshot = BotSnapshot::idle(bot_id, &name, profile.profile.mode, Utc::now());
        bots.insert(bot_id, new_handle(name.clone(), profile, snapshot));
        tracing::info!(bot_id = bot_id, name = %name, "Bot registered");
        Ok(())
    }

    pub async fn bot_ids(&self) -> Vec<BotId> {
        let mut ids: Vec<BotId> = self.bots.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Start a bot's task. Starting a running bot is a no-op.
    pub async fn start(&self, bot_id: BotId) -> Result<(), SwarmError> {
        let mut bots = self.bots.lock().await;
        let handle = bots.get_mut(&bot_id).ok_or(SwarmError::UnknownBot(bot_id))?;
        if handle.stopping {
            return Err(SwarmError::Stopping(bot_id));
        }
        if handle.is_running() {
            tracing::debug!(bot_id = bot_id, "Bot already running");
            return Ok(());
        }

        let profile = handle.profile();
        let mode = profile.effective().mode;
        let instance = match self.build_instance(bot_id, handle, mode).await {
            Ok(instance) => instance,
            Err(err) => {
                let reason = format!("{:#}", err);
                tracing::error!(bot_id = bot_id, error = %reason, "❌ Bot failed to start");
                self.save_status(bot_id, &handle.name, profile, BotStatus::Error, Some(reason.clone()))
                    .await?;
                handle.snapshots.send_modify(|s| {
                    s.status = BotStatus::Error;
                    s.last_error = Some(reason.clone());
                    s.updated_at = Utc::now();
                });
                return Err(SwarmError::StartFailed { bot_id, reason });
            }
        };

        let status = if mode.is_dry_run() {
            BotStatus::DryRun
        } else {
            BotStatus::Running
        };
        self.save_status(bot_id, &handle.name, profile, status, None).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        handle.task = Some(tokio::spawn(run_bot(instance, shutdown_rx, self.config.swarm.clone())));
        handle.shutdown = Some(shutdown_tx);
        Ok(())
    }

    async fn build_instance(
        &self,
        bot_id: BotId,
        handle: &BotHandle,
        mode: crate::types::TradingMode,
    ) -> anyhow::Result<BotInstance> {
        let executor = self.executors.create(bot_id, mode)?;
        let deps = BotDeps {
            market: self.market.clone(),
            persistence: self.persistence.clone(),
            executor,
            resolutions: self.resolutions.clone(),
        };
        BotInstance::load(
            bot_id,
            handle.name.clone(),
            handle.profile.clone(),
            deps,
            handle.snapshots.clone(),
            Utc::now(),
        )
        .await
    }

    /// Signal shutdown and wait for the in-flight tick. Stopping a stopped bot is a no-op.
    ///
    /// The bot is marked as stopping until its task is gone, so a concurrent `start`
    /// cannot spawn a second instance next to the old one.
    pub async fn stop(&self, bot_id: BotId) -> Result<(), SwarmError> {
        let (shutdown, task, name, profile) = {
            let mut bots = self.bots.lock().await;
            let handle = bots.get_mut(&bot_id).ok_or(SwarmError::UnknownBot(bot_id))?;
            let task = handle.task.take();
            if task.is_some() {
                handle.stopping = true;
            }
            (handle.shutdown.take(), task, handle.name.clone(), handle.profile())
        };
        let Some(task) = task else {
            return Ok(());
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        let halted = self.join_bot(bot_id, task).await;
        let saved = if halted {
            Ok(())
        } else {
            self.save_status(bot_id, &name, profile, BotStatus::Stopped, None).await
        };

        if let Some(handle) = self.bots.lock().await.get_mut(&bot_id) {
            handle.stopping = false;
            if !halted {
                handle.snapshots.send_modify(|s| {
                    s.status = BotStatus::Stopped;
                    s.updated_at = Utc::now();
                });
            }
        }
        saved
    }

    /// Wait for a signalled task, aborting it after the stop timeout. True if the bot had halted.
    async fn join_bot(&self, bot_id: BotId, mut task: JoinHandle<BotExit>) -> bool {
        let timeout = Duration::from_secs(self.config.swarm.stop_timeout_secs);
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(BotExit::Stopped)) => false,
            Ok(Ok(BotExit::Failed(reason))) => {
                tracing::info!(bot_id = bot_id, reason = %reason, "Stopped bot had already halted");
                true
            }
            Ok(Err(err)) => {
                tracing::error!(bot_id = bot_id, error = %err, "Bot task panicked");
                false
            }
            Err(_) => {
                tracing::warn!(bot_id = bot_id, timeout_secs = timeout.as_secs(), "⚠️ Bot did not stop in time, aborting");
                task.abort();
                let _ = task.await;
                false
            }
        }
    }

    /// Stop every running bot
    pub async fn shutdown(&self) {
        for bot_id in self.bot_ids().await {
            if let Err(err) = self.stop(bot_id).await {
                tracing::error!(bot_id = bot_id, error = %err, "Failed to stop bot");
            }
        }
    }

    /// Merge a partial config into the bot's saved profile. A running bot picks it up on its next tick.
    pub async fn set_config(&self, bot_id: BotId, partial: &Value) -> Result<ConfigProfile, SwarmError> {
        self.update_profile(bot_id, |profile| {
            profile
                .apply_partial(partial)
                .map_err(|reason| SwarmError::InvalidConfig { bot_id, reason })
        })
        .await
    }

    /// Switch between the saved profile and the defaults without losing the profile
    pub async fn set_config_enabled(&self, bot_id: BotId, enabled: bool) -> Result<ConfigProfile, SwarmError> {
        self.update_profile(bot_id, |profile| {
            profile.enabled = enabled;
            Ok(())
        })
        .await
    }

    async fn update_profile<F>(&self, bot_id: BotId, apply: F) -> Result<ConfigProfile, SwarmError>
    where
        F: FnOnce(&mut ConfigProfile) -> Result<(), SwarmError>,
    {
        let bots = self.bots.lock().await;
        let handle = bots.get(&bot_id).ok_or(SwarmError::UnknownBot(bot_id))?;

        let mut updated = handle.profile();
        apply(&mut updated)?;

        let mut record = self
            .persistence
            .load_bot_record(bot_id)
            .await?
            .unwrap_or_else(|| BotRecord::new(bot_id, handle.name.clone(), updated.clone()));
        record.profile = updated.clone();
        self.persistence.save_bot_record(&record).await?;

        match handle.profile.write() {
            Ok(mut guard) => *guard = updated.clone(),
            Err(poisoned) => *poisoned.into_inner() = updated.clone(),
        }
        tracing::info!(bot_id = bot_id, enabled = updated.enabled, "Bot config updated");
        Ok(updated)
    }

    pub async fn profile(&self, bot_id: BotId) -> Result<ConfigProfile, SwarmError> {
        let bots = self.bots.lock().await;
        let handle = bots.get(&bot_id).ok_or(SwarmError::UnknownBot(bot_id))?;
        Ok(handle.profile())
    }

    pub async fn snapshot(&self, bot_id: BotId) -> Result<BotSnapshot, SwarmError> {
        let bots = self.bots.lock().await;
        let handle = bots.get(&bot_id).ok_or(SwarmError::UnknownBot(bot_id))?;
        let snapshot = handle.snapshots.borrow().clone();
        Ok(snapshot)
    }

    pub async fn snapshots(&self) -> Vec<BotSnapshot> {
        let bots = self.bots.lock().await;
        let mut all: Vec<BotSnapshot> = bots.values().map(|h| h.snapshots.borrow().clone()).collect();
        all.sort_by_key(|s| s.bot_id);
        all
    }

    /// Change feed for one bot's snapshot
    pub async fn watch(&self, bot_id: BotId) -> Result<watch::Receiver<BotSnapshot>, SwarmError> {
        let bots = self.bots.lock().await;
        let handle = bots.get(&bot_id).ok_or(SwarmError::UnknownBot(bot_id))?;
        Ok(handle.snapshots.subscribe())
    }

    pub async fn status(&self, bot_id: BotId) -> Result<BotStatus, SwarmError> {
        Ok(self.snapshot(bot_id).await?.status)
    }

    /// Every settled position across the swarm
    pub fn subscribe_resolutions(&self) -> broadcast::Receiver<ResolutionEvent> {
        self.resolutions.subscribe()
    }

    async fn save_status(
        &self,
        bot_id: BotId,
        name: &str,
        profile: ConfigProfile,
        status: BotStatus,
        last_error: Option<String>,
    ) -> Result<(), SwarmError> {
        let mut record = self
            .persistence
            .load_bot_record(bot_id)
            .await?
            .unwrap_or_else(|| BotRecord::new(bot_id, name, profile));
        record.status = status;
        record.last_error = last_error;
        self.persistence.save_bot_record(&record).await?;
        Ok(())
    }
}

fn new_handle(name: String, profile: ConfigProfile, snapshot: BotSnapshot) -> BotHandle {
    let (snapshots, _) = watch::channel(snapshot);
    BotHandle {
        name,
        profile: Arc::new(RwLock::new(profile)),
        snapshots: Arc::new(snapshots),
        shutdown: None,
        task: None,
        stopping: false,
    }
}
