//! SamplerActor - periodically samples every enabled metric source
//!
//! ## State
//!
//! ```text
//!            start()                      stop()
//! Stopped ────────────► Running ──────────────────► Stopped
//!                        │   ▲
//!                        └───┘ update_settings(): stop + start
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! start ─► disk sample ─► Topic::Kind(Disk)
//!
//! tick ─► join!(cpu, memory, network, processes) ─► Topic::Composite
//!                                                └► Topic::Kind(..) per populated kind
//! ```
//!
//! Ticks run inline in the actor loop, so two ticks never overlap and
//! commands are only handled between ticks. The ticker uses
//! `MissedTickBehavior::Skip`: a tick that overruns the interval delays the
//! next one instead of triggering catch-up bursts.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info, instrument, trace, warn};

use super::bus::EventBus;
use super::messages::{SamplerCommand, SamplerStats};
use crate::config::{Config, SamplerSettings, SettingsPatch};
use crate::error::{SamplerError, SamplerResult};
use crate::sources::{SampleContext, SourceSet};
use crate::util::now_millis;
use crate::{MetricKind, Sample, TelemetryData};

/// Actor that owns the sampling schedule and the settings
///
/// It is the single writer of [`SamplerSettings`]; everyone else sees
/// snapshots, either via `get_settings` or the watch channel.
pub struct SamplerActor {
    host_id: String,

    settings: SamplerSettings,

    sources: SourceSet,

    /// Upper bound for a single source call
    source_timeout: Duration,

    bus: EventBus,

    settings_tx: watch::Sender<SamplerSettings>,

    command_rx: mpsc::Receiver<SamplerCommand>,

    /// `Some` while running
    ticker: Option<Interval>,

    stats: SamplerStats,
}

impl SamplerActor {
    pub fn new(
        config: &Config,
        sources: SourceSet,
        bus: EventBus,
        settings_tx: watch::Sender<SamplerSettings>,
        command_rx: mpsc::Receiver<SamplerCommand>,
    ) -> Self {
        Self {
            host_id: config.host_id.clone(),
            settings: config.sampler.clone(),
            sources,
            source_timeout: config.source_timeout(),
            bus,
            settings_tx,
            command_rx,
            ticker: None,
            stats: SamplerStats::default(),
        }
    }

    /// Run the actor's main loop until `Shutdown` or until every handle is dropped.
    #[instrument(skip(self), fields(host = %self.host_id))]
    pub async fn run(mut self) {
        debug!("starting sampler actor");

        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                _ = next_tick(&mut self.ticker) => {
                    self.tick().await;
                }

                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("command channel closed, shutting down");
                        break;
                    };

                    match cmd {
                        SamplerCommand::Start { respond_to } => {
                            self.start().await;
                            let _ = respond_to.send(());
                        }

                        SamplerCommand::Stop { respond_to } => {
                            self.stop();
                            let _ = respond_to.send(());
                        }

                        SamplerCommand::UpdateSettings { patch, respond_to } => {
                            let result = self.update_settings(patch).await;
                            let _ = respond_to.send(result);
                        }

                        SamplerCommand::GetSettings { respond_to } => {
                            let _ = respond_to.send(self.settings.clone());
                        }

                        SamplerCommand::SampleNow { respond_to } => {
                            let data = self.tick().await;
                            let _ = respond_to.send(data);
                        }

                        SamplerCommand::GetStats { respond_to } => {
                            let mut stats = self.stats.clone();
                            stats.running = self.ticker.is_some();
                            let _ = respond_to.send(stats);
                        }

                        SamplerCommand::Shutdown { respond_to } => {
                            debug!("received shutdown command");
                            shutdown_ack = Some(respond_to);
                            break;
                        }
                    }
                }
            }
        }

        self.stop();
        debug!("sampler actor stopped");

        // every sample of the last tick is on the bus by now
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    async fn start(&mut self) {
        if self.ticker.is_some() {
            trace!("already running");
            return;
        }

        info!(
            "sampling every {}ms ({:?})",
            self.settings.sample_interval_ms,
            self.enabled_kinds()
        );

        if self.settings.enable_disk {
            self.sample_disk().await;
        }

        // the first tick completes immediately
        let mut ticker = interval(self.settings.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
    }

    fn stop(&mut self) {
        if self.ticker.take().is_some() {
            info!("sampling stopped");
        }
    }

    async fn update_settings(&mut self, patch: SettingsPatch) -> SamplerResult<SamplerSettings> {
        let settings = self.settings.merged(&patch).inspect_err(|e| {
            warn!("rejected settings update: {e}");
        })?;

        debug!("settings updated: {settings:?}");
        self.settings = settings.clone();
        self.settings_tx.send_replace(settings.clone());

        if self.ticker.is_some() {
            self.stop();
            self.start().await;
        }

        Ok(settings)
    }

    /// Disk is only sampled when sampling starts.
    #[instrument(skip(self))]
    async fn sample_disk(&mut self) {
        let ctx = SampleContext::new(&self.host_id, now_millis());

        match self
            .sources
            .sample(MetricKind::Disk, &ctx, self.source_timeout)
            .await
        {
            Ok(sample) => {
                self.stats.disk_snapshots += 1;
                self.bus.publish_sample(sample);
            }
            Err(e) => {
                self.stats.source_failures += 1;
                warn!("{e}");
            }
        }
    }

    async fn sample_if_enabled(
        &self,
        kind: MetricKind,
        ctx: &SampleContext,
    ) -> Option<Result<Sample, SamplerError>> {
        if !self.settings.is_enabled(kind) {
            return None;
        }
        Some(self.sources.sample(kind, ctx, self.source_timeout).await)
    }

    /// Sample every enabled kind except disk and publish the results.
    #[instrument(skip(self))]
    async fn tick(&mut self) -> TelemetryData {
        let ctx = SampleContext::new(&self.host_id, now_millis());

        let (cpu, memory, network, processes) = tokio::join!(
            self.sample_if_enabled(MetricKind::Cpu, &ctx),
            self.sample_if_enabled(MetricKind::Memory, &ctx),
            self.sample_if_enabled(MetricKind::Network, &ctx),
            self.sample_if_enabled(MetricKind::Processes, &ctx),
        );

        let mut data = TelemetryData::new(ctx.timestamp_ms);
        for result in [cpu, memory, network, processes].into_iter().flatten() {
            match result {
                Ok(sample) => data.insert(sample),
                Err(e) => {
                    self.stats.source_failures += 1;
                    warn!("{e}");
                }
            }
        }

        self.stats.ticks += 1;
        trace!("tick {} sampled {:?}", self.stats.ticks, data.kinds());

        let samples = data.populated();
        self.bus.publish_composite(data.clone());
        for sample in samples {
            self.bus.publish_sample(sample);
        }

        data
    }

    fn enabled_kinds(&self) -> Vec<MetricKind> {
        MetricKind::ALL
            .into_iter()
            .filter(|kind| self.settings.is_enabled(*kind))
            .collect()
    }
}

/// Resolves on the next tick, or never when stopped.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handle for controlling a SamplerActor
///
/// Cheap to clone. Dropping every handle stops the actor.
#[derive(Clone)]
pub struct SamplerHandle {
    sender: mpsc::Sender<SamplerCommand>,

    settings_rx: watch::Receiver<SamplerSettings>,
}

impl SamplerHandle {
    /// Spawn a new sampler actor in the stopped state.
    ///
    /// Fails when the configured settings are out of bounds.
    pub fn spawn(config: &Config, sources: SourceSet, bus: EventBus) -> SamplerResult<Self> {
        config.sampler.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (settings_tx, settings_rx) = watch::channel(config.sampler.clone());

        let actor = SamplerActor::new(config, sources, bus, settings_tx, cmd_rx);
        tokio::spawn(actor.run());

        Ok(Self {
            sender: cmd_tx,
            settings_rx,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SamplerCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| SamplerError::ActorUnavailable)
            .context("failed to send sampler command")?;
        rx.await
            .map_err(|_| SamplerError::ActorUnavailable)
            .context("failed to receive sampler response")
    }

    /// Begin sampling. No-op when already running.
    pub async fn start(&self) -> Result<()> {
        self.request(|respond_to| SamplerCommand::Start { respond_to })
            .await
    }

    /// Stop sampling. No-op when already stopped.
    pub async fn stop(&self) -> Result<()> {
        self.request(|respond_to| SamplerCommand::Stop { respond_to })
            .await
    }

    /// Merge `patch` into the current settings.
    ///
    /// Invalid settings are rejected with `SamplerError::InvalidSettings` and
    /// the previous settings stay in effect.
    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<SamplerSettings> {
        let settings = self
            .request(|respond_to| SamplerCommand::UpdateSettings { patch, respond_to })
            .await??;
        Ok(settings)
    }

    pub async fn get_settings(&self) -> Result<SamplerSettings> {
        self.request(|respond_to| SamplerCommand::GetSettings { respond_to })
            .await
    }

    /// Run one tick right now, whether or not sampling is running.
    pub async fn sample_now(&self) -> Result<TelemetryData> {
        self.request(|respond_to| SamplerCommand::SampleNow { respond_to })
            .await
    }

    pub async fn status(&self) -> Result<SamplerStats> {
        self.request(|respond_to| SamplerCommand::GetStats { respond_to })
            .await
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.status().await?.running)
    }

    /// Receiver that observes every accepted settings change.
    pub fn watch_settings(&self) -> watch::Receiver<SamplerSettings> {
        self.settings_rx.clone()
    }

    /// Stop the actor and wait until it has exited.
    ///
    /// A tick that is already running completes and publishes first, so
    /// subscribers shut down after this call still receive its samples.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|respond_to| SamplerCommand::Shutdown { respond_to })
            .await
    }
}
