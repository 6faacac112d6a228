//! StorageActor - persists samples published on the bus
//!
//! ## Batching Strategy
//!
//! Samples are buffered and written in one transaction per batch:
//! - **Size trigger**: Flush after 100 samples (configurable)
//! - **Time trigger**: Flush every 5 seconds (configurable)
//!
//! Reads (`query`, `export`, `prune`) flush first, so they observe every
//! sample the actor has received.
//!
//! ## Failure Handling
//!
//! A failed batch is retried sample by sample, so one bad sample only loses
//! itself. Write failures are logged and counted; they never reach the
//! sampler, which keeps running regardless.
//!
//! ## Retention
//!
//! With a retention window configured, rows older than the window are
//! pruned on startup and then on every cleanup interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use super::bus::{EventBus, SubscriptionToken};
use super::messages::{BusEvent, StorageCommand, StorageStats, Topic};
use crate::Sample;
use crate::config::StorageConfig;
use crate::storage::backend::{ExportFormat, PruneReport, QueryFilter, TelemetryStore};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::schema::MetricRow;

/// Batch size trigger - flush after this many samples
const BATCH_SIZE_TRIGGER: usize = 100;

/// Batch time trigger - flush after this duration
const BATCH_TIME_TRIGGER: Duration = Duration::from_secs(5);

/// Persistence writer options
#[derive(Debug, Clone)]
pub struct PersistenceOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,

    /// Rows older than this many days are pruned (`None` keeps everything)
    pub retention_days: Option<u32>,

    pub cleanup_interval: Duration,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE_TRIGGER,
            flush_interval: BATCH_TIME_TRIGGER,
            retention_days: None,
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl PersistenceOptions {
    pub fn from_config(config: &StorageConfig) -> Self {
        match config {
            StorageConfig::None => Self::default(),
            StorageConfig::Sqlite {
                retention_days,
                cleanup_interval_hours,
                ..
            } => Self {
                retention_days: Some(*retention_days),
                cleanup_interval: Duration::from_secs(u64::from(*cleanup_interval_hours).max(1) * 3600),
                ..Self::default()
            },
        }
    }
}

/// Actor that owns the storage backend and the write buffer
pub struct StorageActor {
    backend: Arc<dyn TelemetryStore>,

    options: PersistenceOptions,

    /// Samples waiting to be flushed
    batch_buffer: Vec<Sample>,

    bus: EventBus,

    subscription: SubscriptionToken,

    event_rx: mpsc::UnboundedReceiver<BusEvent>,

    command_rx: mpsc::Receiver<StorageCommand>,

    stats: StorageStats,
}

impl StorageActor {
    pub fn new(
        backend: Arc<dyn TelemetryStore>,
        options: PersistenceOptions,
        bus: EventBus,
        command_rx: mpsc::Receiver<StorageCommand>,
    ) -> Self {
        let (subscription, event_rx) = bus.subscribe_channel(Topic::all_kinds());

        if let Some(days) = options.retention_days {
            debug!(
                "retention cleanup enabled: {} days, every {:?}",
                days, options.cleanup_interval
            );
        }

        Self {
            backend,
            batch_buffer: Vec::with_capacity(options.batch_size),
            options,
            bus,
            subscription,
            event_rx,
            command_rx,
            stats: StorageStats::default(),
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting storage actor");

        let has_retention = self.options.retention_days.is_some();

        let mut flush_interval = time::interval(self.options.flush_interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // the first tick completes immediately, which runs the startup cleanup
        let mut cleanup_interval = time::interval(self.options.cleanup_interval);
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(BusEvent::Sample(sample)) => {
                            self.store_sample(Sample::clone(&sample)).await;
                        }
                        Some(BusEvent::Composite(_)) => {}
                        None => {
                            warn!("event subscription closed, shutting down");
                            break;
                        }
                    }
                }

                _ = flush_interval.tick() => {
                    if !self.batch_buffer.is_empty() {
                        trace!("time-based flush triggered ({} samples)", self.batch_buffer.len());
                        let _ = self.flush_batch().await;
                    }
                }

                _ = cleanup_interval.tick(), if has_retention => {
                    debug!("retention cleanup triggered");
                    self.run_cleanup().await;
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(StorageCommand::Shutdown { respond_to }) => {
                            debug!("received shutdown command");
                            shutdown_ack = Some(respond_to);
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            debug!("command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.bus.unsubscribe(self.subscription);

        // pick up anything published before the unsubscribe
        self.take_queued_events();

        if !self.batch_buffer.is_empty() {
            debug!(
                "final flush before shutdown ({} samples)",
                self.batch_buffer.len()
            );
            let _ = self.flush_batch().await;
        }

        debug!("closing backend");
        if let Err(e) = self.backend.close().await {
            error!("error closing backend: {}", e);
        }

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }

        debug!("storage actor stopped");
    }

    /// Move samples already queued on the subscription into the buffer,
    /// without size-triggered flushes.
    fn take_queued_events(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            if let BusEvent::Sample(sample) = event {
                self.batch_buffer.push(Sample::clone(&sample));
                self.stats.samples_received += 1;
            }
        }
    }

    async fn store_sample(&mut self, sample: Sample) {
        trace!("buffering {} sample at {}", sample.kind(), sample.timestamp_ms());

        self.batch_buffer.push(sample);
        self.stats.samples_received += 1;

        if self.batch_buffer.len() >= self.options.batch_size {
            trace!(
                "size-based flush triggered ({} samples)",
                self.batch_buffer.len()
            );
            let _ = self.flush_batch().await;
        }
    }

    /// Write the buffer to the backend.
    ///
    /// When the batch transaction fails, each sample is retried on its own.
    async fn flush_batch(&mut self) -> StorageResult<()> {
        if self.batch_buffer.is_empty() {
            return Ok(());
        }

        let batch: Vec<Sample> = self.batch_buffer.drain(..).collect();
        debug!("flushing {} samples to backend", batch.len());

        self.stats.flush_count += 1;

        match self.backend.append_batch(&batch).await {
            Ok(()) => {
                self.stats.samples_written += batch.len() as u64;
                trace!(
                    "flush #{} complete ({} samples)",
                    self.stats.flush_count,
                    batch.len()
                );
                Ok(())
            }
            Err(e) => {
                warn!("batch write failed, retrying samples individually: {}", e);

                let mut failed = 0;
                for sample in &batch {
                    match self.backend.append(sample).await {
                        Ok(()) => self.stats.samples_written += 1,
                        Err(e) => {
                            failed += 1;
                            error!(
                                "dropping {} sample at {}: {}",
                                sample.kind(),
                                sample.timestamp_ms(),
                                e
                            );
                        }
                    }
                }

                self.stats.write_failures += failed;
                if failed == 0 {
                    Ok(())
                } else {
                    Err(StorageError::WriteFailed(format!(
                        "{failed} of {} samples could not be written",
                        batch.len()
                    )))
                }
            }
        }
    }

    /// Delete rows older than the retention window
    async fn run_cleanup(&mut self) {
        let Some(retention_days) = self.options.retention_days else {
            return;
        };

        debug!("running retention cleanup ({} days)", retention_days);

        match self.prune(retention_days).await {
            Ok(report) if report.total() > 0 => {
                info!("retention cleanup complete: deleted {} old rows", report.total());
            }
            Ok(_) => trace!("retention cleanup: no old rows to delete"),
            Err(e) => {
                // retried on the next interval
                error!("failed to prune old telemetry: {}", e);
            }
        }
    }

    async fn prune(&mut self, retention_days: u32) -> StorageResult<PruneReport> {
        let report = self.backend.prune_retention(retention_days).await?;

        self.stats.last_cleanup_time = Some(chrono::Utc::now());
        self.stats.total_rows_pruned += report.total();
        Ok(report)
    }

    /// Flush before a read so it sees every sample published before the
    /// command. A failed flush has already been logged and counted; the read
    /// proceeds regardless.
    async fn flush_before_read(&mut self) {
        self.take_queued_events();
        if let Err(e) = self.flush_batch().await {
            debug!("reading after a partially failed flush: {}", e);
        }
    }

    async fn handle_command(&mut self, cmd: StorageCommand) {
        match cmd {
            StorageCommand::Flush { respond_to } => {
                debug!("manual flush requested");
                self.take_queued_events();
                let result = self.flush_batch().await;
                let _ = respond_to.send(result);
            }

            StorageCommand::Query { filter, respond_to } => {
                self.flush_before_read().await;
                let result = self.backend.query(&filter).await;
                let _ = respond_to.send(result);
            }

            StorageCommand::Export {
                format,
                start_ms,
                end_ms,
                respond_to,
            } => {
                self.flush_before_read().await;
                let result = self.backend.export(format, start_ms, end_ms).await;
                let _ = respond_to.send(result);
            }

            StorageCommand::Prune {
                retention_days,
                respond_to,
            } => {
                self.flush_before_read().await;
                let result = self.prune(retention_days).await;
                let _ = respond_to.send(result);
            }

            StorageCommand::GetStats { respond_to } => {
                let mut stats = self.stats.clone();
                stats.buffer_size = self.batch_buffer.len();
                let _ = respond_to.send(stats);
            }

            StorageCommand::HealthCheck { respond_to } => {
                let result = self.backend.health_check().await.map(|h| h.message);
                let _ = respond_to.send(result);
            }

            StorageCommand::Shutdown { respond_to } => {
                // handled by the run loop
                let _ = respond_to.send(());
            }
        }
    }
}

/// Handle for controlling the StorageActor
#[derive(Clone)]
pub struct StorageHandle {
    sender: mpsc::Sender<StorageCommand>,
}

impl StorageHandle {
    /// Spawn a storage actor writing every per-kind bus event to `backend`.
    pub fn spawn(
        backend: Arc<dyn TelemetryStore>,
        options: PersistenceOptions,
        bus: &EventBus,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = StorageActor::new(backend, options, bus.clone(), cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> StorageCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .context("failed to send storage command")?;
        rx.await.context("failed to receive storage response")
    }

    /// Manually flush the write buffer
    pub async fn flush(&self) -> Result<()> {
        self.request(|respond_to| StorageCommand::Flush { respond_to })
            .await??;
        Ok(())
    }

    pub async fn query(&self, filter: QueryFilter) -> Result<Vec<MetricRow>> {
        let rows = self
            .request(|respond_to| StorageCommand::Query { filter, respond_to })
            .await??;
        Ok(rows)
    }

    pub async fn export(
        &self,
        format: ExportFormat,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<String> {
        let output = self
            .request(|respond_to| StorageCommand::Export {
                format,
                start_ms,
                end_ms,
                respond_to,
            })
            .await??;
        Ok(output)
    }

    /// Delete rows older than `retention_days` days
    pub async fn prune(&self, retention_days: u32) -> Result<PruneReport> {
        let report = self
            .request(|respond_to| StorageCommand::Prune {
                retention_days,
                respond_to,
            })
            .await??;
        Ok(report)
    }

    /// Get storage statistics
    pub async fn get_stats(&self) -> Result<StorageStats> {
        self.request(|respond_to| StorageCommand::GetStats { respond_to })
            .await
    }

    /// Check backend health
    pub async fn health_check(&self) -> Result<String> {
        let message = self
            .request(|respond_to| StorageCommand::HealthCheck { respond_to })
            .await??;
        Ok(message)
    }

    /// Flush, close the backend and stop the actor.
    ///
    /// Returns once the final flush has completed.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|respond_to| StorageCommand::Shutdown { respond_to })
            .await
    }
}
