//! LiveActor - keeps the windowed history and relays samples to live sinks
//!
//! The actor is the only writer of its [`LiveHistory`]. It follows the
//! sampler's settings through a watch channel and resizes the history when
//! `max_history_points` changes.
//!
//! Every sample is forwarded to each registered [`LiveSink`] under the
//! channel `hosts/{host_id}/telemetry/{kind}`. Each sink is fed by its own
//! queue and relay task, the same way the bus feeds handler subscribers:
//!
//! ```text
//! bus ──► LiveActor ──► history (updated first)
//!                  ├──► queue ──► relay task ──► sink A   (stalled: only A waits)
//!                  └──► queue ──► relay task ──► sink B   (errors: logged, B continues)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use super::bus::{EventBus, SubscriptionToken};
use super::messages::{BusEvent, LiveCommand, Topic};
use crate::config::SamplerSettings;
use crate::error::SamplerResult;
use crate::live::LiveHistory;
use crate::util::telemetry_channel;
use crate::{MetricKind, Sample};

/// Destination for live samples
#[async_trait]
pub trait LiveSink: Send + Sync + 'static {
    async fn send(&self, channel: &str, sample: &Sample) -> Result<()>;
}

#[derive(Serialize)]
struct LiveMessage<'a> {
    channel: &'a str,
    payload: &'a Sample,
}

/// Writes one JSON object per line: `{"channel": .., "payload": ..}`
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> LiveSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, channel: &str, sample: &Sample) -> Result<()> {
        let mut line = serde_json::to_vec(&LiveMessage {
            channel,
            payload: sample,
        })?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// How long shutdown waits for a sink to drain its queue
const SINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Queue and task relaying samples to one sink
struct SinkRelay {
    sender: mpsc::UnboundedSender<(String, Arc<Sample>)>,
    task: JoinHandle<()>,
}

impl SinkRelay {
    fn spawn(index: usize, sink: Box<dyn LiveSink>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(String, Arc<Sample>)>();

        let task = tokio::spawn(async move {
            while let Some((channel, sample)) = receiver.recv().await {
                if let Err(e) = sink.send(&channel, &sample).await {
                    warn!("live sink {index} failed on {channel}: {e:#}");
                }
            }
            trace!("live sink {index} drained");
        });

        Self { sender, task }
    }
}

pub struct LiveActor {
    host_id: String,

    history: LiveHistory,

    /// Handed to relay tasks when the actor starts
    sinks: Vec<Box<dyn LiveSink>>,

    relays: Vec<SinkRelay>,

    bus: EventBus,

    subscription: SubscriptionToken,

    event_rx: mpsc::UnboundedReceiver<BusEvent>,

    settings_rx: watch::Receiver<SamplerSettings>,

    command_rx: mpsc::Receiver<LiveCommand>,
}

impl LiveActor {
    pub fn new(
        host_id: String,
        bus: EventBus,
        settings_rx: watch::Receiver<SamplerSettings>,
        sinks: Vec<Box<dyn LiveSink>>,
        command_rx: mpsc::Receiver<LiveCommand>,
    ) -> SamplerResult<Self> {
        let history = LiveHistory::new(settings_rx.borrow().max_history_points)?;
        let (subscription, event_rx) = bus.subscribe_channel(Topic::all_kinds());

        Ok(Self {
            host_id,
            history,
            sinks,
            relays: Vec::new(),
            bus,
            subscription,
            event_rx,
            settings_rx,
            command_rx,
        })
    }

    #[instrument(skip(self), fields(host_id = %self.host_id))]
    pub async fn run(mut self) {
        debug!("starting live actor with {} sinks", self.sinks.len());

        self.relays = std::mem::take(&mut self.sinks)
            .into_iter()
            .enumerate()
            .map(|(index, sink)| SinkRelay::spawn(index, sink))
            .collect();

        let mut settings_open = true;
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(BusEvent::Sample(sample)) => self.handle_sample(sample),
                        Some(BusEvent::Composite(_)) => {}
                        None => {
                            warn!("event subscription closed, shutting down");
                            break;
                        }
                    }
                }

                changed = self.settings_rx.changed(), if settings_open => {
                    if changed.is_err() {
                        debug!("settings channel closed, keeping current history size");
                        settings_open = false;
                        continue;
                    }

                    let max_points = self.settings_rx.borrow_and_update().max_history_points;
                    self.resize(max_points);
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(LiveCommand::Shutdown { respond_to }) => {
                            debug!("live actor shutting down");
                            shutdown_ack = Some(respond_to);
                            break;
                        }
                        None => {
                            debug!("command channel closed, shutting down");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
            }
        }

        self.bus.unsubscribe(self.subscription);
        while let Ok(event) = self.event_rx.try_recv() {
            if let BusEvent::Sample(sample) = event {
                self.handle_sample(sample);
            }
        }

        self.drain_relays().await;
        debug!("live actor stopped");

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    /// Close every sink queue and wait, bounded, for the relays to finish.
    async fn drain_relays(&mut self) {
        for (index, relay) in std::mem::take(&mut self.relays).into_iter().enumerate() {
            let SinkRelay { sender, mut task } = relay;
            drop(sender);

            if tokio::time::timeout(SINK_DRAIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                warn!("live sink {index} did not drain in time, abandoning it");
                task.abort();
            }
        }
    }

    fn resize(&mut self, max_points: usize) {
        if max_points == self.history.max_points() {
            return;
        }

        match self.history.resize(max_points) {
            Ok(()) => debug!("resized live history to {} points", max_points),
            Err(e) => warn!("failed to resize live history: {}", e),
        }
    }

    fn handle_sample(&mut self, sample: Arc<Sample>) {
        let kind = sample.kind();
        trace!("live {} sample at {}", kind, sample.timestamp_ms());

        self.history.ingest(Sample::clone(&sample));

        if self.relays.is_empty() {
            return;
        }

        let channel = telemetry_channel(&self.host_id, kind);
        for (index, relay) in self.relays.iter().enumerate() {
            if relay
                .sender
                .send((channel.clone(), Arc::clone(&sample)))
                .is_err()
            {
                warn!("live sink {index} relay has stopped");
            }
        }
    }

    fn handle_command(&mut self, cmd: LiveCommand) {
        match cmd {
            LiveCommand::Snapshot {
                kind,
                count,
                respond_to,
            } => {
                let samples = match count {
                    Some(count) => self.history.recent(kind, count),
                    None => self.history.all(kind),
                };
                let _ = respond_to.send(samples);
            }

            LiveCommand::Latest { kind, respond_to } => {
                let _ = respond_to.send(self.history.latest(kind).cloned());
            }

            LiveCommand::Clear { kind, respond_to } => {
                self.history.clear(kind);
                let _ = respond_to.send(());
            }

            LiveCommand::Capacities { respond_to } => {
                let capacities = MetricKind::ALL
                    .into_iter()
                    .map(|kind| (kind, self.history.len(kind), self.history.capacity(kind)))
                    .collect();
                let _ = respond_to.send(capacities);
            }

            LiveCommand::Shutdown { .. } => {}
        }
    }
}

/// Handle for reading the live view
#[derive(Clone)]
pub struct LiveHandle {
    sender: mpsc::Sender<LiveCommand>,
}

impl LiveHandle {
    /// Spawn a live actor sized from the current value of `settings_rx`.
    pub fn spawn(
        host_id: impl Into<String>,
        bus: &EventBus,
        settings_rx: watch::Receiver<SamplerSettings>,
        sinks: Vec<Box<dyn LiveSink>>,
    ) -> SamplerResult<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = LiveActor::new(host_id.into(), bus.clone(), settings_rx, sinks, cmd_rx)?;
        tokio::spawn(actor.run());

        Ok(Self { sender: cmd_tx })
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> LiveCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .context("failed to send live command")?;
        rx.await.context("failed to receive live response")
    }

    /// The last `count` samples of `kind`, oldest first. `None` returns the
    /// whole window.
    pub async fn snapshot(&self, kind: MetricKind, count: Option<i64>) -> Result<Vec<Sample>> {
        self.request(|respond_to| LiveCommand::Snapshot {
            kind,
            count,
            respond_to,
        })
        .await
    }

    pub async fn latest(&self, kind: MetricKind) -> Result<Option<Sample>> {
        self.request(|respond_to| LiveCommand::Latest { kind, respond_to })
            .await
    }

    pub async fn clear(&self, kind: Option<MetricKind>) -> Result<()> {
        self.request(|respond_to| LiveCommand::Clear { kind, respond_to })
            .await
    }

    /// `(len, capacity)` for every kind
    pub async fn capacities(&self) -> Result<Vec<(MetricKind, usize, usize)>> {
        self.request(|respond_to| LiveCommand::Capacities { respond_to })
            .await
    }

    /// Stop the actor once every sink has drained its queue.
    ///
    /// A sink that is still stuck after a second is abandoned.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|respond_to| LiveCommand::Shutdown { respond_to })
            .await
    }
}
