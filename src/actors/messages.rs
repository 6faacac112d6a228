//! Message types for actor communication
//!
//! 1. **Commands**: request/response messages sent to one actor via mpsc
//! 2. **Events**: notifications fanned out by the [`EventBus`](super::bus::EventBus)
//!
//! Events wrap their payload in an `Arc` so fan-out to many subscribers never
//! deep-copies a sample.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::config::{SamplerSettings, SettingsPatch};
use crate::error::SamplerResult;
use crate::storage::backend::{ExportFormat, PruneReport, QueryFilter};
use crate::storage::error::StorageResult;
use crate::storage::schema::MetricRow;
use crate::{MetricKind, Sample, TelemetryData};

/// What a bus subscriber listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// One event per tick carrying every kind sampled in that tick
    Composite,

    /// One event per sample of the given kind
    Kind(MetricKind),
}

impl Topic {
    /// Every per-kind topic.
    pub fn all_kinds() -> Vec<Topic> {
        MetricKind::ALL.into_iter().map(Topic::Kind).collect()
    }
}

/// Event delivered by the bus
#[derive(Debug, Clone)]
pub enum BusEvent {
    Composite(Arc<TelemetryData>),
    Sample(Arc<Sample>),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::Composite(_) => Topic::Composite,
            BusEvent::Sample(sample) => Topic::Kind(sample.kind()),
        }
    }

    pub fn as_sample(&self) -> Option<&Sample> {
        match self {
            BusEvent::Sample(sample) => Some(sample),
            BusEvent::Composite(_) => None,
        }
    }

    pub fn as_composite(&self) -> Option<&TelemetryData> {
        match self {
            BusEvent::Composite(data) => Some(data),
            BusEvent::Sample(_) => None,
        }
    }
}

/// Commands that can be sent to the SamplerActor
#[derive(Debug)]
pub enum SamplerCommand {
    /// Begin periodic sampling (no-op when already running)
    Start { respond_to: oneshot::Sender<()> },

    /// Cancel periodic sampling (no-op when stopped)
    Stop { respond_to: oneshot::Sender<()> },

    /// Merge and validate new settings, restarting when running
    UpdateSettings {
        patch: SettingsPatch,
        respond_to: oneshot::Sender<SamplerResult<SamplerSettings>>,
    },

    /// Copy of the current settings
    GetSettings {
        respond_to: oneshot::Sender<SamplerSettings>,
    },

    /// Run one tick immediately, outside the periodic schedule
    SampleNow {
        respond_to: oneshot::Sender<TelemetryData>,
    },

    GetStats {
        respond_to: oneshot::Sender<SamplerStats>,
    },

    /// Finish any in-flight tick, stop sampling and exit the actor loop
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Sampler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub running: bool,

    /// Ticks completed since the actor was spawned
    pub ticks: u64,

    /// Start-time disk samples taken
    pub disk_snapshots: u64,

    /// Source calls that failed or timed out
    pub source_failures: u64,
}

/// Commands that can be sent to the StorageActor
#[derive(Debug)]
pub enum StorageCommand {
    /// Write the pending batch to the backend
    Flush {
        respond_to: oneshot::Sender<StorageResult<()>>,
    },

    Query {
        filter: QueryFilter,
        respond_to: oneshot::Sender<StorageResult<Vec<MetricRow>>>,
    },

    Export {
        format: ExportFormat,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        respond_to: oneshot::Sender<StorageResult<String>>,
    },

    /// Delete rows older than the retention window
    Prune {
        retention_days: u32,
        respond_to: oneshot::Sender<StorageResult<PruneReport>>,
    },

    GetStats {
        respond_to: oneshot::Sender<StorageStats>,
    },

    HealthCheck {
        respond_to: oneshot::Sender<StorageResult<String>>,
    },

    /// Flush, close the backend and exit
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Samples accepted from the bus
    pub samples_received: u64,

    /// Samples durably written
    pub samples_written: u64,

    /// Samples dropped because a flush failed
    pub write_failures: u64,

    /// Number of samples waiting in the write buffer
    pub buffer_size: usize,

    /// Number of flush operations performed
    pub flush_count: u64,

    pub last_cleanup_time: Option<chrono::DateTime<chrono::Utc>>,

    pub total_rows_pruned: u64,
}

/// Commands that can be sent to the LiveActor
#[derive(Debug)]
pub enum LiveCommand {
    /// The last `count` samples of a kind, oldest first (`None` = all)
    Snapshot {
        kind: MetricKind,
        count: Option<i64>,
        respond_to: oneshot::Sender<Vec<Sample>>,
    },

    Latest {
        kind: MetricKind,
        respond_to: oneshot::Sender<Option<Sample>>,
    },

    /// Empty one kind's history, or every kind when `None`
    Clear {
        kind: Option<MetricKind>,
        respond_to: oneshot::Sender<()>,
    },

    /// Current `(len, capacity)` per kind
    Capacities {
        respond_to: oneshot::Sender<Vec<(MetricKind, usize, usize)>>,
    },

    /// Let every sink drain its queue, then exit
    Shutdown { respond_to: oneshot::Sender<()> },
}
