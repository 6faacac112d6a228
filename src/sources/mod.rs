//! Metric sources
//!
//! A [`MetricSource`] produces one typed sample per call. The sampler only
//! talks to sources through this trait, so platform adapters can be swapped
//! and tests can inject mocks.
//!
//! ## Adapters
//!
//! - [`cpu::SystemCpuSource`]: cumulative tick counters turned into a usage
//!   percentage between consecutive calls
//! - [`system`]: memory, disk, network and process adapters built on `sysinfo`
//!
//! Every call made by the sampler goes through [`sample_bounded`], which maps
//! both errors and timeouts to [`SamplerError::SourceUnavailable`].

pub mod cpu;
pub mod system;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::error::SamplerError;
use crate::{CpuSample, DiskSample, MemorySample, MetricKind, NetworkSample, ProcessSample, Sample};

/// Per-call information handed to every source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleContext {
    pub host_id: String,

    /// Timestamp shared by every sample of one tick
    pub timestamp_ms: i64,
}

impl SampleContext {
    pub fn new(host_id: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            host_id: host_id.into(),
            timestamp_ms,
        }
    }
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    type Output: Into<Sample> + Send;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<Self::Output>;
}

pub type CpuSource = Arc<dyn MetricSource<Output = CpuSample>>;
pub type MemorySource = Arc<dyn MetricSource<Output = MemorySample>>;
pub type DiskSource = Arc<dyn MetricSource<Output = DiskSample>>;
pub type NetworkSource = Arc<dyn MetricSource<Output = NetworkSample>>;
pub type ProcessSource = Arc<dyn MetricSource<Output = ProcessSample>>;

/// One optional source per metric kind.
///
/// A kind without a source behaves like a source that always fails.
#[derive(Clone, Default)]
pub struct SourceSet {
    pub cpu: Option<CpuSource>,
    pub memory: Option<MemorySource>,
    pub disk: Option<DiskSource>,
    pub network: Option<NetworkSource>,
    pub processes: Option<ProcessSource>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sources backed by the local operating system.
    pub fn system() -> Self {
        Self {
            cpu: Some(Arc::new(cpu::SystemCpuSource::new())),
            memory: Some(Arc::new(system::SystemMemorySource::new())),
            disk: Some(Arc::new(system::SystemDiskSource::new())),
            network: Some(Arc::new(system::SystemNetworkSource::new())),
            processes: Some(Arc::new(system::SystemProcessSource::new())),
        }
    }

    pub fn with_cpu(mut self, source: impl MetricSource<Output = CpuSample> + 'static) -> Self {
        self.cpu = Some(Arc::new(source));
        self
    }

    pub fn with_memory(
        mut self,
        source: impl MetricSource<Output = MemorySample> + 'static,
    ) -> Self {
        self.memory = Some(Arc::new(source));
        self
    }

    pub fn with_disk(mut self, source: impl MetricSource<Output = DiskSample> + 'static) -> Self {
        self.disk = Some(Arc::new(source));
        self
    }

    pub fn with_network(
        mut self,
        source: impl MetricSource<Output = NetworkSample> + 'static,
    ) -> Self {
        self.network = Some(Arc::new(source));
        self
    }

    pub fn with_processes(
        mut self,
        source: impl MetricSource<Output = ProcessSample> + 'static,
    ) -> Self {
        self.processes = Some(Arc::new(source));
        self
    }

    /// Sample one kind, bounded by `timeout`.
    pub async fn sample(
        &self,
        kind: MetricKind,
        ctx: &SampleContext,
        timeout: Duration,
    ) -> Result<Sample, SamplerError> {
        match kind {
            MetricKind::Cpu => sample_bounded(kind, self.cpu.as_deref(), ctx, timeout).await,
            MetricKind::Memory => sample_bounded(kind, self.memory.as_deref(), ctx, timeout).await,
            MetricKind::Disk => sample_bounded(kind, self.disk.as_deref(), ctx, timeout).await,
            MetricKind::Network => {
                sample_bounded(kind, self.network.as_deref(), ctx, timeout).await
            }
            MetricKind::Processes => {
                sample_bounded(kind, self.processes.as_deref(), ctx, timeout).await
            }
        }
    }
}

/// Call `source` once, treating a missing source, an error, or a call that
/// outlives `timeout` as unavailable.
pub async fn sample_bounded<S>(
    kind: MetricKind,
    source: Option<&S>,
    ctx: &SampleContext,
    timeout: Duration,
) -> Result<Sample, SamplerError>
where
    S: MetricSource + ?Sized,
{
    let Some(source) = source else {
        return Err(SamplerError::SourceUnavailable {
            kind,
            reason: "no source configured".to_string(),
        });
    };

    match tokio::time::timeout(timeout, source.sample(ctx)).await {
        Ok(Ok(output)) => {
            trace!("{kind} source returned a sample");
            Ok(output.into().normalized())
        }
        Ok(Err(e)) => Err(SamplerError::SourceUnavailable {
            kind,
            reason: format!("{e:#}"),
        }),
        Err(_) => Err(SamplerError::SourceUnavailable {
            kind,
            reason: format!("timed out after {}ms", timeout.as_millis()),
        }),
    }
}
