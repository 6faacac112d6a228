pub mod actors;
pub mod config;
pub mod error;
pub mod live;
pub mod ring_buffer;
pub mod sources;
pub mod storage;
pub mod util;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::util::clamp_pct;

/// One class of host metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    Network,
    Processes,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::Disk,
        MetricKind::Network,
        MetricKind::Processes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Disk => "disk",
            MetricKind::Network => "network",
            MetricKind::Processes => "processes",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(MetricKind::Cpu),
            "memory" => Ok(MetricKind::Memory),
            "disk" => Ok(MetricKind::Disk),
            "network" => Ok(MetricKind::Network),
            "processes" | "process" => Ok(MetricKind::Processes),
            other => Err(format!("unknown metric kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSample {
    pub host_id: String,
    pub timestamp_ms: i64,
    /// Overall utilization across all cores (percentage 0-100)
    pub usage_pct: f64,
    pub core_count: usize,
    /// 1, 5 and 15 minute load averages
    pub load_avg: [f64; 3],
    pub temperature_c: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub host_id: String,
    pub timestamp_ms: i64,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
    pub swap_total: Option<u64>,
    pub swap_used: Option<u64>,
    pub swap_free: Option<u64>,
}

impl MemorySample {
    /// Fraction of total memory in use, `0.0` when the total is unknown.
    pub fn usage_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskDevice {
    pub name: String,
    pub mount_path: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub used_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSample {
    pub host_id: String,
    pub timestamp_ms: i64,
    pub devices: Vec<DiskDevice>,
}

/// Cumulative counters of one network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIface {
    pub name: String,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub err_in: u64,
    pub err_out: u64,
    pub drop_in: u64,
    pub drop_out: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSample {
    pub host_id: String,
    pub timestamp_ms: i64,
    pub interfaces: Vec<NetIface>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub parent_pid: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub host_id: String,
    pub timestamp_ms: i64,
    pub processes: Vec<ProcInfo>,
    pub total_count: u64,
    pub running_count: u64,
    pub sleeping_count: u64,
}

/// A single reading of one metric kind.
///
/// This is the payload crossing every boundary of the pipeline: the event bus,
/// the persistence writer and the live sinks all consume `Sample`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Sample {
    Cpu(CpuSample),
    Memory(MemorySample),
    Disk(DiskSample),
    Network(NetworkSample),
    Processes(ProcessSample),
}

impl Sample {
    pub fn kind(&self) -> MetricKind {
        match self {
            Sample::Cpu(_) => MetricKind::Cpu,
            Sample::Memory(_) => MetricKind::Memory,
            Sample::Disk(_) => MetricKind::Disk,
            Sample::Network(_) => MetricKind::Network,
            Sample::Processes(_) => MetricKind::Processes,
        }
    }

    pub fn host_id(&self) -> &str {
        match self {
            Sample::Cpu(s) => &s.host_id,
            Sample::Memory(s) => &s.host_id,
            Sample::Disk(s) => &s.host_id,
            Sample::Network(s) => &s.host_id,
            Sample::Processes(s) => &s.host_id,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            Sample::Cpu(s) => s.timestamp_ms,
            Sample::Memory(s) => s.timestamp_ms,
            Sample::Disk(s) => s.timestamp_ms,
            Sample::Network(s) => s.timestamp_ms,
            Sample::Processes(s) => s.timestamp_ms,
        }
    }

    /// Clamp every percentage field into `[0, 100]` and every load average to
    /// be non-negative. Applied once before a sample leaves the sampler.
    pub fn normalized(mut self) -> Self {
        match &mut self {
            Sample::Cpu(cpu) => {
                cpu.usage_pct = clamp_pct(cpu.usage_pct);
                for load in cpu.load_avg.iter_mut() {
                    if !load.is_finite() || *load < 0.0 {
                        *load = 0.0;
                    }
                }
            }
            Sample::Memory(_) | Sample::Network(_) => {}
            Sample::Disk(disk) => {
                for device in disk.devices.iter_mut() {
                    device.used_pct = clamp_pct(device.used_pct);
                }
            }
            Sample::Processes(procs) => {
                for proc in procs.processes.iter_mut() {
                    proc.cpu_pct = if proc.cpu_pct.is_finite() {
                        proc.cpu_pct.max(0.0)
                    } else {
                        0.0
                    };
                    proc.mem_pct = clamp_pct(proc.mem_pct);
                }
            }
        }
        self
    }
}

impl From<CpuSample> for Sample {
    fn from(value: CpuSample) -> Self {
        Sample::Cpu(value)
    }
}

impl From<MemorySample> for Sample {
    fn from(value: MemorySample) -> Self {
        Sample::Memory(value)
    }
}

impl From<DiskSample> for Sample {
    fn from(value: DiskSample) -> Self {
        Sample::Disk(value)
    }
}

impl From<NetworkSample> for Sample {
    fn from(value: NetworkSample) -> Self {
        Sample::Network(value)
    }
}

impl From<ProcessSample> for Sample {
    fn from(value: ProcessSample) -> Self {
        Sample::Processes(value)
    }
}

/// Everything collected during one scheduler tick.
///
/// Kinds that are disabled, or whose source failed this tick, are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryData {
    pub timestamp_ms: i64,
    pub cpu: Option<CpuSample>,
    pub memory: Option<MemorySample>,
    pub disk: Option<DiskSample>,
    pub network: Option<NetworkSample>,
    pub processes: Option<ProcessSample>,
}

impl TelemetryData {
    pub fn new(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            ..Default::default()
        }
    }

    /// Insert a sample into its slot, replacing any previous one of that kind.
    pub fn insert(&mut self, sample: Sample) {
        match sample {
            Sample::Cpu(s) => self.cpu = Some(s),
            Sample::Memory(s) => self.memory = Some(s),
            Sample::Disk(s) => self.disk = Some(s),
            Sample::Network(s) => self.network = Some(s),
            Sample::Processes(s) => self.processes = Some(s),
        }
    }

    /// The populated samples, in [`MetricKind::ALL`] order.
    pub fn populated(&self) -> Vec<Sample> {
        let mut samples = Vec::with_capacity(5);
        if let Some(cpu) = &self.cpu {
            samples.push(Sample::Cpu(cpu.clone()));
        }
        if let Some(memory) = &self.memory {
            samples.push(Sample::Memory(memory.clone()));
        }
        if let Some(disk) = &self.disk {
            samples.push(Sample::Disk(disk.clone()));
        }
        if let Some(network) = &self.network {
            samples.push(Sample::Network(network.clone()));
        }
        if let Some(processes) = &self.processes {
            samples.push(Sample::Processes(processes.clone()));
        }
        samples
    }

    pub fn kinds(&self) -> Vec<MetricKind> {
        self.populated().iter().map(Sample::kind).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_none()
            && self.memory.is_none()
            && self.disk.is_none()
            && self.network.is_none()
            && self.processes.is_none()
    }
}
