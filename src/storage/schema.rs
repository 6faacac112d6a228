//! Persisted row definitions
//!
//! ## Layout
//!
//! One table per metric kind. Single-row kinds (cpu, memory) map one sample
//! to one row; multi-row kinds fan a sample out into one row per element:
//!
//! | kind      | rows per sample           | table             |
//! |-----------|---------------------------|-------------------|
//! | cpu       | 1                         | `cpu_metrics`     |
//! | memory    | 1                         | `memory_metrics`  |
//! | disk      | one per device            | `disk_metrics`    |
//! | network   | one per interface         | `network_metrics` |
//! | processes | one per listed process    | `process_metrics` |
//!
//! All rows produced from one sample share its `timestamp_ms`, and a backend
//! must make them visible together or not at all.
//!
//! Process totals (`total_count`, `running_count`, ...) are not persisted;
//! only the listed top processes are.

use serde::{Deserialize, Serialize};

use crate::{MetricKind, Sample};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuRow {
    pub host_id: String,
    pub timestamp_ms: i64,
    pub usage_pct: f64,
    pub core_count: u64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub temperature_c: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRow {
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRow {
    pub host_id: String,
    pub timestamp_ms: i64,
    pub device_name: String,
    pub mount_path: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub used_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRow {
    pub host_id: String,
    pub timestamp_ms: i64,
    pub interface_name: String,
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
pub struct ProcessRow {
    pub host_id: String,
    pub timestamp_ms: i64,
    pub pid: u32,
    pub name: String,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub parent_pid: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub status: Option<String>,
}

/// A single persisted row of any kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricRow {
    Cpu(CpuRow),
    Memory(MemoryRow),
    Disk(DiskRow),
    Network(NetworkRow),
    Processes(ProcessRow),
}

impl MetricRow {
    /// Flatten a sample into the rows that persist it.
    pub fn from_sample(sample: &Sample) -> Vec<MetricRow> {
        match sample {
            Sample::Cpu(cpu) => vec![MetricRow::Cpu(CpuRow {
                host_id: cpu.host_id.clone(),
                timestamp_ms: cpu.timestamp_ms,
                usage_pct: cpu.usage_pct,
                core_count: cpu.core_count as u64,
                load_avg_1: cpu.load_avg[0],
                load_avg_5: cpu.load_avg[1],
                load_avg_15: cpu.load_avg[2],
                temperature_c: cpu.temperature_c,
            })],

            Sample::Memory(memory) => vec![MetricRow::Memory(MemoryRow {
                host_id: memory.host_id.clone(),
                timestamp_ms: memory.timestamp_ms,
                total_bytes: memory.total_bytes,
                used_bytes: memory.used_bytes,
                free_bytes: memory.free_bytes,
                available_bytes: memory.available_bytes,
                swap_total: memory.swap_total,
                swap_used: memory.swap_used,
                swap_free: memory.swap_free,
            })],

            Sample::Disk(disk) => disk
                .devices
                .iter()
                .map(|device| {
                    MetricRow::Disk(DiskRow {
                        host_id: disk.host_id.clone(),
                        timestamp_ms: disk.timestamp_ms,
                        device_name: device.name.clone(),
                        mount_path: device.mount_path.clone(),
                        total_bytes: device.total_bytes,
                        used_bytes: device.used_bytes,
                        free_bytes: device.free_bytes,
                        used_pct: device.used_pct,
                    })
                })
                .collect(),

            Sample::Network(network) => network
                .interfaces
                .iter()
                .map(|iface| {
                    MetricRow::Network(NetworkRow {
                        host_id: network.host_id.clone(),
                        timestamp_ms: network.timestamp_ms,
                        interface_name: iface.name.clone(),
                        bytes_rx: iface.bytes_rx,
                        bytes_tx: iface.bytes_tx,
                        packets_rx: iface.packets_rx,
                        packets_tx: iface.packets_tx,
                        err_in: iface.err_in,
                        err_out: iface.err_out,
                        drop_in: iface.drop_in,
                        drop_out: iface.drop_out,
                    })
                })
                .collect(),

            Sample::Processes(procs) => procs
                .processes
                .iter()
                .map(|proc| {
                    MetricRow::Processes(ProcessRow {
                        host_id: procs.host_id.clone(),
                        timestamp_ms: procs.timestamp_ms,
                        pid: proc.pid,
                        name: proc.name.clone(),
                        cpu_pct: proc.cpu_pct,
                        mem_pct: proc.mem_pct,
                        parent_pid: proc.parent_pid,
                        uid: proc.uid,
                        gid: proc.gid,
                        status: proc.status.clone(),
                    })
                })
                .collect(),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricRow::Cpu(_) => MetricKind::Cpu,
            MetricRow::Memory(_) => MetricKind::Memory,
            MetricRow::Disk(_) => MetricKind::Disk,
            MetricRow::Network(_) => MetricKind::Network,
            MetricRow::Processes(_) => MetricKind::Processes,
        }
    }

    pub fn host_id(&self) -> &str {
        match self {
            MetricRow::Cpu(r) => &r.host_id,
            MetricRow::Memory(r) => &r.host_id,
            MetricRow::Disk(r) => &r.host_id,
            MetricRow::Network(r) => &r.host_id,
            MetricRow::Processes(r) => &r.host_id,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            MetricRow::Cpu(r) => r.timestamp_ms,
            MetricRow::Memory(r) => r.timestamp_ms,
            MetricRow::Disk(r) => r.timestamp_ms,
            MetricRow::Network(r) => r.timestamp_ms,
            MetricRow::Processes(r) => r.timestamp_ms,
        }
    }
}

/// Table holding rows of `kind`.
pub fn table_name(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Cpu => "cpu_metrics",
        MetricKind::Memory => "memory_metrics",
        MetricKind::Disk => "disk_metrics",
        MetricKind::Network => "network_metrics",
        MetricKind::Processes => "process_metrics",
    }
}
