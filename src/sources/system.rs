//! `sysinfo`-backed adapters for memory, disk, network and processes
//!
//! `sysinfo` refreshes are blocking, so every refresh runs on the blocking
//! thread pool. Each adapter owns its own `sysinfo` state; nothing is shared
//! between kinds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use sysinfo::{
    Disks, Networks, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System,
    UpdateKind,
};
use tracing::trace;

use super::{MetricSource, SampleContext};
use crate::{
    DiskDevice, DiskSample, MemorySample, NetIface, NetworkSample, ProcInfo, ProcessSample,
};

/// Number of processes reported per sample, highest CPU first
pub const TOP_PROCESSES: usize = 20;

async fn blocking<T, F>(what: &'static str, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .with_context(|| format!("{what} task failed"))?
}

fn poisoned(what: &str) -> anyhow::Error {
    anyhow::anyhow!("{what} lock poisoned")
}

pub struct SystemMemorySource {
    system: Arc<Mutex<System>>,
}

impl SystemMemorySource {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for SystemMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricSource for SystemMemorySource {
    type Output = MemorySample;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<MemorySample> {
        let system = Arc::clone(&self.system);
        let ctx = ctx.clone();

        blocking("memory", move || {
            let mut system = system.lock().map_err(|_| poisoned("memory"))?;
            system.refresh_memory();

            Ok(MemorySample {
                host_id: ctx.host_id,
                timestamp_ms: ctx.timestamp_ms,
                total_bytes: system.total_memory(),
                used_bytes: system.used_memory(),
                free_bytes: system.free_memory(),
                available_bytes: system.available_memory(),
                swap_total: Some(system.total_swap()),
                swap_used: Some(system.used_swap()),
                swap_free: Some(system.free_swap()),
            })
        })
        .await
    }
}

/// Mounted filesystems.
#[derive(Default)]
pub struct SystemDiskSource;

impl SystemDiskSource {
    pub fn new() -> Self {
        Self
    }
}

fn disk_device(name: String, mount_path: String, total: u64, free: u64) -> DiskDevice {
    let free = free.min(total);
    let used = total - free;
    let used_pct = if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    };

    DiskDevice {
        name,
        mount_path,
        total_bytes: total,
        used_bytes: used,
        free_bytes: free,
        used_pct,
    }
}

#[async_trait]
impl MetricSource for SystemDiskSource {
    type Output = DiskSample;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<DiskSample> {
        let ctx = ctx.clone();

        blocking("disk", move || {
            let disks = Disks::new_with_refreshed_list();
            let devices: Vec<DiskDevice> = disks
                .list()
                .iter()
                .filter(|disk| disk.total_space() > 0)
                .map(|disk| {
                    disk_device(
                        disk.name().to_string_lossy().into_owned(),
                        disk.mount_point().to_string_lossy().into_owned(),
                        disk.total_space(),
                        disk.available_space(),
                    )
                })
                .collect();

            trace!("found {} disk devices", devices.len());

            Ok(DiskSample {
                host_id: ctx.host_id,
                timestamp_ms: ctx.timestamp_ms,
                devices,
            })
        })
        .await
    }
}

/// Keep every counter of `current` at or above the value last reported for
/// the same interface.
fn monotonic(previous: Option<&NetIface>, current: NetIface) -> NetIface {
    let Some(previous) = previous else {
        return current;
    };

    NetIface {
        bytes_rx: current.bytes_rx.max(previous.bytes_rx),
        bytes_tx: current.bytes_tx.max(previous.bytes_tx),
        packets_rx: current.packets_rx.max(previous.packets_rx),
        packets_tx: current.packets_tx.max(previous.packets_tx),
        err_in: current.err_in.max(previous.err_in),
        err_out: current.err_out.max(previous.err_out),
        drop_in: current.drop_in.max(previous.drop_in),
        drop_out: current.drop_out.max(previous.drop_out),
        name: current.name,
    }
}

struct NetworkState {
    networks: Networks,
    /// Last reported counters per interface still present
    last: HashMap<String, NetIface>,
}

impl NetworkState {
    /// Apply [`monotonic`] against the last report and forget interfaces
    /// that disappeared.
    fn advance(&mut self, observed: Vec<NetIface>) -> Vec<NetIface> {
        let mut interfaces: Vec<NetIface> = observed
            .into_iter()
            .map(|iface| monotonic(self.last.get(&iface.name), iface))
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));

        self.last = interfaces
            .iter()
            .map(|iface| (iface.name.clone(), iface.clone()))
            .collect();

        interfaces
    }
}

/// Cumulative per-interface counters.
///
/// `sysinfo` does not expose drop counters; they are reported as `0`.
pub struct SystemNetworkSource {
    state: Arc<Mutex<NetworkState>>,
}

impl SystemNetworkSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                networks: Networks::new_with_refreshed_list(),
                last: HashMap::new(),
            })),
        }
    }
}

impl Default for SystemNetworkSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricSource for SystemNetworkSource {
    type Output = NetworkSample;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<NetworkSample> {
        let state = Arc::clone(&self.state);
        let ctx = ctx.clone();

        blocking("network", move || {
            let mut state = state.lock().map_err(|_| poisoned("network"))?;
            state.networks.refresh(true);

            let observed: Vec<NetIface> = state
                .networks
                .iter()
                .map(|(name, data)| NetIface {
                    name: name.clone(),
                    bytes_rx: data.total_received(),
                    bytes_tx: data.total_transmitted(),
                    packets_rx: data.total_packets_received(),
                    packets_tx: data.total_packets_transmitted(),
                    err_in: data.total_errors_on_received(),
                    err_out: data.total_errors_on_transmitted(),
                    drop_in: 0,
                    drop_out: 0,
                })
                .collect();

            let interfaces = state.advance(observed);

            Ok(NetworkSample {
                host_id: ctx.host_id,
                timestamp_ms: ctx.timestamp_ms,
                interfaces,
            })
        })
        .await
    }
}

/// Top processes by CPU usage plus whole-system process counts.
///
/// Process CPU usage needs two refreshes to be meaningful, so the very first
/// sample reports `0` for every process.
pub struct SystemProcessSource {
    system: Arc<Mutex<System>>,
    limit: usize,
}

impl SystemProcessSource {
    pub fn new() -> Self {
        Self::with_limit(TOP_PROCESSES)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            limit,
        }
    }
}

impl Default for SystemProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

/// CPU, memory and owner; owners only change on exec, so they are read once.
fn process_refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::nothing()
        .with_cpu()
        .with_memory()
        .with_user(UpdateKind::OnlyIfNotSet)
}

/// Owning user and group ids
#[cfg(unix)]
fn owner_ids(process: &Process) -> (Option<u32>, Option<u32>) {
    (
        process.user_id().map(|uid| **uid),
        process.group_id().map(|gid| *gid),
    )
}

#[cfg(not(unix))]
fn owner_ids(_process: &Process) -> (Option<u32>, Option<u32>) {
    (None, None)
}

/// Sort by CPU (descending, pid as tie breaker) and keep the first `limit`.
fn top_by_cpu(mut processes: Vec<ProcInfo>, limit: usize) -> Vec<ProcInfo> {
    processes.sort_by(|a, b| {
        b.cpu_pct
            .total_cmp(&a.cpu_pct)
            .then_with(|| a.pid.cmp(&b.pid))
    });
    processes.truncate(limit);
    processes
}

#[async_trait]
impl MetricSource for SystemProcessSource {
    type Output = ProcessSample;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<ProcessSample> {
        let system = Arc::clone(&self.system);
        let ctx = ctx.clone();
        let limit = self.limit;

        blocking("process", move || {
            let mut system = system.lock().map_err(|_| poisoned("process"))?;
            system.refresh_memory();
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                process_refresh_kind(),
            );

            let total_memory = system.total_memory();
            let mut running = 0;
            let mut sleeping = 0;
            let mut processes = Vec::with_capacity(system.processes().len());

            for (pid, process) in system.processes() {
                let pid = pid.as_u32();
                if pid == 0 {
                    continue;
                }

                let status = process.status();
                match status {
                    ProcessStatus::Run => running += 1,
                    ProcessStatus::Sleep | ProcessStatus::Idle => sleeping += 1,
                    _ => {}
                }

                let mem_pct = if total_memory == 0 {
                    0.0
                } else {
                    process.memory() as f64 / total_memory as f64 * 100.0
                };

                let (uid, gid) = owner_ids(process);

                processes.push(ProcInfo {
                    pid,
                    name: process.name().to_string_lossy().into_owned(),
                    cpu_pct: process.cpu_usage() as f64,
                    mem_pct,
                    parent_pid: process.parent().map(|parent| parent.as_u32()),
                    uid,
                    gid,
                    status: Some(status.to_string()),
                });
            }

            let total_count = processes.len() as u64;
            let processes = top_by_cpu(processes, limit);

            Ok(ProcessSample {
                host_id: ctx.host_id,
                timestamp_ms: ctx.timestamp_ms,
                processes,
                total_count,
                running_count: running,
                sleeping_count: sleeping,
            })
        })
        .await
    }
}
