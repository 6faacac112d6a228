//! Helper sources and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hostscope::actors::messages::BusEvent;
use hostscope::config::{Config, SamplerSettings, StorageConfig};
use hostscope::sources::cpu::{CpuTimes, CpuUsageTracker};
use hostscope::sources::{MetricSource, SampleContext};
use hostscope::{
    CpuSample, DiskDevice, DiskSample, MemorySample, NetworkSample, ProcessSample, Sample,
};
use tokio::sync::{Notify, mpsc};

/// Config with storage disabled and only the given kinds enabled
pub fn test_config(interval_ms: u64, enabled: &[hostscope::MetricKind]) -> Config {
    use hostscope::MetricKind;

    let settings = SamplerSettings {
        sample_interval_ms: interval_ms,
        enable_cpu: enabled.contains(&MetricKind::Cpu),
        enable_memory: enabled.contains(&MetricKind::Memory),
        enable_disk: enabled.contains(&MetricKind::Disk),
        enable_network: enabled.contains(&MetricKind::Network),
        enable_processes: enabled.contains(&MetricKind::Processes),
        ..SamplerSettings::default()
    };

    Config {
        host_id: "test-host".to_string(),
        sampler: settings,
        source_timeout_ms: 50,
        storage: StorageConfig::None,
    }
}

/// CPU source fed by synthetic tick counters: 100 ticks per call, 40 idle.
///
/// Goes through the real usage tracker, so the first reading is 0 and every
/// later one is 60%.
pub struct SyntheticCpu {
    state: Mutex<(CpuUsageTracker, CpuTimes)>,
}

impl SyntheticCpu {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((CpuUsageTracker::new(), CpuTimes { idle: 0, total: 0 })),
        }
    }
}

#[async_trait]
impl MetricSource for SyntheticCpu {
    type Output = CpuSample;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<CpuSample> {
        let usage_pct = {
            let mut state = self.state.lock().unwrap();
            let (tracker, times) = &mut *state;
            times.total += 100;
            times.idle += 40;
            tracker.update(*times)
        };

        Ok(CpuSample {
            host_id: ctx.host_id.clone(),
            timestamp_ms: ctx.timestamp_ms,
            usage_pct,
            core_count: 4,
            load_avg: [0.5, 0.4, 0.3],
            temperature_c: None,
        })
    }
}

/// CPU source that takes `delay` per call and signals when a call begins
pub struct SlowCpu {
    pub delay: Duration,
    pub started: Arc<Notify>,
}

#[async_trait]
impl MetricSource for SlowCpu {
    type Output = CpuSample;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<CpuSample> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;

        Ok(CpuSample {
            host_id: ctx.host_id.clone(),
            timestamp_ms: ctx.timestamp_ms,
            usage_pct: 25.0,
            core_count: 2,
            load_avg: [0.1, 0.2, 0.3],
            temperature_c: None,
        })
    }
}

/// Memory source with fixed readings
pub struct FixedMemory {
    pub total: u64,
    pub used: u64,
}

#[async_trait]
impl MetricSource for FixedMemory {
    type Output = MemorySample;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<MemorySample> {
        Ok(MemorySample {
            host_id: ctx.host_id.clone(),
            timestamp_ms: ctx.timestamp_ms,
            total_bytes: self.total,
            used_bytes: self.used,
            free_bytes: self.total - self.used,
            available_bytes: self.total - self.used,
            swap_total: None,
            swap_used: None,
            swap_free: None,
        })
    }
}

/// Disk source that counts how often it was asked
#[derive(Clone, Default)]
pub struct CountingDisk {
    pub calls: Arc<AtomicUsize>,
}

impl CountingDisk {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricSource for CountingDisk {
    type Output = DiskSample;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<DiskSample> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        Ok(DiskSample {
            host_id: ctx.host_id.clone(),
            timestamp_ms: ctx.timestamp_ms,
            devices: vec![
                disk_device("sda1", "/", 100, 40),
                disk_device("sdb1", "/data", 1000, 250),
            ],
        })
    }
}

pub fn disk_device(name: &str, mount: &str, total: u64, used: u64) -> DiskDevice {
    DiskDevice {
        name: name.to_string(),
        mount_path: mount.to_string(),
        total_bytes: total,
        used_bytes: used,
        free_bytes: total - used,
        used_pct: used as f64 / total as f64 * 100.0,
    }
}

/// Network source that always errors
pub struct FailingNetwork;

#[async_trait]
impl MetricSource for FailingNetwork {
    type Output = NetworkSample;

    async fn sample(&self, _ctx: &SampleContext) -> anyhow::Result<NetworkSample> {
        anyhow::bail!("interface table unavailable")
    }
}

/// Process source that never answers within the source timeout
pub struct StalledProcesses;

#[async_trait]
impl MetricSource for StalledProcesses {
    type Output = ProcessSample;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<ProcessSample> {
        tokio::time::sleep(Duration::from_secs(30)).await;

        Ok(ProcessSample {
            host_id: ctx.host_id.clone(),
            timestamp_ms: ctx.timestamp_ms,
            processes: Vec::new(),
            total_count: 0,
            running_count: 0,
            sleeping_count: 0,
        })
    }
}

/// Everything currently queued on `rx`
pub fn drain(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> Vec<BusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// The samples among `events`
pub fn samples(events: &[BusEvent]) -> Vec<Sample> {
    events
        .iter()
        .filter_map(|event| event.as_sample().cloned())
        .collect()
}

pub fn cpu_sample(ts: i64) -> Sample {
    Sample::Cpu(CpuSample {
        host_id: "test-host".to_string(),
        timestamp_ms: ts,
        usage_pct: 25.0,
        core_count: 2,
        load_avg: [0.1, 0.2, 0.3],
        temperature_c: Some(41.5),
    })
}

pub fn disk_sample(ts: i64, devices: Vec<DiskDevice>) -> Sample {
    Sample::Disk(DiskSample {
        host_id: "test-host".to_string(),
        timestamp_ms: ts,
        devices,
    })
}
