//! CPU source
//!
//! Utilization is derived from cumulative idle/total tick counters:
//! `usage = 100 - 100 * Δidle / Δtotal` between two consecutive readings.
//! The first reading has nothing to compare against and reports `0`.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use sysinfo::{Components, CpuRefreshKind, RefreshKind, System};
use tracing::trace;

use super::{MetricSource, SampleContext};
use crate::CpuSample;
use crate::util::clamp_pct;

/// Cumulative CPU tick counters summed over all cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

/// Keeps the previous reading so consecutive calls yield a usage delta.
#[derive(Debug, Default)]
pub struct CpuUsageTracker {
    previous: Option<CpuTimes>,
}

impl CpuUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_baseline(&self) -> bool {
        self.previous.is_some()
    }

    /// Record `current` and return the usage since the previous reading.
    ///
    /// Returns `0.0` without a baseline, and when the counters did not
    /// advance (or went backwards, e.g. after a counter reset).
    pub fn update(&mut self, current: CpuTimes) -> f64 {
        let usage = match self.previous {
            Some(previous) if current.total > previous.total => {
                let idle_delta = current.idle.saturating_sub(previous.idle) as f64;
                let total_delta = (current.total - previous.total) as f64;
                clamp_pct(100.0 - 100.0 * idle_delta / total_delta)
            }
            _ => 0.0,
        };

        self.previous = Some(current);
        usage
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
///
/// Idle time includes iowait; total is the sum of the first eight columns
/// (user, nice, system, idle, iowait, irq, softirq, steal). Guest time is
/// already accounted for in user/nice.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_proc_stat(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|field| field.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;

    if fields.len() < 4 {
        return None;
    }

    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().sum();

    Some(CpuTimes { idle, total })
}

/// CPU source backed by the local machine.
///
/// On Linux the tick counters come from `/proc/stat`. Elsewhere `sysinfo`
/// performs the same delta computation internally between refreshes.
pub struct SystemCpuSource {
    tracker: Mutex<CpuUsageTracker>,
    #[cfg_attr(target_os = "linux", allow(dead_code))]
    system: Arc<Mutex<System>>,
    core_count: usize,
}

impl SystemCpuSource {
    pub fn new() -> Self {
        let system =
            System::new_with_specifics(RefreshKind::nothing().with_cpu(CpuRefreshKind::everything()));
        let core_count = system.cpus().len().max(1);

        Self {
            tracker: Mutex::new(CpuUsageTracker::new()),
            system: Arc::new(Mutex::new(system)),
            core_count,
        }
    }

    #[cfg(target_os = "linux")]
    async fn read_usage(&self) -> anyhow::Result<f64> {
        let content = tokio::fs::read_to_string("/proc/stat")
            .await
            .context("failed to read /proc/stat")?;
        let times = parse_proc_stat(&content).context("malformed cpu line in /proc/stat")?;

        let mut tracker = self
            .tracker
            .lock()
            .map_err(|_| anyhow::anyhow!("cpu tracker lock poisoned"))?;
        Ok(tracker.update(times))
    }

    #[cfg(not(target_os = "linux"))]
    async fn read_usage(&self) -> anyhow::Result<f64> {
        let system = Arc::clone(&self.system);
        let usage = tokio::task::spawn_blocking(move || -> anyhow::Result<f64> {
            let mut system = system
                .lock()
                .map_err(|_| anyhow::anyhow!("system lock poisoned"))?;
            system.refresh_cpu_usage();
            Ok(system.global_cpu_usage() as f64)
        })
        .await
        .context("cpu refresh task failed")??;

        let mut tracker = self
            .tracker
            .lock()
            .map_err(|_| anyhow::anyhow!("cpu tracker lock poisoned"))?;
        if !tracker.has_baseline() {
            // first refresh has no delta yet
            tracker.update(CpuTimes { idle: 0, total: 0 });
            return Ok(0.0);
        }
        Ok(usage)
    }
}

impl Default for SystemCpuSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Average of all component temperatures that report a value.
fn average_temperature() -> Option<f32> {
    let components = Components::new_with_refreshed_list();
    let temperatures: Vec<f32> = components
        .iter()
        .filter_map(|component| component.temperature())
        .filter(|t| t.is_finite())
        .collect();

    if temperatures.is_empty() {
        return None;
    }
    Some(temperatures.iter().sum::<f32>() / temperatures.len() as f32)
}

#[async_trait]
impl MetricSource for SystemCpuSource {
    type Output = CpuSample;

    async fn sample(&self, ctx: &SampleContext) -> anyhow::Result<CpuSample> {
        let usage_pct = self.read_usage().await?;

        let load = System::load_average();
        let temperature_c = tokio::task::spawn_blocking(average_temperature)
            .await
            .context("temperature task failed")?;

        trace!("cpu usage {usage_pct:.1}% on {} cores", self.core_count);

        Ok(CpuSample {
            host_id: ctx.host_id.clone(),
            timestamp_ms: ctx.timestamp_ms,
            usage_pct,
            core_count: self.core_count,
            load_avg: [load.one, load.five, load.fifteen],
            temperature_c,
        })
    }
}
