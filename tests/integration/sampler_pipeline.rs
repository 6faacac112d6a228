//! Integration tests for the sampler
//!
//! These tests verify that:
//! - Start is idempotent and stop/start resumes clean ticking
//! - A failing or stalled source never hides the other kinds
//! - Settings updates while running restart the schedule
//!
//! Timing-sensitive tests run on paused time so tick counts are exact.

use std::time::Duration;

use hostscope::actors::bus::EventBus;
use hostscope::actors::messages::{BusEvent, Topic};
use hostscope::actors::sampler::SamplerHandle;
use hostscope::config::SettingsPatch;
use hostscope::sources::SourceSet;
use hostscope::sources::cpu::SystemCpuSource;
use hostscope::{MetricKind, Sample};
use pretty_assertions::assert_eq;

use crate::helpers::{
    CountingDisk, FailingNetwork, FixedMemory, StalledProcesses, SyntheticCpu, drain, samples,
    test_config,
};

fn cpu_usages(events: &[BusEvent]) -> Vec<f64> {
    samples(events)
        .into_iter()
        .filter_map(|sample| match sample {
            Sample::Cpu(cpu) => Some(cpu.usage_pct),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_cpu_only_sampling_cadence() {
    let bus = EventBus::new();
    let (_token, mut rx) = bus.subscribe_channel(vec![Topic::Kind(MetricKind::Cpu)]);

    let config = test_config(100, &[MetricKind::Cpu]);
    let sources = SourceSet::new().with_cpu(SyntheticCpu::new());
    let sampler = SamplerHandle::spawn(&config, sources, bus.clone()).unwrap();

    sampler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    sampler.stop().await.unwrap();

    let usages = cpu_usages(&drain(&mut rx));
    assert!(
        (2..=3).contains(&usages.len()),
        "expected 2-3 cpu samples, got {}",
        usages.len()
    );
    assert!(usages.iter().all(|u| (0.0..=100.0).contains(u)));

    sampler.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_double_start_keeps_single_timer() {
    let bus = EventBus::new();
    let (_token, mut rx) = bus.subscribe_channel(vec![Topic::Composite]);

    let config = test_config(100, &[MetricKind::Cpu]);
    let sources = SourceSet::new().with_cpu(SyntheticCpu::new());
    let sampler = SamplerHandle::spawn(&config, sources, bus.clone()).unwrap();

    sampler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    sampler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // ticks at 0, 100 and 200; a reset phase would have ticked at 50 and 150
    let composites = drain(&mut rx);
    assert_eq!(composites.len(), 3);

    let stats = sampler.status().await.unwrap();
    assert_eq!(stats.ticks, 3);
    assert!(stats.running);

    sampler.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_then_start_resumes() {
    let bus = EventBus::new();
    let (_token, mut rx) = bus.subscribe_channel(vec![Topic::Kind(MetricKind::Cpu)]);

    let config = test_config(100, &[MetricKind::Cpu]);
    let sources = SourceSet::new().with_cpu(SyntheticCpu::new());
    let sampler = SamplerHandle::spawn(&config, sources, bus.clone()).unwrap();

    sampler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    sampler.stop().await.unwrap();
    sampler.stop().await.unwrap();
    assert!(!sampler.is_running().await.unwrap());
    assert_eq!(drain(&mut rx).len(), 2);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(drain(&mut rx).is_empty());

    sampler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // the baseline survives the restart, so no second zero reading
    let usages = cpu_usages(&drain(&mut rx));
    assert_eq!(usages, vec![60.0, 60.0]);

    // settings are untouched by stop/start
    assert_eq!(sampler.get_settings().await.unwrap(), config.sampler);

    sampler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_first_cpu_reading_after_cold_start_is_zero() {
    let bus = EventBus::new();
    let mut config = test_config(1000, &[MetricKind::Cpu]);
    config.source_timeout_ms = 2000;

    let sources = SourceSet::new().with_cpu(SystemCpuSource::new());
    let sampler = SamplerHandle::spawn(&config, sources, bus).unwrap();

    let data = sampler.sample_now().await.unwrap();
    let cpu = data.cpu.expect("cpu sample");
    assert_eq!(cpu.usage_pct, 0.0);
    assert!(cpu.core_count > 0);

    sampler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_sources_do_not_hide_other_kinds() {
    let bus = EventBus::new();
    let (_token, mut rx) = bus.subscribe_channel(Topic::all_kinds());

    let config = test_config(
        1000,
        &[
            MetricKind::Cpu,
            MetricKind::Memory,
            MetricKind::Network,
            MetricKind::Processes,
        ],
    );
    let sources = SourceSet::new()
        .with_cpu(SyntheticCpu::new())
        .with_memory(FixedMemory {
            total: 100,
            used: 25,
        })
        .with_network(FailingNetwork)
        .with_processes(StalledProcesses);
    let sampler = SamplerHandle::spawn(&config, sources, bus.clone()).unwrap();

    for _ in 0..2 {
        let data = sampler.sample_now().await.unwrap();
        assert_eq!(data.kinds(), vec![MetricKind::Cpu, MetricKind::Memory]);
        assert!(data.network.is_none());
        assert!(data.processes.is_none());
    }

    let kinds: Vec<MetricKind> = samples(&drain(&mut rx)).iter().map(Sample::kind).collect();
    assert_eq!(
        kinds,
        vec![
            MetricKind::Cpu,
            MetricKind::Memory,
            MetricKind::Cpu,
            MetricKind::Memory
        ]
    );

    let stats = sampler.status().await.unwrap();
    assert_eq!(stats.ticks, 2);
    assert_eq!(stats.source_failures, 4);

    sampler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_composite_is_published_even_when_empty() {
    let bus = EventBus::new();
    let (_token, mut rx) = bus.subscribe_channel(vec![Topic::Composite]);

    let config = test_config(1000, &[MetricKind::Network]);
    let sources = SourceSet::new().with_network(FailingNetwork);
    let sampler = SamplerHandle::spawn(&config, sources, bus.clone()).unwrap();

    let data = sampler.sample_now().await.unwrap();
    assert!(data.is_empty());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(events[0].as_composite().is_some_and(|c| c.is_empty()));

    sampler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_memory_usage_ratio() {
    let bus = EventBus::new();
    let (_token, mut rx) = bus.subscribe_channel(vec![Topic::Kind(MetricKind::Memory)]);

    let config = test_config(1000, &[MetricKind::Memory]);
    let sources = SourceSet::new().with_memory(FixedMemory {
        total: 8_000_000_000,
        used: 4_000_000_000,
    });
    let sampler = SamplerHandle::spawn(&config, sources, bus.clone()).unwrap();

    sampler.sample_now().await.unwrap();

    let emitted = samples(&drain(&mut rx));
    assert_eq!(emitted.len(), 1);
    match &emitted[0] {
        Sample::Memory(memory) => {
            assert_eq!(memory.free_bytes, 4_000_000_000);
            assert_eq!(memory.available_bytes, 4_000_000_000);
            assert_eq!(memory.usage_ratio(), 0.5);
        }
        other => panic!("expected memory sample, got {other:?}"),
    }

    sampler.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_settings_update_while_running_resamples_disk() {
    let bus = EventBus::new();
    let (_token, mut rx) = bus.subscribe_channel(vec![Topic::Kind(MetricKind::Disk)]);

    let disk = CountingDisk::default();
    let config = test_config(1000, &[MetricKind::Cpu, MetricKind::Disk]);
    let sources = SourceSet::new()
        .with_cpu(SyntheticCpu::new())
        .with_disk(disk.clone());
    let sampler = SamplerHandle::spawn(&config, sources, bus.clone()).unwrap();

    sampler.start().await.unwrap();
    assert_eq!(drain(&mut rx).len(), 1);

    // ticks never sample disk
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(drain(&mut rx).is_empty());

    let settings = sampler
        .update_settings(SettingsPatch::interval(500))
        .await
        .unwrap();
    assert_eq!(settings.sample_interval_ms, 500);

    let resampled = samples(&drain(&mut rx));
    assert_eq!(resampled.len(), 1);
    assert_eq!(resampled[0].kind(), MetricKind::Disk);
    assert_eq!(disk.calls(), 2);
    assert!(sampler.is_running().await.unwrap());

    let stats = sampler.status().await.unwrap();
    assert_eq!(stats.disk_snapshots, 2);

    sampler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_settings_update_while_stopped_does_not_start() {
    let bus = EventBus::new();
    let disk = CountingDisk::default();
    let config = test_config(1000, &[MetricKind::Disk]);
    let sampler =
        SamplerHandle::spawn(&config, SourceSet::new().with_disk(disk.clone()), bus).unwrap();

    sampler
        .update_settings(SettingsPatch::history(50))
        .await
        .unwrap();

    assert!(!sampler.is_running().await.unwrap());
    assert_eq!(disk.calls(), 0);
    assert_eq!(sampler.watch_settings().borrow().max_history_points, 50);

    sampler.shutdown().await.unwrap();
}
