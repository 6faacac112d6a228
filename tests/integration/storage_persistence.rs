//! Integration tests for storage persistence
//!
//! These tests verify that:
//! - Samples flow from the sampler through the bus into SQLite
//! - Multi-row samples and batches are all-or-nothing
//! - Queries honour kind, host and time range filters
//! - Export renders every kind and retention pruning removes old rows

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use hostscope::actors::bus::EventBus;
use hostscope::actors::sampler::SamplerHandle;
use hostscope::actors::storage::{PersistenceOptions, StorageHandle};
use hostscope::sources::SourceSet;
use hostscope::storage::sqlite::SqliteBackend;
use hostscope::storage::{
    ExportFormat, MetricRow, QueryFilter, StorageError, TelemetryStore,
};
use hostscope::util::now_millis;
use hostscope::MetricKind;
use pretty_assertions::assert_eq;
use tempfile::tempdir;
use tokio::sync::Notify;

use crate::helpers::{
    CountingDisk, SlowCpu, SyntheticCpu, cpu_sample, disk_device, disk_sample, test_config,
};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

async fn count(backend: &SqliteBackend, kind: MetricKind) -> usize {
    backend
        .query(&QueryFilter::new().kind(kind))
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_full_persistence_pipeline() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("telemetry.db");

    let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let bus = EventBus::new();
    let storage = StorageHandle::spawn(backend, PersistenceOptions::default(), &bus);

    let config = test_config(1000, &[MetricKind::Cpu, MetricKind::Disk]);
    let sources = SourceSet::new()
        .with_cpu(SyntheticCpu::new())
        .with_disk(CountingDisk::default());
    let sampler = SamplerHandle::spawn(&config, sources, bus.clone()).unwrap();

    // start publishes the disk snapshot before it returns
    sampler.start().await.unwrap();
    sampler.stop().await.unwrap();
    sampler.sample_now().await.unwrap();
    sampler.shutdown().await.unwrap();

    // reads flush the buffer first
    let rows = storage
        .query(QueryFilter::new().kind(MetricKind::Disk))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    storage.shutdown().await.unwrap();

    // everything is on disk after shutdown
    let reopened = SqliteBackend::new(&db_path).await.unwrap();
    assert_eq!(count(&reopened, MetricKind::Disk).await, 2);
    assert!(count(&reopened, MetricKind::Cpu).await >= 1);

    let mounts: Vec<String> = reopened
        .query(&QueryFilter::new().kind(MetricKind::Disk))
        .await
        .unwrap()
        .into_iter()
        .filter_map(|row| match row {
            MetricRow::Disk(disk) => Some(disk.mount_path),
            _ => None,
        })
        .collect();
    assert_eq!(mounts, vec!["/".to_string(), "/data".to_string()]);
}

#[tokio::test]
async fn test_in_flight_tick_is_persisted_on_shutdown() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("shutdown.db");

    let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let bus = EventBus::new();
    let storage = StorageHandle::spawn(backend, PersistenceOptions::default(), &bus);

    let mut config = test_config(1000, &[MetricKind::Cpu]);
    config.source_timeout_ms = 2_000;

    let started = Arc::new(Notify::new());
    let sources = SourceSet::new().with_cpu(SlowCpu {
        delay: Duration::from_millis(200),
        started: Arc::clone(&started),
    });
    let sampler = SamplerHandle::spawn(&config, sources, bus.clone()).unwrap();

    sampler.start().await.unwrap();
    started.notified().await;

    // same order as the binary: sampler first, then the writer
    sampler.shutdown().await.unwrap();
    storage.shutdown().await.unwrap();

    let reopened = SqliteBackend::new(&db_path).await.unwrap();
    assert_eq!(count(&reopened, MetricKind::Cpu).await, 1);
}

#[tokio::test]
async fn test_interrupted_disk_sample_writes_nothing() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("atomic.db"))
        .await
        .unwrap();

    // the third device does not fit a SQLite integer, failing mid-sample
    let sample = disk_sample(
        1_000,
        vec![
            disk_device("sda1", "/", 100, 10),
            disk_device("sdb1", "/data", 200, 20),
            disk_device("huge", "/huge", u64::MAX, 0),
        ],
    );

    let result = backend.append(&sample).await;
    assert_matches!(result, Err(StorageError::WriteFailed(_)));
    assert_eq!(count(&backend, MetricKind::Disk).await, 0);

    // the whole batch is rolled back, including rows of other kinds
    let result = backend.append_batch(&[cpu_sample(900), sample]).await;
    assert_matches!(result, Err(StorageError::WriteFailed(_)));
    assert_eq!(count(&backend, MetricKind::Cpu).await, 0);

    backend.append(&cpu_sample(900)).await.unwrap();
    assert_eq!(count(&backend, MetricKind::Cpu).await, 1);
}

#[tokio::test]
async fn test_query_filters() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("query.db"))
        .await
        .unwrap();

    backend
        .append_batch(&[
            cpu_sample(300),
            cpu_sample(100),
            disk_sample(200, vec![disk_device("sda1", "/", 100, 50)]),
            cpu_sample(200),
        ])
        .await
        .unwrap();

    let all = backend.query(&QueryFilter::new()).await.unwrap();
    let timestamps: Vec<i64> = all.iter().map(MetricRow::timestamp_ms).collect();
    assert_eq!(timestamps, vec![100, 200, 200, 300]);

    let window = backend
        .query(&QueryFilter::new().range(Some(150), Some(250)))
        .await
        .unwrap();
    assert_eq!(window.len(), 2);
    assert!(window.iter().all(|row| row.timestamp_ms() == 200));

    let cpu_only = backend
        .query(
            &QueryFilter::new()
                .kind(MetricKind::Cpu)
                .range(Some(200), None),
        )
        .await
        .unwrap();
    assert_eq!(cpu_only.len(), 2);

    let other_host = backend
        .query(&QueryFilter::new().host("elsewhere"))
        .await
        .unwrap();
    assert!(other_host.is_empty());

    let limited = backend.query(&QueryFilter::new().limit(1)).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].timestamp_ms(), 100);

    let inverted = backend
        .query(&QueryFilter::new().range(Some(300), Some(100)))
        .await;
    assert_matches!(inverted, Err(StorageError::QueryFailed(_)));
}

#[tokio::test]
async fn test_export_formats() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("export.db"))
        .await
        .unwrap();

    backend
        .append_batch(&[
            cpu_sample(100),
            disk_sample(100, vec![disk_device("sda1", "/", 100, 50)]),
            cpu_sample(500),
        ])
        .await
        .unwrap();

    let json = backend
        .export(ExportFormat::Json, Some(0), Some(200))
        .await
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["cpu"].as_array().unwrap().len(), 1);
    assert_eq!(value["cpu"][0]["temperature_c"], 41.5);
    assert_eq!(value["disk"][0]["device_name"], "sda1");
    assert_eq!(value["memory"].as_array().unwrap().len(), 0);

    let csv = backend.export(ExportFormat::Csv, None, None).await.unwrap();
    let cpu_lines = csv.lines().filter(|line| line.starts_with("cpu,")).count();
    assert_eq!(cpu_lines, 2);
    assert!(csv.lines().any(|line| line.starts_with("disk,test-host,100,sda1,/,")));
    assert_eq!(
        csv.lines().filter(|line| line.starts_with("kind,")).count(),
        5
    );
}

#[tokio::test]
async fn test_retention_prune() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("prune.db"))
        .await
        .unwrap();

    let now = now_millis();
    backend
        .append_batch(&[
            cpu_sample(now - 10 * DAY_MS),
            disk_sample(
                now - 9 * DAY_MS,
                vec![
                    disk_device("sda1", "/", 100, 50),
                    disk_device("sdb1", "/data", 100, 50),
                ],
            ),
            cpu_sample(now - DAY_MS),
        ])
        .await
        .unwrap();

    let report = backend.prune_retention(7).await.unwrap();
    assert_eq!(report.total(), 3);
    assert!(report.deleted.contains(&(MetricKind::Cpu, 1)));
    assert!(report.deleted.contains(&(MetricKind::Disk, 2)));

    assert_eq!(count(&backend, MetricKind::Cpu).await, 1);
    assert_eq!(count(&backend, MetricKind::Disk).await, 0);
}

#[tokio::test]
async fn test_writer_prunes_on_startup() {
    let temp_dir = tempdir().unwrap();
    let backend = Arc::new(
        SqliteBackend::new(temp_dir.path().join("startup.db"))
            .await
            .unwrap(),
    );

    let now = now_millis();
    backend
        .append_batch(&[cpu_sample(now - 30 * DAY_MS), cpu_sample(now)])
        .await
        .unwrap();

    let bus = EventBus::new();
    let options = PersistenceOptions {
        retention_days: Some(7),
        ..PersistenceOptions::default()
    };
    let storage = StorageHandle::spawn(backend.clone(), options, &bus);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = storage.get_stats().await.unwrap();
            if stats.total_rows_pruned > 0 {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(count(&backend, MetricKind::Cpu).await, 1);
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_writer_export_includes_buffered_samples() {
    let temp_dir = tempdir().unwrap();
    let backend = Arc::new(
        SqliteBackend::new(temp_dir.path().join("buffered.db"))
            .await
            .unwrap(),
    );

    let bus = EventBus::new();
    let storage = StorageHandle::spawn(backend, PersistenceOptions::default(), &bus);

    bus.publish_sample(cpu_sample(10));
    bus.publish_sample(cpu_sample(20));

    let json = storage.export(ExportFormat::Json, None, None).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["cpu"].as_array().unwrap().len(), 2);

    let stats = storage.get_stats().await.unwrap();
    assert_eq!(stats.samples_written, 2);
    assert_eq!(stats.write_failures, 0);

    assert!(storage.health_check().await.unwrap().contains("operational"));
    storage.shutdown().await.unwrap();
}
