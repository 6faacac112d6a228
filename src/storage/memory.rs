//! In-memory storage backend (no persistence)
//!
//! Rows live in a single vector in insertion order. It is useful for:
//! - Testing without database dependencies
//! - Running with `"backend": "none"`, where history only needs to
//!   outlive the live view
//!
//! All data is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, PruneReport, QueryFilter, TelemetryStore};
use super::error::StorageResult;
use super::schema::MetricRow;
use crate::{MetricKind, Sample};

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    rows: RwLock<Vec<MetricRow>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl TelemetryStore for MemoryBackend {
    async fn append_batch(&self, samples: &[Sample]) -> StorageResult<()> {
        let batch: Vec<MetricRow> = samples.iter().flat_map(MetricRow::from_sample).collect();

        // rows of the batch become visible under a single write lock
        self.rows.write().await.extend(batch);
        Ok(())
    }

    async fn query(&self, filter: &QueryFilter) -> StorageResult<Vec<MetricRow>> {
        filter.validate()?;

        let mut rows: Vec<MetricRow> = self
            .rows
            .read()
            .await
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();

        // stable: rows sharing a timestamp keep insertion order
        rows.sort_by_key(MetricRow::timestamp_ms);
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }

        debug!("in-memory query returned {} rows", rows.len());
        Ok(rows)
    }

    async fn prune(&self, before_ms: i64) -> StorageResult<PruneReport> {
        let mut rows = self.rows.write().await;

        let mut deleted: HashMap<MetricKind, u64> = HashMap::new();
        rows.retain(|row| {
            let keep = row.timestamp_ms() >= before_ms;
            if !keep {
                *deleted.entry(row.kind()).or_default() += 1;
            }
            keep
        });

        Ok(PruneReport {
            before_ms,
            deleted: MetricKind::ALL
                .into_iter()
                .map(|kind| (kind, deleted.get(&kind).copied().unwrap_or(0)))
                .collect(),
        })
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("total_rows".to_string(), self.row_count().await.to_string()),
            ]),
        })
    }

    async fn stats(&self) -> StorageResult<String> {
        Ok(format!("In-Memory: {} rows", self.row_count().await))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
