//! Storage backend trait definition
//!
//! This module defines the `TelemetryStore` trait that every storage
//! implementation must implement, plus the query and maintenance types
//! passed across it.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{StorageError, StorageResult};
use super::export;
use super::schema::MetricRow;
use crate::util::now_millis;
use crate::{MetricKind, Sample};

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Which rows a query returns
///
/// Time bounds are inclusive. An empty `kinds` list selects every kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub kinds: Vec<MetricKind>,
    pub host_id: Option<String>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,

    /// Maximum number of rows to return, counted after merging kinds
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: MetricKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn host(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn range(mut self, start_ms: Option<i64>, end_ms: Option<i64>) -> Self {
        self.start_ms = start_ms;
        self.end_ms = end_ms;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Selected kinds in [`MetricKind::ALL`] order, without duplicates.
    pub fn selected_kinds(&self) -> Vec<MetricKind> {
        MetricKind::ALL
            .into_iter()
            .filter(|kind| self.kinds.is_empty() || self.kinds.contains(kind))
            .collect()
    }

    pub fn validate(&self) -> StorageResult<()> {
        match (self.start_ms, self.end_ms) {
            (Some(start), Some(end)) if start > end => Err(StorageError::QueryFailed(format!(
                "start ({start}) is after end ({end})"
            ))),
            _ => Ok(()),
        }
    }

    pub fn matches(&self, row: &MetricRow) -> bool {
        let ts = row.timestamp_ms();
        self.selected_kinds().contains(&row.kind())
            && self.host_id.as_deref().is_none_or(|h| h == row.host_id())
            && self.start_ms.is_none_or(|start| ts >= start)
            && self.end_ms.is_none_or(|end| ts <= end)
    }
}

/// Output format for [`TelemetryStore::export`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "json"),
            ExportFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unknown export format '{other}' (expected json or csv)")),
        }
    }
}

/// Rows deleted by a prune, per kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Rows strictly older than this were deleted
    pub before_ms: i64,

    pub deleted: Vec<(MetricKind, u64)>,
}

impl PruneReport {
    pub fn total(&self) -> u64 {
        self.deleted.iter().map(|(_, n)| n).sum()
    }
}

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: std::collections::HashMap<String, String>,
}

/// Trait for telemetry storage backends
///
/// ## Atomicity
///
/// A sample that maps to several rows (disk devices, network interfaces,
/// processes) must become visible all at once or not at all.
/// `append_batch` extends this to the whole batch.
///
/// ## Ordering
///
/// `query` returns rows ordered by timestamp, then by insertion order.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Persist one sample.
    async fn append(&self, sample: &Sample) -> StorageResult<()> {
        self.append_batch(std::slice::from_ref(sample)).await
    }

    /// Persist many samples in a single transaction.
    async fn append_batch(&self, samples: &[Sample]) -> StorageResult<()>;

    /// Fetch rows matching `filter`.
    ///
    /// Fails with `StorageError::QueryFailed` when start is after end.
    async fn query(&self, filter: &QueryFilter) -> StorageResult<Vec<MetricRow>>;

    /// Render every row within `[start_ms, end_ms]` in `format`.
    async fn export(
        &self,
        format: ExportFormat,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> StorageResult<String> {
        let rows = self
            .query(&QueryFilter::new().range(start_ms, end_ms))
            .await?;
        export::render(format, &rows)
    }

    /// Delete every row strictly older than `before_ms`.
    async fn prune(&self, before_ms: i64) -> StorageResult<PruneReport>;

    /// Delete rows older than `days` days.
    async fn prune_retention(&self, days: u32) -> StorageResult<PruneReport> {
        self.prune(now_millis() - i64::from(days) * MILLIS_PER_DAY)
            .await
    }

    /// Check backend health
    ///
    /// Performs a lightweight operation to verify the backend is
    /// operational.
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human-readable statistics (e.g. "SQLite: 1200 rows, 0.45 MB on disk").
    async fn stats(&self) -> StorageResult<String>;

    /// Flush pending writes and release resources.
    async fn close(&self) -> StorageResult<()>;
}
