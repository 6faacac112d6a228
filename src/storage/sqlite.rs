//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `TelemetryStore` trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers are not blocked by the writer
//! - **Connection pooling**: Shared pool of 5 connections
//! - **Migrations**: Schema versioned with `sqlx::migrate!`
//!
//! ## Atomicity
//!
//! Every `append_batch` runs in one transaction. Values are converted to
//! SQLite integers while the transaction is open, so a value that does not
//! fit aborts the whole batch, including rows already inserted for the same
//! sample.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, PruneReport, QueryFilter, TelemetryStore};
use super::error::{StorageError, StorageResult};
use super::schema::{
    CpuRow, DiskRow, MemoryRow, MetricRow, NetworkRow, ProcessRow, table_name,
};
use crate::{MetricKind, Sample};

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database at `db_path` and run migrations.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    async fn query_kind(
        &self,
        kind: MetricKind,
        filter: &QueryFilter,
    ) -> StorageResult<Vec<MetricRow>> {
        let mut sql = format!("SELECT * FROM {} WHERE 1 = 1", table_name(kind));
        if filter.host_id.is_some() {
            sql.push_str(" AND host_id = ?");
        }
        if filter.start_ms.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if filter.end_ms.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql);
        if let Some(host_id) = &filter.host_id {
            query = query.bind(host_id.as_str());
        }
        if let Some(start) = filter.start_ms {
            query = query.bind(start);
        }
        if let Some(end) = filter.end_ms {
            query = query.bind(end);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(|row| decode_row(kind, row)).collect()
    }
}

fn write_failed(err: sqlx::Error) -> StorageError {
    StorageError::WriteFailed(err.to_string())
}

/// SQLite integers are signed 64-bit.
fn sql_int(value: u64, column: &str) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| {
        StorageError::WriteFailed(format!(
            "{column} value {value} does not fit in a SQLite integer"
        ))
    })
}

fn sql_opt_int(value: Option<u64>, column: &str) -> StorageResult<Option<i64>> {
    value.map(|v| sql_int(v, column)).transpose()
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

async fn insert_row(conn: &mut SqliteConnection, row: &MetricRow) -> StorageResult<()> {
    match row {
        MetricRow::Cpu(r) => {
            sqlx::query(
                r#"
                INSERT INTO cpu_metrics (
                    host_id, timestamp, usage, cores,
                    load_average_1, load_average_5, load_average_15, temperature
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.host_id)
            .bind(r.timestamp_ms)
            .bind(r.usage_pct)
            .bind(sql_int(r.core_count, "cores")?)
            .bind(r.load_avg_1)
            .bind(r.load_avg_5)
            .bind(r.load_avg_15)
            .bind(r.temperature_c)
            .execute(&mut *conn)
            .await
            .map_err(write_failed)?;
        }

        MetricRow::Memory(r) => {
            sqlx::query(
                r#"
                INSERT INTO memory_metrics (
                    host_id, timestamp, total, used, free, available,
                    swap_total, swap_used, swap_free
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.host_id)
            .bind(r.timestamp_ms)
            .bind(sql_int(r.total_bytes, "total")?)
            .bind(sql_int(r.used_bytes, "used")?)
            .bind(sql_int(r.free_bytes, "free")?)
            .bind(sql_int(r.available_bytes, "available")?)
            .bind(sql_opt_int(r.swap_total, "swap_total")?)
            .bind(sql_opt_int(r.swap_used, "swap_used")?)
            .bind(sql_opt_int(r.swap_free, "swap_free")?)
            .execute(&mut *conn)
            .await
            .map_err(write_failed)?;
        }

        MetricRow::Disk(r) => {
            sqlx::query(
                r#"
                INSERT INTO disk_metrics (
                    host_id, timestamp, device_name, mount_point,
                    total, used, free, percentage
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.host_id)
            .bind(r.timestamp_ms)
            .bind(&r.device_name)
            .bind(&r.mount_path)
            .bind(sql_int(r.total_bytes, "total")?)
            .bind(sql_int(r.used_bytes, "used")?)
            .bind(sql_int(r.free_bytes, "free")?)
            .bind(r.used_pct)
            .execute(&mut *conn)
            .await
            .map_err(write_failed)?;
        }

        MetricRow::Network(r) => {
            sqlx::query(
                r#"
                INSERT INTO network_metrics (
                    host_id, timestamp, interface_name,
                    bytes_received, bytes_sent, packets_received, packets_sent,
                    error_in, error_out, drop_in, drop_out
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.host_id)
            .bind(r.timestamp_ms)
            .bind(&r.interface_name)
            .bind(sql_int(r.bytes_rx, "bytes_received")?)
            .bind(sql_int(r.bytes_tx, "bytes_sent")?)
            .bind(sql_int(r.packets_rx, "packets_received")?)
            .bind(sql_int(r.packets_tx, "packets_sent")?)
            .bind(sql_int(r.err_in, "error_in")?)
            .bind(sql_int(r.err_out, "error_out")?)
            .bind(sql_int(r.drop_in, "drop_in")?)
            .bind(sql_int(r.drop_out, "drop_out")?)
            .execute(&mut *conn)
            .await
            .map_err(write_failed)?;
        }

        MetricRow::Processes(r) => {
            sqlx::query(
                r#"
                INSERT INTO process_metrics (
                    host_id, timestamp, pid, name, cpu, memory, ppid, uid, gid, status
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.host_id)
            .bind(r.timestamp_ms)
            .bind(i64::from(r.pid))
            .bind(&r.name)
            .bind(r.cpu_pct)
            .bind(r.mem_pct)
            .bind(r.parent_pid.map(i64::from))
            .bind(r.uid.map(i64::from))
            .bind(r.gid.map(i64::from))
            .bind(&r.status)
            .execute(&mut *conn)
            .await
            .map_err(write_failed)?;
        }
    }

    Ok(())
}

fn decode_row(kind: MetricKind, row: &SqliteRow) -> StorageResult<MetricRow> {
    let host_id: String = row.try_get("host_id")?;
    let timestamp_ms: i64 = row.try_get("timestamp")?;

    let decoded = match kind {
        MetricKind::Cpu => MetricRow::Cpu(CpuRow {
            host_id,
            timestamp_ms,
            usage_pct: row.try_get("usage")?,
            core_count: to_u64(row.try_get("cores")?),
            load_avg_1: row.try_get("load_average_1")?,
            load_avg_5: row.try_get("load_average_5")?,
            load_avg_15: row.try_get("load_average_15")?,
            temperature_c: row.try_get("temperature")?,
        }),

        MetricKind::Memory => MetricRow::Memory(MemoryRow {
            host_id,
            timestamp_ms,
            total_bytes: to_u64(row.try_get("total")?),
            used_bytes: to_u64(row.try_get("used")?),
            free_bytes: to_u64(row.try_get("free")?),
            available_bytes: to_u64(row.try_get("available")?),
            swap_total: row.try_get::<Option<i64>, _>("swap_total")?.map(to_u64),
            swap_used: row.try_get::<Option<i64>, _>("swap_used")?.map(to_u64),
            swap_free: row.try_get::<Option<i64>, _>("swap_free")?.map(to_u64),
        }),

        MetricKind::Disk => MetricRow::Disk(DiskRow {
            host_id,
            timestamp_ms,
            device_name: row.try_get("device_name")?,
            mount_path: row.try_get("mount_point")?,
            total_bytes: to_u64(row.try_get("total")?),
            used_bytes: to_u64(row.try_get("used")?),
            free_bytes: to_u64(row.try_get("free")?),
            used_pct: row.try_get("percentage")?,
        }),

        MetricKind::Network => MetricRow::Network(NetworkRow {
            host_id,
            timestamp_ms,
            interface_name: row.try_get("interface_name")?,
            bytes_rx: to_u64(row.try_get("bytes_received")?),
            bytes_tx: to_u64(row.try_get("bytes_sent")?),
            packets_rx: to_u64(row.try_get("packets_received")?),
            packets_tx: to_u64(row.try_get("packets_sent")?),
            err_in: to_u64(row.try_get("error_in")?),
            err_out: to_u64(row.try_get("error_out")?),
            drop_in: to_u64(row.try_get("drop_in")?),
            drop_out: to_u64(row.try_get("drop_out")?),
        }),

        MetricKind::Processes => MetricRow::Processes(ProcessRow {
            host_id,
            timestamp_ms,
            pid: to_u32(row.try_get("pid")?),
            name: row.try_get("name")?,
            cpu_pct: row.try_get("cpu")?,
            mem_pct: row.try_get("memory")?,
            parent_pid: row.try_get::<Option<i64>, _>("ppid")?.map(to_u32),
            uid: row.try_get::<Option<i64>, _>("uid")?.map(to_u32),
            gid: row.try_get::<Option<i64>, _>("gid")?.map(to_u32),
            status: row.try_get("status")?,
        }),
    };

    Ok(decoded)
}

#[async_trait]
impl TelemetryStore for SqliteBackend {
    #[instrument(skip(self, samples), fields(count = samples.len()))]
    async fn append_batch(&self, samples: &[Sample]) -> StorageResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(write_failed)?;

        let mut row_count = 0;
        for sample in samples {
            for row in MetricRow::from_sample(sample) {
                // an early return drops `tx`, which rolls back
                insert_row(&mut *tx, &row).await?;
                row_count += 1;
            }
        }

        tx.commit().await.map_err(write_failed)?;

        debug!("wrote {} samples as {} rows", samples.len(), row_count);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query(&self, filter: &QueryFilter) -> StorageResult<Vec<MetricRow>> {
        filter.validate()?;

        let mut rows = Vec::new();
        for kind in filter.selected_kinds() {
            rows.extend(self.query_kind(kind, filter).await?);
        }

        // stable: keeps per-table insertion order within a timestamp
        rows.sort_by_key(MetricRow::timestamp_ms);
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }

        debug!("query returned {} rows", rows.len());
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn prune(&self, before_ms: i64) -> StorageResult<PruneReport> {
        info!("pruning telemetry older than {}", before_ms);

        let mut tx = self.pool.begin().await.map_err(write_failed)?;

        let mut deleted = Vec::with_capacity(MetricKind::ALL.len());
        for kind in MetricKind::ALL {
            let sql = format!("DELETE FROM {} WHERE timestamp < ?", table_name(kind));
            let result = sqlx::query(&sql)
                .bind(before_ms)
                .execute(&mut *tx)
                .await
                .map_err(write_failed)?;
            deleted.push((kind, result.rows_affected()));
        }

        tx.commit().await.map_err(write_failed)?;

        let report = PruneReport { before_ms, deleted };
        info!("pruned {} rows", report.total());

        // VACUUM cannot run inside a transaction; the delete is already committed
        if report.total() > 0 {
            match sqlx::query("VACUUM").execute(&self.pool).await {
                Ok(_) => debug!("vacuumed {}", self.db_path),
                Err(e) => warn!("vacuum after prune failed: {}", e),
            }
        }

        Ok(report)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn stats(&self) -> StorageResult<String> {
        let mut counts = Vec::with_capacity(MetricKind::ALL.len());
        let mut total_rows = 0;
        for kind in MetricKind::ALL {
            let sql = format!("SELECT COUNT(*) FROM {}", table_name(kind));
            let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
            total_rows += count;
            counts.push(format!("{kind}={count}"));
        }

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let file_size_mb = file_size as f64 / 1_000_000.0;

        Ok(format!(
            "SQLite: {} rows ({}), {:.2} MB on disk",
            total_rows,
            counts.join(", "),
            file_size_mb
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
