//! Export rendering
//!
//! JSON is one object keyed by kind, each holding an array of typed rows.
//! CSV is one section per kind: a header line, then one line per row, with
//! sections separated by an empty line.

use serde::Serialize;

use super::backend::ExportFormat;
use super::error::StorageResult;
use super::schema::{CpuRow, DiskRow, MemoryRow, MetricRow, NetworkRow, ProcessRow};

#[derive(Debug, Default, Serialize)]
struct ExportDocument<'a> {
    cpu: Vec<&'a CpuRow>,
    memory: Vec<&'a MemoryRow>,
    disk: Vec<&'a DiskRow>,
    network: Vec<&'a NetworkRow>,
    processes: Vec<&'a ProcessRow>,
}

impl<'a> ExportDocument<'a> {
    fn from_rows(rows: &'a [MetricRow]) -> Self {
        let mut doc = Self::default();
        for row in rows {
            match row {
                MetricRow::Cpu(r) => doc.cpu.push(r),
                MetricRow::Memory(r) => doc.memory.push(r),
                MetricRow::Disk(r) => doc.disk.push(r),
                MetricRow::Network(r) => doc.network.push(r),
                MetricRow::Processes(r) => doc.processes.push(r),
            }
        }
        doc
    }
}

pub fn render(format: ExportFormat, rows: &[MetricRow]) -> StorageResult<String> {
    let doc = ExportDocument::from_rows(rows);
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(&doc)?),
        ExportFormat::Csv => Ok(render_csv(&doc)),
    }
}

trait CsvRecord {
    const KIND: &'static str;
    const HEADER: &'static [&'static str];

    fn fields(&self) -> Vec<String>;
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

impl CsvRecord for CpuRow {
    const KIND: &'static str = "cpu";
    const HEADER: &'static [&'static str] = &[
        "host_id",
        "timestamp_ms",
        "usage_pct",
        "core_count",
        "load_avg_1",
        "load_avg_5",
        "load_avg_15",
        "temperature_c",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.host_id.clone(),
            self.timestamp_ms.to_string(),
            self.usage_pct.to_string(),
            self.core_count.to_string(),
            self.load_avg_1.to_string(),
            self.load_avg_5.to_string(),
            self.load_avg_15.to_string(),
            opt(&self.temperature_c),
        ]
    }
}

impl CsvRecord for MemoryRow {
    const KIND: &'static str = "memory";
    const HEADER: &'static [&'static str] = &[
        "host_id",
        "timestamp_ms",
        "total_bytes",
        "used_bytes",
        "free_bytes",
        "available_bytes",
        "swap_total",
        "swap_used",
        "swap_free",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.host_id.clone(),
            self.timestamp_ms.to_string(),
            self.total_bytes.to_string(),
            self.used_bytes.to_string(),
            self.free_bytes.to_string(),
            self.available_bytes.to_string(),
            opt(&self.swap_total),
            opt(&self.swap_used),
            opt(&self.swap_free),
        ]
    }
}

impl CsvRecord for DiskRow {
    const KIND: &'static str = "disk";
    const HEADER: &'static [&'static str] = &[
        "host_id",
        "timestamp_ms",
        "device_name",
        "mount_path",
        "total_bytes",
        "used_bytes",
        "free_bytes",
        "used_pct",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.host_id.clone(),
            self.timestamp_ms.to_string(),
            self.device_name.clone(),
            self.mount_path.clone(),
            self.total_bytes.to_string(),
            self.used_bytes.to_string(),
            self.free_bytes.to_string(),
            self.used_pct.to_string(),
        ]
    }
}

impl CsvRecord for NetworkRow {
    const KIND: &'static str = "network";
    const HEADER: &'static [&'static str] = &[
        "host_id",
        "timestamp_ms",
        "interface_name",
        "bytes_rx",
        "bytes_tx",
        "packets_rx",
        "packets_tx",
        "err_in",
        "err_out",
        "drop_in",
        "drop_out",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.host_id.clone(),
            self.timestamp_ms.to_string(),
            self.interface_name.clone(),
            self.bytes_rx.to_string(),
            self.bytes_tx.to_string(),
            self.packets_rx.to_string(),
            self.packets_tx.to_string(),
            self.err_in.to_string(),
            self.err_out.to_string(),
            self.drop_in.to_string(),
            self.drop_out.to_string(),
        ]
    }
}

impl CsvRecord for ProcessRow {
    const KIND: &'static str = "processes";
    const HEADER: &'static [&'static str] = &[
        "host_id",
        "timestamp_ms",
        "pid",
        "name",
        "cpu_pct",
        "mem_pct",
        "parent_pid",
        "uid",
        "gid",
        "status",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.host_id.clone(),
            self.timestamp_ms.to_string(),
            self.pid.to_string(),
            self.name.clone(),
            self.cpu_pct.to_string(),
            self.mem_pct.to_string(),
            opt(&self.parent_pid),
            opt(&self.uid),
            opt(&self.gid),
            opt(&self.status),
        ]
    }
}

/// Quote a field when it contains a separator, a quote or a line break.
fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn write_section<R: CsvRecord>(out: &mut String, rows: &[&R]) {
    if !out.is_empty() {
        out.push('\n');
    }

    out.push_str("kind,");
    out.push_str(&R::HEADER.join(","));
    out.push('\n');

    for row in rows {
        let fields: Vec<String> = row.fields().iter().map(|f| escape(f)).collect();
        out.push_str(R::KIND);
        out.push(',');
        out.push_str(&fields.join(","));
        out.push('\n');
    }
}

fn render_csv(doc: &ExportDocument<'_>) -> String {
    let mut out = String::new();
    write_section(&mut out, &doc.cpu);
    write_section(&mut out, &doc.memory);
    write_section(&mut out, &doc.disk);
    write_section(&mut out, &doc.network);
    write_section(&mut out, &doc.processes);
    out
}
