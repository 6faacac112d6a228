use std::path::PathBuf;

use chrono::Utc;

const HOST_ID: &str = "HOSTSCOPE_HOST_ID";

const DEFAULT_HOST_ID: &str = "local";

pub fn get_default_host_id() -> String {
    DEFAULT_HOST_ID.to_string()
}

pub fn get_host_id() -> String {
    std::env::var(HOST_ID)
        .ok()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(get_default_host_id)
}

const DB_PATH: &str = "HOSTSCOPE_DB";

pub fn get_db_path() -> Option<PathBuf> {
    std::env::var(DB_PATH).ok().map(PathBuf::from)
}

/// Current wall-clock time as Unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Clamp a percentage into `[0, 100]`, mapping NaN to 0.
pub fn clamp_pct(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

/// Live channel name for a kind, e.g. `hosts/local/telemetry/cpu`.
pub fn telemetry_channel(host_id: &str, kind: crate::MetricKind) -> String {
    format!("hosts/{host_id}/telemetry/{kind}")
}
