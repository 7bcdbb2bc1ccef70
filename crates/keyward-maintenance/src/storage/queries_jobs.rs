//! Database queries for probe results, telemetry and live settings.

use super::db::{Database, DatabaseError};
use super::models::{ProbeRecord, TelemetryPoint};
#[cfg(any(test, feature = "test-utils"))]
use super::models::ProbeRow;

/// Settings key holding the live snapshot interval, in days.
pub const SNAPSHOT_INTERVAL_SETTING: &str = "snapshot_interval_days";

impl Database {
    // =========================================================================
    // Probe results
    // =========================================================================

    pub async fn insert_probe_result(&self, record: &ProbeRecord) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO probe_results (host_name, kind, ok, latency_ms, download_mbps, \
             upload_mbps, error, measured_at_ms) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.host_name)
        .bind(record.kind.as_str())
        .bind(record.ok)
        .bind(record.latency_ms)
        .bind(record.download_mbps)
        .bind(record.upload_mbps)
        .bind(&record.error)
        .bind(record.measured_at_ms)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent probe rows for a host, newest first.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn recent_probe_results(
        &self,
        host_name: &str,
        limit: u32,
    ) -> Result<Vec<ProbeRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, ProbeRow>(
            "SELECT * FROM probe_results WHERE host_name = ? \
             ORDER BY measured_at_ms DESC, id DESC LIMIT ?",
        )
        .bind(host_name)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // =========================================================================
    // Telemetry
    // =========================================================================

    pub async fn insert_telemetry_point(
        &self,
        point: &TelemetryPoint,
    ) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO telemetry_points (source, load1, load5, load15, mem_total_kb, \
             mem_available_kb, recorded_at_ms) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&point.source)
        .bind(point.load1)
        .bind(point.load5)
        .bind(point.load15)
        .bind(point.mem_total_kb)
        .bind(point.mem_available_kb)
        .bind(point.recorded_at_ms)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Telemetry for one source recorded at or after `since_ms`, oldest first.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn telemetry_since(
        &self,
        source: &str,
        since_ms: i64,
    ) -> Result<Vec<TelemetryPoint>, DatabaseError> {
        let points = sqlx::query_as::<_, TelemetryPoint>(
            "SELECT source, load1, load5, load15, mem_total_kb, mem_available_kb, recorded_at_ms \
             FROM telemetry_points WHERE source = ? AND recorded_at_ms >= ? \
             ORDER BY recorded_at_ms, id",
        )
        .bind(source)
        .bind(since_ms)
        .fetch_all(self.pool())
        .await?;
        Ok(points)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Live snapshot interval in days, if set to a positive integer.
    pub async fn snapshot_interval_days(&self) -> Result<Option<u32>, DatabaseError> {
        let value = self.get_setting(SNAPSHOT_INTERVAL_SETTING).await?;
        Ok(value
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|d| *d > 0))
    }

    /// Write a consistent copy of the whole database to `path`.
    pub async fn vacuum_into(&self, path: &std::path::Path) -> Result<(), DatabaseError> {
        let target = path
            .to_str()
            .ok_or_else(|| DatabaseError::Io(format!("Non UTF-8 path {}", path.display())))?;
        sqlx::query("VACUUM INTO ?")
            .bind(target)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
