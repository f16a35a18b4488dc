//! Metric sample persistence

use rusqlite::{Connection, OptionalExtension};

use crate::metrics::ProcessMetrics;

use super::DatabaseResult;

/// Samples older than this horizon are dropped by `downsample`
const DOWNSAMPLE_HORIZON_SECS: i64 = 30 * 24 * 3600;

const COLUMNS: &str = "process_id, timestamp, cpu, memory, uptime, \
                       heap_used, heap_total, event_loop_latency, active_handles, active_requests";

fn row_to_sample(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessMetrics> {
    Ok(ProcessMetrics {
        process_id: row.get(0)?,
        timestamp: row.get(1)?,
        cpu: row.get(2)?,
        memory: row.get::<_, i64>(3)? as u64,
        uptime: row.get::<_, i64>(4)? as u64,
        heap_used: row.get::<_, i64>(5)? as u64,
        heap_total: row.get::<_, i64>(6)? as u64,
        event_loop_latency: row.get(7)?,
        active_handles: row.get::<_, i64>(8)? as u32,
        active_requests: row.get::<_, i64>(9)? as u32,
    })
}

/// Store for the metrics table
pub struct MetricsStore;

impl MetricsStore {
    pub fn new() -> Self {
        Self
    }

    pub fn insert(&self, conn: &Connection, sample: &ProcessMetrics) -> DatabaseResult<()> {
        conn.execute(
            &format!(
                "INSERT INTO metrics ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                COLUMNS
            ),
            rusqlite::params![
                sample.process_id,
                sample.timestamp,
                sample.cpu,
                sample.memory as i64,
                sample.uptime as i64,
                sample.heap_used as i64,
                sample.heap_total as i64,
                sample.event_loop_latency,
                sample.active_handles as i64,
                sample.active_requests as i64,
            ],
        )?;
        Ok(())
    }

    /// Insert a batch atomically.
    pub fn insert_batch(
        &self,
        conn: &mut Connection,
        batch: &[ProcessMetrics],
    ) -> DatabaseResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO metrics ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                COLUMNS
            ))?;
            for sample in batch {
                stmt.execute(rusqlite::params![
                    sample.process_id,
                    sample.timestamp,
                    sample.cpu,
                    sample.memory as i64,
                    sample.uptime as i64,
                    sample.heap_used as i64,
                    sample.heap_total as i64,
                    sample.event_loop_latency,
                    sample.active_handles as i64,
                    sample.active_requests as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn latest(
        &self,
        conn: &Connection,
        process_id: i64,
    ) -> DatabaseResult<Option<ProcessMetrics>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM metrics WHERE process_id = ?1 ORDER BY timestamp DESC LIMIT 1",
            COLUMNS
        ))?;
        Ok(stmt.query_row([process_id], row_to_sample).optional()?)
    }

    /// Samples in `[from, to]`, ascending by timestamp.
    pub fn range(
        &self,
        conn: &Connection,
        process_id: i64,
        from: i64,
        to: i64,
    ) -> DatabaseResult<Vec<ProcessMetrics>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM metrics \
             WHERE process_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3 \
             ORDER BY timestamp ASC",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![process_id, from, to], row_to_sample)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop every sample for a process (cascade on delete).
    pub fn cleanup(&self, conn: &Connection, process_id: i64) -> DatabaseResult<()> {
        conn.execute("DELETE FROM metrics WHERE process_id = ?1", [process_id])?;
        Ok(())
    }

    /// Drop samples older than the retention horizon.
    pub fn downsample(&self, conn: &Connection) -> DatabaseResult<usize> {
        let cutoff = chrono::Utc::now().timestamp() - DOWNSAMPLE_HORIZON_SECS;
        let deleted = conn.execute("DELETE FROM metrics WHERE timestamp < ?1", [cutoff])?;
        Ok(deleted)
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}
