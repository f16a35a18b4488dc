//! Process event persistence

use rusqlite::Connection;

use super::DatabaseResult;

/// A persisted process event
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub process_id: i64,
    pub process_name: String,
    pub kind: String,
    pub data: Option<serde_json::Value>,
    pub timestamp: i64,
}

const COLUMNS: &str = "id, process_id, process_name, kind, data, timestamp";

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    let data: Option<String> = row.get(4)?;
    Ok(EventRow {
        id: row.get(0)?,
        process_id: row.get(1)?,
        process_name: row.get(2)?,
        kind: row.get(3)?,
        data: data.and_then(|raw| serde_json::from_str(&raw).ok()),
        timestamp: row.get(5)?,
    })
}

/// Store for the events table
pub struct EventStore;

impl EventStore {
    pub fn new() -> Self {
        Self
    }

    pub fn insert(
        &self,
        conn: &Connection,
        process_id: i64,
        process_name: &str,
        kind: &str,
        data: Option<serde_json::Value>,
    ) -> DatabaseResult<()> {
        let data_json = data.map(|v| v.to_string());
        conn.execute(
            "INSERT INTO events (process_id, process_name, kind, data) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![process_id, process_name, kind, data_json],
        )?;
        Ok(())
    }

    /// Events for a process, newest first.
    pub fn by_process(
        &self,
        conn: &Connection,
        process_id: i64,
        limit: usize,
    ) -> DatabaseResult<Vec<EventRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events WHERE process_id = ?1 ORDER BY id DESC LIMIT ?2",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![process_id, limit as i64], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Events of one kind, newest first.
    pub fn by_kind(
        &self,
        conn: &Connection,
        kind: &str,
        limit: usize,
    ) -> DatabaseResult<Vec<EventRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events WHERE kind = ?1 ORDER BY id DESC LIMIT ?2",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![kind, limit as i64], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent events across all processes, newest first.
    pub fn recent(&self, conn: &Connection, limit: usize) -> DatabaseResult<Vec<EventRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events ORDER BY id DESC LIMIT ?1",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map([limit as i64], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Events in `[from, to]`, ascending by timestamp.
    pub fn range(&self, conn: &Connection, from: i64, to: i64) -> DatabaseResult<Vec<EventRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events WHERE timestamp >= ?1 AND timestamp <= ?2 \
             ORDER BY timestamp ASC, id ASC",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![from, to], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop events older than `days`.
    pub fn cleanup(&self, conn: &Connection, days: i64) -> DatabaseResult<usize> {
        let cutoff = chrono::Utc::now().timestamp() - days * 24 * 3600;
        let deleted = conn.execute("DELETE FROM events WHERE timestamp < ?1", [cutoff])?;
        Ok(deleted)
    }

    pub fn delete_by_process(&self, conn: &Connection, process_id: i64) -> DatabaseResult<()> {
        conn.execute("DELETE FROM events WHERE process_id = ?1", [process_id])?;
        Ok(())
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::database::{Database, EventRepository, ProcessRepository};
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_query_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let row = db.create_process("web", "{}").await.unwrap();

        db.insert_event(row.id, "web", "start", None).await.unwrap();
        db.insert_event(row.id, "web", "stop", Some(json!({"force": false})))
            .await
            .unwrap();

        let events = db.events_by_process(row.id, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "stop");
        assert_eq!(events[0].data.as_ref().unwrap()["force"], false);
        assert_eq!(events[1].kind, "start");
    }

    #[tokio::test]
    async fn test_by_kind_and_limit() {
        let db = Database::open_in_memory().unwrap();
        let row = db.create_process("web", "{}").await.unwrap();

        for _ in 0..5 {
            db.insert_event(row.id, "web", "crash", None).await.unwrap();
        }
        db.insert_event(row.id, "web", "start", None).await.unwrap();

        let crashes = db.events_by_kind("crash", 3).await.unwrap();
        assert_eq!(crashes.len(), 3);
        assert!(crashes.iter().all(|e| e.kind == "crash"));
    }

    #[tokio::test]
    async fn test_range_ascending() {
        let db = Database::open_in_memory().unwrap();
        let row = db.create_process("web", "{}").await.unwrap();

        db.insert_event(row.id, "web", "start", None).await.unwrap();
        db.insert_event(row.id, "web", "stop", None).await.unwrap();

        let now = chrono::Utc::now().timestamp();
        let events = db.events_range(now - 60, now + 60).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "start");
        assert_eq!(events[1].kind, "stop");
    }
}
