//! State persistence module
//!
//! SQLite-backed stores for process definitions, metric samples, and process
//! events. The repository contracts are storage-agnostic traits; `Database`
//! is the rusqlite implementation used by the daemon. Schema changes ship as
//! versioned migrations applied at most once on open.

mod events;
mod metrics;
mod process;

pub use events::{EventRow, EventStore};
pub use metrics::MetricsStore;
pub use process::{ProcessRow, ProcessStore};

use std::path::Path;

use async_trait::async_trait;
use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::metrics::ProcessMetrics;

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Versioned migrations, applied in order, each at most once.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE IF NOT EXISTS processes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL DEFAULT 'stopped',
        pid INTEGER,
        restarts INTEGER NOT NULL DEFAULT 0,
        config TEXT NOT NULL,
        created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
        started_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS metrics (
        process_id INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        cpu REAL NOT NULL,
        memory INTEGER NOT NULL,
        uptime INTEGER NOT NULL,
        heap_used INTEGER NOT NULL DEFAULT 0,
        heap_total INTEGER NOT NULL DEFAULT 0,
        event_loop_latency REAL NOT NULL DEFAULT 0,
        active_handles INTEGER NOT NULL DEFAULT 0,
        active_requests INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_metrics_process_time
        ON metrics(process_id, timestamp);

    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        process_id INTEGER NOT NULL,
        process_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        data TEXT,
        timestamp INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
    );

    CREATE INDEX IF NOT EXISTS idx_events_process ON events(process_id);
    CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
    CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp);
    "#,
)];

/// Storage contract for process definitions
#[async_trait]
pub trait ProcessRepository: Send + Sync {
    async fn create_process(&self, name: &str, config_json: &str) -> DatabaseResult<ProcessRow>;
    async fn all_processes(&self) -> DatabaseResult<Vec<ProcessRow>>;
    async fn process_by_id(&self, id: i64) -> DatabaseResult<Option<ProcessRow>>;
    async fn process_by_name(&self, name: &str) -> DatabaseResult<Option<ProcessRow>>;
    async fn update_status(&self, id: i64, status: &str, pid: Option<u32>) -> DatabaseResult<()>;
    async fn update_started(&self, id: i64, pid: u32) -> DatabaseResult<()>;
    async fn increment_restarts(&self, id: i64) -> DatabaseResult<u32>;
    async fn reset_restarts(&self, id: i64) -> DatabaseResult<()>;
    async fn update_config(&self, id: i64, config_json: &str) -> DatabaseResult<()>;
    async fn delete_process(&self, id: i64) -> DatabaseResult<()>;
    async fn delete_all_processes(&self) -> DatabaseResult<()>;
}

/// Storage contract for metric samples
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn insert_metric(&self, sample: &ProcessMetrics) -> DatabaseResult<()>;
    async fn insert_metrics_batch(&self, batch: &[ProcessMetrics]) -> DatabaseResult<()>;
    async fn latest_metric(&self, process_id: i64) -> DatabaseResult<Option<ProcessMetrics>>;
    async fn metrics_range(
        &self,
        process_id: i64,
        from: i64,
        to: i64,
    ) -> DatabaseResult<Vec<ProcessMetrics>>;
    async fn cleanup_metrics(&self, process_id: i64) -> DatabaseResult<()>;
    async fn downsample_metrics(&self) -> DatabaseResult<usize>;
}

/// Storage contract for process events
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn insert_event(
        &self,
        process_id: i64,
        process_name: &str,
        kind: &str,
        data: Option<serde_json::Value>,
    ) -> DatabaseResult<()>;
    async fn events_by_process(&self, process_id: i64, limit: usize)
        -> DatabaseResult<Vec<EventRow>>;
    async fn events_by_kind(&self, kind: &str, limit: usize) -> DatabaseResult<Vec<EventRow>>;
    async fn recent_events(&self, limit: usize) -> DatabaseResult<Vec<EventRow>>;
    async fn events_range(&self, from: i64, to: i64) -> DatabaseResult<Vec<EventRow>>;
    async fn cleanup_events(&self, days: i64) -> DatabaseResult<usize>;
    async fn delete_events_by_process(&self, process_id: i64) -> DatabaseResult<()>;
}

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
    process: ProcessStore,
    metrics: MetricsStore,
    events: EventStore,
}

impl Database {
    /// Open or create the database and apply pending migrations.
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::migrate(&conn)?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
            process: ProcessStore::new(),
            metrics: MetricsStore::new(),
            events: EventStore::new(),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            process: ProcessStore::new(),
            metrics: MetricsStore::new(),
            events: EventStore::new(),
        })
    }

    /// Apply migrations that have not run yet. Each version is recorded and
    /// never replayed.
    fn migrate(conn: &Connection) -> DatabaseResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )?;

        for (version, sql) in MIGRATIONS {
            let applied: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
                    [version],
                    |row| row.get::<_, i64>(0),
                )
                .map(|count| count > 0)?;

            if applied {
                continue;
            }

            debug!("Applying migration {}", version);
            conn.execute_batch("BEGIN;")?;
            match conn
                .execute_batch(sql)
                .and_then(|_| {
                    conn.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [
                        version,
                    ])
                    .map(|_| ())
                }) {
                Ok(()) => conn.execute_batch("COMMIT;")?,
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK;");
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ProcessRepository for Database {
    async fn create_process(&self, name: &str, config_json: &str) -> DatabaseResult<ProcessRow> {
        let conn = self.conn.lock().await;
        self.process.create(&conn, name, config_json)
    }

    async fn all_processes(&self) -> DatabaseResult<Vec<ProcessRow>> {
        let conn = self.conn.lock().await;
        self.process.all(&conn)
    }

    async fn process_by_id(&self, id: i64) -> DatabaseResult<Option<ProcessRow>> {
        let conn = self.conn.lock().await;
        self.process.by_id(&conn, id)
    }

    async fn process_by_name(&self, name: &str) -> DatabaseResult<Option<ProcessRow>> {
        let conn = self.conn.lock().await;
        self.process.by_name(&conn, name)
    }

    async fn update_status(&self, id: i64, status: &str, pid: Option<u32>) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.process.update_status(&conn, id, status, pid)
    }

    async fn update_started(&self, id: i64, pid: u32) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.process.update_started(&conn, id, pid)
    }

    async fn increment_restarts(&self, id: i64) -> DatabaseResult<u32> {
        let conn = self.conn.lock().await;
        self.process.increment_restarts(&conn, id)
    }

    async fn reset_restarts(&self, id: i64) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.process.reset_restarts(&conn, id)
    }

    async fn update_config(&self, id: i64, config_json: &str) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.process.update_config(&conn, id, config_json)
    }

    async fn delete_process(&self, id: i64) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        // Cascade: samples and events go with the definition
        self.metrics.cleanup(&conn, id)?;
        self.events.delete_by_process(&conn, id)?;
        self.process.delete(&conn, id)
    }

    async fn delete_all_processes(&self) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM metrics", [])?;
        conn.execute("DELETE FROM events", [])?;
        conn.execute("DELETE FROM processes", [])?;
        Ok(())
    }
}

#[async_trait]
impl MetricsRepository for Database {
    async fn insert_metric(&self, sample: &ProcessMetrics) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.metrics.insert(&conn, sample)
    }

    async fn insert_metrics_batch(&self, batch: &[ProcessMetrics]) -> DatabaseResult<()> {
        let mut conn = self.conn.lock().await;
        self.metrics.insert_batch(&mut conn, batch)
    }

    async fn latest_metric(&self, process_id: i64) -> DatabaseResult<Option<ProcessMetrics>> {
        let conn = self.conn.lock().await;
        self.metrics.latest(&conn, process_id)
    }

    async fn metrics_range(
        &self,
        process_id: i64,
        from: i64,
        to: i64,
    ) -> DatabaseResult<Vec<ProcessMetrics>> {
        let conn = self.conn.lock().await;
        self.metrics.range(&conn, process_id, from, to)
    }

    async fn cleanup_metrics(&self, process_id: i64) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.metrics.cleanup(&conn, process_id)
    }

    async fn downsample_metrics(&self) -> DatabaseResult<usize> {
        let conn = self.conn.lock().await;
        self.metrics.downsample(&conn)
    }
}

#[async_trait]
impl EventRepository for Database {
    async fn insert_event(
        &self,
        process_id: i64,
        process_name: &str,
        kind: &str,
        data: Option<serde_json::Value>,
    ) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.events.insert(&conn, process_id, process_name, kind, data)
    }

    async fn events_by_process(
        &self,
        process_id: i64,
        limit: usize,
    ) -> DatabaseResult<Vec<EventRow>> {
        let conn = self.conn.lock().await;
        self.events.by_process(&conn, process_id, limit)
    }

    async fn events_by_kind(&self, kind: &str, limit: usize) -> DatabaseResult<Vec<EventRow>> {
        let conn = self.conn.lock().await;
        self.events.by_kind(&conn, kind, limit)
    }

    async fn recent_events(&self, limit: usize) -> DatabaseResult<Vec<EventRow>> {
        let conn = self.conn.lock().await;
        self.events.recent(&conn, limit)
    }

    async fn events_range(&self, from: i64, to: i64) -> DatabaseResult<Vec<EventRow>> {
        let conn = self.conn.lock().await;
        self.events.range(&conn, from, to)
    }

    async fn cleanup_events(&self, days: i64) -> DatabaseResult<usize> {
        let conn = self.conn.lock().await;
        self.events.cleanup(&conn, days)
    }

    async fn delete_events_by_process(&self, process_id: i64) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.events.delete_by_process(&conn, process_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_create() {
        let db = Database::open_in_memory().unwrap();

        let row = db.create_process("web", r#"{"script":"app.js"}"#).await.unwrap();
        assert_eq!(row.name, "web");
        assert!(row.id > 0);

        let loaded = db.process_by_name("web").await.unwrap().unwrap();
        assert_eq!(loaded.id, row.id);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        Database::migrate(&conn).unwrap();
        Database::migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let db = Database::open_in_memory().unwrap();
        let row = db.create_process("web", "{}").await.unwrap();

        db.insert_event(row.id, "web", "start", None).await.unwrap();
        db.insert_metric(&ProcessMetrics::zeroed(row.id)).await.unwrap();

        db.delete_process(row.id).await.unwrap();

        assert!(db.process_by_id(row.id).await.unwrap().is_none());
        assert!(db.events_by_process(row.id, 10).await.unwrap().is_empty());
        assert!(db.latest_metric(row.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.create_process("web", "{}").await.unwrap();

        let err = db.create_process("web", "{}").await.unwrap_err();
        assert!(matches!(err, DatabaseError::AlreadyExists(_)));
    }
}
