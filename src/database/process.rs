//! Process definition persistence

use rusqlite::{Connection, OptionalExtension};

use crate::process::ProcessConfig;

use super::{DatabaseError, DatabaseResult};

/// A persisted process definition
#[derive(Debug, Clone)]
pub struct ProcessRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub config: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
}

impl ProcessRow {
    /// Parse the JSON config body.
    pub fn parse_config(&self) -> DatabaseResult<ProcessConfig> {
        serde_json::from_str(&self.config)
            .map_err(|e| DatabaseError::Serialization(format!("{}: {}", self.name, e)))
    }
}

const COLUMNS: &str = "id, name, status, pid, restarts, config, created_at, started_at";

fn row_to_process(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessRow> {
    Ok(ProcessRow {
        id: row.get(0)?,
        name: row.get(1)?,
        status: row.get(2)?,
        pid: row.get::<_, Option<i64>>(3)?.map(|p| p as u32),
        restarts: row.get::<_, i64>(4)? as u32,
        config: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
    })
}

/// Store for the processes table
pub struct ProcessStore;

impl ProcessStore {
    pub fn new() -> Self {
        Self
    }

    /// Insert a new definition. Name uniqueness is enforced by the schema.
    pub fn create(
        &self,
        conn: &Connection,
        name: &str,
        config_json: &str,
    ) -> DatabaseResult<ProcessRow> {
        let result = conn.execute(
            "INSERT INTO processes (name, status, config) VALUES (?1, 'stopped', ?2)",
            rusqlite::params![name, config_json],
        );

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(DatabaseError::AlreadyExists(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let id = conn.last_insert_rowid();
        self.by_id(conn, id)?
            .ok_or_else(|| DatabaseError::NotFound(name.to_string()))
    }

    pub fn all(&self, conn: &Connection) -> DatabaseResult<Vec<ProcessRow>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM processes ORDER BY id", COLUMNS))?;
        let rows = stmt
            .query_map([], row_to_process)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn by_id(&self, conn: &Connection, id: i64) -> DatabaseResult<Option<ProcessRow>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM processes WHERE id = ?1", COLUMNS))?;
        Ok(stmt.query_row([id], row_to_process).optional()?)
    }

    pub fn by_name(&self, conn: &Connection, name: &str) -> DatabaseResult<Option<ProcessRow>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM processes WHERE name = ?1", COLUMNS))?;
        Ok(stmt.query_row([name], row_to_process).optional()?)
    }

    pub fn update_status(
        &self,
        conn: &Connection,
        id: i64,
        status: &str,
        pid: Option<u32>,
    ) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE processes SET status = ?2, pid = ?3 WHERE id = ?1",
            rusqlite::params![id, status, pid.map(|p| p as i64)],
        )?;
        Ok(())
    }

    pub fn update_started(&self, conn: &Connection, id: i64, pid: u32) -> DatabaseResult<()> {
        conn.execute(
            r#"
            UPDATE processes
            SET status = 'online', pid = ?2, started_at = strftime('%s', 'now')
            WHERE id = ?1
            "#,
            rusqlite::params![id, pid as i64],
        )?;
        Ok(())
    }

    /// Bump the restart counter and return the new value.
    pub fn increment_restarts(&self, conn: &Connection, id: i64) -> DatabaseResult<u32> {
        conn.execute(
            "UPDATE processes SET restarts = restarts + 1 WHERE id = ?1",
            [id],
        )?;
        let restarts: i64 = conn.query_row(
            "SELECT restarts FROM processes WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(restarts as u32)
    }

    pub fn reset_restarts(&self, conn: &Connection, id: i64) -> DatabaseResult<()> {
        conn.execute("UPDATE processes SET restarts = 0 WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn update_config(&self, conn: &Connection, id: i64, config_json: &str) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE processes SET config = ?2 WHERE id = ?1",
            rusqlite::params![id, config_json],
        )?;
        Ok(())
    }

    pub fn delete(&self, conn: &Connection, id: i64) -> DatabaseResult<()> {
        conn.execute("DELETE FROM processes WHERE id = ?1", [id])?;
        Ok(())
    }
}

impl Default for ProcessStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::database::ProcessRepository;

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_process("a", "{}").await.unwrap();
        let b = db.create_process("b", "{}").await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_status_and_started() {
        let db = Database::open_in_memory().unwrap();
        let row = db.create_process("web", "{}").await.unwrap();
        assert_eq!(row.status, "stopped");
        assert!(row.pid.is_none());

        db.update_started(row.id, 4242).await.unwrap();
        let row = db.process_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(row.status, "online");
        assert_eq!(row.pid, Some(4242));
        assert!(row.started_at.is_some());

        db.update_status(row.id, "stopped", None).await.unwrap();
        let row = db.process_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(row.status, "stopped");
        assert!(row.pid.is_none());
    }

    #[tokio::test]
    async fn test_restart_counter() {
        let db = Database::open_in_memory().unwrap();
        let row = db.create_process("web", "{}").await.unwrap();

        assert_eq!(db.increment_restarts(row.id).await.unwrap(), 1);
        assert_eq!(db.increment_restarts(row.id).await.unwrap(), 2);

        db.reset_restarts(row.id).await.unwrap();
        let row = db.process_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(row.restarts, 0);
    }

    #[tokio::test]
    async fn test_parse_config() {
        let db = Database::open_in_memory().unwrap();
        let config = crate::process::ProcessConfig::for_script("serve.sh");
        let json = serde_json::to_string(&config).unwrap();

        let row = db.create_process("web", &json).await.unwrap();
        let parsed = row.parse_config().unwrap();
        assert_eq!(parsed.script, "serve.sh");

        db.update_config(row.id, "not json").await.unwrap();
        let row = db.process_by_id(row.id).await.unwrap().unwrap();
        assert!(row.parse_config().is_err());
    }
}
