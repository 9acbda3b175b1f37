//! SQLite-backed run history.

use chrono::{DateTime, Utc};
use joblib::types::{JobId, Timestamp};
use joblib::{FinishedRun, HistoryStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt::Display;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Status of a record that was created but whose job has not started yet.
pub const PENDING: &str = "pending";

/// Parameters of a run request, before a job id exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRun {
    pub source: String,
    pub destination: String,
    pub options: Vec<String>,
}

impl NewRun {
    /// The argv handed to rsync: options first, then source and destination.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.options.clone();
        argv.push(self.source.clone());
        argv.push(self.destination.clone());
        argv
    }

    pub fn full_command(&self) -> String {
        format!("rsync {}", self.argv().join(" "))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryRecord {
    pub id: JobId,
    pub source: String,
    pub destination: String,
    pub options: Vec<String>,
    pub full_command: String,
    pub status: String,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

#[derive(Debug)]
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

fn backend(err: impl Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn format_ts(ts: &Timestamp) -> String {
    ts.to_rfc3339()
}

fn parse_ts(idx: usize, value: String) -> rusqlite::Result<Timestamp> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
        })
}

fn parse_opt_ts(idx: usize, value: Option<String>) -> rusqlite::Result<Option<Timestamp>> {
    value.map(|value| parse_ts(idx, value)).transpose()
}

const SELECT_COLUMNS: &str = "id, source, destination, options, full_command, status, exit_code, \
                              output, created_at, started_at, completed_at";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let options: String = row.get(3)?;
    let options = serde_json::from_str(&options).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(HistoryRecord {
        id: row.get(0)?,
        source: row.get(1)?,
        destination: row.get(2)?,
        options,
        full_command: row.get(4)?,
        status: row.get(5)?,
        exit_code: row.get(6)?,
        output: row.get(7)?,
        created_at: parse_ts(8, row.get(8)?)?,
        started_at: parse_opt_ts(9, row.get(9)?)?,
        completed_at: parse_opt_ts(10, row.get(10)?)?,
    })
}

impl SqliteHistoryStore {
    /// Open (or create) the database at `path` and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(backend)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS rsync_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                destination TEXT NOT NULL,
                options TEXT NOT NULL,
                full_command TEXT NOT NULL,
                status TEXT NOT NULL,
                exit_code INTEGER NULL,
                output TEXT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT NULL,
                completed_at TEXT NULL
            );
            "#,
        )
        .map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a pending record; its id becomes the job id.
    pub fn create(&self, run: &NewRun) -> Result<HistoryRecord, StoreError> {
        let options = serde_json::to_string(&run.options).map_err(backend)?;
        let created_at = Utc::now();
        let full_command = run.full_command();
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO rsync_history (source, destination, options, full_command, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.source,
                    run.destination,
                    options,
                    full_command,
                    PENDING,
                    format_ts(&created_at)
                ],
            )
            .map_err(backend)?;
            conn.last_insert_rowid()
        };
        self.get(id)
    }

    pub fn get(&self, id: JobId) -> Result<HistoryRecord, StoreError> {
        let sql = format!("SELECT {} FROM rsync_history WHERE id = ?1", SELECT_COLUMNS);
        self.conn()
            .query_row(&sql, params![id], record_from_row)
            .optional()
            .map_err(backend)?
            .ok_or(StoreError::NotFound(id))
    }

    /// Most recent records first.
    pub fn list(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM rsync_history ORDER BY id DESC LIMIT ?1",
            SELECT_COLUMNS
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(params![limit as i64], record_from_row)
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    pub fn delete(&self, id: JobId) -> Result<(), StoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM rsync_history WHERE id = ?1", params![id])
            .map_err(backend)?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn mark_started(&self, id: JobId, started_at: Timestamp) -> Result<(), StoreError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE rsync_history SET status = ?1, started_at = ?2 WHERE id = ?3",
                params![
                    joblib::JobStatus::Running.as_str(),
                    format_ts(&started_at),
                    id
                ],
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn mark_finished(&self, run: &FinishedRun) -> Result<(), StoreError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE rsync_history
                 SET status = ?1, exit_code = ?2, output = ?3, started_at = ?4, completed_at = ?5
                 WHERE id = ?6",
                params![
                    run.status.as_str(),
                    run.exit_code,
                    run.output,
                    format_ts(&run.started_at),
                    format_ts(&run.finished_at),
                    run.id
                ],
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(run.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblib::JobStatus;

    fn new_run() -> NewRun {
        NewRun {
            source: "/src".into(),
            destination: "host:/dst".into(),
            options: vec!["-av".into(), "--delete".into()],
        }
    }

    fn store() -> (tempfile::TempDir, SqliteHistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteHistoryStore::open(dir.path().join("history.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn create_assigns_increasing_ids() {
        let (_dir, store) = store();
        let first = store.create(&new_run()).unwrap();
        let second = store.create(&new_run()).unwrap();
        assert!(second.id > first.id);

        assert_eq!(first.status, PENDING);
        assert_eq!(first.options, vec!["-av".to_string(), "--delete".to_string()]);
        assert_eq!(first.full_command, "rsync -av --delete /src host:/dst");
        assert_eq!(first.exit_code, None);
        assert!(first.started_at.is_none());
    }

    #[test]
    fn list_is_newest_first_and_limited() {
        let (_dir, store) = store();
        let ids: Vec<JobId> = (0..3).map(|_| store.create(&new_run()).unwrap().id).collect();

        let listed: Vec<JobId> = store.list(2).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![ids[2], ids[1]]);
    }

    #[test]
    fn started_then_finished_updates_record() {
        let (_dir, store) = store();
        let id = store.create(&new_run()).unwrap().id;
        let started_at = Utc::now();

        store.mark_started(id, started_at).unwrap();
        let record = store.get(id).unwrap();
        assert_eq!(record.status, "running");
        assert!(record.started_at.is_some());

        store
            .mark_finished(&FinishedRun {
                id,
                status: JobStatus::Failed,
                exit_code: Some(23),
                output: "a\nb".into(),
                started_at,
                finished_at: Utc::now(),
            })
            .unwrap();
        let record = store.get(id).unwrap();
        assert_eq!(record.status, "failed");
        assert_eq!(record.exit_code, Some(23));
        assert_eq!(record.output.as_deref(), Some("a\nb"));
        assert!(record.completed_at.unwrap() >= record.started_at.unwrap());
    }

    #[test]
    fn missing_records_are_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.get(42), Err(StoreError::NotFound(42))));
        assert!(matches!(store.delete(42), Err(StoreError::NotFound(42))));
        assert!(matches!(
            store.mark_started(42, Utc::now()),
            Err(StoreError::NotFound(42))
        ));
    }

    #[test]
    fn delete_removes_record() {
        let (_dir, store) = store();
        let id = store.create(&new_run()).unwrap().id;
        store.delete(id).unwrap();
        assert!(store.list(10).unwrap().is_empty());
    }
}
