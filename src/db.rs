use crate::error::{ImporterError, Result};
use crate::storage::{EventTransaction, Storage, UpsertOutcome};
use crate::types::{BatchStatus, Event, EventType, LoadBatch, LogEntry, LogLevel};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS load_batches (
        id                    TEXT PRIMARY KEY,
        started_at            TEXT NOT NULL,
        finished_at           TEXT,
        status                TEXT NOT NULL,
        events_imported_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS events (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id     TEXT NOT NULL UNIQUE,
        name         TEXT NOT NULL,
        start_date   TEXT NOT NULL,
        end_date     TEXT,
        event_type   TEXT NOT NULL,
        venue_name   TEXT,
        city         TEXT,
        category     TEXT NOT NULL,
        sub_category TEXT NOT NULL,
        load_batch   TEXT NOT NULL REFERENCES load_batches(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_events_start_date ON events (start_date);
    CREATE TABLE IF NOT EXISTS import_logs (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        level      TEXT NOT NULL,
        message    TEXT NOT NULL,
        created_at TEXT NOT NULL,
        batch_id   TEXT REFERENCES load_batches(id) ON DELETE SET NULL
    );
"#;

const EVENT_COLUMNS: &str = "id, event_id, name, start_date, end_date, venue_name, city, \
                             category, sub_category, load_batch, event_type";

type SharedConnection = Arc<Mutex<Connection>>;

/// SQLite-backed storage. Batch and log writes use the shared connection;
/// every event transaction opens its own so the two never share fate.
///
/// All SQLite calls run on the blocking pool. Calls on the shared connection
/// are serialized by its mutex and may wait up to [`BUSY_TIMEOUT`] while an
/// import holds the write lock.
pub struct SqliteStorage {
    path: PathBuf,
    conn: SharedConnection,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Self::connect(&path)?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened event store at {}", path.display());
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn connect(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;
            "#,
        )?;
        Ok(conn)
    }
}

fn task_failed(err: tokio::task::JoinError) -> ImporterError {
    ImporterError::Database {
        message: format!("sqlite task failed: {err}"),
    }
}

/// Run `f` against `conn` on the blocking pool.
async fn blocking<T, F>(conn: &SharedConnection, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock().map_err(|_| ImporterError::Database {
            message: "sqlite connection lock poisoned".to_string(),
        })?;
        f(&mut guard)
    })
    .await
    .map_err(task_failed)?
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ImporterError::Database {
            message: format!("bad timestamp '{raw}' in store: {e}"),
        })
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ImporterError::Database {
        message: format!("bad uuid '{raw}' in store: {e}"),
    })
}

struct EventRow {
    id: i64,
    event_id: String,
    name: String,
    start_date: String,
    end_date: Option<String>,
    venue_name: Option<String>,
    city: Option<String>,
    category: String,
    sub_category: String,
    load_batch: String,
    event_type: String,
}

impl EventRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_id: row.get(1)?,
            name: row.get(2)?,
            start_date: row.get(3)?,
            end_date: row.get(4)?,
            venue_name: row.get(5)?,
            city: row.get(6)?,
            category: row.get(7)?,
            sub_category: row.get(8)?,
            load_batch: row.get(9)?,
            event_type: row.get(10)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: Some(self.id),
            event_id: self.event_id,
            name: self.name,
            start_date: parse_ts(&self.start_date)?,
            end_date: self.end_date.as_deref().map(parse_ts).transpose()?,
            venue_name: self.venue_name,
            city: self.city,
            category: self.category,
            sub_category: self.sub_category,
            load_batch: parse_uuid(&self.load_batch)?,
            event_type: self.event_type.parse::<EventType>()?,
        })
    }
}

struct BatchRow {
    id: String,
    started_at: String,
    finished_at: Option<String>,
    status: String,
    events_imported_count: i64,
}

impl BatchRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            started_at: row.get(1)?,
            finished_at: row.get(2)?,
            status: row.get(3)?,
            events_imported_count: row.get(4)?,
        })
    }

    fn into_batch(self) -> Result<LoadBatch> {
        Ok(LoadBatch {
            id: parse_uuid(&self.id)?,
            started_at: parse_ts(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            status: self.status.parse::<BatchStatus>()?,
            events_imported_count: u32::try_from(self.events_imported_count).unwrap_or(0),
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_batch(&self, batch: &LoadBatch) -> Result<()> {
        let batch = batch.clone();
        blocking(&self.conn, move |conn| {
            conn.execute(
                "INSERT INTO load_batches (id, started_at, finished_at, status, events_imported_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    batch.id.to_string(),
                    format_ts(&batch.started_at),
                    batch.finished_at.as_ref().map(format_ts),
                    batch.status.as_str(),
                    batch.events_imported_count as i64,
                ],
            )?;
            debug!("Created load batch {}", batch.id);
            Ok(())
        })
        .await
    }

    async fn finalize_batch(&self, batch: &LoadBatch) -> Result<()> {
        let finished_at = match (batch.status.is_terminal(), batch.finished_at.as_ref()) {
            (true, Some(ts)) => format_ts(ts),
            _ => {
                return Err(ImporterError::Batch {
                    message: format!("batch {} is not finished", batch.id),
                })
            }
        };
        let batch = batch.clone();
        blocking(&self.conn, move |conn| {
            let updated = conn.execute(
                "UPDATE load_batches
                 SET status = ?2, finished_at = ?3, events_imported_count = ?4
                 WHERE id = ?1 AND status = 'PENDING'",
                params![
                    batch.id.to_string(),
                    batch.status.as_str(),
                    finished_at,
                    batch.events_imported_count as i64,
                ],
            )?;
            if updated == 0 {
                return Err(ImporterError::Batch {
                    message: format!("batch {} is unknown or already finished", batch.id),
                });
            }
            debug!("Finalized load batch {} as {}", batch.id, batch.status);
            Ok(())
        })
        .await
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<LoadBatch>> {
        blocking(&self.conn, move |conn| {
            conn.query_row(
                "SELECT id, started_at, finished_at, status, events_imported_count
                 FROM load_batches WHERE id = ?1",
                params![batch_id.to_string()],
                BatchRow::read,
            )
            .optional()?
            .map(BatchRow::into_batch)
            .transpose()
        })
        .await
    }

    async fn list_batches(&self, limit: usize) -> Result<Vec<LoadBatch>> {
        blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, finished_at, status, events_imported_count
                 FROM load_batches ORDER BY started_at DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], BatchRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(BatchRow::into_batch).collect()
        })
        .await
    }

    async fn begin_events(&self) -> Result<Box<dyn EventTransaction>> {
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Self::connect(&path)?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(conn)
        })
        .await
        .map_err(task_failed)??;
        Ok(Box::new(SqliteTransaction {
            conn: Arc::new(Mutex::new(conn)),
            open: true,
            upserts: 0,
        }))
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let event_id = event_id.to_string();
        blocking(&self.conn, move |conn| {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1");
            conn.query_row(&sql, params![event_id], EventRow::read)
                .optional()?
                .map(EventRow::into_event)
                .transpose()
        })
        .await
    }

    async fn list_events(&self, limit: usize, offset: usize) -> Result<Vec<Event>> {
        blocking(&self.conn, move |conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 ORDER BY start_date DESC, event_id ASC LIMIT ?1 OFFSET ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit as i64, offset as i64], EventRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(EventRow::into_event).collect()
        })
        .await
    }

    async fn count_events(&self) -> Result<usize> {
        blocking(&self.conn, |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn append_logs(&self, entries: &[LogEntry]) -> Result<()> {
        let entries = entries.to_vec();
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO import_logs (level, message, created_at, batch_id) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for entry in &entries {
                    stmt.execute(params![
                        entry.level.as_str(),
                        entry.message,
                        format_ts(&entry.created_at),
                        entry.batch_id.map(|id| id.to_string()),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_logs(&self, batch_id: Option<Uuid>) -> Result<Vec<LogEntry>> {
        blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT level, message, created_at, batch_id FROM import_logs
                 WHERE ?1 IS NULL OR batch_id = ?1
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![batch_id.map(|id| id.to_string())], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(level, message, created_at, batch_id)| {
                    Ok(LogEntry {
                        level: level.parse::<LogLevel>()?,
                        message,
                        created_at: parse_ts(&created_at)?,
                        batch_id: batch_id.as_deref().map(parse_uuid).transpose()?,
                    })
                })
                .collect()
        })
        .await
    }
}

fn upsert_row(conn: &Connection, event: &Event) -> Result<UpsertOutcome> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM events WHERE event_id = ?1",
            params![event.event_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    conn.execute(
        "INSERT INTO events (event_id, name, start_date, end_date, venue_name, city,
                             category, sub_category, load_batch, event_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(event_id) DO UPDATE SET
            name = excluded.name,
            start_date = excluded.start_date,
            end_date = excluded.end_date,
            venue_name = excluded.venue_name,
            city = excluded.city,
            category = excluded.category,
            sub_category = excluded.sub_category,
            load_batch = excluded.load_batch,
            event_type = excluded.event_type",
        params![
            event.event_id,
            event.name,
            format_ts(&event.start_date),
            event.end_date.as_ref().map(format_ts),
            event.venue_name,
            event.city,
            event.category,
            event.sub_category,
            event.load_batch.to_string(),
            event.event_type.as_str(),
        ],
    )?;

    Ok(if exists {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Created
    })
}

/// Event upserts on a dedicated connection inside `BEGIN IMMEDIATE`
struct SqliteTransaction {
    conn: SharedConnection,
    open: bool,
    upserts: usize,
}

#[async_trait]
impl EventTransaction for SqliteTransaction {
    async fn upsert_event(&mut self, event: &Event) -> Result<UpsertOutcome> {
        let event = event.clone();
        let outcome = blocking(&self.conn, move |conn| upsert_row(conn, &event)).await?;
        self.upserts += 1;
        Ok(outcome)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        blocking(&this.conn, |conn| Ok(conn.execute_batch("COMMIT")?)).await?;
        this.open = false;
        debug!("Committed {} event upserts", this.upserts);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        blocking(&this.conn, |conn| Ok(conn.execute_batch("ROLLBACK")?)).await?;
        this.open = false;
        debug!("Rolled back {} event upserts", this.upserts);
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        match self.conn.lock() {
            Ok(conn) => {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!("Failed to roll back abandoned event transaction: {}", e);
                }
            }
            Err(_) => warn!("Abandoned event transaction has a poisoned connection lock"),
        }
    }
}
