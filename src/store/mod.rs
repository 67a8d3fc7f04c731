pub mod migrate;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::config::DatabaseConfig;
use crate::event::Event;

const INSERT_EVENT_SQL: &str = "INSERT INTO events \
     (session_id, event_type, track_stem, position_seconds, metadata, created_at_ms) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

/// Columns selected by every raw-event read, in [`StoredEvent::from_row`] order.
pub(crate) const EVENT_COLUMNS: &str =
    "id, session_id, event_type, track_stem, position_seconds, metadata, created_at_ms";

/// A committed event row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub session_id: String,
    pub event_type: String,
    pub track_stem: String,
    pub position_seconds: f64,
    /// Canonical JSON object text.
    pub metadata: String,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at_ms: i64 = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            event_type: row.get(2)?,
            track_stem: row.get(3)?,
            position_seconds: row.get(4)?,
            metadata: row.get(5)?,
            created_at: from_millis(created_at_ms),
        })
    }
}

/// SQLite-backed persistent store for raw events and daily rollups.
///
/// Writes go through a single connection. File-backed stores open a second
/// connection in WAL mode so read queries do not wait on the write lock.
pub struct EventStore {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
}

impl EventStore {
    /// Opens (or creates) a file-backed store and applies pending migrations.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let mut writer = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        writer
            .busy_timeout(busy_timeout)
            .context("setting busy timeout")?;
        let mode: String = writer
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("enabling WAL journal mode")?;
        tracing::debug!(journal_mode = %mode, path = %path.display(), "database opened");
        migrate::up(&mut writer).context("running migrations")?;

        let reader = Connection::open(path)
            .with_context(|| format!("opening read connection {}", path.display()))?;
        reader
            .busy_timeout(busy_timeout)
            .context("setting reader busy timeout")?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
        })
    }

    /// Opens the store described by the database configuration.
    pub fn open_with_config(cfg: &DatabaseConfig) -> Result<Self> {
        Self::open(&cfg.path, cfg.busy_timeout)
    }

    /// Opens a private in-memory store. Reads share the writer connection.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("opening in-memory database")?;
        migrate::up(&mut conn).context("running migrations")?;
        Ok(Self {
            writer: Mutex::new(conn),
            reader: None,
        })
    }

    /// Runs `f` with exclusive access to the write connection.
    pub(crate) fn with_writer<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> R {
        let mut conn = self.writer.lock();
        f(&mut conn)
    }

    /// Runs `f` against the read connection.
    pub(crate) fn with_reader<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        match &self.reader {
            Some(reader) => f(&reader.lock()),
            None => f(&self.writer.lock()),
        }
    }

    /// Commits `events` in one transaction, stamping each with `created_at`.
    ///
    /// One prepared insert is executed per event. Either every row lands or
    /// none do.
    pub fn insert_events(&self, events: &[Event], created_at: DateTime<Utc>) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let created_at_ms = created_at.timestamp_millis();
        self.with_writer(|conn| {
            let tx = conn.transaction().context("beginning insert transaction")?;
            {
                let mut stmt = tx
                    .prepare_cached(INSERT_EVENT_SQL)
                    .context("preparing event insert")?;
                for event in events {
                    stmt.execute(params![
                        event.session_id,
                        event.event_type.as_str(),
                        event.track_stem,
                        event.position_seconds,
                        event.metadata,
                        created_at_ms,
                    ])
                    .context("inserting event row")?;
                }
            }
            tx.commit().context("committing event batch")?;
            Ok(events.len())
        })
    }

    /// Total number of raw event rows.
    pub fn count_events(&self) -> Result<u64> {
        self.with_reader(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
                .context("counting events")?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
    }

    /// Total number of daily rollup rows.
    pub fn count_rollups(&self) -> Result<u64> {
        self.with_reader(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM daily_rollups", [], |row| row.get(0))
                .context("counting rollups")?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
    }
}

/// Converts stored milliseconds back into a UTC timestamp.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
