//! # Storage Module - Durable Report Queue
//!
//! A single-file sqlite database under `DATA_DIR` holds every accepted
//! report together with its upstream lifecycle (`pending` -> `sent`), plus a
//! one-row `system_state` table backing the boot-time clock correction and
//! the daily broadcast marker.
//!
//! ## Schema
//!
//! ```text
//! notes(id, queue_id, origin, created_at, lat, lon,
//!       text_original, text_normalized, status,
//!       upstream_id, upstream_url, sent_at, last_error, notified_sent)
//! system_state(id=1, boot_wallclock, time_correction_applied, last_broadcast_date)
//! ```
//!
//! `queue_id` is minted inside the insert transaction from the AUTOINCREMENT
//! row id (`Q-0001`, natural width past 9999), so ids are strictly increasing
//! and queue ids cannot collide.
//!
//! All writes are serialized behind the connection mutex; readers observe
//! committed snapshots (WAL journal mode). A database error aborts only the
//! in-flight operation.

use chrono::{DateTime, Local, NaiveTime, SecondsFormat, Utc};
use log::info;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Tumbling dedup window width in seconds.
pub const DEDUP_BUCKET_SECONDS: i64 = 120;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("report {0} not found")]
    NotFound(String),
    #[error("report {0} is not pending")]
    NotPending(String),
    #[error("invalid timestamp in store: {0}")]
    BadTimestamp(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Pending,
    Sent,
}

/// One persisted report row.
#[derive(Debug, Clone)]
pub struct Report {
    pub id: i64,
    pub queue_id: String,
    pub origin: String,
    pub created_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub text_original: String,
    pub text_normalized: String,
    pub status: ReportStatus,
    pub upstream_id: Option<i64>,
    pub upstream_url: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub notified_sent: bool,
}

/// Per-origin counters for `#osmcount` / `#osmqueue` / `#osmstatus`.
#[derive(Debug, Clone, Copy)]
pub struct NodeStats {
    pub total: u64,
    pub today: u64,
    pub queue: u64,
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const REPORT_COLUMNS: &str = "id, queue_id, origin, created_at, lat, lon, \
     text_original, text_normalized, status, upstream_id, upstream_url, \
     sent_at, last_error, notified_sent";

impl Store {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL keeps readers unblocked during the worker's write bursts.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_id TEXT UNIQUE NOT NULL,
                origin TEXT NOT NULL,
                created_at TEXT NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                text_original TEXT NOT NULL,
                text_normalized TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                upstream_id INTEGER,
                upstream_url TEXT,
                sent_at TEXT,
                last_error TEXT,
                notified_sent INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_notes_origin ON notes(origin);
            CREATE INDEX IF NOT EXISTS idx_notes_status ON notes(status);
            CREATE INDEX IF NOT EXISTS idx_notes_created_at ON notes(created_at);
            CREATE INDEX IF NOT EXISTS idx_notes_origin_created ON notes(origin, created_at);
            CREATE TABLE IF NOT EXISTS system_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                boot_wallclock TEXT,
                time_correction_applied INTEGER NOT NULL DEFAULT 0,
                last_broadcast_date TEXT
            );
            INSERT OR IGNORE INTO system_state (id) VALUES (1);
            "#,
        )?;
        info!("store initialized at {}", path.display());
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist a freshly accepted report and return its minted queue id.
    pub fn append(
        &self,
        origin: &str,
        lat: f64,
        lon: f64,
        text_original: &str,
        text_normalized: &str,
        created_at: DateTime<Utc>,
    ) -> StoreResult<String> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO notes (queue_id, origin, created_at, lat, lon, \
             text_original, text_normalized, status) \
             VALUES ('', ?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
            params![
                origin,
                encode_ts(&created_at),
                lat,
                lon,
                text_original,
                text_normalized
            ],
        )?;
        let id = tx.last_insert_rowid();
        let queue_id = format_queue_id(id);
        tx.execute(
            "UPDATE notes SET queue_id = ?1 WHERE id = ?2",
            params![queue_id, id],
        )?;
        tx.commit()?;
        info!("store: created {} for {}", queue_id, origin);
        Ok(queue_id)
    }

    /// Transition a report PENDING -> SENT with its upstream identity.
    pub fn mark_sent(
        &self,
        queue_id: &str,
        upstream_id: i64,
        upstream_url: &str,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE notes SET status = 'sent', upstream_id = ?1, upstream_url = ?2, \
             sent_at = ?3 WHERE queue_id = ?4 AND status = 'pending'",
            params![upstream_id, upstream_url, encode_ts(&sent_at), queue_id],
        )?;
        if changed == 0 {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM notes WHERE queue_id = ?1",
                [queue_id],
                |row| row.get(0),
            )?;
            return Err(if exists > 0 {
                StoreError::NotPending(queue_id.to_string())
            } else {
                StoreError::NotFound(queue_id.to_string())
            });
        }
        info!("store: {} marked sent (upstream #{})", queue_id, upstream_id);
        Ok(())
    }

    /// Record the last transient/permanent error tag without a state change.
    pub fn record_error(&self, queue_id: &str, tag: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE notes SET last_error = ?1 WHERE queue_id = ?2",
            params![tag, queue_id],
        )?;
        Ok(())
    }

    /// Dedup probe: any row with the same origin, normalized text, rounded
    /// coordinates, and 120 s time bucket?
    pub fn check_duplicate(
        &self,
        origin: &str,
        text_normalized: &str,
        lat_rounded: f64,
        lon_rounded: f64,
        bucket: i64,
    ) -> StoreResult<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notes \
             WHERE origin = ?1 AND text_normalized = ?2 \
               AND ROUND(lat, 4) = ?3 AND ROUND(lon, 4) = ?4 \
               AND CAST(strftime('%s', created_at) AS INTEGER) / ?5 = ?6",
            params![
                origin,
                text_normalized,
                lat_rounded,
                lon_rounded,
                DEDUP_BUCKET_SECONDS,
                bucket
            ],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Oldest-first page of pending reports for the flush worker.
    pub fn pending_page(&self, limit: u32) -> StoreResult<Vec<Report>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM notes WHERE status = 'pending' \
             ORDER BY created_at ASC, id ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit], report_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Pending reports created strictly before `cutoff` (skew-correction set).
    pub fn pending_created_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Report>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM notes \
             WHERE status = 'pending' AND created_at < ?1 \
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([encode_ts(&cutoff)], report_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Shift `created_at` of the named rows by `delta`, atomically. Returns
    /// the number of rows updated. SENT rows are never touched.
    pub fn shift_created_at(&self, ids: &[i64], delta: chrono::Duration) -> StoreResult<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut shifted = 0usize;
        for &id in ids {
            let current: Option<String> = tx
                .query_row(
                    "SELECT created_at FROM notes WHERE id = ?1 AND status = 'pending'",
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = current else { continue };
            let parsed = decode_ts(&raw)?;
            tx.execute(
                "UPDATE notes SET created_at = ?1 WHERE id = ?2",
                params![encode_ts(&(parsed + delta)), id],
            )?;
            shifted += 1;
        }
        tx.commit()?;
        if shifted > 0 {
            info!(
                "store: shifted created_at of {} pending rows by {}s",
                shifted,
                delta.num_seconds()
            );
        }
        Ok(shifted)
    }

    pub fn get_by_queue_id(&self, queue_id: &str) -> StoreResult<Option<Report>> {
        let conn = self.lock();
        let report = conn
            .query_row(
                &format!("SELECT {REPORT_COLUMNS} FROM notes WHERE queue_id = ?1"),
                [queue_id],
                report_from_row,
            )
            .optional()?;
        Ok(report)
    }

    /// SENT rows that still owe their origin a promotion announcement.
    pub fn unannounced_sent(&self) -> StoreResult<Vec<Report>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM notes \
             WHERE status = 'sent' AND notified_sent = 0 \
             ORDER BY sent_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], report_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn mark_announced(&self, queue_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE notes SET notified_sent = 1 WHERE queue_id = ?1",
            [queue_id],
        )?;
        Ok(())
    }

    /// Counters for one origin. "Today" is bounded by local midnight (`TZ`).
    pub fn node_stats(&self, origin: &str) -> StoreResult<NodeStats> {
        let conn = self.lock();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE origin = ?1",
            [origin],
            |row| row.get(0),
        )?;
        let today: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE origin = ?1 AND created_at >= ?2",
            params![origin, encode_ts(&local_midnight_utc())],
            |row| row.get(0),
        )?;
        let queue: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE origin = ?1 AND status = 'pending'",
            [origin],
            |row| row.get(0),
        )?;
        Ok(NodeStats {
            total: total as u64,
            today: today as u64,
            queue: queue as u64,
        })
    }

    /// Most recent reports for one origin, newest first.
    pub fn recent_notes(&self, origin: &str, limit: u32) -> StoreResult<Vec<Report>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM notes WHERE origin = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![origin, limit], report_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn total_queue_size(&self) -> StoreResult<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn total_sent(&self) -> StoreResult<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE status = 'sent'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// SENT count for one origin; drives the privacy-suffix cadence.
    pub fn sent_count(&self, origin: &str) -> StoreResult<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE origin = ?1 AND status = 'sent'",
            [origin],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // --- system_state -----------------------------------------------------

    /// Record boot wall-clock and re-arm the one-shot clock correction.
    pub fn record_boot(&self, boot_wallclock: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE system_state SET boot_wallclock = ?1, time_correction_applied = 0 \
             WHERE id = 1",
            [encode_ts(&boot_wallclock)],
        )?;
        Ok(())
    }

    pub fn boot_wallclock(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let raw: Option<String> =
            conn.query_row("SELECT boot_wallclock FROM system_state WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        match raw {
            Some(s) => Ok(Some(decode_ts(&s)?)),
            None => Ok(None),
        }
    }

    pub fn time_correction_applied(&self) -> StoreResult<bool> {
        let conn = self.lock();
        let flag: i64 = conn.query_row(
            "SELECT time_correction_applied FROM system_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(flag != 0)
    }

    pub fn set_time_correction_applied(&self, applied: bool) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE system_state SET time_correction_applied = ?1 WHERE id = 1",
            [applied as i64],
        )?;
        Ok(())
    }

    pub fn last_broadcast_date(&self) -> StoreResult<Option<String>> {
        let conn = self.lock();
        let date: Option<String> = conn.query_row(
            "SELECT last_broadcast_date FROM system_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(date)
    }

    pub fn set_last_broadcast_date(&self, date: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE system_state SET last_broadcast_date = ?1 WHERE id = 1",
            [date],
        )?;
        Ok(())
    }
}

/// `Q-NNNN`: zero-padded to width 4, natural width beyond 9999.
fn format_queue_id(id: i64) -> String {
    format!("Q-{:04}", id)
}

fn encode_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::BadTimestamp(raw.to_string()))
}

/// Start of the local calendar day, in UTC, honoring the `TZ` environment.
fn local_midnight_utc() -> DateTime<Utc> {
    let midnight = Local::now().date_naive().and_time(NaiveTime::MIN);
    match midnight.and_local_timezone(Local) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // A DST gap exactly at midnight; degrade to the current instant.
        chrono::LocalResult::None => Utc::now(),
    }
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<Report> {
    let created_raw: String = row.get(3)?;
    let created_at = parse_ts_sql(&created_raw, 3)?;
    let status_raw: String = row.get(8)?;
    let status = match status_raw.as_str() {
        "pending" => ReportStatus::Pending,
        "sent" => ReportStatus::Sent,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                8,
                Type::Text,
                format!("unknown status '{other}'").into(),
            ))
        }
    };
    let sent_raw: Option<String> = row.get(11)?;
    let sent_at = match sent_raw {
        Some(s) => Some(parse_ts_sql(&s, 11)?),
        None => None,
    };
    let notified: i64 = row.get(13)?;
    Ok(Report {
        id: row.get(0)?,
        queue_id: row.get(1)?,
        origin: row.get(2)?,
        created_at,
        lat: row.get(4)?,
        lon: row.get(5)?,
        text_original: row.get(6)?,
        text_normalized: row.get(7)?,
        status,
        upstream_id: row.get(9)?,
        upstream_url: row.get(10)?,
        sent_at,
        last_error: row.get(12)?,
        notified_sent: notified != 0,
    })
}

fn parse_ts_sql(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}
