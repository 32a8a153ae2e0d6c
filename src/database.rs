use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::baseline::{BaselineSnapshot, BaselineValue};
use crate::error::DatabaseError;
use crate::models::MetricKind;
use crate::recovery::RecoveryScoreResult;

/// Clock-baseline row names
const BEDTIME_KEY: &str = "bedtime";
const WAKE_KEY: &str = "wake";

/// Persisted per-date score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredScore {
    pub date: NaiveDate,
    pub recovery_score: u8,
    pub sleep_score: Option<u8>,

    /// Serialized result the score was taken from
    pub payload: serde_json::Value,

    pub computed_at: NaiveDateTime,
}

impl StoredScore {
    /// Row for a computed Recovery Score, carrying its sleep component
    pub fn from_recovery(result: &RecoveryScoreResult, computed_at: NaiveDateTime) -> Result<Self, DatabaseError> {
        Ok(Self {
            date: result.date,
            recovery_score: result.final_score,
            sleep_score: result.details.sleep_score,
            payload: serde_json::to_value(result)?,
            computed_at,
        })
    }
}

/// SQLite-backed store for baselines, migration flags, and per-date scores
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create or open a database at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, DatabaseError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    /// Private database living only as long as the handle
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DatabaseError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS baselines (
                metric TEXT NOT NULL,
                window_days INTEGER NOT NULL,
                value REAL NOT NULL,
                reference_date DATE NOT NULL,
                PRIMARY KEY (metric, window_days)
            );

            CREATE TABLE IF NOT EXISTS clock_baselines (
                name TEXT PRIMARY KEY,
                minutes REAL NOT NULL,
                reference_date DATE NOT NULL
            );

            CREATE TABLE IF NOT EXISTS app_flags (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_scores (
                date DATE PRIMARY KEY,
                recovery_score INTEGER NOT NULL,
                sleep_score INTEGER,
                payload TEXT NOT NULL,
                computed_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_daily_scores_computed ON daily_scores(computed_at);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Baselines
    // ------------------------------------------------------------------

    /// Replace every persisted baseline with the snapshot's values
    pub fn save_baselines(&self, snapshot: &BaselineSnapshot) -> Result<(), DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM baselines", [])?;
        tx.execute("DELETE FROM clock_baselines", [])?;

        for value in &snapshot.values {
            tx.execute(
                "INSERT INTO baselines (metric, window_days, value, reference_date) VALUES (?1, ?2, ?3, ?4)",
                params![
                    value.metric.as_str(),
                    value.window_days,
                    value.value,
                    snapshot.reference_date
                ],
            )?;
        }

        for (name, minutes) in [
            (BEDTIME_KEY, snapshot.bedtime_minutes),
            (WAKE_KEY, snapshot.wake_minutes),
        ] {
            if let Some(minutes) = minutes {
                tx.execute(
                    "INSERT INTO clock_baselines (name, minutes, reference_date) VALUES (?1, ?2, ?3)",
                    params![name, minutes, snapshot.reference_date],
                )?;
            }
        }

        tx.commit()?;
        debug!(
            reference_date = %snapshot.reference_date,
            values = snapshot.values.len(),
            "Baselines persisted"
        );
        Ok(())
    }

    /// Load the persisted baseline snapshot, if any was saved
    pub fn load_baselines(&self) -> Result<Option<BaselineSnapshot>, DatabaseError> {
        let conn = self.conn()?;

        let mut stmt =
            conn.prepare("SELECT metric, window_days, value, reference_date FROM baselines ORDER BY metric, window_days")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, NaiveDate>(3)?,
            ))
        })?;

        let mut reference_date: Option<NaiveDate> = None;
        let mut values = Vec::new();
        for row in rows {
            let (metric, window_days, value, date) = row?;
            let metric: MetricKind = metric.parse().map_err(DatabaseError::Malformed)?;
            reference_date = Some(reference_date.map_or(date, |d| d.max(date)));
            values.push(BaselineValue {
                metric,
                window_days,
                value,
            });
        }

        let mut stmt = conn.prepare("SELECT name, minutes, reference_date FROM clock_baselines")?;
        let clocks = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, NaiveDate>(2)?,
            ))
        })?;

        let mut bedtime_minutes = None;
        let mut wake_minutes = None;
        for row in clocks {
            let (name, minutes, date) = row?;
            reference_date = Some(reference_date.map_or(date, |d| d.max(date)));
            match name.as_str() {
                BEDTIME_KEY => bedtime_minutes = Some(minutes),
                WAKE_KEY => wake_minutes = Some(minutes),
                other => return Err(DatabaseError::Malformed(format!("unknown clock baseline {}", other))),
            }
        }

        Ok(reference_date.map(|reference_date| BaselineSnapshot {
            reference_date,
            values,
            bedtime_minutes,
            wake_minutes,
        }))
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    /// Read a boolean flag; unset flags read as false
    pub fn get_flag(&self, key: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        let value: Option<i64> = conn
            .query_row("SELECT value FROM app_flags WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value.unwrap_or(0) != 0)
    }

    pub fn set_flag(&self, key: &str, value: bool) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO app_flags (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value as i64],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Daily scores
    // ------------------------------------------------------------------

    /// Insert or overwrite the score for its date
    pub fn store_score(&self, score: &StoredScore) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&score.payload)?;
        conn.execute(
            "INSERT OR REPLACE INTO daily_scores (date, recovery_score, sleep_score, payload, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                score.date,
                score.recovery_score,
                score.sleep_score,
                payload,
                score.computed_at
            ],
        )?;
        Ok(())
    }

    pub fn load_score(&self, date: NaiveDate) -> Result<Option<StoredScore>, DatabaseError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT date, recovery_score, sleep_score, payload, computed_at
                 FROM daily_scores WHERE date = ?1",
                params![date],
                Self::raw_score,
            )
            .optional()?;
        row.map(Self::decode_score).transpose()
    }

    /// Delete the score for a date; returns whether one existed
    pub fn delete_score(&self, date: NaiveDate) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM daily_scores WHERE date = ?1", params![date])?;
        Ok(deleted > 0)
    }

    /// Scores with dates in `[first, last]`, oldest first
    pub fn load_scores_between(&self, first: NaiveDate, last: NaiveDate) -> Result<Vec<StoredScore>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT date, recovery_score, sleep_score, payload, computed_at
             FROM daily_scores WHERE date >= ?1 AND date <= ?2 ORDER BY date",
        )?;
        let rows = stmt.query_map(params![first, last], Self::raw_score)?;

        let mut scores = Vec::new();
        for row in rows {
            scores.push(Self::decode_score(row?)?);
        }
        Ok(scores)
    }

    fn raw_score(row: &Row) -> rusqlite::Result<RawScoreRow> {
        Ok(RawScoreRow {
            date: row.get(0)?,
            recovery_score: row.get(1)?,
            sleep_score: row.get(2)?,
            payload: row.get(3)?,
            computed_at: row.get(4)?,
        })
    }

    fn decode_score(row: RawScoreRow) -> Result<StoredScore, DatabaseError> {
        Ok(StoredScore {
            date: row.date,
            recovery_score: row.recovery_score,
            sleep_score: row.sleep_score,
            payload: serde_json::from_str(&row.payload)?,
            computed_at: row.computed_at,
        })
    }
}

struct RawScoreRow {
    date: NaiveDate,
    recovery_score: u8,
    sleep_score: Option<u8>,
    payload: String,
    computed_at: NaiveDateTime,
}
