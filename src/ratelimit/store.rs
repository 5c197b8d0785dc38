use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use super::RateLimitEstimate;

/// SQLite persistence for learned rate-limit state.
///
/// Two tables: `rate_limit_estimates` (one row per engine, upserted) and
/// `rate_limit_attempts` (append-only training log, cleaned up beyond N
/// days). All callers treat this store as best-effort — a failed operation is
/// logged and the in-memory path continues.
pub struct RateLimitStore {
    conn: Mutex<Connection>,
}

impl RateLimitStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rate_limit_estimates (
                engine        TEXT PRIMARY KEY,
                base_wait     REAL NOT NULL,
                min_wait      REAL NOT NULL,
                max_wait      REAL NOT NULL,
                last_updated  REAL NOT NULL,
                total_attempts INTEGER NOT NULL DEFAULT 0,
                success_rate  REAL NOT NULL DEFAULT 0.0
            );
            CREATE TABLE IF NOT EXISTS rate_limit_attempts (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                engine      TEXT NOT NULL,
                timestamp   REAL NOT NULL,
                wait_time   REAL NOT NULL,
                retry_count INTEGER NOT NULL,
                success     INTEGER NOT NULL,
                error_kind  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_engine_ts
                ON rate_limit_attempts (engine, timestamp);",
        )
    }

    pub fn load_estimates(&self) -> rusqlite::Result<Vec<RateLimitEstimate>> {
        let conn = self.conn.lock().expect("rate limit store poisoned");
        let mut stmt = conn.prepare(
            "SELECT engine, base_wait, min_wait, max_wait, last_updated,
                    total_attempts, success_rate
             FROM rate_limit_estimates ORDER BY engine",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RateLimitEstimate {
                engine: row.get(0)?,
                base_wait: row.get(1)?,
                min_wait: row.get(2)?,
                max_wait: row.get(3)?,
                last_updated: row.get(4)?,
                total_attempts: row.get::<_, i64>(5)? as usize,
                success_rate: row.get(6)?,
                confidence: 0.0,
            })
        })?;
        rows.collect()
    }

    pub fn load_estimate(&self, engine: &str) -> rusqlite::Result<Option<RateLimitEstimate>> {
        Ok(self
            .load_estimates()?
            .into_iter()
            .find(|e| e.engine == engine))
    }

    pub fn upsert_estimate(&self, est: &RateLimitEstimate) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("rate limit store poisoned");
        conn.execute(
            "INSERT INTO rate_limit_estimates
                (engine, base_wait, min_wait, max_wait, last_updated, total_attempts, success_rate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(engine) DO UPDATE SET
                base_wait = excluded.base_wait,
                min_wait = excluded.min_wait,
                max_wait = excluded.max_wait,
                last_updated = excluded.last_updated,
                total_attempts = excluded.total_attempts,
                success_rate = excluded.success_rate",
            params![
                est.engine,
                est.base_wait,
                est.min_wait,
                est.max_wait,
                est.last_updated,
                est.total_attempts as i64,
                est.success_rate,
            ],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_attempt(
        &self,
        engine: &str,
        timestamp: f64,
        wait_time: f64,
        retry_count: usize,
        success: bool,
        error_kind: Option<&str>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("rate limit store poisoned");
        conn.execute(
            "INSERT INTO rate_limit_attempts
                (engine, timestamp, wait_time, retry_count, success, error_kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                engine,
                timestamp,
                wait_time,
                retry_count as i64,
                success as i64,
                error_kind,
            ],
        )?;
        Ok(())
    }

    /// Remove all persisted state for one engine (estimate + attempts).
    pub fn delete_engine(&self, engine: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("rate limit store poisoned");
        conn.execute(
            "DELETE FROM rate_limit_attempts WHERE engine = ?1",
            params![engine],
        )?;
        conn.execute(
            "DELETE FROM rate_limit_estimates WHERE engine = ?1",
            params![engine],
        )?;
        Ok(())
    }

    /// Delete attempts older than `cutoff` (unix seconds). Returns the number
    /// of rows removed.
    pub fn cleanup_attempts(&self, cutoff: f64) -> rusqlite::Result<usize> {
        let conn = self.conn.lock().expect("rate limit store poisoned");
        let deleted = conn.execute(
            "DELETE FROM rate_limit_attempts WHERE timestamp < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    pub fn attempt_count(&self, engine: &str) -> rusqlite::Result<usize> {
        let conn = self.conn.lock().expect("rate limit store poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rate_limit_attempts WHERE engine = ?1",
            params![engine],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
