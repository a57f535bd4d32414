//! SQLite-backed plugin ledger.
//!
//! One row per `scriptID`, upserted idempotently. The pool is opened in
//! WAL mode with a 5s busy timeout so concurrent plugin runs don't
//! serialize excessively, per the concurrency policy — each operation here
//! is a single-statement upsert/select, no multi-statement transactions are
//! needed.

use std::str::FromStr;

use async_trait::async_trait;
use gpud_core::{GpudError, LedgerEntry, PluginLedger, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// Default table name used when the caller doesn't override it.
pub const DEFAULT_TABLE_NAME: &str = "plugin_ledger";

pub struct SqliteLedger {
    pool: SqlitePool,
    table: String,
}

impl SqliteLedger {
    /// Open (creating if absent) a SQLite database at `path`, configure it
    /// for WAL mode with a 5s busy timeout, and ensure the ledger table
    /// exists.
    pub async fn open(path: &str, table_name: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| GpudError::Fatal(format!("invalid ledger path {path}: {e}")))?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| GpudError::Fatal(format!("failed to open plugin ledger: {e}")))?;

        let ledger = Self {
            pool,
            table: table_name.to_string(),
        };
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                script_hash TEXT PRIMARY KEY,
                last_started_unix_seconds INTEGER,
                script_name TEXT,
                last_exit_code INTEGER,
                last_output TEXT
            )",
            self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| GpudError::Fatal(format!("failed to create plugin ledger table: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl PluginLedger for SqliteLedger {
    async fn get(&self, script_id: &str) -> Result<Option<LedgerEntry>> {
        let query = format!(
            "SELECT last_started_unix_seconds, script_name, last_exit_code, last_output
             FROM {} WHERE script_hash = ?",
            self.table
        );
        let row = sqlx::query(&query)
            .bind(script_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| GpudError::Fatal(format!("ledger get failed: {e}")))?;

        Ok(row.map(|row| LedgerEntry {
            last_started_unix_seconds: row.get::<Option<i64>, _>("last_started_unix_seconds"),
            script_name: row.get::<Option<String>, _>("script_name"),
            last_exit_code: row.get::<Option<i64>, _>("last_exit_code").map(|v| v as i32),
            last_output: row.get::<Option<String>, _>("last_output"),
        }))
    }

    async fn record_start(&self, script_id: &str, script_name: &str, started_unix_seconds: i64) -> Result<()> {
        let query = format!(
            "INSERT INTO {table} (script_hash, last_started_unix_seconds, script_name)
             VALUES (?, ?, ?)
             ON CONFLICT(script_hash) DO UPDATE SET
                last_started_unix_seconds = excluded.last_started_unix_seconds,
                script_name = excluded.script_name",
            table = self.table
        );
        let result = sqlx::query(&query)
            .bind(script_id)
            .bind(started_unix_seconds)
            .bind(script_name)
            .execute(&self.pool)
            .await
            .map_err(|e| GpudError::Fatal(format!("ledger record_start failed: {e}")))?;

        if result.rows_affected() == 0 {
            debug!(script_id, "ledger upsert affected zero rows, falling back to insert");
            let insert = format!(
                "INSERT OR REPLACE INTO {table} (script_hash, last_started_unix_seconds, script_name)
                 VALUES (?, ?, ?)",
                table = self.table
            );
            sqlx::query(&insert)
                .bind(script_id)
                .bind(started_unix_seconds)
                .bind(script_name)
                .execute(&self.pool)
                .await
                .map_err(|e| GpudError::Fatal(format!("ledger fallback insert failed: {e}")))?;
        }
        Ok(())
    }

    async fn update_exit_code(&self, script_id: &str, exit_code: i32) -> Result<()> {
        let query = format!(
            "UPDATE {table} SET last_exit_code = ? WHERE script_hash = ?",
            table = self.table
        );
        let result = sqlx::query(&query)
            .bind(i64::from(exit_code))
            .bind(script_id)
            .execute(&self.pool)
            .await
            .map_err(|e| GpudError::Fatal(format!("ledger update_exit_code failed: {e}")))?;

        if result.rows_affected() == 0 {
            let insert = format!(
                "INSERT OR REPLACE INTO {table} (script_hash, last_exit_code) VALUES (?, ?)",
                table = self.table
            );
            sqlx::query(&insert)
                .bind(script_id)
                .bind(i64::from(exit_code))
                .execute(&self.pool)
                .await
                .map_err(|e| GpudError::Fatal(format!("ledger fallback insert failed: {e}")))?;
        }
        Ok(())
    }

    async fn update_output(&self, script_id: &str, output: &str) -> Result<()> {
        let query = format!(
            "UPDATE {table} SET last_output = ? WHERE script_hash = ?",
            table = self.table
        );
        let result = sqlx::query(&query)
            .bind(output)
            .bind(script_id)
            .execute(&self.pool)
            .await
            .map_err(|e| GpudError::Fatal(format!("ledger update_output failed: {e}")))?;

        if result.rows_affected() == 0 {
            let insert = format!(
                "INSERT OR REPLACE INTO {table} (script_hash, last_output) VALUES (?, ?)",
                table = self.table
            );
            sqlx::query(&insert)
                .bind(script_id)
                .bind(output)
                .execute(&self.pool)
                .await
                .map_err(|e| GpudError::Fatal(format!("ledger fallback insert failed: {e}")))?;
        }
        Ok(())
    }
}
