use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{fs, path::Path, str::FromStr};

use shared::protocol::OutboundEmail;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// One JSON document in a record-service collection. `body["id"]` always
/// mirrors `id`.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub collection: String,
    pub id: i64,
    pub body: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredEmail {
    pub id: i64,
    pub provider: String,
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredSagaRun {
    pub run_id: String,
    pub kind: String,
    pub subject_id: i64,
    pub status: String,
    pub failed_step: Option<String>,
    pub last_error: Option<String>,
    pub context: Value,
    pub completed_steps: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const SAGA_RUNNING: &str = "running";
pub const SAGA_FAILED: &str = "failed";
pub const SAGA_COMPLETED: &str = "completed";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` opens its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn insert_record(&self, collection: &str, body: Value) -> Result<StoredRecord> {
        let Value::Object(mut fields) = body else {
            return Err(anyhow!("{collection} record body must be a JSON object"));
        };
        fields.remove("id");

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO records (collection, body, created_at, updated_at)
             VALUES (?, '{}', ?, ?)
             RETURNING id",
        )
        .bind(collection)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        fields.insert("id".into(), Value::from(id));
        let body = Value::Object(fields);
        sqlx::query("UPDATE records SET body = ? WHERE id = ?")
            .bind(body.to_string())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(StoredRecord {
            collection: collection.to_string(),
            id,
            body,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn load_record(&self, collection: &str, id: i64) -> Result<Option<StoredRecord>> {
        let row = sqlx::query(
            "SELECT id, collection, body, created_at, updated_at
             FROM records WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(record_from_row).transpose()
    }

    pub async fn list_records(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        let rows = sqlx::query(
            "SELECT id, collection, body, created_at, updated_at
             FROM records WHERE collection = ? ORDER BY id ASC",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(record_from_row).collect()
    }

    /// Records whose top-level fields equal every `(field, value)` pair, with
    /// values compared in their query-string form.
    pub async fn filter_records(
        &self,
        collection: &str,
        filters: &[(String, String)],
    ) -> Result<Vec<StoredRecord>> {
        let records = self.list_records(collection).await?;
        Ok(records
            .into_iter()
            .filter(|record| {
                filters
                    .iter()
                    .all(|(field, expected)| field_matches(&record.body, field, expected))
            })
            .collect())
    }

    /// Read-modify-write merge of top-level keys. No version check: the last
    /// writer wins.
    pub async fn merge_record(
        &self,
        collection: &str,
        id: i64,
        patch: Map<String, Value>,
    ) -> Result<Option<StoredRecord>> {
        let Some(mut record) = self.load_record(collection, id).await? else {
            return Ok(None);
        };
        if let Value::Object(fields) = &mut record.body {
            for (key, value) in patch {
                if key == "id" {
                    continue;
                }
                fields.insert(key, value);
            }
        }

        let now = Utc::now();
        sqlx::query("UPDATE records SET body = ?, updated_at = ? WHERE collection = ? AND id = ?")
            .bind(record.body.to_string())
            .bind(now)
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        record.updated_at = now;
        Ok(Some(record))
    }

    pub async fn delete_record(&self, collection: &str, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_email(&self, provider: &str, email: &OutboundEmail) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO email_outbox (provider, recipient, subject, html_body, sent_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(provider)
        .bind(&email.to)
        .bind(&email.subject)
        .bind(&email.html_body)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_outbox(&self) -> Result<Vec<StoredEmail>> {
        let rows = sqlx::query(
            "SELECT id, provider, recipient, subject, html_body, sent_at
             FROM email_outbox ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| StoredEmail {
                id: row.get("id"),
                provider: row.get("provider"),
                recipient: row.get("recipient"),
                subject: row.get("subject"),
                html_body: row.get("html_body"),
                sent_at: row.get("sent_at"),
            })
            .collect())
    }

    pub async fn create_saga_run(
        &self,
        run_id: &str,
        kind: &str,
        subject_id: i64,
        context: &Value,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO saga_runs (run_id, kind, subject_id, status, context, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(kind)
        .bind(subject_id)
        .bind(SAGA_RUNNING)
        .bind(context.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create saga run {run_id}"))?;
        Ok(())
    }

    /// Marks `step` completed and stores the context as it stood afterwards.
    /// A failed run that records a step is running again.
    pub async fn mark_saga_step(&self, run_id: &str, step: &str, context: &Value) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO saga_steps (run_id, step, completed_at) VALUES (?, ?, ?)
             ON CONFLICT(run_id, step) DO NOTHING",
        )
        .bind(run_id)
        .bind(step)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let updated = sqlx::query(
            "UPDATE saga_runs
             SET status = ?, failed_step = NULL, last_error = NULL, context = ?, updated_at = ?
             WHERE run_id = ?",
        )
        .bind(SAGA_RUNNING)
        .bind(context.to_string())
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(anyhow!("saga run {run_id} does not exist"));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn fail_saga_run(&self, run_id: &str, step: &str, error: &str) -> Result<()> {
        self.set_saga_status(run_id, SAGA_FAILED, Some(step), Some(error))
            .await
    }

    pub async fn complete_saga_run(&self, run_id: &str) -> Result<()> {
        self.set_saga_status(run_id, SAGA_COMPLETED, None, None).await
    }

    async fn set_saga_status(
        &self,
        run_id: &str,
        status: &str,
        failed_step: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE saga_runs SET status = ?, failed_step = ?, last_error = ?, updated_at = ?
             WHERE run_id = ?",
        )
        .bind(status)
        .bind(failed_step)
        .bind(last_error)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(anyhow!("saga run {run_id} does not exist"));
        }
        Ok(())
    }

    pub async fn load_saga_run(&self, run_id: &str) -> Result<Option<StoredSagaRun>> {
        let row = sqlx::query(
            "SELECT run_id, kind, subject_id, status, failed_step, last_error, context,
                    created_at, updated_at
             FROM saga_runs WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut run = saga_run_from_row(row)?;
        run.completed_steps = self.saga_steps(run_id).await?;
        Ok(Some(run))
    }

    /// Runs that are still running or failed, oldest first.
    pub async fn list_incomplete_saga_runs(&self) -> Result<Vec<StoredSagaRun>> {
        let rows = sqlx::query(
            "SELECT run_id, kind, subject_id, status, failed_step, last_error, context,
                    created_at, updated_at
             FROM saga_runs WHERE status != ? ORDER BY created_at ASC",
        )
        .bind(SAGA_COMPLETED)
        .fetch_all(&self.pool)
        .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let mut run = saga_run_from_row(row)?;
            run.completed_steps = self.saga_steps(&run.run_id).await?;
            runs.push(run);
        }
        Ok(runs)
    }

    async fn saga_steps(&self, run_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT step FROM saga_steps WHERE run_id = ? ORDER BY rowid ASC")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get::<String, _>(0)).collect())
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredRecord> {
    let raw: String = row.try_get("body")?;
    let id: i64 = row.try_get("id")?;
    Ok(StoredRecord {
        collection: row.try_get("collection")?,
        id,
        body: serde_json::from_str(&raw)
            .with_context(|| format!("record {id} holds invalid JSON"))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn saga_run_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredSagaRun> {
    let raw: String = row.try_get("context")?;
    let run_id: String = row.try_get("run_id")?;
    Ok(StoredSagaRun {
        context: serde_json::from_str(&raw)
            .with_context(|| format!("saga run {run_id} holds invalid context"))?,
        run_id,
        kind: row.try_get("kind")?,
        subject_id: row.try_get("subject_id")?,
        status: row.try_get("status")?,
        failed_step: row.try_get("failed_step")?,
        last_error: row.try_get("last_error")?,
        completed_steps: Vec::new(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn field_matches(body: &Value, field: &str, expected: &str) -> bool {
    match body.get(field) {
        Some(Value::String(actual)) => actual == expected,
        Some(Value::Null) | None => expected == "null",
        Some(other) => other.to_string() == expected,
    }
}

/// Creates the directory holding a file-backed SQLite database. In-memory
/// and non-sqlite urls are left alone.
fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let file = match database_url.strip_prefix("sqlite:") {
        Some(rest) if !rest.starts_with(":memory:") => rest.trim_start_matches("//"),
        _ => return Ok(()),
    };
    let file = file.split('?').next().unwrap_or_default();
    match Path::new(file).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir)
            .with_context(|| format!("cannot create {} for {database_url}", dir.display())),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
