use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::engine::{EvaluationResult, PlantSnapshot, Status};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One row of a plant's evaluation history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRecord {
    pub id: i64,
    pub ts: i64, // unix seconds
    pub plant_id: String,
    pub source: String,
    pub result: String,
    pub status: String,
    pub moisture: Option<f32>,
}

fn status_str(status: Status) -> &'static str {
    match status {
        Status::Ok => "ok",
        Status::Problem => "problem",
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/plants/plants.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let in_memory = db_url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `:memory:` is its own database.
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Engine snapshots
    // ----------------------------

    pub async fn save_snapshot(&self, snapshot: &PlantSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("serialize snapshot failed")?;
        sqlx::query(
            r#"
            INSERT INTO plant_state (plant_id, snapshot, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(plant_id) DO UPDATE SET
              snapshot=excluded.snapshot,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(snapshot.plant_id.as_str())
        .bind(json)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await
        .context("save_snapshot failed")?;
        Ok(())
    }

    /// `Ok(None)` when nothing was ever stored for the plant. A row that no
    /// longer parses is an error; the caller decides whether to start fresh.
    pub async fn load_snapshot(&self, plant_id: &str) -> Result<Option<PlantSnapshot>> {
        let row = sqlx::query("SELECT snapshot FROM plant_state WHERE plant_id = ?")
            .bind(plant_id)
            .fetch_optional(&self.pool)
            .await
            .context("load_snapshot failed")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let json: String = row.try_get("snapshot").context("load_snapshot: bad row")?;
        let snapshot = serde_json::from_str(&json)
            .with_context(|| format!("stored snapshot for '{plant_id}' is corrupt"))?;
        Ok(Some(snapshot))
    }

    // ----------------------------
    // Evaluation history
    // ----------------------------

    pub async fn insert_evaluation(
        &self,
        ts: i64,
        plant_id: &str,
        source: &str,
        result: EvaluationResult,
        status: Status,
        moisture: Option<f32>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO evaluations (ts, plant_id, source, result, status, moisture)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(plant_id)
        .bind(source)
        .bind(result.as_str())
        .bind(status_str(status))
        .bind(moisture.map(f64::from))
        .execute(&self.pool)
        .await
        .context("insert_evaluation failed")?;
        Ok(())
    }

    /// Drop history rows stamped before `before_ts`. Returns rows removed.
    pub async fn prune_evaluations(&self, before_ts: i64) -> Result<u64> {
        let done = sqlx::query("DELETE FROM evaluations WHERE ts < ?")
            .bind(before_ts)
            .execute(&self.pool)
            .await
            .context("prune_evaluations failed")?;
        Ok(done.rows_affected())
    }

    /// Newest first.
    pub async fn recent_evaluations(
        &self,
        plant_id: &str,
        limit: i64,
    ) -> Result<Vec<EvaluationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ts, plant_id, source, result, status, moisture
            FROM evaluations
            WHERE plant_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(plant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_evaluations failed")?;

        rows.into_iter()
            .map(|r| -> Result<EvaluationRecord, sqlx::Error> {
                let moisture: Option<f64> = r.try_get("moisture")?;
                Ok(EvaluationRecord {
                    id: r.try_get("id")?,
                    ts: r.try_get("ts")?,
                    plant_id: r.try_get("plant_id")?,
                    source: r.try_get("source")?,
                    result: r.try_get("result")?,
                    status: r.try_get("status")?,
                    moisture: moisture.map(|m| m as f32),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .context("recent_evaluations: bad row")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
