// Time-series store client (TimescaleDB).
//
// The `Store` trait is the narrow interface the core depends on; `PgStore`
// is the production implementation over a shared sqlx pool.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::config::StoreConfig;
use crate::types::{LogRecord, ModelStatus, ProcessType, RunStatus};
use crate::{Result, TrellisError};

/// One bucket of the log-rate time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub timestamp: DateTime<Utc>,
    pub count: i64,
}

/// Aggregate statistics over a client's whole log history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientLogStats {
    pub total_logs: i64,
    pub first_log_time: DateTime<Utc>,
    pub last_log_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub logs_per_second: f64,
}

/// Store operations the core depends on.
#[async_trait]
pub trait Store: Send + Sync {
    /// Recent logs for a client, newest first. Bounds are unix nanoseconds.
    async fn fetch_logs(
        &self,
        client_id: &str,
        from_ns: i64,
        to_ns: i64,
        limit: i64,
    ) -> Result<Vec<LogRecord>>;

    async fn batch_insert_logs(&self, logs: &[LogRecord]) -> Result<()>;

    /// Upserts the current status row keyed by client id.
    async fn update_model_status(&self, status: &ModelStatus) -> Result<()>;

    async fn get_model_status(&self, client_id: &str) -> Result<ModelStatus>;

    async fn get_all_model_statuses(&self) -> Result<Vec<ModelStatus>>;

    async fn count_client_logs(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64>;

    async fn get_log_counts_by_level(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>>;

    async fn get_log_rate_over_time(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        buckets: u32,
    ) -> Result<Vec<TimeBucket>>;

    async fn get_client_log_stats(&self, client_id: &str) -> Result<ClientLogStats>;
}

/// TimescaleDB-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&cfg.database_url)
            .await?;
        info!(target: "store", "Store pool connected");
        Ok(Self { pool })
    }

    /// Creates the logs hypertable, the status table and indexes. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS logs (
                timestamp   TIMESTAMPTZ NOT NULL,
                client_id   TEXT NOT NULL,
                message     BYTEA NOT NULL,
                process_id  INTEGER,
                PRIMARY KEY (timestamp, client_id)
            )"#,
            r#"SELECT create_hypertable('logs', 'timestamp', if_not_exists => TRUE)"#,
            r#"CREATE TABLE IF NOT EXISTS model_status (
                client_id    TEXT PRIMARY KEY,
                status       TEXT NOT NULL,
                message      TEXT,
                timestamp    TIMESTAMPTZ NOT NULL,
                process_type TEXT NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_logs_client_id ON logs (client_id)"#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn ns_to_datetime(ns: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns)
}

fn status_row(row: &sqlx::postgres::PgRow) -> Result<ModelStatus> {
    let status: String = row.try_get("status")?;
    let process_type: String = row.try_get("process_type")?;
    Ok(ModelStatus {
        client_id: row.try_get("client_id")?,
        status: status
            .parse::<RunStatus>()
            .map_err(TrellisError::NotFound)?,
        message: row
            .try_get::<Option<String>, _>("message")?
            .unwrap_or_default(),
        timestamp: row.try_get("timestamp")?,
        process_type: process_type
            .parse::<ProcessType>()
            .map_err(TrellisError::NotFound)?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn fetch_logs(
        &self,
        client_id: &str,
        from_ns: i64,
        to_ns: i64,
        limit: i64,
    ) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, client_id, message, process_id
            FROM logs
            WHERE client_id = $1
              AND timestamp >= $2
              AND timestamp <= $3
            ORDER BY timestamp DESC
            LIMIT $4
            "#,
        )
        .bind(client_id)
        .bind(ns_to_datetime(from_ns))
        .bind(ns_to_datetime(to_ns))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut logs = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
            logs.push(LogRecord {
                timestamp: timestamp.timestamp_nanos_opt().unwrap_or_default(),
                client_id: row.try_get("client_id")?,
                message: row.try_get("message")?,
                process_id: row.try_get("process_id")?,
            });
        }
        Ok(logs)
    }

    async fn batch_insert_logs(&self, logs: &[LogRecord]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for log in logs {
            sqlx::query(
                r#"
                INSERT INTO logs (timestamp, client_id, message, process_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(ns_to_datetime(log.timestamp))
            .bind(&log.client_id)
            .bind(&log.message)
            .bind(log.process_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_model_status(&self, status: &ModelStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO model_status (client_id, status, message, timestamp, process_type)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (client_id) DO UPDATE
            SET status = $2, message = $3, timestamp = $4, process_type = $5
            "#,
        )
        .bind(&status.client_id)
        .bind(status.status.as_str())
        .bind(&status.message)
        .bind(status.timestamp)
        .bind(status.process_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_model_status(&self, client_id: &str) -> Result<ModelStatus> {
        let row = sqlx::query(
            r#"
            SELECT client_id, status, message, timestamp, process_type
            FROM model_status
            WHERE client_id = $1
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TrellisError::NotFound(format!("no status for client {client_id}")))?;

        status_row(&row)
    }

    async fn get_all_model_statuses(&self) -> Result<Vec<ModelStatus>> {
        let rows = sqlx::query(
            r#"
            SELECT client_id, status, message, timestamp, process_type
            FROM model_status
            ORDER BY timestamp DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(status_row).collect()
    }

    async fn count_client_logs(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM logs
            WHERE client_id = $1
              AND timestamp >= $2
              AND timestamp <= $3
            "#,
        )
        .bind(client_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("count")?)
    }

    async fn get_log_counts_by_level(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>> {
        // Level extraction from the opaque payload is still a placeholder:
        // every row buckets as INFO until a payload parser replaces it.
        let rows = sqlx::query(
            r#"
            WITH unpacked_logs AS (
                SELECT client_id, timestamp, 'INFO' AS level
                FROM logs
                WHERE client_id = $1
                  AND timestamp >= $2
                  AND timestamp <= $3
            )
            SELECT level, COUNT(*) AS count
            FROM unpacked_logs
            GROUP BY level
            "#,
        )
        .bind(client_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            counts.insert(row.try_get("level")?, row.try_get("count")?);
        }
        Ok(counts)
    }

    async fn get_log_rate_over_time(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        buckets: u32,
    ) -> Result<Vec<TimeBucket>> {
        let span_seconds = (to - from).num_seconds().max(0);
        let bucket_seconds = (span_seconds / i64::from(buckets.max(1))).max(1);
        let interval = format!("{bucket_seconds} seconds");

        let rows = sqlx::query(
            r#"
            SELECT time_bucket($1::interval, timestamp) AS bucket,
                   COUNT(*) AS count
            FROM logs
            WHERE client_id = $2
              AND timestamp >= $3
              AND timestamp <= $4
            GROUP BY bucket
            ORDER BY bucket
            "#,
        )
        .bind(interval)
        .bind(client_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut series = Vec::with_capacity(rows.len());
        for row in rows {
            series.push(TimeBucket {
                timestamp: row.try_get("bucket")?,
                count: row.try_get("count")?,
            });
        }
        Ok(series)
    }

    async fn get_client_log_stats(&self, client_id: &str) -> Result<ClientLogStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_logs,
                   MIN(timestamp) AS first_log,
                   MAX(timestamp) AS last_log
            FROM logs
            WHERE client_id = $1
            "#,
        )
        .bind(client_id)
        .fetch_one(&self.pool)
        .await?;

        let total_logs: i64 = row.try_get("total_logs")?;
        let first_log: Option<DateTime<Utc>> = row.try_get("first_log")?;
        let last_log: Option<DateTime<Utc>> = row.try_get("last_log")?;

        let (first_log_time, last_log_time) = match (first_log, last_log) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(TrellisError::NotFound(format!(
                    "no logs for client {client_id}"
                )))
            }
        };

        let duration_seconds = (last_log_time - first_log_time)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let logs_per_second = if duration_seconds > 0.0 {
            total_logs as f64 / duration_seconds
        } else {
            0.0
        };

        Ok(ClientLogStats {
            total_logs,
            first_log_time,
            last_log_time,
            duration_seconds,
            logs_per_second,
        })
    }
}
