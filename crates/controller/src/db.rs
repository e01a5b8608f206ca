use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use thiserror::Error;
use time::OffsetDateTime;

use crate::aggregate::AggregatedReading;

/// Flat attribute records, keyed like `rain.last_rain_ts` or
/// `schedule.mon.zone1.start_hours`.  Ordered so persisted batches and
/// test fixtures are deterministic.
pub type Records = BTreeMap<String, String>;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// A persisted record that is absent or does not decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("missing record '{0}'")]
    Missing(String),
    #[error("malformed record '{key}' = {value:?}")]
    Malformed { key: String, value: String },
}

/// Decode one attribute from a record set.
pub fn field<T: FromStr>(records: &Records, key: &str) -> Result<T, RecordError> {
    let value = records
        .get(key)
        .ok_or_else(|| RecordError::Missing(key.to_string()))?;
    value.parse().map_err(|_| RecordError::Malformed {
        key: key.to_string(),
        value: value.clone(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneEvent {
    pub ts: i64,
    /// 1-based zone number, as shown to operators.
    pub zone: i64,
    pub active: bool,
    pub cause: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every pooled connection to ":memory:" is a separate database, so
        // pin in-memory stores to one connection that never expires.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
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
    // Key/value records
    // ----------------------------

    pub async fn persist(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("persist '{key}' failed"))?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn load(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("load '{key}' failed"))?;
        Ok(row.map(|(v,)| v))
    }

    /// Write a whole record set atomically, so a reader never sees half of
    /// a schedule.
    pub async fn persist_records(&self, records: &Records) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut tx = self.pool.begin().await.context("begin failed")?;
        for (key, value) in records {
            sqlx::query(
                r#"
                INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                  value=excluded.value,
                  updated_at=excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("persist '{key}' failed"))?;
        }
        tx.commit().await.context("commit failed")?;
        Ok(())
    }

    /// All records whose key starts with `prefix`.
    pub async fn load_prefix(&self, prefix: &str) -> Result<Records> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT key, value FROM kv
            WHERE substr(key, 1, length(?)) = ?
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("load_prefix '{prefix}' failed"))?;
        Ok(rows.into_iter().collect())
    }

    // ----------------------------
    // Reading history
    // ----------------------------

    pub async fn insert_reading(&self, ts: i64, r: &AggregatedReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (
              ts, air_temperature_c, humidity_pct, pressure_hpa,
              soil_temperature_c, soil_moisture_pct, rain
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(r.air_temperature_c)
        .bind(r.humidity_pct)
        .bind(r.pressure_hpa)
        .bind(r.soil_temperature_c)
        .bind(r.soil_moisture_pct)
        .bind(r.rain)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn count_readings(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await
            .context("count_readings failed")?;
        Ok(n)
    }

    // ----------------------------
    // Zone transitions
    // ----------------------------

    /// `zone` is the 0-based index; stored 1-based.
    pub async fn insert_zone_event(
        &self,
        ts: i64,
        zone: usize,
        active: bool,
        cause: &str,
    ) -> Result<()> {
        sqlx::query("INSERT INTO zone_events (ts, zone, active, cause) VALUES (?, ?, ?, ?)")
            .bind(ts)
            .bind(zone as i64 + 1)
            .bind(active)
            .bind(cause)
            .execute(&self.pool)
            .await
            .context("insert_zone_event failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_zone_events(&self, limit: i64) -> Result<Vec<ZoneEvent>> {
        let rows: Vec<(i64, i64, bool, String)> = sqlx::query_as(
            r#"
            SELECT ts, zone, active, cause
            FROM zone_events
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_zone_events failed")?;

        Ok(rows
            .into_iter()
            .map(|(ts, zone, active, cause)| ZoneEvent {
                ts,
                zone,
                active,
                cause,
            })
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
