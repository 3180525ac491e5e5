//! Persistence adapter over Postgres.
//!
//! Domains and sessions have uniqueness and state constraints, so they go
//! through row-level statements (sessions inside one transaction per
//! event); events are append-only and written with a single array-based
//! bulk insert.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use metrics::histogram;
use rand::Rng;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::event::Event;
use crate::metrics_consts::{INGEST_LATENCY, WORKER_LATENCY};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub(crate) const UPSERT_DOMAIN_SQL: &str = r#"
INSERT INTO domains (name) VALUES ($1)
ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
RETURNING id"#;

pub(crate) const GET_SESSION_SQL: &str = r#"
SELECT id FROM sessions
WHERE visitor_id = $1 AND updated_at > now() - $2
ORDER BY updated_at DESC
LIMIT 1"#;

// A session stays a bounce only while every follow-up event is a ping.
pub(crate) const UPDATE_SESSION_SQL: &str = r#"
UPDATE sessions
SET exit_path = $2,
    updated_at = now(),
    duration = now() - created_at,
    bounce = bounce AND $3 = 'ping'
WHERE id = $1"#;

pub(crate) const CREATE_SESSION_SQL: &str = r#"
INSERT INTO sessions (
    domain_id, visitor_id, entry_path, exit_path,
    country, latitude, longitude, subdivision, city,
    browser, browser_version, os, os_version, platform, device_type, bot,
    screen_w, screen_h, timezone, pixel_ratio, pixel_depth,
    utm_source, utm_medium, utm_campaign, utm_content, utm_term
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26
)
RETURNING id"#;

pub(crate) const CREATE_EVENTS_SQL: &str = r#"
INSERT INTO events (domain_id, session_id, visitor_id, name, path, referrer, load_time, ttfb)
    (SELECT * FROM UNNEST(
        $1::int[],
        $2::bigint[],
        $3::text[],
        $4::text[],
        $5::text[],
        $6::text[],
        $7::int[],
        $8::int[]))"#;

pub(crate) const PRUNE_EVENTS_SQL: &str = "DELETE FROM events WHERE created < now() - $1";
pub(crate) const PRUNE_SESSIONS_SQL: &str = "DELETE FROM sessions WHERE updated_at < now() - $1";

/// The typed operations the pipeline needs from the store. Integration
/// tests substitute an in-memory fake.
#[async_trait]
pub trait Store: Send + Sync {
    /// Commits a batch: upserts the batch's domains, opens or refreshes a
    /// session per event in arrival order, then bulk-inserts the events.
    /// Any failure aborts the whole batch.
    async fn save_events(&self, events: &[Event], batch_start: Instant) -> Result<(), StoreError>;

    async fn prune_events(&self, days: u32) -> Result<u64, StoreError>;
    async fn prune_sessions(&self, days: u32) -> Result<u64, StoreError>;
}

pub struct PgStore {
    pool: PgPool,
    session_timeout: PgInterval,
}

impl PgStore {
    pub fn new(pool: PgPool, session_timeout_min: u32) -> Self {
        PgStore {
            pool,
            session_timeout: minutes_interval(session_timeout_min),
        }
    }

    /// Stage A: one auto-commit upsert per distinct domain in the batch.
    async fn upsert_domains(&self, events: &[Event]) -> Result<HashMap<String, i32>, StoreError> {
        let mut domains: HashMap<String, i32> =
            events.iter().map(|e| (e.domain.clone(), 0)).collect();
        for (domain, id) in domains.iter_mut() {
            *id = sqlx::query_scalar(UPSERT_DOMAIN_SQL)
                .bind(domain)
                .fetch_one(&self.pool)
                .await?;
        }
        Ok(domains)
    }

    /// Stage B: per event, in arrival order, refresh the visitor's fresh
    /// session or open a new one, each inside its own transaction.
    async fn upsert_sessions(
        &self,
        events: &[Event],
        domains: &HashMap<String, i32>,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut sessions: HashMap<String, i64> = HashMap::new();
        for event in events {
            let mut tx = self.pool.begin().await?;
            let existing: Option<i64> = sqlx::query_scalar(GET_SESSION_SQL)
                .bind(&event.visitor_id)
                .bind(&self.session_timeout)
                .fetch_optional(&mut *tx)
                .await?;

            let session_id = match existing {
                Some(id) => {
                    sqlx::query(UPDATE_SESSION_SQL)
                        .bind(id)
                        .bind(&event.path)
                        .bind(&event.raw.name)
                        .execute(&mut *tx)
                        .await?;
                    id
                }
                None => {
                    let e = &event.enrichment;
                    let raw = &event.raw;
                    sqlx::query_scalar(CREATE_SESSION_SQL)
                        .bind(domains[&event.domain])
                        .bind(&event.visitor_id)
                        .bind(&event.path)
                        .bind(&event.path)
                        .bind(&e.country)
                        .bind(e.latitude)
                        .bind(e.longitude)
                        .bind(&e.subdivision)
                        .bind(&e.city)
                        .bind(&e.browser)
                        .bind(&e.browser_version)
                        .bind(&e.os)
                        .bind(&e.os_version)
                        .bind(&e.platform)
                        .bind(&e.device_type)
                        .bind(e.bot)
                        .bind(raw.screen_w)
                        .bind(raw.screen_h)
                        .bind(&raw.timezone)
                        .bind(raw.pixel_ratio)
                        .bind(raw.pixel_depth)
                        .bind(&raw.utm_source)
                        .bind(&raw.utm_medium)
                        .bind(&raw.utm_campaign)
                        .bind(&raw.utm_content)
                        .bind(&raw.utm_term)
                        .fetch_one(&mut *tx)
                        .await?
                }
            };
            tx.commit().await?;
            sessions.insert(event.visitor_id.clone(), session_id);
        }
        Ok(sessions)
    }

    /// Stage C: one array-based bulk insert for the whole batch.
    async fn create_events(
        &self,
        events: &[Event],
        domains: &HashMap<String, i32>,
        sessions: &HashMap<String, i64>,
        batch_start: Instant,
    ) -> Result<(), StoreError> {
        let mut domain_ids = Vec::with_capacity(events.len());
        let mut session_ids = Vec::with_capacity(events.len());
        let mut visitor_ids = Vec::with_capacity(events.len());
        let mut names = Vec::with_capacity(events.len());
        let mut paths = Vec::with_capacity(events.len());
        let mut referrers = Vec::with_capacity(events.len());
        let mut load_times = Vec::with_capacity(events.len());
        let mut ttfbs = Vec::with_capacity(events.len());

        let now = Utc::now();
        for event in events {
            domain_ids.push(domains[&event.domain]);
            session_ids.push(sessions[&event.visitor_id]);
            visitor_ids.push(event.visitor_id.clone());
            names.push(event.raw.name.clone());
            paths.push(event.path.clone());
            referrers.push(event.raw.referrer.clone());
            load_times.push(event.raw.load_time);
            ttfbs.push(event.raw.ttfb);

            let ingest_secs = (now - event.raw.created)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            histogram!(INGEST_LATENCY, "domain" => event.domain.clone()).record(ingest_secs);
            histogram!(WORKER_LATENCY, "domain" => event.domain.clone())
                .record(batch_start.elapsed().as_secs_f64());
        }

        sqlx::query(CREATE_EVENTS_SQL)
            .bind(&domain_ids)
            .bind(&session_ids)
            .bind(&visitor_ids)
            .bind(&names)
            .bind(&paths)
            .bind(&referrers)
            .bind(&load_times)
            .bind(&ttfbs)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn save_events(&self, events: &[Event], batch_start: Instant) -> Result<(), StoreError> {
        let domains = self.upsert_domains(events).await?;
        let sessions = self.upsert_sessions(events, &domains).await?;
        self.create_events(events, &domains, &sessions, batch_start)
            .await
    }

    async fn prune_events(&self, days: u32) -> Result<u64, StoreError> {
        let result = sqlx::query(PRUNE_EVENTS_SQL)
            .bind(days_interval(days))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn prune_sessions(&self, days: u32) -> Result<u64, StoreError> {
        let result = sqlx::query(PRUNE_SESSIONS_SQL)
            .bind(days_interval(days))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn minutes_interval(minutes: u32) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: i64::from(minutes) * 60 * 1_000_000,
    }
}

fn days_interval(days: u32) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: i64::from(days) * 24 * 60 * 60 * 1_000_000,
    }
}

/// Connects to Postgres, retrying with exponential backoff, then runs the
/// embedded migrations. Fatal after `pg_conn_attempts` failures.
pub async fn setup_pool(config: &Config) -> anyhow::Result<PgPool> {
    let url = config.database_url()?;
    let options = PgPoolOptions::new().max_connections(config.max_pg_connections);

    let mut attempt = 0;
    let pool = loop {
        match options.clone().connect(&url).await {
            Ok(pool) => break pool,
            Err(err) if attempt < config.pg_conn_attempts => {
                let backoff = backoff_with_jitter(attempt);
                warn!(error = %err, "error connecting to db, trying again in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => {
                anyhow::bail!(
                    "failed to connect to the database after {} tries: {err}",
                    attempt + 1
                );
            }
        }
    };

    if !config.skip_migrations {
        debug!("running migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("migrations complete");
    }
    Ok(pool)
}

/// Delay for connection attempt `n`: `0.5 * 2^n` seconds capped at 10s,
/// with ±10% jitter.
pub(crate) fn backoff_with_jitter(attempt: u32) -> Duration {
    let max_delay = Duration::from_secs(10);
    let delay = Duration::from_secs_f64(0.5 * 2f64.powi(attempt as i32)).min(max_delay);
    let jitter = delay.as_secs_f64() * 0.1;
    let offset = rand::thread_rng().gen::<f64>() * jitter - jitter / 2.0;
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_jittered_bounds() {
        for attempt in 0..8 {
            let expected = (0.5 * 2f64.powi(attempt)).min(10.0);
            let jitter = expected * 0.1;
            for _ in 0..50 {
                let delay = backoff_with_jitter(attempt as u32).as_secs_f64();
                assert!(
                    delay >= expected - jitter && delay <= expected + jitter,
                    "attempt {attempt}: delay {delay} outside [{} , {}]",
                    expected - jitter,
                    expected + jitter
                );
            }
        }
    }

    #[test]
    fn backoff_is_capped_at_ten_seconds() {
        for _ in 0..50 {
            assert!(backoff_with_jitter(30).as_secs_f64() <= 11.0);
        }
    }

    // The privacy contract: no statement touching events or sessions may
    // reference a client IP or user-agent column.
    #[test]
    fn sql_never_references_pii_columns() {
        for sql in [
            UPSERT_DOMAIN_SQL,
            GET_SESSION_SQL,
            UPDATE_SESSION_SQL,
            CREATE_SESSION_SQL,
            CREATE_EVENTS_SQL,
            PRUNE_EVENTS_SQL,
            PRUNE_SESSIONS_SQL,
        ] {
            let lowered = sql.to_lowercase();
            assert!(!lowered.contains("client_ip"), "PII column in: {sql}");
            assert!(!lowered.contains("user_agent"), "PII column in: {sql}");
        }
    }

    #[test]
    fn bounce_survives_only_ping_updates() {
        assert!(UPDATE_SESSION_SQL.contains("bounce = bounce AND $3 = 'ping'"));
    }

    #[test]
    fn intervals_are_exact() {
        assert_eq!(minutes_interval(30).microseconds, 1_800_000_000);
        assert_eq!(days_interval(1).microseconds, 86_400_000_000);
    }
}
