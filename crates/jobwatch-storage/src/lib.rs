//! Listing/schedule persistence + rate-limited HTTP fetch utilities for jobwatch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{
    ListingDraft, ListingRecord, ListingStatus, RunStamp, SearchPreferences, UserId, UserSchedule,
    JITTER_PERCENT,
};
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "jobwatch-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

// Eleven bound columns per listing row keeps a chunk well under the 65535 parameter cap.
const INSERT_CHUNK: usize = 1000;

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await.context("running migrations")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

/// Row-level access to stored listings. Implementations must keep `(external_id, user_id)` unique.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn existing_ids(&self, user_id: UserId) -> Result<HashSet<String>, StoreError>;

    /// Insert rows, silently skipping ones that already exist. Returns the ids actually written.
    async fn insert_batch(&self, records: &[ListingRecord]) -> Result<HashSet<String>, StoreError>;

    /// Undelivered rows for a user, oldest publication first.
    async fn undelivered(&self, user_id: UserId) -> Result<Vec<ListingRecord>, StoreError>;

    async fn mark_delivered(&self, user_id: UserId, ids: &[String]) -> Result<u64, StoreError>;
}

/// Per-user schedule rows (preferences + auto-update state).
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Enabled schedules due at or before `now`, earliest first, at most `limit`.
    async fn find_due(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<UserSchedule>, StoreError>;

    async fn get(&self, user_id: UserId) -> Result<Option<UserSchedule>, StoreError>;

    async fn save(&self, schedule: &UserSchedule) -> Result<(), StoreError>;

    /// Single write of the run stamp. The next due time is jittered from the row's
    /// interval as it is at write time, and is null when auto-update is off by then.
    /// Returns `None` when the row no longer exists.
    async fn record_run(
        &self,
        user_id: UserId,
        ran_at: DateTime<Utc>,
    ) -> Result<Option<RunStamp>, StoreError>;
}

/// Persist the candidates a user has not seen yet and return exactly the inserted subset.
pub async fn persist_new(
    store: &dyn ListingStore,
    user_id: UserId,
    candidates: Vec<ListingDraft>,
    now: DateTime<Utc>,
) -> Result<Vec<ListingRecord>, StoreError> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let mut seen = store.existing_ids(user_id).await?;
    let fresh: Vec<ListingRecord> = candidates
        .into_iter()
        .filter(|draft| seen.insert(draft.external_id.clone()))
        .map(|draft| ListingRecord::ingest(draft, user_id, now))
        .collect();
    if fresh.is_empty() {
        return Ok(Vec::new());
    }

    let inserted = store.insert_batch(&fresh).await?;
    let skipped = fresh.len() - inserted.len();
    if skipped > 0 {
        debug!(user_id, skipped, "rows already present at insert time");
    }
    Ok(fresh
        .into_iter()
        .filter(|r| inserted.contains(&r.external_id))
        .collect())
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn listing_from_row(row: &PgRow) -> Result<ListingRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<ListingStatus>().map_err(|e| StoreError::Corrupt {
        table: "listings",
        detail: e.to_string(),
    })?;
    Ok(ListingRecord {
        external_id: row.try_get("external_id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        employer: row.try_get("employer")?,
        location: row.try_get("location")?,
        work_format: row.try_get("work_format")?,
        salary: row.try_get("salary")?,
        published_at: row.try_get("published_at")?,
        url: row.try_get("url")?,
        loaded_at: row.try_get("loaded_at")?,
        status,
        delivered: row.try_get("delivered")?,
    })
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn existing_ids(&self, user_id: UserId) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT external_id FROM listings WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    async fn insert_batch(&self, records: &[ListingRecord]) -> Result<HashSet<String>, StoreError> {
        let mut inserted = HashSet::with_capacity(records.len());
        let mut tx = self.pool.begin().await?;
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO listings (external_id, user_id, title, employer, location, \
                 work_format, salary, published_at, url, loaded_at, status, delivered) ",
            );
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(&r.external_id)
                    .push_bind(r.user_id)
                    .push_bind(&r.title)
                    .push_bind(&r.employer)
                    .push_bind(&r.location)
                    .push_bind(&r.work_format)
                    .push_bind(&r.salary)
                    .push_bind(r.published_at)
                    .push_bind(&r.url)
                    .push_bind(r.loaded_at)
                    .push_bind(r.status.as_str())
                    .push_bind(r.delivered);
            });
            builder.push(" ON CONFLICT (external_id, user_id) DO NOTHING RETURNING external_id");
            let ids = builder
                .build_query_scalar::<String>()
                .fetch_all(&mut *tx)
                .await?;
            inserted.extend(ids);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn undelivered(&self, user_id: UserId) -> Result<Vec<ListingRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT external_id, user_id, title, employer, location, work_format, salary,
                   published_at, url, loaded_at, status, delivered
              FROM listings
             WHERE user_id = $1
               AND delivered = FALSE
             ORDER BY published_at ASC, external_id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn mark_delivered(&self, user_id: UserId, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET delivered = TRUE
             WHERE user_id = $1
               AND external_id = ANY($2)
               AND delivered = FALSE
            "#,
        )
        .bind(user_id)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct PgScheduleRepository {
    pool: PgPool,
}

impl PgScheduleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn non_negative(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt {
        table: "user_schedules",
        detail: format!("{column} is negative: {value}"),
    })
}

fn schedule_from_row(row: &PgRow) -> Result<UserSchedule, StoreError> {
    let days: i32 = row.try_get("days")?;
    let interval: i32 = row.try_get("interval_minutes")?;
    Ok(UserSchedule {
        user_id: row.try_get("user_id")?,
        preferences: SearchPreferences {
            query: row.try_get("query")?,
            days: non_negative(days, "days")?,
            exclude_keywords: row.try_get("exclude_keywords")?,
            work_types: row.try_get("work_types")?,
            countries: row.try_get("countries")?,
            notify_enabled: row.try_get("notify_enabled")?,
        },
        auto_update_enabled: row.try_get("auto_update_enabled")?,
        interval_minutes: non_negative(interval, "interval_minutes")?,
        last_run_at: row.try_get("last_run_at")?,
        next_due_at: row.try_get("next_due_at")?,
    })
}

const SCHEDULE_COLUMNS: &str = "user_id, query, days, exclude_keywords, work_types, countries, \
     notify_enabled, auto_update_enabled, interval_minutes, last_run_at, next_due_at";

#[async_trait]
impl ScheduleRepository for PgScheduleRepository {
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UserSchedule>, StoreError> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM user_schedules \
              WHERE auto_update_enabled = TRUE \
                AND (next_due_at IS NULL OR next_due_at <= $1) \
              ORDER BY next_due_at ASC NULLS FIRST, user_id ASC \
              LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn get(&self, user_id: UserId) -> Result<Option<UserSchedule>, StoreError> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM user_schedules WHERE user_id = $1");
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn save(&self, schedule: &UserSchedule) -> Result<(), StoreError> {
        let prefs = &schedule.preferences;
        sqlx::query(
            r#"
            INSERT INTO user_schedules (user_id, query, days, exclude_keywords, work_types,
                                        countries, notify_enabled, auto_update_enabled,
                                        interval_minutes, last_run_at, next_due_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (user_id) DO UPDATE
               SET query = EXCLUDED.query,
                   days = EXCLUDED.days,
                   exclude_keywords = EXCLUDED.exclude_keywords,
                   work_types = EXCLUDED.work_types,
                   countries = EXCLUDED.countries,
                   notify_enabled = EXCLUDED.notify_enabled,
                   auto_update_enabled = EXCLUDED.auto_update_enabled,
                   interval_minutes = EXCLUDED.interval_minutes,
                   last_run_at = EXCLUDED.last_run_at,
                   next_due_at = EXCLUDED.next_due_at,
                   updated_at = NOW()
            "#,
        )
        .bind(schedule.user_id)
        .bind(&prefs.query)
        .bind(i32::try_from(prefs.days).unwrap_or(i32::MAX))
        .bind(&prefs.exclude_keywords)
        .bind(&prefs.work_types)
        .bind(&prefs.countries)
        .bind(prefs.notify_enabled)
        .bind(schedule.auto_update_enabled)
        .bind(i32::try_from(schedule.interval_minutes).unwrap_or(i32::MAX))
        .bind(schedule.last_run_at)
        .bind(schedule.next_due_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_run(
        &self,
        user_id: UserId,
        ran_at: DateTime<Utc>,
    ) -> Result<Option<RunStamp>, StoreError> {
        let sql = format!(
            "UPDATE user_schedules \
                SET last_run_at = $2, \
                    next_due_at = CASE WHEN auto_update_enabled \
                        THEN $2 + make_interval(secs => \
                            GREATEST(interval_minutes, 1)::float8 * 60 \
                            + floor(random() * (GREATEST(interval_minutes, 1)::float8 * 60 * {JITTER_PERCENT} / 100 + 1))) \
                        ELSE NULL END, \
                    updated_at = NOW() \
              WHERE user_id = $1 \
          RETURNING last_run_at, next_due_at"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(ran_at)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<RunStamp, StoreError> {
            Ok(RunStamp {
                last_run_at: row.try_get("last_run_at")?,
                next_due_at: row.try_get("next_due_at")?,
            })
        })
        .transpose()
    }
}

/// Process-local listing store, used by tests and `--in-memory` runs.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    rows: Mutex<BTreeMap<(UserId, String), ListingRecord>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_for_user(&self, user_id: UserId) -> Vec<ListingRecord> {
        self.rows
            .lock()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn existing_ids(&self, user_id: UserId) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .keys()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn insert_batch(&self, records: &[ListingRecord]) -> Result<HashSet<String>, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut inserted = HashSet::new();
        for record in records {
            let key = (record.user_id, record.external_id.clone());
            if !rows.contains_key(&key) {
                rows.insert(key, record.clone());
                inserted.insert(record.external_id.clone());
            }
        }
        Ok(inserted)
    }

    async fn undelivered(&self, user_id: UserId) -> Result<Vec<ListingRecord>, StoreError> {
        let mut out: Vec<ListingRecord> = self
            .rows
            .lock()
            .await
            .values()
            .filter(|r| r.user_id == user_id && !r.delivered)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.published_at
                .cmp(&b.published_at)
                .then_with(|| a.external_id.cmp(&b.external_id))
        });
        Ok(out)
    }

    async fn mark_delivered(&self, user_id: UserId, ids: &[String]) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut updated = 0;
        for id in ids {
            if let Some(row) = rows.get_mut(&(user_id, id.clone())) {
                if !row.delivered {
                    row.delivered = true;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }
}

#[derive(Debug, Default)]
pub struct MemoryScheduleRepository {
    rows: Mutex<HashMap<UserId, UserSchedule>>,
}

impl MemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleRepository for MemoryScheduleRepository {
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UserSchedule>, StoreError> {
        let mut due: Vec<UserSchedule> = self
            .rows
            .lock()
            .await
            .values()
            .filter(|s| s.auto_update_enabled && s.next_due_at.map_or(true, |at| at <= now))
            .cloned()
            .collect();
        // `None` sorts before `Some`, matching NULLS FIRST.
        due.sort_by_key(|s| (s.next_due_at, s.user_id));
        due.truncate(limit);
        Ok(due)
    }

    async fn get(&self, user_id: UserId) -> Result<Option<UserSchedule>, StoreError> {
        Ok(self.rows.lock().await.get(&user_id).cloned())
    }

    async fn save(&self, schedule: &UserSchedule) -> Result<(), StoreError> {
        self.rows
            .lock()
            .await
            .insert(schedule.user_id, schedule.clone());
        Ok(())
    }

    async fn record_run(
        &self,
        user_id: UserId,
        ran_at: DateTime<Utc>,
    ) -> Result<Option<RunStamp>, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(&user_id) else {
            return Ok(None);
        };
        let stamp = row.next_run(ran_at, &mut rand::rng());
        row.last_run_at = Some(stamp.last_run_at);
        row.next_due_at = stamp.next_due_at;
        Ok(Some(stamp))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills =
                    u32::try_from(elapsed.as_millis() / self.refill_every.as_millis()).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub status: StatusCode,
    pub final_url: String,
    pub body: JsonValue,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

/// Shared HTTP client: one request per call, bounded by global and per-source semaphores.
///
/// There is no retry loop; a failed or timed-out call is reported to the caller as is.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn get_json(
        &self,
        source_id: &str,
        url: Url,
        bearer: Option<&str>,
    ) -> Result<FetchedJson, FetchError> {
        let mut request = self.client.get(url.clone());
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.send(source_id, url, request).await
    }

    pub async fn post_json(
        &self,
        source_id: &str,
        url: Url,
        bearer: Option<&str>,
        body: &JsonValue,
    ) -> Result<FetchedJson, FetchError> {
        let mut request = self.client.post(url.clone()).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.send(source_id, url, request).await
    }

    async fn send(
        &self,
        source_id: &str,
        url: Url,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedJson, FetchError> {
        // Semaphores are never closed, so acquire only fails on a programming error.
        let _global = self.global_limit.acquire().await.ok();
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.ok();

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", source_id, url = %url);
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let bytes = resp.bytes().await?;
            let body = if bytes.is_empty() {
                JsonValue::Null
            } else {
                serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                    url: final_url.clone(),
                    source,
                })?
            };
            debug!(status = status.as_u16(), bytes = bytes.len(), "http response");
            Ok(FetchedJson {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
