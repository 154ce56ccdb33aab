//! Persistence operations and HTTP fetch utilities for the UK jobs pipeline.
//!
//! The pipeline only ever needs a handful of store operations
//! (fingerprint lookup, insert, last-seen touch, a company-scoped recent
//! window) plus the read side used by the query/export collaborator. Both
//! live behind the [`JobStore`] trait with an in-memory implementation and
//! a Postgres one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info_span, Instrument};
use ukjobs_core::JobRecord;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ukjobs-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("fingerprint already present: {0}")]
    DuplicateFingerprint(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    ScrapeDate,
    Company,
    Title,
    Location,
}

impl SortBy {
    fn column(&self) -> &'static str {
        match self {
            SortBy::ScrapeDate => "scrape_date",
            SortBy::Company => "company",
            SortBy::Title => "title",
            SortBy::Location => "location",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter/sort/paginate inputs for the jobs list operation.
#[derive(Debug, Clone)]
pub struct JobQuery {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub search: Option<String>,
    pub company: Option<String>,
    pub source: Option<String>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobRecord>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

impl JobPage {
    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub total_jobs: usize,
    pub unique_companies: usize,
    pub sources: BTreeMap<String, usize>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct DateCount {
    pub date: NaiveDate,
    pub count: usize,
}

/// Persistence operations the pipeline depends on. Engine internals beyond
/// these are out of scope for the core.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<JobRecord>, StorageError>;

    async fn insert(&self, job: &JobRecord) -> Result<(), StorageError>;

    /// Advance `last_seen_date` of an existing record. Never moves it
    /// backwards.
    async fn touch_last_seen(&self, id: Uuid, seen: NaiveDate) -> Result<(), StorageError>;

    /// Records with the given normalized company key scraped on or after
    /// `since`, the bounded comparison window for fuzzy dedup.
    async fn recent_by_company(
        &self,
        company_key: &str,
        since: NaiveDate,
    ) -> Result<Vec<JobRecord>, StorageError>;

    async fn query(&self, query: &JobQuery) -> Result<JobPage, StorageError>;

    async fn stats(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<StatsSummary, StorageError>;

    async fn export_range(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<Vec<JobRecord>, StorageError>;

    async fn scrape_dates(&self) -> Result<Vec<DateCount>, StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// No-database store: the test double, and the fallback when `DATABASE_URL`
/// is unset.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    jobs: Vec<JobRecord>,
    by_fingerprint: HashMap<String, Uuid>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<JobRecord>, StorageError> {
        let inner = self.inner.read().await;
        let Some(id) = inner.by_fingerprint.get(fingerprint) else {
            return Ok(None);
        };
        Ok(inner.jobs.iter().find(|j| j.id == *id).cloned())
    }

    async fn insert(&self, job: &JobRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if inner.by_fingerprint.contains_key(&job.content_fingerprint) {
            return Err(StorageError::DuplicateFingerprint(
                job.content_fingerprint.clone(),
            ));
        }
        inner
            .by_fingerprint
            .insert(job.content_fingerprint.clone(), job.id);
        inner.jobs.push(job.clone());
        Ok(())
    }

    async fn touch_last_seen(&self, id: Uuid, seen: NaiveDate) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
            if seen > job.last_seen_date {
                job.last_seen_date = seen;
            }
        }
        Ok(())
    }

    async fn recent_by_company(
        &self,
        company_key: &str,
        since: NaiveDate,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .iter()
            .filter(|j| j.company_key == company_key && j.scrape_date >= since)
            .cloned()
            .collect())
    }

    async fn query(&self, query: &JobQuery) -> Result<JobPage, StorageError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<JobRecord> = inner
            .jobs
            .iter()
            .filter(|j| j.scrape_date >= query.date_from && j.scrape_date <= query.date_to)
            .filter(|j| {
                query.search.as_deref().is_none_or(|s| {
                    contains_ci(&j.title, s)
                        || contains_ci(&j.company, s)
                        || contains_ci(&j.location, s)
                })
            })
            .filter(|j| {
                query
                    .company
                    .as_deref()
                    .is_none_or(|c| contains_ci(&j.company, c))
            })
            .filter(|j| query.source.as_deref().is_none_or(|s| j.source == s))
            .cloned()
            .collect();

        match query.sort_by {
            SortBy::ScrapeDate => rows.sort_by_key(|j| j.scrape_date),
            SortBy::Company => rows.sort_by(|a, b| a.company.cmp(&b.company)),
            SortBy::Title => rows.sort_by(|a, b| a.title.cmp(&b.title)),
            SortBy::Location => rows.sort_by(|a, b| a.location.cmp(&b.location)),
        }
        if query.sort_order == SortOrder::Desc {
            rows.reverse();
        }

        let total = rows.len();
        let page_size = query.page_size.max(1);
        let total_pages = total.div_ceil(page_size);
        let page = query.page.max(1);
        let jobs = rows
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        Ok(JobPage {
            jobs,
            total,
            page,
            page_size,
            total_pages,
        })
    }

    async fn stats(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<StatsSummary, StorageError> {
        let inner = self.inner.read().await;
        let in_range = inner
            .jobs
            .iter()
            .filter(|j| j.scrape_date >= date_from && j.scrape_date <= date_to);

        let mut sources: BTreeMap<String, usize> = BTreeMap::new();
        let mut companies: BTreeMap<&str, ()> = BTreeMap::new();
        let mut total = 0usize;
        for job in in_range {
            total += 1;
            *sources.entry(job.source.clone()).or_default() += 1;
            companies.insert(job.company.as_str(), ());
        }

        Ok(StatsSummary {
            total_jobs: total,
            unique_companies: companies.len(),
            sources,
            date_from,
            date_to,
        })
    }

    async fn export_range(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<JobRecord> = inner
            .jobs
            .iter()
            .filter(|j| j.scrape_date >= date_from && j.scrape_date <= date_to)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.scrape_date, a.company.as_str(), a.title.as_str())
                .cmp(&(b.scrape_date, b.company.as_str(), b.title.as_str()))
        });
        Ok(rows)
    }

    async fn scrape_dates(&self) -> Result<Vec<DateCount>, StorageError> {
        let inner = self.inner.read().await;
        let mut counts: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for job in &inner.jobs {
            *counts.entry(job.scrape_date).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .rev()
            .map(|(date, count)| DateCount { date, count })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                title TEXT NOT NULL,
                company TEXT NOT NULL,
                location TEXT NOT NULL,
                url TEXT NOT NULL,
                canonical_url TEXT NOT NULL,
                content_fingerprint TEXT NOT NULL UNIQUE,
                company_key TEXT NOT NULL,
                salary TEXT,
                category TEXT,
                experience_level TEXT,
                job_type TEXT,
                source TEXT NOT NULL,
                scrape_date DATE NOT NULL,
                first_seen_date DATE NOT NULL,
                last_seen_date DATE NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_scrape_date ON jobs (scrape_date)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_company_key ON jobs (company_key, scrape_date)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<JobRecord, sqlx::Error> {
    Ok(JobRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        url: row.try_get("url")?,
        canonical_url: row.try_get("canonical_url")?,
        content_fingerprint: row.try_get("content_fingerprint")?,
        company_key: row.try_get("company_key")?,
        salary: row.try_get("salary")?,
        category: row.try_get("category")?,
        experience_level: row.try_get("experience_level")?,
        job_type: row.try_get("job_type")?,
        source: row.try_get("source")?,
        scrape_date: row.try_get("scrape_date")?,
        first_seen_date: row.try_get("first_seen_date")?,
        last_seen_date: row.try_get("last_seen_date")?,
    })
}

/// WHERE fragment + ordered binds for the list/count queries. Sort columns
/// come from a fixed whitelist, never from caller input.
fn filter_sql(query: &JobQuery) -> (String, Vec<String>) {
    let mut clauses = vec![
        "scrape_date >= $1".to_string(),
        "scrape_date <= $2".to_string(),
    ];
    let mut text_binds = Vec::new();
    let mut n = 3;
    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        clauses.push(format!(
            "(title ILIKE ${n} OR company ILIKE ${n} OR location ILIKE ${n})"
        ));
        text_binds.push(format!("%{search}%"));
        n += 1;
    }
    if let Some(company) = query.company.as_deref().filter(|s| !s.is_empty()) {
        clauses.push(format!("company ILIKE ${n}"));
        text_binds.push(format!("%{company}%"));
        n += 1;
    }
    if let Some(source) = query.source.as_deref().filter(|s| !s.is_empty()) {
        clauses.push(format!("source = ${n}"));
        text_binds.push(source.to_string());
    }
    (clauses.join(" AND "), text_binds)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<JobRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE content_fingerprint = $1")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose().map_err(Into::into)
    }

    async fn insert(&self, job: &JobRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, title, company, location, url, canonical_url,
                content_fingerprint, company_key, salary, category,
                experience_level, job_type, source, scrape_date,
                first_seen_date, last_seen_date
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                      $13, $14, $15, $16)
            "#,
        )
        .bind(job.id)
        .bind(&job.title)
        .bind(&job.company)
        .bind(&job.location)
        .bind(&job.url)
        .bind(&job.canonical_url)
        .bind(&job.content_fingerprint)
        .bind(&job.company_key)
        .bind(&job.salary)
        .bind(&job.category)
        .bind(&job.experience_level)
        .bind(&job.job_type)
        .bind(&job.source)
        .bind(job.scrape_date)
        .bind(job.first_seen_date)
        .bind(job.last_seen_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_last_seen(&self, id: Uuid, seen: NaiveDate) -> Result<(), StorageError> {
        sqlx::query("UPDATE jobs SET last_seen_date = GREATEST(last_seen_date, $2) WHERE id = $1")
            .bind(id)
            .bind(seen)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_by_company(
        &self,
        company_key: &str,
        since: NaiveDate,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE company_key = $1 AND scrape_date >= $2")
            .bind(company_key)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(row_to_job)
            .collect::<Result<_, _>>()
            .map_err(Into::into)
    }

    async fn query(&self, query: &JobQuery) -> Result<JobPage, StorageError> {
        let (where_sql, text_binds) = filter_sql(query);
        let order = match query.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let page_size = query.page_size.max(1);
        let page = query.page.max(1);

        let count_sql = format!("SELECT COUNT(*) AS n FROM jobs WHERE {where_sql}");
        let mut count_q = sqlx::query(&count_sql)
            .bind(query.date_from)
            .bind(query.date_to);
        for bind in &text_binds {
            count_q = count_q.bind(bind);
        }
        let total: i64 = count_q.fetch_one(&self.pool).await?.try_get("n")?;
        let total = total as usize;

        let list_sql = format!(
            "SELECT * FROM jobs WHERE {where_sql} ORDER BY {} {} LIMIT {} OFFSET {}",
            query.sort_by.column(),
            order,
            page_size,
            (page - 1) * page_size,
        );
        let mut list_q = sqlx::query(&list_sql)
            .bind(query.date_from)
            .bind(query.date_to);
        for bind in &text_binds {
            list_q = list_q.bind(bind);
        }
        let rows = list_q.fetch_all(&self.pool).await?;
        let jobs = rows
            .iter()
            .map(row_to_job)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobPage {
            jobs,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size),
        })
    }

    async fn stats(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<StatsSummary, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total, COUNT(DISTINCT company) AS companies
              FROM jobs
             WHERE scrape_date >= $1 AND scrape_date <= $2
            "#,
        )
        .bind(date_from)
        .bind(date_to)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let companies: i64 = row.try_get("companies")?;

        let source_rows = sqlx::query(
            r#"
            SELECT source, COUNT(*) AS n
              FROM jobs
             WHERE scrape_date >= $1 AND scrape_date <= $2
             GROUP BY source
            "#,
        )
        .bind(date_from)
        .bind(date_to)
        .fetch_all(&self.pool)
        .await?;
        let mut sources = BTreeMap::new();
        for row in source_rows {
            let source: String = row.try_get("source")?;
            let n: i64 = row.try_get("n")?;
            sources.insert(source, n as usize);
        }

        Ok(StatsSummary {
            total_jobs: total as usize,
            unique_companies: companies as usize,
            sources,
            date_from,
            date_to,
        })
    }

    async fn export_range(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
             WHERE scrape_date >= $1 AND scrape_date <= $2
             ORDER BY scrape_date, company, title
            "#,
        )
        .bind(date_from)
        .bind(date_to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(row_to_job)
            .collect::<Result<_, _>>()
            .map_err(Into::into)
    }

    async fn scrape_dates(&self) -> Result<Vec<DateCount>, StorageError> {
        let rows = sqlx::query(
            "SELECT scrape_date, COUNT(*) AS n FROM jobs GROUP BY scrape_date ORDER BY scrape_date DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let date: NaiveDate = row.try_get("scrape_date")?;
            let n: i64 = row.try_get("n")?;
            out.push(DateCount {
                date,
                count: n as usize,
            });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// HTTP fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Bound on simultaneous outbound requests across all sources.
    pub concurrency: usize,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 8,
            delay_min_ms: 1500,
            delay_max_ms: 4000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper. One attempt per request, per-request timeout, a
/// global concurrency bound, and the randomized politeness pause adapters
/// await between their outbound requests.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    delay_min_ms: u64,
    delay_max_ms: u64,
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
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            delay_min_ms: config.delay_min_ms,
            delay_max_ms: config.delay_max_ms.max(config.delay_min_ms),
        })
    }

    /// Randomized inter-request delay. The politeness contract: adapters
    /// call this between consecutive requests whatever the pool concurrency.
    pub async fn polite_pause(&self) {
        let ms = {
            use rand::Rng;
            rand::rng().random_range(self.delay_min_ms..=self.delay_max_ms)
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    pub async fn get(
        &self,
        source_id: &str,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url).query(params);
        self.execute(source_id, url, request).await
    }

    /// Like [`get`](Self::get) but with a per-request `User-Agent` override.
    pub async fn get_with_user_agent(
        &self,
        source_id: &str,
        url: &str,
        params: &[(&str, String)],
        user_agent: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let request = self
            .client
            .get(url)
            .query(params)
            .header(reqwest::header::USER_AGENT, user_agent);
        self.execute(source_id, url, request).await
    }

    pub async fn get_basic_auth(
        &self,
        source_id: &str,
        url: &str,
        params: &[(&str, String)],
        username: &str,
        password: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let request = self
            .client
            .get(url)
            .query(params)
            .basic_auth(username, password);
        self.execute(source_id, url, request).await
    }

    async fn execute(
        &self,
        source_id: &str,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .expect("fetch semaphore never closed");
        let span = info_span!("http_fetch", source_id, url);

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
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
