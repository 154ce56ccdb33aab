//! Scrape orchestration: normalization, UK filtering, two-phase dedup,
//! and the single-flight run coordinator.
//!
//! One run streams every raw listing through
//! normalize -> UK filter -> dedup -> persist on the coordinator task, so
//! the fingerprint check-then-insert is atomic within the run. Sources
//! fetch concurrently under a small semaphore; their failures are isolated
//! and recorded, never fatal. Only a storage failure aborts a run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use ukjobs_adapters::{registered_adapters, AdapterConfig, SourceAdapter, WebSearchAdapter};
use ukjobs_core::{JobRecord, RawListing, RunStatus, ScrapeRun, TargetCompany};
use ukjobs_storage::{
    HttpClientConfig, HttpFetcher, JobStore, MemoryJobStore, PgJobStore, StorageError,
};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ukjobs-engine";

/// General discovery queries used by the query-driven sources alongside
/// the configured target companies.
pub const GENERAL_QUERIES: [&str; 20] = [
    "software engineer UK",
    "data scientist UK",
    "data engineer UK",
    "product manager UK",
    "business analyst UK",
    "DevOps engineer UK",
    "machine learning engineer UK",
    "cybersecurity analyst UK",
    "finance analyst UK",
    "management consultant UK",
    "mechanical engineer UK",
    "electrical engineer UK",
    "civil engineer UK",
    "project manager UK",
    "UX designer UK",
    "cloud architect UK",
    "quantitative analyst UK",
    "solicitor UK",
    "actuary UK",
    "biomedical scientist UK",
];

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Postgres URL; absent means the in-memory store.
    pub database_url: Option<String>,
    pub companies_file: PathBuf,
    pub request_delay_min_ms: u64,
    pub request_delay_max_ms: u64,
    pub max_pages_per_source: usize,
    pub max_results_per_company: usize,
    pub fuzzy_threshold: f64,
    pub fuzzy_window_days: i64,
    pub keep_ambiguous_remote: bool,
    pub source_concurrency: usize,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub adzuna_app_id: Option<String>,
    pub adzuna_api_key: Option<String>,
    pub reed_api_key: Option<String>,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        // Delays come in as seconds to match the historical knob names.
        let delay_min_secs: f64 = env_parsed("REQUEST_DELAY_MIN", 1.5);
        let delay_max_secs: f64 = env_parsed("REQUEST_DELAY_MAX", 4.0);
        Self {
            database_url: env_opt("DATABASE_URL"),
            companies_file: env_opt("UKJOBS_COMPANIES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./config/target_companies.yaml")),
            request_delay_min_ms: (delay_min_secs * 1000.0) as u64,
            request_delay_max_ms: (delay_max_secs * 1000.0) as u64,
            max_pages_per_source: env_parsed("MAX_PAGES_PER_SOURCE", 10),
            max_results_per_company: env_parsed("MAX_RESULTS_PER_COMPANY", 50),
            fuzzy_threshold: env_parsed("UKJOBS_FUZZY_THRESHOLD", 0.92),
            fuzzy_window_days: env_parsed("UKJOBS_FUZZY_WINDOW_DAYS", 14),
            keep_ambiguous_remote: env_flag("UKJOBS_KEEP_AMBIGUOUS_REMOTE"),
            source_concurrency: env_parsed("UKJOBS_SOURCE_CONCURRENCY", 3),
            scheduler_enabled: env_flag("UKJOBS_SCHEDULER_ENABLED"),
            scrape_cron: env_opt("UKJOBS_SCRAPE_CRON")
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
            user_agent: env_opt("UKJOBS_USER_AGENT")
                .unwrap_or_else(|| "ukjobs-pipeline/0.1".to_string()),
            http_timeout_secs: env_parsed("UKJOBS_HTTP_TIMEOUT_SECS", 30),
            adzuna_app_id: env_opt("ADZUNA_APP_ID"),
            adzuna_api_key: env_opt("ADZUNA_API_KEY"),
            reed_api_key: env_opt("REED_API_KEY"),
        }
    }

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            adzuna_app_id: self.adzuna_app_id.clone(),
            adzuna_api_key: self.adzuna_api_key.clone(),
            reed_api_key: self.reed_api_key.clone(),
            max_pages_per_source: self.max_pages_per_source,
            max_results_per_company: self.max_results_per_company,
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: std::time::Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.source_concurrency.max(1) * 2,
            delay_min_ms: self.request_delay_min_ms,
            delay_max_ms: self.request_delay_max_ms,
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            fuzzy_threshold: self.fuzzy_threshold,
            fuzzy_window_days: self.fuzzy_window_days,
        }
    }
}

/// Target companies from YAML, priority names first. The file is read once
/// at startup; edits require a restart.
pub async fn load_target_companies(path: &Path) -> Result<Vec<TargetCompany>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut companies: Vec<TargetCompany> =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    companies.sort_by_key(|c| !c.priority);
    Ok(companies)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Query parameters that carry tracking state, not listing identity.
const TRACKING_PARAMS: [&str; 11] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_content",
    "utm_term",
    "ref",
    "source",
    "fbclid",
    "gclid",
    "mc_cid",
    "mc_eid",
];

/// Canonical form of a listing URL: redirect wrappers unwrapped, fragment
/// and tracking params dropped, trailing slashes stripped. Scheme and host
/// are lower-cased by the parser; path and query casing is preserved.
/// Unparseable input falls back to trimmed lowercase.
pub fn canonicalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let unwrapped =
        WebSearchAdapter::unwrap_redirect(trimmed).unwrap_or_else(|| trimmed.to_string());

    let Ok(mut url) = Url::parse(&unwrapped) else {
        return trimmed.to_lowercase();
    };

    url.set_fragment(None);
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !TRACKING_PARAMS.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.set_query(None);
    if !kept.is_empty() {
        let mut serializer = url.query_pairs_mut();
        for (key, value) in &kept {
            serializer.append_pair(key, value);
        }
        drop(serializer);
    }

    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);
    url.to_string()
}

/// First 32 hex chars of SHA-256 over the canonical URL.
pub fn fingerprint_url(raw: &str) -> String {
    let canonical = canonicalize_url(raw);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Lowercase, ASCII alphanumerics only, whitespace collapsed to single
/// spaces. The comparison form for titles/companies/locations.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_space = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else if c.is_whitespace() {
            pending_space = true;
        }
    }
    out
}

/// Validated listing plus its derived identity fields, ready for dedup.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateJob {
    pub listing: RawListing,
    pub canonical_url: String,
    pub content_fingerprint: String,
    pub company_key: String,
    pub norm_title: String,
    pub norm_location: String,
}

impl CandidateJob {
    pub fn to_record(&self, scrape_date: NaiveDate) -> JobRecord {
        JobRecord {
            id: Uuid::new_v4(),
            title: self.listing.title.clone(),
            company: self.listing.company.clone(),
            location: self.listing.location.clone(),
            url: self.listing.url.clone(),
            canonical_url: self.canonical_url.clone(),
            content_fingerprint: self.content_fingerprint.clone(),
            company_key: self.company_key.clone(),
            salary: self.listing.salary.clone(),
            category: self.listing.category.clone(),
            experience_level: self.listing.experience_level.clone(),
            job_type: self.listing.job_type.clone(),
            source: self.listing.source.clone(),
            scrape_date,
            first_seen_date: scrape_date,
            last_seen_date: scrape_date,
        }
    }
}

pub fn normalize_listing(listing: &RawListing) -> Result<CandidateJob, ValidationError> {
    let required = [
        (listing.title.as_str(), "title"),
        (listing.company.as_str(), "company"),
        (listing.location.as_str(), "location"),
        (listing.url.as_str(), "url"),
    ];
    for (value, field) in required {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField(field));
        }
    }

    let mut listing = listing.clone();
    listing.title = listing.title.trim().to_string();
    listing.company = listing.company.trim().to_string();
    listing.location = listing.location.trim().to_string();
    listing.url = listing.url.trim().to_string();

    let canonical_url = canonicalize_url(&listing.url);
    let content_fingerprint = fingerprint_url(&listing.url);
    let company_key = normalize_text(&listing.company);
    let norm_title = normalize_text(&listing.title);
    let norm_location = normalize_text(&listing.location);
    Ok(CandidateJob {
        listing,
        canonical_url,
        content_fingerprint,
        company_key,
        norm_title,
        norm_location,
    })
}

// ---------------------------------------------------------------------------
// UK location filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationClass {
    Uk,
    NonUk,
    /// Remote/worldwide with no UK qualifier; might or might not cover the
    /// UK, so kept only when explicitly configured.
    AmbiguousRemote,
}

const NON_UK_ONLY_MARKERS: [&str; 5] = [
    "usa only",
    "us only",
    "united states only",
    "canada only",
    "australia only",
];

// Safe as substring matches: place names, counties, regions, and the
// remote-with-UK-qualifier spellings.
const UK_PLACES: [&str; 67] = [
    "united kingdom",
    "england",
    "scotland",
    "wales",
    "northern ireland",
    "london",
    "manchester",
    "birmingham",
    "leeds",
    "glasgow",
    "liverpool",
    "edinburgh",
    "bristol",
    "sheffield",
    "newcastle",
    "nottingham",
    "southampton",
    "cardiff",
    "belfast",
    "leicester",
    "coventry",
    "cambridge",
    "oxford",
    "brighton",
    "york",
    "aberdeen",
    "dundee",
    "exeter",
    "norwich",
    "plymouth",
    "derby",
    "swansea",
    "portsmouth",
    "wolverhampton",
    "warwick",
    "surrey",
    "essex",
    "kent",
    "sussex",
    "hampshire",
    "hertfordshire",
    "berkshire",
    "middlesex",
    "staffordshire",
    "lancashire",
    "cheshire",
    "somerset",
    "dorset",
    "devon",
    "cornwall",
    "wiltshire",
    "norfolk",
    "suffolk",
    "cambridgeshire",
    "oxfordshire",
    "buckinghamshire",
    "greater london",
    "west midlands",
    "east midlands",
    "north west",
    "north east",
    "south west",
    "south east",
    "east anglia",
    "yorkshire",
    "great britain",
    "remote, uk",
];

const UK_REMOTE_QUALIFIERS: [&str; 2] = ["remote - uk", "hybrid - uk"];

static UK_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(uk|gb)\b").expect("uk code pattern compiles"));

static REMOTE_TERM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(worldwide|global|anywhere|international|europe|emea|remote|hybrid|remote/hybrid)\b")
        .expect("remote term pattern compiles")
});

pub struct UkLocationFilter {
    keep_ambiguous_remote: bool,
}

impl UkLocationFilter {
    pub fn new(keep_ambiguous_remote: bool) -> Self {
        Self {
            keep_ambiguous_remote,
        }
    }

    pub fn classify(&self, location: &str, remote_flag: bool) -> LocationClass {
        let lower = location.to_lowercase();
        let lower = lower.trim();

        if NON_UK_ONLY_MARKERS.iter().any(|m| lower.contains(m)) {
            return LocationClass::NonUk;
        }
        if UK_PLACES.iter().any(|p| lower.contains(p))
            || UK_REMOTE_QUALIFIERS.iter().any(|q| lower.contains(q))
            || UK_CODE_RE.is_match(lower)
        {
            return LocationClass::Uk;
        }
        if REMOTE_TERM_RE.is_match(lower) || remote_flag {
            return LocationClass::AmbiguousRemote;
        }
        LocationClass::NonUk
    }

    pub fn keeps(&self, class: LocationClass) -> bool {
        match class {
            LocationClass::Uk => true,
            LocationClass::NonUk => false,
            LocationClass::AmbiguousRemote => self.keep_ambiguous_remote,
        }
    }
}

// ---------------------------------------------------------------------------
// Two-phase deduplication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub fuzzy_threshold: f64,
    pub fuzzy_window_days: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.92,
            fuzzy_window_days: 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    DuplicateOf(Uuid),
    Fresh,
}

struct AcceptedEntry {
    id: Uuid,
    norm_title: String,
    norm_location: String,
}

/// Run-scoped dedup state. Phase 1 is exact fingerprint identity (in-run
/// set first, then the store); phase 2 is fuzzy similarity over records
/// with the same company key inside the comparison window.
pub struct Deduplicator {
    config: DedupConfig,
    seen_fingerprints: HashMap<String, Uuid>,
    accepted_by_company: HashMap<String, Vec<AcceptedEntry>>,
}

/// Title dominates; location breaks ties between a company's near-identical
/// postings.
pub fn composite_similarity(
    title_a: &str,
    title_b: &str,
    location_a: &str,
    location_b: &str,
) -> f64 {
    0.7 * strsim::jaro_winkler(title_a, title_b) + 0.3 * strsim::jaro_winkler(location_a, location_b)
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            seen_fingerprints: HashMap::new(),
            accepted_by_company: HashMap::new(),
        }
    }

    pub async fn check(
        &mut self,
        store: &dyn JobStore,
        candidate: &CandidateJob,
        run_date: NaiveDate,
    ) -> Result<DedupOutcome, StorageError> {
        // Phase 1: exact fingerprint identity.
        if let Some(id) = self.seen_fingerprints.get(&candidate.content_fingerprint) {
            return Ok(DedupOutcome::DuplicateOf(*id));
        }
        if let Some(existing) = store
            .find_by_fingerprint(&candidate.content_fingerprint)
            .await?
        {
            self.seen_fingerprints
                .insert(candidate.content_fingerprint.clone(), existing.id);
            return Ok(DedupOutcome::DuplicateOf(existing.id));
        }

        // Phase 2: fuzzy, scoped to the same company key.
        let since = run_date - Duration::days(self.config.fuzzy_window_days);
        let mut best: Option<(f64, Uuid)> = None;
        for record in store
            .recent_by_company(&candidate.company_key, since)
            .await?
        {
            let score = composite_similarity(
                &candidate.norm_title,
                &normalize_text(&record.title),
                &candidate.norm_location,
                &normalize_text(&record.location),
            );
            if best.is_none_or(|(b, _)| score > b) {
                best = Some((score, record.id));
            }
        }
        if let Some(entries) = self.accepted_by_company.get(&candidate.company_key) {
            for entry in entries {
                let score = composite_similarity(
                    &candidate.norm_title,
                    &entry.norm_title,
                    &candidate.norm_location,
                    &entry.norm_location,
                );
                if best.is_none_or(|(b, _)| score > b) {
                    best = Some((score, entry.id));
                }
            }
        }

        match best {
            Some((score, id)) if score >= self.config.fuzzy_threshold => {
                debug!(score, "fuzzy duplicate");
                Ok(DedupOutcome::DuplicateOf(id))
            }
            _ => Ok(DedupOutcome::Fresh),
        }
    }

    /// Register a freshly persisted record so later listings in the same
    /// run dedup against it.
    pub fn record_accepted(&mut self, candidate: &CandidateJob, id: Uuid) {
        self.seen_fingerprints
            .insert(candidate.content_fingerprint.clone(), id);
        self.accepted_by_company
            .entry(candidate.company_key.clone())
            .or_default()
            .push(AcceptedEntry {
                id,
                norm_title: candidate.norm_title.clone(),
                norm_location: candidate.norm_location.clone(),
            });
    }
}

// ---------------------------------------------------------------------------
// Scrape coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("a scrape run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type AdapterFactory = Box<dyn Fn() -> Vec<Box<dyn SourceAdapter>> + Send + Sync>;

pub struct ScrapeCoordinator {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    http: Arc<HttpFetcher>,
    companies: Vec<TargetCompany>,
    adapter_factory: AdapterFactory,
    run_lock: Mutex<()>,
    latest: RwLock<Option<ScrapeRun>>,
}

impl ScrapeCoordinator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        http: Arc<HttpFetcher>,
        companies: Vec<TargetCompany>,
    ) -> Self {
        let adapter_config = config.adapter_config();
        Self::with_adapters(
            config,
            store,
            http,
            companies,
            Box::new(move || registered_adapters(&adapter_config)),
        )
    }

    pub fn with_adapters(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        http: Arc<HttpFetcher>,
        companies: Vec<TargetCompany>,
        adapter_factory: AdapterFactory,
    ) -> Self {
        Self {
            config,
            store,
            http,
            companies,
            adapter_factory,
            run_lock: Mutex::new(()),
            latest: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn companies(&self) -> &[TargetCompany] {
        &self.companies
    }

    /// Latest run, terminal or in-flight. `None` until the first trigger.
    pub async fn latest_run(&self) -> Option<ScrapeRun> {
        self.latest.read().await.clone()
    }

    /// Run the full pipeline once. Single-flight: a concurrent call gets
    /// `ScrapeError::AlreadyRunning` immediately instead of queueing.
    pub async fn trigger(&self, run_date: Option<NaiveDate>) -> Result<ScrapeRun, ScrapeError> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Err(ScrapeError::AlreadyRunning);
        };

        let run_date = run_date.unwrap_or_else(|| Utc::now().date_naive());
        let mut run = ScrapeRun::started(run_date);
        info!(run_id = %run.id, %run_date, "scrape run started");
        *self.latest.write().await = Some(run.clone());

        let outcome = self.execute(&mut run, run_date).await;
        run.finished_at = Some(Utc::now());
        match &outcome {
            Ok(()) => {
                run.status = RunStatus::Completed;
                info!(
                    run_id = %run.id,
                    jobs_found = run.jobs_found,
                    new_jobs = run.new_jobs,
                    duplicates = run.duplicates,
                    failed_sources = run.failed_sources.len(),
                    "scrape run completed"
                );
            }
            Err(err) => {
                run.status = RunStatus::Failed;
                run.error = Some(err.to_string());
                warn!(run_id = %run.id, error = %err, "scrape run failed");
            }
        }
        *self.latest.write().await = Some(run.clone());
        outcome.map(|()| run)
    }

    async fn execute(&self, run: &mut ScrapeRun, run_date: NaiveDate) -> Result<(), ScrapeError> {
        let queries: Vec<String> = GENERAL_QUERIES.iter().map(|q| q.to_string()).collect();
        let limit = Arc::new(Semaphore::new(self.config.source_concurrency.max(1)));

        type SourceBatch = (String, Result<Vec<RawListing>, ukjobs_adapters::AdapterError>);
        let mut join_set: JoinSet<SourceBatch> = JoinSet::new();
        for adapter in (self.adapter_factory)() {
            let source = adapter.source_id().to_string();
            if !adapter.is_available() {
                info!(source = source.as_str(), "source skipped (not configured)");
                run.failed_sources.push(source);
                continue;
            }
            let http = Arc::clone(&self.http);
            let companies = self.companies.clone();
            let queries = queries.clone();
            let limit = Arc::clone(&limit);
            join_set.spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let result = adapter.fetch(&http, &companies, &queries).await;
                (source, result)
            });
        }

        let filter = UkLocationFilter::new(self.config.keep_ambiguous_remote);
        let mut dedup = Deduplicator::new(self.config.dedup_config());
        let mut dropped_invalid = 0usize;
        let mut dropped_location = 0usize;

        while let Some(joined) = join_set.join_next().await {
            let (source, result) = match joined {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(error = %err, "source task aborted");
                    continue;
                }
            };
            let listings = match result {
                Ok(listings) => {
                    info!(
                        source = source.as_str(),
                        count = listings.len(),
                        "source returned listings"
                    );
                    listings
                }
                Err(err) => {
                    warn!(source = source.as_str(), error = %err, "source failed");
                    run.failed_sources.push(source);
                    continue;
                }
            };

            run.jobs_found += listings.len();
            for raw in &listings {
                let candidate = match normalize_listing(raw) {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        debug!(source = source.as_str(), error = %err, "listing dropped");
                        dropped_invalid += 1;
                        continue;
                    }
                };
                let class = filter.classify(&candidate.listing.location, candidate.listing.remote);
                if !filter.keeps(class) {
                    dropped_location += 1;
                    continue;
                }

                match dedup.check(self.store.as_ref(), &candidate, run_date).await? {
                    DedupOutcome::DuplicateOf(existing_id) => {
                        self.store.touch_last_seen(existing_id, run_date).await?;
                        run.duplicates += 1;
                    }
                    DedupOutcome::Fresh => {
                        let record = candidate.to_record(run_date);
                        self.store.insert(&record).await?;
                        dedup.record_accepted(&candidate, record.id);
                        run.new_jobs += 1;
                    }
                }
            }
        }

        info!(
            dropped_invalid,
            dropped_location, "pipeline filtering summary"
        );
        Ok(())
    }
}

/// Daily scheduler for the scrape run, built only when enabled.
pub async fn maybe_build_scheduler(
    coordinator: Arc<ScrapeCoordinator>,
    config: &EngineConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.scrape_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let coordinator = Arc::clone(&coordinator);
        Box::pin(async move {
            match coordinator.trigger(None).await {
                Ok(run) => info!(
                    new_jobs = run.new_jobs,
                    duplicates = run.duplicates,
                    "scheduled scrape run finished"
                ),
                Err(ScrapeError::AlreadyRunning) => {
                    warn!("scheduled scrape skipped; a run is already in progress")
                }
                Err(err) => warn!(error = %err, "scheduled scrape run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

pub struct Pipeline {
    pub config: EngineConfig,
    pub store: Arc<dyn JobStore>,
    pub coordinator: Arc<ScrapeCoordinator>,
}

pub async fn build(config: EngineConfig) -> Result<Pipeline> {
    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgJobStore::connect(url)
                .await
                .context("connecting to postgres")?,
        ),
        None => {
            info!("DATABASE_URL unset; using the in-memory store");
            Arc::new(MemoryJobStore::new())
        }
    };
    let http = Arc::new(HttpFetcher::new(config.http_config()).context("building http client")?);

    let companies = match load_target_companies(&config.companies_file).await {
        Ok(companies) => {
            info!(count = companies.len(), "target companies loaded");
            companies
        }
        Err(err) => {
            warn!(error = %err, "target companies unavailable; continuing with none");
            Vec::new()
        }
    };

    let coordinator = Arc::new(ScrapeCoordinator::new(
        config.clone(),
        Arc::clone(&store),
        http,
        companies,
    ));
    Ok(Pipeline {
        config,
        store,
        coordinator,
    })
}

pub async fn build_from_env() -> Result<Pipeline> {
    build(EngineConfig::from_env()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Write;
    use ukjobs_adapters::AdapterError;

    fn test_config() -> EngineConfig {
        EngineConfig {
            database_url: None,
            companies_file: PathBuf::from("/nonexistent"),
            request_delay_min_ms: 0,
            request_delay_max_ms: 1,
            max_pages_per_source: 2,
            max_results_per_company: 10,
            fuzzy_threshold: 0.92,
            fuzzy_window_days: 14,
            keep_ambiguous_remote: false,
            source_concurrency: 3,
            scheduler_enabled: false,
            scrape_cron: "0 0 6 * * *".into(),
            user_agent: "ukjobs-test".into(),
            http_timeout_secs: 5,
            adzuna_app_id: None,
            adzuna_api_key: None,
            reed_api_key: None,
        }
    }

    fn listing(title: &str, company: &str, location: &str, url: &str, source: &str) -> RawListing {
        RawListing::new(title, company, location, url, source)
    }

    #[test]
    fn tracking_params_do_not_change_identity() {
        let plain = canonicalize_url("https://example.com/jobs/42");
        assert_eq!(
            canonicalize_url("https://example.com/jobs/42?utm_source=x&utm_campaign=y"),
            plain
        );
        assert_eq!(canonicalize_url("https://example.com/jobs/42#apply"), plain);
        assert_eq!(canonicalize_url("https://example.com/jobs/42/"), plain);
        assert_eq!(
            fingerprint_url("https://EXAMPLE.com/jobs/42?ref=feed"),
            fingerprint_url("https://example.com/jobs/42")
        );
    }

    #[test]
    fn path_case_is_preserved_host_case_is_not() {
        let canonical = canonicalize_url("HTTPS://Example.COM/Jobs/Rust-Dev");
        assert!(canonical.starts_with("https://example.com/"));
        assert!(canonical.contains("/Jobs/Rust-Dev"));
    }

    #[test]
    fn meaningful_query_params_survive() {
        let a = canonicalize_url("https://example.com/search?id=7&utm_medium=email");
        let b = canonicalize_url("https://example.com/search?id=8");
        assert!(a.contains("id=7"));
        assert_ne!(fingerprint_url(&a), fingerprint_url(&b));
    }

    #[test]
    fn unparseable_url_falls_back_to_lowercase() {
        assert_eq!(canonicalize_url("  Not A Url  "), "not a url");
    }

    #[test]
    fn fingerprints_are_32_hex_chars() {
        let fp = fingerprint_url("https://example.com/jobs/1");
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn text_normalization_collapses_noise() {
        assert_eq!(normalize_text("  Señor  Engineer!!  "), "seor engineer");
        assert_eq!(normalize_text("Google, Inc."), "google inc");
        assert_eq!(normalize_text("London / UK"), "london uk");
    }

    #[test]
    fn normalize_rejects_blank_required_fields() {
        let raw = listing("Engineer", "   ", "London", "https://x.com/1", "reed");
        assert_eq!(
            normalize_listing(&raw),
            Err(ValidationError::MissingField("company"))
        );
        let ok = normalize_listing(&listing(
            " Engineer ",
            "Acme",
            "London",
            "https://x.com/1",
            "reed",
        ))
        .unwrap();
        assert_eq!(ok.listing.title, "Engineer");
        assert_eq!(ok.company_key, "acme");
    }

    #[test]
    fn uk_filter_classification() {
        let filter = UkLocationFilter::new(false);
        assert_eq!(filter.classify("London, UK", false), LocationClass::Uk);
        assert_eq!(filter.classify("Remote, UK", true), LocationClass::Uk);
        assert_eq!(filter.classify("Manchester", false), LocationClass::Uk);
        assert_eq!(
            filter.classify("Berlin, Germany", false),
            LocationClass::NonUk
        );
        assert_eq!(filter.classify("USA only", false), LocationClass::NonUk);
        assert_eq!(
            filter.classify("Remote", false),
            LocationClass::AmbiguousRemote
        );
        assert_eq!(
            filter.classify("Worldwide", true),
            LocationClass::AmbiguousRemote
        );
        // word boundary: no false positive from substrings
        assert_eq!(filter.classify("Lukow, Poland", false), LocationClass::NonUk);

        assert!(!filter.keeps(LocationClass::AmbiguousRemote));
        assert!(UkLocationFilter::new(true).keeps(LocationClass::AmbiguousRemote));
    }

    #[tokio::test]
    async fn exact_dedup_collapses_cross_source_sightings() {
        let store = MemoryJobStore::new();
        let mut dedup = Deduplicator::new(DedupConfig::default());
        let today = NaiveDate::from_ymd_opt(2026, 8, 29).unwrap();

        let first = normalize_listing(&listing(
            "Engineer",
            "Acme",
            "London, UK",
            "https://acme.com/jobs/1",
            "reed",
        ))
        .unwrap();
        assert_eq!(
            dedup.check(&store, &first, today).await.unwrap(),
            DedupOutcome::Fresh
        );
        let record = first.to_record(today);
        store.insert(&record).await.unwrap();
        dedup.record_accepted(&first, record.id);

        // same URL modulo tracking params, different source
        let second = normalize_listing(&listing(
            "Engineer",
            "Acme",
            "London, UK",
            "https://acme.com/jobs/1?utm_source=adzuna",
            "adzuna",
        ))
        .unwrap();
        assert_eq!(
            dedup.check(&store, &second, today).await.unwrap(),
            DedupOutcome::DuplicateOf(record.id)
        );
    }

    #[tokio::test]
    async fn fuzzy_dedup_collapses_near_identical_titles() {
        let store = MemoryJobStore::new();
        let mut dedup = Deduplicator::new(DedupConfig::default());
        let today = NaiveDate::from_ymd_opt(2026, 8, 29).unwrap();

        let stored = normalize_listing(&listing(
            "Software Engineer",
            "Google",
            "London",
            "https://careers.google.com/jobs/1",
            "websearch",
        ))
        .unwrap();
        let record = stored.to_record(today);
        store.insert(&record).await.unwrap();

        let near = normalize_listing(&listing(
            "Software Engineer",
            "Google",
            "London, UK",
            "https://linkedin.com/jobs/view/999",
            "websearch",
        ))
        .unwrap();
        assert_eq!(
            dedup.check(&store, &near, today).await.unwrap(),
            DedupOutcome::DuplicateOf(record.id)
        );

        // different company key never collapses, whatever the title
        let other = normalize_listing(&listing(
            "Software Engineer",
            "Deepmind",
            "London, UK",
            "https://deepmind.com/jobs/1",
            "websearch",
        ))
        .unwrap();
        assert_eq!(
            dedup.check(&store, &other, today).await.unwrap(),
            DedupOutcome::Fresh
        );
    }

    #[tokio::test]
    async fn fuzzy_window_excludes_old_records() {
        let store = MemoryJobStore::new();
        let mut dedup = Deduplicator::new(DedupConfig::default());
        let old_day = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 8, 29).unwrap();

        let stored = normalize_listing(&listing(
            "Data Scientist",
            "Acme",
            "Leeds, UK",
            "https://acme.com/jobs/ds",
            "reed",
        ))
        .unwrap();
        store.insert(&stored.to_record(old_day)).await.unwrap();

        let similar = normalize_listing(&listing(
            "Data Scientist",
            "Acme",
            "Leeds",
            "https://boards.example.com/acme/ds",
            "adzuna",
        ))
        .unwrap();
        assert_eq!(
            dedup.check(&store, &similar, today).await.unwrap(),
            DedupOutcome::Fresh
        );
    }

    struct StubAdapter {
        name: &'static str,
        listings: Vec<RawListing>,
        delay_ms: u64,
    }

    #[async_trait]
    impl SourceAdapter for StubAdapter {
        fn source_id(&self) -> &'static str {
            self.name
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _companies: &[TargetCompany],
            _general_queries: &[String],
        ) -> Result<Vec<RawListing>, AdapterError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            Ok(self.listings.clone())
        }
    }

    struct FailingAdapter;

    #[async_trait]
    impl SourceAdapter for FailingAdapter {
        fn source_id(&self) -> &'static str {
            "broken"
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _companies: &[TargetCompany],
            _general_queries: &[String],
        ) -> Result<Vec<RawListing>, AdapterError> {
            Err(AdapterError::Message("boom".into()))
        }
    }

    fn coordinator_with(
        store: Arc<dyn JobStore>,
        factory: AdapterFactory,
    ) -> ScrapeCoordinator {
        let config = test_config();
        let http = Arc::new(HttpFetcher::new(config.http_config()).unwrap());
        ScrapeCoordinator::with_adapters(config, store, http, Vec::new(), factory)
    }

    fn sample_listings() -> Vec<RawListing> {
        vec![
            listing(
                "Rust Engineer",
                "Acme",
                "London, UK",
                "https://acme.com/jobs/rust",
                "stub",
            ),
            listing(
                "Rust Engineer",
                "Acme",
                "London, UK",
                "https://acme.com/jobs/rust?utm_source=feed",
                "stub",
            ),
            listing(
                "Backend Engineer",
                "Initech",
                "Austin, Texas",
                "https://initech.com/jobs/1",
                "stub",
            ),
        ]
    }

    #[tokio::test]
    async fn rerun_on_same_day_adds_nothing_new() {
        let store = Arc::new(MemoryJobStore::new());
        let coordinator = coordinator_with(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Box::new(|| {
                vec![Box::new(StubAdapter {
                    name: "stub",
                    listings: sample_listings(),
                    delay_ms: 0,
                }) as Box<dyn SourceAdapter>]
            }),
        );
        let day = NaiveDate::from_ymd_opt(2026, 8, 29).unwrap();

        let first = coordinator.trigger(Some(day)).await.unwrap();
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(first.jobs_found, 3);
        // tracking-param twin collapsed, non-UK listing filtered out
        assert_eq!(first.new_jobs, 1);
        assert_eq!(first.duplicates, 1);
        assert_eq!(store.len().await, 1);

        let second = coordinator.trigger(Some(day)).await.unwrap();
        assert_eq!(second.new_jobs, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn later_sighting_advances_last_seen_only() {
        let store = Arc::new(MemoryJobStore::new());
        let coordinator = coordinator_with(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Box::new(|| {
                vec![Box::new(StubAdapter {
                    name: "stub",
                    listings: vec![listing(
                        "Rust Engineer",
                        "Acme",
                        "London, UK",
                        "https://acme.com/jobs/rust",
                        "stub",
                    )],
                    delay_ms: 0,
                }) as Box<dyn SourceAdapter>]
            }),
        );
        let day1 = NaiveDate::from_ymd_opt(2026, 8, 28).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 8, 29).unwrap();

        coordinator.trigger(Some(day1)).await.unwrap();
        coordinator.trigger(Some(day2)).await.unwrap();

        assert_eq!(store.len().await, 1);
        let fp = fingerprint_url("https://acme.com/jobs/rust");
        let record = store.find_by_fingerprint(&fp).await.unwrap().unwrap();
        assert_eq!(record.first_seen_date, day1);
        assert_eq!(record.last_seen_date, day2);
        assert_eq!(record.scrape_date, day1);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected() {
        let store = Arc::new(MemoryJobStore::new());
        let coordinator = Arc::new(coordinator_with(
            store as Arc<dyn JobStore>,
            Box::new(|| {
                vec![Box::new(StubAdapter {
                    name: "slow",
                    listings: Vec::new(),
                    delay_ms: 300,
                }) as Box<dyn SourceAdapter>]
            }),
        ));

        let bg = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.trigger(None).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(matches!(
            coordinator.trigger(None).await,
            Err(ScrapeError::AlreadyRunning)
        ));
        let finished = bg.await.unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Completed);
        // after the run finishes the lock is free again
        assert!(coordinator.trigger(None).await.is_ok());
    }

    #[tokio::test]
    async fn failed_source_is_recorded_not_fatal() {
        let store = Arc::new(MemoryJobStore::new());
        let coordinator = coordinator_with(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Box::new(|| {
                vec![
                    Box::new(FailingAdapter) as Box<dyn SourceAdapter>,
                    Box::new(StubAdapter {
                        name: "stub",
                        listings: vec![listing(
                            "Rust Engineer",
                            "Acme",
                            "London, UK",
                            "https://acme.com/jobs/rust",
                            "stub",
                        )],
                        delay_ms: 0,
                    }) as Box<dyn SourceAdapter>,
                ]
            }),
        );

        let run = coordinator.trigger(None).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.failed_sources, vec!["broken".to_string()]);
        assert_eq!(run.new_jobs, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn status_reports_latest_run() {
        let store = Arc::new(MemoryJobStore::new());
        let coordinator = coordinator_with(
            store as Arc<dyn JobStore>,
            Box::new(|| Vec::new()),
        );
        assert!(coordinator.latest_run().await.is_none());
        let run = coordinator.trigger(None).await.unwrap();
        let latest = coordinator.latest_run().await.unwrap();
        assert_eq!(latest.id, run.id);
        assert!(latest.status.is_terminal());
    }

    #[tokio::test]
    async fn companies_load_priority_first() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "- name: Acme\n- name: Monzo\n  priority: true\n- name: Globex"
        )
        .unwrap();
        let companies = load_target_companies(file.path()).await.unwrap();
        assert_eq!(companies[0].name, "Monzo");
        assert!(companies[0].priority);
        assert_eq!(companies.len(), 3);
    }
}
