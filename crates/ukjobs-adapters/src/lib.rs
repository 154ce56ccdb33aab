//! Source adapter contracts + per-source implementations.
//!
//! Each adapter turns one upstream (a job-board API or the open web via
//! DuckDuckGo's HTML endpoint) into a batch of [`RawListing`]s. Adapters
//! never touch the store; the pipeline downstream owns filtering and
//! dedup. A query that fails inside a multi-query adapter is logged and
//! skipped, the adapter keeps whatever it already collected.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use ukjobs_core::{RawListing, TargetCompany};
use ukjobs_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "ukjobs-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source not configured")]
    Unavailable,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload: {0}")]
    Payload(String),
    #[error("{0}")]
    Message(String),
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Payload(err.to_string())
    }
}

/// Keys and limits shared by every adapter. API keys are optional; an
/// adapter whose key is absent reports itself unavailable and is skipped.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub adzuna_app_id: Option<String>,
    pub adzuna_api_key: Option<String>,
    pub reed_api_key: Option<String>,
    pub max_pages_per_source: usize,
    pub max_results_per_company: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            adzuna_app_id: None,
            adzuna_api_key: None,
            reed_api_key: None,
            max_pages_per_source: 10,
            max_results_per_company: 50,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Whether the adapter has everything it needs to run (e.g. API keys).
    fn is_available(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        companies: &[TargetCompany],
        general_queries: &[String],
    ) -> Result<Vec<RawListing>, AdapterError>;
}

/// All adapters, ordered by expected yield. Free sources first, API-key
/// sources last.
pub fn registered_adapters(config: &AdapterConfig) -> Vec<Box<dyn SourceAdapter>> {
    vec![
        Box::new(DevItJobsAdapter),
        Box::new(TheMuseAdapter {
            max_pages: config.max_pages_per_source,
        }),
        Box::new(WebSearchAdapter),
        Box::new(JobicyAdapter),
        Box::new(RemotiveAdapter),
        Box::new(AdzunaAdapter {
            app_id: config.adzuna_app_id.clone(),
            api_key: config.adzuna_api_key.clone(),
            max_pages: config.max_pages_per_source,
        }),
        Box::new(ReedAdapter {
            api_key: config.reed_api_key.clone(),
            max_results_per_query: config.max_results_per_company,
        }),
    ]
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, AdapterError> {
    Ok(serde_json::from_slice(body)?)
}

fn valid(listing: &RawListing) -> bool {
    !listing.title.is_empty()
        && !listing.company.is_empty()
        && !listing.location.is_empty()
        && !listing.url.is_empty()
}

fn trimmed(value: &str) -> String {
    value.trim().to_string()
}

fn opt_trimmed(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(Into::into)
}

// ---------------------------------------------------------------------------
// Controlled-vocabulary guessers shared by title-only sources
// ---------------------------------------------------------------------------

/// Seniority from title keywords. Checked in priority order so that e.g.
/// "Senior Engineering Manager" lands on Senior Level, not Manager.
pub fn experience_from_title(title: &str) -> Option<&'static str> {
    let t = title.to_lowercase();
    let hit = |keys: &[&str]| keys.iter().any(|k| t.contains(k));
    if hit(&["senior", "sr.", "sr ", "lead", "principal", "staff"]) {
        Some("Senior Level")
    } else if hit(&[
        "junior",
        "jr.",
        "jr ",
        "entry",
        "graduate",
        "trainee",
        "intern",
        "apprentice",
    ]) {
        Some("Entry Level")
    } else if hit(&["mid", "intermediate"]) {
        Some("Mid Level")
    } else if hit(&[
        "director",
        "head of",
        "vp ",
        "vice president",
        "chief",
        "cto",
        "cfo",
    ]) {
        Some("Director / Executive")
    } else if t.contains("manager") {
        Some("Manager")
    } else {
        None
    }
}

pub fn category_from_title(title: &str) -> Option<&'static str> {
    const MAPPING: &[(&[&str], &str)] = &[
        (
            &[
                "software",
                "developer",
                "engineer",
                "frontend",
                "backend",
                "full-stack",
                "fullstack",
                "devops",
                "sre",
                "platform",
            ],
            "Technology",
        ),
        (
            &[
                "data scientist",
                "data engineer",
                "data analyst",
                "machine learning",
                "ai ",
                "artificial intelligence",
                "ml ",
            ],
            "Data & AI",
        ),
        (
            &["product manager", "product owner", "product lead"],
            "Product",
        ),
        (&["designer", "ux", "ui", "design"], "Design"),
        (
            &[
                "finance",
                "accountant",
                "auditor",
                "actuary",
                "tax",
                "investment",
                "banking",
            ],
            "Finance",
        ),
        (
            &["solicitor", "lawyer", "legal", "paralegal", "barrister"],
            "Legal",
        ),
        (&["consultant", "consulting", "advisory"], "Consulting"),
        (&["marketing", "seo", "content", "brand"], "Marketing"),
        (
            &["sales", "business development", "account executive"],
            "Sales",
        ),
        (
            &["nurse", "doctor", "clinical", "medical", "healthcare", "nhs"],
            "Healthcare",
        ),
        (
            &["mechanical", "electrical", "civil", "structural", "chemical"],
            "Engineering",
        ),
        (
            &["cyber", "security", "infosec", "penetration"],
            "Cybersecurity",
        ),
        (
            &["project manager", "programme manager", "scrum", "delivery"],
            "Project Management",
        ),
        (
            &["analyst", "research", "quantitative"],
            "Research & Analysis",
        ),
    ];
    let t = title.to_lowercase();
    // First group whose substring matches wins, in mapping order. Technology
    // comes first, so data roles with engineering titles land there.
    MAPPING
        .iter()
        .find(|(keys, _)| keys.iter().any(|k| t.contains(k)))
        .map(|(_, cat)| *cat)
}

pub fn job_type_from_text(text: &str) -> Option<String> {
    let t = text.to_lowercase();
    let mut parts = Vec::new();
    if t.contains("full-time") || t.contains("full time") || t.contains("permanent") {
        parts.push("Full-time");
    }
    if t.contains("part-time") || t.contains("part time") {
        parts.push("Part-time");
    }
    if t.contains("contract") {
        parts.push("Contract");
    }
    if t.contains("freelance") {
        parts.push("Freelance");
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// DevITjobs: UK tech board, free bulk API
// ---------------------------------------------------------------------------

pub struct DevItJobsAdapter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevItJob {
    #[serde(default)]
    name: String,
    #[serde(default)]
    company: String,
    #[serde(default)]
    actual_city: String,
    #[serde(default)]
    workplace: String,
    #[serde(default)]
    job_url: String,
    annual_salary_from: Option<f64>,
    annual_salary_to: Option<f64>,
    exp_level: Option<String>,
    #[serde(default)]
    technologies: Vec<String>,
    tech_category: Option<String>,
    job_type: Option<String>,
}

fn format_gbp(amount: f64) -> String {
    let n = amount.round() as i64;
    let digits = n.abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if n < 0 {
        format!("£-{grouped}")
    } else {
        format!("£{grouped}")
    }
}

impl DevItJobsAdapter {
    const API_URL: &'static str = "https://devitjobs.uk/api/jobsLight";

    fn listing_from(item: &DevItJob) -> Option<RawListing> {
        let title = trimmed(&item.name);
        let company = trimmed(&item.company);
        if title.is_empty() || company.is_empty() || item.job_url.is_empty() {
            return None;
        }

        let mut location_parts = Vec::new();
        let city = trimmed(&item.actual_city);
        if !city.is_empty() {
            location_parts.push(city);
        }
        let workplace = item.workplace.trim().to_lowercase();
        if !workplace.is_empty() {
            location_parts.push(title_case(&workplace));
        }
        location_parts.push("UK".to_string());

        let salary = match (item.annual_salary_from, item.annual_salary_to) {
            (Some(from), Some(to)) => Some(format!("{} – {}", format_gbp(from), format_gbp(to))),
            (Some(from), None) => Some(format!("From {}", format_gbp(from))),
            _ => None,
        };

        let experience_level = item.exp_level.as_deref().map(|level| match level {
            "Junior" => "Entry Level".to_string(),
            "Regular" => "Mid Level".to_string(),
            "Senior" => "Senior Level".to_string(),
            "Lead" => "Lead / Principal".to_string(),
            other => other.to_string(),
        });

        let category = if item.technologies.is_empty() {
            item.tech_category.clone()
        } else {
            Some(item.technologies[..item.technologies.len().min(3)].join(", "))
        };

        let base_type = item.job_type.clone().unwrap_or_else(|| "Full-Time".into());
        let job_type = match workplace.as_str() {
            "remote" => format!("Remote, {base_type}"),
            "hybrid" => format!("Hybrid, {base_type}"),
            _ => base_type,
        };

        let mut listing = RawListing::new(
            title,
            company,
            location_parts.join(", "),
            format!("https://devitjobs.uk/jobs/{}", item.job_url),
            "devitjobs",
        );
        listing.salary = salary;
        listing.category = category;
        listing.experience_level = experience_level;
        listing.job_type = Some(job_type);
        listing.remote = workplace == "remote";
        Some(listing)
    }
}

#[async_trait]
impl SourceAdapter for DevItJobsAdapter {
    fn source_id(&self) -> &'static str {
        "devitjobs"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        _companies: &[TargetCompany],
        _general_queries: &[String],
    ) -> Result<Vec<RawListing>, AdapterError> {
        let resp = http.get(self.source_id(), Self::API_URL, &[]).await?;
        let items: Vec<DevItJob> = parse_json(&resp.body)?;
        info!(count = items.len(), "devitjobs returned listings");

        let jobs: Vec<RawListing> = items
            .iter()
            .filter_map(DevItJobsAdapter::listing_from)
            .filter(valid)
            .collect();
        info!(count = jobs.len(), "devitjobs listings extracted");
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// The Muse: free API, paged per location
// ---------------------------------------------------------------------------

pub struct TheMuseAdapter {
    pub max_pages: usize,
}

#[derive(Debug, Deserialize)]
struct MuseResponse {
    #[serde(default)]
    results: Vec<MuseJob>,
    #[serde(default)]
    page_count: usize,
}

#[derive(Debug, Deserialize)]
struct MuseJob {
    id: Option<i64>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    company: MuseCompany,
    #[serde(default)]
    locations: Vec<MuseNamed>,
    #[serde(default)]
    levels: Vec<MuseNamed>,
    #[serde(default)]
    categories: Vec<MuseNamed>,
    #[serde(default)]
    refs: MuseRefs,
    #[serde(default)]
    short_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct MuseCompany {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct MuseNamed {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct MuseRefs {
    #[serde(default)]
    landing_page: String,
}

impl TheMuseAdapter {
    const BASE_URL: &'static str = "https://www.themuse.com/api/public/jobs";

    // "London" and "United Kingdom" cover most UK listings; the remote
    // bucket catches remote roles from UK-based companies.
    const UK_LOCATIONS: [&'static str; 3] = [
        "London, United Kingdom",
        "United Kingdom",
        "Flexible / Remote",
    ];

    fn listing_from(item: &MuseJob, fallback_location: &str) -> Option<RawListing> {
        let company = trimmed(&item.company.name);
        let title = trimmed(&item.name);

        let loc_names: Vec<&str> = item
            .locations
            .iter()
            .map(|l| l.name.as_str())
            .filter(|n| !n.is_empty())
            .collect();
        let location = if loc_names.is_empty() {
            fallback_location.to_string()
        } else {
            loc_names.join(", ")
        };

        let mut url = item.refs.landing_page.clone();
        if url.is_empty() && !item.short_name.is_empty() {
            url = format!(
                "https://www.themuse.com/jobs/{}/{}",
                company.to_lowercase().replace(' ', "-"),
                item.short_name
            );
        }

        let job_type = {
            let text = format!("{title} {location}").to_lowercase();
            let mut parts = Vec::new();
            if text.contains("flexible") || text.contains("remote") {
                parts.push("Remote");
            }
            if text.contains("part-time") || text.contains("part time") {
                parts.push("Part-time");
            }
            if text.contains("contract") {
                parts.push("Contract");
            }
            if text.contains("intern") {
                parts.push("Internship");
            }
            if parts.is_empty() {
                parts.push("Full-time");
            }
            parts.join(", ")
        };

        let mut listing = RawListing::new(title, company, location, url, "themuse");
        listing.experience_level = item
            .levels
            .first()
            .map(|l| l.name.clone())
            .filter(|n| !n.is_empty());
        listing.category = item
            .categories
            .first()
            .map(|c| c.name.clone())
            .filter(|n| !n.is_empty());
        listing.remote = job_type.contains("Remote");
        listing.job_type = Some(job_type);
        Some(listing).filter(valid)
    }
}

#[async_trait]
impl SourceAdapter for TheMuseAdapter {
    fn source_id(&self) -> &'static str {
        "themuse"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        _companies: &[TargetCompany],
        _general_queries: &[String],
    ) -> Result<Vec<RawListing>, AdapterError> {
        let mut jobs = Vec::new();
        let mut seen_ids: HashSet<i64> = HashSet::new();
        let mut errors = 0usize;

        for location in Self::UK_LOCATIONS {
            let mut found_here = 0usize;
            for page in 0..self.max_pages {
                let params = [
                    ("location", location.to_string()),
                    ("page", page.to_string()),
                ];
                let resp = match http.get(self.source_id(), Self::BASE_URL, &params).await {
                    Ok(resp) => resp,
                    Err(err) => {
                        warn!(location, page, error = %err, "themuse page fetch failed");
                        errors += 1;
                        break;
                    }
                };
                let data: MuseResponse = match parse_json(&resp.body) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(location, page, error = %err, "themuse payload unreadable");
                        errors += 1;
                        break;
                    }
                };
                if data.results.is_empty() {
                    break;
                }

                for item in &data.results {
                    if let Some(id) = item.id {
                        if !seen_ids.insert(id) {
                            continue;
                        }
                    }
                    if let Some(listing) = Self::listing_from(item, location) {
                        jobs.push(listing);
                        found_here += 1;
                    }
                }

                if page + 1 >= data.page_count {
                    break;
                }
                http.polite_pause().await;
            }
            info!(location, count = found_here, "themuse location done");
            http.polite_pause().await;
        }

        if jobs.is_empty() && errors > 0 {
            return Err(AdapterError::Message(format!(
                "all themuse locations failed ({errors} errors)"
            )));
        }
        info!(count = jobs.len(), "themuse listings extracted");
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// Jobicy: single-request remote board
// ---------------------------------------------------------------------------

pub struct JobicyAdapter;

#[derive(Debug, Deserialize)]
struct JobicyResponse {
    #[serde(default)]
    jobs: Vec<JobicyJob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobicyJob {
    #[serde(default)]
    job_title: String,
    #[serde(default)]
    company_name: String,
    job_geo: Option<String>,
    #[serde(default)]
    url: String,
    job_industry: Option<StringOrSeq>,
    job_type: Option<StringOrSeq>,
    job_level: Option<String>,
}

/// Jobicy serves some fields as either a string or an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrSeq {
    One(String),
    Many(Vec<String>),
}

impl StringOrSeq {
    fn joined(&self) -> String {
        match self {
            StringOrSeq::One(s) => s.clone(),
            StringOrSeq::Many(items) => items.join(", "),
        }
    }
}

impl JobicyAdapter {
    const API_URL: &'static str = "https://jobicy.com/api/v2/remote-jobs";
    const BROWSER_UA: &'static str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
         AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn normalize_job_type(raw: &str) -> Option<String> {
        let norm = match raw.to_lowercase().trim() {
            "full-time" | "full_time" => "Full-time",
            "part-time" => "Part-time",
            "contract" => "Contract",
            "freelance" => "Freelance",
            "internship" => "Internship",
            "" => return None,
            _ => return Some(raw.to_string()),
        };
        Some(norm.to_string())
    }

    fn listing_from(item: &JobicyJob) -> Option<RawListing> {
        let title = trimmed(&item.job_title);
        let company = trimmed(&item.company_name);
        if title.is_empty() || company.is_empty() || item.url.is_empty() {
            return None;
        }
        let geo = opt_trimmed(item.job_geo.as_deref()).unwrap_or_else(|| "Remote".into());

        let job_type = item
            .job_type
            .as_ref()
            .map(|t| t.joined())
            .and_then(|t| Self::normalize_job_type(&t));

        let mut listing = RawListing::new(title, company, geo, item.url.trim(), "jobicy");
        listing.category = item
            .job_industry
            .as_ref()
            .map(|i| i.joined())
            .filter(|s| !s.is_empty());
        listing.experience_level = opt_trimmed(item.job_level.as_deref());
        listing.job_type = Some(match job_type {
            Some(t) => format!("Remote, {t}"),
            None => "Remote".to_string(),
        });
        listing.remote = true;
        Some(listing)
    }
}

#[async_trait]
impl SourceAdapter for JobicyAdapter {
    fn source_id(&self) -> &'static str {
        "jobicy"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        _companies: &[TargetCompany],
        _general_queries: &[String],
    ) -> Result<Vec<RawListing>, AdapterError> {
        let params = [("count", "50".to_string())];
        let resp = http
            .get_with_user_agent(self.source_id(), Self::API_URL, &params, Self::BROWSER_UA)
            .await?;
        let data: JobicyResponse = parse_json(&resp.body)?;
        info!(count = data.jobs.len(), "jobicy returned listings");

        let jobs: Vec<RawListing> = data
            .jobs
            .iter()
            .filter_map(JobicyAdapter::listing_from)
            .filter(valid)
            .collect();
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// Remotive: single-request remote board
// ---------------------------------------------------------------------------

pub struct RemotiveAdapter;

#[derive(Debug, Deserialize)]
struct RemotiveResponse {
    #[serde(default)]
    jobs: Vec<RemotiveJob>,
}

#[derive(Debug, Deserialize)]
struct RemotiveJob {
    #[serde(default)]
    title: String,
    #[serde(default)]
    company_name: String,
    candidate_required_location: Option<String>,
    #[serde(default)]
    url: String,
    category: Option<String>,
    job_type: Option<String>,
}

impl RemotiveAdapter {
    const API_URL: &'static str = "https://remotive.com/api/remote-jobs";
}

#[async_trait]
impl SourceAdapter for RemotiveAdapter {
    fn source_id(&self) -> &'static str {
        "remotive"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        _companies: &[TargetCompany],
        _general_queries: &[String],
    ) -> Result<Vec<RawListing>, AdapterError> {
        let params = [("limit", "500".to_string())];
        let resp = http.get(self.source_id(), Self::API_URL, &params).await?;
        let data: RemotiveResponse = parse_json(&resp.body)?;

        let mut jobs = Vec::new();
        for item in &data.jobs {
            let location = opt_trimmed(item.candidate_required_location.as_deref())
                .unwrap_or_else(|| "Remote".into());
            let mut listing = RawListing::new(
                trimmed(&item.title),
                trimmed(&item.company_name),
                location,
                item.url.trim(),
                "remotive",
            );
            listing.category = opt_trimmed(item.category.as_deref());
            listing.experience_level = experience_from_title(&item.title).map(Into::into);
            listing.job_type = opt_trimmed(item.job_type.as_deref())
                .map(|t| title_case(&t.replace('_', " ")));
            listing.remote = true;
            if valid(&listing) {
                jobs.push(listing);
            }
        }
        info!(count = jobs.len(), "remotive listings extracted");
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// Adzuna: UK job API, keyed
// ---------------------------------------------------------------------------

pub struct AdzunaAdapter {
    pub app_id: Option<String>,
    pub api_key: Option<String>,
    pub max_pages: usize,
}

#[derive(Debug, Deserialize)]
struct AdzunaResponse {
    #[serde(default)]
    results: Vec<AdzunaJob>,
    #[serde(default)]
    count: usize,
}

#[derive(Debug, Deserialize)]
struct AdzunaJob {
    #[serde(default)]
    title: String,
    #[serde(default)]
    company: AdzunaNamed,
    #[serde(default)]
    location: AdzunaNamed,
    #[serde(default)]
    redirect_url: String,
    category: Option<AdzunaCategory>,
    contract_time: Option<String>,
    contract_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AdzunaNamed {
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct AdzunaCategory {
    #[serde(default)]
    label: String,
}

impl AdzunaAdapter {
    const BASE_URL: &'static str = "https://api.adzuna.com/v1/api/jobs/gb/search";
    const RESULTS_PER_PAGE: usize = 50;

    fn job_type_from(item: &AdzunaJob) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(time) = item.contract_time.as_deref().filter(|s| !s.is_empty()) {
            parts.push(title_case(&time.replace('_', " ")));
        }
        if let Some(kind) = item.contract_type.as_deref().filter(|s| !s.is_empty()) {
            parts.push(title_case(&kind.replace('_', " ")));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        app_id: &str,
        api_key: &str,
        query: &str,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let mut jobs = Vec::new();
        for page in 1..=self.max_pages {
            let url = format!("{}/{page}", Self::BASE_URL);
            let params = [
                ("app_id", app_id.to_string()),
                ("app_key", api_key.to_string()),
                ("results_per_page", Self::RESULTS_PER_PAGE.to_string()),
                ("what", query.to_string()),
                ("where", "United Kingdom".to_string()),
                ("content-type", "application/json".to_string()),
            ];
            let resp = http.get(self.source_id(), &url, &params).await?;
            let data: AdzunaResponse = parse_json(&resp.body)?;
            if data.results.is_empty() {
                break;
            }

            for item in &data.results {
                let mut listing = RawListing::new(
                    trimmed(&item.title),
                    trimmed(&item.company.display_name),
                    trimmed(&item.location.display_name),
                    trimmed(&item.redirect_url),
                    "adzuna",
                );
                listing.category = item
                    .category
                    .as_ref()
                    .map(|c| c.label.clone())
                    .filter(|l| !l.is_empty());
                listing.experience_level = experience_from_title(&item.title).map(Into::into);
                listing.job_type = Self::job_type_from(item);
                if valid(&listing) {
                    jobs.push(listing);
                }
            }

            if page * Self::RESULTS_PER_PAGE >= data.count {
                break;
            }
            http.polite_pause().await;
        }
        Ok(jobs)
    }
}

#[async_trait]
impl SourceAdapter for AdzunaAdapter {
    fn source_id(&self) -> &'static str {
        "adzuna"
    }

    fn is_available(&self) -> bool {
        self.app_id.as_deref().is_some_and(|s| !s.is_empty())
            && self.api_key.as_deref().is_some_and(|s| !s.is_empty())
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        companies: &[TargetCompany],
        general_queries: &[String],
    ) -> Result<Vec<RawListing>, AdapterError> {
        let (Some(app_id), Some(api_key)) = (self.app_id.as_deref(), self.api_key.as_deref())
        else {
            return Err(AdapterError::Unavailable);
        };

        let mut jobs = Vec::new();
        let mut errors = 0usize;
        let queries: Vec<&str> = companies
            .iter()
            .map(|c| c.name.as_str())
            .chain(general_queries.iter().map(String::as_str))
            .collect();

        for query in &queries {
            match self.search(http, app_id, api_key, query).await {
                Ok(found) => {
                    debug!(query, count = found.len(), "adzuna query done");
                    jobs.extend(found);
                }
                Err(err) => {
                    warn!(query, error = %err, "adzuna query failed");
                    errors += 1;
                }
            }
            http.polite_pause().await;
        }

        if jobs.is_empty() && errors == queries.len() && errors > 0 {
            return Err(AdapterError::Message(format!(
                "all adzuna queries failed ({errors} errors)"
            )));
        }
        info!(count = jobs.len(), "adzuna listings extracted");
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// Reed: UK job API, keyed, basic auth
// ---------------------------------------------------------------------------

pub struct ReedAdapter {
    pub api_key: Option<String>,
    pub max_results_per_query: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReedResponse {
    #[serde(default)]
    results: Vec<ReedJob>,
    #[serde(default)]
    total_results: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReedJob {
    job_id: Option<i64>,
    #[serde(default)]
    job_title: String,
    #[serde(default)]
    employer_name: String,
    #[serde(default)]
    location_name: String,
    job_url: Option<String>,
    #[serde(default)]
    part_time: Option<bool>,
    #[serde(default)]
    full_time: Option<bool>,
    contract_type: Option<String>,
}

impl ReedAdapter {
    const BASE_URL: &'static str = "https://www.reed.co.uk/api/1.0/search";
    const RESULTS_PER_PAGE: usize = 100;

    fn job_type_from(item: &ReedJob) -> Option<String> {
        let mut parts = Vec::new();
        if item.part_time == Some(true) {
            parts.push("Part-time".to_string());
        } else if item.full_time == Some(true) {
            parts.push("Full-time".to_string());
        }
        if let Some(kind) = item.contract_type.as_deref().filter(|s| !s.is_empty()) {
            parts.push(kind.to_string());
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        api_key: &str,
        query: &str,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let mut jobs = Vec::new();
        let mut skip = 0usize;
        while skip < self.max_results_per_query.max(1) {
            let params = [
                ("keywords", query.to_string()),
                ("locationName", "United Kingdom".to_string()),
                ("resultsToTake", Self::RESULTS_PER_PAGE.to_string()),
                ("resultsToSkip", skip.to_string()),
            ];
            let resp = http
                .get_basic_auth(self.source_id(), Self::BASE_URL, &params, api_key, Some(""))
                .await?;
            let data: ReedResponse = parse_json(&resp.body)?;
            if data.results.is_empty() {
                break;
            }

            for item in &data.results {
                let url = match &item.job_url {
                    Some(url) if !url.is_empty() => url.clone(),
                    _ => match item.job_id {
                        Some(id) => format!("https://www.reed.co.uk/jobs/{id}"),
                        None => continue,
                    },
                };
                let mut listing = RawListing::new(
                    trimmed(&item.job_title),
                    trimmed(&item.employer_name),
                    trimmed(&item.location_name),
                    url,
                    "reed",
                );
                listing.job_type = Self::job_type_from(item);
                listing.experience_level = experience_from_title(&item.job_title).map(Into::into);
                if valid(&listing) {
                    jobs.push(listing);
                }
            }

            skip += Self::RESULTS_PER_PAGE;
            if skip >= data.total_results {
                break;
            }
            http.polite_pause().await;
        }
        Ok(jobs)
    }
}

#[async_trait]
impl SourceAdapter for ReedAdapter {
    fn source_id(&self) -> &'static str {
        "reed"
    }

    fn is_available(&self) -> bool {
        self.api_key.as_deref().is_some_and(|s| !s.is_empty())
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        companies: &[TargetCompany],
        general_queries: &[String],
    ) -> Result<Vec<RawListing>, AdapterError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(AdapterError::Unavailable);
        };

        let mut jobs = Vec::new();
        let mut errors = 0usize;
        let queries: Vec<&str> = companies
            .iter()
            .map(|c| c.name.as_str())
            .chain(general_queries.iter().map(String::as_str))
            .collect();

        for query in &queries {
            match self.search(http, api_key, query).await {
                Ok(found) => {
                    debug!(query, count = found.len(), "reed query done");
                    jobs.extend(found);
                }
                Err(err) => {
                    warn!(query, error = %err, "reed query failed");
                    errors += 1;
                }
            }
            http.polite_pause().await;
        }

        if jobs.is_empty() && errors == queries.len() && errors > 0 {
            return Err(AdapterError::Message(format!(
                "all reed queries failed ({errors} errors)"
            )));
        }
        info!(count = jobs.len(), "reed listings extracted");
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// Web search: DuckDuckGo HTML endpoint, the open-web source
// ---------------------------------------------------------------------------

pub struct WebSearchAdapter;

/// One parsed search result, before job heuristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub domain: String,
}

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
     (KHTML, like Gecko) Version/17.3 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
];

// Domains that never carry an individual job listing.
const SKIP_DOMAINS: [&str; 17] = [
    "duckduckgo.com",
    "google.com",
    "google.co.uk",
    "bing.com",
    "youtube.com",
    "wikipedia.org",
    "wikimedia.org",
    "facebook.com",
    "twitter.com",
    "x.com",
    "instagram.com",
    "tiktok.com",
    "reddit.com",
    "pinterest.com",
    "amazon.co.uk",
    "ebay.co.uk",
    "bbc.co.uk",
];

// Known job-board domains, used when pulling the company out of a title.
const JOB_BOARDS: [(&str, &str); 16] = [
    ("linkedin.com", "LinkedIn"),
    ("indeed.co.uk", "Indeed"),
    ("indeed.com", "Indeed"),
    ("glassdoor.co.uk", "Glassdoor"),
    ("glassdoor.com", "Glassdoor"),
    ("reed.co.uk", "Reed"),
    ("totaljobs.com", "Totaljobs"),
    ("cv-library.co.uk", "CV-Library"),
    ("monster.co.uk", "Monster"),
    ("cwjobs.co.uk", "CWJobs"),
    ("adzuna.co.uk", "Adzuna"),
    ("jobsite.co.uk", "Jobsite"),
    ("workable.com", "Workable"),
    ("lever.co", "Lever"),
    ("greenhouse.io", "Greenhouse"),
    ("findajob.dwp.gov.uk", "Find a Job (Gov.uk)"),
];

const UK_CITIES: [&str; 39] = [
    "London",
    "Manchester",
    "Birmingham",
    "Leeds",
    "Glasgow",
    "Liverpool",
    "Edinburgh",
    "Bristol",
    "Sheffield",
    "Newcastle",
    "Nottingham",
    "Southampton",
    "Cardiff",
    "Belfast",
    "Leicester",
    "Coventry",
    "Reading",
    "Cambridge",
    "Oxford",
    "Brighton",
    "York",
    "Aberdeen",
    "Bath",
    "Dundee",
    "Exeter",
    "Norwich",
    "Plymouth",
    "Derby",
    "Swansea",
    "Portsmouth",
    "Warwick",
    "Milton Keynes",
    "Swindon",
    "Guildford",
    "Cheltenham",
    "Canary Wharf",
    "Slough",
    "Luton",
    "Croydon",
];

static CITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    let alternation = UK_CITIES
        .iter()
        .map(|c| regex::escape(c))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b({alternation})\b")).expect("city alternation compiles")
});

static UK_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(UK|U\.K\.)\b").expect("uk pattern compiles"));

static AT_COMPANY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bat\s+(.+)$").expect("at pattern compiles"));

static TRAILING_SEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*[-|–—]\s*$").expect("trailing sep compiles"));

// Titles that mark aggregate search/browse pages or editorial content
// rather than a single listing.
static NON_LISTING_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\d[\d,]+\+?\s+(jobs?|vacancies|positions|results)",
        r"jobs?\s+in\s+(united kingdom|uk|london|manchester|birmingham)",
        r"^(search|find|browse)\s+",
        r"\|\s*(reed|indeed|glassdoor|totaljobs|linkedin)\s*$",
        r"\bhow\s+(to|ai|is)\b",
        r"\btop\s+\d+\s+",
        r"\bguide\b",
        r"\btips\b",
        r"\bbest\s+(companies|employers|places)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("non-listing pattern compiles"))
    .collect()
});

impl WebSearchAdapter {
    const SEARCH_URL: &'static str = "https://html.duckduckgo.com/html/";
    const MAX_QUERIES: usize = 70;
    const MAX_CONSECUTIVE_FAILURES: usize = 5;

    fn build_queries(companies: &[TargetCompany], general_queries: &[String]) -> Vec<String> {
        let year = Utc::now().year();
        let mut queries: Vec<String> = companies
            .iter()
            .map(|c| format!("\"{}\" jobs UK hiring", c.name))
            .collect();
        queries.extend(
            general_queries
                .iter()
                .map(|q| format!("{q} jobs hiring {year}")),
        );
        queries.extend(
            [
                format!("graduate scheme UK {year} hiring"),
                format!("tech jobs London hiring {year}"),
                format!("engineering vacancies UK {year}"),
                format!("finance jobs City of London {year}"),
                format!("consulting jobs UK hiring {year}"),
                format!("legal jobs UK solicitor {year}"),
                "NHS jobs UK careers".to_string(),
                format!("renewable energy jobs UK {year}"),
                "AI machine learning jobs UK".to_string(),
                "cyber security analyst UK jobs".to_string(),
            ],
        );
        // Shuffle so hitting the query cap still samples every category.
        {
            use rand::seq::SliceRandom;
            queries.shuffle(&mut rand::rng());
        }
        queries
    }

    fn pick_user_agent() -> &'static str {
        use rand::seq::IndexedRandom;
        USER_AGENTS
            .choose(&mut rand::rng())
            .copied()
            .unwrap_or(USER_AGENTS[0])
    }

    /// DuckDuckGo wraps result hrefs in a redirect; the real URL sits in
    /// the `uddg` query parameter.
    pub fn unwrap_redirect(href: &str) -> Option<String> {
        if href.contains("uddg=") {
            let query = href.split_once('?').map(|(_, q)| q)?;
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if key == "uddg" && !value.is_empty() {
                    return Some(value.into_owned());
                }
            }
            return None;
        }
        if href.starts_with("http") && !href.contains("duckduckgo") {
            return Some(href.to_string());
        }
        None
    }

    pub fn parse_search_results(html: &str) -> Vec<SearchHit> {
        static RESULT_SEL: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse(".result").expect("selector parses"));
        static TITLE_SEL: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse(".result__a").expect("selector parses"));
        static SNIPPET_SEL: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse(".result__snippet").expect("selector parses"));

        let document = Html::parse_document(html);
        let mut hits = Vec::new();
        for result in document.select(&RESULT_SEL) {
            let Some(anchor) = result.select(&TITLE_SEL).next() else {
                continue;
            };
            let title = element_text(&anchor);
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some(url) = Self::unwrap_redirect(href) else {
                continue;
            };
            let Some(domain) = registrable_domain(&url) else {
                continue;
            };
            if SKIP_DOMAINS.iter().any(|skip| domain.contains(skip)) {
                continue;
            }
            let snippet = result
                .select(&SNIPPET_SEL)
                .next()
                .map(|el| element_text(&el))
                .unwrap_or_default();
            hits.push(SearchHit {
                title,
                url,
                snippet,
                domain,
            });
        }
        hits
    }

    /// Aggregate search/browse pages and editorial content are rejected,
    /// only individual listings survive.
    pub fn is_search_results_page(title: &str) -> bool {
        let t = title.to_lowercase();
        NON_LISTING_RES.iter().any(|re| re.is_match(&t))
    }

    pub fn hit_to_listing(hit: &SearchHit) -> Option<RawListing> {
        let company = extract_company(&hit.title, &hit.domain);
        let location = extract_location(&hit.title, &hit.snippet);
        let clean_title = clean_title(&hit.title, &company);

        if Self::is_search_results_page(&clean_title) {
            return None;
        }
        if clean_title.len() < 4 {
            return None;
        }
        let company_lower = company.to_lowercase();
        if company.is_empty() || ["jobs", "careers", "hiring", "search"].contains(&company_lower.as_str())
        {
            return None;
        }

        let location = location.unwrap_or_else(|| "United Kingdom".to_string());
        let remote = location.to_lowercase().contains("remote");
        let mut listing =
            RawListing::new(clean_title.clone(), company, location, &hit.url, "websearch");
        listing.category = category_from_title(&clean_title).map(Into::into);
        listing.experience_level = experience_from_title(&clean_title).map(Into::into);
        listing.job_type = job_type_from_text(&format!("{clean_title} {}", hit.snippet));
        listing.remote = remote;
        Some(listing)
    }
}

fn element_text(el: &ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn registrable_domain(raw_url: &str) -> Option<String> {
    let parsed = url::Url::parse(raw_url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.trim_start_matches("www.").to_string())
}

fn job_board_for_domain(domain: &str) -> Option<&'static str> {
    JOB_BOARDS
        .iter()
        .find(|(pattern, _)| domain.contains(pattern))
        .map(|(_, board)| *board)
}

const COMPANY_SUFFIXES: [&str; 16] = [
    "Careers", "Jobs", "Hiring", "Vacancies", "careers", "jobs", "hiring", "vacancies",
    "LinkedIn", "Indeed", "Glassdoor", "Reed", "UK", "Ltd", "Limited", "PLC",
];

fn strip_company_suffixes(name: &str) -> String {
    let mut out = name.trim().to_string();
    for suffix in COMPANY_SUFFIXES {
        let t = out.trim_end();
        if t.len() > suffix.len() && t.ends_with(suffix) {
            let head = &t[..t.len() - suffix.len()];
            // suffix must be its own trailing word
            if head.ends_with(|c: char| !c.is_alphanumeric()) {
                out = head.trim_end().to_string();
            }
        }
    }
    TRAILING_SEP_RE.replace(&out, "").trim().to_string()
}

const TITLE_SEPARATORS: [&str; 4] = [" - ", " | ", " – ", " — "];

fn company_after_separator(title: &str) -> Option<String> {
    for sep in TITLE_SEPARATORS {
        if let Some(idx) = title.rfind(sep) {
            let candidate = strip_company_suffixes(title[idx + sep.len()..].trim());
            if candidate.len() > 2 && candidate.len() < 80 {
                return Some(candidate);
            }
        }
    }
    None
}

fn company_after_at(title: &str) -> Option<String> {
    let captures = AT_COMPANY_RE.captures(title)?;
    let candidate = strip_company_suffixes(captures.get(1)?.as_str().trim());
    (candidate.len() > 2).then_some(candidate)
}

fn extract_company(title: &str, domain: &str) -> String {
    if let Some(board) = job_board_for_domain(domain) {
        let mut cleaned = title.to_string();
        for tag in [
            format!("| {board}"),
            format!("- {board}"),
            format!("— {board}"),
            format!("· {board}"),
            board.to_string(),
        ] {
            cleaned = cleaned.replace(&tag, "").trim().to_string();
        }
        if let Some(company) = company_after_separator(&cleaned).or_else(|| company_after_at(&cleaned))
        {
            return company;
        }
    }

    if let Some(company) = company_after_separator(title).or_else(|| company_after_at(title)) {
        return company;
    }

    // Fall back to the site itself, e.g. careers.monzo.com -> Monzo.
    let clean_domain = domain
        .trim_start_matches("careers.")
        .trim_start_matches("jobs.");
    let base = clean_domain.split('.').next().unwrap_or_default();
    if base.len() > 2 {
        return title_case(&base.replace('-', " "));
    }
    String::new()
}

fn extract_location(title: &str, snippet: &str) -> Option<String> {
    let text = format!("{title} {snippet}");

    let mut found: Vec<&'static str> = Vec::new();
    for m in CITY_RE.find_iter(&text) {
        let matched = m.as_str().to_lowercase();
        if let Some(city) = UK_CITIES.iter().find(|c| c.to_lowercase() == matched) {
            if !found.contains(city) {
                found.push(city);
            }
        }
        if found.len() == 2 {
            break;
        }
    }
    if !found.is_empty() {
        return Some(format!("{}, UK", found.join(", ")));
    }

    let lower = text.to_lowercase();
    if lower.contains("united kingdom") {
        return Some("United Kingdom".to_string());
    }
    if lower.contains("remote") {
        return Some("Remote, UK".to_string());
    }
    if lower.contains("hybrid") {
        return Some("Hybrid, UK".to_string());
    }
    if UK_WORD_RE.is_match(&text) {
        return Some("United Kingdom".to_string());
    }
    None
}

fn clean_title(title: &str, company: &str) -> String {
    let mut cleaned = title.to_string();
    for tag in [
        "| LinkedIn",
        "- LinkedIn",
        "| Indeed",
        "- Indeed",
        "| Glassdoor",
        "- Glassdoor",
        "| Reed",
        "- Reed",
        "| Totaljobs",
        "- Totaljobs",
        "| CV-Library",
        "| Workable",
        "| Lever",
        "| Greenhouse",
        "| Find a Job",
        "- Find a Job",
        "| CWJobs",
    ] {
        cleaned = cleaned.replace(tag, "").trim().to_string();
    }

    if !company.is_empty() {
        for sep in [" - ", " | ", " – ", " — ", " at ", " @ "] {
            let pattern = format!(r"(?i){}{}\s*$", regex::escape(sep), regex::escape(company));
            if let Ok(re) = Regex::new(&pattern) {
                cleaned = re.replace(&cleaned, "").to_string();
            }
        }
    }

    TRAILING_SEP_RE.replace(&cleaned, "").trim().to_string()
}

#[async_trait]
impl SourceAdapter for WebSearchAdapter {
    fn source_id(&self) -> &'static str {
        "websearch"
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        companies: &[TargetCompany],
        general_queries: &[String],
    ) -> Result<Vec<RawListing>, AdapterError> {
        let queries = Self::build_queries(companies, general_queries);
        let mut jobs = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut consecutive_failures = 0usize;

        for (idx, query) in queries.iter().take(Self::MAX_QUERIES).enumerate() {
            if consecutive_failures >= Self::MAX_CONSECUTIVE_FAILURES {
                warn!(
                    failures = consecutive_failures,
                    collected = jobs.len(),
                    "stopping web search after consecutive failures"
                );
                break;
            }

            let params = [("q", query.clone())];
            let user_agent = Self::pick_user_agent();
            match http
                .get_with_user_agent(self.source_id(), Self::SEARCH_URL, &params, user_agent)
                .await
            {
                Ok(resp) => {
                    consecutive_failures = 0;
                    let body = String::from_utf8_lossy(&resp.body);
                    let hits = Self::parse_search_results(&body);
                    let mut batch_new = 0usize;
                    for hit in &hits {
                        if seen_urls.contains(&hit.url) {
                            continue;
                        }
                        if let Some(listing) = Self::hit_to_listing(hit) {
                            seen_urls.insert(hit.url.clone());
                            jobs.push(listing);
                            batch_new += 1;
                        }
                    }
                    info!(
                        query_index = idx + 1,
                        results = hits.len(),
                        new = batch_new,
                        "web search query done"
                    );
                }
                Err(err) => {
                    warn!(query = query.as_str(), error = %err, "web search query failed");
                    consecutive_failures += 1;
                }
            }

            // DuckDuckGo rate-limits quickly, so always pause between queries.
            http.polite_pause().await;
        }

        if jobs.is_empty() && consecutive_failures >= Self::MAX_CONSECUTIVE_FAILURES {
            return Err(AdapterError::Message(
                "web search aborted with no results".to_string(),
            ));
        }
        info!(count = jobs.len(), "web search listings extracted");
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gbp_amounts_get_thousands_separators() {
        assert_eq!(format_gbp(45000.0), "£45,000");
        assert_eq!(format_gbp(999.0), "£999");
        assert_eq!(format_gbp(1_250_000.4), "£1,250,000");
    }

    #[test]
    fn devitjobs_item_maps_to_listing() {
        let raw = serde_json::json!({
            "name": "Rust Engineer",
            "company": "Acme",
            "actualCity": "Leeds",
            "workplace": "hybrid",
            "jobUrl": "rust-engineer-acme",
            "annualSalaryFrom": 65000,
            "annualSalaryTo": 85000,
            "expLevel": "Senior",
            "technologies": ["Rust", "Postgres", "AWS", "Terraform"],
            "jobType": "Full-Time"
        });
        let item: DevItJob = serde_json::from_value(raw).unwrap();
        let listing = DevItJobsAdapter::listing_from(&item).unwrap();
        assert_eq!(listing.location, "Leeds, Hybrid, UK");
        assert_eq!(listing.url, "https://devitjobs.uk/jobs/rust-engineer-acme");
        assert_eq!(listing.salary.as_deref(), Some("£65,000 – £85,000"));
        assert_eq!(listing.experience_level.as_deref(), Some("Senior Level"));
        assert_eq!(listing.category.as_deref(), Some("Rust, Postgres, AWS"));
        assert_eq!(listing.job_type.as_deref(), Some("Hybrid, Full-Time"));
    }

    #[test]
    fn jobicy_industry_accepts_string_or_array() {
        let raw = serde_json::json!({
            "jobTitle": "Backend Developer",
            "companyName": "Globex",
            "jobGeo": "UK",
            "url": "https://jobicy.com/jobs/1",
            "jobIndustry": ["Technology", "SaaS"],
            "jobType": "full_time",
            "jobLevel": "Senior"
        });
        let item: JobicyJob = serde_json::from_value(raw).unwrap();
        let listing = JobicyAdapter::listing_from(&item).unwrap();
        assert_eq!(listing.category.as_deref(), Some("Technology, SaaS"));
        assert_eq!(listing.job_type.as_deref(), Some("Remote, Full-time"));
        assert!(listing.remote);
    }

    #[test]
    fn redirect_unwrap_decodes_uddg_param() {
        let href = "//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fjobs%2F42&rut=abcd";
        assert_eq!(
            WebSearchAdapter::unwrap_redirect(href).as_deref(),
            Some("https://example.com/jobs/42")
        );
        assert_eq!(
            WebSearchAdapter::unwrap_redirect("https://example.com/direct").as_deref(),
            Some("https://example.com/direct")
        );
        assert!(WebSearchAdapter::unwrap_redirect("https://duckduckgo.com/x").is_none());
        assert!(WebSearchAdapter::unwrap_redirect("/relative/path").is_none());
    }

    #[test]
    fn search_results_parse_and_skip_noise_domains() {
        let html = r#"
            <div class="results">
              <div class="result">
                <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fcareers.acme.com%2Frust-engineer">
                  Rust Engineer - Acme
                </a>
                <a class="result__snippet">Build services in London. Full-time.</a>
              </div>
              <div class="result">
                <a class="result__a" href="https://en.wikipedia.org/wiki/Rust">Rust - Wikipedia</a>
              </div>
            </div>
        "#;
        let hits = WebSearchAdapter::parse_search_results(html);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].domain, "careers.acme.com");
        assert_eq!(hits[0].url, "https://careers.acme.com/rust-engineer");
        assert!(hits[0].snippet.contains("London"));
    }

    #[test]
    fn aggregate_pages_are_rejected() {
        assert!(WebSearchAdapter::is_search_results_page(
            "1,234 Software Engineer jobs in London"
        ));
        assert!(WebSearchAdapter::is_search_results_page(
            "Top 10 companies hiring now"
        ));
        assert!(WebSearchAdapter::is_search_results_page(
            "How to become a data scientist"
        ));
        assert!(!WebSearchAdapter::is_search_results_page(
            "Senior Data Engineer at Monzo"
        ));
    }

    #[test]
    fn company_extraction_prefers_title_then_domain() {
        assert_eq!(
            extract_company("Software Engineer - Acme Ltd | LinkedIn", "linkedin.com"),
            "Acme"
        );
        assert_eq!(
            extract_company("Platform Engineer at Starling Bank", "starlingbank.com"),
            "Starling Bank"
        );
        assert_eq!(extract_company("Rust Developer", "careers.monzo.com"), "Monzo");
    }

    #[test]
    fn location_extraction_finds_cities_and_falls_back() {
        assert_eq!(
            extract_location("Data Engineer London", "hybrid role").as_deref(),
            Some("London, UK")
        );
        assert_eq!(
            extract_location("Remote Software Engineer", "work from anywhere").as_deref(),
            Some("Remote, UK")
        );
        assert_eq!(
            extract_location("Engineer", "role based in the UK").as_deref(),
            Some("United Kingdom")
        );
        assert!(extract_location("Engineer", "somewhere in Berlin").is_none());
    }

    #[test]
    fn hit_with_generic_company_is_dropped() {
        let hit = SearchHit {
            title: "Search jobs".to_string(),
            url: "https://example.com".to_string(),
            snippet: String::new(),
            domain: "example.com".to_string(),
        };
        assert!(WebSearchAdapter::hit_to_listing(&hit).is_none());
    }

    #[test]
    fn experience_guesser_orders_seniority_before_manager() {
        assert_eq!(
            experience_from_title("Senior Engineering Manager"),
            Some("Senior Level")
        );
        assert_eq!(experience_from_title("Graduate Analyst"), Some("Entry Level"));
        assert_eq!(experience_from_title("Head of Data"), Some("Director / Executive"));
        assert_eq!(experience_from_title("Plumber"), None);
    }

    #[test]
    fn category_guesser_is_first_match_wins() {
        // "engineer" hits the Technology group before Data & AI is reached.
        assert_eq!(category_from_title("Data Engineer"), Some("Technology"));
        assert_eq!(category_from_title("Data Scientist"), Some("Data & AI"));
        assert_eq!(category_from_title("Product Manager"), Some("Product"));
        assert_eq!(category_from_title("Zookeeper"), None);
    }

    #[test]
    fn keyed_adapters_report_availability() {
        let adzuna = AdzunaAdapter {
            app_id: Some("id".into()),
            api_key: None,
            max_pages: 3,
        };
        assert!(!adzuna.is_available());
        let reed = ReedAdapter {
            api_key: Some("key".into()),
            max_results_per_query: 50,
        };
        assert!(reed.is_available());
    }

    #[test]
    fn registry_only_includes_free_sources_without_keys() {
        let adapters = registered_adapters(&AdapterConfig::default());
        let available: Vec<&str> = adapters
            .iter()
            .filter(|a| a.is_available())
            .map(|a| a.source_id())
            .collect();
        assert_eq!(
            available,
            vec!["devitjobs", "themuse", "websearch", "jobicy", "remotive"]
        );
    }
}
