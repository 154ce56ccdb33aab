//! JSON API for the UK jobs pipeline: job listings with filter/sort/paginate,
//! aggregate stats, exports, and scrape triggering over the shared coordinator.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use ukjobs_core::{JobExport, RunStatus, ScrapeRun, TargetCompany};
use ukjobs_engine::{ScrapeCoordinator, ScrapeError};
use ukjobs_storage::{DateCount, JobPage, JobQuery, SortBy, SortOrder, StorageError};

pub const CRATE_NAME: &str = "ukjobs-web";

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;
const DEFAULT_RANGE_DAYS: u64 = 7;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ScrapeCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<ScrapeCoordinator>) -> Self {
        Self { coordinator }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", get(jobs_handler))
        .route("/api/jobs/daily-json/{date}", get(daily_json_handler))
        .route("/api/jobs/export", get(export_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/dates", get(dates_handler))
        .route("/api/companies", get(companies_handler))
        .route("/api/scrape", post(scrape_handler))
        .route("/api/scrape/status", get(scrape_status_handler))
        .with_state(Arc::new(state))
}

/// Bind on `UKJOBS_WEB_PORT` (default 8000) and serve until shutdown.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("UKJOBS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(%port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Request/response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct JobsParams {
    date_from: Option<String>,
    date_to: Option<String>,
    search: Option<String>,
    company: Option<String>,
    source: Option<String>,
    sort_by: Option<SortBy>,
    sort_order: Option<SortOrder>,
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RangeParams {
    date_from: Option<String>,
    date_to: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobsResponse {
    #[serde(flatten)]
    page: JobPage,
    has_next: bool,
    has_prev: bool,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    total_jobs: usize,
    unique_companies: usize,
    sources: std::collections::BTreeMap<String, usize>,
    date_range: DateRange,
    last_run: Option<LastRunSummary>,
}

#[derive(Debug, Serialize)]
struct DateRange {
    from: NaiveDate,
    to: NaiveDate,
}

#[derive(Debug, Serialize)]
struct LastRunSummary {
    date: NaiveDate,
    status: RunStatus,
    jobs_found: usize,
    new_jobs: usize,
}

#[derive(Debug, Serialize)]
struct DatesResponse {
    dates: Vec<DateCount>,
}

#[derive(Debug, Serialize)]
struct CompaniesResponse {
    companies: Vec<TargetCompany>,
}

/// Run shape shared by the trigger and status endpoints.
#[derive(Debug, Serialize)]
struct RunView {
    id: uuid::Uuid,
    date: NaiveDate,
    status: RunStatus,
    jobs_found: usize,
    new_jobs: usize,
    duplicates: usize,
    failed_sources: Vec<String>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<ScrapeRun> for RunView {
    fn from(run: ScrapeRun) -> Self {
        Self {
            id: run.id,
            date: run.run_date,
            status: run.status,
            jobs_found: run.jobs_found,
            new_jobs: run.new_jobs,
            duplicates: run.duplicates,
            failed_sources: run.failed_sources,
            error: run.error,
            started_at: run.started_at,
            completed_at: run.finished_at,
        }
    }
}

struct ApiError(StorageError);

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "api request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Unparseable or missing dates fall back to the default window rather than
/// erroring, matching the forgiving list endpoint contract. The daily export
/// endpoint is the strict one.
fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
}

fn default_range() -> (NaiveDate, NaiveDate) {
    let today = Utc::now().date_naive();
    let from = today
        .checked_sub_days(Days::new(DEFAULT_RANGE_DAYS))
        .unwrap_or(today);
    (from, today)
}

fn resolve_range(date_from: Option<&str>, date_to: Option<&str>) -> (NaiveDate, NaiveDate) {
    let (default_from, default_to) = default_range();
    (
        parse_date(date_from).unwrap_or(default_from),
        parse_date(date_to).unwrap_or(default_to),
    )
}

impl JobsParams {
    fn into_query(self) -> JobQuery {
        let (date_from, date_to) = resolve_range(self.date_from.as_deref(), self.date_to.as_deref());
        JobQuery {
            date_from,
            date_to,
            search: self.search.filter(|s| !s.trim().is_empty()),
            company: self.company.filter(|s| !s.trim().is_empty()),
            source: self.source.filter(|s| !s.trim().is_empty()),
            sort_by: self.sort_by.unwrap_or_default(),
            sort_order: self.sort_order.unwrap_or_default(),
            page: self.page.unwrap_or(1).max(1),
            page_size: self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE).max(1),
        }
    }
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<JobsParams>,
) -> Result<Json<JobsResponse>, ApiError> {
    let query = params.into_query();
    let page = state.coordinator.store().query(&query).await?;
    let (has_next, has_prev) = (page.has_next(), page.has_prev());
    Ok(Json(JobsResponse {
        page,
        has_next,
        has_prev,
    }))
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeParams>,
) -> Result<Json<StatsResponse>, ApiError> {
    let (date_from, date_to) = resolve_range(params.date_from.as_deref(), params.date_to.as_deref());
    let summary = state.coordinator.store().stats(date_from, date_to).await?;
    let last_run = state.coordinator.latest_run().await.map(|run| LastRunSummary {
        date: run.run_date,
        status: run.status,
        jobs_found: run.jobs_found,
        new_jobs: run.new_jobs,
    });
    Ok(Json(StatsResponse {
        total_jobs: summary.total_jobs,
        unique_companies: summary.unique_companies,
        sources: summary.sources,
        date_range: DateRange {
            from: summary.date_from,
            to: summary.date_to,
        },
        last_run,
    }))
}

/// All jobs for one scrape date in the export shape. Bad dates are a client
/// error here, not a silent default.
async fn daily_json_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
) -> Result<Json<Vec<JobExport>>, Response> {
    let Some(date) = parse_date(Some(&date)) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid date format, expected YYYY-MM-DD" })),
        )
            .into_response());
    };
    let jobs = state
        .coordinator
        .store()
        .export_range(date, date)
        .await
        .map_err(|err| ApiError::from(err).into_response())?;
    Ok(Json(jobs.iter().map(JobExport::from).collect()))
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<JobExport>>, ApiError> {
    let (date_from, date_to) = resolve_range(params.date_from.as_deref(), params.date_to.as_deref());
    let jobs = state.coordinator.store().export_range(date_from, date_to).await?;
    Ok(Json(jobs.iter().map(JobExport::from).collect()))
}

async fn dates_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DatesResponse>, ApiError> {
    let dates = state.coordinator.store().scrape_dates().await?;
    Ok(Json(DatesResponse { dates }))
}

async fn companies_handler(State(state): State<Arc<AppState>>) -> Json<CompaniesResponse> {
    Json(CompaniesResponse {
        companies: state.coordinator.companies().to_vec(),
    })
}

/// Run the pipeline synchronously and return the finished run. A run already
/// in flight gets 409 instead of queueing a second one.
async fn scrape_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.trigger(None).await {
        Ok(run) => Json(RunView::from(run)).into_response(),
        Err(ScrapeError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "already_running" })),
        )
            .into_response(),
        Err(ScrapeError::Storage(err)) => ApiError(err).into_response(),
    }
}

async fn scrape_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.latest_run().await {
        Some(run) => Json(RunView::from(run)).into_response(),
        None => Json(json!({ "status": "no_runs" })).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use ukjobs_adapters::{AdapterError, SourceAdapter};
    use ukjobs_core::{JobRecord, RawListing};
    use ukjobs_engine::EngineConfig;
    use ukjobs_storage::{HttpClientConfig, HttpFetcher, JobStore, MemoryJobStore};
    use uuid::Uuid;

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

    fn coordinator_with(
        store: Arc<MemoryJobStore>,
        factory: ukjobs_engine::AdapterFactory,
    ) -> Arc<ScrapeCoordinator> {
        let http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                user_agent: Some("ukjobs-test".into()),
                timeout: Duration::from_secs(5),
                concurrency: 2,
                delay_min_ms: 0,
                delay_max_ms: 1,
            })
            .unwrap(),
        );
        let companies = vec![
            TargetCompany {
                name: "Monzo".into(),
                priority: true,
            },
            TargetCompany {
                name: "Ocado".into(),
                priority: false,
            },
        ];
        Arc::new(ScrapeCoordinator::with_adapters(
            test_config(),
            store as Arc<dyn JobStore>,
            http,
            companies,
            factory,
        ))
    }

    fn empty_state(store: Arc<MemoryJobStore>) -> AppState {
        AppState::new(coordinator_with(store, Box::new(Vec::new)))
    }

    fn record(n: usize, date: NaiveDate) -> JobRecord {
        JobRecord {
            id: Uuid::new_v4(),
            title: format!("Role {n:03}"),
            company: format!("Company {}", n % 7),
            location: "London, UK".into(),
            url: format!("https://example.com/jobs/{n}"),
            canonical_url: format!("https://example.com/jobs/{n}"),
            content_fingerprint: format!("{n:032x}"),
            company_key: format!("company{}", n % 7),
            salary: None,
            category: None,
            experience_level: None,
            job_type: None,
            source: "devitjobs".into(),
            scrape_date: date,
            first_seen_date: date,
            last_seen_date: date,
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn jobs_endpoint_paginates_a_sorted_window() {
        let store = Arc::new(MemoryJobStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        for n in 0..120 {
            store.insert(&record(n, date)).await.unwrap();
        }
        let app = app(empty_state(store));

        let (status, body) = get_json(
            app,
            "/api/jobs?date_from=2026-03-10&date_to=2026-03-10&sort_by=title&sort_order=asc&page=2&page_size=50",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 120);
        assert_eq!(body["page"], 2);
        assert_eq!(body["total_pages"], 3);
        assert_eq!(body["has_next"], true);
        assert_eq!(body["has_prev"], true);
        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 50);
        assert_eq!(jobs[0]["title"], "Role 050");
        assert_eq!(jobs[49]["title"], "Role 099");
    }

    #[tokio::test]
    async fn jobs_endpoint_caps_page_size() {
        let store = Arc::new(MemoryJobStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        for n in 0..5 {
            store.insert(&record(n, date)).await.unwrap();
        }
        let app = app(empty_state(store));

        let (status, body) = get_json(
            app,
            "/api/jobs?date_from=2026-03-10&date_to=2026-03-10&page_size=9999",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["page_size"], 200);
    }

    #[tokio::test]
    async fn daily_json_rejects_malformed_dates_and_keeps_nulls() {
        let store = Arc::new(MemoryJobStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        store.insert(&record(1, date)).await.unwrap();
        let app = app(empty_state(store));

        let (status, body) = get_json(app.clone(), "/api/jobs/daily-json/10-03-2026").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("YYYY-MM-DD"));

        let (status, body) = get_json(app, "/api/jobs/daily-json/2026-03-10").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "Role 001");
        // Optional fields render as explicit nulls, never dropped keys.
        let row = rows[0].as_object().unwrap();
        for key in ["category", "experience_level", "job_type"] {
            assert!(row.contains_key(key));
            assert!(row[key].is_null());
        }
    }

    #[tokio::test]
    async fn status_reports_no_runs_then_latest_run() {
        let store = Arc::new(MemoryJobStore::new());
        let state = empty_state(store);
        let coordinator = state.coordinator.clone();
        let app = app(state);

        let (status, body) = get_json(app.clone(), "/api/scrape/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "no_runs");

        coordinator.trigger(None).await.unwrap();
        let (status, body) = get_json(app, "/api/scrape/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["jobs_found"], 0);
        assert!(body["completed_at"].is_string());
    }

    struct SlowAdapter;

    #[async_trait]
    impl SourceAdapter for SlowAdapter {
        fn source_id(&self) -> &'static str {
            "slow"
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _companies: &[TargetCompany],
            _general_queries: &[String],
        ) -> Result<Vec<RawListing>, AdapterError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn concurrent_trigger_returns_conflict() {
        let store = Arc::new(MemoryJobStore::new());
        let coordinator = coordinator_with(
            store,
            Box::new(|| vec![Box::new(SlowAdapter) as Box<dyn SourceAdapter>]),
        );
        let app = app(AppState::new(coordinator.clone()));

        let background = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.trigger(None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/scrape")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "already_running");

        let run = background.await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn stats_and_companies_endpoints() {
        let store = Arc::new(MemoryJobStore::new());
        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        for n in 0..3 {
            store.insert(&record(n, date)).await.unwrap();
        }
        let app = app(empty_state(store));

        let (status, body) = get_json(
            app.clone(),
            "/api/stats?date_from=2026-03-01&date_to=2026-03-31",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_jobs"], 3);
        assert_eq!(body["sources"]["devitjobs"], 3);
        assert!(body["last_run"].is_null());

        let (status, body) = get_json(app, "/api/companies").await;
        assert_eq!(status, StatusCode::OK);
        let companies = body["companies"].as_array().unwrap();
        assert_eq!(companies[0]["name"], "Monzo");
        assert_eq!(companies[0]["priority"], true);
    }

    #[tokio::test]
    async fn dates_endpoint_counts_per_scrape_date() {
        let store = Arc::new(MemoryJobStore::new());
        let d1 = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 3, 11).unwrap();
        store.insert(&record(1, d1)).await.unwrap();
        store.insert(&record(2, d2)).await.unwrap();
        store.insert(&record(3, d2)).await.unwrap();
        let app = app(empty_state(store));

        let (status, body) = get_json(app, "/api/dates").await;
        assert_eq!(status, StatusCode::OK);
        let dates = body["dates"].as_array().unwrap();
        assert_eq!(dates.len(), 2);
        assert_eq!(dates[0]["date"], "2026-03-11");
        assert_eq!(dates[0]["count"], 2);
        assert_eq!(dates[1]["count"], 1);
    }
}
