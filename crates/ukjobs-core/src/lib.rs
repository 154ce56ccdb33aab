//! Core domain model for the UK jobs pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ukjobs-core";

/// Free-form listing as captured from a source, before normalization.
///
/// Optional fields hold a value only when the source supplied an explicit
/// categorical field or a controlled-vocabulary keyword matched. They are
/// never inferred from unrelated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub source: String,
    #[serde(default)]
    pub salary: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub experience_level: Option<String>,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub remote: bool,
}

impl RawListing {
    pub fn new(
        title: impl Into<String>,
        company: impl Into<String>,
        location: impl Into<String>,
        url: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            company: company.into(),
            location: location.into(),
            url: url.into(),
            source: source.into(),
            salary: None,
            category: None,
            experience_level: None,
            job_type: None,
            remote: false,
        }
    }
}

/// Canonical persisted job listing.
///
/// `content_fingerprint` is unique across the whole store; a later sighting
/// of the same listing only advances `last_seen_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub canonical_url: String,
    pub content_fingerprint: String,
    /// Normalized company name, the scan key for the fuzzy-dedup window.
    pub company_key: String,
    pub salary: Option<String>,
    pub category: Option<String>,
    pub experience_level: Option<String>,
    pub job_type: Option<String>,
    pub source: String,
    pub scrape_date: NaiveDate,
    pub first_seen_date: NaiveDate,
    pub last_seen_date: NaiveDate,
}

/// Fixed external export shape. Absent fields serialize as explicit JSON
/// `null`; no `skip_serializing_if` here, that is part of the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExport {
    pub title: String,
    pub company: String,
    pub location: String,
    pub category: Option<String>,
    pub experience_level: Option<String>,
    pub job_type: Option<String>,
    pub url: String,
}

impl From<&JobRecord> for JobExport {
    fn from(job: &JobRecord) -> Self {
        Self {
            title: job.title.clone(),
            company: job.company.clone(),
            location: job.location.clone(),
            category: job.category.clone(),
            experience_level: job.experience_level.clone(),
            job_type: job.job_type.clone(),
            url: job.url.clone(),
        }
    }
}

/// Priority-seeded company name from the configuration collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCompany {
    pub name: String,
    #[serde(default)]
    pub priority: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end execution of the pipeline, scoped to a single scrape date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: Uuid,
    pub run_date: NaiveDate,
    pub status: RunStatus,
    pub jobs_found: usize,
    pub new_jobs: usize,
    pub duplicates: usize,
    pub failed_sources: Vec<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScrapeRun {
    pub fn started(run_date: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_date,
            status: RunStatus::Running,
            jobs_found: 0,
            new_jobs: 0,
            duplicates: 0,
            failed_sources: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_job() -> JobRecord {
        JobRecord {
            id: Uuid::new_v4(),
            title: "Software Engineer".into(),
            company: "Acme".into(),
            location: "London, UK".into(),
            url: "https://acme.example/jobs/1".into(),
            canonical_url: "https://acme.example/jobs/1".into(),
            content_fingerprint: "abc123".into(),
            company_key: "acme".into(),
            salary: None,
            category: None,
            experience_level: None,
            job_type: None,
            source: "devitjobs".into(),
            scrape_date: NaiveDate::from_ymd_opt(2026, 8, 29).unwrap(),
            first_seen_date: NaiveDate::from_ymd_opt(2026, 8, 29).unwrap(),
            last_seen_date: NaiveDate::from_ymd_opt(2026, 8, 29).unwrap(),
        }
    }

    #[test]
    fn export_renders_absent_fields_as_null() {
        let export = JobExport::from(&mk_job());
        let value = serde_json::to_value(&export).unwrap();
        assert!(value.get("category").unwrap().is_null());
        assert!(value.get("experience_level").unwrap().is_null());
        assert!(value.get("job_type").unwrap().is_null());
        assert_eq!(value.get("title").unwrap(), "Software Engineer");
    }

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert_eq!(RunStatus::Completed.to_string(), "completed");
    }
}
