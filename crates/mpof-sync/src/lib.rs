//! Scrape-run orchestration: registry loading, backend selection, summaries.
//!
//! [`ScrapeRunner::run`] walks the configured sources strictly sequentially,
//! isolates every source failure into the run's error list, and returns a
//! [`RunSummary`] value; no run state lives outside it. [`run_pipeline`] is
//! the one-shot entry point wiring registry, runner, and store together.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use mpof_core::{clean_text, opportunity_id, Opportunity, SelectorMap, SourceConfig};
use mpof_scrape::{
    fetch_rendered, fetch_static, HttpClient, HttpClientConfig, RawOpportunity, RenderSession,
    ScrapeError, DEFAULT_USER_AGENT,
};
use mpof_store::OpportunityStore;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpof-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

/// Built-in fallback list used when the registry file is missing or invalid.
pub fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            id: "nature-jobs".to_string(),
            name: "Nature Jobs".to_string(),
            url: "https://www.nature.com/naturecareers/jobs".to_string(),
            requires_rendering: false,
            active: true,
            selectors: SelectorMap {
                container: Some(".job-listing".to_string()),
                title: Some(".job-title a".to_string()),
                institute: Some(".job-location".to_string()),
                deadline: Some(".job-deadline".to_string()),
                link: Some(".job-title a".to_string()),
                description: None,
            },
            search_params: BTreeMap::from([
                ("keywords".to_string(), "medical physics phd".to_string()),
                ("category".to_string(), "academic".to_string()),
            ]),
            last_scraped: None,
            success_count: 0,
            error_count: 0,
        },
        SourceConfig {
            id: "ieee-jobs".to_string(),
            name: "IEEE Job Site".to_string(),
            url: "https://jobs.ieee.org".to_string(),
            requires_rendering: false,
            active: true,
            selectors: SelectorMap {
                container: Some(".job-item".to_string()),
                title: Some(".job-title".to_string()),
                institute: Some(".company-name".to_string()),
                deadline: Some(".deadline-date".to_string()),
                link: Some(".job-title a".to_string()),
                description: None,
            },
            search_params: BTreeMap::new(),
            last_scraped: None,
            success_count: 0,
            error_count: 0,
        },
    ]
}

/// Load the YAML source registry. Missing or unparseable input falls back to
/// [`default_sources`] with a warning; loading never fails.
pub async fn load_sources(path: &Path) -> Vec<SourceConfig> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(_) => {
            warn!(path = %path.display(), "sources file not found, using default sources");
            return default_sources();
        }
    };
    match serde_yaml::from_str::<SourceRegistry>(&text) {
        Ok(registry) => {
            info!(count = registry.sources.len(), "loaded sources");
            registry.sources
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "error parsing sources file, using default sources");
            default_sources()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceErrorEntry {
    pub source: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate outcome of one orchestration call. Created fresh per run and
/// consumed by the caller for reporting and exit status; never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub total_opportunities: usize,
    pub total_errors: usize,
    /// Distinct sources that yielded at least one opportunity.
    pub sources_scraped: usize,
    pub scraping_timestamp: DateTime<Utc>,
    pub results: Vec<Opportunity>,
    pub errors: Vec<SourceErrorEntry>,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub user_agent: String,
    pub http_timeout: Duration,
    /// Fixed delay between sources.
    pub politeness_delay: Duration,
    pub headless: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout: Duration::from_secs(30),
            politeness_delay: Duration::from_secs(2),
            headless: true,
        }
    }
}

/// Walks sources, selects a backend per source, and aggregates results.
///
/// Owns the shared HTTP client and the lazily created render session; call
/// [`ScrapeRunner::shutdown`] once at the end of the run to release them.
pub struct ScrapeRunner {
    config: RunnerConfig,
    http: HttpClient,
    render: Option<RenderSession>,
}

impl ScrapeRunner {
    pub fn new(config: RunnerConfig) -> Result<Self, ScrapeError> {
        let http = HttpClient::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: config.user_agent.clone(),
        })?;
        Ok(Self {
            config,
            http,
            render: None,
        })
    }

    /// Scrape every active source in order. A single source's failure lands
    /// in the error list and never aborts the batch; run metadata on each
    /// source is updated regardless of outcome.
    pub async fn run(&mut self, sources: &mut [SourceConfig]) -> RunSummary {
        let today = Utc::now().date_naive();
        let mut results: Vec<Opportunity> = Vec::new();
        let mut errors: Vec<SourceErrorEntry> = Vec::new();

        let active_count = sources.iter().filter(|s| s.active).count();
        info!(active = active_count, total = sources.len(), "starting scraping process");

        let mut first = true;
        for source in sources.iter_mut().filter(|s| s.active) {
            if !first {
                tokio::time::sleep(self.config.politeness_delay).await;
            }
            first = false;

            info!(source = %source.name, "scraping source");
            let outcome = self.scrape_source(source, today).await;
            source.last_scraped = Some(Utc::now());

            match outcome {
                Ok(raw_records) => {
                    let cleaned: Vec<Opportunity> = raw_records
                        .into_iter()
                        .filter_map(|raw| clean_record(raw, &source.name))
                        .collect();
                    info!(source = %source.name, count = cleaned.len(), "source yielded opportunities");
                    results.extend(cleaned);
                    source.success_count += 1;
                }
                Err(err) => {
                    error!(source = %source.name, error = %err, "error scraping source");
                    errors.push(SourceErrorEntry {
                        source: source.name.clone(),
                        error: err.to_string(),
                        timestamp: Utc::now(),
                    });
                    source.error_count += 1;
                }
            }
        }

        let sources_scraped = results
            .iter()
            .map(|record| record.source.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        RunSummary {
            run_id: Uuid::new_v4(),
            total_opportunities: results.len(),
            total_errors: errors.len(),
            sources_scraped,
            scraping_timestamp: Utc::now(),
            results,
            errors,
        }
    }

    async fn scrape_source(
        &mut self,
        source: &SourceConfig,
        today: NaiveDate,
    ) -> Result<Vec<RawOpportunity>, ScrapeError> {
        if source.requires_rendering {
            if self.render.is_none() {
                self.render = Some(RenderSession::launch(self.config.headless).await?);
            }
            let session = self.render.as_ref().ok_or_else(|| ScrapeError::Launch {
                reason: "render session unavailable".to_string(),
            })?;
            fetch_rendered(session, source, today).await
        } else {
            fetch_static(&self.http, source, today).await
        }
    }

    /// Release the render session. Must be called exactly once at the end of
    /// the run; [`run_pipeline`] does so on every path.
    pub async fn shutdown(mut self) {
        if let Some(session) = self.render.take() {
            session.close().await;
        }
    }
}

/// Trim and collapse whitespace, assign the stable identity, and stamp
/// provenance. Records missing any required field after cleaning are
/// dropped silently, mirroring field-level isolation upstream.
fn clean_record(raw: RawOpportunity, source_name: &str) -> Option<Opportunity> {
    let title = clean_text(&raw.title);
    let institute = clean_text(&raw.institute);
    let description = clean_text(&raw.description);
    let link = raw.link.trim().to_string();
    if title.is_empty() || institute.is_empty() || raw.deadline.is_empty() || link.is_empty() {
        return None;
    }
    let now = Utc::now();
    Some(Opportunity {
        id: opportunity_id(&title, &institute),
        title,
        institute,
        deadline: raw.deadline,
        link,
        description,
        source: source_name.to_string(),
        date_added: now.format("%Y-%m-%d").to_string(),
        scraped_at: now,
        archived_date: None,
    })
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sources_path: PathBuf,
    pub data_dir: PathBuf,
    pub runner: RunnerConfig,
}

/// One-shot run: load sources, scrape, release sessions, persist the store.
///
/// The runner is shut down before persistence so the render session is
/// released on every exit path, including a failing store commit.
pub async fn run_pipeline(config: PipelineConfig) -> Result<RunSummary> {
    let mut sources = load_sources(&config.sources_path).await;

    let mut runner = ScrapeRunner::new(config.runner.clone()).context("building scrape runner")?;
    let summary = runner.run(&mut sources).await;
    runner.shutdown().await;

    let store = OpportunityStore::new(&config.data_dir);
    let outcome = store
        .commit(summary.results.clone(), Utc::now().date_naive())
        .await
        .context("persisting opportunity store")?;
    info!(
        active = outcome.active,
        archived = outcome.archived,
        "opportunity store committed"
    );

    Ok(summary)
}

/// CSV rendition of a record set, RFC-4180 quoting on demand.
pub fn export_csv(records: &[Opportunity]) -> String {
    let mut lines = vec!["Title,Institute,Deadline,Source,Link,Date Added".to_string()];
    for record in records {
        lines.push(
            [
                escape_csv_field(&record.title),
                escape_csv_field(&record.institute),
                record.deadline.clone(),
                escape_csv_field(&record.source),
                record.link.clone(),
                record.date_added.clone(),
            ]
            .join(","),
        );
    }
    lines.join("\n")
}

fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total: usize,
    /// Deadlines within the next 30 days (inclusive of today).
    pub expiring_soon: usize,
    pub by_source: BTreeMap<String, usize>,
}

pub fn store_stats(records: &[Opportunity], today: NaiveDate) -> StoreStats {
    let horizon = today + chrono::Duration::days(30);
    let mut by_source = BTreeMap::new();
    let mut expiring_soon = 0;
    for record in records {
        *by_source.entry(record.source.clone()).or_insert(0) += 1;
        if let Ok(deadline) = NaiveDate::parse_from_str(&record.deadline, "%Y-%m-%d") {
            if deadline >= today && deadline <= horizon {
                expiring_soon += 1;
            }
        }
    }
    StoreStats {
        total: records.len(),
        expiring_soon,
        by_source,
    }
}
