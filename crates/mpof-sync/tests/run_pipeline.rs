//! End-to-end orchestration tests against local wiremock servers.

use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mpof_core::{SelectorMap, SourceConfig};
use mpof_store::OpportunityStore;
use mpof_sync::{
    default_sources, load_sources, run_pipeline, PipelineConfig, RunnerConfig, ScrapeRunner,
};

fn test_runner_config() -> RunnerConfig {
    RunnerConfig {
        user_agent: "mpof-test/0.1".to_string(),
        http_timeout: Duration::from_secs(5),
        politeness_delay: Duration::ZERO,
        headless: true,
    }
}

fn static_source(id: &str, name: &str, base_uri: &str) -> SourceConfig {
    SourceConfig {
        id: id.to_string(),
        name: name.to_string(),
        url: format!("{base_uri}/jobs"),
        requires_rendering: false,
        active: true,
        selectors: SelectorMap {
            container: Some(".job".to_string()),
            title: Some(".title".to_string()),
            institute: Some(".institute".to_string()),
            deadline: Some(".deadline".to_string()),
            link: Some("a".to_string()),
            description: Some(".description".to_string()),
        },
        search_params: Default::default(),
        last_scraped: None,
        success_count: 0,
        error_count: 0,
    }
}

fn listing_page(deadline: &str) -> String {
    format!(
        r#"<html><body>
          <div class="job">
            <h2 class="title">PhD Position in Radiotherapy</h2>
            <span class="institute">Example University</span>
            <span class="deadline">{deadline}</span>
            <a href="/jobs/1">Apply</a>
          </div>
          <div class="job">
            <h2 class="title">Accountant</h2>
            <span class="institute">Acme Corp</span>
            <span class="deadline">{deadline}</span>
            <a href="/jobs/2">Apply</a>
          </div>
        </body></html>"#
    )
}

async fn mount_listing(server: &MockServer, deadline: &str) {
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(deadline)))
        .mount(server)
        .await;
}

// ---------------------------------------------------------------------------
// End-to-end: one source, two containers, one relevant
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_yields_exactly_the_relevant_records() {
    let server = MockServer::start().await;
    mount_listing(&server, "2099-10-01").await;

    let mut sources = vec![static_source("test-jobs", "Test Jobs", &server.uri())];
    let mut runner = ScrapeRunner::new(test_runner_config()).expect("runner");
    let summary = runner.run(&mut sources).await;
    runner.shutdown().await;

    assert_eq!(summary.total_opportunities, 1);
    assert_eq!(summary.total_errors, 0);
    assert_eq!(summary.sources_scraped, 1);
    assert_eq!(summary.results[0].title, "PhD Position in Radiotherapy");
    assert_eq!(summary.results[0].source, "Test Jobs");

    assert_eq!(sources[0].success_count, 1);
    assert_eq!(sources[0].error_count, 0);
    assert!(sources[0].last_scraped.is_some());
}

// ---------------------------------------------------------------------------
// Error isolation: a failing source never aborts the batch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_failing_source_is_recorded_and_the_batch_continues() {
    let broken = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&broken)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;

    let healthy = MockServer::start().await;
    mount_listing(&healthy, "2099-10-01").await;

    let mut sources = vec![
        static_source("broken", "Broken Jobs", &broken.uri()),
        static_source("healthy", "Healthy Jobs", &healthy.uri()),
    ];
    let mut runner = ScrapeRunner::new(test_runner_config()).expect("runner");
    let summary = runner.run(&mut sources).await;
    runner.shutdown().await;

    assert_eq!(summary.total_opportunities, 1);
    assert_eq!(summary.total_errors, 1);
    assert_eq!(summary.errors[0].source, "Broken Jobs");
    assert_eq!(summary.sources_scraped, 1);

    assert_eq!(sources[0].error_count, 1);
    assert_eq!(sources[0].success_count, 0);
    assert_eq!(sources[1].success_count, 1);
    assert!(sources[0].last_scraped.is_some(), "metadata updated on failure too");
}

// ---------------------------------------------------------------------------
// Inactive sources are skipped entirely
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inactive_sources_are_never_fetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut source = static_source("dormant", "Dormant Jobs", &server.uri());
    source.active = false;
    let mut sources = vec![source];

    let mut runner = ScrapeRunner::new(test_runner_config()).expect("runner");
    let summary = runner.run(&mut sources).await;
    runner.shutdown().await;

    assert_eq!(summary.total_opportunities, 0);
    assert_eq!(summary.total_errors, 0);
    assert!(sources[0].last_scraped.is_none());
}

// ---------------------------------------------------------------------------
// Registry loading falls back to the built-in defaults
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_registry_file_falls_back_to_defaults() {
    let sources = load_sources(std::path::Path::new("/nonexistent/sources.yaml")).await;
    assert_eq!(sources.len(), default_sources().len());
    assert_eq!(sources[0].id, "nature-jobs");
}

#[tokio::test]
async fn unparseable_registry_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = dir.path().join("sources.yaml");
    std::fs::write(&registry, "sources: [ {{ not yaml").expect("write garbage");

    let sources = load_sources(&registry).await;
    assert_eq!(sources.len(), default_sources().len());
}

#[tokio::test]
async fn registry_file_with_valid_yaml_is_used_as_is() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = dir.path().join("sources.yaml");
    std::fs::write(
        &registry,
        r#"
sources:
  - id: custom-board
    name: Custom Board
    url: https://jobs.example.org
    requires_rendering: true
    selectors:
      container: ".posting"
"#,
    )
    .expect("write registry");

    let sources = load_sources(&registry).await;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].id, "custom-board");
    assert!(sources[0].requires_rendering);
    assert!(sources[0].active, "active defaults to true");
    assert_eq!(sources[0].selectors.container.as_deref(), Some(".posting"));
}

// ---------------------------------------------------------------------------
// Full pipeline: summary + persisted store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pipeline_persists_active_records_and_archives_expired_ones() {
    let server = MockServer::start().await;
    // One relevant record with a long-expired deadline: it must flow through
    // the summary and land in the archive, not the active set.
    mount_listing(&server, "2020-01-01").await;

    let dir = tempfile::tempdir().expect("tempdir");
    let registry = dir.path().join("sources.yaml");
    std::fs::write(
        &registry,
        format!(
            r#"
sources:
  - id: test-jobs
    name: Test Jobs
    url: {}/jobs
    selectors:
      container: ".job"
      title: ".title"
      institute: ".institute"
      deadline: ".deadline"
      link: "a"
"#,
            server.uri()
        ),
    )
    .expect("write registry");

    let summary = run_pipeline(PipelineConfig {
        sources_path: registry,
        data_dir: dir.path().to_path_buf(),
        runner: test_runner_config(),
    })
    .await
    .expect("pipeline run");

    assert_eq!(summary.total_opportunities, 1);
    assert_eq!(summary.total_errors, 0);

    let store = OpportunityStore::new(dir.path());
    assert!(store.load_active().await.is_empty());
    let archive = store.load_archive().await;
    assert_eq!(archive.len(), 1);
    assert!(archive[0].archived_date.is_some());
}

#[tokio::test]
async fn run_summary_serializes_with_camel_case_keys() {
    let server = MockServer::start().await;
    mount_listing(&server, "2099-10-01").await;

    let mut sources = vec![static_source("test-jobs", "Test Jobs", &server.uri())];
    let mut runner = ScrapeRunner::new(test_runner_config()).expect("runner");
    let summary = runner.run(&mut sources).await;
    runner.shutdown().await;

    let value = serde_json::to_value(&summary).expect("serialize summary");
    assert!(value.get("totalOpportunities").is_some());
    assert!(value.get("totalErrors").is_some());
    assert!(value.get("sourcesScraped").is_some());
    assert!(value.get("scrapingTimestamp").is_some());
}
