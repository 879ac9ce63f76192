//! Selector-driven extraction backends for MPOF sources.
//!
//! Two interchangeable paths produce [`RawOpportunity`] records from a
//! configured source: [`fetch_static`] parses the as-delivered document with
//! the `scraper` crate, [`fetch_rendered`] drives a headless Chromium session
//! through `chromiumoxide`. Both feed the same field extractor, which only
//! depends on the [`ListingNode`] capability trait.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use chrono::NaiveDate;
use futures::StreamExt;
use mpof_core::{is_relevant, normalize_deadline, SelectorMap, SourceConfig};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "mpof-scrape";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

const ROBOTS_TIMEOUT: Duration = Duration::from_secs(10);
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const ELEMENT_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Extractor output before cleaning and identity assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOpportunity {
    pub title: String,
    pub institute: String,
    /// Already canonical `YYYY-MM-DD`.
    pub deadline: String,
    /// Absolute URL.
    pub link: String,
    pub description: String,
}

/// Source-level failures. Each one is isolated to a single source by the
/// orchestrator and recorded in the run's error list.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("building HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },
    #[error("robots.txt disallows scraping {origin}")]
    RobotsDisallowed { origin: String },
    #[error("invalid source URL \"{url}\": {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid container selector \"{selector}\"")]
    BadContainerSelector { selector: String },
    #[error("navigation to {url} timed out after {timeout_secs}s")]
    NavigationTimeout { url: String, timeout_secs: u64 },
    #[error("timed out after {timeout_secs}s waiting for \"{selector}\"")]
    WaitTimeout { selector: String, timeout_secs: u64 },
    #[error("browser error: {0}")]
    Browser(#[from] chromiumoxide::error::CdpError),
    #[error("failed to launch render session: {reason}")]
    Launch { reason: String },
}

/// Record-level faults while reading one node. The enclosing enumeration
/// logs and skips the node, it never aborts the source.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("browser error reading element: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Bounded-timeout document fetcher with browser-like default headers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ScrapeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        headers.insert(
            HeaderName::from_static("upgrade-insecure-requests"),
            HeaderValue::from_static("1"),
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()
            .map_err(ScrapeError::Client)?;
        Ok(Self { client })
    }

    /// One GET, returning status + body text. `timeout` overrides the
    /// client-wide bound for this request only.
    pub async fn get_text(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<(StatusCode, String), reqwest::Error> {
        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Uniform scoped-lookup capability over one listing's enclosing node.
///
/// `Ok(None)` means "not found" (including an unparseable selector) and the
/// extractor substitutes a field default; `Err` is a backend fault and the
/// whole node is skipped. `?Send` on purpose: the run is strictly sequential
/// and the static document tree is thread-local.
#[async_trait(?Send)]
pub trait ListingNode {
    async fn select_text(&self, selector: &str) -> Result<Option<String>, NodeError>;
    async fn select_attr(&self, selector: &str, attr: &str) -> Result<Option<String>, NodeError>;
}

/// Node backed by a parsed static document.
pub struct StaticNode<'a> {
    node: ElementRef<'a>,
}

impl<'a> StaticNode<'a> {
    pub fn new(node: ElementRef<'a>) -> Self {
        Self { node }
    }
}

#[async_trait(?Send)]
impl ListingNode for StaticNode<'_> {
    async fn select_text(&self, selector: &str) -> Result<Option<String>, NodeError> {
        let Ok(sel) = Selector::parse(selector) else {
            return Ok(None);
        };
        Ok(self
            .node
            .select(&sel)
            .next()
            .and_then(|n| text_or_none(n.text().collect::<String>())))
    }

    async fn select_attr(&self, selector: &str, attr: &str) -> Result<Option<String>, NodeError> {
        let Ok(sel) = Selector::parse(selector) else {
            return Ok(None);
        };
        Ok(self
            .node
            .select(&sel)
            .next()
            .and_then(|n| n.value().attr(attr))
            .and_then(|s| text_or_none(s.to_string())))
    }
}

/// Node backed by a live element handle in the render session.
pub struct RenderedNode {
    element: Element,
}

impl RenderedNode {
    pub fn new(element: Element) -> Self {
        Self { element }
    }
}

#[async_trait(?Send)]
impl ListingNode for RenderedNode {
    async fn select_text(&self, selector: &str) -> Result<Option<String>, NodeError> {
        // A failed scoped query is "not found"; faults on an element we do
        // hold escalate to a record-level skip.
        let Ok(element) = self.element.find_element(selector).await else {
            return Ok(None);
        };
        Ok(element.inner_text().await?.and_then(text_or_none))
    }

    async fn select_attr(&self, selector: &str, attr: &str) -> Result<Option<String>, NodeError> {
        let Ok(element) = self.element.find_element(selector).await else {
            return Ok(None);
        };
        Ok(element.attribute(attr).await?.and_then(text_or_none))
    }
}

/// Extract one raw record from a listing node.
///
/// Every field lookup failure substitutes a field default instead of
/// aborting the record; the link resolves to absolute form against
/// `base_url`. Returns `Ok(None)` when the relevance gate rejects the record
/// (not an error).
pub async fn extract_record(
    node: &dyn ListingNode,
    selectors: &SelectorMap,
    base_url: &Url,
    today: NaiveDate,
) -> Result<Option<RawOpportunity>, NodeError> {
    let title = node
        .select_text(selectors.title.as_deref().unwrap_or(".title"))
        .await?
        .unwrap_or_else(|| "No title".to_string());

    let institute = node
        .select_text(selectors.institute.as_deref().unwrap_or(".institute"))
        .await?
        .unwrap_or_else(|| "Unknown".to_string());

    let deadline_text = node
        .select_text(selectors.deadline.as_deref().unwrap_or(".deadline"))
        .await?
        .unwrap_or_default();
    let deadline = normalize_deadline(&deadline_text, today);

    let link = match node
        .select_attr(selectors.link.as_deref().unwrap_or("a"), "href")
        .await?
    {
        Some(href) => base_url
            .join(&href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| base_url.to_string()),
        None => base_url.to_string(),
    };

    let description = node
        .select_text(selectors.description.as_deref().unwrap_or(".description"))
        .await?
        .unwrap_or_default();

    if !is_relevant(&title, &description) {
        return Ok(None);
    }

    Ok(Some(RawOpportunity {
        title,
        institute,
        deadline,
        link,
        description,
    }))
}

fn robots_denies_all(body: &str) -> bool {
    let lower = body.to_lowercase();
    let wildcard_agent = lower.lines().any(|line| line.trim() == "user-agent: *");
    let blanket_disallow = lower.lines().any(|line| line.trim() == "disallow: /");
    wildcard_agent && blanket_disallow
}

/// Simplified robots policy: only a wildcard user-agent block with a blanket
/// disallow refuses the source. Fails open on any fetch problem.
pub async fn robots_allows(http: &HttpClient, base_url: &Url) -> bool {
    let Ok(robots_url) = base_url.join("/robots.txt") else {
        return true;
    };
    match http.get_text(robots_url.as_str(), Some(ROBOTS_TIMEOUT)).await {
        Ok((status, body)) if status == StatusCode::OK => !robots_denies_all(&body),
        Ok(_) => true,
        Err(err) => {
            debug!(url = %robots_url, error = %err, "robots fetch failed, assuming allowed");
            true
        }
    }
}

/// Static extraction path: robots check, one bounded document fetch, then
/// per-node field extraction over the container matches.
pub async fn fetch_static(
    http: &HttpClient,
    source: &SourceConfig,
    today: NaiveDate,
) -> Result<Vec<RawOpportunity>, ScrapeError> {
    let base_url = Url::parse(&source.url).map_err(|err| ScrapeError::InvalidUrl {
        url: source.url.clone(),
        reason: err.to_string(),
    })?;

    if !robots_allows(http, &base_url).await {
        return Err(ScrapeError::RobotsDisallowed {
            origin: base_url.origin().ascii_serialization(),
        });
    }

    let (status, body) =
        http.get_text(&source.url, None)
            .await
            .map_err(|source_err| ScrapeError::Request {
                url: source.url.clone(),
                source: source_err,
            })?;
    if !status.is_success() {
        return Err(ScrapeError::UnexpectedStatus {
            status: status.as_u16(),
            url: source.url.clone(),
        });
    }

    let container = source.selectors.container_or_default();
    let container_sel =
        Selector::parse(container).map_err(|_| ScrapeError::BadContainerSelector {
            selector: container.to_string(),
        })?;

    let document = Html::parse_document(&body);
    let mut records = Vec::new();
    for node in document.select(&container_sel) {
        let node = StaticNode::new(node);
        match extract_record(&node, &source.selectors, &base_url, today).await {
            Ok(Some(raw)) => records.push(raw),
            Ok(None) => {}
            Err(err) => {
                warn!(source = %source.id, error = %err, "skipping listing node");
            }
        }
    }
    Ok(records)
}

/// One headless Chromium session, reused across every rendered source in a
/// run. Owned by the orchestrator: created lazily on first need, closed
/// exactly once via [`RenderSession::close`].
pub struct RenderSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

impl RenderSession {
    pub async fn launch(headless: bool) -> Result<Self, ScrapeError> {
        let mut builder = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--window-size=1920,1080");
        if headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|reason| ScrapeError::Launch { reason })?;

        let (browser, mut handler) = Browser::launch(config).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });
        let page = browser.new_page("about:blank").await?;
        info!("render session launched");
        Ok(Self {
            browser,
            page,
            handler,
        })
    }

    pub async fn close(mut self) {
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "closing render session");
        }
        self.handler.abort();
    }
}

async fn wait_for_element(page: &Page, selector: &str) -> Result<(), ScrapeError> {
    let deadline = tokio::time::Instant::now() + ELEMENT_WAIT_TIMEOUT;
    loop {
        if page.find_element(selector).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ScrapeError::WaitTimeout {
                selector: selector.to_string(),
                timeout_secs: ELEMENT_WAIT_TIMEOUT.as_secs(),
            });
        }
        tokio::time::sleep(ELEMENT_POLL_INTERVAL).await;
    }
}

/// Rendered extraction path: navigate, wait for the configured container to
/// appear, then per-element field extraction with the same default isolation
/// as the static path.
pub async fn fetch_rendered(
    session: &RenderSession,
    source: &SourceConfig,
    today: NaiveDate,
) -> Result<Vec<RawOpportunity>, ScrapeError> {
    let base_url = Url::parse(&source.url).map_err(|err| ScrapeError::InvalidUrl {
        url: source.url.clone(),
        reason: err.to_string(),
    })?;

    match tokio::time::timeout(NAVIGATION_TIMEOUT, session.page.goto(source.url.as_str())).await {
        Ok(Ok(_)) => {
            let _ = session.page.wait_for_navigation().await;
        }
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => {
            return Err(ScrapeError::NavigationTimeout {
                url: source.url.clone(),
                timeout_secs: NAVIGATION_TIMEOUT.as_secs(),
            })
        }
    }

    let container = source.selectors.container_or_default();
    if source.selectors.container.is_some() {
        wait_for_element(&session.page, container).await?;
    }

    let elements = session
        .page
        .find_elements(container)
        .await
        .unwrap_or_default();
    let mut records = Vec::new();
    for element in elements {
        let node = RenderedNode::new(element);
        match extract_record(&node, &source.selectors, &base_url, today).await {
            Ok(Some(raw)) => records.push(raw),
            Ok(None) => {}
            Err(err) => {
                warn!(source = %source.id, error = %err, "skipping rendered element");
            }
        }
    }
    Ok(records)
}
