//! Site scraping: isolated sessions, page snapshots, tool detection and inventory extraction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dossier_core::{FailureReason, ScrapeTarget};
use dossier_storage::{ArtifactStore, FetchError, FetchSession, HttpFetcher, RetryDisposition};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod detect;
pub mod discover;
pub mod enrich;
pub mod extract;

pub use detect::{ToolDetection, ToolDetector, ToolRuleTable};
pub use discover::{classify_url, PagePlan};
pub use enrich::{enrich_inventory, NhtsaVinDecoder, VinDecodeError, VinDecoder, VinDecoding};
pub use extract::{InventoryExtractor, InventoryRules};

pub const CRATE_NAME: &str = "dossier-scrape";

pub const BUILTIN_TOOLS_YAML: &str = include_str!("../../../rules/tools.yaml");
pub const BUILTIN_INVENTORY_YAML: &str = include_str!("../../../rules/inventory.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Home,
    Listing,
    Detail,
    Finance,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{url} served a bot challenge ({marker})")]
    Blocked { url: String, marker: String },
    #[error("fixture site: {0}")]
    Fixture(String),
}

impl ScrapeError {
    /// Connect, timeout, request-level, 5xx and 429 failures are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch(err) => err.disposition() == RetryDisposition::Retryable,
            Self::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            Self::InvalidUrl { .. } | Self::Blocked { .. } | Self::Fixture(_) => false,
        }
    }

    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::InvalidUrl { reason, .. } => FailureReason::InvalidUrl(reason.clone()),
            Self::Fetch(FetchError::Request(err)) if err.is_timeout() => FailureReason::Timeout,
            Self::Fetch(FetchError::Request(err)) => FailureReason::Network(err.to_string()),
            Self::Fetch(err @ FetchError::TooLarge { .. }) => FailureReason::Network(err.to_string()),
            Self::Fetch(FetchError::Session(detail)) => FailureReason::Internal(detail.clone()),
            Self::HttpStatus { status, .. } => FailureReason::HttpStatus(*status),
            Self::Blocked { marker, .. } => FailureReason::Blocked(marker.clone()),
            Self::Fixture(detail) => FailureReason::Network(detail.clone()),
        }
    }
}

/// Shared failure type for rule tables; rows are validated when loaded, never while matching.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("reading rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rule table: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{rule}: invalid regex {pattern:?}: {source}")]
    Regex {
        rule: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{rule}: invalid selector {css:?}: {message}")]
    Selector {
        rule: String,
        css: String,
        message: String,
    },
    #[error("{rule}: {message}")]
    Invalid { rule: String, message: String },
}

pub(crate) fn compile_selector(rule: &str, css: &str) -> Result<Selector, RuleError> {
    Selector::parse(css).map_err(|err| RuleError::Selector {
        rule: rule.to_string(),
        css: css.to_string(),
        message: err.to_string(),
    })
}

fn read_rule_file(path: &Path) -> Result<Option<String>, RuleError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RuleError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Both rule tables. A directory override replaces whichever files it contains.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub tools: ToolRuleTable,
    pub inventory: InventoryRules,
}

impl RuleSet {
    pub fn builtin() -> Result<Self, RuleError> {
        Ok(Self {
            tools: ToolRuleTable::from_yaml_str(BUILTIN_TOOLS_YAML)?,
            inventory: InventoryRules::from_yaml_str(BUILTIN_INVENTORY_YAML)?,
        })
    }

    pub fn load(dir: Option<&Path>) -> Result<Self, RuleError> {
        let Some(dir) = dir else {
            return Self::builtin();
        };
        let tools = match read_rule_file(&dir.join("tools.yaml"))? {
            Some(raw) => ToolRuleTable::from_yaml_str(&raw)?,
            None => ToolRuleTable::from_yaml_str(BUILTIN_TOOLS_YAML)?,
        };
        let inventory = match read_rule_file(&dir.join("inventory.yaml"))? {
            Some(raw) => InventoryRules::from_yaml_str(&raw)?,
            None => InventoryRules::from_yaml_str(BUILTIN_INVENTORY_YAML)?,
        };
        Ok(Self { tools, inventory })
    }
}

/// One captured page. Parsing happens once here; consumers re-parse `html` on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub kind: PageKind,
    pub status: u16,
    pub html: String,
    pub text: String,
    pub structured: Vec<JsonValue>,
    pub fetched_at: DateTime<Utc>,
}

impl PageSnapshot {
    pub fn from_html(
        url: impl Into<String>,
        kind: PageKind,
        status: u16,
        html: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let html = html.into();
        let document = Html::parse_document(&html);
        let text = visible_text(&document);
        let structured = json_ld_blocks(&document);
        Self {
            url: url.into(),
            kind,
            status,
            html,
            text,
            structured,
            fetched_at,
        }
    }

    pub fn parsed_url(&self) -> Option<Url> {
        Url::parse(&self.url).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSnapshot {
    pub target: ScrapeTarget,
    pub session_id: Uuid,
    pub pages: Vec<PageSnapshot>,
}

impl SiteSnapshot {
    pub fn pages_of(&self, kind: PageKind) -> impl Iterator<Item = &PageSnapshot> {
        self.pages.iter().filter(move |p| p.kind == kind)
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.pages
            .first()
            .map(|p| p.fetched_at)
            .unwrap_or_else(Utc::now)
    }

    /// Writes every captured page under `<job_id>/<target slug>/`. Returns the number stored.
    pub async fn persist(&self, store: &ArtifactStore, job_id: Uuid) -> anyhow::Result<usize> {
        let slug = dossier_storage::slugify(&self.target.name);
        let mut stored = 0;
        for page in &self.pages {
            store
                .store_page(job_id, &slug, &page.url, page.fetched_at, &page.html)
                .await?;
            stored += 1;
        }
        Ok(stored)
    }
}

#[async_trait]
pub trait SiteScraper: Send + Sync {
    async fn scrape(&self, target: &ScrapeTarget) -> Result<SiteSnapshot, ScrapeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScraperConfig {
    pub max_listing_pages: usize,
    pub max_finance_pages: usize,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            max_listing_pages: 10,
            max_finance_pages: 3,
        }
    }
}

/// Live scraper. Each call opens a fresh session, so no cookies or connections cross targets.
#[derive(Debug, Clone)]
pub struct HttpSiteScraper {
    fetcher: HttpFetcher,
    config: ScraperConfig,
}

impl HttpSiteScraper {
    pub fn new(fetcher: HttpFetcher, config: ScraperConfig) -> Self {
        Self { fetcher, config }
    }

    async fn fetch(
        &self,
        session: &FetchSession,
        url: &Url,
        kind: PageKind,
    ) -> Result<PageSnapshot, ScrapeError> {
        let resp = session.fetch_page(url.as_str()).await?;
        let status = resp.status.as_u16();
        let html = resp.text();
        if let Some(marker) = challenge_marker(status, &html) {
            return Err(ScrapeError::Blocked {
                url: resp.final_url,
                marker: marker.to_string(),
            });
        }
        if !resp.status.is_success() {
            return Err(ScrapeError::HttpStatus {
                status,
                url: resp.final_url,
            });
        }
        Ok(PageSnapshot::from_html(
            resp.final_url,
            kind,
            status,
            html,
            resp.fetched_at,
        ))
    }

    /// Pages after the homepage are optional: one that fails to load is skipped, but a bot
    /// challenge on any page fails the target.
    async fn fetch_optional(
        &self,
        session: &FetchSession,
        url: &Url,
        kind: PageKind,
    ) -> Result<Option<PageSnapshot>, ScrapeError> {
        match self.fetch(session, url, kind).await {
            Ok(page) => Ok(Some(page)),
            Err(err @ ScrapeError::Blocked { .. }) => Err(err),
            Err(err) => {
                debug!(url = %url, ?kind, error = %err, "skipping page");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl SiteScraper for HttpSiteScraper {
    async fn scrape(&self, target: &ScrapeTarget) -> Result<SiteSnapshot, ScrapeError> {
        let base = parse_target_url(&target.url)?;
        let session = self.fetcher.open_session()?;
        let session_id = session.id();

        let home = self.fetch(&session, &base, PageKind::Home).await?;
        let plan = discover::plan_pages(&home, self.config.max_finance_pages);
        let mut pages = vec![home];

        for url in &plan.finance {
            if let Some(page) = self.fetch_optional(&session, url, PageKind::Finance).await? {
                pages.push(page);
            }
        }

        let mut listing_pages: Vec<PageSnapshot> = Vec::new();
        let first_listing = match &plan.listing {
            Some(url) if self.config.max_listing_pages > 0 => self
                .fetch_optional(&session, url, PageKind::Listing)
                .await?
                .map(|page| (url, page)),
            _ => None,
        };
        // Without a listing page, extraction falls back to the homepage.
        if let Some((first_url, first)) = first_listing {
            let mut seen_urls = HashSet::from([first_url.to_string(), first.url.clone()]);
            let mut seen_content = HashSet::from([content_fingerprint(&first)]);
            listing_pages.push(first);

            while listing_pages.len() < self.config.max_listing_pages {
                let Some(next) = listing_pages.last().and_then(discover::next_page_url) else {
                    break;
                };
                if !seen_urls.insert(next.to_string()) {
                    debug!(url = %next, "pagination loop detected");
                    break;
                }
                let Some(page) = self
                    .fetch_optional(&session, &next, PageKind::Listing)
                    .await?
                else {
                    break;
                };
                if !seen_content.insert(content_fingerprint(&page)) {
                    debug!(url = %next, "listing page repeated earlier content");
                    break;
                }
                seen_urls.insert(page.url.clone());
                listing_pages.push(page);
            }
        }

        let detail_url = plan
            .detail
            .clone()
            .or_else(|| listing_pages.first().and_then(discover::first_detail_link));
        pages.extend(listing_pages);
        if let Some(url) = detail_url {
            if let Some(page) = self.fetch_optional(&session, &url, PageKind::Detail).await? {
                pages.push(page);
            }
        }

        debug!(
            site = %target.name,
            session = %session_id,
            pages = pages.len(),
            "site captured"
        );
        Ok(SiteSnapshot {
            target: target.clone(),
            session_id,
            pages,
        })
    }
}

/// Offline scraper over `<root>/<host>/{home,listing-N,detail,finance-N}.html`.
#[derive(Debug, Clone)]
pub struct FixtureSiteScraper {
    root: PathBuf,
    config: ScraperConfig,
}

impl FixtureSiteScraper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: ScraperConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ScraperConfig) -> Self {
        self.config = config;
        self
    }

    async fn read_optional(path: &Path) -> Result<Option<String>, ScrapeError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ScrapeError::Fixture(format!(
                "reading {}: {err}",
                path.display()
            ))),
        }
    }

    fn page(url: &Url, kind: PageKind, html: String) -> Result<PageSnapshot, ScrapeError> {
        if let Some(marker) = challenge_marker(200, &html) {
            return Err(ScrapeError::Blocked {
                url: url.to_string(),
                marker: marker.to_string(),
            });
        }
        Ok(PageSnapshot::from_html(
            url.as_str(),
            kind,
            200,
            html,
            Utc::now(),
        ))
    }

    fn page_url(base: &Url, path: &str) -> Result<Url, ScrapeError> {
        base.join(path).map_err(|err| ScrapeError::InvalidUrl {
            url: format!("{base}{path}"),
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl SiteScraper for FixtureSiteScraper {
    async fn scrape(&self, target: &ScrapeTarget) -> Result<SiteSnapshot, ScrapeError> {
        let base = parse_target_url(&target.url)?;
        let host = site_host(&base).ok_or_else(|| ScrapeError::InvalidUrl {
            url: target.url.clone(),
            reason: "missing host".into(),
        })?;
        let dir = self.root.join(&host);

        let home = Self::read_optional(&dir.join("home.html"))
            .await?
            .ok_or_else(|| ScrapeError::Fixture(format!("no fixture site for {host}")))?;
        let home = Self::page(&base, PageKind::Home, home)?;
        // Pages are addressed the way live discovery would find them, so URL-derived
        // hints behave the same offline.
        let plan = discover::plan_pages(&home, self.config.max_finance_pages);
        let mut pages = vec![home];

        for n in 1..=self.config.max_finance_pages {
            let Some(html) = Self::read_optional(&dir.join(format!("finance-{n}.html"))).await?
            else {
                break;
            };
            let url = match plan.finance.get(n - 1) {
                Some(url) => url.clone(),
                None => Self::page_url(&base, &format!("finance-{n}"))?,
            };
            pages.push(Self::page(&url, PageKind::Finance, html)?);
        }

        let listing_base = match &plan.listing {
            Some(url) => url.clone(),
            None => Self::page_url(&base, "inventory")?,
        };
        let mut detail_url = plan.detail.clone();
        for n in 1..=self.config.max_listing_pages {
            let Some(html) = Self::read_optional(&dir.join(format!("listing-{n}.html"))).await?
            else {
                break;
            };
            let url = if n == 1 {
                listing_base.clone()
            } else {
                discover::with_query_param(&listing_base, "page", n as u32)
            };
            let page = Self::page(&url, PageKind::Listing, html)?;
            if detail_url.is_none() {
                detail_url = discover::first_detail_link(&page);
            }
            pages.push(page);
        }
        if let Some(html) = Self::read_optional(&dir.join("detail.html")).await? {
            let url = match detail_url {
                Some(url) => url,
                None => Self::page_url(&base, "vehicle-details/fixture")?,
            };
            pages.push(Self::page(&url, PageKind::Detail, html)?);
        }

        Ok(SiteSnapshot {
            target: target.clone(),
            session_id: Uuid::new_v4(),
            pages,
        })
    }
}

pub fn parse_target_url(raw: &str) -> Result<Url, ScrapeError> {
    let invalid = |reason: String| ScrapeError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(invalid("missing host".into()));
    }
    Ok(url)
}

/// Lowercased host without a leading `www.`.
pub fn site_host(url: &Url) -> Option<String> {
    url.host_str().map(|h| {
        let h = h.to_ascii_lowercase();
        h.strip_prefix("www.").map(str::to_string).unwrap_or(h)
    })
}

const CHALLENGE_MARKERS: &[&str] = &[
    "cf-challenge",
    "cf_chl_opt",
    "<title>just a moment",
    "<title>attention required",
    "px-captcha",
    "_incapsula_resource",
];

const BLOCK_PAGE_MARKERS: &[&str] = &[
    "just a moment",
    "access denied",
    "attention required",
    "captcha",
    "request unsuccessful",
];

/// Finds a bot-challenge marker. Error statuses are checked against a wider list, since an
/// ordinary page may legitimately mention "captcha" in a form.
pub fn challenge_marker(status: u16, html: &str) -> Option<&'static str> {
    let lower = html.to_ascii_lowercase();
    if let Some(marker) = CHALLENGE_MARKERS.iter().find(|m| lower.contains(*m)) {
        return Some(*marker);
    }
    if matches!(status, 403 | 429 | 503) {
        return BLOCK_PAGE_MARKERS.iter().find(|m| lower.contains(*m)).copied();
    }
    None
}

fn content_fingerprint(page: &PageSnapshot) -> String {
    ArtifactStore::sha256_hex(page.text.as_bytes())
}

pub(crate) fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = normalize_whitespace(&value);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

pub(crate) fn select_first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).find_map(element_text)
}

pub(crate) fn select_all_texts(scope: ElementRef<'_>, selector: &Selector) -> Vec<String> {
    scope.select(selector).filter_map(element_text).collect()
}

pub(crate) fn select_first_attr(
    scope: ElementRef<'_>,
    selector: &Selector,
    attr: &str,
) -> Option<String> {
    scope
        .select(selector)
        .filter_map(|n| n.value().attr(attr))
        .find_map(|s| text_or_none(s.to_string()))
}

/// Text a visitor would see: everything outside script, style, noscript and template.
fn visible_text(document: &Html) -> String {
    let mut out = String::new();
    for node in document.tree.nodes() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|e| matches!(e.name(), "script" | "style" | "noscript" | "template"))
                .unwrap_or(false)
        });
        if !hidden {
            out.push_str(text);
            out.push(' ');
        }
    }
    normalize_whitespace(&out)
}

fn json_ld_blocks(document: &Html) -> Vec<JsonValue> {
    let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|n| {
            let raw = n.text().collect::<String>();
            match serde_json::from_str::<JsonValue>(raw.trim()) {
                Ok(value) => Some(value),
                Err(err) => {
                    debug!(error = %err, "ignoring malformed json-ld block");
                    None
                }
            }
        })
        .collect()
}
