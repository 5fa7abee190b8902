//! Link discovery: which homepage links are listing, detail and finance pages, and where
//! a listing page continues.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};

use crate::{site_host, PageKind, PageSnapshot};

static VIN_IN_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[/\-_=.])[a-hj-npr-z0-9]{17}(?:[/\-_.]|$)").expect("valid vin path regex")
});

static INVENTORY_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/inventory/(?:[a-z0-9-]+/)*\d{5,}(?:/|$|\.)").expect("valid id regex"));

static PAGE_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:^|[?&])(page|pg|pagenum|p)=(\d+)").expect("valid page regex"));

const DETAIL_MARKERS: &[&str] = &["/vehicle-details/", "/vehicle-detail/", "/vdp/", "/vehicle-info/"];

const FINANCE_MARKERS: &[&str] = &[
    "/finance",
    "/financing",
    "/credit",
    "/apply",
    "/pre-qual",
    "/prequal",
    "/get-pre-approved",
    "/trade",
    "/value-your-trade",
    "/payment-calculator",
    "/calculator",
];

const LISTING_MARKERS: &[&str] = &[
    "/inventory",
    "/new-inventory",
    "/used-inventory",
    "/searchnew",
    "/searchused",
    "/new-vehicles",
    "/used-vehicles",
    "/certified",
    "/cars-for-sale",
];

/// Classifies a same-site link. `None` means the link is not worth fetching.
pub fn classify_url(url: &Url) -> Option<PageKind> {
    let path = url.path().to_ascii_lowercase();
    let query = url.query().unwrap_or_default().to_ascii_lowercase();

    if VIN_IN_PATH.is_match(&path)
        || DETAIL_MARKERS.iter().any(|m| path.contains(m))
        || INVENTORY_ID.is_match(&path)
    {
        return Some(PageKind::Detail);
    }
    if FINANCE_MARKERS.iter().any(|m| path.contains(m)) {
        return Some(PageKind::Finance);
    }
    if LISTING_MARKERS.iter().any(|m| path.contains(m)) || PAGE_PARAM.is_match(&query) {
        return Some(PageKind::Listing);
    }
    None
}

/// Pages to fetch after the homepage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagePlan {
    pub listing: Option<Url>,
    pub detail: Option<Url>,
    pub finance: Vec<Url>,
}

pub fn plan_pages(home: &PageSnapshot, max_finance: usize) -> PagePlan {
    let mut plan = PagePlan::default();
    let mut best_listing: Option<(u8, Url)> = None;

    for url in page_links(home) {
        match classify_url(&url) {
            Some(PageKind::Listing) => {
                let score = listing_score(&url);
                if best_listing.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                    best_listing = Some((score, url));
                }
            }
            Some(PageKind::Detail) if plan.detail.is_none() => plan.detail = Some(url),
            Some(PageKind::Finance) => {
                if plan.finance.len() < max_finance && !plan.finance.contains(&url) {
                    plan.finance.push(url);
                }
            }
            _ => {}
        }
    }
    plan.listing = best_listing.map(|(_, url)| url);
    plan
}

/// A combined inventory page beats a condition-specific one.
fn listing_score(url: &Url) -> u8 {
    let path = url.path().to_ascii_lowercase();
    let query = url.query().unwrap_or_default().to_ascii_lowercase();
    let specific = ["new", "used", "certified", "pre-owned", "cpo"]
        .iter()
        .any(|w| path.contains(w) || query.contains(w));
    let paged = PAGE_PARAM
        .captures(&query)
        .and_then(|c| c.get(2))
        .map(|n| n.as_str() != "1")
        .unwrap_or(false);
    match (specific, paged) {
        (false, false) => 3,
        (true, false) => 2,
        (false, true) => 1,
        (true, true) => 0,
    }
}

pub fn first_detail_link(page: &PageSnapshot) -> Option<Url> {
    page_links(page)
        .into_iter()
        .find(|url| classify_url(url) == Some(PageKind::Detail))
}

/// Next listing page: `rel="next"`, then a "next" anchor, then `page=N+1` when the page
/// links to that number.
pub fn next_page_url(page: &PageSnapshot) -> Option<Url> {
    let base = page.parsed_url()?;
    let document = Html::parse_document(&page.html);

    let rel_next = Selector::parse(r#"link[rel~="next"], a[rel~="next"]"#).ok()?;
    if let Some(url) = document
        .select(&rel_next)
        .filter_map(|n| n.value().attr("href"))
        .find_map(|href| resolve_same_site(&base, href))
    {
        return Some(url);
    }

    let anchors = Selector::parse("a[href]").ok()?;
    for anchor in document.select(&anchors) {
        let label = anchor
            .text()
            .collect::<String>()
            .trim()
            .to_ascii_lowercase();
        let aria = anchor
            .value()
            .attr("aria-label")
            .unwrap_or_default()
            .to_ascii_lowercase();
        let is_next = matches!(label.as_str(), "next" | "next page" | "next >" | "›" | "»")
            || aria.starts_with("next");
        if is_next {
            if let Some(url) = anchor
                .value()
                .attr("href")
                .and_then(|href| resolve_same_site(&base, href))
            {
                return Some(url);
            }
        }
    }

    let (param, current) = match base.query().and_then(|q| PAGE_PARAM.captures(q)) {
        Some(caps) => (
            caps.get(1)?.as_str().to_string(),
            caps.get(2)?.as_str().parse::<u32>().ok()?,
        ),
        None => ("page".to_string(), 1),
    };
    let wanted = format!("{param}={}", current + 1);
    let advertised = document
        .select(&anchors)
        .filter_map(|n| n.value().attr("href"))
        .any(|href| href.contains(&wanted));
    if !advertised {
        return None;
    }
    Some(with_query_param(&base, &param, current + 1))
}

pub(crate) fn with_query_param(base: &Url, param: &str, value: u32) -> Url {
    let pairs = base
        .query_pairs()
        .filter(|(k, _)| k != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    let mut url = base.clone();
    url.set_fragment(None);
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &pairs {
            query.append_pair(k, v);
        }
        query.append_pair(param, &value.to_string());
    }
    url
}

fn resolve_same_site(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    let lower = href.to_ascii_lowercase();
    if href.is_empty()
        || href.starts_with('#')
        || lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
    {
        return None;
    }
    let mut url = base.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") || site_host(&url) != site_host(base) {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

/// Same-site links in document order, without duplicates.
fn page_links(page: &PageSnapshot) -> Vec<Url> {
    let Some(base) = page.parsed_url() else {
        return Vec::new();
    };
    let Ok(sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let document = Html::parse_document(&page.html);
    let mut out: Vec<Url> = Vec::new();
    for href in document.select(&sel).filter_map(|n| n.value().attr("href")) {
        if let Some(url) = resolve_same_site(&base, href) {
            if url != base && !out.contains(&url) {
                out.push(url);
            }
        }
    }
    out
}
