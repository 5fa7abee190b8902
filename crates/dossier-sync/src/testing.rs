//! Scripted scraper shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dossier_core::ScrapeTarget;
use dossier_scrape::{PageKind, PageSnapshot, ScrapeError, SiteScraper, SiteSnapshot};
use uuid::Uuid;

#[derive(Clone, Copy)]
pub enum Behavior {
    Ok { delay: Duration },
    Hang,
    Transient { failures: usize },
    Blocked,
    /// Succeeds with a homepage holding `html`.
    Page { html: &'static str },
}

#[derive(Default)]
pub struct ScriptedScraper {
    pub behaviors: HashMap<String, Behavior>,
    pub calls: Mutex<HashMap<String, usize>>,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ScriptedScraper {
    pub fn with(mut self, url: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(url.to_string(), behavior);
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

pub fn snapshot(target: &ScrapeTarget) -> SiteSnapshot {
    snapshot_of(
        target,
        r#"<div data-vin="1FTFW1E50PFA00001" data-year="2024" data-make="Ford"
        data-model="F-150" data-price="52000" data-condition="new"></div>"#,
    )
}

pub fn snapshot_of(target: &ScrapeTarget, html: &str) -> SiteSnapshot {
    SiteSnapshot {
        target: target.clone(),
        session_id: Uuid::new_v4(),
        pages: vec![PageSnapshot::from_html(
            &target.url,
            PageKind::Home,
            200,
            html,
            Utc::now(),
        )],
    }
}

#[async_trait]
impl SiteScraper for ScriptedScraper {
    async fn scrape(&self, target: &ScrapeTarget) -> Result<SiteSnapshot, ScrapeError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(target.url.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .get(&target.url)
            .copied()
            .unwrap_or(Behavior::Ok { delay: Duration::ZERO });
        let outcome = match behavior {
            Behavior::Ok { delay } => {
                tokio::time::sleep(delay).await;
                Ok(snapshot(target))
            }
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Ok(snapshot(target))
            }
            Behavior::Transient { failures } if call <= failures => {
                Err(ScrapeError::HttpStatus {
                    status: 503,
                    url: target.url.clone(),
                })
            }
            Behavior::Transient { .. } => Ok(snapshot(target)),
            Behavior::Blocked => Err(ScrapeError::Blocked {
                url: target.url.clone(),
                marker: "cf-challenge".into(),
            }),
            Behavior::Page { html } => Ok(snapshot_of(target, html)),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}
