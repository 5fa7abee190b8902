//! Dossier assembly from a job and its scrape results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dossier_core::{Dossier, DossierStatus, FailedTarget, Job, ScrapeResult};
use uuid::Uuid;

use crate::compare::{compare_market, CompareError};

/// `complete` only when every target of the job reported ok; anything else is `degraded`.
pub fn build_dossier(
    job: &Job,
    results: &[ScrapeResult],
    generated_at: DateTime<Utc>,
) -> Result<Dossier, CompareError> {
    let comparison = compare_market(results)?;
    let failed_targets = results
        .iter()
        .filter_map(|result| {
            result.failure().map(|reason| FailedTarget {
                name: result.target.name.clone(),
                url: result.target.url.clone(),
                reason: reason.clone(),
            })
        })
        .collect::<Vec<_>>();
    let status = if failed_targets.is_empty() && results.len() == job.targets.len() {
        DossierStatus::Complete
    } else {
        DossierStatus::Degraded
    };

    Ok(Dossier {
        id: Uuid::new_v4(),
        job_id: job.id,
        user_id: job.user_id.clone(),
        generated_at,
        status,
        host: comparison.host,
        competitors: comparison.competitors,
        failed_targets,
        attempted_competitors: comparison.attempted_competitors,
        tool_comparison: comparison.tool_comparison,
        inventory_comparison: comparison.inventory_comparison,
        condition_totals: comparison.condition_totals,
        totals: comparison.totals,
        ask_why: BTreeMap::new(),
    })
}
