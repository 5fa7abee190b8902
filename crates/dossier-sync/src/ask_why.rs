//! Ask-Why: fixed question templates filled from a dossier's computed figures.
//!
//! Answers are pure functions of the dossier, so the same dossier and question always
//! produce the same text. The first answer for a question is cached on the dossier.

use dossier_core::{
    AskWhyAnswer, AskWhySection, ComparisonRow, Condition, Dossier, InventoryCell, VehicleType,
};
use dossier_storage::{DossierStore, DossierStoreError};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AskWhyQuestion {
    pub section: AskWhySection,
    pub question_id: &'static str,
    pub question: &'static str,
}

const fn question(
    section: AskWhySection,
    question_id: &'static str,
    question: &'static str,
) -> AskWhyQuestion {
    AskWhyQuestion {
        section,
        question_id,
        question,
    }
}

pub const CATALOG: [AskWhyQuestion; 10] = [
    question(
        AskWhySection::Pricing,
        "overall_price_position",
        "Why are my prices above or below the market?",
    ),
    question(
        AskWhySection::Pricing,
        "largest_price_gap",
        "Where is my largest price gap?",
    ),
    question(
        AskWhySection::Inventory,
        "inventory_size",
        "How does my inventory size compare with competitors?",
    ),
    question(
        AskWhySection::Inventory,
        "strongest_segment",
        "Which segment is my strongest?",
    ),
    question(
        AskWhySection::Inventory,
        "weakest_segment",
        "Which segment is my weakest?",
    ),
    question(
        AskWhySection::Tools,
        "missing_tools",
        "Which website tools am I missing?",
    ),
    question(
        AskWhySection::Tools,
        "tool_adoption",
        "How does my tool adoption compare with the market?",
    ),
    question(
        AskWhySection::Overall,
        "competitive_position",
        "What is my overall competitive position?",
    ),
    question(
        AskWhySection::Cpo,
        "cpo_pricing",
        "How is my certified pre-owned pricing positioned?",
    ),
    question(
        AskWhySection::Cpo,
        "cpo_inventory",
        "How does my certified pre-owned inventory compare?",
    ),
];

pub fn catalog() -> &'static [AskWhyQuestion] {
    &CATALOG
}

pub fn find_question(section: AskWhySection, question_id: &str) -> Option<&'static AskWhyQuestion> {
    CATALOG
        .iter()
        .find(|q| q.section == section && q.question_id == question_id)
}

#[derive(Debug, Error)]
pub enum AskWhyError {
    #[error("no ask-why question {section}/{question_id}")]
    NotFound {
        section: String,
        question_id: String,
    },
    #[error("dossier {0} not found")]
    DossierNotFound(Uuid),
    #[error(transparent)]
    Store(DossierStoreError),
}

impl From<DossierStoreError> for AskWhyError {
    fn from(err: DossierStoreError) -> Self {
        match err {
            DossierStoreError::NotFound(id) => Self::DossierNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Cached answer when present; otherwise generates, appends and returns the stored answer.
pub async fn ask_why(
    store: &dyn DossierStore,
    dossier_id: Uuid,
    section: AskWhySection,
    question_id: &str,
) -> Result<AskWhyAnswer, AskWhyError> {
    find_question(section, question_id).ok_or_else(|| not_found(section, question_id))?;
    if let Some(cached) = store.cached_answer(dossier_id, section, question_id).await? {
        return Ok(cached);
    }
    let dossier = store
        .get(dossier_id)
        .await?
        .ok_or(AskWhyError::DossierNotFound(dossier_id))?;
    let answer = answer_question(&dossier, section, question_id)?;
    Ok(store.append_answer(dossier_id, &answer).await?)
}

fn not_found(section: AskWhySection, question_id: &str) -> AskWhyError {
    AskWhyError::NotFound {
        section: section.to_string(),
        question_id: question_id.to_string(),
    }
}

pub fn answer_question(
    dossier: &Dossier,
    section: AskWhySection,
    question_id: &str,
) -> Result<AskWhyAnswer, AskWhyError> {
    let question = find_question(section, question_id).ok_or_else(|| not_found(section, question_id))?;
    let (answer, factors) = match question.question_id {
        "overall_price_position" => overall_price_position(dossier),
        "largest_price_gap" => largest_price_gap(dossier),
        "inventory_size" => inventory_size(dossier),
        "strongest_segment" => segment_extreme(dossier, Extreme::Strongest),
        "weakest_segment" => segment_extreme(dossier, Extreme::Weakest),
        "missing_tools" => missing_tools(dossier),
        "tool_adoption" => tool_adoption(dossier),
        "competitive_position" => competitive_position(dossier),
        "cpo_pricing" => cpo_pricing(dossier),
        "cpo_inventory" => cpo_inventory(dossier),
        _ => return Err(not_found(section, question_id)),
    };
    Ok(AskWhyAnswer {
        section,
        question_id: question.question_id.to_string(),
        question: question.question.to_string(),
        answer,
        factors,
    })
}

type Generated = (String, Vec<String>);

fn overall_price_position(dossier: &Dossier) -> Generated {
    let row = &dossier.totals;
    let Some(host_avg) = row.host.metrics.avg_price else {
        return (
            "None of your listed vehicles showed a price, so your pricing cannot be positioned \
             against the market."
                .to_string(),
            vec![format!("{} vehicles listed without a price", row.host.metrics.count)],
        );
    };
    let answer = match (row.market_avg.avg_price, row.host.vs_market.avg_price) {
        (Some(market), Some(pct)) => format!(
            "Your average listed price of {} is {} the market average of {}, {}.",
            money(host_avg),
            price_phrase(pct),
            money(market),
            market_basis(dossier, row.market_avg.avg_price_contributors)
        ),
        _ => format!(
            "Your average listed price is {} across {} priced vehicles. No competitor published \
             comparable prices, so there is no market average to compare against.",
            money(host_avg),
            row.host.metrics.priced
        ),
    };

    let mut gaps = priced_cells(dossier);
    gaps.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
    let mut factors = gaps
        .into_iter()
        .take(3)
        .map(|(cell, pct)| {
            format!(
                "{}: {} vs market ({} vs {})",
                capitalize(&segment(cell.condition, cell.vehicle_type)),
                signed_percent(pct),
                money(cell.row.host.metrics.avg_price.unwrap_or_default()),
                money(cell.row.market_avg.avg_price.unwrap_or_default()),
            )
        })
        .collect::<Vec<_>>();
    let unpriced = row.host.metrics.count - row.host.metrics.priced;
    if unpriced > 0 {
        factors.push(format!("{unpriced} of your vehicles list no price and are left out of averages"));
    }
    factors.extend(failure_note(dossier));
    (answer, factors)
}

fn largest_price_gap(dossier: &Dossier) -> Generated {
    let Some((cell, pct)) = largest_gap(dossier) else {
        return (
            "No segment has prices from both you and at least one competitor, so there is no \
             price gap to explain."
                .to_string(),
            failure_note(dossier).into_iter().collect(),
        );
    };
    let market = cell.row.market_avg.avg_price.unwrap_or_default();
    let answer = format!(
        "Your largest price gap is in {}, where your average price of {} is {} the market \
         average of {}.",
        segment(cell.condition, cell.vehicle_type),
        money(cell.row.host.metrics.avg_price.unwrap_or_default()),
        price_phrase(pct),
        money(market),
    );
    let mut factors = cell
        .host_price_outliers
        .iter()
        .map(|outlier| {
            format!(
                "{} at {} ({} {} the market average)",
                outlier.label,
                money(outlier.price),
                money(outlier.deviation.abs()),
                if outlier.deviation >= 0.0 { "above" } else { "below" },
            )
        })
        .collect::<Vec<_>>();
    factors.push(format!(
        "Market average from {} competitor{} with priced {}",
        cell.row.market_avg.avg_price_contributors,
        plural(cell.row.market_avg.avg_price_contributors),
        segment(cell.condition, cell.vehicle_type),
    ));
    (answer, factors)
}

fn inventory_size(dossier: &Dossier) -> Generated {
    let row = &dossier.totals;
    let host = row.host.metrics.count;
    let answer = match (row.market_avg.count, row.host.vs_market.count) {
        (Some(market), Some(pct)) => format!(
            "You list {host} vehicle{}, {} the market average of {}, {}.",
            plural(host),
            size_phrase(pct),
            count(market),
            market_basis(dossier, row.market_avg.count_contributors)
        ),
        (Some(_), None) => format!(
            "You list {host} vehicle{} while the competitors that responded list none.",
            plural(host)
        ),
        _ => format!(
            "You list {host} vehicle{}. No competitor inventory was available for comparison.",
            plural(host)
        ),
    };
    let mut factors = dossier
        .condition_totals
        .iter()
        .map(|totals| count_factor(&capitalize(condition_label(totals.condition)), &totals.row))
        .collect::<Vec<_>>();
    factors.extend(failure_note(dossier));
    (answer, factors)
}

#[derive(Clone, Copy)]
enum Extreme {
    Strongest,
    Weakest,
}

fn segment_extreme(dossier: &Dossier, extreme: Extreme) -> Generated {
    let mut ranked = dossier
        .inventory_comparison
        .iter()
        .filter_map(|cell| cell.row.host.vs_market.count.map(|pct| (cell, pct)))
        .collect::<Vec<_>>();
    match extreme {
        Extreme::Strongest => ranked.sort_by(|a, b| b.1.total_cmp(&a.1)),
        Extreme::Weakest => ranked.sort_by(|a, b| a.1.total_cmp(&b.1)),
    }

    let Some((cell, pct)) = ranked.first().copied() else {
        return fallback_segment(dossier, extreme);
    };
    let label = segment(cell.condition, cell.vehicle_type);
    let host = cell.row.host.metrics.count;
    let market = count(cell.row.market_avg.count.unwrap_or_default());
    let answer = match extreme {
        Extreme::Strongest => format!(
            "Your strongest segment is {label}: you list {host} against a market average of \
             {market}, {}.",
            size_phrase(pct),
        ),
        Extreme::Weakest => format!(
            "Your weakest segment is {label}: you list {host} against a market average of \
             {market}, {}.",
            size_phrase(pct),
        ),
    };
    let mut factors = ranked
        .iter()
        .take(3)
        .map(|(cell, _)| {
            count_factor(
                &capitalize(&segment(cell.condition, cell.vehicle_type)),
                &cell.row,
            )
        })
        .collect::<Vec<_>>();
    factors.extend(failure_note(dossier));
    (answer, factors)
}

/// Without market counts, rank by the host's own counts.
fn fallback_segment(dossier: &Dossier, extreme: Extreme) -> Generated {
    let mut cells = dossier.inventory_comparison.iter().collect::<Vec<_>>();
    match extreme {
        Extreme::Strongest => cells.sort_by(|a, b| b.row.host.metrics.count.cmp(&a.row.host.metrics.count)),
        Extreme::Weakest => cells.sort_by(|a, b| a.row.host.metrics.count.cmp(&b.row.host.metrics.count)),
    }
    let Some(cell) = cells.first() else {
        return ("The dossier has no inventory segments.".to_string(), Vec::new());
    };
    let answer = format!(
        "No competitor inventory was available, so segments are ranked by your own stock: {} \
         with {} vehicle{}.",
        segment(cell.condition, cell.vehicle_type),
        cell.row.host.metrics.count,
        plural(cell.row.host.metrics.count),
    );
    (answer, failure_note(dossier).into_iter().collect())
}

fn missing_tools(dossier: &Dossier) -> Generated {
    let mut missing = dossier
        .tool_comparison
        .iter()
        .filter(|(_, tool)| !tool.host)
        .collect::<Vec<_>>();
    missing.sort_by(|a, b| b.1.market_pct.cmp(&a.1.market_pct).then_with(|| a.0.cmp(b.0)));

    let total = dossier.tool_comparison.len();
    if missing.is_empty() {
        return (
            format!("Your site shows all {total} tracked tools."),
            failure_note(dossier).into_iter().collect(),
        );
    }
    let common = missing
        .iter()
        .filter(|(_, tool)| tool.market_pct.is_some_and(|pct| pct >= 50))
        .count();
    let answer = if dossier.attempted_competitors == 0 {
        format!(
            "Your site is missing {} of {total} tracked tools. No competitor could be checked, so \
             market adoption is unknown.",
            missing.len()
        )
    } else {
        format!(
            "Your site is missing {} of {total} tracked tools; {common} of them appear on at least \
             half of the competitor sites checked.",
            missing.len()
        )
    };
    let factors = missing
        .iter()
        .map(|(name, tool)| match tool.market_pct {
            Some(pct) => format!("{}: missing, offered by {pct}% of competitors", capitalize(&tool_label(name))),
            None => format!("{}: missing", capitalize(&tool_label(name))),
        })
        .collect();
    (answer, factors)
}

fn tool_adoption(dossier: &Dossier) -> Generated {
    let total = dossier.tool_comparison.len();
    let host = dossier.tool_comparison.values().filter(|t| t.host).count();
    let competitors = dossier.attempted_competitors;
    let answer = if competitors == 0 {
        format!("Your site shows {host} of {total} tracked tools. No competitor could be checked.")
    } else {
        let offered = dossier
            .tool_comparison
            .values()
            .map(|t| t.competitors.iter().filter(|present| **present).count())
            .sum::<usize>();
        let market = offered as f64 / competitors as f64;
        format!(
            "Your site shows {host} of {total} tracked tools; competitors show {} on average, {}.",
            count(market),
            market_basis(dossier, competitors)
        )
    };
    let mut factors = Vec::new();
    for (name, tool) in &dossier.tool_comparison {
        let label = capitalize(&tool_label(name));
        match (tool.host, tool.market_pct) {
            (true, Some(0)) => factors.push(format!("{label}: only you offer it")),
            (false, Some(100)) => factors.push(format!("{label}: every competitor offers it, you do not")),
            _ => {}
        }
    }
    factors.extend(failure_note(dossier));
    (answer, factors)
}

fn competitive_position(dossier: &Dossier) -> Generated {
    let row = &dossier.totals;
    let mut parts = Vec::new();
    if let Some(pct) = row.host.vs_market.avg_price {
        parts.push(format!("your prices sit {} the market", price_phrase(pct)));
    }
    if let Some(pct) = row.host.vs_market.count {
        parts.push(format!("your inventory is {} the market", size_phrase(pct)));
    }
    let tools = dossier.tool_comparison.values().filter(|t| t.host).count();
    parts.push(format!(
        "you show {tools} of {} tracked tools",
        dossier.tool_comparison.len()
    ));

    let answer = if dossier.attempted_competitors == 0 {
        format!(
            "No competitor could be compared in this period; {}.",
            parts.join("; ")
        )
    } else {
        format!(
            "Against {} competitor{}: {}.",
            dossier.attempted_competitors,
            plural(dossier.attempted_competitors),
            parts.join("; ")
        )
    };

    let mut factors = Vec::new();
    if let Some((cell, pct)) = largest_gap(dossier) {
        factors.push(format!(
            "Largest price gap: {} at {}",
            segment(cell.condition, cell.vehicle_type),
            signed_percent(pct)
        ));
    }
    let missing_common = dossier
        .tool_comparison
        .iter()
        .filter(|(_, t)| !t.host && t.market_pct.is_some_and(|pct| pct >= 50))
        .map(|(name, _)| tool_label(name))
        .collect::<Vec<_>>();
    if !missing_common.is_empty() {
        factors.push(format!("Common tools you lack: {}", missing_common.join(", ")));
    }
    factors.extend(failure_note(dossier));
    (answer, factors)
}

fn cpo_pricing(dossier: &Dossier) -> Generated {
    let Some(row) = dossier.condition_row(Condition::Cpo) else {
        return ("The dossier has no certified pre-owned figures.".to_string(), Vec::new());
    };
    let answer = match (row.host.metrics.avg_price, row.market_avg.avg_price, row.host.vs_market.avg_price) {
        (None, _, _) => "You have no priced certified pre-owned vehicles listed.".to_string(),
        (Some(host), Some(market), Some(pct)) => format!(
            "Your certified pre-owned vehicles average {}, {} the market average of {}.",
            money(host),
            price_phrase(pct),
            money(market)
        ),
        (Some(host), _, _) => format!(
            "Your certified pre-owned vehicles average {}. No competitor listed priced certified \
             pre-owned vehicles.",
            money(host)
        ),
    };
    let mut factors = cpo_cells(dossier)
        .filter_map(|cell| {
            let pct = cell.row.host.vs_market.avg_price?;
            Some(format!(
                "{}: {} vs market",
                capitalize(&segment(cell.condition, cell.vehicle_type)),
                signed_percent(pct)
            ))
        })
        .collect::<Vec<_>>();
    factors.extend(failure_note(dossier));
    (answer, factors)
}

fn cpo_inventory(dossier: &Dossier) -> Generated {
    let Some(row) = dossier.condition_row(Condition::Cpo) else {
        return ("The dossier has no certified pre-owned figures.".to_string(), Vec::new());
    };
    let host = row.host.metrics.count;
    let answer = match (row.market_avg.count, row.host.vs_market.count) {
        (Some(market), Some(pct)) => format!(
            "You list {host} certified pre-owned vehicle{}, {} the market average of {}.",
            plural(host),
            size_phrase(pct),
            count(market)
        ),
        (Some(_), None) => format!(
            "You list {host} certified pre-owned vehicle{}; the competitors checked list none.",
            plural(host)
        ),
        (None, _) => format!(
            "You list {host} certified pre-owned vehicle{}. No competitor inventory was available.",
            plural(host)
        ),
    };
    let mut factors = cpo_cells(dossier)
        .map(|cell| count_factor(&capitalize(&segment(cell.condition, cell.vehicle_type)), &cell.row))
        .collect::<Vec<_>>();
    factors.extend(failure_note(dossier));
    (answer, factors)
}

fn cpo_cells(dossier: &Dossier) -> impl Iterator<Item = &InventoryCell> {
    dossier
        .inventory_comparison
        .iter()
        .filter(|cell| cell.condition == Condition::Cpo)
}

/// Cells where both the host and the market have an average price.
fn priced_cells(dossier: &Dossier) -> Vec<(&InventoryCell, f64)> {
    dossier
        .inventory_comparison
        .iter()
        .filter_map(|cell| cell.row.host.vs_market.avg_price.map(|pct| (cell, pct)))
        .collect()
}

/// Ties keep catalog cell order.
fn largest_gap(dossier: &Dossier) -> Option<(&InventoryCell, f64)> {
    let mut gaps = priced_cells(dossier);
    gaps.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
    gaps.first().copied()
}

fn count_factor(label: &str, row: &ComparisonRow) -> String {
    match (row.market_avg.count, row.host.vs_market.count) {
        (Some(market), Some(pct)) => format!(
            "{label}: {} vs market {} ({})",
            row.host.metrics.count,
            count(market),
            signed_percent(pct)
        ),
        (Some(market), None) => format!("{label}: {} vs market {}", row.host.metrics.count, count(market)),
        (None, _) => format!("{label}: {}", row.host.metrics.count),
    }
}

fn market_basis(dossier: &Dossier, contributors: usize) -> String {
    let nominal = dossier.attempted_competitors + competitor_failures(dossier);
    if contributors == nominal {
        format!("across {contributors} competitor{}", plural(contributors))
    } else {
        format!("based on {contributors} of {nominal} competitors")
    }
}

fn competitor_failures(dossier: &Dossier) -> usize {
    dossier
        .failed_targets
        .iter()
        .filter(|failed| failed.url != dossier.host.url)
        .count()
}

fn failure_note(dossier: &Dossier) -> Option<String> {
    if dossier.failed_targets.is_empty() {
        return None;
    }
    let names = dossier
        .failed_targets
        .iter()
        .map(|failed| format!("{} ({})", failed.name, failed.reason))
        .collect::<Vec<_>>();
    Some(format!("Not compared this period: {}", names.join(", ")))
}

fn condition_label(condition: Condition) -> &'static str {
    match condition {
        Condition::New => "new",
        Condition::Used => "used",
        Condition::Cpo => "certified pre-owned",
    }
}

fn segment(condition: Condition, vehicle_type: VehicleType) -> String {
    let kind = match vehicle_type {
        VehicleType::Truck => "trucks",
        VehicleType::Suv => "SUVs",
        VehicleType::Sedan => "sedans",
        VehicleType::Other => "other vehicles",
    };
    format!("{} {kind}", condition_label(condition))
}

fn tool_label(tool: &str) -> String {
    match tool {
        "payment_calculator" => "payment calculator".to_string(),
        "apr_disclosure" => "APR disclosure".to_string(),
        "lease_payment_options" => "lease payment options".to_string(),
        "pre_qualification_tool" => "pre-qualification tool".to_string(),
        "trade_in_tool" => "trade-in tool".to_string(),
        "online_finance_application" => "online finance application".to_string(),
        "srp_payments_shown" => "payments on search results".to_string(),
        "vdp_payments_shown" => "payments on vehicle detail pages".to_string(),
        other => other.replace('_', " "),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn relative_phrase(pct: f64, more: &str, less: &str, level: &str) -> String {
    if pct > 0.0 {
        format!("{pct:.1}% {more}")
    } else if pct < 0.0 {
        format!("{:.1}% {less}", -pct)
    } else {
        level.to_string()
    }
}

/// `2.5% above`, `1.1% below` or `in line with`.
fn price_phrase(pct: f64) -> String {
    relative_phrase(pct, "above", "below", "in line with")
}

fn size_phrase(pct: f64) -> String {
    relative_phrase(pct, "larger than", "smaller than", "level with")
}

/// `+2.5%`, `-3.0%`.
pub fn signed_percent(pct: f64) -> String {
    format!("{pct:+.1}%")
}

/// Whole dollars with thousands separators: `$50,750`.
pub fn money(value: f64) -> String {
    let rounded = value.round();
    let digits = format!("{:.0}", rounded.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0.0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}

fn count(value: f64) -> String {
    if (value - value.round()).abs() < 1e-9 {
        format!("{value:.0}")
    } else {
        format!("{value:.1}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_dossier;
    use chrono::{TimeZone, Utc};
    use dossier_core::{
        FailureReason, Job, ScrapeResult, ScrapeTarget, ToolSet, TriggerType, VehicleRecord,
        TRACKED_TOOLS,
    };
    use dossier_storage::MemoryDossierStore;

    fn vehicle(key: &str, condition: Condition, vehicle_type: VehicleType, price: f64) -> VehicleRecord {
        VehicleRecord {
            identity_key: format!("stock:{key}"),
            vin: None,
            stock_number: Some(key.to_string()),
            year: Some(2024),
            make: Some("Ford".into()),
            model: Some(key.to_string()),
            trim: None,
            condition: Some(condition),
            vehicle_type,
            price: Some(price),
            mileage: None,
            source_url: None,
        }
    }

    fn tools(present: &[&str]) -> ToolSet {
        TRACKED_TOOLS
            .iter()
            .map(|t| (t.to_string(), present.contains(t)))
            .collect()
    }

    fn sample() -> Dossier {
        let at = Utc.with_ymd_and_hms(2026, 10, 12, 6, 0, 0).single().unwrap();
        let targets = vec![
            ScrapeTarget::host("Host Motors", "https://host.example"),
            ScrapeTarget::competitor("Rival A", "https://a.example"),
            ScrapeTarget::competitor("Rival B", "https://b.example"),
            ScrapeTarget::competitor("Rival C", "https://c.example"),
        ];
        let job = Job::new("user-1", targets.clone(), TriggerType::Admin, at);
        let results = vec![
            ScrapeResult::ok(
                targets[0].clone(),
                tools(&["apr_disclosure", "payment_calculator"]),
                vec![
                    vehicle("F150", Condition::New, VehicleType::Truck, 58_000.0),
                    vehicle("Ranger", Condition::New, VehicleType::Truck, 46_000.0),
                    vehicle("Edge", Condition::Cpo, VehicleType::Suv, 31_000.0),
                ],
                at,
            ),
            ScrapeResult::ok(
                targets[1].clone(),
                tools(&["apr_disclosure", "trade_in_tool"]),
                vec![
                    vehicle("A1", Condition::New, VehicleType::Truck, 48_000.0),
                    vehicle("A2", Condition::Cpo, VehicleType::Suv, 30_000.0),
                ],
                at,
            ),
            ScrapeResult::ok(
                targets[2].clone(),
                tools(&["trade_in_tool"]),
                vec![vehicle("B1", Condition::New, VehicleType::Truck, 52_000.0)],
                at,
            ),
            ScrapeResult::failed(targets[3].clone(), FailureReason::Timeout, at),
        ];
        build_dossier(&job, &results, at).unwrap()
    }

    #[test]
    fn money_and_percent_formatting_is_stable() {
        assert_eq!(money(50_750.0), "$50,750");
        assert_eq!(money(1_234_567.4), "$1,234,567");
        assert_eq!(money(999.5), "$1,000");
        assert_eq!(money(-9_000.0), "-$9,000");
        assert_eq!(money(0.0), "$0");
        assert_eq!(signed_percent(2.5), "+2.5%");
        assert_eq!(signed_percent(-3.0), "-3.0%");
        assert_eq!(count(2.0), "2");
        assert_eq!(count(1.5), "1.5");
    }

    #[test]
    fn catalog_has_ten_unique_questions() {
        assert_eq!(catalog().len(), 10);
        for (i, q) in catalog().iter().enumerate() {
            assert!(catalog()[i + 1..]
                .iter()
                .all(|other| (other.section, other.question_id) != (q.section, q.question_id)));
        }
    }

    #[test]
    fn every_catalog_question_answers() {
        let dossier = sample();
        for q in catalog() {
            let answer = answer_question(&dossier, q.section, q.question_id).unwrap();
            assert_eq!(answer.section, q.section);
            assert_eq!(answer.question, q.question);
            assert!(!answer.answer.is_empty(), "{}", q.question_id);
        }
    }

    #[test]
    fn pricing_answer_quotes_the_computed_figures() {
        let answer =
            answer_question(&sample(), AskWhySection::Pricing, "overall_price_position").unwrap();
        // host 45,000 vs the mean of 39,000 and 52,000
        assert_eq!(
            answer.answer,
            "Your average listed price of $45,000 is 1.1% below the market average of $45,500, \
             based on 2 of 3 competitors."
        );
        assert!(answer
            .factors
            .iter()
            .any(|f| f == "Not compared this period: Rival C (timeout)"));
    }

    #[test]
    fn largest_gap_lists_outlying_host_vehicles() {
        let answer = answer_question(&sample(), AskWhySection::Pricing, "largest_price_gap").unwrap();
        assert!(answer.answer.starts_with("Your largest price gap is in "), "{}", answer.answer);
        assert!(answer.factors.iter().any(|f| f.contains("$58,000")), "{:?}", answer.factors);
    }

    #[test]
    fn missing_tools_are_ranked_by_market_adoption() {
        let answer = answer_question(&sample(), AskWhySection::Tools, "missing_tools").unwrap();
        assert_eq!(answer.factors[0], "Trade-in tool: missing, offered by 100% of competitors");
        assert!(answer.answer.starts_with("Your site is missing 6 of 8 tracked tools; 1 of them"));
    }

    #[test]
    fn answers_are_reproducible() {
        let dossier = sample();
        for q in catalog() {
            assert_eq!(
                answer_question(&dossier, q.section, q.question_id).unwrap(),
                answer_question(&dossier, q.section, q.question_id).unwrap()
            );
        }
    }

    #[test]
    fn unknown_questions_are_not_found() {
        let err = answer_question(&sample(), AskWhySection::Tools, "largest_price_gap").unwrap_err();
        assert!(matches!(err, AskWhyError::NotFound { .. }));
    }

    #[tokio::test]
    async fn first_answer_is_cached_on_the_dossier() {
        let store = MemoryDossierStore::new();
        let dossier = sample();
        store.insert(&dossier).await.unwrap();

        let first = ask_why(&store, dossier.id, AskWhySection::Cpo, "cpo_inventory")
            .await
            .unwrap();
        let cached = store
            .cached_answer(dossier.id, AskWhySection::Cpo, "cpo_inventory")
            .await
            .unwrap();
        assert_eq!(cached.as_ref(), Some(&first));
        let again = ask_why(&store, dossier.id, AskWhySection::Cpo, "cpo_inventory")
            .await
            .unwrap();
        assert_eq!(again, first);

        let missing = ask_why(&store, Uuid::new_v4(), AskWhySection::Cpo, "cpo_inventory").await;
        assert!(matches!(missing, Err(AskWhyError::DossierNotFound(_))));
    }
}
