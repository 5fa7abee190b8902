//! Market comparison: host vs each successful competitor vs their average.
//!
//! A pure function of the scrape results. Averages are taken over competitors with an ok
//! outcome only and carry their contributor counts, so a missing competitor shrinks the
//! denominator instead of counting as zero.

use std::collections::BTreeSet;

use dossier_core::{
    ComparisonRow, Condition, ConditionTotals, FailureReason, InventoryCell, MarketAverage,
    MarketComparison, PartyCell, PartyMetrics, PriceOutlier, ScrapeResult, ToolComparison,
    VehicleRecord, VehicleType, VsMarket, MAX_COMPETITORS,
};
use thiserror::Error;

/// Host records listed per cell as the largest price deviations.
pub const OUTLIERS_PER_CELL: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompareError {
    #[error("result set has no host target")]
    MissingHost,
    #[error("host target failed: {0}")]
    HostFailed(FailureReason),
}

pub fn compare_market(results: &[ScrapeResult]) -> Result<MarketComparison, CompareError> {
    let host = results
        .iter()
        .find(|r| r.target.is_host())
        .ok_or(CompareError::MissingHost)?;
    if let Some(reason) = host.failure() {
        return Err(CompareError::HostFailed(reason.clone()));
    }
    let competitors = results
        .iter()
        .filter(|r| !r.target.is_host() && r.is_ok())
        .take(MAX_COMPETITORS)
        .collect::<Vec<_>>();

    let host_inventory = inventory(host);
    let competitor_inventories = competitors.iter().map(|r| inventory(r)).collect::<Vec<_>>();
    let row_for = |keep: &dyn Fn(&VehicleRecord) -> bool| {
        comparison_row(
            tally(host_inventory.iter().filter(|r| keep(*r))),
            competitor_inventories
                .iter()
                .map(|records| tally(records.iter().filter(|r| keep(*r))))
                .collect(),
        )
    };

    let mut inventory_comparison = Vec::with_capacity(9);
    for condition in Condition::ALL {
        for vehicle_type in VehicleType::TRACKED {
            let in_cell =
                |r: &VehicleRecord| r.condition == Some(condition) && r.vehicle_type == vehicle_type;
            let row = row_for(&in_cell);
            let host_records = host_inventory.iter().filter(|r| in_cell(*r)).collect::<Vec<_>>();
            let host_price_outliers = price_outliers(&host_records, &row);
            inventory_comparison.push(InventoryCell {
                condition,
                vehicle_type,
                row,
                host_price_outliers,
            });
        }
    }

    let condition_totals = Condition::ALL
        .into_iter()
        .map(|condition| ConditionTotals {
            condition,
            row: row_for(&|r: &VehicleRecord| r.condition == Some(condition)),
        })
        .collect();

    Ok(MarketComparison {
        host: host.target.party(),
        competitors: competitors.iter().map(|r| r.target.party()).collect(),
        attempted_competitors: competitors.len(),
        tool_comparison: tool_table(host, &competitors),
        inventory_comparison,
        condition_totals,
        totals: row_for(&|_: &VehicleRecord| true),
    })
}

fn inventory(result: &ScrapeResult) -> &[VehicleRecord] {
    result.inventory.as_deref().unwrap_or_default()
}

fn tool_table(
    host: &ScrapeResult,
    competitors: &[&ScrapeResult],
) -> std::collections::BTreeMap<String, ToolComparison> {
    let has = |result: &ScrapeResult, tool: &str| {
        result
            .tools
            .as_ref()
            .and_then(|tools| tools.get(tool))
            .copied()
            .unwrap_or(false)
    };
    let names = std::iter::once(host)
        .chain(competitors.iter().copied())
        .filter_map(|r| r.tools.as_ref())
        .flat_map(|tools| tools.keys().cloned())
        .collect::<BTreeSet<_>>();

    names
        .into_iter()
        .map(|tool| {
            let flags = competitors.iter().map(|r| has(*r, tool.as_str())).collect::<Vec<_>>();
            let successes = flags.iter().filter(|present| **present).count();
            let comparison = ToolComparison {
                host: has(host, tool.as_str()),
                market_pct: market_pct(successes, flags.len()),
                competitors: flags,
            };
            (tool, comparison)
        })
        .collect()
}

/// `round(100 * successes / attempted)`, halves rounded up; `None` without competitors.
pub fn market_pct(successes: usize, attempted: usize) -> Option<u32> {
    if attempted == 0 {
        return None;
    }
    let pct = (200 * successes + attempted) / (2 * attempted);
    u32::try_from(pct).ok()
}

/// Unrounded per-party sums; rounding happens only when a row is reported.
#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    count: usize,
    priced: usize,
    price_sum: f64,
}

impl Tally {
    fn avg_price(&self) -> Option<f64> {
        (self.priced > 0).then(|| self.price_sum / self.priced as f64)
    }

    fn metrics(&self) -> PartyMetrics {
        PartyMetrics {
            count: self.count,
            priced: self.priced,
            avg_price: self.avg_price().map(|v| round_to(v, 2)),
        }
    }
}

fn tally<'a>(records: impl Iterator<Item = &'a VehicleRecord>) -> Tally {
    records.fold(Tally::default(), |mut acc, record| {
        acc.count += 1;
        if let Some(price) = record.price {
            acc.priced += 1;
            acc.price_sum += price;
        }
        acc
    })
}

fn comparison_row(host: Tally, competitors: Vec<Tally>) -> ComparisonRow {
    let counts = competitors.iter().map(|t| t.count as f64).collect::<Vec<_>>();
    let prices = competitors.iter().filter_map(Tally::avg_price).collect::<Vec<_>>();
    let market_count = mean(&counts);
    let market_price = mean(&prices);
    let cell = |t: Tally| PartyCell {
        vs_market: VsMarket {
            count: relative_difference(Some(t.count as f64), market_count),
            avg_price: relative_difference(t.avg_price(), market_price),
        },
        metrics: t.metrics(),
    };
    ComparisonRow {
        host: cell(host),
        competitors: competitors.into_iter().map(cell).collect(),
        market_avg: MarketAverage {
            count: market_count.map(|v| round_to(v, 2)),
            count_contributors: counts.len(),
            avg_price: market_price.map(|v| round_to(v, 2)),
            avg_price_contributors: prices.len(),
        },
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Percent difference from the market, one decimal. Undefined against a missing or zero market.
pub fn relative_difference(value: Option<f64>, market: Option<f64>) -> Option<f64> {
    let (value, market) = (value?, market?);
    if market == 0.0 {
        return None;
    }
    Some(round_to((value - market) / market * 100.0, 1))
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let rounded = (value * factor).round() / factor;
    // no negative zero in reports
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

fn price_outliers(records: &[&VehicleRecord], row: &ComparisonRow) -> Vec<PriceOutlier> {
    let Some(reference) = row.market_avg.avg_price.or(row.host.metrics.avg_price) else {
        return Vec::new();
    };
    let mut outliers = records
        .iter()
        .filter_map(|record| {
            record.price.map(|price| PriceOutlier {
                identity_key: record.identity_key.clone(),
                label: record.label(),
                price,
                deviation: round_to(price - reference, 2),
            })
        })
        .collect::<Vec<_>>();
    outliers.sort_by(|a, b| {
        b.deviation
            .abs()
            .total_cmp(&a.deviation.abs())
            .then_with(|| a.identity_key.cmp(&b.identity_key))
    });
    outliers.truncate(OUTLIERS_PER_CELL);
    outliers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dossier_core::{ScrapeTarget, ToolSet, TRACKED_TOOLS};

    fn vehicle(key: &str, condition: Condition, vehicle_type: VehicleType, price: Option<f64>) -> VehicleRecord {
        VehicleRecord {
            identity_key: key.to_string(),
            vin: None,
            stock_number: Some(key.to_string()),
            year: Some(2024),
            make: Some("Ford".into()),
            model: Some(key.to_uppercase()),
            trim: None,
            condition: Some(condition),
            vehicle_type,
            price,
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

    fn ok(target: ScrapeTarget, present: &[&str], inventory: Vec<VehicleRecord>) -> ScrapeResult {
        let at = Utc.with_ymd_and_hms(2026, 10, 12, 6, 0, 0).single().unwrap();
        ScrapeResult::ok(target, tools(present), inventory, at)
    }

    fn failed(target: ScrapeTarget) -> ScrapeResult {
        let at = Utc.with_ymd_and_hms(2026, 10, 12, 6, 0, 0).single().unwrap();
        ScrapeResult::failed(target, FailureReason::Timeout, at)
    }

    fn new_trucks(prefix: &str, prices: &[f64]) -> Vec<VehicleRecord> {
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| vehicle(&format!("{prefix}{i}"), Condition::New, VehicleType::Truck, Some(*p)))
            .collect()
    }

    fn competitor(i: usize) -> ScrapeTarget {
        ScrapeTarget::competitor(format!("Rival {i}"), format!("https://rival{i}.example"))
    }

    fn host() -> ScrapeTarget {
        ScrapeTarget::host("Host Motors", "https://host.example")
    }

    fn four_competitor_results() -> Vec<ScrapeResult> {
        vec![
            ok(host(), &["apr_disclosure"], new_trucks("h", &[50_000.0, 54_000.0])),
            ok(competitor(0), &["apr_disclosure"], new_trucks("a", &[48_000.0])),
            ok(competitor(1), &[], new_trucks("b", &[55_000.0])),
            ok(competitor(2), &["apr_disclosure"], new_trucks("c", &[51_000.0])),
            ok(competitor(3), &[], new_trucks("d", &[49_000.0])),
        ]
    }

    #[test]
    fn host_price_is_compared_with_the_competitor_mean() {
        let comparison = compare_market(&four_competitor_results()).unwrap();
        let cell = &comparison.inventory_comparison[0];
        assert_eq!((cell.condition, cell.vehicle_type), (Condition::New, VehicleType::Truck));
        assert_eq!(cell.row.host.metrics.avg_price, Some(52_000.0));
        assert_eq!(cell.row.market_avg.avg_price, Some(50_750.0));
        assert_eq!(cell.row.market_avg.avg_price_contributors, 4);
        assert_eq!(cell.row.host.vs_market.avg_price, Some(2.5));
        assert_eq!(cell.row.competitors[1].vs_market.avg_price, Some(8.4));
        assert_eq!(cell.row.market_avg.count, Some(1.0));
        assert_eq!(cell.row.host.vs_market.count, Some(100.0));
    }

    #[test]
    fn failed_competitors_leave_the_denominator() {
        let mut results = four_competitor_results();
        results[4] = failed(competitor(3));
        let comparison = compare_market(&results).unwrap();

        assert_eq!(comparison.attempted_competitors, 3);
        assert_eq!(comparison.competitors.len(), 3);
        let cell = &comparison.inventory_comparison[0];
        assert_eq!(cell.row.market_avg.avg_price, Some(51_333.33));
        assert_eq!(cell.row.market_avg.avg_price_contributors, 3);

        let apr = &comparison.tool_comparison["apr_disclosure"];
        assert_eq!(apr.competitors, vec![true, false, true]);
        assert_eq!(apr.market_pct, Some(67));
        assert!(apr.host);
    }

    #[test]
    fn relative_difference_uses_the_unrounded_market_mean() {
        // Competitor means of 1, 1 and 2 average to 4/3; against the reported 1.33 the
        // host would read -24.8 instead of -25.0.
        let results = vec![
            ok(host(), &[], new_trucks("h", &[1.0])),
            ok(competitor(0), &[], new_trucks("a", &[1.0])),
            ok(competitor(1), &[], new_trucks("b", &[1.0])),
            ok(competitor(2), &[], new_trucks("c", &[2.0, 2.0])),
        ];
        let row = &compare_market(&results).unwrap().inventory_comparison[0].row;

        assert_eq!(row.market_avg.avg_price, Some(1.33));
        assert_eq!(row.market_avg.count, Some(1.33));
        assert_eq!(row.host.vs_market.avg_price, Some(-25.0));
        assert_eq!(row.host.vs_market.count, Some(-25.0));
        assert_eq!(row.competitors[2].vs_market.avg_price, Some(50.0));
    }

    #[test]
    fn no_successful_competitor_means_not_applicable() {
        let results = vec![
            ok(host(), &["trade_in_tool"], new_trucks("h", &[52_000.0])),
            failed(competitor(0)),
        ];
        let comparison = compare_market(&results).unwrap();

        assert_eq!(comparison.attempted_competitors, 0);
        for cell in &comparison.inventory_comparison {
            assert_eq!(cell.row.market_avg.count, None);
            assert_eq!(cell.row.market_avg.avg_price, None);
            assert_eq!(cell.row.host.vs_market, VsMarket { count: None, avg_price: None });
        }
        assert!(comparison.tool_comparison.values().all(|t| t.market_pct.is_none()));
        assert_eq!(comparison.totals.market_avg.count, None);
    }

    #[test]
    fn unpriced_records_count_but_do_not_price() {
        let mut host_inventory = new_trucks("h", &[40_000.0]);
        host_inventory.push(vehicle("h-call", Condition::New, VehicleType::Truck, None));
        let results = vec![
            ok(host(), &[], host_inventory),
            ok(competitor(0), &[], vec![vehicle("a", Condition::New, VehicleType::Truck, None)]),
        ];
        let comparison = compare_market(&results).unwrap();
        let row = &comparison.inventory_comparison[0].row;

        assert_eq!(row.host.metrics.count, 2);
        assert_eq!(row.host.metrics.priced, 1);
        assert_eq!(row.host.metrics.avg_price, Some(40_000.0));
        assert_eq!(row.competitors[0].metrics.avg_price, None);
        assert_eq!(row.market_avg.count, Some(1.0));
        assert_eq!(row.market_avg.avg_price, None);
        assert_eq!(row.market_avg.avg_price_contributors, 0);
        assert_eq!(row.host.vs_market.avg_price, None);
    }

    #[test]
    fn other_and_unknown_vehicles_only_reach_totals() {
        let mut unknown = vehicle("u", Condition::Used, VehicleType::Sedan, Some(20_000.0));
        unknown.condition = None;
        let results = vec![ok(
            host(),
            &[],
            vec![
                vehicle("van", Condition::Used, VehicleType::Other, Some(30_000.0)),
                unknown,
                vehicle("s", Condition::Used, VehicleType::Sedan, Some(25_000.0)),
            ],
        )];
        let comparison = compare_market(&results).unwrap();

        assert_eq!(comparison.inventory_comparison.len(), 9);
        let in_cells: usize = comparison
            .inventory_comparison
            .iter()
            .map(|c| c.row.host.metrics.count)
            .sum();
        assert_eq!(in_cells, 1);
        let used = comparison
            .condition_totals
            .iter()
            .find(|t| t.condition == Condition::Used)
            .unwrap();
        assert_eq!(used.row.host.metrics.count, 2);
        assert_eq!(comparison.totals.host.metrics.count, 3);
        assert_eq!(comparison.totals.host.metrics.avg_price, Some(25_000.0));
    }

    #[test]
    fn zero_market_count_is_not_applicable() {
        let results = vec![
            ok(host(), &[], new_trucks("h", &[30_000.0])),
            ok(competitor(0), &[], vec![]),
        ];
        let comparison = compare_market(&results).unwrap();
        let suv = &comparison.inventory_comparison[1].row;
        assert_eq!(suv.market_avg.count, Some(0.0));
        assert_eq!(suv.host.vs_market.count, None);
    }

    #[test]
    fn outliers_rank_by_absolute_deviation() {
        let results = vec![
            ok(host(), &[], new_trucks("h", &[50_000.0, 41_000.0, 58_000.0, 50_500.0])),
            ok(competitor(0), &[], new_trucks("a", &[50_000.0])),
        ];
        let comparison = compare_market(&results).unwrap();
        let outliers = &comparison.inventory_comparison[0].host_price_outliers;
        let keys = outliers.iter().map(|o| o.identity_key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, ["h1", "h2", "h3"]);
        assert_eq!(outliers[0].deviation, -9_000.0);
        assert_eq!(outliers[1].deviation, 8_000.0);
    }

    #[test]
    fn market_pct_rounds_halves_up() {
        assert_eq!(market_pct(1, 3), Some(33));
        assert_eq!(market_pct(2, 3), Some(67));
        assert_eq!(market_pct(1, 8), Some(13));
        assert_eq!(market_pct(3, 8), Some(38));
        assert_eq!(market_pct(0, 4), Some(0));
        assert_eq!(market_pct(4, 4), Some(100));
        assert_eq!(market_pct(0, 0), None);
    }

    #[test]
    fn comparison_is_deterministic() {
        let results = four_competitor_results();
        let first = serde_json::to_string(&compare_market(&results).unwrap()).unwrap();
        let second = serde_json::to_string(&compare_market(&results).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn host_failure_is_an_error() {
        let results = vec![failed(host()), ok(competitor(0), &[], vec![])];
        assert_eq!(
            compare_market(&results),
            Err(CompareError::HostFailed(FailureReason::Timeout))
        );
        assert_eq!(compare_market(&[]), Err(CompareError::MissingHost));
    }
}
