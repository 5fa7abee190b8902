//! Core domain model for dealership competitive dossiers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dossier-core";

pub const MAX_COMPETITORS: usize = 4;
pub const MAX_TARGETS: usize = MAX_COMPETITORS + 1;

/// Website sales tools tracked by the default detection table, in report order.
pub const TRACKED_TOOLS: [&str; 8] = [
    "payment_calculator",
    "apr_disclosure",
    "lease_payment_options",
    "pre_qualification_tool",
    "trade_in_tool",
    "online_finance_application",
    "srp_payments_shown",
    "vdp_payments_shown",
];

/// Tool name -> detected.
pub type ToolSet = BTreeMap<String, bool>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! str_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Admin,
}

str_enum!(TriggerType, "trigger_type", {
    Scheduled => "scheduled",
    Admin => "admin",
});

impl TriggerType {
    /// Lower tiers are claimed first.
    pub fn priority_tier(&self) -> u8 {
        match self {
            Self::Admin => 0,
            Self::Scheduled => 1,
        }
    }
}

/// Job lifecycle.
///
/// ```text
/// Queued ──► Running ──► Complete | Partial | Failed
///   │           │  ▲
///   │           └──┘ (lease reclaim)
///   └──► Canceled ◄── Running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Partial,
    Complete,
    Failed,
    Canceled,
}

str_enum!(JobStatus, "job_status", {
    Queued => "queued",
    Running => "running",
    Partial => "partial",
    Complete => "complete",
    Failed => "failed",
    Canceled => "canceled",
});

impl JobStatus {
    pub fn valid_transitions(&self) -> &[JobStatus] {
        match self {
            Self::Queued => &[Self::Running, Self::Canceled],
            Self::Running => &[
                Self::Running,
                Self::Complete,
                Self::Partial,
                Self::Failed,
                Self::Canceled,
            ],
            Self::Partial | Self::Complete | Self::Failed | Self::Canceled => &[],
        }
    }

    pub fn can_transition_to(&self, target: &JobStatus) -> bool {
        self.valid_transitions().contains(target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Partial | Self::Complete | Self::Failed | Self::Canceled
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid job transition from {from} to {to}")]
pub struct JobTransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRole {
    Host,
    Competitor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub url: String,
    pub role: TargetRole,
    pub name: String,
}

impl ScrapeTarget {
    pub fn host(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            role: TargetRole::Host,
            name: name.into(),
        }
    }

    pub fn competitor(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            role: TargetRole::Competitor,
            name: name.into(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == TargetRole::Host
    }

    pub fn party(&self) -> PartyRef {
        PartyRef {
            name: self.name.clone(),
            url: self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetListError {
    #[error("a job needs at least the host target")]
    Empty,
    #[error("the first target must be the host")]
    HostNotFirst,
    #[error("only one host target is allowed")]
    MultipleHosts,
    #[error("at most 4 competitors are allowed, got {0}")]
    TooManyCompetitors(usize),
    #[error("target {index} has an empty url")]
    BlankUrl { index: usize },
}

/// Checks the frozen target list shape: host first, then up to four competitors.
pub fn validate_targets(targets: &[ScrapeTarget]) -> Result<(), TargetListError> {
    let first = targets.first().ok_or(TargetListError::Empty)?;
    if !first.is_host() {
        return Err(TargetListError::HostNotFirst);
    }
    if targets.iter().skip(1).any(ScrapeTarget::is_host) {
        return Err(TargetListError::MultipleHosts);
    }
    let competitors = targets.len() - 1;
    if competitors > MAX_COMPETITORS {
        return Err(TargetListError::TooManyCompetitors(competitors));
    }
    if let Some(index) = targets.iter().position(|t| t.url.trim().is_empty()) {
        return Err(TargetListError::BlankUrl { index });
    }
    Ok(())
}

/// Scheduling period of a timestamp: its ISO week, e.g. `2026-W42`.
pub fn period_key(at: DateTime<Utc>) -> String {
    let week = at.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub targets: Vec<ScrapeTarget>,
    pub trigger_type: TriggerType,
    pub status: JobStatus,
    pub attempt: u32,
    pub period_key: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub dossier_id: Option<Uuid>,
    pub failure_reason: Option<String>,
}

impl Job {
    pub fn new(
        user_id: impl Into<String>,
        targets: Vec<ScrapeTarget>,
        trigger_type: TriggerType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            targets,
            trigger_type,
            status: JobStatus::Queued,
            attempt: 0,
            period_key: period_key(created_at),
            created_at,
            started_at: None,
            completed_at: None,
            lease_owner: None,
            lease_expires_at: None,
            dossier_id: None,
            failure_reason: None,
        }
    }

    pub fn host(&self) -> Option<&ScrapeTarget> {
        self.targets.iter().find(|t| t.is_host())
    }

    pub fn competitors(&self) -> impl Iterator<Item = &ScrapeTarget> {
        self.targets.iter().filter(|t| !t.is_host())
    }

    pub fn transition(&mut self, to: JobStatus) -> Result<(), JobTransitionError> {
        if !self.status.can_transition_to(&to) {
            return Err(JobTransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.lease_expires_at.map(|at| at <= now).unwrap_or(true)
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            user_id: self.user_id.clone(),
            status: self.status,
            trigger_type: self.trigger_type,
            attempt: self.attempt,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            dossier_id: self.dossier_id,
            failure_reason: self.failure_reason.clone(),
        }
    }
}

/// What the dashboard sees of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub user_id: String,
    pub status: JobStatus,
    pub trigger_type: TriggerType,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dossier_id: Option<Uuid>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Network(String),
    HttpStatus(u16),
    InvalidUrl(String),
    Blocked(String),
    Extraction(String),
    Internal(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Network(detail) => write!(f, "network: {detail}"),
            Self::HttpStatus(status) => write!(f, "http status {status}"),
            Self::InvalidUrl(detail) => write!(f, "invalid url: {detail}"),
            Self::Blocked(detail) => write!(f, "blocked: {detail}"),
            Self::Extraction(detail) => write!(f, "extraction: {detail}"),
            Self::Internal(detail) => write!(f, "internal: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ScrapeOutcome {
    Ok,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub target: ScrapeTarget,
    pub outcome: ScrapeOutcome,
    pub tools: Option<ToolSet>,
    pub inventory: Option<Vec<VehicleRecord>>,
    pub fetched_at: DateTime<Utc>,
}

impl ScrapeResult {
    pub fn ok(
        target: ScrapeTarget,
        tools: ToolSet,
        inventory: Vec<VehicleRecord>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            target,
            outcome: ScrapeOutcome::Ok,
            tools: Some(tools),
            inventory: Some(inventory),
            fetched_at,
        }
    }

    pub fn failed(target: ScrapeTarget, reason: FailureReason, fetched_at: DateTime<Utc>) -> Self {
        Self {
            target,
            outcome: ScrapeOutcome::Failed(reason),
            tools: None,
            inventory: None,
            fetched_at,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == ScrapeOutcome::Ok
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.outcome {
            ScrapeOutcome::Ok => None,
            ScrapeOutcome::Failed(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    New,
    Used,
    Cpo,
}

str_enum!(Condition, "condition", {
    New => "new",
    Used => "used",
    Cpo => "cpo",
});

impl Condition {
    pub const ALL: [Condition; 3] = [Condition::New, Condition::Used, Condition::Cpo];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Truck,
    Suv,
    Sedan,
    Other,
}

str_enum!(VehicleType, "vehicle_type", {
    Truck => "truck",
    Suv => "suv",
    Sedan => "sedan",
    Other => "other",
});

impl VehicleType {
    /// Body classes that get their own comparison cells; `Other` only counts in totals.
    pub const TRACKED: [VehicleType; 3] = [VehicleType::Truck, VehicleType::Suv, VehicleType::Sedan];
}

/// One normalized vehicle listing. `condition` is `None` when neither the listing nor
/// its page gives a usable hint; such records count in totals only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub identity_key: String,
    pub vin: Option<String>,
    pub stock_number: Option<String>,
    pub year: Option<u16>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub condition: Option<Condition>,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    pub price: Option<f64>,
    pub mileage: Option<u32>,
    pub source_url: Option<String>,
}

impl VehicleRecord {
    /// "2024 Ford F-150 XLT" style label, skipping unknown parts.
    pub fn label(&self) -> String {
        let year = self.year.map(|y| y.to_string());
        let parts = [
            year.as_deref(),
            self.make.as_deref(),
            self.model.as_deref(),
            self.trim.as_deref(),
        ];
        let label = parts.into_iter().flatten().collect::<Vec<_>>().join(" ");
        if label.is_empty() {
            self.identity_key.clone()
        } else {
            label
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRef {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTarget {
    pub name: String,
    pub url: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolComparison {
    pub host: bool,
    pub competitors: Vec<bool>,
    /// Percent of ok competitors with the tool; `None` when no competitor succeeded.
    pub market_pct: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyMetrics {
    pub count: usize,
    /// Records with a price; only these feed `avg_price`.
    pub priced: usize,
    pub avg_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VsMarket {
    pub count: Option<f64>,
    pub avg_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyCell {
    pub metrics: PartyMetrics,
    pub vs_market: VsMarket,
}

/// Market averages with the number of competitors each one was computed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAverage {
    pub count: Option<f64>,
    pub count_contributors: usize,
    pub avg_price: Option<f64>,
    pub avg_price_contributors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub host: PartyCell,
    pub competitors: Vec<PartyCell>,
    pub market_avg: MarketAverage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceOutlier {
    pub identity_key: String,
    pub label: String,
    pub price: f64,
    pub deviation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryCell {
    pub condition: Condition,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    pub row: ComparisonRow,
    pub host_price_outliers: Vec<PriceOutlier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionTotals {
    pub condition: Condition,
    pub row: ComparisonRow,
}

/// Output of the market comparator: everything the dossier reports, minus identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketComparison {
    pub host: PartyRef,
    pub competitors: Vec<PartyRef>,
    pub attempted_competitors: usize,
    pub tool_comparison: BTreeMap<String, ToolComparison>,
    pub inventory_comparison: Vec<InventoryCell>,
    pub condition_totals: Vec<ConditionTotals>,
    pub totals: ComparisonRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DossierStatus {
    Complete,
    Degraded,
}

str_enum!(DossierStatus, "dossier_status", {
    Complete => "complete",
    Degraded => "degraded",
});

impl DossierStatus {
    pub fn job_status(&self) -> JobStatus {
        match self {
            Self::Complete => JobStatus::Complete,
            Self::Degraded => JobStatus::Partial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dossier {
    pub id: Uuid,
    pub job_id: Uuid,
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub status: DossierStatus,
    pub host: PartyRef,
    pub competitors: Vec<PartyRef>,
    pub failed_targets: Vec<FailedTarget>,
    pub attempted_competitors: usize,
    pub tool_comparison: BTreeMap<String, ToolComparison>,
    pub inventory_comparison: Vec<InventoryCell>,
    pub condition_totals: Vec<ConditionTotals>,
    pub totals: ComparisonRow,
    /// Appended Ask-Why answers keyed by `section/question_id`.
    #[serde(default)]
    pub ask_why: BTreeMap<String, AskWhyAnswer>,
}

impl Dossier {
    pub fn summary(&self) -> DossierSummary {
        DossierSummary {
            id: self.id,
            job_id: self.job_id,
            generated_at: self.generated_at,
            status: self.status,
            competitor_count: self.competitors.len(),
        }
    }

    pub fn cell(&self, condition: Condition, vehicle_type: VehicleType) -> Option<&InventoryCell> {
        self.inventory_comparison
            .iter()
            .find(|c| c.condition == condition && c.vehicle_type == vehicle_type)
    }

    pub fn condition_row(&self, condition: Condition) -> Option<&ComparisonRow> {
        self.condition_totals
            .iter()
            .find(|c| c.condition == condition)
            .map(|c| &c.row)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DossierSummary {
    pub id: Uuid,
    pub job_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub status: DossierStatus,
    pub competitor_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskWhySection {
    Pricing,
    Inventory,
    Tools,
    Overall,
    Cpo,
}

str_enum!(AskWhySection, "section", {
    Pricing => "pricing",
    Inventory => "inventory",
    Tools => "tools",
    Overall => "overall",
    Cpo => "cpo",
});

pub fn ask_why_key(section: AskWhySection, question_id: &str) -> String {
    format!("{}/{}", section.as_str(), question_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskWhyAnswer {
    pub section: AskWhySection,
    pub question_id: String,
    pub question: String,
    pub answer: String,
    pub factors: Vec<String>,
}

/// Fire-and-forget notification emitted once per job reaching a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: Uuid,
    pub user_id: String,
    pub dossier_id: Option<Uuid>,
    pub status: JobStatus,
}
