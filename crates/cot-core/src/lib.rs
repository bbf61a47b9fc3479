//! Core domain model for COT ingestion and derived positioning metrics.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cot-core";

/// Trailing observation count used for the percentile-rank index.
pub const LOOKBACK_WEEKS: usize = 156;

/// Rows per upsert statement.
pub const UPSERT_CHUNK_SIZE: usize = 500;

pub const DEFAULT_START_YEAR: i32 = 2008;

/// Sector assigned to contracts created during ingestion.
pub const DEFAULT_SECTOR: &str = "Unknown";

/// Stable store-assigned identity of one tradable instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(pub Uuid);

impl ContractId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for ContractId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The three trader groups tracked per contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraderCategory {
    Commercial,
    LargeSpeculator,
    SmallSpeculator,
}

impl TraderCategory {
    pub const ALL: [TraderCategory; 3] = [
        TraderCategory::Commercial,
        TraderCategory::LargeSpeculator,
        TraderCategory::SmallSpeculator,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PositionPair {
    pub long: i64,
    pub short: i64,
}

impl PositionPair {
    pub fn net(&self) -> i64 {
        self.long - self.short
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub name: String,
    pub sector: String,
    pub regulatory_code: Option<String>,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

/// Insert payload for a contract sighted for the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContract {
    pub name: String,
    pub sector: String,
    pub regulatory_code: Option<String>,
}

impl NewContract {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sector: DEFAULT_SECTOR.to_string(),
            regulatory_code: None,
        }
    }
}

/// One reported week for one contract. Unique per `(contract_id, report_date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyObservation {
    pub contract_id: ContractId,
    pub report_date: NaiveDate,
    pub prod_class: Option<String>,
    pub comm_long: i64,
    pub comm_short: i64,
    pub ls_long: i64,
    pub ls_short: i64,
    pub ss_long: i64,
    pub ss_short: i64,
    pub open_interest: Option<i64>,
}

impl WeeklyObservation {
    pub fn key(&self) -> (ContractId, NaiveDate) {
        (self.contract_id, self.report_date)
    }

    pub fn positions(&self, category: TraderCategory) -> PositionPair {
        let (long, short) = match category {
            TraderCategory::Commercial => (self.comm_long, self.comm_short),
            TraderCategory::LargeSpeculator => (self.ls_long, self.ls_short),
            TraderCategory::SmallSpeculator => (self.ss_long, self.ss_short),
        };
        PositionPair { long, short }
    }

    pub fn net(&self, category: TraderCategory) -> i64 {
        self.positions(category).net()
    }
}

/// Derived signals for one `(contract_id, report_date)`.
///
/// Index values lie in `[0, 100]`. Deltas are `None` only for a contract's
/// chronologically first observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub contract_id: ContractId,
    pub report_date: NaiveDate,
    pub comm_net: i64,
    pub ls_net: i64,
    pub ss_net: i64,
    pub comm_index: f64,
    pub ls_index: f64,
    pub ss_index: f64,
    pub wow_comm_delta: Option<i64>,
    pub wow_ls_delta: Option<i64>,
    pub wow_ss_delta: Option<i64>,
}

impl MetricRecord {
    pub fn key(&self) -> (ContractId, NaiveDate) {
        (self.contract_id, self.report_date)
    }

    pub fn net(&self, category: TraderCategory) -> i64 {
        match category {
            TraderCategory::Commercial => self.comm_net,
            TraderCategory::LargeSpeculator => self.ls_net,
            TraderCategory::SmallSpeculator => self.ss_net,
        }
    }

    pub fn index(&self, category: TraderCategory) -> f64 {
        match category {
            TraderCategory::Commercial => self.comm_index,
            TraderCategory::LargeSpeculator => self.ls_index,
            TraderCategory::SmallSpeculator => self.ss_index,
        }
    }

    pub fn delta(&self, category: TraderCategory) -> Option<i64> {
        match category {
            TraderCategory::Commercial => self.wow_comm_delta,
            TraderCategory::LargeSpeculator => self.wow_ls_delta,
            TraderCategory::SmallSpeculator => self.wow_ss_delta,
        }
    }
}

/// Metric row joined with its contract's display attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestMetric {
    #[serde(flatten)]
    pub metric: MetricRecord,
    pub name: String,
    pub sector: String,
}

/// Append-only log entry, one per orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RefreshRun {
    pub run_at: Option<DateTime<Utc>>,
    pub rows_inserted: i64,
    pub rows_updated: i64,
    pub error: Option<String>,
}
