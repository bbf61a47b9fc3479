//! Year-by-year refresh runs and single-flight admission.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use cot_adapters::{parse_archive, ArchiveSource, FormatError, RetrievalError};
use cot_core::{ContractId, RefreshRun, WeeklyObservation, DEFAULT_START_YEAR, UPSERT_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::gateway::{PersistenceError, PersistenceGateway};
use crate::metrics::compute_metrics;
use crate::registry::ContractRegistry;
use crate::store::{CotStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Every year from `from` (or the configured start year) through the current year.
    Full { from: Option<i32> },
    Year(i32),
}

impl RefreshMode {
    /// Interpret the `mode` and `year` query parameters. `mode` defaults to full.
    pub fn from_query(mode: Option<&str>, year: Option<i32>) -> Result<Self, RefreshError> {
        match mode.map(str::trim).filter(|m| !m.is_empty()) {
            None | Some("full") => Ok(RefreshMode::Full { from: year }),
            Some("year") => year.map(RefreshMode::Year).ok_or(RefreshError::MissingYear),
            Some(other) => Err(RefreshError::InvalidMode(other.to_string())),
        }
    }

    /// Years to process, ascending.
    pub fn years(&self, start_year: i32, current_year: i32) -> Result<Vec<i32>, RefreshError> {
        match *self {
            RefreshMode::Full { from } => {
                let first = from.unwrap_or(start_year);
                if first > current_year {
                    return Err(RefreshError::InvalidYear(first));
                }
                Ok((first..=current_year).collect())
            }
            RefreshMode::Year(year) if year > current_year => Err(RefreshError::InvalidYear(year)),
            RefreshMode::Year(year) => Ok(vec![year]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub status: RunStatus,
    pub weekly_rows: usize,
    pub metric_rows: usize,
    pub errors: Vec<String>,
}

/// A failure confined to one year of a run.
#[derive(Debug, Error)]
pub enum YearError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("store read failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("a refresh is already running")]
    AlreadyRunning,
    #[error("unknown refresh mode {0:?} (expected full or year)")]
    InvalidMode(String),
    #[error("mode=year requires a year parameter")]
    MissingYear,
    #[error("year {0} is after the current year")]
    InvalidYear(i32),
    #[error("refresh initialization failed: {0}")]
    Init(#[source] StoreError),
    #[error("writing refresh log failed: {0}")]
    Log(#[source] StoreError),
    #[error("refresh task aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

impl RefreshError {
    /// Rejections of the request itself, as opposed to failures while running it.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            RefreshError::InvalidMode(_) | RefreshError::MissingYear | RefreshError::InvalidYear(_)
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct YearCounts {
    weekly_rows: usize,
    metric_rows: usize,
}

pub struct Orchestrator {
    store: Arc<dyn CotStore>,
    source: Arc<dyn ArchiveSource>,
    start_year: i32,
    chunk_size: usize,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn CotStore>, source: Arc<dyn ArchiveSource>) -> Self {
        Self {
            store,
            source,
            start_year: DEFAULT_START_YEAR,
            chunk_size: UPSERT_CHUNK_SIZE,
        }
    }

    pub fn with_start_year(mut self, start_year: i32) -> Self {
        self.start_year = start_year;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn start_year(&self) -> i32 {
        self.start_year
    }

    /// Process every year of `mode` in order. Per-year failures are recorded and
    /// the run continues; only initialization and the final log write are fatal.
    pub async fn run(&self, mode: RefreshMode) -> Result<RefreshOutcome, RefreshError> {
        let years = mode.years(self.start_year, Utc::now().year())?;

        let mut registry = ContractRegistry::new(self.store.as_ref());
        let known = registry.preload().await.map_err(RefreshError::Init)?;
        info!(?mode, years = years.len(), known_contracts = known, "refresh run started");

        let mut totals = YearCounts::default();
        let mut errors = Vec::new();
        for year in years {
            let span = info_span!("refresh_year", year);
            match self.ingest_year(&mut registry, year).instrument(span).await {
                Ok(counts) => {
                    info!(
                        year,
                        weekly_rows = counts.weekly_rows,
                        metric_rows = counts.metric_rows,
                        "year ingested"
                    );
                    totals.weekly_rows += counts.weekly_rows;
                    totals.metric_rows += counts.metric_rows;
                }
                Err(err) => {
                    let tagged = format!("{year}: {err}");
                    warn!(year, error = %err, "year failed");
                    errors.push(tagged);
                }
            }
        }

        let run = RefreshRun {
            run_at: Some(Utc::now()),
            rows_inserted: (totals.weekly_rows + totals.metric_rows) as i64,
            rows_updated: 0,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        };
        self.store
            .append_refresh_run(&run)
            .await
            .map_err(RefreshError::Log)?;

        let status = if errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };
        info!(
            ?status,
            weekly_rows = totals.weekly_rows,
            metric_rows = totals.metric_rows,
            failed_years = errors.len(),
            new_contracts = registry.created(),
            "refresh run finished"
        );

        Ok(RefreshOutcome {
            status,
            weekly_rows: totals.weekly_rows,
            metric_rows: totals.metric_rows,
            errors,
        })
    }

    async fn ingest_year(
        &self,
        registry: &mut ContractRegistry<'_>,
        year: i32,
    ) -> Result<YearCounts, YearError> {
        let bytes = self.source.fetch_year(year).await?;
        let parsed = parse_archive(&bytes)?;

        let mut keyed: BTreeMap<(ContractId, NaiveDate), WeeklyObservation> = BTreeMap::new();
        let mut duplicates = 0usize;
        for row in parsed.rows {
            let id = registry
                .resolve(&row.contract_name, row.regulatory_code.as_deref())
                .await?;
            let observation = row.into_observation(id);
            if keyed.insert(observation.key(), observation).is_some() {
                duplicates += 1;
            }
        }
        if duplicates > 0 {
            warn!(year, duplicates, "duplicate contract/date rows collapsed, last one kept");
        }
        let weekly = keyed.into_values().collect::<Vec<_>>();

        let gateway = PersistenceGateway::with_chunk_size(self.store.as_ref(), self.chunk_size);
        let weekly_rows = gateway.upsert(&weekly).await?;

        let mut bounds: BTreeMap<ContractId, (NaiveDate, NaiveDate)> = BTreeMap::new();
        for obs in &weekly {
            bounds
                .entry(obs.contract_id)
                .and_modify(|(first, last)| {
                    *first = (*first).min(obs.report_date);
                    *last = (*last).max(obs.report_date);
                })
                .or_insert((obs.report_date, obs.report_date));
        }
        let touched = weekly
            .iter()
            .map(|obs| obs.contract_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        // full history, so windows spanning earlier years stay correct
        let series = self.store.load_series(&touched).await?;
        let metrics = compute_metrics(&series);
        let metric_rows = gateway.upsert(&metrics).await?;

        for (contract_id, (first, last)) in bounds {
            if let Err(err) = self
                .store
                .extend_contract_bounds(contract_id, first, last)
                .await
            {
                warn!(year, %contract_id, error = %err, "updating contract date bounds failed");
            }
        }

        Ok(YearCounts {
            weekly_rows,
            metric_rows,
        })
    }
}

/// Admits at most one run at a time; a concurrent request is rejected, not queued.
///
/// The in-process gate turns away concurrent requests to this server cheaply.
/// The store lease extends that to every process writing the same store.
#[derive(Clone)]
pub struct RefreshCoordinator {
    orchestrator: Arc<Orchestrator>,
    gate: Arc<Mutex<()>>,
}

impl RefreshCoordinator {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Run on a spawned task that owns the gate and the lease, so dropping the
    /// caller's future does not abandon the run midway.
    pub async fn try_refresh(&self, mode: RefreshMode) -> Result<RefreshOutcome, RefreshError> {
        let guard = Arc::clone(&self.gate)
            .try_lock_owned()
            .map_err(|_| RefreshError::AlreadyRunning)?;
        let lease = self
            .orchestrator
            .store
            .try_lock_refresh()
            .await
            .map_err(RefreshError::Init)?
            .ok_or(RefreshError::AlreadyRunning)?;
        let orchestrator = Arc::clone(&self.orchestrator);
        let handle = tokio::spawn(async move {
            let _admitted = (guard, lease);
            orchestrator.run(mode).await
        });
        handle.await?
    }
}
