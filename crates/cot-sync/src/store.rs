//! Store capability used by the pipeline and the read API.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use cot_core::{
    Contract, ContractId, LatestMetric, MetricRecord, NewContract, RefreshRun, WeeklyObservation,
};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One chunk of rows addressed to a single keyed table.
#[derive(Debug, Clone, Copy)]
pub enum UpsertBatch<'a> {
    Weekly(&'a [WeeklyObservation]),
    Metrics(&'a [MetricRecord]),
}

impl UpsertBatch<'_> {
    pub fn table(&self) -> &'static str {
        match self {
            UpsertBatch::Weekly(_) => "cot_weekly",
            UpsertBatch::Metrics(_) => "cot_metrics",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UpsertBatch::Weekly(rows) => rows.len(),
            UpsertBatch::Metrics(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Store-wide refresh admission. Dropping the lease releases it.
pub trait RefreshLease: Send {}

#[async_trait]
pub trait CotStore: Send + Sync {
    /// `None` when another refresh, possibly in another process, holds the lease.
    async fn try_lock_refresh(&self) -> Result<Option<Box<dyn RefreshLease>>, StoreError>;

    async fn load_contracts(&self) -> Result<Vec<Contract>, StoreError>;

    /// Exact-name lookup.
    async fn find_contract(&self, name: &str) -> Result<Option<Contract>, StoreError>;

    /// Insert a contract; an existing row with the same name keeps its id.
    async fn insert_contract(&self, contract: &NewContract) -> Result<ContractId, StoreError>;

    /// Atomically upsert one batch, replacing rows that share `(contract_id, report_date)`.
    async fn upsert_batch(&self, batch: UpsertBatch<'_>) -> Result<(), StoreError>;

    /// Weekly rows for the given contracts, ordered by contract then report date.
    async fn load_series(
        &self,
        contract_ids: &[ContractId],
    ) -> Result<Vec<WeeklyObservation>, StoreError>;

    /// Widen (never narrow) a contract's first/last observed dates.
    async fn extend_contract_bounds(
        &self,
        contract_id: ContractId,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Result<(), StoreError>;

    async fn append_refresh_run(&self, run: &RefreshRun) -> Result<(), StoreError>;

    async fn latest_refresh_run(&self) -> Result<Option<RefreshRun>, StoreError>;

    /// Most recent metric row per contract, ordered by contract name.
    async fn latest_metrics(&self) -> Result<Vec<LatestMetric>, StoreError>;

    async fn metrics_on(&self, report_date: NaiveDate) -> Result<Vec<LatestMetric>, StoreError>;

    /// Inclusive date range, ascending.
    async fn metrics_range(
        &self,
        contract_id: ContractId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MetricRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct Faults {
    contract_load: bool,
    reads: bool,
    /// table -> number of chunks accepted before failing
    upserts: HashMap<&'static str, usize>,
}

#[derive(Debug, Default)]
struct MemoryState {
    contracts: BTreeMap<ContractId, Contract>,
    weekly: BTreeMap<(ContractId, NaiveDate), WeeklyObservation>,
    metrics: BTreeMap<(ContractId, NaiveDate), MetricRecord>,
    runs: Vec<RefreshRun>,
    accepted_chunks: HashMap<&'static str, usize>,
    faults: Faults,
}

impl MemoryState {
    fn check_reads(&self) -> Result<(), StoreError> {
        if self.faults.reads {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        Ok(())
    }

    fn joined(&self, metric: &MetricRecord) -> Option<LatestMetric> {
        let contract = self.contracts.get(&metric.contract_id)?;
        Some(LatestMetric {
            metric: metric.clone(),
            name: contract.name.clone(),
            sector: contract.sector.clone(),
        })
    }
}

struct MemoryLease(Arc<AtomicBool>);

impl RefreshLease for MemoryLease {}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keyed in-memory store with the same upsert semantics as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryCotStore {
    state: Mutex<MemoryState>,
    refresh_locked: Arc<AtomicBool>,
}

impl MemoryCotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contracts(&self) -> Vec<Contract> {
        self.state.lock().await.contracts.values().cloned().collect()
    }

    pub async fn weekly_rows(&self) -> Vec<WeeklyObservation> {
        self.state.lock().await.weekly.values().cloned().collect()
    }

    pub async fn metric_rows(&self) -> Vec<MetricRecord> {
        self.state.lock().await.metrics.values().cloned().collect()
    }

    pub async fn refresh_runs(&self) -> Vec<RefreshRun> {
        self.state.lock().await.runs.clone()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl MemoryCotStore {
    /// Accept `after_chunks` chunks for `table`, then fail every later one.
    pub async fn fail_upserts(&self, table: &'static str, after_chunks: usize) {
        let mut state = self.state.lock().await;
        state.accepted_chunks.insert(table, 0);
        state.faults.upserts.insert(table, after_chunks);
    }

    pub async fn fail_contract_load(&self) {
        self.state.lock().await.faults.contract_load = true;
    }

    pub async fn fail_reads(&self) {
        self.state.lock().await.faults.reads = true;
    }

}

#[async_trait]
impl CotStore for MemoryCotStore {
    async fn try_lock_refresh(&self) -> Result<Option<Box<dyn RefreshLease>>, StoreError> {
        if self
            .refresh_locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let lease: Box<dyn RefreshLease> = Box::new(MemoryLease(Arc::clone(&self.refresh_locked)));
        Ok(Some(lease))
    }

    async fn load_contracts(&self) -> Result<Vec<Contract>, StoreError> {
        let state = self.state.lock().await;
        if state.faults.contract_load {
            return Err(StoreError::Unavailable("contract list unavailable".into()));
        }
        let mut contracts = state.contracts.values().cloned().collect::<Vec<_>>();
        contracts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(contracts)
    }

    async fn find_contract(&self, name: &str) -> Result<Option<Contract>, StoreError> {
        let state = self.state.lock().await;
        state.check_reads()?;
        Ok(state.contracts.values().find(|c| c.name == name).cloned())
    }

    async fn insert_contract(&self, contract: &NewContract) -> Result<ContractId, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.contracts.values().find(|c| c.name == contract.name) {
            return Ok(existing.id);
        }
        let id = ContractId::new_v4();
        state.contracts.insert(
            id,
            Contract {
                id,
                name: contract.name.clone(),
                sector: contract.sector.clone(),
                regulatory_code: contract.regulatory_code.clone(),
                first_date: None,
                last_date: None,
            },
        );
        Ok(id)
    }

    async fn upsert_batch(&self, batch: UpsertBatch<'_>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let table = batch.table();
        if let Some(limit) = state.faults.upserts.get(table).copied() {
            let accepted = state.accepted_chunks.entry(table).or_default();
            if *accepted >= limit {
                return Err(StoreError::Unavailable(format!("write to {table} rejected")));
            }
            *accepted += 1;
        }

        match batch {
            UpsertBatch::Weekly(rows) => {
                for row in rows {
                    state.weekly.insert(row.key(), row.clone());
                }
            }
            UpsertBatch::Metrics(rows) => {
                for row in rows {
                    state.metrics.insert(row.key(), row.clone());
                }
            }
        }
        Ok(())
    }

    async fn load_series(
        &self,
        contract_ids: &[ContractId],
    ) -> Result<Vec<WeeklyObservation>, StoreError> {
        let state = self.state.lock().await;
        state.check_reads()?;
        let mut ids = contract_ids.to_vec();
        ids.sort();
        ids.dedup();
        Ok(ids
            .iter()
            .flat_map(|id| {
                state
                    .weekly
                    .range((*id, NaiveDate::MIN)..=(*id, NaiveDate::MAX))
                    .map(|(_, row)| row.clone())
            })
            .collect())
    }

    async fn extend_contract_bounds(
        &self,
        contract_id: ContractId,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(contract) = state.contracts.get_mut(&contract_id) {
            contract.first_date = Some(contract.first_date.map_or(first, |d| d.min(first)));
            contract.last_date = Some(contract.last_date.map_or(last, |d| d.max(last)));
        }
        Ok(())
    }

    async fn append_refresh_run(&self, run: &RefreshRun) -> Result<(), StoreError> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn latest_refresh_run(&self) -> Result<Option<RefreshRun>, StoreError> {
        let state = self.state.lock().await;
        state.check_reads()?;
        Ok(state.runs.last().cloned())
    }

    async fn latest_metrics(&self) -> Result<Vec<LatestMetric>, StoreError> {
        let state = self.state.lock().await;
        state.check_reads()?;
        let mut latest: BTreeMap<ContractId, &MetricRecord> = BTreeMap::new();
        for metric in state.metrics.values() {
            // keys iterate in (contract, date) order, so the last write per contract wins
            latest.insert(metric.contract_id, metric);
        }
        let mut out = latest
            .values()
            .filter_map(|m| state.joined(m))
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn metrics_on(&self, report_date: NaiveDate) -> Result<Vec<LatestMetric>, StoreError> {
        let state = self.state.lock().await;
        state.check_reads()?;
        let mut out = state
            .metrics
            .values()
            .filter(|m| m.report_date == report_date)
            .filter_map(|m| state.joined(m))
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn metrics_range(
        &self,
        contract_id: ContractId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        let state = self.state.lock().await;
        state.check_reads()?;
        if from > to {
            return Ok(Vec::new());
        }
        Ok(state
            .metrics
            .range((contract_id, from)..=(contract_id, to))
            .map(|(_, m)| m.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn week(contract_id: ContractId, day: u32, comm_long: i64) -> WeeklyObservation {
        WeeklyObservation {
            contract_id,
            report_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            prod_class: Some("AG".into()),
            comm_long,
            comm_short: 0,
            ls_long: 0,
            ls_short: 0,
            ss_long: 0,
            ss_short: 0,
            open_interest: None,
        }
    }

    #[tokio::test]
    async fn upserting_same_key_twice_keeps_one_row_with_second_values() {
        let store = MemoryCotStore::new();
        let id = store.insert_contract(&NewContract::named("GOLD")).await.unwrap();

        store
            .upsert_batch(UpsertBatch::Weekly(&[week(id, 2, 10)]))
            .await
            .unwrap();
        store
            .upsert_batch(UpsertBatch::Weekly(&[week(id, 2, 99)]))
            .await
            .unwrap();

        let rows = store.weekly_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].comm_long, 99);
    }

    #[tokio::test]
    async fn inserting_known_name_returns_existing_id() {
        let store = MemoryCotStore::new();
        let first = store.insert_contract(&NewContract::named("GOLD")).await.unwrap();
        let second = store.insert_contract(&NewContract::named("GOLD")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.contracts().await.len(), 1);
    }

    #[tokio::test]
    async fn series_is_ordered_per_contract_and_scoped_to_requested_ids() {
        let store = MemoryCotStore::new();
        let gold = store.insert_contract(&NewContract::named("GOLD")).await.unwrap();
        let corn = store.insert_contract(&NewContract::named("CORN")).await.unwrap();
        store
            .upsert_batch(UpsertBatch::Weekly(&[
                week(gold, 16, 3),
                week(corn, 2, 1),
                week(gold, 2, 1),
                week(gold, 9, 2),
            ]))
            .await
            .unwrap();

        let series = store.load_series(&[gold]).await.unwrap();
        assert_eq!(
            series.iter().map(|w| w.comm_long).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn bounds_only_widen() {
        let store = MemoryCotStore::new();
        let id = store.insert_contract(&NewContract::named("GOLD")).await.unwrap();
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();

        store.extend_contract_bounds(id, d(9), d(16)).await.unwrap();
        store.extend_contract_bounds(id, d(10), d(12)).await.unwrap();
        store.extend_contract_bounds(id, d(2), d(10)).await.unwrap();

        let contract = store.contracts().await.remove(0);
        assert_eq!(contract.first_date, Some(d(2)));
        assert_eq!(contract.last_date, Some(d(16)));
    }

    #[tokio::test]
    async fn injected_upsert_fault_fires_after_accepted_chunks() {
        let store = MemoryCotStore::new();
        let id = store.insert_contract(&NewContract::named("GOLD")).await.unwrap();
        store.fail_upserts("cot_weekly", 1).await;

        assert!(store.upsert_batch(UpsertBatch::Weekly(&[week(id, 2, 1)])).await.is_ok());
        assert!(store.upsert_batch(UpsertBatch::Weekly(&[week(id, 9, 1)])).await.is_err());
        assert!(store.upsert_batch(UpsertBatch::Metrics(&[])).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_lease_is_exclusive_until_dropped() {
        let store = MemoryCotStore::new();

        let lease = store.try_lock_refresh().await.unwrap();
        assert!(lease.is_some());
        assert!(store.try_lock_refresh().await.unwrap().is_none());

        drop(lease);
        assert!(store.try_lock_refresh().await.unwrap().is_some());
    }
}
