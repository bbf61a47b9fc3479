//! Chunked, keyed upserts with fail-fast error reporting.

use cot_core::{MetricRecord, WeeklyObservation, UPSERT_CHUNK_SIZE};
use thiserror::Error;
use tracing::debug;

use crate::store::{CotStore, StoreError, UpsertBatch};

/// A row type with a natural key in a keyed table.
pub trait Upsertable: Sized + Sync {
    const TABLE: &'static str;
    const CONFLICT_KEY: &'static [&'static str];

    fn batch(rows: &[Self]) -> UpsertBatch<'_>;
}

impl Upsertable for WeeklyObservation {
    const TABLE: &'static str = "cot_weekly";
    const CONFLICT_KEY: &'static [&'static str] = &["contract_id", "report_date"];

    fn batch(rows: &[Self]) -> UpsertBatch<'_> {
        UpsertBatch::Weekly(rows)
    }
}

impl Upsertable for MetricRecord {
    const TABLE: &'static str = "cot_metrics";
    const CONFLICT_KEY: &'static [&'static str] = &["contract_id", "report_date"];

    fn batch(rows: &[Self]) -> UpsertBatch<'_> {
        UpsertBatch::Metrics(rows)
    }
}

#[derive(Debug, Error)]
#[error("upsert into {table} failed at chunk {chunk}/{chunks}: {source}")]
pub struct PersistenceError {
    pub table: &'static str,
    /// 1-based index of the failed chunk.
    pub chunk: usize,
    pub chunks: usize,
    /// Rows committed by earlier chunks.
    pub rows_written: usize,
    #[source]
    pub source: StoreError,
}

pub struct PersistenceGateway<'a> {
    store: &'a dyn CotStore,
    chunk_size: usize,
}

impl<'a> PersistenceGateway<'a> {
    pub fn new(store: &'a dyn CotStore) -> Self {
        Self::with_chunk_size(store, UPSERT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(store: &'a dyn CotStore, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Upsert `rows` in chunks; each chunk is atomic and the first failure
    /// stops the rest. Returns the number of rows written.
    pub async fn upsert<R: Upsertable>(&self, rows: &[R]) -> Result<usize, PersistenceError> {
        let chunks = rows.len().div_ceil(self.chunk_size);
        let mut written = 0usize;
        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            self.store
                .upsert_batch(R::batch(chunk))
                .await
                .map_err(|source| PersistenceError {
                    table: R::TABLE,
                    chunk: index + 1,
                    chunks,
                    rows_written: written,
                    source,
                })?;
            written += chunk.len();
            debug!(
                table = R::TABLE,
                chunk = index + 1,
                chunks,
                rows = chunk.len(),
                "chunk upserted"
            );
        }
        Ok(written)
    }
}
