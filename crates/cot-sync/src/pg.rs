//! Postgres-backed [`CotStore`].

use async_trait::async_trait;
use chrono::NaiveDate;
use cot_core::{
    Contract, ContractId, LatestMetric, MetricRecord, NewContract, RefreshRun, WeeklyObservation,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use crate::gateway::Upsertable;
use crate::store::{CotStore, RefreshLease, StoreError, UpsertBatch};

const WEEKLY_COLUMNS: &[&str] = &[
    "contract_id",
    "report_date",
    "prod_class",
    "comm_long",
    "comm_short",
    "ls_long",
    "ls_short",
    "ss_long",
    "ss_short",
    "open_interest",
];

const METRIC_COLUMNS: &[&str] = &[
    "contract_id",
    "report_date",
    "comm_net",
    "ls_net",
    "ss_net",
    "comm_index",
    "ls_index",
    "ss_index",
    "wow_comm_delta",
    "wow_ls_delta",
    "wow_ss_delta",
];

/// Advisory lock key shared by every process refreshing the same database.
const REFRESH_LOCK_KEY: i64 = 0x636f_7400_0001;

/// Holds `pg_try_advisory_xact_lock`; dropping the transaction rolls back and
/// releases it, including when the run's task dies.
struct PgRefreshLease {
    _tx: Transaction<'static, Postgres>,
}

impl RefreshLease for PgRefreshLease {}

#[derive(Debug, Clone)]
pub struct PgCotStore {
    pool: PgPool,
}

impl PgCotStore {
    fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A refresh lease pins one connection for the whole run, so the pool is
    /// never smaller than two.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(2))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

/// `INSERT INTO table (cols) ` prefix; values and the conflict clause are pushed by the caller.
fn insert_prefix<'q, R: Upsertable>(columns: &[&str]) -> QueryBuilder<'q, Postgres> {
    QueryBuilder::new(format!("INSERT INTO {} ({}) ", R::TABLE, columns.join(", ")))
}

/// `ON CONFLICT (key) DO UPDATE SET col = EXCLUDED.col, ...` for every non-key column.
fn push_conflict_update<R: Upsertable>(qb: &mut QueryBuilder<'_, Postgres>, columns: &[&str]) {
    let assignments = columns
        .iter()
        .filter(|col| !R::CONFLICT_KEY.iter().any(|key| key == *col))
        .map(|col| format!("{col} = EXCLUDED.{col}"))
        .collect::<Vec<_>>()
        .join(", ");
    qb.push(format!(
        " ON CONFLICT ({}) DO UPDATE SET {assignments}",
        R::CONFLICT_KEY.join(", ")
    ));
}

fn contract_from_row(row: &PgRow) -> Result<Contract, sqlx::Error> {
    Ok(Contract {
        id: ContractId(row.try_get("id")?),
        name: row.try_get("name")?,
        sector: row.try_get("sector")?,
        regulatory_code: row.try_get("regulatory_code")?,
        first_date: row.try_get("first_date")?,
        last_date: row.try_get("last_date")?,
    })
}

fn weekly_from_row(row: &PgRow) -> Result<WeeklyObservation, sqlx::Error> {
    Ok(WeeklyObservation {
        contract_id: ContractId(row.try_get("contract_id")?),
        report_date: row.try_get("report_date")?,
        prod_class: row.try_get("prod_class")?,
        comm_long: row.try_get("comm_long")?,
        comm_short: row.try_get("comm_short")?,
        ls_long: row.try_get("ls_long")?,
        ls_short: row.try_get("ls_short")?,
        ss_long: row.try_get("ss_long")?,
        ss_short: row.try_get("ss_short")?,
        open_interest: row.try_get("open_interest")?,
    })
}

fn metric_from_row(row: &PgRow) -> Result<MetricRecord, sqlx::Error> {
    Ok(MetricRecord {
        contract_id: ContractId(row.try_get("contract_id")?),
        report_date: row.try_get("report_date")?,
        comm_net: row.try_get("comm_net")?,
        ls_net: row.try_get("ls_net")?,
        ss_net: row.try_get("ss_net")?,
        comm_index: row.try_get("comm_index")?,
        ls_index: row.try_get("ls_index")?,
        ss_index: row.try_get("ss_index")?,
        wow_comm_delta: row.try_get("wow_comm_delta")?,
        wow_ls_delta: row.try_get("wow_ls_delta")?,
        wow_ss_delta: row.try_get("wow_ss_delta")?,
    })
}

fn latest_from_row(row: &PgRow) -> Result<LatestMetric, sqlx::Error> {
    Ok(LatestMetric {
        metric: metric_from_row(row)?,
        name: row.try_get("name")?,
        sector: row.try_get("sector")?,
    })
}

#[async_trait]
impl CotStore for PgCotStore {
    async fn try_lock_refresh(&self) -> Result<Option<Box<dyn RefreshLease>>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(REFRESH_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await?;
        if !acquired {
            return Ok(None);
        }
        let lease: Box<dyn RefreshLease> = Box::new(PgRefreshLease { _tx: tx });
        Ok(Some(lease))
    }

    async fn load_contracts(&self) -> Result<Vec<Contract>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, sector, regulatory_code, first_date, last_date
              FROM contracts
             ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(contract_from_row).collect::<Result<_, _>>()?)
    }

    async fn find_contract(&self, name: &str) -> Result<Option<Contract>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, sector, regulatory_code, first_date, last_date
              FROM contracts
             WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(contract_from_row).transpose()?)
    }

    async fn insert_contract(&self, contract: &NewContract) -> Result<ContractId, StoreError> {
        // the no-op update makes RETURNING yield the existing id on conflict
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO contracts (name, sector, regulatory_code)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(&contract.name)
        .bind(&contract.sector)
        .bind(&contract.regulatory_code)
        .fetch_one(&self.pool)
        .await?;
        Ok(ContractId(id))
    }

    async fn upsert_batch(&self, batch: UpsertBatch<'_>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut qb = match batch {
            UpsertBatch::Weekly(rows) => {
                let mut qb = insert_prefix::<WeeklyObservation>(WEEKLY_COLUMNS);
                qb.push_values(rows.iter(), |mut b, row| {
                    b.push_bind(row.contract_id.as_uuid())
                        .push_bind(row.report_date)
                        .push_bind(row.prod_class.clone())
                        .push_bind(row.comm_long)
                        .push_bind(row.comm_short)
                        .push_bind(row.ls_long)
                        .push_bind(row.ls_short)
                        .push_bind(row.ss_long)
                        .push_bind(row.ss_short)
                        .push_bind(row.open_interest);
                });
                push_conflict_update::<WeeklyObservation>(&mut qb, WEEKLY_COLUMNS);
                qb
            }
            UpsertBatch::Metrics(rows) => {
                let mut qb = insert_prefix::<MetricRecord>(METRIC_COLUMNS);
                qb.push_values(rows.iter(), |mut b, row| {
                    b.push_bind(row.contract_id.as_uuid())
                        .push_bind(row.report_date)
                        .push_bind(row.comm_net)
                        .push_bind(row.ls_net)
                        .push_bind(row.ss_net)
                        .push_bind(row.comm_index)
                        .push_bind(row.ls_index)
                        .push_bind(row.ss_index)
                        .push_bind(row.wow_comm_delta)
                        .push_bind(row.wow_ls_delta)
                        .push_bind(row.wow_ss_delta);
                });
                push_conflict_update::<MetricRecord>(&mut qb, METRIC_COLUMNS);
                qb
            }
        };

        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn load_series(
        &self,
        contract_ids: &[ContractId],
    ) -> Result<Vec<WeeklyObservation>, StoreError> {
        if contract_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = contract_ids.iter().map(ContractId::as_uuid).collect::<Vec<_>>();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM cot_weekly WHERE contract_id = ANY($1) ORDER BY contract_id, report_date",
            WEEKLY_COLUMNS.join(", ")
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(weekly_from_row).collect::<Result<_, _>>()?)
    }

    async fn extend_contract_bounds(
        &self,
        contract_id: ContractId,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE contracts
               SET first_date = LEAST(COALESCE(first_date, $2), $2),
                   last_date = GREATEST(COALESCE(last_date, $3), $3)
             WHERE id = $1
            "#,
        )
        .bind(contract_id.as_uuid())
        .bind(first)
        .bind(last)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_refresh_run(&self, run: &RefreshRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_log (run_at, rows_inserted, rows_updated, error)
            VALUES (COALESCE($1, NOW()), $2, $3, $4)
            "#,
        )
        .bind(run.run_at)
        .bind(run.rows_inserted)
        .bind(run.rows_updated)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_refresh_run(&self) -> Result<Option<RefreshRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_at, rows_inserted, rows_updated, error
              FROM refresh_log
             ORDER BY run_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(RefreshRun {
            run_at: row.try_get("run_at")?,
            rows_inserted: row.try_get("rows_inserted")?,
            rows_updated: row.try_get("rows_updated")?,
            error: row.try_get("error")?,
        }))
    }

    async fn latest_metrics(&self) -> Result<Vec<LatestMetric>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT m.*, c.name, c.sector
              FROM (SELECT DISTINCT ON (contract_id) {cols}
                      FROM cot_metrics
                     ORDER BY contract_id, report_date DESC) m
              JOIN contracts c ON c.id = m.contract_id
             ORDER BY c.name
            "#,
            cols = METRIC_COLUMNS.join(", ")
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(latest_from_row).collect::<Result<_, _>>()?)
    }

    async fn metrics_on(&self, report_date: NaiveDate) -> Result<Vec<LatestMetric>, StoreError> {
        let cols = METRIC_COLUMNS
            .iter()
            .map(|col| format!("m.{col}"))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!(
            r#"
            SELECT {cols}, c.name, c.sector
              FROM cot_metrics m
              JOIN contracts c ON c.id = m.contract_id
             WHERE m.report_date = $1
             ORDER BY c.name
            "#
        ))
        .bind(report_date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(latest_from_row).collect::<Result<_, _>>()?)
    }

    async fn metrics_range(
        &self,
        contract_id: ContractId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
              FROM cot_metrics
             WHERE contract_id = $1
               AND report_date BETWEEN $2 AND $3
             ORDER BY report_date
            "#,
            METRIC_COLUMNS.join(", ")
        ))
        .bind(contract_id.as_uuid())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(metric_from_row).collect::<Result<_, _>>()?)
    }
}
