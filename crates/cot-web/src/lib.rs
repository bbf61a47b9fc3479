//! JSON HTTP surface: refresh trigger, run status and metric reads.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use cot_core::ContractId;
use cot_sync::{
    pipeline_from_config, CotStore, Pipeline, RefreshConfig, RefreshCoordinator, RefreshError,
    RefreshMode, StoreError,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cot-web";

const DEFAULT_EXTREME_MIN: f64 = 5.0;
const DEFAULT_EXTREME_MAX: f64 = 95.0;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CotStore>,
    pub coordinator: RefreshCoordinator,
}

impl AppState {
    pub fn new(store: Arc<dyn CotStore>, coordinator: RefreshCoordinator) -> Self {
        Self { store, coordinator }
    }
}

impl From<Pipeline> for AppState {
    fn from(pipeline: Pipeline) -> Self {
        Self::new(pipeline.store, pipeline.coordinator)
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("COT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

// Query values arrive as strings so malformed input gets a JSON 400 instead
// of the extractor's plain-text rejection.
#[derive(Debug, Deserialize, Default)]
struct RefreshQuery {
    mode: Option<String>,
    year: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RangeQuery {
    contract_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct HeatmapQuery {
    date: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ExtremesQuery {
    min: Option<String>,
    max: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/refresh/run", post(refresh_run_handler))
        .route("/refresh/status", get(refresh_status_handler))
        .route("/cot/latest", get(latest_handler))
        .route("/cot/range", get(range_handler))
        .route("/cot/heatmap", get(heatmap_handler))
        .route("/cot/extremes", get(extremes_handler))
        .route("/contracts", get(contracts_handler))
        .route("/contracts/{name}", get(contract_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, config: &WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "http listener bound");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let pipeline = pipeline_from_config(&RefreshConfig::from_env()).await?;
    serve(pipeline.into(), &WebConfig::from_env()).await
}

async fn index_handler() -> Response {
    Json(serde_json::json!({
        "service": "cot-index",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn refresh_run_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RefreshQuery>,
) -> Response {
    let year = match query.year.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => match raw.parse::<i32>() {
            Ok(year) => Some(year),
            Err(_) => return bad_request(format!("invalid year {raw:?}")),
        },
    };
    let mode = match RefreshMode::from_query(query.mode.as_deref(), year) {
        Ok(mode) => mode,
        Err(err) => return refresh_error(err),
    };

    match state.coordinator.try_refresh(mode).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => refresh_error(err),
    }
}

async fn refresh_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_refresh_run().await {
        Ok(run) => Json(run.unwrap_or_default()).into_response(),
        Err(err) => store_error(err),
    }
}

async fn latest_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_metrics().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn range_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let contract_id = match query.contract_id.as_deref().map(str::trim) {
        None | Some("") => return bad_request("contract_id is required"),
        Some(raw) => match Uuid::parse_str(raw) {
            Ok(id) => ContractId(id),
            Err(_) => return bad_request(format!("invalid contract_id {raw:?}")),
        },
    };
    let from = match required_date("from", query.from.as_deref()) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    let to = match required_date("to", query.to.as_deref()) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    if from > to {
        return bad_request(format!("from ({from}) is after to ({to})"));
    }

    match state.store.metrics_range(contract_id, from, to).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn heatmap_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HeatmapQuery>,
) -> Response {
    let date = match required_date("date", query.date.as_deref()) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    match state.store.metrics_on(date).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn extremes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExtremesQuery>,
) -> Response {
    let min = match optional_index("min", query.min.as_deref(), DEFAULT_EXTREME_MIN) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let max = match optional_index("max", query.max.as_deref(), DEFAULT_EXTREME_MAX) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match state.store.latest_metrics().await {
        Ok(rows) => {
            let mut extremes = rows
                .into_iter()
                .filter(|row| row.metric.comm_index <= min || row.metric.comm_index >= max)
                .collect::<Vec<_>>();
            extremes.sort_by(|a, b| a.metric.comm_index.total_cmp(&b.metric.comm_index));
            Json(extremes).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn contracts_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.load_contracts().await {
        Ok(contracts) => Json(contracts).into_response(),
        Err(err) => store_error(err),
    }
}

async fn contract_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.store.find_contract(&name).await {
        Ok(Some(contract)) => Json(contract).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, format!("unknown contract {name:?}")),
        Err(err) => store_error(err),
    }
}

fn required_date(field: &str, raw: Option<&str>) -> Result<NaiveDate, Response> {
    match raw.map(str::trim) {
        None | Some("") => Err(bad_request(format!("{field} is required"))),
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
            bad_request(format!("invalid {field} date {value:?} (expected YYYY-MM-DD)"))
        }),
    }
}

fn optional_index(field: &str, raw: Option<&str>, default: f64) -> Result<f64, Response> {
    match raw.map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value
            .parse::<f64>()
            .ok()
            .filter(|v| (0.0..=100.0).contains(v))
            .ok_or_else(|| bad_request(format!("invalid {field} {value:?} (expected 0-100)"))),
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, message)
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store read failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn refresh_error(err: RefreshError) -> Response {
    let status = match &err {
        RefreshError::AlreadyRunning => StatusCode::CONFLICT,
        err if err.is_bad_request() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "refresh failed");
    } else {
        warn!(error = %err, "refresh rejected");
    }
    json_error(status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use cot_adapters::{ArchiveSource, RetrievalError};
    use cot_core::{MetricRecord, NewContract};
    use cot_sync::{MemoryCotStore, Orchestrator, UpsertBatch};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use std::io::{Cursor, Write};
    use tokio::sync::Notify;
    use tower::ServiceExt;
    use zip::write::SimpleFileOptions;

    fn archive(rows: &[(&str, &str, i64)]) -> Vec<u8> {
        let mut text = String::from("Market_and_Exchange_Names,Report_Date_as_YYYY-MM-DD,ProdClass,Commercial_Positions_Long_All,Commercial_Positions_Short_All,Noncommercial_Positions_Long_All,Noncommercial_Positions_Short_All,Nonreportable_Positions_Long_All,Nonreportable_Positions_Short_All\n");
        for (name, date, comm_long) in rows {
            text.push_str(&format!("{name},{date},AG,{comm_long},10,4,2,1,1\n"));
        }
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("annual.txt", SimpleFileOptions::default()).unwrap();
        writer.write_all(text.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[derive(Default)]
    struct FakeSource {
        archives: HashMap<i32, Vec<u8>>,
        release: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    #[async_trait]
    impl ArchiveSource for FakeSource {
        async fn fetch_year(&self, year: i32) -> Result<Vec<u8>, RetrievalError> {
            if let Some((started, release)) = &self.release {
                started.notify_one();
                release.notified().await;
            }
            self.archives
                .get(&year)
                .cloned()
                .ok_or_else(|| RetrievalError::HttpStatus {
                    year,
                    status: 404,
                    url: format!("fake://{year}"),
                })
        }
    }

    fn state_with(store: Arc<MemoryCotStore>, source: FakeSource) -> AppState {
        let store: Arc<dyn CotStore> = store;
        let orchestrator = Orchestrator::new(Arc::clone(&store), Arc::new(source));
        AppState::new(store, RefreshCoordinator::new(orchestrator))
    }

    fn empty_state() -> (Arc<MemoryCotStore>, AppState) {
        let store = Arc::new(MemoryCotStore::new());
        let state = state_with(Arc::clone(&store), FakeSource::default());
        (store, state)
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn metric(contract_id: ContractId, date: &str, comm_index: f64) -> MetricRecord {
        MetricRecord {
            contract_id,
            report_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            comm_net: 1,
            ls_net: 2,
            ss_net: 3,
            comm_index,
            ls_index: 50.0,
            ss_index: 50.0,
            wow_comm_delta: None,
            wow_ls_delta: None,
            wow_ss_delta: None,
        }
    }

    async fn seed(store: &MemoryCotStore) -> (ContractId, ContractId) {
        let gold = store.insert_contract(&NewContract::named("GOLD")).await.unwrap();
        let corn = store.insert_contract(&NewContract::named("CORN")).await.unwrap();
        store
            .upsert_batch(UpsertBatch::Metrics(&[
                metric(gold, "2024-01-02", 40.0),
                metric(gold, "2024-01-09", 97.0),
                metric(gold, "2024-01-16", 99.0),
                metric(corn, "2024-01-09", 2.0),
                metric(corn, "2024-01-16", 50.0),
            ]))
            .await
            .unwrap();
        (gold, corn)
    }

    #[tokio::test]
    async fn index_names_the_service() {
        let (_, state) = empty_state();
        let (status, body) = call(app(state), "GET", "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "cot-index");
    }

    #[tokio::test]
    async fn status_without_runs_is_all_null_and_zero() {
        let (_, state) = empty_state();
        let (status, body) = call(app(state), "GET", "/refresh/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!({
                "run_at": null,
                "rows_inserted": 0,
                "rows_updated": 0,
                "error": null
            })
        );
    }

    #[tokio::test]
    async fn refresh_run_reports_counts_and_logs_status() {
        let store = Arc::new(MemoryCotStore::new());
        let mut source = FakeSource::default();
        source.archives.insert(
            2020,
            archive(&[("GOLD", "2020-01-07", 30), ("GOLD", "2020-01-14", 40)]),
        );
        let app = app(state_with(Arc::clone(&store), source));

        let (status, body) = call(app.clone(), "POST", "/refresh/run?mode=year&year=2020").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["weekly_rows"], 2);
        assert_eq!(body["metric_rows"], 2);
        assert_eq!(body["errors"], serde_json::json!([]));

        let (_, run) = call(app.clone(), "GET", "/refresh/status").await;
        assert_eq!(run["rows_inserted"], 4);
        assert!(run["error"].is_null());
        assert!(run["run_at"].is_string());

        let (_, latest) = call(app, "GET", "/cot/latest").await;
        assert_eq!(latest.as_array().unwrap().len(), 1);
        assert_eq!(latest[0]["name"], "GOLD");
        assert_eq!(latest[0]["report_date"], "2020-01-14");
        assert_eq!(latest[0]["comm_index"], 100.0);
    }

    #[tokio::test]
    async fn failed_year_is_partial_but_still_200() {
        let (_, state) = empty_state();
        let (status, body) = call(app(state), "POST", "/refresh/run?mode=year&year=2015").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "partial");
        assert!(body["errors"][0].as_str().unwrap().starts_with("2015: "));
    }

    #[tokio::test]
    async fn malformed_refresh_queries_are_json_400s() {
        let (_, state) = empty_state();
        let app = app(state);
        for uri in [
            "/refresh/run?mode=year",
            "/refresh/run?mode=weekly",
            "/refresh/run?mode=year&year=abc",
            "/refresh/run?mode=year&year=9999",
        ] {
            let (status, body) = call(app.clone(), "POST", uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(body["error"].is_string(), "{uri}");
        }
    }

    #[tokio::test]
    async fn concurrent_refresh_gets_409() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut source = FakeSource {
            release: Some((Arc::clone(&started), Arc::clone(&release))),
            ..FakeSource::default()
        };
        source.archives.insert(2021, archive(&[("GOLD", "2021-03-02", 5)]));
        let app = app(state_with(Arc::new(MemoryCotStore::new()), source));

        let first = tokio::spawn(call(app.clone(), "POST", "/refresh/run?mode=year&year=2021"));
        started.notified().await;

        let (status, body) = call(app.clone(), "POST", "/refresh/run?mode=year&year=2021").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "a refresh is already running");

        release.notify_one();
        let (status, body) = first.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
    }

    #[tokio::test]
    async fn latest_returns_newest_row_per_contract_ordered_by_name() {
        let (store, state) = empty_state();
        seed(&store).await;
        let (status, body) = call(app(state), "GET", "/cot/latest").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "CORN");
        assert_eq!(rows[1]["name"], "GOLD");
        assert_eq!(rows[1]["report_date"], "2024-01-16");
        assert_eq!(rows[0]["sector"], "Unknown");
    }

    #[tokio::test]
    async fn range_is_inclusive_and_ascending() {
        let (store, state) = empty_state();
        let (gold, _) = seed(&store).await;
        let uri = format!("/cot/range?contract_id={gold}&from=2024-01-02&to=2024-01-09");
        let (status, body) = call(app(state), "GET", &uri).await;
        assert_eq!(status, StatusCode::OK);
        let dates = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["report_date"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(dates, vec!["2024-01-02", "2024-01-09"]);
    }

    #[tokio::test]
    async fn range_rejects_bad_parameters() {
        let (store, state) = empty_state();
        let (gold, _) = seed(&store).await;
        let app = app(state);
        for uri in [
            "/cot/range?from=2024-01-01&to=2024-02-01".to_string(),
            "/cot/range?contract_id=nope&from=2024-01-01&to=2024-02-01".to_string(),
            format!("/cot/range?contract_id={gold}&from=01/01/2024&to=2024-02-01"),
            format!("/cot/range?contract_id={gold}&from=2024-03-01&to=2024-02-01"),
            format!("/cot/range?contract_id={gold}&from=2024-01-01"),
        ] {
            let (status, body) = call(app.clone(), "GET", &uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn store_failures_surface_as_500_with_error() {
        let (store, state) = empty_state();
        store.fail_reads().await;
        let app = app(state);
        for uri in ["/cot/latest", "/refresh/status", "/cot/heatmap?date=2024-01-02"] {
            let (status, body) = call(app.clone(), "GET", uri).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{uri}");
            assert!(body["error"].as_str().unwrap().contains("unavailable"));
        }
    }

    #[tokio::test]
    async fn heatmap_lists_every_contract_on_a_date() {
        let (store, state) = empty_state();
        seed(&store).await;
        let (status, body) = call(app(state), "GET", "/cot/heatmap?date=2024-01-09").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["report_date"] == "2024-01-09"));
    }

    #[tokio::test]
    async fn extremes_filter_latest_rows_by_commercial_index() {
        let (store, state) = empty_state();
        seed(&store).await;
        let app = app(state);

        let (_, body) = call(app.clone(), "GET", "/cot/extremes").await;
        let names = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["name"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        // CORN's latest reading is 50, GOLD's is 99
        assert_eq!(names, vec!["GOLD"]);

        let (_, body) = call(app.clone(), "GET", "/cot/extremes?min=60&max=99").await;
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["name"], "CORN");

        let (status, _) = call(app, "GET", "/cot/extremes?min=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn contracts_are_listed_and_looked_up_by_name() {
        let (store, state) = empty_state();
        seed(&store).await;
        let app = app(state);

        let (_, all) = call(app.clone(), "GET", "/contracts").await;
        assert_eq!(all.as_array().unwrap().len(), 2);
        assert_eq!(all[0]["name"], "CORN");

        let (status, gold) = call(app.clone(), "GET", "/contracts/GOLD").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(gold["sector"], "Unknown");

        let (status, body) = call(app, "GET", "/contracts/PLATINUM").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }
}
