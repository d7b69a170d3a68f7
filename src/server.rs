//!
//! tablero HTTP server
//! -------------------
//! Axum-based JSON API over the table operations facade.
//!
//! Surface:
//! - `POST /api/login` password check
//! - `GET /api/{dataset}/meses` month listing per family
//! - `DELETE /api/{dataset}` month deletion
//! - `POST /api/{dataset}/append` table-to-table copy
//! - `GET /api/table/prefix`, `POST /api/table/info` table helpers
//! - `POST /api/instar/import` CSV upload through a staging table
//! - `POST /api/export` CSV download of selected months
//!
//! Handlers stay thin: payload checks that belong to the HTTP contract
//! (month-count bounds, column-selection shape, multipart plumbing) happen
//! here; everything else is [`TableService`]. Errors render through
//! [`ServiceError`]'s `IntoResponse` as `{"error": ...}` with the mapped
//! status.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::config::Settings;
use crate::error::{ServiceError, ServiceResult};
use crate::service::{DatasetFamily, TableService};
use crate::store::bigquery::BigQueryStore;

/// Content types accepted for the import upload. Browsers disagree on what
/// a .csv is, so the legacy Excel type and the generic fallback stay in.
const CSV_CONTENT_TYPES: [&str; 4] = [
    "text/csv",
    "application/csv",
    "application/vnd.ms-excel",
    "application/octet-stream",
];

/// Export downloads are capped to a few months; import uploads are not, so
/// give multipart bodies more room than the axum default.
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TableService>,
}

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

#[derive(Deserialize)]
struct DeleteMonthsRequest {
    months: Vec<String>,
}

#[derive(Deserialize)]
struct AppendRequest {
    source_table: String,
    destination_table: String,
    #[serde(default)]
    months: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TableInfoRequest {
    table: String,
}

#[derive(Deserialize)]
struct ExportRequest {
    source: DatasetFamily,
    months: Vec<String>,
    #[serde(default = "default_true")]
    include_all_columns: bool,
    #[serde(default)]
    columns: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// Build the router. Split out from [`run`] so tests can serve it on an
/// ephemeral port against a mock store.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "tablero ok" }))
        .route("/api/login", post(login))
        .route("/api/{dataset}/meses", get(list_months))
        .route("/api/{dataset}", delete(delete_months))
        .route("/api/{dataset}/append", post(append_rows))
        .route("/api/table/prefix", get(table_prefix))
        .route("/api/table/info", post(table_info))
        .route("/api/instar/import", post(import_instar))
        .route("/api/export", post(export_data))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Wire the production store from settings and serve until shutdown.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let http_port = settings.http_port;
    // The job project is where queries run; table addressing may still
    // override per family.
    let job_project = settings
        .gcp_project_id
        .clone()
        .or_else(|| settings.instar.project_id.clone())
        .or_else(|| settings.admedia.project_id.clone())
        .context("no warehouse project configured; set GCP_PROJECT_ID")?;
    let store = BigQueryStore::new(
        &job_project,
        &settings.bigquery_api_endpoint,
        settings.bigquery_location.clone(),
        settings.bigquery_access_token.clone(),
    )
    .context("while building the warehouse client")?;
    let service = TableService::new(Arc::new(store), settings);
    run_with_service(Arc::new(service), http_port).await
}

pub async fn run_with_service(service: Arc<TableService>, http_port: u16) -> anyhow::Result<()> {
    log_table_targets(&service);
    let app = app(AppState { service });
    let addr: SocketAddr = format!("0.0.0.0:{}", http_port).parse()?;
    info!("starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Log where each family resolves so a misconfigured deployment is visible
/// before the first request.
fn log_table_targets(service: &TableService) {
    for family in [DatasetFamily::Instar, DatasetFamily::Admedia] {
        match service.table_config(family) {
            Ok(config) => info!(
                target: "startup",
                "{} table: {} (month column {})",
                family.as_str(),
                config.fq_table(),
                config.month_column
            ),
            Err(e) => tracing::warn!(target: "startup", "{} table not resolvable: {}", family.as_str(), e),
        }
    }
}

async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> impl IntoResponse {
    match state.service.settings().app_password.as_deref() {
        Some(expected) if expected == payload.password => {
            (StatusCode::OK, Json(json!({"authenticated": true})))
        }
        _ => (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid password"}))),
    }
}

async fn list_months(
    State(state): State<AppState>,
    Path(dataset): Path<DatasetFamily>,
) -> Result<Json<Value>, ServiceError> {
    let months = state.service.fetch_months(dataset).await?;
    Ok(Json(json!({"months": months})))
}

async fn delete_months(
    State(state): State<AppState>,
    Path(dataset): Path<DatasetFamily>,
    Json(payload): Json<DeleteMonthsRequest>,
) -> Result<Json<Value>, ServiceError> {
    if payload.months.is_empty() {
        return Err(ServiceError::validation("provide at least one month to delete"));
    }
    let deleted = state.service.delete_months(dataset, &payload.months).await?;
    Ok(Json(json!({"deleted": deleted, "months": payload.months})))
}

async fn append_rows(
    State(state): State<AppState>,
    Path(dataset): Path<DatasetFamily>,
    Json(payload): Json<AppendRequest>,
) -> Result<Json<Value>, ServiceError> {
    let months = payload.months.as_deref().unwrap_or(&[]);
    let rows_appended = state
        .service
        .append_rows(dataset, &payload.source_table, &payload.destination_table, months)
        .await?;
    Ok(Json(json!({
        "rows_appended": rows_appended,
        "source_table": payload.source_table,
        "destination_table": payload.destination_table,
        "months": payload.months,
    })))
}

async fn table_prefix(State(state): State<AppState>) -> Result<Json<Value>, ServiceError> {
    let prefix = state.service.table_prefix()?;
    Ok(Json(json!({"prefix": prefix})))
}

async fn table_info(
    State(state): State<AppState>,
    Json(payload): Json<TableInfoRequest>,
) -> Result<Json<Value>, ServiceError> {
    let info = state.service.get_table_info(&payload.table).await?;
    Ok(Json(json!({"table": info.table, "row_count": info.row_count})))
}

fn bad_multipart(e: MultipartError) -> ServiceError {
    ServiceError::validation(format!("invalid multipart upload: {}", e))
}

async fn import_instar(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ServiceError> {
    let mut table_name: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("table_name") => {
                table_name = Some(field.text().await.map_err(bad_multipart)?);
            }
            Some("file") => {
                if let Some(ct) = field.content_type() {
                    if !CSV_CONTENT_TYPES.contains(&ct) {
                        return Err(ServiceError::validation("upload a CSV file"));
                    }
                }
                file_bytes = Some(field.bytes().await.map_err(bad_multipart)?.to_vec());
            }
            _ => {}
        }
    }

    let table_name = table_name
        .ok_or_else(|| ServiceError::validation("enter a name for the temporary table"))?;
    let data = file_bytes.ok_or_else(|| ServiceError::validation("upload a CSV file"))?;

    let outcome = state.service.import_instar_rows(&table_name, &data).await?;
    Ok(Json(json!({
        "table_name": outcome.table_name,
        "temp_table": outcome.temp_table,
        "rows_imported": outcome.rows_imported,
    })))
}

async fn export_data(
    State(state): State<AppState>,
    Json(payload): Json<ExportRequest>,
) -> Result<Response, ServiceError> {
    if payload.months.is_empty() || payload.months.len() > 3 {
        return Err(ServiceError::validation("select between one and three months to export"));
    }
    let has_columns = payload.columns.as_ref().map(|c| !c.is_empty()).unwrap_or(false);
    if !payload.include_all_columns && !has_columns {
        return Err(ServiceError::validation("select specific columns or export all of them"));
    }
    let selected = if payload.include_all_columns { None } else { payload.columns.as_deref() };

    let export = state
        .service
        .export_rows(payload.source, &payload.months, selected)
        .await?;
    let body = build_csv(&export.columns, &export.rows)?;

    let filename = format!(
        "{}_export_{}.csv",
        payload.source.as_str(),
        Utc::now().format("%Y%m%d%H%M%S")
    );
    let headers = [
        (header::CONTENT_TYPE, "text/csv".to_string()),
        (header::CONTENT_DISPOSITION, format!("attachment; filename={}", filename)),
    ];
    Ok((headers, body).into_response())
}

/// Assemble the export download: one header record, then each row's cells in
/// header order. Missing and null cells are empty fields.
fn build_csv(columns: &[String], rows: &[serde_json::Map<String, Value>]) -> ServiceResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(columns)
        .map_err(|e| ServiceError::store(format!("error assembling export file: {}", e)))?;
    for row in rows {
        let record: Vec<String> = columns.iter().map(|c| csv_cell(row.get(c))).collect();
        writer
            .write_record(&record)
            .map_err(|e| ServiceError::store(format!("error assembling export file: {}", e)))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ServiceError::store(format!("error assembling export file: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| ServiceError::store(format!("error assembling export file: {}", e)))
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_cells_render_scalars_and_blanks() {
        assert_eq!(csv_cell(None), "");
        assert_eq!(csv_cell(Some(&Value::Null)), "");
        assert_eq!(csv_cell(Some(&json!("Marzo/2024"))), "Marzo/2024");
        assert_eq!(csv_cell(Some(&json!(42))), "42");
        assert_eq!(csv_cell(Some(&json!(2.5))), "2.5");
        assert_eq!(csv_cell(Some(&json!(true))), "true");
    }

    #[test]
    fn export_csv_has_header_and_quotes_commas() {
        let columns = vec!["Mes_Anio".to_string(), "detalle".to_string()];
        let mut row = serde_json::Map::new();
        row.insert("Mes_Anio".to_string(), json!("Marzo/2024"));
        row.insert("detalle".to_string(), json!("a,b"));
        let csv = build_csv(&columns, &[row]).unwrap();
        assert_eq!(csv, "Mes_Anio,detalle\nMarzo/2024,\"a,b\"\n");
    }

    #[test]
    fn export_csv_fills_missing_cells() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let mut row = serde_json::Map::new();
        row.insert("a".to_string(), json!(1));
        let csv = build_csv(&columns, &[row]).unwrap();
        assert_eq!(csv, "a,b\n1,\n");
    }
}
