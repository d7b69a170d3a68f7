//!
//! BigQuery REST backend
//! ---------------------
//! [`TableStore`] implementation over the BigQuery v2 REST API with a plain
//! reqwest client: `jobs.query` for SQL (with completion polling and result
//! pagination), `tables` get/insert/delete for lifecycle, and
//! `tabledata.insertAll` for bulk loads. Authentication is a bearer token,
//! either supplied up front or fetched and cached from the GCE metadata
//! server.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{
    CellValue, ColumnKind, ColumnSchema, QueryOutput, QueryParam, TableMeta, TableSchema,
    TableStore, WriteMode,
};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Rows per insertAll request, well under the API's request-size cap.
const INSERT_BATCH_ROWS: usize = 500;

/// Server-side wait per query/result call before it returns incomplete.
const QUERY_WAIT_MS: u64 = 10_000;

/// Refresh metadata tokens this long before they would expire.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

enum TokenSource {
    Fixed(String),
    Metadata(Mutex<Option<CachedToken>>),
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct BigQueryStore {
    http: reqwest::Client,
    endpoint: String,
    project: String,
    location: Option<String>,
    token: TokenSource,
}

impl BigQueryStore {
    /// Build a store for `project`. `endpoint` is the API base (overridable
    /// for tests), `fixed_token` skips the metadata server when present.
    pub fn new(
        project: &str,
        endpoint: &str,
        location: Option<String>,
        fixed_token: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build warehouse HTTP client")?;
        let token = match fixed_token {
            Some(value) => TokenSource::Fixed(value),
            None => TokenSource::Metadata(Mutex::new(None)),
        };
        Ok(BigQueryStore {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            project: project.to_string(),
            location,
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    async fn access_token(&self) -> Result<String> {
        match &self.token {
            TokenSource::Fixed(value) => Ok(value.clone()),
            TokenSource::Metadata(cached) => {
                let mut slot = cached.lock().await;
                if let Some(tok) = slot.as_ref() {
                    if tok.expires_at > Instant::now() + TOKEN_SLACK {
                        return Ok(tok.value.clone());
                    }
                }
                let resp = self
                    .http
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .context("metadata token request failed")?;
                if !resp.status().is_success() {
                    bail!("metadata token request failed: HTTP {}", resp.status());
                }
                let body: Value = resp.json().await.context("metadata token response was not JSON")?;
                let value = body
                    .get("access_token")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("metadata token response missing access_token"))?
                    .to_string();
                let expires_in = body.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(300);
                *slot = Some(CachedToken {
                    value: value.clone(),
                    expires_at: Instant::now() + Duration::from_secs(expires_in),
                });
                Ok(value)
            }
        }
    }

    /// Turn a non-2xx response into an error carrying the API's message.
    async fn api_error(resp: reqwest::Response, what: &str) -> anyhow::Error {
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or_else(|_| json!({}));
        let message = body
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .unwrap_or("no error detail");
        anyhow!("{} failed: HTTP {}: {}", what, status, message)
    }
}

fn split_table_id(table: &str) -> Result<(&str, &str, &str)> {
    let mut parts = table.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(p), Some(d), Some(t)) if !p.is_empty() && !d.is_empty() && !t.is_empty() => {
            Ok((p, d, t))
        }
        _ => bail!("table id `{}` is not fully qualified", table),
    }
}

fn encode_param(param: &QueryParam) -> Value {
    match param {
        QueryParam::StringArray { name, values } => json!({
            "name": name,
            "parameterType": { "type": "ARRAY", "arrayType": { "type": "STRING" } },
            "parameterValue": {
                "arrayValues": values.iter().map(|v| json!({ "value": v })).collect::<Vec<Value>>(),
            },
        }),
    }
}

/// Column (name, API type) pairs from a query response schema.
fn decode_fields(page: &Value) -> Vec<(String, String)> {
    page.pointer("/schema/fields")
        .and_then(|v| v.as_array())
        .map(|fields| {
            fields
                .iter()
                .map(|f| {
                    let name = f.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let kind = f.get("type").and_then(|v| v.as_str()).unwrap_or("STRING").to_string();
                    (name, kind)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Decode one `{"f":[{"v":..},..]}` row into an object keyed by column name.
fn decode_row(fields: &[(String, String)], row: &Value) -> serde_json::Map<String, Value> {
    let cells = row.get("f").and_then(|v| v.as_array());
    let mut out = serde_json::Map::new();
    for (idx, (name, kind)) in fields.iter().enumerate() {
        let raw = cells
            .and_then(|c| c.get(idx))
            .and_then(|c| c.get("v"))
            .cloned()
            .unwrap_or(Value::Null);
        out.insert(name.clone(), decode_cell(kind, &raw));
    }
    out
}

/// The API returns every scalar as a string; re-type the ones we know.
fn decode_cell(kind: &str, raw: &Value) -> Value {
    let Some(text) = raw.as_str() else {
        return raw.clone();
    };
    match kind.to_ascii_uppercase().as_str() {
        "INTEGER" | "INT64" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(text)),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(text)),
        "BOOLEAN" | "BOOL" => Value::from(text.eq_ignore_ascii_case("true")),
        "TIMESTAMP" => Value::from(format_epoch_timestamp(text)),
        _ => Value::from(text),
    }
}

/// Timestamps arrive as epoch seconds (possibly scientific notation, with a
/// fraction); render RFC 3339. Unparseable text passes through.
fn format_epoch_timestamp(text: &str) -> String {
    let Ok(epoch) = text.parse::<f64>() else {
        return text.to_string();
    };
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - epoch.floor()) * 1e9).round() as u32;
    match DateTime::from_timestamp(secs, nanos) {
        Some(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        None => text.to_string(),
    }
}

#[async_trait]
impl TableStore for BigQueryStore {
    async fn query(&self, sql: &str, params: Vec<QueryParam>) -> Result<QueryOutput> {
        let token = self.access_token().await?;
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": QUERY_WAIT_MS,
        });
        if let Some(loc) = &self.location {
            body["location"] = json!(loc);
        }
        if !params.is_empty() {
            body["parameterMode"] = json!("NAMED");
            body["queryParameters"] = Value::Array(params.iter().map(encode_param).collect());
        }
        tracing::debug!("warehouse query: {}", sql);
        let url = self.url(&format!("projects/{}/queries", self.project));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .context("warehouse query request failed")?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp, "warehouse query").await);
        }
        let mut page: Value = resp.json().await.context("warehouse query response was not JSON")?;

        let mut out = QueryOutput::default();
        let mut fields: Vec<(String, String)> = Vec::new();
        loop {
            if fields.is_empty() {
                fields = decode_fields(&page);
                out.columns = fields.iter().map(|(n, _)| n.clone()).collect();
            }
            let complete = page.get("jobComplete").and_then(|v| v.as_bool()).unwrap_or(true);
            if complete {
                if let Some(rows) = page.get("rows").and_then(|v| v.as_array()) {
                    for row in rows {
                        out.rows.push(decode_row(&fields, row));
                    }
                }
                if let Some(n) = page.get("numDmlAffectedRows").and_then(|v| v.as_str()) {
                    out.affected_rows = n.parse::<u64>().ok();
                }
            }
            let page_token = page.get("pageToken").and_then(|v| v.as_str()).map(str::to_string);
            if complete && page_token.is_none() {
                break;
            }
            // Job still running, or more result pages to pull.
            let job_id = page
                .pointer("/jobReference/jobId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("warehouse query response missing job id"))?
                .to_string();
            let job_location = page
                .pointer("/jobReference/location")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let mut query: Vec<(String, String)> =
                vec![("timeoutMs".to_string(), QUERY_WAIT_MS.to_string())];
            if let Some(loc) = job_location.or_else(|| self.location.clone()) {
                query.push(("location".to_string(), loc));
            }
            if let Some(tok) = page_token {
                query.push(("pageToken".to_string(), tok));
            }
            let url = self.url(&format!("projects/{}/queries/{}", self.project, job_id));
            let resp = self
                .http
                .get(&url)
                .query(&query)
                .bearer_auth(&token)
                .send()
                .await
                .context("warehouse result fetch failed")?;
            if !resp.status().is_success() {
                return Err(Self::api_error(resp, "warehouse result fetch").await);
            }
            page = resp.json().await.context("warehouse result page was not JSON")?;
        }
        Ok(out)
    }

    async fn table_meta(&self, table: &str) -> Result<Option<TableMeta>> {
        let (project, dataset, name) = split_table_id(table)?;
        let token = self.access_token().await?;
        let url = self.url(&format!("projects/{}/datasets/{}/tables/{}", project, dataset, name));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .context("table metadata request failed")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::api_error(resp, "table metadata").await);
        }
        let body: Value = resp.json().await.context("table metadata response was not JSON")?;
        let columns: Vec<ColumnSchema> = body
            .pointer("/schema/fields")
            .and_then(|v| v.as_array())
            .map(|fields| {
                fields
                    .iter()
                    .map(|f| {
                        ColumnSchema::new(
                            f.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                            ColumnKind::from_warehouse_type(
                                f.get("type").and_then(|v| v.as_str()).unwrap_or("STRING"),
                            ),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        let row_count = body
            .get("numRows")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok(Some(TableMeta { schema: TableSchema::new(columns), row_count }))
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        let (project, dataset, name) = split_table_id(table)?;
        let token = self.access_token().await?;
        let fields: Vec<Value> = schema
            .columns
            .iter()
            .map(|c| json!({ "name": c.name, "type": c.kind.warehouse_type() }))
            .collect();
        let body = json!({
            "tableReference": { "projectId": project, "datasetId": dataset, "tableId": name },
            "schema": { "fields": fields },
        });
        let url = self.url(&format!("projects/{}/datasets/{}/tables", project, dataset));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .context("table create request failed")?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp, "table create").await);
        }
        Ok(())
    }

    async fn load_rows(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: Vec<Vec<CellValue>>,
        mode: WriteMode,
    ) -> Result<u64> {
        if mode == WriteMode::Truncate {
            self.query(&format!("TRUNCATE TABLE `{}`", table), Vec::new()).await?;
        }
        let (project, dataset, name) = split_table_id(table)?;
        let token = self.access_token().await?;
        let url = self.url(&format!(
            "projects/{}/datasets/{}/tables/{}/insertAll",
            project, dataset, name
        ));
        let names = schema.column_names();
        let mut loaded = 0u64;
        for batch in rows.chunks(INSERT_BATCH_ROWS) {
            let encoded: Vec<Value> = batch
                .iter()
                .map(|row| {
                    let mut obj = serde_json::Map::new();
                    for (name, cell) in names.iter().zip(row) {
                        obj.insert(name.clone(), cell.to_json());
                    }
                    json!({ "json": Value::Object(obj) })
                })
                .collect();
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&token)
                .json(&json!({ "rows": encoded }))
                .send()
                .await
                .context("row load request failed")?;
            if !resp.status().is_success() {
                return Err(Self::api_error(resp, "row load").await);
            }
            let body: Value = resp.json().await.context("row load response was not JSON")?;
            if let Some(errors) = body.get("insertErrors").and_then(|v| v.as_array()) {
                if !errors.is_empty() {
                    let detail = errors[0]
                        .pointer("/errors/0/message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown insert error");
                    bail!("row load rejected {} row(s): {}", errors.len(), detail);
                }
            }
            loaded += batch.len() as u64;
        }
        Ok(loaded)
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        let (project, dataset, name) = split_table_id(table)?;
        let token = self.access_token().await?;
        let url = self.url(&format!("projects/{}/datasets/{}/tables/{}", project, dataset, name));
        let resp = self
            .http
            .delete(&url)
            .bearer_auth(&token)
            .send()
            .await
            .context("table delete request failed")?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::api_error(resp, "table delete").await)
    }
}
