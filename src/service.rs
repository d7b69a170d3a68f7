//!
//! Table operations facade
//! -----------------------
//! Domain layer between the HTTP handlers and the [`TableStore`]: resolves
//! which warehouse table a dataset family points at, normalizes month
//! filters, and issues the SQL for listing, deleting, appending, exporting
//! and importing month slices.
//!
//! SQL here is assembled from two kinds of input. Identifiers (fully
//! qualified table ids, schema column names) are interpolated into the
//! statement text, so every identifier passes an allow-list check first:
//! table ids through [`validate_table_reference`], export columns through a
//! membership check against the live schema. Values (month lists) are never
//! interpolated; they travel as named array parameters.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::config::Settings;
use crate::error::{ServiceError, ServiceResult};
use crate::months::{
    normalize_admedia_months, normalize_instar_months, sort_admedia_months, sort_instar_months,
};
use crate::store::{CellValue, ColumnKind, QueryParam, TableSchema, TableStore, WriteMode};

/// Fully qualified table id: project (hyphens allowed), dataset, table
/// (partition decorators allowed). Anything outside this never reaches SQL.
static TABLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9\-]+\.[A-Za-z0-9_]+\.[A-Za-z0-9_$]+$").unwrap());

/// Bare table name for import staging tables.
static TEMP_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// The two table families the service administers. Also the path segment
/// used to pick one over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFamily {
    Instar,
    Admedia,
}

impl DatasetFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetFamily::Instar => "instar",
            DatasetFamily::Admedia => "admedia",
        }
    }

    /// Family-specific month normalization for filter values.
    fn normalize_months(self, months: &[String]) -> Vec<String> {
        match self {
            DatasetFamily::Instar => normalize_instar_months(months),
            DatasetFamily::Admedia => normalize_admedia_months(months),
        }
    }
}

/// Resolved location of one family's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    pub project_id: String,
    pub dataset: String,
    pub table: String,
    pub month_column: String,
}

impl TableConfig {
    pub fn fq_table(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub table: String,
    pub row_count: u64,
}

/// Result of an export query: header order plus rows keyed by column name.
#[derive(Debug, Clone, Default)]
pub struct ExportData {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Destination the rows landed in.
    pub table_name: String,
    pub temp_table: String,
    pub rows_imported: u64,
}

/// Check a user-supplied table reference against the identifier allow-list
/// and return it trimmed.
pub fn validate_table_reference(table: &str) -> ServiceResult<String> {
    let candidate = table.trim();
    if !TABLE_PATTERN.is_match(candidate) {
        return Err(ServiceError::validation(
            "table names must be fully qualified (project.dataset.table) and may only contain \
             alphanumeric, '_', '-' or '$' characters",
        ));
    }
    Ok(candidate.to_string())
}

pub struct TableService {
    store: Arc<dyn TableStore>,
    settings: Settings,
}

impl TableService {
    pub fn new(store: Arc<dyn TableStore>, settings: Settings) -> TableService {
        TableService { store, settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Resolve where a family's table lives. Fails with a config error when
    /// neither the family override nor the global project id is set.
    pub fn table_config(&self, family: DatasetFamily) -> ServiceResult<TableConfig> {
        let fam = match family {
            DatasetFamily::Instar => &self.settings.instar,
            DatasetFamily::Admedia => &self.settings.admedia,
        };
        let project_id = fam
            .project_id
            .clone()
            .or_else(|| self.settings.gcp_project_id.clone())
            .ok_or_else(|| {
                ServiceError::config(
                    "warehouse project id is not configured; set GCP_PROJECT_ID or a \
                     dataset-specific project id",
                )
            })?;
        Ok(TableConfig {
            project_id,
            dataset: fam.dataset.clone(),
            table: fam.table.clone(),
            month_column: fam.month_column.clone(),
        })
    }

    /// `project.dataset.` prefix users complete with a bare table name.
    pub fn table_prefix(&self) -> ServiceResult<String> {
        let config = self.table_config(DatasetFamily::Instar)?;
        Ok(format!("{}.{}.", config.project_id, config.dataset))
    }

    /// Distinct month values of a family's table, normalized to the family's
    /// stored form and sorted chronologically.
    pub async fn fetch_months(&self, family: DatasetFamily) -> ServiceResult<Vec<String>> {
        let config = self.table_config(family)?;
        let fq = config.fq_table();
        let sql = format!(
            "SELECT DISTINCT {col} AS month_value FROM `{fq}` WHERE {col} IS NOT NULL",
            col = config.month_column,
            fq = fq,
        );
        let output = self
            .store
            .query(&sql, Vec::new())
            .await
            .map_err(|e| ServiceError::store(format!("error fetching months for {}: {:#}", fq, e)))?;

        let mut values: Vec<String> = Vec::new();
        for row in &output.rows {
            match row.get("month_value") {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) => values.push(s.clone()),
                // Instar months are labels by definition; anything non-text
                // in an admedia column still gets its text rendering.
                Some(other) => {
                    if family == DatasetFamily::Admedia {
                        values.push(other.to_string());
                    }
                }
            }
        }
        Ok(match family {
            DatasetFamily::Instar => sort_instar_months(values),
            DatasetFamily::Admedia => sort_admedia_months(normalize_admedia_months(&values)),
        })
    }

    /// Delete the given months from a family's table; returns the number of
    /// rows removed. An empty normalized set is a no-op that never touches
    /// the warehouse.
    pub async fn delete_months(&self, family: DatasetFamily, months: &[String]) -> ServiceResult<u64> {
        let config = self.table_config(family)?;
        let normalized = family.normalize_months(months);
        if normalized.is_empty() {
            return Ok(0);
        }
        let fq = config.fq_table();
        let sql = format!(
            "DELETE FROM `{}` WHERE {} IN UNNEST(@months)",
            fq, config.month_column
        );
        let output = self
            .store
            .query(&sql, vec![QueryParam::string_array("months", normalized)])
            .await
            .map_err(|e| {
                ServiceError::store(format!("error deleting months from {}: {:#}", fq, e))
            })?;
        Ok(output.affected_rows.unwrap_or(0))
    }

    /// Copy rows from `source_table` into `destination_table`, optionally
    /// restricted to a month set. Returns the number of rows appended.
    pub async fn append_rows(
        &self,
        family: DatasetFamily,
        source_table: &str,
        destination_table: &str,
        months: &[String],
    ) -> ServiceResult<u64> {
        let source = validate_table_reference(source_table)?;
        let destination = validate_table_reference(destination_table)?;
        let config = self.table_config(family)?;

        let normalized = family.normalize_months(months);
        let mut params = Vec::new();
        let mut where_clause = String::new();
        if !normalized.is_empty() {
            where_clause = format!(" WHERE {} IN UNNEST(@months)", config.month_column);
            params.push(QueryParam::string_array("months", normalized));
        }
        let sql = format!(
            "INSERT INTO `{}` SELECT * FROM `{}`{}",
            destination, source, where_clause
        );
        let output = self.store.query(&sql, params).await.map_err(|e| {
            ServiceError::store(format!(
                "error appending rows from {} to {}: {:#}",
                source, destination, e
            ))
        })?;
        Ok(output.affected_rows.unwrap_or(0))
    }

    pub async fn list_columns(&self, table: &str) -> ServiceResult<Vec<String>> {
        Ok(self.table_schema(table).await?.column_names())
    }

    /// Validated schema lookup; a missing table is an error here because
    /// callers need the columns to proceed.
    pub async fn table_schema(&self, table: &str) -> ServiceResult<TableSchema> {
        let candidate = validate_table_reference(table)?;
        match self.store.table_meta(&candidate).await {
            Ok(Some(meta)) => Ok(meta.schema),
            Ok(None) => Err(ServiceError::store(format!(
                "error fetching schema for {}: table not found",
                candidate
            ))),
            Err(e) => Err(ServiceError::store(format!(
                "error fetching schema for {}: {:#}",
                candidate, e
            ))),
        }
    }

    pub async fn get_table_info(&self, table: &str) -> ServiceResult<TableInfo> {
        let candidate = validate_table_reference(table)?;
        match self.store.table_meta(&candidate).await {
            Ok(Some(meta)) => Ok(TableInfo { table: candidate, row_count: meta.row_count }),
            Ok(None) => Err(ServiceError::store(format!(
                "table {} does not exist or is not accessible",
                candidate
            ))),
            Err(e) => Err(ServiceError::store(format!(
                "error inspecting table {}: {:#}",
                candidate, e
            ))),
        }
    }

    /// Run the export query for a family: selected columns (validated
    /// against the live schema) or all of them, rows filtered to the given
    /// months and ordered by the month column.
    pub async fn export_rows(
        &self,
        family: DatasetFamily,
        months: &[String],
        selected_columns: Option<&[String]>,
    ) -> ServiceResult<ExportData> {
        if months.is_empty() {
            return Err(ServiceError::validation("select at least one month to export"));
        }
        let config = self.table_config(family)?;
        let fq = config.fq_table();
        let normalized = family.normalize_months(months);
        let available = self.list_columns(&fq).await?;

        let (column_clause, columns) = match selected_columns {
            Some(selected) if !selected.is_empty() => {
                let invalid: Vec<&str> = selected
                    .iter()
                    .filter(|c| !available.contains(c))
                    .map(|c| c.as_str())
                    .collect();
                if !invalid.is_empty() {
                    return Err(ServiceError::validation(format!(
                        "invalid columns requested: {}",
                        invalid.join(", ")
                    )));
                }
                let clause = selected
                    .iter()
                    .map(|c| format!("`{}`", c))
                    .collect::<Vec<_>>()
                    .join(", ");
                (clause, selected.to_vec())
            }
            _ => ("*".to_string(), available),
        };

        let sql = format!(
            "SELECT {} FROM `{}` WHERE {col} IN UNNEST(@months) ORDER BY {col}",
            column_clause,
            fq,
            col = config.month_column,
        );
        let output = self
            .store
            .query(&sql, vec![QueryParam::string_array("months", normalized)])
            .await
            .map_err(|e| {
                ServiceError::store(format!("error exporting rows from {}: {:#}", fq, e))
            })?;
        Ok(ExportData { columns, rows: output.rows })
    }

    /// Import delimited rows into the instar table through a staging table:
    /// validate the staging name, match the upload's header against the
    /// destination schema, coerce cells to column types, load into a fresh
    /// staging table and copy across. The staging table is dropped on every
    /// path after it is created.
    pub async fn import_instar_rows(
        &self,
        table_name: &str,
        data: &[u8],
    ) -> ServiceResult<ImportOutcome> {
        let sanitized = table_name.trim();
        if sanitized.is_empty() {
            return Err(ServiceError::validation("enter a name for the temporary table"));
        }
        if !TEMP_NAME_PATTERN.is_match(sanitized) {
            return Err(ServiceError::validation(
                "table names may only contain letters, numbers and underscores",
            ));
        }
        if data.is_empty() {
            return Err(ServiceError::validation("uploaded file is empty"));
        }

        let (headers, records) = parse_csv_upload(data)?;
        if records.is_empty() {
            return Err(ServiceError::validation("file contains no data rows"));
        }

        let config = self.table_config(DatasetFamily::Instar)?;
        let fq = config.fq_table();
        let schema = self.table_schema(&fq).await?;
        let expected = schema.column_names();

        let missing: Vec<&str> = expected
            .iter()
            .filter(|c| !headers.contains(c))
            .map(|c| c.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(ServiceError::validation(format!(
                "missing required columns: {}",
                missing.join(", ")
            )));
        }
        let extra: Vec<&str> = headers
            .iter()
            .filter(|c| !expected.contains(c))
            .map(|c| c.as_str())
            .collect();
        if !extra.is_empty() {
            return Err(ServiceError::validation(format!(
                "unrecognized columns in file: {}",
                extra.join(", ")
            )));
        }

        // Reorder every record into schema order while coercing cells.
        let positions: Vec<usize> = expected
            .iter()
            .map(|name| headers.iter().position(|h| h == name).unwrap_or(0))
            .collect();
        let mut rows: Vec<Vec<CellValue>> = Vec::with_capacity(records.len());
        for record in &records {
            let mut cells = Vec::with_capacity(schema.columns.len());
            for (column, pos) in schema.columns.iter().zip(&positions) {
                let raw = record.get(*pos).unwrap_or("");
                cells.push(coerce_cell(column.kind, raw, &column.name)?);
            }
            rows.push(cells);
        }

        let temp = format!("{}.{}.{}", config.project_id, config.dataset, sanitized);
        let exists = self.store.table_exists(&temp).await.map_err(|e| {
            ServiceError::store(format!("error inspecting table {}: {:#}", temp, e))
        })?;
        if exists {
            return Err(ServiceError::validation(format!(
                "a table named {} already exists in the dataset",
                sanitized
            )));
        }

        self.store.create_table(&temp, &schema).await.map_err(|e| {
            ServiceError::validation(format!("error loading rows into the warehouse: {:#}", e))
        })?;

        let outcome = self.load_and_merge(&temp, &fq, &schema, rows).await;
        if let Err(err) = self.store.delete_table(&temp).await {
            tracing::warn!("failed to drop temporary table {}: {:#}", temp, err);
        }
        let rows_imported = outcome?;
        Ok(ImportOutcome { table_name: fq, temp_table: temp, rows_imported })
    }

    async fn load_and_merge(
        &self,
        temp: &str,
        destination: &str,
        schema: &TableSchema,
        rows: Vec<Vec<CellValue>>,
    ) -> ServiceResult<u64> {
        self.store
            .load_rows(temp, schema, rows, WriteMode::Truncate)
            .await
            .map_err(|e| {
                ServiceError::validation(format!("error loading rows into the warehouse: {:#}", e))
            })?;
        // Failures here surface as client errors: the uploaded data is what
        // usually breaks the copy.
        self.append_rows(DatasetFamily::Instar, temp, destination, &[])
            .await
            .map_err(|err| ServiceError::validation(err.message().to_string()))
    }
}

/// Headers (trimmed) and data records of an uploaded delimited file.
fn parse_csv_upload(data: &[u8]) -> ServiceResult<(Vec<String>, Vec<csv::StringRecord>)> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_reader(data);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ServiceError::validation(format!("could not parse the file as CSV: {}", e)))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| {
            ServiceError::validation(format!("could not parse the file as CSV: {}", e))
        })?;
        records.push(record);
    }
    Ok((headers, records))
}

/// Coerce one text cell to its column type. Blank cells are null. Numbers
/// and timestamps that fail to parse degrade to null; a numeric value with a
/// fraction in an integer column, or an unrecognized boolean token, is a
/// hard error naming the column.
fn coerce_cell(kind: ColumnKind, raw: &str, column: &str) -> ServiceResult<CellValue> {
    let text = raw.trim();
    if text.is_empty() {
        return Ok(CellValue::Null);
    }
    match kind {
        ColumnKind::Integer => {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(CellValue::Int(n));
            }
            match text.parse::<f64>() {
                Ok(num) if num.is_nan() => Ok(CellValue::Null),
                Ok(num) if num.is_finite() && num.fract() == 0.0 => Ok(CellValue::Int(num as i64)),
                Ok(_) => Err(ServiceError::validation(format!(
                    "column {} contains non-integer values",
                    column
                ))),
                Err(_) => Ok(CellValue::Null),
            }
        }
        ColumnKind::Float => {
            Ok(text.parse::<f64>().map(CellValue::Float).unwrap_or(CellValue::Null))
        }
        ColumnKind::Bool => match text.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(CellValue::Bool(true)),
            "false" | "f" | "0" => Ok(CellValue::Bool(false)),
            _ => Err(ServiceError::validation(format!(
                "column {} contains unrecognized boolean values",
                column
            ))),
        },
        ColumnKind::Timestamp => Ok(parse_timestamp(text)
            .map(CellValue::Timestamp)
            .unwrap_or(CellValue::Null)),
        ColumnKind::Text => Ok(CellValue::Text(raw.to_string())),
    }
}

/// Accept the date shapes that show up in uploads and render RFC 3339.
fn parse_timestamp(text: &str) -> Option<String> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::AutoSi, true));
    }
    const DATETIME_FORMATS: [&str; 3] =
        ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%d/%m/%Y %H:%M:%S"];
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true));
        }
    }
    const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%Y"];
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            let midnight = date.and_hms_opt(0, 0, 0)?;
            return Some(midnight.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true));
        }
    }
    None
}
