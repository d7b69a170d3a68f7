//!
//! Table store abstraction
//! -----------------------
//! Everything the service layer needs from the warehouse sits behind the
//! [`TableStore`] trait: parameterized SQL, table metadata, table lifecycle
//! and bulk row loading. The production backend is BigQuery over REST
//! ([`bigquery::BigQueryStore`]); tests substitute a scripted mock. Handlers
//! and the service layer never name a concrete backend.
//!
//! Identifiers interpolated into SQL are validated by the service layer
//! before any call lands here; month values and other user data travel as
//! named query parameters, never as SQL text.

use anyhow::Result;
use async_trait::async_trait;

pub mod bigquery;

/// Logical column type, the meet of what the warehouse schema reports and
/// what import coercion can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Bool,
    Timestamp,
    Text,
}

impl ColumnKind {
    /// Map a warehouse schema type name onto a logical kind. Unrecognized
    /// types degrade to [`ColumnKind::Text`] so listing never fails on an
    /// exotic column.
    pub fn from_warehouse_type(name: &str) -> ColumnKind {
        match name.to_ascii_uppercase().as_str() {
            "INTEGER" | "INT64" => ColumnKind::Integer,
            "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => ColumnKind::Float,
            "BOOLEAN" | "BOOL" => ColumnKind::Bool,
            "TIMESTAMP" | "DATETIME" | "DATE" => ColumnKind::Timestamp,
            _ => ColumnKind::Text,
        }
    }

    /// Canonical warehouse type name used when creating tables.
    pub fn warehouse_type(self) -> &'static str {
        match self {
            ColumnKind::Integer => "INT64",
            ColumnKind::Float => "FLOAT64",
            ColumnKind::Bool => "BOOL",
            ColumnKind::Timestamp => "TIMESTAMP",
            ColumnKind::Text => "STRING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> ColumnSchema {
        ColumnSchema { name: name.into(), kind }
    }
}

/// Ordered column list of a table. Order matters: import matches uploaded
/// headers against it and bulk loads send cells positionally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSchema>) -> TableSchema {
        TableSchema { columns }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Table metadata as reported by the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub schema: TableSchema,
    pub row_count: u64,
}

/// One typed cell bound for a bulk load.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    /// RFC 3339 text; the warehouse parses it on ingest.
    Timestamp(String),
    Text(String),
}

impl CellValue {
    /// JSON encoding used by the streaming-insert wire format. Non-finite
    /// floats have no JSON representation and become null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Null => serde_json::Value::Null,
            CellValue::Int(v) => serde_json::Value::from(*v),
            CellValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            CellValue::Bool(v) => serde_json::Value::from(*v),
            CellValue::Timestamp(v) | CellValue::Text(v) => serde_json::Value::from(v.clone()),
        }
    }
}

/// Write disposition for [`TableStore::load_rows`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace existing rows, then load.
    Truncate,
    /// Load after existing rows.
    Append,
}

/// Named query parameter. Month filters are the only parameterized values
/// today, so a string array is the only shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryParam {
    StringArray { name: String, values: Vec<String> },
}

impl QueryParam {
    pub fn string_array(name: impl Into<String>, values: Vec<String>) -> QueryParam {
        QueryParam::StringArray { name: name.into(), values }
    }
}

/// Result of [`TableStore::query`]: decoded rows for SELECTs, affected-row
/// count for DML, both for neither.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    /// Column names in projection order.
    pub columns: Vec<String>,
    /// One JSON object per row, keyed by column name.
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    /// DML affected-row count when the statement reports one.
    pub affected_rows: Option<u64>,
}

/// Warehouse operations the service layer is written against.
///
/// `table` arguments are fully qualified `project.dataset.table` ids that
/// have already passed identifier validation.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Execute one SQL statement with named parameters and wait for it to
    /// finish, following result pagination to the end.
    async fn query(&self, sql: &str, params: Vec<QueryParam>) -> Result<QueryOutput>;

    /// Schema and row count, or `None` when the table does not exist.
    async fn table_meta(&self, table: &str) -> Result<Option<TableMeta>>;

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.table_meta(table).await?.is_some())
    }

    /// Create an empty table with the given schema. Fails if it exists.
    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()>;

    /// Bulk-load rows whose cells are positional against `schema`. Returns
    /// the number of rows loaded.
    async fn load_rows(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: Vec<Vec<CellValue>>,
        mode: WriteMode,
    ) -> Result<u64>;

    /// Drop a table. Deleting a table that is already gone is not an error;
    /// cleanup paths rely on that.
    async fn delete_table(&self, table: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warehouse_type_names_round_trip_through_kind() {
        for kind in [
            ColumnKind::Integer,
            ColumnKind::Float,
            ColumnKind::Bool,
            ColumnKind::Timestamp,
            ColumnKind::Text,
        ] {
            assert_eq!(ColumnKind::from_warehouse_type(kind.warehouse_type()), kind);
        }
    }

    #[test]
    fn legacy_and_unknown_type_names_map_sensibly() {
        assert_eq!(ColumnKind::from_warehouse_type("INTEGER"), ColumnKind::Integer);
        assert_eq!(ColumnKind::from_warehouse_type("float"), ColumnKind::Float);
        assert_eq!(ColumnKind::from_warehouse_type("DATETIME"), ColumnKind::Timestamp);
        assert_eq!(ColumnKind::from_warehouse_type("GEOGRAPHY"), ColumnKind::Text);
    }

    #[test]
    fn non_finite_floats_encode_as_null() {
        assert_eq!(CellValue::Float(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(CellValue::Float(2.5).to_json(), serde_json::json!(2.5));
    }
}
