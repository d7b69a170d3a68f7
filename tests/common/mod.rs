// Shared test doubles: a scripted in-memory TableStore plus builders for the
// fixtures the service and HTTP tests feed it.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use tablero::config::{FamilySettings, Settings, DEFAULT_API_ENDPOINT};
use tablero::store::{
    CellValue, ColumnKind, ColumnSchema, QueryOutput, QueryParam, TableMeta, TableSchema,
    TableStore, WriteMode,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

/// In-memory [`TableStore`] that records every call. SQL responses are
/// scripted in order with `push_query_result`/`push_query_error`;
/// unscripted queries return an empty result. Table lifecycle calls operate
/// on a live map so existence checks behave like the real backend.
#[derive(Default)]
pub struct MockStore {
    tables: Mutex<HashMap<String, TableMeta>>,
    query_plan: Mutex<VecDeque<Result<QueryOutput, String>>>,
    queries: Mutex<Vec<RecordedQuery>>,
    ops: Mutex<Vec<String>>,
}

impl MockStore {
    pub fn new() -> MockStore {
        MockStore::default()
    }

    pub fn with_table(self, table: &str, meta: TableMeta) -> MockStore {
        self.tables.lock().unwrap().insert(table.to_string(), meta);
        self
    }

    pub fn push_query_result(&self, output: QueryOutput) {
        self.query_plan.lock().unwrap().push_back(Ok(output));
    }

    pub fn push_query_error(&self, message: &str) {
        self.query_plan.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn recorded_queries(&self) -> Vec<RecordedQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub fn recorded_ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn record_op(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl TableStore for MockStore {
    async fn query(&self, sql: &str, params: Vec<QueryParam>) -> anyhow::Result<QueryOutput> {
        self.queries.lock().unwrap().push(RecordedQuery { sql: sql.to_string(), params });
        match self.query_plan.lock().unwrap().pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(QueryOutput::default()),
        }
    }

    async fn table_meta(&self, table: &str) -> anyhow::Result<Option<TableMeta>> {
        self.record_op(format!("meta {}", table));
        Ok(self.tables.lock().unwrap().get(table).cloned())
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> anyhow::Result<()> {
        self.record_op(format!("create {}", table));
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(table) {
            anyhow::bail!("table {} already exists", table);
        }
        tables.insert(table.to_string(), TableMeta { schema: schema.clone(), row_count: 0 });
        Ok(())
    }

    async fn load_rows(
        &self,
        table: &str,
        _schema: &TableSchema,
        rows: Vec<Vec<CellValue>>,
        mode: WriteMode,
    ) -> anyhow::Result<u64> {
        let disposition = match mode {
            WriteMode::Truncate => "truncate",
            WriteMode::Append => "append",
        };
        self.record_op(format!("load {} {} {}", table, disposition, rows.len()));
        if !self.tables.lock().unwrap().contains_key(table) {
            anyhow::bail!("table {} does not exist", table);
        }
        Ok(rows.len() as u64)
    }

    async fn delete_table(&self, table: &str) -> anyhow::Result<()> {
        self.record_op(format!("drop {}", table));
        self.tables.lock().unwrap().remove(table);
        Ok(())
    }
}

pub fn schema_of(columns: &[(&str, ColumnKind)]) -> TableSchema {
    TableSchema::new(
        columns.iter().map(|(name, kind)| ColumnSchema::new(*name, *kind)).collect(),
    )
}

pub fn meta_of(schema: TableSchema, row_count: u64) -> TableMeta {
    TableMeta { schema, row_count }
}

/// A month-listing result: one `month_value` column with the given values.
pub fn months_output(values: &[&str]) -> QueryOutput {
    let mut output = QueryOutput {
        columns: vec!["month_value".to_string()],
        ..QueryOutput::default()
    };
    for value in values {
        let mut row = serde_json::Map::new();
        row.insert("month_value".to_string(), serde_json::Value::from(*value));
        output.rows.push(row);
    }
    output
}

/// A DML result reporting `affected` rows.
pub fn dml_output(affected: u64) -> QueryOutput {
    QueryOutput { affected_rows: Some(affected), ..QueryOutput::default() }
}

/// Settings pointing both families at the `proj.analytics` dataset with the
/// default table and column names.
pub fn test_settings() -> Settings {
    Settings {
        app_password: Some("secret".to_string()),
        gcp_project_id: Some("proj".to_string()),
        bigquery_location: None,
        bigquery_access_token: Some("token".to_string()),
        bigquery_api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
        http_port: 0,
        instar: FamilySettings {
            project_id: None,
            dataset: "analytics".to_string(),
            table: "instar_historico".to_string(),
            month_column: "Mes_Anio".to_string(),
        },
        admedia: FamilySettings {
            project_id: None,
            dataset: "analytics".to_string(),
            table: "admedia_historico".to_string(),
            month_column: "Mes".to_string(),
        },
    }
}

/// Settings with no project anywhere, for config-error paths.
pub fn unconfigured_settings() -> Settings {
    let mut settings = test_settings();
    settings.gcp_project_id = None;
    settings
}
