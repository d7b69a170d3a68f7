// End-to-end tests over a real socket: the axum router served on an
// ephemeral port with the scripted mock store behind it, driven by reqwest.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use common::{
    dml_output, meta_of, months_output, schema_of, test_settings, unconfigured_settings, MockStore,
};
use tablero::config::Settings;
use tablero::server::{app, AppState};
use tablero::service::TableService;
use tablero::store::{ColumnKind, QueryOutput};

const INSTAR_FQ: &str = "proj.analytics.instar_historico";

// Abort the server task when a test ends, pass or fail.
struct Guard(JoinHandle<()>);
impl Drop for Guard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn start_server_with(store: Arc<MockStore>, settings: Settings) -> (Guard, String) {
    let service = Arc::new(TableService::new(store, settings));
    let router = app(AppState { service });
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind 127.0.0.1:0");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            eprintln!("test server error: {e:?}");
        }
    });
    (Guard(handle), format!("http://{}", addr))
}

async fn start_server(store: Arc<MockStore>) -> (Guard, String) {
    start_server_with(store, test_settings()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_checks_the_configured_password() {
    let (_g, base) = start_server(Arc::new(MockStore::new())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/login", base))
        .json(&json!({"password": "secret"}))
        .send()
        .await
        .expect("login");
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body, json!({"authenticated": true}));

    let resp = client
        .post(format!("{}/api/login", base))
        .json(&json!({"password": "wrong"}))
        .send()
        .await
        .expect("login");
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "invalid password");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn month_listing_returns_sorted_labels() {
    let store = Arc::new(MockStore::new());
    store.push_query_result(months_output(&["Marzo/2024", "Enero/2024"]));
    let (_g, base) = start_server(store).await;

    let resp = reqwest::get(format!("{}/api/instar/meses", base)).await.expect("meses");
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body, json!({"months": ["Enero/2024", "Marzo/2024"]}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_dataset_segments_are_rejected() {
    let (_g, base) = start_server(Arc::new(MockStore::new())).await;

    let resp = reqwest::get(format!("{}/api/facebook/meses", base)).await.expect("meses");
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_requires_at_least_one_month() {
    let store = Arc::new(MockStore::new());
    let (_g, base) = start_server(store.clone()).await;
    let client = reqwest::Client::new();

    let resp = client
        .delete(format!("{}/api/instar", base))
        .json(&json!({"months": []}))
        .send()
        .await
        .expect("delete");
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "provide at least one month to delete");
    assert!(store.recorded_queries().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_reports_the_count_and_echoes_the_request() {
    let store = Arc::new(MockStore::new());
    store.push_query_result(dml_output(3));
    let (_g, base) = start_server(store).await;
    let client = reqwest::Client::new();

    let resp = client
        .delete(format!("{}/api/admedia", base))
        .json(&json!({"months": ["Mar/2024"]}))
        .send()
        .await
        .expect("delete");
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.expect("json");
    // The response echoes the months as requested, not normalized.
    assert_eq!(body, json!({"deleted": 3, "months": ["Mar/2024"]}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_round_trips_the_payload() {
    let store = Arc::new(MockStore::new());
    store.push_query_result(dml_output(7));
    let (_g, base) = start_server(store).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/instar/append", base))
        .json(&json!({
            "source_table": "proj.analytics.staging",
            "destination_table": INSTAR_FQ,
        }))
        .send()
        .await
        .expect("append");
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["rows_appended"], 7);
    assert_eq!(body["source_table"], "proj.analytics.staging");
    assert_eq!(body["months"], Value::Null);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn table_prefix_and_info_cover_the_helpers() {
    let schema = schema_of(&[("Mes_Anio", ColumnKind::Text)]);
    let store = Arc::new(MockStore::new().with_table(INSTAR_FQ, meta_of(schema, 42)));
    let (_g, base) = start_server(store).await;
    let client = reqwest::Client::new();

    let resp = reqwest::get(format!("{}/api/table/prefix", base)).await.expect("prefix");
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body, json!({"prefix": "proj.analytics."}));

    let resp = client
        .post(format!("{}/api/table/info", base))
        .json(&json!({"table": INSTAR_FQ}))
        .send()
        .await
        .expect("info");
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body, json!({"table": INSTAR_FQ, "row_count": 42}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn export_downloads_a_csv_attachment() {
    let schema = schema_of(&[("Mes_Anio", ColumnKind::Text), ("inversion", ColumnKind::Float)]);
    let store = Arc::new(MockStore::new().with_table(INSTAR_FQ, meta_of(schema, 10)));
    let mut row = serde_json::Map::new();
    row.insert("Mes_Anio".to_string(), Value::from("Marzo/2024"));
    row.insert("inversion".to_string(), Value::from(10.5));
    store.push_query_result(QueryOutput {
        columns: vec!["Mes_Anio".to_string(), "inversion".to_string()],
        rows: vec![row],
        ..Default::default()
    });
    let (_g, base) = start_server(store).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/export", base))
        .json(&json!({"source": "instar", "months": ["Marzo/2024"]}))
        .send()
        .await
        .expect("export");
    assert_eq!(resp.status().as_u16(), 200);
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert_eq!(content_type, "text/csv");
    let disposition = resp
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(disposition.starts_with("attachment; filename=instar_export_"));
    assert!(disposition.ends_with(".csv"));

    let body = resp.text().await.expect("body");
    assert_eq!(body, "Mes_Anio,inversion\nMarzo/2024,10.5\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn export_enforces_month_and_column_rules() {
    let (_g, base) = start_server(Arc::new(MockStore::new())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/export", base))
        .json(&json!({
            "source": "instar",
            "months": ["Enero/2024", "Febrero/2024", "Marzo/2024", "Abril/2024"],
        }))
        .send()
        .await
        .expect("export");
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "select between one and three months to export");

    let resp = client
        .post(format!("{}/api/export", base))
        .json(&json!({
            "source": "instar",
            "months": ["Enero/2024"],
            "include_all_columns": false,
            "columns": [],
        }))
        .send()
        .await
        .expect("export");
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "select specific columns or export all of them");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn import_uploads_csv_through_multipart() {
    let schema = schema_of(&[("n", ColumnKind::Integer), ("Mes_Anio", ColumnKind::Text)]);
    let store = Arc::new(MockStore::new().with_table(INSTAR_FQ, meta_of(schema, 100)));
    store.push_query_result(dml_output(2));
    let (_g, base) = start_server(store.clone()).await;
    let client = reqwest::Client::new();

    let csv = b"n,Mes_Anio\n1,Marzo/2024\n2,Abril/2024\n".to_vec();
    let part = reqwest::multipart::Part::bytes(csv)
        .file_name("upload.csv")
        .mime_str("text/csv")
        .expect("mime");
    let form = reqwest::multipart::Form::new()
        .text("table_name", "stage_upload")
        .part("file", part);

    let resp = client
        .post(format!("{}/api/instar/import", base))
        .multipart(form)
        .send()
        .await
        .expect("import");
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["table_name"], INSTAR_FQ);
    assert_eq!(body["temp_table"], "proj.analytics.stage_upload");
    assert_eq!(body["rows_imported"], 2);

    let ops = store.recorded_ops();
    assert!(ops.contains(&"create proj.analytics.stage_upload".to_string()));
    assert!(ops.contains(&"drop proj.analytics.stage_upload".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn import_rejects_non_csv_uploads() {
    let (_g, base) = start_server(Arc::new(MockStore::new())).await;
    let client = reqwest::Client::new();

    let part = reqwest::multipart::Part::bytes(b"not a spreadsheet".to_vec())
        .file_name("upload.xlsx")
        .mime_str("application/pdf")
        .expect("mime");
    let form = reqwest::multipart::Form::new()
        .text("table_name", "stage_upload")
        .part("file", part);

    let resp = client
        .post(format!("{}/api/instar/import", base))
        .multipart(form)
        .send()
        .await
        .expect("import");
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"], "upload a CSV file");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_errors_surface_as_500_with_the_error_envelope() {
    let store = Arc::new(MockStore::new());
    let (_g, base) = start_server_with(store, unconfigured_settings()).await;

    let resp = reqwest::get(format!("{}/api/instar/meses", base)).await.expect("meses");
    assert_eq!(resp.status().as_u16(), 500);
    let body: Value = resp.json().await.expect("json");
    assert!(body["error"].as_str().unwrap_or("").contains("not configured"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_errors_surface_as_500_with_context() {
    let store = Arc::new(MockStore::new());
    store.push_query_error("backend unavailable");
    let (_g, base) = start_server(store).await;

    let resp = reqwest::get(format!("{}/api/admedia/meses", base)).await.expect("meses");
    assert_eq!(resp.status().as_u16(), 500);
    let body: Value = resp.json().await.expect("json");
    let message = body["error"].as_str().unwrap_or("");
    assert!(message.contains("error fetching months"));
    assert!(message.contains("backend unavailable"));
}
