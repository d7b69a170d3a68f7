//! Environment-driven configuration. Everything has a default except the
//! warehouse project and the login password; those stay `None` until set and
//! the affected features report their absence at use time.

use std::env;

/// Default BigQuery REST base. Override to point tests at a local stub.
pub const DEFAULT_API_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Where one table family (instar or admedia) lives in the warehouse.
#[derive(Debug, Clone)]
pub struct FamilySettings {
    /// Per-family project override; falls back to [`Settings::gcp_project_id`].
    pub project_id: Option<String>,
    pub dataset: String,
    pub table: String,
    /// Column holding the month partition value.
    pub month_column: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Login password. Unset means login always fails.
    pub app_password: Option<String>,
    pub gcp_project_id: Option<String>,
    pub bigquery_location: Option<String>,
    /// Fixed bearer token; unset means the GCE metadata server is used.
    pub bigquery_access_token: Option<String>,
    pub bigquery_api_endpoint: String,
    pub http_port: u16,
    pub instar: FamilySettings,
    pub admedia: FamilySettings,
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

impl Settings {
    pub fn from_env() -> Settings {
        Settings {
            app_password: env_opt("APP_PASSWORD"),
            gcp_project_id: env_opt("GCP_PROJECT_ID"),
            bigquery_location: env_opt("BIGQUERY_LOCATION"),
            bigquery_access_token: env_opt("BIGQUERY_ACCESS_TOKEN"),
            bigquery_api_endpoint: env_or("BIGQUERY_API_ENDPOINT", DEFAULT_API_ENDPOINT),
            http_port: env::var("TABLERO_HTTP_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            instar: FamilySettings {
                project_id: env_opt("INSTAR_PROJECT_ID"),
                dataset: env_or("INSTAR_DATASET", "analytics"),
                table: env_or("INSTAR_TABLE", "instar_historico"),
                month_column: env_or("INSTAR_MONTH_COLUMN", "Mes_Anio"),
            },
            admedia: FamilySettings {
                project_id: env_opt("ADMEDIA_PROJECT_ID"),
                dataset: env_or("ADMEDIA_DATASET", "analytics"),
                table: env_or("ADMEDIA_TABLE", "admedia_historico"),
                month_column: env_or("ADMEDIA_MONTH_COLUMN", "Mes"),
            },
        }
    }
}
