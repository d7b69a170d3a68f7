use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tablero::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();
    fmt().with_env_filter(filter).init();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let settings = Settings::from_env();
    info!(
        target: "tablero",
        "tablero starting: RUST_LOG='{}', http_port={}, project={}, instar={}.{}, admedia={}.{}",
        rust_log,
        settings.http_port,
        settings.gcp_project_id.as_deref().unwrap_or("<unset>"),
        settings.instar.dataset,
        settings.instar.table,
        settings.admedia.dataset,
        settings.admedia.table
    );

    tablero::server::run(settings).await
}
