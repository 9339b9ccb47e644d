use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use linkup_core::provider::GenerationProvider;
use linkup_core::security::ApiKey;
use linkup_llm::{secrets, OpenAiProvider, ReliableProvider};
use linkup_store::Database;
use linkup_telemetry::{init_telemetry, start_snapshot_task, TelemetryConfig};

/// Realtime service of the business-networking platform: presence-aware
/// messaging, AI reply streaming, dashboard broadcast.
#[derive(Parser, Debug)]
#[command(name = "linkup", version)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "LINKUP_PORT", default_value_t = 5000)]
    port: u16,

    /// Data directory for databases and keys
    #[arg(long, env = "LINKUP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Chat-completion model to request
    #[arg(long, env = "LINKUP_MODEL")]
    model: Option<String>,

    /// Override the chat-completions endpoint base URL
    #[arg(long, env = "LINKUP_PROVIDER_URL")]
    provider_url: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir).expect("failed to create data directory");

    let telemetry = init_telemetry(TelemetryConfig {
        log_db_path: data_dir.join("logs.db"),
        metrics_db_path: data_dir.join("metrics.db"),
        ..Default::default()
    });
    let metrics = telemetry.metrics();
    if let Some(metrics) = metrics.clone() {
        start_snapshot_task(metrics, 60);
    }

    tracing::info!("starting linkup server");

    let db = Database::open(&data_dir.join("linkup.db")).expect("failed to open database");

    let api_key = resolve_api_key(&data_dir);
    let provider = match &cli.provider_url {
        Some(url) => OpenAiProvider::with_base_url(api_key, cli.model.as_deref(), url),
        None => OpenAiProvider::new(api_key, cli.model.as_deref()),
    };
    let provider: Arc<dyn GenerationProvider> =
        Arc::new(ReliableProvider::with_defaults(provider));

    let config = linkup_server::ServerConfig {
        port: cli.port,
        ..Default::default()
    };
    let handle = linkup_server::start(config, db, provider, metrics)
        .await
        .expect("failed to start server");

    tracing::info!(port = handle.port, "linkup server ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

/// Take the provider API key from the environment, persisting it encrypted
/// for later runs; otherwise fall back to the stored copy.
fn resolve_api_key(data_dir: &Path) -> ApiKey {
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        let api_key = ApiKey::new(key);
        if let Err(e) = secrets::store_api_key(data_dir, &api_key) {
            tracing::warn!(error = %e, "could not persist API key");
        }
        return api_key;
    }

    match secrets::load_api_key(data_dir) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(error = %e, "no API key available; AI replies will fail until one is set");
            ApiKey::new("")
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".linkup")
}
