//! Logbook demo server
//!
//! Starts the engine on a local directory, serves the query API, and
//! (optionally) generates a stream of demo records to explore with the
//! `/api/ticks` and `/api/entries` endpoints.

use clap::Parser;
use logbook::config::AppConfig;
use logbook::storage::{QueryStorage, SqliteStorage};
use logbook::{Config, Logbook};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "logbook", about = "Embeddable structured-log engine")]
struct Args {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the window databases (overrides the config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Address for the HTTP API (overrides the config file).
    #[arg(long)]
    addr: Option<String>,

    /// Generate a stream of sample records.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "logbook=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(addr) = args.addr {
        config.http_addr = addr;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "starting logbook"
    );

    let storage = SqliteStorage::new(config.storage_config())?;
    let log = Arc::new(Logbook::new(Config {
        ingester: config.ingester_config(),
        storage: Some(storage as Arc<dyn QueryStorage>),
        fallback_log: None,
    }));

    if args.demo {
        tokio::spawn(demo_traffic(Arc::clone(&log)));
    }

    logbook::api::serve(Arc::clone(&log), &config.http_addr).await?;

    log.close().await?;
    tracing::info!("logbook shutdown complete");
    Ok(())
}

/// Emits a varied stream of records so the query surface has data.
async fn demo_traffic(log: Arc<Logbook>) {
    const MESSAGES: [(&str, i8); 6] = [
        ("user signed in", 0),
        ("cache miss", -1),
        ("request completed", 0),
        ("slow query detected", 4),
        ("upstream timeout", 8),
        ("payment processed", 0),
    ];

    let mut tick = tokio::time::interval(std::time::Duration::from_millis(250));
    let mut sequence: u64 = 0;
    loop {
        tick.tick().await;
        sequence += 1;

        let (msg, level) = MESSAGES[(sequence % MESSAGES.len() as u64) as usize];
        let content = serde_json::json!({
            "msg": msg,
            "seq": sequence,
            "status": if level >= 8 { 500 } else { 200 },
        });

        if log
            .ingest(chrono::Utc::now(), level, content.to_string().into_bytes())
            .is_err()
        {
            return;
        }
    }
}
