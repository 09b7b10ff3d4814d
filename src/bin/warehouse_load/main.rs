//! Warehouse load driver - runs one load operation per `kind=path` argument
//!
//! Usage: warehouse-load [--incremental] <listings|calendar|reviews>=<absolute path> ...

use anyhow::{Context, Result};
use listings_warehouse::ingestion::{LoadMode, LoadRequest, SourceKind};
use listings_warehouse::{run_load, warehouse_row_counts, WarehouseConfig};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    info!("Starting warehouse load");

    let requests = parse_args(env::args().skip(1))?;
    if requests.is_empty() {
        anyhow::bail!("usage: warehouse-load [--incremental] <listings|calendar|reviews>=<absolute path> ...");
    }

    let config = WarehouseConfig::from_env()?;
    info!("Configuration loaded");

    let db = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the warehouse database")?;
    info!("Database connected");

    let mut failed = 0;
    for request in &requests {
        let report = tokio::select! {
            report = run_load(&db, request, &config.load) => report,
            _ = tokio::signal::ctrl_c() => {
                // dropping the load future rolls its transaction back
                warn!("Interrupted during {} load; nothing from it was committed", request.kind);
                return Ok(ExitCode::from(130));
            }
        };

        if !report.is_success() {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&report)?);
    }

    match warehouse_row_counts(&db).await {
        Ok(counts) => {
            for (table, count) in counts {
                info!("{}: {} rows", table, count);
            }
        }
        Err(e) => warn!("Could not read warehouse row counts: {}", e),
    }

    if failed > 0 {
        error!("{} of {} load operations rolled back", failed, requests.len());
        return Ok(ExitCode::FAILURE);
    }

    info!("Warehouse load complete");
    Ok(ExitCode::SUCCESS)
}

/// Turn `[--incremental] kind=path ...` into load requests
fn parse_args<I>(args: I) -> Result<Vec<LoadRequest>>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = LoadMode::FullReload;
    let mut requests = Vec::new();

    for arg in args {
        if arg == "--incremental" {
            mode = LoadMode::IncrementalAppend;
            continue;
        }

        let (kind, path) = arg
            .split_once('=')
            .with_context(|| format!("expected <kind>=<path>, got {:?}", arg))?;
        let kind: SourceKind = kind.parse().map_err(anyhow::Error::msg)?;

        requests.push(LoadRequest {
            path: PathBuf::from(path),
            kind,
            mode,
        });
    }

    // the flag applies to every operation wherever it appears
    for request in &mut requests {
        request.mode = mode;
    }

    Ok(requests)
}
