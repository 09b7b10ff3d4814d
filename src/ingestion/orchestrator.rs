//! Reload orchestrator - one atomic load operation per extract file
//!
//! Every step of a load runs inside a single [`LoadTransaction`]. Any hard
//! failure rolls the whole operation back and is reported, never raised.

use crate::config::LoadConfig;
use crate::ingestion::coerce::{coerce_batch, Coerce};
use crate::ingestion::dates::ensure_date_dimension;
use crate::ingestion::dimensions::{load_listings, rebuild_hosts};
use crate::ingestion::error::{LoadError, LoadResult};
use crate::ingestion::facts::{load_calendar, load_reviews};
use crate::ingestion::stage::{read_extract, write_staging};
use crate::ingestion::transaction::LoadTransaction;
use crate::ingestion::types::{
    tables, LoadMode, LoadPhase, LoadReport, LoadRequest, LoadStatus, LoadSummary, SourceKind,
    StagedCalendar, StagedListing, StagedReview,
};
use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, error, info, warn};

/// Tracks the phase of one load and refuses out-of-order transitions
#[derive(Debug)]
pub struct PhaseTracker {
    phase: LoadPhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: LoadPhase::Idle,
        }
    }

    pub fn current(&self) -> LoadPhase {
        self.phase
    }

    /// Move to `to`, which must be the successor of the current phase
    pub fn advance(&mut self, to: LoadPhase) -> LoadResult<()> {
        if self.phase.next() != Some(to) {
            return Err(LoadError::IllegalTransition {
                from: self.phase,
                to,
            });
        }
        debug!("Load phase {} -> {}", self.phase, to);
        self.phase = to;
        Ok(())
    }

    /// Record a failure; returns the phase the load failed in
    pub fn fail(&mut self) -> LoadPhase {
        let failed_in = self.phase;
        self.phase = LoadPhase::RolledBack;
        failed_in
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Tables emptied before a load, facts before the dimensions they reference.
/// The date dimension is never cleared.
pub fn clear_plan(kind: SourceKind, mode: LoadMode) -> Vec<&'static str> {
    match (mode, kind) {
        (LoadMode::IncrementalAppend, _) => Vec::new(),
        (LoadMode::FullReload, SourceKind::Listings) => vec![
            tables::FACT_CALENDAR,
            tables::FACT_REVIEWS,
            tables::DIM_LISTING_ID_MAP,
            tables::DIM_LISTINGS,
            tables::DIM_HOSTS,
        ],
        (LoadMode::FullReload, SourceKind::Calendar) => vec![tables::FACT_CALENDAR],
        (LoadMode::FullReload, SourceKind::Reviews) => vec![tables::FACT_REVIEWS],
    }
}

async fn clear_tables(conn: &mut PgConnection, targets: &[&str]) -> LoadResult<()> {
    for table in targets {
        let result = sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *conn)
            .await?;
        info!("Cleared {} ({} rows)", table, result.rows_affected());
    }
    Ok(())
}

/// Run one load operation to completion.
/// Never fails: the outcome, including any rollback cause, is in the report.
pub async fn run_load(pool: &PgPool, request: &LoadRequest, config: &LoadConfig) -> LoadReport {
    info!(
        "Loading {} extract {:?} ({}) into {}",
        request.kind,
        request.path,
        request.mode,
        request.kind.target_tables().join(", ")
    );

    let mut tracker = PhaseTracker::new();
    let mut summary = LoadSummary::default();

    let status = match execute(pool, request, config, &mut tracker, &mut summary).await {
        Ok(()) => {
            info!("✓ {} load committed: {}", request.kind, summary);
            LoadStatus::Committed
        }
        Err(e) => {
            let phase = tracker.fail();
            summary.discard_writes();
            error!("✗ {} load rolled back during {}: {}", request.kind, phase, e);
            LoadStatus::RolledBack {
                phase,
                cause: e.to_string(),
            }
        }
    };

    LoadReport {
        request: request.clone(),
        summary,
        status,
    }
}

fn validate_request(request: &LoadRequest) -> LoadResult<()> {
    if !request.path.is_absolute() {
        return Err(LoadError::InvalidRequest(format!(
            "extract path must be absolute: {:?}",
            request.path
        )));
    }
    Ok(())
}

async fn execute(
    pool: &PgPool,
    request: &LoadRequest,
    config: &LoadConfig,
    tracker: &mut PhaseTracker,
    summary: &mut LoadSummary,
) -> LoadResult<()> {
    validate_request(request)?;

    let mut tx = LoadTransaction::begin(pool).await?;

    if let Err(e) = load_in_transaction(&mut tx, request, config, tracker, summary).await {
        if let Err(rollback) = tx.rollback().await {
            warn!("Explicit rollback failed, connection will discard the transaction: {}", rollback);
        }
        return Err(e);
    }

    tx.commit().await?;
    tracker.advance(LoadPhase::Committed)
}

async fn load_in_transaction(
    tx: &mut LoadTransaction,
    request: &LoadRequest,
    config: &LoadConfig,
    tracker: &mut PhaseTracker,
    summary: &mut LoadSummary,
) -> LoadResult<()> {
    let targets = clear_plan(request.kind, request.mode);

    match request.kind {
        SourceKind::Listings => {
            let records = stage_and_coerce::<StagedListing>(tx, request, config, tracker, summary).await?;
            let loaded_at = Utc::now();

            tracker.advance(LoadPhase::DimensionResolving)?;
            info!("Step 3/5: Loading listing and host dimensions...");
            clear_tables(tx.conn(), &targets).await?;
            let step = load_listings(tx.conn(), &records, loaded_at, config).await?;
            summary.absorb(step);
            summary.hosts_rebuilt = rebuild_hosts(tx.conn(), config).await?;

            tracker.advance(LoadPhase::FactLoading)?;
            info!("Step 4/5: No fact table for listings");
        }
        SourceKind::Calendar => {
            let records = stage_and_coerce::<StagedCalendar>(tx, request, config, tracker, summary).await?;

            tracker.advance(LoadPhase::DimensionResolving)?;
            info!("Step 3/5: Resolving date dimension...");
            clear_tables(tx.conn(), &targets).await?;
            summary.dates_backfilled =
                ensure_date_dimension(tx.conn(), records.iter().filter_map(|r| r.date), config).await?;

            tracker.advance(LoadPhase::FactLoading)?;
            info!("Step 4/5: Loading calendar facts...");
            let step = load_calendar(tx, &records, config).await?;
            summary.absorb(step);
        }
        SourceKind::Reviews => {
            let records = stage_and_coerce::<StagedReview>(tx, request, config, tracker, summary).await?;

            tracker.advance(LoadPhase::DimensionResolving)?;
            info!("Step 3/5: Resolving date dimension...");
            clear_tables(tx.conn(), &targets).await?;
            summary.dates_backfilled =
                ensure_date_dimension(tx.conn(), records.iter().filter_map(|r| r.date), config).await?;

            tracker.advance(LoadPhase::FactLoading)?;
            info!("Step 4/5: Loading review facts...");
            let step = load_reviews(tx, &records, config).await?;
            summary.absorb(step);
        }
    }

    tracker.advance(LoadPhase::ConstraintRevalidating)?;
    info!("Step 5/5: Revalidating constraints and committing...");
    tx.revalidate_foreign_keys().await?;

    Ok(())
}

/// Steps 1 and 2, shared by every source kind
async fn stage_and_coerce<R: Coerce>(
    tx: &mut LoadTransaction,
    request: &LoadRequest,
    config: &LoadConfig,
    tracker: &mut PhaseTracker,
    summary: &mut LoadSummary,
) -> LoadResult<Vec<R::Output>> {
    tracker.advance(LoadPhase::Staging)?;
    info!("Step 1/5: Staging {} extract...", R::KIND);
    let batch = read_extract::<R>(&request.path, &config.format)?;
    write_staging(tx.conn(), &batch).await?;
    summary.staged = batch.rows.len();

    tracker.advance(LoadPhase::Coercing)?;
    info!("Step 2/5: Coercing {} rows...", batch.rows.len());
    let records = coerce_batch(&batch);
    summary.coerced = records.len();

    Ok(records)
}

/// Row count of every dimension and fact table
pub async fn warehouse_row_counts(pool: &PgPool) -> LoadResult<Vec<(&'static str, i64)>> {
    let mut counts = Vec::with_capacity(tables::WAREHOUSE.len());
    for table in tables::WAREHOUSE {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await?;
        counts.push((table, count));
    }
    Ok(counts)
}
