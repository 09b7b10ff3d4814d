//! Fact loaders - calendar observations and guest reviews
//!
//! Both loaders share one path: resolve dimension keys for the batch,
//! classify every row, relax the fact table's foreign keys and bulk insert
//! the accepted rows. Revalidation happens when the load transaction commits.

use crate::config::LoadConfig;
use crate::ingestion::error::LoadResult;
use crate::ingestion::transaction::LoadTransaction;
use crate::ingestion::types::{tables, CalendarRecord, LoadSummary, ReviewRecord};
use crate::ingestion::utils::rows_per_statement;
use chrono::NaiveDate;
use sqlx::query_builder::Separated;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::HashSet;
use std::hash::Hash;
use tracing::{debug, info, warn};

/// A coerced row destined for a fact table
pub trait FactRow: Send + Sync {
    type Key: Eq + Hash + Clone;

    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    /// `None` when any part of the natural key is null
    fn natural_key(&self) -> Option<Self::Key>;
    fn listing_id(&self) -> Option<i64>;
    fn date(&self) -> Option<NaiveDate>;
    fn push_binds(&self, b: &mut Separated<'_, '_, Postgres, &'static str>);
}

impl FactRow for CalendarRecord {
    type Key = (i64, NaiveDate);

    const TABLE: &'static str = tables::FACT_CALENDAR;
    const COLUMNS: &'static [&'static str] = &["listing_id", "calendar_date", "available", "price"];

    fn natural_key(&self) -> Option<Self::Key> {
        Some((self.listing_id?, self.date?))
    }

    fn listing_id(&self) -> Option<i64> {
        self.listing_id
    }

    fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    fn push_binds(&self, b: &mut Separated<'_, '_, Postgres, &'static str>) {
        b.push_bind(self.listing_id)
            .push_bind(self.date)
            .push_bind(self.available)
            .push_bind(self.price);
    }
}

impl FactRow for ReviewRecord {
    type Key = i64;

    const TABLE: &'static str = tables::FACT_REVIEWS;
    const COLUMNS: &'static [&'static str] = &[
        "review_id",
        "listing_id",
        "review_date",
        "reviewer_id",
        "reviewer_name",
        "comments",
    ];

    fn natural_key(&self) -> Option<Self::Key> {
        self.review_id
    }

    fn listing_id(&self) -> Option<i64> {
        self.listing_id
    }

    fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    fn push_binds(&self, b: &mut Separated<'_, '_, Postgres, &'static str>) {
        b.push_bind(self.review_id)
            .push_bind(self.listing_id)
            .push_bind(self.date)
            .push_bind(self.reviewer_id)
            .push_bind(self.reviewer_name.clone())
            .push_bind(self.comments.clone());
    }
}

/// Dimension keys that exist for the values a batch references
#[derive(Debug, Default, Clone)]
pub struct DimensionKeys {
    pub listings: HashSet<i64>,
    pub dates: HashSet<NaiveDate>,
}

/// Classification of a fact batch; every row counted exactly once
#[derive(Debug)]
pub struct FactPlan<'a, F> {
    pub accepted: Vec<&'a F>,
    pub missing_key: usize,
    pub excluded_missing_listing: usize,
    pub excluded_missing_date: usize,
    pub skipped_duplicate: usize,
}

impl<F> FactPlan<'_, F> {
    pub fn summary(&self) -> LoadSummary {
        LoadSummary {
            missing_key: self.missing_key,
            excluded_missing_listing: self.excluded_missing_listing,
            excluded_missing_date: self.excluded_missing_date,
            skipped_duplicate: self.skipped_duplicate,
            inserted: self.accepted.len(),
            ..Default::default()
        }
    }
}

/// Classify rows in source order: missing key, unresolved listing,
/// unresolved date, duplicate (in batch or already stored), accepted.
pub fn plan_fact_rows<'a, F: FactRow>(
    rows: &'a [F],
    dims: &DimensionKeys,
    existing: &HashSet<F::Key>,
) -> FactPlan<'a, F> {
    let mut plan = FactPlan {
        accepted: Vec::new(),
        missing_key: 0,
        excluded_missing_listing: 0,
        excluded_missing_date: 0,
        skipped_duplicate: 0,
    };
    let mut seen: HashSet<F::Key> = HashSet::new();

    for row in rows {
        let Some(key) = row.natural_key() else {
            plan.missing_key += 1;
            continue;
        };

        if !row.listing_id().is_some_and(|id| dims.listings.contains(&id)) {
            plan.excluded_missing_listing += 1;
            continue;
        }
        if !row.date().is_some_and(|d| dims.dates.contains(&d)) {
            plan.excluded_missing_date += 1;
            continue;
        }

        if existing.contains(&key) || !seen.insert(key) {
            plan.skipped_duplicate += 1;
            continue;
        }

        plan.accepted.push(row);
    }

    plan
}

/// Look up which referenced listings and dates exist
pub async fn fetch_dimension_keys<F: FactRow>(
    conn: &mut PgConnection,
    rows: &[F],
) -> LoadResult<DimensionKeys> {
    let listing_ids: Vec<i64> = rows
        .iter()
        .filter_map(F::listing_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let listings = sqlx::query_scalar::<_, i64>(&format!(
        "SELECT listing_id FROM {} WHERE listing_id = ANY($1)",
        tables::DIM_LISTINGS
    ))
    .bind(&listing_ids)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .collect();

    let dates = match (
        rows.iter().filter_map(F::date).min(),
        rows.iter().filter_map(F::date).max(),
    ) {
        (Some(min), Some(max)) => sqlx::query_scalar::<_, NaiveDate>(&format!(
            "SELECT full_date FROM {} WHERE full_date BETWEEN $1 AND $2",
            tables::DIM_DATES
        ))
        .bind(min)
        .bind(max)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .collect(),
        _ => HashSet::new(),
    };

    Ok(DimensionKeys { listings, dates })
}

async fn existing_calendar_keys(
    conn: &mut PgConnection,
    rows: &[CalendarRecord],
) -> LoadResult<HashSet<(i64, NaiveDate)>> {
    let listing_ids: Vec<i64> = rows
        .iter()
        .filter_map(|r| r.listing_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let stored = sqlx::query_as::<_, (i64, NaiveDate)>(&format!(
        "SELECT listing_id, calendar_date FROM {} WHERE listing_id = ANY($1)",
        tables::FACT_CALENDAR
    ))
    .bind(&listing_ids)
    .fetch_all(&mut *conn)
    .await?;

    Ok(stored.into_iter().collect())
}

async fn existing_review_ids(
    conn: &mut PgConnection,
    rows: &[ReviewRecord],
) -> LoadResult<HashSet<i64>> {
    let review_ids: Vec<i64> = rows.iter().filter_map(|r| r.review_id).collect();

    let stored = sqlx::query_scalar::<_, i64>(&format!(
        "SELECT review_id FROM {} WHERE review_id = ANY($1)",
        tables::FACT_REVIEWS
    ))
    .bind(&review_ids)
    .fetch_all(&mut *conn)
    .await?;

    Ok(stored.into_iter().collect())
}

pub async fn load_calendar(
    tx: &mut LoadTransaction,
    rows: &[CalendarRecord],
    config: &LoadConfig,
) -> LoadResult<LoadSummary> {
    let existing = existing_calendar_keys(tx.conn(), rows).await?;
    load_fact_rows(tx, rows, &existing, config).await
}

pub async fn load_reviews(
    tx: &mut LoadTransaction,
    rows: &[ReviewRecord],
    config: &LoadConfig,
) -> LoadResult<LoadSummary> {
    let existing = existing_review_ids(tx.conn(), rows).await?;
    load_fact_rows(tx, rows, &existing, config).await
}

async fn load_fact_rows<F: FactRow>(
    tx: &mut LoadTransaction,
    rows: &[F],
    existing: &HashSet<F::Key>,
    config: &LoadConfig,
) -> LoadResult<LoadSummary> {
    let dims = fetch_dimension_keys(tx.conn(), rows).await?;
    let plan = plan_fact_rows(rows, &dims, existing);
    let summary = plan.summary();

    if summary.excluded_missing_dimension() > 0 {
        warn!(
            "{} rows excluded from {}: {} unknown listing, {} unknown date",
            summary.excluded_missing_dimension(),
            F::TABLE,
            summary.excluded_missing_listing,
            summary.excluded_missing_date
        );
    }
    if summary.missing_key > 0 {
        warn!("{} rows without a natural key skipped for {}", summary.missing_key, F::TABLE);
    }
    if summary.skipped_duplicate > 0 {
        info!("{} duplicate rows skipped for {}", summary.skipped_duplicate, F::TABLE);
    }

    tx.relax_foreign_keys(F::TABLE).await?;

    let conn = tx.conn();
    let rows_per_insert = rows_per_statement(config.insert_chunk_size, F::COLUMNS.len());
    for chunk in plan.accepted.chunks(rows_per_insert) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            F::TABLE,
            F::COLUMNS.join(", ")
        ));
        qb.push_values(chunk, |mut b, row| row.push_binds(&mut b));
        qb.build().execute(&mut *conn).await?;
        debug!("Inserted {} rows into {}", chunk.len(), F::TABLE);
    }

    info!("Inserted {} rows into {}", summary.inserted, F::TABLE);

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn review(id: Option<i64>, listing: Option<i64>, day: Option<u32>) -> ReviewRecord {
        ReviewRecord {
            review_id: id,
            listing_id: listing,
            date: day.map(date),
            reviewer_id: Some(9),
            reviewer_name: Some("Ana".to_string()),
            comments: None,
        }
    }

    fn night(listing: Option<i64>, day: Option<u32>) -> CalendarRecord {
        CalendarRecord {
            listing_id: listing,
            date: day.map(date),
            available: Some(true),
            price: Some(Decimal::new(10000, 2)),
        }
    }

    fn dims() -> DimensionKeys {
        DimensionKeys {
            listings: [1, 2].into_iter().collect(),
            dates: (1..=10).map(date).collect(),
        }
    }

    fn total<F>(plan: &FactPlan<'_, F>) -> usize {
        plan.accepted.len()
            + plan.missing_key
            + plan.excluded_missing_listing
            + plan.excluded_missing_date
            + plan.skipped_duplicate
    }

    #[test]
    fn test_duplicate_review_ids_collapse_to_first() {
        let mut first = review(Some(42), Some(1), Some(1));
        first.comments = Some("first".to_string());
        let mut second = review(Some(42), Some(2), Some(2));
        second.comments = Some("second".to_string());
        let rows = vec![first, second];

        let plan = plan_fact_rows(&rows, &dims(), &HashSet::new());

        assert_eq!(plan.accepted.len(), 1);
        assert_eq!(plan.accepted[0].comments.as_deref(), Some("first"));
        assert_eq!(plan.skipped_duplicate, 1);
    }

    #[test]
    fn test_stored_review_is_never_reinserted() {
        let rows = vec![review(Some(42), Some(1), Some(1))];
        let existing: HashSet<i64> = [42].into_iter().collect();

        let plan = plan_fact_rows(&rows, &dims(), &existing);

        assert!(plan.accepted.is_empty());
        assert_eq!(plan.skipped_duplicate, 1);
    }

    #[test]
    fn test_second_run_inserts_nothing() {
        let rows = vec![night(Some(1), Some(1)), night(Some(1), Some(2)), night(Some(2), Some(1))];

        let first = plan_fact_rows(&rows, &dims(), &HashSet::new());
        let stored: HashSet<(i64, NaiveDate)> =
            first.accepted.iter().filter_map(|r| r.natural_key()).collect();
        let second = plan_fact_rows(&rows, &dims(), &stored);

        assert_eq!(first.accepted.len(), 3);
        assert_eq!(second.accepted.len(), 0);
        assert_eq!(second.skipped_duplicate, 3);
    }

    #[test]
    fn test_exclusions_match_dimension_misses() {
        let rows = vec![
            review(Some(1), Some(1), Some(1)),
            review(Some(2), Some(77), Some(1)),
            review(Some(3), Some(1), Some(30)),
            review(Some(4), None, Some(1)),
            review(Some(5), Some(2), None),
            review(Some(6), Some(2), Some(5)),
        ];

        let plan = plan_fact_rows(&rows, &dims(), &HashSet::new());

        assert_eq!(plan.excluded_missing_listing, 2);
        assert_eq!(plan.excluded_missing_date, 2);
        assert_eq!(plan.summary().excluded_missing_dimension(), 4);
        assert_eq!(plan.accepted.len(), 2);
    }

    #[test]
    fn test_missing_key_is_checked_first() {
        // unknown listing and date too, but the missing id wins
        let rows = vec![review(None, Some(77), Some(30))];

        let plan = plan_fact_rows(&rows, &dims(), &HashSet::new());

        assert_eq!(plan.missing_key, 1);
        assert_eq!(plan.summary().excluded_missing_dimension(), 0);
    }

    #[test]
    fn test_calendar_key_needs_listing_and_date() {
        let rows = vec![night(None, Some(1)), night(Some(1), None), night(Some(1), Some(3))];

        let plan = plan_fact_rows(&rows, &dims(), &HashSet::new());

        assert_eq!(plan.missing_key, 2);
        assert_eq!(plan.accepted.len(), 1);
    }

    #[test]
    fn test_every_row_lands_in_one_bucket() {
        let rows = vec![
            night(Some(1), Some(1)),
            night(Some(1), Some(1)),
            night(Some(3), Some(1)),
            night(Some(2), Some(20)),
            night(None, Some(2)),
            night(Some(2), Some(4)),
        ];
        let existing: HashSet<(i64, NaiveDate)> = [(2, date(4))].into_iter().collect();

        let plan = plan_fact_rows(&rows, &dims(), &existing);

        assert_eq!(total(&plan), rows.len());
        assert_eq!(plan.accepted.len(), 1);
        assert_eq!(plan.skipped_duplicate, 2);
        assert_eq!(plan.excluded_missing_listing, 1);
        assert_eq!(plan.excluded_missing_date, 1);
        assert_eq!(plan.missing_key, 1);
    }
}
