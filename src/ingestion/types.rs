//! Core data types for the warehouse load pipeline
//! Pure data structures with no database access

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Warehouse relation names. The DDL itself is owned outside this crate.
pub mod tables {
    pub const DIM_LISTINGS: &str = "dim_listings";
    pub const DIM_LISTING_ID_MAP: &str = "dim_listing_id_map";
    pub const DIM_HOSTS: &str = "dim_hosts";
    pub const DIM_DATES: &str = "dim_dates";
    pub const FACT_CALENDAR: &str = "fact_calendar";
    pub const FACT_REVIEWS: &str = "fact_reviews";
    pub const STG_LISTINGS: &str = "stg_listings";
    pub const STG_CALENDAR: &str = "stg_calendar";
    pub const STG_REVIEWS: &str = "stg_reviews";

    /// Every persistent (non-staging) relation, dimensions first.
    pub const WAREHOUSE: [&str; 6] = [
        DIM_LISTINGS,
        DIM_LISTING_ID_MAP,
        DIM_HOSTS,
        DIM_DATES,
        FACT_CALENDAR,
        FACT_REVIEWS,
    ];
}

/// Which extract a load operation consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Listings,
    Calendar,
    Reviews,
}

impl SourceKind {
    /// Tables written by a load of this kind
    pub fn target_tables(&self) -> &'static [&'static str] {
        match self {
            SourceKind::Listings => &[
                tables::DIM_LISTINGS,
                tables::DIM_LISTING_ID_MAP,
                tables::DIM_HOSTS,
            ],
            SourceKind::Calendar => &[tables::DIM_DATES, tables::FACT_CALENDAR],
            SourceKind::Reviews => &[tables::DIM_DATES, tables::FACT_REVIEWS],
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Listings => write!(f, "listings"),
            SourceKind::Calendar => write!(f, "calendar"),
            SourceKind::Reviews => write!(f, "reviews"),
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "listings" => Ok(SourceKind::Listings),
            "calendar" => Ok(SourceKind::Calendar),
            "reviews" => Ok(SourceKind::Reviews),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

/// Whether target tables are cleared before the load or appended to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadMode {
    FullReload,
    IncrementalAppend,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::FullReload => write!(f, "full-reload"),
            LoadMode::IncrementalAppend => write!(f, "incremental-append"),
        }
    }
}

/// One load operation as handed over by the driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    pub path: PathBuf,
    pub kind: SourceKind,
    pub mode: LoadMode,
}

/// A staged extract row: untyped text, one struct per source kind.
/// Field order is the column order of the staging relation.
pub trait StagedRecord: DeserializeOwned + Serialize + Send + Sync {
    const KIND: SourceKind;
    const STAGING_TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagedListing {
    pub id: String,
    pub host_id: String,
    pub host_name: String,
    pub host_city: String,
    pub host_country: String,
    pub property_country: String,
    pub property_city: String,
    pub property_neighbourhood: String,
    pub latitude: String,
    pub longitude: String,
    pub price: String,
    pub number_of_reviews: String,
    pub review_scores_rating: String,
    pub calculated_host_listings_count: String,
    pub is_local_host: String,
}

impl StagedRecord for StagedListing {
    const KIND: SourceKind = SourceKind::Listings;
    const STAGING_TABLE: &'static str = tables::STG_LISTINGS;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "host_id",
        "host_name",
        "host_city",
        "host_country",
        "property_country",
        "property_city",
        "property_neighbourhood",
        "latitude",
        "longitude",
        "price",
        "number_of_reviews",
        "review_scores_rating",
        "calculated_host_listings_count",
        "is_local_host",
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagedCalendar {
    pub listing_id: String,
    pub date: String,
    pub available: String,
    pub price: String,
}

impl StagedRecord for StagedCalendar {
    const KIND: SourceKind = SourceKind::Calendar;
    const STAGING_TABLE: &'static str = tables::STG_CALENDAR;
    const COLUMNS: &'static [&'static str] = &["listing_id", "date", "available", "price"];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagedReview {
    pub listing_id: String,
    #[serde(rename = "id")]
    pub review_id: String,
    pub date: String,
    pub reviewer_id: String,
    pub reviewer_name: String,
    pub comments: String,
}

impl StagedRecord for StagedReview {
    const KIND: SourceKind = SourceKind::Reviews;
    const STAGING_TABLE: &'static str = tables::STG_REVIEWS;
    const COLUMNS: &'static [&'static str] = &[
        "listing_id",
        "id",
        "date",
        "reviewer_id",
        "reviewer_name",
        "comments",
    ];
}

/// Rows read from one extract, in source order
#[derive(Debug, Clone)]
pub struct StagedBatch<R> {
    pub source: PathBuf,
    pub rows: Vec<R>,
}

/// Coerced listing row
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRecord {
    pub raw_listing_id: Option<String>,
    pub listing_id: Option<i64>,
    pub host_id: Option<i64>,
    pub host_name: Option<String>,
    pub host_city: Option<String>,
    pub host_country: Option<String>,
    pub property_country: Option<String>,
    pub property_city: Option<String>,
    pub property_neighbourhood: Option<String>,
    pub latitude: Option<Decimal>,
    pub longitude: Option<Decimal>,
    pub price: Option<Decimal>,
    pub number_of_reviews: Option<i64>,
    pub review_scores_rating: Option<Decimal>,
    pub calculated_host_listings_count: Option<i64>,
    pub is_local_host: Option<bool>,
}

/// Coerced calendar observation
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarRecord {
    pub listing_id: Option<i64>,
    pub date: Option<NaiveDate>,
    pub available: Option<bool>,
    pub price: Option<Decimal>,
}

/// Coerced guest review
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRecord {
    pub review_id: Option<i64>,
    pub listing_id: Option<i64>,
    pub date: Option<NaiveDate>,
    pub reviewer_id: Option<i64>,
    pub reviewer_name: Option<String>,
    pub comments: Option<String>,
}

/// Raw listing id preserved alongside its converted value (if any)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingIdMapping {
    pub listing_id: Option<i64>,
    pub raw_id: String,
    pub parts: [Option<String>; 3],
}

/// Row of the date dimension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateDimRow {
    pub full_date: NaiveDate,
    pub year: i32,
    pub quarter: i32,
    pub month: i32,
    pub month_name: &'static str,
    pub day: i32,
    pub day_name: &'static str,
    pub is_weekend: bool,
}

/// Listing columns needed to derive the host dimension
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HostSourceRow {
    pub listing_id: i64,
    pub host_id: i64,
    pub host_name: Option<String>,
    pub host_city: Option<String>,
    pub host_country: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Row of the host dimension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRow {
    pub host_id: i64,
    pub host_name: Option<String>,
    pub host_city: Option<String>,
    pub host_country: Option<String>,
    pub total_listings: i64,
}

/// Row counts for one load operation
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub staged: usize,
    pub coerced: usize,
    pub missing_key: usize,
    pub excluded_missing_listing: usize,
    pub excluded_missing_date: usize,
    pub skipped_duplicate: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unmapped_raw_ids: usize,
    pub id_mappings: usize,
    pub dates_backfilled: usize,
    pub hosts_rebuilt: usize,
}

impl LoadSummary {
    pub fn excluded_missing_dimension(&self) -> usize {
        self.excluded_missing_listing + self.excluded_missing_date
    }

    /// Add the counts produced by one pipeline step
    pub fn absorb(&mut self, step: LoadSummary) {
        self.staged += step.staged;
        self.coerced += step.coerced;
        self.missing_key += step.missing_key;
        self.excluded_missing_listing += step.excluded_missing_listing;
        self.excluded_missing_date += step.excluded_missing_date;
        self.skipped_duplicate += step.skipped_duplicate;
        self.inserted += step.inserted;
        self.updated += step.updated;
        self.unmapped_raw_ids += step.unmapped_raw_ids;
        self.id_mappings += step.id_mappings;
        self.dates_backfilled += step.dates_backfilled;
        self.hosts_rebuilt += step.hosts_rebuilt;
    }

    /// Nothing was persisted: keep what was read, drop what was written.
    pub fn discard_writes(&mut self) {
        self.inserted = 0;
        self.updated = 0;
        self.id_mappings = 0;
        self.dates_backfilled = 0;
        self.hosts_rebuilt = 0;
    }
}

impl std::fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "staged: {}, coerced: {}, excluded (missing dimension): {}, inserted: {}, updated: {}, skipped duplicate: {}, missing key: {}",
            self.staged,
            self.coerced,
            self.excluded_missing_dimension(),
            self.inserted,
            self.updated,
            self.skipped_duplicate,
            self.missing_key
        )
    }
}

/// States of a single load operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    Idle,
    Staging,
    Coercing,
    DimensionResolving,
    FactLoading,
    ConstraintRevalidating,
    Committed,
    RolledBack,
}

impl LoadPhase {
    /// The phase that follows on success, if any
    pub fn next(&self) -> Option<LoadPhase> {
        match self {
            LoadPhase::Idle => Some(LoadPhase::Staging),
            LoadPhase::Staging => Some(LoadPhase::Coercing),
            LoadPhase::Coercing => Some(LoadPhase::DimensionResolving),
            LoadPhase::DimensionResolving => Some(LoadPhase::FactLoading),
            LoadPhase::FactLoading => Some(LoadPhase::ConstraintRevalidating),
            LoadPhase::ConstraintRevalidating => Some(LoadPhase::Committed),
            LoadPhase::Committed | LoadPhase::RolledBack => None,
        }
    }
}

impl std::fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoadPhase::Idle => "idle",
            LoadPhase::Staging => "staging",
            LoadPhase::Coercing => "coercing",
            LoadPhase::DimensionResolving => "dimension_resolving",
            LoadPhase::FactLoading => "fact_loading",
            LoadPhase::ConstraintRevalidating => "constraint_revalidating",
            LoadPhase::Committed => "committed",
            LoadPhase::RolledBack => "rolled_back",
        };
        write!(f, "{}", name)
    }
}

/// Final status reported to the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadStatus {
    Committed,
    RolledBack { phase: LoadPhase, cause: String },
}

/// Outcome of one load operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
    pub request: LoadRequest,
    pub summary: LoadSummary,
    #[serde(flatten)]
    pub status: LoadStatus,
}

impl LoadReport {
    pub fn is_success(&self) -> bool {
        self.status == LoadStatus::Committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_sequence_reaches_committed() {
        let mut phase = LoadPhase::Idle;
        let mut visited = vec![phase];
        while let Some(next) = phase.next() {
            phase = next;
            visited.push(phase);
        }

        assert_eq!(phase, LoadPhase::Committed);
        assert_eq!(visited.len(), 7);
        assert!(!visited.contains(&LoadPhase::RolledBack));
    }

    #[test]
    fn test_source_kind_parse() {
        assert_eq!("Calendar".parse::<SourceKind>(), Ok(SourceKind::Calendar));
        assert_eq!(" reviews ".parse::<SourceKind>(), Ok(SourceKind::Reviews));
        assert!("hosts".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_discard_writes_keeps_read_counts() {
        let mut summary = LoadSummary {
            staged: 10,
            coerced: 10,
            excluded_missing_listing: 2,
            inserted: 8,
            dates_backfilled: 3,
            ..Default::default()
        };
        summary.discard_writes();

        assert_eq!(summary.staged, 10);
        assert_eq!(summary.excluded_missing_dimension(), 2);
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.dates_backfilled, 0);
    }

    #[test]
    fn test_report_serializes_status_inline() {
        let report = LoadReport {
            request: LoadRequest {
                path: PathBuf::from("/data/calendar.csv"),
                kind: SourceKind::Calendar,
                mode: LoadMode::FullReload,
            },
            summary: LoadSummary::default(),
            status: LoadStatus::RolledBack {
                phase: LoadPhase::FactLoading,
                cause: "boom".to_string(),
            },
        };
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "rolled_back");
        assert_eq!(json["phase"], "fact_loading");
        assert_eq!(json["request"]["mode"], "full-reload");
    }
}
