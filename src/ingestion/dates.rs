//! Date dimension: range planning, row derivation and backfill

use crate::config::{DateSpanPolicy, LoadConfig};
use crate::ingestion::error::{LoadError, LoadResult};
use crate::ingestion::types::{tables, DateDimRow};
use crate::ingestion::utils::rows_per_statement;
use chrono::{Datelike, NaiveDate};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::HashSet;
use tracing::{info, warn};

/// Day names indexed by days from Monday. Fixed here so the weekend flag
/// never depends on a server locale or first-day-of-week setting.
pub const DAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

const DATE_COLUMNS: usize = 8;

pub const WEEKEND_DAY_NAMES: [&str; 2] = ["Saturday", "Sunday"];

pub const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Inclusive calendar range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Number of days in the range, both ends included
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Iterate every date in the range
    pub fn iter(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        std::iter::successors(Some(self.start), move |d| {
            d.succ_opt().filter(|next| *next <= end)
        })
    }
}

impl DateDimRow {
    pub fn from_date(date: NaiveDate) -> Self {
        let month = date.month();
        let day_name = DAY_NAMES[date.weekday().num_days_from_monday() as usize];

        DateDimRow {
            full_date: date,
            year: date.year(),
            quarter: ((month - 1) / 3 + 1) as i32,
            month: month as i32,
            month_name: MONTH_NAMES[(month - 1) as usize],
            day: date.day() as i32,
            day_name,
            is_weekend: WEEKEND_DAY_NAMES.contains(&day_name),
        }
    }
}

/// Work out which range of the date dimension a batch needs.
/// `None` when the batch carries no parseable date.
pub fn plan_date_range<I>(dates: I, config: &LoadConfig) -> LoadResult<Option<DateRange>>
where
    I: IntoIterator<Item = NaiveDate>,
{
    let mut bounds: Option<(NaiveDate, NaiveDate)> = None;
    for date in dates {
        bounds = Some(match bounds {
            None => (date, date),
            Some((min, max)) => (min.min(date), max.max(date)),
        });
    }

    let Some((min, max)) = bounds else {
        return Ok(None);
    };
    let range = DateRange { start: min, end: max };
    let limit = config.max_date_span_days;

    if range.days() <= limit {
        return Ok(Some(range));
    }

    match config.date_span_policy {
        DateSpanPolicy::Reject => Err(LoadError::DateSpanExceeded {
            min,
            max,
            days: range.days(),
            limit,
        }),
        DateSpanPolicy::Clamp => {
            let start = max
                .checked_sub_signed(chrono::Duration::days(limit - 1))
                .unwrap_or(NaiveDate::MIN);
            warn!(
                "Date range {}..={} spans {} days; clamping to {}..={}",
                min,
                max,
                range.days(),
                start,
                max
            );
            Ok(Some(DateRange { start, end: max }))
        }
    }
}

/// Rows for every date in `range` that is not in `existing`
pub fn missing_date_rows(range: &DateRange, existing: &HashSet<NaiveDate>) -> Vec<DateDimRow> {
    range
        .iter()
        .filter(|d| !existing.contains(d))
        .map(DateDimRow::from_date)
        .collect()
}

/// Make sure every date spanned by `dates` exists in the date dimension.
/// Only missing rows are inserted; running it twice inserts nothing the second time.
/// Returns the number of dates backfilled.
pub async fn ensure_date_dimension<I>(
    conn: &mut PgConnection,
    dates: I,
    config: &LoadConfig,
) -> LoadResult<usize>
where
    I: IntoIterator<Item = NaiveDate>,
{
    let Some(range) = plan_date_range(dates, config)? else {
        info!("No parseable dates in batch; date dimension untouched");
        return Ok(0);
    };

    let existing: HashSet<NaiveDate> = sqlx::query_scalar::<_, NaiveDate>(&format!(
        "SELECT full_date FROM {} WHERE full_date BETWEEN $1 AND $2",
        tables::DIM_DATES
    ))
    .bind(range.start)
    .bind(range.end)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .collect();

    let missing = missing_date_rows(&range, &existing);

    for chunk in missing.chunks(rows_per_statement(config.insert_chunk_size, DATE_COLUMNS)) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (full_date, year, quarter, month, month_name, day, day_name, is_weekend) ",
            tables::DIM_DATES
        ));
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.full_date)
                .push_bind(row.year)
                .push_bind(row.quarter)
                .push_bind(row.month)
                .push_bind(row.month_name)
                .push_bind(row.day)
                .push_bind(row.day_name)
                .push_bind(row.is_weekend);
        });
        qb.push(" ON CONFLICT (full_date) DO NOTHING");
        qb.build().execute(&mut *conn).await?;
    }

    info!(
        "Date dimension covers {}..={} ({} days, {} backfilled)",
        range.start,
        range.end,
        range.days(),
        missing.len()
    );

    Ok(missing.len())
}
