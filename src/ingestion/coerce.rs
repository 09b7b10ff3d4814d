//! Coerce functions - turn staged text into warehouse-native values
//!
//! Every function here is total: a value that cannot be converted safely
//! becomes `None`, the row itself is always produced.

use crate::ingestion::types::{
    CalendarRecord, ListingRecord, ReviewRecord, StagedBatch, StagedCalendar, StagedListing,
    StagedRecord, StagedReview,
};
use crate::ingestion::utils::{strip_currency, truncate_chars};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;
use tracing::debug;

/// Storage bounds of text columns, in characters
pub mod limits {
    pub const NAME: usize = 255;
    pub const CITY: usize = 255;
    pub const COUNTRY: usize = 100;
    pub const NEIGHBOURHOOD: usize = 255;
    pub const REVIEWER_NAME: usize = 255;
    pub const COMMENTS: usize = 4000;
    pub const RAW_ID: usize = 4000;
}

/// (precision, scale) of fixed-point columns
pub mod numeric {
    pub const PRICE: (u32, u32) = (10, 2);
    pub const COORDINATE: (u32, u32) = (9, 6);
    pub const RATING: (u32, u32) = (5, 2);
}

const TRUE_VALUES: [&str; 3] = ["t", "true", "1"];
const FALSE_VALUES: [&str; 3] = ["f", "false", "0"];

/// Parse a whole number; thousands separators and an integral decimal form
/// (`"12.0"`) are accepted, anything else is null.
pub fn parse_int(value: &str) -> Option<i64> {
    let cleaned: String = value.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }

    if let Ok(n) = cleaned.parse::<i64>() {
        return Some(n);
    }

    if has_exponent(&cleaned) {
        return None;
    }
    let d = Decimal::from_str(&cleaned).ok()?;
    if d.fract().is_zero() {
        d.to_i64()
    } else {
        None
    }
}

/// Parse a fixed-point value with the given precision and scale.
/// Extra fraction digits are rounded half away from zero; integer overflow is null.
pub fn parse_decimal(value: &str, (precision, scale): (u32, u32)) -> Option<Decimal> {
    let trimmed = value.trim();
    if trimmed.is_empty() || has_exponent(trimmed) {
        return None;
    }

    let mut d = Decimal::from_str(trimmed)
        .ok()?
        .round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    d.rescale(scale);

    let limit = Decimal::from(10i64.checked_pow(precision.checked_sub(scale)?)?);
    if d.abs() >= limit {
        return None;
    }

    Some(d)
}

fn has_exponent(value: &str) -> bool {
    value.contains(|c| c == 'e' || c == 'E')
}

/// Parse a money value such as `"$1,200.50"` as decimal(10,2)
pub fn parse_currency(value: &str) -> Option<Decimal> {
    parse_decimal(&strip_currency(value), numeric::PRICE)
}

/// Tri-state boolean: t/true/1, f/false/0, otherwise null
pub fn parse_bool(value: &str) -> Option<bool> {
    let lowered = value.trim().to_lowercase();
    if TRUE_VALUES.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSE_VALUES.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Parse `YYYY-MM-DD` (a trailing time part is ignored) or `DD/MM/YYYY`
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    let date_part = trimmed
        .split(|c| c == ' ' || c == 'T')
        .next()
        .unwrap_or(trimmed);

    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%d/%m/%Y"))
        .ok()
}

/// Trim, map empty to null and cut to the column's character limit
pub fn clean_text(value: &str, max_chars: usize) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(truncate_chars(trimmed, max_chars).to_string())
    }
}

/// A staged row type that knows its coerced form
pub trait Coerce: StagedRecord {
    type Output;

    fn coerce(&self) -> Self::Output;
}

impl Coerce for StagedListing {
    type Output = ListingRecord;

    fn coerce(&self) -> ListingRecord {
        let host_country = clean_text(&self.host_country, limits::COUNTRY);
        let property_country = clean_text(&self.property_country, limits::COUNTRY);

        // Fall back to comparing countries when the flag itself is unusable
        let is_local_host = parse_bool(&self.is_local_host).or_else(|| {
            match (&host_country, &property_country) {
                (Some(h), Some(p)) => Some(h.to_lowercase() == p.to_lowercase()),
                _ => None,
            }
        });

        ListingRecord {
            raw_listing_id: clean_text(&self.id, limits::RAW_ID),
            listing_id: parse_int(&self.id),
            host_id: parse_int(&self.host_id),
            host_name: clean_text(&self.host_name, limits::NAME),
            host_city: clean_text(&self.host_city, limits::CITY),
            host_country,
            property_country,
            property_city: clean_text(&self.property_city, limits::CITY),
            property_neighbourhood: clean_text(
                &self.property_neighbourhood,
                limits::NEIGHBOURHOOD,
            ),
            latitude: parse_decimal(&self.latitude, numeric::COORDINATE),
            longitude: parse_decimal(&self.longitude, numeric::COORDINATE),
            price: parse_currency(&self.price),
            number_of_reviews: parse_int(&self.number_of_reviews),
            review_scores_rating: parse_decimal(&self.review_scores_rating, numeric::RATING),
            calculated_host_listings_count: parse_int(&self.calculated_host_listings_count),
            is_local_host,
        }
    }
}

impl Coerce for StagedCalendar {
    type Output = CalendarRecord;

    fn coerce(&self) -> CalendarRecord {
        CalendarRecord {
            listing_id: parse_int(&self.listing_id),
            date: parse_date(&self.date),
            available: parse_bool(&self.available),
            price: parse_currency(&self.price),
        }
    }
}

impl Coerce for StagedReview {
    type Output = ReviewRecord;

    fn coerce(&self) -> ReviewRecord {
        ReviewRecord {
            review_id: parse_int(&self.review_id),
            listing_id: parse_int(&self.listing_id),
            date: parse_date(&self.date),
            reviewer_id: parse_int(&self.reviewer_id),
            reviewer_name: clean_text(&self.reviewer_name, limits::REVIEWER_NAME),
            comments: clean_text(&self.comments, limits::COMMENTS),
        }
    }
}

/// Coerce a whole staged batch, preserving source order
pub fn coerce_batch<R: Coerce>(batch: &StagedBatch<R>) -> Vec<R::Output> {
    let coerced: Vec<R::Output> = batch.rows.iter().map(R::coerce).collect();
    debug!("Coerced {} {} rows", coerced.len(), R::KIND);
    coerced
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int(" 1,234 "), Some(1234));
        assert_eq!(parse_int("12.0"), Some(12));
        assert_eq!(parse_int("12.5"), None);
        assert_eq!(parse_int("abc"), None);
        assert_eq!(parse_int(""), None);
        // scientific notation from spreadsheet round trips loses digits
        assert_eq!(parse_int("1.23E+17"), None);
        assert_eq!(parse_int("99999999999999999999"), None);
    }

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("$1,200.50"), Some(Decimal::new(120050, 2)));
        assert_eq!(parse_currency("$85.00\r"), Some(Decimal::new(8500, 2)));
        assert_eq!(parse_currency("€99"), Some(Decimal::new(9900, 2)));
        assert_eq!(parse_currency("abc"), None);
        assert_eq!(parse_currency(""), None);
        // decimal(10,2) holds at most 8 integer digits
        assert_eq!(parse_currency("$123,456,789.00"), None);
    }

    #[test]
    fn test_parse_currency_has_two_fraction_digits() {
        let price = parse_currency("$1,200.5").unwrap();
        assert_eq!(price.scale(), 2);
        assert_eq!(price.to_string(), "1200.50");

        let rounded = parse_currency("10.005").unwrap();
        assert_eq!(rounded, Decimal::new(1001, 2));
    }

    #[test]
    fn test_parse_decimal_precision() {
        assert_eq!(
            parse_decimal("52.3676", numeric::COORDINATE),
            Some(Decimal::new(52_367_600, 6))
        );
        assert_eq!(parse_decimal("-4.9", numeric::COORDINATE).unwrap().to_string(), "-4.900000");
        assert_eq!(parse_decimal("1000", numeric::COORDINATE), None);
        assert_eq!(parse_decimal("4.87", numeric::RATING), Some(Decimal::new(487, 2)));
        assert_eq!(parse_decimal("n/a", numeric::RATING), None);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool(" t "), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("FALSE"), Some(false));
        assert_eq!(parse_bool("f"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn test_parse_date() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 9);
        assert_eq!(parse_date("2024-03-09"), expected);
        assert_eq!(parse_date("2024-03-09 00:00:00"), expected);
        assert_eq!(parse_date("2024-03-09T12:30:00"), expected);
        assert_eq!(parse_date("09/03/2024"), expected);
        assert_eq!(parse_date("2024-02-30"), None);
        assert_eq!(parse_date("yesterday"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  Amsterdam ", limits::CITY), Some("Amsterdam".to_string()));
        assert_eq!(clean_text("   ", limits::CITY), None);

        let long_name = "x".repeat(300);
        let cleaned = clean_text(&long_name, limits::REVIEWER_NAME).unwrap();
        assert_eq!(cleaned.chars().count(), limits::REVIEWER_NAME);
    }

    #[test]
    fn test_coerce_listing_row() {
        let staged = StagedListing {
            id: "1234".to_string(),
            host_id: "99".to_string(),
            host_name: "Anna".to_string(),
            host_country: "Netherlands".to_string(),
            property_country: "netherlands".to_string(),
            price: "$1,200.50".to_string(),
            number_of_reviews: "abc".to_string(),
            review_scores_rating: "4.87".to_string(),
            is_local_host: "".to_string(),
            ..Default::default()
        };

        let record = staged.coerce();

        assert_eq!(record.listing_id, Some(1234));
        assert_eq!(record.raw_listing_id, Some("1234".to_string()));
        assert_eq!(record.host_id, Some(99));
        assert_eq!(record.price, Some(Decimal::new(120050, 2)));
        assert_eq!(record.number_of_reviews, None);
        assert_eq!(record.review_scores_rating, Some(Decimal::new(487, 2)));
        // derived from matching countries
        assert_eq!(record.is_local_host, Some(true));
        assert_eq!(record.host_city, None);
    }

    #[test]
    fn test_coerce_listing_keeps_raw_id_when_unconvertible() {
        let staged = StagedListing {
            id: "1.23E+17".to_string(),
            is_local_host: "False".to_string(),
            ..Default::default()
        };

        let record = staged.coerce();

        assert_eq!(record.listing_id, None);
        assert_eq!(record.raw_listing_id, Some("1.23E+17".to_string()));
        assert_eq!(record.is_local_host, Some(false));
    }

    #[test]
    fn test_coerce_calendar_and_review_rows() {
        let calendar = StagedCalendar {
            listing_id: "7".to_string(),
            date: "2024-06-01".to_string(),
            available: "maybe".to_string(),
            price: "$120.00".to_string(),
        }
        .coerce();

        assert_eq!(calendar.listing_id, Some(7));
        assert_eq!(calendar.date, NaiveDate::from_ymd_opt(2024, 6, 1));
        assert_eq!(calendar.available, None);
        assert_eq!(calendar.price, Some(Decimal::new(12000, 2)));

        let review = StagedReview {
            listing_id: "7".to_string(),
            review_id: "42".to_string(),
            date: "garbled".to_string(),
            reviewer_id: "".to_string(),
            reviewer_name: "n".repeat(400),
            comments: "Lovely stay".to_string(),
        }
        .coerce();

        assert_eq!(review.review_id, Some(42));
        assert_eq!(review.date, None);
        assert_eq!(review.reviewer_id, None);
        assert_eq!(review.reviewer_name.map(|n| n.len()), Some(limits::REVIEWER_NAME));
        assert_eq!(review.comments, Some("Lovely stay".to_string()));
    }

    #[test]
    fn test_coerce_batch_preserves_order() {
        let batch = StagedBatch {
            source: PathBuf::from("/data/calendar.csv"),
            rows: vec![
                StagedCalendar {
                    listing_id: "2".to_string(),
                    ..Default::default()
                },
                StagedCalendar {
                    listing_id: "x".to_string(),
                    ..Default::default()
                },
                StagedCalendar {
                    listing_id: "1".to_string(),
                    ..Default::default()
                },
            ],
        };

        let ids: Vec<Option<i64>> = coerce_batch(&batch).iter().map(|r| r.listing_id).collect();
        assert_eq!(ids, vec![Some(2), None, Some(1)]);
    }
}
