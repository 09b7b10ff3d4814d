//! Dimension loaders - listings (with raw-id side mapping) and derived hosts

use crate::config::LoadConfig;
use crate::ingestion::error::LoadResult;
use crate::ingestion::types::{
    tables, HostRow, HostSourceRow, ListingIdMapping, ListingRecord, LoadSummary,
};
use crate::ingestion::utils::{rows_per_statement, split_raw_id};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

const LISTING_COLUMNS: [&str; 16] = [
    "listing_id",
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
    "updated_at",
];

const MAPPING_COLUMNS: usize = 5;
const HOST_COLUMNS: usize = 5;

/// What a listings batch turns into before anything is written
#[derive(Debug, Default)]
pub struct ListingPlan<'a> {
    /// Rows with a usable id, first occurrence of each id only
    pub rows: Vec<&'a ListingRecord>,
    /// One entry per distinct non-empty raw id
    pub mappings: Vec<ListingIdMapping>,
    pub missing_key: usize,
    pub skipped_duplicate: usize,
    pub unmapped_raw_ids: usize,
}

/// Split coerced listings into dimension rows and raw-id mappings.
/// Rows are visited in source order, so the first copy of an id wins.
pub fn plan_listings(records: &[ListingRecord]) -> ListingPlan<'_> {
    let mut plan = ListingPlan::default();
    let mut seen_ids = HashSet::new();
    let mut seen_raw = HashSet::new();

    for record in records {
        let Some(raw_id) = record.raw_listing_id.as_deref() else {
            plan.missing_key += 1;
            continue;
        };

        if seen_raw.insert(raw_id) {
            plan.mappings.push(ListingIdMapping {
                listing_id: record.listing_id,
                raw_id: raw_id.to_string(),
                parts: split_raw_id(raw_id),
            });
        }

        match record.listing_id {
            Some(id) if seen_ids.insert(id) => plan.rows.push(record),
            Some(_) => plan.skipped_duplicate += 1,
            None => plan.unmapped_raw_ids += 1,
        }
    }

    plan
}

/// Write a listings batch into the listing dimension and the raw-id map
pub async fn load_listings(
    conn: &mut PgConnection,
    records: &[ListingRecord],
    loaded_at: DateTime<Utc>,
    config: &LoadConfig,
) -> LoadResult<LoadSummary> {
    let plan = plan_listings(records);
    info!(
        "Writing {} listings ({} duplicate ids, {} unconvertible ids, {} without id)",
        plan.rows.len(),
        plan.skipped_duplicate,
        plan.unmapped_raw_ids,
        plan.missing_key
    );

    if plan.unmapped_raw_ids > 0 {
        warn!(
            "{} listing rows have ids that do not convert; kept in {} only",
            plan.unmapped_raw_ids,
            tables::DIM_LISTING_ID_MAP
        );
    }

    let mut stats = LoadSummary {
        missing_key: plan.missing_key,
        skipped_duplicate: plan.skipped_duplicate,
        unmapped_raw_ids: plan.unmapped_raw_ids,
        ..Default::default()
    };

    let rows_per_insert = rows_per_statement(config.insert_chunk_size, LISTING_COLUMNS.len());
    for chunk in plan.rows.chunks(rows_per_insert) {
        let outcomes = upsert_listing_chunk(conn, chunk, loaded_at).await?;
        let inserted = outcomes.iter().filter(|fresh| **fresh).count();
        stats.inserted += inserted;
        stats.updated += outcomes.len() - inserted;
    }

    stats.id_mappings = write_id_mappings(conn, plan.mappings, config).await?;

    info!(
        "Listings write complete: inserted {}, updated {}, mapped {} raw ids",
        stats.inserted, stats.updated, stats.id_mappings
    );

    Ok(stats)
}

/// Insert or update one chunk; returns `true` per freshly inserted row
async fn upsert_listing_chunk(
    conn: &mut PgConnection,
    chunk: &[&ListingRecord],
    loaded_at: DateTime<Utc>,
) -> LoadResult<Vec<bool>> {
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        tables::DIM_LISTINGS,
        LISTING_COLUMNS.join(", ")
    ));

    qb.push_values(chunk, |mut b, row| {
        b.push_bind(row.listing_id)
            .push_bind(row.host_id)
            .push_bind(row.host_name.clone())
            .push_bind(row.host_city.clone())
            .push_bind(row.host_country.clone())
            .push_bind(row.property_country.clone())
            .push_bind(row.property_city.clone())
            .push_bind(row.property_neighbourhood.clone())
            .push_bind(row.latitude)
            .push_bind(row.longitude)
            .push_bind(row.price)
            .push_bind(row.number_of_reviews)
            .push_bind(row.review_scores_rating)
            .push_bind(row.calculated_host_listings_count)
            .push_bind(row.is_local_host)
            .push_bind(loaded_at);
    });

    let updates: Vec<String> = LISTING_COLUMNS[1..]
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    qb.push(format!(
        " ON CONFLICT (listing_id) DO UPDATE SET {} RETURNING (xmax = 0) AS inserted",
        updates.join(", ")
    ));

    let outcomes = qb.build_query_scalar::<bool>().fetch_all(&mut *conn).await?;
    debug!("Upserted {} listings", outcomes.len());

    Ok(outcomes)
}

/// Record raw ids not already in the side mapping
async fn write_id_mappings(
    conn: &mut PgConnection,
    mappings: Vec<ListingIdMapping>,
    config: &LoadConfig,
) -> LoadResult<usize> {
    if mappings.is_empty() {
        return Ok(0);
    }

    let raw_ids: Vec<String> = mappings.iter().map(|m| m.raw_id.clone()).collect();
    let known: HashSet<String> = sqlx::query_scalar::<_, String>(&format!(
        "SELECT listing_raw_id FROM {} WHERE listing_raw_id = ANY($1)",
        tables::DIM_LISTING_ID_MAP
    ))
    .bind(&raw_ids)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .collect();

    let fresh: Vec<ListingIdMapping> = mappings
        .into_iter()
        .filter(|m| !known.contains(&m.raw_id))
        .collect();

    for chunk in fresh.chunks(rows_per_statement(config.insert_chunk_size, MAPPING_COLUMNS)) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (listing_id, listing_raw_id, part1, part2, part3) ",
            tables::DIM_LISTING_ID_MAP
        ));
        qb.push_values(chunk, |mut b, m| {
            let [part1, part2, part3] = m.parts.clone();
            b.push_bind(m.listing_id)
                .push_bind(m.raw_id.clone())
                .push_bind(part1)
                .push_bind(part2)
                .push_bind(part3);
        });
        qb.build().execute(&mut *conn).await?;
    }

    Ok(fresh.len())
}

/// Collapse listings to one row per host.
/// The representative listing is the most recently updated one, ties going
/// to the lowest listing id; the result does not depend on input order.
/// A full reload stamps every listing with the same `updated_at`, so there
/// the lowest listing id always decides.
pub fn derive_hosts(rows: Vec<HostSourceRow>) -> Vec<HostRow> {
    let mut groups: BTreeMap<i64, (HostSourceRow, i64)> = BTreeMap::new();

    for row in rows {
        match groups.entry(row.host_id) {
            Entry::Vacant(slot) => {
                slot.insert((row, 1));
            }
            Entry::Occupied(mut slot) => {
                let (current, count) = slot.get_mut();
                *count += 1;
                if is_preferred(&row, current) {
                    *current = row;
                }
            }
        }
    }

    groups
        .into_iter()
        .map(|(host_id, (rep, total))| HostRow {
            host_id,
            host_name: rep.host_name,
            host_city: rep.host_city,
            host_country: rep.host_country,
            total_listings: total,
        })
        .collect()
}

fn is_preferred(candidate: &HostSourceRow, current: &HostSourceRow) -> bool {
    candidate.updated_at > current.updated_at
        || (candidate.updated_at == current.updated_at && candidate.listing_id < current.listing_id)
}

/// Clear and rebuild the host dimension from the whole listing dimension
pub async fn rebuild_hosts(conn: &mut PgConnection, config: &LoadConfig) -> LoadResult<usize> {
    let sources = sqlx::query_as::<_, HostSourceRow>(&format!(
        "SELECT listing_id, host_id, host_name, host_city, host_country, updated_at \
         FROM {} WHERE host_id IS NOT NULL",
        tables::DIM_LISTINGS
    ))
    .fetch_all(&mut *conn)
    .await?;

    let hosts = derive_hosts(sources);

    sqlx::query(&format!("DELETE FROM {}", tables::DIM_HOSTS))
        .execute(&mut *conn)
        .await?;

    for chunk in hosts.chunks(rows_per_statement(config.insert_chunk_size, HOST_COLUMNS)) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (host_id, host_name, host_city, host_country, total_listings) ",
            tables::DIM_HOSTS
        ));
        qb.push_values(chunk, |mut b, host| {
            b.push_bind(host.host_id)
                .push_bind(host.host_name.clone())
                .push_bind(host.host_city.clone())
                .push_bind(host.host_country.clone())
                .push_bind(host.total_listings);
        });
        qb.build().execute(&mut *conn).await?;
    }

    info!("Rebuilt {} with {} hosts", tables::DIM_HOSTS, hosts.len());

    Ok(hosts.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn listing(raw: Option<&str>, host_id: Option<i64>) -> ListingRecord {
        ListingRecord {
            raw_listing_id: raw.map(str::to_string),
            listing_id: raw.and_then(|r| r.parse().ok()),
            host_id,
            host_name: None,
            host_city: None,
            host_country: None,
            property_country: None,
            property_city: None,
            property_neighbourhood: None,
            latitude: None,
            longitude: None,
            price: None,
            number_of_reviews: None,
            review_scores_rating: None,
            calculated_host_listings_count: None,
            is_local_host: None,
        }
    }

    fn source(listing_id: i64, host_id: i64, name: &str, hour: u32) -> HostSourceRow {
        HostSourceRow {
            listing_id,
            host_id,
            host_name: Some(name.to_string()),
            host_city: None,
            host_country: None,
            updated_at: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_plan_listings_preserves_unconvertible_ids() {
        let records = vec![
            listing(Some("10"), Some(1)),
            listing(Some("1.2E+17"), Some(1)),
            listing(None, Some(2)),
        ];

        let plan = plan_listings(&records);

        assert_eq!(plan.rows.len(), 1);
        assert_eq!(plan.unmapped_raw_ids, 1);
        assert_eq!(plan.missing_key, 1);
        assert_eq!(plan.mappings.len(), 2);
        assert_eq!(plan.mappings[1].raw_id, "1.2E+17");
        assert_eq!(plan.mappings[1].listing_id, None);
    }

    #[test]
    fn test_plan_listings_first_copy_wins() {
        let mut first = listing(Some("10"), Some(1));
        first.host_name = Some("First".to_string());
        let mut second = listing(Some("10"), Some(1));
        second.host_name = Some("Second".to_string());
        let records = vec![first, second, listing(Some("11"), None)];

        let plan = plan_listings(&records);

        assert_eq!(plan.rows.len(), 2);
        assert_eq!(plan.rows[0].host_name.as_deref(), Some("First"));
        assert_eq!(plan.skipped_duplicate, 1);
        // duplicate raw ids are mapped once
        assert_eq!(plan.mappings.len(), 2);
    }

    #[test]
    fn test_derive_hosts_counts_and_prefers_recent() {
        let hosts = derive_hosts(vec![
            source(3, 100, "Old name", 8),
            source(5, 100, "New name", 12),
            source(4, 200, "Solo", 8),
        ]);

        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].host_id, 100);
        assert_eq!(hosts[0].host_name.as_deref(), Some("New name"));
        assert_eq!(hosts[0].total_listings, 2);
        assert_eq!(hosts[1].host_id, 200);
        assert_eq!(hosts[1].total_listings, 1);
    }

    #[test]
    fn test_derive_hosts_ties_go_to_lowest_listing_id() {
        let forward = derive_hosts(vec![
            source(9, 100, "From 9", 8),
            source(2, 100, "From 2", 8),
            source(5, 100, "From 5", 8),
        ]);
        let reversed = derive_hosts(vec![
            source(5, 100, "From 5", 8),
            source(2, 100, "From 2", 8),
            source(9, 100, "From 9", 8),
        ]);

        assert_eq!(forward, reversed);
        assert_eq!(forward[0].host_name.as_deref(), Some("From 2"));
        assert_eq!(forward[0].total_listings, 3);
    }

    #[test]
    fn test_derive_hosts_empty() {
        assert!(derive_hosts(Vec::new()).is_empty());
    }
}
