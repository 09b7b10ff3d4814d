//! Stage functions - read an extract verbatim into an untyped staging relation

use crate::config::ExtractFormat;
use crate::ingestion::error::{LoadError, LoadResult};
use crate::ingestion::types::{StagedBatch, StagedRecord};
use crate::ingestion::utils::quote_ident;
use csv::{ByteRecord, StringRecord};
use serde::Serialize;
use sqlx::PgConnection;
use std::path::Path;
use tracing::{debug, info};

/// Rows per COPY payload sent to the server
const COPY_CHUNK_ROWS: usize = 5_000;

/// Read every row of an extract as text. No row is rejected: bytes are decoded
/// lossily, NUL characters dropped, missing columns staged as empty text.
pub fn read_extract<R: StagedRecord>(path: &Path, format: &ExtractFormat) -> LoadResult<StagedBatch<R>> {
    info!("Reading {} extract from {:?}", R::KIND, path);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(format.delimiter)
        .terminator(format.terminator.to_csv())
        .quoting(format.quoting)
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let strip_cr = format.terminator.strips_trailing_cr();
    let header_rows = format.first_data_row.saturating_sub(1);
    let mut headers: Option<StringRecord> = None;
    let mut rows = Vec::new();

    let mut idx = 0;
    for result in reader.byte_records() {
        let record = text_record(&result?, strip_cr);
        if record.len() == 1 && record[0].is_empty() {
            // blank line
            continue;
        }
        idx += 1;

        if idx <= header_rows {
            if idx == 1 {
                headers = Some(normalize_headers(&record));
            }
            continue;
        }

        let row: R = match &headers {
            Some(h) => positional(record, h.len()).deserialize(Some(h))?,
            None => positional(record, R::COLUMNS.len()).deserialize(None)?,
        };
        rows.push(row);
    }

    info!("Read {} {} rows from {:?}", rows.len(), R::KIND, path);

    Ok(StagedBatch {
        source: path.to_path_buf(),
        rows,
    })
}

fn text_record(record: &ByteRecord, strip_cr: bool) -> StringRecord {
    let last = record.len().saturating_sub(1);
    record
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let field = match field {
                [head @ .., b'\r'] if strip_cr && idx == last => head,
                _ => field,
            };
            String::from_utf8_lossy(field).replace('\0', "")
        })
        .collect()
}

fn normalize_headers(record: &StringRecord) -> StringRecord {
    record
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
        .collect()
}

/// Pad or cut a record to `width` fields, so short rows stage as empty text
fn positional(record: StringRecord, width: usize) -> StringRecord {
    let mut fields: Vec<String> = record.iter().take(width).map(str::to_string).collect();
    fields.resize(width, String::new());
    fields.into_iter().collect()
}

/// Replace the staging relation's contents with `batch`
pub async fn write_staging<R: StagedRecord>(
    conn: &mut PgConnection,
    batch: &StagedBatch<R>,
) -> LoadResult<u64> {
    sqlx::query(&format!("TRUNCATE TABLE {}", R::STAGING_TABLE))
        .execute(&mut *conn)
        .await?;

    let columns: Vec<String> = R::COLUMNS.iter().map(|c| quote_ident(c)).collect();
    let statement = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
        R::STAGING_TABLE,
        columns.join(", ")
    );

    let mut copy = conn.copy_in_raw(&statement).await?;
    for chunk in batch.rows.chunks(COPY_CHUNK_ROWS) {
        let payload = match encode_copy_rows(chunk) {
            Ok(payload) => payload,
            Err(e) => {
                copy.abort(e.to_string()).await?;
                return Err(e);
            }
        };
        copy.send(payload).await?;
        debug!("Sent {} rows to {}", chunk.len(), R::STAGING_TABLE);
    }
    let copied = copy.finish().await?;

    info!("Staged {} rows from {:?} into {}", copied, batch.source, R::STAGING_TABLE);

    Ok(copied)
}

/// Encode rows as COPY csv. Every field is quoted so empty text stays
/// distinct from NULL.
fn encode_copy_rows<R: Serialize>(rows: &[R]) -> LoadResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .quote_style(csv::QuoteStyle::Always)
        .from_writer(Vec::new());

    for row in rows {
        writer.serialize(row)?;
    }

    writer
        .into_inner()
        .map_err(|e| LoadError::Io(e.into_error()))
}
