//! Load configuration, read from environment variables by the driver

use anyhow::{Context, Result};
use std::env;

/// How an extract file is laid out on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractFormat {
    pub delimiter: u8,
    pub terminator: LineTerminator,
    /// 1-based row where data begins; anything above it is header
    pub first_data_row: usize,
    /// Treat `"` as a quote character. Raw extracts keep quotes as data.
    pub quoting: bool,
}

/// Records always end at `\n`; a lone `\r` is field data in both modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTerminator {
    /// `\n` only; a trailing `\r` stays in the last field
    Lf,
    /// `\r\n` or `\n`; the `\r` of a `\r\n` ending is dropped
    CrLf,
}

impl LineTerminator {
    pub fn to_csv(self) -> csv::Terminator {
        csv::Terminator::Any(b'\n')
    }

    /// Whether a `\r` left at the end of a record belongs to the line ending
    pub fn strips_trailing_cr(self) -> bool {
        self == LineTerminator::CrLf
    }
}

impl Default for ExtractFormat {
    fn default() -> Self {
        ExtractFormat {
            delimiter: b'|',
            terminator: LineTerminator::CrLf,
            first_data_row: 2,
            quoting: false,
        }
    }
}

/// What to do when an incoming batch spans more days than allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSpanPolicy {
    /// Fail the load
    Reject,
    /// Keep the most recent `max_date_span_days`; older dates go unresolved
    Clamp,
}

/// Knobs for the load pipeline itself
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub format: ExtractFormat,
    pub max_date_span_days: i64,
    pub date_span_policy: DateSpanPolicy,
    /// Rows per multi-row INSERT statement, capped by the bind parameter limit
    pub insert_chunk_size: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        LoadConfig {
            format: ExtractFormat::default(),
            max_date_span_days: 20_000,
            date_span_policy: DateSpanPolicy::Reject,
            insert_chunk_size: 1_000,
        }
    }
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub load: LoadConfig,
}

impl WarehouseConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = LoadConfig::default();

        let delimiter = match env::var("WAREHOUSE_DELIMITER") {
            Ok(d) => parse_delimiter(&d)?,
            Err(_) => defaults.format.delimiter,
        };

        let terminator = match env::var("WAREHOUSE_LINE_TERMINATOR") {
            Ok(t) => parse_terminator(&t)?,
            Err(_) => defaults.format.terminator,
        };

        let date_span_policy = match env::var("WAREHOUSE_DATE_SPAN_POLICY") {
            Ok(p) => parse_span_policy(&p)?,
            Err(_) => defaults.date_span_policy,
        };

        let config = WarehouseConfig {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,

            max_connections: env::var("WAREHOUSE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("WAREHOUSE_MAX_CONNECTIONS must be a valid number")?,

            load: LoadConfig {
                format: ExtractFormat {
                    delimiter,
                    terminator,
                    first_data_row: env::var("WAREHOUSE_FIRST_DATA_ROW")
                        .unwrap_or_else(|_| defaults.format.first_data_row.to_string())
                        .parse()
                        .context("WAREHOUSE_FIRST_DATA_ROW must be a valid number")?,
                    quoting: env::var("WAREHOUSE_QUOTING")
                        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
                        .unwrap_or(defaults.format.quoting),
                },
                max_date_span_days: env::var("WAREHOUSE_MAX_DATE_SPAN_DAYS")
                    .unwrap_or_else(|_| defaults.max_date_span_days.to_string())
                    .parse()
                    .context("WAREHOUSE_MAX_DATE_SPAN_DAYS must be a valid number")?,
                date_span_policy,
                insert_chunk_size: env::var("WAREHOUSE_INSERT_CHUNK_SIZE")
                    .unwrap_or_else(|_| defaults.insert_chunk_size.to_string())
                    .parse()
                    .context("WAREHOUSE_INSERT_CHUNK_SIZE must be a valid number")?,
            },
        };

        if config.load.format.first_data_row == 0 {
            anyhow::bail!("WAREHOUSE_FIRST_DATA_ROW is 1-based and must be at least 1");
        }
        if config.load.insert_chunk_size == 0 {
            anyhow::bail!("WAREHOUSE_INSERT_CHUNK_SIZE must be at least 1");
        }
        if config.load.max_date_span_days < 1 {
            anyhow::bail!("WAREHOUSE_MAX_DATE_SPAN_DAYS must be at least 1");
        }

        Ok(config)
    }
}

fn parse_delimiter(value: &str) -> Result<u8> {
    match value.as_bytes() {
        [b] => Ok(*b),
        _ if value == "\\t" => Ok(b'\t'),
        _ => Err(anyhow::anyhow!(
            "WAREHOUSE_DELIMITER must be a single byte, got {:?}",
            value
        )),
    }
}

fn parse_terminator(value: &str) -> Result<LineTerminator> {
    match value.trim().to_lowercase().as_str() {
        "lf" | "\\n" => Ok(LineTerminator::Lf),
        "crlf" | "\\r\\n" => Ok(LineTerminator::CrLf),
        other => Err(anyhow::anyhow!("unknown line terminator: {}", other)),
    }
}

fn parse_span_policy(value: &str) -> Result<DateSpanPolicy> {
    match value.trim().to_lowercase().as_str() {
        "reject" => Ok(DateSpanPolicy::Reject),
        "clamp" => Ok(DateSpanPolicy::Clamp),
        other => Err(anyhow::anyhow!("unknown date span policy: {}", other)),
    }
}
