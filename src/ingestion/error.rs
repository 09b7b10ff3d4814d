//! Hard failures of a load operation. Any of these rolls the whole load back.

use crate::ingestion::types::LoadPhase;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read extract: {0}")]
    Csv(#[from] csv::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid load request: {0}")]
    InvalidRequest(String),

    #[error("date range {min}..={max} spans {days} days, limit is {limit}")]
    DateSpanExceeded {
        min: NaiveDate,
        max: NaiveDate,
        days: i64,
        limit: i64,
    },

    #[error("foreign key {constraint} on {table} failed revalidation: {source}")]
    ConstraintRevalidation {
        table: String,
        constraint: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("illegal load phase transition {from} -> {to}")]
    IllegalTransition { from: LoadPhase, to: LoadPhase },

    #[error("transaction cannot commit after a failed constraint revalidation")]
    Poisoned,
}

pub type LoadResult<T> = Result<T, LoadError>;
