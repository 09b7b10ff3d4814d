//! Star-schema warehouse loader for pipe-delimited listings, calendar and review extracts

pub mod config;
pub mod ingestion;

pub use config::{LoadConfig, WarehouseConfig};
pub use ingestion::{run_load, warehouse_row_counts, LoadError, LoadReport, LoadRequest};
