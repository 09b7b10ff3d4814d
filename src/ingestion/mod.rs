//! Warehouse load pipeline - stage, coerce, resolve dimensions, load facts

pub mod coerce;
pub mod dates;
pub mod dimensions;
pub mod error;
pub mod facts;
pub mod orchestrator;
pub mod stage;
pub mod transaction;
pub mod types;
pub mod utils;

pub use error::{LoadError, LoadResult};
pub use orchestrator::{run_load, warehouse_row_counts};
pub use types::*;
