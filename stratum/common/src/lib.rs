//! Identifiers and configuration shared by every stratum crate.

pub mod config;
pub mod types;

pub use config::EngineConfig;
pub use types::{KeyRange, RowKey, TableId};
