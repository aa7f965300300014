//! Persistence layer for the labmon monitor.
//!
//! Three JSON documents live in the data directory, each a plain array:
//! `instruments.json`, `setups.json`, and `readings.json`. Files are
//! rewritten atomically (sibling temp file + rename) and mutations on each
//! file are serialized; readers work off in-memory views and never block
//! behind writers.
//!
//! - [`ConfigStore`]: instrument and setup CRUD with id assignment, name
//!   uniqueness, and referential-integrity validation.
//! - [`ReadingsRing`]: append-only bounded sample log, trimmed to a fixed
//!   cap, queryable by setup, count, or age.

pub mod config;
pub mod json_file;
pub mod readings;

pub use config::ConfigStore;
pub use readings::{ReadingsRing, DEFAULT_READINGS_CAP};
