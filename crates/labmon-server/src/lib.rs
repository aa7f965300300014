//! HTTP/JSON control surface for the labmon monitor.
//!
//! A hand-routed hyper server: method + path segments matched directly, JSON
//! in and out via serde, permissive CORS for the web UI. Engine operations
//! are delegated to the collector and state machine engine; this crate adds
//! no behavior beyond request decoding, error mapping, and the CSV export.

pub mod config;
pub mod export;
pub mod http;

pub use config::ServerConfig;
pub use http::{handle, run_server, AppState};
