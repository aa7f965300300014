//! # labmon Core Library
//!
//! Shared data model for the labmon instrument monitor. This crate defines
//! the types that every other crate in the workspace speaks:
//!
//! - **`model`**: instruments, monitoring setups, state machines, and the
//!   sample records produced by the data collector.
//! - **`capability`**: the typed capability descriptor (signals, modes, and
//!   the signal×mode matrix) that is persisted as stringified JSON inside an
//!   instrument's `description` field.
//! - **`template`**: `{name}` placeholder expansion for instrument command
//!   scripts, and numeric parsing of instrument replies.
//! - **`validate`**: referential-integrity and uniqueness checks applied on
//!   every create/update.
//! - **`error`**: the `MonitorError` enum used across the workspace.
//!
//! The crate is deliberately free of I/O and async code so that the engine,
//! store, and server crates can all depend on it without pulling a runtime.

pub mod capability;
pub mod error;
pub mod model;
pub mod template;
pub mod validate;

pub use capability::Capability;
pub use error::{MonitorError, MonitorResult, TransportError, TransportErrorKind};
