//! Custom error types for the monitor.
//!
//! `MonitorError` consolidates every failure the workspace reports, from
//! validation problems caught before any state changes to transport faults
//! recorded per sample while a collector keeps running. The policy for each
//! variant (abort, record-and-continue, hard stop) lives with the component
//! that raises it; this module only defines the shapes.

use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

/// Failure category for instrument transport operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Session could not be opened (connect refused, resolution failure).
    Unreachable,
    /// No reply within the configured deadline.
    Timeout,
    /// Reply was malformed (bad encoding, unexpected EOF mid-reply).
    Protocol,
    /// Peer refused to grant the device lock.
    Locked,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportErrorKind::Unreachable => "unreachable",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Protocol => "protocol",
            TransportErrorKind::Locked => "locked",
        };
        write!(f, "{}", label)
    }
}

/// A transport operation failed against a specific instrument address.
///
/// Transports never retry on their own; the caller decides whether the
/// failure is per-sample (recorded, scheduler continues) or fatal (start
/// aborted).
#[derive(Error, Debug, Clone)]
#[error("Transport {kind} error for '{address}': {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub address: String,
    pub message: String,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        address: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == TransportErrorKind::Timeout
    }
}

/// Convenience alias for results using the monitor error type.
pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

/// Primary error type for the monitor.
///
/// Variants map onto the error-handling policy:
///
/// - `Validation`, `NameTaken`, `Conflict`: surfaced to the caller, state
///   unchanged.
/// - `Transport`: recorded into the affected sample and `last_error`; aborts
///   `start` when raised during startup checks.
/// - `ParameterMissing`: hard error on state entry; the session stops.
/// - `Corruption`: the affected subsystem refuses to start.
/// - `Internal`: caught at task boundaries; other setups are unaffected.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Bad input or a broken referential-integrity invariant. Carries the
    /// offending field so the HTTP surface can report it.
    #[error("Validation failed on '{field}': {message}")]
    Validation { field: String, message: String },

    /// Name uniqueness violated within a collection.
    #[error("Name '{0}' is already taken")]
    NameTaken(String),

    /// The operation conflicts with existing references (e.g. deleting an
    /// instrument still used by a setup).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Referenced entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Instrument transport failure, see [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A `{name}` placeholder had no value during command expansion.
    #[error("Missing value for parameter '{name}' in command '{command}'")]
    ParameterMissing { name: String, command: String },

    /// A persisted JSON document could not be read.
    #[error("Corrupt data file '{path}': {message}")]
    Corruption { path: String, message: String },

    /// File or network I/O failure outside the transport path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything that indicates a bug rather than bad input.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        MonitorError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        MonitorError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
