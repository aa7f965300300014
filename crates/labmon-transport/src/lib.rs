//! Instrument transport for the labmon monitor.
//!
//! Instruments speak a line-oriented ASCII command protocol: a command that
//! ends with `?` expects a reply line, anything else is acknowledged
//! silently. Addresses take the form `host[:port][/device]`.
//!
//! The crate exposes:
//!
//! - [`Transport`]: the async session trait (`query` / `write` / `close`).
//! - [`TcpTextTransport`]: commands over a persistent TCP connection.
//! - [`MockTransport`]: scripted replies plus failure injection for tests.
//! - [`SessionPool`]: one pooled session per distinct `(host, device)`,
//!   serialized so at most one request is in flight per session.
//!
//! Transports never retry; every failure is reported to the caller as a
//! typed [`TransportError`]. If a peer protocol requires a lock/unlock dance
//! around each operation, the implementation performs it transparently
//! inside `query`/`write`; the plain TCP transport needs none.

pub mod address;
pub mod mock;
pub mod pool;
pub mod tcp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use labmon_core::TransportError;

pub use address::InstrumentAddress;
pub use mock::{MockTransport, MockTransportFactory};
pub use pool::{SessionPool, TransportFactory};
pub use tcp::{TcpTextTransport, TcpTransportFactory};

/// Default per-operation deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(2);

/// An open session to one instrument.
///
/// Implementations serialize their own I/O internally: concurrent calls on
/// the same session are queued, never interleaved on the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a command expecting a reply line. Used for `?`-terminated
    /// commands; the command bytes are passed through unmodified apart from
    /// the wire line terminator.
    async fn query(&self, command: &str) -> Result<String, TransportError>;

    /// Send a command expecting no reply.
    async fn write(&self, command: &str) -> Result<(), TransportError>;

    /// Release the session. Subsequent operations fail with `Unreachable`.
    async fn close(&self);

    /// The address this session was opened against.
    fn address(&self) -> &InstrumentAddress;
}

/// Dispatch on the command shape: `?`-terminated commands are queries, the
/// rest are writes acknowledged with "OK".
pub async fn execute(
    transport: &Arc<dyn Transport>,
    command: &str,
) -> Result<String, TransportError> {
    if command.trim_end().ends_with('?') {
        transport.query(command).await
    } else {
        transport.write(command).await.map(|_| "OK".to_string())
    }
}
