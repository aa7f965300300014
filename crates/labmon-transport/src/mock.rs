//! Scripted mock transport for tests.
//!
//! Replies come from a command → reply table with an optional default;
//! failures can be injected per command prefix or for the whole session.
//! Every command sent is recorded so tests can assert on exactly what went
//! over the wire and in what order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use labmon_core::{TransportError, TransportErrorKind};

use crate::address::InstrumentAddress;
use crate::pool::TransportFactory;
use crate::Transport;

#[derive(Default)]
struct Script {
    replies: HashMap<String, String>,
    default_reply: Option<String>,
    fail_all: Option<TransportErrorKind>,
    fail_commands: HashMap<String, TransportErrorKind>,
    latency: Option<std::time::Duration>,
}

/// Shared behavior table, cloned into every session the factory opens.
#[derive(Clone, Default)]
pub struct MockBehavior {
    script: Arc<Mutex<Script>>,
    sent: Arc<Mutex<Vec<String>>>,
    connect_refused: Arc<Mutex<bool>>,
}

impl MockBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed reply for an exact command string.
    pub fn reply(&self, command: &str, reply: &str) -> &Self {
        self.script
            .lock()
            .replies
            .insert(command.to_string(), reply.to_string());
        self
    }

    /// Reply used when no exact match exists.
    pub fn default_reply(&self, reply: &str) -> &Self {
        self.script.lock().default_reply = Some(reply.to_string());
        self
    }

    /// Every subsequent operation fails with the given kind.
    pub fn fail_all(&self, kind: TransportErrorKind) {
        self.script.lock().fail_all = Some(kind);
    }

    /// Stop failing after [`MockBehavior::fail_all`].
    pub fn recover(&self) {
        self.script.lock().fail_all = None;
    }

    /// Fail one exact command with the given kind.
    pub fn fail_command(&self, command: &str, kind: TransportErrorKind) {
        self.script
            .lock()
            .fail_commands
            .insert(command.to_string(), kind);
    }

    /// Refuse future connection attempts from the factory.
    pub fn refuse_connections(&self, refused: bool) {
        *self.connect_refused.lock() = refused;
    }

    /// Delay every operation, simulating a slow instrument.
    pub fn latency(&self, delay: std::time::Duration) {
        self.script.lock().latency = Some(delay);
    }

    /// Every command sent through any session, in send order.
    pub fn sent_commands(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Commands sent matching a prefix.
    pub fn sent_matching(&self, prefix: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }
}

/// In-memory transport session driven by a [`MockBehavior`].
pub struct MockTransport {
    address: InstrumentAddress,
    behavior: MockBehavior,
    closed: Mutex<bool>,
}

impl MockTransport {
    pub fn new(address: InstrumentAddress, behavior: MockBehavior) -> Self {
        Self {
            address,
            behavior,
            closed: Mutex::new(false),
        }
    }

    async fn simulate_latency(&self) {
        let delay = self.behavior.script.lock().latency;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check(&self, command: &str) -> Result<(), TransportError> {
        if *self.closed.lock() {
            return Err(TransportError::new(
                TransportErrorKind::Unreachable,
                self.address.to_string(),
                "session is closed",
            ));
        }
        let script = self.behavior.script.lock();
        if let Some(kind) = script.fail_all {
            return Err(TransportError::new(
                kind,
                self.address.to_string(),
                "injected failure",
            ));
        }
        if let Some(kind) = script.fail_commands.get(command) {
            return Err(TransportError::new(
                *kind,
                self.address.to_string(),
                format!("injected failure for '{}'", command),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn query(&self, command: &str) -> Result<String, TransportError> {
        self.check(command)?;
        self.simulate_latency().await;
        self.behavior.sent.lock().push(command.to_string());
        let script = self.behavior.script.lock();
        if let Some(reply) = script.replies.get(command) {
            return Ok(reply.clone());
        }
        if let Some(default) = &script.default_reply {
            return Ok(default.clone());
        }
        Ok(format!("mock:{}", command))
    }

    async fn write(&self, command: &str) -> Result<(), TransportError> {
        self.check(command)?;
        self.simulate_latency().await;
        self.behavior.sent.lock().push(command.to_string());
        Ok(())
    }

    async fn close(&self) {
        *self.closed.lock() = true;
    }

    fn address(&self) -> &InstrumentAddress {
        &self.address
    }
}

/// Factory handing out sessions that all share one [`MockBehavior`].
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    pub behavior: MockBehavior,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn connect(
        &self,
        address: &InstrumentAddress,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if *self.behavior.connect_refused.lock() {
            return Err(TransportError::new(
                TransportErrorKind::Unreachable,
                address.to_string(),
                "injected connect refusal",
            ));
        }
        Ok(Arc::new(MockTransport::new(
            address.clone(),
            self.behavior.clone(),
        )))
    }
}
