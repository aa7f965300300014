//! Per-`(host, device)` session pool.
//!
//! A pool belongs to one running setup: sessions are opened on demand, kept
//! for the lifetime of the run, and never shared across setups. Each session
//! serializes its own wire I/O, so pooling is purely about connection reuse
//! across state transitions and sampling passes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use labmon_core::TransportError;

use crate::address::InstrumentAddress;
use crate::Transport;

/// Opens transport sessions. The TCP factory is the production
/// implementation; tests inject the mock.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        address: &InstrumentAddress,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Session cache keyed by `(host, port, device)`.
pub struct SessionPool {
    factory: Arc<dyn TransportFactory>,
    sessions: Mutex<HashMap<String, Arc<dyn Transport>>>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Session for an address string, opening one on first use.
    pub async fn session(&self, address: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let parsed: InstrumentAddress = address.parse()?;
        let key = parsed.session_key();

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&key) {
            return Ok(Arc::clone(session));
        }
        let session = self.factory.connect(&parsed).await?;
        sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    /// Open sessions for every address up front; used as the reachability
    /// check before a run starts. Fails on the first unreachable address.
    pub async fn open_all<'a, I>(&self, addresses: I) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for address in addresses {
            self.session(address).await?;
        }
        Ok(())
    }

    /// Close and drop every pooled session.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<dyn Transport>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
