//! State machine engine: per-setup tick loop driving instrument
//! configuration.
//!
//! A session caches its setup definition at start, enters the initial state,
//! and then evaluates the current state's outgoing transitions once per tick
//! (1 Hz by default). Transitions are checked in setup declaration order and
//! the first whose rules all hold wins. Entering a state publishes its
//! `instrument_settings` into the shared override cell and applies them
//! immediately through the collector; entering an end state tears the
//! session down: the collector is stopped, the current mode of every driven
//! instrument gets its disable commands (best effort), and the override cell
//! is cleared.
//!
//! Startup is all-or-nothing: preconditions are validated, transport
//! reachability is checked for every referenced instrument, and a failure
//! after partial side effects rolls the modes back with their disable
//! commands before `start` returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use labmon_core::model::{MonitoringSetup, SessionStatus, State};
use labmon_core::template::expand_commands;
use labmon_core::{validate, MonitorError, MonitorResult};
use labmon_store::{ConfigStore, ReadingsRing};
use labmon_transport::{SessionPool, TransportFactory};

use crate::collector::DataCollector;
use crate::mode::ModeOverrides;
use crate::rules::{transition_fires, RuleContext};
use crate::ticker::DriftTicker;

/// Default evaluation cadence.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);

struct SessionShared {
    setup_id: u64,
    /// Definition snapshot taken at start; edits to the stored setup do not
    /// affect a running session.
    setup: MonitoringSetup,
    /// Engine-owned sessions: reachability check at start, disable commands
    /// at teardown. Never used concurrently with a sampling pass.
    pool: SessionPool,
    running: AtomicBool,
    torn_down: AtomicBool,
    current_state: RwLock<Option<String>>,
    state_entered_at: RwLock<Option<DateTime<Utc>>>,
    session_started_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl SessionShared {
    fn status(&self) -> SessionStatus {
        let running = self.running.load(Ordering::SeqCst);
        let now = Utc::now();
        let state_entered_at = *self.state_entered_at.read();
        let session_started_at = *self.session_started_at.read();
        SessionStatus {
            setup_id: self.setup_id,
            running,
            current_state_id: self.current_state.read().clone(),
            session_started_at,
            state_entered_at,
            time_in_current_state_s: running
                .then(|| state_entered_at.map(|t| (now - t).num_milliseconds() as f64 / 1e3))
                .flatten(),
            total_session_time_s: running
                .then(|| session_started_at.map(|t| (now - t).num_milliseconds() as f64 / 1e3))
                .flatten(),
            last_error: self.last_error.read().clone(),
        }
    }
}

struct Session {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    shared: Arc<SessionShared>,
}

/// Per-setup state machine sessions.
pub struct StateMachineEngine {
    store: Arc<ConfigStore>,
    readings: Arc<ReadingsRing>,
    overrides: Arc<ModeOverrides>,
    collector: Arc<DataCollector>,
    factory: Arc<dyn TransportFactory>,
    tick_period: Duration,
    sessions: Mutex<HashMap<u64, Session>>,
    setup_locks: parking_lot::Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl StateMachineEngine {
    pub fn new(
        store: Arc<ConfigStore>,
        readings: Arc<ReadingsRing>,
        overrides: Arc<ModeOverrides>,
        collector: Arc<DataCollector>,
        factory: Arc<dyn TransportFactory>,
        tick_period: Duration,
    ) -> Self {
        Self {
            store,
            readings,
            overrides,
            collector,
            factory,
            tick_period,
            sessions: Mutex::new(HashMap::new()),
            setup_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn setup_lock(&self, setup_id: u64) -> Arc<Mutex<()>> {
        Arc::clone(
            self.setup_locks
                .lock()
                .entry(setup_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Start a driving session for a setup. A session already running for
    /// the setup is stopped and replaced.
    pub async fn start(&self, setup_id: u64) -> MonitorResult<SessionStatus> {
        let lock = self.setup_lock(setup_id);
        let _guard = lock.lock().await;

        self.stop_locked(setup_id).await?;

        let setup = self.store.get_setup(setup_id).await?;
        let instruments = self.store.list_instruments().await?;
        validate::validate_setup(&setup, &instruments)?;
        let initial_state = validate_preconditions(&setup)?;

        // Every `{placeholder}` any state uses must be covered by that
        // state's parameters; catching it here keeps ParameterMissing from
        // surfacing mid-session.
        validate_state_parameters(&setup, &instruments)?;

        // Reachability check: open engine sessions for every referenced
        // instrument up front.
        let pool = SessionPool::new(Arc::clone(&self.factory));
        let mut addresses = Vec::new();
        for id in referenced_instrument_ids(&setup) {
            if let Some(instrument) = instruments.iter().find(|i| i.id == id) {
                addresses.push(instrument.address.clone());
            }
        }
        if let Err(e) = pool.open_all(addresses.iter().map(String::as_str)).await {
            pool.close_all().await;
            return Err(e.into());
        }

        let shared = Arc::new(SessionShared {
            setup_id,
            setup: setup.clone(),
            pool,
            running: AtomicBool::new(true),
            torn_down: AtomicBool::new(false),
            current_state: RwLock::new(None),
            state_entered_at: RwLock::new(None),
            session_started_at: RwLock::new(Some(Utc::now())),
            last_error: RwLock::new(None),
        });

        // Enter the initial state: bookkeeping plus override publication.
        // The collector is not running yet, so actual enable commands go out
        // through apply_pending_modes below (or the first sampling pass).
        *shared.current_state.write() = Some(initial_state.id.clone());
        *shared.state_entered_at.write() = Some(Utc::now());
        self.overrides
            .publish_state(setup_id, &initial_state.instrument_settings);
        tracing::info!(setup_id, state = %initial_state.id, "session entering initial state");

        // Driving implies collecting.
        let collector_was_running = self.collector.is_running(setup_id).await;
        if let Err(e) = self.collector.start(setup_id).await {
            self.rollback_start(&shared, collector_was_running).await;
            return Err(e);
        }
        if let Err(e) = self.collector.apply_pending_modes(setup_id).await {
            self.rollback_start(&shared, collector_was_running).await;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.readings),
            Arc::clone(&self.overrides),
            Arc::clone(&self.collector),
            Arc::clone(&shared),
            cancel.clone(),
            self.tick_period,
        ));

        let status = shared.status();
        self.sessions.lock().await.insert(
            setup_id,
            Session {
                cancel,
                handle: Some(handle),
                shared,
            },
        );
        tracing::info!(setup_id, "state machine session started");
        Ok(status)
    }

    /// Undo partial startup side effects: stop the collector unless it was
    /// already collecting before this start, send disable commands for
    /// anything enabled, and clear the overrides.
    async fn rollback_start(&self, shared: &Arc<SessionShared>, collector_was_running: bool) {
        if !collector_was_running {
            if let Err(e) = self.collector.stop(shared.setup_id).await {
                tracing::warn!(setup_id = shared.setup_id, error = %e, "rollback collector stop failed");
            }
        }
        send_all_disables(&self.store, &self.collector, &self.overrides, shared).await;
        self.overrides.clear_setup(shared.setup_id);
        shared.pool.close_all().await;
        shared.running.store(false, Ordering::SeqCst);
    }

    /// Stop a session. Idempotent; stopping a setup with no session is a
    /// no-op.
    pub async fn stop(&self, setup_id: u64) -> MonitorResult<()> {
        let lock = self.setup_lock(setup_id);
        let _guard = lock.lock().await;
        self.stop_locked(setup_id).await
    }

    async fn stop_locked(&self, setup_id: u64) -> MonitorResult<()> {
        let (cancel, handle, shared) = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&setup_id) {
                Some(session) => (
                    session.cancel.clone(),
                    session.handle.take(),
                    Arc::clone(&session.shared),
                ),
                None => return Ok(()),
            }
        };

        cancel.cancel();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    *shared.last_error.write() =
                        Some("state machine task panicked".to_string());
                }
            }
        }
        teardown(&self.store, &self.collector, &self.overrides, &shared).await;
        tracing::info!(setup_id, "state machine session stopped");
        Ok(())
    }

    /// Session status snapshot. A setup that never started reports
    /// not-running with empty fields.
    pub async fn status(&self, setup_id: u64) -> SessionStatus {
        let sessions = self.sessions.lock().await;
        match sessions.get(&setup_id) {
            Some(session) => {
                let mut status = session.shared.status();
                if status.running
                    && session
                        .handle
                        .as_ref()
                        .map(|h| h.is_finished())
                        .unwrap_or(false)
                {
                    status.running = false;
                    status
                        .last_error
                        .get_or_insert_with(|| "session task terminated unexpectedly".into());
                }
                status
            }
            None => SessionStatus {
                setup_id,
                ..SessionStatus::default()
            },
        }
    }

    /// Status of every session the engine knows about.
    pub async fn all_statuses(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|s| s.shared.status()).collect()
    }

    /// Stop every running session; part of ordered shutdown.
    pub async fn stop_all(&self) {
        let setup_ids: Vec<u64> = self.sessions.lock().await.keys().copied().collect();
        for setup_id in setup_ids {
            if let Err(e) = self.stop(setup_id).await {
                tracing::warn!(setup_id, error = %e, "session stop failed");
            }
        }
    }
}

/// Start preconditions beyond general setup validity: a state machine with
/// an initial state that exists and is not an end state.
fn validate_preconditions(setup: &MonitoringSetup) -> MonitorResult<&State> {
    if setup.states.is_empty() {
        return Err(MonitorError::validation(
            "states",
            "setup has no state machine",
        ));
    }
    let initial_id = setup.initial_state_id.as_deref().ok_or_else(|| {
        MonitorError::validation("initialStateID", "no initial state configured")
    })?;
    let state = setup.state(initial_id).ok_or_else(|| {
        MonitorError::validation(
            "initialStateID",
            format!("state '{}' does not exist", initial_id),
        )
    })?;
    if state.is_end_state {
        return Err(MonitorError::validation(
            "initialStateID",
            "initial state must not be an end state",
        ));
    }
    Ok(state)
}

/// Expand every state's enable and disable scripts against that state's
/// parameters so unresolved placeholders fail the start, not a state entry.
fn validate_state_parameters(
    setup: &MonitoringSetup,
    instruments: &[labmon_core::model::Instrument],
) -> MonitorResult<()> {
    for state in &setup.states {
        for (instrument_id, setting) in &state.instrument_settings {
            let Some(instrument) = instruments.iter().find(|i| i.id == *instrument_id) else {
                continue; // caught by validate_setup
            };
            let capability = instrument.capability()?;
            let Some(mode) = capability.mode_by_id(&setting.mode_id) else {
                continue; // caught by validate_setup
            };
            let commands = mode
                .enable_commands
                .iter()
                .chain(mode.disable_commands.iter());
            expand_commands(commands, &setting.mode_params).map_err(|e| {
                MonitorError::validation(
                    format!("states['{}'].instrumentSettings", state.id),
                    e.to_string(),
                )
            })?;
        }
    }
    Ok(())
}

/// Every instrument id a setup references, targets and state settings both.
fn referenced_instrument_ids(setup: &MonitoringSetup) -> Vec<u64> {
    let mut ids: Vec<u64> = setup.instruments.iter().map(|t| t.instrument_id).collect();
    for state in &setup.states {
        for id in state.instrument_settings.keys() {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
    }
    ids
}

enum TickOutcome {
    Continue,
    Finished,
    Failed(String),
}

/// The per-session tick task.
async fn session_loop(
    store: Arc<ConfigStore>,
    readings: Arc<ReadingsRing>,
    overrides: Arc<ModeOverrides>,
    collector: Arc<DataCollector>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    tick_period: Duration,
) {
    let mut ticker = DriftTicker::new(tick_period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = tick_once(&readings, &overrides, &collector, &shared) => outcome,
                };
                match outcome {
                    TickOutcome::Continue => {}
                    TickOutcome::Finished => {
                        teardown(&store, &collector, &overrides, &shared).await;
                        break;
                    }
                    TickOutcome::Failed(message) => {
                        tracing::error!(
                            setup_id = shared.setup_id,
                            error = %message,
                            "session failed"
                        );
                        *shared.last_error.write() = Some(message);
                        teardown(&store, &collector, &overrides, &shared).await;
                        break;
                    }
                }
            }
        }
    }
}

/// One evaluation cycle: gather context, test outgoing transitions in
/// declaration order, enter the first winner's target state.
async fn tick_once(
    readings: &ReadingsRing,
    overrides: &ModeOverrides,
    collector: &DataCollector,
    shared: &Arc<SessionShared>,
) -> TickOutcome {
    let Some(current) = shared.current_state.read().clone() else {
        return TickOutcome::Failed("session has no current state".into());
    };

    let now = Utc::now();
    let time_in_state = shared
        .state_entered_at
        .read()
        .map(|t| (now - t).to_std().unwrap_or_default())
        .unwrap_or_default();
    let total_time = shared
        .session_started_at
        .read()
        .map(|t| (now - t).to_std().unwrap_or_default())
        .unwrap_or_default();

    let latest = readings.latest(shared.setup_id, 1).into_iter().next();
    let ctx = RuleContext {
        latest_sample: latest.as_ref(),
        time_in_state,
        total_time,
    };

    let winner = shared
        .setup
        .outgoing_transitions(&current)
        .into_iter()
        .find(|t| transition_fires(t, &ctx));

    let Some(transition) = winner else {
        return TickOutcome::Continue;
    };

    tracing::info!(
        setup_id = shared.setup_id,
        from = %current,
        to = %transition.target_state_id,
        "transition fired"
    );
    enter_state(overrides, collector, shared, &transition.target_state_id).await
}

/// Enter a state: bookkeeping, override publication, immediate mode
/// application. Self-transitions come through here too and re-apply their
/// settings because each publish bumps the override epoch.
async fn enter_state(
    overrides: &ModeOverrides,
    collector: &DataCollector,
    shared: &Arc<SessionShared>,
    state_id: &str,
) -> TickOutcome {
    let Some(state) = shared.setup.state(state_id) else {
        return TickOutcome::Failed(format!("state '{}' does not exist", state_id));
    };

    *shared.current_state.write() = Some(state.id.clone());
    *shared.state_entered_at.write() = Some(Utc::now());
    overrides.publish_state(shared.setup_id, &state.instrument_settings);

    // Driving, so apply right away rather than waiting for the next sample.
    if let Err(e) = collector.apply_pending_modes(shared.setup_id).await {
        return TickOutcome::Failed(e.to_string());
    }

    if state.is_end_state {
        tracing::info!(setup_id = shared.setup_id, state = %state.id, "end state reached");
        return TickOutcome::Finished;
    }
    TickOutcome::Continue
}

/// Disable the current mode of every driven instrument, best effort.
async fn send_all_disables(
    store: &ConfigStore,
    collector: &DataCollector,
    overrides: &ModeOverrides,
    shared: &Arc<SessionShared>,
) {
    for (instrument_id, selection) in overrides.selections(shared.setup_id) {
        match store.get_instrument(instrument_id).await {
            Ok(instrument) => {
                collector
                    .send_disable_commands(
                        &shared.pool,
                        &instrument,
                        &selection.mode_id,
                        &selection.mode_params,
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(instrument = instrument_id, error = %e, "disable skipped");
            }
        }
    }
}

/// Idempotent session teardown: stop collection, disable modes, clear
/// overrides, release engine sessions.
async fn teardown(
    store: &ConfigStore,
    collector: &DataCollector,
    overrides: &ModeOverrides,
    shared: &Arc<SessionShared>,
) {
    if shared.torn_down.swap(true, Ordering::SeqCst) {
        return;
    }
    shared.running.store(false, Ordering::SeqCst);

    if let Err(e) = collector.stop(shared.setup_id).await {
        tracing::warn!(setup_id = shared.setup_id, error = %e, "collector stop failed");
    }
    send_all_disables(store, collector, overrides, shared).await;
    overrides.clear_setup(shared.setup_id);
    shared.pool.close_all().await;
}
