//! Data collector: per-setup periodic sampling.
//!
//! One cancellable task per started setup produces a sample every `1/f`
//! seconds: resolve each target's effective mode, apply enable commands
//! edge-triggered, query every signal the mode measures, scale to
//! engineering units, and append the composite record to the readings ring.
//!
//! The effective mode of a target comes from the state machine's override
//! cell when the setup is being driven, otherwise from the target's own
//! standing `modeId` parameter. Enable commands go out only when the mode
//! actually changed (or the engine re-published it); transient transport
//! failures are recorded into the affected signal block and `last_error`
//! while the scheduler keeps ticking. Fatal problems — the setup deleted
//! mid-run, capability JSON made invalid — stop the task and surface in
//! status.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use labmon_core::capability::{Capability, Mode, ModeParams};
use labmon_core::model::{
    CollectorStatus, Instrument, MonitoringSetup, Sample, SignalReading, TargetSample,
};
use labmon_core::template::{expand_commands, parse_reply_number};
use labmon_core::{MonitorError, MonitorResult};
use labmon_store::readings::now_micros;
use labmon_store::{ConfigStore, ReadingsRing};
use labmon_transport::{SessionPool, Transport, TransportFactory};

use crate::mode::ModeOverrides;
use crate::ticker::DriftTicker;

/// State shared between a run's task and the collector's public surface.
struct RunShared {
    setup_id: u64,
    pool: SessionPool,
    running: AtomicBool,
    last_success: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    coalesced: AtomicU64,
    /// Instrument id → mode id last enabled through this run. Also the
    /// activation lock: held while enable commands go out so the engine's
    /// immediate application and a sampling pass cannot double-send.
    last_modes: Mutex<HashMap<u64, String>>,
}

impl RunShared {
    fn new(setup_id: u64, pool: SessionPool) -> Self {
        Self {
            setup_id,
            pool,
            running: AtomicBool::new(true),
            last_success: RwLock::new(None),
            last_error: RwLock::new(None),
            coalesced: AtomicU64::new(0),
            last_modes: Mutex::new(HashMap::new()),
        }
    }

    fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(setup_id = self.setup_id, error = %message, "collect error");
        *self.last_error.write() = Some(message);
    }
}

struct Run {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    shared: Arc<RunShared>,
}

/// Per-setup periodic sampling scheduler.
pub struct DataCollector {
    store: Arc<ConfigStore>,
    readings: Arc<ReadingsRing>,
    overrides: Arc<ModeOverrides>,
    factory: Arc<dyn TransportFactory>,
    runs: Mutex<HashMap<u64, Run>>,
    setup_locks: parking_lot::Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl DataCollector {
    pub fn new(
        store: Arc<ConfigStore>,
        readings: Arc<ReadingsRing>,
        overrides: Arc<ModeOverrides>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            store,
            readings,
            overrides,
            factory,
            runs: Mutex::new(HashMap::new()),
            setup_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Serializes start/stop/collect_now for one setup without blocking
    /// operations on other setups.
    fn setup_lock(&self, setup_id: u64) -> Arc<Mutex<()>> {
        Arc::clone(
            self.setup_locks
                .lock()
                .entry(setup_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Start periodic collection. Idempotent: starting a running setup is a
    /// no-op. Transport reachability is checked up front; a failure aborts
    /// the start and leaves nothing running.
    pub async fn start(&self, setup_id: u64) -> MonitorResult<()> {
        let lock = self.setup_lock(setup_id);
        let _guard = lock.lock().await;

        {
            let mut runs = self.runs.lock().await;
            if let Some(run) = runs.get(&setup_id) {
                if run.shared.running.load(Ordering::SeqCst) && !run.handle.is_finished() {
                    return Ok(());
                }
                runs.remove(&setup_id);
            }
        }

        let setup = self.store.get_setup(setup_id).await?;
        if !(setup.frequency_hz > 0.0) || !setup.frequency_hz.is_finite() {
            return Err(MonitorError::validation(
                "frequency_hz",
                "must be a positive number",
            ));
        }
        let pool = SessionPool::new(Arc::clone(&self.factory));

        let mut addresses = Vec::new();
        for target in &setup.instruments {
            let instrument = self.store.get_instrument(target.instrument_id).await?;
            if !instrument.is_active {
                return Err(MonitorError::validation(
                    "instruments",
                    format!("instrument {} is not active", instrument.id),
                ));
            }
            addresses.push(instrument.address);
        }
        if let Err(e) = pool
            .open_all(addresses.iter().map(String::as_str))
            .await
        {
            pool.close_all().await;
            return Err(e.into());
        }

        let shared = Arc::new(RunShared::new(setup_id, pool));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.readings),
            Arc::clone(&self.overrides),
            Arc::clone(&shared),
            cancel.clone(),
            setup.period(),
        ));

        tracing::info!(setup_id, frequency_hz = setup.frequency_hz, "collector started");
        self.runs.lock().await.insert(
            setup_id,
            Run {
                cancel,
                handle,
                shared,
            },
        );
        Ok(())
    }

    /// Stop collection. Idempotent. When this returns the task has exited
    /// and every pooled session is closed: no further sample or command for
    /// the setup can appear.
    pub async fn stop(&self, setup_id: u64) -> MonitorResult<()> {
        let lock = self.setup_lock(setup_id);
        let _guard = lock.lock().await;

        let run = self.runs.lock().await.remove(&setup_id);
        let Some(run) = run else {
            return Ok(());
        };

        run.cancel.cancel();
        if let Err(e) = run.handle.await {
            if e.is_panic() {
                run.shared.record_error("collector task panicked");
            }
        }
        run.shared.running.store(false, Ordering::SeqCst);
        run.shared.pool.close_all().await;
        tracing::info!(setup_id, "collector stopped");
        Ok(())
    }

    /// Perform one sampling pass synchronously and return the sample.
    ///
    /// Uses the running task's sessions and activation state when the setup
    /// is collecting; otherwise opens an ephemeral pool for the single pass.
    pub async fn collect_now(&self, setup_id: u64) -> MonitorResult<Sample> {
        let lock = self.setup_lock(setup_id);
        let _guard = lock.lock().await;

        let existing = {
            let runs = self.runs.lock().await;
            runs.get(&setup_id).map(|r| Arc::clone(&r.shared))
        };

        match existing {
            Some(shared) => {
                collect_pass(&self.store, &self.readings, &self.overrides, &shared).await
            }
            None => {
                let pool = SessionPool::new(Arc::clone(&self.factory));
                let shared = Arc::new(RunShared::new(setup_id, pool));
                let result =
                    collect_pass(&self.store, &self.readings, &self.overrides, &shared).await;
                shared.pool.close_all().await;
                result
            }
        }
    }

    /// Status snapshot for one setup.
    pub async fn status(&self, setup_id: u64) -> CollectorStatus {
        let runs = self.runs.lock().await;
        let Some(run) = runs.get(&setup_id) else {
            return CollectorStatus::default();
        };
        let mut running = run.shared.running.load(Ordering::SeqCst);
        let mut last_error = run.shared.last_error.read().clone();
        if running && run.handle.is_finished() {
            // Task died without going through stop(): panic isolation path.
            running = false;
            last_error.get_or_insert_with(|| "collector task terminated unexpectedly".into());
        }
        let status = CollectorStatus {
            running,
            last_success_ts: *run.shared.last_success.read(),
            last_error,
            coalesced_ticks: run.shared.coalesced.load(Ordering::Relaxed),
        };
        status
    }

    pub async fn is_running(&self, setup_id: u64) -> bool {
        self.status(setup_id).await.running
    }

    /// Apply pending mode overrides right now instead of at the next pass.
    ///
    /// Called by the state machine engine on state entry while driving; also
    /// covers instruments a state configures that are not sampling targets.
    /// Transport failures are recorded and leave the override pending for a
    /// retry at the next pass; an unresolved `{placeholder}` is a hard error
    /// for the caller.
    pub async fn apply_pending_modes(&self, setup_id: u64) -> MonitorResult<()> {
        let shared = {
            let runs = self.runs.lock().await;
            runs.get(&setup_id).map(|r| Arc::clone(&r.shared))
        };
        let Some(shared) = shared else {
            // Not collecting yet; the first pass applies what is pending.
            return Ok(());
        };

        for (instrument_id, _) in self.overrides.selections(setup_id) {
            let Some((selection, epoch)) = self.overrides.pending(setup_id, instrument_id)
            else {
                continue;
            };
            let instrument = self.store.get_instrument(instrument_id).await?;
            let capability = instrument.capability()?;
            let mode = capability.mode_by_id(&selection.mode_id).ok_or_else(|| {
                MonitorError::validation(
                    "instrumentSettings",
                    format!(
                        "mode '{}' does not exist on instrument {}",
                        selection.mode_id, instrument_id
                    ),
                )
            })?;

            // Placeholder expansion failures propagate; transport failures
            // are recorded and retried on the next pass.
            let commands = expand_commands(mode.enable_commands.iter(), &selection.mode_params)?;
            match shared.pool.session(&instrument.address).await {
                Ok(session) => {
                    let mut last_modes = shared.last_modes.lock().await;
                    // Re-check under the activation lock; a concurrent pass
                    // may have applied this epoch already.
                    if self.overrides.pending(setup_id, instrument_id).is_none() {
                        continue;
                    }
                    if send_enable_commands(&session, &commands, &shared).await {
                        last_modes.insert(instrument_id, mode.id.clone());
                        self.overrides.mark_applied(setup_id, instrument_id, epoch);
                    }
                }
                Err(e) => shared.record_error(e.to_string()),
            }
        }
        Ok(())
    }

    /// Send a mode's disable commands, best effort. Used when a driving
    /// session tears down or rolls back a partial start.
    pub async fn send_disable_commands(
        &self,
        pool: &SessionPool,
        instrument: &Instrument,
        mode_id: &str,
        params: &ModeParams,
    ) {
        let capability = match instrument.capability() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(instrument = instrument.id, error = %e, "disable skipped");
                return;
            }
        };
        let Some(mode) = capability.mode_by_id(mode_id) else {
            return;
        };
        let commands = match expand_commands(mode.disable_commands.iter(), params) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(instrument = instrument.id, error = %e, "disable skipped");
                return;
            }
        };
        match pool.session(&instrument.address).await {
            Ok(session) => {
                for command in &commands {
                    if let Err(e) = session.write(command).await {
                        tracing::warn!(
                            instrument = instrument.id,
                            command = %command,
                            error = %e,
                            "disable command failed"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(instrument = instrument.id, error = %e, "disable skipped");
            }
        }
    }

    /// Stop every running setup; part of ordered shutdown.
    pub async fn stop_all(&self) {
        let setup_ids: Vec<u64> = self.runs.lock().await.keys().copied().collect();
        for setup_id in setup_ids {
            if let Err(e) = self.stop(setup_id).await {
                tracing::warn!(setup_id, error = %e, "collector stop failed");
            }
        }
    }
}

/// The per-setup scheduler task.
async fn run_loop(
    store: Arc<ConfigStore>,
    readings: Arc<ReadingsRing>,
    overrides: Arc<ModeOverrides>,
    shared: Arc<RunShared>,
    cancel: CancellationToken,
    period: std::time::Duration,
) {
    let mut ticker = DriftTicker::new(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                shared.coalesced.store(ticker.coalesced(), Ordering::Relaxed);
                // The pass itself also races the cancel signal so stop()
                // aborts in-flight transport I/O instead of draining it.
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = collect_pass(&store, &readings, &overrides, &shared) => result,
                };
                match result {
                    Ok(_) => {}
                    Err(e) if is_fatal(&e) => {
                        shared.record_error(e.to_string());
                        shared.running.store(false, Ordering::SeqCst);
                        tracing::error!(
                            setup_id = shared.setup_id,
                            error = %e,
                            "collector stopping on fatal error"
                        );
                        break;
                    }
                    Err(e) => shared.record_error(e.to_string()),
                }
            }
        }
    }
    shared.running.store(false, Ordering::SeqCst);
}

/// A pass-level error that should stop the scheduler rather than be retried
/// next tick.
fn is_fatal(error: &MonitorError) -> bool {
    matches!(
        error,
        MonitorError::NotFound { .. }
            | MonitorError::Validation { .. }
            | MonitorError::Corruption { .. }
            | MonitorError::Serialization(_)
            | MonitorError::Internal(_)
    )
}

/// One sampling pass over every target of the setup.
async fn collect_pass(
    store: &ConfigStore,
    readings: &ReadingsRing,
    overrides: &ModeOverrides,
    shared: &RunShared,
) -> MonitorResult<Sample> {
    // Reload the setup each pass so target/mode edits take effect without a
    // restart; a deleted setup is the fatal path.
    let setup = store.get_setup(shared.setup_id).await?;

    let mut targets = Vec::with_capacity(setup.instruments.len());
    for target in &setup.instruments {
        let instrument = store.get_instrument(target.instrument_id).await?;
        let capability = instrument.capability()?;
        targets.push(
            sample_target(&setup, &instrument, &capability, overrides, shared).await,
        );
    }

    let sample = Sample {
        timestamp: now_micros(),
        setup_id: setup.id,
        setup_name: setup.name.clone(),
        targets,
    };
    let sample = readings.append(sample).await?;
    *shared.last_success.write() = Some(sample.timestamp);
    Ok(sample)
}

/// Sample one target: resolve its effective mode, activate it when changed,
/// then query every signal the mode measures.
async fn sample_target(
    setup: &MonitoringSetup,
    instrument: &Instrument,
    capability: &Capability,
    overrides: &ModeOverrides,
    shared: &RunShared,
) -> TargetSample {
    let mut out = TargetSample {
        instrument_id: instrument.id,
        instrument_name: instrument.name.clone(),
        mode_name: String::new(),
        signals: BTreeMap::new(),
    };

    // Effective mode: the engine's override while driven, else the target's
    // standing parameter.
    let driven = overrides.current(setup.id, instrument.id);
    let (mode_id, params) = match &driven {
        Some(selection) => (selection.mode_id.clone(), selection.mode_params.clone()),
        None => {
            let target = match setup.target(instrument.id) {
                Some(t) => t,
                None => return out,
            };
            match &target.parameters.mode_id {
                Some(mode_id) => (mode_id.clone(), target.parameters.mode_params.clone()),
                // No standing mode and nothing driving: nothing to measure.
                None => return out,
            }
        }
    };

    let Some(mode) = capability.mode_by_id(&mode_id) else {
        shared.record_error(format!(
            "mode '{}' does not exist on instrument {}",
            mode_id, instrument.id
        ));
        return out;
    };
    out.mode_name = mode.name.clone();

    let measured = capability.signals_in_mode(&mode.id);

    let session = match shared.pool.session(&instrument.address).await {
        Ok(session) => session,
        Err(e) => {
            shared.record_error(e.to_string());
            for (signal, config) in measured {
                out.signals.insert(
                    signal.name.clone(),
                    error_reading(&config.unit, e.to_string()),
                );
            }
            return out;
        }
    };

    if !activate_mode(instrument.id, mode, &params, &driven, overrides, shared, &session)
        .await
    {
        // Activation failed; readings in an unknown mode would be
        // misleading, so report the failure on every signal instead.
        let message = shared
            .last_error
            .read()
            .clone()
            .unwrap_or_else(|| "mode activation failed".into());
        for (signal, config) in measured {
            out.signals
                .insert(signal.name.clone(), error_reading(&config.unit, message.clone()));
        }
        return out;
    }

    // Signals of one target go out sequentially, in capability declaration
    // order.
    for (signal, config) in measured {
        let reading = match session.query(&signal.measure_command).await {
            Ok(reply) => {
                let raw = parse_reply_number(&reply);
                SignalReading {
                    value: raw.map(|r| r * config.scaling_factor),
                    raw_value: raw,
                    unit: config.unit.clone(),
                    raw_response: reply,
                    error: None,
                }
            }
            Err(e) => {
                shared.record_error(e.to_string());
                error_reading(&config.unit, e.to_string())
            }
        };
        out.signals.insert(signal.name.clone(), reading);
    }

    out
}

/// Edge-triggered mode activation for one target within a pass.
///
/// Returns false when activation was required and failed; readings must not
/// proceed in that case.
async fn activate_mode(
    instrument_id: u64,
    mode: &Mode,
    params: &ModeParams,
    driven: &Option<crate::mode::ModeSelection>,
    overrides: &ModeOverrides,
    shared: &RunShared,
    session: &Arc<dyn Transport>,
) -> bool {
    let mut last_modes = shared.last_modes.lock().await;

    let pending_epoch = if driven.is_some() {
        match overrides.pending(shared.setup_id, instrument_id) {
            Some((_, epoch)) => Some(epoch),
            // Driven and nothing pending: whoever published last already
            // activated (or the engine did on state entry).
            None => return true,
        }
    } else {
        if last_modes.get(&instrument_id) == Some(&mode.id) {
            return true;
        }
        None
    };

    let commands = match expand_commands(mode.enable_commands.iter(), params) {
        Ok(commands) => commands,
        Err(e) => {
            shared.record_error(e.to_string());
            return false;
        }
    };

    if !send_enable_commands(session, &commands, shared).await {
        return false;
    }

    tracing::debug!(
        setup_id = shared.setup_id,
        instrument = instrument_id,
        mode = %mode.id,
        "mode activated"
    );
    last_modes.insert(instrument_id, mode.id.clone());
    if let Some(epoch) = pending_epoch {
        overrides.mark_applied(shared.setup_id, instrument_id, epoch);
    }
    true
}

async fn send_enable_commands(
    session: &Arc<dyn Transport>,
    commands: &[String],
    shared: &RunShared,
) -> bool {
    for command in commands {
        if let Err(e) = session.write(command).await {
            shared.record_error(e.to_string());
            return false;
        }
    }
    true
}

fn error_reading(unit: &str, message: String) -> SignalReading {
    SignalReading {
        value: None,
        raw_value: None,
        unit: unit.to_string(),
        raw_response: String::new(),
        error: Some(message),
    }
}
