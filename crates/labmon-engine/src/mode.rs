//! Shared mode override cell.
//!
//! The state machine engine publishes the mode each state assigns to each
//! instrument here; the data collector reads it to decide a target's
//! effective mode. This cell is what breaks the engine↔collector cycle: the
//! engine never calls into a running pass and the collector never reaches
//! back into the engine.
//!
//! Each publish bumps an epoch. Whoever performs the activation (the engine
//! immediately on state entry while driving, or the collector at its next
//! pass) marks the epoch applied, so enable commands go out exactly once per
//! publish. Re-publishing the same mode bumps the epoch again, which is how
//! self-transitions re-apply their settings.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use labmon_core::capability::ModeParams;
use labmon_core::model::InstrumentSetting;

/// Mode choice plus the parameter values feeding its command placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeSelection {
    pub mode_id: String,
    pub mode_params: ModeParams,
}

#[derive(Debug)]
struct Entry {
    selection: ModeSelection,
    epoch: u64,
    applied_epoch: u64,
}

/// Per-`(setup, instrument)` override map. Cheap short-lived locks only; no
/// lock is ever held across I/O.
#[derive(Debug, Default)]
pub struct ModeOverrides {
    inner: RwLock<HashMap<(u64, u64), Entry>>,
}

impl ModeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish one instrument's mode for a setup, bumping the epoch.
    pub fn publish(&self, setup_id: u64, instrument_id: u64, selection: ModeSelection) {
        let mut inner = self.inner.write();
        let entry = inner
            .entry((setup_id, instrument_id))
            .or_insert_with(|| Entry {
                selection: selection.clone(),
                epoch: 0,
                applied_epoch: 0,
            });
        entry.selection = selection;
        entry.epoch += 1;
    }

    /// Publish a whole state's `instrument_settings`. Instruments the state
    /// does not mention keep their previous override: physically they are
    /// still in whatever mode was last enabled.
    pub fn publish_state(
        &self,
        setup_id: u64,
        settings: &BTreeMap<u64, InstrumentSetting>,
    ) {
        for (instrument_id, setting) in settings {
            self.publish(
                setup_id,
                *instrument_id,
                ModeSelection {
                    mode_id: setting.mode_id.clone(),
                    mode_params: setting.mode_params.clone(),
                },
            );
        }
    }

    /// Current override for an instrument, applied or not.
    pub fn current(&self, setup_id: u64, instrument_id: u64) -> Option<ModeSelection> {
        self.inner
            .read()
            .get(&(setup_id, instrument_id))
            .map(|e| e.selection.clone())
    }

    /// Selection with an epoch newer than the last applied one, i.e. enable
    /// commands still owed to the instrument.
    pub fn pending(&self, setup_id: u64, instrument_id: u64) -> Option<(ModeSelection, u64)> {
        self.inner
            .read()
            .get(&(setup_id, instrument_id))
            .filter(|e| e.epoch > e.applied_epoch)
            .map(|e| (e.selection.clone(), e.epoch))
    }

    /// Record that enables for `epoch` went out. A publish that raced in
    /// after the epoch was read stays pending.
    pub fn mark_applied(&self, setup_id: u64, instrument_id: u64, epoch: u64) {
        if let Some(entry) = self.inner.write().get_mut(&(setup_id, instrument_id)) {
            if epoch > entry.applied_epoch {
                entry.applied_epoch = epoch;
            }
        }
    }

    /// Whether any override exists for the setup, i.e. the state machine is
    /// driving it.
    pub fn is_driven(&self, setup_id: u64) -> bool {
        self.inner.read().keys().any(|(s, _)| *s == setup_id)
    }

    /// All current selections of a setup; used to send disable commands when
    /// a session tears down.
    pub fn selections(&self, setup_id: u64) -> Vec<(u64, ModeSelection)> {
        self.inner
            .read()
            .iter()
            .filter(|((s, _), _)| *s == setup_id)
            .map(|((_, i), e)| (*i, e.selection.clone()))
            .collect()
    }

    pub fn clear_setup(&self, setup_id: u64) {
        self.inner.write().retain(|(s, _), _| *s != setup_id);
    }
}
