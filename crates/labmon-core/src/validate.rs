//! Referential-integrity and uniqueness validation.
//!
//! Applied by the configuration store on every create/update and by the
//! state machine engine before a session starts. Violations surface as
//! `MonitorError::Validation` carrying the offending field, or as
//! `MonitorError::NameTaken` for uniqueness conflicts.

use std::collections::{HashMap, HashSet};

use crate::capability::Capability;
use crate::error::{MonitorError, MonitorResult};
use crate::model::{Instrument, MonitoringSetup};

/// Name uniqueness within a collection, ignoring the entity itself on
/// update.
pub fn check_name_unique<'a, I>(name: &str, taken: I, own_id: Option<u64>) -> MonitorResult<()>
where
    I: IntoIterator<Item = (u64, &'a str)>,
{
    for (id, existing) in taken {
        if Some(id) != own_id && existing == name {
            return Err(MonitorError::NameTaken(name.to_string()));
        }
    }
    Ok(())
}

/// Validate an instrument definition before it is persisted.
///
/// The capability JSON must parse (an unparseable descriptor would
/// otherwise surface only when a setup using it starts) and every mode /
/// signal id inside it must be unique.
pub fn validate_instrument(name: &str, address: &str, description: &str) -> MonitorResult<()> {
    if name.trim().is_empty() {
        return Err(MonitorError::validation("name", "must not be empty"));
    }
    if address.trim().is_empty() {
        return Err(MonitorError::validation("address", "must not be empty"));
    }

    let capability = Capability::parse(description)?;
    let mut seen = HashSet::new();
    for signal in &capability.signals {
        if !seen.insert(format!("signal:{}", signal.id)) {
            return Err(MonitorError::validation(
                "description",
                format!("duplicate signal id '{}'", signal.id),
            ));
        }
    }
    seen.clear();
    for mode in &capability.modes {
        if !seen.insert(mode.id.clone()) {
            return Err(MonitorError::validation(
                "description",
                format!("duplicate mode id '{}'", mode.id),
            ));
        }
    }
    for config in &capability.signal_mode_configs {
        if capability.signal_by_id(&config.signal_id).is_none() {
            return Err(MonitorError::validation(
                "description",
                format!("matrix references unknown signal '{}'", config.signal_id),
            ));
        }
        if capability.mode_by_id(&config.mode_id).is_none() {
            return Err(MonitorError::validation(
                "description",
                format!("matrix references unknown mode '{}'", config.mode_id),
            ));
        }
    }
    Ok(())
}

/// Validate a monitoring setup against the current instrument collection.
///
/// Enforces the structural invariants: positive cadence, non-empty targets,
/// active instrument references, state id uniqueness, transition endpoint
/// resolution, initial state resolution, and that every mode a state
/// applies resolves in the instrument's capability.
pub fn validate_setup(setup: &MonitoringSetup, instruments: &[Instrument]) -> MonitorResult<()> {
    if setup.name.trim().is_empty() {
        return Err(MonitorError::validation("name", "must not be empty"));
    }
    if !(setup.frequency_hz > 0.0) || !setup.frequency_hz.is_finite() {
        return Err(MonitorError::validation(
            "frequency_hz",
            "must be a positive number",
        ));
    }
    if setup.instruments.is_empty() {
        return Err(MonitorError::validation(
            "instruments",
            "setup needs at least one target",
        ));
    }

    let by_id: HashMap<u64, &Instrument> = instruments.iter().map(|i| (i.id, i)).collect();

    let mut capabilities: HashMap<u64, Capability> = HashMap::new();
    let mut resolve_active = |instrument_id: u64,
                              field: &str,
                              capabilities: &mut HashMap<u64, Capability>|
     -> MonitorResult<()> {
        let instrument = by_id.get(&instrument_id).ok_or_else(|| {
            MonitorError::validation(
                field,
                format!("instrument {} does not exist", instrument_id),
            )
        })?;
        if !instrument.is_active {
            return Err(MonitorError::validation(
                field,
                format!("instrument {} is not active", instrument_id),
            ));
        }
        if !capabilities.contains_key(&instrument_id) {
            capabilities.insert(instrument_id, instrument.capability()?);
        }
        Ok(())
    };

    for (idx, target) in setup.instruments.iter().enumerate() {
        let field = format!("instruments[{}]", idx);
        resolve_active(target.instrument_id, &field, &mut capabilities)?;
        if let Some(mode_id) = &target.parameters.mode_id {
            let capability = &capabilities[&target.instrument_id];
            if capability.mode_by_id(mode_id).is_none() {
                return Err(MonitorError::validation(
                    field,
                    format!(
                        "mode '{}' does not exist on instrument {}",
                        mode_id, target.instrument_id
                    ),
                ));
            }
        }
    }

    // State machine structure, when present.
    let mut state_ids = HashSet::new();
    for state in &setup.states {
        if state.id.trim().is_empty() {
            return Err(MonitorError::validation("states", "state id must not be empty"));
        }
        if !state_ids.insert(state.id.as_str()) {
            return Err(MonitorError::validation(
                "states",
                format!("duplicate state id '{}'", state.id),
            ));
        }
    }

    for state in &setup.states {
        for (instrument_id, setting) in &state.instrument_settings {
            let field = format!("states['{}'].instrumentSettings", state.id);
            resolve_active(*instrument_id, &field, &mut capabilities)?;
            let capability = &capabilities[instrument_id];
            if capability.mode_by_id(&setting.mode_id).is_none() {
                return Err(MonitorError::validation(
                    field,
                    format!(
                        "mode '{}' does not exist on instrument {}",
                        setting.mode_id, instrument_id
                    ),
                ));
            }
        }
    }

    for (idx, transition) in setup.transitions.iter().enumerate() {
        let field = format!("transitions[{}]", idx);
        if !state_ids.contains(transition.source_state_id.as_str()) {
            return Err(MonitorError::validation(
                field,
                format!("source state '{}' does not exist", transition.source_state_id),
            ));
        }
        if !state_ids.contains(transition.target_state_id.as_str()) {
            return Err(MonitorError::validation(
                field,
                format!("target state '{}' does not exist", transition.target_state_id),
            ));
        }
    }

    if let Some(initial) = &setup.initial_state_id {
        if !state_ids.contains(initial.as_str()) {
            return Err(MonitorError::validation(
                "initialStateID",
                format!("state '{}' does not exist", initial),
            ));
        }
    }

    Ok(())
}
