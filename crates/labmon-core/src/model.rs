//! Persistent data model: instruments, monitoring setups, state machines,
//! and the sample records produced by the collector.
//!
//! Field names follow the on-disk JSON layout that existing deployments
//! already use (camelCase inside state machine structures, snake_case at the
//! top level), so files written by older builds load unchanged.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::{Capability, ModeParams};
use crate::error::MonitorResult;

// =============================================================================
// Instruments
// =============================================================================

/// A laboratory instrument reachable over the text-command protocol.
///
/// The `description` field doubles as storage for the stringified capability
/// JSON; use [`Instrument::capability`] to get the typed view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: u64,
    pub name: String,
    /// Wire address, `host[:port][/device]`.
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl Instrument {
    pub fn capability(&self) -> MonitorResult<Capability> {
        Capability::parse(&self.description)
    }
}

/// Creation payload for an instrument; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInstrument {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Partial update of an instrument's mutable fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

// =============================================================================
// Monitoring setups
// =============================================================================

/// Pairing of an instrument with per-setup parameters inside a setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub instrument_id: u64,
    #[serde(default)]
    pub parameters: TargetParameters,
}

/// Per-target parameter block.
///
/// `mode_id` selects the standing mode used whenever no state machine drives
/// the setup; `mode_params` feed `{name}` placeholders in that mode's
/// commands.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetParameters {
    #[serde(rename = "modeId", default, skip_serializing_if = "Option::is_none")]
    pub mode_id: Option<String>,
    #[serde(rename = "modeParams", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mode_params: ModeParams,
}

/// A named, persistent configuration binding instruments, a sampling
/// cadence, and an optional state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSetup {
    pub id: u64,
    pub name: String,
    /// Readings produced per second while collecting.
    pub frequency_hz: f64,
    /// Participating instruments. Non-empty for any valid setup.
    #[serde(default)]
    pub instruments: Vec<Target>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<State>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    #[serde(
        rename = "initialStateID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub initial_state_id: Option<String>,
}

impl MonitoringSetup {
    pub fn has_state_machine(&self) -> bool {
        !self.states.is_empty()
    }

    pub fn state(&self, state_id: &str) -> Option<&State> {
        self.states.iter().find(|s| s.id == state_id)
    }

    /// Outgoing transitions of a state, in setup declaration order. That
    /// order is the deterministic tie-break when several transitions match
    /// on the same tick.
    pub fn outgoing_transitions(&self, state_id: &str) -> Vec<&Transition> {
        self.transitions
            .iter()
            .filter(|t| t.source_state_id == state_id)
            .collect()
    }

    pub fn target(&self, instrument_id: u64) -> Option<&Target> {
        self.instruments
            .iter()
            .find(|t| t.instrument_id == instrument_id)
    }

    /// Collection period derived from the cadence.
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.frequency_hz)
    }
}

/// Creation payload for a setup; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMonitoringSetup {
    pub name: String,
    pub frequency_hz: f64,
    #[serde(default)]
    pub instruments: Vec<Target>,
    #[serde(default)]
    pub states: Vec<State>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(rename = "initialStateID", default)]
    pub initial_state_id: Option<String>,
}

/// Partial update of a setup's mutable fields. A present field replaces the
/// stored one wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringSetupUpdate {
    pub name: Option<String>,
    pub frequency_hz: Option<f64>,
    pub instruments: Option<Vec<Target>>,
    pub states: Option<Vec<State>>,
    pub transitions: Option<Vec<Transition>>,
    #[serde(rename = "initialStateID", default)]
    pub initial_state_id: Option<String>,
}

// =============================================================================
// State machine
// =============================================================================

/// Mode selection a state applies to one instrument on entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSetting {
    #[serde(rename = "modeId")]
    pub mode_id: String,
    #[serde(rename = "modeParams", default)]
    pub mode_params: ModeParams,
}

/// One state of a setup's state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Unique within the setup.
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Entering an end state terminates the session.
    #[serde(rename = "isEndState", default)]
    pub is_end_state: bool,
    /// Instrument id → mode to apply while in this state. JSON object keys
    /// are strings; serde maps them onto the integer keys here.
    #[serde(rename = "instrumentSettings", default)]
    pub instrument_settings: BTreeMap<u64, InstrumentSetting>,
}

/// Comparison operator of a sensor rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

/// Tolerance for equality comparisons on measured values.
pub const COMPARE_EPSILON: f64 = 1e-9;

impl Comparator {
    /// Apply the operator to `value ? threshold`. Equality is within
    /// [`COMPARE_EPSILON`].
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Greater => value > threshold,
            Comparator::GreaterOrEqual => value >= threshold,
            Comparator::Less => value < threshold,
            Comparator::LessOrEqual => value <= threshold,
            Comparator::Equal => (value - threshold).abs() <= COMPARE_EPSILON,
            Comparator::NotEqual => (value - threshold).abs() > COMPARE_EPSILON,
        }
    }
}

/// A transition predicate, evaluated each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Rule {
    /// Latest measured value of a signal compared against a threshold.
    #[serde(rename = "sensor")]
    Sensor {
        #[serde(rename = "signalName")]
        signal_name: String,
        operator: Comparator,
        #[serde(rename = "value")]
        threshold: f64,
    },
    /// Seconds spent in the current state.
    #[serde(rename = "timeInState")]
    TimeInState { seconds: f64 },
    /// Seconds since the session started.
    #[serde(rename = "totalTime")]
    TotalTime { seconds: f64 },
}

/// An edge between two states, gated by the conjunction of its rules.
///
/// A transition with no rules never fires; an empty conjunction would
/// otherwise transition immediately on the first tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "sourceStateID")]
    pub source_state_id: String,
    #[serde(rename = "targetStateID")]
    pub target_state_id: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

// =============================================================================
// Samples
// =============================================================================

/// One measured signal inside a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReading {
    /// Scaled engineering value; `None` when the reply did not parse or the
    /// query failed.
    pub value: Option<f64>,
    /// Unscaled value as parsed from the wire.
    pub raw_value: Option<f64>,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub raw_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-target block of a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSample {
    pub instrument_id: u64,
    pub instrument_name: String,
    #[serde(default)]
    pub mode_name: String,
    #[serde(default)]
    pub signals: BTreeMap<String, SignalReading>,
}

/// One produced reading record for a setup at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// UTC, microsecond precision, strictly monotonic per setup.
    pub timestamp: DateTime<Utc>,
    pub setup_id: u64,
    pub setup_name: String,
    #[serde(default)]
    pub targets: Vec<TargetSample>,
}

impl Sample {
    /// First reading of the named signal across this sample's targets.
    pub fn signal(&self, signal_name: &str) -> Option<&SignalReading> {
        self.targets
            .iter()
            .find_map(|t| t.signals.get(signal_name))
    }
}

// =============================================================================
// Status snapshots
// =============================================================================

/// Collector status for one setup. A polling snapshot, never a blocking
/// wait.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Ticks dropped because the previous pass was still running.
    #[serde(default)]
    pub coalesced_ticks: u64,
}

/// State machine session status for one setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStatus {
    pub setup_id: u64,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_entered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_in_current_state_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_session_time_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_serde_uses_type_tag() {
        let rule: Rule = serde_json::from_str(
            r#"{"type": "sensor", "signalName": "v", "operator": ">", "value": 12.0}"#,
        )
        .unwrap();
        match &rule {
            Rule::Sensor {
                signal_name,
                operator,
                threshold,
            } => {
                assert_eq!(signal_name, "v");
                assert_eq!(*operator, Comparator::Greater);
                assert_eq!(*threshold, 12.0);
            }
            other => panic!("unexpected rule: {other:?}"),
        }
        let text = serde_json::to_string(&rule).unwrap();
        assert!(text.contains(r#""type":"sensor""#));
    }

    #[test]
    fn time_rules_round_trip() {
        for json in [
            r#"{"type": "timeInState", "seconds": 2.0}"#,
            r#"{"type": "totalTime", "seconds": 30.5}"#,
        ] {
            let rule: Rule = serde_json::from_str(json).unwrap();
            let back: Rule =
                serde_json::from_str(&serde_json::to_string(&rule).unwrap()).unwrap();
            assert_eq!(rule, back);
        }
    }

    #[test]
    fn comparator_equality_uses_epsilon() {
        assert!(Comparator::Equal.holds(4.19, 4.19 + 5e-10));
        assert!(!Comparator::Equal.holds(4.19, 4.20));
        assert!(Comparator::NotEqual.holds(4.19, 4.20));
        assert!(!Comparator::NotEqual.holds(4.19, 4.19));
    }

    #[test]
    fn comparator_orderings() {
        assert!(Comparator::Greater.holds(12.5, 12.0));
        assert!(!Comparator::Greater.holds(12.0, 12.0));
        assert!(Comparator::GreaterOrEqual.holds(12.0, 12.0));
        assert!(Comparator::Less.holds(1.0, 2.0));
        assert!(Comparator::LessOrEqual.holds(2.0, 2.0));
    }

    #[test]
    fn instrument_settings_keys_are_numeric_strings_in_json() {
        let state = State {
            id: "heat".into(),
            name: "Heat".into(),
            is_end_state: false,
            instrument_settings: BTreeMap::from([(
                3,
                InstrumentSetting {
                    mode_id: "run".into(),
                    mode_params: ModeParams::new(),
                },
            )]),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains(r#""instrumentSettings":{"3""#));
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn setup_round_trips_with_state_machine() {
        let setup = MonitoringSetup {
            id: 1,
            name: "bakeout".into(),
            frequency_hz: 2.0,
            instruments: vec![Target {
                instrument_id: 3,
                parameters: TargetParameters {
                    mode_id: Some("run".into()),
                    mode_params: ModeParams::new(),
                },
            }],
            states: vec![
                State {
                    id: "idle".into(),
                    name: "Idle".into(),
                    is_end_state: false,
                    instrument_settings: BTreeMap::new(),
                },
                State {
                    id: "done".into(),
                    name: "Done".into(),
                    is_end_state: true,
                    instrument_settings: BTreeMap::new(),
                },
            ],
            transitions: vec![Transition {
                id: "t1".into(),
                source_state_id: "idle".into(),
                target_state_id: "done".into(),
                rules: vec![Rule::TimeInState { seconds: 2.0 }],
            }],
            initial_state_id: Some("idle".into()),
        };
        let json = serde_json::to_string_pretty(&setup).unwrap();
        assert!(json.contains("initialStateID"));
        assert!(json.contains("sourceStateID"));
        let back: MonitoringSetup = serde_json::from_str(&json).unwrap();
        assert_eq!(setup, back);
    }

    #[test]
    fn setup_without_state_machine_omits_empty_fields() {
        let setup = MonitoringSetup {
            id: 7,
            name: "plain".into(),
            frequency_hz: 1.0,
            instruments: Vec::new(),
            states: Vec::new(),
            transitions: Vec::new(),
            initial_state_id: None,
        };
        let json = serde_json::to_string(&setup).unwrap();
        assert!(!json.contains("states"));
        assert!(!json.contains("initialStateID"));
    }

    #[test]
    fn sample_signal_lookup_scans_targets() {
        let sample = Sample {
            timestamp: Utc::now(),
            setup_id: 1,
            setup_name: "s".into(),
            targets: vec![TargetSample {
                instrument_id: 1,
                instrument_name: "psu".into(),
                mode_name: "run".into(),
                signals: BTreeMap::from([(
                    "volt".to_string(),
                    SignalReading {
                        value: Some(12.5),
                        raw_value: Some(12500.0),
                        unit: "V".into(),
                        raw_response: "12500".into(),
                        error: None,
                    },
                )]),
            }],
        };
        assert_eq!(sample.signal("volt").unwrap().value, Some(12.5));
        assert!(sample.signal("missing").is_none());
    }

    #[test]
    fn outgoing_transitions_preserve_declaration_order() {
        let setup = MonitoringSetup {
            id: 1,
            name: "order".into(),
            frequency_hz: 1.0,
            instruments: Vec::new(),
            states: Vec::new(),
            transitions: vec![
                Transition {
                    id: "b".into(),
                    source_state_id: "s".into(),
                    target_state_id: "x".into(),
                    rules: Vec::new(),
                },
                Transition {
                    id: "a".into(),
                    source_state_id: "s".into(),
                    target_state_id: "y".into(),
                    rules: Vec::new(),
                },
            ],
            initial_state_id: None,
        };
        let ids: Vec<&str> = setup
            .outgoing_transitions("s")
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
