//! Typed capability descriptor for an instrument.
//!
//! Existing deployments persist the descriptor as stringified JSON inside the
//! instrument's `description` field. Inside the workspace it is always the
//! typed [`Capability`] below: parsed once on load, rejected loudly when the
//! JSON does not parse, and serialized back into the same field so existing
//! files keep working.
//!
//! The descriptor has three parts:
//!
//! - `signals`: named measurable quantities, each with an opaque query
//!   command (usually `?`-terminated).
//! - `modes`: named instrument configurations with ordered enable/disable
//!   command scripts and declared `{name}` parameters.
//! - `signal_mode_configs`: the signal×mode matrix. A `(signal, mode)` pair
//!   present in the matrix is measured in that mode with the given unit and
//!   scaling factor; an absent pair is not measured.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, MonitorResult};

/// A named measurable quantity with its query command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub name: String,
    #[serde(rename = "measureCommand")]
    pub measure_command: String,
}

/// Declared parameter of a mode, referenced as `{name}` in its commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeParameter {
    pub name: String,
}

/// Ordered list of instrument commands.
///
/// Older files store command scripts as a single newline-separated block;
/// newer ones as a JSON array. Both deserialize into the same list; blank
/// lines are dropped. Serialization always emits the array form.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct CommandList(pub Vec<String>);

impl CommandList {
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for CommandList {
    fn from(commands: Vec<String>) -> Self {
        CommandList(commands)
    }
}

impl<'de> Deserialize<'de> for CommandList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Block(String),
            List(Vec<String>),
        }

        let commands = match Repr::deserialize(deserializer)? {
            Repr::Block(block) => block
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
            Repr::List(list) => list
                .into_iter()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
        };
        Ok(CommandList(commands))
    }
}

/// A named instrument configuration with enable/disable command scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mode {
    pub id: String,
    pub name: String,
    #[serde(rename = "enableCommands", default)]
    pub enable_commands: CommandList,
    #[serde(rename = "disableCommands", default)]
    pub disable_commands: CommandList,
    #[serde(default)]
    pub parameters: Vec<ModeParameter>,
}

/// One cell of the signal×mode matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalModeConfig {
    #[serde(rename = "modeId")]
    pub mode_id: String,
    #[serde(rename = "signalId")]
    pub signal_id: String,
    #[serde(default)]
    pub unit: String,
    #[serde(rename = "scalingFactor", default = "default_scaling_factor")]
    pub scaling_factor: f64,
}

fn default_scaling_factor() -> f64 {
    1.0
}

/// Full capability descriptor of an instrument.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Capability {
    #[serde(default)]
    pub signals: Vec<Signal>,
    #[serde(default)]
    pub modes: Vec<Mode>,
    #[serde(rename = "signalModeConfigs", default)]
    pub signal_mode_configs: Vec<SignalModeConfig>,
}

impl Capability {
    /// Parse the descriptor out of an instrument's `description` field.
    ///
    /// An empty description yields an empty capability (an instrument with no
    /// signals or modes); anything non-empty must be valid capability JSON.
    pub fn parse(description: &str) -> MonitorResult<Self> {
        let trimmed = description.trim();
        if trimmed.is_empty() {
            return Ok(Capability::default());
        }
        serde_json::from_str(trimmed).map_err(|e| MonitorError::Validation {
            field: "description".to_string(),
            message: format!("capability JSON does not parse: {}", e),
        })
    }

    /// Serialize back into the string stored in `description`.
    pub fn to_description(&self) -> MonitorResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn mode_by_id(&self, mode_id: &str) -> Option<&Mode> {
        self.modes.iter().find(|m| m.id == mode_id)
    }

    pub fn mode_by_name(&self, name: &str) -> Option<&Mode> {
        self.modes.iter().find(|m| m.name == name)
    }

    pub fn signal_by_id(&self, signal_id: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.id == signal_id)
    }

    pub fn signal_by_name(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// True when the named signal exists in this capability at all.
    pub fn has_signal_named(&self, name: &str) -> bool {
        self.signal_by_name(name).is_some()
    }

    /// Matrix cell for a `(signal, mode)` pair, if the pair is measured.
    pub fn matrix_config(&self, signal_id: &str, mode_id: &str) -> Option<&SignalModeConfig> {
        self.signal_mode_configs
            .iter()
            .find(|c| c.signal_id == signal_id && c.mode_id == mode_id)
    }

    /// Signals measured in the given mode, in signal declaration order.
    ///
    /// Declaration order matters: the collector queries a target's signals
    /// sequentially in exactly this order.
    pub fn signals_in_mode<'a>(
        &'a self,
        mode_id: &str,
    ) -> Vec<(&'a Signal, &'a SignalModeConfig)> {
        self.signals
            .iter()
            .filter_map(|signal| {
                self.matrix_config(&signal.id, mode_id)
                    .map(|config| (signal, config))
            })
            .collect()
    }

    /// Names of all `{placeholder}` parameters a mode's enable script uses,
    /// declared or not.
    pub fn mode_placeholders(&self, mode: &Mode) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for command in mode.enable_commands.iter().chain(mode.disable_commands.iter()) {
            for name in crate::template::placeholders(command) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// Look up a mode by id first, then by name, matching how stored setups may
/// reference modes either way.
pub fn select_mode<'a>(
    capability: &'a Capability,
    mode_id: Option<&str>,
    mode_name: Option<&str>,
) -> Option<&'a Mode> {
    if let Some(id) = mode_id {
        if let Some(mode) = capability.mode_by_id(id) {
            return Some(mode);
        }
    }
    if let Some(name) = mode_name {
        if let Some(mode) = capability.mode_by_name(name) {
            return Some(mode);
        }
    }
    None
}

/// Helper for tests and fixtures: build a minimal single-mode capability.
pub fn single_mode_capability(
    mode_id: &str,
    signals: &[(&str, &str, &str, f64)],
) -> Capability {
    let mut capability = Capability {
        modes: vec![Mode {
            id: mode_id.to_string(),
            name: mode_id.to_string(),
            enable_commands: CommandList::default(),
            disable_commands: CommandList::default(),
            parameters: Vec::new(),
        }],
        ..Default::default()
    };
    for (id, command, unit, scale) in signals {
        capability.signals.push(Signal {
            id: id.to_string(),
            name: id.to_string(),
            measure_command: command.to_string(),
        });
        capability.signal_mode_configs.push(SignalModeConfig {
            mode_id: mode_id.to_string(),
            signal_id: id.to_string(),
            unit: unit.to_string(),
            scaling_factor: *scale,
        });
    }
    capability
}

/// Per-target parameter values keyed by placeholder name.
pub type ModeParams = BTreeMap<String, String>;
