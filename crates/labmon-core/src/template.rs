//! Command template expansion and reply parsing.
//!
//! Instrument commands are opaque strings with optional `{name}` placeholders
//! substituted from per-setup parameter maps. Replies are free-form ASCII;
//! the first numeric token is taken as the measured value.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::capability::ModeParams;
use crate::error::{MonitorError, MonitorResult};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder regex"));

static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d*\.?\d+(?:[eE][-+]?\d+)?").expect("number regex"));

/// Placeholder names referenced by a command, in order of first appearance.
pub fn placeholders(command: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(command)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute every `{name}` in `command` from `params`.
///
/// An unresolved placeholder is a hard error; commands must never reach an
/// instrument with braces still in them.
pub fn expand_command(command: &str, params: &ModeParams) -> MonitorResult<String> {
    let mut expanded = command.to_string();
    for name in placeholders(command) {
        match params.get(&name) {
            Some(value) => {
                expanded = expanded.replace(&format!("{{{}}}", name), value);
            }
            None => {
                return Err(MonitorError::ParameterMissing {
                    name,
                    command: command.to_string(),
                })
            }
        }
    }
    Ok(expanded)
}

/// Expand an ordered command script, failing on the first unresolved
/// placeholder.
pub fn expand_commands<'a, I>(commands: I, params: &ModeParams) -> MonitorResult<Vec<String>>
where
    I: IntoIterator<Item = &'a String>,
{
    commands
        .into_iter()
        .map(|c| expand_command(c, params))
        .collect()
}

/// Best-effort numeric parse of an instrument reply.
///
/// Takes the first token that looks like a real number, scientific notation
/// included. Returns `None` when the reply carries no number; callers record
/// the raw response either way.
pub fn parse_reply_number(reply: &str) -> Option<f64> {
    NUMBER
        .find(reply.trim())
        .and_then(|m| m.as_str().parse::<f64>().ok())
}
