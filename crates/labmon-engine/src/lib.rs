//! Runtime engine for the labmon monitor: the per-setup data collector and
//! the state machine engine.
//!
//! The two subsystems cooperate without back-pointers. The engine publishes
//! each state's instrument settings into a shared [`mode::ModeOverrides`]
//! cell; the collector reads the cell to pick each target's effective mode
//! and applies enable commands edge-triggered. The engine in turn reads the
//! collector's output through the shared readings ring when it evaluates
//! sensor rules. Both run one cancellable task per started setup with
//! drift-corrected deadlines ([`ticker::DriftTicker`]).
//!
//! Lifecycle guarantees: `start`/`stop` are serialized per setup, `stop` is
//! idempotent and cancels in-flight work, and after `stop` returns no
//! further sample or instrument command from that setup is produced.

pub mod collector;
pub mod mode;
pub mod rules;
pub mod state_machine;
pub mod ticker;

pub use collector::DataCollector;
pub use mode::{ModeOverrides, ModeSelection};
pub use state_machine::StateMachineEngine;
