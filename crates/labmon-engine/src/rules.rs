//! Transition rule evaluation.
//!
//! One function, one arm per rule kind. Sensor rules read the latest sample
//! from the readings ring; a signal that is missing from the sample (not
//! measured in the current mode, or no sample yet) makes the rule false, not
//! an error.

use std::time::Duration;

use labmon_core::model::{Rule, Sample, Transition};

/// Everything a tick knows when it evaluates rules.
pub struct RuleContext<'a> {
    pub latest_sample: Option<&'a Sample>,
    pub time_in_state: Duration,
    pub total_time: Duration,
}

pub fn evaluate(rule: &Rule, ctx: &RuleContext<'_>) -> bool {
    match rule {
        Rule::Sensor {
            signal_name,
            operator,
            threshold,
        } => {
            let value = ctx
                .latest_sample
                .and_then(|sample| sample.signal(signal_name))
                .and_then(|reading| reading.value);
            match value {
                Some(value) => operator.holds(value, *threshold),
                None => false,
            }
        }
        Rule::TimeInState { seconds } => ctx.time_in_state.as_secs_f64() >= *seconds,
        Rule::TotalTime { seconds } => ctx.total_time.as_secs_f64() >= *seconds,
    }
}

/// A transition fires iff it has rules and every rule holds. The empty
/// conjunction is explicitly false to keep a rule-less edge from firing on
/// the first tick.
pub fn transition_fires(transition: &Transition, ctx: &RuleContext<'_>) -> bool {
    !transition.rules.is_empty() && transition.rules.iter().all(|rule| evaluate(rule, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use labmon_core::model::{Comparator, SignalReading, TargetSample};
    use std::collections::BTreeMap;

    fn sample_with(signal: &str, value: Option<f64>) -> Sample {
        Sample {
            timestamp: Utc::now(),
            setup_id: 1,
            setup_name: "s".into(),
            targets: vec![TargetSample {
                instrument_id: 1,
                instrument_name: "psu".into(),
                mode_name: "run".into(),
                signals: BTreeMap::from([(
                    signal.to_string(),
                    SignalReading {
                        value,
                        raw_value: value,
                        unit: "V".into(),
                        raw_response: String::new(),
                        error: None,
                    },
                )]),
            }],
        }
    }

    fn ctx(sample: Option<&Sample>, in_state: f64, total: f64) -> RuleContext<'_> {
        RuleContext {
            latest_sample: sample,
            time_in_state: Duration::from_secs_f64(in_state),
            total_time: Duration::from_secs_f64(total),
        }
    }

    fn sensor(signal: &str, operator: Comparator, threshold: f64) -> Rule {
        Rule::Sensor {
            signal_name: signal.into(),
            operator,
            threshold,
        }
    }

    #[test]
    fn sensor_rule_compares_latest_value() {
        let sample = sample_with("v", Some(12.5));
        assert!(evaluate(
            &sensor("v", Comparator::Greater, 12.0),
            &ctx(Some(&sample), 0.0, 0.0)
        ));
        assert!(!evaluate(
            &sensor("v", Comparator::Greater, 13.0),
            &ctx(Some(&sample), 0.0, 0.0)
        ));
    }

    #[test]
    fn missing_or_null_signal_is_false_not_an_error() {
        let rule = sensor("v", Comparator::Greater, 0.0);
        // No sample at all.
        assert!(!evaluate(&rule, &ctx(None, 0.0, 0.0)));
        // Sample without the signal.
        let other = sample_with("w", Some(1.0));
        assert!(!evaluate(&rule, &ctx(Some(&other), 0.0, 0.0)));
        // Signal present but value failed to parse.
        let null = sample_with("v", None);
        assert!(!evaluate(&rule, &ctx(Some(&null), 0.0, 0.0)));
    }

    #[test]
    fn time_rules_are_at_least_semantics() {
        let in_state = Rule::TimeInState { seconds: 2.0 };
        assert!(!evaluate(&in_state, &ctx(None, 1.9, 100.0)));
        assert!(evaluate(&in_state, &ctx(None, 2.0, 100.0)));

        let total = Rule::TotalTime { seconds: 30.0 };
        assert!(!evaluate(&total, &ctx(None, 100.0, 29.0)));
        assert!(evaluate(&total, &ctx(None, 0.0, 30.0)));
    }

    #[test]
    fn transition_is_a_conjunction() {
        let sample = sample_with("v", Some(4.19));
        let transition = Transition {
            id: "t".into(),
            source_state_id: "a".into(),
            target_state_id: "b".into(),
            rules: vec![
                sensor("v", Comparator::GreaterOrEqual, 4.19),
                Rule::TimeInState { seconds: 5.0 },
            ],
        };
        // Sensor holds but time does not.
        assert!(!transition_fires(&transition, &ctx(Some(&sample), 1.0, 1.0)));
        // Both hold.
        assert!(transition_fires(&transition, &ctx(Some(&sample), 5.0, 5.0)));
    }

    #[test]
    fn zero_rule_transition_never_fires() {
        let transition = Transition {
            id: "t".into(),
            source_state_id: "a".into(),
            target_state_id: "b".into(),
            rules: Vec::new(),
        };
        assert!(!transition_fires(&transition, &ctx(None, 1e9, 1e9)));
    }
}
