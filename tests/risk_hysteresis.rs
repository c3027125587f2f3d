mod common;

use common::{at, reading, start};
use guardian_vitals::risk::{RiskConfig, RiskInputs};
use guardian_vitals::{RiskCause, RiskEngine, RiskLevel, RiskTransition, VitalSignEstimate};
use std::time::Duration;

fn evaluate(
    engine: &mut RiskEngine,
    estimate: &VitalSignEstimate,
    aggregated: Option<&VitalSignEstimate>,
) -> Vec<RiskTransition> {
    engine.evaluate(&RiskInputs {
        estimate,
        aggregated,
        breathing_trend: None,
        occupied: true,
        unattended: Duration::ZERO,
        cabin_temperature: None,
        now: estimate.timestamp,
    })
}

#[test]
fn sustained_low_confidence_warns_exactly_once() {
    let mut engine = RiskEngine::new(RiskConfig::default(), start()).unwrap();

    let mut transitions = Vec::new();
    for k in 1..=10 {
        let weak = reading(30 * k, 80.0, 16.0, 0.3);
        transitions.extend(evaluate(&mut engine, &weak, None));
    }

    assert_eq!(transitions.len(), 1, "{:?}", transitions);
    assert_eq!(transitions[0].from, RiskLevel::Safe);
    assert_eq!(transitions[0].to, RiskLevel::Warning);
    assert_eq!(transitions[0].cause, RiskCause::LowConfidence);
    assert_eq!(transitions[0].at, at(90));
    assert_eq!(engine.level(), RiskLevel::Warning);
}

#[test]
fn warning_clears_only_after_cooldown() {
    let mut engine = RiskEngine::new(RiskConfig::default(), start()).unwrap();
    for k in 1..=3 {
        evaluate(&mut engine, &reading(30 * k, 80.0, 16.0, 0.3), None);
    }
    assert_eq!(engine.level(), RiskLevel::Warning);

    // first good reading at 120 s; cooldown is 120 s
    let good = reading(120, 80.0, 16.0, 0.9);
    assert!(evaluate(&mut engine, &good, Some(&good)).is_empty());
    assert_eq!(engine.level(), RiskLevel::Warning);

    for seconds in [150, 180, 210] {
        let good = reading(seconds, 80.0, 16.0, 0.9);
        assert!(evaluate(&mut engine, &good, Some(&good)).is_empty());
        assert_eq!(engine.level(), RiskLevel::Warning);
    }

    let good = reading(240, 80.0, 16.0, 0.9);
    let cleared = evaluate(&mut engine, &good, Some(&good));
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].to, RiskLevel::Safe);
    assert_eq!(cleared[0].cause, RiskCause::Cleared);
}

#[test]
fn a_relapse_restarts_the_cooldown() {
    let mut engine = RiskEngine::new(RiskConfig::default(), start()).unwrap();
    for k in 1..=3 {
        evaluate(&mut engine, &reading(30 * k, 80.0, 16.0, 0.3), None);
    }

    let good = reading(120, 80.0, 16.0, 0.9);
    evaluate(&mut engine, &good, Some(&good));
    // implausible smoothed heart rate re-triggers the warning
    let odd = reading(150, 210.0, 16.0, 0.9);
    evaluate(&mut engine, &odd, Some(&odd));
    let good = reading(240, 80.0, 16.0, 0.9);
    assert!(evaluate(&mut engine, &good, Some(&good)).is_empty());
    assert_eq!(engine.level(), RiskLevel::Warning);

    let good = reading(360, 80.0, 16.0, 0.9);
    assert_eq!(evaluate(&mut engine, &good, Some(&good)).len(), 1);
    assert_eq!(engine.level(), RiskLevel::Safe);
}

#[test]
fn critical_steps_down_through_warning() {
    let config = RiskConfig {
        absence_windows: 1,
        ..RiskConfig::default()
    };
    let mut engine = RiskEngine::new(config, start()).unwrap();
    let absent = reading(30, 80.0, 16.0, 0.0);
    let up = evaluate(&mut engine, &absent, None);
    assert_eq!(
        up.iter().map(|t| t.to).collect::<Vec<_>>(),
        vec![RiskLevel::Warning, RiskLevel::Critical]
    );

    let mut levels = Vec::new();
    for k in 2..=20 {
        let good = reading(30 * k, 80.0, 16.0, 0.9);
        for t in evaluate(&mut engine, &good, Some(&good)) {
            levels.push(t.to);
        }
    }
    assert_eq!(levels, vec![RiskLevel::Warning, RiskLevel::Safe]);

    let history = engine.history();
    assert_eq!(history.first().unwrap().cause, RiskCause::Initial);
    assert_eq!(history.last().unwrap().level, RiskLevel::Safe);
}
