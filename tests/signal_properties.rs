mod common;

use common::{chest_motion, config, noise, start};
use guardian_vitals::{AnalysisWindow, ChannelPipeline};

fn window_of(samples: Vec<guardian_vitals::IQSample>, rate: f64) -> AnalysisWindow {
    AnalysisWindow::new(samples, rate, start()).unwrap()
}

#[test]
fn cardiac_tone_reads_72_bpm() {
    let rate = 100.0;
    let mut pipeline = ChannelPipeline::new("front".into(), &config(rate, 30.0), start()).unwrap();
    let window = window_of(chest_motion(&[(0.5, 1.2)], rate, 3000), rate);

    let estimate = pipeline.analyze(&window);
    let heart = estimate.heart_rate_bpm.expect("heart rate");
    assert!((heart - 72.0).abs() <= 2.0, "heart rate {}", heart);
    assert!(
        estimate.heart_confidence > 0.8,
        "heart confidence {}",
        estimate.heart_confidence
    );
    assert_eq!(estimate.samples_processed, 3000);
    assert_eq!(estimate.timestamp, start());
}

#[test]
fn cardiac_only_window_has_no_breathing_crosstalk() {
    let rate = 50.0;
    let mut pipeline = ChannelPipeline::new("front".into(), &config(rate, 30.0), start()).unwrap();
    for hz in [1.1, 1.4, 1.7] {
        let window = window_of(chest_motion(&[(0.4, hz)], rate, 1500), rate);
        let estimate = pipeline.analyze(&window);
        assert!(
            estimate.breathing_confidence < 0.2,
            "breathing confidence {} for a {} Hz heartbeat",
            estimate.breathing_confidence,
            hz
        );
        assert!(estimate.heart_confidence > 0.5);
    }
}

#[test]
fn breathing_and_heartbeat_are_both_recovered() {
    let rate = 20.0;
    let mut pipeline = ChannelPipeline::new("front".into(), &config(rate, 30.0), start()).unwrap();
    let window = window_of(chest_motion(&[(0.8, 0.25), (0.1, 1.5)], rate, 600), rate);

    let estimate = pipeline.analyze(&window);
    let breathing = estimate.breathing_rate_bpm.unwrap();
    let heart = estimate.heart_rate_bpm.unwrap();
    assert!((breathing - 15.0).abs() < 1.5, "breathing {}", breathing);
    assert!((heart - 90.0).abs() < 2.0, "heart {}", heart);
}

#[test]
fn pure_noise_has_near_zero_confidence() {
    let rate = 20.0;
    let mut pipeline = ChannelPipeline::new("front".into(), &config(rate, 60.0), start()).unwrap();

    let confidences: Vec<f64> = (0..5)
        .map(|seed| {
            let estimate = pipeline.analyze(&window_of(noise(seed, 1200), rate));
            assert!(
                estimate.confidence < 0.4,
                "seed {}: confidence {}",
                seed,
                estimate.confidence
            );
            estimate.confidence
        })
        .collect();
    let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
    assert!(mean < 0.2, "mean noise confidence {}", mean);
}

#[test]
fn silent_window_is_low_energy_not_an_error() {
    let rate = 20.0;
    let mut pipeline = ChannelPipeline::new("front".into(), &config(rate, 30.0), start()).unwrap();
    let window = window_of(vec![Default::default(); 600], rate);

    let estimate = pipeline.analyze(&window);
    assert!(estimate.flags.low_energy);
    assert!(!estimate.has_rates());
    assert_eq!(estimate.confidence, 0.0);
}

#[test]
fn replaying_a_window_is_deterministic() {
    let rate = 50.0;
    let cfg = config(rate, 30.0);
    let window = window_of(chest_motion(&[(0.7, 0.3), (0.15, 1.1)], rate, 1500), rate);

    let mut first = ChannelPipeline::new("a".into(), &cfg, start()).unwrap();
    let mut second = ChannelPipeline::new("b".into(), &cfg, start()).unwrap();
    let once = first.analyze(&window);
    let again = first.analyze(&window);
    let fresh = second.analyze(&window);

    assert_eq!(once, again);
    assert_eq!(once, fresh);
}
