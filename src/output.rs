use crate::pipeline::WindowReport;
use crate::risk::RiskTransition;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// `{stem}_{channel}_{kind}.{ext}` next to `base_path`, creating the directory.
fn output_path(base_path: &str, channel: &str, kind: &str) -> Result<PathBuf> {
    let path = Path::new(base_path);
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("results");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");

    Ok(dir.join(format!("{}_{}_{}.{}", stem, channel, kind, ext)))
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_default()
}

/// One row per analysed window.
pub fn write_reports_to_csv(
    base_path: &str,
    channel: &str,
    reports: &[WindowReport],
) -> Result<PathBuf> {
    let full_path = output_path(base_path, channel, "windows")?;
    println!("Writing window results to {}", full_path.display());
    let mut writer = csv::Writer::from_path(&full_path)
        .with_context(|| format!("Failed to create {}", full_path.display()))?;

    writer.write_record([
        "window_start",
        "window_end",
        "heart_rate",
        "breathing_rate",
        "confidence",
        "smoothed_heart_rate",
        "smoothed_breathing_rate",
        "quality",
        "motion",
        "partial",
        "low_energy",
        "occupant",
        "risk_level",
        "risk_cause",
    ])?;

    for report in reports {
        let estimate = &report.estimate;
        let aggregated = report.aggregated.as_ref();
        writer.write_record([
            report.window_start.format("%Y-%m-%d %H:%M:%S").to_string(),
            report.window_end.format("%Y-%m-%d %H:%M:%S").to_string(),
            optional(estimate.heart_rate_bpm),
            optional(estimate.breathing_rate_bpm),
            format!("{:.3}", estimate.confidence),
            optional(aggregated.and_then(|e| e.heart_rate_bpm)),
            optional(aggregated.and_then(|e| e.breathing_rate_bpm)),
            format!("{:.3}", estimate.quality.overall),
            format!("{:?}", estimate.quality.motion),
            estimate.flags.partial.to_string(),
            estimate.flags.low_energy.to_string(),
            format!("{:?}", report.occupant.class),
            report.risk.level.to_string(),
            format!("{:?}", report.risk.cause),
        ])?;
    }

    writer.flush()?;
    Ok(full_path)
}

/// The risk transition log of a channel.
pub fn write_transitions_to_csv(
    base_path: &str,
    channel: &str,
    transitions: &[RiskTransition],
) -> Result<PathBuf> {
    let full_path = output_path(base_path, channel, "risk")?;
    println!("Writing risk transitions to {}", full_path.display());
    let mut writer = csv::Writer::from_path(&full_path)
        .with_context(|| format!("Failed to create {}", full_path.display()))?;

    writer.write_record(["timestamp", "from", "to", "cause"])?;
    for transition in transitions {
        writer.write_record([
            transition.at.format("%Y-%m-%d %H:%M:%S").to_string(),
            transition.from.to_string(),
            transition.to.to_string(),
            format!("{:?}", transition.cause),
        ])?;
    }

    writer.flush()?;
    Ok(full_path)
}
