use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use guardian_vitals::config::Args;
use guardian_vitals::data_loading::{load_captures, Capture};
use guardian_vitals::output::{write_reports_to_csv, write_transitions_to_csv};
use guardian_vitals::risk::{time_in_levels, RiskCause, RiskLevel, RiskState};
use guardian_vitals::{
    ChannelId, IngestService, PipelineConfig, StaticOccupancy, VitalMonitor, WindowReport,
};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Capture-relative sensor feed: the occupant's unattended time grows as the
/// capture plays back.
struct Replay<'a> {
    occupancy: &'a StaticOccupancy,
    base_unattended: Duration,
    batch_size: usize,
}

impl Replay<'_> {
    fn advance(&self, offset: usize, sampling_rate: f64) {
        let elapsed = Duration::from_secs_f64(offset as f64 / sampling_rate);
        self.occupancy.set_unattended(self.base_unattended + elapsed);
    }

    fn direct(
        &self,
        monitor: &VitalMonitor,
        channel: &ChannelId,
        capture: &Capture,
        sampling_rate: f64,
    ) -> Result<Vec<WindowReport>> {
        let mut reports = Vec::new();
        for (n, batch) in capture.samples.chunks(self.batch_size).enumerate() {
            self.advance(n * self.batch_size, sampling_rate);
            let completed = monitor
                .submit_reports(channel, batch, sampling_rate)
                .with_context(|| format!("Channel {} rejected batch {}", channel, n))?;
            reports.extend(completed);
        }
        self.advance(capture.samples.len(), sampling_rate);
        reports.extend(monitor.finish_channel(channel)?);
        Ok(reports)
    }

    fn queued(
        &self,
        service: &IngestService,
        channel: &ChannelId,
        capture: &Capture,
        sampling_rate: f64,
    ) -> Result<Vec<WindowReport>> {
        let mut reports = Vec::new();
        for (n, batch) in capture.samples.chunks(self.batch_size).enumerate() {
            self.advance(n * self.batch_size, sampling_rate);
            loop {
                match service.ingest(channel, batch, sampling_rate) {
                    Ok(()) => break,
                    Err(e) if e.is_backpressure() => {
                        debug!("Channel {} queue full at batch {}, retrying", channel, n);
                        reports.extend(service.results().try_iter());
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(e) => return Err(e).context(format!("Channel {} ingest failed", channel)),
                }
            }
            reports.extend(service.results().try_iter());
        }

        // the queued service has no trailing flush; wait for the worker to drain
        service.shutdown();
        reports.extend(service.results().try_iter());
        if service.dropped_batches() > 0 || service.dropped_results() > 0 {
            warn!(
                "{} batches and {} results were dropped",
                service.dropped_batches(),
                service.dropped_results()
            );
        }
        Ok(reports)
    }
}

/// Risk states as reported window by window, starting from the initial SAFE state.
fn history_from_reports(start: DateTime<Utc>, reports: &[WindowReport]) -> Vec<RiskState> {
    let mut history = vec![RiskState {
        level: RiskLevel::Safe,
        entered_at: start,
        cause: RiskCause::Initial,
    }];
    history.extend(reports.iter().flat_map(|r| &r.transitions).map(|t| RiskState {
        level: t.to,
        entered_at: t.at,
        cause: t.cause,
    }));
    history
}

fn print_summary(channel: &ChannelId, start: DateTime<Utc>, reports: &[WindowReport]) {
    println!("\nChannel {}: {} windows analysed", channel, reports.len());
    let Some(last) = reports.last() else {
        return;
    };

    let measured = reports.iter().filter(|r| r.estimate.has_rates()).count();
    println!("  Windows with readings: {}/{}", measured, reports.len());

    match &last.aggregated {
        Some(reading) => println!(
            "  Smoothed heart rate: {}  breathing rate: {}  confidence: {:.2}",
            reading
                .heart_rate_bpm
                .map(|v| format!("{:.1} bpm", v))
                .unwrap_or_else(|| "-".to_string()),
            reading
                .breathing_rate_bpm
                .map(|v| format!("{:.1} bpm", v))
                .unwrap_or_else(|| "-".to_string()),
            reading.confidence
        ),
        None => println!("  No confident reading"),
    }
    println!(
        "  Occupant: {:?} ({:.2})",
        last.occupant.class, last.occupant.confidence
    );

    for transition in reports.iter().flat_map(|r| &r.transitions) {
        println!(
            "  {} {} -> {} ({:?})",
            transition.at.format("%H:%M:%S"),
            transition.from,
            transition.to,
            transition.cause
        );
    }

    let history = history_from_reports(start, reports);
    let totals = time_in_levels(&history, last.window_end);
    for level in [RiskLevel::Safe, RiskLevel::Warning, RiskLevel::Critical] {
        let minutes = totals
            .get(&level)
            .map_or(0.0, |d| d.num_milliseconds() as f64 / 60_000.0);
        println!("  {:<8} {:>7.1} min", level.to_string(), minutes);
    }
    println!("  Final risk: {} ({:?})", last.risk.level, last.risk.cause);
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config: PipelineConfig = args.pipeline_config()?;

    if args.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }
    if args.batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }
    if !(args.unattended_minutes >= 0.0) {
        bail!("--unattended-minutes must be non-negative");
    }

    let captures = load_captures(&args.input_path)?;
    if captures.is_empty() {
        bail!("No captures found in {}", args.input_path.display());
    }

    let base_unattended = Duration::from_secs_f64(args.unattended_minutes * 60.0);
    let occupancy = Arc::new(StaticOccupancy::new(
        args.occupied,
        base_unattended,
        args.cabin_temp,
    ));
    let replay = Replay {
        occupancy: &occupancy,
        base_unattended,
        batch_size: args.batch_size,
    };
    let start = Utc::now();

    let monitor = VitalMonitor::new(config.clone(), occupancy.clone())?.starting_at(start);

    for capture in &captures {
        let channel = if captures.len() == 1 {
            ChannelId::from(args.channel.as_str())
        } else {
            ChannelId::from(capture.name.as_str())
        };
        let sampling_rate = capture
            .sampling_rate
            .unwrap_or(config.window.sampling_rate);
        info!(
            "Replaying {} ({} samples at {} Hz) on channel {}",
            capture.name,
            capture.samples.len(),
            sampling_rate,
            channel
        );

        let reports = if args.queued {
            let service = IngestService::new(config.clone(), occupancy.clone())?.starting_at(start);
            replay.queued(&service, &channel, capture, sampling_rate)?
        } else {
            replay.direct(&monitor, &channel, capture, sampling_rate)?
        };

        print_summary(&channel, start, &reports);

        if let Some(prefix) = &args.csv_output {
            write_reports_to_csv(prefix, &channel.0, &reports)?;
            let transitions: Vec<_> = reports
                .iter()
                .flat_map(|r| r.transitions.iter().copied())
                .collect();
            write_transitions_to_csv(prefix, &channel.0, &transitions)?;
        }
    }

    Ok(())
}
