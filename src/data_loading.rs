use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One recorded IQ stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub name: String,
    pub samples: Vec<(f64, f64)>,
    /// Recorded or inferred sampling rate (Hz), if the file carries one
    pub sampling_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct JsonCapture {
    iq_real: Vec<f64>,
    iq_imag: Vec<f64>,
    #[serde(default)]
    time: Option<Vec<f64>>,
    #[serde(default)]
    sampling_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    i: f64,
    q: f64,
}

fn capture_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture".to_string())
}

/// Rate implied by a time column: inverse of the median sample spacing.
fn rate_from_times(times: &[f64]) -> Option<f64> {
    let mut steps: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
    if steps.is_empty() {
        return None;
    }
    steps.sort_by(f64::total_cmp);
    let step = steps[steps.len() / 2];
    (step > 0.0 && step.is_finite()).then(|| 1.0 / step)
}

pub fn read_json_capture(path: &Path) -> Result<Capture> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    let raw: JsonCapture = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse IQ capture: {}", path.display()))?;

    if raw.iq_real.len() != raw.iq_imag.len() {
        bail!(
            "{}: iq_real has {} samples but iq_imag has {}",
            path.display(),
            raw.iq_real.len(),
            raw.iq_imag.len()
        );
    }

    let sampling_rate = raw
        .sampling_rate
        .or_else(|| raw.time.as_deref().and_then(rate_from_times));

    Ok(Capture {
        name: capture_name(path),
        samples: raw.iq_real.into_iter().zip(raw.iq_imag).collect(),
        sampling_rate,
    })
}

pub fn read_csv_capture(path: &Path) -> Result<Capture> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
    let mut samples = Vec::new();

    for (row, result) in rdr.deserialize().enumerate() {
        let record: CsvRow = result
            .with_context(|| format!("{}: bad IQ row {}", path.display(), row + 1))?;
        samples.push((record.i, record.q));
    }

    Ok(Capture {
        name: capture_name(path),
        samples,
        sampling_rate: None,
    })
}

pub fn read_capture(path: &Path) -> Result<Capture> {
    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => read_json_capture(path),
        Some("csv") => read_csv_capture(path),
        _ => bail!("Unsupported capture format: {}", path.display()),
    }
}

/// All `.json` / `.csv` files below `dir`, sorted by path.
pub fn find_captures(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        let path = entry.path();
        let is_capture = matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("json") | Some("csv")
        );
        if entry.file_type().is_file() && is_capture {
            paths.push(path.to_path_buf());
        }
    }
    paths.sort();
    Ok(paths)
}

/// A single capture file, or every capture in a directory.
pub fn load_captures(input: &Path) -> Result<Vec<Capture>> {
    if !input.is_dir() {
        return Ok(vec![read_capture(input)?]);
    }

    let paths = find_captures(input)?;
    info!("Found {} captures in {}", paths.len(), input.display());
    let mut captures = Vec::with_capacity(paths.len());
    for path in paths {
        match read_capture(&path) {
            Ok(capture) => captures.push(capture),
            Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
        }
    }
    Ok(captures)
}
