//! Telemetry report schema, local persistence and upload
//!
//! The report is a versioned, finite JSON document produced once per
//! pipeline invocation and uploaded atomically. Wire field names are frozen
//! for the `1.2.0` minor series: consumers must tolerate unknown fields and
//! producers must not rename existing ones.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::AdhdScore;
use crate::error::{DerivaError, Result};
use crate::system::SystemInfo;

/// Report schema version for the native pipeline
pub const REPORT_VERSION: &str = "1.2.0";

/// Client runtime environment tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// Native binary
    Native,
    /// WASM build under the Bun runtime
    WasmBun,
    /// WASM build inside an Ionic shell
    WasmIonic,
    /// Browser client
    Web,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Native => "native",
            Source::WasmBun => "wasm-bun",
            Source::WasmIonic => "wasm-ionic",
            Source::Web => "web",
        };
        f.write_str(s)
    }
}

impl FromStr for Source {
    type Err = DerivaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native" => Ok(Source::Native),
            "wasm-bun" => Ok(Source::WasmBun),
            "wasm-ionic" => Ok(Source::WasmIonic),
            "web" => Ok(Source::Web),
            other => Err(DerivaError::Config(format!(
                "unknown source tag {other:?} (expected native | wasm-bun | wasm-ionic | web)"
            ))),
        }
    }
}

/// One timed forward pass on one probe sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleTiming {
    /// Ground-truth digit class
    pub digit: usize,
    /// Dataset index of the sample
    pub idx: usize,
    /// Wall-clock time of forward + extraction, in milliseconds
    pub elapsed_ms: f64,
    /// Argmax prediction
    pub pred: usize,
    /// Highest output score
    pub top1_score: f64,
    /// Full output vector, rounded to 6 decimal places
    pub output: Vec<f64>,
}

/// Numerical divergence between the two paths on one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftMetrics {
    /// Ground-truth digit class
    pub digit: usize,
    /// Dataset index of the sample
    pub idx: usize,
    /// Maximum absolute element-wise difference
    pub max_abs: f64,
    /// Mean absolute error over the vector
    pub mae: f64,
}

/// Everything measured for one model: twin timings, drift and the rollup.
///
/// `cpu`, `gpu` and `drift` are positionally aligned: index `i` refers to
/// the same `(digit, idx)` pair in all three. When GPU init failed the `gpu`
/// array holds the CPU-fallback timings and `webgpu_init_ok` is false — the
/// array is never elided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRun {
    /// Model filename (base name, as published in the manifest)
    pub model_file: String,
    /// Whether GPU initialization succeeded for this model
    pub webgpu_init_ok: bool,
    /// GPU initialization wall time in milliseconds
    pub webgpu_init_time_ms: f64,
    /// CPU-path timings, one per probed digit
    pub cpu: Vec<SampleTiming>,
    /// GPU-path timings (CPU fallback when init failed)
    pub gpu: Vec<SampleTiming>,
    /// Per-sample drift between the paths
    pub drift: Vec<DriftMetrics>,
    /// ADHD10 rollup across the probed samples
    pub adhd10: AdhdScore,
}

/// The composite report uploaded to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// Schema version (`1.2.0` for the native pipeline)
    pub version: String,
    /// Client runtime environment
    pub source: Source,
    /// Stable machine fingerprint (names the report file)
    pub machine_id: String,
    /// Probed system snapshot
    #[serde(rename = "system_info")]
    pub system: SystemInfo,
    /// Base URL of the host the artifacts came from
    pub from_host: String,
    /// Base filenames of the evaluated models, in manifest order
    pub models_used: Vec<String>,
    /// Digit classes probed (always `0..=9`)
    pub samples: Vec<usize>,
    /// Invocation start, UTC
    pub started_at: DateTime<Utc>,
    /// Invocation end, UTC
    pub ended_at: DateTime<Utc>,
    /// Free-form operator annotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// One entry per successfully probed model, in manifest order
    pub per_model: Vec<ModelRun>,
}

/// Round to `places` decimal places, half away from zero.
#[must_use]
pub fn round_to(v: f64, places: u32) -> f64 {
    let scale = 10f64.powi(places as i32);
    (v * scale).round() / scale
}

/// Round a whole output vector for report embedding.
#[must_use]
pub fn round_slice(xs: &[f64], places: u32) -> Vec<f64> {
    xs.iter().map(|&v| round_to(v, places)).collect()
}

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Write any serializable value as two-space-indented JSON, atomically
/// (write to a temp sibling, then rename).
///
/// # Errors
///
/// Returns an error when serialization or any filesystem step fails.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Persist a report under `<base>/reports_local/` and return its path.
///
/// The filename is `telemetry_<machine_id>_<unix_epoch>.json` so reports
/// from repeated runs never collide.
///
/// # Errors
///
/// Returns an error when the directory cannot be created or the write fails.
pub fn write_report(base: &Path, report: &TelemetryReport) -> Result<PathBuf> {
    let dir = base.join("reports_local");
    fs::create_dir_all(&dir)?;
    let name = format!("telemetry_{}_{}.json", report.machine_id, unix_now());
    let path = dir.join(name);
    write_json(&path, report)?;
    Ok(path)
}

/// Upload a report file to `<host>/upload` as a multipart form.
///
/// The file bytes go under form field `file`; the target filename under
/// form field `name`. The local file is never touched, so a failed upload
/// can be retried by re-running the pipeline.
///
/// # Errors
///
/// Returns `DerivaError::Upload` on transport failure or a non-200 status.
pub fn upload_report(host_base: &str, path: &Path, name: &str) -> Result<()> {
    let url = format!("{}/upload", host_base.trim_end_matches('/'));
    let bytes = fs::read(path)?;

    let part = reqwest::blocking::multipart::Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str("application/json")
        .map_err(|e| DerivaError::Upload(e.to_string()))?;
    let form = reqwest::blocking::multipart::Form::new()
        .part("file", part)
        .text("name", name.to_string());

    let resp = reqwest::blocking::Client::new()
        .post(&url)
        .multipart(form)
        .send()
        .map_err(|e| DerivaError::Upload(format!("POST {url}: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        return Err(DerivaError::Upload(format!(
            "status {status} from {url}: {}",
            body.trim()
        )));
    }
    Ok(())
}
