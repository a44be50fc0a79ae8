//! Pipeline orchestrator: pull → run → push
//!
//! One invocation runs the fixed stage sequence below. Stages before the
//! model loop abort the invocation; failures inside the loop are logged and
//! the loop continues (the failed model contributes no `ModelRun`); a failed
//! upload surfaces to the caller but the local report file is retained.
//!
//! ```text
//! probe_system → fetch_manifest → download_models → ensure_mnist →
//! load_dataset → for each model { probe → adhd10 } → compose →
//! write_local → upload
//! ```
//!
//! The loop is strictly sequential: models run in manifest order and the 10
//! probes within a model run serially, so latency readings are never
//! polluted by concurrent inference.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::diagnostics::compute_adhd10;
use crate::error::Result;
use crate::telemetry::{Source, TelemetryReport, REPORT_VERSION};
use crate::{fetch, mnist, probe, system, telemetry};

/// Run the full telemetry pipeline against `host_base`, using `base` as the
/// local data directory. Returns the path of the locally persisted report.
///
/// # Errors
///
/// Any pre-loop stage error (host, dataset) aborts the invocation. An upload
/// failure is returned after the report has been written locally.
pub fn run_pipeline(host_base: &str, source: Source, base: &Path) -> Result<PathBuf> {
    let started_at = Utc::now();
    let host = host_base.trim_end_matches('/').to_string();

    tracing::info!(%host, %source, "telemetry pipeline starting");
    let info = system::collect();
    let machine_id = system::machine_id(&info);
    tracing::info!(%machine_id, cpu = %info.cpu_model, gpu = %info.gpu_model, "system probed");

    let manifest = fetch::fetch_manifest(&host)?;
    if manifest.is_empty() {
        tracing::warn!("manifest is empty, report will carry no model runs");
    }

    let model_files = fetch::download_models(&host, &manifest, &base.join("models_remote"))?;
    println!("⬇ {} model(s) pulled from {host}", model_files.len());

    let mnist_dir = base.join("mnist");
    fetch::ensure_mnist(&host, &mnist_dir)?;
    let (images, labels) = mnist::load_dataset(&mnist_dir)?;
    let sample_index = mnist::first_index_per_digit(&labels);
    tracing::info!(
        samples = images.len(),
        digits = sample_index.len(),
        "dataset loaded"
    );

    let mut per_model = Vec::new();
    for path in &model_files {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let name = name.unwrap_or_default();
        println!("▶ probing {name}");
        match probe::run_model_probe(path, &images, &sample_index) {
            Ok(mut run) => {
                run.adhd10 = compute_adhd10(&run);
                println!(
                    "  cpu acc {:.1}% | gpu acc {:.1}% | agree {}/{} | gpu init {}",
                    run.adhd10.top1_accuracy_cpu,
                    run.adhd10.top1_accuracy_gpu,
                    run.adhd10.cpu_vs_gpu_agree_count,
                    run.cpu.len(),
                    if run.webgpu_init_ok { "ok" } else { "failed" },
                );
                per_model.push(run);
            }
            Err(e) => {
                tracing::warn!(model = %name, error = %e, "model skipped");
                println!("⚠ model {name}: {e}");
            }
        }
    }

    let report = TelemetryReport {
        version: REPORT_VERSION.to_string(),
        source,
        machine_id,
        system: info,
        from_host: host.clone(),
        models_used: model_files
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect(),
        samples: (0..=9).collect(),
        started_at,
        ended_at: Utc::now(),
        notes: None,
        per_model,
    };

    let local_path = telemetry::write_report(base, &report)?;
    println!("💾 report saved → {}", local_path.display());

    let file_name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    telemetry::upload_report(&host, &local_path, &file_name)?;
    println!("📤 report uploaded → {host}/reports/{file_name}");

    Ok(local_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_host_aborts_before_model_loop() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_pipeline("http://127.0.0.1:1", Source::Native, dir.path()).unwrap_err();
        assert!(matches!(err, crate::error::DerivaError::Host(_)));
        // nothing was written locally
        assert!(!dir.path().join("reports_local").exists());
    }
}
