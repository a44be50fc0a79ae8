//! Probe runner: twin-instance CPU/GPU measurement for one model
//!
//! For each model the runner builds two independent engine handles from the
//! same exported state: one CPU-only, one GPU-enabled. If GPU init fails the
//! GPU handle keeps running on the CPU so the report always carries a full
//! pair of aligned arrays; consumers tell the two modes apart through
//! `webgpu_init_ok`. One GPU init serves all ten digits (the shared-handle
//! strategy), with cleanup guaranteed before the model goes out of scope.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use crate::diagnostics::drift;
use crate::error::Result;
use crate::layers::Network;
use crate::mnist::Grid;
use crate::telemetry::{round_slice, DriftMetrics, ModelRun, SampleTiming};

/// Decimal places kept for output vectors embedded in the report. Drift is
/// computed on the unrounded outputs.
const OUTPUT_DECIMALS: u32 = 6;

/// Run the 10-digit probe for one model.
///
/// `sample_index` maps digit class to dataset index; absent digits are
/// skipped and simply do not appear in the output arrays. Single-digit
/// failures are logged and never abort the probe.
///
/// # Errors
///
/// Returns `DerivaError::Engine` when the model cannot be loaded or its
/// state cannot be rebuilt — the orchestrator skips the model and continues.
pub fn run_model_probe(
    model_path: &Path,
    images: &[Grid],
    sample_index: &BTreeMap<usize, usize>,
) -> Result<ModelRun> {
    let loaded = Network::load(model_path)?;
    let (shapes, activations, trainable) = loaded.topology();
    let state = loaded.export_state()?;

    // Twin handles rebuilt fresh so runtime buffers are clean for each path.
    let mut cpu = Network::fresh(&shapes, &activations, &trainable)?;
    cpu.import_state(&state)?;
    let mut gpu = Network::fresh(&shapes, &activations, &trainable)?;
    gpu.import_state(&state)?;
    gpu.set_gpu(true);

    let init_start = Instant::now();
    let webgpu_init_ok = match gpu.init_gpu() {
        Ok(()) => {
            // warm-up forward amortizes pipeline setup outside the timings
            if let Some(&idx) = sample_index.get(&0) {
                if let Err(e) = gpu.forward(&images[idx]) {
                    tracing::warn!(error = %e, "GPU warm-up forward failed");
                }
                let _ = gpu.extract_output();
            }
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, model = %model_path.display(),
                "GPU init failed, GPU handle falls back to CPU");
            gpu.set_gpu(false);
            false
        }
    };
    let webgpu_init_time_ms = elapsed_ms(init_start);

    let mut cpu_timings = Vec::new();
    let mut gpu_timings = Vec::new();
    let mut drifts = Vec::new();

    for digit in 0..=9usize {
        let Some(&idx) = sample_index.get(&digit) else {
            tracing::warn!(digit, "no sample for digit, skipping");
            continue;
        };
        let sample = &images[idx];

        let out_cpu = match timed_forward(&mut cpu, sample) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(digit, error = %e, "CPU forward failed, skipping digit");
                continue;
            }
        };
        let out_gpu = match timed_forward(&mut gpu, sample) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(digit, error = %e, "GPU forward failed, skipping digit");
                continue;
            }
        };

        cpu_timings.push(sample_timing(digit, idx, &out_cpu));
        gpu_timings.push(sample_timing(digit, idx, &out_gpu));

        let (max_abs, mae) = drift(&out_cpu.output, &out_gpu.output);
        drifts.push(DriftMetrics {
            digit,
            idx,
            max_abs,
            mae,
        });
    }

    gpu.cleanup_gpu();

    let model_file = model_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(ModelRun {
        model_file,
        webgpu_init_ok,
        webgpu_init_time_ms,
        cpu: cpu_timings,
        gpu: gpu_timings,
        drift: drifts,
        adhd10: crate::diagnostics::AdhdScore::default(),
    })
}

struct ForwardResult {
    output: Vec<f64>,
    elapsed_ms: f64,
}

fn timed_forward(net: &mut Network, sample: &Grid) -> Result<ForwardResult> {
    let start = Instant::now();
    net.forward(sample)?;
    let output = net.extract_output();
    Ok(ForwardResult {
        output,
        elapsed_ms: elapsed_ms(start),
    })
}

fn sample_timing(digit: usize, idx: usize, fwd: &ForwardResult) -> SampleTiming {
    SampleTiming {
        digit,
        idx,
        elapsed_ms: fwd.elapsed_ms,
        pred: argmax(&fwd.output),
        top1_score: top1(&fwd.output),
        output: round_slice(&fwd.output, OUTPUT_DECIMALS),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_micros() as f64 / 1000.0
}

/// Index of the largest element; 0 for an empty slice.
fn argmax(xs: &[f64]) -> usize {
    let mut best = 0usize;
    for (i, &v) in xs.iter().enumerate().skip(1) {
        if v > xs[best] {
            best = i;
        }
    }
    best
}

/// Largest element; 0 for an empty slice.
fn top1(xs: &[f64]) -> f64 {
    xs.iter().copied().reduce(f64::max).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Activation, LayerSpec, Network};

    fn probe_fixture(dir: &Path) -> (std::path::PathBuf, Vec<Grid>, BTreeMap<usize, usize>) {
        let shapes = vec![
            LayerSpec {
                width: 4,
                height: 4,
            },
            LayerSpec {
                width: 6,
                height: 1,
            },
            LayerSpec {
                width: 10,
                height: 1,
            },
        ];
        let acts = vec![Activation::Linear, Activation::Relu, Activation::Softmax];
        let net = Network::fresh(&shapes, &acts, &[true, true, true]).unwrap();
        let path = dir.join("mnist_T1.json");
        net.save(&path).unwrap();

        let images: Vec<Grid> = (0..10)
            .map(|d| {
                (0..4)
                    .map(|r| (0..4).map(|c| f64::from(d * r * c) / 81.0).collect())
                    .collect()
            })
            .collect();
        let index: BTreeMap<usize, usize> = (0..10).map(|d| (d, d)).collect();
        (path, images, index)
    }

    #[test]
    fn test_probe_produces_aligned_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let (path, images, index) = probe_fixture(dir.path());

        let run = run_model_probe(&path, &images, &index).unwrap();
        assert_eq!(run.model_file, "mnist_T1.json");
        assert_eq!(run.cpu.len(), 10);
        assert_eq!(run.gpu.len(), 10);
        assert_eq!(run.drift.len(), 10);
        for i in 0..10 {
            assert_eq!(run.cpu[i].digit, run.gpu[i].digit);
            assert_eq!(run.cpu[i].digit, run.drift[i].digit);
            assert_eq!(run.cpu[i].idx, run.gpu[i].idx);
            assert_eq!(run.cpu[i].output.len(), 10);
            assert!(run.cpu[i].elapsed_ms >= 0.0);
        }
    }

    #[test]
    fn test_probe_without_gpu_backend_is_degenerate_twin() {
        let dir = tempfile::tempdir().unwrap();
        let (path, images, index) = probe_fixture(dir.path());
        let run = run_model_probe(&path, &images, &index).unwrap();

        if !run.webgpu_init_ok {
            // both paths ran on the CPU from identical weights
            for (c, g) in run.cpu.iter().zip(&run.gpu) {
                assert_eq!(c.pred, g.pred);
                assert_eq!(c.output, g.output);
            }
            for d in &run.drift {
                assert_eq!(d.max_abs, 0.0);
                assert_eq!(d.mae, 0.0);
            }
        }
    }

    #[test]
    fn test_probe_skips_missing_digit() {
        let dir = tempfile::tempdir().unwrap();
        let (path, images, mut index) = probe_fixture(dir.path());
        index.remove(&7);

        let run = run_model_probe(&path, &images, &index).unwrap();
        assert_eq!(run.cpu.len(), 9);
        assert!(run.cpu.iter().all(|t| t.digit != 7));
        assert_eq!(run.gpu.len(), 9);
        assert_eq!(run.drift.len(), 9);
    }

    #[test]
    fn test_probe_rejects_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let (_, images, index) = probe_fixture(dir.path());
        let err = run_model_probe(&dir.path().join("nope.json"), &images, &index).unwrap_err();
        assert!(matches!(err, crate::error::DerivaError::Engine(_)));
    }

    #[test]
    fn test_argmax_and_top1() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[]), 0);
        assert!((top1(&[0.1, 0.7, 0.2]) - 0.7).abs() < 1e-12);
        assert_eq!(top1(&[]), 0.0);
    }

    #[test]
    fn test_rounded_outputs_have_six_decimals() {
        let dir = tempfile::tempdir().unwrap();
        let (path, images, index) = probe_fixture(dir.path());
        let run = run_model_probe(&path, &images, &index).unwrap();
        for t in &run.cpu {
            for &v in &t.output {
                let scaled = v * 1e6;
                assert!((scaled - scaled.round()).abs() < 1e-6);
            }
        }
    }
}
