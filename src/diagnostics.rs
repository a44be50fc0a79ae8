//! Diagnostics engine: drift metrics and the ADHD10 rollup
//!
//! Drift quantifies numerical divergence between the CPU and GPU output
//! vectors of runs that should be mathematically equivalent. The ADHD10
//! rollup combines top-1 accuracy per path, CPU/GPU prediction agreement and
//! drift magnitudes over the 10 fixed probe samples, with per-sample bucket
//! labels for exact 1:1 device comparisons.

use serde::{Deserialize, Serialize};

use crate::telemetry::ModelRun;

/// Per-sample correctness bucket against ground truth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bucket {
    /// Prediction equals the true digit
    #[serde(rename = "correct")]
    Correct,
    /// Prediction is off by exactly one digit class (diagnostic subset of
    /// wrong; MNIST near-misses are common)
    #[serde(rename = "off_by_1")]
    OffBy1,
    /// Prediction differs from the true digit
    #[serde(rename = "wrong")]
    Wrong,
}

/// CPU/GPU prediction agreement for one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agreement {
    /// Both paths predicted the same digit
    Agree,
    /// The paths disagree
    Disagree,
}

/// Bucket counters for strict 1:1 device/model comparison.
///
/// `cpu_correct + cpu_wrong = N` (same for GPU) and
/// `cpu_gpu_agree + cpu_gpu_disagree = N`; the off-by-1 counters overlap the
/// wrong counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdhdBuckets {
    /// CPU predictions matching ground truth
    pub cpu_correct: usize,
    /// CPU predictions missing ground truth
    pub cpu_wrong: usize,
    /// GPU predictions matching ground truth
    pub gpu_correct: usize,
    /// GPU predictions missing ground truth
    pub gpu_wrong: usize,
    /// CPU misses that were off by exactly one class
    pub cpu_off_by_1: usize,
    /// GPU misses that were off by exactly one class
    pub gpu_off_by_1: usize,
    /// Samples where both paths predicted the same digit
    pub cpu_gpu_agree: usize,
    /// Samples where the paths disagreed
    pub cpu_gpu_disagree: usize,
}

/// Per-sample labels for exact 1:1 diffs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdhdSample {
    /// Ground-truth digit
    pub digit: usize,
    /// Dataset index of the probed sample
    pub idx: usize,
    /// CPU-path prediction
    pub cpu_pred: usize,
    /// GPU-path prediction
    pub gpu_pred: usize,
    /// CPU bucket label
    pub cpu_bucket: Bucket,
    /// GPU bucket label
    pub gpu_bucket: Bucket,
    /// Prediction agreement between paths
    pub agreement: Agreement,
}

/// The ADHD10 rollup for one model run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdhdScore {
    /// CPU top-1 accuracy as a percentage in `[0, 100]`
    pub top1_accuracy_cpu: f64,
    /// GPU top-1 accuracy as a percentage in `[0, 100]`
    pub top1_accuracy_gpu: f64,
    /// Number of samples where the paths predicted the same digit
    pub cpu_vs_gpu_agree_count: usize,
    /// Mean of per-sample drift MAE
    pub avg_drift_mae: f64,
    /// Maximum per-sample drift max-abs
    pub max_drift_max_abs: f64,
    /// Bucket counters
    pub buckets: AdhdBuckets,
    /// Per-sample labels, aligned with the run's cpu/gpu/drift arrays
    pub per_sample: Vec<AdhdSample>,
}

/// Drift between two output vectors: `(max_abs, mae)`.
///
/// Degenerate inputs (empty, or length mismatch) yield `(0, 0)` so a broken
/// extraction never poisons the rollup.
#[must_use]
pub fn drift(a: &[f64], b: &[f64]) -> (f64, f64) {
    if a.is_empty() || a.len() != b.len() {
        return (0.0, 0.0);
    }
    let mut max_abs = 0.0f64;
    let mut sum = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let d = (x - y).abs();
        sum += d;
        if d > max_abs {
            max_abs = d;
        }
    }
    (max_abs, sum / a.len() as f64)
}

/// Label a prediction against ground truth.
#[must_use]
pub fn bucket_label(pred: usize, truth: usize) -> Bucket {
    if pred == truth {
        Bucket::Correct
    } else if pred.abs_diff(truth) == 1 {
        Bucket::OffBy1
    } else {
        Bucket::Wrong
    }
}

/// Compute the ADHD10 rollup over a model run's aligned cpu/gpu/drift arrays.
///
/// Relies on positional alignment: `cpu[i]`, `gpu[i]` and `drift[i]` refer to
/// the same `(digit, idx)` pair. Returns a zeroed score when any of the three
/// arrays is empty.
#[must_use]
pub fn compute_adhd10(run: &ModelRun) -> AdhdScore {
    if run.cpu.is_empty() || run.gpu.is_empty() || run.drift.is_empty() {
        return AdhdScore::default();
    }

    let mut buckets = AdhdBuckets::default();
    let mut per_sample = Vec::with_capacity(run.cpu.len());
    let mut sum_mae = 0.0f64;
    let mut max_max_abs = 0.0f64;
    let mut n = 0usize;

    for ((c, g), d) in run.cpu.iter().zip(&run.gpu).zip(&run.drift) {
        let cpu_bucket = bucket_label(c.pred, c.digit);
        let gpu_bucket = bucket_label(g.pred, g.digit);

        if cpu_bucket == Bucket::Correct {
            buckets.cpu_correct += 1;
        } else {
            buckets.cpu_wrong += 1;
        }
        if gpu_bucket == Bucket::Correct {
            buckets.gpu_correct += 1;
        } else {
            buckets.gpu_wrong += 1;
        }
        if c.pred.abs_diff(c.digit) == 1 {
            buckets.cpu_off_by_1 += 1;
        }
        if g.pred.abs_diff(g.digit) == 1 {
            buckets.gpu_off_by_1 += 1;
        }

        let agreement = if c.pred == g.pred {
            buckets.cpu_gpu_agree += 1;
            Agreement::Agree
        } else {
            buckets.cpu_gpu_disagree += 1;
            Agreement::Disagree
        };

        sum_mae += d.mae;
        if d.max_abs > max_max_abs {
            max_max_abs = d.max_abs;
        }

        per_sample.push(AdhdSample {
            digit: c.digit,
            idx: c.idx,
            cpu_pred: c.pred,
            gpu_pred: g.pred,
            cpu_bucket,
            gpu_bucket,
            agreement,
        });
        n += 1;
    }

    AdhdScore {
        top1_accuracy_cpu: percentage(buckets.cpu_correct, n),
        top1_accuracy_gpu: percentage(buckets.gpu_correct, n),
        cpu_vs_gpu_agree_count: buckets.cpu_gpu_agree,
        avg_drift_mae: safe_div(sum_mae, n as f64),
        max_drift_max_abs: max_max_abs,
        buckets,
        per_sample,
    }
}

fn percentage(count: usize, total: usize) -> f64 {
    safe_div(count as f64, total as f64) * 100.0
}

fn safe_div(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        0.0
    } else {
        a / b
    }
}
