//! Model zoo: the canonical MNIST architectures a host publishes
//!
//! Ten dense architectures from S1 (784-64-10) to XL2 (784-2048×4-10), all
//! 28×28 input, hidden relu layers and a softmax output, saved with random
//! float32 weights under `<base>/models/` together with a manifest clients
//! can iterate. Existing files are kept, so re-running the zoo is cheap and
//! never invalidates models already being compared across devices.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::layers::{Activation, LayerSpec, Network};
use crate::telemetry::write_json;

/// One published model in `models/manifest.json`. Clients only need `id`
/// and `filename`; the rest documents the architecture for humans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZooEntry {
    /// Short architecture identifier, e.g. `S1`
    pub id: String,
    /// Layer widths, input to output
    pub layers: Vec<String>,
    /// Per-layer activations
    pub activations: Vec<String>,
    /// Per-layer trainability flags
    pub trainable: Vec<bool>,
    /// Published filename under `/models/`
    pub filename: String,
    /// File size after save
    pub bytes: u64,
}

/// The canonical architecture list, ordered small to extra-large.
#[must_use]
pub fn default_specs() -> Vec<(&'static str, Vec<usize>)> {
    vec![
        ("S1", vec![784, 64, 10]),
        ("S2", vec![784, 128, 10]),
        ("S3", vec![784, 256, 10]),
        ("M1", vec![784, 256, 256, 10]),
        ("M2", vec![784, 384, 384, 10]),
        ("M3", vec![784, 512, 512, 10]),
        ("L1", vec![784, 768, 768, 768, 10]),
        ("L2", vec![784, 1024, 1024, 1024, 10]),
        ("XL1", vec![784, 1536, 1536, 1536, 1536, 10]),
        ("XL2", vec![784, 2048, 2048, 2048, 2048, 10]),
    ]
}

/// Build every architecture in `specs` under `<base>/models/` and write the
/// manifest. Returns the manifest path.
///
/// # Errors
///
/// Returns an error when a model cannot be constructed or written; already
/// existing files are recorded in the manifest without being rebuilt.
pub fn create_model_zoo(base: &Path, specs: &[(&str, Vec<usize>)]) -> Result<PathBuf> {
    let model_dir = base.join("models");
    fs::create_dir_all(&model_dir)?;

    let mut manifest = Vec::with_capacity(specs.len());
    for (id, widths) in specs {
        let shapes = to_shapes(widths);
        let activations = build_activations(widths.len());
        let trainable = vec![true; widths.len()];
        let filename = format!("mnist_{id}.json");
        let out_path = model_dir.join(&filename);

        if !out_path.exists() {
            let net = Network::fresh(&shapes, &activations, &trainable)?;
            net.save(&out_path)?;
            println!("💾 {id} saved → {}", out_path.display());
        } else {
            println!("⚠ {id} already exists, keeping {}", out_path.display());
        }

        let bytes = fs::metadata(&out_path).map(|m| m.len()).unwrap_or(0);
        manifest.push(ZooEntry {
            id: (*id).to_string(),
            layers: widths.iter().map(ToString::to_string).collect(),
            activations: activations.iter().map(ToString::to_string).collect(),
            trainable,
            filename,
            bytes,
        });
    }

    let manifest_path = model_dir.join("manifest.json");
    write_json(&manifest_path, &manifest)?;
    println!("📜 manifest written → {}", manifest_path.display());
    Ok(manifest_path)
}

// Input is the 28×28 grid, output 10×1, hidden layers N×1.
fn to_shapes(widths: &[usize]) -> Vec<LayerSpec> {
    widths
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            if i == 0 {
                LayerSpec {
                    width: 28,
                    height: 28,
                }
            } else if i == widths.len() - 1 {
                LayerSpec {
                    width: 10,
                    height: 1,
                }
            } else {
                LayerSpec { width: w, height: 1 }
            }
        })
        .collect()
}

fn build_activations(n: usize) -> Vec<Activation> {
    (0..n)
        .map(|i| {
            if i == 0 {
                Activation::Linear
            } else if i == n - 1 {
                Activation::Softmax
            } else {
                Activation::Relu
            }
        })
        .collect()
}
