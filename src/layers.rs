//! Dense inference engine
//!
//! The capability set the telemetry pipeline requires of an inference
//! engine: type-aware model loading, topology discovery, fresh construction,
//! round-trippable state export/import, GPU lifecycle, forward evaluation
//! and output extraction.
//!
//! Models are layered dense networks persisted as JSON with a `float32` type
//! tag. The first layer describes the input grid (28×28 for MNIST) and
//! carries no weights; every following layer holds a row-major weight matrix
//! `[units × prev_units]`, a bias vector and a per-layer activation.
//!
//! ## Twin-instance usage
//!
//! ```rust,ignore
//! let loaded = Network::load(path)?;
//! let (shapes, acts, train) = loaded.topology();
//! let state = loaded.export_state()?;
//!
//! let mut cpu = Network::fresh(&shapes, &acts, &train)?;
//! cpu.import_state(&state)?;
//! let mut gpu = Network::fresh(&shapes, &acts, &train)?;
//! gpu.import_state(&state)?;
//! gpu.set_gpu(true);
//! if gpu.init_gpu().is_err() {
//!     gpu.set_gpu(false); // degraded: second CPU pass, report shape intact
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DerivaError, Result};
use crate::gpu::{ComputeBackend, GpuCompute};

/// Type tag required in persisted model files
pub const MODEL_TYPE_TAG: &str = "float32";

/// Per-layer activation function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Identity
    Linear,
    /// `max(0, x)`
    Relu,
    /// Logistic
    Sigmoid,
    /// Normalized exponentials over the whole layer
    Softmax,
}

impl Activation {
    /// Apply the activation in place over one layer's pre-activations.
    fn apply(self, xs: &mut [f32]) {
        match self {
            Activation::Linear => {}
            Activation::Relu => {
                for x in xs.iter_mut() {
                    *x = x.max(0.0);
                }
            }
            Activation::Sigmoid => {
                for x in xs.iter_mut() {
                    *x = 1.0 / (1.0 + (-*x).exp());
                }
            }
            Activation::Softmax => {
                let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for x in xs.iter_mut() {
                    *x = (*x - max).exp();
                    sum += *x;
                }
                if sum > 0.0 {
                    for x in xs.iter_mut() {
                        *x /= sum;
                    }
                }
            }
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Softmax => "softmax",
        };
        f.write_str(name)
    }
}

/// Width × height of one layer's unit grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Units per row
    pub width: usize,
    /// Rows
    pub height: usize,
}

impl LayerSpec {
    /// Total unit count
    #[must_use]
    pub fn units(&self) -> usize {
        self.width * self.height
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LayerState {
    width: usize,
    height: usize,
    activation: Activation,
    trainable: bool,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetworkState {
    #[serde(rename = "type")]
    type_tag: String,
    layers: Vec<LayerState>,
}

/// An inference engine handle: a dense network with an optional GPU context
#[derive(Debug)]
pub struct Network {
    layers: Vec<LayerState>,
    gpu_enabled: bool,
    gpu: Option<GpuCompute>,
    output: Vec<f32>,
}

impl Network {
    /// Load a persisted network, rejecting anything but the `float32` variant.
    ///
    /// # Errors
    ///
    /// Returns `DerivaError::Engine` for an unreadable file, a wrong type
    /// tag, or inconsistent layer dimensions.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| DerivaError::Engine(format!("{}: {e}", path.display())))?;
        let state: NetworkState = serde_json::from_slice(&bytes)
            .map_err(|e| DerivaError::Engine(format!("{}: {e}", path.display())))?;
        Self::from_state(state)
    }

    /// Persist the network as JSON with the `float32` type tag.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or the file write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = NetworkState {
            type_tag: MODEL_TYPE_TAG.to_string(),
            layers: self.layers.clone(),
        };
        let bytes = serde_json::to_vec(&state)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Construct an uninitialized network with the given topology and
    /// randomized weights.
    ///
    /// # Errors
    ///
    /// Returns `DerivaError::Engine` when the three slices disagree in
    /// length, fewer than two layers are given, or a layer has zero units.
    pub fn fresh(
        shapes: &[LayerSpec],
        activations: &[Activation],
        trainable: &[bool],
    ) -> Result<Self> {
        if shapes.len() != activations.len() || shapes.len() != trainable.len() {
            return Err(DerivaError::Engine(format!(
                "topology arity mismatch: {} shapes, {} activations, {} trainable flags",
                shapes.len(),
                activations.len(),
                trainable.len()
            )));
        }
        if shapes.len() < 2 {
            return Err(DerivaError::Engine(
                "network needs at least an input and an output layer".to_string(),
            ));
        }

        let mut rng = rand::thread_rng();
        let mut layers = Vec::with_capacity(shapes.len());
        for (i, spec) in shapes.iter().enumerate() {
            let units = spec.units();
            if units == 0 {
                return Err(DerivaError::Engine(format!("layer {i} has zero units")));
            }
            let (weights, biases) = if i == 0 {
                (Vec::new(), Vec::new())
            } else {
                let fan_in = shapes[i - 1].units();
                let scale = 1.0 / (fan_in as f32).sqrt();
                let weights = (0..units * fan_in)
                    .map(|_| rng.gen_range(-scale..scale))
                    .collect();
                let biases = (0..units).map(|_| rng.gen_range(-scale..scale)).collect();
                (weights, biases)
            };
            layers.push(LayerState {
                width: spec.width,
                height: spec.height,
                activation: activations[i],
                trainable: trainable[i],
                weights,
                biases,
            });
        }

        Ok(Self {
            layers,
            gpu_enabled: false,
            gpu: None,
            output: Vec::new(),
        })
    }

    /// Per-layer shapes, activations and trainability flags.
    #[must_use]
    pub fn topology(&self) -> (Vec<LayerSpec>, Vec<Activation>, Vec<bool>) {
        let shapes = self
            .layers
            .iter()
            .map(|l| LayerSpec {
                width: l.width,
                height: l.height,
            })
            .collect();
        let acts = self.layers.iter().map(|l| l.activation).collect();
        let train = self.layers.iter().map(|l| l.trainable).collect();
        (shapes, acts, train)
    }

    /// Export the full weight state as an opaque blob.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails.
    pub fn export_state(&self) -> Result<String> {
        let state = NetworkState {
            type_tag: MODEL_TYPE_TAG.to_string(),
            layers: self.layers.clone(),
        };
        Ok(serde_json::to_string(&state)?)
    }

    /// Import a state blob previously produced by [`Network::export_state`].
    ///
    /// # Errors
    ///
    /// Returns `DerivaError::Engine` when the blob does not parse, carries a
    /// different type tag, or does not match this network's topology.
    pub fn import_state(&mut self, blob: &str) -> Result<()> {
        let state: NetworkState = serde_json::from_str(blob)
            .map_err(|e| DerivaError::Engine(format!("state import: {e}")))?;
        validate_state(&state)?;
        if state.layers.len() != self.layers.len() {
            return Err(DerivaError::Engine(format!(
                "state import: {} layers, this network has {}",
                state.layers.len(),
                self.layers.len()
            )));
        }
        for (i, (theirs, ours)) in state.layers.iter().zip(&self.layers).enumerate() {
            if theirs.width != ours.width || theirs.height != ours.height {
                return Err(DerivaError::Engine(format!(
                    "state import: layer {i} is {}x{}, this network has {}x{}",
                    theirs.width, theirs.height, ours.width, ours.height
                )));
            }
        }
        self.layers = state.layers;
        self.output.clear();
        Ok(())
    }

    /// Request GPU execution on subsequent forwards.
    pub fn set_gpu(&mut self, enabled: bool) {
        self.gpu_enabled = enabled;
    }

    /// Whether GPU execution is currently requested.
    #[must_use]
    pub fn gpu_enabled(&self) -> bool {
        self.gpu_enabled
    }

    /// Initialize the GPU context. Idempotent per handle.
    ///
    /// # Errors
    ///
    /// Returns `DerivaError::GpuInit` when no GPU backend is available; the
    /// handle stays usable on the CPU.
    pub fn init_gpu(&mut self) -> Result<()> {
        if self.gpu.is_some() {
            return Ok(());
        }
        self.gpu = Some(GpuCompute::new(ComputeBackend::Gpu)?);
        Ok(())
    }

    /// Release the GPU context, if any. Safe to call repeatedly.
    pub fn cleanup_gpu(&mut self) {
        self.gpu = None;
    }

    /// Run one forward pass over an input grid matching the input layer.
    ///
    /// # Errors
    ///
    /// Returns `DerivaError::Engine` when the input shape does not match the
    /// input layer or a compute kernel fails.
    pub fn forward(&mut self, input: &[Vec<f64>]) -> Result<()> {
        let input_layer = &self.layers[0];
        if input.len() != input_layer.height
            || input.iter().any(|row| row.len() != input_layer.width)
        {
            return Err(DerivaError::Engine(format!(
                "input shape mismatch: expected {}x{}",
                input_layer.height, input_layer.width
            )));
        }

        let mut x: Vec<f32> = input
            .iter()
            .flat_map(|row| row.iter().map(|&v| v as f32))
            .collect();

        let gpu_enabled = self.gpu_enabled;
        let layers = &self.layers;
        let gpu = &mut self.gpu;

        for layer in &layers[1..] {
            let units = layer.width * layer.height;
            let fan_in = x.len();

            let mut pre = match (gpu_enabled, gpu.as_mut()) {
                (true, Some(g)) => g.matmul(&layer.weights, &x, units, fan_in, 1)?,
                _ => {
                    let mut pre = vec![0.0f32; units];
                    for (u, out) in pre.iter_mut().enumerate() {
                        let row = &layer.weights[u * fan_in..(u + 1) * fan_in];
                        *out = row.iter().zip(&x).map(|(w, v)| w * v).sum();
                    }
                    pre
                }
            };

            for (p, b) in pre.iter_mut().zip(&layer.biases) {
                *p += b;
            }
            layer.activation.apply(&mut pre);
            x = pre;
        }

        self.output = x;
        Ok(())
    }

    /// Output vector of the most recent forward pass.
    #[must_use]
    pub fn extract_output(&self) -> Vec<f64> {
        self.output.iter().map(|&v| f64::from(v)).collect()
    }

    fn from_state(state: NetworkState) -> Result<Self> {
        validate_state(&state)?;
        Ok(Self {
            layers: state.layers,
            gpu_enabled: false,
            gpu: None,
            output: Vec::new(),
        })
    }
}

// Invariants every persisted or imported state must satisfy before the
// forward pass may index into it.
fn validate_state(state: &NetworkState) -> Result<()> {
    if state.type_tag != MODEL_TYPE_TAG {
        return Err(DerivaError::Engine(format!(
            "expected type {MODEL_TYPE_TAG}, got {}",
            state.type_tag
        )));
    }
    if state.layers.len() < 2 {
        return Err(DerivaError::Engine(
            "model needs at least an input and an output layer".to_string(),
        ));
    }
    for (i, layer) in state.layers.iter().enumerate() {
        let units = layer.width * layer.height;
        if units == 0 {
            return Err(DerivaError::Engine(format!("layer {i} has zero units")));
        }
        if i > 0 {
            let fan_in = state.layers[i - 1].width * state.layers[i - 1].height;
            if layer.weights.len() != units * fan_in || layer.biases.len() != units {
                return Err(DerivaError::Engine(format!(
                    "layer {i} weight/bias size inconsistent with topology"
                )));
            }
        }
    }
    Ok(())
}

impl Drop for Network {
    fn drop(&mut self) {
        // GPU context must not outlive the model's probe scope.
        self.cleanup_gpu();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_topology() -> (Vec<LayerSpec>, Vec<Activation>, Vec<bool>) {
        (
            vec![
                LayerSpec {
                    width: 2,
                    height: 2,
                },
                LayerSpec {
                    width: 3,
                    height: 1,
                },
                LayerSpec {
                    width: 10,
                    height: 1,
                },
            ],
            vec![Activation::Linear, Activation::Relu, Activation::Softmax],
            vec![true, true, true],
        )
    }

    fn tiny_input() -> Vec<Vec<f64>> {
        vec![vec![0.5, 0.25], vec![0.0, 1.0]]
    }

    #[test]
    fn test_fresh_and_topology_round_trip() {
        let (shapes, acts, train) = tiny_topology();
        let net = Network::fresh(&shapes, &acts, &train).unwrap();
        let (s2, a2, t2) = net.topology();
        assert_eq!(s2, shapes);
        assert_eq!(a2, acts);
        assert_eq!(t2, train);
    }

    #[test]
    fn test_fresh_rejects_arity_mismatch() {
        let (shapes, acts, _) = tiny_topology();
        assert!(Network::fresh(&shapes, &acts, &[true]).is_err());
    }

    #[test]
    fn test_forward_softmax_output_sums_to_one() {
        let (shapes, acts, train) = tiny_topology();
        let mut net = Network::fresh(&shapes, &acts, &train).unwrap();
        net.forward(&tiny_input()).unwrap();
        let out = net.extract_output();
        assert_eq!(out.len(), 10);
        let sum: f64 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "softmax sum was {sum}");
    }

    #[test]
    fn test_forward_rejects_wrong_input_shape() {
        let (shapes, acts, train) = tiny_topology();
        let mut net = Network::fresh(&shapes, &acts, &train).unwrap();
        let err = net.forward(&[vec![1.0, 2.0, 3.0]]).unwrap_err();
        assert!(err.to_string().contains("input shape mismatch"));
    }

    #[test]
    fn test_state_export_import_reproduces_outputs() {
        let (shapes, acts, train) = tiny_topology();
        let mut a = Network::fresh(&shapes, &acts, &train).unwrap();
        let mut b = Network::fresh(&shapes, &acts, &train).unwrap();
        let state = a.export_state().unwrap();
        b.import_state(&state).unwrap();

        a.forward(&tiny_input()).unwrap();
        b.forward(&tiny_input()).unwrap();
        assert_eq!(a.extract_output(), b.extract_output());
    }

    #[test]
    fn test_import_rejects_topology_mismatch() {
        let (shapes, acts, train) = tiny_topology();
        let a = Network::fresh(&shapes, &acts, &train).unwrap();
        let state = a.export_state().unwrap();

        let other_shapes = vec![
            LayerSpec {
                width: 2,
                height: 2,
            },
            LayerSpec {
                width: 10,
                height: 1,
            },
        ];
        let mut b = Network::fresh(
            &other_shapes,
            &[Activation::Linear, Activation::Softmax],
            &[true, true],
        )
        .unwrap();
        assert!(b.import_state(&state).is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        let (shapes, acts, train) = tiny_topology();
        let mut orig = Network::fresh(&shapes, &acts, &train).unwrap();
        orig.save(&path).unwrap();

        let mut loaded = Network::load(&path).unwrap();
        orig.forward(&tiny_input()).unwrap();
        loaded.forward(&tiny_input()).unwrap();
        assert_eq!(orig.extract_output(), loaded.extract_output());
    }

    #[test]
    fn test_load_rejects_wrong_type_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f64.json");
        std::fs::write(&path, r#"{"type":"float64","layers":[]}"#).unwrap();
        let err = Network::load(&path).unwrap_err();
        assert!(err.to_string().contains("expected type float32"));
    }

    #[test]
    fn test_load_rejects_inconsistent_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let bad = r#"{"type":"float32","layers":[
            {"width":2,"height":1,"activation":"linear","trainable":true,"weights":[],"biases":[]},
            {"width":2,"height":1,"activation":"softmax","trainable":true,"weights":[0.1],"biases":[0.0,0.0]}
        ]}"#;
        std::fs::write(&path, bad).unwrap();
        assert!(Network::load(&path).is_err());
    }

    #[test]
    fn test_init_gpu_without_backend_falls_back() {
        let (shapes, acts, train) = tiny_topology();
        let mut net = Network::fresh(&shapes, &acts, &train).unwrap();
        net.set_gpu(true);
        if net.init_gpu().is_err() {
            // the degraded twin: same handle keeps working on the CPU
            net.set_gpu(false);
        }
        net.forward(&tiny_input()).unwrap();
        assert_eq!(net.extract_output().len(), 10);
        net.cleanup_gpu();
    }

    #[test]
    fn test_cleanup_gpu_is_reentrant() {
        let (shapes, acts, train) = tiny_topology();
        let mut net = Network::fresh(&shapes, &acts, &train).unwrap();
        net.cleanup_gpu();
        net.cleanup_gpu();
    }
}
