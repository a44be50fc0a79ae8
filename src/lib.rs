//! # Deriva
//!
//! Cross-device inference conformance and drift telemetry harness.
//!
//! Deriva (Spanish: "drift") measures whether the same neural model produces
//! the same answers, at what latency, across heterogeneous hardware. A host
//! publishes a catalog of pre-trained MNIST models and the dataset shards
//! over HTTP; clients pull the catalog, run every model on a CPU path and a
//! GPU path built from identical weights against a fixed 10-digit probe,
//! quantify the numerical drift between the paths, and push a versioned
//! JSON telemetry report back for cross-device comparison.
//!
//! ## Pipeline
//!
//! ```text
//! probe system → fetch manifest → download models → ensure MNIST →
//! load dataset → per model: twin-instance probe + ADHD10 rollup →
//! write report locally → multipart upload
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use deriva::{pipeline, telemetry::Source};
//!
//! let report = pipeline::run_pipeline(
//!     "http://192.168.1.20:8080",
//!     Source::Native,
//!     std::path::Path::new("public"),
//! )?;
//! println!("report saved at {}", report.display());
//! ```
//!
//! ## GPU support
//!
//! The `gpu` cargo feature compiles a wgpu compute backend for the GPU path.
//! Without it, GPU initialization reports unavailability and the GPU handle
//! deliberately re-runs on the CPU, so reports keep their full shape with
//! `webgpu_init_ok = false` and near-zero drift.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod diagnostics;
pub mod error;
pub mod fetch;
pub mod gpu;
pub mod layers;
pub mod mnist;
pub mod paths;
pub mod pipeline;
pub mod probe;
pub mod server;
pub mod system;
pub mod telemetry;
pub mod zoo;

// Re-exports for convenience
pub use error::{DerivaError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_matches_report_schema() {
        assert_eq!(VERSION, telemetry::REPORT_VERSION);
    }
}
