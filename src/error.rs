//! Error types for Deriva
//!
//! One variant per failure domain of the telemetry pipeline and the host
//! artifact service. The orchestrator's failure policy (abort vs. skip vs.
//! degrade) is keyed on these variants.

use thiserror::Error;

/// Result type alias for Deriva operations
pub type Result<T> = std::result::Result<T, DerivaError>;

/// Error type for all Deriva operations
#[derive(Error, Debug)]
pub enum DerivaError {
    /// The artifact host rejected or failed a request (manifest, model or
    /// MNIST fetch). Fatal before the model loop starts.
    #[error("host error: {0}")]
    Host(String),

    /// IDX dataset parsing failed (missing shard, short read, header count
    /// inconsistent with file length). Fatal to the invocation.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Inference engine failure (load, topology discovery, state import).
    /// Model-local: the orchestrator logs, skips the model and continues.
    #[error("engine error: {0}")]
    Engine(String),

    /// GPU initialization failed. Recoverable: the GPU handle falls back to
    /// CPU execution and the report carries `webgpu_init_ok = false`.
    #[error("gpu init failed: {0}")]
    GpuInit(String),

    /// Report upload failed. The local report file is retained for manual
    /// retry.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Invalid configuration (data directory, bind address, CLI input).
    #[error("config error: {0}")]
    Config(String),

    /// Underlying I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
