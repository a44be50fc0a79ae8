//! Artifact fetcher: manifest, model files and MNIST shards
//!
//! A thin blocking HTTP client over the host artifact service. Caching is
//! idempotent by presence only: an already-present local file is trusted and
//! left untouched, so a second `ensure_mnist` performs no network I/O.
//! Partial files from interrupted downloads are acceptable; re-runs
//! overwrite them.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DerivaError, Result};
use crate::mnist::MNIST_FILES;

/// One entry of the host's model manifest. Extra manifest fields (layer
/// specs, byte counts) are ignored by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelManifestEntry {
    /// Model identifier, e.g. `S1`
    #[serde(default)]
    pub id: String,
    /// Published filename under `/models/`; empty entries are skipped
    #[serde(default)]
    pub filename: String,
}

/// Fetch and decode `<host>/models/manifest.json`.
///
/// # Errors
///
/// Returns `DerivaError::Host` on transport failure, a non-200 status, or a
/// manifest that does not decode.
pub fn fetch_manifest(host_base: &str) -> Result<Vec<ModelManifestEntry>> {
    let url = format!("{}/models/manifest.json", host_base.trim_end_matches('/'));
    let resp = reqwest::blocking::get(&url)
        .map_err(|e| DerivaError::Host(format!("GET {url}: {e}")))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(DerivaError::Host(format!("status {status} from {url}")));
    }
    resp.json()
        .map_err(|e| DerivaError::Host(format!("decode manifest from {url}: {e}")))
}

/// Download `url` to `dest`, creating parent directories.
///
/// Not atomic: a failed transfer may leave a partial file, which the next
/// run overwrites.
///
/// # Errors
///
/// Returns `DerivaError::Host` on transport failure or non-200 status.
pub fn download(url: &str, dest: &Path) -> Result<()> {
    let mut resp = reqwest::blocking::get(url)
        .map_err(|e| DerivaError::Host(format!("GET {url}: {e}")))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(DerivaError::Host(format!("status {status} from {url}")));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(dest)?;
    resp.copy_to(&mut file)
        .map_err(|e| DerivaError::Host(format!("stream {url}: {e}")))?;
    Ok(())
}

/// Pull every manifest model that is not empty-named into `dir`, returning
/// local paths in manifest order.
///
/// # Errors
///
/// Returns `DerivaError::Host` when any download fails (fatal before the
/// model loop starts).
pub fn download_models(
    host_base: &str,
    manifest: &[ModelManifestEntry],
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let base = host_base.trim_end_matches('/');
    let mut paths = Vec::new();
    for entry in manifest {
        if entry.filename.is_empty() {
            tracing::warn!(id = %entry.id, "manifest entry without filename, skipping");
            continue;
        }
        let url = format!("{base}/models/{}", entry.filename);
        let dest = dir.join(&entry.filename);
        download(&url, &dest)
            .map_err(|e| DerivaError::Host(format!("download {}: {e}", entry.filename)))?;
        paths.push(dest);
    }
    Ok(paths)
}

/// Make sure all four canonical MNIST shards exist under `dir`, pulling any
/// missing one from `<host>/mnist/<name>`.
///
/// # Errors
///
/// Returns `DerivaError::Host` when a required shard cannot be fetched.
pub fn ensure_mnist(host_base: &str, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let base = host_base.trim_end_matches('/');
    for name in MNIST_FILES {
        let dest = dir.join(name);
        if dest.exists() {
            continue;
        }
        let url = format!("{base}/mnist/{name}");
        tracing::info!(%url, "fetching MNIST shard");
        download(&url, &dest)
            .map_err(|e| DerivaError::Host(format!("mnist download {name}: {e}")))?;
    }
    Ok(())
}
