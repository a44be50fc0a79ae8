//! Data directory resolution
//!
//! Everything the harness reads or serves lives under one base directory
//! (`public/` by convention): models, MNIST shards, downloaded artifacts and
//! reports. Resolution order:
//!
//! 1. `DERIVA_DATA_DIR` environment variable (must name an existing directory)
//! 2. explicit `--base` CLI override
//! 3. `public/` next to the executable, created if absent

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DerivaError, Result};

/// Environment variable overriding the base data directory
pub const DATA_DIR_ENV: &str = "DERIVA_DATA_DIR";

/// Resolve the base data directory.
///
/// `cli_override` is the value of the `--base` flag, if given. The
/// environment variable wins over the flag so operators can redirect a
/// deployed binary without touching its invocation.
///
/// # Errors
///
/// Returns `DerivaError::Config` when an override points at something that
/// is not a directory, or the executable location cannot be determined.
pub fn resolve_base(cli_override: Option<&Path>) -> Result<PathBuf> {
    if let Ok(raw) = env::var(DATA_DIR_ENV) {
        let v = raw.trim();
        if !v.is_empty() {
            let p = PathBuf::from(v);
            if p.is_dir() {
                return Ok(p);
            }
            return Err(DerivaError::Config(format!(
                "{DATA_DIR_ENV} set but not a directory: {v}"
            )));
        }
    }

    if let Some(p) = cli_override {
        if p.is_dir() {
            return Ok(p.to_path_buf());
        }
        return Err(DerivaError::Config(format!(
            "--base provided but not a directory: {}",
            p.display()
        )));
    }

    let exe = env::current_exe()?;
    let exe_dir = exe
        .parent()
        .ok_or_else(|| DerivaError::Config("could not determine executable location".into()))?;
    let public = exe_dir.join("public");
    fs::create_dir_all(&public)?;
    Ok(public)
}

/// Join `parts` onto the base directory and create the resulting directory.
///
/// # Errors
///
/// Returns an I/O error if creation fails.
pub fn ensure_dir(base: &Path, parts: &[&str]) -> Result<PathBuf> {
    let mut p = base.to_path_buf();
    for part in parts {
        p.push(part);
    }
    fs::create_dir_all(&p)?;
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        env::set_var(DATA_DIR_ENV, dir.path());
        let got = resolve_base(None).unwrap();
        assert_eq!(got, dir.path());
        env::remove_var(DATA_DIR_ENV);
    }

    #[test]
    #[serial]
    fn test_env_override_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, b"x").unwrap();
        env::set_var(DATA_DIR_ENV, &file);
        let err = resolve_base(None).unwrap_err();
        assert!(matches!(err, DerivaError::Config(_)));
        env::remove_var(DATA_DIR_ENV);
    }

    #[test]
    #[serial]
    fn test_cli_override() {
        env::remove_var(DATA_DIR_ENV);
        let dir = tempfile::tempdir().unwrap();
        let got = resolve_base(Some(dir.path())).unwrap();
        assert_eq!(got, dir.path());

        let missing = dir.path().join("missing");
        assert!(resolve_base(Some(&missing)).is_err());
    }

    #[test]
    #[serial]
    fn test_default_is_public_next_to_exe() {
        env::remove_var(DATA_DIR_ENV);
        let got = resolve_base(None).unwrap();
        assert!(got.ends_with("public"));
        assert!(got.is_dir());
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let dir = tempfile::tempdir().unwrap();
        let p = ensure_dir(dir.path(), &["reports", "archive"]).unwrap();
        assert!(p.is_dir());
        assert!(p.ends_with("reports/archive"));
    }
}
