//! MNIST dataset loading (IDX binary format)
//!
//! Parses the big-endian IDX format: a 16-byte image header (magic, count,
//! rows, cols) followed by one byte per pixel, and an 8-byte label header
//! (magic, count) followed by one byte per label. Pixels are scaled to
//! `[0, 1]`; labels expand to 1×10 one-hot rows.
//!
//! The loader always reads the training shard and then the test shard from
//! the same directory and concatenates them in that order, so sample indices
//! are stable across runs against the same shard files.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{DerivaError, Result};

/// One image (rows × cols) or one label row (1 × 10) as a float grid
pub type Grid = Vec<Vec<f64>>;

/// Canonical shard filenames served under `/mnist/` on the host
pub const MNIST_FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

/// Load both MNIST shards from `dir`, concatenated train-then-test.
///
/// # Errors
///
/// Returns `DerivaError::Dataset` for a missing shard, a short read, or a
/// header count inconsistent with the file length.
pub fn load_dataset(dir: &Path) -> Result<(Vec<Grid>, Vec<Grid>)> {
    let mut images = Vec::new();
    let mut labels = Vec::new();

    for set in ["train", "t10k"] {
        let imgs = load_images(&dir.join(format!("{set}-images-idx3-ubyte")))?;
        let lbls = load_labels(&dir.join(format!("{set}-labels-idx1-ubyte")))?;
        if imgs.len() != lbls.len() {
            return Err(DerivaError::Dataset(format!(
                "{set} shard mismatch: {} images vs {} labels",
                imgs.len(),
                lbls.len()
            )));
        }
        images.extend(imgs);
        labels.extend(lbls);
    }

    Ok((images, labels))
}

/// Parse an IDX image file into per-sample pixel grids.
///
/// # Errors
///
/// Returns `DerivaError::Dataset` on a short header or truncated pixel data.
pub fn load_images(path: &Path) -> Result<Vec<Grid>> {
    let data = fs::read(path)
        .map_err(|e| DerivaError::Dataset(format!("{}: {e}", path.display())))?;
    if data.len() < 16 {
        return Err(DerivaError::Dataset(format!(
            "{}: short image header ({} bytes)",
            path.display(),
            data.len()
        )));
    }

    let count = be_u32(&data[4..8]) as usize;
    let rows = be_u32(&data[8..12]) as usize;
    let cols = be_u32(&data[12..16]) as usize;

    let need = 16 + count.saturating_mul(rows).saturating_mul(cols);
    if data.len() < need {
        return Err(DerivaError::Dataset(format!(
            "{}: header claims {count} {rows}x{cols} images ({need} bytes) but file has {}",
            path.display(),
            data.len()
        )));
    }

    let mut images = Vec::with_capacity(count);
    let mut off = 16;
    for _ in 0..count {
        let mut img = Vec::with_capacity(rows);
        for r in 0..rows {
            let row_bytes = &data[off + r * cols..off + (r + 1) * cols];
            img.push(row_bytes.iter().map(|&b| f64::from(b) / 255.0).collect());
        }
        images.push(img);
        off += rows * cols;
    }
    Ok(images)
}

/// Parse an IDX label file into 1×10 one-hot rows.
///
/// # Errors
///
/// Returns `DerivaError::Dataset` on a short header or truncated label data.
pub fn load_labels(path: &Path) -> Result<Vec<Grid>> {
    let data = fs::read(path)
        .map_err(|e| DerivaError::Dataset(format!("{}: {e}", path.display())))?;
    if data.len() < 8 {
        return Err(DerivaError::Dataset(format!(
            "{}: short label header ({} bytes)",
            path.display(),
            data.len()
        )));
    }

    let count = be_u32(&data[4..8]) as usize;
    if data.len() < 8 + count {
        return Err(DerivaError::Dataset(format!(
            "{}: header claims {count} labels but file has {} bytes",
            path.display(),
            data.len()
        )));
    }

    Ok(data[8..8 + count].iter().map(|&b| one_hot(b)).collect())
}

/// First-occurrence index per digit class.
///
/// A single linear scan over the one-hot labels; contains all 10 keys when
/// the dataset is complete. Missing digits simply have no entry.
#[must_use]
pub fn first_index_per_digit(labels: &[Grid]) -> BTreeMap<usize, usize> {
    let mut first = BTreeMap::new();
    for (i, lbl) in labels.iter().enumerate() {
        let Some(row) = lbl.first() else { continue };
        if let Some(d) = row.iter().position(|&v| v == 1.0) {
            first.entry(d).or_insert(i);
        }
    }
    first
}

fn one_hot(label: u8) -> Grid {
    let mut row = vec![0.0; 10];
    if (label as usize) < 10 {
        row[label as usize] = 1.0;
    }
    vec![row]
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Serialize images in IDX format: one `rows`×`cols` byte grid each.
    pub(crate) fn write_idx_images(path: &Path, images: &[Vec<u8>], rows: u32, cols: u32) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(&0x0000_0803u32.to_be_bytes()).unwrap();
        f.write_all(&(images.len() as u32).to_be_bytes()).unwrap();
        f.write_all(&rows.to_be_bytes()).unwrap();
        f.write_all(&cols.to_be_bytes()).unwrap();
        for img in images {
            assert_eq!(img.len(), (rows * cols) as usize);
            f.write_all(img).unwrap();
        }
    }

    pub(crate) fn write_idx_labels(path: &Path, labels: &[u8]) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(&0x0000_0801u32.to_be_bytes()).unwrap();
        f.write_all(&(labels.len() as u32).to_be_bytes()).unwrap();
        f.write_all(labels).unwrap();
    }

    fn write_shard_pair(dir: &Path, set: &str, labels: &[u8]) {
        let images: Vec<Vec<u8>> = labels
            .iter()
            .map(|&l| {
                let mut px = vec![0u8; 4];
                px[0] = l.saturating_mul(20);
                px
            })
            .collect();
        write_idx_images(&dir.join(format!("{set}-images-idx3-ubyte")), &images, 2, 2);
        write_idx_labels(&dir.join(format!("{set}-labels-idx1-ubyte")), labels);
    }

    #[test]
    fn test_load_dataset_concatenates_train_then_test() {
        let dir = tempfile::tempdir().unwrap();
        write_shard_pair(dir.path(), "train", &[3, 1]);
        write_shard_pair(dir.path(), "t10k", &[7]);

        let (images, labels) = load_dataset(dir.path()).unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!(labels.len(), 3);
        // train sample 0 has label 3
        assert_eq!(labels[0][0][3], 1.0);
        // t10k sample is appended last
        assert_eq!(labels[2][0][7], 1.0);
        // pixel scaling: 3*20 = 60 -> 60/255
        assert!((images[0][0][0] - 60.0 / 255.0).abs() < 1e-12);
    }

    #[test]
    fn test_reload_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        write_shard_pair(dir.path(), "train", &[0, 5, 9]);
        write_shard_pair(dir.path(), "t10k", &[2]);

        let a = load_dataset(dir.path()).unwrap();
        let b = load_dataset(dir.path()).unwrap();
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn test_missing_shard_is_dataset_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_dataset(dir.path()).unwrap_err();
        assert!(matches!(err, DerivaError::Dataset(_)));
    }

    #[test]
    fn test_truncated_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train-images-idx3-ubyte");
        // header claims 5 images of 28x28 but carries no pixel bytes
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x0000_0803u32.to_be_bytes());
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.extend_from_slice(&28u32.to_be_bytes());
        bytes.extend_from_slice(&28u32.to_be_bytes());
        fs::write(&path, &bytes).unwrap();

        let err = load_images(&path).unwrap_err();
        assert!(err.to_string().contains("claims 5"));
    }

    #[test]
    fn test_truncated_label_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l");
        fs::write(&path, [0u8; 4]).unwrap();
        assert!(load_labels(&path).is_err());
    }

    #[test]
    fn test_first_index_per_digit_picks_smallest() {
        let one_hot_row = |d: usize| {
            let mut row = vec![0.0; 10];
            row[d] = 1.0;
            vec![row]
        };
        let labels = vec![
            one_hot_row(4),
            one_hot_row(1),
            one_hot_row(4),
            one_hot_row(0),
        ];
        let first = first_index_per_digit(&labels);
        assert_eq!(first.get(&4), Some(&0));
        assert_eq!(first.get(&1), Some(&1));
        assert_eq!(first.get(&0), Some(&3));
        assert_eq!(first.get(&9), None);
        assert_eq!(first.len(), 3);
    }
}
