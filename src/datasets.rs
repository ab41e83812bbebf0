//! The MNIST handwritten digit dataset
//!
//! Images are 28x28 grayscale digits stored in the IDX format. Pixels are scaled to `[0, 1]`
//! and then normalized with mean 0.5 and standard deviation 0.5, so values lie in `[-1, 1]`.

use std::{
    fs, panic,
    path::{Path, PathBuf},
};

use mnist::MnistBuilder;
use thiserror::Error;

use crate::dataloader::{DataLoader, DataLoaderError};

pub const IMAGE_ROWS: usize = 28;
pub const IMAGE_COLS: usize = 28;
pub const IMAGE_PIXELS: usize = IMAGE_ROWS * IMAGE_COLS;
pub const N_CLASSES: usize = 10;

pub const TRAIN_SIZE: usize = 60_000;
pub const TEST_SIZE: usize = 10_000;

pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// Mirror serving the original gzipped IDX archives
pub const MNIST_MIRROR: &str = "https://ossci-datasets.s3.amazonaws.com/mnist";

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

/// Normalization applied to every pixel after scaling to `[0, 1]`
pub const MEAN: f32 = 0.5;
pub const STD: f32 = 0.5;

/// Errors for loading datasets
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("MNIST files {missing:?} not found in '{}' (enable downloading to fetch them)", dir.display())]
    MissingFiles { dir: PathBuf, missing: Vec<String> },
    #[error("failed to download MNIST from {url} into '{}' (remove partial archives and retry)", dir.display())]
    Download { dir: PathBuf, url: &'static str },
    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid IDX magic number 0x{got:08x}, expected 0x{expected:08x}")]
    InvalidMagic { expected: u32, got: u32 },
    #[error("IDX data truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("expected {expected_pixels} pixels per image, got {got}")]
    ImageSize { expected_pixels: usize, got: usize },
    #[error("{images} images but {labels} labels")]
    LengthMismatch { images: usize, labels: usize },
    #[error("requested {requested} samples but only {available} are available")]
    TooManySamples { requested: usize, available: usize },
}

/// Scales raw pixels to `[0, 1]` then normalizes them: `(p / 255 - mean) / std`
pub fn normalize(pixels: &[u8], mean: f32, std: f32) -> Vec<f32> {
    pixels
        .iter()
        .map(|&p| (f32::from(p) / 255.0 - mean) / std)
        .collect()
}

/// Undoes [`normalize`] into `[0, 1]` intensities, used for display
pub fn denormalize(values: &[f32], mean: f32, std: f32) -> Vec<f32> {
    values.iter().map(|v| (v * std + mean).clamp(0.0, 1.0)).collect()
}

/// One split of the dataset with normalized images and digit labels
#[derive(Debug, Clone)]
pub struct MnistSplit {
    /// row-major `[n, IMAGE_PIXELS]`
    pub images: Vec<f32>,
    pub labels: Vec<usize>,
}

impl MnistSplit {
    /// Builds a split from raw pixels (`IMAGE_PIXELS` bytes per image) and digit labels
    pub fn from_raw(images: &[u8], labels: &[u8]) -> Result<Self, DatasetError> {
        if images.len() % IMAGE_PIXELS != 0 {
            return Err(DatasetError::ImageSize {
                expected_pixels: IMAGE_PIXELS,
                got: images.len() % IMAGE_PIXELS,
            });
        }
        let n_images = images.len() / IMAGE_PIXELS;
        if n_images != labels.len() {
            return Err(DatasetError::LengthMismatch {
                images: n_images,
                labels: labels.len(),
            });
        }
        Ok(Self {
            images: normalize(images, MEAN, STD),
            labels: labels.iter().map(|&l| l as usize).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Normalized pixels of image `idx`
    pub fn image(&self, idx: usize) -> Option<&[f32]> {
        (idx < self.len()).then(|| &self.images[idx * IMAGE_PIXELS..(idx + 1) * IMAGE_PIXELS])
    }

    pub fn into_loader(self, batch_size: usize, shuffle: bool) -> Result<DataLoader, DataLoaderError> {
        DataLoader::new(self.images, IMAGE_PIXELS, self.labels, batch_size, shuffle)
    }
}

/// Training and test splits
#[derive(Debug, Clone)]
pub struct Mnist {
    pub train: MnistSplit,
    pub test: MnistSplit,
}

/// Loads the first `train_len` training and `test_len` test samples from the IDX files in `dir`.
///
/// Missing files are downloaded and extracted into `dir` when `download` is set.
pub fn load_mnist(
    dir: &Path,
    train_len: usize,
    test_len: usize,
    download: bool,
) -> Result<Mnist, DatasetError> {
    if train_len > TRAIN_SIZE {
        return Err(DatasetError::TooManySamples {
            requested: train_len,
            available: TRAIN_SIZE,
        });
    }
    if test_len > TEST_SIZE {
        return Err(DatasetError::TooManySamples {
            requested: test_len,
            available: TEST_SIZE,
        });
    }

    let missing = missing_files(dir);
    if !missing.is_empty() {
        if !download {
            return Err(DatasetError::MissingFiles {
                dir: dir.to_path_buf(),
                missing,
            });
        }
        fetch_mnist(dir)?;
    }

    log::info!("Loading MNIST from '{}'", dir.display());
    let (train_images, train_labels) = read_split(dir, TRAIN_IMAGES, TRAIN_LABELS, train_len)?;
    let (test_images, test_labels) = read_split(dir, TEST_IMAGES, TEST_LABELS, test_len)?;
    Ok(Mnist {
        train: MnistSplit::from_raw(&train_images, &train_labels)?,
        test: MnistSplit::from_raw(&test_images, &test_labels)?,
    })
}

fn missing_files(dir: &Path) -> Vec<String> {
    [TRAIN_IMAGES, TRAIN_LABELS, TEST_IMAGES, TEST_LABELS]
        .iter()
        .filter(|name| !dir.join(name).is_file())
        .map(|name| name.to_string())
        .collect()
}

/// Downloads the four gzipped IDX archives from [`MNIST_MIRROR`] and extracts them into `dir`.
///
/// Archives or extracted files already in `dir` are not fetched again. Only the files are
/// taken from the downloader, the splits are always parsed by [`load_mnist`].
pub fn fetch_mnist(dir: &Path) -> Result<(), DatasetError> {
    fs::create_dir_all(dir).map_err(|source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    log::info!("Downloading MNIST from {} into '{}'", MNIST_MIRROR, dir.display());
    // the builder joins file names onto the base path as plain strings
    let base_path = format!("{}/", dir.display());
    // the downloader panics on network and format errors
    let fetched = panic::catch_unwind(|| {
        MnistBuilder::new()
            .label_format_digit()
            .base_url(MNIST_MIRROR)
            .base_path(&base_path)
            .training_set_length(0)
            .validation_set_length(0)
            .test_set_length(0)
            .download_and_extract()
            .finalize();
    });
    if fetched.is_err() {
        return Err(DatasetError::Download {
            dir: dir.to_path_buf(),
            url: MNIST_MIRROR,
        });
    }

    let missing = missing_files(dir);
    if !missing.is_empty() {
        return Err(DatasetError::MissingFiles {
            dir: dir.to_path_buf(),
            missing,
        });
    }
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>, DatasetError> {
    fs::read(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_split(
    dir: &Path,
    images_file: &str,
    labels_file: &str,
    len: usize,
) -> Result<(Vec<u8>, Vec<u8>), DatasetError> {
    let mut images = parse_idx_images(&read_file(&dir.join(images_file))?)?;
    let mut labels = parse_idx_labels(&read_file(&dir.join(labels_file))?)?;
    let available = labels.len();
    if len > available {
        return Err(DatasetError::TooManySamples {
            requested: len,
            available,
        });
    }
    images.truncate(len * IMAGE_PIXELS);
    labels.truncate(len);
    Ok((images, labels))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, DatasetError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DatasetError::Truncated {
            expected: offset + 4,
            got: bytes.len(),
        })
}

fn check_magic(bytes: &[u8], expected: u32) -> Result<(), DatasetError> {
    let got = read_u32(bytes, 0)?;
    if got != expected {
        return Err(DatasetError::InvalidMagic { expected, got });
    }
    Ok(())
}

/// Parses an IDX3 image file (big-endian header: magic, count, rows, cols) into raw pixels
pub fn parse_idx_images(bytes: &[u8]) -> Result<Vec<u8>, DatasetError> {
    check_magic(bytes, IMAGES_MAGIC)?;
    let n_images = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;
    if rows * cols != IMAGE_PIXELS {
        return Err(DatasetError::ImageSize {
            expected_pixels: IMAGE_PIXELS,
            got: rows * cols,
        });
    }
    let expected = 16 + n_images * IMAGE_PIXELS;
    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            expected,
            got: bytes.len(),
        });
    }
    Ok(bytes[16..expected].to_vec())
}

/// Parses an IDX1 label file (big-endian header: magic, count) into digit labels
pub fn parse_idx_labels(bytes: &[u8]) -> Result<Vec<u8>, DatasetError> {
    check_magic(bytes, LABELS_MAGIC)?;
    let n_labels = read_u32(bytes, 4)? as usize;
    let expected = 8 + n_labels;
    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            expected,
            got: bytes.len(),
        });
    }
    Ok(bytes[8..expected].to_vec())
}
