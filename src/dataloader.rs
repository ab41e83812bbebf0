//! Data loader

use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

use crate::tensor::Tensor;

/// Errors for the dataloader
#[derive(Debug, Error, PartialEq)]
pub enum DataLoaderError {
    #[error("Batch size must be positive")]
    ZeroBatchSize,
    #[error("{len} values cannot be split into samples of {n_features} features")]
    InputDimensionMismatch { len: usize, n_features: usize },
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
}

/// Data loader, returns batches of samples and labels optionally shuffled.
/// The last batch holds the remaining samples and may be smaller than `batch_size`.
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    // row-major `[n_samples, n_features]`
    samples: Vec<f32>,
    n_features: usize,
    // class index per sample
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
}

impl DataLoader {
    pub fn new(
        samples: Vec<f32>,
        n_features: usize,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        if n_features == 0 || samples.len() % n_features != 0 {
            return Err(DataLoaderError::InputDimensionMismatch {
                len: samples.len(),
                n_features,
            });
        }
        let data_len = samples.len() / n_features;
        if data_len != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len,
            });
        }
        Ok(Self {
            samples,
            n_features,
            labels,
            batch_size,
            shuffle,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.labels.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches in one epoch
    pub fn len(&self) -> usize {
        self.n_samples().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Features of sample `idx`
    pub fn sample(&self, idx: usize) -> Option<(&[f32], usize)> {
        let label = *self.labels.get(idx)?;
        let start = idx * self.n_features;
        Some((&self.samples[start..start + self.n_features], label))
    }

    /// Iterates over one epoch, shuffled with a generator seeded from `seed` when shuffling
    pub fn seeded_iter(&self, seed: u64) -> DataLoaderIterator<'_> {
        use rand::SeedableRng;
        use rand_pcg::Pcg64Mcg;

        self.iter_with_rng(&mut Pcg64Mcg::seed_from_u64(seed))
    }

    pub fn iter(&self) -> DataLoaderIterator<'_> {
        self.iter_with_rng(&mut rand::rng())
    }

    fn iter_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.n_samples()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        DataLoaderIterator {
            loader: self,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of samples and labels until the end of the dataset
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = (Tensor, Vec<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.loader.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.curr_iter..end];
        let n_features = self.loader.n_features;
        let mut batch_data = Vec::with_capacity(batch_indices.len() * n_features);
        let mut batch_labels = Vec::with_capacity(batch_indices.len());
        for &i in batch_indices {
            batch_data.extend_from_slice(&self.loader.samples[i * n_features..(i + 1) * n_features]);
            batch_labels.push(self.loader.labels[i]);
        }
        self.curr_iter = end;
        // the length always matches the shape
        let batch = Tensor::new(batch_data, [batch_labels.len(), n_features]).ok()?;
        Some((batch, batch_labels))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.indices.len() - self.curr_iter).div_ceil(self.loader.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for DataLoaderIterator<'_> {}
