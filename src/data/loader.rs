use rand::seq::SliceRandom;
use rand::Rng;

use super::dataset::Dataset;
use crate::engine::dimension::Dimension;
use crate::engine::matrix::{Matrix, MatrixMut};
use crate::engine::tensor::Tensor;
use crate::error::{MatrixError, Result};

/// Assembles fixed-size batches from a dataset.
///
/// The input and one-hot target tensors are allocated once and refilled
/// for every batch by gathering hyperslices. The last batch wraps around to
/// the start of the index order so every batch is full.
pub struct BatchLoader<'a, D: Dataset> {
    dataset: &'a D,
    batch_size: usize,
    indices: Vec<usize>,
    inputs: Tensor,
    targets: Tensor,
}

impl<'a, D: Dataset> BatchLoader<'a, D> {
    pub fn new(dataset: &'a D, batch_size: usize) -> Result<Self> {
        if batch_size == 0 || dataset.is_empty() {
            return Err(MatrixError::Precondition(
                "batch loader needs a non-empty dataset and batch size".into(),
            ));
        }
        let sample = dataset.sample_dimension();
        Ok(Self {
            dataset,
            batch_size,
            indices: (0..dataset.len()).collect(),
            inputs: Tensor::new(Dimension::new(
                sample.rows(),
                sample.columns(),
                sample.slices(),
                batch_size,
            )),
            targets: Tensor::new(Dimension::row_vectors(dataset.classes(), batch_size)),
        })
    }

    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.indices.shuffle(rng);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches in one pass over the dataset.
    pub fn batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    /// Fills and returns `(inputs, targets)` of batch `index`.
    pub fn batch(&mut self, index: usize) -> Result<(&Tensor, &Tensor)> {
        if index >= self.batches() {
            return Err(MatrixError::Precondition(format!(
                "batch {} out of {}",
                index,
                self.batches()
            )));
        }
        let samples = self.dataset.samples();
        self.targets.fill(0.0);
        for slot in 0..self.batch_size {
            let i = self.indices[(index * self.batch_size + slot) % self.indices.len()];
            samples.get_hyper_slice(i, &mut self.inputs, slot)?;
            self.targets.set_at(0, self.dataset.label(i), 0, slot, 1.0);
        }
        Ok((&self.inputs, &self.targets))
    }
}
