use crate::data::idx::{IdxImages, IdxLabels};
use crate::engine::dimension::Dimension;
use crate::engine::matrix::Matrix;
use crate::engine::tensor::Tensor;
use crate::error::{MatrixError, Result};

/// ラベル付きサンプルの集合。サンプル `i` は `samples()` のハイパースライス `i` です。
pub trait Dataset {
    fn samples(&self) -> &Tensor;

    fn label(&self, index: usize) -> usize;

    fn classes(&self) -> usize;

    fn len(&self) -> usize {
        self.samples().dimension().hyper_slices()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of one sample, with a single hyperslice.
    fn sample_dimension(&self) -> Dimension {
        let d = self.samples().dimension();
        Dimension::new(d.rows(), d.columns(), d.slices(), 1)
    }
}

/// Samples held in one tensor, labels alongside.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    samples: Tensor,
    labels: Vec<usize>,
    classes: usize,
}

impl TensorDataset {
    pub fn new(samples: Tensor, labels: Vec<usize>, classes: usize) -> Result<Self> {
        if labels.len() != samples.dimension().hyper_slices() {
            return Err(MatrixError::mismatch(
                "dataset labels",
                samples.dimension().hyper_slices(),
                labels.len(),
            ));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= classes) {
            return Err(MatrixError::Precondition(format!(
                "label {} outside {} classes",
                bad, classes
            )));
        }
        Ok(Self {
            samples,
            labels,
            classes,
        })
    }

    /// Images scaled to `[0, 1]`, one hyperslice per image.
    pub fn from_idx(images: &IdxImages, labels: &IdxLabels, classes: usize) -> Result<Self> {
        if images.len() != labels.len() || images.is_empty() {
            return Err(MatrixError::Format(format!(
                "{} images but {} labels",
                images.len(),
                labels.len()
            )));
        }
        let dim = Dimension::new(images.rows, images.columns, 1, images.len());
        let mut samples = Tensor::new(dim);
        {
            let values = samples.values_mut();
            for h in 0..images.len() {
                // ファイルは行優先、テンソルは列優先
                for (i, &p) in images.image(h).iter().enumerate() {
                    let (r, c) = (i / images.columns, i % images.columns);
                    values[dim.index(r, c, 0, h)] = p as f32 / 255.0;
                }
            }
        }
        let labels = labels.as_slice().iter().map(|&l| l as usize).collect();
        Self::new(samples, labels, classes)
    }
}

impl Dataset for TensorDataset {
    fn samples(&self) -> &Tensor {
        &self.samples
    }

    fn label(&self, index: usize) -> usize {
        self.labels[index]
    }

    fn classes(&self) -> usize {
        self.classes
    }
}
