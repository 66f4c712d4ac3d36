use rand::RngCore;

use crate::backend::{correlation_output, Backend};
use crate::engine::activation::Activation;
use crate::engine::dimension::Dimension;
use crate::engine::layer::{Layer, LayerBuffers};
use crate::engine::matrix::MatrixMut;
use crate::engine::tensor::Tensor;
use crate::error::Result;

/// 畳み込みレイヤー。
///
/// フィルタは全ての位置で共有され、形状は `(filterSize, filterSize,
/// features * inputSlices)` です。特徴 `f` と入力スライス `s` の組のフィルタは
/// スライス `f * inputSlices + s` にあります。入力は `padding` 分だけ仮想的に
/// ゼロで囲まれます。
#[derive(Debug, Clone)]
pub struct Convolution {
    buffers: LayerBuffers,
    stride: usize,
    activation: Activation,
    filters: Tensor,
    gradients: Tensor,
}

impl Convolution {
    /// `input` is the full input shape including the batch in its
    /// hyperslices.
    pub fn new(
        input: Dimension,
        filter_size: usize,
        features: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
    ) -> Result<Self> {
        let (rows, columns) = correlation_output(input, padding, filter_size, stride)?;
        let output = Dimension::new(rows, columns, features, input.hyper_slices());
        let filter_dim = Dimension::new(filter_size, filter_size, features * input.slices(), 1);
        Ok(Self {
            buffers: LayerBuffers::new(Tensor::with_padding(input, padding), output),
            stride,
            activation,
            filters: Tensor::new(filter_dim),
            gradients: Tensor::new(filter_dim),
        })
    }

    pub fn filters(&self) -> &Tensor {
        &self.filters
    }

    pub fn filters_mut(&mut self) -> &mut Tensor {
        &mut self.filters
    }

    pub fn gradients(&self) -> &Tensor {
        &self.gradients
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl Layer for Convolution {
    fn name(&self) -> &'static str {
        "convolution"
    }

    fn buffers(&self) -> &LayerBuffers {
        &self.buffers
    }

    fn buffers_mut(&mut self) -> &mut LayerBuffers {
        &mut self.buffers
    }

    fn activation(&self) -> Activation {
        self.activation
    }

    fn forward(&mut self, backend: &dyn Backend) -> Result<()> {
        backend.correlate(
            &self.buffers.inputs,
            &self.filters,
            self.stride,
            &mut self.buffers.outputs,
        )?;
        backend.activate(self.activation, &mut self.buffers.outputs)
    }

    fn calculate_new_weights(&mut self, backend: &dyn Backend, learning_rate: f32) -> Result<()> {
        backend.correlate_weights(
            &self.buffers.inputs,
            &self.buffers.deltas,
            self.stride,
            -learning_rate,
            &mut self.gradients,
        )
    }

    fn calculate_errors(&mut self, backend: &dyn Backend, previous: &mut Tensor) -> Result<()> {
        backend.backprop_correlate(
            &self.buffers.deltas,
            &self.filters,
            self.stride,
            &mut self.buffers.input_errors,
        )?;
        self.buffers.project_errors(previous)
    }

    fn adapt_weights(&mut self, backend: &dyn Backend) -> Result<()> {
        backend.add_scaled(1.0, &self.gradients, &mut self.filters)?;
        self.gradients.fill(0.0);
        Ok(())
    }

    fn randomize_weights(&mut self, rng: &mut dyn RngCore, min: f32, max: f32) {
        self.filters.randomize(rng, min, max);
    }

    fn weights(&self) -> Vec<&Tensor> {
        vec![&self.filters]
    }
}
