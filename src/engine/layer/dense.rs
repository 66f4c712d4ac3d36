use rand::RngCore;

use crate::backend::Backend;
use crate::engine::activation::Activation;
use crate::engine::dimension::Dimension;
use crate::engine::layer::{copy_reshaped, Layer, LayerBuffers};
use crate::engine::matrix::{Matrix, MatrixMut};
use crate::engine::tensor::Tensor;
use crate::engine::view::{ReshapeView, SubRangeView, TransposedView};
use crate::error::Result;

/// 全結合レイヤー。
///
/// 1サンプルは行ベクトル `(1, n, 1, batch)` で、入力の最後の列はバイアス
/// (常に 1.0) です。重みは `(n + 1) × m` の行列で、順伝播は `inputs · weights`、
/// 逆方向の誤差は `deltas · weightsᵗ` です。
#[derive(Debug, Clone)]
pub struct Dense {
    buffers: LayerBuffers,
    n_inputs: usize,
    activation: Activation,
    weights: Tensor,
    weight_delta: Tensor,
}

impl Dense {
    /// Panics if any size is zero.
    pub fn new(inputs: usize, outputs: usize, batch: usize, activation: Activation) -> Self {
        let mut input = Tensor::new(Dimension::row_vectors(inputs + 1, batch));
        for h in 0..batch {
            input.set_at(0, inputs, 0, h, 1.0);
        }
        let weight_dim = Dimension::matrix(inputs + 1, outputs);
        Self {
            buffers: LayerBuffers::new(input, Dimension::row_vectors(outputs, batch)),
            n_inputs: inputs,
            activation,
            weights: Tensor::new(weight_dim),
            weight_delta: Tensor::new(weight_dim),
        }
    }

    /// Weight matrix, the last row holding the biases.
    pub fn weight_matrix(&self) -> &Tensor {
        &self.weights
    }

    pub fn set_weights(&mut self, weights: &dyn Matrix) -> Result<()> {
        self.weights.copy_from(weights)
    }

    /// Weight change accumulated since the last `adapt_weights`.
    pub fn weight_delta(&self) -> &Tensor {
        &self.weight_delta
    }
}

impl Layer for Dense {
    fn name(&self) -> &'static str {
        "dense"
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

    fn input_dimension(&self) -> Dimension {
        Dimension::row_vectors(self.n_inputs, self.buffers.inputs.hyper_slices())
    }

    // バイアス列には触れない
    fn set_input(&mut self, input: &dyn Matrix) -> Result<()> {
        let source = ReshapeView::like(input, self.input_dimension())?;
        let mut target =
            SubRangeView::new(&mut self.buffers.inputs, (0, 0, 0), (1, self.n_inputs, 1))?;
        target.copy_from(&source)
    }

    fn forward(&mut self, backend: &dyn Backend) -> Result<()> {
        backend.sgemm(
            1.0,
            &self.buffers.inputs,
            &self.weights,
            0.0,
            &mut self.buffers.outputs,
        )?;
        backend.activate(self.activation, &mut self.buffers.outputs)
    }

    fn calculate_new_weights(&mut self, backend: &dyn Backend, learning_rate: f32) -> Result<()> {
        // delta += -lr * inputsᵗ · deltas (summed over the batch)
        backend.sgemm(
            -learning_rate,
            &TransposedView::new(&self.buffers.inputs),
            &self.buffers.deltas,
            1.0,
            &mut self.weight_delta,
        )
    }

    fn calculate_errors(&mut self, backend: &dyn Backend, previous: &mut Tensor) -> Result<()> {
        backend.sgemm(
            1.0,
            &self.buffers.deltas,
            &TransposedView::new(&self.weights),
            0.0,
            &mut self.buffers.input_errors,
        )?;
        let errors = SubRangeView::new(&self.buffers.input_errors, (0, 0, 0), (1, self.n_inputs, 1))?;
        copy_reshaped(&errors, previous)
    }

    fn adapt_weights(&mut self, backend: &dyn Backend) -> Result<()> {
        backend.add_scaled(1.0, &self.weight_delta, &mut self.weights)?;
        self.weight_delta.fill(0.0);
        Ok(())
    }

    fn randomize_weights(&mut self, rng: &mut dyn RngCore, min: f32, max: f32) {
        self.weights.randomize(rng, min, max);
    }

    fn weights(&self) -> Vec<&Tensor> {
        vec![&self.weights]
    }
}
