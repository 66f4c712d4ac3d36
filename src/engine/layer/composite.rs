use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::engine::activation::Activation;
use crate::engine::dimension::Dimension;
use crate::engine::layer::{copy_reshaped, Layer, LayerBuffers, LayerKind};
use crate::engine::matrix::{Matrix, MatrixMut};
use crate::engine::tensor::Tensor;
use crate::engine::view::{ReshapeView, SubRangeView};
use crate::error::{MatrixError, Result};

/// How a composite hands its input to the branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    /// Every branch sees the whole input; their errors are summed.
    Shared,
    /// The per-sample input is cut into consecutive pieces, one per branch.
    Partitioned,
}

/// 並列なサブレイヤーをまとめるレイヤー。
///
/// 1サンプルの出力は各ブランチの出力を順に連結したベクトル
/// `(1, Σ outputs, 1, batch)` です。
#[derive(Debug, Clone)]
pub struct Composite {
    buffers: LayerBuffers,
    routing: Routing,
    branches: Vec<LayerKind>,
    branch_errors: Vec<Tensor>,
}

impl Composite {
    pub fn new(routing: Routing, branches: Vec<LayerKind>) -> Result<Self> {
        let first = branches
            .first()
            .ok_or_else(|| MatrixError::InvalidNetwork("composite without branches".into()))?;
        let batch = first.input_dimension().hyper_slices();
        let first_input = first.input_dimension().hyper_slice_size();
        let mut inputs = 0;
        let mut outputs = 0;
        for (i, branch) in branches.iter().enumerate() {
            let input = branch.input_dimension();
            if input.hyper_slices() != batch {
                return Err(MatrixError::InvalidNetwork(format!(
                    "branch {} has batch {}, expected {}",
                    i,
                    input.hyper_slices(),
                    batch
                )));
            }
            if routing == Routing::Shared && input.hyper_slice_size() != first_input {
                return Err(MatrixError::InvalidNetwork(format!(
                    "shared branch {} takes {} inputs, expected {}",
                    i,
                    input.hyper_slice_size(),
                    first_input
                )));
            }
            inputs += input.hyper_slice_size();
            outputs += branch.output_dimension().hyper_slice_size();
        }
        if routing == Routing::Shared {
            inputs = first_input;
        }
        let branch_errors = branches
            .iter()
            .map(|b| Tensor::new(b.input_dimension()))
            .collect();
        Ok(Self {
            buffers: LayerBuffers::new(
                Tensor::new(Dimension::row_vectors(inputs, batch)),
                Dimension::row_vectors(outputs, batch),
            ),
            routing,
            branches,
            branch_errors,
        })
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    pub fn branches(&self) -> &[LayerKind] {
        &self.branches
    }

    pub fn branches_mut(&mut self) -> &mut [LayerKind] {
        &mut self.branches
    }

    fn input_start(&self, offset: usize) -> usize {
        match self.routing {
            Routing::Shared => 0,
            Routing::Partitioned => offset,
        }
    }
}

impl Layer for Composite {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn buffers(&self) -> &LayerBuffers {
        &self.buffers
    }

    fn buffers_mut(&mut self) -> &mut LayerBuffers {
        &mut self.buffers
    }

    fn forward(&mut self, backend: &dyn Backend) -> Result<()> {
        let (mut in_offset, mut out_offset) = (0, 0);
        for i in 0..self.branches.len() {
            let start = self.input_start(in_offset);
            let branch = &mut self.branches[i];
            let in_len = branch.input_dimension().hyper_slice_size();
            let segment = SubRangeView::new(&self.buffers.inputs, (0, start, 0), (1, in_len, 1))?;
            branch.set_input(&segment)?;
            branch.forward(backend)?;

            let out_len = branch.output_dimension().hyper_slice_size();
            let mut target =
                SubRangeView::new(&mut self.buffers.outputs, (0, out_offset, 0), (1, out_len, 1))?;
            let dim = target.dimension();
            target.copy_from(&ReshapeView::like(branch.outputs(), dim)?)?;
            in_offset += in_len;
            out_offset += out_len;
        }
        Ok(())
    }

    fn backpropagate(
        &mut self,
        backend: &dyn Backend,
        learning_rate: f32,
        calculate_errors: bool,
    ) -> Result<()> {
        self.buffers
            .output_deltas(backend, Activation::Identity, calculate_errors)?;
        let mut offset = 0;
        for branch in &mut self.branches {
            let len = branch.output_dimension().hyper_slice_size();
            let segment = SubRangeView::new(&self.buffers.errors, (0, offset, 0), (1, len, 1))?;
            copy_reshaped(&segment, branch.errors_mut())?;
            branch.backpropagate(backend, learning_rate, false)?;
            offset += len;
        }
        Ok(())
    }

    fn calculate_new_weights(&mut self, backend: &dyn Backend, learning_rate: f32) -> Result<()> {
        for branch in &mut self.branches {
            branch.calculate_new_weights(backend, learning_rate)?;
        }
        Ok(())
    }

    fn calculate_errors(&mut self, backend: &dyn Backend, previous: &mut Tensor) -> Result<()> {
        let width = self.buffers.input_errors.columns();
        let batch = self.buffers.input_errors.hyper_slices();
        self.buffers.input_errors.fill(0.0);
        let mut offset = 0;
        for i in 0..self.branches.len() {
            let start = self.input_start(offset);
            let scratch = &mut self.branch_errors[i];
            self.branches[i].calculate_errors(backend, scratch)?;
            let len = scratch.dimension().hyper_slice_size();
            // 同じ上流セルへの寄与は上書きせずに足し合わせる
            let src = scratch.values();
            let dst = self.buffers.input_errors.values_mut();
            for h in 0..batch {
                for j in 0..len {
                    dst[h * width + start + j] += src[h * len + j];
                }
            }
            offset += len;
        }
        self.buffers.project_errors(previous)
    }

    fn adapt_weights(&mut self, backend: &dyn Backend) -> Result<()> {
        for branch in &mut self.branches {
            branch.adapt_weights(backend)?;
        }
        Ok(())
    }

    fn randomize_weights(&mut self, rng: &mut dyn RngCore, min: f32, max: f32) {
        for branch in &mut self.branches {
            branch.randomize_weights(rng, min, max);
        }
    }

    fn weights(&self) -> Vec<&Tensor> {
        self.branches.iter().flat_map(|b| b.weights()).collect()
    }
}
