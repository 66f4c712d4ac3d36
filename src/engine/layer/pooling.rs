use crate::backend::host::pooled_dimension;
use crate::backend::Backend;
use crate::engine::dimension::Dimension;
use crate::engine::layer::{Layer, LayerBuffers};
use crate::engine::tensor::Tensor;
use crate::error::{MatrixError, Result};

/// Max pooling over non-overlapping `pool × pool` windows.
///
/// The forward pass records the winner of every window in `mask`; the
/// backward pass routes each delta to exactly that cell.
#[derive(Debug, Clone)]
pub struct Pooling {
    buffers: LayerBuffers,
    pool: usize,
    mask: Tensor,
}

impl Pooling {
    pub fn new(input: Dimension, pool: usize) -> Result<Self> {
        if pool == 0 || pool > input.rows() || pool > input.columns() {
            return Err(MatrixError::Precondition(format!(
                "pool size {} does not fit {}",
                pool, input
            )));
        }
        let output = pooled_dimension(input, pool);
        Ok(Self {
            buffers: LayerBuffers::new(Tensor::new(input), output),
            pool,
            mask: Tensor::new(output),
        })
    }

    /// 各出力セルの最大値を与えた入力セルのスライス内インデックス `r + c*rows`
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    pub fn pool(&self) -> usize {
        self.pool
    }
}

impl Layer for Pooling {
    fn name(&self) -> &'static str {
        "pooling"
    }

    fn buffers(&self) -> &LayerBuffers {
        &self.buffers
    }

    fn buffers_mut(&mut self) -> &mut LayerBuffers {
        &mut self.buffers
    }

    fn forward(&mut self, backend: &dyn Backend) -> Result<()> {
        backend.max_pool(
            &self.buffers.inputs,
            self.pool,
            &mut self.buffers.outputs,
            &mut self.mask,
        )
    }

    fn calculate_errors(&mut self, backend: &dyn Backend, previous: &mut Tensor) -> Result<()> {
        backend.backprop_max_pool(&self.buffers.deltas, &self.mask, &mut self.buffers.input_errors)?;
        self.buffers.project_errors(previous)
    }
}
