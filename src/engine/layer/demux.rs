use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::engine::dimension::Dimension;
use crate::engine::layer::{Layer, LayerBuffers};
use crate::engine::matrix::Matrix;
use crate::engine::tensor::Tensor;
use crate::error::{MatrixError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemuxMode {
    /// Reorders slices as all even slices followed by all odd slices.
    EvenOdd,
    /// Repeats the slices `n` times, one copy per downstream branch.
    Duplicate(usize),
}

/// スライス単位でテンソルを振り分けるルーティング専用レイヤー。
///
/// 逆方向では、同じ入力スライスに由来する出力スライスの誤差を合計します。
#[derive(Debug, Clone)]
pub struct Demux {
    buffers: LayerBuffers,
    mode: DemuxMode,
}

impl Demux {
    pub fn new(input: Dimension, mode: DemuxMode) -> Result<Self> {
        let slices = match mode {
            DemuxMode::EvenOdd => input.slices(),
            DemuxMode::Duplicate(0) => {
                return Err(MatrixError::Precondition("cannot duplicate 0 times".into()))
            }
            DemuxMode::Duplicate(n) => input.slices() * n,
        };
        let output = Dimension::new(input.rows(), input.columns(), slices, input.hyper_slices());
        Ok(Self {
            buffers: LayerBuffers::new(Tensor::new(input), output),
            mode,
        })
    }

    pub fn mode(&self) -> DemuxMode {
        self.mode
    }

    /// Input slice feeding output slice `t`.
    fn source_slice(&self, t: usize) -> usize {
        let slices = self.buffers.inputs.slices();
        match self.mode {
            DemuxMode::EvenOdd => {
                let evens = (slices + 1) / 2;
                if t < evens {
                    2 * t
                } else {
                    2 * (t - evens) + 1
                }
            }
            DemuxMode::Duplicate(_) => t % slices,
        }
    }
}

impl Layer for Demux {
    fn name(&self) -> &'static str {
        "demux"
    }

    fn buffers(&self) -> &LayerBuffers {
        &self.buffers
    }

    fn buffers_mut(&mut self) -> &mut LayerBuffers {
        &mut self.buffers
    }

    fn forward(&mut self, _backend: &dyn Backend) -> Result<()> {
        let plane = self.buffers.inputs.dimension().slice_size();
        let (in_slices, out_slices) = (self.buffers.inputs.slices(), self.buffers.outputs.slices());
        let sources: Vec<usize> = (0..out_slices).map(|t| self.source_slice(t)).collect();
        let src = self.buffers.inputs.values();
        let dst = self.buffers.outputs.values_mut();
        for h in 0..self.buffers.inputs.hyper_slices() {
            for (t, &s) in sources.iter().enumerate() {
                let from = (s + h * in_slices) * plane;
                let to = (t + h * out_slices) * plane;
                dst[to..to + plane].copy_from_slice(&src[from..from + plane]);
            }
        }
        Ok(())
    }

    fn calculate_errors(&mut self, _backend: &dyn Backend, previous: &mut Tensor) -> Result<()> {
        let plane = self.buffers.inputs.dimension().slice_size();
        let (in_slices, out_slices) = (self.buffers.inputs.slices(), self.buffers.outputs.slices());
        let batch = self.buffers.inputs.hyper_slices();
        let sources: Vec<usize> = (0..out_slices).map(|t| self.source_slice(t)).collect();
        {
            let deltas = self.buffers.deltas.values();
            let errors = self.buffers.input_errors.values_mut();
            errors.fill(0.0);
            for h in 0..batch {
                for (t, &s) in sources.iter().enumerate() {
                    let from = (t + h * out_slices) * plane;
                    let to = (s + h * in_slices) * plane;
                    for k in 0..plane {
                        errors[to + k] += deltas[from + k];
                    }
                }
            }
        }
        self.buffers.project_errors(previous)
    }
}
