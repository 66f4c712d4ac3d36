//! ニューラルネットワークのレイヤー。
//!
//! 全てのレイヤーは [`Layer`] トレイトを実装し、入力・出力・誤差・デルタの
//! バッファを構築時に一度だけ確保して所有します。種類は有限なので、
//! ネットワークは [`LayerKind`] という閉じた列挙型で保持します。
//!
//! 逆伝播は3段階に分かれています:
//! `backpropagate` (デルタと重みの差分を計算) → `calculate_errors`
//! (前のレイヤーの座標系へ誤差を射影) → `adapt_weights` (差分を確定)。
//! 差分は `adapt_weights` が呼ばれるまで加算され続けるので、
//! 同じ実装でサンプル単位の学習とバッチ学習の両方ができます。

use rand::RngCore;

use crate::backend::Backend;
use crate::engine::activation::Activation;
use crate::engine::dimension::Dimension;
use crate::engine::matrix::{Matrix, MatrixMut};
use crate::engine::tensor::Tensor;
use crate::engine::view::ReshapeView;
use crate::error::{MatrixError, Result};

pub mod composite;
pub mod convolution;
pub mod demux;
pub mod dense;
pub mod fuzzification;
pub mod pooling;

pub use composite::{Composite, Routing};
pub use convolution::Convolution;
pub use demux::{Demux, DemuxMode};
pub use dense::Dense;
pub use fuzzification::Fuzzification;
pub use pooling::Pooling;

/// Copies `source` into `target`, reinterpreting it under the target's shape
/// when both have the same per-hyperslice extent.
pub(crate) fn copy_reshaped(source: &dyn Matrix, target: &mut Tensor) -> Result<()> {
    if source.dimension() == target.dimension() {
        return target.copy_from(source);
    }
    target.copy_from(&ReshapeView::like(source, target.dimension())?)
}

/// Scratch buffers every layer owns, sized once at construction.
#[derive(Debug, Clone)]
pub struct LayerBuffers {
    pub inputs: Tensor,
    pub outputs: Tensor,
    pub errors: Tensor,
    pub deltas: Tensor,
    /// Errors projected onto the input grid, before they are handed to the
    /// previous layer.
    pub input_errors: Tensor,
    target: Option<Tensor>,
}

impl LayerBuffers {
    pub fn new(inputs: Tensor, output: Dimension) -> Self {
        let input_errors = Tensor::with_padding(inputs.dimension(), inputs.zero_padding());
        Self {
            inputs,
            outputs: Tensor::new(output),
            errors: Tensor::new(output),
            deltas: Tensor::new(output),
            input_errors,
            target: None,
        }
    }

    pub fn target(&self) -> Option<&Tensor> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: &dyn Matrix) -> Result<()> {
        let dim = self.outputs.dimension();
        let stored = self.target.get_or_insert_with(|| Tensor::new(dim));
        copy_reshaped(target, stored)
    }

    /// `errors = outputs - target` when `calculate_errors` is set, then
    /// `deltas = errors * f'(outputs)`.
    pub fn output_deltas(
        &mut self,
        backend: &dyn Backend,
        activation: Activation,
        calculate_errors: bool,
    ) -> Result<()> {
        if calculate_errors {
            let target = self.target.as_ref().ok_or_else(|| {
                MatrixError::Precondition("output layer has no target".into())
            })?;
            backend.dot_subtract(&self.outputs, target, &mut self.errors)?;
        }
        backend.activation_delta(activation, &self.outputs, &self.errors, &mut self.deltas)
    }

    /// Hands `input_errors` to the previous layer's error buffer.
    pub fn project_errors(&self, previous: &mut Tensor) -> Result<()> {
        copy_reshaped(&self.input_errors, previous)
    }
}

/// レイヤー共通の契約
pub trait Layer {
    fn name(&self) -> &'static str;

    fn buffers(&self) -> &LayerBuffers;

    fn buffers_mut(&mut self) -> &mut LayerBuffers;

    fn activation(&self) -> Activation {
        Activation::Identity
    }

    /// Shape of the values accepted by [`Layer::set_input`].
    fn input_dimension(&self) -> Dimension {
        self.buffers().inputs.dimension()
    }

    fn output_dimension(&self) -> Dimension {
        self.buffers().outputs.dimension()
    }

    /// Copies `input` into the layer's input buffer. Any shape with the
    /// same per-sample size and batch is accepted.
    fn set_input(&mut self, input: &dyn Matrix) -> Result<()> {
        copy_reshaped(input, &mut self.buffers_mut().inputs)
    }

    fn set_target(&mut self, target: &dyn Matrix) -> Result<()> {
        self.buffers_mut().set_target(target)
    }

    fn inputs(&self) -> &Tensor {
        &self.buffers().inputs
    }

    fn outputs(&self) -> &Tensor {
        &self.buffers().outputs
    }

    fn errors(&self) -> &Tensor {
        &self.buffers().errors
    }

    fn errors_mut(&mut self) -> &mut Tensor {
        &mut self.buffers_mut().errors
    }

    fn deltas(&self) -> &Tensor {
        &self.buffers().deltas
    }

    /// Reads the inputs and current weights, writes the outputs.
    fn forward(&mut self, backend: &dyn Backend) -> Result<()>;

    /// Turns the output errors into deltas and accumulates the weight
    /// change. With `calculate_errors` the errors are first computed from
    /// the target; otherwise the errors already in place are used.
    fn backpropagate(
        &mut self,
        backend: &dyn Backend,
        learning_rate: f32,
        calculate_errors: bool,
    ) -> Result<()> {
        let activation = self.activation();
        self.buffers_mut()
            .output_deltas(backend, activation, calculate_errors)?;
        self.calculate_new_weights(backend, learning_rate)
    }

    /// Accumulates the weight change derived from the deltas.
    fn calculate_new_weights(&mut self, _backend: &dyn Backend, _learning_rate: f32) -> Result<()> {
        Ok(())
    }

    /// Projects the deltas into `previous`, the previous layer's errors.
    fn calculate_errors(&mut self, backend: &dyn Backend, previous: &mut Tensor) -> Result<()>;

    /// Commits and clears the accumulated weight change.
    fn adapt_weights(&mut self, _backend: &dyn Backend) -> Result<()> {
        Ok(())
    }

    fn randomize_weights(&mut self, _rng: &mut dyn RngCore, _min: f32, _max: f32) {}

    fn weights(&self) -> Vec<&Tensor> {
        Vec::new()
    }
}

/// The closed set of layer kinds a network is built from.
#[derive(Debug, Clone)]
pub enum LayerKind {
    Dense(Dense),
    Convolution(Convolution),
    Pooling(Pooling),
    Fuzzification(Fuzzification),
    Composite(Composite),
    Demux(Demux),
}

macro_rules! dispatch {
    ($self:expr, $layer:ident => $body:expr) => {
        match $self {
            LayerKind::Dense($layer) => $body,
            LayerKind::Convolution($layer) => $body,
            LayerKind::Pooling($layer) => $body,
            LayerKind::Fuzzification($layer) => $body,
            LayerKind::Composite($layer) => $body,
            LayerKind::Demux($layer) => $body,
        }
    };
}

impl Layer for LayerKind {
    fn name(&self) -> &'static str {
        dispatch!(self, l => l.name())
    }

    fn buffers(&self) -> &LayerBuffers {
        dispatch!(self, l => l.buffers())
    }

    fn buffers_mut(&mut self) -> &mut LayerBuffers {
        dispatch!(self, l => l.buffers_mut())
    }

    fn activation(&self) -> Activation {
        dispatch!(self, l => l.activation())
    }

    fn input_dimension(&self) -> Dimension {
        dispatch!(self, l => l.input_dimension())
    }

    fn output_dimension(&self) -> Dimension {
        dispatch!(self, l => l.output_dimension())
    }

    fn set_input(&mut self, input: &dyn Matrix) -> Result<()> {
        dispatch!(self, l => l.set_input(input))
    }

    fn set_target(&mut self, target: &dyn Matrix) -> Result<()> {
        dispatch!(self, l => l.set_target(target))
    }

    fn forward(&mut self, backend: &dyn Backend) -> Result<()> {
        dispatch!(self, l => l.forward(backend))
    }

    fn backpropagate(
        &mut self,
        backend: &dyn Backend,
        learning_rate: f32,
        calculate_errors: bool,
    ) -> Result<()> {
        dispatch!(self, l => l.backpropagate(backend, learning_rate, calculate_errors))
    }

    fn calculate_new_weights(&mut self, backend: &dyn Backend, learning_rate: f32) -> Result<()> {
        dispatch!(self, l => l.calculate_new_weights(backend, learning_rate))
    }

    fn calculate_errors(&mut self, backend: &dyn Backend, previous: &mut Tensor) -> Result<()> {
        dispatch!(self, l => l.calculate_errors(backend, previous))
    }

    fn adapt_weights(&mut self, backend: &dyn Backend) -> Result<()> {
        dispatch!(self, l => l.adapt_weights(backend))
    }

    fn randomize_weights(&mut self, rng: &mut dyn RngCore, min: f32, max: f32) {
        dispatch!(self, l => l.randomize_weights(rng, min, max))
    }

    fn weights(&self) -> Vec<&Tensor> {
        dispatch!(self, l => l.weights())
    }
}

macro_rules! from_layer {
    ($($variant:ident),*) => {$(
        impl From<$variant> for LayerKind {
            fn from(layer: $variant) -> Self {
                LayerKind::$variant(layer)
            }
        }
    )*};
}

from_layer!(Dense, Convolution, Pooling, Fuzzification, Composite, Demux);
