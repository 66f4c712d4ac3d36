use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::engine::layer::{Layer, LayerKind};
use crate::engine::matrix::Matrix;
use crate::engine::optimizer::LearningRateSchedule;
use crate::engine::tensor::Tensor;
use crate::engine::view::ReshapeView;
use crate::error::{MatrixError, Result};

/// 層を順に並べたネットワーク。
///
/// 構築時に隣接する層の形状 (1サンプルのサイズとバッチ数) を検証し、
/// 不一致なら構築そのものが失敗します。
///
/// Training is two-phase: every layer computes its weight change against
/// the current weights first, and only then are all changes committed.
pub struct DeepLayer {
    backend: Arc<dyn Backend>,
    layers: Vec<LayerKind>,
    schedule: Box<dyn LearningRateSchedule>,
}

impl DeepLayer {
    pub fn new(
        backend: Arc<dyn Backend>,
        layers: Vec<LayerKind>,
        schedule: Box<dyn LearningRateSchedule>,
    ) -> Result<Self> {
        if layers.is_empty() {
            return Err(MatrixError::InvalidNetwork("network without layers".into()));
        }
        for (i, pair) in layers.windows(2).enumerate() {
            let (output, input) = (pair[0].output_dimension(), pair[1].input_dimension());
            if !output.is_compatible(&input) {
                return Err(MatrixError::InvalidNetwork(format!(
                    "layer {} ({}) produces {} but layer {} ({}) expects {}",
                    i,
                    pair[0].name(),
                    output,
                    i + 1,
                    pair[1].name(),
                    input
                )));
            }
        }
        info!(
            layers = layers.len(),
            backend = backend.name(),
            "network constructed"
        );
        Ok(Self {
            backend,
            layers,
            schedule,
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn layers(&self) -> &[LayerKind] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [LayerKind] {
        &mut self.layers
    }

    pub fn set_schedule(&mut self, schedule: Box<dyn LearningRateSchedule>) {
        self.schedule = schedule;
    }

    fn last(&self) -> &LayerKind {
        &self.layers[self.layers.len() - 1]
    }

    /// Output of the last forward pass.
    pub fn output(&self) -> &Tensor {
        self.last().outputs()
    }

    pub fn forward(&mut self, input: &dyn Matrix) -> Result<&Tensor> {
        let backend = self.backend.as_ref();
        self.layers[0].set_input(input)?;
        for i in 0..self.layers.len() {
            if i > 0 {
                let (previous, rest) = self.layers.split_at_mut(i);
                rest[0].set_input(previous[i - 1].outputs())?;
            }
            self.layers[i].forward(backend)?;
        }
        Ok(self.output())
    }

    /// Forward pass and the full backward chain, without committing the
    /// weight changes. Repeated calls accumulate.
    pub fn accumulate(&mut self, iteration: usize, input: &dyn Matrix, target: &dyn Matrix) -> Result<()> {
        let last = self.layers.len() - 1;
        self.layers[last].set_target(target)?;
        self.forward(input)?;

        let rate = self.schedule.rate(iteration);
        debug!(iteration, learning_rate = rate, "training step");

        let backend = self.backend.as_ref();
        self.layers[last].backpropagate(backend, rate, true)?;
        for i in (1..=last).rev() {
            let (previous, rest) = self.layers.split_at_mut(i);
            let upstream = &mut previous[i - 1];
            rest[0].calculate_errors(backend, upstream.errors_mut())?;
            upstream.backpropagate(backend, rate, false)?;
        }
        Ok(())
    }

    /// Commits the accumulated weight changes of every layer.
    pub fn commit(&mut self) -> Result<()> {
        let backend = self.backend.as_ref();
        for layer in &mut self.layers {
            layer.adapt_weights(backend)?;
        }
        Ok(())
    }

    /// One training step: [`DeepLayer::accumulate`] then [`DeepLayer::commit`].
    pub fn train(&mut self, iteration: usize, input: &dyn Matrix, target: &dyn Matrix) -> Result<()> {
        self.accumulate(iteration, input, target)?;
        self.commit()
    }

    /// Mean squared error of the last forward output against `target`.
    pub fn error(&self, target: &dyn Matrix) -> Result<f32> {
        let output = self.output();
        let target = ReshapeView::like(target, output.dimension())?;
        let mut sum = 0.0;
        output.iterate_cells(&mut |r, c, s, h, v| {
            let d = v - target.at(r, c, s, h);
            sum += d * d;
        });
        Ok(sum / output.len() as f32)
    }

    pub fn randomize_weights(&mut self, rng: &mut dyn RngCore, min: f32, max: f32) {
        for layer in &mut self.layers {
            layer.randomize_weights(rng, min, max);
        }
    }
}

impl fmt::Debug for DeepLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeepLayer")
            .field("backend", &self.backend.name())
            .field(
                "layers",
                &self.layers.iter().map(|l| l.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
