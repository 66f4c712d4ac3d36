use serde::{Deserialize, Serialize};

use crate::backend::{AdamStep, Backend};
use crate::engine::dimension::Dimension;
use crate::engine::tensor::Tensor;
use crate::error::Result;

/// Adam のハイパーパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Adam optimizer with running bias corrections.
///
/// `beta1_corr` / `beta2_corr` start at `beta1` / `beta2` and are multiplied
/// by them after every step; they are never derived from a step counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Adam {
    config: AdamConfig,
    beta1_corr: f32,
    beta2_corr: f32,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            beta1_corr: config.beta1,
            beta2_corr: config.beta2,
        }
    }

    pub fn config(&self) -> AdamConfig {
        self.config
    }

    pub fn corrections(&self) -> (f32, f32) {
        (self.beta1_corr, self.beta2_corr)
    }

    /// Parameters of the next update for `learning_rate`, with the bias
    /// correction folded into the factor.
    pub fn step(&self, learning_rate: f32) -> AdamStep {
        AdamStep {
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            factor: -learning_rate * (1.0 - self.beta2_corr).sqrt() / (1.0 - self.beta1_corr),
            epsilon: self.config.epsilon,
        }
    }

    /// 1ステップ分だけ補正係数を進める
    pub fn advance(&mut self) {
        self.beta1_corr *= self.config.beta1;
        self.beta2_corr *= self.config.beta2;
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(AdamConfig::default())
    }
}

/// First and second moments of one weight tensor.
#[derive(Debug, Clone)]
pub struct AdamState {
    m: Tensor,
    v: Tensor,
}

impl AdamState {
    pub fn new(dim: Dimension) -> Self {
        Self {
            m: Tensor::new(dim),
            v: Tensor::new(dim),
        }
    }

    pub fn moments(&self) -> (&Tensor, &Tensor) {
        (&self.m, &self.v)
    }

    pub fn apply(
        &mut self,
        backend: &dyn Backend,
        weights: &mut Tensor,
        gradients: &Tensor,
        step: AdamStep,
    ) -> Result<()> {
        backend.adam(weights, gradients, &mut self.m, &mut self.v, step)
    }
}

/// 学習率のスケジュール。反復回数から学習率を返す。
pub trait LearningRateSchedule {
    fn rate(&self, iteration: usize) -> f32;
}

impl<F: Fn(usize) -> f32> LearningRateSchedule for F {
    fn rate(&self, iteration: usize) -> f32 {
        self(iteration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constant(pub f32);

impl LearningRateSchedule for Constant {
    fn rate(&self, _iteration: usize) -> f32 {
        self.0
    }
}

/// `initial * factor^(iteration / every)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepDecay {
    pub initial: f32,
    pub factor: f32,
    pub every: usize,
}

impl LearningRateSchedule for StepDecay {
    fn rate(&self, iteration: usize) -> f32 {
        let steps = iteration / self.every.max(1);
        self.initial * self.factor.powi(steps as i32)
    }
}

/// `initial * exp(-decay * iteration)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    pub initial: f32,
    pub decay: f32,
}

impl LearningRateSchedule for ExponentialDecay {
    fn rate(&self, iteration: usize) -> f32 {
        self.initial * (-self.decay * iteration as f32).exp()
    }
}
