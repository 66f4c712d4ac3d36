use rand::RngCore;

use crate::backend::Backend;
use crate::engine::activation::sigmoid;
use crate::engine::dimension::Dimension;
use crate::engine::layer::{Layer, LayerBuffers};
use crate::engine::matrix::{Matrix, MatrixMut};
use crate::engine::optimizer::{Adam, AdamConfig, AdamState};
use crate::engine::tensor::Tensor;
use crate::error::{MatrixError, Result};

/// ファジィ化レイヤー。
///
/// 入力 `x_i` ごとに `classes - 1` 個のシグモイド `s_ij = sigmoid(a_ij * (x_i - b_ij))`
/// を計算し、累積差分 (shift-minus) で `classes` 個のメンバーシップ値に展開します:
/// `o_i0 = 1 - s_i0`, `o_ij = s_i(j-1) - s_ij`, 最後は `o_i(k-1) = s_i(k-2)`。
/// 各入力の出力の和は常に 1 です。
///
/// Output `j` of input `i` sits at column `i * classes + j`. The parameters
/// `a` and `b` are `(classes - 1) × inputs` matrices updated with Adam.
#[derive(Debug, Clone)]
pub struct Fuzzification {
    buffers: LayerBuffers,
    n_inputs: usize,
    classes: usize,
    a: Tensor,
    b: Tensor,
    sigmoids: Tensor,
    gradient_a: Tensor,
    gradient_b: Tensor,
    adam: Adam,
    state_a: AdamState,
    state_b: AdamState,
    learning_rate: f32,
}

impl Fuzzification {
    pub fn new(inputs: usize, classes: usize, batch: usize, adam: AdamConfig) -> Result<Self> {
        if classes < 2 {
            return Err(MatrixError::Precondition(format!(
                "fuzzification needs at least 2 classes, got {}",
                classes
            )));
        }
        let parameters = Dimension::matrix(classes - 1, inputs);
        Ok(Self {
            buffers: LayerBuffers::new(
                Tensor::new(Dimension::row_vectors(inputs, batch)),
                Dimension::row_vectors(inputs * classes, batch),
            ),
            n_inputs: inputs,
            classes,
            a: Tensor::filled(parameters, 1.0),
            b: Tensor::new(parameters),
            sigmoids: Tensor::new(Dimension::row_vectors(inputs * (classes - 1), batch)),
            gradient_a: Tensor::new(parameters),
            gradient_b: Tensor::new(parameters),
            adam: Adam::new(adam),
            state_a: AdamState::new(parameters),
            state_b: AdamState::new(parameters),
            learning_rate: 0.0,
        })
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    /// Slopes `a` and centers `b`.
    pub fn parameters(&self) -> (&Tensor, &Tensor) {
        (&self.a, &self.b)
    }

    pub fn set_parameters(&mut self, a: &dyn Matrix, b: &dyn Matrix) -> Result<()> {
        self.a.copy_from(a)?;
        self.b.copy_from(b)
    }

    pub fn gradients(&self) -> (&Tensor, &Tensor) {
        (&self.gradient_a, &self.gradient_b)
    }

    /// Visits `(h, i, j, parameter index, dL/dz_ij)` for every sigmoid, with
    /// the shift-minus transform reversed and the sigmoid derivative applied.
    fn for_each_slope_error(&self, mut f: impl FnMut(usize, usize, usize, f32)) {
        let (n, k) = (self.n_inputs, self.classes);
        let deltas = self.buffers.deltas.values();
        let s = self.sigmoids.values();
        for h in 0..self.buffers.inputs.hyper_slices() {
            for i in 0..n {
                for j in 0..k - 1 {
                    let o = h * n * k + i * k + j;
                    // s_ij は o_ij に -1、o_i(j+1) に +1 で現れる
                    let ds = deltas[o + 1] - deltas[o];
                    let sj = s[h * n * (k - 1) + i * (k - 1) + j];
                    f(h, i, j + i * (k - 1), ds * sj * (1.0 - sj));
                }
            }
        }
    }
}

impl Layer for Fuzzification {
    fn name(&self) -> &'static str {
        "fuzzification"
    }

    fn buffers(&self) -> &LayerBuffers {
        &self.buffers
    }

    fn buffers_mut(&mut self) -> &mut LayerBuffers {
        &mut self.buffers
    }

    fn forward(&mut self, _backend: &dyn Backend) -> Result<()> {
        let (n, k) = (self.n_inputs, self.classes);
        let x = self.buffers.inputs.values();
        let (a, b) = (self.a.values(), self.b.values());
        let s = self.sigmoids.values_mut();
        let o = self.buffers.outputs.values_mut();
        for h in 0..self.buffers.inputs.hyper_slices() {
            for i in 0..n {
                let xi = x[h * n + i];
                let mut previous = 1.0;
                for j in 0..k - 1 {
                    let w = j + i * (k - 1);
                    let sj = sigmoid(a[w] * (xi - b[w]));
                    s[h * n * (k - 1) + w] = sj;
                    o[h * n * k + i * k + j] = previous - sj;
                    previous = sj;
                }
                o[h * n * k + i * k + k - 1] = previous;
            }
        }
        Ok(())
    }

    fn calculate_new_weights(&mut self, _backend: &dyn Backend, learning_rate: f32) -> Result<()> {
        let n = self.n_inputs;
        let mut ga = self.gradient_a.to_vec();
        let mut gb = self.gradient_b.to_vec();
        {
            let x = self.buffers.inputs.values();
            let (a, b) = (self.a.values(), self.b.values());
            self.for_each_slope_error(|h, i, w, dz| {
                ga[w] += dz * (x[h * n + i] - b[w]);
                gb[w] -= dz * a[w];
            });
        }
        self.gradient_a.values_mut().copy_from_slice(&ga);
        self.gradient_b.values_mut().copy_from_slice(&gb);
        self.learning_rate = learning_rate;
        Ok(())
    }

    fn calculate_errors(&mut self, _backend: &dyn Backend, previous: &mut Tensor) -> Result<()> {
        let n = self.n_inputs;
        let mut errors = vec![0.0; self.buffers.input_errors.len()];
        {
            let a = self.a.values();
            self.for_each_slope_error(|h, i, w, dz| {
                errors[h * n + i] += dz * a[w];
            });
        }
        self.buffers.input_errors.values_mut().copy_from_slice(&errors);
        self.buffers.project_errors(previous)
    }

    fn adapt_weights(&mut self, backend: &dyn Backend) -> Result<()> {
        let step = self.adam.step(self.learning_rate);
        self.state_a
            .apply(backend, &mut self.a, &self.gradient_a, step)?;
        self.state_b
            .apply(backend, &mut self.b, &self.gradient_b, step)?;
        self.adam.advance();
        self.gradient_a.fill(0.0);
        self.gradient_b.fill(0.0);
        Ok(())
    }

    fn randomize_weights(&mut self, rng: &mut dyn RngCore, min: f32, max: f32) {
        self.a.randomize(rng, min, max);
        self.b.randomize(rng, min, max);
    }

    fn weights(&self) -> Vec<&Tensor> {
        vec![&self.a, &self.b]
    }
}
