use std::fmt::Debug;

use crate::engine::activation::Activation;
use crate::engine::dimension::Dimension;
use crate::engine::matrix::Matrix;
use crate::engine::tensor::Tensor;
use crate::error::{MatrixError, Result};

pub mod accelerated;
pub mod device;
pub mod emulated;
pub mod host;
pub mod mirror;

pub use accelerated::DeviceBackend;
pub use emulated::EmulatedDevice;
pub use host::Host;

/// Parameters of one Adam update, `factor` already carrying the learning
/// rate and bias correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamStep {
    pub beta1: f32,
    pub beta2: f32,
    pub factor: f32,
    pub epsilon: f32,
}

/// 演算ライブラリ。
///
/// ホスト実装とアクセラレータ実装は同じ結果 (浮動小数点の丸め誤差を除く) を
/// 返さなければならない。どちらを使うかは構築時に注入されたバックエンドで決まる。
///
/// Binary element-wise operations validate shapes and fail with
/// [`MatrixError::DimensionMismatch`] instead of truncating.
pub trait Backend: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// out = a + b
    fn dot_add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;

    /// out = a - b
    fn dot_subtract(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;

    /// out = a * b (element-wise)
    fn dot_multiply(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;

    /// out = factor1 * a + factor2 * b
    fn linear_combination(
        &self,
        factor1: f32,
        a: &Tensor,
        factor2: f32,
        b: &Tensor,
        out: &mut Tensor,
    ) -> Result<()>;

    /// target = target + factor * source
    fn add_scaled(&self, factor: f32, source: &Tensor, target: &mut Tensor) -> Result<()>;

    /// c = alpha * a · b + beta * c over the (rows × columns) planes.
    ///
    /// Transposed views are honored through their flag, not materialized.
    /// An operand with a single plane is broadcast; a single-plane `c`
    /// accumulates the sum over all planes.
    fn sgemm(&self, alpha: f32, a: &dyn Matrix, b: &dyn Matrix, beta: f32, c: &mut Tensor)
        -> Result<()>;

    /// t = f(t)
    fn activate(&self, activation: Activation, t: &mut Tensor) -> Result<()>;

    /// deltas = errors * f'(outputs)
    fn activation_delta(
        &self,
        activation: Activation,
        outputs: &Tensor,
        errors: &Tensor,
        deltas: &mut Tensor,
    ) -> Result<()>;

    /// Strided correlation of the zero-padded `input` against the filters.
    fn correlate(&self, input: &Tensor, filters: &Tensor, stride: usize, out: &mut Tensor)
        -> Result<()>;

    /// Projects `deltas` back onto the input grid; `errors` carries the
    /// forward input's zero padding.
    fn backprop_correlate(
        &self,
        deltas: &Tensor,
        filters: &Tensor,
        stride: usize,
        errors: &mut Tensor,
    ) -> Result<()>;

    /// gradients += factor * correlation of the padded input against deltas,
    /// summed over the batch.
    fn correlate_weights(
        &self,
        input: &Tensor,
        deltas: &Tensor,
        stride: usize,
        factor: f32,
        gradients: &mut Tensor,
    ) -> Result<()>;

    /// Non-overlapping `pool × pool` max; `mask` records the in-slice index
    /// `r + c*rows` of each winner (first one in row-major window order).
    fn max_pool(&self, input: &Tensor, pool: usize, out: &mut Tensor, mask: &mut Tensor)
        -> Result<()>;

    /// errors = 0 except at the recorded winners, which receive the deltas.
    fn backprop_max_pool(&self, deltas: &Tensor, mask: &Tensor, errors: &mut Tensor)
        -> Result<()>;

    fn adam(
        &self,
        weights: &mut Tensor,
        gradients: &Tensor,
        m: &mut Tensor,
        v: &mut Tensor,
        step: AdamStep,
    ) -> Result<()>;
}

pub(crate) fn check_same(operation: &'static str, expected: Dimension, others: &[Dimension]) -> Result<()> {
    for &dim in others {
        if dim != expected {
            return Err(MatrixError::mismatch(operation, expected, dim));
        }
    }
    Ok(())
}

/// Plane layout of an sgemm call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SgemmShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub depth: usize,
    pub a_depth: usize,
    pub b_depth: usize,
    pub c_depth: usize,
}

impl SgemmShape {
    pub fn plane(depth: usize, z: usize) -> usize {
        if depth == 1 {
            0
        } else {
            z
        }
    }
}

pub(crate) fn sgemm_shape(a: Dimension, b: Dimension, c: Dimension) -> Result<SgemmShape> {
    if a.columns() != b.rows() || c.rows() != a.rows() || c.columns() != b.columns() {
        return Err(MatrixError::mismatch(
            "sgemm",
            format!("{} · {} -> {}x{}", a, b, a.rows(), b.columns()),
            c,
        ));
    }
    let depth = a.depth().max(b.depth()).max(c.depth());
    for d in [a.depth(), b.depth(), c.depth()] {
        if d != 1 && d != depth {
            return Err(MatrixError::mismatch(
                "sgemm planes",
                depth,
                format!("{} / {} / {}", a.depth(), b.depth(), c.depth()),
            ));
        }
    }
    Ok(SgemmShape {
        m: a.rows(),
        n: b.columns(),
        k: a.columns(),
        depth,
        a_depth: a.depth(),
        b_depth: b.depth(),
        c_depth: c.depth(),
    })
}

/// Output grid of a strided correlation.
pub fn correlation_output(input: Dimension, padding: usize, filter: usize, stride: usize) -> Result<(usize, usize)> {
    let rows = input.rows() + 2 * padding;
    let columns = input.columns() + 2 * padding;
    if stride == 0 || filter == 0 || filter > rows || filter > columns {
        return Err(MatrixError::Precondition(format!(
            "filter {} with stride {} does not fit {} padded by {}",
            filter, stride, input, padding
        )));
    }
    Ok(((rows - filter) / stride + 1, (columns - filter) / stride + 1))
}

/// Validates a correlation and returns (input slices, features).
pub(crate) fn check_correlate(
    operation: &'static str,
    input: Dimension,
    padding: usize,
    filters: Dimension,
    stride: usize,
    out: Dimension,
) -> Result<(usize, usize)> {
    let in_slices = input.slices();
    let features = out.slices();
    if filters.rows() != filters.columns() || filters.slices() != features * in_slices {
        return Err(MatrixError::mismatch(
            operation,
            format!("filters {}x{}x{}", filters.rows(), filters.rows(), features * in_slices),
            filters,
        ));
    }
    let (rows, columns) = correlation_output(input, padding, filters.rows(), stride)?;
    let expected = Dimension::new(rows, columns, features, input.hyper_slices());
    if out != expected {
        return Err(MatrixError::mismatch(operation, expected, out));
    }
    Ok((in_slices, features))
}

pub(crate) fn check_pool(input: Dimension, pool: usize, out: Dimension, mask: Dimension) -> Result<()> {
    if pool == 0 || pool > input.rows() || pool > input.columns() {
        return Err(MatrixError::Precondition(format!(
            "pool size {} does not fit {}",
            pool, input
        )));
    }
    let expected = Dimension::new(
        input.rows() / pool,
        input.columns() / pool,
        input.slices(),
        input.hyper_slices(),
    );
    check_same("max_pool", expected, &[out, mask])
}
