use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2, ShapeBuilder};

use crate::backend::{
    check_correlate, check_pool, check_same, sgemm_shape, AdamStep, Backend, SgemmShape,
};
use crate::engine::activation::Activation;
use crate::engine::dimension::Dimension;
use crate::engine::matrix::{Matrix, MatrixMut};
use crate::engine::tensor::Tensor;
use crate::error::{MatrixError, Result};

/// ホストCPU上で同期的に実行するバックエンド。行列積は ndarray を使う。
#[derive(Debug, Clone, Default)]
pub struct Host;

impl Host {
    pub fn new() -> Self {
        Host
    }

    fn zip(
        operation: &'static str,
        a: &Tensor,
        b: &Tensor,
        out: &mut Tensor,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<()> {
        check_same(operation, a.dimension(), &[b.dimension(), out.dimension()])?;
        let (av, bv) = (a.values(), b.values());
        for ((o, &x), &y) in out.values_mut().iter_mut().zip(av.iter()).zip(bv.iter()) {
            *o = f(x, y);
        }
        Ok(())
    }
}

fn shape_error(e: ndarray::ShapeError) -> MatrixError {
    MatrixError::Precondition(e.to_string())
}

// 列優先のストレージを ndarray のビューとして解釈する
fn plane_view<'a>(values: &'a [f32], rows: usize, columns: usize) -> Result<ArrayView2<'a, f32>> {
    ArrayView2::from_shape((rows, columns).f(), values).map_err(shape_error)
}

/// Storage-backed operand: either the tensor behind a (possibly transposed)
/// view, or a materialized copy for views that do not map onto storage.
enum Operand<'a> {
    Borrowed(&'a Tensor, bool),
    Owned(Tensor),
}

impl<'a> Operand<'a> {
    fn of(m: &'a dyn Matrix) -> Self {
        match m.storage() {
            Some((tensor, transposed)) => Operand::Borrowed(tensor, transposed),
            None => Operand::Owned(m.copy()),
        }
    }

    fn tensor(&self) -> (&Tensor, bool) {
        match self {
            Operand::Borrowed(t, transposed) => (t, *transposed),
            Operand::Owned(t) => (t, false),
        }
    }
}

impl Backend for Host {
    fn name(&self) -> &'static str {
        "host"
    }

    fn dot_add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        Self::zip("dot_add", a, b, out, |x, y| x + y)
    }

    fn dot_subtract(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        Self::zip("dot_subtract", a, b, out, |x, y| x - y)
    }

    fn dot_multiply(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        Self::zip("dot_multiply", a, b, out, |x, y| x * y)
    }

    fn linear_combination(
        &self,
        factor1: f32,
        a: &Tensor,
        factor2: f32,
        b: &Tensor,
        out: &mut Tensor,
    ) -> Result<()> {
        Self::zip("linear_combination", a, b, out, |x, y| factor1 * x + factor2 * y)
    }

    fn add_scaled(&self, factor: f32, source: &Tensor, target: &mut Tensor) -> Result<()> {
        check_same("add_scaled", target.dimension(), &[source.dimension()])?;
        let src = source.values();
        for (t, &s) in target.values_mut().iter_mut().zip(src.iter()) {
            *t += factor * s;
        }
        Ok(())
    }

    fn sgemm(
        &self,
        alpha: f32,
        a: &dyn Matrix,
        b: &dyn Matrix,
        beta: f32,
        c: &mut Tensor,
    ) -> Result<()> {
        let shape = sgemm_shape(a.dimension(), b.dimension(), c.dimension())?;
        let (a_op, b_op) = (Operand::of(a), Operand::of(b));
        let (a_tensor, a_t) = a_op.tensor();
        let (b_tensor, b_t) = b_op.tensor();
        let (av, bv) = (a_tensor.values(), b_tensor.values());
        let (a_plane, b_plane) = (a_tensor.dimension().slice_size(), b_tensor.dimension().slice_size());
        let c_plane = shape.m * shape.n;
        let cv = c.values_mut();

        for z in 0..shape.depth {
            let za = SgemmShape::plane(shape.a_depth, z);
            let zb = SgemmShape::plane(shape.b_depth, z);
            let zc = SgemmShape::plane(shape.c_depth, z);
            let a_slice = &av[za * a_plane..(za + 1) * a_plane];
            let b_slice = &bv[zb * b_plane..(zb + 1) * b_plane];
            let a_view = if a_t {
                plane_view(a_slice, shape.k, shape.m)?.reversed_axes()
            } else {
                plane_view(a_slice, shape.m, shape.k)?
            };
            let b_view = if b_t {
                plane_view(b_slice, shape.n, shape.k)?.reversed_axes()
            } else {
                plane_view(b_slice, shape.k, shape.n)?
            };
            // 出力が1平面の場合は2平面目以降を足し込む
            let plane_beta = if shape.c_depth == 1 && z > 0 { 1.0 } else { beta };
            let mut c_view = ArrayViewMut2::from_shape(
                (shape.m, shape.n).f(),
                &mut cv[zc * c_plane..(zc + 1) * c_plane],
            )
            .map_err(shape_error)?;
            general_mat_mul(alpha, &a_view, &b_view, plane_beta, &mut c_view);
        }
        Ok(())
    }

    fn activate(&self, activation: Activation, t: &mut Tensor) -> Result<()> {
        if activation.is_row_normalized() {
            t.soft_max_per_row();
        } else {
            t.apply_function(&|x| activation.apply(x));
        }
        Ok(())
    }

    fn activation_delta(
        &self,
        activation: Activation,
        outputs: &Tensor,
        errors: &Tensor,
        deltas: &mut Tensor,
    ) -> Result<()> {
        Self::zip("activation_delta", outputs, errors, deltas, |o, e| {
            e * activation.derivative(o)
        })
    }

    fn correlate(
        &self,
        input: &Tensor,
        filters: &Tensor,
        stride: usize,
        out: &mut Tensor,
    ) -> Result<()> {
        let (in_dim, f_dim, out_dim) = (input.dimension(), filters.dimension(), out.dimension());
        let pad = input.zero_padding();
        let (in_slices, features) = check_correlate("correlate", in_dim, pad, f_dim, stride, out_dim)?;
        let fs = f_dim.rows();
        let (iv, fv) = (input.values(), filters.values());
        let padded = |pr: usize, pc: usize, s: usize, h: usize| -> f32 {
            match (pr.checked_sub(pad), pc.checked_sub(pad)) {
                (Some(r), Some(c)) if r < in_dim.rows() && c < in_dim.columns() => {
                    iv[in_dim.index(r, c, s, h)]
                }
                _ => 0.0,
            }
        };
        let ov = out.values_mut();
        for h in 0..out_dim.hyper_slices() {
            for f in 0..features {
                for oc in 0..out_dim.columns() {
                    for or in 0..out_dim.rows() {
                        let mut acc = 0.0;
                        for s in 0..in_slices {
                            let fz = f * in_slices + s;
                            for kc in 0..fs {
                                for kr in 0..fs {
                                    acc += padded(or * stride + kr, oc * stride + kc, s, h)
                                        * fv[f_dim.index(kr, kc, fz, 0)];
                                }
                            }
                        }
                        ov[out_dim.index(or, oc, f, h)] = acc;
                    }
                }
            }
        }
        Ok(())
    }

    fn backprop_correlate(
        &self,
        deltas: &Tensor,
        filters: &Tensor,
        stride: usize,
        errors: &mut Tensor,
    ) -> Result<()> {
        let (d_dim, f_dim, e_dim) = (deltas.dimension(), filters.dimension(), errors.dimension());
        let pad = errors.zero_padding();
        let (in_slices, features) =
            check_correlate("backprop_correlate", e_dim, pad, f_dim, stride, d_dim)?;
        let fs = f_dim.rows();
        let (dv, fv) = (deltas.values(), filters.values());
        let ev = errors.values_mut();
        for h in 0..e_dim.hyper_slices() {
            for s in 0..in_slices {
                for ic in 0..e_dim.columns() {
                    for ir in 0..e_dim.rows() {
                        let mut acc = 0.0;
                        for kc in 0..fs {
                            let Some(oc) = window_origin(ic + pad, kc, stride, d_dim.columns()) else {
                                continue;
                            };
                            for kr in 0..fs {
                                let Some(or) = window_origin(ir + pad, kr, stride, d_dim.rows()) else {
                                    continue;
                                };
                                for f in 0..features {
                                    acc += dv[d_dim.index(or, oc, f, h)]
                                        * fv[f_dim.index(kr, kc, f * in_slices + s, 0)];
                                }
                            }
                        }
                        ev[e_dim.index(ir, ic, s, h)] = acc;
                    }
                }
            }
        }
        Ok(())
    }

    fn correlate_weights(
        &self,
        input: &Tensor,
        deltas: &Tensor,
        stride: usize,
        factor: f32,
        gradients: &mut Tensor,
    ) -> Result<()> {
        let (in_dim, d_dim, g_dim) = (input.dimension(), deltas.dimension(), gradients.dimension());
        let pad = input.zero_padding();
        let (in_slices, features) =
            check_correlate("correlate_weights", in_dim, pad, g_dim, stride, d_dim)?;
        let fs = g_dim.rows();
        let (iv, dv) = (input.values(), deltas.values());
        let padded = |pr: usize, pc: usize, s: usize, h: usize| -> f32 {
            match (pr.checked_sub(pad), pc.checked_sub(pad)) {
                (Some(r), Some(c)) if r < in_dim.rows() && c < in_dim.columns() => {
                    iv[in_dim.index(r, c, s, h)]
                }
                _ => 0.0,
            }
        };
        let gv = gradients.values_mut();
        for f in 0..features {
            for s in 0..in_slices {
                for kc in 0..fs {
                    for kr in 0..fs {
                        let mut acc = 0.0;
                        for h in 0..d_dim.hyper_slices() {
                            for oc in 0..d_dim.columns() {
                                for or in 0..d_dim.rows() {
                                    acc += padded(or * stride + kr, oc * stride + kc, s, h)
                                        * dv[d_dim.index(or, oc, f, h)];
                                }
                            }
                        }
                        gv[g_dim.index(kr, kc, f * in_slices + s, 0)] += factor * acc;
                    }
                }
            }
        }
        Ok(())
    }

    fn max_pool(
        &self,
        input: &Tensor,
        pool: usize,
        out: &mut Tensor,
        mask: &mut Tensor,
    ) -> Result<()> {
        let (in_dim, out_dim) = (input.dimension(), out.dimension());
        check_pool(in_dim, pool, out_dim, mask.dimension())?;
        let iv = input.values();
        let ov = out.values_mut();
        let mv = mask.values_mut();
        for h in 0..out_dim.hyper_slices() {
            for s in 0..out_dim.slices() {
                for oc in 0..out_dim.columns() {
                    for or in 0..out_dim.rows() {
                        let (mut best_r, mut best_c) = (or * pool, oc * pool);
                        let mut best = iv[in_dim.index(best_r, best_c, s, h)];
                        for kr in 0..pool {
                            for kc in 0..pool {
                                let (r, c) = (or * pool + kr, oc * pool + kc);
                                let v = iv[in_dim.index(r, c, s, h)];
                                if v > best {
                                    best = v;
                                    best_r = r;
                                    best_c = c;
                                }
                            }
                        }
                        let o = out_dim.index(or, oc, s, h);
                        ov[o] = best;
                        mv[o] = (best_r + best_c * in_dim.rows()) as f32;
                    }
                }
            }
        }
        Ok(())
    }

    fn backprop_max_pool(&self, deltas: &Tensor, mask: &Tensor, errors: &mut Tensor) -> Result<()> {
        let d_dim = deltas.dimension();
        let e_dim = errors.dimension();
        check_same("backprop_max_pool", d_dim, &[mask.dimension()])?;
        if d_dim.depth() != e_dim.depth() {
            return Err(MatrixError::mismatch("backprop_max_pool", d_dim, e_dim));
        }
        let (dv, mv) = (deltas.values(), mask.values());
        let ev = errors.values_mut();
        ev.fill(0.0);
        for h in 0..d_dim.hyper_slices() {
            for s in 0..d_dim.slices() {
                for oc in 0..d_dim.columns() {
                    for or in 0..d_dim.rows() {
                        let o = d_dim.index(or, oc, s, h);
                        let i = mv[o] as usize;
                        let (r, c) = (i % e_dim.rows(), i / e_dim.rows());
                        ev[e_dim.index(r, c, s, h)] += dv[o];
                    }
                }
            }
        }
        Ok(())
    }

    fn adam(
        &self,
        weights: &mut Tensor,
        gradients: &Tensor,
        m: &mut Tensor,
        v: &mut Tensor,
        step: AdamStep,
    ) -> Result<()> {
        let dim = weights.dimension();
        check_same("adam", dim, &[gradients.dimension(), m.dimension(), v.dimension()])?;
        let gv = gradients.values();
        let (mv, vv) = (m.values_mut(), v.values_mut());
        for ((w, &g), (m, v)) in weights
            .values_mut()
            .iter_mut()
            .zip(gv.iter())
            .zip(mv.iter_mut().zip(vv.iter_mut()))
        {
            *m = step.beta1 * *m + (1.0 - step.beta1) * g;
            *v = step.beta2 * *v + (1.0 - step.beta2) * g * g;
            *w += step.factor * *m / (v.sqrt() + step.epsilon);
        }
        Ok(())
    }
}

/// Output coordinate whose window places tap `k` on padded position `p`,
/// if any.
pub(crate) fn window_origin(p: usize, k: usize, stride: usize, extent: usize) -> Option<usize> {
    let t = p.checked_sub(k)?;
    if t % stride != 0 {
        return None;
    }
    let o = t / stride;
    (o < extent).then_some(o)
}

/// Dimension of the pooled output for an input.
pub fn pooled_dimension(input: Dimension, pool: usize) -> Dimension {
    Dimension::new(
        input.rows() / pool,
        input.columns() / pool,
        input.slices(),
        input.hyper_slices(),
    )
}
