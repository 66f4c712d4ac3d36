use std::sync::Arc;

use tracing::trace;

use crate::backend::device::{BufferRole, Device, Kernel, KernelArg, KernelCall};
use crate::backend::{check_correlate, check_pool, check_same, sgemm_shape, AdamStep, Backend};
use crate::engine::activation::Activation;
use crate::engine::matrix::Matrix;
use crate::engine::tensor::Tensor;
use crate::error::Result;

/// デバイスにカーネルを投げるバックエンド。
///
/// Inputs are bound through their device mirror (uploaded only when the host
/// copy is newer); outputs end up device-authoritative and are pulled back
/// lazily on the next host read.
#[derive(Debug, Clone)]
pub struct DeviceBackend {
    device: Arc<dyn Device>,
}

impl DeviceBackend {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    fn input(&self, t: &Tensor) -> Result<KernelArg> {
        t.device_input(&self.device)
    }

    fn output(&self, t: &Tensor, accumulate: bool) -> Result<KernelArg> {
        t.device_output(&self.device, accumulate)
    }

    fn dispatch(&self, kernel: Kernel, inputs: Vec<KernelArg>, outputs: Vec<KernelArg>) -> Result<()> {
        let global_size = outputs
            .first()
            .map(|arg| arg.layout.global_size())
            .unwrap_or([self.device.block_size(), self.device.block_size(), 1]);
        trace!(device = self.device.name(), ?kernel, "dispatch");
        self.device.dispatch(&KernelCall {
            kernel,
            inputs,
            outputs,
            global_size,
        })
    }

    fn binary(&self, kernel: Kernel, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let inputs = vec![self.input(a)?, self.input(b)?];
        let output = self.output(out, false)?;
        self.dispatch(kernel, inputs, vec![output])?;
        out.mark_device_as_master(BufferRole::ReadWrite);
        Ok(())
    }
}

impl Backend for DeviceBackend {
    fn name(&self) -> &'static str {
        "device"
    }

    fn dot_add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        check_same("dot_add", a.dimension(), &[b.dimension(), out.dimension()])?;
        self.binary(Kernel::DotAdd, a, b, out)
    }

    fn dot_subtract(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        check_same("dot_subtract", a.dimension(), &[b.dimension(), out.dimension()])?;
        self.binary(Kernel::DotSubtract, a, b, out)
    }

    fn dot_multiply(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        check_same("dot_multiply", a.dimension(), &[b.dimension(), out.dimension()])?;
        self.binary(Kernel::DotMultiply, a, b, out)
    }

    fn linear_combination(
        &self,
        factor1: f32,
        a: &Tensor,
        factor2: f32,
        b: &Tensor,
        out: &mut Tensor,
    ) -> Result<()> {
        check_same("linear_combination", a.dimension(), &[b.dimension(), out.dimension()])?;
        self.binary(Kernel::LinearCombination { factor1, factor2 }, a, b, out)
    }

    fn add_scaled(&self, factor: f32, source: &Tensor, target: &mut Tensor) -> Result<()> {
        check_same("add_scaled", target.dimension(), &[source.dimension()])?;
        // target は出力であり入力でもある: 先に読み書きバッファへ載せる
        let output = self.output(target, true)?;
        let inputs = vec![self.input(target)?, self.input(source)?];
        self.dispatch(
            Kernel::LinearCombination {
                factor1: 1.0,
                factor2: factor,
            },
            inputs,
            vec![output],
        )?;
        target.mark_device_as_master(BufferRole::ReadWrite);
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
        sgemm_shape(a.dimension(), b.dimension(), c.dimension())?;
        // ストレージに直接対応しないビューは一時テンソルに実体化する
        let a_copy;
        let (a_tensor, transpose_a) = match a.storage() {
            Some(bound) => bound,
            None => {
                a_copy = a.copy();
                (&a_copy, false)
            }
        };
        let b_copy;
        let (b_tensor, transpose_b) = match b.storage() {
            Some(bound) => bound,
            None => {
                b_copy = b.copy();
                (&b_copy, false)
            }
        };
        let inputs = vec![self.input(a_tensor)?, self.input(b_tensor)?];
        let output = self.output(c, beta != 0.0)?;
        self.dispatch(
            Kernel::Sgemm {
                alpha,
                beta,
                transpose_a,
                transpose_b,
            },
            inputs,
            vec![output],
        )?;
        c.mark_device_as_master(BufferRole::ReadWrite);
        Ok(())
    }

    fn activate(&self, activation: Activation, t: &mut Tensor) -> Result<()> {
        let output = self.output(t, true)?;
        self.dispatch(Kernel::Activate(activation), Vec::new(), vec![output])?;
        t.mark_device_as_master(BufferRole::ReadWrite);
        Ok(())
    }

    fn activation_delta(
        &self,
        activation: Activation,
        outputs: &Tensor,
        errors: &Tensor,
        deltas: &mut Tensor,
    ) -> Result<()> {
        check_same(
            "activation_delta",
            outputs.dimension(),
            &[errors.dimension(), deltas.dimension()],
        )?;
        self.binary(Kernel::ActivationDelta(activation), outputs, errors, deltas)
    }

    fn correlate(
        &self,
        input: &Tensor,
        filters: &Tensor,
        stride: usize,
        out: &mut Tensor,
    ) -> Result<()> {
        check_correlate(
            "correlate",
            input.dimension(),
            input.zero_padding(),
            filters.dimension(),
            stride,
            out.dimension(),
        )?;
        self.binary(Kernel::Correlate { stride }, input, filters, out)
    }

    fn backprop_correlate(
        &self,
        deltas: &Tensor,
        filters: &Tensor,
        stride: usize,
        errors: &mut Tensor,
    ) -> Result<()> {
        check_correlate(
            "backprop_correlate",
            errors.dimension(),
            errors.zero_padding(),
            filters.dimension(),
            stride,
            deltas.dimension(),
        )?;
        self.binary(Kernel::BackpropCorrelate { stride }, deltas, filters, errors)
    }

    fn correlate_weights(
        &self,
        input: &Tensor,
        deltas: &Tensor,
        stride: usize,
        factor: f32,
        gradients: &mut Tensor,
    ) -> Result<()> {
        check_correlate(
            "correlate_weights",
            input.dimension(),
            input.zero_padding(),
            gradients.dimension(),
            stride,
            deltas.dimension(),
        )?;
        let inputs = vec![self.input(input)?, self.input(deltas)?];
        let output = self.output(gradients, true)?;
        self.dispatch(Kernel::CorrelateWeights { stride, factor }, inputs, vec![output])?;
        gradients.mark_device_as_master(BufferRole::ReadWrite);
        Ok(())
    }

    fn max_pool(
        &self,
        input: &Tensor,
        pool: usize,
        out: &mut Tensor,
        mask: &mut Tensor,
    ) -> Result<()> {
        check_pool(input.dimension(), pool, out.dimension(), mask.dimension())?;
        let inputs = vec![self.input(input)?];
        let outputs = vec![self.output(out, false)?, self.output(mask, false)?];
        self.dispatch(Kernel::MaxPool { pool }, inputs, outputs)?;
        out.mark_device_as_master(BufferRole::ReadWrite);
        mask.mark_device_as_master(BufferRole::ReadWrite);
        Ok(())
    }

    fn backprop_max_pool(&self, deltas: &Tensor, mask: &Tensor, errors: &mut Tensor) -> Result<()> {
        check_same("backprop_max_pool", deltas.dimension(), &[mask.dimension()])?;
        if deltas.dimension().depth() != errors.dimension().depth() {
            return Err(crate::error::MatrixError::mismatch(
                "backprop_max_pool",
                deltas.dimension(),
                errors.dimension(),
            ));
        }
        self.binary(Kernel::BackpropMaxPool, deltas, mask, errors)
    }

    fn adam(
        &self,
        weights: &mut Tensor,
        gradients: &Tensor,
        m: &mut Tensor,
        v: &mut Tensor,
        step: AdamStep,
    ) -> Result<()> {
        check_same(
            "adam",
            weights.dimension(),
            &[gradients.dimension(), m.dimension(), v.dimension()],
        )?;
        let inputs = vec![self.input(gradients)?];
        let outputs = vec![
            self.output(weights, true)?,
            self.output(m, true)?,
            self.output(v, true)?,
        ];
        self.dispatch(
            Kernel::Adam {
                beta1: step.beta1,
                beta2: step.beta2,
                factor: step.factor,
                epsilon: step.epsilon,
            },
            inputs,
            outputs,
        )?;
        for t in [weights, m, v] {
            t.mark_device_as_master(BufferRole::ReadWrite);
        }
        Ok(())
    }
}
