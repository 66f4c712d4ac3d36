//! An in-process device.
//!
//! Buffers live in host memory but use the padded device layout, and kernels
//! read the materialized zero border exactly the way an accelerator would.
//! Transfer and dispatch counters make the synchronization protocol
//! observable in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::trace;

use crate::backend::device::{
    BufferId, BufferRole, CopyRegion, Device, DeviceLayout, Kernel, KernelCall,
};
use crate::backend::host::window_origin;
use crate::engine::activation::Activation;
use crate::error::{MatrixError, Result};

#[derive(Debug)]
struct DeviceBuffer {
    role: BufferRole,
    data: Vec<f32>,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicUsize,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    dispatches: AtomicUsize,
}

/// Snapshot of the device counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    pub allocations: usize,
    pub live_buffers: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub dispatches: usize,
}

#[derive(Debug)]
pub struct EmulatedDevice {
    block_size: usize,
    buffers: Mutex<Vec<Option<DeviceBuffer>>>,
    counters: Counters,
}

impl EmulatedDevice {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self {
            block_size,
            buffers: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> DeviceStats {
        let live_buffers = self
            .buffers
            .lock()
            .map(|b| b.iter().filter(|b| b.is_some()).count())
            .unwrap_or(0);
        DeviceStats {
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            live_buffers,
            uploads: self.counters.uploads.load(Ordering::Relaxed),
            downloads: self.counters.downloads.load(Ordering::Relaxed),
            dispatches: self.counters.dispatches.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Option<DeviceBuffer>>>> {
        self.buffers
            .lock()
            .map_err(|_| MatrixError::Device("emulated device state poisoned".into()))
    }

    fn allocate(&self, role: BufferRole, len: usize) -> Result<BufferId> {
        let mut buffers = self.lock()?;
        buffers.push(Some(DeviceBuffer {
            role,
            data: vec![0.0; len],
        }));
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(buffers.len() - 1)
    }
}

fn buffer_mut(buffers: &mut [Option<DeviceBuffer>], id: BufferId) -> Result<&mut DeviceBuffer> {
    buffers
        .get_mut(id)
        .and_then(Option::as_mut)
        .ok_or_else(|| MatrixError::Device(format!("unknown buffer {}", id)))
}

fn region_fits(region: &CopyRegion, host_len: usize, device_len: usize) -> bool {
    let mut fits = true;
    region.for_each_run(|host, device, len| {
        fits &= host + len <= host_len && device + len <= device_len;
    });
    fits
}

impl Device for EmulatedDevice {
    fn name(&self) -> &str {
        "emulated"
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate_read_only(&self, len: usize) -> Result<BufferId> {
        self.allocate(BufferRole::ReadOnly, len)
    }

    fn allocate_read_write(&self, len: usize) -> Result<BufferId> {
        self.allocate(BufferRole::ReadWrite, len)
    }

    fn upload(&self, buffer: BufferId, host: &[f32], region: &CopyRegion) -> Result<()> {
        let mut buffers = self.lock()?;
        let target = buffer_mut(&mut buffers, buffer)?;
        if !region_fits(region, host.len(), target.data.len()) {
            return Err(MatrixError::Device(format!("upload region outside buffer {}", buffer)));
        }
        region.for_each_run(|h, d, len| {
            target.data[d..d + len].copy_from_slice(&host[h..h + len]);
        });
        self.counters.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn download(&self, buffer: BufferId, host: &mut [f32], region: &CopyRegion) -> Result<()> {
        let mut buffers = self.lock()?;
        let source = buffer_mut(&mut buffers, buffer)?;
        if !region_fits(region, host.len(), source.data.len()) {
            return Err(MatrixError::Device(format!("download region outside buffer {}", buffer)));
        }
        region.for_each_run(|h, d, len| {
            host[h..h + len].copy_from_slice(&source.data[d..d + len]);
        });
        self.counters.downloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn dispatch(&self, call: &KernelCall) -> Result<()> {
        let [gr, gc, _] = call.global_size;
        if gr % self.block_size != 0 || gc % self.block_size != 0 {
            return Err(MatrixError::Device(format!(
                "global size {:?} is not a multiple of block size {}",
                call.global_size, self.block_size
            )));
        }
        let mut buffers = self.lock()?;

        // 入力は書き込み前にスナップショットを取る (出力と同じバッファでもよい)
        let mut inputs = Vec::with_capacity(call.inputs.len());
        for arg in &call.inputs {
            let buffer = buffer_mut(&mut buffers, arg.buffer)?;
            inputs.push(Bound::new(arg.layout, buffer.data.clone())?);
        }
        let mut outputs = Vec::with_capacity(call.outputs.len());
        for arg in &call.outputs {
            let buffer = buffer_mut(&mut buffers, arg.buffer)?;
            if buffer.role != BufferRole::ReadWrite {
                return Err(MatrixError::Device(format!(
                    "{:?} writes into read-only buffer {}",
                    call.kernel, arg.buffer
                )));
            }
            outputs.push(Bound::new(arg.layout, buffer.data.clone())?);
        }

        run(call.kernel, &inputs, &mut outputs)?;

        for (arg, out) in call.outputs.iter().zip(outputs) {
            buffer_mut(&mut buffers, arg.buffer)?.data = out.data;
        }
        self.counters.dispatches.fetch_add(1, Ordering::Relaxed);
        trace!(kernel = ?call.kernel, "dispatched");
        Ok(())
    }

    fn zero_fill(&self, buffer: BufferId) -> Result<()> {
        let mut buffers = self.lock()?;
        buffer_mut(&mut buffers, buffer)?.data.fill(0.0);
        Ok(())
    }

    fn release(&self, buffer: BufferId) {
        if let Ok(mut buffers) = self.buffers.lock() {
            if let Some(slot) = buffers.get_mut(buffer) {
                *slot = None;
            }
        }
    }
}

/// Buffer contents bound to a kernel argument.
struct Bound {
    layout: DeviceLayout,
    data: Vec<f32>,
}

impl Bound {
    fn new(layout: DeviceLayout, data: Vec<f32>) -> Result<Self> {
        if data.len() != layout.len() {
            return Err(MatrixError::Device(format!(
                "buffer of {} values bound with a layout of {}",
                data.len(),
                layout.len()
            )));
        }
        Ok(Self { layout, data })
    }

    fn get(&self, r: usize, c: usize, z: usize) -> f32 {
        self.data[self.layout.index(r, c, z)]
    }

    fn set(&mut self, r: usize, c: usize, z: usize, value: f32) {
        let i = self.layout.index(r, c, z);
        self.data[i] = value;
    }

    /// Read in padded coordinates; the border holds zeros.
    fn padded(&self, pr: usize, pc: usize, z: usize) -> f32 {
        self.data[self.layout.padded_index(pr, pc, z)]
    }

    fn for_each_cell(&self, mut f: impl FnMut(usize, usize, usize)) {
        for z in 0..self.layout.depth() {
            for c in 0..self.layout.columns {
                for r in 0..self.layout.rows {
                    f(r, c, z);
                }
            }
        }
    }
}

fn arity(kernel: Kernel, inputs: &[Bound], outputs: &[Bound], i: usize, o: usize) -> Result<()> {
    if inputs.len() != i || outputs.len() != o {
        return Err(MatrixError::Device(format!(
            "{:?} expects {} inputs and {} outputs, got {} and {}",
            kernel,
            i,
            o,
            inputs.len(),
            outputs.len()
        )));
    }
    Ok(())
}

fn zip(inputs: &[Bound], out: &mut Bound, f: impl Fn(f32, f32) -> f32) {
    let (a, b) = (&inputs[0], &inputs[1]);
    let layout = out.layout;
    for z in 0..layout.depth() {
        for c in 0..layout.columns {
            for r in 0..layout.rows {
                out.set(r, c, z, f(a.get(r, c, z), b.get(r, c, z)));
            }
        }
    }
}

fn plane(depth: usize, z: usize) -> usize {
    if depth == 1 {
        0
    } else {
        z
    }
}

fn run(kernel: Kernel, inputs: &[Bound], outputs: &mut [Bound]) -> Result<()> {
    match kernel {
        Kernel::DotAdd => {
            arity(kernel, inputs, outputs, 2, 1)?;
            zip(inputs, &mut outputs[0], |a, b| a + b);
        }
        Kernel::DotSubtract => {
            arity(kernel, inputs, outputs, 2, 1)?;
            zip(inputs, &mut outputs[0], |a, b| a - b);
        }
        Kernel::DotMultiply => {
            arity(kernel, inputs, outputs, 2, 1)?;
            zip(inputs, &mut outputs[0], |a, b| a * b);
        }
        Kernel::LinearCombination { factor1, factor2 } => {
            arity(kernel, inputs, outputs, 2, 1)?;
            zip(inputs, &mut outputs[0], |a, b| factor1 * a + factor2 * b);
        }
        Kernel::Sgemm {
            alpha,
            beta,
            transpose_a,
            transpose_b,
        } => {
            arity(kernel, inputs, outputs, 2, 1)?;
            sgemm(alpha, &inputs[0], transpose_a, &inputs[1], transpose_b, beta, &mut outputs[0])?;
        }
        Kernel::Activate(activation) => {
            arity(kernel, inputs, outputs, 0, 1)?;
            activate(activation, &mut outputs[0]);
        }
        Kernel::ActivationDelta(activation) => {
            arity(kernel, inputs, outputs, 2, 1)?;
            zip(inputs, &mut outputs[0], |o, e| e * activation.derivative(o));
        }
        Kernel::Correlate { stride } => {
            arity(kernel, inputs, outputs, 2, 1)?;
            correlate(&inputs[0], &inputs[1], stride, &mut outputs[0]);
        }
        Kernel::BackpropCorrelate { stride } => {
            arity(kernel, inputs, outputs, 2, 1)?;
            backprop_correlate(&inputs[0], &inputs[1], stride, &mut outputs[0]);
        }
        Kernel::CorrelateWeights { stride, factor } => {
            arity(kernel, inputs, outputs, 2, 1)?;
            correlate_weights(&inputs[0], &inputs[1], stride, factor, &mut outputs[0]);
        }
        Kernel::MaxPool { pool } => {
            arity(kernel, inputs, outputs, 1, 2)?;
            let (out, mask) = outputs.split_at_mut(1);
            max_pool(&inputs[0], pool, &mut out[0], &mut mask[0]);
        }
        Kernel::BackpropMaxPool => {
            arity(kernel, inputs, outputs, 2, 1)?;
            backprop_max_pool(&inputs[0], &inputs[1], &mut outputs[0]);
        }
        Kernel::Adam {
            beta1,
            beta2,
            factor,
            epsilon,
        } => {
            arity(kernel, inputs, outputs, 1, 3)?;
            let gradients = &inputs[0];
            let [weights, m, v] = outputs else {
                unreachable!("arity checked above");
            };
            gradients.for_each_cell(|r, c, z| {
                let g = gradients.get(r, c, z);
                let mi = beta1 * m.get(r, c, z) + (1.0 - beta1) * g;
                let vi = beta2 * v.get(r, c, z) + (1.0 - beta2) * g * g;
                m.set(r, c, z, mi);
                v.set(r, c, z, vi);
                let w = weights.get(r, c, z) + factor * mi / (vi.sqrt() + epsilon);
                weights.set(r, c, z, w);
            });
        }
    }
    Ok(())
}

fn sgemm(
    alpha: f32,
    a: &Bound,
    transpose_a: bool,
    b: &Bound,
    transpose_b: bool,
    beta: f32,
    c: &mut Bound,
) -> Result<()> {
    let (m, n) = (c.layout.rows, c.layout.columns);
    let (a_rows, k) = if transpose_a {
        (a.layout.columns, a.layout.rows)
    } else {
        (a.layout.rows, a.layout.columns)
    };
    let (b_rows, b_columns) = if transpose_b {
        (b.layout.columns, b.layout.rows)
    } else {
        (b.layout.rows, b.layout.columns)
    };
    if a_rows != m || b_rows != k || b_columns != n {
        return Err(MatrixError::Device("sgemm operands do not line up".into()));
    }
    let (a_depth, b_depth, c_depth) = (a.layout.depth(), b.layout.depth(), c.layout.depth());
    let depth = a_depth.max(b_depth).max(c_depth);
    let op_a = |i: usize, kk: usize, z: usize| {
        if transpose_a {
            a.get(kk, i, z)
        } else {
            a.get(i, kk, z)
        }
    };
    let op_b = |kk: usize, j: usize, z: usize| {
        if transpose_b {
            b.get(j, kk, z)
        } else {
            b.get(kk, j, z)
        }
    };
    for z in 0..depth {
        let (za, zb, zc) = (plane(a_depth, z), plane(b_depth, z), plane(c_depth, z));
        let plane_beta = if c_depth == 1 && z > 0 { 1.0 } else { beta };
        for j in 0..n {
            for i in 0..m {
                let acc: f32 = (0..k).map(|kk| op_a(i, kk, za) * op_b(kk, j, zb)).sum();
                let value = alpha * acc + plane_beta * c.get(i, j, zc);
                c.set(i, j, zc, value);
            }
        }
    }
    Ok(())
}

fn activate(activation: Activation, t: &mut Bound) {
    let layout = t.layout;
    for z in 0..layout.depth() {
        for r in 0..layout.rows {
            for c in 0..layout.columns {
                let v = activation.apply(t.get(r, c, z));
                t.set(r, c, z, v);
            }
            if activation.is_row_normalized() {
                let sum: f32 = (0..layout.columns).map(|c| t.get(r, c, z)).sum();
                for c in 0..layout.columns {
                    let v = t.get(r, c, z) / sum;
                    t.set(r, c, z, v);
                }
            }
        }
    }
}

fn correlate(input: &Bound, filters: &Bound, stride: usize, out: &mut Bound) {
    let in_slices = input.layout.slices;
    let features = out.layout.slices;
    let fs = filters.layout.rows;
    for h in 0..out.layout.hyper_slices {
        for f in 0..features {
            let zo = f + h * features;
            for oc in 0..out.layout.columns {
                for or in 0..out.layout.rows {
                    let mut acc = 0.0;
                    for s in 0..in_slices {
                        let zi = s + h * in_slices;
                        let zf = f * in_slices + s;
                        for kc in 0..fs {
                            for kr in 0..fs {
                                acc += input.padded(or * stride + kr, oc * stride + kc, zi)
                                    * filters.get(kr, kc, zf);
                            }
                        }
                    }
                    out.set(or, oc, zo, acc);
                }
            }
        }
    }
}

fn backprop_correlate(deltas: &Bound, filters: &Bound, stride: usize, errors: &mut Bound) {
    let in_slices = errors.layout.slices;
    let features = deltas.layout.slices;
    let fs = filters.layout.rows;
    let pad = errors.layout.zero_padding;
    for h in 0..errors.layout.hyper_slices {
        for s in 0..in_slices {
            for ic in 0..errors.layout.columns {
                for ir in 0..errors.layout.rows {
                    let mut acc = 0.0;
                    for kc in 0..fs {
                        let Some(oc) = window_origin(ic + pad, kc, stride, deltas.layout.columns) else {
                            continue;
                        };
                        for kr in 0..fs {
                            let Some(or) = window_origin(ir + pad, kr, stride, deltas.layout.rows) else {
                                continue;
                            };
                            for f in 0..features {
                                acc += deltas.get(or, oc, f + h * features)
                                    * filters.get(kr, kc, f * in_slices + s);
                            }
                        }
                    }
                    errors.set(ir, ic, s + h * in_slices, acc);
                }
            }
        }
    }
}

fn correlate_weights(input: &Bound, deltas: &Bound, stride: usize, factor: f32, gradients: &mut Bound) {
    let in_slices = input.layout.slices;
    let features = deltas.layout.slices;
    let fs = gradients.layout.rows;
    for f in 0..features {
        for s in 0..in_slices {
            let zg = f * in_slices + s;
            for kc in 0..fs {
                for kr in 0..fs {
                    let mut acc = 0.0;
                    for h in 0..deltas.layout.hyper_slices {
                        for oc in 0..deltas.layout.columns {
                            for or in 0..deltas.layout.rows {
                                acc += input.padded(or * stride + kr, oc * stride + kc, s + h * in_slices)
                                    * deltas.get(or, oc, f + h * features);
                            }
                        }
                    }
                    let g = gradients.get(kr, kc, zg) + factor * acc;
                    gradients.set(kr, kc, zg, g);
                }
            }
        }
    }
}

fn max_pool(input: &Bound, pool: usize, out: &mut Bound, mask: &mut Bound) {
    let in_rows = input.layout.rows;
    let layout = out.layout;
    for z in 0..layout.depth() {
        for oc in 0..layout.columns {
            for or in 0..layout.rows {
                let (mut best_r, mut best_c) = (or * pool, oc * pool);
                let mut best = input.get(best_r, best_c, z);
                for kr in 0..pool {
                    for kc in 0..pool {
                        let (r, c) = (or * pool + kr, oc * pool + kc);
                        let v = input.get(r, c, z);
                        if v > best {
                            best = v;
                            best_r = r;
                            best_c = c;
                        }
                    }
                }
                out.set(or, oc, z, best);
                mask.set(or, oc, z, (best_r + best_c * in_rows) as f32);
            }
        }
    }
}

fn backprop_max_pool(deltas: &Bound, mask: &Bound, errors: &mut Bound) {
    let rows = errors.layout.rows;
    let layout = errors.layout;
    for z in 0..layout.depth() {
        for c in 0..layout.columns {
            for r in 0..layout.rows {
                errors.set(r, c, z, 0.0);
            }
        }
    }
    deltas.for_each_cell(|or, oc, z| {
        let i = mask.get(or, oc, z) as usize;
        let (r, c) = (i % rows, i / rows);
        let v = errors.get(r, c, z) + deltas.get(or, oc, z);
        errors.set(r, c, z, v);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::KernelArg;
    use crate::engine::dimension::Dimension;

    fn bound_pair(device: &EmulatedDevice, layout: DeviceLayout) -> (BufferId, BufferId) {
        let ro = device.allocate_read_only(layout.len()).unwrap();
        let rw = device.allocate_read_write(layout.len()).unwrap();
        (ro, rw)
    }

    #[test]
    fn kernel_rejects_read_only_output() {
        let device = EmulatedDevice::new(4);
        let layout = DeviceLayout::new(Dimension::matrix(2, 2), 0, 4);
        let (ro, _) = bound_pair(&device, layout);
        let arg = KernelArg { buffer: ro, layout };
        let call = KernelCall {
            kernel: Kernel::DotAdd,
            inputs: vec![arg, arg],
            outputs: vec![arg],
            global_size: layout.global_size(),
        };
        assert!(matches!(device.dispatch(&call), Err(MatrixError::Device(_))));
    }

    #[test]
    fn global_size_must_align_to_block() {
        let device = EmulatedDevice::new(4);
        let layout = DeviceLayout::new(Dimension::matrix(2, 2), 0, 4);
        let (_, rw) = bound_pair(&device, layout);
        let arg = KernelArg { buffer: rw, layout };
        let call = KernelCall {
            kernel: Kernel::Activate(Activation::Relu),
            inputs: vec![],
            outputs: vec![arg],
            global_size: [2, 2, 1],
        };
        assert!(device.dispatch(&call).is_err());
    }

    #[test]
    fn upload_writes_only_the_logical_region() {
        let device = EmulatedDevice::new(4);
        let layout = DeviceLayout::new(Dimension::matrix(2, 2), 1, 4);
        let (ro, _) = bound_pair(&device, layout);
        device
            .upload(ro, &[1.0, 2.0, 3.0, 4.0], &layout.host_region())
            .unwrap();
        assert_eq!(device.stats().uploads, 1);
        let buffers = device.buffers.lock().unwrap();
        let data = &buffers[ro].as_ref().unwrap().data;
        assert_eq!(data.iter().sum::<f32>(), 10.0);
        assert_eq!(data[layout.padded_index(0, 0, 0)], 0.0);
        assert_eq!(data[layout.index(1, 0, 0)], 2.0);
    }

    #[test]
    fn release_frees_the_slot() {
        let device = EmulatedDevice::new(4);
        let id = device.allocate_read_write(16).unwrap();
        assert_eq!(device.stats().live_buffers, 1);
        device.release(id);
        assert_eq!(device.stats().live_buffers, 0);
        assert!(device.zero_fill(id).is_err());
    }
}
