//! The contract an accelerator must satisfy.
//!
//! A device only knows about flat `f32` buffers. Everything tensor-shaped
//! (padding, pitches, kernel arguments) is described by [`DeviceLayout`] and
//! [`CopyRegion`], so the host-side synchronization logic does not depend on
//! which concrete device executes the kernels.

use std::fmt::Debug;

use crate::engine::activation::Activation;
use crate::engine::dimension::Dimension;
use crate::error::Result;

pub type BufferId = usize;

/// Which of the two device buffers of a tensor is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Bound as kernel input only.
    ReadOnly,
    /// Written (or accumulated into) by kernels.
    ReadWrite,
}

/// Padded device-side layout of one tensor.
///
/// Rows and columns are each padded independently so that the padded extent
/// is a multiple of the device block size. The logical cell `(r, c)` sits at
/// `(r + zero_padding, c + zero_padding)` in the padded plane, so the padding
/// border doubles as materialized zero padding for correlation kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLayout {
    pub rows: usize,
    pub columns: usize,
    pub slices: usize,
    pub hyper_slices: usize,
    pub zero_padding: usize,
    pub padded_rows: usize,
    pub padded_columns: usize,
}

impl DeviceLayout {
    pub fn new(dim: Dimension, zero_padding: usize, block_size: usize) -> Self {
        Self {
            rows: dim.rows(),
            columns: dim.columns(),
            slices: dim.slices(),
            hyper_slices: dim.hyper_slices(),
            zero_padding,
            padded_rows: dim.rows() + Self::padding_for(dim.rows(), zero_padding, block_size),
            padded_columns: dim.columns()
                + Self::padding_for(dim.columns(), zero_padding, block_size),
        }
    }

    /// `2*zeroPadding + (blockSize - (extent + 2*zeroPadding) mod blockSize)`
    pub fn padding_for(extent: usize, zero_padding: usize, block_size: usize) -> usize {
        2 * zero_padding + (block_size - (extent + 2 * zero_padding) % block_size)
    }

    pub fn depth(&self) -> usize {
        self.slices * self.hyper_slices
    }

    /// Stride between two consecutive columns.
    pub fn row_pitch(&self) -> usize {
        self.padded_rows
    }

    /// Stride between two consecutive (slice, hyperslice) planes.
    pub fn slice_pitch(&self) -> usize {
        self.padded_rows * self.padded_columns
    }

    pub fn len(&self) -> usize {
        self.slice_pitch() * self.depth()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat index of logical cell `(r, c)` in plane `z = s + h*slices`.
    pub fn index(&self, r: usize, c: usize, z: usize) -> usize {
        (r + self.zero_padding) + (c + self.zero_padding) * self.row_pitch() + z * self.slice_pitch()
    }

    /// Flat index in padded coordinates, `(pr, pc)` counted from the outer
    /// corner of the zero border.
    pub fn padded_index(&self, pr: usize, pc: usize, z: usize) -> usize {
        pr + pc * self.row_pitch() + z * self.slice_pitch()
    }

    /// The logical region of this tensor between unpadded host storage and
    /// the padded device buffer.
    pub fn host_region(&self) -> CopyRegion {
        CopyRegion {
            extent: [self.rows, self.columns, self.depth()],
            host_offset: 0,
            host_row_pitch: self.rows,
            host_slice_pitch: self.rows * self.columns,
            device_offset: self.index(0, 0, 0),
            device_row_pitch: self.row_pitch(),
            device_slice_pitch: self.slice_pitch(),
        }
    }

    /// Work size covering the padded plane, a multiple of the block size in
    /// rows and columns.
    pub fn global_size(&self) -> [usize; 3] {
        [self.padded_rows, self.padded_columns, self.depth()]
    }
}

/// A 3-D strided copy. `extent` is `[rows, columns, planes]`; rows are the
/// contiguous axis on both sides, each side has its own pitches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub extent: [usize; 3],
    pub host_offset: usize,
    pub host_row_pitch: usize,
    pub host_slice_pitch: usize,
    pub device_offset: usize,
    pub device_row_pitch: usize,
    pub device_slice_pitch: usize,
}

impl CopyRegion {
    /// Calls `f(host_index, device_index, run_length)` once per contiguous run.
    pub fn for_each_run(&self, mut f: impl FnMut(usize, usize, usize)) {
        let [rows, columns, planes] = self.extent;
        for z in 0..planes {
            for c in 0..columns {
                let host = self.host_offset + c * self.host_row_pitch + z * self.host_slice_pitch;
                let device =
                    self.device_offset + c * self.device_row_pitch + z * self.device_slice_pitch;
                f(host, device, rows);
            }
        }
    }
}

/// Kernels every device must be able to execute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    /// out = a + b
    DotAdd,
    /// out = a - b
    DotSubtract,
    /// out = a * b
    DotMultiply,
    /// out = factor1 * a + factor2 * b
    LinearCombination { factor1: f32, factor2: f32 },
    /// c = alpha * op(a) * op(b) + beta * c
    Sgemm {
        alpha: f32,
        beta: f32,
        transpose_a: bool,
        transpose_b: bool,
    },
    /// out = f(out)
    Activate(Activation),
    /// deltas = errors * f'(outputs)
    ActivationDelta(Activation),
    /// out = correlate(padded input, filters)
    Correlate { stride: usize },
    /// errors = backprop_correlate(deltas, filters)
    BackpropCorrelate { stride: usize },
    /// gradients += factor * correlate(padded input, deltas)
    CorrelateWeights { stride: usize, factor: f32 },
    /// out = max over windows, mask = in-slice index of the winner
    MaxPool { pool: usize },
    /// errors = scatter(deltas, mask)
    BackpropMaxPool,
    /// Adam moment and weight update
    Adam {
        beta1: f32,
        beta2: f32,
        factor: f32,
        epsilon: f32,
    },
}

/// One bound buffer argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelArg {
    pub buffer: BufferId,
    pub layout: DeviceLayout,
}

/// Kernel plus argument binding, as handed to [`Device::dispatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct KernelCall {
    pub kernel: Kernel,
    pub inputs: Vec<KernelArg>,
    pub outputs: Vec<KernelArg>,
    pub global_size: [usize; 3],
}

/// アクセラレータのバックエンドが満たすべき契約
///
/// Every call blocks until the device has finished the work.
pub trait Device: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Work-group granularity that padded extents are aligned to.
    fn block_size(&self) -> usize;

    fn allocate_read_only(&self, len: usize) -> Result<BufferId>;

    fn allocate_read_write(&self, len: usize) -> Result<BufferId>;

    /// Host to device strided copy.
    fn upload(&self, buffer: BufferId, host: &[f32], region: &CopyRegion) -> Result<()>;

    /// Device to host strided copy.
    fn download(&self, buffer: BufferId, host: &mut [f32], region: &CopyRegion) -> Result<()>;

    fn dispatch(&self, call: &KernelCall) -> Result<()>;

    fn zero_fill(&self, buffer: BufferId) -> Result<()>;

    fn release(&self, buffer: BufferId);
}
