use std::cell::{OnceCell, Ref, RefCell};
use std::fmt;
use std::sync::Arc;

use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::backend::device::{BufferRole, Device, KernelArg};
use crate::backend::mirror::{DeviceMirror, SyncState};
use crate::engine::dimension::Dimension;
use crate::engine::matrix::{Matrix, MatrixMut};
use crate::error::{MatrixError, Result};

/// ホストメモリ上の4次元テンソル。
///
/// 値は `index(r,c,s,h) = r + c*rows + s*rows*columns + h*rows*columns*slices`
/// の順で連続して格納されます。ストレージを所有するのは `Tensor` だけで、
/// ビューとデバイスミラーは参照するだけです。
///
/// A tensor may carry a [`DeviceMirror`], attached lazily the first time an
/// accelerated backend touches it. Every host-side read first pulls back a
/// device-authoritative copy; every host-side write invalidates the device
/// copies.
///
/// # Panics
///
/// Host readers that cannot return a `Result` (`at`, `values`, `values_mut`,
/// `to_vec`, `clone`) panic if that download fails. Call [`Tensor::sync`]
/// first to handle a device failure as [`MatrixError::Device`](crate::MatrixError::Device).
pub struct Tensor {
    dim: Dimension,
    zero_padding: usize,
    data: RefCell<Vec<f32>>,
    mirror: OnceCell<DeviceMirror>,
}

impl Tensor {
    pub fn new(dim: Dimension) -> Self {
        Self::with_padding(dim, 0)
    }

    pub fn with_padding(dim: Dimension, zero_padding: usize) -> Self {
        Self {
            dim,
            zero_padding,
            data: RefCell::new(vec![0.0; dim.size()]),
            mirror: OnceCell::new(),
        }
    }

    pub fn filled(dim: Dimension, value: f32) -> Self {
        let t = Self::new(dim);
        t.data.borrow_mut().fill(value);
        t
    }

    /// Takes ownership of values already laid out in storage order.
    pub fn from_vec(dim: Dimension, values: Vec<f32>) -> Result<Self> {
        if values.len() != dim.size() {
            return Err(MatrixError::mismatch("from_vec", dim.size(), values.len()));
        }
        Ok(Self {
            dim,
            zero_padding: 0,
            data: RefCell::new(values),
            mirror: OnceCell::new(),
        })
    }

    /// 行優先で書かれた2次元配列から作成する (テストや小さな重み用)
    pub fn from_rows(rows: &[&[f32]]) -> Result<Self> {
        let n_rows = rows.len();
        let n_cols = rows.first().map_or(0, |r| r.len());
        if n_rows == 0 || n_cols == 0 {
            return Err(MatrixError::Precondition("from_rows needs a non-empty grid".into()));
        }
        let dim = Dimension::matrix(n_rows, n_cols);
        let mut t = Tensor::new(dim);
        {
            let values = t.values_mut();
            for (r, row) in rows.iter().enumerate() {
                if row.len() != n_cols {
                    return Err(MatrixError::mismatch("from_rows", n_cols, row.len()));
                }
                for (c, &v) in row.iter().enumerate() {
                    values[dim.index(r, c, 0, 0)] = v;
                }
            }
        }
        Ok(t)
    }

    pub fn random_uniform<R: Rng + ?Sized>(dim: Dimension, low: f32, high: f32, rng: &mut R) -> Self {
        let mut t = Tensor::new(dim);
        t.randomize(rng, low, high);
        t
    }

    pub fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R, low: f32, high: f32) {
        let distribution = Uniform::new_inclusive(low, high);
        for v in self.values_mut() {
            *v = distribution.sample(rng);
        }
    }

    pub fn len(&self) -> usize {
        self.dim.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- host storage ------------------------------------------------------

    /// Pulls a device-authoritative read/write buffer back into host
    /// storage. No-op for tensors that never touched a device.
    ///
    /// A failed download leaves the device copy authoritative and is
    /// reported as [`MatrixError::Device`](crate::MatrixError::Device).
    pub fn sync(&self) -> Result<()> {
        if let Some(mirror) = self.mirror.get() {
            if mirror.state(BufferRole::ReadWrite) == SyncState::DeviceAuthoritative {
                mirror.download(BufferRole::ReadWrite, &mut self.data.borrow_mut())?;
            }
        }
        Ok(())
    }

    fn ensure_host(&self) {
        // a lost device cannot be recovered mid-step
        if let Err(e) = self.sync() {
            panic!("failed to synchronize tensor {} from device: {}", self.dim, e);
        }
    }

    fn invalidate_device(&self) {
        if let Some(mirror) = self.mirror.get() {
            mirror.mark_host_as_master(BufferRole::ReadOnly);
            mirror.mark_host_as_master(BufferRole::ReadWrite);
        }
    }

    /// Host values in storage order.
    ///
    /// # Panics
    ///
    /// Panics if a device-authoritative copy cannot be downloaded; see
    /// [`Tensor::sync`].
    pub fn values(&self) -> Ref<'_, [f32]> {
        self.ensure_host();
        Ref::map(self.data.borrow(), |v| v.as_slice())
    }

    /// Mutable host values; marks the host copy as authoritative.
    ///
    /// # Panics
    ///
    /// Panics if a device-authoritative copy cannot be downloaded.
    pub fn values_mut(&mut self) -> &mut [f32] {
        self.ensure_host();
        self.invalidate_device();
        self.data.get_mut().as_mut_slice()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.values().to_vec()
    }

    /// Values of one (slice, hyperslice) plane, column-major.
    pub fn plane(&self, z: usize) -> Ref<'_, [f32]> {
        let size = self.dim.slice_size();
        Ref::map(self.values(), |v| &v[z * size..(z + 1) * size])
    }

    // ---- device mirror -----------------------------------------------------

    pub fn mirror(&self) -> Option<&DeviceMirror> {
        self.mirror.get()
    }

    /// The mirror on `device`, created on first use.
    pub fn mirror_on(&self, device: &Arc<dyn Device>) -> Result<&DeviceMirror> {
        let mirror = self
            .mirror
            .get_or_init(|| DeviceMirror::new(device.clone(), self.dim, self.zero_padding));
        if !mirror.is_on(device) {
            return Err(MatrixError::Device(format!(
                "tensor {} is mirrored on {}, not {}",
                self.dim,
                mirror.device().name(),
                device.name()
            )));
        }
        Ok(mirror)
    }

    /// Uploads the host copy into the buffer of `role` if needed.
    pub fn upload(&self, device: &Arc<dyn Device>, role: BufferRole) -> Result<()> {
        let mirror = self.mirror_on(device)?;
        if role == BufferRole::ReadOnly {
            // the read/write copy may be newer than the host
            self.sync()?;
        }
        mirror.upload(role, &self.data.borrow())
    }

    /// Downloads the buffer of `role` if it is device-authoritative.
    pub fn download(&self, role: BufferRole) -> Result<()> {
        match self.mirror.get() {
            Some(mirror) => mirror.download(role, &mut self.data.borrow_mut()),
            None => Ok(()),
        }
    }

    pub fn mark_device_as_master(&self, role: BufferRole) {
        if let Some(mirror) = self.mirror.get() {
            mirror.mark_device_as_master(role);
        }
    }

    pub fn mark_host_as_master(&self, role: BufferRole) {
        if let Some(mirror) = self.mirror.get() {
            mirror.mark_host_as_master(role);
        }
    }

    /// Binds this tensor as a kernel input. A device-resident result is
    /// used in place; otherwise the read-only buffer is uploaded on demand.
    pub fn device_input(&self, device: &Arc<dyn Device>) -> Result<KernelArg> {
        let mirror = self.mirror_on(device)?;
        let role = if mirror.state(BufferRole::ReadWrite) == SyncState::DeviceAuthoritative {
            BufferRole::ReadWrite
        } else {
            mirror.upload(BufferRole::ReadOnly, &self.data.borrow())?;
            BufferRole::ReadOnly
        };
        Ok(KernelArg {
            buffer: mirror.buffer(role)?,
            layout: mirror.layout(),
        })
    }

    /// Binds this tensor as a kernel output. With `accumulate` the current
    /// host values are uploaded first so the kernel can read them.
    pub fn device_output(&self, device: &Arc<dyn Device>, accumulate: bool) -> Result<KernelArg> {
        let mirror = self.mirror_on(device)?;
        if accumulate {
            mirror.upload(BufferRole::ReadWrite, &self.data.borrow())?;
        }
        Ok(KernelArg {
            buffer: mirror.buffer(BufferRole::ReadWrite)?,
            layout: mirror.layout(),
        })
    }

    // ---- validating / clamping element-wise families ----------------------

    fn check_same(&self, operation: &'static str, other: &dyn Matrix) -> Result<()> {
        if other.dimension() != self.dim {
            return Err(MatrixError::mismatch(operation, self.dim, other.dimension()));
        }
        Ok(())
    }

    fn zip_checked(
        &mut self,
        operation: &'static str,
        other: &dyn Matrix,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<()> {
        self.check_same(operation, other)?;
        let dim = self.dim;
        let values = self.values_mut();
        for (i, v) in values.iter_mut().enumerate() {
            let (r, c, s, h) = dim.coordinates(i);
            *v = f(*v, other.at(r, c, s, h));
        }
        Ok(())
    }

    // 小さい方の共通範囲だけを処理する (古い便利API)
    fn zip_clamped(&mut self, other: &dyn Matrix, f: impl Fn(f32, f32) -> f32) {
        let a = self.dim;
        let b = other.dimension();
        let (rows, columns) = (a.rows().min(b.rows()), a.columns().min(b.columns()));
        let (slices, hyper) = (a.slices().min(b.slices()), a.hyper_slices().min(b.hyper_slices()));
        let values = self.values_mut();
        for h in 0..hyper {
            for s in 0..slices {
                for c in 0..columns {
                    for r in 0..rows {
                        let i = a.index(r, c, s, h);
                        values[i] = f(values[i], other.at(r, c, s, h));
                    }
                }
            }
        }
    }

    /// `self += other`, failing on a dimension mismatch.
    pub fn dot_add(&mut self, other: &dyn Matrix) -> Result<()> {
        self.zip_checked("dot_add", other, |a, b| a + b)
    }

    /// `self -= other`, failing on a dimension mismatch.
    pub fn dot_subtract(&mut self, other: &dyn Matrix) -> Result<()> {
        self.zip_checked("dot_subtract", other, |a, b| a - b)
    }

    /// `self *= other` element-wise, failing on a dimension mismatch.
    pub fn dot_multiply(&mut self, other: &dyn Matrix) -> Result<()> {
        self.zip_checked("dot_multiply", other, |a, b| a * b)
    }

    /// `self += other` over the common extent only.
    pub fn dot_add_clamped(&mut self, other: &dyn Matrix) {
        self.zip_clamped(other, |a, b| a + b)
    }

    /// `self -= other` over the common extent only.
    pub fn dot_subtract_clamped(&mut self, other: &dyn Matrix) {
        self.zip_clamped(other, |a, b| a - b)
    }

    /// `self *= other` over the common extent only.
    pub fn dot_multiply_clamped(&mut self, other: &dyn Matrix) {
        self.zip_clamped(other, |a, b| a * b)
    }

    /// New tensor `self + other`, failing on a dimension mismatch.
    pub fn add(&self, other: &dyn Matrix) -> Result<Tensor> {
        let mut out = self.clone();
        out.dot_add(other)?;
        Ok(out)
    }

    /// New tensor `self + other` over the common extent of `self`.
    pub fn add_clamped(&self, other: &dyn Matrix) -> Tensor {
        let mut out = self.clone();
        out.dot_add_clamped(other);
        out
    }

    pub fn scale(&mut self, factor: f32) {
        for v in self.values_mut() {
            *v *= factor;
        }
    }

    /// Matrix product of the (rows × columns) planes, `self · other`.
    /// `other` is broadcast when it has a single plane.
    pub fn multiply(&self, other: &dyn Matrix) -> Result<Tensor> {
        let a = self.dim;
        let b = other.dimension();
        if a.columns() != b.rows() || (b.depth() != 1 && b.depth() != a.depth()) {
            return Err(MatrixError::mismatch("multiply", a, b));
        }
        let out_dim = Dimension::new(a.rows(), b.columns(), a.slices(), a.hyper_slices());
        let mut out = Tensor::new(out_dim);
        let lhs = self.values();
        let values = out.values_mut();
        for z in 0..a.depth() {
            let (bs, bh) = if b.depth() == 1 { (0, 0) } else { (z % a.slices(), z / a.slices()) };
            for c in 0..b.columns() {
                for r in 0..a.rows() {
                    let mut acc = 0.0;
                    for k in 0..a.columns() {
                        acc += lhs[r + k * a.rows() + z * a.slice_size()] * other.at(k, c, bs, bh);
                    }
                    values[r + c * a.rows() + z * out_dim.slice_size()] = acc;
                }
            }
        }
        Ok(out)
    }

    // ---- flat vector <-> structured reinterpretation ----------------------

    /// Spreads each per-hyperslice flat vector of `self` (any shape with the
    /// same per-hyperslice extent) into the structured coordinates of
    /// `target`, using the storage index formula on both sides.
    pub fn row_vector_to_matrix(&self, target: &mut Tensor) -> Result<()> {
        reindex("row_vector_to_matrix", self, target)
    }

    /// Inverse of [`Tensor::row_vector_to_matrix`].
    pub fn matrix_to_row_vector(&self, target: &mut Tensor) -> Result<()> {
        reindex("matrix_to_row_vector", self, target)
    }
}

fn reindex(operation: &'static str, source: &Tensor, target: &mut Tensor) -> Result<()> {
    let from = source.dim;
    let to = target.dim;
    if !from.is_compatible(&to) {
        return Err(MatrixError::mismatch(operation, from, to));
    }
    let src = source.values();
    let dst = target.values_mut();
    for h in 0..to.hyper_slices() {
        for i in 0..to.hyper_slice_size() {
            let (r, c, s, _) = to.coordinates(i);
            let (fr, fc, fs, _) = from.coordinates(i);
            dst[to.index(r, c, s, h)] = src[from.index(fr, fc, fs, h)];
        }
    }
    Ok(())
}

impl Matrix for Tensor {
    fn dimension(&self) -> Dimension {
        self.dim
    }

    fn zero_padding(&self) -> usize {
        self.zero_padding
    }

    fn at(&self, r: usize, c: usize, s: usize, h: usize) -> f32 {
        if !self.dim.contains(r, c, s, h) {
            return 0.0;
        }
        self.ensure_host();
        self.data.borrow()[self.dim.index(r, c, s, h)]
    }

    fn storage(&self) -> Option<(&Tensor, bool)> {
        Some((self, false))
    }

    fn copy(&self) -> Tensor {
        self.clone()
    }

    fn sum(&self) -> f32 {
        self.values().iter().sum()
    }
}

impl MatrixMut for Tensor {
    fn set_at(&mut self, r: usize, c: usize, s: usize, h: usize, value: f32) {
        if !self.dim.contains(r, c, s, h) {
            return;
        }
        let i = self.dim.index(r, c, s, h);
        self.values_mut()[i] = value;
    }

    fn apply_function(&mut self, f: &dyn Fn(f32) -> f32) {
        for v in self.values_mut() {
            *v = f(*v);
        }
    }

    fn fill(&mut self, value: f32) {
        self.values_mut().fill(value);
    }

    fn copy_from(&mut self, source: &dyn Matrix) -> Result<()> {
        self.check_same("copy_from", source)?;
        if let Some((tensor, false)) = source.storage() {
            let src = tensor.values();
            self.values_mut().copy_from_slice(&src);
            return Ok(());
        }
        let dim = self.dim;
        let values = self.values_mut();
        for (i, v) in values.iter_mut().enumerate() {
            let (r, c, s, h) = dim.coordinates(i);
            *v = source.at(r, c, s, h);
        }
        Ok(())
    }
}

/// Deep copy of the host values; the copy has no device mirror.
impl Clone for Tensor {
    fn clone(&self) -> Self {
        Self {
            dim: self.dim,
            zero_padding: self.zero_padding,
            data: RefCell::new(self.values().to_vec()),
            mirror: OnceCell::new(),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dim", &self.dim)
            .field("zero_padding", &self.zero_padding)
            .field("mirror", &self.mirror.get())
            .finish()
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.dim == other.dim && *self.values() == *other.values()
    }
}
