use std::cell::{Cell, OnceCell};
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::backend::device::{BufferId, BufferRole, Device, DeviceLayout};
use crate::engine::dimension::Dimension;
use crate::error::Result;

/// Which side currently holds the valid copy of one buffer role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    HostAuthoritative,
    DeviceAuthoritative,
}

#[derive(Debug)]
struct BufferSlot {
    role: BufferRole,
    state: Cell<SyncState>,
    buffer: OnceCell<BufferId>,
}

impl BufferSlot {
    fn new(role: BufferRole) -> Self {
        Self {
            role,
            state: Cell::new(SyncState::HostAuthoritative),
            buffer: OnceCell::new(),
        }
    }
}

/// テンソルごとのデバイス側ミラー。
///
/// 読み取り専用バッファと読み書きバッファの2つを持ち、それぞれ独立した
/// 同期状態を管理します。バッファは初回アクセス時に遅延確保されます。
/// レイアウト (パディング) は生成時に一度だけ計算され、以後変わりません。
///
/// The state flags are not synchronized; one thread owns a network and all
/// of its tensors.
pub struct DeviceMirror {
    device: Arc<dyn Device>,
    layout: DeviceLayout,
    read_only: BufferSlot,
    read_write: BufferSlot,
}

impl DeviceMirror {
    pub fn new(device: Arc<dyn Device>, dim: Dimension, zero_padding: usize) -> Self {
        let layout = DeviceLayout::new(dim, zero_padding, device.block_size());
        Self {
            device,
            layout,
            read_only: BufferSlot::new(BufferRole::ReadOnly),
            read_write: BufferSlot::new(BufferRole::ReadWrite),
        }
    }

    pub fn layout(&self) -> DeviceLayout {
        self.layout
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn is_on(&self, device: &Arc<dyn Device>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.device) as *const (),
            Arc::as_ptr(device) as *const (),
        )
    }

    fn slot(&self, role: BufferRole) -> &BufferSlot {
        match role {
            BufferRole::ReadOnly => &self.read_only,
            BufferRole::ReadWrite => &self.read_write,
        }
    }

    pub fn state(&self, role: BufferRole) -> SyncState {
        self.slot(role).state.get()
    }

    pub fn is_allocated(&self, role: BufferRole) -> bool {
        self.slot(role).buffer.get().is_some()
    }

    /// Device buffer for `role`, allocated and zero-filled on first access.
    pub fn buffer(&self, role: BufferRole) -> Result<BufferId> {
        let slot = self.slot(role);
        if let Some(&id) = slot.buffer.get() {
            return Ok(id);
        }
        let len = self.layout.len();
        let id = match role {
            BufferRole::ReadOnly => self.device.allocate_read_only(len)?,
            BufferRole::ReadWrite => self.device.allocate_read_write(len)?,
        };
        self.device.zero_fill(id)?;
        trace!(?role, buffer = id, len, "allocated device buffer");
        Ok(*slot.buffer.get_or_init(|| id))
    }

    /// Copies host storage into the device buffer if the host is
    /// authoritative; no-op otherwise.
    pub fn upload(&self, role: BufferRole, host: &[f32]) -> Result<()> {
        let slot = self.slot(role);
        if slot.state.get() == SyncState::DeviceAuthoritative {
            return Ok(());
        }
        let buffer = self.buffer(role)?;
        trace!(role = ?slot.role, buffer, "upload");
        self.device.upload(buffer, host, &self.layout.host_region())?;
        slot.state.set(SyncState::DeviceAuthoritative);
        Ok(())
    }

    /// Copies the device buffer back into host storage if the device is
    /// authoritative; no-op otherwise.
    pub fn download(&self, role: BufferRole, host: &mut [f32]) -> Result<()> {
        let slot = self.slot(role);
        if slot.state.get() == SyncState::HostAuthoritative {
            return Ok(());
        }
        let buffer = self.buffer(role)?;
        trace!(role = ?slot.role, buffer, "download");
        self.device.download(buffer, host, &self.layout.host_region())?;
        slot.state.set(SyncState::HostAuthoritative);
        Ok(())
    }

    /// Declares the device copy current without moving data, e.g. after a
    /// kernel wrote into the buffer. A device-side write leaves the
    /// read-only copy stale.
    pub fn mark_device_as_master(&self, role: BufferRole) {
        self.slot(role).state.set(SyncState::DeviceAuthoritative);
        if role == BufferRole::ReadWrite {
            self.read_only.state.set(SyncState::HostAuthoritative);
        }
    }

    /// Declares the host copy current without moving data.
    pub fn mark_host_as_master(&self, role: BufferRole) {
        self.slot(role).state.set(SyncState::HostAuthoritative);
    }
}

impl Drop for DeviceMirror {
    fn drop(&mut self) {
        for slot in [&self.read_only, &self.read_write] {
            if let Some(&id) = slot.buffer.get() {
                self.device.release(id);
            }
        }
    }
}

impl fmt::Debug for DeviceMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMirror")
            .field("device", &self.device.name())
            .field("layout", &self.layout)
            .field("read_only", &self.read_only.state.get())
            .field("read_write", &self.read_write.state.get())
            .finish()
    }
}
