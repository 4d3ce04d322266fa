//! Device memory handles and the guard that releases them.

use crate::device::Device;
use std::sync::Arc;

/// Opaque handle to a region of device memory.
///
/// A descriptor is a plain value: copying it does not copy or share
/// ownership of the memory. Whoever last received it from the allocator is
/// responsible for handing it back through `Device::free` or
/// `Device::free_tmp`. A null descriptor (address 0) owns nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    /// Device address of the first byte.
    pub addr: u64,

    /// Size of the region in bytes.
    pub size: u64,
}

impl BufferDesc {
    pub fn new(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
}

/// A temporary device buffer handed back through `Device::free_tmp` when
/// the guard goes out of scope.
///
/// Kernels hold workspace and transient weight buffers in these guards so
/// every exit path of an invocation, including early `?` returns, gives the
/// memory back.
pub struct ScopedBuffer {
    device: Arc<dyn Device>,
    desc: BufferDesc,
}

impl ScopedBuffer {
    /// Acquire a temporary buffer of `bytes` bytes.
    ///
    /// A zero-byte request yields a null descriptor without touching the
    /// allocator.
    pub fn temporary(device: Arc<dyn Device>, bytes: u64) -> crate::Result<Self> {
        let desc = if bytes == 0 {
            BufferDesc::null()
        } else {
            device.alloc_tmp(bytes)?
        };
        Ok(Self { device, desc })
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn addr(&self) -> u64 {
        self.desc.addr
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }
}

impl std::fmt::Debug for ScopedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedBuffer")
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

impl Drop for ScopedBuffer {
    fn drop(&mut self) {
        if !self.desc.is_null() {
            self.device.free_tmp(&mut self.desc);
        }
    }
}
