//! Device memory allocator and data converter contracts.
//!
//! The allocator strategy (pooling, fragmentation handling) belongs to the
//! implementor. Kernels only rely on the ownership rules documented on each
//! method.

use crate::buffer::BufferDesc;
use crate::types::TensorShape;
use crate::Result;

/// Handle to an ordered device execution stream.
///
/// Work enqueued on the same stream runs in enqueue order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Static properties of a compute device, passed through to primitives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProps {
    pub name: String,

    /// Compute capability as `(major, minor)`.
    pub compute_capability: (u32, u32),

    pub multiprocessor_count: u32,

    pub shared_mem_per_block: usize,
}

impl DeviceProps {
    /// Whether the device reports at least the given compute capability.
    pub fn supports(&self, major: u32, minor: u32) -> bool {
        self.compute_capability >= (major, minor)
    }
}

impl Default for DeviceProps {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            compute_capability: (0, 0),
            multiprocessor_count: 0,
            shared_mem_per_block: 0,
        }
    }
}

/// Layout and type conversion into device buffers.
pub trait DataConverter: Send + Sync {
    /// Convert device-resident `src` (laid out as `src_shape`) into `dst`
    /// (laid out as `dst_shape`).
    fn convert(
        &self,
        dst: &BufferDesc,
        dst_shape: &TensorShape,
        src: &BufferDesc,
        src_shape: &TensorShape,
    ) -> Result<()>;

    /// Convert host-resident bytes (laid out as `src_shape`) into `dst`.
    fn convert_from_host(
        &self,
        dst: &BufferDesc,
        dst_shape: &TensorShape,
        src: &[u8],
        src_shape: &TensorShape,
    ) -> Result<()>;
}

/// A compute device with an explicit-ownership memory allocator.
pub trait Device: Send + Sync {
    /// Make `desc` refer to a buffer of at least `bytes` bytes.
    ///
    /// A null `desc` receives a fresh buffer. A non-null `desc` owned by the
    /// caller may be reused in place or replaced; the old buffer is released
    /// by the allocator when it is replaced. On failure `desc` is untouched.
    fn realloc(&self, bytes: u64, desc: &mut BufferDesc) -> Result<()>;

    /// [`Device::realloc`] sized to the shape's padded byte count.
    fn realloc_shape(&self, shape: &TensorShape, desc: &mut BufferDesc) -> Result<()> {
        self.realloc(shape.bytes_including_padding(), desc)
    }

    /// Release a buffer obtained from [`Device::realloc`]. Resets `desc` to null.
    fn free(&self, desc: &mut BufferDesc);

    /// Allocate scratch memory that lives for one invocation.
    fn alloc_tmp(&self, bytes: u64) -> Result<BufferDesc>;

    /// Release scratch memory obtained from [`Device::alloc_tmp`]. Resets
    /// `desc` to null.
    fn free_tmp(&self, desc: &mut BufferDesc);

    /// The converter writing into this device's buffers.
    fn converter(&self) -> &dyn DataConverter;

    /// The ordered stream kernels enqueue work on.
    fn stream(&self) -> StreamHandle;

    fn properties(&self) -> &DeviceProps;
}
