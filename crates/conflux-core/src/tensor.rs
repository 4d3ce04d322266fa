//! Logical tensors bound to device buffers.

use crate::buffer::BufferDesc;
use crate::context::GroupId;
use crate::device::Device;
use crate::types::TensorShape;
use crate::Result;

/// A named view over a device buffer.
///
/// The tensor either owns its buffer (allocated through
/// [`Tensor::realloc_buffer`]) or borrows one that someone else owns, such
/// as a fusion-group buffer. It never owns two buffers at once: binding a
/// borrowed buffer releases the owned one first, and reallocating a tensor
/// that borrows detaches it before allocating.
#[derive(Debug, Clone)]
pub struct Tensor {
    name: String,
    shape: TensorShape,
    buffer: BufferDesc,
    owns_buffer: bool,
    fusion_group: Option<GroupId>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: TensorShape) -> Self {
        Self {
            name: name.into(),
            shape,
            buffer: BufferDesc::null(),
            owns_buffer: false,
            fusion_group: None,
        }
    }

    /// Create a tensor that borrows an existing device buffer, e.g. a
    /// constant uploaded by the engine or an upstream operator's output.
    pub fn with_buffer(name: impl Into<String>, shape: TensorShape, buffer: BufferDesc) -> Self {
        Self {
            buffer,
            ..Self::new(name, shape)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn set_shape(&mut self, shape: TensorShape) {
        self.shape = shape;
    }

    pub fn buffer(&self) -> &BufferDesc {
        &self.buffer
    }

    /// Device address of the bound buffer, 0 when unbound.
    pub fn buffer_addr(&self) -> u64 {
        self.buffer.addr
    }

    pub fn owns_buffer(&self) -> bool {
        self.owns_buffer
    }

    /// Fusion group whose shared buffer this tensor is bound to.
    pub fn fusion_group(&self) -> Option<GroupId> {
        self.fusion_group
    }

    /// Size the owned buffer to the current shape, allocating one if needed.
    ///
    /// A borrowed buffer is detached first; it is never resized.
    pub fn realloc_buffer(&mut self, device: &dyn Device) -> Result<()> {
        if !self.owns_buffer {
            self.buffer = BufferDesc::null();
            self.fusion_group = None;
        }
        device.realloc_shape(&self.shape, &mut self.buffer)?;
        self.owns_buffer = true;
        Ok(())
    }

    /// Bind a buffer owned by a fusion group, releasing any owned buffer.
    pub fn bind_shared(&mut self, device: &dyn Device, buffer: BufferDesc, group: GroupId) {
        self.free_buffer(device);
        self.buffer = buffer;
        self.fusion_group = Some(group);
    }

    /// Release the owned buffer, or forget a borrowed one.
    pub fn free_buffer(&mut self, device: &dyn Device) {
        if self.owns_buffer {
            device.free(&mut self.buffer);
        }
        self.buffer = BufferDesc::null();
        self.owns_buffer = false;
        self.fusion_group = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use crate::types::DataType;

    fn shape(dims: &[usize]) -> TensorShape {
        TensorShape::ndarray(dims, DataType::F32)
    }

    #[test]
    fn test_realloc_reuses_owned_buffer() {
        let device = MockDevice::new();
        let mut tensor = Tensor::new("y", shape(&[1, 4, 4, 4]));
        tensor.realloc_buffer(&device).unwrap();
        let first = *tensor.buffer();
        assert!(tensor.owns_buffer());
        assert_eq!(first.size, 256);

        tensor.realloc_buffer(&device).unwrap();
        assert_eq!(*tensor.buffer(), first);
        assert_eq!(device.stats().live_buffers, 1);
    }

    #[test]
    fn test_bind_shared_releases_owned_buffer() {
        let device = MockDevice::new();
        let mut tensor = Tensor::new("y", shape(&[1, 4, 4, 4]));
        tensor.realloc_buffer(&device).unwrap();
        assert_eq!(device.stats().live_buffers, 1);

        let shared = BufferDesc::new(0xdead_0000, 1024);
        tensor.bind_shared(&device, shared, 3);
        assert_eq!(device.stats().live_buffers, 0);
        assert!(!tensor.owns_buffer());
        assert_eq!(tensor.buffer_addr(), 0xdead_0000);
        assert_eq!(tensor.fusion_group(), Some(3));
    }

    #[test]
    fn test_realloc_detaches_shared_buffer() {
        let device = MockDevice::new();
        let shared = BufferDesc::new(0xbeef_0000, 4096);
        let mut tensor = Tensor::new("y", shape(&[1, 2, 2, 2]));
        tensor.bind_shared(&device, shared, 9);

        tensor.realloc_buffer(&device).unwrap();
        assert_ne!(tensor.buffer_addr(), shared.addr);
        assert!(tensor.owns_buffer());
        assert_eq!(tensor.fusion_group(), None);
    }

    #[test]
    fn test_free_borrowed_buffer_does_not_touch_device() {
        let device = MockDevice::new();
        let mut tensor =
            Tensor::with_buffer("w", shape(&[4]), BufferDesc::new(0x4000, 16));
        tensor.free_buffer(&device);
        assert!(tensor.buffer().is_null());
        assert_eq!(device.stats().free_calls, 0);
    }
}
