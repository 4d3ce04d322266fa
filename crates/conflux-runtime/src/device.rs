//! Device memory on wgpu storage buffers.

use crate::error::{Result, RuntimeError};
use conflux_core::layout::relayout_host;
use conflux_core::{BufferDesc, DataConverter, Device, DeviceProps, StreamHandle, TensorShape};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// First synthetic address handed out. Address 0 stays the null buffer.
const BASE_ADDR: u64 = 0x1_0000;
/// Spacing of synthetic addresses.
const ADDR_ALIGN: u64 = 256;

#[derive(Debug)]
struct Allocation {
    buffer: wgpu::Buffer,
    /// Bytes requested by the caller; the wgpu buffer may be larger.
    size: u64,
    temporary: bool,
}

#[derive(Debug)]
struct BufferTable {
    next_addr: u64,
    buffers: HashMap<u64, Allocation>,
}

/// A [`Device`] whose buffers are wgpu storage buffers.
///
/// Kernels see buffers as synthetic addresses; [`WgpuDevice::buffer`] maps
/// an address back to the wgpu buffer for primitives that bind it. The
/// queue is the device's single ordered stream.
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    props: DeviceProps,
    table: Mutex<BufferTable>,
}

impl WgpuDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, props: DeviceProps) -> Self {
        Self {
            device,
            queue,
            props,
            table: Mutex::new(BufferTable {
                next_addr: BASE_ADDR,
                buffers: HashMap::new(),
            }),
        }
    }

    pub fn wgpu_device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    /// The wgpu buffer behind `addr`.
    pub fn buffer(&self, addr: u64) -> Option<wgpu::Buffer> {
        self.table.lock().buffers.get(&addr).map(|a| a.buffer.clone())
    }

    /// Number of live buffers, temporary ones included.
    pub fn buffer_count(&self) -> usize {
        self.table.lock().buffers.len()
    }

    /// Number of live temporary buffers.
    pub fn tmp_in_use(&self) -> usize {
        self.table
            .lock()
            .buffers
            .values()
            .filter(|a| a.temporary)
            .count()
    }

    fn create(&self, bytes: u64, temporary: bool) -> Result<BufferDesc> {
        let max = self.device.limits().max_buffer_size;
        // copies and queue writes work in 4-byte units
        let padded = bytes.max(1).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if padded > max {
            return Err(RuntimeError::AllocationError(format!(
                "{bytes} bytes exceeds the device limit of {max}"
            )));
        }

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(if temporary { "conflux_tmp" } else { "conflux_buffer" }),
            size: padded,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let mut table = self.table.lock();
        let addr = table.next_addr;
        table.next_addr += padded.next_multiple_of(ADDR_ALIGN);
        table.buffers.insert(
            addr,
            Allocation {
                buffer,
                size: bytes,
                temporary,
            },
        );
        trace!(addr, bytes, temporary, "created buffer");
        Ok(BufferDesc::new(addr, bytes))
    }

    fn release(&self, desc: &mut BufferDesc, temporary: bool) {
        let removed = {
            let mut table = self.table.lock();
            match table.buffers.get(&desc.addr) {
                Some(a) if a.temporary == temporary => table.buffers.remove(&desc.addr),
                _ => None,
            }
        };
        match removed {
            Some(allocation) => allocation.buffer.destroy(),
            None if !desc.is_null() => {
                debug!(addr = desc.addr, temporary, "release of unknown buffer ignored")
            }
            None => {}
        }
        *desc = BufferDesc::null();
    }

    /// Write `data` at the start of the buffer behind `desc`.
    pub fn upload(&self, desc: &BufferDesc, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(desc.addr).ok_or(RuntimeError::UnknownBuffer(desc.addr))?;
        let capacity = buffer.size();
        if data.len() as u64 > capacity {
            return Err(RuntimeError::TransferError(format!(
                "{} bytes do not fit in buffer {:#x} of {capacity}",
                data.len(),
                desc.addr
            )));
        }

        let aligned = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT) as usize;
        if aligned == data.len() {
            self.queue.write_buffer(&buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(aligned, 0);
            self.queue.write_buffer(&buffer, 0, &padded);
        }
        Ok(())
    }

    /// Read back the contents of the buffer behind `desc`, as many bytes as
    /// were requested when it was allocated.
    ///
    /// Blocks until all work submitted to the queue has finished.
    pub fn download(&self, desc: &BufferDesc) -> Result<Vec<u8>> {
        let (buffer, len) = self
            .table
            .lock()
            .buffers
            .get(&desc.addr)
            .map(|a| (a.buffer.clone(), a.size))
            .ok_or(RuntimeError::UnknownBuffer(desc.addr))?;
        let size = buffer.size();

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("conflux_download_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("conflux_download_copy"),
            });
        encoder.copy_buffer_to_buffer(&buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| RuntimeError::WgpuError(format!("GPU poll failed during download: {e:?}")))?;

        receiver
            .recv()
            .map_err(|e| RuntimeError::TransferError(format!("Map recv failed: {e}")))??;

        let mut data = slice.get_mapped_range().to_vec();
        staging.unmap();
        data.truncate(len as usize);
        Ok(data)
    }

    fn check_fits(&self, dst: &BufferDesc, dst_shape: &TensorShape) -> Result<()> {
        let size = self
            .table
            .lock()
            .buffers
            .get(&dst.addr)
            .map(|a| a.size)
            .ok_or(RuntimeError::UnknownBuffer(dst.addr))?;
        let needed = dst_shape.bytes_including_padding();
        if size < needed {
            return Err(RuntimeError::TransferError(format!(
                "buffer {:#x} holds {size} bytes, {dst_shape} needs {needed}",
                dst.addr
            )));
        }
        Ok(())
    }
}

impl Device for WgpuDevice {
    fn realloc(&self, bytes: u64, desc: &mut BufferDesc) -> conflux_core::Result<()> {
        let reusable = self
            .table
            .lock()
            .buffers
            .get(&desc.addr)
            .is_some_and(|a| !a.temporary && a.size >= bytes);
        if reusable {
            return Ok(());
        }

        let fresh = self.create(bytes, false).inspect_err(|err| {
            error!(bytes, %err, "buffer allocation failed");
        })?;
        if !desc.is_null() {
            self.release(desc, false);
        }
        *desc = fresh;
        Ok(())
    }

    fn free(&self, desc: &mut BufferDesc) {
        self.release(desc, false);
    }

    fn alloc_tmp(&self, bytes: u64) -> conflux_core::Result<BufferDesc> {
        Ok(self.create(bytes, true)?)
    }

    fn free_tmp(&self, desc: &mut BufferDesc) {
        self.release(desc, true);
    }

    fn converter(&self) -> &dyn DataConverter {
        self
    }

    fn stream(&self) -> StreamHandle {
        StreamHandle::default()
    }

    fn properties(&self) -> &DeviceProps {
        &self.props
    }
}

impl DataConverter for WgpuDevice {
    fn convert(
        &self,
        dst: &BufferDesc,
        dst_shape: &TensorShape,
        src: &BufferDesc,
        src_shape: &TensorShape,
    ) -> conflux_core::Result<()> {
        self.check_fits(dst, dst_shape)?;
        let staged = self.download(src)?;
        let converted = relayout_host(&staged, src_shape, dst_shape)?;
        Ok(self.upload(dst, &converted)?)
    }

    fn convert_from_host(
        &self,
        dst: &BufferDesc,
        dst_shape: &TensorShape,
        src: &[u8],
        src_shape: &TensorShape,
    ) -> conflux_core::Result<()> {
        self.check_fits(dst, dst_shape)?;
        let converted = relayout_host(src, src_shape, dst_shape)?;
        Ok(self.upload(dst, &converted)?)
    }
}

impl Drop for WgpuDevice {
    fn drop(&mut self) {
        for (_, allocation) in self.table.get_mut().buffers.drain() {
            allocation.buffer.destroy();
        }
    }
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("name", &self.props.name)
            .field("buffers", &self.buffer_count())
            .finish_non_exhaustive()
    }
}
