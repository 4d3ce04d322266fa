//! Per-device context shared by the kernels of one session.

use crate::buffer::BufferDesc;
use crate::device::Device;
use crate::types::TensorShape;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

/// Identifier of a fusion group (the edge id of the concat the group feeds).
pub type GroupId = u64;

/// Device handle plus the state that lives as long as the device session.
///
/// The fusion-group table maps a group id to the one buffer every member of
/// that group writes into. Entries are created on the first member's
/// allocation request and released when the context is dropped.
pub struct DeviceContext {
    device: Arc<dyn Device>,
    fusion_buffers: Mutex<HashMap<GroupId, BufferDesc>>,
}

impl DeviceContext {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            fusion_buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Shared buffer already allocated for `group`, if any.
    pub fn fusion_buffer(&self, group: GroupId) -> Option<BufferDesc> {
        self.fusion_buffers.lock().get(&group).copied()
    }

    /// Return the buffer for `group`, allocating it with `shape` if the group
    /// has none yet. The boolean is `true` when this call allocated.
    ///
    /// The table lock is held across the allocation so two members racing on
    /// the same group still produce a single buffer. A group buffer is never
    /// reallocated: members may already have been bound to it, so a later
    /// request that needs more bytes than it holds fails with
    /// [`Error::Shape`].
    pub fn fusion_buffer_or_alloc(
        &self,
        group: GroupId,
        shape: &TensorShape,
    ) -> Result<(BufferDesc, bool)> {
        let needed = shape.bytes_including_padding();
        let mut table = self.fusion_buffers.lock();
        if let Some(desc) = table.get(&group) {
            if desc.size < needed {
                error!(group, held = desc.size, needed, "fusion buffer too small");
                return Err(Error::Shape(format!(
                    "fusion group {group} holds {} bytes, {shape} needs {needed}",
                    desc.size
                )));
            }
            return Ok((*desc, false));
        }
        let mut desc = BufferDesc::null();
        self.device.realloc_shape(shape, &mut desc).inspect_err(|err| {
            error!(group, bytes = needed, %err, "fusion buffer allocation failed");
        })?;
        table.insert(group, desc);
        Ok((desc, true))
    }

    /// Number of fusion groups holding a buffer.
    pub fn fusion_group_count(&self) -> usize {
        self.fusion_buffers.lock().len()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        for (_, mut desc) in self.fusion_buffers.get_mut().drain() {
            self.device.free(&mut desc);
        }
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device.properties().name)
            .field("fusion_groups", &self.fusion_group_count())
            .finish()
    }
}
