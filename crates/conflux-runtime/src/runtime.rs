//! Runtime initialization and GPU device management.

use crate::device::WgpuDevice;
use crate::error::{Result, RuntimeError};
use conflux_core::DeviceProps;
use std::sync::Arc;
use tracing::info;

/// Adapter selection knobs.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
    /// Only accept a software adapter.
    pub force_fallback_adapter: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::all(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

/// Owns the wgpu device and queue kernels run on.
///
/// # Example
/// ```no_run
/// # use conflux_runtime::Runtime;
/// # use conflux_core::DeviceContext;
/// # use std::sync::Arc;
/// #[pollster::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let runtime = Runtime::new().await?;
///     let ctx = DeviceContext::new(Arc::new(runtime.device()));
///     // Build kernels on `ctx`...
///     Ok(())
/// }
/// ```
pub struct Runtime {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
}

impl Runtime {
    /// Initialize the runtime with the default GPU adapter.
    ///
    /// # Errors
    /// Returns an error if no suitable GPU is found or initialization fails.
    pub async fn new() -> Result<Self> {
        Self::with_options(&RuntimeOptions::default()).await
    }

    pub async fn with_options(options: &RuntimeOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: options.backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                compatible_surface: None,
                force_fallback_adapter: options.force_fallback_adapter,
            })
            .await
            .map_err(|e| {
                RuntimeError::InitError(format!("Failed to find suitable GPU adapter: {e}"))
            })?;

        Self::with_adapter(&adapter).await
    }

    /// Initialize the runtime with a specific GPU adapter.
    ///
    /// # Errors
    /// Returns an error if device initialization fails.
    pub async fn with_adapter(adapter: &wgpu::Adapter) -> Result<Self> {
        let adapter_info = adapter.get_info();
        let limits = adapter.limits();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("conflux"),
                required_limits: limits.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| RuntimeError::InitError(format!("Failed to create device: {e}")))?;

        info!(adapter = %adapter_info.name, backend = ?adapter_info.backend, "GPU device ready");

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Properties reported to primitives.
    ///
    /// wgpu exposes no compute capability, so it is reported as `0.0`;
    /// only variants without a capability floor select on this device.
    pub fn properties(&self) -> DeviceProps {
        DeviceProps {
            name: self.adapter_info.name.clone(),
            compute_capability: (0, 0),
            multiprocessor_count: 0,
            shared_mem_per_block: self.limits.max_compute_workgroup_storage_size as usize,
        }
    }

    /// A device handle sharing this runtime's device and queue.
    ///
    /// Each handle tracks its own buffers.
    pub fn device(&self) -> WgpuDevice {
        WgpuDevice::new(
            Arc::clone(&self.device),
            Arc::clone(&self.queue),
            self.properties(),
        )
    }
}
