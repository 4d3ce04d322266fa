//! wgpu back-end for Conflux kernels.
//!
//! Provides the device side of the kernel contracts on top of `wgpu`:
//! 1. **GPU initialization** - [`Runtime`] picks an adapter and creates the device and queue
//! 2. **Buffer management** - [`WgpuDevice`] implements [`conflux_core::Device`] on storage buffers
//! 3. **Layout conversion** - [`WgpuDevice`] implements [`conflux_core::DataConverter`] by
//!    staging data through host memory
//!
//! # Example
//!
//! ```no_run
//! use conflux_core::{DeviceContext, Device};
//! use conflux_runtime::Runtime;
//! use std::sync::Arc;
//!
//! #[pollster::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::new().await?;
//!     let device = Arc::new(runtime.device());
//!     println!("running on {}", device.properties().name);
//!
//!     let ctx = Arc::new(DeviceContext::new(device));
//!     // Build kernels sharing `ctx`...
//!     Ok(())
//! }
//! ```

mod device;
mod error;
mod runtime;

pub use device::WgpuDevice;
pub use error::{Result, RuntimeError};
pub use runtime::{Runtime, RuntimeOptions};
