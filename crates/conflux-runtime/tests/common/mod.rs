//! Shared helpers for the GPU tests.
//!
//! Every test here needs a GPU adapter. Run with:
//! ```sh
//! cargo nextest run -p conflux-runtime --run-ignored=all
//! ```

#![allow(dead_code)]

use conflux_runtime::{Runtime, WgpuDevice};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A device on the default adapter.
pub async fn gpu_device() -> Arc<WgpuDevice> {
    init_tracing();
    let runtime = Runtime::new().await.expect("GPU adapter");
    Arc::new(runtime.device())
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}
