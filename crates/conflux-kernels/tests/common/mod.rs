//! Shared fixtures for the convolution integration tests.
//!
//! Every test runs against `MockDevice` and `MockPrimitives`, so the device
//! memory they hand out is bookkeeping only and leak checks are exact.

#![allow(dead_code)]

use conflux_core::mock::{MockDevice, MockPrimitives};
use conflux_core::{DataFormat, DataType, DeviceContext, KernelExecContext, Tensor, TensorShape};
use conflux_kernels::{ConvConfig, ConvKernel, ConvVariant};
use std::sync::Arc;

/// Install a fmt subscriber once per test binary. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// One mock device, its context and a primitive library.
pub struct Harness {
    pub device: Arc<MockDevice>,
    pub ctx: Arc<DeviceContext>,
    pub prims: Arc<MockPrimitives>,
}

impl Harness {
    /// A harness whose primitive asks for `workspace_bytes` of scratch.
    pub fn new(workspace_bytes: u64) -> Self {
        init_tracing();
        let device = Arc::new(MockDevice::new());
        let ctx = Arc::new(DeviceContext::new(device.clone()));
        Self {
            device,
            ctx,
            prims: Arc::new(MockPrimitives::new(workspace_bytes)),
        }
    }

    /// A half-precision kernel sharing this harness's context.
    pub fn kernel(&self, name: &str, config: ConvConfig) -> ConvKernel {
        ConvKernel::new(
            name,
            ConvVariant::Hmma,
            config,
            self.ctx.clone(),
            self.prims.clone(),
        )
        .expect("valid config")
    }

    /// Allocated `F16`/`Nhwc8` input and weight, plus an unbound output.
    pub fn exec_context(&self, input_dims: &[usize], weight_dims: &[usize]) -> KernelExecContext {
        let inputs = vec![self.tensor("x", input_dims), self.tensor("w", weight_dims)];
        let output = Tensor::new("y", nhwc8(&[0]));
        KernelExecContext::new(inputs, vec![output])
    }

    /// An allocated `F16`/`Nhwc8` tensor.
    pub fn tensor(&self, name: &str, dims: &[usize]) -> Tensor {
        let mut tensor = Tensor::new(name, nhwc8(dims));
        tensor
            .realloc_buffer(&*self.device)
            .expect("mock allocation");
        tensor
    }
}

pub fn nhwc8(dims: &[usize]) -> TensorShape {
    let mut shape = TensorShape::new(dims, DataType::F16, DataFormat::Nhwc8);
    shape.calc_padding();
    shape
}

/// Config with "same" padding for a 3x3 kernel.
pub fn same_padding() -> ConvConfig {
    ConvConfig {
        pads: [1, 1, 1, 1],
        ..Default::default()
    }
}
