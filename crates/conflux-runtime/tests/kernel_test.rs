//! Convolution kernels running their buffer management on a real device.
//!
//! The primitive library is the recording mock; allocation, weight updates
//! and fusion buffers go through wgpu.

mod common;

use common::{f32_bytes, gpu_device};
use conflux_core::mock::MockPrimitives;
use conflux_core::{
    DataType, Device, DeviceContext, Kernel, KernelExecContext, Tensor, TensorShape, WeightPayload,
};
use conflux_kernels::{ConvConfig, ConvKernel, ConvVariant, FuseInfo};
use std::sync::Arc;

fn operand(device: &dyn Device, name: &str, dims: &[usize]) -> Tensor {
    let mut tensor = Tensor::new(name, TensorShape::ndarray(dims, DataType::F32));
    tensor.realloc_buffer(device).unwrap();
    tensor
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_fp32_conv_on_wgpu_device() {
    let device = gpu_device().await;
    let ctx = Arc::new(DeviceContext::new(device.clone()));
    let prims = Arc::new(MockPrimitives::new(4096));
    let config = ConvConfig {
        pads: [1, 1, 1, 1],
        ..Default::default()
    };
    let mut kernel = ConvKernel::for_device("conv", DataType::F32, config, ctx, prims.clone()).unwrap();
    assert_eq!(kernel.variant(), ConvVariant::Direct);

    let inputs = vec![
        operand(&*device, "x", &[1, 16, 32, 32]),
        operand(&*device, "w", &[32, 16, 3, 3]),
    ];
    let output = Tensor::new("y", TensorShape::ndarray(&[0], DataType::F32));
    let mut exec = KernelExecContext::new(inputs, vec![output]);

    kernel.execute(&mut exec).unwrap();

    let y = exec.output(0).unwrap();
    assert_eq!(y.shape().dims(), &[1, 32, 32, 32]);
    assert!(device.buffer(y.buffer_addr()).is_some());
    assert_eq!(device.tmp_in_use(), 0);
    assert_eq!(prims.last_forward().unwrap().workspace.size, 4096);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_weight_update_from_host_on_wgpu_device() {
    let device = gpu_device().await;
    let ctx = Arc::new(DeviceContext::new(device.clone()));
    let prims = Arc::new(MockPrimitives::new(0));
    let mut kernel =
        ConvKernel::for_device("conv", DataType::F32, ConvConfig::default(), ctx, prims.clone())
            .unwrap();

    let inputs = vec![
        operand(&*device, "x", &[1, 4, 4, 4]),
        operand(&*device, "w", &[2, 4, 1, 1]),
    ];
    let output = Tensor::new("y", TensorShape::ndarray(&[0], DataType::F32));
    let mut exec = KernelExecContext::new(inputs, vec![output]);

    let weights: Vec<f32> = (0..8).map(|v| v as f32 * 0.5).collect();
    kernel
        .update_weight(&exec, WeightPayload::Host(&f32_bytes(&weights)))
        .unwrap();
    kernel.execute(&mut exec).unwrap();

    assert_eq!(prims.relayout_calls(), 1);
    let (_, staged) = prims.relayouts()[0];
    assert_eq!(device.download(&staged).unwrap(), f32_bytes(&weights));
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_concat_members_share_wgpu_buffer() {
    let device = gpu_device().await;
    let ctx = Arc::new(DeviceContext::new(device.clone()));
    let prims = Arc::new(MockPrimitives::new(0));

    let mut outputs = Vec::new();
    for (i, offset) in [0usize, 32].into_iter().enumerate() {
        let config = ConvConfig {
            fuse: FuseInfo::concat(7, offset, 64),
            ..Default::default()
        };
        let mut kernel =
            ConvKernel::for_device(format!("branch_{i}"), DataType::F32, config, ctx.clone(), prims.clone())
                .unwrap();
        let inputs = vec![
            operand(&*device, "x", &[1, 8, 4, 4]),
            operand(&*device, "w", &[32, 8, 1, 1]),
        ];
        let output = Tensor::new("y", TensorShape::ndarray(&[0], DataType::F32));
        let mut exec = KernelExecContext::new(inputs, vec![output]);
        kernel.execute(&mut exec).unwrap();
        outputs.push(*exec.output(0).unwrap().buffer());
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(ctx.fusion_group_count(), 1);
    assert_eq!(outputs[0].size, 64 * 4 * 4 * 4);
}
