//! End-to-end invocations of the convolution kernel against mock collaborators.

mod common;

use common::{same_padding, Harness};
use conflux_core::{ConcatFuse, Error, Kernel};
use conflux_kernels::{ConvConfig, ExecState, FuseInfo, KernelOptions, DEFAULT_WORKSPACE_CAP};

#[test]
fn test_unfused_conv_allocates_output_and_releases_workspace() {
    let h = Harness::new(64 * 1024);
    let mut kernel = h.kernel("conv_a", same_padding());
    let mut ctx = h.exec_context(&[1, 16, 32, 32], &[32, 16, 3, 3]);
    let before = h.device.stats();

    kernel.execute(&mut ctx).unwrap();

    let output = ctx.output(0).unwrap();
    assert_eq!(output.shape().dims(), &[1, 32, 32, 32]);
    assert!(output.owns_buffer());
    assert_eq!(output.buffer().size, 32 * 32 * 32 * 2);

    let after = h.device.stats();
    // output and cached weight
    assert_eq!(after.fresh_allocations - before.fresh_allocations, 2);
    assert_eq!(after.tmp_alloc_calls, 1);
    assert_eq!(after.live_tmp, 0);

    let record = h.prims.last_forward().unwrap();
    assert_eq!(record.output, output.buffer_addr());
    assert_eq!(record.input, ctx.input(0).unwrap().buffer_addr());
    assert_eq!(record.weight, kernel.weight_cache().converted().addr);
    assert_eq!(record.workspace.size, 64 * 1024);
    assert_eq!(record.bias, None);
    assert_eq!(record.fuse.concat, None);
    assert_eq!(kernel.state(), ExecState::Done);
}

#[test]
fn test_concat_group_members_share_one_buffer() {
    let h = Harness::new(0);
    let mut first = h.kernel(
        "branch_0",
        ConvConfig {
            fuse: FuseInfo::concat(7, 0, 64),
            ..Default::default()
        },
    );
    let mut second = h.kernel(
        "branch_1",
        ConvConfig {
            fuse: FuseInfo::concat(7, 32, 64),
            ..Default::default()
        },
    );
    let mut ctx_a = h.exec_context(&[1, 16, 8, 8], &[32, 16, 1, 1]);
    let mut ctx_b = h.exec_context(&[1, 16, 8, 8], &[32, 16, 1, 1]);

    first.execute(&mut ctx_a).unwrap();
    let first_fwd = h.prims.last_forward().unwrap();
    second.execute(&mut ctx_b).unwrap();
    let second_fwd = h.prims.last_forward().unwrap();

    let shared = ctx_a.output(0).unwrap().buffer();
    assert_eq!(shared, ctx_b.output(0).unwrap().buffer());
    assert_eq!(h.ctx.fusion_group_count(), 1);
    assert_eq!(h.ctx.fusion_buffer(7), Some(*shared));
    assert_eq!(h.device.buffer_size(shared.addr), Some(64 * 8 * 8 * 2));

    assert_eq!(first_fwd.output, second_fwd.output);
    assert_eq!(
        first_fwd.fuse.concat,
        Some(ConcatFuse {
            channel_offset: 0,
            channel_stride: 64,
        })
    );
    assert_eq!(
        second_fwd.fuse.concat,
        Some(ConcatFuse {
            channel_offset: 32,
            channel_stride: 64,
        })
    );
}

#[test]
fn test_concat_group_total_padded_to_alignment() {
    let h = Harness::new(0);
    let mut kernel = h.kernel(
        "branch",
        ConvConfig {
            fuse: FuseInfo::concat(11, 0, 60),
            ..Default::default()
        },
    );
    let mut ctx = h.exec_context(&[1, 8, 4, 4], &[30, 8, 1, 1]);

    kernel.execute(&mut ctx).unwrap();

    let shared = h.ctx.fusion_buffer(11).unwrap();
    assert_eq!(shared.size, 64 * 4 * 4 * 2);
}

#[test]
fn test_repeat_invocations_reuse_fusion_buffer() {
    let h = Harness::new(0);
    let mut kernel = h.kernel(
        "branch",
        ConvConfig {
            fuse: FuseInfo::concat(3, 0, 16),
            ..Default::default()
        },
    );
    let mut ctx = h.exec_context(&[1, 8, 4, 4], &[16, 8, 1, 1]);

    kernel.execute(&mut ctx).unwrap();
    let allocations = h.device.stats().fresh_allocations;
    kernel.execute(&mut ctx).unwrap();
    kernel.execute(&mut ctx).unwrap();

    assert_eq!(h.device.stats().fresh_allocations, allocations);
    assert_eq!(h.prims.forward_calls(), 3);
}

#[test]
fn test_workspace_over_cap_fails_before_launch() {
    let h = Harness::new(4096);
    let mut kernel = h
        .kernel("conv_c", same_padding())
        .with_options(KernelOptions {
            workspace_cap: 1024,
        });
    let mut ctx = h.exec_context(&[1, 16, 32, 32], &[32, 16, 3, 3]);

    let err = kernel.execute(&mut ctx).unwrap_err();

    assert!(matches!(
        err,
        Error::WorkspaceSizing {
            requested: 4096,
            cap: 1024
        }
    ));
    assert_eq!(h.prims.forward_calls(), 0);
    assert_eq!(h.device.stats().tmp_alloc_calls, 0);
    assert_eq!(kernel.state(), ExecState::Error);
}

#[test]
fn test_default_cap_is_eight_gib() {
    let h = Harness::new(DEFAULT_WORKSPACE_CAP + 1);
    let mut kernel = h.kernel("huge", same_padding());
    let mut ctx = h.exec_context(&[1, 16, 8, 8], &[16, 16, 3, 3]);

    let err = kernel.execute(&mut ctx).unwrap_err();
    assert!(err.is_workspace_sizing());

    h.prims.set_workspace_bytes(DEFAULT_WORKSPACE_CAP);
    kernel.execute(&mut ctx).unwrap();
    assert_eq!(h.device.stats().live_tmp, 0);
}

#[test]
fn test_bias_and_jit_are_passed_through() {
    let h = Harness::new(0);
    let config = ConvConfig {
        bias_term: true,
        jit: Some(conflux_core::JitKernel {
            module: "conv_module".to_string(),
            function: "conv_fn".to_string(),
        }),
        algo: conflux_core::AlgoParams {
            kernel_id: 42,
            kernel_name: "nhwc_fp16_conv2d".to_string(),
            splitk: 2,
            splitf: 1,
        },
        ..same_padding()
    };
    let mut kernel = h.kernel("conv_bias", config);
    let mut ctx = h.exec_context(&[1, 8, 4, 4], &[8, 8, 3, 3]);
    let (mut inputs, outputs) = ctx.into_parts();
    inputs.push(h.tensor("b", &[8]));
    let bias_addr = inputs[2].buffer_addr();
    ctx = conflux_core::KernelExecContext::new(inputs, outputs);

    kernel.execute(&mut ctx).unwrap();

    let record = h.prims.last_forward().unwrap();
    assert_eq!(record.bias, Some(bias_addr));
    assert_eq!(record.algo.kernel_id, 42);
    assert_eq!(record.algo.splitk, 2);
    assert_eq!(record.jit.map(|j| j.function), Some("conv_fn".to_string()));
}

#[test]
fn test_before_execute_binds_without_launch() {
    let h = Harness::new(1024);
    let mut kernel = h.kernel("conv", same_padding());
    let mut ctx = h.exec_context(&[2, 8, 6, 6], &[16, 8, 3, 3]);

    kernel.before_execute(&mut ctx).unwrap();

    assert_eq!(ctx.output(0).unwrap().shape().dims(), &[2, 16, 6, 6]);
    assert!(!ctx.output(0).unwrap().buffer().is_null());
    assert_eq!(kernel.state(), ExecState::OutputsBound);
    assert_eq!(h.prims.forward_calls(), 0);
    assert_eq!(h.device.stats().tmp_alloc_calls, 0);
}
