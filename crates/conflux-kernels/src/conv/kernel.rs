//! The convolution kernel and its per-invocation pipeline.

use super::config::{ConvConfig, KernelOptions};
use super::fuse::resolve_fuse_params;
use super::output::bind_outputs;
use super::resolve::{infer_output_shape, resolve_conv_params};
use super::variant::ConvVariant;
use super::weight::WeightCache;
use super::workspace::acquire_workspace;
use conflux_core::{
    ConvParams, ConvPrimitives, DataType, DeviceContext, Error, ForwardArgs, FuseParams, Kernel,
    KernelExecContext, Result, WeightPayload,
};
use std::sync::Arc;
use tracing::{debug, error, trace};

const INPUT: usize = 0;
const WEIGHT: usize = 1;
const BIAS: usize = 2;
const OUTPUT: usize = 0;

/// Progress of the current (or last) invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Idle,
    ShapesResolved,
    OutputsBound,
    WeightReady,
    WorkspaceAcquired,
    Invoked,
    Done,
    Error,
}

/// Parameters derived from the live shapes of one invocation.
#[derive(Debug)]
struct Resolved {
    conv: ConvParams,
    fuse: FuseParams,
    bias: Option<u64>,
}

/// A convolution node bound to one device context.
///
/// Each invocation walks the same pipeline: resolve shapes and parameters,
/// bind output buffers, make the relayouted weight available, acquire the
/// workspace and enqueue the primitive. Temporary buffers are held in scope
/// guards, so they are released on every exit path. The weight cache lives
/// as long as the kernel.
pub struct ConvKernel {
    name: String,
    variant: ConvVariant,
    config: ConvConfig,
    options: KernelOptions,
    ctx: Arc<DeviceContext>,
    primitives: Arc<dyn ConvPrimitives>,
    weight: WeightCache,
    state: ExecState,
}

impl ConvKernel {
    pub fn new(
        name: impl Into<String>,
        variant: ConvVariant,
        config: ConvConfig,
        ctx: Arc<DeviceContext>,
        primitives: Arc<dyn ConvPrimitives>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            variant,
            config,
            options: KernelOptions::default(),
            ctx,
            primitives,
            weight: WeightCache::new(),
            state: ExecState::Idle,
        })
    }

    /// Create a kernel for `dtype`, choosing the variant the context's
    /// device supports.
    pub fn for_device(
        name: impl Into<String>,
        dtype: DataType,
        config: ConvConfig,
        ctx: Arc<DeviceContext>,
        primitives: Arc<dyn ConvPrimitives>,
    ) -> Result<Self> {
        let variant = ConvVariant::select(dtype, ctx.device().properties())?;
        Self::new(name, variant, config, ctx, primitives)
    }

    pub fn with_options(mut self, options: KernelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn variant(&self) -> ConvVariant {
        self.variant
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn options(&self) -> &KernelOptions {
        &self.options
    }

    /// State reached by the last invocation.
    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn weight_cache(&self) -> &WeightCache {
        &self.weight
    }

    fn transition(&mut self, next: ExecState) {
        trace!(kernel = %self.name, from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    /// Run one pipeline step, moving to `next` on success and to
    /// [`ExecState::Error`] on failure.
    fn step<T>(&mut self, next: ExecState, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        match f(self) {
            Ok(value) => {
                self.transition(next);
                Ok(value)
            }
            Err(err) => {
                error!(kernel = %self.name, variant = %self.variant, step = ?next, %err, "convolution step failed");
                self.transition(ExecState::Error);
                Err(err)
            }
        }
    }

    fn resolve(&self, ctx: &mut KernelExecContext) -> Result<Resolved> {
        let input = ctx.input(INPUT)?.shape().clone();
        let weight = ctx.input(WEIGHT)?.shape().clone();
        if input.dtype() != self.variant.dtype() {
            return Err(Error::Unsupported(format!(
                "{} runs on {} data, input is {}",
                self.variant,
                self.variant.dtype(),
                input.dtype()
            )));
        }

        let output = infer_output_shape(&input, &weight, &self.config)?;
        ctx.output_mut(OUTPUT)?.set_shape(output.clone());

        let conv = resolve_conv_params(&input, &weight, &output, &self.config)?;
        let fuse = resolve_fuse_params(&self.config.fuse, ctx, &output)?;
        let bias = if self.config.bias_term {
            Some(ctx.input(BIAS)?.buffer_addr())
        } else {
            None
        };
        Ok(Resolved { conv, fuse, bias })
    }

    /// Resolve shapes and bind outputs.
    fn prepare(&mut self, ctx: &mut KernelExecContext) -> Result<Resolved> {
        self.transition(ExecState::Idle);
        let resolved = self.step(ExecState::ShapesResolved, |k| k.resolve(ctx))?;
        self.step(ExecState::OutputsBound, |k| {
            bind_outputs(&k.ctx, &k.config.fuse, ctx.outputs_mut())
        })?;
        Ok(resolved)
    }

    fn run(&mut self, ctx: &mut KernelExecContext) -> Result<()> {
        let resolved = self.prepare(ctx)?;
        let ctx = &*ctx;

        let weight = self.step(ExecState::WeightReady, |k| {
            k.weight.ensure_converted(
                k.ctx.device(),
                k.primitives.as_ref(),
                ctx.input(WEIGHT)?,
                &resolved.conv,
                k.variant.filter_alignment(),
                k.config.is_initializer_weight,
            )
        })?;

        let workspace = self.step(ExecState::WorkspaceAcquired, |k| {
            acquire_workspace(
                k.ctx.device(),
                k.primitives.as_ref(),
                k.variant.dtype(),
                &resolved.conv,
                &k.config.algo,
                k.options.workspace_cap,
            )
        })?;

        self.step(ExecState::Invoked, |k| {
            let args = ForwardArgs {
                input: ctx.input(INPUT)?.buffer_addr(),
                weight: weight.addr(),
                output: ctx.output(OUTPUT)?.buffer_addr(),
                bias: resolved.bias,
                workspace: *workspace.desc(),
                algo: &k.config.algo,
                conv: &resolved.conv,
                fuse: &resolved.fuse,
                jit: k.config.jit.as_ref(),
            };
            let device = k.ctx.device();
            k.primitives
                .forward(device.properties(), device.stream(), k.variant.dtype(), &args)
        })?;

        debug!(
            kernel = %self.name,
            kernel_id = self.config.algo.kernel_id,
            workspace_bytes = workspace.size(),
            "enqueued convolution"
        );

        drop(workspace);
        drop(weight);
        self.transition(ExecState::Done);
        Ok(())
    }
}

impl Kernel for ConvKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn before_execute(&mut self, ctx: &mut KernelExecContext) -> Result<()> {
        self.prepare(ctx).map(|_| ())
    }

    fn update_weight(&mut self, ctx: &KernelExecContext, payload: WeightPayload<'_>) -> Result<()> {
        let shape = ctx.input(WEIGHT)?.shape();
        self.weight
            .request_update(self.ctx.device().as_ref(), shape, payload)?;
        debug!(kernel = %self.name, on_device = payload.is_on_device(), "weight update staged");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(kernel = %self.name, variant = %self.variant))]
    fn execute(&mut self, ctx: &mut KernelExecContext) -> Result<()> {
        self.run(ctx)
    }
}

impl Drop for ConvKernel {
    fn drop(&mut self) {
        self.weight.release(self.ctx.device().as_ref());
    }
}

impl std::fmt::Debug for ConvKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvKernel")
            .field("name", &self.name)
            .field("variant", &self.variant)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
