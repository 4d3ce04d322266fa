//! Per-invocation scratch memory.

use conflux_core::{AlgoParams, ConvParams, ConvPrimitives, DataType, Device, Error, Result, ScopedBuffer};
use std::sync::Arc;
use tracing::error;

/// Ask the primitive library how much scratch it needs and acquire it.
///
/// The returned guard frees the buffer when dropped, so callers keep it
/// alive exactly as long as the invocation. A zero-byte answer produces a
/// null guard without touching the allocator.
pub fn acquire_workspace(
    device: &Arc<dyn Device>,
    primitives: &dyn ConvPrimitives,
    dtype: DataType,
    params: &ConvParams,
    algo: &AlgoParams,
    cap: u64,
) -> Result<ScopedBuffer> {
    let requested = primitives
        .workspace_size(dtype, params, algo, cap)
        .map_err(|err| match err {
            Error::WorkspaceQuery(_) | Error::WorkspaceSizing { .. } => err,
            other => Error::WorkspaceQuery(other.to_string()),
        })?;

    if requested > cap {
        error!(requested, cap, kernel_id = algo.kernel_id, "workspace exceeds cap");
        return Err(Error::WorkspaceSizing { requested, cap });
    }

    ScopedBuffer::temporary(Arc::clone(device), requested).inspect_err(|err| {
        error!(requested, %err, "workspace allocation failed");
    })
}
