//! In-memory collaborators for tests.
//!
//! `MockDevice` hands out synthetic addresses and tracks every live buffer,
//! so tests can assert that nothing leaks. `MockPrimitives` records what the
//! kernel asked of the primitive library. Both support fault injection.

use crate::buffer::BufferDesc;
use crate::device::{DataConverter, Device, DeviceProps, StreamHandle};
use crate::primitive::{AlgoParams, ConvParams, ConvPrimitives, ForwardArgs, FuseParams, JitKernel};
use crate::types::{align_up, DataType, TensorShape};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

const BASE_ADDR: u64 = 0x1000_0000;
const ADDR_ALIGN: usize = 256;

/// Counters kept by [`MockDevice`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Calls to `realloc`, successful or not.
    pub realloc_calls: usize,
    /// `realloc` calls that created a new buffer.
    pub fresh_allocations: usize,
    pub free_calls: usize,
    pub tmp_alloc_calls: usize,
    pub tmp_free_calls: usize,
    pub live_buffers: usize,
    pub live_tmp: usize,
    pub convert_calls: usize,
    pub host_convert_calls: usize,
}

#[derive(Debug, Default)]
struct DeviceState {
    next_addr: u64,
    buffers: HashMap<u64, u64>,
    tmp: HashMap<u64, u64>,
    stats: DeviceStats,
    realloc_countdown: Option<usize>,
    fail_alloc_tmp: bool,
    fail_convert: bool,
    last_host_payload: Option<Vec<u8>>,
}

impl DeviceState {
    fn next_desc(&mut self, bytes: u64) -> BufferDesc {
        let addr = self.next_addr;
        self.next_addr += align_up(bytes.max(1) as usize, ADDR_ALIGN) as u64;
        BufferDesc::new(addr, bytes)
    }
}

/// A device whose memory is bookkeeping only.
#[derive(Debug)]
pub struct MockDevice {
    state: Mutex<DeviceState>,
    props: DeviceProps,
}

impl MockDevice {
    /// A device reporting compute capability 8.0.
    pub fn new() -> Self {
        Self::with_props(DeviceProps {
            name: "mock-device".to_string(),
            compute_capability: (8, 0),
            multiprocessor_count: 80,
            shared_mem_per_block: 48 * 1024,
        })
    }

    pub fn with_props(props: DeviceProps) -> Self {
        Self {
            state: Mutex::new(DeviceState {
                next_addr: BASE_ADDR,
                ..Default::default()
            }),
            props,
        }
    }

    pub fn stats(&self) -> DeviceStats {
        self.state.lock().stats.clone()
    }

    /// Size of a live regular buffer.
    pub fn buffer_size(&self, addr: u64) -> Option<u64> {
        self.state.lock().buffers.get(&addr).copied()
    }

    pub fn is_live(&self, addr: u64) -> bool {
        let state = self.state.lock();
        state.buffers.contains_key(&addr) || state.tmp.contains_key(&addr)
    }

    /// Make the `nth` `realloc` call from now fail (1 = the next one).
    pub fn fail_realloc_on(&self, nth: usize) {
        self.state.lock().realloc_countdown = Some(nth.max(1));
    }

    pub fn set_fail_alloc_tmp(&self, fail: bool) {
        self.state.lock().fail_alloc_tmp = fail;
    }

    pub fn set_fail_convert(&self, fail: bool) {
        self.state.lock().fail_convert = fail;
    }

    /// Bytes passed to the last `convert_from_host` call.
    pub fn last_host_payload(&self) -> Option<Vec<u8>> {
        self.state.lock().last_host_payload.clone()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for MockDevice {
    fn realloc(&self, bytes: u64, desc: &mut BufferDesc) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.realloc_calls += 1;
        if let Some(remaining) = state.realloc_countdown {
            if remaining <= 1 {
                state.realloc_countdown = None;
                return Err(Error::Allocation(format!(
                    "injected failure allocating {bytes} bytes"
                )));
            }
            state.realloc_countdown = Some(remaining - 1);
        }

        if let Some(&size) = state.buffers.get(&desc.addr) {
            if size >= bytes {
                return Ok(());
            }
            state.buffers.remove(&desc.addr);
            state.stats.live_buffers -= 1;
        }

        let fresh = state.next_desc(bytes);
        state.buffers.insert(fresh.addr, bytes);
        state.stats.fresh_allocations += 1;
        state.stats.live_buffers += 1;
        *desc = fresh;
        Ok(())
    }

    fn free(&self, desc: &mut BufferDesc) {
        let mut state = self.state.lock();
        state.stats.free_calls += 1;
        if state.buffers.remove(&desc.addr).is_some() {
            state.stats.live_buffers -= 1;
        }
        *desc = BufferDesc::null();
    }

    fn alloc_tmp(&self, bytes: u64) -> Result<BufferDesc> {
        let mut state = self.state.lock();
        state.stats.tmp_alloc_calls += 1;
        if state.fail_alloc_tmp {
            return Err(Error::Allocation(format!(
                "injected failure allocating {bytes} temporary bytes"
            )));
        }
        let desc = state.next_desc(bytes);
        state.tmp.insert(desc.addr, bytes);
        state.stats.live_tmp += 1;
        Ok(desc)
    }

    fn free_tmp(&self, desc: &mut BufferDesc) {
        let mut state = self.state.lock();
        state.stats.tmp_free_calls += 1;
        if state.tmp.remove(&desc.addr).is_some() {
            state.stats.live_tmp -= 1;
        }
        *desc = BufferDesc::null();
    }

    fn converter(&self) -> &dyn DataConverter {
        self
    }

    fn stream(&self) -> StreamHandle {
        StreamHandle(1)
    }

    fn properties(&self) -> &DeviceProps {
        &self.props
    }
}

impl DataConverter for MockDevice {
    fn convert(
        &self,
        dst: &BufferDesc,
        dst_shape: &TensorShape,
        _src: &BufferDesc,
        _src_shape: &TensorShape,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.convert_calls += 1;
        if state.fail_convert {
            return Err(Error::Conversion("injected device conversion failure".to_string()));
        }
        check_fits(&state, dst, dst_shape)
    }

    fn convert_from_host(
        &self,
        dst: &BufferDesc,
        dst_shape: &TensorShape,
        src: &[u8],
        _src_shape: &TensorShape,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.host_convert_calls += 1;
        if state.fail_convert {
            return Err(Error::Conversion("injected host conversion failure".to_string()));
        }
        check_fits(&state, dst, dst_shape)?;
        state.last_host_payload = Some(src.to_vec());
        Ok(())
    }
}

fn check_fits(state: &DeviceState, dst: &BufferDesc, dst_shape: &TensorShape) -> Result<()> {
    let size = state
        .buffers
        .get(&dst.addr)
        .ok_or_else(|| Error::Conversion(format!("destination {:#x} is not live", dst.addr)))?;
    if *size < dst_shape.bytes_including_padding() {
        return Err(Error::Conversion(format!(
            "destination holds {size} bytes, {dst_shape} needs {}",
            dst_shape.bytes_including_padding()
        )));
    }
    Ok(())
}

/// What the last `forward` call received.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRecord {
    pub dtype: DataType,
    pub stream: StreamHandle,
    pub input: u64,
    pub weight: u64,
    pub output: u64,
    pub bias: Option<u64>,
    pub workspace: BufferDesc,
    pub algo: AlgoParams,
    pub conv: ConvParams,
    pub fuse: FuseParams,
    pub jit: Option<JitKernel>,
}

#[derive(Debug, Default)]
struct PrimitiveState {
    workspace_bytes: u64,
    fail_workspace_query: bool,
    fail_relayout: bool,
    fail_forward: bool,
    relayouts: Vec<(BufferDesc, BufferDesc)>,
    forward_calls: usize,
    last_forward: Option<ForwardRecord>,
}

/// A primitive library that only records calls.
#[derive(Debug, Default)]
pub struct MockPrimitives {
    state: Mutex<PrimitiveState>,
}

impl MockPrimitives {
    /// A library asking for `workspace_bytes` of scratch on every call.
    pub fn new(workspace_bytes: u64) -> Self {
        Self {
            state: Mutex::new(PrimitiveState {
                workspace_bytes,
                ..Default::default()
            }),
        }
    }

    pub fn set_workspace_bytes(&self, bytes: u64) {
        self.state.lock().workspace_bytes = bytes;
    }

    pub fn set_fail_workspace_query(&self, fail: bool) {
        self.state.lock().fail_workspace_query = fail;
    }

    pub fn set_fail_relayout(&self, fail: bool) {
        self.state.lock().fail_relayout = fail;
    }

    pub fn set_fail_forward(&self, fail: bool) {
        self.state.lock().fail_forward = fail;
    }

    pub fn relayout_calls(&self) -> usize {
        self.state.lock().relayouts.len()
    }

    /// `(dst, src)` of every relayout so far.
    pub fn relayouts(&self) -> Vec<(BufferDesc, BufferDesc)> {
        self.state.lock().relayouts.clone()
    }

    pub fn forward_calls(&self) -> usize {
        self.state.lock().forward_calls
    }

    pub fn last_forward(&self) -> Option<ForwardRecord> {
        self.state.lock().last_forward.clone()
    }
}

impl ConvPrimitives for MockPrimitives {
    fn workspace_size(
        &self,
        _dtype: DataType,
        _params: &ConvParams,
        _algo: &AlgoParams,
        _cap: u64,
    ) -> Result<u64> {
        let state = self.state.lock();
        if state.fail_workspace_query {
            return Err(Error::WorkspaceQuery("injected sizing failure".to_string()));
        }
        Ok(state.workspace_bytes)
    }

    fn relayout_weight(
        &self,
        _stream: StreamHandle,
        dst: &BufferDesc,
        src: &BufferDesc,
        _dtype: DataType,
        _params: &ConvParams,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_relayout {
            return Err(Error::Conversion("injected relayout failure".to_string()));
        }
        state.relayouts.push((*dst, *src));
        Ok(())
    }

    fn forward(
        &self,
        _props: &DeviceProps,
        stream: StreamHandle,
        dtype: DataType,
        args: &ForwardArgs<'_>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_forward {
            return Err(Error::Launch("injected launch failure".to_string()));
        }
        state.forward_calls += 1;
        state.last_forward = Some(ForwardRecord {
            dtype,
            stream,
            input: args.input,
            weight: args.weight,
            output: args.output,
            bias: args.bias,
            workspace: args.workspace,
            algo: args.algo.clone(),
            conv: args.conv.clone(),
            fuse: args.fuse.clone(),
            jit: args.jit.cloned(),
        });
        Ok(())
    }
}
