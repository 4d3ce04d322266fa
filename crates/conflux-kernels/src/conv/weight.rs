//! Weight relayout cache.
//!
//! A convolution keeps at most one copy of its weight in the layout the
//! primitive library prefers. Static weights are converted on first use and
//! reused afterwards; weights produced by an upstream operator are converted
//! into a temporary buffer on every invocation. An explicit update stages new
//! data and forces the next invocation to convert from the staged copy.

use conflux_core::types::align_up;
use conflux_core::{
    BufferDesc, ConvParams, ConvPrimitives, DataFormat, DataType, Device, Error, Result,
    ScopedBuffer, Tensor, TensorShape, WeightPayload,
};
use std::sync::Arc;
use tracing::{debug, error};

/// The converted weight an invocation passes to the primitive.
#[derive(Debug)]
pub enum WeightBinding {
    /// The cache's buffer; stays alive with the kernel.
    Cached(BufferDesc),
    /// Converted for this invocation only; released when dropped.
    Transient(ScopedBuffer),
}

impl WeightBinding {
    pub fn addr(&self) -> u64 {
        match self {
            WeightBinding::Cached(desc) => desc.addr,
            WeightBinding::Transient(buffer) => buffer.addr(),
        }
    }
}

/// Shape of the relayouted weight: the filter count (dim 0) is padded up to
/// the variant's filter alignment.
pub fn relayout_shape(weight: &TensorShape, filter_alignment: usize) -> TensorShape {
    let mut shape = weight.clone();
    let num_flt = shape.dim(0);
    shape.set_padding(0, align_up(num_flt, filter_alignment) - num_flt);
    shape
}

/// Layout new weight data arrives in: plain `F32` with the weight's dims.
fn update_source_shape(weight: &TensorShape) -> TensorShape {
    let mut shape = weight.clone();
    shape.set_dtype(DataType::F32);
    shape.set_format(DataFormat::Ndarray);
    shape.calc_padding();
    shape
}

#[derive(Debug, Default)]
pub struct WeightCache {
    converted: BufferDesc,
    staged: BufferDesc,
    update_requested: bool,
    /// `converted` holds a complete conversion.
    valid: bool,
    conversions: usize,
}

impl WeightCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relayouts performed so far, transient ones included.
    pub fn conversions(&self) -> usize {
        self.conversions
    }

    pub fn update_requested(&self) -> bool {
        self.update_requested
    }

    /// The cached buffer, null until the first static or staged conversion.
    pub fn converted(&self) -> BufferDesc {
        self.converted
    }

    /// Buffer holding the last requested update, null until one arrives.
    pub fn staged(&self) -> BufferDesc {
        self.staged
    }

    /// Make the relayouted weight available for one invocation.
    ///
    /// A pending update wins over everything else: the staged data is
    /// converted into the cache buffer and the request is cleared. Otherwise
    /// a static weight reuses the cache, converting only the first time, and
    /// a dynamic weight is converted into a temporary buffer owned by the
    /// returned binding.
    pub fn ensure_converted(
        &mut self,
        device: &Arc<dyn Device>,
        primitives: &dyn ConvPrimitives,
        weight: &Tensor,
        params: &ConvParams,
        filter_alignment: usize,
        is_initializer: bool,
    ) -> Result<WeightBinding> {
        let shape = relayout_shape(weight.shape(), filter_alignment);
        let dtype = weight.shape().dtype();

        if self.update_requested {
            let staged = self.staged;
            self.convert_into_cache(device.as_ref(), primitives, &staged, &shape, params)?;
            self.update_requested = false;
            debug!(weight = weight.name(), "converted staged weight update");
            return Ok(WeightBinding::Cached(self.converted));
        }

        if is_initializer {
            if !self.valid {
                self.convert_into_cache(device.as_ref(), primitives, weight.buffer(), &shape, params)?;
                debug!(weight = weight.name(), bytes = self.converted.size, "cached static weight");
            }
            return Ok(WeightBinding::Cached(self.converted));
        }

        let transient = ScopedBuffer::temporary(Arc::clone(device), shape.bytes_including_padding())
            .inspect_err(|err| error!(weight = weight.name(), %err, "weight buffer allocation failed"))?;
        primitives
            .relayout_weight(device.stream(), transient.desc(), weight.buffer(), dtype, params)
            .inspect_err(|err| error!(weight = weight.name(), %err, "weight relayout failed"))?;
        self.conversions += 1;
        Ok(WeightBinding::Transient(transient))
    }

    fn convert_into_cache(
        &mut self,
        device: &dyn Device,
        primitives: &dyn ConvPrimitives,
        src: &BufferDesc,
        shape: &TensorShape,
        params: &ConvParams,
    ) -> Result<()> {
        self.valid = false;
        device.realloc_shape(shape, &mut self.converted).inspect_err(|err| {
            error!(shape = %shape, %err, "weight cache allocation failed");
        })?;
        primitives
            .relayout_weight(device.stream(), &self.converted, src, shape.dtype(), params)
            .inspect_err(|err| error!(%err, "weight relayout failed"))?;
        self.valid = true;
        self.conversions += 1;
        Ok(())
    }

    /// Stage new weight data and force the next conversion.
    ///
    /// `weight_shape` is the shape of the kernel's weight input; the payload
    /// holds the same dims as plain `F32`. Host payloads must match that
    /// byte size exactly.
    pub fn request_update(
        &mut self,
        device: &dyn Device,
        weight_shape: &TensorShape,
        payload: WeightPayload<'_>,
    ) -> Result<()> {
        let src_shape = update_source_shape(weight_shape);

        if let WeightPayload::Host(bytes) = payload {
            let expected = src_shape.bytes_including_padding();
            if bytes.len() as u64 != expected {
                return Err(Error::Conversion(format!(
                    "weight update holds {} bytes, {src_shape} needs {expected}",
                    bytes.len()
                )));
            }
        }

        device.realloc_shape(weight_shape, &mut self.staged).inspect_err(|err| {
            error!(shape = %weight_shape, %err, "weight staging allocation failed");
        })?;

        let converter = device.converter();
        let converted = match payload {
            WeightPayload::Host(bytes) => {
                converter.convert_from_host(&self.staged, weight_shape, bytes, &src_shape)
            }
            WeightPayload::Device(src) => {
                converter.convert(&self.staged, weight_shape, &src, &src_shape)
            }
        };
        converted.inspect_err(|err| error!(%err, "weight update conversion failed"))?;

        self.update_requested = true;
        Ok(())
    }

    /// Return the cache and staging buffers to the allocator.
    pub fn release(&mut self, device: &dyn Device) {
        for desc in [&mut self.converted, &mut self.staged] {
            if !desc.is_null() {
                device.free(desc);
            }
        }
        self.valid = false;
        self.update_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::mock::{MockDevice, MockPrimitives};

    struct Fixture {
        mock: Arc<MockDevice>,
        device: Arc<dyn Device>,
        prims: MockPrimitives,
        weight: Tensor,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockDevice::new());
        let device: Arc<dyn Device> = mock.clone();
        let weight = Tensor::with_buffer(
            "w",
            TensorShape::ndarray(&[30, 16, 3, 3], DataType::F16),
            BufferDesc::new(0x7000_0000, 30 * 16 * 9 * 2),
        );
        Fixture {
            mock,
            device,
            prims: MockPrimitives::new(0),
            weight,
        }
    }

    #[test]
    fn test_relayout_shape_pads_filters() {
        let shape = relayout_shape(&TensorShape::ndarray(&[30, 16, 3, 3], DataType::F16), 8);
        assert_eq!(shape.padding(0), 2);
        assert_eq!(shape.bytes_including_padding(), 32 * 16 * 9 * 2);
    }

    #[test]
    fn test_static_weight_converted_once() {
        let f = fixture();
        let mut cache = WeightCache::new();
        for _ in 0..3 {
            let binding = cache
                .ensure_converted(&f.device, &f.prims, &f.weight, &ConvParams::default(), 8, true)
                .unwrap();
            assert!(matches!(binding, WeightBinding::Cached(_)));
        }
        assert_eq!(cache.conversions(), 1);
        assert_eq!(f.prims.relayouts(), vec![(cache.converted(), *f.weight.buffer())]);

        cache.release(f.device.as_ref());
        assert_eq!(f.mock.stats().live_buffers, 0);
    }

    #[test]
    fn test_dynamic_weight_uses_temporary_buffer() {
        let f = fixture();
        let mut cache = WeightCache::new();
        {
            let binding = cache
                .ensure_converted(&f.device, &f.prims, &f.weight, &ConvParams::default(), 8, false)
                .unwrap();
            assert!(matches!(binding, WeightBinding::Transient(_)));
            assert_eq!(f.mock.stats().live_tmp, 1);
        }
        assert_eq!(f.mock.stats().live_tmp, 0);
        assert!(cache.converted().is_null());
    }

    #[test]
    fn test_failed_relayout_retries_next_time() {
        let f = fixture();
        let mut cache = WeightCache::new();
        f.prims.set_fail_relayout(true);
        assert!(cache
            .ensure_converted(&f.device, &f.prims, &f.weight, &ConvParams::default(), 8, true)
            .is_err());

        f.prims.set_fail_relayout(false);
        cache
            .ensure_converted(&f.device, &f.prims, &f.weight, &ConvParams::default(), 8, true)
            .unwrap();
        assert_eq!(cache.conversions(), 1);
    }

    #[test]
    fn test_host_update_converts_from_staged_buffer() {
        let f = fixture();
        let mut cache = WeightCache::new();
        cache
            .ensure_converted(&f.device, &f.prims, &f.weight, &ConvParams::default(), 8, true)
            .unwrap();

        let payload = vec![0u8; 30 * 16 * 9 * 4];
        cache
            .request_update(f.device.as_ref(), f.weight.shape(), WeightPayload::Host(&payload))
            .unwrap();
        assert!(cache.update_requested());
        assert_eq!(f.mock.last_host_payload().map(|p| p.len()), Some(payload.len()));

        cache
            .ensure_converted(&f.device, &f.prims, &f.weight, &ConvParams::default(), 8, true)
            .unwrap();
        assert!(!cache.update_requested());
        assert_eq!(cache.conversions(), 2);
        let (_, src) = f.prims.relayouts()[1];
        assert_ne!(src, *f.weight.buffer());
        assert!(f.mock.is_live(src.addr));
    }

    #[test]
    fn test_device_update_uses_device_converter() {
        let f = fixture();
        let mut cache = WeightCache::new();
        cache
            .request_update(
                f.device.as_ref(),
                f.weight.shape(),
                WeightPayload::Device(BufferDesc::new(0x5000_0000, 30 * 16 * 9 * 4)),
            )
            .unwrap();
        assert_eq!(f.mock.stats().convert_calls, 1);
        assert_eq!(f.mock.stats().host_convert_calls, 0);
    }

    #[test]
    fn test_short_host_payload_rejected() {
        let f = fixture();
        let mut cache = WeightCache::new();
        let err = cache
            .request_update(f.device.as_ref(), f.weight.shape(), WeightPayload::Host(&[0u8; 16]))
            .unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
        assert!(!cache.update_requested());
        assert_eq!(f.mock.stats().realloc_calls, 0);
    }

    #[test]
    fn test_failed_conversion_leaves_no_request() {
        let f = fixture();
        let mut cache = WeightCache::new();
        f.mock.set_fail_convert(true);
        let payload = vec![0u8; 30 * 16 * 9 * 4];
        assert!(cache
            .request_update(f.device.as_ref(), f.weight.shape(), WeightPayload::Host(&payload))
            .is_err());
        assert!(!cache.update_requested());

        cache.release(f.device.as_ref());
        assert_eq!(f.mock.stats().live_buffers, 0);
    }
}
