//! Hardware execution paths of the convolution kernel.

use conflux_core::{DataType, DeviceProps, Error, Result};
use std::fmt;

/// A numeric-precision execution path.
///
/// Each variant fixes the element type it accepts, the multiple the filter
/// count is padded to in the relayouted weight, and the minimum compute
/// capability of the device that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvVariant {
    /// Half-precision tensor cores.
    Hmma,
    /// Int8 tensor cores.
    Imma,
    /// Single-precision fallback without tensor cores.
    Direct,
}

impl ConvVariant {
    pub const ALL: [ConvVariant; 3] = [ConvVariant::Hmma, ConvVariant::Imma, ConvVariant::Direct];

    pub fn dtype(self) -> DataType {
        match self {
            ConvVariant::Hmma => DataType::F16,
            ConvVariant::Imma => DataType::I8,
            ConvVariant::Direct => DataType::F32,
        }
    }

    pub fn filter_alignment(self) -> usize {
        match self {
            ConvVariant::Hmma => 8,
            ConvVariant::Imma => 16,
            ConvVariant::Direct => 1,
        }
    }

    pub fn min_compute_capability(self) -> (u32, u32) {
        match self {
            ConvVariant::Hmma => (7, 0),
            ConvVariant::Imma => (7, 5),
            ConvVariant::Direct => (0, 0),
        }
    }

    /// Pick the variant handling `dtype` on a device with `props`.
    pub fn select(dtype: DataType, props: &DeviceProps) -> Result<Self> {
        let variant = Self::ALL
            .into_iter()
            .find(|v| v.dtype() == dtype)
            .ok_or_else(|| Error::Unsupported(format!("no convolution path for {dtype}")))?;

        let (major, minor) = variant.min_compute_capability();
        if !props.supports(major, minor) {
            let (have_major, have_minor) = props.compute_capability;
            return Err(Error::Unsupported(format!(
                "{variant} needs compute capability {major}.{minor}, {} has {have_major}.{have_minor}",
                props.name
            )));
        }
        Ok(variant)
    }

    /// Short label used in kernel names and logs.
    pub fn label(self) -> &'static str {
        match self {
            ConvVariant::Hmma => "ConvHmma",
            ConvVariant::Imma => "ConvImma",
            ConvVariant::Direct => "ConvDirect",
        }
    }
}

impl fmt::Display for ConvVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
