//! Host-side layout and type conversion.
//!
//! Device back-ends without an on-device converter stage data through host
//! memory and use [`relayout_host`] to reorder it.

use crate::types::{DataFormat, DataType, TensorShape};
use crate::{Error, Result};
use half::f16;

/// Convert `src` laid out as `src_shape` into a freshly allocated buffer laid
/// out as `dst_shape`.
///
/// Both shapes must describe the same logical dims. Supported conversions:
/// any pair of formats (`Ndarray` and `NhwcN`, channel padding zero-filled),
/// identical element types, and `F32` ⇄ `F16`.
pub fn relayout_host(src: &[u8], src_shape: &TensorShape, dst_shape: &TensorShape) -> Result<Vec<u8>> {
    if src_shape.dims() != dst_shape.dims() {
        return Err(Error::Conversion(format!(
            "logical dims differ: src {:?}, dst {:?}",
            src_shape.dims(),
            dst_shape.dims()
        )));
    }
    let needed = src_shape.bytes_including_padding() as usize;
    if src.len() < needed {
        return Err(Error::Conversion(format!(
            "source holds {} bytes, shape {} needs {}",
            src.len(),
            src_shape,
            needed
        )));
    }
    let convert = element_converter(src_shape.dtype(), dst_shape.dtype())?;
    let src_offsets = OffsetMap::new(src_shape)?;
    let dst_offsets = OffsetMap::new(dst_shape)?;

    let src_size = src_shape.dtype().size();
    let dst_size = dst_shape.dtype().size();
    let mut dst = vec![0u8; dst_shape.bytes_including_padding() as usize];
    let mut index = vec![0usize; src_shape.rank()];

    for _ in 0..src_shape.element_count() {
        let s = src_offsets.offset(&index) * src_size;
        let d = dst_offsets.offset(&index) * dst_size;
        convert(&src[s..s + src_size], &mut dst[d..d + dst_size]);
        advance(&mut index, src_shape.dims());
    }

    Ok(dst)
}

type ElementFn = fn(&[u8], &mut [u8]);

fn element_converter(src: DataType, dst: DataType) -> Result<ElementFn> {
    match (src, dst) {
        (a, b) if a == b => Ok(copy_element),
        (DataType::F32, DataType::F16) => Ok(f32_to_f16),
        (DataType::F16, DataType::F32) => Ok(f16_to_f32),
        (a, b) => Err(Error::Conversion(format!(
            "unsupported element conversion {a} -> {b}"
        ))),
    }
}

fn copy_element(src: &[u8], dst: &mut [u8]) {
    dst.copy_from_slice(src);
}

fn f32_to_f16(src: &[u8], dst: &mut [u8]) {
    let value: f32 = bytemuck::pod_read_unaligned(src);
    dst.copy_from_slice(&f16::from_f32(value).to_le_bytes());
}

fn f16_to_f32(src: &[u8], dst: &mut [u8]) {
    let value = f16::from_le_bytes([src[0], src[1]]).to_f32();
    dst.copy_from_slice(&value.to_le_bytes());
}

/// Row-major increment of a multi-index over `dims`.
fn advance(index: &mut [usize], dims: &[usize]) {
    for axis in (0..index.len()).rev() {
        index[axis] += 1;
        if index[axis] < dims[axis] {
            return;
        }
        index[axis] = 0;
    }
}

/// Maps a logical multi-index to an element offset in a given layout.
enum OffsetMap {
    /// Row-major over padded dims.
    Ndarray { strides: Vec<usize> },
    /// `[N, spatial..., C_padded]`.
    ChannelsLast {
        spatial: Vec<usize>,
        spatial_len: usize,
        channels_padded: usize,
    },
}

impl OffsetMap {
    fn new(shape: &TensorShape) -> Result<Self> {
        let padded: Vec<usize> = (0..shape.rank())
            .map(|i| shape.dim(i) + shape.padding(i))
            .collect();
        match shape.format() {
            DataFormat::Ndarray => {
                let mut strides = vec![1usize; padded.len()];
                for i in (0..padded.len().saturating_sub(1)).rev() {
                    strides[i] = strides[i + 1] * padded[i + 1];
                }
                Ok(OffsetMap::Ndarray { strides })
            }
            DataFormat::Nhwc8 | DataFormat::Nhwc16 => {
                if padded.len() < 2 {
                    return Err(Error::Conversion(format!(
                        "{} needs a channel dimension, got rank {}",
                        shape.format(),
                        padded.len()
                    )));
                }
                let spatial = padded[2..].to_vec();
                let spatial_len = spatial.iter().product();
                Ok(OffsetMap::ChannelsLast {
                    spatial,
                    spatial_len,
                    channels_padded: padded[1],
                })
            }
        }
    }

    fn offset(&self, index: &[usize]) -> usize {
        match self {
            OffsetMap::Ndarray { strides } => {
                index.iter().zip(strides).map(|(i, s)| i * s).sum()
            }
            OffsetMap::ChannelsLast {
                spatial,
                spatial_len,
                channels_padded,
            } => {
                let position = index[2..]
                    .iter()
                    .zip(spatial)
                    .fold(0, |acc, (i, d)| acc * d + i);
                (index[0] * spatial_len + position) * channels_padded + index[1]
            }
        }
    }
}
