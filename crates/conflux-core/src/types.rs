//! Core types for tensor element types, memory layouts and shapes.

use std::fmt;

/// Tensor element data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    I8,
    I32,
    I64,
    U8,
}

impl DataType {
    /// Size of this data type in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 => 2,
            DataType::I64 => 8,
            DataType::I8 | DataType::U8 => 1,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "FLOAT32",
            DataType::F16 => "FLOAT16",
            DataType::I8 => "INT8",
            DataType::I32 => "INT32",
            DataType::I64 => "INT64",
            DataType::U8 => "UINT8",
        };
        f.write_str(name)
    }
}

/// Memory layout tag of a tensor.
///
/// `Ndarray` is the plain row-major NCHW layout. The `NhwcN` formats store
/// channels innermost with the channel dimension padded to a multiple of `N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFormat {
    Ndarray,
    Nhwc8,
    Nhwc16,
}

impl DataFormat {
    /// Padding multiple this layout requires along the channel dimension.
    pub fn channel_alignment(&self) -> usize {
        match self {
            DataFormat::Ndarray => 1,
            DataFormat::Nhwc8 => 8,
            DataFormat::Nhwc16 => 16,
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataFormat::Ndarray => "NDARRAY",
            DataFormat::Nhwc8 => "NHWC8",
            DataFormat::Nhwc16 => "NHWC16",
        };
        f.write_str(name)
    }
}

/// Round `value` up to the next multiple of `align` (`align` of 0 is treated as 1).
pub fn align_up(value: usize, align: usize) -> usize {
    let align = align.max(1);
    value.div_ceil(align) * align
}

/// Concrete tensor shape with element type, layout and per-dimension padding.
///
/// Padding is trailing: dimension `i` occupies `dims[i] + padding[i]` slots in
/// memory. Only the padded byte size matters to allocators; the logical dims
/// are what operators reason about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorShape {
    dims: Vec<usize>,
    padding: Vec<usize>,
    dtype: DataType,
    format: DataFormat,
}

impl TensorShape {
    /// Create a shape with no padding. Call [`TensorShape::calc_padding`] to
    /// apply the layout's channel padding.
    pub fn new(dims: &[usize], dtype: DataType, format: DataFormat) -> Self {
        Self {
            dims: dims.to_vec(),
            padding: vec![0; dims.len()],
            dtype,
            format,
        }
    }

    /// Create a plain `Ndarray` shape.
    pub fn ndarray(dims: &[usize], dtype: DataType) -> Self {
        Self::new(dims, dtype, DataFormat::Ndarray)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Dimension `i`, or 0 when the shape has fewer dimensions.
    pub fn dim(&self, i: usize) -> usize {
        self.dims.get(i).copied().unwrap_or(0)
    }

    /// Overwrite dimension `i`. Padding for that dimension is reset.
    pub fn set_dim(&mut self, i: usize, value: usize) {
        if i < self.dims.len() {
            self.dims[i] = value;
            self.padding[i] = 0;
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn set_dtype(&mut self, dtype: DataType) {
        self.dtype = dtype;
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    pub fn set_format(&mut self, format: DataFormat) {
        self.format = format;
    }

    /// Trailing padding of dimension `i`.
    pub fn padding(&self, i: usize) -> usize {
        self.padding.get(i).copied().unwrap_or(0)
    }

    /// Set the trailing padding of dimension `i`.
    pub fn set_padding(&mut self, i: usize, pad: usize) {
        if i < self.padding.len() {
            self.padding[i] = pad;
        }
    }

    /// Recompute padding from the layout: the channel dimension (dim 1) is
    /// padded up to the format's channel alignment, every other dimension is
    /// unpadded.
    pub fn calc_padding(&mut self) {
        self.padding.iter_mut().for_each(|p| *p = 0);
        if self.dims.len() >= 2 {
            let channels = self.dims[1];
            self.padding[1] = align_up(channels, self.format.channel_alignment()) - channels;
        }
    }

    /// Number of logical elements.
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of element slots including padding.
    pub fn element_count_including_padding(&self) -> usize {
        self.dims
            .iter()
            .zip(&self.padding)
            .map(|(d, p)| d + p)
            .product()
    }

    pub fn bytes_excluding_padding(&self) -> u64 {
        (self.element_count() * self.dtype.size()) as u64
    }

    pub fn bytes_including_padding(&self) -> u64 {
        (self.element_count_including_padding() * self.dtype.size()) as u64
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} {}", self.dims, self.dtype, self.format)
    }
}
