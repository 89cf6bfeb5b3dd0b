//! Tracked-frame types: pixel buffers, scalar types and per-frame metadata.

use serde::{Deserialize, Serialize};

/// Scalar type of a pixel or voxel component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ScalarType {
    /// Size of one scalar in bytes.
    #[inline]
    pub fn bytes_per_scalar(self) -> usize {
        match self {
            ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }
}

/// Errors from frame/image buffer construction.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("pixel data holds {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("buffer allocation of {bytes} bytes failed")]
    AllocationFailed { bytes: usize },
}

/// Typed pixel storage. Stored in the canonical in-memory layout
/// `[z][y][x][component]`, components interleaved.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! pixel_data_dispatch {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            PixelData::U8($v) => $body,
            PixelData::I8($v) => $body,
            PixelData::U16($v) => $body,
            PixelData::I16($v) => $body,
            PixelData::U32($v) => $body,
            PixelData::I32($v) => $body,
            PixelData::F32($v) => $body,
            PixelData::F64($v) => $body,
        }
    };
}

impl PixelData {
    /// Allocate a zero-filled buffer of `len` scalars.
    ///
    /// Uses a fallible reservation so an oversized volume reports an error
    /// instead of aborting the process.
    pub fn allocate(scalar_type: ScalarType, len: usize) -> Result<Self, FrameError> {
        fn zeroed<T: Clone + Default>(len: usize) -> Result<Vec<T>, FrameError> {
            let mut v = Vec::new();
            v.try_reserve_exact(len).map_err(|_| FrameError::AllocationFailed {
                bytes: len * std::mem::size_of::<T>(),
            })?;
            v.resize(len, T::default());
            Ok(v)
        }
        Ok(match scalar_type {
            ScalarType::U8 => PixelData::U8(zeroed(len)?),
            ScalarType::I8 => PixelData::I8(zeroed(len)?),
            ScalarType::U16 => PixelData::U16(zeroed(len)?),
            ScalarType::I16 => PixelData::I16(zeroed(len)?),
            ScalarType::U32 => PixelData::U32(zeroed(len)?),
            ScalarType::I32 => PixelData::I32(zeroed(len)?),
            ScalarType::F32 => PixelData::F32(zeroed(len)?),
            ScalarType::F64 => PixelData::F64(zeroed(len)?),
        })
    }

    /// Scalar type of the stored data.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            PixelData::U8(_) => ScalarType::U8,
            PixelData::I8(_) => ScalarType::I8,
            PixelData::U16(_) => ScalarType::U16,
            PixelData::I16(_) => ScalarType::I16,
            PixelData::U32(_) => ScalarType::U32,
            PixelData::I32(_) => ScalarType::I32,
            PixelData::F32(_) => ScalarType::F32,
            PixelData::F64(_) => ScalarType::F64,
        }
    }

    /// Number of scalars stored.
    pub fn len(&self) -> usize {
        pixel_data_dispatch!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode to little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        fn encode<T: Scalar>(data: &[T]) -> Vec<u8> {
            let mut bytes = Vec::with_capacity(data.len() * std::mem::size_of::<T>());
            for v in data {
                v.extend_le_bytes(&mut bytes);
            }
            bytes
        }
        pixel_data_dispatch!(self, v => encode(v))
    }

    /// Decode from little-endian bytes. The byte count must match
    /// `len * bytes_per_scalar` exactly.
    pub fn from_le_bytes(scalar_type: ScalarType, bytes: &[u8]) -> Result<Self, FrameError> {
        let bps = scalar_type.bytes_per_scalar();
        if bytes.len() % bps != 0 {
            return Err(FrameError::SizeMismatch {
                expected: (bytes.len() / bps) * bps,
                actual: bytes.len(),
            });
        }
        fn decode<T: Scalar>(bytes: &[u8]) -> Vec<T> {
            bytes
                .chunks_exact(std::mem::size_of::<T>())
                .map(T::from_le_chunk)
                .collect()
        }
        Ok(match scalar_type {
            ScalarType::U8 => PixelData::U8(bytes.to_vec()),
            ScalarType::I8 => PixelData::I8(decode(bytes)),
            ScalarType::U16 => PixelData::U16(decode(bytes)),
            ScalarType::I16 => PixelData::I16(decode(bytes)),
            ScalarType::U32 => PixelData::U32(decode(bytes)),
            ScalarType::I32 => PixelData::I32(decode(bytes)),
            ScalarType::F32 => PixelData::F32(decode(bytes)),
            ScalarType::F64 => PixelData::F64(decode(bytes)),
        })
    }
}

/// Scalar types usable as pixel/voxel components.
///
/// `from_f64` clamps to the representable range and rounds for integer types,
/// so compounding arithmetic can run in floating point and store back safely.
pub trait Scalar: Copy + PartialOrd + Send + Sync + 'static {
    const SCALAR_TYPE: ScalarType;

    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
    fn extend_le_bytes(&self, out: &mut Vec<u8>);
    fn from_le_chunk(chunk: &[u8]) -> Self;
    /// Borrow the matching typed variant, if the storage holds this type.
    fn slice(data: &PixelData) -> Option<&[Self]>
    where
        Self: Sized;
    fn slice_mut(data: &mut PixelData) -> Option<&mut [Self]>
    where
        Self: Sized;
}

macro_rules! impl_scalar_int {
    ($t:ty, $variant:ident, $st:expr) => {
        impl Scalar for $t {
            const SCALAR_TYPE: ScalarType = $st;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                let v = v.round();
                if v <= <$t>::MIN as f64 {
                    <$t>::MIN
                } else if v >= <$t>::MAX as f64 {
                    <$t>::MAX
                } else {
                    v as $t
                }
            }

            #[inline]
            fn extend_le_bytes(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn from_le_chunk(chunk: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(chunk);
                <$t>::from_le_bytes(buf)
            }

            fn slice(data: &PixelData) -> Option<&[Self]> {
                match data {
                    PixelData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(data: &mut PixelData) -> Option<&mut [Self]> {
                match data {
                    PixelData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

macro_rules! impl_scalar_float {
    ($t:ty, $variant:ident, $st:expr) => {
        impl Scalar for $t {
            const SCALAR_TYPE: ScalarType = $st;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $t
            }

            #[inline]
            fn extend_le_bytes(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn from_le_chunk(chunk: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(chunk);
                <$t>::from_le_bytes(buf)
            }

            fn slice(data: &PixelData) -> Option<&[Self]> {
                match data {
                    PixelData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(data: &mut PixelData) -> Option<&mut [Self]> {
                match data {
                    PixelData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_scalar_int!(u8, U8, ScalarType::U8);
impl_scalar_int!(i8, I8, ScalarType::I8);
impl_scalar_int!(u16, U16, ScalarType::U16);
impl_scalar_int!(i16, I16, ScalarType::I16);
impl_scalar_int!(u32, U32, ScalarType::U32);
impl_scalar_int!(i32, I32, ScalarType::I32);
impl_scalar_float!(f32, F32, ScalarType::F32);
impl_scalar_float!(f64, F64, ScalarType::F64);

/// A 2D or 3D image buffer with interleaved components.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    width: usize,
    height: usize,
    depth: usize,
    num_components: usize,
    data: PixelData,
}

impl ImageBuffer {
    /// Allocate a zero-filled buffer.
    pub fn allocate(
        scalar_type: ScalarType,
        width: usize,
        height: usize,
        depth: usize,
        num_components: usize,
    ) -> Result<Self, FrameError> {
        let len = width * height * depth * num_components;
        Ok(Self {
            width,
            height,
            depth,
            num_components,
            data: PixelData::allocate(scalar_type, len)?,
        })
    }

    /// Wrap existing pixel data; the scalar count must match the dimensions.
    pub fn from_data(
        width: usize,
        height: usize,
        depth: usize,
        num_components: usize,
        data: PixelData,
    ) -> Result<Self, FrameError> {
        let expected = width * height * depth * num_components;
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                expected: expected * data.scalar_type().bytes_per_scalar(),
                actual: data.len() * data.scalar_type().bytes_per_scalar(),
            });
        }
        Ok(Self {
            width,
            height,
            depth,
            num_components,
            data,
        })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn num_components(&self) -> usize {
        self.num_components
    }

    #[inline]
    pub fn scalar_type(&self) -> ScalarType {
        self.data.scalar_type()
    }

    #[inline]
    pub fn data(&self) -> &PixelData {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut PixelData {
        &mut self.data
    }

    /// Total byte size of the pixel data.
    pub fn byte_len(&self) -> usize {
        self.data.len() * self.scalar_type().bytes_per_scalar()
    }

    /// Read one component as f64, for inspection and tests.
    pub fn value_at(&self, x: usize, y: usize, z: usize, component: usize) -> f64 {
        let idx = ((z * self.height + y) * self.width + x) * self.num_components + component;
        pixel_data_dispatch!(&self.data, v => v[idx].to_f64())
    }

    /// Write one component from f64, clamped to the scalar range.
    pub fn set_value_at(&mut self, x: usize, y: usize, z: usize, component: usize, value: f64) {
        let idx = ((z * self.height + y) * self.width + x) * self.num_components + component;
        pixel_data_dispatch!(&mut self.data, v => v[idx] = Scalar::from_f64(value))
    }
}

/// Insertion-ordered string field map.
///
/// Downstream consumers rely on arbitrary vendor-specific field names, so this
/// stays a generic ordered map rather than a fixed schema. Lookups are linear;
/// frames carry a handful of fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace, preserving the original position on replace.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Frame field name holding the acquisition timestamp.
pub const FIELD_TIMESTAMP: &str = "Timestamp";
/// Frame field name holding the image validity status.
pub const FIELD_IMAGE_STATUS: &str = "ImageStatus";

/// One tracked sample: a 2D image, its acquisition timestamp and an
/// open-ended metadata map (transforms are stored as fields, see
/// [`crate::schema::TransformRepository`]).
#[derive(Debug, Clone)]
pub struct TrackedFrame {
    pub image: ImageBuffer,
    pub timestamp: f64,
    pub fields: FieldMap,
}

impl TrackedFrame {
    pub fn new(image: ImageBuffer, timestamp: f64) -> Self {
        Self {
            image,
            timestamp,
            fields: FieldMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_data_le_roundtrip() {
        let data = PixelData::U16(vec![0, 1, 513, u16::MAX]);
        let bytes = data.to_le_bytes();
        assert_eq!(bytes.len(), 8);
        let decoded = PixelData::from_le_bytes(ScalarType::U16, &bytes).unwrap();
        assert_eq!(data, decoded);
    }

    #[test]
    fn test_scalar_from_f64_clamps() {
        assert_eq!(u8::from_f64(300.0), 255);
        assert_eq!(u8::from_f64(-4.0), 0);
        assert_eq!(i16::from_f64(12.6), 13);
        assert_eq!(u16::from_f64(1e9), u16::MAX);
    }

    #[test]
    fn test_image_buffer_indexing() {
        let mut img = ImageBuffer::allocate(ScalarType::U8, 4, 3, 1, 2).unwrap();
        img.set_value_at(2, 1, 0, 1, 77.0);
        assert_eq!(img.value_at(2, 1, 0, 1), 77.0);
        assert_eq!(img.value_at(2, 1, 0, 0), 0.0);
        assert_eq!(img.byte_len(), 4 * 3 * 2);
    }

    #[test]
    fn test_image_buffer_size_check() {
        let data = PixelData::U8(vec![0; 10]);
        assert!(ImageBuffer::from_data(4, 3, 1, 1, data).is_err());
    }

    #[test]
    fn test_field_map_order_preserved() {
        let mut fields = FieldMap::new();
        fields.set("Zeta", "1");
        fields.set("Alpha", "2");
        fields.set("Zeta", "3");
        let names: Vec<_> = fields.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Zeta", "Alpha"]);
        assert_eq!(fields.get("Zeta"), Some("3"));
    }
}
