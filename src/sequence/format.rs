//! Header grammar, element types and image orientations for sequence files.

use crate::schema::ScalarType;

/// Header field: object type, always `Image`.
pub const FIELD_OBJECT_TYPE: &str = "ObjectType";
/// Header field: number of dimensions (2, 3 or 4).
pub const FIELD_NDIMS: &str = "NDims";
/// Header field: size per dimension, space separated.
pub const FIELD_DIM_SIZE: &str = "DimSize";
/// Header field: binary pixel data marker.
pub const FIELD_BINARY_DATA: &str = "BinaryData";
/// Header field: byte order of the binary region.
pub const FIELD_BYTE_ORDER_MSB: &str = "ElementByteOrderMSB";
/// Header field: zlib compression flag.
pub const FIELD_COMPRESSED_DATA: &str = "CompressedData";
/// Header field: byte count of the compressed pixel region.
pub const FIELD_COMPRESSED_DATA_SIZE: &str = "CompressedDataSize";
/// Header field: scalar element type.
pub const FIELD_ELEMENT_TYPE: &str = "ElementType";
/// Header field: interleaved components per element.
pub const FIELD_ELEMENT_NUMBER_OF_CHANNELS: &str = "ElementNumberOfChannels";
/// Header field: element spacing, space separated.
pub const FIELD_ELEMENT_SPACING: &str = "ElementSpacing";
/// Header field: origin of the first element.
pub const FIELD_OFFSET: &str = "Offset";
/// Header field: anatomical orientation code (e.g. RAI).
pub const FIELD_ANATOMICAL_ORIENTATION: &str = "AnatomicalOrientation";
/// Header field: 2D axis orientation of the stored pixel rows.
pub const FIELD_IMAGE_ORIENTATION: &str = "UltrasoundImageOrientation";
/// Header field: pixel data location, `LOCAL` or a file name. Always last.
pub const FIELD_ELEMENT_DATA_FILE: &str = "ElementDataFile";

/// Sentinel `ElementDataFile` value: pixels follow the header in the same file.
pub const ELEMENT_DATA_FILE_LOCAL: &str = "LOCAL";

/// Prefix of per-frame fields: `Seq_Frame0000_<Name>`.
pub const SEQ_FRAME_PREFIX: &str = "Seq_Frame";

/// Spaces reserved after patchable numeric fields so
/// `update_field_in_image_header` can rewrite them in place.
pub const PATCH_PADDING: usize = 10;

/// Compose a per-frame field key, index zero-padded to 4 digits.
pub fn seq_frame_key(index: usize, field: &str) -> String {
    format!("{SEQ_FRAME_PREFIX}{index:04}_{field}")
}

/// Split a per-frame field key into (frame index, field name).
pub fn parse_seq_frame_key(key: &str) -> Option<(usize, &str)> {
    let rest = key.strip_prefix(SEQ_FRAME_PREFIX)?;
    let sep = rest.find('_')?;
    let index = rest[..sep].parse().ok()?;
    Some((index, &rest[sep + 1..]))
}

/// Split a header line into (name, value).
pub fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once('=')?;
    Some((name.trim(), value.trim()))
}

/// Map a scalar type to its MetaIO element type string.
pub fn element_type_for(scalar_type: ScalarType) -> &'static str {
    match scalar_type {
        ScalarType::U8 => "MET_UCHAR",
        ScalarType::I8 => "MET_CHAR",
        ScalarType::U16 => "MET_USHORT",
        ScalarType::I16 => "MET_SHORT",
        ScalarType::U32 => "MET_UINT",
        ScalarType::I32 => "MET_INT",
        ScalarType::F32 => "MET_FLOAT",
        ScalarType::F64 => "MET_DOUBLE",
    }
}

/// Map a MetaIO element type string to a scalar type.
pub fn scalar_type_from_element_type(element_type: &str) -> Option<ScalarType> {
    match element_type {
        "MET_UCHAR" => Some(ScalarType::U8),
        "MET_CHAR" => Some(ScalarType::I8),
        "MET_USHORT" => Some(ScalarType::U16),
        "MET_SHORT" => Some(ScalarType::I16),
        "MET_UINT" => Some(ScalarType::U32),
        "MET_INT" => Some(ScalarType::I32),
        "MET_FLOAT" => Some(ScalarType::F32),
        "MET_DOUBLE" => Some(ScalarType::F64),
        _ => None,
    }
}

/// 2D axis-flip orientation of stored image rows.
///
/// The first letter fixes the x axis (Marked/Unmarked probe side), the second
/// the y axis (Far/Near). `MF` is the canonical in-memory orientation; files
/// may use any of the four, and read/write converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageOrientation {
    #[default]
    Mf,
    Mn,
    Uf,
    Un,
}

impl ImageOrientation {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageOrientation::Mf => "MF",
            ImageOrientation::Mn => "MN",
            ImageOrientation::Uf => "UF",
            ImageOrientation::Un => "UN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("MF") {
            Some(ImageOrientation::Mf)
        } else if s.eq_ignore_ascii_case("MN") {
            Some(ImageOrientation::Mn)
        } else if s.eq_ignore_ascii_case("UF") {
            Some(ImageOrientation::Uf)
        } else if s.eq_ignore_ascii_case("UN") {
            Some(ImageOrientation::Un)
        } else {
            None
        }
    }

    fn x_marked(self) -> bool {
        matches!(self, ImageOrientation::Mf | ImageOrientation::Mn)
    }

    fn y_far(self) -> bool {
        matches!(self, ImageOrientation::Mf | ImageOrientation::Uf)
    }

    /// Axis flips required to convert pixels stored in `self` to `target`.
    pub fn flips_to(self, target: ImageOrientation) -> (bool, bool) {
        (
            self.x_marked() != target.x_marked(),
            self.y_far() != target.y_far(),
        )
    }
}

/// Flip one 2D frame's pixel bytes in place. `pixel_stride` is the byte size
/// of one pixel (all components). Multi-slice (3D) frames flip each z slice
/// independently.
pub fn flip_frame_bytes(
    bytes: &mut [u8],
    width: usize,
    height: usize,
    depth: usize,
    pixel_stride: usize,
    flip_x: bool,
    flip_y: bool,
) {
    if (!flip_x && !flip_y) || width == 0 || height == 0 {
        return;
    }
    let row_stride = width * pixel_stride;
    let slice_stride = row_stride * height;
    for z in 0..depth {
        let slice = &mut bytes[z * slice_stride..(z + 1) * slice_stride];
        if flip_y {
            for y in 0..height / 2 {
                let (top, rest) = slice.split_at_mut((y + 1) * row_stride);
                let top_row = &mut top[y * row_stride..];
                let bottom_start = (height - 1 - y) * row_stride - (y + 1) * row_stride;
                let bottom_row = &mut rest[bottom_start..bottom_start + row_stride];
                top_row.swap_with_slice(bottom_row);
            }
        }
        if flip_x {
            for y in 0..height {
                let row = &mut slice[y * row_stride..(y + 1) * row_stride];
                for x in 0..width / 2 {
                    let left = x * pixel_stride;
                    let right = (width - 1 - x) * pixel_stride;
                    for b in 0..pixel_stride {
                        row.swap(left + b, right + b);
                    }
                }
            }
        }
    }
}
