//! Sequence container format: an ordered list of tracked frames with
//! per-frame metadata, stored as a text header plus a binary pixel region.
//!
//! # File layout
//!
//! ```text
//! Text header (newline-delimited `Field = value` pairs):
//!   ObjectType = Image
//!   NDims = 3                          2 single frame / 3 sequence / 4 volume sequence
//!   BinaryData = True
//!   ElementByteOrderMSB = False
//!   CompressedData = False
//!   DimSize = 640 480 118              last component = frame count, patched on finalize
//!   ElementType = MET_UCHAR
//!   ElementNumberOfChannels = 1
//!   UltrasoundImageOrientation = MF
//!   Seq_Frame0000_Timestamp = 103.4
//!   Seq_Frame0000_ProbeToTrackerTransform = 1 0 0 ...
//!   Seq_Frame0000_ProbeToTrackerTransformStatus = OK
//!   ...
//!   ElementDataFile = LOCAL            or the name of a sibling .raw/.zraw file
//!
//! Binary region (same file after the header, or the sibling file):
//!   raw little-endian scalars, frame-major; optionally one zlib stream
//!   covering all frames (CompressedDataSize records its byte count)
//! ```
//!
//! `.mha` files hold header and pixels together (`ElementDataFile = LOCAL`);
//! `.mhd` files pair the header with a sibling raw pixel file.

mod format;
mod reader;
mod writer;

pub use format::{
    element_type_for, flip_frame_bytes, parse_header_line, parse_seq_frame_key,
    scalar_type_from_element_type, seq_frame_key, ImageOrientation, ELEMENT_DATA_FILE_LOCAL,
    FIELD_ANATOMICAL_ORIENTATION, FIELD_COMPRESSED_DATA, FIELD_COMPRESSED_DATA_SIZE,
    FIELD_DIM_SIZE, FIELD_ELEMENT_DATA_FILE, FIELD_ELEMENT_NUMBER_OF_CHANNELS,
    FIELD_ELEMENT_SPACING, FIELD_ELEMENT_TYPE, FIELD_IMAGE_ORIENTATION, FIELD_NDIMS,
    FIELD_OBJECT_TYPE, FIELD_OFFSET,
};
pub use reader::{RecoveryMode, SequenceReadOptions, SequenceReader};
pub use writer::{SequenceStats, SequenceWriteOptions, SequenceWriter};

/// Errors of the sequence codec.
#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not a sequence metafile: {0}")]
    UnrecognizedFormat(String),
    #[error("missing required header field '{0}'")]
    MissingField(&'static str),
    #[error("malformed header field '{field}': {reason}")]
    MalformedField { field: String, reason: String },
    #[error("unsupported element type '{0}'")]
    UnsupportedElementType(String),
    #[error("unsupported number of dimensions {0}; only 2, 3 and 4 are supported")]
    UnsupportedDimensions(usize),
    #[error("header field '{0}' not found for in-place update")]
    FieldNotFound(String),
    #[error("value '{value}' does not fit in the reserved space of header field '{field}'")]
    PatchValueTooLong { field: String, value: String },
    #[error("the sequence holds no frames; add frames before preparing the header")]
    EmptySequence,
    #[error("header is not prepared; call prepare_header first")]
    HeaderNotPrepared,
    #[error("header is already finalized")]
    HeaderFinalized,
    #[error("incremental append is not allowed when compression is enabled")]
    AppendWithCompression,
    #[error("frame {index} holds {actual} pixel bytes, declared frame size is {expected}")]
    FrameSizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("frame {index} scalar type or component count differs from the first frame")]
    MixedFrameTypes { index: usize },
    #[error("writer is closed")]
    WriterClosed,
    #[error("header declares {declared} frames but the pixel data holds only {available}")]
    TruncatedPixelData { declared: usize, available: usize },
    #[error(transparent)]
    Frame(#[from] crate::schema::FrameError),
}
