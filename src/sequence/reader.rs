//! Sequence reader: header parsing, pixel loading and orientation
//! normalization.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::ZlibDecoder;
use log::warn;

use super::format::{
    flip_frame_bytes, parse_header_line, parse_seq_frame_key, scalar_type_from_element_type,
    ImageOrientation, ELEMENT_DATA_FILE_LOCAL, FIELD_COMPRESSED_DATA,
    FIELD_COMPRESSED_DATA_SIZE, FIELD_DIM_SIZE, FIELD_ELEMENT_DATA_FILE,
    FIELD_ELEMENT_NUMBER_OF_CHANNELS, FIELD_ELEMENT_TYPE, FIELD_IMAGE_ORIENTATION, FIELD_NDIMS,
    FIELD_OBJECT_TYPE,
};
use super::SequenceError;
use crate::schema::{FieldMap, ImageBuffer, PixelData, ScalarType, TrackedFrame, FIELD_TIMESTAMP};

/// How to reconcile a header whose declared frame count disagrees with the
/// pixel bytes actually present (e.g. a recording killed mid-append).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Fail the read. Losing data requires an explicit opt-in.
    #[default]
    Strict,
    /// Read the complete frames that exist and log a warning.
    Truncate,
}

/// Options for reading a sequence file.
#[derive(Debug, Clone, Default)]
pub struct SequenceReadOptions {
    /// Orientation the pixel rows are normalized to in memory.
    pub image_orientation_in_memory: ImageOrientation,
    /// Partial-file reconciliation behavior.
    pub recovery: RecoveryMode,
}

/// A parsed sequence file: document fields plus per-frame images/metadata.
pub struct SequenceReader {
    document_fields: FieldMap,
    frames: Vec<TrackedFrame>,
    dims: [usize; 4],
    scalar_type: ScalarType,
    num_components: usize,
    compressed: bool,
}

struct ParsedHeader {
    document_fields: FieldMap,
    frame_fields: Vec<FieldMap>,
    pixel_offset: u64,
}

impl SequenceReader {
    /// Probe whether a file looks like a sequence metafile.
    ///
    /// A negative result is a routine outcome of format sniffing, so this
    /// never logs an error.
    pub fn can_read_file(path: impl AsRef<Path>) -> bool {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(_) => return false,
        };
        let mut reader = BufReader::new(file).take(512);
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() {
            return false;
        }
        matches!(
            parse_header_line(line.trim_end()),
            Some((FIELD_OBJECT_TYPE, "Image"))
        )
    }

    /// Read a sequence file: header, per-frame metadata and pixel data.
    pub fn read(
        path: impl AsRef<Path>,
        options: SequenceReadOptions,
    ) -> Result<Self, SequenceError> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let header = read_image_header(&mut file)?;

        if header.document_fields.get(FIELD_OBJECT_TYPE) != Some("Image") {
            return Err(SequenceError::UnrecognizedFormat(format!(
                "{} is not an Image metafile",
                path.display()
            )));
        }

        let ndims: usize = parse_required(&header.document_fields, FIELD_NDIMS)?;
        let dim_values: Vec<usize> = header
            .document_fields
            .get(FIELD_DIM_SIZE)
            .ok_or(SequenceError::MissingField(FIELD_DIM_SIZE))
            .and_then(|v| parse_number_list(FIELD_DIM_SIZE, v))?;
        if dim_values.len() != ndims {
            return Err(SequenceError::MalformedField {
                field: FIELD_DIM_SIZE.to_string(),
                reason: format!("{} values for {} dimensions", dim_values.len(), ndims),
            });
        }
        // 2 = single frame, 3 = sequence of 2D frames, 4 = sequence of
        // volumes (or 2D frames stored with an explicit unit z dimension).
        let dims = match ndims {
            2 => [dim_values[0], dim_values[1], 1, 1],
            3 => [dim_values[0], dim_values[1], 1, dim_values[2]],
            4 => [dim_values[0], dim_values[1], dim_values[2], dim_values[3]],
            other => return Err(SequenceError::UnsupportedDimensions(other)),
        };

        let element_type = header
            .document_fields
            .get(FIELD_ELEMENT_TYPE)
            .ok_or(SequenceError::MissingField(FIELD_ELEMENT_TYPE))?;
        let scalar_type = scalar_type_from_element_type(element_type)
            .ok_or_else(|| SequenceError::UnsupportedElementType(element_type.to_string()))?;
        let num_components = match header.document_fields.get(FIELD_ELEMENT_NUMBER_OF_CHANNELS) {
            Some(v) => parse_value(FIELD_ELEMENT_NUMBER_OF_CHANNELS, v)?,
            None => 1,
        };
        let compressed = header
            .document_fields
            .get(FIELD_COMPRESSED_DATA)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let file_orientation = header
            .document_fields
            .get(FIELD_IMAGE_ORIENTATION)
            .and_then(ImageOrientation::parse)
            .unwrap_or_default();

        let raw = read_image_pixels(path, &mut file, &header, compressed)?;

        let frame_bytes =
            dims[0] * dims[1] * dims[2] * num_components * scalar_type.bytes_per_scalar();
        let declared = dims[3];
        let available = if frame_bytes == 0 { 0 } else { raw.len() / frame_bytes };
        let frame_count = if available < declared {
            match options.recovery {
                RecoveryMode::Strict => {
                    return Err(SequenceError::TruncatedPixelData {
                        declared,
                        available,
                    })
                }
                RecoveryMode::Truncate => {
                    warn!(
                        "{}: header declares {declared} frames but only {available} are present; \
                         reading the complete frames",
                        path.display()
                    );
                    available
                }
            }
        } else {
            declared
        };

        let (flip_x, flip_y) =
            file_orientation.flips_to(options.image_orientation_in_memory);
        let pixel_stride = num_components * scalar_type.bytes_per_scalar();

        let mut frames = Vec::with_capacity(frame_count);
        for index in 0..frame_count {
            let mut bytes = raw[index * frame_bytes..(index + 1) * frame_bytes].to_vec();
            flip_frame_bytes(
                &mut bytes,
                dims[0],
                dims[1],
                dims[2],
                pixel_stride,
                flip_x,
                flip_y,
            );
            let data = PixelData::from_le_bytes(scalar_type, &bytes)?;
            let image = ImageBuffer::from_data(dims[0], dims[1], dims[2], num_components, data)?;

            let fields = header
                .frame_fields
                .get(index)
                .cloned()
                .unwrap_or_default();
            let timestamp = fields
                .get(FIELD_TIMESTAMP)
                .and_then(|v| v.parse().ok())
                .unwrap_or(index as f64);
            let mut frame = TrackedFrame::new(image, timestamp);
            frame.fields = fields;
            frames.push(frame);
        }

        Ok(Self {
            document_fields: header.document_fields,
            frames,
            dims,
            scalar_type,
            num_components,
            compressed,
        })
    }

    /// Document-level header fields, as read.
    pub fn document_fields(&self) -> &FieldMap {
        &self.document_fields
    }

    /// Frames in acquisition order.
    pub fn frames(&self) -> &[TrackedFrame] {
        &self.frames
    }

    /// Consume the reader, returning the frames.
    pub fn into_frames(self) -> Vec<TrackedFrame> {
        self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Frame size (x, y, z) and frame count as stored in the header.
    pub fn dimensions(&self) -> [usize; 4] {
        self.dims
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    pub fn num_components(&self) -> usize {
        self.num_components
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }
}

/// Parse header lines until (and including) `ElementDataFile`, splitting
/// per-frame fields from document fields and recording where pixels start.
fn read_image_header(file: &mut File) -> Result<ParsedHeader, SequenceError> {
    let mut document_fields = FieldMap::new();
    let mut frame_fields: Vec<FieldMap> = Vec::new();
    let mut offset: u64 = 0;
    let mut terminated = false;

    let mut reader = BufReader::new(&mut *file);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        offset += read as u64;
        let text = String::from_utf8_lossy(&line);
        let Some((name, value)) = parse_header_line(text.trim_end()) else {
            continue;
        };
        if let Some((index, field)) = parse_seq_frame_key(name) {
            if frame_fields.len() <= index {
                frame_fields.resize_with(index + 1, FieldMap::new);
            }
            frame_fields[index].set(field, value);
            continue;
        }
        document_fields.set(name, value);
        if name == FIELD_ELEMENT_DATA_FILE {
            terminated = true;
            break;
        }
    }
    if !terminated {
        return Err(SequenceError::MissingField(FIELD_ELEMENT_DATA_FILE));
    }

    Ok(ParsedHeader {
        document_fields,
        frame_fields,
        pixel_offset: offset,
    })
}

/// Locate and load the raw pixel bytes, decompressing if needed.
fn read_image_pixels(
    header_path: &Path,
    header_file: &mut File,
    header: &ParsedHeader,
    compressed: bool,
) -> Result<Vec<u8>, SequenceError> {
    let data_file = header
        .document_fields
        .get(FIELD_ELEMENT_DATA_FILE)
        .ok_or(SequenceError::MissingField(FIELD_ELEMENT_DATA_FILE))?;

    let mut stored = Vec::new();
    if data_file == ELEMENT_DATA_FILE_LOCAL {
        header_file.seek(SeekFrom::Start(header.pixel_offset))?;
        header_file.read_to_end(&mut stored)?;
    } else {
        let pixel_path = match header_path.parent() {
            Some(parent) => parent.join(data_file),
            None => Path::new(data_file).to_path_buf(),
        };
        File::open(pixel_path)?.read_to_end(&mut stored)?;
    }

    if !compressed {
        return Ok(stored);
    }

    // One zlib stream covers all frames; its length is recorded so trailing
    // bytes (if any) are not fed to the decoder.
    if let Some(size) = header.document_fields.get(FIELD_COMPRESSED_DATA_SIZE) {
        let size: usize = parse_value(FIELD_COMPRESSED_DATA_SIZE, size)?;
        stored.truncate(size);
    }
    let mut raw = Vec::new();
    ZlibDecoder::new(stored.as_slice()).read_to_end(&mut raw)?;
    Ok(raw)
}

fn parse_value<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, SequenceError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| SequenceError::MalformedField {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

fn parse_required<T: std::str::FromStr>(
    fields: &FieldMap,
    name: &'static str,
) -> Result<T, SequenceError>
where
    T::Err: std::fmt::Display,
{
    let value = fields.get(name).ok_or(SequenceError::MissingField(name))?;
    parse_value(name, value)
}

fn parse_number_list(field: &str, value: &str) -> Result<Vec<usize>, SequenceError> {
    value
        .split_whitespace()
        .map(|v| parse_value(field, v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ImageBuffer, PixelData};
    use crate::sequence::{SequenceWriteOptions, SequenceWriter};
    use tempfile::tempdir;

    fn frame_with_pattern(index: usize, width: usize, height: usize) -> TrackedFrame {
        let pixels: Vec<u8> = (0..width * height)
            .map(|i| ((i + index * 7) % 251) as u8)
            .collect();
        let image = ImageBuffer::from_data(width, height, 1, 1, PixelData::U8(pixels)).unwrap();
        let mut frame = TrackedFrame::new(image, 10.5 + index as f64);
        frame.fields.set("FrameSource", format!("synthetic-{index}"));
        frame
    }

    #[test]
    fn test_roundtrip_uncompressed_mha() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.mha");

        let originals: Vec<_> = (0..5).map(|i| frame_with_pattern(i, 8, 6)).collect();
        let writer = SequenceWriter::create(&path, SequenceWriteOptions::default()).unwrap();
        for frame in &originals {
            writer.add_frame(frame.clone()).unwrap();
        }
        writer.write().unwrap();

        let reader = SequenceReader::read(&path, SequenceReadOptions::default()).unwrap();
        assert_eq!(reader.frame_count(), 5);
        assert_eq!(reader.dimensions(), [8, 6, 1, 5]);
        assert!(!reader.is_compressed());
        for (original, loaded) in originals.iter().zip(reader.frames()) {
            assert_eq!(original.image, loaded.image);
            assert_eq!(loaded.fields.get("FrameSource"), original.fields.get("FrameSource"));
            assert_eq!(loaded.timestamp, original.timestamp);
        }
    }

    #[test]
    fn test_roundtrip_compressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.mha");

        let originals: Vec<_> = (0..4).map(|i| frame_with_pattern(i, 16, 16)).collect();
        let writer = SequenceWriter::create(
            &path,
            SequenceWriteOptions {
                use_compression: true,
                compression_chunk_size: 37,
                ..Default::default()
            },
        )
        .unwrap();
        for frame in &originals {
            writer.add_frame(frame.clone()).unwrap();
        }
        writer.write().unwrap();

        let reader = SequenceReader::read(&path, SequenceReadOptions::default()).unwrap();
        assert!(reader.is_compressed());
        assert_eq!(reader.frame_count(), 4);
        for (original, loaded) in originals.iter().zip(reader.frames()) {
            assert_eq!(original.image, loaded.image);
        }
    }

    #[test]
    fn test_roundtrip_external_raw() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.mhd");

        let originals: Vec<_> = (0..3).map(|i| frame_with_pattern(i, 8, 8)).collect();
        let writer = SequenceWriter::create(&path, SequenceWriteOptions::default()).unwrap();
        for frame in &originals {
            writer.add_frame(frame.clone()).unwrap();
        }
        writer.write().unwrap();

        assert!(dir.path().join("sweep.raw").exists());
        let reader = SequenceReader::read(&path, SequenceReadOptions::default()).unwrap();
        assert_eq!(reader.frame_count(), 3);
        for (original, loaded) in originals.iter().zip(reader.frames()) {
            assert_eq!(original.image, loaded.image);
        }
    }

    #[test]
    fn test_orientation_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.mha");

        let original = frame_with_pattern(0, 6, 4);
        let writer = SequenceWriter::create(
            &path,
            SequenceWriteOptions {
                image_orientation_in_file: ImageOrientation::Un,
                ..Default::default()
            },
        )
        .unwrap();
        writer.add_frame(original.clone()).unwrap();
        writer.write().unwrap();

        // Normalizing back to MF must undo the storage flips exactly.
        let reader = SequenceReader::read(&path, SequenceReadOptions::default()).unwrap();
        assert_eq!(reader.frames()[0].image, original.image);
        assert_eq!(
            reader.document_fields().get("UltrasoundImageOrientation"),
            Some("UN")
        );

        // Reading in the file's own orientation applies no transform, so the
        // stored (flipped) pixels come back as they are on disk.
        let reader_un = SequenceReader::read(
            &path,
            SequenceReadOptions {
                image_orientation_in_memory: ImageOrientation::Un,
                ..Default::default()
            },
        )
        .unwrap();
        let flipped = &reader_un.frames()[0].image;
        assert_eq!(
            flipped.value_at(0, 0, 0, 0),
            original.image.value_at(5, 3, 0, 0)
        );
    }

    #[test]
    fn test_incremental_append_two_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.mha");

        let writer = SequenceWriter::create(&path, SequenceWriteOptions::default()).unwrap();
        for i in 0..3 {
            writer.add_frame(frame_with_pattern(i, 8, 8)).unwrap();
        }
        writer.prepare_header().unwrap();
        writer.append_images_to_header(false).unwrap();
        writer.append_images().unwrap();
        for i in 3..8 {
            writer.add_frame(frame_with_pattern(i, 8, 8)).unwrap();
        }
        writer.append_images_to_header(false).unwrap();
        writer.append_images().unwrap();
        writer.finalize_header().unwrap();
        writer.close().unwrap();

        let reader = SequenceReader::read(&path, SequenceReadOptions::default()).unwrap();
        assert_eq!(reader.dimensions(), [8, 8, 1, 8]);
        assert_eq!(reader.frame_count(), 8);
        for (i, frame) in reader.frames().iter().enumerate() {
            assert_eq!(frame.image, frame_with_pattern(i, 8, 8).image);
        }
    }

    #[test]
    fn test_single_frame_is_two_dimensional() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("single.mha");

        let writer = SequenceWriter::create(&path, SequenceWriteOptions::default()).unwrap();
        writer.add_frame(frame_with_pattern(0, 8, 8)).unwrap();
        writer.write().unwrap();

        let reader = SequenceReader::read(&path, SequenceReadOptions::default()).unwrap();
        assert_eq!(reader.document_fields().get("NDims"), Some("2"));
        assert_eq!(reader.frame_count(), 1);
    }

    #[test]
    fn test_2d_with_z_dimension_convention() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.mha");

        let writer = SequenceWriter::create(
            &path,
            SequenceWriteOptions {
                output_2d_with_z_dimension: true,
                ..Default::default()
            },
        )
        .unwrap();
        for i in 0..3 {
            writer.add_frame(frame_with_pattern(i, 4, 4)).unwrap();
        }
        writer.write().unwrap();

        let reader = SequenceReader::read(&path, SequenceReadOptions::default()).unwrap();
        assert_eq!(reader.document_fields().get("NDims"), Some("4"));
        assert_eq!(reader.dimensions(), [4, 4, 1, 3]);
    }

    #[test]
    fn test_truncated_file_strict_and_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.mha");

        let writer = SequenceWriter::create(&path, SequenceWriteOptions::default()).unwrap();
        for i in 0..4 {
            writer.add_frame(frame_with_pattern(i, 8, 8)).unwrap();
        }
        writer.write().unwrap();

        // Cut away the last frame and a half of pixel data.
        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 96).unwrap();
        drop(file);

        assert!(matches!(
            SequenceReader::read(&path, SequenceReadOptions::default()),
            Err(SequenceError::TruncatedPixelData { declared: 4, available: 2 })
        ));

        let reader = SequenceReader::read(
            &path,
            SequenceReadOptions {
                recovery: RecoveryMode::Truncate,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(reader.frame_count(), 2);
        assert_eq!(reader.frames()[1].image, frame_with_pattern(1, 8, 8).image);
    }

    #[test]
    fn test_can_read_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.mha");
        let writer = SequenceWriter::create(&path, SequenceWriteOptions::default()).unwrap();
        writer.add_frame(frame_with_pattern(0, 4, 4)).unwrap();
        writer.write().unwrap();
        assert!(SequenceReader::can_read_file(&path));

        let other = dir.path().join("notes.txt");
        std::fs::write(&other, "hello\n").unwrap();
        assert!(!SequenceReader::can_read_file(&other));
        assert!(!SequenceReader::can_read_file(dir.path().join("missing.mha")));
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn prop_roundtrip_random_frames(
            seed in 0u64..1_000_000,
            frame_count in 1usize..6,
            width in 1usize..12,
            height in 1usize..12,
            compressed in proptest::bool::ANY,
        ) {
            use rand::{Rng, SeedableRng};
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

            let dir = tempdir().unwrap();
            let path = dir.path().join("random.mha");

            let originals: Vec<TrackedFrame> = (0..frame_count)
                .map(|i| {
                    let pixels: Vec<u8> = (0..width * height).map(|_| rng.gen()).collect();
                    let image =
                        ImageBuffer::from_data(width, height, 1, 1, PixelData::U8(pixels))
                            .unwrap();
                    let mut frame = TrackedFrame::new(image, rng.gen_range(0.0..1e6));
                    frame.fields.set("ProbeId", format!("probe-{}", rng.gen::<u32>()));
                    frame
                        .fields
                        .set("ToolStatus", if rng.gen() { "OK" } else { "INVALID" });
                    frame.fields.set("FrameNumber", i.to_string());
                    frame
                })
                .collect();

            let writer = SequenceWriter::create(
                &path,
                SequenceWriteOptions {
                    use_compression: compressed,
                    ..Default::default()
                },
            )
            .unwrap();
            for frame in &originals {
                writer.add_frame(frame.clone()).unwrap();
            }
            writer.write().unwrap();

            let reader = SequenceReader::read(&path, SequenceReadOptions::default()).unwrap();
            prop_assert_eq!(reader.frame_count(), frame_count);
            for (original, loaded) in originals.iter().zip(reader.frames()) {
                prop_assert_eq!(&original.image, &loaded.image);
                prop_assert_eq!(loaded.timestamp, original.timestamp);
                for field in ["ProbeId", "ToolStatus", "FrameNumber"] {
                    prop_assert_eq!(loaded.fields.get(field), original.fields.get(field));
                }
            }
        }
    }

    #[test]
    fn test_transform_fields_survive_roundtrip() {
        use crate::schema::{set_frame_transform, TransformName, TransformRepository};
        use nalgebra::Matrix4;

        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.mha");

        let name = TransformName::new("Image", "Reference").unwrap();
        let matrix = Matrix4::new_translation(&nalgebra::Vector3::new(1.5, -2.0, 4.0));
        let mut frame = frame_with_pattern(0, 4, 4);
        set_frame_transform(&mut frame, &name, &matrix, true);

        let writer = SequenceWriter::create(&path, SequenceWriteOptions::default()).unwrap();
        writer.add_frame(frame).unwrap();
        writer.write().unwrap();

        let reader = SequenceReader::read(&path, SequenceReadOptions::default()).unwrap();
        let mut repo = TransformRepository::new();
        repo.set_transforms(&reader.frames()[0]).unwrap();
        let (resolved, valid) = repo.get_transform(&name).unwrap();
        assert!(valid);
        assert_eq!(resolved, matrix);
    }
}
