//! Sequence writer: streaming, append-friendly serialization of tracked
//! frames, with an optional zlib-compressed single-shot path.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, error};

use super::format::{
    element_type_for, flip_frame_bytes, seq_frame_key, ImageOrientation,
    ELEMENT_DATA_FILE_LOCAL, FIELD_BINARY_DATA, FIELD_BYTE_ORDER_MSB, FIELD_COMPRESSED_DATA,
    FIELD_COMPRESSED_DATA_SIZE, FIELD_DIM_SIZE, FIELD_ELEMENT_DATA_FILE,
    FIELD_ELEMENT_NUMBER_OF_CHANNELS, FIELD_ELEMENT_SPACING, FIELD_ELEMENT_TYPE,
    FIELD_IMAGE_ORIENTATION, FIELD_NDIMS, FIELD_OBJECT_TYPE, PATCH_PADDING,
};
use super::SequenceError;
use crate::schema::{FieldMap, ScalarType, TrackedFrame, FIELD_IMAGE_STATUS, FIELD_TIMESTAMP};

/// Options for writing a sequence file.
#[derive(Debug, Clone)]
pub struct SequenceWriteOptions {
    /// Compress the pixel region with zlib. Only the single-shot write path
    /// supports this; incremental append requires uncompressed pixels.
    pub use_compression: bool,
    /// Orientation the pixel rows are stored in on disk.
    pub image_orientation_in_file: ImageOrientation,
    /// Report 2D sequences as `X Y 1 N` instead of `X Y N`.
    pub output_2d_with_z_dimension: bool,
    /// Chunk size for streaming pixel bytes through the compressor.
    pub compression_chunk_size: usize,
}

impl Default for SequenceWriteOptions {
    fn default() -> Self {
        Self {
            use_compression: false,
            image_orientation_in_file: ImageOrientation::Mf,
            output_2d_with_z_dimension: false,
            compression_chunk_size: 1 << 20,
        }
    }
}

/// Statistics of a write session.
#[derive(Debug, Clone)]
pub struct SequenceStats {
    /// Frames whose pixel data is on disk.
    pub frame_count: usize,
    /// Pixel bytes written (compressed size when compression is on).
    pub pixel_bytes_written: u64,
    /// Whether the pixel region is compressed.
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterPhase {
    Created,
    HeaderPrepared,
    Finalized,
    Closed,
}

/// Frame geometry fixed when the header is prepared.
#[derive(Debug, Clone, Copy)]
struct FrameGeometry {
    width: usize,
    height: usize,
    depth: usize,
    num_components: usize,
    scalar_type: ScalarType,
}

impl FrameGeometry {
    fn pixel_stride(&self) -> usize {
        self.num_components * self.scalar_type.bytes_per_scalar()
    }

    fn frame_bytes(&self) -> u64 {
        (self.width * self.height * self.depth * self.pixel_stride()) as u64
    }
}

/// Mutable writer state. One struct behind one lock, so the invariant
/// "the offset only advances after a successful write" holds even when a
/// capture thread and a control thread share the writer.
struct WriterState {
    phase: WriterPhase,
    pending: Vec<TrackedFrame>,
    document_fields: FieldMap,
    geometry: Option<FrameGeometry>,
    ndims_written: usize,
    header_frames: usize,
    frames_written: usize,
    total_bytes_written: u64,
    pixel_file: Option<BufWriter<File>>,
    element_data_file_written: bool,
}

/// Writes an ordered tracked-frame sequence to disk.
///
/// Single-shot usage:
/// ```ignore
/// let writer = SequenceWriter::create("sweep.mha", SequenceWriteOptions::default())?;
/// for frame in frames {
///     writer.add_frame(frame)?;
/// }
/// writer.write()?;
/// ```
///
/// Incremental recording interleaves `add_frame` /
/// `append_images_to_header` / `append_images` batches and ends with
/// `finalize_header` and `close`. Callers are expected to `close()` after any
/// append failure so no half-written pixel file is left dangling.
pub struct SequenceWriter {
    header_path: PathBuf,
    pixel_path: Option<PathBuf>,
    temp_pixel_path: PathBuf,
    options: SequenceWriteOptions,
    state: Mutex<WriterState>,
}

impl SequenceWriter {
    /// Open a sequence for writing. The extension selects the layout:
    /// `.mha` stores pixels behind the header, `.mhd` in a sibling raw file.
    pub fn create(
        path: impl AsRef<Path>,
        options: SequenceWriteOptions,
    ) -> Result<Self, SequenceError> {
        let header_path = path.as_ref().to_path_buf();
        let extension = header_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let pixel_path = match extension.as_str() {
            "mha" => None,
            "mhd" => {
                let data_ext = if options.use_compression { "zraw" } else { "raw" };
                Some(header_path.with_extension(data_ext))
            }
            other => {
                return Err(SequenceError::UnrecognizedFormat(format!(
                    "unsupported sequence file extension '{other}'"
                )))
            }
        };

        // Creating the header up front surfaces unwritable paths immediately.
        File::create(&header_path)?;
        let temp_pixel_path = header_path.with_extension("pix.tmp");
        if temp_pixel_path.exists() {
            std::fs::remove_file(&temp_pixel_path)?;
        }

        Ok(Self {
            header_path,
            pixel_path,
            temp_pixel_path,
            options,
            state: Mutex::new(WriterState {
                phase: WriterPhase::Created,
                pending: Vec::new(),
                document_fields: FieldMap::new(),
                geometry: None,
                ndims_written: 0,
                header_frames: 0,
                frames_written: 0,
                total_bytes_written: 0,
                pixel_file: None,
                element_data_file_written: false,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set a document-level header field (e.g. `ElementSpacing`, `Offset`,
    /// `AnatomicalOrientation`). Must be called before `prepare_header`.
    pub fn set_document_field(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), SequenceError> {
        let mut state = self.lock();
        match state.phase {
            WriterPhase::Created => {
                state.document_fields.set(name, value);
                Ok(())
            }
            WriterPhase::Closed => Err(SequenceError::WriterClosed),
            _ => Err(SequenceError::HeaderFinalized),
        }
    }

    /// Queue a frame for writing.
    pub fn add_frame(&self, frame: TrackedFrame) -> Result<(), SequenceError> {
        let mut state = self.lock();
        if state.phase == WriterPhase::Closed {
            return Err(SequenceError::WriterClosed);
        }
        if state.phase == WriterPhase::Finalized {
            return Err(SequenceError::HeaderFinalized);
        }
        if let Some(geometry) = state.geometry {
            let index = state.pending.len();
            if frame.image.scalar_type() != geometry.scalar_type
                || frame.image.num_components() != geometry.num_components
            {
                return Err(SequenceError::MixedFrameTypes { index });
            }
            if frame.image.width() > geometry.width
                || frame.image.height() > geometry.height
                || frame.image.depth() > geometry.depth
            {
                return Err(SequenceError::FrameSizeMismatch {
                    index,
                    expected: geometry.frame_bytes(),
                    actual: frame.image.byte_len() as u64,
                });
            }
        }
        state.pending.push(frame);
        Ok(())
    }

    /// Number of frames queued so far.
    pub fn frame_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Write session statistics.
    pub fn stats(&self) -> SequenceStats {
        let state = self.lock();
        SequenceStats {
            frame_count: state.frames_written,
            pixel_bytes_written: state.total_bytes_written,
            compressed: self.options.use_compression,
        }
    }

    /// Fix the frame geometry and write the provisional header.
    ///
    /// The frame-count component of `DimSize` is written as a space-padded
    /// placeholder, patched in place by `finalize_header` once the true count
    /// is known.
    pub fn prepare_header(&self) -> Result<(), SequenceError> {
        let mut state = self.lock();
        match state.phase {
            WriterPhase::Created => {}
            WriterPhase::HeaderPrepared => return Ok(()),
            WriterPhase::Finalized => return Err(SequenceError::HeaderFinalized),
            WriterPhase::Closed => return Err(SequenceError::WriterClosed),
        }
        if state.pending.is_empty() {
            return Err(SequenceError::EmptySequence);
        }

        // Maximum frame extent across the frames seen so far; smaller frames
        // are zero-padded into this extent on append.
        let first = &state.pending[0].image;
        let mut geometry = FrameGeometry {
            width: first.width(),
            height: first.height(),
            depth: first.depth(),
            num_components: first.num_components(),
            scalar_type: first.scalar_type(),
        };
        for (index, frame) in state.pending.iter().enumerate().skip(1) {
            if frame.image.scalar_type() != geometry.scalar_type
                || frame.image.num_components() != geometry.num_components
            {
                return Err(SequenceError::MixedFrameTypes { index });
            }
            geometry.width = geometry.width.max(frame.image.width());
            geometry.height = geometry.height.max(frame.image.height());
            geometry.depth = geometry.depth.max(frame.image.depth());
        }

        let (ndims, dim_size) =
            header_dimensions(&geometry, state.pending.len(), self.options.output_2d_with_z_dimension);

        let file = OpenOptions::new().write(true).truncate(true).open(&self.header_path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{FIELD_OBJECT_TYPE} = Image")?;
        writeln!(writer, "{FIELD_NDIMS} = {ndims}")?;
        writeln!(writer, "{FIELD_BINARY_DATA} = True")?;
        writeln!(writer, "{FIELD_BYTE_ORDER_MSB} = False")?;
        writeln!(
            writer,
            "{FIELD_COMPRESSED_DATA} = {}",
            if self.options.use_compression { "True" } else { "False" }
        )?;
        if self.options.use_compression {
            writeln!(writer, "{FIELD_COMPRESSED_DATA_SIZE} = 0{}", " ".repeat(PATCH_PADDING))?;
        }
        writeln!(writer, "{FIELD_DIM_SIZE} = {dim_size}{}", " ".repeat(PATCH_PADDING))?;
        writeln!(writer, "{FIELD_ELEMENT_TYPE} = {}", element_type_for(geometry.scalar_type))?;
        writeln!(
            writer,
            "{FIELD_ELEMENT_NUMBER_OF_CHANNELS} = {}",
            geometry.num_components
        )?;
        if state.document_fields.get(FIELD_ELEMENT_SPACING).is_none() {
            writeln!(writer, "{FIELD_ELEMENT_SPACING} = 1 1 1")?;
        }
        writeln!(
            writer,
            "{FIELD_IMAGE_ORIENTATION} = {}",
            self.options.image_orientation_in_file.as_str()
        )?;
        for (name, value) in state.document_fields.iter() {
            writeln!(writer, "{name} = {value}")?;
        }
        writer.flush()?;

        state.geometry = Some(geometry);
        state.ndims_written = ndims;
        state.phase = WriterPhase::HeaderPrepared;
        Ok(())
    }

    /// Append per-frame metadata lines for frames added since the last call.
    ///
    /// With `only_tracker_data` the image-status field is skipped, for
    /// recordings that keep tracking streams but discard pixels.
    pub fn append_images_to_header(&self, only_tracker_data: bool) -> Result<(), SequenceError> {
        let mut state = self.lock();
        match state.phase {
            WriterPhase::HeaderPrepared => {}
            WriterPhase::Created => return Err(SequenceError::HeaderNotPrepared),
            WriterPhase::Finalized => return Err(SequenceError::HeaderFinalized),
            WriterPhase::Closed => return Err(SequenceError::WriterClosed),
        }

        let file = OpenOptions::new().append(true).open(&self.header_path)?;
        let mut writer = BufWriter::new(file);
        for index in state.header_frames..state.pending.len() {
            let frame = &state.pending[index];
            writeln!(
                writer,
                "{} = {}",
                seq_frame_key(index, FIELD_TIMESTAMP),
                frame.timestamp
            )?;
            for (name, value) in frame.fields.iter() {
                if name == FIELD_TIMESTAMP || name == FIELD_IMAGE_STATUS {
                    continue;
                }
                writeln!(writer, "{} = {}", seq_frame_key(index, name), value)?;
            }
            if !only_tracker_data {
                let status = frame.fields.get(FIELD_IMAGE_STATUS).unwrap_or("OK");
                writeln!(writer, "{} = {}", seq_frame_key(index, FIELD_IMAGE_STATUS), status)?;
            }
        }
        writer.flush()?;
        state.header_frames = state.pending.len();
        Ok(())
    }

    /// Append pixel bytes of frames added since the last call, uncompressed.
    ///
    /// Compression is rejected here: a zlib stream's size is only known once
    /// all input is seen, which is incompatible with incremental append.
    pub fn append_images(&self) -> Result<(), SequenceError> {
        let mut state = self.lock();
        match state.phase {
            WriterPhase::HeaderPrepared => {}
            WriterPhase::Created => return Err(SequenceError::HeaderNotPrepared),
            WriterPhase::Finalized => return Err(SequenceError::HeaderFinalized),
            WriterPhase::Closed => return Err(SequenceError::WriterClosed),
        }
        if self.options.use_compression {
            return Err(SequenceError::AppendWithCompression);
        }
        let geometry = state.geometry.ok_or(SequenceError::HeaderNotPrepared)?;

        if state.pixel_file.is_none() {
            let target = match &self.pixel_path {
                Some(raw) => raw.clone(),
                None => self.temp_pixel_path.clone(),
            };
            let file = OpenOptions::new().create(true).append(true).open(&target)?;
            state.pixel_file = Some(BufWriter::new(file));
        }

        for index in state.frames_written..state.pending.len() {
            let bytes = encode_frame_for_file(
                &state.pending[index],
                &geometry,
                self.options.image_orientation_in_file,
                index,
            )?;
            let writer = state
                .pixel_file
                .as_mut()
                .ok_or(SequenceError::HeaderNotPrepared)?;
            writer.write_all(&bytes)?;
            state.frames_written += 1;
            state.total_bytes_written += bytes.len() as u64;
        }
        if let Some(writer) = state.pixel_file.as_mut() {
            writer.flush()?;
        }
        debug!(
            "appended pixel data, {} frames / {} bytes on disk",
            state.frames_written, state.total_bytes_written
        );
        Ok(())
    }

    /// Patch the true frame count into `DimSize` (and `NDims` when the
    /// sequence turned out longer than a single frame) and write the
    /// `ElementDataFile` terminator. Idempotent.
    pub fn finalize_header(&self) -> Result<(), SequenceError> {
        let mut state = self.lock();
        match state.phase {
            WriterPhase::HeaderPrepared | WriterPhase::Finalized => {}
            WriterPhase::Created => return Err(SequenceError::HeaderNotPrepared),
            WriterPhase::Closed => return Err(SequenceError::WriterClosed),
        }
        let geometry = state.geometry.ok_or(SequenceError::HeaderNotPrepared)?;

        let count = state.frames_written.max(state.header_frames).max(
            if state.phase == WriterPhase::HeaderPrepared {
                state.pending.len()
            } else {
                0
            },
        );
        let (ndims, dim_size) =
            header_dimensions(&geometry, count, self.options.output_2d_with_z_dimension);
        if ndims != state.ndims_written {
            patch_header_field(&self.header_path, FIELD_NDIMS, &ndims.to_string())?;
            state.ndims_written = ndims;
        }
        patch_header_field(&self.header_path, FIELD_DIM_SIZE, &dim_size)?;

        if !state.element_data_file_written {
            let value = match &self.pixel_path {
                Some(raw) => raw
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(ELEMENT_DATA_FILE_LOCAL)
                    .to_string(),
                None => ELEMENT_DATA_FILE_LOCAL.to_string(),
            };
            let file = OpenOptions::new().append(true).open(&self.header_path)?;
            let mut writer = BufWriter::new(file);
            writeln!(writer, "{FIELD_ELEMENT_DATA_FILE} = {value}")?;
            writer.flush()?;
            state.element_data_file_written = true;
        }
        state.phase = WriterPhase::Finalized;
        Ok(())
    }

    /// Patch a single named header field in place without rewriting the file.
    pub fn update_field_in_image_header(
        &self,
        name: &str,
        value: &str,
    ) -> Result<(), SequenceError> {
        let state = self.lock();
        if state.phase == WriterPhase::Closed {
            return Err(SequenceError::WriterClosed);
        }
        drop(state);
        patch_header_field(&self.header_path, name, value)
    }

    /// Single-shot write of everything queued: header, per-frame metadata and
    /// pixel data (zlib-compressed when configured), then finalize and close.
    pub fn write(&self) -> Result<SequenceStats, SequenceError> {
        let result = self.write_inner();
        if let Err(e) = &result {
            error!("sequence write failed: {e}");
            // Leave no dangling half-written pixel file behind.
            let _ = self.close();
        }
        result
    }

    fn write_inner(&self) -> Result<SequenceStats, SequenceError> {
        self.prepare_header()?;
        self.append_images_to_header(false)?;
        if self.options.use_compression {
            self.finalize_header()?;
            self.write_compressed_pixels()?;
        } else {
            self.append_images()?;
            self.finalize_header()?;
        }
        self.close()?;
        Ok(self.stats())
    }

    /// Stream every queued frame through a zlib encoder in fixed-size chunks
    /// and back-patch the resulting byte count into `CompressedDataSize`.
    fn write_compressed_pixels(&self) -> Result<(), SequenceError> {
        let mut state = self.lock();
        let geometry = state.geometry.ok_or(SequenceError::HeaderNotPrepared)?;

        let (mut file, start) = match &self.pixel_path {
            Some(raw) => (File::create(raw)?, 0u64),
            None => {
                let mut file = OpenOptions::new().append(true).open(&self.header_path)?;
                let start = file.seek(SeekFrom::End(0))?;
                (file, start)
            }
        };

        let chunk_size = self.options.compression_chunk_size.max(1);
        let mut encoder = ZlibEncoder::new(BufWriter::new(&mut file), Compression::default());
        for index in 0..state.pending.len() {
            let bytes = encode_frame_for_file(
                &state.pending[index],
                &geometry,
                self.options.image_orientation_in_file,
                index,
            )?;
            for chunk in bytes.chunks(chunk_size) {
                encoder.write_all(chunk)?;
            }
        }
        let mut writer = encoder.finish()?;
        writer.flush()?;
        drop(writer);
        let end = file.seek(SeekFrom::End(0))?;
        let compressed_size = end - start;

        state.frames_written = state.pending.len();
        state.total_bytes_written += compressed_size;
        drop(state);

        patch_header_field(
            &self.header_path,
            FIELD_COMPRESSED_DATA_SIZE,
            &compressed_size.to_string(),
        )
    }

    /// Release file handles; on `.mha` files move the staged pixel bytes in
    /// behind the header. Safe to call multiple times, including after errors.
    pub fn close(&self) -> Result<(), SequenceError> {
        let mut state = self.lock();
        if state.phase == WriterPhase::Closed {
            return Ok(());
        }
        if let Some(mut writer) = state.pixel_file.take() {
            writer.flush()?;
        }
        if self.pixel_path.is_none() && self.temp_pixel_path.exists() {
            move_data_in_files(&self.temp_pixel_path, &self.header_path, true)?;
        }
        state.phase = WriterPhase::Closed;
        Ok(())
    }
}

/// Derive `NDims` and the `DimSize` value from geometry and frame count.
fn header_dimensions(
    geometry: &FrameGeometry,
    frame_count: usize,
    with_z_dimension: bool,
) -> (usize, String) {
    let (w, h, d) = (geometry.width, geometry.height, geometry.depth);
    if d > 1 {
        if frame_count == 1 {
            (3, format!("{w} {h} {d}"))
        } else {
            (4, format!("{w} {h} {d} {frame_count}"))
        }
    } else if with_z_dimension {
        (4, format!("{w} {h} 1 {frame_count}"))
    } else if frame_count == 1 {
        (2, format!("{w} {h}"))
    } else {
        (3, format!("{w} {h} {frame_count}"))
    }
}

/// Convert one frame's pixels from the canonical memory orientation to the
/// file orientation, zero-padding into the declared frame extent if needed.
fn encode_frame_for_file(
    frame: &TrackedFrame,
    geometry: &FrameGeometry,
    file_orientation: ImageOrientation,
    index: usize,
) -> Result<Vec<u8>, SequenceError> {
    let image = &frame.image;
    let pixel_stride = geometry.pixel_stride();
    let mut bytes = image.data().to_le_bytes();

    let (flip_x, flip_y) = ImageOrientation::Mf.flips_to(file_orientation);
    flip_frame_bytes(
        &mut bytes,
        image.width(),
        image.height(),
        image.depth(),
        pixel_stride,
        flip_x,
        flip_y,
    );

    if image.width() != geometry.width
        || image.height() != geometry.height
        || image.depth() != geometry.depth
    {
        bytes = pad_to_extent(
            &bytes,
            (image.width(), image.height(), image.depth()),
            (geometry.width, geometry.height, geometry.depth),
            pixel_stride,
        );
    }

    if bytes.len() as u64 != geometry.frame_bytes() {
        return Err(SequenceError::FrameSizeMismatch {
            index,
            expected: geometry.frame_bytes(),
            actual: bytes.len() as u64,
        });
    }
    Ok(bytes)
}

/// Copy a smaller frame into the top-left corner of the declared extent.
fn pad_to_extent(
    bytes: &[u8],
    (fw, fh, fd): (usize, usize, usize),
    (dw, dh, dd): (usize, usize, usize),
    pixel_stride: usize,
) -> Vec<u8> {
    let mut padded = vec![0u8; dw * dh * dd * pixel_stride];
    let src_row = fw * pixel_stride;
    let dst_row = dw * pixel_stride;
    for z in 0..fd.min(dd) {
        for y in 0..fh.min(dh) {
            let src = (z * fh + y) * src_row;
            let dst = (z * dh + y) * dst_row;
            padded[dst..dst + src_row].copy_from_slice(&bytes[src..src + src_row]);
        }
    }
    padded
}

/// Overwrite the value of a header field in place. The line must already
/// exist and the new value must fit in the space the line occupies.
fn patch_header_field(path: &Path, name: &str, value: &str) -> Result<(), SequenceError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut offset: u64 = 0;
    let mut target: Option<(u64, usize, bool)> = None;
    {
        let mut reader = BufReader::new(&mut file);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            if let Some((field, _)) = super::format::parse_header_line(text.trim_end()) {
                if field == name {
                    target = Some((offset, read, line.ends_with(b"\n")));
                    break;
                }
                if field == FIELD_ELEMENT_DATA_FILE {
                    // Binary pixel data may follow; stop scanning.
                    break;
                }
            }
            offset += read as u64;
        }
    }

    let (line_start, line_len, has_newline) =
        target.ok_or_else(|| SequenceError::FieldNotFound(name.to_string()))?;
    // "<name> = <value...>\n"
    let prefix = name.len() + 3;
    let available = line_len.saturating_sub(prefix + usize::from(has_newline));
    if value.len() > available {
        return Err(SequenceError::PatchValueTooLong {
            field: name.to_string(),
            value: value.to_string(),
        });
    }
    let mut patched = value.as_bytes().to_vec();
    patched.resize(available, b' ');
    file.seek(SeekFrom::Start(line_start + prefix as u64))?;
    file.write_all(&patched)?;
    file.flush()?;
    Ok(())
}

/// Append (or copy) the content of one file onto another, then remove the
/// source. Runs in bounded-size chunks.
pub(super) fn move_data_in_files(
    source: &Path,
    dest: &Path,
    append: bool,
) -> Result<(), SequenceError> {
    let mut src = File::open(source)?;
    let mut dst = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(dest)?;
    let mut buffer = vec![0u8; 8 << 20];
    loop {
        let read = src.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        dst.write_all(&buffer[..read])?;
    }
    dst.flush()?;
    drop(src);
    std::fs::remove_file(source)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ImageBuffer, PixelData, TrackedFrame};
    use tempfile::tempdir;

    fn test_frame(value: u8, width: usize, height: usize) -> TrackedFrame {
        let data = PixelData::U8(vec![value; width * height]);
        let image = ImageBuffer::from_data(width, height, 1, 1, data).unwrap();
        TrackedFrame::new(image, value as f64)
    }

    #[test]
    fn test_create_rejects_unknown_extension() {
        let dir = tempdir().unwrap();
        let result = SequenceWriter::create(
            dir.path().join("sweep.bin"),
            SequenceWriteOptions::default(),
        );
        assert!(matches!(result, Err(SequenceError::UnrecognizedFormat(_))));
    }

    #[test]
    fn test_append_requires_prepared_header() {
        let dir = tempdir().unwrap();
        let writer = SequenceWriter::create(
            dir.path().join("sweep.mha"),
            SequenceWriteOptions::default(),
        )
        .unwrap();
        writer.add_frame(test_frame(1, 4, 4)).unwrap();
        assert!(matches!(
            writer.append_images(),
            Err(SequenceError::HeaderNotPrepared)
        ));
    }

    #[test]
    fn test_append_with_compression_rejected() {
        let dir = tempdir().unwrap();
        let writer = SequenceWriter::create(
            dir.path().join("sweep.mha"),
            SequenceWriteOptions {
                use_compression: true,
                ..Default::default()
            },
        )
        .unwrap();
        writer.add_frame(test_frame(1, 4, 4)).unwrap();
        writer.prepare_header().unwrap();
        assert!(matches!(
            writer.append_images(),
            Err(SequenceError::AppendWithCompression)
        ));
    }

    #[test]
    fn test_prepare_empty_sequence_fails() {
        let dir = tempdir().unwrap();
        let writer = SequenceWriter::create(
            dir.path().join("sweep.mha"),
            SequenceWriteOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            writer.prepare_header(),
            Err(SequenceError::EmptySequence)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let writer = SequenceWriter::create(
            dir.path().join("sweep.mha"),
            SequenceWriteOptions::default(),
        )
        .unwrap();
        writer.add_frame(test_frame(1, 4, 4)).unwrap();
        writer.write().unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_header_dimensions_conventions() {
        let geometry = FrameGeometry {
            width: 64,
            height: 48,
            depth: 1,
            num_components: 1,
            scalar_type: ScalarType::U8,
        };
        assert_eq!(header_dimensions(&geometry, 1, false), (2, "64 48".into()));
        assert_eq!(header_dimensions(&geometry, 7, false), (3, "64 48 7".into()));
        assert_eq!(header_dimensions(&geometry, 7, true), (4, "64 48 1 7".into()));
        let volume = FrameGeometry { depth: 10, ..geometry };
        assert_eq!(header_dimensions(&volume, 1, false), (3, "64 48 10".into()));
        assert_eq!(header_dimensions(&volume, 3, false), (4, "64 48 10 3".into()));
    }

    #[test]
    fn test_pad_to_extent() {
        // 2x2 frame into 3x2 declared extent
        let bytes = vec![1, 2, 3, 4];
        let padded = pad_to_extent(&bytes, (2, 2, 1), (3, 2, 1), 1);
        assert_eq!(padded, vec![1, 2, 0, 3, 4, 0]);
    }

    #[test]
    fn test_patch_header_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("header.mha");
        std::fs::write(&path, "NDims = 3\nDimSize = 4 4 0          \nElementDataFile = LOCAL\n")
            .unwrap();
        patch_header_field(&path, "DimSize", "4 4 12").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("DimSize = 4 4 12"));
        assert_eq!(text.len(), "NDims = 3\nDimSize = 4 4 0          \nElementDataFile = LOCAL\n".len());
        assert!(matches!(
            patch_header_field(&path, "Missing", "x"),
            Err(SequenceError::FieldNotFound(_))
        ));
    }
}
