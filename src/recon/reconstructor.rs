//! The reconstruction state machine: extent computation, frame insertion,
//! lazy output regeneration, hole filling and durable storage.

use std::path::Path;

use log::{debug, error, info};

use crate::schema::{
    ReconstructionConfig, TrackedFrame, TransformError, TransformName, TransformRepository,
};
use crate::sequence::{
    SequenceWriteOptions, SequenceWriter, FIELD_ANATOMICAL_ORIENTATION, FIELD_ELEMENT_SPACING,
    FIELD_OFFSET,
};

use super::{
    add_image_to_extent, bounds_to_extent_and_origin, empty_bounds, paste_slice,
    AccumulationBuffer, HoleFiller, PasteOptions, ReconError, VoxelVolume,
};

struct ReconOutput {
    volume: VoxelVolume,
    accumulation: AccumulationBuffer,
}

/// Accumulates tracked 2D slices into a reconstructed 3D volume.
///
/// Lifecycle: construct with a validated configuration, establish the output
/// extent (explicitly from the configuration or via
/// [`VolumeReconstructor::set_output_extent_from_frame_list`]), insert frames
/// with [`VolumeReconstructor::add_tracked_frame`], then read the result with
/// [`VolumeReconstructor::get_reconstructed_volume`] or persist it with
/// [`VolumeReconstructor::save_reconstructed_volume`].
pub struct VolumeReconstructor {
    config: ReconstructionConfig,
    paste_options: PasteOptions,
    transform_name: TransformName,
    output: Option<ReconOutput>,
    reconstructed: Option<VoxelVolume>,
    /// Bumped on every mutation; drives lazy output regeneration.
    modified_count: u64,
    reconstructed_count: u64,
    frames_seen: usize,
    inserted_frames: usize,
    skipped_invalid: usize,
}

impl VolumeReconstructor {
    pub fn new(config: ReconstructionConfig) -> Result<Self, ReconError> {
        config.validate()?;
        let transform_name = TransformName::new(
            config.image_coordinate_frame.clone(),
            config.reference_coordinate_frame.clone(),
        )?;
        let paste_options = PasteOptions::from_config(&config);
        Ok(Self {
            config,
            paste_options,
            transform_name,
            output: None,
            reconstructed: None,
            modified_count: 0,
            reconstructed_count: 0,
            frames_seen: 0,
            inserted_frames: 0,
            skipped_invalid: 0,
        })
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    /// The image→reference transform every frame must carry.
    pub fn image_to_reference_name(&self) -> &TransformName {
        &self.transform_name
    }

    /// Scan a frame list, project every valid slice's corners into reference
    /// space and size the output grid to the resulting bounding box.
    ///
    /// A frame whose transform cannot be resolved at all fails the whole
    /// operation (the coordinate frames are misconfigured); a frame whose
    /// transform is merely flagged invalid is skipped. If no frame has a
    /// valid pose the computation fails and nothing is allocated.
    pub fn set_output_extent_from_frame_list(
        &mut self,
        frames: &[TrackedFrame],
        repository: &mut TransformRepository,
    ) -> Result<(), ReconError> {
        if frames.is_empty() {
            return Err(ReconError::EmptyFrameList);
        }

        let mut bounds = empty_bounds();
        let mut valid_frames = 0usize;
        for frame in frames {
            repository.set_transforms(frame)?;
            let (matrix, valid) = match repository.get_transform(&self.transform_name) {
                Ok(resolved) => resolved,
                Err(e) => {
                    error!(
                        "failed to get transform '{}' from the repository: {e}",
                        self.transform_name
                    );
                    return Err(e.into());
                }
            };
            if !valid {
                continue;
            }
            valid_frames += 1;
            add_image_to_extent(
                &mut bounds,
                &frame.image,
                self.config.clip_rectangle_origin,
                self.config.clip_rectangle_size,
                &matrix,
            );
        }

        debug!(
            "automatic volume extent computation used {valid_frames} out of {} frames",
            frames.len()
        );
        if valid_frames == 0 {
            error!(
                "automatic volume extent computation failed: no valid '{}' transform in the \
                 whole sequence",
                self.transform_name
            );
            return Err(ReconError::NoValidFrames {
                transform: self.transform_name.clone(),
            });
        }

        let (extent, origin) = bounds_to_extent_and_origin(&bounds, self.config.output_spacing);
        self.allocate_output(extent, origin, &frames[0])?;
        Ok(())
    }

    fn allocate_output(
        &mut self,
        extent: [i32; 6],
        origin: [f64; 3],
        reference_frame: &TrackedFrame,
    ) -> Result<(), ReconError> {
        let volume = VoxelVolume::allocate(
            extent,
            self.config.output_spacing,
            origin,
            reference_frame.image.scalar_type(),
            reference_frame.image.num_components() + 1,
        )?;
        let accumulation = AccumulationBuffer::allocate(extent)?;
        self.output = Some(ReconOutput {
            volume,
            accumulation,
        });
        self.reconstructed = None;
        self.modified_count += 1;
        Ok(())
    }

    /// Insert one tracked frame. Returns whether the slice went into the
    /// volume: frames skipped by the configured interval and frames whose
    /// pose is invalid (tracking lost) report `false` without failing.
    pub fn add_tracked_frame(
        &mut self,
        frame: &TrackedFrame,
        repository: &mut TransformRepository,
    ) -> Result<bool, ReconError> {
        let sequence_index = self.frames_seen;
        self.frames_seen += 1;
        if sequence_index % self.config.skip_interval != 0 {
            return Ok(false);
        }

        if self.output.is_none() {
            match (self.config.output_extent, self.config.output_origin) {
                (Some(extent), Some(origin)) => self.allocate_output(extent, origin, frame)?,
                _ => return Err(ReconError::ExtentUnknown),
            }
        }

        repository.set_transforms(frame)?;
        let (matrix, valid) = match repository.get_transform(&self.transform_name) {
            Ok(resolved) => resolved,
            Err(e @ TransformError::NotFound(_)) => {
                error!(
                    "failed to get transform '{}' from the repository",
                    self.transform_name
                );
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        if !valid {
            self.skipped_invalid += 1;
            debug!(
                "transform '{}' is invalid for the current frame; the frame is not inserted",
                self.transform_name
            );
            return Ok(false);
        }

        let output = self.output.as_mut().ok_or(ReconError::ExtentUnknown)?;
        paste_slice(
            &mut output.volume,
            &mut output.accumulation,
            &frame.image,
            &matrix,
            &self.paste_options,
        )?;
        self.inserted_frames += 1;
        self.modified_count += 1;
        Ok(true)
    }

    /// Regenerate the externally visible volume if anything changed since the
    /// last regeneration; otherwise a no-op.
    pub fn update_reconstructed_volume(&mut self) -> Result<(), ReconError> {
        let output = self.output.as_ref().ok_or(ReconError::ExtentUnknown)?;
        if self.reconstructed.is_some() && self.reconstructed_count >= self.modified_count {
            return Ok(());
        }

        let volume = if self.config.fill_holes {
            self.generate_hole_filled_volume_inner(output)?
        } else {
            output.volume.clone()
        };
        self.reconstructed = Some(volume);
        self.reconstructed_count = self.modified_count;
        Ok(())
    }

    fn generate_hole_filled_volume_inner(
        &self,
        output: &ReconOutput,
    ) -> Result<VoxelVolume, ReconError> {
        info!("hole filling started");
        let filler = HoleFiller::new(
            &self.config.hole_fill_kernels,
            self.config.number_of_threads,
        );
        let filled = filler.apply(&output.volume, &output.accumulation)?;
        info!("hole filling finished");
        Ok(filled)
    }

    /// Run the hole-filling pass regardless of the `fill_holes` flag and
    /// return the filled volume.
    pub fn generate_hole_filled_volume(&mut self) -> Result<VoxelVolume, ReconError> {
        let output = self.output.as_ref().ok_or(ReconError::ExtentUnknown)?;
        self.generate_hole_filled_volume_inner(output)
    }

    /// The current reconstructed volume (value components + trailing alpha).
    pub fn get_reconstructed_volume(&mut self) -> Result<&VoxelVolume, ReconError> {
        self.update_reconstructed_volume()?;
        self.reconstructed.as_ref().ok_or(ReconError::ExtentUnknown)
    }

    /// The value channel of the reconstructed volume.
    pub fn extract_gray_levels(&mut self) -> Result<VoxelVolume, ReconError> {
        self.update_reconstructed_volume()?;
        let volume = self.reconstructed.as_ref().ok_or(ReconError::ExtentUnknown)?;
        volume.extract_component(0)
    }

    /// The alpha (observed-voxel) channel of the reconstructed volume.
    pub fn extract_alpha(&mut self) -> Result<VoxelVolume, ReconError> {
        self.update_reconstructed_volume()?;
        let volume = self.reconstructed.as_ref().ok_or(ReconError::ExtentUnknown)?;
        volume.extract_component(volume.image().num_components() - 1)
    }

    /// Store the reconstructed volume through the sequence codec, in the
    /// patient-space orientation convention RAI.
    pub fn save_reconstructed_volume(
        &mut self,
        path: impl AsRef<Path>,
        alpha: bool,
        use_compression: bool,
    ) -> Result<(), ReconError> {
        let volume = if alpha {
            self.extract_alpha()?
        } else {
            self.extract_gray_levels()?
        };

        let spacing = volume.spacing();
        let origin = volume.origin();
        let writer = SequenceWriter::create(
            path,
            SequenceWriteOptions {
                use_compression,
                ..Default::default()
            },
        )?;
        writer.set_document_field(FIELD_ANATOMICAL_ORIENTATION, "RAI")?;
        writer.set_document_field(
            FIELD_ELEMENT_SPACING,
            format!("{} {} {}", spacing[0], spacing[1], spacing[2]),
        )?;
        writer.set_document_field(
            FIELD_OFFSET,
            format!("{} {} {}", origin[0], origin[1], origin[2]),
        )?;
        writer.add_frame(TrackedFrame::new(volume.into_image(), 0.0))?;
        writer.write()?;
        Ok(())
    }

    /// Zero the accumulation grids for a new run, keeping the extent.
    pub fn reset(&mut self) -> Result<(), ReconError> {
        if let Some(output) = &mut self.output {
            output.volume.clear()?;
            output.accumulation.clear();
        }
        self.reconstructed = None;
        self.reconstructed_count = 0;
        self.modified_count += 1;
        self.frames_seen = 0;
        self.inserted_frames = 0;
        self.skipped_invalid = 0;
        Ok(())
    }

    /// Output extent, once known.
    pub fn output_extent(&self) -> Option<[i32; 6]> {
        self.output.as_ref().map(|o| o.volume.extent())
    }

    /// Voxels touched by at least one sample.
    pub fn observed_voxels(&self) -> Option<usize> {
        self.output.as_ref().map(|o| o.accumulation.observed_voxels())
    }

    /// Frames inserted into the volume so far.
    pub fn inserted_frame_count(&self) -> usize {
        self.inserted_frames
    }

    /// Frames skipped because their pose was invalid, for data-quality
    /// assessment by the caller.
    pub fn skipped_invalid_count(&self) -> usize {
        self.skipped_invalid
    }
}
