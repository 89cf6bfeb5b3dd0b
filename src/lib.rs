//! Streaming volume reconstruction from tracked freehand ultrasound sweeps.
//!
//! This crate accumulates a sequence of spatially tracked 2D image slices
//! into a 3D voxel grid ("paste slices into a volume, then fill holes") and
//! provides the companion sequence container format used to persist tracked
//! frames and reconstructed volumes.
//!
//! # Architecture
//!
//! The crate is split into three modules:
//!
//! - `schema`: configuration, tracked-frame and transform types
//! - `sequence`: the header + binary-pixel-blob container format
//! - `recon`: extent computation, slice insertion, compounding, hole filling
//!
//! # Example
//!
//! ```rust,no_run
//! use sonovol::{
//!     recon::VolumeReconstructor,
//!     schema::{ReconstructionConfig, TransformRepository},
//!     sequence::{SequenceReadOptions, SequenceReader},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReconstructionConfig::default();
//! let mut reconstructor = VolumeReconstructor::new(config)?;
//! let mut repository = TransformRepository::new();
//!
//! let reader = SequenceReader::read("sweep.mha", SequenceReadOptions::default())?;
//! reconstructor.set_output_extent_from_frame_list(reader.frames(), &mut repository)?;
//! for frame in reader.frames() {
//!     reconstructor.add_tracked_frame(frame, &mut repository)?;
//! }
//! reconstructor.save_reconstructed_volume("volume.mha", false, true)?;
//! # Ok(())
//! # }
//! ```

pub mod recon;
pub mod schema;
pub mod sequence;

// Re-export commonly used types
pub use recon::{ReconError, VolumeReconstructor, VoxelVolume};
pub use schema::{ReconstructionConfig, TrackedFrame, TransformRepository};
pub use sequence::{SequenceReader, SequenceWriter};
