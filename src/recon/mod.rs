//! Volume reconstruction: accumulate tracked 2D slices into a 3D voxel grid.
//!
//! The module is split by stage:
//!
//! - `volume`: the output voxel grid and its parallel accumulation buffer
//! - `extent`: automatic output extent computation from projected slice corners
//! - `paste`: the slice-insertion primitive (sampling, compounding, clipping)
//! - `hole_fill`: kernels that synthesize values for unobserved voxels
//! - `reconstructor`: the orchestrating state machine

mod extent;
mod hole_fill;
mod paste;
mod reconstructor;
mod volume;

pub use extent::*;
pub use hole_fill::*;
pub use paste::*;
pub use reconstructor::*;
pub use volume::*;

use crate::schema::{ConfigError, TransformError, TransformName};
use crate::sequence::SequenceError;

/// Errors of the reconstruction engine.
#[derive(Debug, thiserror::Error)]
pub enum ReconError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error("tracked frame list is empty")]
    EmptyFrameList,
    #[error(
        "no frame in the sequence carries a valid {transform} transform; \
         check the configured image and reference coordinate frames"
    )]
    NoValidFrames { transform: TransformName },
    #[error(
        "output volume allocation of {bytes} bytes failed; \
         reduce the output extent or increase the output spacing"
    )]
    AllocationFailed { bytes: usize },
    #[error(
        "output extent is unknown; configure it explicitly or call \
         set_output_extent_from_frame_list first"
    )]
    ExtentUnknown,
    #[error("slice scalar type or component count does not match the output volume")]
    ScalarTypeMismatch,
    #[error("slices must be 2D images (depth 1)")]
    SliceNotTwoDimensional,
    #[error("slices with {0} components are not supported (maximum 4)")]
    UnsupportedComponentCount(usize),
    #[error("image-to-reference transform is singular")]
    SingularTransform,
    #[error("failed to build the worker thread pool: {0}")]
    ThreadPool(String),
}

/// Run a parallel region on the configured number of worker threads
/// (0 = the library-wide default pool).
pub(crate) fn run_parallel<F>(number_of_threads: usize, run: F) -> Result<(), ReconError>
where
    F: FnOnce() + Send,
{
    if number_of_threads > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(number_of_threads)
            .build()
            .map_err(|e| ReconError::ThreadPool(e.to_string()))?;
        pool.install(run);
    } else {
        run();
    }
    Ok(())
}
