//! Output voxel grid and its accumulation buffer.

use crate::schema::{FrameError, ImageBuffer, ScalarType};

use super::ReconError;

/// Accumulated weight of one full-weight slice sample (fixed point).
pub const ACCUMULATION_WEIGHT_UNIT: u32 = 256;

/// Opaque value written into the trailing alpha component of touched voxels.
pub const ALPHA_OPAQUE: f64 = 255.0;

/// The reconstructed output grid.
///
/// Voxel `(i, j, k)` sits at reference position
/// `origin + spacing * (extent_min + (i, j, k))`. Extent bounds are inclusive
/// voxel indices per axis. The image carries the input components plus one
/// trailing alpha component marking observed voxels.
#[derive(Debug, Clone)]
pub struct VoxelVolume {
    extent: [i32; 6],
    spacing: [f64; 3],
    origin: [f64; 3],
    image: ImageBuffer,
}

impl VoxelVolume {
    /// Allocate a zero-initialized volume. Allocation failure is reported,
    /// not propagated as an allocator abort.
    pub fn allocate(
        extent: [i32; 6],
        spacing: [f64; 3],
        origin: [f64; 3],
        scalar_type: ScalarType,
        num_components: usize,
    ) -> Result<Self, ReconError> {
        let (nx, ny, nz) = extent_dimensions(extent);
        let image = ImageBuffer::allocate(scalar_type, nx, ny, nz, num_components)
            .map_err(map_allocation_error)?;
        Ok(Self {
            extent,
            spacing,
            origin,
            image,
        })
    }

    pub fn extent(&self) -> [i32; 6] {
        self.extent
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    /// Voxel counts per axis.
    pub fn dimensions(&self) -> (usize, usize, usize) {
        extent_dimensions(self.extent)
    }

    pub fn num_voxels(&self) -> usize {
        let (nx, ny, nz) = self.dimensions();
        nx * ny * nz
    }

    pub fn image(&self) -> &ImageBuffer {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut ImageBuffer {
        &mut self.image
    }

    /// Consume the volume, returning its pixel buffer.
    pub fn into_image(self) -> ImageBuffer {
        self.image
    }

    /// Zero all voxels, keeping extent and allocation.
    pub fn clear(&mut self) -> Result<(), ReconError> {
        let fresh = ImageBuffer::allocate(
            self.image.scalar_type(),
            self.image.width(),
            self.image.height(),
            self.image.depth(),
            self.image.num_components(),
        )
        .map_err(map_allocation_error)?;
        self.image = fresh;
        Ok(())
    }

    /// Copy a single component into a new single-component volume.
    pub fn extract_component(&self, component: usize) -> Result<VoxelVolume, ReconError> {
        let (nx, ny, nz) = self.dimensions();
        let mut out = VoxelVolume::allocate(
            self.extent,
            self.spacing,
            self.origin,
            self.image.scalar_type(),
            1,
        )?;
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    out.image
                        .set_value_at(x, y, z, 0, self.image.value_at(x, y, z, component));
                }
            }
        }
        Ok(out)
    }
}

/// Per-voxel accumulated weight, parallel to the output grid.
///
/// A zero entry marks an unobserved ("hole") voxel; weighted-average
/// compounding divides by this weight, and the hole filler masks on it.
#[derive(Debug, Clone)]
pub struct AccumulationBuffer {
    data: Vec<u32>,
    dimensions: (usize, usize, usize),
}

impl AccumulationBuffer {
    pub fn allocate(extent: [i32; 6]) -> Result<Self, ReconError> {
        let dimensions = extent_dimensions(extent);
        let len = dimensions.0 * dimensions.1 * dimensions.2;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| ReconError::AllocationFailed {
                bytes: len * std::mem::size_of::<u32>(),
            })?;
        data.resize(len, 0);
        Ok(Self { data, dimensions })
    }

    pub fn dimensions(&self) -> (usize, usize, usize) {
        self.dimensions
    }

    pub fn data(&self) -> &[u32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u32] {
        &mut self.data
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Count of voxels touched by at least one sample.
    pub fn observed_voxels(&self) -> usize {
        self.data.iter().filter(|&&w| w > 0).count()
    }
}

/// Voxel counts per axis for an inclusive extent.
pub fn extent_dimensions(extent: [i32; 6]) -> (usize, usize, usize) {
    let span = |min: i32, max: i32| (max - min + 1).max(0) as usize;
    (
        span(extent[0], extent[1]),
        span(extent[2], extent[3]),
        span(extent[4], extent[5]),
    )
}

fn map_allocation_error(e: FrameError) -> ReconError {
    match e {
        FrameError::AllocationFailed { bytes } => ReconError::AllocationFailed { bytes },
        FrameError::SizeMismatch { expected, .. } => ReconError::AllocationFailed { bytes: expected },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_dimensions() {
        assert_eq!(extent_dimensions([0, 9, 0, 4, 0, 0]), (10, 5, 1));
        assert_eq!(extent_dimensions([2, 2, 0, 0, -1, 1]), (1, 1, 3));
    }

    #[test]
    fn test_allocate_and_clear() {
        let mut volume = VoxelVolume::allocate(
            [0, 3, 0, 3, 0, 1],
            [1.0, 1.0, 1.0],
            [0.0, 0.0, 0.0],
            crate::schema::ScalarType::U8,
            2,
        )
        .unwrap();
        assert_eq!(volume.dimensions(), (4, 4, 2));
        volume.image_mut().set_value_at(1, 2, 0, 0, 50.0);
        volume.clear().unwrap();
        assert_eq!(volume.image().value_at(1, 2, 0, 0), 0.0);
    }

    #[test]
    fn test_extract_component() {
        let mut volume = VoxelVolume::allocate(
            [0, 1, 0, 1, 0, 0],
            [1.0, 1.0, 1.0],
            [0.0, 0.0, 0.0],
            crate::schema::ScalarType::U8,
            2,
        )
        .unwrap();
        volume.image_mut().set_value_at(0, 0, 0, 0, 10.0);
        volume.image_mut().set_value_at(0, 0, 0, 1, 200.0);

        let gray = volume.extract_component(0).unwrap();
        assert_eq!(gray.image().num_components(), 1);
        assert_eq!(gray.image().value_at(0, 0, 0, 0), 10.0);
        let alpha = volume.extract_component(1).unwrap();
        assert_eq!(alpha.image().value_at(0, 0, 0, 0), 200.0);
    }

    #[test]
    fn test_accumulation_observed_count() {
        let mut acc = AccumulationBuffer::allocate([0, 1, 0, 1, 0, 0]).unwrap();
        assert_eq!(acc.observed_voxels(), 0);
        acc.data_mut()[2] = ACCUMULATION_WEIGHT_UNIT;
        assert_eq!(acc.observed_voxels(), 1);
    }
}
