//! Slice insertion: splat one tracked 2D slice into the output voxel grid.
//!
//! The loop is voxel-driven: every output voxel whose reference position
//! back-projects into the slice's pixel footprint samples the slice and
//! combines the value per the configured compounding mode. Work is
//! partitioned into disjoint z slabs, one writer per slab, so compounding
//! needs no cross-thread synchronization.

use nalgebra::{Matrix4, Vector4};
use rayon::prelude::*;

use crate::schema::{
    CalculationMode, FanConfig, ImageBuffer, InterpolationMode, OptimizationLevel,
    ReconstructionConfig, Scalar, ScalarType,
};

use super::{AccumulationBuffer, ReconError, VoxelVolume, ACCUMULATION_WEIGHT_UNIT, ALPHA_OPAQUE};

/// Half-thickness of the slice slab in pixel units; voxels whose
/// back-projection falls farther from the slice plane are not touched.
const SLICE_HALF_THICKNESS: f64 = 0.5;

/// Fixed-point scale of the full-optimization path (16.16).
const FIXED_ONE: i64 = 1 << 16;

/// Most components a slice may carry (value channels sampled per voxel).
const MAX_SLICE_COMPONENTS: usize = 4;

/// Options of the slice-insertion primitive.
#[derive(Debug, Clone)]
pub struct PasteOptions {
    pub interpolation: InterpolationMode,
    pub calculation: CalculationMode,
    pub optimization: OptimizationLevel,
    pub compounding: bool,
    pub clip_rectangle_origin: [i32; 2],
    pub clip_rectangle_size: [i32; 2],
    pub fan: Option<FanConfig>,
    pub number_of_threads: usize,
}

impl Default for PasteOptions {
    fn default() -> Self {
        Self {
            interpolation: InterpolationMode::default(),
            calculation: CalculationMode::default(),
            optimization: OptimizationLevel::default(),
            compounding: true,
            clip_rectangle_origin: [0, 0],
            clip_rectangle_size: [0, 0],
            fan: None,
            number_of_threads: 0,
        }
    }
}

impl PasteOptions {
    pub fn from_config(config: &ReconstructionConfig) -> Self {
        Self {
            interpolation: config.interpolation,
            calculation: config.calculation,
            optimization: config.optimization,
            compounding: config.compounding,
            clip_rectangle_origin: config.clip_rectangle_origin,
            clip_rectangle_size: config.clip_rectangle_size,
            fan: config.fan.clone(),
            number_of_threads: config.number_of_threads,
        }
    }
}

/// Fan clip test, precomputed from [`FanConfig`].
#[derive(Debug, Clone, Copy)]
struct FanGeometry {
    origin: [f64; 2],
    angle_min_deg: f64,
    angle_max_deg: f64,
    depth: f64,
}

impl FanGeometry {
    fn new(fan: &FanConfig) -> Self {
        Self {
            origin: fan.origin,
            angle_min_deg: fan.angles[0].min(fan.angles[1]),
            angle_max_deg: fan.angles[0].max(fan.angles[1]),
            depth: fan.depth,
        }
    }

    fn contains(&self, px: f64, py: f64) -> bool {
        let dx = px - self.origin[0];
        let dy = py - self.origin[1];
        let radius = (dx * dx + dy * dy).sqrt();
        if radius > self.depth {
            return false;
        }
        // Angle from the +y axis (beam direction), in degrees.
        let angle = dx.atan2(dy).to_degrees();
        angle >= self.angle_min_deg && angle <= self.angle_max_deg
    }
}

#[derive(Clone, Copy)]
struct SliceRegion {
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
    fan: Option<FanGeometry>,
}

#[derive(Clone, Copy)]
struct CompoundingOptions {
    interpolation: InterpolationMode,
    calculation: CalculationMode,
    compounding: bool,
}

/// Insert one 2D slice into the volume with the given image→reference pose.
pub fn paste_slice(
    volume: &mut VoxelVolume,
    accumulation: &mut AccumulationBuffer,
    slice: &ImageBuffer,
    image_to_reference: &Matrix4<f64>,
    options: &PasteOptions,
) -> Result<(), ReconError> {
    if slice.depth() != 1 {
        return Err(ReconError::SliceNotTwoDimensional);
    }
    if volume.image().scalar_type() != slice.scalar_type()
        || volume.image().num_components() != slice.num_components() + 1
    {
        return Err(ReconError::ScalarTypeMismatch);
    }
    if slice.num_components() > MAX_SLICE_COMPONENTS {
        return Err(ReconError::UnsupportedComponentCount(slice.num_components()));
    }

    let reference_to_image = image_to_reference
        .try_inverse()
        .ok_or(ReconError::SingularTransform)?;

    // Voxel index -> image pixel coordinates, as one homogeneous matrix.
    let extent = volume.extent();
    let spacing = volume.spacing();
    let origin = volume.origin();
    let mut voxel_to_reference = Matrix4::identity();
    for axis in 0..3 {
        voxel_to_reference[(axis, axis)] = spacing[axis];
        voxel_to_reference[(axis, 3)] = origin[axis] + spacing[axis] * extent[axis * 2] as f64;
    }
    let voxel_to_image = reference_to_image * voxel_to_reference;

    let mut region = SliceRegion {
        x_min: 0.0,
        x_max: (slice.width().saturating_sub(1)) as f64,
        y_min: 0.0,
        y_max: (slice.height().saturating_sub(1)) as f64,
        fan: options.fan.as_ref().map(FanGeometry::new),
    };
    if options.clip_rectangle_size[0] > 0 && options.clip_rectangle_size[1] > 0 {
        region.x_min = region.x_min.max(options.clip_rectangle_origin[0] as f64);
        region.x_max = region
            .x_max
            .min((options.clip_rectangle_origin[0] + options.clip_rectangle_size[0]) as f64);
        region.y_min = region.y_min.max(options.clip_rectangle_origin[1] as f64);
        region.y_max = region
            .y_max
            .min((options.clip_rectangle_origin[1] + options.clip_rectangle_size[1]) as f64);
    }

    let compounding = CompoundingOptions {
        interpolation: options.interpolation,
        calculation: options.calculation,
        compounding: options.compounding,
    };

    match volume.image().scalar_type() {
        ScalarType::U8 => paste_typed::<u8>(volume, accumulation, slice, &voxel_to_image, region, compounding, options),
        ScalarType::I8 => paste_typed::<i8>(volume, accumulation, slice, &voxel_to_image, region, compounding, options),
        ScalarType::U16 => paste_typed::<u16>(volume, accumulation, slice, &voxel_to_image, region, compounding, options),
        ScalarType::I16 => paste_typed::<i16>(volume, accumulation, slice, &voxel_to_image, region, compounding, options),
        ScalarType::U32 => paste_typed::<u32>(volume, accumulation, slice, &voxel_to_image, region, compounding, options),
        ScalarType::I32 => paste_typed::<i32>(volume, accumulation, slice, &voxel_to_image, region, compounding, options),
        ScalarType::F32 => paste_typed::<f32>(volume, accumulation, slice, &voxel_to_image, region, compounding, options),
        ScalarType::F64 => paste_typed::<f64>(volume, accumulation, slice, &voxel_to_image, region, compounding, options),
    }
}

#[allow(clippy::too_many_arguments)]
fn paste_typed<T: Scalar>(
    volume: &mut VoxelVolume,
    accumulation: &mut AccumulationBuffer,
    slice: &ImageBuffer,
    voxel_to_image: &Matrix4<f64>,
    region: SliceRegion,
    compounding: CompoundingOptions,
    options: &PasteOptions,
) -> Result<(), ReconError> {
    let (nx, ny, _nz) = volume.dimensions();
    let comps_in = slice.num_components();
    let comps_out = comps_in + 1;
    let width = slice.width();
    let height = slice.height();
    let optimization = options.optimization;

    let src = T::slice(slice.data()).ok_or(ReconError::ScalarTypeMismatch)?;
    let out = T::slice_mut(volume.image_mut().data_mut()).ok_or(ReconError::ScalarTypeMismatch)?;
    let acc = accumulation.data_mut();

    let out_stride = nx * ny * comps_out;
    let acc_stride = nx * ny;

    let run = || {
        out.par_chunks_mut(out_stride)
            .zip(acc.par_chunks_mut(acc_stride))
            .enumerate()
            .for_each(|(k, (out_slab, acc_slab))| {
                paste_plane::<T>(
                    k,
                    out_slab,
                    acc_slab,
                    src,
                    voxel_to_image,
                    (nx, ny),
                    (width, height, comps_in),
                    region,
                    compounding,
                    optimization,
                );
            });
    };

    super::run_parallel(options.number_of_threads, run)
}

#[allow(clippy::too_many_arguments)]
fn paste_plane<T: Scalar>(
    k: usize,
    out_slab: &mut [T],
    acc_slab: &mut [u32],
    src: &[T],
    voxel_to_image: &Matrix4<f64>,
    (nx, ny): (usize, usize),
    (width, height, comps_in): (usize, usize, usize),
    region: SliceRegion,
    compounding: CompoundingOptions,
    optimization: OptimizationLevel,
) {
    let comps_out = comps_in + 1;
    // Stepping along +i adds the matrix's first column to the pixel position.
    let step = [
        voxel_to_image[(0, 0)],
        voxel_to_image[(1, 0)],
        voxel_to_image[(2, 0)],
    ];

    for j in 0..ny {
        let row_start = voxel_to_image * Vector4::new(0.0, j as f64, k as f64, 1.0);

        match optimization {
            OptimizationLevel::None => {
                for i in 0..nx {
                    let p = voxel_to_image * Vector4::new(i as f64, j as f64, k as f64, 1.0);
                    let voxel = j * nx + i;
                    insert_voxel::<T>(
                        p.x,
                        p.y,
                        p.z,
                        &mut out_slab[voxel * comps_out..(voxel + 1) * comps_out],
                        &mut acc_slab[voxel],
                        src,
                        (width, height, comps_in),
                        region,
                        compounding,
                    );
                }
            }
            OptimizationLevel::Partial => {
                let mut px = row_start.x as f32;
                let mut py = row_start.y as f32;
                let mut pz = row_start.z as f32;
                let (sx, sy, sz) = (step[0] as f32, step[1] as f32, step[2] as f32);
                for i in 0..nx {
                    let voxel = j * nx + i;
                    insert_voxel::<T>(
                        px as f64,
                        py as f64,
                        pz as f64,
                        &mut out_slab[voxel * comps_out..(voxel + 1) * comps_out],
                        &mut acc_slab[voxel],
                        src,
                        (width, height, comps_in),
                        region,
                        compounding,
                    );
                    px += sx;
                    py += sy;
                    pz += sz;
                }
            }
            OptimizationLevel::Full => {
                let mut px = to_fixed(row_start.x);
                let mut py = to_fixed(row_start.y);
                let mut pz = to_fixed(row_start.z);
                let (sx, sy, sz) = (to_fixed(step[0]), to_fixed(step[1]), to_fixed(step[2]));
                for i in 0..nx {
                    let voxel = j * nx + i;
                    insert_voxel::<T>(
                        from_fixed(px),
                        from_fixed(py),
                        from_fixed(pz),
                        &mut out_slab[voxel * comps_out..(voxel + 1) * comps_out],
                        &mut acc_slab[voxel],
                        src,
                        (width, height, comps_in),
                        region,
                        compounding,
                    );
                    px += sx;
                    py += sy;
                    pz += sz;
                }
            }
        }
    }
}

#[inline]
fn to_fixed(v: f64) -> i64 {
    (v * FIXED_ONE as f64).round() as i64
}

#[inline]
fn from_fixed(v: i64) -> f64 {
    v as f64 / FIXED_ONE as f64
}

/// Sample the slice at the back-projected position and combine into one
/// output voxel. Returns silently when the position falls outside the slab,
/// the clip region or the fan.
#[allow(clippy::too_many_arguments)]
#[inline]
fn insert_voxel<T: Scalar>(
    px: f64,
    py: f64,
    pz: f64,
    out_voxel: &mut [T],
    acc: &mut u32,
    src: &[T],
    (width, height, comps_in): (usize, usize, usize),
    region: SliceRegion,
    compounding: CompoundingOptions,
) {
    if pz.abs() > SLICE_HALF_THICKNESS {
        return;
    }
    if let Some(fan) = &region.fan {
        if !fan.contains(px, py) {
            return;
        }
    }

    let mut samples = [0.0f64; MAX_SLICE_COMPONENTS];
    debug_assert!(comps_in <= samples.len());

    match compounding.interpolation {
        InterpolationMode::NearestNeighbor => {
            let xi = px.round();
            let yi = py.round();
            if xi < region.x_min || xi > region.x_max || yi < region.y_min || yi > region.y_max {
                return;
            }
            let (xi, yi) = (xi as usize, yi as usize);
            let base = (yi * width + xi) * comps_in;
            for (c, sample) in samples.iter_mut().enumerate().take(comps_in) {
                *sample = src[base + c].to_f64();
            }
        }
        InterpolationMode::Linear => {
            if px < region.x_min || px > region.x_max || py < region.y_min || py > region.y_max {
                return;
            }
            let x0 = px.floor();
            let y0 = py.floor();
            let fx = px - x0;
            let fy = py - y0;
            let x0 = x0 as usize;
            let y0 = y0 as usize;
            let x1 = (x0 + 1).min(width - 1);
            let y1 = (y0 + 1).min(height - 1);
            let w00 = (1.0 - fx) * (1.0 - fy);
            let w10 = fx * (1.0 - fy);
            let w01 = (1.0 - fx) * fy;
            let w11 = fx * fy;
            for (c, sample) in samples.iter_mut().enumerate().take(comps_in) {
                *sample = w00 * src[(y0 * width + x0) * comps_in + c].to_f64()
                    + w10 * src[(y0 * width + x1) * comps_in + c].to_f64()
                    + w01 * src[(y1 * width + x0) * comps_in + c].to_f64()
                    + w11 * src[(y1 * width + x1) * comps_in + c].to_f64();
            }
        }
    }

    let acc_old = *acc;
    match compounding.calculation {
        CalculationMode::WeightedAverage => {
            if compounding.compounding && acc_old > 0 {
                let total = acc_old as f64 + ACCUMULATION_WEIGHT_UNIT as f64;
                for c in 0..comps_in {
                    let blended = (samples[c] * ACCUMULATION_WEIGHT_UNIT as f64
                        + out_voxel[c].to_f64() * acc_old as f64)
                        / total;
                    out_voxel[c] = T::from_f64(blended);
                }
                *acc = acc_old.saturating_add(ACCUMULATION_WEIGHT_UNIT);
            } else {
                for c in 0..comps_in {
                    out_voxel[c] = T::from_f64(samples[c]);
                }
                *acc = if compounding.compounding {
                    acc_old.saturating_add(ACCUMULATION_WEIGHT_UNIT)
                } else {
                    ACCUMULATION_WEIGHT_UNIT
                };
            }
        }
        CalculationMode::Maximum => {
            for c in 0..comps_in {
                if acc_old == 0 || samples[c] > out_voxel[c].to_f64() {
                    out_voxel[c] = T::from_f64(samples[c]);
                }
            }
            *acc = acc_old.max(ACCUMULATION_WEIGHT_UNIT);
        }
    }
    out_voxel[comps_in] = T::from_f64(ALPHA_OPAQUE);
}
