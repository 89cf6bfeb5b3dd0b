//! Hole filling: synthesize values for voxels no slice ever touched.
//!
//! A voxel with zero accumulated weight is a hole. Each hole voxel walks the
//! configured kernel cascade in order and takes the first value produced;
//! voxels with any accumulated weight are never modified. Neighbor access is
//! read-only against the unfilled input, so the pass parallelizes with a
//! single writer per voxel.

use rayon::prelude::*;

use crate::schema::{HoleFillKernel, Scalar, ScalarType};

use super::{AccumulationBuffer, ReconError, VoxelVolume, ACCUMULATION_WEIGHT_UNIT, ALPHA_OPAQUE};

/// Search directions of the stick kernel: 3 axes, 6 face diagonals and
/// 4 body diagonals, each probed in both directions.
const STICK_DIRECTIONS: [[i32; 3]; 13] = [
    [1, 0, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 1, 0],
    [1, -1, 0],
    [1, 0, 1],
    [1, 0, -1],
    [0, 1, 1],
    [0, 1, -1],
    [1, 1, 1],
    [1, -1, 1],
    [1, 1, -1],
    [-1, 1, 1],
];

/// Most value components a volume may carry (mirrors the paste primitive).
const MAX_COMPONENTS: usize = 4;

/// Weighting of a cubic-window kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
enum WindowWeighting {
    Gaussian,
    GaussianAccumulation,
    Uniform,
    InverseDistance,
}

/// A kernel prepared for evaluation: window offsets carry precomputed
/// distance-based weights.
#[derive(Debug, Clone)]
enum PreparedKernel {
    Window {
        offsets: Vec<(i32, i32, i32, f64)>,
        window_volume: usize,
        min_ratio: f64,
        weighting: WindowWeighting,
    },
    Stick {
        length_limit: i32,
        num_sticks: usize,
    },
}

fn prepare(kernel: &HoleFillKernel) -> PreparedKernel {
    match *kernel {
        HoleFillKernel::Gaussian {
            size,
            stdev,
            minimum_known_voxels_ratio,
        } => window_kernel(size, WindowWeighting::Gaussian, stdev, minimum_known_voxels_ratio),
        HoleFillKernel::GaussianAccumulation {
            size,
            stdev,
            minimum_known_voxels_ratio,
        } => window_kernel(
            size,
            WindowWeighting::GaussianAccumulation,
            stdev,
            minimum_known_voxels_ratio,
        ),
        HoleFillKernel::NearestNeighbor {
            size,
            minimum_known_voxels_ratio,
        } => window_kernel(size, WindowWeighting::Uniform, 1.0, minimum_known_voxels_ratio),
        HoleFillKernel::DistanceWeightInverse {
            size,
            minimum_known_voxels_ratio,
        } => window_kernel(
            size,
            WindowWeighting::InverseDistance,
            1.0,
            minimum_known_voxels_ratio,
        ),
        HoleFillKernel::Stick {
            stick_length_limit,
            number_of_sticks_to_use,
        } => PreparedKernel::Stick {
            length_limit: stick_length_limit,
            num_sticks: number_of_sticks_to_use,
        },
    }
}

fn window_kernel(
    size: i32,
    weighting: WindowWeighting,
    stdev: f32,
    min_ratio: f32,
) -> PreparedKernel {
    let lo = -(size - 1) / 2;
    let hi = size / 2;
    let mut offsets = Vec::new();
    for dz in lo..=hi {
        for dy in lo..=hi {
            for dx in lo..=hi {
                if dx == 0 && dy == 0 && dz == 0 {
                    // The center is the hole itself.
                    continue;
                }
                let dist2 = (dx * dx + dy * dy + dz * dz) as f64;
                let weight = match weighting {
                    WindowWeighting::Gaussian | WindowWeighting::GaussianAccumulation => {
                        (-dist2 / (2.0 * stdev as f64 * stdev as f64)).exp()
                    }
                    WindowWeighting::Uniform => 1.0,
                    WindowWeighting::InverseDistance => 1.0 / dist2.sqrt(),
                };
                offsets.push((dx, dy, dz, weight));
            }
        }
    }
    PreparedKernel::Window {
        offsets,
        window_volume: (size * size * size) as usize,
        min_ratio: min_ratio as f64,
        weighting,
    }
}

/// Applies the configured kernel cascade to every hole voxel.
pub struct HoleFiller {
    kernels: Vec<PreparedKernel>,
    number_of_threads: usize,
}

impl HoleFiller {
    pub fn new(kernels: &[HoleFillKernel], number_of_threads: usize) -> Self {
        Self {
            kernels: kernels.iter().map(prepare).collect(),
            number_of_threads,
        }
    }

    /// Produce a copy of the volume with hole voxels filled where a kernel
    /// succeeds. Unfillable holes keep their zero value and zero alpha.
    pub fn apply(
        &self,
        volume: &VoxelVolume,
        accumulation: &AccumulationBuffer,
    ) -> Result<VoxelVolume, ReconError> {
        debug_assert_eq!(volume.dimensions(), accumulation.dimensions());
        let mut output = volume.clone();
        match volume.image().scalar_type() {
            ScalarType::U8 => self.apply_typed::<u8>(volume, accumulation, &mut output)?,
            ScalarType::I8 => self.apply_typed::<i8>(volume, accumulation, &mut output)?,
            ScalarType::U16 => self.apply_typed::<u16>(volume, accumulation, &mut output)?,
            ScalarType::I16 => self.apply_typed::<i16>(volume, accumulation, &mut output)?,
            ScalarType::U32 => self.apply_typed::<u32>(volume, accumulation, &mut output)?,
            ScalarType::I32 => self.apply_typed::<i32>(volume, accumulation, &mut output)?,
            ScalarType::F32 => self.apply_typed::<f32>(volume, accumulation, &mut output)?,
            ScalarType::F64 => self.apply_typed::<f64>(volume, accumulation, &mut output)?,
        }
        Ok(output)
    }

    fn apply_typed<T: Scalar>(
        &self,
        volume: &VoxelVolume,
        accumulation: &AccumulationBuffer,
        output: &mut VoxelVolume,
    ) -> Result<(), ReconError> {
        let (nx, ny, nz) = volume.dimensions();
        let comps = volume.image().num_components();
        let src = T::slice(volume.image().data()).ok_or(ReconError::ScalarTypeMismatch)?;
        let acc = accumulation.data();
        let out = T::slice_mut(output.image_mut().data_mut())
            .ok_or(ReconError::ScalarTypeMismatch)?;
        let kernels = &self.kernels;

        let plane = nx * ny;
        let run = || {
            out.par_chunks_mut(plane * comps)
                .enumerate()
                .for_each(|(z, out_plane)| {
                    for y in 0..ny {
                        for x in 0..nx {
                            let voxel = y * nx + x;
                            if acc[z * plane + voxel] > 0 {
                                continue;
                            }
                            for kernel in kernels {
                                if let Some(values) = evaluate_kernel::<T>(
                                    kernel,
                                    src,
                                    acc,
                                    (x as i32, y as i32, z as i32),
                                    (nx, ny, nz),
                                    comps,
                                ) {
                                    for (c, &value) in
                                        values.iter().enumerate().take(comps - 1)
                                    {
                                        out_plane[voxel * comps + c] = T::from_f64(value);
                                    }
                                    out_plane[voxel * comps + comps - 1] =
                                        T::from_f64(ALPHA_OPAQUE);
                                    break;
                                }
                            }
                        }
                    }
                });
        };
        super::run_parallel(self.number_of_threads, run)
    }
}

/// Evaluate one kernel at a hole voxel; `None` leaves the hole unfilled.
fn evaluate_kernel<T: Scalar>(
    kernel: &PreparedKernel,
    src: &[T],
    acc: &[u32],
    (x, y, z): (i32, i32, i32),
    (nx, ny, nz): (usize, usize, usize),
    comps: usize,
) -> Option<[f64; MAX_COMPONENTS]> {
    match kernel {
        PreparedKernel::Window {
            offsets,
            window_volume,
            min_ratio,
            weighting,
        } => {
            let mut weight_sum = 0.0;
            let mut value_sum = [0.0f64; MAX_COMPONENTS];
            let mut known = 0usize;
            for &(dx, dy, dz, base_weight) in offsets {
                let (sx, sy, sz) = (x + dx, y + dy, z + dz);
                if sx < 0
                    || sy < 0
                    || sz < 0
                    || sx >= nx as i32
                    || sy >= ny as i32
                    || sz >= nz as i32
                {
                    continue;
                }
                let voxel = (sz as usize * ny + sy as usize) * nx + sx as usize;
                let neighbor_acc = acc[voxel];
                if neighbor_acc == 0 {
                    continue;
                }
                known += 1;
                let weight = if *weighting == WindowWeighting::GaussianAccumulation {
                    base_weight * neighbor_acc as f64 / ACCUMULATION_WEIGHT_UNIT as f64
                } else {
                    base_weight
                };
                for (c, sum) in value_sum.iter_mut().enumerate().take(comps - 1) {
                    *sum += weight * src[voxel * comps + c].to_f64();
                }
                weight_sum += weight;
            }
            if weight_sum <= 0.0 || (known as f64) < min_ratio * *window_volume as f64 {
                return None;
            }
            let mut values = [0.0f64; MAX_COMPONENTS];
            for (c, value) in values.iter_mut().enumerate().take(comps - 1) {
                *value = value_sum[c] / weight_sum;
            }
            Some(values)
        }
        PreparedKernel::Stick {
            length_limit,
            num_sticks,
        } => {
            // (score, per-component interpolated value)
            let mut sticks: Vec<(i32, [f64; MAX_COMPONENTS])> = Vec::new();
            for dir in &STICK_DIRECTIONS {
                let forward = probe_stick(acc, (x, y, z), *dir, *length_limit, (nx, ny, nz));
                let backward = probe_stick(
                    acc,
                    (x, y, z),
                    [-dir[0], -dir[1], -dir[2]],
                    *length_limit,
                    (nx, ny, nz),
                );
                let (Some((d_fwd, v_fwd)), Some((d_bwd, v_bwd))) = (forward, backward) else {
                    continue;
                };
                let total = (d_fwd + d_bwd) as f64;
                let mut values = [0.0f64; MAX_COMPONENTS];
                for (c, value) in values.iter_mut().enumerate().take(comps - 1) {
                    // Linear interpolation between the two stick endpoints.
                    *value = (src[v_fwd * comps + c].to_f64() * d_bwd as f64
                        + src[v_bwd * comps + c].to_f64() * d_fwd as f64)
                        / total;
                }
                sticks.push((d_fwd + d_bwd, values));
            }
            if sticks.is_empty() {
                return None;
            }
            sticks.sort_by_key(|(score, _)| *score);
            let used = sticks.len().min((*num_sticks).max(1));
            let mut values = [0.0f64; MAX_COMPONENTS];
            for (_, stick_values) in &sticks[..used] {
                for (value, stick_value) in values.iter_mut().zip(stick_values) {
                    *value += stick_value;
                }
            }
            for value in &mut values {
                *value /= used as f64;
            }
            Some(values)
        }
    }
}

/// Walk from a hole voxel along one direction, returning the distance and
/// flat index of the nearest known voxel within the length limit.
fn probe_stick(
    acc: &[u32],
    (x, y, z): (i32, i32, i32),
    dir: [i32; 3],
    length_limit: i32,
    (nx, ny, nz): (usize, usize, usize),
) -> Option<(i32, usize)> {
    for t in 1..=length_limit {
        let (sx, sy, sz) = (x + dir[0] * t, y + dir[1] * t, z + dir[2] * t);
        if sx < 0 || sy < 0 || sz < 0 || sx >= nx as i32 || sy >= ny as i32 || sz >= nz as i32 {
            return None;
        }
        let voxel = (sz as usize * ny + sy as usize) * nx + sx as usize;
        if acc[voxel] > 0 {
            return Some((t, voxel));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ScalarType;

    /// 2-component u8 volume (value + alpha) with its accumulation buffer.
    fn empty_volume(n: i32) -> (VoxelVolume, AccumulationBuffer) {
        let extent = [0, n - 1, 0, n - 1, 0, n - 1];
        let volume = VoxelVolume::allocate(
            extent,
            [1.0, 1.0, 1.0],
            [0.0, 0.0, 0.0],
            ScalarType::U8,
            2,
        )
        .unwrap();
        let acc = AccumulationBuffer::allocate(extent).unwrap();
        (volume, acc)
    }

    fn mark_known(
        volume: &mut VoxelVolume,
        acc: &mut AccumulationBuffer,
        (x, y, z): (usize, usize, usize),
        value: f64,
    ) {
        volume.image_mut().set_value_at(x, y, z, 0, value);
        volume.image_mut().set_value_at(x, y, z, 1, ALPHA_OPAQUE);
        let (nx, ny, _) = volume.dimensions();
        acc.data_mut()[(z * ny + y) * nx + x] = ACCUMULATION_WEIGHT_UNIT;
    }

    #[test]
    fn test_known_voxels_left_unmodified() {
        let (mut volume, mut acc) = empty_volume(5);
        mark_known(&mut volume, &mut acc, (1, 1, 1), 100.0);
        mark_known(&mut volume, &mut acc, (3, 1, 1), 50.0);

        let filler = HoleFiller::new(
            &[HoleFillKernel::Gaussian {
                size: 3,
                stdev: 1.0,
                minimum_known_voxels_ratio: 0.0,
            }],
            0,
        );
        let filled = filler.apply(&volume, &acc).unwrap();
        assert_eq!(filled.image().value_at(1, 1, 1, 0), 100.0);
        assert_eq!(filled.image().value_at(3, 1, 1, 0), 50.0);
    }

    #[test]
    fn test_gaussian_fills_between_known_voxels() {
        let (mut volume, mut acc) = empty_volume(5);
        mark_known(&mut volume, &mut acc, (1, 1, 1), 100.0);
        mark_known(&mut volume, &mut acc, (3, 1, 1), 50.0);

        let filler = HoleFiller::new(
            &[HoleFillKernel::Gaussian {
                size: 3,
                stdev: 1.0,
                minimum_known_voxels_ratio: 0.0,
            }],
            0,
        );
        let filled = filler.apply(&volume, &acc).unwrap();
        // (2,1,1) sees both known voxels at equal distance.
        assert_eq!(filled.image().value_at(2, 1, 1, 0), 75.0);
        assert_eq!(filled.image().value_at(2, 1, 1, 1), ALPHA_OPAQUE);
    }

    #[test]
    fn test_isolated_hole_stays_unfilled() {
        let (mut volume, mut acc) = empty_volume(9);
        mark_known(&mut volume, &mut acc, (0, 0, 0), 200.0);

        let filler = HoleFiller::new(
            &[HoleFillKernel::Gaussian {
                size: 3,
                stdev: 1.0,
                minimum_known_voxels_ratio: 0.0,
            }],
            0,
        );
        let filled = filler.apply(&volume, &acc).unwrap();
        // Far corner: no known voxel within the 3-wide window; also exercises
        // the window bounds clamping at the volume edge.
        assert_eq!(filled.image().value_at(8, 8, 8, 0), 0.0);
        assert_eq!(filled.image().value_at(8, 8, 8, 1), 0.0);
    }

    #[test]
    fn test_minimum_known_ratio_gates_fill() {
        let (mut volume, mut acc) = empty_volume(5);
        mark_known(&mut volume, &mut acc, (1, 1, 1), 100.0);

        // One known neighbor out of a 27-voxel window is below half.
        let filler = HoleFiller::new(
            &[HoleFillKernel::Gaussian {
                size: 3,
                stdev: 1.0,
                minimum_known_voxels_ratio: 0.5,
            }],
            0,
        );
        let filled = filler.apply(&volume, &acc).unwrap();
        assert_eq!(filled.image().value_at(2, 1, 1, 0), 0.0);
    }

    #[test]
    fn test_stick_interpolates_between_endpoints() {
        let (mut volume, mut acc) = empty_volume(7);
        mark_known(&mut volume, &mut acc, (2, 3, 3), 10.0);
        mark_known(&mut volume, &mut acc, (4, 3, 3), 20.0);

        let filler = HoleFiller::new(
            &[HoleFillKernel::Stick {
                stick_length_limit: 3,
                number_of_sticks_to_use: 1,
            }],
            0,
        );
        let filled = filler.apply(&volume, &acc).unwrap();
        assert_eq!(filled.image().value_at(3, 3, 3, 0), 15.0);
    }

    #[test]
    fn test_stick_requires_both_endpoints() {
        let (mut volume, mut acc) = empty_volume(7);
        mark_known(&mut volume, &mut acc, (2, 3, 3), 10.0);

        let filler = HoleFiller::new(
            &[HoleFillKernel::Stick {
                stick_length_limit: 3,
                number_of_sticks_to_use: 1,
            }],
            0,
        );
        let filled = filler.apply(&volume, &acc).unwrap();
        assert_eq!(filled.image().value_at(3, 3, 3, 0), 0.0);
    }

    #[test]
    fn test_kernel_cascade_falls_through() {
        let (mut volume, mut acc) = empty_volume(5);
        mark_known(&mut volume, &mut acc, (1, 1, 1), 60.0);

        // First kernel demands too many known voxels; the nearest-neighbor
        // fallback has no ratio requirement and fills from the neighbor.
        let filler = HoleFiller::new(
            &[
                HoleFillKernel::Gaussian {
                    size: 3,
                    stdev: 1.0,
                    minimum_known_voxels_ratio: 0.9,
                },
                HoleFillKernel::NearestNeighbor {
                    size: 3,
                    minimum_known_voxels_ratio: 0.0,
                },
            ],
            0,
        );
        let filled = filler.apply(&volume, &acc).unwrap();
        assert_eq!(filled.image().value_at(2, 1, 1, 0), 60.0);
    }

    #[test]
    fn test_inverse_distance_weighting() {
        let (mut volume, mut acc) = empty_volume(7);
        // Known voxels at distance 1 (value 90) and distance 2 (value 30)
        // from the hole at (3,3,3); weights 1 and 0.5.
        mark_known(&mut volume, &mut acc, (4, 3, 3), 90.0);
        mark_known(&mut volume, &mut acc, (1, 3, 3), 30.0);

        let filler = HoleFiller::new(
            &[HoleFillKernel::DistanceWeightInverse {
                size: 5,
                minimum_known_voxels_ratio: 0.0,
            }],
            0,
        );
        let filled = filler.apply(&volume, &acc).unwrap();
        let expected: f64 = (90.0 * 1.0 + 30.0 * 0.5) / 1.5;
        assert_eq!(filled.image().value_at(3, 3, 3, 0), expected.round());
    }
}
