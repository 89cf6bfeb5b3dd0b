//! Automatic output extent computation from projected slice corners.

use nalgebra::{Matrix4, Vector4};

use crate::schema::ImageBuffer;

/// An empty reference-space bounding box ready for expansion.
pub fn empty_bounds() -> [f64; 6] {
    [
        f64::MAX,
        f64::MIN,
        f64::MAX,
        f64::MIN,
        f64::MAX,
        f64::MIN,
    ]
}

/// Project the four corners of a slice (restricted to the clip rectangle when
/// one is set) into reference space and expand the bounding box to hold them.
pub fn add_image_to_extent(
    bounds: &mut [f64; 6],
    image: &ImageBuffer,
    clip_rectangle_origin: [i32; 2],
    clip_rectangle_size: [i32; 2],
    image_to_reference: &Matrix4<f64>,
) {
    let mut min_x: f64 = 0.0;
    let mut max_x = (image.width().saturating_sub(1)) as f64;
    let mut min_y: f64 = 0.0;
    let mut max_y = (image.height().saturating_sub(1)) as f64;
    if clip_rectangle_size[0] > 0 && clip_rectangle_size[1] > 0 {
        min_x = min_x.max(clip_rectangle_origin[0] as f64);
        max_x = max_x.min((clip_rectangle_origin[0] + clip_rectangle_size[0]) as f64);
        min_y = min_y.max(clip_rectangle_origin[1] as f64);
        max_y = max_y.min((clip_rectangle_origin[1] + clip_rectangle_size[1]) as f64);
    }

    let corners = [
        Vector4::new(min_x, min_y, 0.0, 1.0),
        Vector4::new(min_x, max_y, 0.0, 1.0),
        Vector4::new(max_x, min_y, 0.0, 1.0),
        Vector4::new(max_x, max_y, 0.0, 1.0),
    ];
    for corner in corners {
        let corner_ref = image_to_reference * corner;
        for axis in 0..3 {
            if corner_ref[axis] < bounds[axis * 2] {
                bounds[axis * 2] = corner_ref[axis];
            }
            if corner_ref[axis] > bounds[axis * 2 + 1] {
                bounds[axis * 2 + 1] = corner_ref[axis];
            }
        }
    }
}

/// Convert a reference-space bounding box and the configured spacing into an
/// integer voxel extent and the matching origin (the box minimum).
pub fn bounds_to_extent_and_origin(
    bounds: &[f64; 6],
    spacing: [f64; 3],
) -> ([i32; 6], [f64; 3]) {
    let mut extent = [0i32; 6];
    for axis in 0..3 {
        extent[axis * 2 + 1] = ((bounds[axis * 2 + 1] - bounds[axis * 2]) / spacing[axis]) as i32;
    }
    let origin = [bounds[0], bounds[2], bounds[4]];
    (extent, origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ScalarType;
    use nalgebra::Vector3;

    fn image(width: usize, height: usize) -> ImageBuffer {
        ImageBuffer::allocate(ScalarType::U8, width, height, 1, 1).unwrap()
    }

    #[test]
    fn test_identity_pose_spans_image() {
        let mut bounds = empty_bounds();
        add_image_to_extent(&mut bounds, &image(11, 21), [0, 0], [0, 0], &Matrix4::identity());
        assert_eq!(bounds[0], 0.0);
        assert_eq!(bounds[1], 10.0);
        assert_eq!(bounds[2], 0.0);
        assert_eq!(bounds[3], 20.0);
        assert_eq!(bounds[4], 0.0);
        assert_eq!(bounds[5], 0.0);
    }

    #[test]
    fn test_translation_expands_box() {
        let mut bounds = empty_bounds();
        let pose_a = Matrix4::identity();
        let pose_b = Matrix4::new_translation(&Vector3::new(0.0, 0.0, 5.0));
        add_image_to_extent(&mut bounds, &image(11, 21), [0, 0], [0, 0], &pose_a);
        add_image_to_extent(&mut bounds, &image(11, 21), [0, 0], [0, 0], &pose_b);

        let (extent, origin) = bounds_to_extent_and_origin(&bounds, [1.0, 1.0, 1.0]);
        assert_eq!(extent, [0, 10, 0, 20, 0, 5]);
        assert_eq!(origin, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_clip_rectangle_restricts_corners() {
        let mut bounds = empty_bounds();
        add_image_to_extent(&mut bounds, &image(100, 100), [10, 20], [30, 40], &Matrix4::identity());
        assert_eq!(bounds[0], 10.0);
        assert_eq!(bounds[1], 40.0);
        assert_eq!(bounds[2], 20.0);
        assert_eq!(bounds[3], 60.0);
    }

    #[test]
    fn test_spacing_scales_extent() {
        let bounds = [0.0, 10.0, 0.0, 20.0, 0.0, 5.0];
        let (extent, origin) = bounds_to_extent_and_origin(&bounds, [0.5, 2.0, 1.0]);
        assert_eq!(extent, [0, 20, 0, 10, 0, 5]);
        assert_eq!(origin, [0.0, 0.0, 0.0]);
    }
}
