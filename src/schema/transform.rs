//! Coordinate-frame transforms attached to tracked frames.
//!
//! Transforms travel with each frame as string fields
//! (`<From>To<To>Transform` = 16 row-major values,
//! `<From>To<To>TransformStatus` = OK/INVALID). The repository ingests those
//! fields and resolves arbitrary frame-to-frame transforms by composing the
//! known ones, so a reconstruction configured as Image→Reference works whether
//! the tracker reports that directly or as Image→Probe plus Probe→Reference.

use std::collections::HashMap;
use std::fmt;

use nalgebra::Matrix4;

use super::frame::TrackedFrame;

/// Field name suffix for transform matrices.
const TRANSFORM_SUFFIX: &str = "Transform";
/// Field name suffix for transform validity flags.
const STATUS_SUFFIX: &str = "TransformStatus";

/// Errors from transform naming and resolution.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid transform name '{0}': expected '<From>To<To>' with non-empty frame names")]
    InvalidName(String),
    #[error("transform '{0}' is not available in the repository")]
    NotFound(TransformName),
    #[error("malformed transform field '{field}': {reason}")]
    MalformedField { field: String, reason: String },
}

/// A directed coordinate-frame pair, e.g. Image→Reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransformName {
    from: String,
    to: String,
}

impl TransformName {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Result<Self, TransformError> {
        let from = from.into();
        let to = to.into();
        // "To" followed by an uppercase letter inside a frame name would make
        // the composed field key ambiguous (cf. parse_field_key).
        if from.is_empty()
            || to.is_empty()
            || contains_to_separator(&from)
            || contains_to_separator(&to)
        {
            return Err(TransformError::InvalidName(format!("{from}To{to}")));
        }
        Ok(Self { from, to })
    }

    pub fn from_frame(&self) -> &str {
        &self.from
    }

    pub fn to_frame(&self) -> &str {
        &self.to
    }

    pub fn inverse(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
        }
    }

    /// Parse from a field key such as `ProbeToTrackerTransform`.
    pub fn parse_field_key(key: &str) -> Result<Self, TransformError> {
        let base = key
            .strip_suffix(TRANSFORM_SUFFIX)
            .ok_or_else(|| TransformError::InvalidName(key.to_string()))?;
        // Split at the first "To" followed by an uppercase letter, so frame
        // names like "Tool" survive ("ToolToTracker" -> Tool, Tracker).
        let split = to_separator_position(base)
            .ok_or_else(|| TransformError::InvalidName(base.to_string()))?;
        let (from, to) = (&base[..split], &base[split + 2..]);
        if from.is_empty() || to.is_empty() {
            return Err(TransformError::InvalidName(base.to_string()));
        }
        Ok(Self {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// Field key for the matrix values.
    pub fn transform_field(&self) -> String {
        format!("{}To{}{}", self.from, self.to, TRANSFORM_SUFFIX)
    }

    /// Field key for the validity flag.
    pub fn status_field(&self) -> String {
        format!("{}To{}{}", self.from, self.to, STATUS_SUFFIX)
    }
}

impl fmt::Display for TransformName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}To{}", self.from, self.to)
    }
}

/// Store a transform on a frame as string fields.
pub fn set_frame_transform(
    frame: &mut TrackedFrame,
    name: &TransformName,
    matrix: &Matrix4<f64>,
    valid: bool,
) {
    let mut value = String::new();
    for row in 0..4 {
        for col in 0..4 {
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(&format!("{}", matrix[(row, col)]));
        }
    }
    frame.fields.set(name.transform_field(), value);
    frame
        .fields
        .set(name.status_field(), if valid { "OK" } else { "INVALID" });
}

#[derive(Debug, Clone)]
struct TransformEntry {
    matrix: Matrix4<f64>,
    valid: bool,
}

/// Repository of currently known frame-to-frame transforms.
///
/// Updated per tracked frame via [`TransformRepository::set_transforms`], then
/// queried with [`TransformRepository::get_transform`], which composes a path
/// through the transform graph. A missing path is a configuration error; an
/// invalid flag on any edge makes the composed transform invalid (tracking
/// lost for that sample), which callers treat as a skippable event.
#[derive(Debug, Clone, Default)]
pub struct TransformRepository {
    transforms: HashMap<TransformName, TransformEntry>,
}

impl TransformRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directly register a transform, as configuration-time calibration data.
    pub fn set_transform(&mut self, name: TransformName, matrix: Matrix4<f64>, valid: bool) {
        self.transforms.insert(name, TransformEntry { matrix, valid });
    }

    /// Ingest every `*Transform` field carried by a frame.
    pub fn set_transforms(&mut self, frame: &TrackedFrame) -> Result<(), TransformError> {
        for (key, value) in frame.fields.iter() {
            if !key.ends_with(TRANSFORM_SUFFIX) || key.ends_with(STATUS_SUFFIX) {
                continue;
            }
            let name = TransformName::parse_field_key(key)?;
            let matrix = parse_matrix(key, value)?;
            let valid = match frame.fields.get(&name.status_field()) {
                Some(status) => status.eq_ignore_ascii_case("OK"),
                None => true,
            };
            self.set_transform(name, matrix, valid);
        }
        Ok(())
    }

    /// Resolve a transform, composing through intermediate frames if needed.
    ///
    /// Returns the matrix and its validity. `Err(NotFound)` means no chain of
    /// known transforms connects the two frames at all.
    pub fn get_transform(
        &self,
        name: &TransformName,
    ) -> Result<(Matrix4<f64>, bool), TransformError> {
        if name.from == name.to {
            return Ok((Matrix4::identity(), true));
        }

        // Breadth-first search over the frame graph; every stored transform
        // contributes a forward and an inverse edge.
        let mut edges: HashMap<&str, Vec<(&str, Matrix4<f64>, bool)>> = HashMap::new();
        for (n, entry) in &self.transforms {
            edges
                .entry(n.from.as_str())
                .or_default()
                .push((n.to.as_str(), entry.matrix, entry.valid));
            if let Some(inv) = entry.matrix.try_inverse() {
                edges
                    .entry(n.to.as_str())
                    .or_default()
                    .push((n.from.as_str(), inv, entry.valid));
            }
        }

        let mut queue = std::collections::VecDeque::new();
        let mut visited = std::collections::HashSet::new();
        queue.push_back((name.from.as_str(), Matrix4::identity(), true));
        visited.insert(name.from.as_str());

        while let Some((frame, accumulated, valid)) = queue.pop_front() {
            if frame == name.to {
                return Ok((accumulated, valid));
            }
            if let Some(next) = edges.get(frame) {
                for (to, matrix, edge_valid) in next {
                    if visited.insert(*to) {
                        queue.push_back((*to, matrix * accumulated, valid && *edge_valid));
                    }
                }
            }
        }

        Err(TransformError::NotFound(name.clone()))
    }
}

fn to_separator_position(name: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    (0..bytes.len().saturating_sub(2)).find(|&i| {
        bytes[i] == b'T' && bytes[i + 1] == b'o' && bytes[i + 2].is_ascii_uppercase()
    })
}

fn contains_to_separator(name: &str) -> bool {
    to_separator_position(name).is_some()
}

fn parse_matrix(field: &str, value: &str) -> Result<Matrix4<f64>, TransformError> {
    let values: Result<Vec<f64>, _> = value.split_whitespace().map(str::parse).collect();
    let values = values.map_err(|e| TransformError::MalformedField {
        field: field.to_string(),
        reason: format!("{e}"),
    })?;
    if values.len() != 16 {
        return Err(TransformError::MalformedField {
            field: field.to_string(),
            reason: format!("expected 16 values, got {}", values.len()),
        });
    }
    Ok(Matrix4::from_row_slice(&values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ImageBuffer, ScalarType};
    use nalgebra::Vector4;

    fn test_frame() -> TrackedFrame {
        TrackedFrame::new(
            ImageBuffer::allocate(ScalarType::U8, 2, 2, 1, 1).unwrap(),
            0.0,
        )
    }

    #[test]
    fn test_name_parse_and_format() {
        let name = TransformName::parse_field_key("ProbeToTrackerTransform").unwrap();
        assert_eq!(name.from_frame(), "Probe");
        assert_eq!(name.to_frame(), "Tracker");
        assert_eq!(name.transform_field(), "ProbeToTrackerTransform");
        assert!(TransformName::parse_field_key("BogusField").is_err());
    }

    #[test]
    fn test_name_with_embedded_to() {
        let name = TransformName::parse_field_key("ToolToTrackerTransform").unwrap();
        assert_eq!(name.from_frame(), "Tool");
        assert_eq!(name.to_frame(), "Tracker");
        assert!(TransformName::new("Tool", "Tracker").is_ok());
    }

    #[test]
    fn test_roundtrip_through_frame_fields() {
        let name = TransformName::new("Image", "Reference").unwrap();
        let matrix = Matrix4::new_translation(&nalgebra::Vector3::new(1.0, 2.0, 3.0));

        let mut frame = test_frame();
        set_frame_transform(&mut frame, &name, &matrix, true);

        let mut repo = TransformRepository::new();
        repo.set_transforms(&frame).unwrap();
        let (resolved, valid) = repo.get_transform(&name).unwrap();
        assert!(valid);
        assert_eq!(resolved, matrix);
    }

    #[test]
    fn test_invalid_status_propagates() {
        let name = TransformName::new("Image", "Reference").unwrap();
        let mut frame = test_frame();
        set_frame_transform(&mut frame, &name, &Matrix4::identity(), false);

        let mut repo = TransformRepository::new();
        repo.set_transforms(&frame).unwrap();
        let (_, valid) = repo.get_transform(&name).unwrap();
        assert!(!valid);
    }

    #[test]
    fn test_composition_through_intermediate() {
        let mut repo = TransformRepository::new();
        let image_to_probe = Matrix4::new_translation(&nalgebra::Vector3::new(1.0, 0.0, 0.0));
        let probe_to_reference = Matrix4::new_translation(&nalgebra::Vector3::new(0.0, 5.0, 0.0));
        repo.set_transform(
            TransformName::new("Image", "Probe").unwrap(),
            image_to_probe,
            true,
        );
        repo.set_transform(
            TransformName::new("Probe", "Reference").unwrap(),
            probe_to_reference,
            true,
        );

        let name = TransformName::new("Image", "Reference").unwrap();
        let (composed, valid) = repo.get_transform(&name).unwrap();
        assert!(valid);
        let p = composed * Vector4::new(0.0, 0.0, 0.0, 1.0);
        assert_eq!((p.x, p.y, p.z), (1.0, 5.0, 0.0));
    }

    #[test]
    fn test_inverse_edge_used() {
        let mut repo = TransformRepository::new();
        repo.set_transform(
            TransformName::new("Reference", "Image").unwrap(),
            Matrix4::new_translation(&nalgebra::Vector3::new(2.0, 0.0, 0.0)),
            true,
        );
        let name = TransformName::new("Image", "Reference").unwrap();
        let (m, _) = repo.get_transform(&name).unwrap();
        let p = m * Vector4::new(0.0, 0.0, 0.0, 1.0);
        assert_eq!(p.x, -2.0);
    }

    #[test]
    fn test_missing_transform_is_not_found() {
        let repo = TransformRepository::new();
        let name = TransformName::new("Image", "Reference").unwrap();
        assert!(matches!(
            repo.get_transform(&name),
            Err(TransformError::NotFound(_))
        ));
    }
}
