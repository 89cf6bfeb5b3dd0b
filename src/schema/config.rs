//! Configuration types for volume reconstruction.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

fn default_skip_interval() -> usize {
    1
}

fn default_compounding() -> bool {
    true
}

/// Top-level reconstruction configuration.
///
/// Origin and extent are optional; when absent they are auto-computed from the
/// tracked-frame list before the first insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    /// Name of the 2D image pixel coordinate frame.
    pub image_coordinate_frame: String,
    /// Name of the reference coordinate frame the volume is reconstructed in.
    pub reference_coordinate_frame: String,
    /// Output voxel spacing in reference units (mm).
    pub output_spacing: [f64; 3],
    /// Output origin in the reference frame; auto-computed when absent.
    #[serde(default)]
    pub output_origin: Option<[f64; 3]>,
    /// Output voxel extent (min/max index pairs per axis); auto-computed when absent.
    #[serde(default)]
    pub output_extent: Option<[i32; 6]>,
    /// Clip rectangle origin in image pixels.
    #[serde(default)]
    pub clip_rectangle_origin: [i32; 2],
    /// Clip rectangle size in image pixels; zero size disables clipping.
    #[serde(default)]
    pub clip_rectangle_size: [i32; 2],
    /// Fan-shaped clip region for curvilinear probes.
    #[serde(default)]
    pub fan: Option<FanConfig>,
    /// Process every Nth frame (1 = every frame).
    #[serde(default = "default_skip_interval")]
    pub skip_interval: usize,
    /// Slice sampling mode.
    #[serde(default)]
    pub interpolation: InterpolationMode,
    /// Per-voxel compounding mode.
    #[serde(default)]
    pub calculation: CalculationMode,
    /// Arithmetic precision / throughput trade-off of the insertion loop.
    #[serde(default)]
    pub optimization: OptimizationLevel,
    /// Blend repeated samples into a voxel; off means the last sample wins.
    #[serde(default = "default_compounding")]
    pub compounding: bool,
    /// Worker threads for insertion and hole filling (0 = library default).
    #[serde(default)]
    pub number_of_threads: usize,
    /// Run the hole-filling pass when generating the output volume.
    #[serde(default)]
    pub fill_holes: bool,
    /// Hole-filling kernel cascade, applied per voxel in order.
    #[serde(default)]
    pub hole_fill_kernels: Vec<HoleFillKernel>,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            image_coordinate_frame: "Image".to_string(),
            reference_coordinate_frame: "Reference".to_string(),
            output_spacing: [1.0, 1.0, 1.0],
            output_origin: None,
            output_extent: None,
            clip_rectangle_origin: [0, 0],
            clip_rectangle_size: [0, 0],
            fan: None,
            skip_interval: 1,
            interpolation: InterpolationMode::default(),
            calculation: CalculationMode::default(),
            optimization: OptimizationLevel::default(),
            compounding: true,
            number_of_threads: 0,
            fill_holes: false,
            hole_fill_kernels: Vec::new(),
        }
    }
}

/// Fan-shaped clipping for curvilinear probes, in image pixel units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanConfig {
    /// Fan apex position in image pixels.
    pub origin: [f64; 2],
    /// Start and stop angles in degrees, measured from the +y axis.
    pub angles: [f64; 2],
    /// Maximum distance from the apex in image pixels.
    pub depth: f64,
}

/// Slice sampling mode during insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterpolationMode {
    #[default]
    NearestNeighbor,
    Linear,
}

impl InterpolationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InterpolationMode::NearestNeighbor => "NEAREST_NEIGHBOR",
            InterpolationMode::Linear => "LINEAR",
        }
    }
}

impl FromStr for InterpolationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("NEAREST_NEIGHBOR") {
            Ok(InterpolationMode::NearestNeighbor)
        } else if s.eq_ignore_ascii_case("LINEAR") {
            Ok(InterpolationMode::Linear)
        } else {
            Err(ConfigError::UnknownMode {
                option: "Interpolation",
                value: s.to_string(),
                valid: "LINEAR, NEAREST_NEIGHBOR",
            })
        }
    }
}

/// Per-voxel compounding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalculationMode {
    #[default]
    WeightedAverage,
    Maximum,
}

impl CalculationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CalculationMode::WeightedAverage => "WEIGHTED_AVERAGE",
            CalculationMode::Maximum => "MAXIMUM",
        }
    }
}

impl FromStr for CalculationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("WEIGHTED_AVERAGE") {
            Ok(CalculationMode::WeightedAverage)
        } else if s.eq_ignore_ascii_case("MAXIMUM") {
            Ok(CalculationMode::Maximum)
        } else {
            Err(ConfigError::UnknownMode {
                option: "Calculation",
                value: s.to_string(),
                valid: "WEIGHTED_AVERAGE, MAXIMUM",
            })
        }
    }
}

/// Insertion-loop arithmetic.
///
/// All levels produce equivalent volumes within floating-point tolerance;
/// only throughput differs. `Full` uses 16.16 fixed-point stepping, `Partial`
/// single-precision stepping, `None` double-precision per-voxel math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizationLevel {
    None,
    Partial,
    #[default]
    Full,
}

impl OptimizationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            OptimizationLevel::None => "NONE",
            OptimizationLevel::Partial => "PARTIAL",
            OptimizationLevel::Full => "FULL",
        }
    }
}

impl FromStr for OptimizationLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("NONE") {
            Ok(OptimizationLevel::None)
        } else if s.eq_ignore_ascii_case("PARTIAL") {
            Ok(OptimizationLevel::Partial)
        } else if s.eq_ignore_ascii_case("FULL") {
            Ok(OptimizationLevel::Full)
        } else {
            Err(ConfigError::UnknownMode {
                option: "Optimization",
                value: s.to_string(),
                valid: "FULL, PARTIAL, NONE",
            })
        }
    }
}

/// One hole-filling kernel. Kernels are tried per hole voxel in the order
/// configured; the first one that produces a value wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoleFillKernel {
    /// Gaussian-weighted average over a cubic window.
    Gaussian {
        /// Window edge length in voxels.
        size: i32,
        /// Gaussian standard deviation in voxels.
        stdev: f32,
        /// Fraction of known voxels in the window required to fill.
        minimum_known_voxels_ratio: f32,
    },
    /// Gaussian weights additionally scaled by each neighbor's accumulated weight.
    GaussianAccumulation {
        size: i32,
        stdev: f32,
        minimum_known_voxels_ratio: f32,
    },
    /// Search along fixed 3D ray directions for the nearest known voxels.
    Stick {
        /// Maximum half-length of a stick in voxels.
        stick_length_limit: i32,
        /// Number of best-scoring sticks averaged into the result.
        number_of_sticks_to_use: usize,
    },
    /// Unweighted average of known voxels in a cubic window.
    NearestNeighbor {
        size: i32,
        minimum_known_voxels_ratio: f32,
    },
    /// Inverse-distance-weighted average over a cubic window.
    DistanceWeightInverse {
        size: i32,
        minimum_known_voxels_ratio: f32,
    },
}

impl ReconstructionConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_coordinate_frame.is_empty() || self.reference_coordinate_frame.is_empty() {
            return Err(ConfigError::MissingCoordinateFrame);
        }
        if self.output_spacing.iter().any(|&s| s <= 0.0) {
            return Err(ConfigError::InvalidSpacing);
        }
        if let Some(extent) = self.output_extent {
            for axis in 0..3 {
                if extent[axis * 2] > extent[axis * 2 + 1] {
                    return Err(ConfigError::InvalidExtent);
                }
            }
        }
        if self.clip_rectangle_size.iter().any(|&s| s < 0) {
            return Err(ConfigError::InvalidClipRectangle);
        }
        if self.skip_interval == 0 {
            return Err(ConfigError::InvalidSkipInterval);
        }
        if self.fill_holes && self.hole_fill_kernels.is_empty() {
            return Err(ConfigError::MissingHoleFillKernels);
        }
        for (i, kernel) in self.hole_fill_kernels.iter().enumerate() {
            kernel
                .validate()
                .map_err(|reason| ConfigError::InvalidKernel { kernel: i, reason })?;
        }
        Ok(())
    }
}

impl HoleFillKernel {
    fn validate(&self) -> Result<(), &'static str> {
        match *self {
            HoleFillKernel::Gaussian {
                size,
                stdev,
                minimum_known_voxels_ratio,
            }
            | HoleFillKernel::GaussianAccumulation {
                size,
                stdev,
                minimum_known_voxels_ratio,
            } => {
                if size <= 0 {
                    return Err("Size must be positive");
                }
                if stdev <= 0.0 {
                    return Err("Stdev must be positive");
                }
                if !(0.0..=1.0).contains(&minimum_known_voxels_ratio) {
                    return Err("MinimumKnownVoxelsRatio must be within [0, 1]");
                }
            }
            HoleFillKernel::NearestNeighbor {
                size,
                minimum_known_voxels_ratio,
            }
            | HoleFillKernel::DistanceWeightInverse {
                size,
                minimum_known_voxels_ratio,
            } => {
                if size <= 0 {
                    return Err("Size must be positive");
                }
                if !(0.0..=1.0).contains(&minimum_known_voxels_ratio) {
                    return Err("MinimumKnownVoxelsRatio must be within [0, 1]");
                }
            }
            HoleFillKernel::Stick {
                stick_length_limit,
                number_of_sticks_to_use,
            } => {
                if stick_length_limit <= 0 {
                    return Err("StickLengthLimit must be positive");
                }
                if number_of_sticks_to_use == 0 {
                    return Err("NumberOfSticksToUse must be positive");
                }
            }
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("image and reference coordinate frame names must be set")]
    MissingCoordinateFrame,
    #[error("output spacing components must be positive")]
    InvalidSpacing,
    #[error("output extent minimum exceeds maximum")]
    InvalidExtent,
    #[error("clip rectangle size components must be non-negative")]
    InvalidClipRectangle,
    #[error("skip interval must be greater or equal to 1")]
    InvalidSkipInterval,
    #[error("hole filling is enabled but no kernels are configured")]
    MissingHoleFillKernels,
    #[error("hole-fill kernel {kernel} is invalid: {reason}")]
    InvalidKernel { kernel: usize, reason: &'static str },
    #[error("unknown {option} option '{value}'; valid options: {valid}")]
    UnknownMode {
        option: &'static str,
        value: String,
        valid: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ReconstructionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_mode_parsing_is_case_insensitive() {
        assert_eq!(
            "linear".parse::<InterpolationMode>().unwrap(),
            InterpolationMode::Linear
        );
        assert_eq!(
            "Weighted_Average".parse::<CalculationMode>().unwrap(),
            CalculationMode::WeightedAverage
        );
        assert_eq!(
            "full".parse::<OptimizationLevel>().unwrap(),
            OptimizationLevel::Full
        );
        assert!("trilinear".parse::<InterpolationMode>().is_err());
    }

    #[test]
    fn test_fill_holes_requires_kernels() {
        let config = ReconstructionConfig {
            fill_holes: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingHoleFillKernels)
        ));
    }

    #[test]
    fn test_kernel_validation() {
        let config = ReconstructionConfig {
            fill_holes: true,
            hole_fill_kernels: vec![HoleFillKernel::Gaussian {
                size: 5,
                stdev: 0.0,
                minimum_known_voxels_ratio: 0.5,
            }],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidKernel { kernel: 0, .. })
        ));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReconstructionConfig {
            output_spacing: [0.5, 0.5, 0.5],
            fill_holes: true,
            hole_fill_kernels: vec![
                HoleFillKernel::Stick {
                    stick_length_limit: 9,
                    number_of_sticks_to_use: 2,
                },
                HoleFillKernel::Gaussian {
                    size: 5,
                    stdev: 1.0,
                    minimum_known_voxels_ratio: 0.25,
                },
            ],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReconstructionConfig = serde_json::from_str(&json).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.hole_fill_kernels.len(), 2);
        assert_eq!(parsed.output_spacing, [0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_zero_skip_interval_rejected() {
        let config = ReconstructionConfig {
            skip_interval: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSkipInterval)
        ));
    }
}
