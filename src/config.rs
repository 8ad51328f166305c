//! Configuration file parser for rotation sweeps

use crate::enums::{MotionConvention, PixelType, SortBy};
use crate::projector::ProjectionGeometry;
use crate::sweep::{AxisRange, RotationGrid, SweepPlan};
use crate::writer::OutputFormat;

use nalgebra::{Matrix3, Point3, Vector3};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file \"{path}\": {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("[rotation] takes either `list` or per-axis ranges, not both")]
    ConflictingRotation,
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    /// DICOM directory, DICOM file or `.mhd` volume.
    pub input: PathBuf,

    pub output_dir: PathBuf,

    #[serde(default)]
    pub format: OutputFormat,

    #[serde(default)]
    pub overwrite: bool,

    #[serde(default)]
    pub convention: MotionConvention,

    #[serde(default)]
    pub translation: [f64; 3],

    #[serde(default)]
    pub center_offset: [f64; 3],

    #[serde(default)]
    pub sort_by: SortBy,

    #[serde(default)]
    pub rotation: RotationConfig,

    #[serde(default)]
    pub detector: DetectorConfig,
}

/// Axes without a range stay at 0 degrees.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RotationConfig {
    pub x: Option<AxisRange>,
    pub y: Option<AxisRange>,
    pub z: Option<AxisRange>,
    pub list: Option<Vec<[f64; 3]>>,
}

impl RotationConfig {
    pub fn grid(&self) -> Result<RotationGrid, ConfigError> {
        let any_range = self.x.is_some() || self.y.is_some() || self.z.is_some();
        match &self.list {
            Some(_) if any_range => Err(ConfigError::ConflictingRotation),
            Some(list) => Ok(RotationGrid::List(list.clone())),
            None => {
                let zero = AxisRange::single(0.0);
                Ok(RotationGrid::Ranges {
                    x: self.x.unwrap_or(zero),
                    y: self.y.unwrap_or(zero),
                    z: self.z.unwrap_or(zero),
                })
            }
        }
    }
}

/// Missing fields fall back to [`ProjectionGeometry::default`]. When only
/// `size` or `spacing` is given, the default origin follows them.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    pub size: Option<[usize; 3]>,
    pub spacing: Option<[f64; 3]>,
    pub origin: Option<[f64; 3]>,
    /// Row-major direction cosines.
    pub direction: Option<[[f64; 3]; 3]>,
    pub focal_point: Option<[f64; 3]>,
    pub threshold: Option<f64>,
    pub flip: Option<[bool; 3]>,
    pub pixel_type: Option<PixelType>,
}

impl DetectorConfig {
    pub fn geometry(&self) -> ProjectionGeometry {
        let defaults = ProjectionGeometry::default();
        let size = self.size.unwrap_or(defaults.grid.size);
        let spacing = self
            .spacing
            .map(Vector3::from)
            .unwrap_or(defaults.grid.spacing);

        let mut geometry = ProjectionGeometry::with_detector(size, spacing);
        if let Some(origin) = self.origin {
            geometry.grid.origin = Point3::from(origin);
        }
        if let Some(rows) = self.direction {
            geometry.grid.direction = Matrix3::from_fn(|r, c| rows[r][c]);
        }
        if let Some(focal_point) = self.focal_point {
            geometry.focal_point = Point3::from(focal_point);
        }
        if let Some(threshold) = self.threshold {
            geometry.threshold = threshold;
        }
        if let Some(flip) = self.flip {
            geometry.flip_axes = flip;
        }
        if let Some(pixel_type) = self.pixel_type {
            geometry.pixel_type = pixel_type;
        }
        geometry
    }
}

impl FromStr for SweepConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(text)?)
    }
}

impl SweepConfig {
    /// Read a config file. Relative `input` and `output_dir` are taken
    /// relative to the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = text.parse()?;
        if let Some(base) = path.parent() {
            config.input = base.join(&config.input);
            config.output_dir = base.join(&config.output_dir);
        }
        Ok(config)
    }

    pub fn plan(&self) -> Result<SweepPlan, ConfigError> {
        Ok(SweepPlan {
            grid: self.rotation.grid()?,
            translation: Vector3::from(self.translation),
            center_offset: Vector3::from(self.center_offset),
            convention: self.convention,
            output_dir: self.output_dir.clone(),
            format: self.format,
            overwrite: self.overwrite,
        })
    }

    pub fn projection_geometry(&self) -> ProjectionGeometry {
        self.detector.geometry()
    }
}
