use crate::enums::{Interpolation, MotionConvention, PixelType, ProjectionMode};
use crate::geometry::{GeometryError, ImageGeometry};
use crate::resample::{CpuResampler, ResampleError, Resampler};
use crate::transform::{Pose, RigidTransform, TransformError, build_transform};
use crate::volume::{Volume, VolumeError};

use image::{GrayImage, ImageBuffer, Luma};
use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::{Array3, Axis};
use rayon::prelude::*;
use thiserror::Error;

/// Lower and upper bound of rescaled DRR intensities.
pub const DRR_INTENSITY_RANGE: (f32, f32) = (0.0, 255.0);

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("Invalid detector geometry: {0}")]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Resampling failed: {0}")]
    Resample(#[from] ResampleError),

    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// Detector description and ray-cast parameters for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionGeometry {
    pub grid: ImageGeometry,
    /// X-ray source location.
    pub focal_point: Point3<f64>,
    /// Samples at or below this value do not contribute to a ray.
    pub threshold: f64,
    /// Axes (x, y, z) along which the rescaled output is mirrored.
    pub flip_axes: [bool; 3],
    pub pixel_type: PixelType,
}

impl Default for ProjectionGeometry {
    fn default() -> Self {
        Self::with_detector([1024, 1400, 1], Vector3::new(0.167, 0.167, 1.0))
    }
}

impl ProjectionGeometry {
    /// Detector plane at z = -200 with both in-plane origin coordinates at
    /// half the detector width, source at (0, 0, 1000).
    pub fn with_detector(size: [usize; 3], spacing: Vector3<f64>) -> Self {
        let delta = size[0] as f64 * spacing.x / 2.0;
        Self {
            grid: ImageGeometry::new(
                size,
                spacing,
                Point3::new(delta, delta, -200.0),
                Matrix3::identity(),
            ),
            focal_point: Point3::new(0.0, 0.0, 1000.0),
            threshold: 0.0,
            flip_axes: [false; 3],
            pixel_type: PixelType::U8,
        }
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        self.grid.validate()?;
        crate::geometry::check_finite("Focal point", &self.focal_point.coords)?;
        if !self.threshold.is_finite() {
            return Err(GeometryError::NonFinite("Threshold"));
        }
        Ok(())
    }
}

/// Output of one projection, owned by the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    image: Volume,
    pixel_type: PixelType,
}

impl Projection {
    pub fn image(&self) -> &Volume {
        &self.image
    }

    pub fn into_image(self) -> Volume {
        self.image
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn width(&self) -> usize {
        self.image.size()[0]
    }

    pub fn height(&self) -> usize {
        self.image.size()[1]
    }

    pub fn depth(&self) -> usize {
        self.image.size()[2]
    }

    #[inline]
    fn to_u8(value: f32) -> u8 {
        value.round().clamp(0.0, 255.0) as u8
    }

    /// 8-bit grayscale copy of a single-slice projection.
    pub fn to_luma8(&self) -> Option<GrayImage> {
        if self.depth() != 1 {
            return None;
        }
        let pixel_data: Vec<u8> = self
            .image
            .data()
            .as_slice()?
            .par_iter()
            .map(|&v| Self::to_u8(v))
            .collect();
        ImageBuffer::<Luma<u8>, _>::from_raw(self.width() as u32, self.height() as u32, pixel_data)
    }
}

/// Linearly map `data` onto `[min, max]`. A constant input maps to `min`.
pub fn rescale_intensity(data: &mut Array3<f32>, (min, max): (f32, f32)) {
    let (lo, hi) = data
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    // empty or constant input; NaN voxels are skipped by min/max
    if hi <= lo {
        data.fill(min);
        return;
    }
    let scale = (max - min) / (hi - lo);
    data.par_mapv_inplace(|v| (v - lo).mul_add(scale, min));
}

/// Reverse the pixel order along the selected (x, y, z) axes.
pub fn flip(data: &mut Array3<f32>, axes: [bool; 3]) {
    // array axes are (z, y, x)
    for (axis, &enabled) in axes.iter().enumerate() {
        if enabled {
            data.invert_axis(Axis(2 - axis));
        }
    }
    if !data.is_standard_layout() {
        *data = data.as_standard_layout().into_owned();
    }
}

/// The volume's own grid, shifted by the transform's translation.
pub fn rigid_output_grid(volume: &Volume, transform: &RigidTransform) -> ImageGeometry {
    let geometry = volume.geometry();
    ImageGeometry {
        origin: geometry.origin - *transform.translation(),
        ..geometry.clone()
    }
}

/// Drives a [`Resampler`] in rigid or DRR mode.
#[derive(Clone, Debug)]
pub struct Projector<R = CpuResampler> {
    resampler: R,
}

impl Projector {
    pub fn cpu() -> Self {
        Self::new(CpuResampler)
    }
}

impl Default for Projector {
    fn default() -> Self {
        Self::cpu()
    }
}

impl<R: Resampler> Projector<R> {
    pub fn new(resampler: R) -> Self {
        Self { resampler }
    }

    pub fn resampler(&self) -> &R {
        &self.resampler
    }

    pub fn project(
        &self,
        volume: &Volume,
        transform: &RigidTransform,
        geometry: &ProjectionGeometry,
        mode: ProjectionMode,
    ) -> Result<Projection, ProjectionError> {
        geometry.validate()?;
        let grid = &geometry.grid;

        let (data, pixel_type) = match mode {
            ProjectionMode::Rigid => {
                let data = self.resampler.resample(
                    volume,
                    transform,
                    &Interpolation::Linear,
                    grid,
                    0.0,
                )?;
                (data, PixelType::F32)
            }
            ProjectionMode::Drr => {
                let interpolation = Interpolation::RayCast {
                    focal_point: geometry.focal_point,
                    threshold: geometry.threshold,
                };
                let mut data =
                    self.resampler
                        .resample(volume, transform, &interpolation, grid, 0.0)?;
                rescale_intensity(&mut data, DRR_INTENSITY_RANGE);
                flip(&mut data, geometry.flip_axes);
                if geometry.pixel_type == PixelType::U8 {
                    data.par_mapv_inplace(f32::round);
                }
                (data, geometry.pixel_type)
            }
        };

        Ok(Projection {
            image: Volume::new(data, grid.clone())?,
            pixel_type,
        })
    }

    /// Rigidly move `volume` by `pose`, resampling onto its own (shifted) grid.
    pub fn transform_volume(
        &self,
        volume: &Volume,
        pose: &Pose,
        convention: MotionConvention,
    ) -> Result<Volume, ProjectionError> {
        let transform = build_transform(volume.geometry(), pose, convention)?;
        let geometry = ProjectionGeometry {
            grid: rigid_output_grid(volume, &transform),
            pixel_type: PixelType::F32,
            ..ProjectionGeometry::default()
        };
        Ok(self
            .project(volume, &transform, &geometry, ProjectionMode::Rigid)?
            .into_image())
    }
}
