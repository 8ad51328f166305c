use crate::enums::Interpolation;
use crate::geometry::{GeometryError, ImageGeometry};
use crate::interpolator::Interpolator;
use crate::transform::RigidTransform;
use crate::volume::Volume;

use nalgebra::Vector3;
use ndarray::{Array3, Axis};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ResampleError {
    #[error("Invalid output grid: {0}")]
    OutputGeometry(GeometryError),

    #[error("Invalid input volume: {0}")]
    InputGeometry(GeometryError),

    #[error("Focal point or threshold is not finite")]
    NonFiniteRayParameters,

    #[error("Resampling produced {count} non-finite samples")]
    NonFiniteResult { count: usize },

    #[error("Resampler failed: {0}")]
    Backend(String),
}

/// Maps every output grid point through a transform and samples the volume there.
pub trait Resampler {
    fn resample(
        &self,
        volume: &Volume,
        transform: &RigidTransform,
        interpolation: &Interpolation,
        output: &ImageGeometry,
        default_value: f32,
    ) -> Result<Array3<f32>, ResampleError>;
}

/// Multithreaded CPU resampler, one rayon task per output row.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuResampler;

impl CpuResampler {
    fn sample(
        volume: &Volume,
        transform: &RigidTransform,
        interpolation: &Interpolation,
        point: &nalgebra::Point3<f64>,
        default_value: f32,
    ) -> f32 {
        let geometry = volume.geometry();
        let mapped = transform.transform_point(point);
        match interpolation {
            Interpolation::Linear => {
                let index = geometry.physical_to_index(&mapped);
                Interpolator::trilinear_interpolate(volume.data(), &index).unwrap_or(default_value)
            }
            Interpolation::RayCast {
                focal_point,
                threshold,
            } => {
                let focal = transform.transform_point(focal_point);
                let start = geometry.physical_to_index(&mapped);
                let end = geometry.physical_to_index(&focal);
                let length = (focal - mapped).norm();
                Interpolator::ray_integral(volume.data(), &start, &end, length, *threshold)
                    .map(|integral| integral as f32)
                    .unwrap_or(default_value)
            }
        }
    }
}

impl Resampler for CpuResampler {
    fn resample(
        &self,
        volume: &Volume,
        transform: &RigidTransform,
        interpolation: &Interpolation,
        output: &ImageGeometry,
        default_value: f32,
    ) -> Result<Array3<f32>, ResampleError> {
        output.validate().map_err(ResampleError::OutputGeometry)?;
        volume
            .geometry()
            .validate()
            .map_err(ResampleError::InputGeometry)?;
        if let Interpolation::RayCast {
            focal_point,
            threshold,
        } = interpolation
        {
            if !focal_point.coords.iter().all(|v| v.is_finite()) || !threshold.is_finite() {
                return Err(ResampleError::NonFiniteRayParameters);
            }
        }

        let [width, height, depth] = output.size;
        let mut result = Array3::<f32>::zeros((depth, height, width));

        result
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(z, mut plane)| {
                for (y, mut row) in plane.axis_iter_mut(Axis(0)).enumerate() {
                    for (x, value) in row.iter_mut().enumerate() {
                        let point =
                            output.index_to_physical(&Vector3::new(x as f64, y as f64, z as f64));
                        *value =
                            Self::sample(volume, transform, interpolation, &point, default_value);
                    }
                }
            });

        let count = result.iter().filter(|v| !v.is_finite()).count();
        if count > 0 {
            return Err(ResampleError::NonFiniteResult { count });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::MotionConvention;
    use crate::transform::{Pose, build_transform};
    use float_eq::assert_float_eq;
    use nalgebra::{Matrix3, Point3};

    fn ramp_volume() -> Volume {
        let data = Array3::from_shape_fn((4, 5, 6), |(z, y, x)| (x + 10 * y + 100 * z) as f32);
        Volume::with_unit_geometry(data).unwrap()
    }

    #[test]
    fn identity_linear_resample_reproduces_volume() {
        let volume = ramp_volume();
        let transform =
            build_transform(volume.geometry(), &Pose::default(), MotionConvention::Object).unwrap();
        let out = CpuResampler
            .resample(&volume, &transform, &Interpolation::Linear, volume.geometry(), -1.0)
            .unwrap();
        assert_eq!(out, *volume.data());
    }

    #[test]
    fn points_outside_get_default_value() {
        let volume = ramp_volume();
        let transform = RigidTransform::identity(Point3::origin());
        let output = ImageGeometry::new(
            [2, 1, 1],
            Vector3::repeat(1.0),
            Point3::new(5.0, 0.0, 0.0),
            Matrix3::identity(),
        );
        let out = CpuResampler
            .resample(&volume, &transform, &Interpolation::Linear, &output, -7.0)
            .unwrap();
        assert_eq!(out[[0, 0, 0]], 5.0);
        assert_eq!(out[[0, 0, 1]], -7.0);
    }

    #[test]
    fn ray_cast_integrates_along_z() {
        let volume = Volume::with_unit_geometry(Array3::from_elem((8, 4, 4), 1.0)).unwrap();
        let transform = RigidTransform::identity(Point3::origin());
        let interpolation = Interpolation::RayCast {
            focal_point: Point3::new(1.5, 1.5, 100.0),
            threshold: 0.0,
        };
        // single detector pixel straight below the focal point
        let detector = ImageGeometry::new(
            [1, 1, 1],
            Vector3::repeat(1.0),
            Point3::new(1.5, 1.5, -50.0),
            Matrix3::identity(),
        );
        let out = CpuResampler
            .resample(&volume, &transform, &interpolation, &detector, 0.0)
            .unwrap();
        assert_float_eq!(out[[0, 0, 0]], 7.0, abs <= 1e-5);
    }

    #[test]
    fn ray_cast_respects_spacing() {
        let geometry = ImageGeometry::new(
            [4, 4, 8],
            Vector3::new(1.0, 1.0, 2.5),
            Point3::origin(),
            Matrix3::identity(),
        );
        let volume = Volume::new(Array3::from_elem((8, 4, 4), 1.0), geometry).unwrap();
        let transform = RigidTransform::identity(Point3::origin());
        let interpolation = Interpolation::RayCast {
            focal_point: Point3::new(1.5, 1.5, 100.0),
            threshold: 0.0,
        };
        let detector = ImageGeometry::new(
            [1, 1, 1],
            Vector3::repeat(1.0),
            Point3::new(1.5, 1.5, -50.0),
            Matrix3::identity(),
        );
        let out = CpuResampler
            .resample(&volume, &transform, &interpolation, &detector, 0.0)
            .unwrap();
        assert_float_eq!(out[[0, 0, 0]], 7.0 * 2.5, abs <= 1e-4);
    }

    #[test]
    fn invalid_output_grid_is_an_error() {
        let volume = ramp_volume();
        let transform = RigidTransform::identity(Point3::origin());
        let mut output = volume.geometry().clone();
        output.spacing.x = -1.0;
        let err = CpuResampler
            .resample(&volume, &transform, &Interpolation::Linear, &output, 0.0)
            .unwrap_err();
        assert!(matches!(err, ResampleError::OutputGeometry(_)));
    }

    #[test]
    fn non_finite_focal_point_is_an_error() {
        let volume = ramp_volume();
        let transform = RigidTransform::identity(Point3::origin());
        let interpolation = Interpolation::RayCast {
            focal_point: Point3::new(0.0, f64::INFINITY, 0.0),
            threshold: 0.0,
        };
        let err = CpuResampler
            .resample(&volume, &transform, &interpolation, volume.geometry(), 0.0)
            .unwrap_err();
        assert_eq!(err, ResampleError::NonFiniteRayParameters);
    }
}
