//! Physical layout of a sampled grid.
//!
//! A grid index `i = (x, y, z)` maps to the physical point
//! `origin + direction * (spacing ⊙ i)`. Sizes and spacings are ordered
//! (x, y, z) even though the voxel arrays are stored (z, y, x).

use nalgebra::{Matrix3, Point3, Vector3};
use thiserror::Error;

/// Tolerance used when checking that a direction matrix is orthonormal.
pub const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("Grid size must be non-zero on every axis, got {0:?}")]
    EmptySize([usize; 3]),

    #[error("Spacing along axis {axis} must be finite and positive, got {value}")]
    InvalidSpacing { axis: usize, value: f64 },

    #[error("{0} contains NaN or infinite values")]
    NonFinite(&'static str),

    #[error("Direction matrix is not orthonormal (max deviation {deviation:e})")]
    NonOrthonormalDirection { deviation: f64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageGeometry {
    pub size: [usize; 3],
    pub spacing: Vector3<f64>,
    pub origin: Point3<f64>,
    pub direction: Matrix3<f64>,
}

impl Default for ImageGeometry {
    fn default() -> Self {
        Self {
            size: [1, 1, 1],
            spacing: Vector3::repeat(1.0),
            origin: Point3::origin(),
            direction: Matrix3::identity(),
        }
    }
}

impl ImageGeometry {
    pub fn new(
        size: [usize; 3],
        spacing: Vector3<f64>,
        origin: Point3<f64>,
        direction: Matrix3<f64>,
    ) -> Self {
        Self {
            size,
            spacing,
            origin,
            direction,
        }
    }

    /// Check the invariants every grid handed to the resampler must satisfy.
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.size.contains(&0) {
            return Err(GeometryError::EmptySize(self.size));
        }
        for (axis, &value) in self.spacing.iter().enumerate() {
            if !value.is_finite() || value <= 0.0 {
                return Err(GeometryError::InvalidSpacing { axis, value });
            }
        }
        if !self.origin.coords.iter().all(|v| v.is_finite()) {
            return Err(GeometryError::NonFinite("Origin"));
        }
        check_orthonormal(&self.direction)
    }

    /// Physical size covered by the grid along each index axis.
    pub fn extent(&self) -> Vector3<f64> {
        self.spacing.component_mul(&self.size_vector())
    }

    pub fn size_vector(&self) -> Vector3<f64> {
        Vector3::new(
            self.size[0] as f64,
            self.size[1] as f64,
            self.size[2] as f64,
        )
    }

    pub fn num_elements(&self) -> usize {
        self.size.iter().product()
    }

    pub fn index_to_physical(&self, index: &Vector3<f64>) -> Point3<f64> {
        self.origin + self.direction * self.spacing.component_mul(index)
    }

    /// Continuous index of a physical point.
    pub fn physical_to_index(&self, point: &Point3<f64>) -> Vector3<f64> {
        (self.direction.transpose() * (point - self.origin)).component_div(&self.spacing)
    }
}

pub fn check_orthonormal(direction: &Matrix3<f64>) -> Result<(), GeometryError> {
    if !direction.iter().all(|v| v.is_finite()) {
        return Err(GeometryError::NonFinite("Direction matrix"));
    }
    let deviation = (direction.transpose() * direction - Matrix3::identity()).amax();
    if deviation > ORTHONORMAL_TOLERANCE {
        return Err(GeometryError::NonOrthonormalDirection { deviation });
    }
    Ok(())
}

pub fn check_finite(name: &'static str, vector: &Vector3<f64>) -> Result<(), GeometryError> {
    if vector.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(GeometryError::NonFinite(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;

    fn oblique() -> ImageGeometry {
        // 90 degrees about z
        #[rustfmt::skip]
        let direction = Matrix3::new(
            0.0, -1.0, 0.0,
            1.0, 0.0, 0.0,
            0.0, 0.0, 1.0,
        );
        ImageGeometry::new(
            [4, 5, 6],
            Vector3::new(0.5, 2.0, 1.5),
            Point3::new(10.0, -3.0, 7.0),
            direction,
        )
    }

    #[test]
    fn index_physical_roundtrip() {
        let geometry = oblique();
        let index = Vector3::new(1.5, 3.0, 4.25);
        let point = geometry.index_to_physical(&index);
        let back = geometry.physical_to_index(&point);
        for axis in 0..3 {
            assert_float_eq!(back[axis], index[axis], abs <= 1e-12);
        }
    }

    #[test]
    fn index_to_physical_applies_direction() {
        let geometry = oblique();
        let point = geometry.index_to_physical(&Vector3::new(2.0, 0.0, 0.0));
        // one voxel along x is 0.5 mm, which the direction sends along +y
        assert_float_eq!(point.x, 10.0, abs <= 1e-12);
        assert_float_eq!(point.y, -2.0, abs <= 1e-12);
        assert_float_eq!(point.z, 7.0, abs <= 1e-12);
    }

    #[test]
    fn extent_is_spacing_times_size() {
        let extent = oblique().extent();
        assert_eq!(extent, Vector3::new(2.0, 10.0, 9.0));
    }

    #[test]
    fn valid_geometry_passes() {
        assert_eq!(oblique().validate(), Ok(()));
    }

    #[test]
    fn zero_size_rejected() {
        let mut geometry = oblique();
        geometry.size = [4, 0, 6];
        assert_eq!(geometry.validate(), Err(GeometryError::EmptySize([4, 0, 6])));
    }

    #[test]
    fn non_positive_spacing_rejected() {
        let mut geometry = oblique();
        geometry.spacing.z = 0.0;
        assert_eq!(
            geometry.validate(),
            Err(GeometryError::InvalidSpacing { axis: 2, value: 0.0 })
        );
    }

    #[test]
    fn nan_origin_rejected() {
        let mut geometry = oblique();
        geometry.origin.y = f64::NAN;
        assert_eq!(geometry.validate(), Err(GeometryError::NonFinite("Origin")));
    }

    #[test]
    fn skewed_direction_rejected() {
        let mut geometry = oblique();
        geometry.direction[(0, 1)] = 0.5;
        assert!(matches!(
            geometry.validate(),
            Err(GeometryError::NonOrthonormalDirection { .. })
        ));
    }

    #[test]
    fn reflection_is_orthonormal() {
        let direction = Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0));
        assert_eq!(check_orthonormal(&direction), Ok(()));
    }
}
