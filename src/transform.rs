//! Pose to rigid transform conversion.
//!
//! A [`Pose`] is what the user asks for: three rotation angles in degrees,
//! a translation and a rotation-center offset. [`build_transform`] turns it
//! into the [`RigidTransform`] the resampler uses to map output points into
//! the volume, following these conventions:
//!
//! - Object motion ([`MotionConvention::Object`]) negates rotation and
//!   translation first; source motion keeps them.
//! - The angle triple and the translation are re-expressed in the volume's
//!   local frame by left-multiplying with the direction matrix.
//! - Rotations compose intrinsically in Z, Y, X order: `R = Rz · Ry · Rx`.
//! - The center of rotation is
//!   `D · (D · origin + spacing ⊙ size / 2) − translation`, where
//!   `translation` is the pose translation as given. It is never the
//!   negated one, even under the object convention.
//! - `center_offset` is accepted but not applied to the center.

use crate::enums::MotionConvention;
use crate::geometry::{GeometryError, ImageGeometry, ORTHONORMAL_TOLERANCE, check_finite};

use nalgebra::{Matrix3, Point3, Rotation3, Vector3};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("Invalid volume geometry: {0}")]
    Geometry(#[from] GeometryError),

    #[error("Rotation matrix drifted from orthonormal (max deviation {deviation:e})")]
    RotationDrift { deviation: f64 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pose {
    /// Rotation about x, y and z in degrees.
    pub rotation_deg: Vector3<f64>,
    pub translation: Vector3<f64>,
    /// Offset of the rotation center from the volume center. Not applied yet.
    pub center_offset: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation_deg: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation_deg,
            translation,
            center_offset: Vector3::zeros(),
        }
    }

    pub fn from_rotation(rotation_deg: Vector3<f64>) -> Self {
        Self::new(rotation_deg, Vector3::zeros())
    }

    pub fn with_center_offset(mut self, center_offset: Vector3<f64>) -> Self {
        self.center_offset = center_offset;
        self
    }

    fn validate(&self) -> Result<(), GeometryError> {
        check_finite("Rotation", &self.rotation_deg)?;
        check_finite("Translation", &self.translation)?;
        check_finite("Center offset", &self.center_offset)
    }
}

/// Rigid transform `p ↦ R (p − c) + c + t`.
#[derive(Clone, Debug, PartialEq)]
pub struct RigidTransform {
    center: Point3<f64>,
    angles: Vector3<f64>,
    rotation: Rotation3<f64>,
    translation: Vector3<f64>,
}

impl RigidTransform {
    pub fn identity(center: Point3<f64>) -> Self {
        Self {
            center,
            angles: Vector3::zeros(),
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from angles in radians about x, y and z, composed `Rz · Ry · Rx`.
    pub fn from_angles(
        center: Point3<f64>,
        angles: Vector3<f64>,
        translation: Vector3<f64>,
    ) -> Result<Self, TransformError> {
        let rotation = zyx_rotation(&angles);
        let matrix = rotation.matrix();
        let deviation = (matrix.transpose() * matrix - Matrix3::identity()).amax();
        if deviation > ORTHONORMAL_TOLERANCE {
            return Err(TransformError::RotationDrift { deviation });
        }
        Ok(Self {
            center,
            angles,
            rotation,
            translation,
        })
    }

    pub fn center(&self) -> &Point3<f64> {
        &self.center
    }

    /// Angles in radians, in the volume's local frame.
    pub fn angles(&self) -> &Vector3<f64> {
        &self.angles
    }

    pub fn rotation(&self) -> &Rotation3<f64> {
        &self.rotation
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        self.rotation.matrix()
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// Translation of the equivalent `p ↦ R p + offset` form.
    pub fn offset(&self) -> Vector3<f64> {
        self.translation + self.center.coords - self.rotation * self.center.coords
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.center + self.rotation * (point - self.center) + self.translation
    }

    pub fn is_identity(&self, epsilon: f64) -> bool {
        (self.matrix() - Matrix3::identity()).amax() <= epsilon
            && self.translation.amax() <= epsilon
    }
}

/// Intrinsic Z, Y, X composition of rotations about the x, y and z axes.
pub fn zyx_rotation(angles: &Vector3<f64>) -> Rotation3<f64> {
    let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), angles.x);
    let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), angles.y);
    let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), angles.z);
    rz * ry * rx
}

/// Build the resampling transform for `pose` applied to a volume with the
/// given geometry.
pub fn build_transform(
    geometry: &ImageGeometry,
    pose: &Pose,
    convention: MotionConvention,
) -> Result<RigidTransform, TransformError> {
    geometry.validate()?;
    pose.validate()?;

    if pose.center_offset != Vector3::zeros() {
        tracing::warn!(
            "center offset {:?} is not applied; rotating about the volume center",
            pose.center_offset.as_slice()
        );
    }

    let (rotation, translation) = match convention {
        MotionConvention::Object => (-pose.rotation_deg, -pose.translation),
        MotionConvention::Source => (pose.rotation_deg, pose.translation),
    };

    let direction = &geometry.direction;
    let rotation_local = direction * rotation;
    let translation_local = direction * translation;

    let center = direction * geometry.origin.coords + geometry.extent() / 2.0;
    let center = direction * center - pose.translation;

    let transform = RigidTransform::from_angles(
        Point3::from(center),
        rotation_local.map(f64::to_radians),
        translation_local,
    )?;
    tracing::debug!(
        "built transform: center {:?}, angles {:?} rad, translation {:?}",
        transform.center().coords.as_slice(),
        transform.angles().as_slice(),
        transform.translation().as_slice()
    );
    Ok(transform)
}
