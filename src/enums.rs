use nalgebra::Point3;
use serde::Deserialize;

/// Whether a pose describes motion of the imaged object or of the X-ray source.
///
/// `Object` negates rotation and translation before they are expressed in the
/// volume frame, because the resampling transform maps output points back
/// into the volume. `Source` uses the pose as given.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionConvention {
    #[default]
    Object,
    Source,
}

impl MotionConvention {
    pub fn from_mirror_flag(mirror_for_source: bool) -> Self {
        if mirror_for_source {
            MotionConvention::Source
        } else {
            MotionConvention::Object
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProjectionMode {
    /// Reposition the volume, output stays 3-D.
    Rigid,
    /// Ray-cast onto the detector grid.
    #[default]
    Drr,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Interpolation {
    Linear,
    RayCast {
        focal_point: Point3<f64>,
        threshold: f64,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    #[default]
    U8,
    F32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}
