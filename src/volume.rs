use crate::geometry::{GeometryError, ImageGeometry};

use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::Array3;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum VolumeError {
    #[error("Voxel array shape {array:?} does not match grid size {size:?} (expected (z, y, x))")]
    ShapeMismatch {
        array: (usize, usize, usize),
        size: [usize; 3],
    },

    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

/// A scalar field sampled on a regular grid with a physical placement.
///
/// Voxels are stored `(depth, height, width)`, i.e. `(z, y, x)`, while
/// [`ImageGeometry`] orders everything `(x, y, z)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    data: Array3<f32>,
    geometry: ImageGeometry,
}

impl Volume {
    pub fn new(data: Array3<f32>, geometry: ImageGeometry) -> Result<Self, VolumeError> {
        geometry.validate()?;
        let (depth, height, width) = data.dim();
        if [width, height, depth] != geometry.size {
            return Err(VolumeError::ShapeMismatch {
                array: data.dim(),
                size: geometry.size,
            });
        }
        Ok(Self { data, geometry })
    }

    /// Volume with unit spacing, zero origin and identity direction.
    pub fn with_unit_geometry(data: Array3<f32>) -> Result<Self, VolumeError> {
        let (depth, height, width) = data.dim();
        let geometry = ImageGeometry {
            size: [width, height, depth],
            ..ImageGeometry::default()
        };
        Self::new(data, geometry)
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get the grid size ordered (x, y, z)
    pub fn size(&self) -> [usize; 3] {
        self.geometry.size
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    pub fn geometry(&self) -> &ImageGeometry {
        &self.geometry
    }

    pub fn spacing(&self) -> &Vector3<f64> {
        &self.geometry.spacing
    }

    pub fn origin(&self) -> &Point3<f64> {
        &self.geometry.origin
    }

    pub fn direction(&self) -> &Matrix3<f64> {
        &self.geometry.direction
    }

    /// Smallest and largest voxel value.
    pub fn min_max(&self) -> (f32, f32) {
        self.data
            .as_slice_memory_order()
            .map(|values| {
                values
                    .par_iter()
                    .fold(
                        || (f32::INFINITY, f32::NEG_INFINITY),
                        |(lo, hi), &v| (lo.min(v), hi.max(v)),
                    )
                    .reduce(
                        || (f32::INFINITY, f32::NEG_INFINITY),
                        |a, b| (a.0.min(b.0), a.1.max(b.1)),
                    )
            })
            .unwrap_or_else(|| {
                self.data
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    })
            })
    }
}
