//! # DICOM-DRR library
//!
//! This crate generates digitally reconstructed radiographs (DRRs), simulated
//! X-ray images, from CT volumes.

//!
//! Volumes are read from a directory of DICOM files (one series, sorted into
//! slices) or from a single DICOM or MetaImage (`.mhd`) file. A pose, three
//! rotation angles and a translation, is turned into a rigid transform about
//! the volume center. The volume is then either
//!  - resampled onto a new grid (rigid mode), or
//!  - ray-cast from a point source onto a detector plane (DRR mode).
//!
//! DRRs are rescaled to [0, 255], optionally mirrored and written as PNG,
//! TIFF or MetaImage. A sweep repeats this for every rotation of a grid and
//! names each output file after its rotation. Rows of the output grid are
//! resampled in parallel using rayon, and so are the grid points of a sweep.
//!
//! Conventions:
//!   - Angles are in degrees and compose in Z, Y, X order.
//!   - Poses describe motion of the object by default; see
//!     [`MotionConvention`](enums::MotionConvention).
//!   - Arrays are indexed `(z, y, x)`, sizes and physical vectors `(x, y, z)`.
//!
//! # Examples
//!
//! ## Projecting a DICOM series
//!
//! Read all DICOM files from the ct/ directory, rotate the volume by 10
//! degrees about z and write the DRR with the default detector.
//!
//! ```no_run
//! # use dicom_drr::enums::{MotionConvention, ProjectionMode, SortBy};
//! # use dicom_drr::projector::{ProjectionGeometry, Projector};
//! # use dicom_drr::transform::{Pose, build_transform};
//! # use dicom_drr::volume_loader::read_series;
//! # use dicom_drr::writer::{Refuse, write_projection};
//! # use nalgebra::Vector3;
//! # use std::path::Path;
//! let volume = read_series("ct", SortBy::ImagePositionPatient)
//!     .expect("should have loaded the series");
//! let pose = Pose::from_rotation(Vector3::new(0.0, 0.0, 10.0));
//! let transform = build_transform(volume.geometry(), &pose, MotionConvention::Object)
//!     .expect("should have built the transform");
//! let drr = Projector::cpu()
//!     .project(&volume, &transform, &ProjectionGeometry::default(), ProjectionMode::Drr)
//!     .expect("should have projected the volume");
//! write_projection(&drr, Path::new("rz_10.png"), false, &Refuse)
//!     .expect("should have written the image");
//! ```

pub mod config;
pub mod enums;
pub mod geometry;
mod interpolator;
pub mod metaimage;
pub mod projector;
pub mod resample;
pub mod sweep;
pub mod transform;
pub mod volume;
pub mod volume_loader;
pub mod writer;
