use crate::enums::SortBy;
use crate::geometry::ImageGeometry;
use crate::metaimage::{self, MetaImageError};
use crate::volume::{Volume, VolumeError};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use itertools::Itertools;
use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::{Array3, Axis, concatenate, s};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("Input \"{0}\" is not a directory")]
    NotADirectory(PathBuf),

    #[error("Input \"{0}\" is not a file")]
    NotAFile(PathBuf),

    #[error("No DICOM files found in \"{0}\"")]
    EmptyDirectory(PathBuf),

    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error in \"{path}\": {source}")]
    Dicom {
        path: PathBuf,
        source: dicom::object::ReadError,
    },

    #[error(transparent)]
    MetaImage(#[from] MetaImageError),

    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// Attributes of one DICOM object that matter for stacking it into a volume.
#[derive(Clone, Debug, Default)]
pub(crate) struct SliceInfo {
    pub(crate) series_uid: Option<String>,
    pub(crate) instance_number: Option<f64>,
    pub(crate) table_position: Option<f64>,
    pub(crate) position: Option<Vector3<f64>>,
    pub(crate) orientation: Option<[f64; 6]>,
    /// Row spacing, column spacing
    pub(crate) pixel_spacing: Option<[f64; 2]>,
    pub(crate) slice_thickness: Option<f64>,
    pub(crate) spacing_between_slices: Option<f64>,
    /// (frames, rows, columns)
    pub(crate) frames: Array3<f32>,
}

impl SliceInfo {
    fn row_column_normal(&self) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
        let o = self.orientation.unwrap_or([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let row = Vector3::new(o[0], o[1], o[2]);
        let column = Vector3::new(o[3], o[4], o[5]);
        (row, column, row.cross(&column))
    }

    fn sort_key(&self, sort_by: SortBy, normal: &Vector3<f64>) -> Option<f64> {
        match sort_by {
            SortBy::ImagePositionPatient => self.position.map(|p| p.dot(normal)),
            SortBy::TablePosition => self.table_position,
            SortBy::InstanceNumber => self.instance_number,
            SortBy::None => Some(0.0),
        }
    }
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume from DICOM objects
    ///
    /// # Arguments
    ///
    /// * `dicom_objects` - Slice of DICOM file objects
    /// * `sort_by` - Method to sort the slices
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found, dimensions are inconsistent
    /// or the pixel spacing is missing
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let slices: Vec<_> = dicom_objects
            .iter()
            .filter_map(Self::extract_slice)
            .collect();

        Self::assemble(slices, sort_by)
    }

    /// Load a volume from file paths, opening and decoding files in parallel
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let slices: Result<Vec<_>, _> = paths
            .par_iter()
            .map(|path| {
                let path = path.as_ref();
                open_file(path)
                    .map(|object| Self::extract_slice(&object))
                    .map_err(|source| VolumeLoaderError::Dicom {
                        path: path.to_path_buf(),
                        source,
                    })
            })
            .collect();

        Self::assemble(slices?.into_iter().flatten().collect(), sort_by)
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(VolumeLoaderError::NotADirectory(path.to_path_buf()));
        }

        tracing::info!("Gathering DICOM names from {}", path.display());
        let paths: Vec<_> = fs::read_dir(path)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .sorted()
            .collect();

        if paths.is_empty() {
            return Err(VolumeLoaderError::EmptyDirectory(path.to_path_buf()));
        }
        tracing::info!("Found {} files", paths.len());

        Self::load_from_file_paths(&paths, sort_by)
    }

    /// Load a volume from a single file: MetaImage for `.mhd`, otherwise a
    /// (possibly multi-frame) DICOM file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VolumeLoaderError::NotAFile(path.to_path_buf()));
        }

        let is_metaimage = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mhd"));
        if is_metaimage {
            return Ok(metaimage::read(path)?);
        }

        Self::load_from_file_paths(&[path], SortBy::None)
    }

    fn extract_slice(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<SliceInfo> {
        let frames = Self::decode_frames(dicom_object)?;

        let multi = |tag| {
            dicom_object
                .element(tag)
                .ok()?
                .to_multi_float64()
                .ok()
        };
        let single = |tag| dicom_object.element(tag).ok()?.to_float64().ok();

        Some(SliceInfo {
            series_uid: dicom_object
                .element(tags::SERIES_INSTANCE_UID)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|uid| uid.trim_end_matches('\0').trim().to_string()),
            instance_number: single(tags::INSTANCE_NUMBER),
            table_position: single(tags::TABLE_POSITION),
            position: multi(tags::IMAGE_POSITION_PATIENT)
                .filter(|p| p.len() == 3)
                .map(|p| Vector3::new(p[0], p[1], p[2])),
            orientation: multi(tags::IMAGE_ORIENTATION_PATIENT)
                .and_then(|o| <[f64; 6]>::try_from(o.as_slice()).ok()),
            pixel_spacing: multi(tags::PIXEL_SPACING)
                .and_then(|s| <[f64; 2]>::try_from(s.as_slice()).ok()),
            slice_thickness: single(tags::SLICE_THICKNESS),
            spacing_between_slices: single(tags::SPACING_BETWEEN_SLICES),
            frames,
        })
    }

    fn decode_frames(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array3<f32>> {
        let pixel_data = match dicom_object.decode_pixel_data() {
            Ok(pixel_data) => pixel_data,
            Err(e) => {
                tracing::warn!("skipping object without decodable pixel data: {e}");
                return None;
            }
        };
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![.., .., .., 0]))
    }

    /// Keep the largest series, order its slices and stack them.
    pub(crate) fn assemble(
        slices: Vec<SliceInfo>,
        sort_by: SortBy,
    ) -> Result<Volume, VolumeLoaderError> {
        let mut series = slices.into_iter().into_group_map_by(|s| s.series_uid.clone());
        let Some(uid) = series
            .iter()
            .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| b.0.cmp(a.0)))
            .map(|(uid, _)| uid.clone())
        else {
            return Err(VolumeLoaderError::NoValidImages);
        };
        if series.len() > 1 {
            tracing::warn!(
                "found {} series, using {} ({} slices)",
                series.len(),
                uid.as_deref().unwrap_or("<unnamed>"),
                series[&uid].len()
            );
        }
        let mut slices = series.remove(&uid).unwrap_or_default();

        let (_, _, normal) = slices[0].row_column_normal();
        Self::sort_slices(&mut slices, sort_by, &normal);

        Self::validate_dimensions(&slices)?;
        let geometry = Self::get_geometry(&slices)?;
        let data = Self::build_volume_array(&slices)?;

        Ok(Volume::new(data, geometry)?)
    }

    fn sort_slices(slices: &mut [SliceInfo], sort_by: SortBy, normal: &Vector3<f64>) {
        if !matches!(sort_by, SortBy::None) {
            slices.sort_by(|a, b| {
                a.sort_key(sort_by, normal)
                    .partial_cmp(&b.sort_key(sort_by, normal))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    fn validate_dimensions(slices: &[SliceInfo]) -> Result<(), VolumeLoaderError> {
        let (_, rows, columns) = slices[0].frames.dim();
        if slices
            .iter()
            .any(|s| (s.frames.dim().1, s.frames.dim().2) != (rows, columns))
        {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(slices: &[SliceInfo]) -> Result<Array3<f32>, VolumeLoaderError> {
        let views: Vec<_> = slices.iter().map(|s| s.frames.view()).collect();
        concatenate(Axis(0), &views).map_err(|_| VolumeLoaderError::InconsistentDimensions)
    }

    fn get_geometry(slices: &[SliceInfo]) -> Result<ImageGeometry, VolumeLoaderError> {
        let first = &slices[0];
        let (depth, rows, columns) = (
            slices.iter().map(|s| s.frames.dim().0).sum::<usize>(),
            first.frames.dim().1,
            first.frames.dim().2,
        );

        let [row_spacing, column_spacing] = slices
            .iter()
            .find_map(|s| s.pixel_spacing)
            .ok_or(VolumeLoaderError::MissingSpacing)?;

        let (row, column, normal) = first.row_column_normal();
        let positions: Option<Vec<_>> = slices.iter().map(|s| s.position).collect();

        // Stack direction and spacing from the slice positions when available.
        let stacked = positions
            .filter(|p| p.len() > 1 && depth == slices.len())
            .and_then(|p| {
                let along_normal = (p[p.len() - 1] - p[0]).dot(&normal);
                let spacing = along_normal.abs() / (p.len() - 1) as f64;
                (spacing > f64::EPSILON).then(|| (along_normal.signum() * normal, spacing))
            });

        let (stack_axis, slice_spacing) = match stacked {
            Some(stacked) => stacked,
            None => {
                let fallback = first
                    .spacing_between_slices
                    .or(first.slice_thickness)
                    .filter(|s| *s > 0.0);
                match fallback {
                    Some(spacing) => (normal, spacing),
                    None if depth == 1 => (normal, 1.0),
                    None => return Err(VolumeLoaderError::MissingSpacing),
                }
            }
        };

        let origin = first.position.unwrap_or_else(Vector3::zeros);
        Ok(ImageGeometry::new(
            [columns, rows, depth],
            Vector3::new(column_spacing, row_spacing, slice_spacing),
            Point3::from(origin),
            Matrix3::from_columns(&[row, column, stack_axis]),
        ))
    }
}

/// Read the largest DICOM series found in `directory`.
pub fn read_series(
    directory: impl AsRef<Path>,
    sort_by: SortBy,
) -> Result<Volume, VolumeLoaderError> {
    VolumeLoader::load_from_directory(directory, sort_by)
}

/// Read a single MetaImage or DICOM file.
pub fn read_single(file_path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
    VolumeLoader::load_from_file(file_path)
}

/// Directories are read as DICOM series, anything else as a single file.
pub fn read_any(path: impl AsRef<Path>, sort_by: SortBy) -> Result<Volume, VolumeLoaderError> {
    let path = path.as_ref();
    if path.is_dir() {
        read_series(path, sort_by)
    } else {
        read_single(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use tempfile::tempdir;

    fn axial_slice(z: f64, value: f32, instance: f64) -> SliceInfo {
        SliceInfo {
            series_uid: Some("1.2.3".to_string()),
            instance_number: Some(instance),
            position: Some(Vector3::new(-100.0, -120.0, z)),
            orientation: Some([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
            pixel_spacing: Some([0.8, 0.6]),
            slice_thickness: Some(5.0),
            frames: Array3::from_elem((1, 3, 2), value),
            ..SliceInfo::default()
        }
    }

    #[test]
    fn missing_directory_is_reported_with_path() {
        let err = read_series("/definitely/not/here", SortBy::default()).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::NotADirectory(_)));
        assert!(err.to_string().contains("/definitely/not/here"));
    }

    #[test]
    fn directory_without_dicom_files_is_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
        let err = read_series(dir.path(), SortBy::default()).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::EmptyDirectory(_)));
    }

    #[test]
    fn unreadable_dicom_file_names_the_file() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("broken.dcm");
        fs::write(&bad, b"garbage").unwrap();
        let err = read_series(dir.path(), SortBy::default()).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::Dicom { .. }));
        assert!(err.to_string().contains("broken.dcm"));
    }

    #[test]
    fn missing_file_is_not_a_file() {
        let err = read_single("/definitely/not/here.mhd").unwrap_err();
        assert!(matches!(err, VolumeLoaderError::NotAFile(_)));
    }

    #[test]
    fn no_slices_means_no_images() {
        let err = VolumeLoader::assemble(Vec::new(), SortBy::default()).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::NoValidImages));
    }

    #[test]
    fn slices_sorted_by_position_along_normal() {
        let slices = vec![
            axial_slice(20.0, 3.0, 1.0),
            axial_slice(10.0, 1.0, 2.0),
            axial_slice(15.0, 2.0, 3.0),
        ];
        let volume = VolumeLoader::assemble(slices, SortBy::ImagePositionPatient).unwrap();

        assert_eq!(volume.size(), [2, 3, 3]);
        assert_eq!(volume.data()[[0, 0, 0]], 1.0);
        assert_eq!(volume.data()[[2, 0, 0]], 3.0);
        assert_eq!(volume.origin().z, 10.0);
        assert_float_eq!(volume.spacing().z, 5.0, abs <= 1e-12);
        // pixel spacing is (row, column) while geometry is (x, y, z)
        assert_eq!(volume.spacing().x, 0.6);
        assert_eq!(volume.spacing().y, 0.8);
        assert_eq!(*volume.direction(), Matrix3::identity());
    }

    #[test]
    fn descending_stack_flips_third_axis() {
        let slices = vec![
            axial_slice(20.0, 3.0, 1.0),
            axial_slice(10.0, 1.0, 3.0),
            axial_slice(15.0, 2.0, 2.0),
        ];
        let volume = VolumeLoader::assemble(slices, SortBy::InstanceNumber).unwrap();

        assert_eq!(volume.data()[[0, 0, 0]], 3.0);
        assert_eq!(volume.origin().z, 20.0);
        assert_eq!(volume.direction().column(2).into_owned(), Vector3::new(0.0, 0.0, -1.0));
        assert!(volume.geometry().validate().is_ok());
    }

    #[test]
    fn largest_series_wins() {
        let mut other = axial_slice(0.0, 9.0, 1.0);
        other.series_uid = Some("9.9.9".to_string());
        let slices = vec![
            axial_slice(10.0, 1.0, 1.0),
            other,
            axial_slice(12.0, 2.0, 2.0),
        ];
        let volume = VolumeLoader::assemble(slices, SortBy::default()).unwrap();
        assert_eq!(volume.size()[2], 2);
        assert!(volume.data().iter().all(|&v| v != 9.0));
    }

    #[test]
    fn single_slice_without_positions_uses_thickness() {
        let mut slice = axial_slice(0.0, 1.0, 1.0);
        slice.position = None;
        let volume = VolumeLoader::assemble(vec![slice], SortBy::default()).unwrap();
        assert_eq!(volume.spacing().z, 5.0);
        assert_eq!(*volume.origin(), Point3::origin());
    }

    #[test]
    fn multi_slice_without_any_z_spacing_fails() {
        let slices: Vec<_> = (0..2)
            .map(|i| {
                let mut slice = axial_slice(0.0, 1.0, i as f64);
                slice.position = None;
                slice.slice_thickness = None;
                slice
            })
            .collect();
        let err = VolumeLoader::assemble(slices, SortBy::InstanceNumber).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::MissingSpacing));
    }

    #[test]
    fn mismatched_slice_shapes_rejected() {
        let mut odd = axial_slice(12.0, 2.0, 2.0);
        odd.frames = Array3::zeros((1, 4, 2));
        let err = VolumeLoader::assemble(vec![axial_slice(10.0, 1.0, 1.0), odd], SortBy::default())
            .unwrap_err();
        assert!(matches!(err, VolumeLoaderError::InconsistentDimensions));
    }

    #[test]
    fn oblique_orientation_becomes_direction() {
        let s = std::f64::consts::FRAC_1_SQRT_2;
        let slices: Vec<_> = (0..2)
            .map(|i| {
                let mut slice = axial_slice(0.0, i as f32, i as f64);
                slice.orientation = Some([s, s, 0.0, -s, s, 0.0]);
                slice.position = Some(Vector3::new(0.0, 0.0, 2.0 * i as f64));
                slice
            })
            .collect();
        let volume = VolumeLoader::assemble(slices, SortBy::default()).unwrap();
        let d = volume.direction();
        assert_float_eq!(d[(0, 0)], s, abs <= 1e-12);
        assert_float_eq!(d[(1, 0)], s, abs <= 1e-12);
        assert_float_eq!(d[(0, 1)], -s, abs <= 1e-12);
        assert_float_eq!(d[(2, 2)], 1.0, abs <= 1e-12);
        assert_float_eq!(volume.spacing().z, 2.0, abs <= 1e-12);
    }
}
