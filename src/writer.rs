use crate::enums::PixelType;
use crate::metaimage::{self, MetaImageError};
use crate::projector::Projection;
use crate::volume::Volume;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Will not overwrite \"{0}\"")]
    OverwriteRefused(PathBuf),

    #[error("Unsupported output format for \"{0}\" (use .png, .tif, .tiff or .mhd)")]
    UnsupportedFormat(PathBuf),

    #[error("\"{path}\" can only hold 2-D images, got depth {depth}")]
    NotTwoDimensional { path: PathBuf, depth: usize },

    #[error("Failed to encode \"{path}\": {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error(transparent)]
    MetaImage(#[from] MetaImageError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    #[serde(alias = "tif")]
    Tiff,
    #[serde(alias = "mhd")]
    MetaImage,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some(OutputFormat::Png),
            "tif" | "tiff" => Some(OutputFormat::Tiff),
            "mhd" => Some(OutputFormat::MetaImage),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Tiff => "tif",
            OutputFormat::MetaImage => "mhd",
        }
    }
}

/// Decides whether an existing output file may be replaced.
pub trait ConfirmOverwrite: Sync {
    fn confirm(&self, path: &Path) -> bool;
}

impl<F> ConfirmOverwrite for F
where
    F: Fn(&Path) -> bool + Sync,
{
    fn confirm(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Never replace existing files.
#[derive(Clone, Copy, Debug, Default)]
pub struct Refuse;

impl ConfirmOverwrite for Refuse {
    fn confirm(&self, _path: &Path) -> bool {
        false
    }
}

/// Ask on the terminal, one question at a time.
#[derive(Debug, Default)]
pub struct StdinPrompt {
    lock: Mutex<()>,
}

impl ConfirmOverwrite for StdinPrompt {
    fn confirm(&self, path: &Path) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        eprint!("Output file \"{}\" exists. Overwrite? [Y/n] ", path.display());
        let _ = io::stderr().flush();
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => false,
            Ok(_) => is_affirmative(&answer),
        }
    }
}

/// `y`, `ye`, `yes` and an empty answer mean yes.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "" | "y" | "ye" | "yes"
    )
}

/// Every file a write to `path` creates; MetaImage adds its `.raw` sibling.
fn output_files(path: &Path, format: OutputFormat) -> Vec<PathBuf> {
    match format {
        OutputFormat::MetaImage => vec![path.to_path_buf(), metaimage::data_file_path(path)],
        OutputFormat::Png | OutputFormat::Tiff => vec![path.to_path_buf()],
    }
}

fn check_overwrite(
    path: &Path,
    format: OutputFormat,
    overwrite: bool,
    confirm: &dyn ConfirmOverwrite,
) -> Result<(), WriteError> {
    if overwrite {
        return Ok(());
    }
    for file in output_files(path, format) {
        if file.exists() && !confirm.confirm(&file) {
            return Err(WriteError::OverwriteRefused(file));
        }
    }
    Ok(())
}

/// Write a projection; the format follows the file extension.
pub fn write_projection(
    projection: &Projection,
    path: &Path,
    overwrite: bool,
    confirm: &dyn ConfirmOverwrite,
) -> Result<(), WriteError> {
    let format =
        OutputFormat::from_path(path).ok_or_else(|| WriteError::UnsupportedFormat(path.into()))?;
    check_overwrite(path, format, overwrite, confirm)?;

    tracing::info!("Writing image: {}", path.display());
    match format {
        OutputFormat::MetaImage => {
            metaimage::write(projection.image(), path, projection.pixel_type())?
        }
        OutputFormat::Png | OutputFormat::Tiff => {
            let image = projection
                .to_luma8()
                .ok_or_else(|| WriteError::NotTwoDimensional {
                    path: path.into(),
                    depth: projection.depth(),
                })?;
            image.save(path).map_err(|source| WriteError::Image {
                path: path.into(),
                source,
            })?;
        }
    }
    Ok(())
}

/// Write a volume as MetaImage with float voxels.
pub fn write_volume(
    volume: &Volume,
    path: &Path,
    overwrite: bool,
    confirm: &dyn ConfirmOverwrite,
) -> Result<(), WriteError> {
    if OutputFormat::from_path(path) != Some(OutputFormat::MetaImage) {
        return Err(WriteError::UnsupportedFormat(path.into()));
    }
    check_overwrite(path, OutputFormat::MetaImage, overwrite, confirm)?;

    tracing::info!("Writing the transformed volume at: {}", path.display());
    metaimage::write(volume, path, PixelType::F32)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{MotionConvention, ProjectionMode};
    use crate::geometry::ImageGeometry;
    use crate::projector::{ProjectionGeometry, Projector};
    use crate::transform::{Pose, build_transform};
    use nalgebra::{Matrix3, Point3, Vector3};
    use ndarray::Array3;
    use rstest::rstest;
    use std::fs;
    use tempfile::tempdir;

    fn projection() -> Projection {
        let volume = Volume::with_unit_geometry(Array3::from_elem((4, 4, 4), 1.0)).unwrap();
        let transform =
            build_transform(volume.geometry(), &Pose::default(), MotionConvention::Object).unwrap();
        let geometry = ProjectionGeometry {
            grid: ImageGeometry::new(
                [6, 5, 1],
                Vector3::repeat(1.0),
                Point3::new(-1.0, -1.0, -50.0),
                Matrix3::identity(),
            ),
            focal_point: Point3::new(1.5, 1.5, 500.0),
            ..ProjectionGeometry::default()
        };
        Projector::cpu()
            .project(&volume, &transform, &geometry, ProjectionMode::Drr)
            .unwrap()
    }

    #[rstest]
    #[case("", true)]
    #[case("y", true)]
    #[case("Yes\n", true)]
    #[case("  YE ", true)]
    #[case("n", false)]
    #[case("no", false)]
    #[case("yess", false)]
    fn affirmative_answers(#[case] answer: &str, #[case] expected: bool) {
        assert_eq!(is_affirmative(answer), expected);
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("a.PNG")), Some(OutputFormat::Png));
        assert_eq!(OutputFormat::from_path(Path::new("a.tiff")), Some(OutputFormat::Tiff));
        assert_eq!(OutputFormat::from_path(Path::new("a.mhd")), Some(OutputFormat::MetaImage));
        assert_eq!(OutputFormat::from_path(Path::new("a.nii")), None);
        assert_eq!(OutputFormat::from_path(Path::new("noext")), None);
    }

    #[test]
    fn png_has_detector_dimensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drr.png");
        write_projection(&projection(), &path, false, &Refuse).unwrap();
        let reloaded = image::open(&path).unwrap().into_luma8();
        assert_eq!(reloaded.dimensions(), (6, 5));
    }

    #[test]
    fn refused_overwrite_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drr.png");
        fs::write(&path, b"precious").unwrap();

        let err = write_projection(&projection(), &path, false, &|_: &Path| false).unwrap_err();
        assert!(matches!(err, WriteError::OverwriteRefused(_)));
        assert_eq!(fs::read(&path).unwrap(), b"precious");
    }

    #[test]
    fn refused_overwrite_protects_metaimage_data_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ct.mhd");
        let raw = dir.path().join("ct.raw");
        fs::write(&raw, b"precious").unwrap();
        let volume = Volume::with_unit_geometry(Array3::zeros((2, 2, 2))).unwrap();

        let err = write_volume(&volume, &path, false, &Refuse).unwrap_err();
        assert!(matches!(err, WriteError::OverwriteRefused(ref p) if *p == raw));
        assert_eq!(fs::read(&raw).unwrap(), b"precious");
        assert!(!path.exists());

        let asked = Mutex::new(Vec::new());
        let record = |p: &Path| {
            asked.lock().unwrap().push(p.to_path_buf());
            false
        };
        assert!(write_projection(&projection(), &path, false, &record).is_err());
        assert_eq!(*asked.lock().unwrap(), vec![raw.clone()]);
        assert_eq!(fs::read(&raw).unwrap(), b"precious");
    }

    #[test]
    fn refused_answer_from_prompt_function() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drr.png");
        fs::write(&path, b"precious").unwrap();

        let answer_no = |_: &Path| is_affirmative("n");
        assert!(write_projection(&projection(), &path, false, &answer_no).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"precious");
    }

    #[test]
    fn confirmed_overwrite_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drr.png");
        fs::write(&path, b"old").unwrap();

        write_projection(&projection(), &path, false, &|_: &Path| true).unwrap();
        assert_ne!(fs::read(&path).unwrap(), b"old");
    }

    #[test]
    fn forced_overwrite_skips_confirmation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drr.png");
        fs::write(&path, b"old").unwrap();

        write_projection(&projection(), &path, true, &Refuse).unwrap();
        assert!(image::open(&path).is_ok());
    }

    #[test]
    fn volume_needs_metaimage_extension() {
        let dir = tempdir().unwrap();
        let volume = Volume::with_unit_geometry(Array3::zeros((2, 2, 2))).unwrap();
        let err = write_volume(&volume, &dir.path().join("ct.png"), true, &Refuse).unwrap_err();
        assert!(matches!(err, WriteError::UnsupportedFormat(_)));
        write_volume(&volume, &dir.path().join("ct.mhd"), true, &Refuse).unwrap();
        assert!(dir.path().join("ct.raw").exists());
    }

    #[test]
    fn projection_as_metaimage_keeps_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drr.mhd");
        let projection = projection();
        write_projection(&projection, &path, false, &Refuse).unwrap();
        let reloaded = metaimage::read(&path).unwrap();
        assert_eq!(reloaded, *projection.image());
    }
}
