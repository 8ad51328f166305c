use dicom_drr::enums::MotionConvention;
use dicom_drr::geometry::ImageGeometry;
use dicom_drr::metaimage;
use dicom_drr::projector::{ProjectionGeometry, Projector};
use dicom_drr::sweep::{RotationGrid, SweepControl, SweepOutcome, SweepPlan, run_sweep};
use dicom_drr::volume::Volume;
use dicom_drr::writer::OutputFormat;

use nalgebra::{Matrix3, Point3, Vector3};
use ndarray::Array3;
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::fs;
use tempfile::tempdir;

// Asymmetric phantom: a dense rod along x plus a bright corner block, so that
// every rotation of the grid gives a different picture.
fn phantom() -> Volume {
    let geometry = ImageGeometry::new(
        [16, 12, 10],
        Vector3::new(1.0, 1.0, 1.5),
        Point3::new(-7.5, -5.5, -6.75),
        Matrix3::identity(),
    );
    let data = Array3::from_shape_fn((10, 12, 16), |(z, y, x)| {
        let rod = if (4..6).contains(&y) && (4..6).contains(&z) { 100.0 } else { 0.0 };
        let block = if x < 4 && y > 8 && z > 6 { 250.0 } else { 0.0 };
        10.0 + rod + block
    });
    Volume::new(data, geometry).unwrap()
}

fn detector() -> ProjectionGeometry {
    ProjectionGeometry {
        grid: ImageGeometry::new(
            [24, 20, 1],
            Vector3::repeat(1.0),
            Point3::new(-11.5, -9.5, -60.0),
            Matrix3::identity(),
        ),
        focal_point: Point3::new(0.0, 0.0, 400.0),
        ..ProjectionGeometry::default()
    }
}

fn grid() -> RotationGrid {
    RotationGrid::List(vec![
        [0.0, 0.0, 0.0],
        [5.0, 0.0, 0.0],
        [0.0, 5.0, 0.0],
        [0.0, 0.0, 5.0],
    ])
}

#[test]
fn four_rotations_give_four_named_files() {
    let dir = tempdir().unwrap();
    let output_dir = dir.path().join("drr");
    let plan = SweepPlan::new(grid(), &output_dir);

    let report = run_sweep(
        &Projector::cpu(),
        &phantom(),
        &plan,
        &detector(),
        &SweepControl::default(),
    )
    .unwrap();
    assert!(report.is_success());

    let written: BTreeSet<String> = fs::read_dir(&output_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    let expected: BTreeSet<String> = [
        "rx_0ry_0rz_0.png",
        "rx_5ry_0rz_0.png",
        "rx_0ry_5rz_0.png",
        "rx_0ry_0rz_5.png",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert_eq!(written, expected);

    // each report entry points at the file named after its own rotation
    let names: Vec<String> = report
        .items
        .iter()
        .map(|item| item.path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "rx_0ry_0rz_0.png",
            "rx_5ry_0rz_0.png",
            "rx_0ry_5rz_0.png",
            "rx_0ry_0rz_5.png"
        ]
    );

    for path in report.written() {
        let image = image::open(path).unwrap().into_luma8();
        assert_eq!(image.dimensions(), (24, 20));
    }
}

#[test]
fn rotations_change_the_image() {
    let dir = tempdir().unwrap();
    let plan = SweepPlan::new(grid(), dir.path());
    let report = run_sweep(
        &Projector::cpu(),
        &phantom(),
        &plan,
        &detector(),
        &SweepControl::default(),
    )
    .unwrap();

    let images: Vec<Vec<u8>> = report
        .written()
        .map(|path| image::open(path).unwrap().into_luma8().into_raw())
        .collect();
    assert_eq!(images.len(), 4);
    for rotated in &images[1..] {
        assert_ne!(&images[0], rotated);
    }
}

#[test]
fn rerunning_a_sweep_is_deterministic() {
    let first = tempdir().unwrap();
    let second = tempdir().unwrap();
    let volume = phantom();
    let detector = ProjectionGeometry {
        pixel_type: dicom_drr::enums::PixelType::F32,
        ..detector()
    };

    let mut plan = SweepPlan::new(grid(), first.path());
    plan.format = OutputFormat::MetaImage;
    plan.translation = Vector3::new(1.0, -2.0, 0.5);
    plan.convention = MotionConvention::Source;
    run_sweep(&Projector::cpu(), &volume, &plan, &detector, &SweepControl::default()).unwrap();

    plan.output_dir = second.path().to_path_buf();
    let sequential = SweepControl {
        parallel: false,
        ..SweepControl::default()
    };
    let report = run_sweep(&Projector::cpu(), &volume, &plan, &detector, &sequential).unwrap();

    for item in &report.items {
        assert!(matches!(item.outcome, SweepOutcome::Written));
        let name = item.path.file_name().unwrap();
        let a = metaimage::read(&first.path().join(name)).unwrap();
        let b = metaimage::read(&item.path).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn second_run_without_overwrite_keeps_first_results() {
    let dir = tempdir().unwrap();
    let plan = SweepPlan::new(grid(), dir.path());
    let volume = phantom();

    run_sweep(&Projector::cpu(), &volume, &plan, &detector(), &SweepControl::default()).unwrap();
    let before = fs::read(dir.path().join("rx_5ry_0rz_0.png")).unwrap();

    let shifted = ProjectionGeometry {
        threshold: 50.0,
        ..detector()
    };
    let report =
        run_sweep(&Projector::cpu(), &volume, &plan, &shifted, &SweepControl::default()).unwrap();

    assert_eq!(report.failures().count(), 4);
    assert_eq!(fs::read(dir.path().join("rx_5ry_0rz_0.png")).unwrap(), before);
}
