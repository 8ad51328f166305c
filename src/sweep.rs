//! Batch projection over a grid of rotations.
//!
//! Every grid point is an independent DRR: its own [`Pose`], its own
//! transform, its own output file. Output names are derived from the rotation
//! triple alone, so two grid points can never race on the same path.

use crate::enums::{MotionConvention, ProjectionMode};
use crate::geometry::GeometryError;
use crate::projector::{ProjectionError, ProjectionGeometry, Projector};
use crate::resample::Resampler;
use crate::transform::{Pose, build_transform};
use crate::volume::Volume;
use crate::writer::{ConfirmOverwrite, OutputFormat, Refuse, WriteError, write_projection};

use itertools::{Itertools, iproduct};
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use web_time::Instant;

/// Failures that stop a sweep before any projection runs.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Rotation range for {axis} has a zero step")]
    ZeroStep { axis: char },

    #[error("Rotation range for {axis} is not finite")]
    NonFiniteRange { axis: char },

    #[error("Rotation grid is empty")]
    EmptyGrid,

    #[error("Rotation grid has more than {limit} points")]
    TooManyRotations { limit: usize },

    #[error("Rotations {first:?} and {second:?} would both be written to \"{name}\"")]
    DuplicateOutput {
        name: String,
        first: [f64; 3],
        second: [f64; 3],
    },

    #[error("Invalid sweep parameters: {0}")]
    Geometry(#[from] GeometryError),

    #[error("Could not create output directory \"{path}\": {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Failure of a single grid point. The rest of the sweep keeps going.
#[derive(Debug, Error)]
pub enum SweepItemError {
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Upper bound on the number of rotations in one sweep.
pub const MAX_GRID_POINTS: usize = 1_000_000;

/// Half-open range `[start, stop)` in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisRange {
    pub start: f64,
    pub stop: f64,
    #[serde(default = "default_step")]
    pub step: f64,
}

fn default_step() -> f64 {
    1.0
}

impl AxisRange {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// A range holding only `value`.
    pub fn single(value: f64) -> Self {
        Self::new(value, value + 1.0, 1.0)
    }

    /// Angles in the range; `axis` only labels errors.
    pub fn values(&self, axis: char) -> Result<Vec<f64>, SweepError> {
        let Self { start, stop, step } = *self;
        if ![start, stop, step].iter().all(|v| v.is_finite()) {
            return Err(SweepError::NonFiniteRange { axis });
        }
        if step == 0.0 {
            return Err(SweepError::ZeroStep { axis });
        }
        let count = ((stop - start) / step).ceil().max(0.0);
        if count > MAX_GRID_POINTS as f64 {
            return Err(SweepError::TooManyRotations {
                limit: MAX_GRID_POINTS,
            });
        }
        let count = count as usize;
        // multiply instead of accumulating so values do not drift
        Ok((0..count)
            .map(|i| start + i as f64 * step)
            .filter(|&v| if step > 0.0 { v < stop } else { v > stop })
            .collect())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RotationGrid {
    /// Cartesian product of three ranges, x outermost.
    Ranges {
        x: AxisRange,
        y: AxisRange,
        z: AxisRange,
    },
    /// Explicit `(rx, ry, rz)` triples, used in the given order.
    List(Vec<[f64; 3]>),
}

impl RotationGrid {
    pub fn triples(&self) -> Result<Vec<[f64; 3]>, SweepError> {
        match self {
            RotationGrid::Ranges { x, y, z } => {
                let (xs, ys, zs) = (x.values('x')?, y.values('y')?, z.values('z')?);
                let points = [ys.len(), zs.len()]
                    .into_iter()
                    .try_fold(xs.len(), |acc, n| acc.checked_mul(n));
                if points.is_none_or(|n| n > MAX_GRID_POINTS) {
                    return Err(SweepError::TooManyRotations {
                        limit: MAX_GRID_POINTS,
                    });
                }
                Ok(iproduct!(xs, ys, zs).map(|(x, y, z)| [x, y, z]).collect())
            }
            RotationGrid::List(list) => {
                if list.iter().flatten().any(|v| !v.is_finite()) {
                    return Err(GeometryError::NonFinite("Rotation").into());
                }
                Ok(list.clone())
            }
        }
    }
}

fn format_angle(angle: f64) -> String {
    if angle.fract() == 0.0 && angle.abs() < 1e15 {
        format!("{}", angle as i64)
    } else {
        angle.to_string().replace('.', "p")
    }
}

/// `rx_<x>ry_<y>rz_<z>.<ext>`
///
/// Integral angles print as integers; fractional ones keep their digits with
/// `.` written as `p`, so `2.5` becomes `2p5`.
pub fn output_file_name(rotation: &[f64; 3], format: OutputFormat) -> String {
    let [x, y, z] = (*rotation).map(format_angle);
    format!("rx_{x}ry_{y}rz_{z}.{}", format.extension())
}

#[derive(Clone, Debug, PartialEq)]
pub struct SweepPlan {
    pub grid: RotationGrid,
    pub translation: Vector3<f64>,
    pub center_offset: Vector3<f64>,
    pub convention: MotionConvention,
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub overwrite: bool,
}

impl SweepPlan {
    pub fn new(grid: RotationGrid, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            grid,
            translation: Vector3::zeros(),
            center_offset: Vector3::zeros(),
            convention: MotionConvention::default(),
            output_dir: output_dir.into(),
            format: OutputFormat::default(),
            overwrite: false,
        }
    }
}

/// How a sweep is executed, as opposed to what it computes.
pub struct SweepControl<'a> {
    /// Run grid points on the rayon pool.
    pub parallel: bool,
    pub confirm: &'a dyn ConfirmOverwrite,
    /// Checked before each grid point starts.
    pub cancel: Option<&'a AtomicBool>,
}

impl Default for SweepControl<'_> {
    fn default() -> Self {
        Self {
            parallel: true,
            confirm: &Refuse,
            cancel: None,
        }
    }
}

#[derive(Debug)]
pub enum SweepOutcome {
    Written,
    Failed(SweepItemError),
    Cancelled,
}

#[derive(Debug)]
pub struct SweepItem {
    pub rotation: [f64; 3],
    pub path: PathBuf,
    pub outcome: SweepOutcome,
}

/// Per grid point results, in grid order.
#[derive(Debug)]
pub struct SweepReport {
    pub items: Vec<SweepItem>,
    pub elapsed: Duration,
}

impl SweepReport {
    pub fn written(&self) -> impl Iterator<Item = &Path> {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, SweepOutcome::Written))
            .map(|item| item.path.as_path())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&SweepItem, &SweepItemError)> {
        self.items.iter().filter_map(|item| match &item.outcome {
            SweepOutcome::Failed(err) => Some((item, err)),
            _ => None,
        })
    }

    pub fn cancelled(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, SweepOutcome::Cancelled))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.items
            .iter()
            .all(|item| matches!(item.outcome, SweepOutcome::Written))
    }
}

fn project_one<R: Resampler>(
    projector: &Projector<R>,
    volume: &Volume,
    plan: &SweepPlan,
    geometry: &ProjectionGeometry,
    rotation: &[f64; 3],
    path: &Path,
    confirm: &dyn ConfirmOverwrite,
) -> Result<(), SweepItemError> {
    let pose = Pose::new(Vector3::from(*rotation), plan.translation)
        .with_center_offset(plan.center_offset);
    let transform =
        build_transform(volume.geometry(), &pose, plan.convention).map_err(ProjectionError::from)?;
    let projection = projector.project(volume, &transform, geometry, ProjectionMode::Drr)?;
    write_projection(&projection, path, plan.overwrite, confirm)?;
    Ok(())
}

/// Project `volume` once per rotation in `plan.grid` and write each DRR to
/// `plan.output_dir`.
///
/// Grid, parameter and output directory problems are returned as
/// [`SweepError`]. Anything that goes wrong for a single rotation is logged
/// and recorded in that rotation's [`SweepItem`].
pub fn run_sweep<R: Resampler + Sync>(
    projector: &Projector<R>,
    volume: &Volume,
    plan: &SweepPlan,
    geometry: &ProjectionGeometry,
    control: &SweepControl,
) -> Result<SweepReport, SweepError> {
    let start = Instant::now();

    geometry.validate()?;
    crate::geometry::check_finite("Translation", &plan.translation)?;
    crate::geometry::check_finite("Center offset", &plan.center_offset)?;

    let rotations = plan.grid.triples()?;
    if rotations.is_empty() {
        return Err(SweepError::EmptyGrid);
    }

    let names: Vec<String> = rotations
        .iter()
        .map(|rotation| output_file_name(rotation, plan.format))
        .collect();
    if let Some(name) = names.iter().duplicates().next() {
        let mut owners = rotations.iter().zip(&names).filter(|(_, n)| *n == name);
        if let (Some((first, _)), Some((second, _))) = (owners.next(), owners.next()) {
            return Err(SweepError::DuplicateOutput {
                name: name.clone(),
                first: *first,
                second: *second,
            });
        }
    }

    std::fs::create_dir_all(&plan.output_dir).map_err(|source| SweepError::OutputDir {
        path: plan.output_dir.clone(),
        source,
    })?;

    let total = rotations.len();
    tracing::info!(
        "Sweeping {total} rotations into {}",
        plan.output_dir.display()
    );

    let run = |(index, (rotation, name)): (usize, (&[f64; 3], &String))| {
        let path = plan.output_dir.join(name);
        let cancelled = control
            .cancel
            .is_some_and(|flag| flag.load(Ordering::Relaxed));
        let outcome = if cancelled {
            SweepOutcome::Cancelled
        } else {
            tracing::info!(
                "[{}/{total}] rx={} ry={} rz={}",
                index + 1,
                rotation[0],
                rotation[1],
                rotation[2]
            );
            match project_one(projector, volume, plan, geometry, rotation, &path, control.confirm)
            {
                Ok(()) => SweepOutcome::Written,
                Err(err) => {
                    tracing::error!("Failed to produce {}: {err}", path.display());
                    SweepOutcome::Failed(err)
                }
            }
        };
        SweepItem {
            rotation: *rotation,
            path,
            outcome,
        }
    };

    let items: Vec<SweepItem> = if control.parallel {
        rotations
            .par_iter()
            .zip(names.par_iter())
            .enumerate()
            .map(run)
            .collect()
    } else {
        rotations.iter().zip(names.iter()).enumerate().map(run).collect()
    };

    let report = SweepReport {
        items,
        elapsed: start.elapsed(),
    };
    tracing::info!(
        "Sweep finished in {:.2?}: {} written, {} failed, {} cancelled",
        report.elapsed,
        report.written().count(),
        report.failures().count(),
        report.cancelled()
    );
    Ok(report)
}
