//! dicom-drr CLI: digitally reconstructed radiographs from CT volumes.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nalgebra::{Point3, Vector3};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use web_time::Instant;

use dicom_drr::{
    config::SweepConfig,
    enums::{MotionConvention, PixelType, ProjectionMode, SortBy},
    projector::{ProjectionGeometry, Projector},
    sweep::{AxisRange, RotationGrid, SweepControl, SweepPlan, run_sweep},
    transform::{Pose, build_transform},
    volume::Volume,
    volume_loader::read_any,
    writer::{ConfirmOverwrite, OutputFormat, Refuse, StdinPrompt, write_projection, write_volume},
};

#[derive(Parser)]
#[command(name = "dicom-drr")]
#[command(about = "Generate digitally reconstructed radiographs from DICOM or MetaImage volumes")]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Number of worker threads (default: one per core).
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[allow(clippy::large_enum_variant)]
enum Commands {
    /// Project a volume onto the detector once.
    Drr(DrrArgs),

    /// Project a volume once per rotation of a grid.
    Sweep(SweepArgs),

    /// Rigidly move a volume and write it as MetaImage.
    Transform(TransformArgs),

    /// Print the geometry of a volume.
    Info(InputArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortByArg {
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}

impl From<SortByArg> for SortBy {
    fn from(arg: SortByArg) -> Self {
        match arg {
            SortByArg::ImagePositionPatient => SortBy::ImagePositionPatient,
            SortByArg::TablePosition => SortBy::TablePosition,
            SortByArg::InstanceNumber => SortBy::InstanceNumber,
            SortByArg::None => SortBy::None,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PixelTypeArg {
    U8,
    F32,
}

impl From<PixelTypeArg> for PixelType {
    fn from(arg: PixelTypeArg) -> Self {
        match arg {
            PixelTypeArg::U8 => PixelType::U8,
            PixelTypeArg::F32 => PixelType::F32,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Png,
    Tiff,
    Mhd,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Png => OutputFormat::Png,
            FormatArg::Tiff => OutputFormat::Tiff,
            FormatArg::Mhd => OutputFormat::MetaImage,
        }
    }
}

fn parse_triple(text: &str) -> Result<[f64; 3], String> {
    let values = text
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("{v:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    <[f64; 3]>::try_from(values).map_err(|v| format!("expected x,y,z, got {} values", v.len()))
}

fn parse_size(text: &str) -> Result<[usize; 3], String> {
    let values = text
        .split(',')
        .map(|v| v.trim().parse::<usize>().map_err(|e| format!("{v:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    <[usize; 3]>::try_from(values).map_err(|v| format!("expected x,y,z, got {} values", v.len()))
}

/// `start:stop[:step]`, or a single angle.
fn parse_range(text: &str) -> Result<AxisRange, String> {
    let values = text
        .split(':')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("{v:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match values[..] {
        [angle] => Ok(AxisRange::single(angle)),
        [start, stop] => Ok(AxisRange::new(start, stop, 1.0)),
        [start, stop, step] => Ok(AxisRange::new(start, stop, step)),
        _ => Err("expected start:stop[:step]".to_string()),
    }
}

#[derive(Debug, Clone, Args)]
struct InputArgs {
    /// DICOM series directory, DICOM file or .mhd volume.
    #[arg(short, long)]
    input: PathBuf,

    /// Slice order for DICOM series.
    #[arg(long, value_enum, default_value_t = SortByArg::ImagePositionPatient)]
    sort_by: SortByArg,
}

fn load_volume(input: &Path, sort_by: SortBy) -> Result<Volume> {
    tracing::info!("Loading volume: {}", input.display());
    let volume = read_any(input, sort_by)
        .with_context(|| format!("Failed to read \"{}\"", input.display()))?;
    let [x, y, z] = volume.size();
    tracing::info!("Volume size: {x}x{y}x{z}");
    Ok(volume)
}

impl InputArgs {
    fn load(&self) -> Result<Volume> {
        load_volume(&self.input, self.sort_by.into())
    }
}

#[derive(Debug, Clone, Args)]
struct PoseArgs {
    /// Translation x,y,z in mm.
    #[arg(long, value_parser = parse_triple, default_value = "0,0,0", allow_hyphen_values = true)]
    translation: [f64; 3],

    /// Rotation center offset x,y,z in mm (accepted but not applied).
    #[arg(long, value_parser = parse_triple, default_value = "0,0,0", allow_hyphen_values = true)]
    center_offset: [f64; 3],

    /// Treat the pose as motion of the X-ray source instead of the object.
    #[arg(long)]
    source_motion: bool,
}

impl PoseArgs {
    fn convention(&self) -> MotionConvention {
        MotionConvention::from_mirror_flag(self.source_motion)
    }
}

#[derive(Debug, Clone, Args)]
struct DetectorArgs {
    /// Detector size in pixels x,y,z.
    #[arg(long, value_parser = parse_size, default_value = "1024,1400,1")]
    size: [usize; 3],

    /// Detector pixel spacing x,y,z in mm.
    #[arg(long, value_parser = parse_triple, default_value = "0.167,0.167,1")]
    spacing: [f64; 3],

    /// Detector origin x,y,z in mm (default: half the detector width, z = -200).
    #[arg(long, value_parser = parse_triple, allow_hyphen_values = true)]
    origin: Option<[f64; 3]>,

    /// X-ray source position x,y,z in mm.
    #[arg(
        long,
        value_parser = parse_triple,
        default_value = "0,0,1000",
        allow_hyphen_values = true
    )]
    focal_point: [f64; 3],

    /// Voxels at or below this value are transparent.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    threshold: f64,

    /// Mirror the output along x.
    #[arg(long)]
    flip_x: bool,

    /// Mirror the output along y.
    #[arg(long)]
    flip_y: bool,

    #[arg(long, value_enum, default_value_t = PixelTypeArg::U8)]
    pixel_type: PixelTypeArg,
}

impl DetectorArgs {
    fn geometry(&self) -> ProjectionGeometry {
        let mut geometry =
            ProjectionGeometry::with_detector(self.size, Vector3::from(self.spacing));
        if let Some(origin) = self.origin {
            geometry.grid.origin = Point3::from(origin);
        }
        geometry.focal_point = Point3::from(self.focal_point);
        geometry.threshold = self.threshold;
        geometry.flip_axes = [self.flip_x, self.flip_y, false];
        geometry.pixel_type = self.pixel_type.into();
        geometry
    }
}

#[derive(Debug, Clone, Args)]
struct DrrArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Output image (.png, .tif or .mhd).
    #[arg(short, long)]
    output: PathBuf,

    /// Rotation x,y,z in degrees.
    #[arg(long, value_parser = parse_triple, default_value = "0,0,0", allow_hyphen_values = true)]
    rotation: [f64; 3],

    #[command(flatten)]
    pose: PoseArgs,

    #[command(flatten)]
    detector: DetectorArgs,

    /// Overwrite existing files without asking.
    #[arg(short, long)]
    force: bool,
}

#[derive(Debug, Clone, Args)]
struct SweepArgs {
    /// TOML sweep description. Replaces the grid, pose and detector flags;
    /// --input and --output-dir override the file.
    #[arg(short, long, conflicts_with_all = ["rx", "ry", "rz", "list"])]
    config: Option<PathBuf>,

    /// DICOM series directory, DICOM file or .mhd volume.
    #[arg(short, long, required_unless_present = "config")]
    input: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = SortByArg::ImagePositionPatient)]
    sort_by: SortByArg,

    /// Directory receiving one image per rotation (created if missing).
    #[arg(short, long, required_unless_present = "config")]
    output_dir: Option<PathBuf>,

    /// Rotation about x: start:stop[:step] in degrees, stop excluded.
    #[arg(long, value_parser = parse_range, allow_hyphen_values = true)]
    rx: Option<AxisRange>,

    /// Rotation about y: start:stop[:step] in degrees, stop excluded.
    #[arg(long, value_parser = parse_range, allow_hyphen_values = true)]
    ry: Option<AxisRange>,

    /// Rotation about z: start:stop[:step] in degrees, stop excluded.
    #[arg(long, value_parser = parse_range, allow_hyphen_values = true)]
    rz: Option<AxisRange>,

    /// Explicit rotation x,y,z (repeatable). Replaces --rx/--ry/--rz.
    #[arg(
        long = "rotation",
        value_parser = parse_triple,
        allow_hyphen_values = true,
        conflicts_with_all = ["rx", "ry", "rz"]
    )]
    list: Vec<[f64; 3]>,

    #[arg(long, value_enum, default_value_t = FormatArg::Png)]
    format: FormatArg,

    #[command(flatten)]
    pose: PoseArgs,

    #[command(flatten)]
    detector: DetectorArgs,

    /// Project one rotation at a time.
    #[arg(long)]
    sequential: bool,

    /// Overwrite existing files without asking.
    #[arg(short, long)]
    force: bool,
}

impl SweepArgs {
    /// Volume path, sort order, plan and detector for this invocation.
    fn resolve(&self) -> Result<(PathBuf, SortBy, SweepPlan, ProjectionGeometry)> {
        if let Some(path) = &self.config {
            let config = SweepConfig::from_file(path)
                .with_context(|| format!("Failed to load \"{}\"", path.display()))?;
            let mut plan = config.plan()?;
            plan.overwrite |= self.force;
            if let Some(output_dir) = &self.output_dir {
                plan.output_dir = output_dir.clone();
            }
            return Ok((
                self.input.clone().unwrap_or_else(|| config.input.clone()),
                config.sort_by,
                plan,
                config.projection_geometry(),
            ));
        }

        let (Some(input), Some(output_dir)) = (&self.input, &self.output_dir) else {
            bail!("--input and --output-dir are required without --config");
        };
        let grid = if self.list.is_empty() {
            let zero = AxisRange::single(0.0);
            RotationGrid::Ranges {
                x: self.rx.unwrap_or(zero),
                y: self.ry.unwrap_or(zero),
                z: self.rz.unwrap_or(zero),
            }
        } else {
            RotationGrid::List(self.list.clone())
        };
        let plan = SweepPlan {
            grid,
            translation: Vector3::from(self.pose.translation),
            center_offset: Vector3::from(self.pose.center_offset),
            convention: self.pose.convention(),
            output_dir: output_dir.clone(),
            format: self.format.into(),
            overwrite: self.force,
        };
        Ok((
            input.clone(),
            self.sort_by.into(),
            plan,
            self.detector.geometry(),
        ))
    }
}

#[derive(Debug, Clone, Args)]
struct TransformArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Output volume (.mhd).
    #[arg(short, long)]
    output: PathBuf,

    /// Rotation x,y,z in degrees.
    #[arg(long, value_parser = parse_triple, default_value = "0,0,0", allow_hyphen_values = true)]
    rotation: [f64; 3],

    #[command(flatten)]
    pose: PoseArgs,

    /// Overwrite existing files without asking.
    #[arg(short, long)]
    force: bool,
}

fn confirmer() -> Box<dyn ConfirmOverwrite> {
    if std::io::stdin().is_terminal() {
        Box::new(StdinPrompt::default())
    } else {
        Box::new(Refuse)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    if let Some(jobs) = cli.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
            .context("Failed to configure the worker pool")?;
    }

    match cli.command {
        Commands::Drr(args) => run_drr(args),
        Commands::Sweep(args) => run_sweep_command(args),
        Commands::Transform(args) => run_transform(args),
        Commands::Info(args) => run_info(args),
    }
}

fn run_drr(args: DrrArgs) -> Result<()> {
    let volume = args.input.load()?;
    let pose = Pose::new(
        Vector3::from(args.rotation),
        Vector3::from(args.pose.translation),
    )
    .with_center_offset(Vector3::from(args.pose.center_offset));
    let transform = build_transform(volume.geometry(), &pose, args.pose.convention())?;

    let start = Instant::now();
    let projection = Projector::cpu().project(
        &volume,
        &transform,
        &args.detector.geometry(),
        ProjectionMode::Drr,
    )?;
    write_projection(&projection, &args.output, args.force, confirmer().as_ref())?;
    tracing::info!(
        "DRR written to {} in {:.2?}",
        args.output.display(),
        start.elapsed()
    );
    Ok(())
}

fn run_sweep_command(args: SweepArgs) -> Result<()> {
    let (input, sort_by, plan, geometry) = args.resolve()?;
    let volume = load_volume(&input, sort_by)?;

    let confirm = confirmer();
    let control = SweepControl {
        parallel: !args.sequential,
        confirm: confirm.as_ref(),
        cancel: None,
    };
    let report = run_sweep(&Projector::cpu(), &volume, &plan, &geometry, &control)?;

    for (item, err) in report.failures() {
        tracing::error!("{}: {err}", item.path.display());
    }
    let failed = report.failures().count();
    if failed > 0 {
        bail!("{failed} of {} projections failed", report.items.len());
    }
    Ok(())
}

fn run_transform(args: TransformArgs) -> Result<()> {
    let volume = args.input.load()?;
    let pose = Pose::new(
        Vector3::from(args.rotation),
        Vector3::from(args.pose.translation),
    )
    .with_center_offset(Vector3::from(args.pose.center_offset));

    let moved = Projector::cpu().transform_volume(&volume, &pose, args.pose.convention())?;
    write_volume(&moved, &args.output, args.force, confirmer().as_ref())?;
    Ok(())
}

fn run_info(args: InputArgs) -> Result<()> {
    let volume = args.load()?;
    let geometry = volume.geometry();
    let (min, max) = volume.min_max();
    println!("size:      {:?}", geometry.size);
    println!("spacing:   {:?}", geometry.spacing.as_slice());
    println!("origin:    {:?}", geometry.origin.coords.as_slice());
    println!("extent:    {:?}", geometry.extent().as_slice());
    println!("direction:");
    for row in geometry.direction.row_iter() {
        println!("  {:?}", row.iter().collect::<Vec<_>>());
    }
    println!("range:     [{min}, {max}]");
    Ok(())
}
