//! Tree detection on orchard GeoTIFF imagery.
//!
//! Usage:
//!   cargo run --release -- detect field.tif --boundary field.geojson
//!   cargo run --release -- detect field.tif --params params.json --spacing 5 --labels labels.csv
//!   cargo run --release -- evaluate runs/field/trees.csv labels.csv --match-radius 2
//!
//! `detect` writes, under `<out-dir>/<run-id>/`:
//!   run.json, trees.csv, detections.geojson, summary.json, overlays/*.png

use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use orchardtree::evaluation::{evaluate, EvaluationResult, GeoPoint};
use orchardtree::report::{detections_geojson, read_labels_csv, render_overlays, write_json, RunReport};
use orchardtree::store::{read_trees_csv, CsvRunStore};
use orchardtree::{
    BandLayout, DetectionParameters, Detector, FieldBoundary, GeoTiffSource, OpenOptions, RasterSource,
    RunStatus,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

// ==========================================================================
// CLI (clap)
// ==========================================================================

#[derive(Parser, Debug)]
#[command(name = "orchardtree", version, about = "Detect orchard trees in georeferenced aerial imagery")]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run detection on a GeoTIFF.
    Detect(DetectArgs),

    /// Compare a detections CSV with labelled positions.
    Evaluate(EvaluateArgs),
}

#[derive(Args, Debug)]
struct DetectArgs {
    /// Input GeoTIFF (RGB, RGBA or RGB+NIR)
    #[arg(value_name = "IMAGE.tif")]
    image: PathBuf,

    /// Field boundary (GeoJSON polygon in lon/lat)
    #[arg(long, value_name = "FIELD.geojson")]
    boundary: Option<PathBuf>,

    /// Detection parameters (JSON); flags below override single fields
    #[arg(long, value_name = "PARAMS.json")]
    params: Option<PathBuf>,

    /// Minimum canopy diameter (m)
    #[arg(long)]
    min_canopy: Option<f64>,

    /// Maximum canopy diameter (m)
    #[arg(long)]
    max_canopy: Option<f64>,

    /// Minimum tree spacing (m)
    #[arg(long)]
    spacing: Option<f64>,

    /// Vegetation index threshold percentile
    #[arg(long)]
    percentile: Option<f64>,

    /// Tile size (px)
    #[arg(long)]
    tile_size: Option<usize>,

    /// Tile overlap (px)
    #[arg(long)]
    tile_overlap: Option<usize>,

    /// Gaussian smoothing sigma (px)
    #[arg(long)]
    sigma: Option<f64>,

    /// Ground sample distance (m/px), replacing the value derived from the transform
    #[arg(long)]
    gsd: Option<f64>,

    /// Zero-based index of the near-infrared band
    #[arg(long, conflicts_with = "no_nir")]
    nir_band: Option<usize>,

    /// Ignore any near-infrared band (use excess green)
    #[arg(long)]
    no_nir: bool,

    /// Output directory for runs
    #[arg(long, short, default_value = "runs")]
    out_dir: PathBuf,

    /// Run identifier (default: image name + timestamp)
    #[arg(long)]
    run_id: Option<String>,

    /// Number of PNG overlays
    #[arg(long, default_value_t = 4)]
    overlays: usize,

    /// Overlay tile size (px)
    #[arg(long, default_value_t = 512)]
    overlay_size: usize,

    /// Seed for overlay tile sampling
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Labelled tree positions (CSV with lon,lat) to evaluate against
    #[arg(long, value_name = "LABELS.csv")]
    labels: Option<PathBuf>,

    /// Match radius for evaluation (m)
    #[arg(long, default_value_t = 2.0)]
    match_radius: f64,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    /// Detections CSV (trees.csv of a run)
    #[arg(value_name = "TREES.csv")]
    detections: PathBuf,

    /// Labelled positions (CSV with lon,lat)
    #[arg(value_name = "LABELS.csv")]
    labels: PathBuf,

    /// Match radius (m)
    #[arg(long, default_value_t = 2.0)]
    match_radius: f64,

    /// Output JSON file (stdout if absent)
    #[arg(long, short)]
    output: Option<PathBuf>,
}

// ==========================================================================
// Configuration
// ==========================================================================

fn parameters(args: &DetectArgs) -> CliResult<DetectionParameters> {
    let mut params = match &args.params {
        Some(path) => DetectionParameters::from_json_file(path)?,
        None => DetectionParameters::default(),
    };
    if let Some(v) = args.min_canopy {
        params.min_canopy_diameter_m = v;
    }
    if let Some(v) = args.max_canopy {
        params.max_canopy_diameter_m = v;
    }
    if let Some(v) = args.spacing {
        params.min_tree_spacing_m = v;
    }
    if let Some(v) = args.percentile {
        params.vegetation_threshold_percentile = v;
    }
    if let Some(v) = args.tile_size {
        params.tile_size_px = v;
    }
    if let Some(v) = args.tile_overlap {
        params.tile_overlap_px = v;
    }
    if let Some(v) = args.sigma {
        params.smoothing_sigma_px = v;
    }
    Ok(params.validated()?)
}

/// Band layout override, resolved against the file's band count.
fn layout_override(args: &DetectArgs) -> CliResult<Option<BandLayout>> {
    if args.nir_band.is_none() && !args.no_nir {
        return Ok(None);
    }
    let source = GeoTiffSource::open(&args.image, &OpenOptions::default())?;
    let mut layout = source.image().layout;
    layout.nir = if args.no_nir { None } else { args.nir_band };
    Ok(Some(layout))
}

fn load_boundary(path: &Path) -> Option<FieldBoundary> {
    match FieldBoundary::from_geojson_file(path) {
        Ok(b) => Some(b),
        Err(e) => {
            warn!("ignoring boundary '{}': {e}", path.display());
            None
        }
    }
}

fn evaluate_against(labels_path: &Path, predictions: &[GeoPoint], radius: f64) -> CliResult<EvaluationResult> {
    let labels = read_labels_csv(labels_path)?;
    Ok(evaluate(&labels, predictions, radius))
}

// ==========================================================================
// Commands
// ==========================================================================

fn detect(args: &DetectArgs) -> CliResult<()> {
    let params = parameters(args)?;
    let options = OpenOptions {
        layout: layout_override(args)?,
        gsd_m: args.gsd,
    };
    let boundary = args.boundary.as_deref().and_then(load_boundary);

    let run_id = args.run_id.clone().unwrap_or_else(|| {
        let stem = args
            .image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".into());
        format!("{stem}-{}", Utc::now().format("%Y%m%dT%H%M%S"))
    });

    let mut store = CsvRunStore::new(&args.out_dir);
    let detector = Detector::new(params)?;
    let run = detector.run_file(&run_id, &args.image, &options, boundary.as_ref(), &mut store);
    let run_dir = store.run_dir(&run_id);

    if run.status() != RunStatus::Completed {
        write_json(&run_dir.join("summary.json"), &RunReport::new(&run, None))?;
        return Err(format!(
            "run {run_id} failed: {}",
            run.error_message().unwrap_or("unknown error")
        )
        .into());
    }

    write_json(&run_dir.join("detections.geojson"), &detections_geojson(run.trees()))?;

    let evaluation = match &args.labels {
        Some(path) => {
            let predictions: Vec<GeoPoint> =
                run.trees().iter().map(|t| GeoPoint::new(t.lon, t.lat)).collect();
            Some(evaluate_against(path, &predictions, args.match_radius)?)
        }
        None => None,
    };
    write_json(&run_dir.join("summary.json"), &RunReport::new(&run, evaluation.clone()))?;

    if args.overlays > 0 && !run.trees().is_empty() {
        let source = GeoTiffSource::open(&args.image, &options)?;
        let mut rng = StdRng::seed_from_u64(args.seed);
        render_overlays(
            &source,
            run.trees(),
            args.overlay_size,
            args.overlays,
            &mut rng,
            &run_dir.join("overlays"),
        )?;
    }

    if let Some(s) = run.summary() {
        println!("run {run_id}: {} tree(s)", s.tree_count);
        println!(
            "  area {:.2} ha, {:.1} trees/ha, mean canopy {:.2} m, coverage {:.1}%",
            s.area_ha, s.trees_per_hectare, s.avg_canopy_diameter_m, s.canopy_coverage_pct
        );
        println!("  {} window(s) in {:.2}s", s.windows_processed, s.processing_seconds);
    }
    if let Some(e) = &evaluation {
        println!(
            "  precision {:.3}, recall {:.3}, F1 {:.3} (radius {} m)",
            e.precision, e.recall, e.f1, e.match_radius_m
        );
    }
    info!("results in {}", run_dir.display());
    Ok(())
}

fn evaluate_cmd(args: &EvaluateArgs) -> CliResult<()> {
    let trees = read_trees_csv(&args.detections)?;
    let predictions: Vec<GeoPoint> = trees.iter().map(|t| GeoPoint::new(t.lon, t.lat)).collect();
    let result = evaluate_against(&args.labels, &predictions, args.match_radius)?;
    match &args.output {
        Some(path) => {
            write_json(path, &result)?;
            info!("evaluation written to {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&result)?),
    }
    Ok(())
}

// ==========================================================================
// Main
// ==========================================================================

fn main() {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let result = match &cli.command {
        Commands::Detect(args) => detect(args),
        Commands::Evaluate(args) => evaluate_cmd(args),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
