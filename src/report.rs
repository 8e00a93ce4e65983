//! QA artifacts: detections as GeoJSON, a JSON run summary with a confidence
//! histogram, and PNG overlays of sampled tiles.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ReportError;
use crate::evaluation::{EvaluationResult, GeoPoint};
use crate::normalize::normalize_bands;
use crate::raster::PixelWindow;
use crate::run::{DetectionRun, RunStatus, RunSummary};
use crate::source::RasterSource;
use crate::tiling::{sample_windows, tile_windows};
use crate::tree_detection::DetectedTree;

pub const HISTOGRAM_BINS: usize = 10;

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Equal-width histogram of confidences over [0, 1]; 1.0 falls in the last bin.
pub fn confidence_histogram(trees: &[DetectedTree], bins: usize) -> Vec<HistogramBin> {
    let bins = bins.max(1);
    let width = 1.0 / bins as f64;
    let mut counts = vec![0usize; bins];
    for t in trees {
        let c = t.confidence.clamp(0.0, 1.0);
        let i = ((c / width) as usize).min(bins - 1);
        counts[i] += 1;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistogramBin {
            lower: i as f64 * width,
            upper: (i + 1) as f64 * width,
            count,
        })
        .collect()
}

/// JSON summary of one run, optionally with an evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub source: String,
    pub tree_count: usize,
    pub summary: Option<RunSummary>,
    pub error_message: Option<String>,
    pub confidence_histogram: Vec<HistogramBin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationResult>,
}

impl RunReport {
    pub fn new(run: &DetectionRun, evaluation: Option<EvaluationResult>) -> Self {
        Self {
            run_id: run.id().to_string(),
            status: run.status(),
            source: run.source().to_string(),
            tree_count: run.trees().len(),
            summary: run.summary().cloned(),
            error_message: run.error_message().map(str::to_string),
            confidence_histogram: confidence_histogram(run.trees(), HISTOGRAM_BINS),
            evaluation,
        }
    }
}

/// Detections as a GeoJSON FeatureCollection of points.
pub fn detections_geojson(trees: &[DetectedTree]) -> Value {
    let features: Vec<Value> = trees
        .iter()
        .map(|t| {
            json!({
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [t.lon, t.lat] },
                "properties": {
                    "id": t.id,
                    "confidence": t.confidence,
                    "vegetation_index": t.vegetation_index,
                    "canopy_diameter_m": t.canopy_diameter_m,
                    "pixel_row": t.pixel_row,
                    "pixel_col": t.pixel_col,
                },
            })
        })
        .collect();
    json!({ "type": "FeatureCollection", "features": features })
}

/// Pretty-printed JSON file.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ReportError> {
    let file = File::create(path).map_err(|e| ReportError::io(path, e))?;
    let mut w = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut w, value)?;
    w.flush().map_err(|e| ReportError::io(path, e))?;
    Ok(())
}

/// Label positions from a CSV with `lon` and `lat` columns (others ignored).
pub fn read_labels_csv(path: &Path) -> Result<Vec<GeoPoint>, ReportError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut points = Vec::new();
    for row in rdr.deserialize() {
        points.push(row?);
    }
    Ok(points)
}

// ---------------------------------------------------------------------------
// Overlays
// ---------------------------------------------------------------------------

/// Red (low) to green (high) confidence colour.
fn confidence_colour(confidence: f64) -> Rgb<u8> {
    let c = confidence.clamp(0.0, 1.0);
    Rgb([(255.0 * (1.0 - c)) as u8, (255.0 * c) as u8, 0])
}

fn to_u8(v: f64) -> u8 {
    if v.is_nan() {
        0
    } else {
        (v.clamp(0.0, 1.0) * 255.0).round() as u8
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64, px: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, px);
    }
}

/// Circle outline of `radius` pixels plus a small centre cross.
fn draw_tree(img: &mut RgbImage, cx: i64, cy: i64, radius: f64, px: Rgb<u8>) {
    let r = radius.max(1.0);
    let reach = r.ceil() as i64 + 1;
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            let d = ((dx * dx + dy * dy) as f64).sqrt();
            if (d - r).abs() < 0.5 {
                put(img, cx + dx, cy + dy, px);
            }
        }
    }
    for d in -1..=1 {
        put(img, cx + d, cy, px);
        put(img, cx, cy + d, px);
    }
}

/// Render one window of `source` with the trees inside it.
pub fn render_window(
    source: &dyn RasterSource,
    window: PixelWindow,
    trees: &[DetectedTree],
) -> Result<RgbImage, ReportError> {
    let image = source.image();
    let data = source.read_window(window)?;
    let norm = normalize_bands(&data.bands);
    let layout = image.layout;

    let mut img = RgbImage::new(window.width as u32, window.height as u32);
    for r in 0..window.height {
        for c in 0..window.width {
            img.put_pixel(
                c as u32,
                r as u32,
                Rgb([
                    to_u8(norm[layout.red].get(r, c)),
                    to_u8(norm[layout.green].get(r, c)),
                    to_u8(norm[layout.blue].get(r, c)),
                ]),
            );
        }
    }

    for t in trees.iter().filter(|t| window.contains(t.pixel_row, t.pixel_col)) {
        let radius_px = t.canopy_diameter_m / 2.0 / image.gsd_m;
        draw_tree(
            &mut img,
            (t.pixel_col - window.col_off) as i64,
            (t.pixel_row - window.row_off) as i64,
            radius_px,
            confidence_colour(t.confidence),
        );
    }
    Ok(img)
}

/// Write up to `count` PNG overlays of randomly chosen `tile_px` tiles that
/// contain at least one detection. Returns the written paths.
pub fn render_overlays<R: Rng + ?Sized>(
    source: &dyn RasterSource,
    trees: &[DetectedTree],
    tile_px: usize,
    count: usize,
    rng: &mut R,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, ReportError> {
    let image = source.image();
    let tiles: Vec<PixelWindow> = tile_windows(image.full_window(), tile_px.max(1), 0)
        .into_iter()
        .filter(|w| trees.iter().any(|t| w.contains(t.pixel_row, t.pixel_col)))
        .collect();
    if tiles.is_empty() || count == 0 {
        return Ok(Vec::new());
    }
    fs::create_dir_all(out_dir).map_err(|e| ReportError::io(out_dir, e))?;

    let mut written = Vec::new();
    for (k, window) in sample_windows(&tiles, count, rng).into_iter().enumerate() {
        let img = render_window(source, window, trees)?;
        let path = out_dir.join(format!(
            "overlay_{:02}_r{}_c{}.png",
            k, window.row_off, window.col_off
        ));
        img.save(&path)?;
        written.push(path);
    }
    info!("wrote {} overlay(s) to {}", written.len(), out_dir.display());
    Ok(written)
}
