//! Detection runs: lifecycle state machine and the orchestrator that drives it.
//!
//! A run moves `pending → processing → completed | failed`. The [`Detector`]
//! is the only code that moves a run forward; once terminal a run never
//! changes again. Windows are processed in parallel with rayon; the merge and
//! the aggregate statistics are a single-threaded reduction afterwards.

use std::fmt;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::boundary::{clip_to_rect, polygon_area, FieldBoundary};
use crate::error::{DetectError, ParameterError};
use crate::params::DetectionParameters;
use crate::source::{GeoTiffSource, OpenOptions, RasterSource};
use crate::store::RunStore;
use crate::tiling::{processing_area, tile_layout};
use crate::tree_detection::{deduplicate, detect_window, georeference, DetectedTree};
use crate::vegetation::IndexKind;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Aggregates of a completed run, computed once from the full tree set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tree_count: usize,
    /// Processed area in hectares.
    pub area_ha: f64,
    pub trees_per_hectare: f64,
    /// 0 when no tree was found.
    pub avg_canopy_diameter_m: f64,
    /// Sum of crown disc areas over the processed area, in percent.
    pub canopy_coverage_pct: f64,
    pub processing_seconds: f64,
    pub windows_processed: usize,
    pub index: IndexKind,
}

impl RunSummary {
    pub fn compute(
        trees: &[DetectedTree],
        area_m2: f64,
        processing_seconds: f64,
        windows_processed: usize,
        index: IndexKind,
    ) -> Self {
        let tree_count = trees.len();
        let area_ha = area_m2 / 10_000.0;
        let trees_per_hectare = if area_ha > 0.0 {
            tree_count as f64 / area_ha
        } else {
            0.0
        };
        let avg_canopy_diameter_m = if tree_count > 0 {
            trees.iter().map(|t| t.canopy_diameter_m).sum::<f64>() / tree_count as f64
        } else {
            0.0
        };
        let crown_m2: f64 = trees
            .iter()
            .map(|t| std::f64::consts::PI * (t.canopy_diameter_m / 2.0).powi(2))
            .sum();
        let canopy_coverage_pct = if area_m2 > 0.0 {
            (crown_m2 / area_m2 * 100.0).min(100.0)
        } else {
            0.0
        };
        Self {
            tree_count,
            area_ha,
            trees_per_hectare,
            avg_canopy_diameter_m,
            canopy_coverage_pct,
            processing_seconds,
            windows_processed,
            index,
        }
    }
}

/// One execution of detection over one image, boundary and parameter set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRun {
    id: String,
    status: RunStatus,
    source: String,
    parameters: DetectionParameters,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    summary: Option<RunSummary>,
    error_message: Option<String>,
    #[serde(skip)]
    trees: Vec<DetectedTree>,
}

impl DetectionRun {
    /// A new `pending` run.
    pub fn new(id: impl Into<String>, source: impl Into<String>, parameters: DetectionParameters) -> Self {
        Self {
            id: id.into(),
            status: RunStatus::Pending,
            source: source.into(),
            parameters,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            summary: None,
            error_message: None,
            trees: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn parameters(&self) -> &DetectionParameters {
        &self.parameters
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Trees of a completed run; empty for any other state.
    pub fn trees(&self) -> &[DetectedTree] {
        &self.trees
    }

    fn transition(&mut self, to: RunStatus) -> Result<(), DetectError> {
        let allowed = matches!(
            (self.status, to),
            (RunStatus::Pending, RunStatus::Processing)
                | (RunStatus::Processing, RunStatus::Completed)
                | (RunStatus::Pending | RunStatus::Processing, RunStatus::Failed)
        );
        if !allowed {
            return Err(DetectError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<(), DetectError> {
        self.transition(RunStatus::Processing)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn complete(&mut self, trees: Vec<DetectedTree>, summary: RunSummary) -> Result<(), DetectError> {
        self.transition(RunStatus::Completed)?;
        self.finished_at = Some(Utc::now());
        self.trees = trees;
        self.summary = Some(summary);
        Ok(())
    }

    /// Mark the run failed. Also used to abandon a run from outside; any
    /// partial result is dropped.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), DetectError> {
        self.transition(RunStatus::Failed)?;
        self.finished_at = Some(Utc::now());
        self.trees.clear();
        self.summary = None;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Rebuild a run read back from storage.
    pub(crate) fn with_trees(mut self, trees: Vec<DetectedTree>) -> Self {
        self.trees = trees;
        self
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Runs detection with one validated parameter set.
#[derive(Debug, Clone)]
pub struct Detector {
    params: DetectionParameters,
}

struct RunOutput {
    trees: Vec<DetectedTree>,
    summary: RunSummary,
}

impl Detector {
    pub fn new(params: DetectionParameters) -> Result<Self, ParameterError> {
        Ok(Self {
            params: params.validated()?,
        })
    }

    pub fn params(&self) -> &DetectionParameters {
        &self.params
    }

    /// Open a GeoTIFF and run detection on it. Failure to open the file
    /// yields a `failed` run rather than an error.
    pub fn run_file(
        &self,
        run_id: &str,
        path: &Path,
        options: &OpenOptions,
        boundary: Option<&FieldBoundary>,
        store: &mut dyn RunStore,
    ) -> DetectionRun {
        let mut run = DetectionRun::new(run_id, path.display().to_string(), self.params.clone());
        match GeoTiffSource::open(path, options) {
            Ok(source) => self.drive(run, &source, boundary, store),
            Err(e) => {
                if let Err(t) = run.start() {
                    warn!("run {}: {t}", run.id);
                    return run;
                }
                self.abort(run, e, store)
            }
        }
    }

    /// Run detection on an opened source.
    pub fn run_source(
        &self,
        run_id: &str,
        source: &dyn RasterSource,
        boundary: Option<&FieldBoundary>,
        store: &mut dyn RunStore,
    ) -> DetectionRun {
        let run = DetectionRun::new(run_id, source.describe(), self.params.clone());
        self.drive(run, source, boundary, store)
    }

    fn drive(
        &self,
        mut run: DetectionRun,
        source: &dyn RasterSource,
        boundary: Option<&FieldBoundary>,
        store: &mut dyn RunStore,
    ) -> DetectionRun {
        if let Err(e) = run.start() {
            warn!("run {}: {e}", run.id);
            return run;
        }
        info!("run {}: processing {}", run.id, run.source);

        let output = match self.execute(source, boundary) {
            Ok(output) => output,
            Err(e) => return self.abort(run, e, store),
        };

        let mut completed = run.clone();
        if let Err(e) = completed.complete(output.trees, output.summary) {
            return self.abort(run, e, store);
        }
        match store.persist(&completed) {
            Ok(()) => {
                info!(
                    "run {}: completed, {} tree(s)",
                    completed.id,
                    completed.trees.len()
                );
                completed
            }
            Err(e) => self.abort(run, e, store),
        }
    }

    fn abort(&self, mut run: DetectionRun, error: DetectError, store: &mut dyn RunStore) -> DetectionRun {
        warn!("run {}: failed: {error}", run.id);
        if let Err(e) = run.fail(error.to_string()) {
            warn!("run {}: {e}", run.id);
            return run;
        }
        if let Err(e) = store.persist(&run) {
            warn!("run {}: could not record failure: {e}", run.id);
        }
        run
    }

    fn execute(
        &self,
        source: &dyn RasterSource,
        boundary: Option<&FieldBoundary>,
    ) -> Result<RunOutput, DetectError> {
        let started = Instant::now();
        let params = &self.params;
        let image = source.image();
        if image.width == 0 || image.height == 0 {
            return Err(DetectError::EmptyExtent {
                width: image.width,
                height: image.height,
            });
        }
        let geo = image.georeferencer()?;

        let polygon = boundary.map(|b| b.to_pixel_polygon(&geo));
        let (area, polygon) = processing_area(polygon, image.width, image.height);
        let tiles = tile_layout(area, params.tile_size_px, params.tile_overlap_px);
        if tiles.is_empty() {
            return Err(DetectError::EmptyExtent {
                width: area.width,
                height: area.height,
            });
        }

        let scale = image.pixel_scale;
        let max_canopy_px = params.max_canopy_diameter_m / scale.finest();
        if tiles.len() > 1 && (params.tile_overlap_px as f64) < max_canopy_px {
            warn!(
                "tile overlap {} px is smaller than the max canopy diameter ({:.1} px)",
                params.tile_overlap_px, max_canopy_px
            );
        }
        info!(
            "{} window(s) over {}, pixel {:.3} x {:.3} m",
            tiles.len(),
            area,
            scale.x_m,
            scale.y_m
        );

        let per_window = tiles
            .par_iter()
            .map(|tile| {
                let data = source.read_window(tile.window)?;
                let mut found = detect_window(
                    data,
                    &image.layout,
                    polygon.as_deref(),
                    params,
                    scale,
                );
                // Peaks in the overlap margin belong to the neighbouring tile.
                found.candidates.retain(|c| tile.core.contains(c.row, c.col));
                Ok(found)
            })
            .collect::<Result<Vec<_>, DetectError>>()?;

        let index = IndexKind::for_layout(&image.layout);
        let candidates = per_window.into_iter().flat_map(|w| w.candidates).collect();
        let kept = deduplicate(candidates, params.min_tree_spacing_m, scale);
        let trees = georeference(&kept, &geo)?;

        let area_px = match &polygon {
            Some(poly) => polygon_area(&clip_to_rect(
                poly,
                0.0,
                0.0,
                image.width as f64,
                image.height as f64,
            )),
            None => area.area() as f64,
        };
        let area_m2 = area_px * scale.pixel_area_m2();
        let summary = RunSummary::compute(
            &trees,
            area_m2,
            started.elapsed().as_secs_f64(),
            tiles.len(),
            index,
        );
        Ok(RunOutput { trees, summary })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{GeoPoint, LocalPlane};
    use crate::geo::{AffineTransform, EPSG_WGS84};
    use crate::raster::{PixelWindow, Raster, WindowData};
    use crate::source::{BandLayout, MemorySource, SourceImage};
    use crate::store::MemoryRunStore;

    fn tree(id: u32, d: f64) -> DetectedTree {
        DetectedTree {
            id,
            lat: 0.0,
            lon: 0.0,
            pixel_row: 0,
            pixel_col: 0,
            canopy_diameter_m: d,
            vegetation_index: 0.5,
            confidence: 0.5,
        }
    }

    fn flat_source(w: usize, h: usize) -> MemorySource {
        let image = SourceImage::new(
            w,
            h,
            3,
            BandLayout::for_band_count(3, false),
            AffineTransform::north_up(-120.0, 37.0, 5e-6, 5e-6),
            EPSG_WGS84,
            Some(0.5),
        )
        .unwrap();
        MemorySource::new(image, vec![Raster::new(h, w, 0.0); 3]).unwrap()
    }

    /// Source whose window reads always fail.
    struct BrokenSource(MemorySource);

    impl RasterSource for BrokenSource {
        fn image(&self) -> &SourceImage {
            self.0.image()
        }
        fn read_window(&self, window: PixelWindow) -> Result<WindowData, DetectError> {
            Err(DetectError::WindowRead {
                window: window.to_string(),
                reason: "device unplugged".into(),
            })
        }
        fn describe(&self) -> String {
            "broken".into()
        }
    }

    #[test]
    fn test_transitions() {
        let mut run = DetectionRun::new("r1", "mem", DetectionParameters::default());
        assert_eq!(run.status(), RunStatus::Pending);
        assert!(run.complete(Vec::new(), RunSummary::compute(&[], 1.0, 0.0, 0, IndexKind::Exg)).is_err());
        run.start().unwrap();
        assert!(run.start().is_err());
        run.fail("stopped").unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.error_message(), Some("stopped"));
        assert!(run.fail("again").is_err());
    }

    #[test]
    fn test_summary() {
        let trees = vec![tree(1, 4.0), tree(2, 6.0)];
        let s = RunSummary::compute(&trees, 20_000.0, 1.5, 4, IndexKind::Ndvi);
        assert_eq!(s.tree_count, 2);
        assert!((s.area_ha - 2.0).abs() < 1e-12);
        assert!((s.trees_per_hectare - 1.0).abs() < 1e-12);
        assert!((s.avg_canopy_diameter_m - 5.0).abs() < 1e-12);
        let crowns = std::f64::consts::PI * (4.0 + 9.0);
        assert!((s.canopy_coverage_pct - crowns / 20_000.0 * 100.0).abs() < 1e-9);

        let empty = RunSummary::compute(&[], 0.0, 0.0, 1, IndexKind::Exg);
        assert_eq!(empty.trees_per_hectare, 0.0);
        assert_eq!(empty.avg_canopy_diameter_m, 0.0);
    }

    #[test]
    fn test_flat_raster_completes_empty() {
        let detector = Detector::new(DetectionParameters::default()).unwrap();
        let mut store = MemoryRunStore::default();
        let run = detector.run_source("flat", &flat_source(64, 48), None, &mut store);
        assert_eq!(run.status(), RunStatus::Completed);
        assert!(run.trees().is_empty());
        let s = run.summary().unwrap();
        assert_eq!(s.tree_count, 0);
        assert!((s.area_ha - 64.0 * 48.0 * 0.25 / 10_000.0).abs() < 1e-12);
        assert_eq!(store.get("flat").map(|r| r.status()), Some(RunStatus::Completed));
    }

    #[test]
    fn test_read_error_fails_run() {
        let detector = Detector::new(DetectionParameters::default()).unwrap();
        let mut store = MemoryRunStore::default();
        let run = detector.run_source("broken", &BrokenSource(flat_source(16, 16)), None, &mut store);
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.error_message().unwrap_or_default().contains("device unplugged"));
        assert!(run.summary().is_none());
        assert!(run.trees().is_empty());
        let stored = store.get("broken").unwrap();
        assert_eq!(stored.status(), RunStatus::Failed);
    }

    #[test]
    fn test_spacing_holds_on_equal_degree_pixels() {
        // At 45° N a 5e-6° column is ~0.39 m wide but a row ~0.56 m tall.
        let (w, h) = (80usize, 40usize);
        let image = SourceImage::new(
            w,
            h,
            4,
            BandLayout::for_band_count(4, false),
            AffineTransform::north_up(-120.0, 45.0, 5e-6, 5e-6),
            EPSG_WGS84,
            None,
        )
        .unwrap();
        let red = Raster::new(h, w, 0.3);
        let mut nir = Raster::new(h, w, 0.3);
        // Ten columns (3.9 m) and ten rows (5.6 m) apart.
        for &(r0, c0) in &[(12.0, 30.0), (12.0, 40.0), (22.0, 30.0)] {
            for r in 0..h {
                for c in 0..w {
                    let d2: f64 = (r as f64 - r0).powi(2) + (c as f64 - c0).powi(2);
                    let v = 0.3 + 0.5 * (-d2 / 18.0).exp();
                    if v > nir.get(r, c) {
                        nir.set(r, c, v);
                    }
                }
            }
        }
        let source = MemorySource::new(image, vec![red.clone(), red.clone(), red, nir]).unwrap();
        let scale = source.image().pixel_scale;
        assert!(scale.x_m < scale.y_m);

        let params = DetectionParameters::default();
        let detector = Detector::new(params.clone()).unwrap();
        let mut store = MemoryRunStore::default();
        let run = detector.run_source("deg", &source, None, &mut store);
        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.trees().len(), 2);

        let points: Vec<GeoPoint> = run.trees().iter().map(|t| GeoPoint::new(t.lon, t.lat)).collect();
        let plane = LocalPlane::around(points.iter());
        let (a, b) = (plane.project(&points[0]), plane.project(&points[1]));
        let d = ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt();
        assert!(d >= params.min_tree_spacing_m, "{d} m");
    }

    #[test]
    fn test_missing_file_fails_run() {
        let detector = Detector::new(DetectionParameters::default()).unwrap();
        let mut store = MemoryRunStore::default();
        let run = detector.run_file(
            "nofile",
            Path::new("/nonexistent/field.tif"),
            &OpenOptions::default(),
            None,
            &mut store,
        );
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.error_message().is_some());
    }
}
