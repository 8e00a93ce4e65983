//! # orchardtree: tree detection in orchard imagery
//!
//! Finds individual tree crowns in georeferenced aerial rasters (RGB or
//! RGB + NIR) and reports each tree's position, canopy diameter and a
//! confidence score.
//!
//! This crate provides:
//! - **Raster access**: `RasterSource` with `GeoTiffSource` (windowed strip/tile
//!   reads) and `MemorySource`; field boundaries from GeoJSON; tiling
//! - **Detection pipeline**: `normalize_band`, `ndvi` / `excess_green`,
//!   `gaussian_smooth`, `detect_peaks`, attribute estimation, `detect_window`
//! - **Runs**: `Detector` drives a `DetectionRun` through
//!   `pending → processing → completed | failed` and persists it through a `RunStore`
//! - **Evaluation & QA**: k-d tree matching against labels (`evaluate`),
//!   GeoJSON / JSON summaries and PNG overlays
//! - **Synthetic orchards** for tests and demos

pub mod attributes;
pub mod boundary;
pub mod error;
pub mod evaluation;
pub mod geo;
pub mod normalize;
pub mod params;
pub mod peaks;
pub mod raster;
pub mod report;
pub mod run;
pub mod source;
pub mod spatial;
pub mod store;
pub mod synthetic;
pub mod tiling;
pub mod tree_detection;
pub mod vegetation;

pub use boundary::FieldBoundary;
pub use error::{BoundaryError, DetectError, ParameterError, ReportError};
pub use evaluation::{evaluate, EvaluationResult, GeoPoint};
pub use geo::{AffineTransform, Georeferencer, PixelScale};
pub use params::DetectionParameters;
pub use raster::{PixelWindow, Raster, WindowData};
pub use run::{DetectionRun, Detector, RunStatus, RunSummary};
pub use source::{BandLayout, GeoTiffSource, MemorySource, OpenOptions, RasterSource, SourceImage};
pub use store::{CsvRunStore, MemoryRunStore, RunStore};
pub use tree_detection::DetectedTree;
pub use vegetation::IndexKind;
