//! Error types.
//!
//! Fatal conditions for a detection run ([`DetectError`]) are kept apart from
//! the recoverable boundary path ([`BoundaryError`]): an unusable field
//! boundary only downgrades the run to full-extent processing.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors: any of these moves a run to `failed`.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("cannot open raster '{path}': {reason}")]
    RasterOpen { path: PathBuf, reason: String },

    #[error("unsupported raster: {0}")]
    UnsupportedRaster(String),

    #[error("failed to read window {window}: {reason}")]
    WindowRead { window: String, reason: String },

    #[error("window {window} lies outside the {width}x{height} raster")]
    WindowOutOfBounds {
        window: String,
        width: usize,
        height: usize,
    },

    #[error("raster has no usable extent ({width}x{height})")]
    EmptyExtent { width: usize, height: usize },

    #[error("coordinate reference system error: {0}")]
    Crs(String),

    #[error(transparent)]
    Parameters(#[from] ParameterError),

    #[error("failed to persist run: {0}")]
    Persist(String),

    #[error("invalid run transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

/// Validation failures of [`crate::params::DetectionParameters`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("min canopy diameter {min} m exceeds max canopy diameter {max} m")]
    CanopyRange { min: f64, max: f64 },

    #[error("canopy diameters must be positive and finite (got min={min}, max={max})")]
    CanopyNotPositive { min: f64, max: f64 },

    #[error("min tree spacing must be positive and finite (got {0})")]
    Spacing(f64),

    #[error("vegetation threshold percentile must lie in [0, 100] (got {0})")]
    Percentile(f64),

    #[error("tile size must be positive")]
    TileSize,

    #[error("tile overlap {overlap} px must be smaller than tile size {tile} px")]
    TileOverlap { overlap: usize, tile: usize },

    #[error("smoothing sigma must be >= 0 (got {0})")]
    Smoothing(f64),

    #[error("crown fraction must lie in (0, 1) (got {0})")]
    CrownFraction(f64),

    #[error("cannot read parameter file '{path}': {reason}")]
    File { path: PathBuf, reason: String },
}

/// Recoverable: the caller falls back to the whole raster extent.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BoundaryError {
    #[error("malformed GeoJSON: {0}")]
    Malformed(String),

    #[error("unsupported geometry type '{0}' (expected Polygon or MultiPolygon)")]
    UnsupportedGeometry(String),

    #[error("boundary ring has {0} distinct vertices, need at least 3")]
    DegenerateRing(usize),

    #[error("boundary vertex {index} is not finite")]
    NonFinite { index: usize },

    #[error("boundary could not be reprojected: {0}")]
    Reprojection(String),

    #[error("boundary does not intersect the raster")]
    OutsideRaster,
}

/// Failures while writing QA artifacts or reading evaluation inputs.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Detect(#[from] DetectError),
}

impl ReportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
