//! Per-window tree detection and cross-window reduction.
//!
//! Pipeline for one window: boundary mask → vigor surface (NDVI / ExG) →
//! gaussian_smooth → detect_peaks → attribute estimation. The function
//! [`detect_window`] is pure in the window's pixels and the run parameters, so
//! windows can be processed in any order or in parallel. [`deduplicate`] then
//! merges all windows' candidates while enforcing the run-wide spacing.

use std::cmp::Ordering;
use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::attributes::estimate;
use crate::boundary::point_in_polygon;
use crate::error::DetectError;
use crate::geo::{Georeferencer, PixelScale};
use crate::params::DetectionParameters;
use crate::peaks::{detect_peaks_where, gaussian_smooth, is_local_max, touches_mask};
use crate::raster::{PixelWindow, WindowData};
use crate::source::BandLayout;
use crate::vegetation::{vigor_surface, IndexKind};

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

/// A single detected tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedTree {
    /// Tree id within its run (1-based, row-major order).
    pub id: u32,
    pub lat: f64,
    pub lon: f64,
    /// Absolute raster row of the peak pixel.
    pub pixel_row: usize,
    /// Absolute raster column of the peak pixel.
    pub pixel_col: usize,
    pub canopy_diameter_m: f64,
    /// Unsmoothed vegetation index at the peak.
    pub vegetation_index: f64,
    /// Detection confidence in [0, 1].
    pub confidence: f64,
}

/// A tree candidate from one window, before deduplication and georeferencing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub row: usize,
    pub col: usize,
    /// Smoothed surface value, used for ranking.
    pub score: f64,
    pub vegetation_index: f64,
    pub canopy_diameter_m: f64,
    pub confidence: f64,
}

/// Output of [`detect_window`].
#[derive(Debug, Clone)]
pub struct WindowDetections {
    pub window: PixelWindow,
    pub index: IndexKind,
    pub threshold: Option<f64>,
    pub candidates: Vec<Candidate>,
}

// ---------------------------------------------------------------------------
// detect_window
// ---------------------------------------------------------------------------

/// Detect tree candidates in one window of raw bands.
///
/// `polygon` is the field boundary in absolute pixel coordinates `(col, row)`;
/// pixels whose centre lies outside it are masked. A maximum on the edge of
/// the mask only counts if the unmasked surface peaks there too, so the
/// shoulder of a crown standing outside the field is not a tree.
pub fn detect_window(
    mut data: WindowData,
    layout: &BandLayout,
    polygon: Option<&[(f64, f64)]>,
    params: &DetectionParameters,
    scale: PixelScale,
) -> WindowDetections {
    let window = data.window;
    let sigma = params.smoothing_sigma_px;
    let mut unmasked = None;
    if let Some(poly) = polygon {
        unmasked = Some(data.bands.clone());
        data.mask_where(|r, c| {
            let (ar, ac) = window.to_absolute(r, c);
            point_in_polygon(poly, ac as f64 + 0.5, ar as f64 + 0.5)
        });
    }

    let (index, surface) = vigor_surface(&data.bands, layout);
    let smoothed = gaussian_smooth(&surface, sigma);
    let context = unmasked.map(|bands| gaussian_smooth(&vigor_surface(&bands, layout).1, sigma));

    let search = detect_peaks_where(
        &smoothed,
        params.vegetation_threshold_percentile,
        params.min_tree_spacing_m,
        scale,
        |r, c| match &context {
            Some(ctx) if touches_mask(&smoothed, r, c) => {
                let v = ctx.get(r, c);
                !v.is_nan() && is_local_max(ctx, r, c, v)
            }
            _ => true,
        },
    );

    let candidates: Vec<Candidate> = match search.threshold {
        Some(threshold) => search
            .peaks
            .iter()
            .map(|peak| {
                let attrs = estimate(&smoothed, peak, threshold, scale, params);
                let (row, col) = window.to_absolute(peak.row, peak.col);
                Candidate {
                    row,
                    col,
                    score: peak.value,
                    vegetation_index: surface.get(peak.row, peak.col),
                    canopy_diameter_m: attrs.canopy_diameter_m,
                    confidence: attrs.confidence,
                }
            })
            .collect(),
        None => Vec::new(),
    };

    debug!(
        "window {}: {:?} threshold {:?}, {} candidate(s)",
        window,
        index,
        search.threshold,
        candidates.len()
    );

    WindowDetections {
        window,
        index,
        threshold: search.threshold,
        candidates,
    }
}

// ---------------------------------------------------------------------------
// deduplicate
// ---------------------------------------------------------------------------

/// Merge candidates of all windows: greedy by score (then row, column),
/// dropping any candidate closer than `spacing_m` on the ground to an
/// accepted one. Returns the kept candidates in row-major order.
pub fn deduplicate(mut candidates: Vec<Candidate>, spacing_m: f64, scale: PixelScale) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.row.cmp(&b.row))
            .then(a.col.cmp(&b.col))
    });

    // Cells at least one spacing wide on the ground along each axis.
    let cell_r = (spacing_m / scale.y_m).max(1.0);
    let cell_c = (spacing_m / scale.x_m).max(1.0);
    let cell_of = |c: &Candidate| ((c.row as f64 / cell_r) as i64, (c.col as f64 / cell_c) as i64);
    let spacing_sq = spacing_m * spacing_m;
    let mut grid: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    let mut kept: Vec<Candidate> = Vec::new();

    for cand in candidates {
        let (gr, gc) = cell_of(&cand);
        let too_close = (-1..=1).any(|dr| {
            (-1..=1).any(|dc| {
                grid.get(&(gr + dr, gc + dc)).is_some_and(|ids| {
                    ids.iter().any(|&i| {
                        let k = &kept[i];
                        let d2 = scale.distance_sq_m(
                            k.row as f64 - cand.row as f64,
                            k.col as f64 - cand.col as f64,
                        );
                        d2 < spacing_sq
                    })
                })
            })
        });
        if !too_close {
            grid.entry((gr, gc)).or_default().push(kept.len());
            kept.push(cand);
        }
    }

    kept.sort_by_key(|c| (c.row, c.col));
    kept
}

/// Turn kept candidates into trees with ids and lat/lon of the pixel centre.
pub fn georeference(
    kept: &[Candidate],
    geo: &Georeferencer,
) -> Result<Vec<DetectedTree>, DetectError> {
    kept.iter()
        .enumerate()
        .map(|(i, c)| {
            let (lat, lon) = geo.pixel_to_latlon(c.col as f64 + 0.5, c.row as f64 + 0.5)?;
            Ok(DetectedTree {
                id: i as u32 + 1,
                lat,
                lon,
                pixel_row: c.row,
                pixel_col: c.col,
                canopy_diameter_m: c.canopy_diameter_m,
                vegetation_index: c.vegetation_index,
                confidence: c.confidence,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
