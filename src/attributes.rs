//! Per-peak canopy diameter and detection confidence.
//!
//! Both are deterministic functions of the vigor surface around the peak:
//!
//! - background `B`: 10th percentile of the surface in a neighbourhood
//!   reaching one max canopy diameter on the ground in each direction;
//! - crown: 4-connected region grown from the peak over pixels with value
//!   `>= B + crown_fraction * (peak - B)`, limited to the max canopy radius;
//!   diameter = diameter of the equal-area disc, clamped to the configured range;
//! - confidence: `contrast / (contrast + 0.1) * (0.5 + 0.5 * min(margin / contrast, 1))`
//!   with `contrast = peak - B` and `margin = peak - threshold`.

use std::collections::VecDeque;

use crate::geo::PixelScale;
use crate::normalize::percentile;
use crate::params::DetectionParameters;
use crate::peaks::Peak;
use crate::raster::Raster;

/// Percentile of the neighbourhood taken as local background.
pub const BACKGROUND_PERCENTILE: f64 = 10.0;
/// Contrast (index units) at which the contrast term of the confidence reaches 0.5.
pub const CONTRAST_HALF_SATURATION: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeAttributes {
    pub canopy_diameter_m: f64,
    pub confidence: f64,
    /// Local background level used for both estimates.
    pub background: f64,
}

fn local_background(surface: &Raster, peak: &Peak, (half_r, half_c): (isize, isize)) -> f64 {
    let mut values = Vec::new();
    for dr in -half_r..=half_r {
        for dc in -half_c..=half_c {
            if let Some(v) = surface.get_opt(peak.row as isize + dr, peak.col as isize + dc) {
                values.push(v);
            }
        }
    }
    percentile(&values, BACKGROUND_PERCENTILE).unwrap_or(peak.value)
}

/// Number of pixels of the crown region grown from `peak`, at most
/// `max_radius_m` from it on the ground.
fn crown_area_px(surface: &Raster, peak: &Peak, level: f64, max_radius_m: f64, scale: PixelScale) -> usize {
    let radius_sq = max_radius_m * max_radius_m;
    let mut visited = vec![false; surface.len()];
    let mut queue = VecDeque::new();
    visited[peak.row * surface.ncol + peak.col] = true;
    queue.push_back((peak.row, peak.col));
    let mut area = 0usize;

    let neighbors: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
    while let Some((r, c)) = queue.pop_front() {
        area += 1;
        for &(dr, dc) in &neighbors {
            let nr = r as isize + dr;
            let nc = c as isize + dc;
            let Some(v) = surface.get_opt(nr, nc) else {
                continue;
            };
            let (nr, nc) = (nr as usize, nc as usize);
            let idx = nr * surface.ncol + nc;
            if visited[idx] {
                continue;
            }
            let d2 = scale.distance_sq_m(nr as f64 - peak.row as f64, nc as f64 - peak.col as f64);
            if v >= level && d2 <= radius_sq {
                visited[idx] = true;
                queue.push_back((nr, nc));
            }
        }
    }
    area
}

/// Confidence in [0, 1], non-decreasing in the peak value.
pub fn confidence(peak_value: f64, background: f64, threshold: f64) -> f64 {
    let contrast = peak_value - background;
    if contrast <= 0.0 || !contrast.is_finite() {
        return 0.0;
    }
    let margin = (peak_value - threshold).max(0.0);
    let contrast_term = contrast / (contrast + CONTRAST_HALF_SATURATION);
    let margin_term = 0.5 + 0.5 * (margin / contrast).min(1.0);
    (contrast_term * margin_term).clamp(0.0, 1.0)
}

/// Canopy diameter and confidence of one peak of `surface`.
pub fn estimate(
    surface: &Raster,
    peak: &Peak,
    threshold: f64,
    scale: PixelScale,
    params: &DetectionParameters,
) -> TreeAttributes {
    let max_diameter_m = params.max_canopy_diameter_m;
    let (half_r, half_c) = scale.reach_px(max_diameter_m);
    let background = local_background(surface, peak, (half_r.max(1), half_c.max(1)));

    let level = background + params.crown_fraction * (peak.value - background);
    let area = crown_area_px(surface, peak, level, max_diameter_m / 2.0, scale);
    let area_m2 = area as f64 * scale.pixel_area_m2();
    let diameter_m = 2.0 * (area_m2 / std::f64::consts::PI).sqrt();

    TreeAttributes {
        canopy_diameter_m: params.clamp_diameter(diameter_m),
        confidence: confidence(peak.value, background, threshold),
        background,
    }
}
