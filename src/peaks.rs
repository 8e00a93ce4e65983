//! Spacing-constrained local maxima of a vigor surface.
//!
//! Pipeline: gaussian_smooth → percentile threshold → candidate maxima →
//! greedy acceptance with disc suppression.

use std::cmp::Ordering;

use crate::geo::PixelScale;
use crate::normalize::percentile;
use crate::raster::Raster;

/// An accepted peak, in tile-local pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub row: usize,
    pub col: usize,
    /// Surface value used for ranking (smoothed).
    pub value: f64,
}

/// Result of [`detect_peaks`].
#[derive(Debug, Clone)]
pub struct PeakSearch {
    /// Percentile threshold of the searched surface; `None` if fully masked.
    pub threshold: Option<f64>,
    /// Accepted peaks, in acceptance order (highest first).
    pub peaks: Vec<Peak>,
}

// ---------------------------------------------------------------------------
// gaussian_smooth
// ---------------------------------------------------------------------------

/// Gaussian smoothing (2D separable). `sigma` in pixels. Masked (NaN) pixels
/// are skipped and stay masked; weights renormalise near masks and edges.
pub fn gaussian_smooth(surface: &Raster, sigma: f64) -> Raster {
    if sigma <= 0.0 {
        return surface.clone();
    }
    let radius = (3.0 * sigma).ceil() as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|i| {
            let x = i as f64;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();

    // Horizontal pass
    let mut tmp = surface.clone();
    for r in 0..surface.nrow {
        for c in 0..surface.ncol {
            if surface.get(r, c).is_nan() {
                continue;
            }
            let mut sum = 0.0;
            let mut wsum = 0.0;
            for (ki, di) in (-radius..=radius).enumerate() {
                if let Some(v) = surface.get_opt(r as isize, c as isize + di) {
                    sum += v * kernel[ki];
                    wsum += kernel[ki];
                }
            }
            if wsum > 0.0 {
                tmp.set(r, c, sum / wsum);
            }
        }
    }
    // Vertical pass
    let mut out = tmp.clone();
    for r in 0..surface.nrow {
        for c in 0..surface.ncol {
            if tmp.get(r, c).is_nan() {
                continue;
            }
            let mut sum = 0.0;
            let mut wsum = 0.0;
            for (ki, di) in (-radius..=radius).enumerate() {
                if let Some(v) = tmp.get_opt(r as isize + di, c as isize) {
                    sum += v * kernel[ki];
                    wsum += kernel[ki];
                }
            }
            if wsum > 0.0 {
                out.set(r, c, sum / wsum);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// detect_peaks
// ---------------------------------------------------------------------------

/// True when no 8-neighbour is strictly higher. Masked neighbours are ignored.
pub(crate) fn is_local_max(surface: &Raster, r: usize, c: usize, v: f64) -> bool {
    for dr in -1isize..=1 {
        for dc in -1isize..=1 {
            if dr == 0 && dc == 0 {
                continue;
            }
            if let Some(n) = surface.get_opt(r as isize + dr, c as isize + dc) {
                if n > v {
                    return false;
                }
            }
        }
    }
    true
}

/// True when an in-raster 8-neighbour is masked.
pub(crate) fn touches_mask(surface: &Raster, r: usize, c: usize) -> bool {
    (-1isize..=1).any(|dr| {
        (-1isize..=1).any(|dc| {
            let (nr, nc) = (r as isize + dr, c as isize + dc);
            nr >= 0
                && nc >= 0
                && (nr as usize) < surface.nrow
                && (nc as usize) < surface.ncol
                && surface.get(nr as usize, nc as usize).is_nan()
        })
    })
}

/// Candidate ordering: value descending, then row, then column.
fn rank(a: &Peak, b: &Peak) -> Ordering {
    b.value
        .partial_cmp(&a.value)
        .unwrap_or(Ordering::Equal)
        .then(a.row.cmp(&b.row))
        .then(a.col.cmp(&b.col))
}

/// Relative tolerance under which neighbouring values count as one plateau.
const PLATEAU_TOLERANCE: f64 = 1e-9;

/// Unsuppressed pixels 8-connected to `seed` at (within tolerance) `value`.
fn plateau(surface: &Raster, seed: (usize, usize), value: f64, suppressed: &[bool]) -> Vec<(usize, usize)> {
    let tol = PLATEAU_TOLERANCE * value.abs().max(1.0);
    let mut seen = vec![false; surface.len()];
    seen[seed.0 * surface.ncol + seed.1] = true;
    let mut members = vec![seed];
    let mut next = 0;
    while next < members.len() {
        let (r, c) = members[next];
        next += 1;
        for dr in -1isize..=1 {
            for dc in -1isize..=1 {
                let (nr, nc) = (r as isize + dr, c as isize + dc);
                let Some(v) = surface.get_opt(nr, nc) else {
                    continue;
                };
                let idx = nr as usize * surface.ncol + nc as usize;
                if !seen[idx] && !suppressed[idx] && (v - value).abs() <= tol {
                    seen[idx] = true;
                    members.push((nr as usize, nc as usize));
                }
            }
        }
    }
    members
}

/// Member closest to the centroid; ties go to the lowest row, then column.
fn central_pixel(members: &[(usize, usize)]) -> (usize, usize) {
    let n = members.len() as f64;
    let (sr, sc) = members
        .iter()
        .fold((0.0, 0.0), |(sr, sc), &(r, c)| (sr + r as f64, sc + c as f64));
    let (cr, cc) = (sr / n, sc / n);
    let mut best = members[0];
    let mut best_d2 = f64::INFINITY;
    for &(r, c) in members {
        let d2 = (r as f64 - cr).powi(2) + (c as f64 - cc).powi(2);
        if d2 < best_d2 || (d2 == best_d2 && (r, c) < best) {
            best = (r, c);
            best_d2 = d2;
        }
    }
    best
}

/// Greedy spacing-constrained peak extraction.
///
/// 1. threshold = `percentile` of all non-masked values;
/// 2. the highest remaining pixel strictly above the threshold (with no
///    strictly higher 8-neighbour) is accepted; a flat-topped maximum counts
///    once, at its most central pixel;
/// 3. every pixel closer than `spacing_m` on the ground to it is suppressed;
/// 4. repeat until no candidate remains.
///
/// Accepted peaks are pairwise at least `spacing_m` apart under `scale`. A
/// surface with no pixel above the threshold yields no peaks.
pub fn detect_peaks(surface: &Raster, percentile_p: f64, spacing_m: f64, scale: PixelScale) -> PeakSearch {
    detect_peaks_where(surface, percentile_p, spacing_m, scale, |_, _| true)
}

/// [`detect_peaks`] restricted to local maxima for which `admit(row, col)`
/// holds. Rejected maxima suppress nothing.
pub fn detect_peaks_where<F>(
    surface: &Raster,
    percentile_p: f64,
    spacing_m: f64,
    scale: PixelScale,
    admit: F,
) -> PeakSearch
where
    F: Fn(usize, usize) -> bool,
{
    let Some(threshold) = percentile(&surface.data, percentile_p) else {
        return PeakSearch {
            threshold: None,
            peaks: Vec::new(),
        };
    };

    let mut candidates: Vec<Peak> = Vec::new();
    for r in 0..surface.nrow {
        for c in 0..surface.ncol {
            let v = surface.get(r, c);
            if !v.is_nan() && v > threshold && is_local_max(surface, r, c, v) && admit(r, c) {
                candidates.push(Peak { row: r, col: c, value: v });
            }
        }
    }
    candidates.sort_by(rank);

    let spacing_sq = spacing_m * spacing_m;
    let (reach_r, reach_c) = scale.reach_px(spacing_m);
    let mut suppressed = vec![false; surface.len()];
    let mut peaks = Vec::new();

    for cand in candidates {
        if suppressed[cand.row * surface.ncol + cand.col] {
            continue;
        }
        let members = plateau(surface, (cand.row, cand.col), cand.value, &suppressed);
        let (row, col) = central_pixel(&members);
        for &(r, c) in &members {
            suppressed[r * surface.ncol + c] = true;
        }
        for dr in -reach_r..=reach_r {
            let rr = row as isize + dr;
            if rr < 0 || rr >= surface.nrow as isize {
                continue;
            }
            for dc in -reach_c..=reach_c {
                let cc = col as isize + dc;
                if cc < 0 || cc >= surface.ncol as isize {
                    continue;
                }
                if scale.distance_sq_m(dr as f64, dc as f64) < spacing_sq {
                    suppressed[rr as usize * surface.ncol + cc as usize] = true;
                }
            }
        }
        peaks.push(Peak {
            row,
            col,
            value: surface.get(row, col),
        });
    }

    PeakSearch {
        threshold: Some(threshold),
        peaks,
    }
}
