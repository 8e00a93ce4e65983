//! Processing-window layout: boundary-enclosing window and overlapping tiles.

use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::boundary::polygon_bounds;
use crate::error::BoundaryError;
use crate::raster::PixelWindow;

/// Smallest integer window enclosing `polygon` (pixel `(col, row)` vertices),
/// intersected with the `width` x `height` raster.
pub fn enclosing_window(
    polygon: &[(f64, f64)],
    width: usize,
    height: usize,
) -> Result<PixelWindow, BoundaryError> {
    let (xmin, ymin, xmax, ymax) = polygon_bounds(polygon);
    if !(xmin.is_finite() && ymin.is_finite() && xmax.is_finite() && ymax.is_finite()) {
        return Err(BoundaryError::OutsideRaster);
    }
    let c0 = xmin.floor().max(0.0);
    let r0 = ymin.floor().max(0.0);
    let c1 = xmax.ceil().min(width as f64);
    let r1 = ymax.ceil().min(height as f64);
    if c1 <= c0 || r1 <= r0 {
        return Err(BoundaryError::OutsideRaster);
    }
    let (c0, r0, c1, r1) = (c0 as usize, r0 as usize, c1 as usize, r1 as usize);
    Ok(PixelWindow::new(r0, c0, r1 - r0, c1 - c0))
}

/// Processing area for a raster: the boundary window when the boundary is
/// usable, the full raster otherwise.
pub fn processing_area(
    polygon: Option<Result<Vec<(f64, f64)>, BoundaryError>>,
    width: usize,
    height: usize,
) -> (PixelWindow, Option<Vec<(f64, f64)>>) {
    let full = PixelWindow::full(width, height);
    match polygon {
        None => (full, None),
        Some(Ok(poly)) => match enclosing_window(&poly, width, height) {
            Ok(window) => (window, Some(poly)),
            Err(e) => {
                warn!("field boundary unusable ({e}), processing the full raster");
                (full, None)
            }
        },
        Some(Err(e)) => {
            warn!("field boundary unusable ({e}), processing the full raster");
            (full, None)
        }
    }
}

/// Start offsets along one axis of length `len`: consecutive tiles of `tile`
/// pixels overlap by `overlap`, and the last tile ends exactly at `len`.
fn axis_starts(len: usize, tile: usize, overlap: usize) -> Vec<usize> {
    if len <= tile {
        return vec![0];
    }
    let step = tile - overlap;
    let mut starts: Vec<usize> = (0..).map(|i| i * step).take_while(|&s| s + tile < len).collect();
    starts.push(len - tile);
    starts.dedup();
    starts
}

/// Core interval `[lo, hi)` of each tile along one axis. Neighbouring cores
/// meet in the middle of their overlap, so the cores partition `0..len`.
fn axis_cores(len: usize, starts: &[usize], tile: usize) -> Vec<(usize, usize)> {
    let n = starts.len();
    let end = |i: usize| (starts[i] + tile).min(len);
    (0..n)
        .map(|i| {
            let lo = if i == 0 { 0 } else { (starts[i] + end(i - 1)) / 2 };
            let hi = if i + 1 == n { len } else { (starts[i + 1] + end(i)) / 2 };
            (lo, hi)
        })
        .collect()
}

/// A processing tile and the part of it that owns its detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub window: PixelWindow,
    /// Sub-window of `window`; the cores of all tiles partition the area.
    pub core: PixelWindow,
}

/// Split `area` into tiles of at most `tile` x `tile` pixels overlapping by
/// `overlap`, each with its core. An area no larger than one tile yields
/// exactly itself.
pub fn tile_layout(area: PixelWindow, tile: usize, overlap: usize) -> Vec<Tile> {
    if area.is_empty() {
        return Vec::new();
    }
    if area.width <= tile && area.height <= tile {
        return vec![Tile {
            window: area,
            core: area,
        }];
    }
    let overlap = overlap.min(tile.saturating_sub(1));
    let rows = axis_starts(area.height, tile, overlap);
    let cols = axis_starts(area.width, tile, overlap);
    let row_cores = axis_cores(area.height, &rows, tile);
    let col_cores = axis_cores(area.width, &cols, tile);

    let mut tiles = Vec::with_capacity(rows.len() * cols.len());
    for (&r, &(r_lo, r_hi)) in rows.iter().zip(&row_cores) {
        for (&c, &(c_lo, c_hi)) in cols.iter().zip(&col_cores) {
            tiles.push(Tile {
                window: PixelWindow::new(
                    area.row_off + r,
                    area.col_off + c,
                    tile.min(area.height),
                    tile.min(area.width),
                ),
                core: PixelWindow::new(
                    area.row_off + r_lo,
                    area.col_off + c_lo,
                    r_hi - r_lo,
                    c_hi - c_lo,
                ),
            });
        }
    }
    debug!("{} split into {} tile(s) of {} px (overlap {})", area, tiles.len(), tile, overlap);
    tiles
}

/// Windows of [`tile_layout`].
pub fn tile_windows(area: PixelWindow, tile: usize, overlap: usize) -> Vec<PixelWindow> {
    tile_layout(area, tile, overlap)
        .into_iter()
        .map(|t| t.window)
        .collect()
}

/// Up to `n` distinct windows chosen at random.
pub fn sample_windows<R: Rng + ?Sized>(
    windows: &[PixelWindow],
    n: usize,
    rng: &mut R,
) -> Vec<PixelWindow> {
    windows.choose_multiple(rng, n).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_enclosing_window_clipped_to_raster() {
        let poly = [(-5.0, 10.2), (30.7, 10.2), (30.7, 500.0), (-5.0, 500.0)];
        let w = enclosing_window(&poly, 100, 200).unwrap();
        assert_eq!(w, PixelWindow::new(10, 0, 190, 31));
    }

    #[test]
    fn test_enclosing_window_outside() {
        let poly = [(200.0, 200.0), (210.0, 200.0), (210.0, 210.0)];
        assert_eq!(enclosing_window(&poly, 100, 100), Err(BoundaryError::OutsideRaster));
    }

    #[test]
    fn test_processing_area_fallbacks() {
        let (w, poly) = processing_area(None, 50, 40);
        assert_eq!(w, PixelWindow::full(50, 40));
        assert!(poly.is_none());

        let (w, poly) = processing_area(Some(Err(BoundaryError::DegenerateRing(2))), 50, 40);
        assert_eq!(w, PixelWindow::full(50, 40));
        assert!(poly.is_none());

        let outside = vec![(60.0, 60.0), (70.0, 60.0), (70.0, 70.0)];
        let (w, _) = processing_area(Some(Ok(outside)), 50, 40);
        assert_eq!(w, PixelWindow::full(50, 40));
    }

    #[test]
    fn test_small_area_is_one_window() {
        let area = PixelWindow::new(5, 7, 30, 20);
        assert_eq!(tile_windows(area, 64, 8), vec![area]);
    }

    #[test]
    fn test_tiles_overlap_and_cover() {
        let area = PixelWindow::new(0, 0, 100, 250);
        let tiles = tile_windows(area, 100, 20);
        // Columns: 0, 80, 150 (last aligned to the edge).
        let cols: Vec<usize> = tiles.iter().map(|t| t.col_off).collect();
        assert_eq!(cols, vec![0, 80, 150]);
        assert!(tiles.iter().all(|t| t.fits_in(250, 100)));
        for pair in tiles.windows(2) {
            assert!(pair[0].col_end() >= pair[1].col_off + 20);
        }
        for c in 0..250 {
            assert!(tiles.iter().any(|t| t.contains(50, c)));
        }
    }

    #[test]
    fn test_narrow_area_one_axis_tiled() {
        let area = PixelWindow::new(0, 0, 30, 300);
        let tiles = tile_windows(area, 128, 16);
        assert!(tiles.iter().all(|t| t.height == 30 && t.width == 128));
        assert_eq!(tiles.last().map(|t| t.col_end()), Some(300));
    }

    #[test]
    fn test_cores_partition_area() {
        let area = PixelWindow::new(3, 5, 230, 250);
        let tiles = tile_layout(area, 100, 20);
        for t in &tiles {
            assert!(t.window.contains(t.core.row_off, t.core.col_off));
            assert!(t.core.row_end() <= t.window.row_end());
            assert!(t.core.col_end() <= t.window.col_end());
        }
        for r in area.row_off..area.row_end() {
            for c in area.col_off..area.col_end() {
                let owners = tiles.iter().filter(|t| t.core.contains(r, c)).count();
                assert_eq!(owners, 1, "pixel ({r}, {c})");
            }
        }
    }

    #[test]
    fn test_sample_windows_deterministic() {
        let area = PixelWindow::new(0, 0, 400, 400);
        let tiles = tile_windows(area, 100, 10);
        let a = sample_windows(&tiles, 3, &mut StdRng::seed_from_u64(7));
        let b = sample_windows(&tiles, 3, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert_eq!(sample_windows(&tiles, 100, &mut StdRng::seed_from_u64(7)).len(), tiles.len());
    }
}
