//! Single-band pixel grids and pixel windows.

use std::fmt;
use std::ops::{Index, IndexMut};

/// A 2D single-band grid (row-major). Origin is top-left.
///
/// `NaN` marks a masked pixel (outside the field boundary or nodata).
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub nrow: usize,
    pub ncol: usize,
    pub data: Vec<f64>,
}

impl Raster {
    /// Create a new raster filled with a constant value.
    pub fn new(nrow: usize, ncol: usize, fill: f64) -> Self {
        Self {
            nrow,
            ncol,
            data: vec![fill; nrow * ncol],
        }
    }

    /// Create a raster from an existing Vec (row-major).
    ///
    /// Returns `None` when `data` does not hold exactly `nrow * ncol` values.
    pub fn from_vec(nrow: usize, ncol: usize, data: Vec<f64>) -> Option<Self> {
        (data.len() == nrow * ncol).then_some(Self { nrow, ncol, data })
    }

    /// Get value at (row, col), returns NaN if out of bounds.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        if row < self.nrow && col < self.ncol {
            self.data[row * self.ncol + col]
        } else {
            f64::NAN
        }
    }

    /// Get a non-masked value at signed (row, col).
    #[inline]
    pub fn get_opt(&self, row: isize, col: isize) -> Option<f64> {
        if row >= 0 && col >= 0 && (row as usize) < self.nrow && (col as usize) < self.ncol {
            let v = self.data[row as usize * self.ncol + col as usize];
            if v.is_nan() {
                None
            } else {
                Some(v)
            }
        } else {
            None
        }
    }

    /// Set value at (row, col).
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f64) {
        if row < self.nrow && col < self.ncol {
            self.data[row * self.ncol + col] = val;
        }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a function to every non-masked cell.
    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> Raster {
        let mut out = self.clone();
        for v in out.data.iter_mut().filter(|v| !v.is_nan()) {
            *v = f(*v);
        }
        out
    }

    /// Non-masked values, in row-major order.
    pub fn valid_values(&self) -> Vec<f64> {
        self.data.iter().copied().filter(|v| !v.is_nan()).collect()
    }

    /// Copy out a sub-grid. The window must lie inside the raster.
    pub fn crop(&self, row_off: usize, col_off: usize, nrow: usize, ncol: usize) -> Raster {
        let mut data = Vec::with_capacity(nrow * ncol);
        for r in row_off..row_off + nrow {
            let start = r * self.ncol + col_off;
            data.extend_from_slice(&self.data[start..start + ncol]);
        }
        Raster { nrow, ncol, data }
    }
}

impl Index<(usize, usize)> for Raster {
    type Output = f64;
    fn index(&self, (r, c): (usize, usize)) -> &f64 {
        &self.data[r * self.ncol + c]
    }
}

impl IndexMut<(usize, usize)> for Raster {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f64 {
        &mut self.data[r * self.ncol + c]
    }
}

/// A rectangular pixel region of the source raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelWindow {
    pub row_off: usize,
    pub col_off: usize,
    pub height: usize,
    pub width: usize,
}

impl PixelWindow {
    pub fn new(row_off: usize, col_off: usize, height: usize, width: usize) -> Self {
        Self {
            row_off,
            col_off,
            height,
            width,
        }
    }

    /// The whole of a `width` x `height` raster.
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, height, width)
    }

    pub fn row_end(&self) -> usize {
        self.row_off + self.height
    }

    pub fn col_end(&self) -> usize {
        self.col_off + self.width
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    /// True when the window fits inside a `width` x `height` raster.
    pub fn fits_in(&self, width: usize, height: usize) -> bool {
        self.row_end() <= height && self.col_end() <= width
    }

    /// Absolute raster pixel containing the tile-local (row, col).
    pub fn to_absolute(&self, row: usize, col: usize) -> (usize, usize) {
        (self.row_off + row, self.col_off + col)
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        (self.row_off..self.row_end()).contains(&row) && (self.col_off..self.col_end()).contains(&col)
    }
}

impl fmt::Display for PixelWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[rows {}..{}, cols {}..{}]",
            self.row_off,
            self.row_end(),
            self.col_off,
            self.col_end()
        )
    }
}

/// Pixel data of one window: one [`Raster`] per band, all `height x width`.
#[derive(Debug, Clone)]
pub struct WindowData {
    pub window: PixelWindow,
    pub bands: Vec<Raster>,
}

impl WindowData {
    pub fn band(&self, index: usize) -> Option<&Raster> {
        self.bands.get(index)
    }

    /// Mask (set to NaN) every pixel for which `keep(row, col)` is false, in all bands.
    /// Coordinates passed to `keep` are tile-local.
    pub fn mask_where<F: Fn(usize, usize) -> bool>(&mut self, keep: F) {
        let (nrow, ncol) = (self.window.height, self.window.width);
        for r in 0..nrow {
            for c in 0..ncol {
                if !keep(r, c) {
                    for band in self.bands.iter_mut() {
                        band.set(r, c, f64::NAN);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Raster::from_vec(2, 3, vec![0.0; 6]).is_some());
        assert!(Raster::from_vec(2, 3, vec![0.0; 5]).is_none());
    }

    #[test]
    fn test_get_opt_skips_masked_and_out_of_bounds() {
        let mut r = Raster::new(2, 2, 1.0);
        r.set(0, 1, f64::NAN);
        assert_eq!(r.get_opt(0, 0), Some(1.0));
        assert_eq!(r.get_opt(0, 1), None);
        assert_eq!(r.get_opt(-1, 0), None);
        assert_eq!(r.get_opt(0, 2), None);
    }

    #[test]
    fn test_crop() {
        let r = Raster::from_vec(3, 3, (0..9).map(|v| v as f64).collect()).unwrap();
        let c = r.crop(1, 1, 2, 2);
        assert_eq!(c.data, vec![4.0, 5.0, 7.0, 8.0]);
    }

    #[test]
    fn test_window_geometry() {
        let w = PixelWindow::new(10, 20, 5, 6);
        assert_eq!(w.row_end(), 15);
        assert_eq!(w.col_end(), 26);
        assert_eq!(w.to_absolute(1, 2), (11, 22));
        assert!(w.contains(14, 25));
        assert!(!w.contains(15, 25));
        assert!(w.fits_in(26, 15));
        assert!(!w.fits_in(25, 15));
    }

    #[test]
    fn test_mask_where() {
        let mut wd = WindowData {
            window: PixelWindow::new(0, 0, 2, 2),
            bands: vec![Raster::new(2, 2, 1.0), Raster::new(2, 2, 2.0)],
        };
        wd.mask_where(|r, c| r == c);
        assert!(wd.bands[0].get(0, 1).is_nan());
        assert!(wd.bands[1].get(1, 0).is_nan());
        assert_eq!(wd.bands[1].get(1, 1), 2.0);
    }
}
