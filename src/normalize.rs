//! Percentile contrast stretch of raw bands into [0, 1].

use std::cmp::Ordering;

use crate::raster::Raster;

/// Lower stretch percentile.
pub const LOW_PERCENTILE: f64 = 2.0;
/// Upper stretch percentile.
pub const HIGH_PERCENTILE: f64 = 98.0;

/// Percentile `p` (0–100) of `values` with linear interpolation between order
/// statistics. NaNs are ignored; `None` when no finite value is left.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    Some(percentile_sorted(&sorted, p))
}

/// Same as [`percentile`] on an already sorted, NaN-free slice.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Stretch one band: the [p2, p98] range maps linearly onto [0, 1] and values
/// outside are clipped. A flat band (p98 == p2) is only clipped. Masked pixels
/// stay masked.
pub fn normalize_band(band: &Raster) -> Raster {
    let values = band.valid_values();
    let (Some(lo), Some(hi)) = (
        percentile(&values, LOW_PERCENTILE),
        percentile(&values, HIGH_PERCENTILE),
    ) else {
        return band.clone();
    };
    let span = hi - lo;
    if span <= 0.0 {
        return band.map(|v| v.clamp(0.0, 1.0));
    }
    band.map(|v| ((v - lo) / span).clamp(0.0, 1.0))
}

/// Stretch each band independently.
pub fn normalize_bands(bands: &[Raster]) -> Vec<Raster> {
    bands.iter().map(normalize_band).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_percentile_interpolates() {
        let v: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        assert_abs_diff_eq!(percentile(&v, 2.0).unwrap(), 2.0);
        assert_abs_diff_eq!(percentile(&v, 50.0).unwrap(), 50.0);
        assert_abs_diff_eq!(percentile(&[1.0, 2.0], 50.0).unwrap(), 1.5);
        assert_eq!(percentile(&[f64::NAN], 50.0), None);
    }

    #[test]
    fn test_stretch_clips_outliers() {
        let mut data: Vec<f64> = (0..100).map(|i| 100.0 + i as f64).collect();
        data[0] = -50_000.0;
        data[99] = 65_000.0;
        let band = Raster::from_vec(10, 10, data).unwrap();
        let out = normalize_band(&band);
        assert!(out.data.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(out.data[0], 0.0);
        assert_eq!(out.data[99], 1.0);
        // Interior values keep their order.
        assert!(out.data[40] < out.data[60]);
    }

    #[test]
    fn test_flat_band_is_clipped_without_scaling() {
        let band = Raster::new(4, 4, 0.4);
        let out = normalize_band(&band);
        assert!(out.data.iter().all(|&v| v == 0.4));

        let bright = Raster::new(4, 4, 250.0);
        assert!(normalize_band(&bright).data.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_masked_pixels_preserved() {
        let mut band = Raster::from_vec(2, 2, vec![0.0, 10.0, 20.0, 30.0]).unwrap();
        band.set(0, 0, f64::NAN);
        let out = normalize_band(&band);
        assert!(out.get(0, 0).is_nan());
        assert!(out.get(1, 1) <= 1.0);
    }
}
