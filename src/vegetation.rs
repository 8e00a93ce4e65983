//! Vegetation index surfaces: NDVI with a near-infrared band, excess green (ExG)
//! otherwise. Output is single-channel, same shape as the input, in [-1, 1].

use serde::{Deserialize, Serialize};

use crate::normalize::normalize_bands;
use crate::raster::Raster;
use crate::source::BandLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Ndvi,
    Exg,
}

impl IndexKind {
    pub fn for_layout(layout: &BandLayout) -> Self {
        if layout.has_nir() {
            Self::Ndvi
        } else {
            Self::Exg
        }
    }
}

/// `(NIR - Red) / (NIR + Red)` clamped to [-1, 1]; 0 where the denominator is 0.
pub fn ndvi(red: &Raster, nir: &Raster) -> Raster {
    let data = red
        .data
        .iter()
        .zip(nir.data.iter())
        .map(|(&r, &n)| {
            if r.is_nan() || n.is_nan() {
                return f64::NAN;
            }
            let den = n + r;
            if den == 0.0 {
                0.0
            } else {
                ((n - r) / den).clamp(-1.0, 1.0)
            }
        })
        .collect();
    Raster {
        nrow: red.nrow,
        ncol: red.ncol,
        data,
    }
}

/// Excess green `2G - R - B` on [0, 1] bands, halved into [-1, 1].
pub fn excess_green(red: &Raster, green: &Raster, blue: &Raster) -> Raster {
    let data = red
        .data
        .iter()
        .zip(green.data.iter())
        .zip(blue.data.iter())
        .map(|((&r, &g), &b)| ((2.0 * g - r - b) / 2.0).clamp(-1.0, 1.0))
        .collect();
    Raster {
        nrow: red.nrow,
        ncol: red.ncol,
        data,
    }
}

/// Vigor surface of one window of raw bands.
///
/// NDVI works on raw values (a ratio, insensitive to gain); ExG works on the
/// percentile-stretched bands.
pub fn vigor_surface(bands: &[Raster], layout: &BandLayout) -> (IndexKind, Raster) {
    match layout.nir {
        Some(nir) => (IndexKind::Ndvi, ndvi(&bands[layout.red], &bands[nir])),
        None => {
            let norm = normalize_bands(bands);
            (
                IndexKind::Exg,
                excess_green(&norm[layout.red], &norm[layout.green], &norm[layout.blue]),
            )
        }
    }
}
