//! Synthetic orchard rasters for tests and demos.
//!
//! Trees are Gaussian crowns on bare soil. All randomness comes from the
//! caller's generator, so a seeded `StdRng` reproduces the same scene.

use rand::Rng;

use crate::error::DetectError;
use crate::geo::{AffineTransform, EPSG_WGS84, METERS_PER_DEGREE};
use crate::raster::Raster;
use crate::source::{BandLayout, MemorySource, SourceImage};

/// Soil reflectance (red, green, blue, nir) in [0, 1].
const SOIL: [f64; 4] = [0.45, 0.38, 0.30, 0.30];
/// Change of each band at a crown centre.
const CANOPY_DELTA: [f64; 4] = [-0.30, 0.35, -0.20, 0.45];

/// Scene description.
#[derive(Debug, Clone)]
pub struct SyntheticOrchard {
    pub width: usize,
    pub height: usize,
    pub gsd_m: f64,
    pub tree_count: usize,
    /// Crown sigma range in pixels (inclusive lower, exclusive upper).
    pub sigma_px: (f64, f64),
    /// Minimum distance between crown centres in pixels.
    pub min_separation_px: f64,
    /// Crown centres stay this far from the raster edge.
    pub margin_px: f64,
    /// Add a near-infrared band (4 bands, NDVI) instead of RGB only.
    pub with_nir: bool,
    /// Upper-left corner (lon, lat).
    pub origin: (f64, f64),
}

impl Default for SyntheticOrchard {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            gsd_m: 0.5,
            tree_count: 10,
            sigma_px: (2.0, 4.0),
            min_separation_px: 40.0,
            margin_px: 16.0,
            with_nir: false,
            origin: (-121.75, 38.55),
        }
    }
}

/// A planted crown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticTree {
    pub row: f64,
    pub col: f64,
    pub sigma_px: f64,
}

#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub source: MemorySource,
    pub trees: Vec<SyntheticTree>,
}

impl SyntheticOrchard {
    /// Geographic north-up transform whose pixels measure `gsd_m` on the ground.
    pub fn transform(&self) -> AffineTransform {
        let (lon, lat) = self.origin;
        let res_y = self.gsd_m / METERS_PER_DEGREE;
        let res_x = self.gsd_m / (METERS_PER_DEGREE * lat.to_radians().cos());
        AffineTransform::north_up(lon, lat, res_x, res_y)
    }

    fn image(&self, band_count: usize) -> Result<SourceImage, DetectError> {
        SourceImage::new(
            self.width,
            self.height,
            band_count,
            BandLayout::for_band_count(band_count, false),
            self.transform(),
            EPSG_WGS84,
            Some(self.gsd_m),
        )
    }

    /// Place crowns by rejection sampling. Fewer than `tree_count` crowns are
    /// placed when the raster cannot hold them at the requested separation.
    fn place<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<SyntheticTree> {
        let mut trees: Vec<SyntheticTree> = Vec::with_capacity(self.tree_count);
        let (rmin, rmax) = (self.margin_px, self.height as f64 - self.margin_px);
        let (cmin, cmax) = (self.margin_px, self.width as f64 - self.margin_px);
        if rmax <= rmin || cmax <= cmin {
            return trees;
        }
        let sep_sq = self.min_separation_px * self.min_separation_px;
        let mut attempts = 0;
        while trees.len() < self.tree_count && attempts < 10_000 {
            attempts += 1;
            let row = rng.gen_range(rmin..rmax).round();
            let col = rng.gen_range(cmin..cmax).round();
            if trees
                .iter()
                .all(|t| (t.row - row).powi(2) + (t.col - col).powi(2) >= sep_sq)
            {
                let sigma_px = if self.sigma_px.1 > self.sigma_px.0 {
                    rng.gen_range(self.sigma_px.0..self.sigma_px.1)
                } else {
                    self.sigma_px.0
                };
                trees.push(SyntheticTree { row, col, sigma_px });
            }
        }
        trees
    }

    /// Generate the scene.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SyntheticScene, DetectError> {
        let trees = self.place(rng);
        let band_count = if self.with_nir { 4 } else { 3 };

        // Canopy weight in [0, 1]: strongest crown at each pixel.
        let mut weight = Raster::new(self.height, self.width, 0.0);
        for t in &trees {
            let reach = (4.0 * t.sigma_px).ceil() as isize;
            for dr in -reach..=reach {
                for dc in -reach..=reach {
                    let r = t.row as isize + dr;
                    let c = t.col as isize + dc;
                    if r < 0 || c < 0 || r as usize >= self.height || c as usize >= self.width {
                        continue;
                    }
                    let d2 = (dr * dr + dc * dc) as f64;
                    let w = (-d2 / (2.0 * t.sigma_px * t.sigma_px)).exp();
                    let cell = &mut weight[(r as usize, c as usize)];
                    if w > *cell {
                        *cell = w;
                    }
                }
            }
        }

        let bands: Vec<Raster> = (0..band_count)
            .map(|b| weight.map(|w| SOIL[b] + CANOPY_DELTA[b] * w))
            .collect();
        let source = MemorySource::new(self.image(band_count)?, bands)?;
        Ok(SyntheticScene { source, trees })
    }

    /// All-zero raster of the same geometry.
    pub fn blank(&self) -> Result<MemorySource, DetectError> {
        let band_count = if self.with_nir { 4 } else { 3 };
        MemorySource::new(
            self.image(band_count)?,
            vec![Raster::new(self.height, self.width, 0.0); band_count],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RasterSource;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_same_seed_same_scene() {
        let orchard = SyntheticOrchard::default();
        let a = orchard.generate(&mut StdRng::seed_from_u64(7)).unwrap();
        let b = orchard.generate(&mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a.trees, b.trees);
        assert_eq!(a.source.bands(), b.source.bands());
    }

    #[test]
    fn test_placement_respects_separation() {
        let orchard = SyntheticOrchard::default();
        let scene = orchard.generate(&mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(scene.trees.len(), 10);
        for (i, a) in scene.trees.iter().enumerate() {
            assert!(a.sigma_px >= 2.0 && a.sigma_px < 4.0);
            for b in &scene.trees[i + 1..] {
                let d = ((a.row - b.row).powi(2) + (a.col - b.col).powi(2)).sqrt();
                assert!(d >= orchard.min_separation_px);
            }
        }
    }

    #[test]
    fn test_canopy_is_greener_than_soil() {
        let orchard = SyntheticOrchard {
            with_nir: true,
            ..Default::default()
        };
        let scene = orchard.generate(&mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(scene.source.image().band_count, 4);
        let t = scene.trees[0];
        let bands = scene.source.bands();
        let (r, c) = (t.row as usize, t.col as usize);
        assert!(bands[1].get(r, c) > SOIL[1] + 0.3);
        assert!(bands[3].get(r, c) > bands[0].get(r, c));
        assert_eq!(bands[1].get(0, 0), SOIL[1]);
    }

    #[test]
    fn test_transform_matches_gsd() {
        let orchard = SyntheticOrchard::default();
        let src = orchard.blank().unwrap();
        assert!((src.image().gsd_m - 0.5).abs() < 1e-12);
        let geo = src.image().georeferencer().unwrap();
        let computed = geo.ground_sample_distance(orchard.width, orchard.height).unwrap();
        assert!((computed - 0.5).abs() < 0.01, "{computed}");
    }
}
