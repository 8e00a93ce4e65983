//! Detection parameters.
//!
//! Defaults: `min_canopy_diameter_m` = 3.0, `max_canopy_diameter_m` = 8.0,
//! `min_tree_spacing_m` = 4.5, `vegetation_threshold_percentile` = 50,
//! `tile_size_px` = 1024, `tile_overlap_px` = 64, `smoothing_sigma_px` = 1.0,
//! `crown_fraction` = 0.5.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ParameterError;

/// Tuning of one detection run. Construct through [`DetectionParameters::validated`]
/// or call [`DetectionParameters::validate`] after deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParameters {
    /// Smallest canopy diameter reported (m).
    pub min_canopy_diameter_m: f64,
    /// Largest canopy diameter reported (m).
    pub max_canopy_diameter_m: f64,
    /// Minimum distance between two accepted trees (m).
    pub min_tree_spacing_m: f64,
    /// Percentile of the vigor surface below which pixels cannot be peaks.
    pub vegetation_threshold_percentile: f64,
    /// Edge length of a processing window (px).
    pub tile_size_px: usize,
    /// Overlap between consecutive windows (px).
    pub tile_overlap_px: usize,
    /// Gaussian sigma applied to the vigor surface before peak search (px). 0 disables.
    pub smoothing_sigma_px: f64,
    /// Fraction of the peak-to-background contrast delimiting the crown.
    pub crown_fraction: f64,
}

impl Default for DetectionParameters {
    fn default() -> Self {
        Self {
            min_canopy_diameter_m: 3.0,
            max_canopy_diameter_m: 8.0,
            min_tree_spacing_m: 4.5,
            vegetation_threshold_percentile: 50.0,
            tile_size_px: 1024,
            tile_overlap_px: 64,
            smoothing_sigma_px: 1.0,
            crown_fraction: 0.5,
        }
    }
}

impl DetectionParameters {
    /// Consume `self` and return it only if every field is consistent.
    pub fn validated(self) -> Result<Self, ParameterError> {
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        let (min, max) = (self.min_canopy_diameter_m, self.max_canopy_diameter_m);
        if !(min.is_finite() && max.is_finite()) || min <= 0.0 || max <= 0.0 {
            return Err(ParameterError::CanopyNotPositive { min, max });
        }
        if min > max {
            return Err(ParameterError::CanopyRange { min, max });
        }
        if !self.min_tree_spacing_m.is_finite() || self.min_tree_spacing_m <= 0.0 {
            return Err(ParameterError::Spacing(self.min_tree_spacing_m));
        }
        let p = self.vegetation_threshold_percentile;
        if !(0.0..=100.0).contains(&p) {
            return Err(ParameterError::Percentile(p));
        }
        if self.tile_size_px == 0 {
            return Err(ParameterError::TileSize);
        }
        if self.tile_overlap_px >= self.tile_size_px {
            return Err(ParameterError::TileOverlap {
                overlap: self.tile_overlap_px,
                tile: self.tile_size_px,
            });
        }
        if !self.smoothing_sigma_px.is_finite() || self.smoothing_sigma_px < 0.0 {
            return Err(ParameterError::Smoothing(self.smoothing_sigma_px));
        }
        if !(self.crown_fraction > 0.0 && self.crown_fraction < 1.0) {
            return Err(ParameterError::CrownFraction(self.crown_fraction));
        }
        Ok(())
    }

    /// Load parameters from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ParameterError> {
        let text = fs::read_to_string(path).map_err(|e| ParameterError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let params: Self = serde_json::from_str(&text).map_err(|e| ParameterError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        params.validated()
    }

    /// Canopy diameter clamped to the configured range.
    pub fn clamp_diameter(&self, diameter_m: f64) -> f64 {
        diameter_m.clamp(self.min_canopy_diameter_m, self.max_canopy_diameter_m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let p = DetectionParameters::default();
        assert!(p.validate().is_ok());
        assert_eq!(p.min_canopy_diameter_m, 3.0);
        assert_eq!(p.max_canopy_diameter_m, 8.0);
        assert_eq!(p.min_tree_spacing_m, 4.5);
        assert_eq!(p.vegetation_threshold_percentile, 50.0);
    }

    #[test]
    fn test_rejects_inverted_canopy_range() {
        let p = DetectionParameters {
            min_canopy_diameter_m: 9.0,
            ..Default::default()
        };
        assert_eq!(
            p.validated(),
            Err(ParameterError::CanopyRange { min: 9.0, max: 8.0 })
        );
    }

    #[test]
    fn test_rejects_non_positive_spacing() {
        let p = DetectionParameters {
            min_tree_spacing_m: 0.0,
            ..Default::default()
        };
        assert_eq!(p.validate(), Err(ParameterError::Spacing(0.0)));
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_tile() {
        let p = DetectionParameters {
            tile_size_px: 64,
            tile_overlap_px: 64,
            ..Default::default()
        };
        assert!(matches!(
            p.validate(),
            Err(ParameterError::TileOverlap { overlap: 64, tile: 64 })
        ));
    }

    #[test]
    fn test_json_partial_fields_take_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"min_tree_spacing_m": 6.0, "tile_size_px": 512}}"#).unwrap();
        let p = DetectionParameters::from_json_file(f.path()).unwrap();
        assert_eq!(p.min_tree_spacing_m, 6.0);
        assert_eq!(p.tile_size_px, 512);
        assert_eq!(p.max_canopy_diameter_m, 8.0);
    }

    #[test]
    fn test_json_invalid_values_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"vegetation_threshold_percentile": 140.0}}"#).unwrap();
        assert_eq!(
            DetectionParameters::from_json_file(f.path()),
            Err(ParameterError::Percentile(140.0))
        );
    }

    #[test]
    fn test_clamp_diameter() {
        let p = DetectionParameters::default();
        assert_eq!(p.clamp_diameter(1.0), 3.0);
        assert_eq!(p.clamp_diameter(5.5), 5.5);
        assert_eq!(p.clamp_diameter(20.0), 8.0);
    }
}
