//! Pixel ↔ map ↔ geographic coordinate mapping.
//!
//! Pixel coordinates are continuous `(col, row)` with the top-left corner of
//! pixel (0, 0) at the origin; the centre of pixel (r, c) is `(c + 0.5, r + 0.5)`.
//! Map coordinates follow the raster CRS. Geographic coordinates are WGS84-style
//! lon/lat in degrees.

use std::fmt;

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::error::DetectError;

/// Geographic lon/lat (degrees).
pub const EPSG_WGS84: u32 = 4326;
/// Spherical (Web) Mercator (metres).
pub const EPSG_WEB_MERCATOR: u32 = 3857;

/// Mean metres per degree of latitude.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

// ---------------------------------------------------------------------------
// Affine transform
// ---------------------------------------------------------------------------

/// Affine pixel → map transform in GDAL order:
///
/// ```text
/// x = c[0] + col * c[1] + row * c[2]
/// y = c[3] + col * c[4] + row * c[5]
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub c: [f64; 6],
}

impl AffineTransform {
    pub fn new(c: [f64; 6]) -> Self {
        Self { c }
    }

    /// North-up transform from the top-left corner and pixel sizes.
    pub fn north_up(origin_x: f64, origin_y: f64, res_x: f64, res_y: f64) -> Self {
        Self::new([origin_x, res_x, 0.0, origin_y, 0.0, -res_y])
    }

    #[inline]
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let c = &self.c;
        (
            c[0] + col * c[1] + row * c[2],
            c[3] + col * c[4] + row * c[5],
        )
    }

    pub fn determinant(&self) -> f64 {
        self.c[1] * self.c[5] - self.c[2] * self.c[4]
    }

    /// Map → pixel transform, `None` when the matrix is singular.
    pub fn inverse(&self) -> Option<AffineTransform> {
        let det = self.determinant();
        if det.abs() < f64::EPSILON * 1e-6 || !det.is_finite() {
            return None;
        }
        let c = &self.c;
        let i1 = c[5] / det;
        let i2 = -c[2] / det;
        let i4 = -c[4] / det;
        let i5 = c[1] / det;
        Some(Self::new([
            -(i1 * c[0] + i2 * c[3]),
            i1,
            i2,
            -(i4 * c[0] + i5 * c[3]),
            i4,
            i5,
        ]))
    }
}

// ---------------------------------------------------------------------------
// CRS transforms (proj4rs)
// ---------------------------------------------------------------------------

/// Proj string for the EPSG codes the crate understands.
pub fn proj_string(epsg: u32) -> Option<String> {
    match epsg {
        4326 => Some("+proj=longlat +datum=WGS84 +no_defs".to_string()),
        4269 => Some("+proj=longlat +datum=NAD83 +no_defs".to_string()),
        3857 => Some(
            "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
                .to_string(),
        ),
        32601..=32660 => Some(format!(
            "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
            epsg - 32600
        )),
        32701..=32760 => Some(format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            epsg - 32700
        )),
        26901..=26923 => Some(format!(
            "+proj=utm +zone={} +datum=NAD83 +units=m +no_defs",
            epsg - 26900
        )),
        _ => None,
    }
}

pub fn is_geographic(epsg: u32) -> bool {
    matches!(epsg, 4326 | 4269)
}

/// Point transform between two CRSs.
enum CrsTransformer {
    Identity,
    Proj {
        source: Box<Proj>,
        target: Box<Proj>,
        source_geographic: bool,
        target_geographic: bool,
    },
}

impl CrsTransformer {
    fn new(source_epsg: u32, target_epsg: u32) -> Result<Self, DetectError> {
        if source_epsg == target_epsg {
            return Ok(Self::Identity);
        }
        let parse = |epsg: u32| -> Result<Proj, DetectError> {
            let s = proj_string(epsg)
                .ok_or_else(|| DetectError::Crs(format!("EPSG:{epsg} not supported")))?;
            Proj::from_proj_string(&s)
                .map_err(|e| DetectError::Crs(format!("invalid projection EPSG:{epsg}: {e:?}")))
        };
        Ok(Self::Proj {
            source: Box::new(parse(source_epsg)?),
            target: Box::new(parse(target_epsg)?),
            source_geographic: is_geographic(source_epsg),
            target_geographic: is_geographic(target_epsg),
        })
    }

    fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), DetectError> {
        match self {
            Self::Identity => Ok((x, y)),
            Self::Proj {
                source,
                target,
                source_geographic,
                target_geographic,
            } => {
                let mut point = if *source_geographic {
                    (x.to_radians(), y.to_radians(), 0.0)
                } else {
                    (x, y, 0.0)
                };
                transform(source, target, &mut point)
                    .map_err(|e| DetectError::Crs(format!("transform failed: {e:?}")))?;
                if *target_geographic {
                    Ok((point.0.to_degrees(), point.1.to_degrees()))
                } else {
                    Ok((point.0, point.1))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Georeferencer
// ---------------------------------------------------------------------------

/// Geographic bounding box (degrees).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeoBounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

/// Maps raster pixels to lat/lon and back for one raster.
pub struct Georeferencer {
    epsg: u32,
    forward: AffineTransform,
    inverse: AffineTransform,
    to_lonlat: CrsTransformer,
    from_lonlat: CrsTransformer,
}

impl fmt::Debug for Georeferencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Georeferencer")
            .field("epsg", &self.epsg)
            .field("forward", &self.forward)
            .finish()
    }
}

impl Georeferencer {
    pub fn new(transform: AffineTransform, epsg: u32) -> Result<Self, DetectError> {
        let inverse = transform
            .inverse()
            .ok_or_else(|| DetectError::Crs(format!("singular affine transform {:?}", transform.c)))?;
        Ok(Self {
            epsg,
            forward: transform,
            inverse,
            to_lonlat: CrsTransformer::new(epsg, EPSG_WGS84)?,
            from_lonlat: CrsTransformer::new(EPSG_WGS84, epsg)?,
        })
    }

    pub fn epsg(&self) -> u32 {
        self.epsg
    }

    pub fn transform(&self) -> &AffineTransform {
        &self.forward
    }

    /// Continuous pixel `(col, row)` → map coordinates in the raster CRS.
    pub fn pixel_to_map(&self, col: f64, row: f64) -> (f64, f64) {
        self.forward.apply(col, row)
    }

    /// Map coordinates → continuous pixel `(col, row)`.
    pub fn map_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        self.inverse.apply(x, y)
    }

    /// Continuous pixel `(col, row)` → `(lat, lon)`.
    pub fn pixel_to_latlon(&self, col: f64, row: f64) -> Result<(f64, f64), DetectError> {
        let (x, y) = self.pixel_to_map(col, row);
        let (lon, lat) = self.to_lonlat.transform(x, y)?;
        Ok((lat, lon))
    }

    /// `(lon, lat)` → continuous pixel `(col, row)`.
    pub fn lonlat_to_pixel(&self, lon: f64, lat: f64) -> Result<(f64, f64), DetectError> {
        let (x, y) = self.from_lonlat.transform(lon, lat)?;
        Ok(self.map_to_pixel(x, y))
    }

    /// Centre of the tile-local pixel `(row, col)` of a window whose top-left
    /// sits at raster pixel `(row_off, col_off)`, as `(lat, lon)`.
    pub fn tile_pixel_to_latlon(
        &self,
        row_off: usize,
        col_off: usize,
        row: usize,
        col: usize,
    ) -> Result<(f64, f64), DetectError> {
        let abs_row = (row_off + row) as f64 + 0.5;
        let abs_col = (col_off + col) as f64 + 0.5;
        self.pixel_to_latlon(abs_col, abs_row)
    }

    /// Lon/lat bounding box of a `width` x `height` raster.
    pub fn bounds(&self, width: usize, height: usize) -> Result<GeoBounds, DetectError> {
        let (w, h) = (width as f64, height as f64);
        let mut b = GeoBounds {
            min_lon: f64::INFINITY,
            min_lat: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for (col, row) in [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)] {
            let (lat, lon) = self.pixel_to_latlon(col, row)?;
            b.min_lon = b.min_lon.min(lon);
            b.max_lon = b.max_lon.max(lon);
            b.min_lat = b.min_lat.min(lat);
            b.max_lat = b.max_lat.max(lat);
        }
        Ok(b)
    }

    /// Ground size of one pixel step along each axis (m) at the raster centre.
    ///
    /// Projected CRS: length of the affine column / row vectors. Geographic
    /// CRS: degrees converted with metres per degree, east components scaled
    /// by cos(lat). Web Mercator is scaled back by cos(lat).
    pub fn pixel_scale(&self, width: usize, height: usize) -> Result<PixelScale, DetectError> {
        let (lat, _) = self.pixel_to_latlon(width as f64 / 2.0, height as f64 / 2.0)?;
        let cos_lat = lat.to_radians().cos();
        let c = &self.forward.c;
        let (x_m, y_m) = if is_geographic(self.epsg) {
            let step = |east: f64, north: f64| {
                (east * METERS_PER_DEGREE * cos_lat).hypot(north * METERS_PER_DEGREE)
            };
            (step(c[1], c[4]), step(c[2], c[5]))
        } else if self.epsg == EPSG_WEB_MERCATOR {
            (c[1].hypot(c[4]) * cos_lat, c[2].hypot(c[5]) * cos_lat)
        } else {
            (c[1].hypot(c[4]), c[2].hypot(c[5]))
        };
        PixelScale::new(x_m, y_m)
    }

    /// Ground sample distance (m/px) at the raster centre: geometric mean of
    /// the two axes of [`Georeferencer::pixel_scale`].
    pub fn ground_sample_distance(&self, width: usize, height: usize) -> Result<f64, DetectError> {
        Ok(self.pixel_scale(width, height)?.mean())
    }
}

// ---------------------------------------------------------------------------
// PixelScale
// ---------------------------------------------------------------------------

/// Metres on the ground per pixel step, per axis. Geographic rasters with
/// equal-degree pixels are narrower east-west than north-south.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PixelScale {
    /// Metres per column step.
    pub x_m: f64,
    /// Metres per row step.
    pub y_m: f64,
}

impl PixelScale {
    pub fn new(x_m: f64, y_m: f64) -> Result<Self, DetectError> {
        if x_m.is_finite() && y_m.is_finite() && x_m > 0.0 && y_m > 0.0 {
            Ok(Self { x_m, y_m })
        } else {
            Err(DetectError::Crs(format!("invalid pixel size {x_m} x {y_m} m")))
        }
    }

    /// Same size on both axes.
    pub fn square(gsd_m: f64) -> Self {
        Self { x_m: gsd_m, y_m: gsd_m }
    }

    /// Geometric mean of the two axes.
    pub fn mean(&self) -> f64 {
        (self.x_m * self.y_m).sqrt()
    }

    pub fn finest(&self) -> f64 {
        self.x_m.min(self.y_m)
    }

    /// Ground area of one pixel (m²).
    pub fn pixel_area_m2(&self) -> f64 {
        self.x_m * self.y_m
    }

    /// Squared ground distance (m²) of a `(rows, cols)` pixel offset.
    #[inline]
    pub fn distance_sq_m(&self, drow: f64, dcol: f64) -> f64 {
        (drow * self.y_m).powi(2) + (dcol * self.x_m).powi(2)
    }

    /// Pixel half-extents `(rows, cols)` of a ground disc of `radius_m`.
    pub fn reach_px(&self, radius_m: f64) -> (isize, isize) {
        let r = (radius_m / self.y_m).ceil().max(0.0) as isize;
        let c = (radius_m / self.x_m).ceil().max(0.0) as isize;
        (r, c)
    }
}
