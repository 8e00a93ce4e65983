//! Field boundary polygons: GeoJSON parsing, reprojection into pixel space,
//! point-in-polygon masking and clipped area.

use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::BoundaryError;
use crate::geo::Georeferencer;

/// Outer ring of a field, as `(lon, lat)` vertices. The ring is stored open
/// (no repeated closing vertex).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldBoundary {
    ring: Vec<(f64, f64)>,
}

impl FieldBoundary {
    pub fn new(mut ring: Vec<(f64, f64)>) -> Result<Self, BoundaryError> {
        if let Some(index) = ring.iter().position(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(BoundaryError::NonFinite { index });
        }
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        ring.dedup();
        if ring.len() < 3 {
            return Err(BoundaryError::DegenerateRing(ring.len()));
        }
        Ok(Self { ring })
    }

    pub fn ring(&self) -> &[(f64, f64)] {
        &self.ring
    }

    /// Parse a `Polygon`, `MultiPolygon` (first polygon), `Feature` or
    /// `FeatureCollection` (first polygonal feature). Holes are ignored.
    pub fn from_geojson_str(text: &str) -> Result<Self, BoundaryError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| BoundaryError::Malformed(e.to_string()))?;
        Self::from_geojson_value(&value)
    }

    pub fn from_geojson_file(path: &Path) -> Result<Self, BoundaryError> {
        let text = fs::read_to_string(path)
            .map_err(|e| BoundaryError::Malformed(format!("{}: {e}", path.display())))?;
        Self::from_geojson_str(&text)
    }

    fn from_geojson_value(value: &Value) -> Result<Self, BoundaryError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BoundaryError::Malformed("missing \"type\"".into()))?;
        match kind {
            "FeatureCollection" => {
                let features = value
                    .get("features")
                    .and_then(Value::as_array)
                    .ok_or_else(|| BoundaryError::Malformed("missing \"features\"".into()))?;
                features
                    .iter()
                    .filter_map(|f| f.get("geometry"))
                    .find(|g| {
                        matches!(
                            g.get("type").and_then(Value::as_str),
                            Some("Polygon" | "MultiPolygon")
                        )
                    })
                    .ok_or_else(|| BoundaryError::UnsupportedGeometry("FeatureCollection".into()))
                    .and_then(Self::from_geojson_value)
            }
            "Feature" => value
                .get("geometry")
                .ok_or_else(|| BoundaryError::Malformed("feature without geometry".into()))
                .and_then(Self::from_geojson_value),
            "Polygon" => {
                let ring = value.pointer("/coordinates/0").ok_or_else(|| {
                    BoundaryError::Malformed("polygon without outer ring".into())
                })?;
                Self::new(parse_ring(ring)?)
            }
            "MultiPolygon" => {
                let ring = value.pointer("/coordinates/0/0").ok_or_else(|| {
                    BoundaryError::Malformed("multipolygon without outer ring".into())
                })?;
                Self::new(parse_ring(ring)?)
            }
            other => Err(BoundaryError::UnsupportedGeometry(other.to_string())),
        }
    }

    /// Reproject the ring into continuous raster pixel coordinates `(col, row)`.
    pub fn to_pixel_polygon(&self, geo: &Georeferencer) -> Result<Vec<(f64, f64)>, BoundaryError> {
        self.ring
            .iter()
            .map(|&(lon, lat)| {
                geo.lonlat_to_pixel(lon, lat)
                    .map_err(|e| BoundaryError::Reprojection(e.to_string()))
            })
            .collect()
    }
}

fn parse_ring(ring: &Value) -> Result<Vec<(f64, f64)>, BoundaryError> {
    let coords = ring
        .as_array()
        .ok_or_else(|| BoundaryError::Malformed("ring is not an array".into()))?;
    coords
        .iter()
        .map(|pos| {
            let x = pos.get(0).and_then(Value::as_f64);
            let y = pos.get(1).and_then(Value::as_f64);
            x.zip(y)
                .ok_or_else(|| BoundaryError::Malformed(format!("bad position {pos}")))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Polygon helpers (pixel space)
// ---------------------------------------------------------------------------

/// Even–odd rule point-in-polygon test.
pub fn point_in_polygon(poly: &[(f64, f64)], x: f64, y: f64) -> bool {
    let n = poly.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = poly[i];
        let (xj, yj) = poly[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Shoelace area (absolute).
pub fn polygon_area(poly: &[(f64, f64)]) -> f64 {
    let n = poly.len();
    if n < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..n {
        let (x1, y1) = poly[i];
        let (x2, y2) = poly[(i + 1) % n];
        sum += x1 * y2 - x2 * y1;
    }
    sum.abs() / 2.0
}

/// Axis-aligned bounds `(xmin, ymin, xmax, ymax)`.
pub fn polygon_bounds(poly: &[(f64, f64)]) -> (f64, f64, f64, f64) {
    poly.iter().fold(
        (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        |(x0, y0, x1, y1), &(x, y)| (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
    )
}

/// Sutherland–Hodgman clip against the rectangle `[xmin, xmax] x [ymin, ymax]`.
pub fn clip_to_rect(
    poly: &[(f64, f64)],
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
) -> Vec<(f64, f64)> {
    // Each edge: inside test and intersection with the clip line.
    type Inside = fn(f64, f64, f64) -> bool;
    let edges: [(Inside, bool, f64); 4] = [
        (|x, _, v| x >= v, true, xmin),
        (|x, _, v| x <= v, true, xmax),
        (|_, y, v| y >= v, false, ymin),
        (|_, y, v| y <= v, false, ymax),
    ];

    let mut output = poly.to_vec();
    for (inside, vertical, v) in edges {
        if output.is_empty() {
            break;
        }
        let input = std::mem::take(&mut output);
        let n = input.len();
        for i in 0..n {
            let cur = input[i];
            let prev = input[(i + n - 1) % n];
            let cur_in = inside(cur.0, cur.1, v);
            let prev_in = inside(prev.0, prev.1, v);
            let cross = || {
                if vertical {
                    let t = (v - prev.0) / (cur.0 - prev.0);
                    (v, prev.1 + t * (cur.1 - prev.1))
                } else {
                    let t = (v - prev.1) / (cur.1 - prev.1);
                    (prev.0 + t * (cur.0 - prev.0), v)
                }
            };
            if cur_in {
                if !prev_in {
                    output.push(cross());
                }
                output.push(cur);
            } else if prev_in {
                output.push(cross());
            }
        }
    }
    output
}
