//! Evaluation of detections against labelled ground-truth positions.
//!
//! Both point sets are projected onto a local plane in metres (equirectangular,
//! latitude-corrected at the centroid), predictions are indexed in a k-d tree,
//! and every label claims its nearest unclaimed prediction within the match
//! radius, in label order.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::geo::METERS_PER_DEGREE;
use crate::spatial::{KdTree, SpatialIndex};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// A matched pair of label and prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    /// 0-based index into the labels.
    pub label_idx: usize,
    /// 0-based index into the predictions.
    pub prediction_idx: usize,
    /// Planar distance between the pair (m).
    pub distance_m: f64,
}

/// Detection statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub true_detections: usize,
    pub false_detections: usize,
    pub omissions: usize,
}

/// Outcome of one evaluation. Computed on demand, never stored with a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub label_count: usize,
    pub prediction_count: usize,
    pub matched_count: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Mean distance of matched pairs; `None` without matches.
    pub mean_match_distance_m: Option<f64>,
    pub match_radius_m: f64,
    pub stats: DetectionStats,
}

// ---------------------------------------------------------------------------
// LocalPlane
// ---------------------------------------------------------------------------

/// Equirectangular projection around a reference latitude/longitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalPlane {
    lon0: f64,
    lat0: f64,
    m_per_deg_lon: f64,
}

impl LocalPlane {
    pub fn new(lon0: f64, lat0: f64) -> Self {
        Self {
            lon0,
            lat0,
            m_per_deg_lon: METERS_PER_DEGREE * lat0.to_radians().cos(),
        }
    }

    /// Plane centred on the mean position of all given points.
    pub fn around<'a>(points: impl IntoIterator<Item = &'a GeoPoint>) -> Self {
        let (mut slon, mut slat, mut n) = (0.0, 0.0, 0usize);
        for p in points {
            slon += p.lon;
            slat += p.lat;
            n += 1;
        }
        if n == 0 {
            return Self::new(0.0, 0.0);
        }
        Self::new(slon / n as f64, slat / n as f64)
    }

    /// `[east, north]` in metres.
    pub fn project(&self, p: &GeoPoint) -> [f64; 2] {
        [
            (p.lon - self.lon0) * self.m_per_deg_lon,
            (p.lat - self.lat0) * METERS_PER_DEGREE,
        ]
    }
}

// ---------------------------------------------------------------------------
// match_detections
// ---------------------------------------------------------------------------

/// One-to-one greedy matching from the labels' side.
///
/// Labels are visited in order; each claims the nearest prediction within
/// `radius_m` that no earlier label has claimed.
pub fn match_detections(labels: &[GeoPoint], predictions: &[GeoPoint], radius_m: f64) -> Vec<MatchedPair> {
    if labels.is_empty() || predictions.is_empty() {
        return Vec::new();
    }
    let plane = LocalPlane::around(labels.iter().chain(predictions.iter()));
    let projected: Vec<[f64; 2]> = predictions.iter().map(|p| plane.project(p)).collect();
    let index = KdTree::build(&projected);
    match_with_index(labels, &plane, &index, radius_m)
}

/// Matching against any spatial index built over projected predictions.
pub fn match_with_index<I: SpatialIndex>(
    labels: &[GeoPoint],
    plane: &LocalPlane,
    index: &I,
    radius_m: f64,
) -> Vec<MatchedPair> {
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut matched = Vec::new();
    for (label_idx, label) in labels.iter().enumerate() {
        let q = plane.project(label);
        let hit = index
            .within_radius(q, radius_m)
            .into_iter()
            .find(|(i, _)| !claimed.contains(i));
        if let Some((prediction_idx, distance_m)) = hit {
            claimed.insert(prediction_idx);
            matched.push(MatchedPair {
                label_idx,
                prediction_idx,
                distance_m,
            });
        }
    }
    matched
}

// ---------------------------------------------------------------------------
// hist_detection / evaluate
// ---------------------------------------------------------------------------

/// True detections, omissions (unmatched labels) and false detections
/// (unmatched predictions).
pub fn hist_detection(label_count: usize, prediction_count: usize, matched: &[MatchedPair]) -> DetectionStats {
    let matched_labels: HashSet<usize> = matched.iter().map(|m| m.label_idx).collect();
    let matched_predictions: HashSet<usize> = matched.iter().map(|m| m.prediction_idx).collect();
    DetectionStats {
        true_detections: matched.len(),
        false_detections: prediction_count.saturating_sub(matched_predictions.len()),
        omissions: label_count.saturating_sub(matched_labels.len()),
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Precision, recall and F1 of `predictions` against `labels`. Empty sets
/// give 0.0 scores.
pub fn evaluate(labels: &[GeoPoint], predictions: &[GeoPoint], match_radius_m: f64) -> EvaluationResult {
    let matched = match_detections(labels, predictions, match_radius_m);
    let stats = hist_detection(labels.len(), predictions.len(), &matched);
    let precision = ratio(matched.len(), predictions.len());
    let recall = ratio(matched.len(), labels.len());
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    let mean_match_distance_m = (!matched.is_empty())
        .then(|| matched.iter().map(|m| m.distance_m).sum::<f64>() / matched.len() as f64);

    EvaluationResult {
        label_count: labels.len(),
        prediction_count: predictions.len(),
        matched_count: matched.len(),
        precision,
        recall,
        f1,
        mean_match_distance_m,
        match_radius_m,
        stats,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
