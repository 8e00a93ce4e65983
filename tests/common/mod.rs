#![allow(dead_code)]

use std::fs::File;
use std::io::{Seek, Write};
use std::path::Path;

use orchardtree::evaluation::{GeoPoint, LocalPlane};
use orchardtree::source::RasterSource;
use orchardtree::synthetic::SyntheticScene;
use orchardtree::DetectedTree;
use tiff::encoder::{colortype, DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;

/// Upper-left corner of the UTM fixtures (EPSG:32610, around Davis, CA).
pub const UTM_ORIGIN: (f64, f64) = (609_000.0, 4_262_000.0);
pub const UTM_EPSG: u16 = 32610;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Write the scene's bands as a float GeoTIFF in UTM zone 10N with the
/// scene's GSD. Strips of 16 rows. A four-band scene is written as RGB plus
/// an unspecified extra sample (NIR, not alpha).
pub fn write_utm_geotiff(scene: &SyntheticScene, path: &Path) {
    let image = scene.source.image();
    let (w, h) = (image.width as u32, image.height as u32);
    let bands = scene.source.bands();
    let band_count = bands.len().min(4);
    let mut data = Vec::with_capacity(image.width * image.height * band_count);
    for r in 0..image.height {
        for c in 0..image.width {
            for band in bands.iter().take(band_count) {
                data.push(band.get(r, c) as f32);
            }
        }
    }

    let file = File::create(path).unwrap();
    let mut encoder = TiffEncoder::new(file).unwrap();
    if band_count == 4 {
        let mut img = encoder.new_image::<colortype::RGBA32Float>(w, h).unwrap();
        img.encoder().write_tag(Tag::ExtraSamples, 0u16).unwrap();
        write_utm_tags(img.encoder(), image.gsd_m);
        img.rows_per_strip(16).unwrap();
        img.write_data(&data).unwrap();
    } else {
        let mut img = encoder.new_image::<colortype::RGB32Float>(w, h).unwrap();
        write_utm_tags(img.encoder(), image.gsd_m);
        img.rows_per_strip(16).unwrap();
        img.write_data(&data).unwrap();
    }
}

fn write_utm_tags<W: Write + Seek, K: TiffKind>(dir: &mut DirectoryEncoder<'_, W, K>, gsd: f64) {
    dir.write_tag(Tag::ModelPixelScaleTag, &[gsd, gsd, 0.0][..]).unwrap();
    dir.write_tag(
        Tag::ModelTiepointTag,
        &[0.0, 0.0, 0.0, UTM_ORIGIN.0, UTM_ORIGIN.1, 0.0][..],
    )
    .unwrap();
    dir.write_tag(Tag::GeoKeyDirectoryTag, &[1u16, 1, 0, 1, 3072, 0, 1, UTM_EPSG][..])
        .unwrap();
}

/// Smallest pairwise planar distance (m) between detections.
pub fn min_pairwise_distance_m(trees: &[DetectedTree]) -> f64 {
    let points: Vec<GeoPoint> = trees.iter().map(|t| GeoPoint::new(t.lon, t.lat)).collect();
    let plane = LocalPlane::around(points.iter());
    let xy: Vec<[f64; 2]> = points.iter().map(|p| plane.project(p)).collect();
    let mut best = f64::INFINITY;
    for i in 0..xy.len() {
        for j in i + 1..xy.len() {
            let d = ((xy[i][0] - xy[j][0]).powi(2) + (xy[i][1] - xy[j][1]).powi(2)).sqrt();
            best = best.min(d);
        }
    }
    best
}

/// Pixel distance from a detection to the nearest planted crown.
pub fn distance_to_planted(scene: &SyntheticScene, tree: &DetectedTree) -> f64 {
    scene
        .trees
        .iter()
        .map(|t| ((t.row - tree.pixel_row as f64).powi(2) + (t.col - tree.pixel_col as f64).powi(2)).sqrt())
        .fold(f64::INFINITY, f64::min)
}
