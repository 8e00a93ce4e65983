mod common;

use common::{distance_to_planted, init_logging, min_pairwise_distance_m, write_utm_geotiff};
use orchardtree::evaluation::{evaluate, GeoPoint};
use orchardtree::source::RasterSource;
use orchardtree::synthetic::SyntheticOrchard;
use orchardtree::{
    CsvRunStore, DetectionParameters, Detector, FieldBoundary, GeoTiffSource, IndexKind,
    MemoryRunStore, OpenOptions, RunStatus,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn detector(params: DetectionParameters) -> Detector {
    Detector::new(params).unwrap()
}

#[test]
fn ten_separated_crowns_are_found() {
    init_logging();
    let orchard = SyntheticOrchard::default();
    let scene = orchard.generate(&mut StdRng::seed_from_u64(2024)).unwrap();
    assert_eq!(scene.trees.len(), 10);

    let mut store = MemoryRunStore::default();
    let run = detector(DetectionParameters::default()).run_source("scenario-a", &scene.source, None, &mut store);

    assert_eq!(run.status(), RunStatus::Completed);
    let n = run.trees().len();
    assert!((8..=12).contains(&n), "found {n} trees");
    for t in run.trees() {
        assert!(distance_to_planted(&scene, t) <= 2.0, "tree {} off target", t.id);
    }
    let summary = run.summary().unwrap();
    assert_eq!(summary.tree_count, n);
    assert_eq!(summary.index, IndexKind::Exg);
    assert_eq!(summary.windows_processed, 1);
}

#[test]
fn ndvi_scene_is_found() {
    let orchard = SyntheticOrchard {
        with_nir: true,
        ..Default::default()
    };
    let scene = orchard.generate(&mut StdRng::seed_from_u64(99)).unwrap();
    let mut store = MemoryRunStore::default();
    let run = detector(DetectionParameters::default()).run_source("ndvi", &scene.source, None, &mut store);
    assert_eq!(run.summary().map(|s| s.index), Some(IndexKind::Ndvi));
    let n = run.trees().len();
    assert!((8..=12).contains(&n), "found {n} trees");
    for t in run.trees() {
        assert!(t.vegetation_index > 0.0 && t.vegetation_index <= 1.0);
    }
}

#[test]
fn all_zero_raster_completes_empty() {
    let orchard = SyntheticOrchard::default();
    let blank = orchard.blank().unwrap();
    let mut store = MemoryRunStore::default();
    let run = detector(DetectionParameters::default()).run_source("scenario-b", &blank, None, &mut store);
    assert_eq!(run.status(), RunStatus::Completed);
    assert!(run.trees().is_empty());
    assert_eq!(run.summary().map(|s| s.tree_count), Some(0));
    assert!(run.error_message().is_none());
}

#[test]
fn identical_points_score_perfectly() {
    let points: Vec<GeoPoint> = (0..5)
        .map(|i| GeoPoint::new(-121.75 + i as f64 * 1e-4, 38.55))
        .collect();
    let r = evaluate(&points, &points, 2.0);
    assert_eq!(r.precision, 1.0);
    assert_eq!(r.recall, 1.0);
    assert_eq!(r.match_radius_m, 2.0);
}

#[test]
fn no_labels_scores_zero() {
    let predictions: Vec<GeoPoint> = (0..7).map(|i| GeoPoint::new(10.0, 45.0 + i as f64 * 1e-4)).collect();
    let r = evaluate(&[], &predictions, 2.0);
    assert_eq!(r.precision, 0.0);
    assert_eq!(r.recall, 0.0);
    assert_eq!(r.prediction_count, 7);
}

#[test]
fn small_boundary_is_one_window() {
    let orchard = SyntheticOrchard::default();
    let scene = orchard.generate(&mut StdRng::seed_from_u64(5)).unwrap();
    let geo = scene.source.image().georeferencer().unwrap();
    let params = DetectionParameters {
        tile_size_px: 128,
        tile_overlap_px: 32,
        ..Default::default()
    };

    // Pixel rectangle cols 20..100, rows 30..130: narrower than one tile.
    let ring: Vec<(f64, f64)> = [(20.0, 30.0), (100.0, 30.0), (100.0, 130.0), (20.0, 130.0)]
        .iter()
        .map(|&(col, row)| {
            let (lat, lon) = geo.pixel_to_latlon(col, row).unwrap();
            (lon, lat)
        })
        .collect();
    let boundary = FieldBoundary::new(ring).unwrap();

    let mut store = MemoryRunStore::default();
    let d = detector(params);
    let run = d.run_source("scenario-e", &scene.source, Some(&boundary), &mut store);
    assert_eq!(run.status(), RunStatus::Completed);
    let summary = run.summary().unwrap();
    assert_eq!(summary.windows_processed, 1);
    assert!((summary.area_ha - 80.0 * 100.0 * 0.25 / 10_000.0).abs() < 1e-3);
    for t in run.trees() {
        assert!((30..130).contains(&t.pixel_row) && (20..100).contains(&t.pixel_col));
    }

    let full = d.run_source("full", &scene.source, None, &mut store);
    assert!(full.summary().unwrap().windows_processed > 1);
}

#[test]
fn spacing_and_diameter_hold_in_dense_orchard() {
    let orchard = SyntheticOrchard {
        tree_count: 120,
        sigma_px: (1.5, 3.0),
        min_separation_px: 5.0,
        margin_px: 4.0,
        ..Default::default()
    };
    let scene = orchard.generate(&mut StdRng::seed_from_u64(11)).unwrap();
    let params = DetectionParameters {
        tile_size_px: 100,
        tile_overlap_px: 40,
        ..Default::default()
    };
    let mut store = MemoryRunStore::default();
    let run = detector(params.clone()).run_source("dense", &scene.source, None, &mut store);
    assert_eq!(run.status(), RunStatus::Completed);
    assert!(run.trees().len() > 10);
    assert!(min_pairwise_distance_m(run.trees()) >= params.min_tree_spacing_m - 1e-3);

    let image = scene.source.image();
    for t in run.trees() {
        assert!(t.canopy_diameter_m >= params.min_canopy_diameter_m);
        assert!(t.canopy_diameter_m <= params.max_canopy_diameter_m);
        assert!((0.0..=1.0).contains(&t.confidence));
        assert!(t.pixel_row < image.height && t.pixel_col < image.width);
    }
    let ids: Vec<u32> = run.trees().iter().map(|t| t.id).collect();
    assert_eq!(ids, (1..=run.trees().len() as u32).collect::<Vec<_>>());
}

#[test]
fn tiled_run_matches_single_window() {
    let orchard = SyntheticOrchard::default();
    let scene = orchard.generate(&mut StdRng::seed_from_u64(31)).unwrap();
    let mut store = MemoryRunStore::default();
    let single = detector(DetectionParameters::default()).run_source("single", &scene.source, None, &mut store);
    let tiled = detector(DetectionParameters {
        tile_size_px: 96,
        tile_overlap_px: 48,
        ..Default::default()
    })
    .run_source("tiled", &scene.source, None, &mut store);

    assert!(tiled.summary().unwrap().windows_processed > 1);
    let n = tiled.trees().len();
    assert!((8..=12).contains(&n), "found {n} trees");
    for t in tiled.trees() {
        assert!(distance_to_planted(&scene, t) <= 2.0);
    }
    assert!((n as i64 - single.trees().len() as i64).abs() <= 1);
}

#[test]
fn rerun_is_identical() {
    let orchard = SyntheticOrchard {
        tree_count: 40,
        min_separation_px: 12.0,
        ..Default::default()
    };
    let scene = orchard.generate(&mut StdRng::seed_from_u64(8)).unwrap();
    let params = DetectionParameters {
        tile_size_px: 128,
        tile_overlap_px: 32,
        ..Default::default()
    };
    let mut store = MemoryRunStore::default();
    let a = detector(params.clone()).run_source("a", &scene.source, None, &mut store);
    let b = detector(params).run_source("b", &scene.source, None, &mut store);
    assert_eq!(a.trees(), b.trees());
    assert_eq!(store.runs().len(), 2);
}

#[test]
fn pixel_geo_pixel_round_trip() {
    let orchard = SyntheticOrchard::default();
    let scene = orchard.generate(&mut StdRng::seed_from_u64(1)).unwrap();
    let geo = scene.source.image().georeferencer().unwrap();
    for &(col, row) in &[(0.5, 0.5), (100.5, 37.5), (255.5, 255.5)] {
        let (lat, lon) = geo.pixel_to_latlon(col, row).unwrap();
        let (c, r) = geo.lonlat_to_pixel(lon, lat).unwrap();
        assert!((c - col).abs() < 1e-6 && (r - row).abs() < 1e-6);
    }
}

#[test]
fn geotiff_end_to_end() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orchard.tif");
    let orchard = SyntheticOrchard::default();
    let scene = orchard.generate(&mut StdRng::seed_from_u64(77)).unwrap();
    write_utm_geotiff(&scene, &path);

    let mut store = CsvRunStore::new(dir.path().join("runs"));
    let params = DetectionParameters {
        tile_size_px: 128,
        tile_overlap_px: 48,
        ..Default::default()
    };
    let run = detector(params).run_file("e2e", &path, &OpenOptions::default(), None, &mut store);
    assert_eq!(run.status(), RunStatus::Completed, "{:?}", run.error_message());
    let n = run.trees().len();
    assert!((8..=12).contains(&n), "found {n} trees");

    // Detections land on the planted crowns in lat/lon too.
    let source = GeoTiffSource::open(&path, &OpenOptions::default()).unwrap();
    assert_eq!(source.image().epsg, 32610);
    let geo = source.image().georeferencer().unwrap();
    let labels: Vec<GeoPoint> = scene
        .trees
        .iter()
        .map(|t| {
            let (lat, lon) = geo.pixel_to_latlon(t.col + 0.5, t.row + 0.5).unwrap();
            GeoPoint::new(lon, lat)
        })
        .collect();
    let predictions: Vec<GeoPoint> = run.trees().iter().map(|t| GeoPoint::new(t.lon, t.lat)).collect();
    let eval = evaluate(&labels, &predictions, 1.5);
    assert!(eval.recall >= 0.8, "{eval:?}");
    assert!(eval.precision >= 0.8, "{eval:?}");

    let loaded = store.load("e2e").unwrap();
    assert_eq!(loaded.trees(), run.trees());
    assert_eq!(loaded.status(), RunStatus::Completed);
}

#[test]
fn four_band_geotiff_uses_ndvi() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rgbn.tif");
    let orchard = SyntheticOrchard {
        with_nir: true,
        ..Default::default()
    };
    let scene = orchard.generate(&mut StdRng::seed_from_u64(123)).unwrap();
    write_utm_geotiff(&scene, &path);

    let source = GeoTiffSource::open(&path, &OpenOptions::default()).unwrap();
    assert_eq!(source.image().band_count, 4);
    assert!(source.image().has_nir());

    let mut store = MemoryRunStore::default();
    let run = detector(DetectionParameters::default()).run_file(
        "rgbn",
        &path,
        &OpenOptions::default(),
        None,
        &mut store,
    );
    assert_eq!(run.status(), RunStatus::Completed, "{:?}", run.error_message());
    assert_eq!(run.summary().map(|s| s.index), Some(IndexKind::Ndvi));
    let n = run.trees().len();
    assert!((8..=12).contains(&n), "found {n} trees");
}

#[test]
fn unreadable_file_fails_without_trees() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.tif");
    std::fs::write(&path, b"not a tiff").unwrap();
    let mut store = CsvRunStore::new(dir.path().join("runs"));
    let run = detector(DetectionParameters::default()).run_file(
        "broken",
        &path,
        &OpenOptions::default(),
        None,
        &mut store,
    );
    assert_eq!(run.status(), RunStatus::Failed);
    assert!(run.trees().is_empty());
    let stored = store.load("broken").unwrap();
    assert_eq!(stored.status(), RunStatus::Failed);
    assert!(stored.trees().is_empty());
}
