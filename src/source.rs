//! Raster sources: image metadata and bounded window reads.
//!
//! [`RasterSource`] is the only seam between the detection algorithm and the
//! storage backend. [`GeoTiffSource`] reads GeoTIFF strips/tiles on demand;
//! [`MemorySource`] serves bands already in memory.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::ColorType;

use crate::error::DetectError;
use crate::geo::{AffineTransform, GeoBounds, Georeferencer, PixelScale, EPSG_WGS84};
use crate::raster::{PixelWindow, Raster, WindowData};

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Zero-based band indices of the colour channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandLayout {
    pub red: usize,
    pub green: usize,
    pub blue: usize,
    pub nir: Option<usize>,
}

impl BandLayout {
    /// Layout guessed from the band count: R,G,B[,NIR]. A fourth band is taken
    /// as near-infrared unless it is an alpha channel.
    pub fn for_band_count(band_count: usize, has_alpha: bool) -> Self {
        match band_count {
            0 | 1 => Self {
                red: 0,
                green: 0,
                blue: 0,
                nir: None,
            },
            2 => Self {
                red: 0,
                green: 1,
                blue: 1,
                nir: None,
            },
            n => Self {
                red: 0,
                green: 1,
                blue: 2,
                nir: (n >= 4 && !has_alpha).then_some(3),
            },
        }
    }

    pub fn has_nir(&self) -> bool {
        self.nir.is_some()
    }

    fn max_index(&self) -> usize {
        self.red
            .max(self.green)
            .max(self.blue)
            .max(self.nir.unwrap_or(0))
    }
}

/// Immutable description of a georeferenced raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceImage {
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
    pub layout: BandLayout,
    /// Ground sample distance (m/px), geometric mean of `pixel_scale`.
    pub gsd_m: f64,
    /// Ground size of a pixel step along each axis.
    pub pixel_scale: PixelScale,
    pub epsg: u32,
    /// GDAL-ordered affine coefficients (pixel → CRS).
    pub transform: [f64; 6],
    pub bounds: GeoBounds,
}

impl SourceImage {
    /// Build the description, deriving bounds and (unless given) the pixel
    /// size. An override makes pixels square.
    pub fn new(
        width: usize,
        height: usize,
        band_count: usize,
        layout: BandLayout,
        transform: AffineTransform,
        epsg: u32,
        gsd_override: Option<f64>,
    ) -> Result<Self, DetectError> {
        if width == 0 || height == 0 {
            return Err(DetectError::EmptyExtent { width, height });
        }
        if band_count == 0 || layout.max_index() >= band_count {
            return Err(DetectError::UnsupportedRaster(format!(
                "band layout {layout:?} does not fit {band_count} band(s)"
            )));
        }
        let geo = Georeferencer::new(transform, epsg)?;
        let pixel_scale = match gsd_override {
            Some(g) if g.is_finite() && g > 0.0 => PixelScale::square(g),
            Some(g) => return Err(DetectError::Crs(format!("invalid GSD override {g}"))),
            None => geo.pixel_scale(width, height)?,
        };
        Ok(Self {
            width,
            height,
            band_count,
            layout,
            gsd_m: pixel_scale.mean(),
            pixel_scale,
            epsg,
            transform: transform.c,
            bounds: geo.bounds(width, height)?,
        })
    }

    pub fn has_nir(&self) -> bool {
        self.layout.has_nir()
    }

    pub fn affine(&self) -> AffineTransform {
        AffineTransform::new(self.transform)
    }

    pub fn georeferencer(&self) -> Result<Georeferencer, DetectError> {
        Georeferencer::new(self.affine(), self.epsg)
    }

    pub fn full_window(&self) -> PixelWindow {
        PixelWindow::full(self.width, self.height)
    }
}

/// Bounded read access to a raster. Implementations are shared read-only
/// between worker threads.
pub trait RasterSource: Send + Sync {
    fn image(&self) -> &SourceImage;

    /// Pixel data of exactly `window`, one raster per band.
    fn read_window(&self, window: PixelWindow) -> Result<WindowData, DetectError>;

    /// Short human-readable description (file path, "memory", ...).
    fn describe(&self) -> String;
}

fn check_window(image: &SourceImage, window: PixelWindow) -> Result<(), DetectError> {
    if window.is_empty() || !window.fits_in(image.width, image.height) {
        return Err(DetectError::WindowOutOfBounds {
            window: window.to_string(),
            width: image.width,
            height: image.height,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// Raster held fully in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    image: SourceImage,
    bands: Vec<Raster>,
}

impl MemorySource {
    pub fn new(image: SourceImage, bands: Vec<Raster>) -> Result<Self, DetectError> {
        if bands.len() != image.band_count
            || bands
                .iter()
                .any(|b| b.nrow != image.height || b.ncol != image.width)
        {
            return Err(DetectError::UnsupportedRaster(format!(
                "expected {} band(s) of {}x{}",
                image.band_count, image.width, image.height
            )));
        }
        Ok(Self { image, bands })
    }

    pub fn bands(&self) -> &[Raster] {
        &self.bands
    }
}

impl RasterSource for MemorySource {
    fn image(&self) -> &SourceImage {
        &self.image
    }

    fn read_window(&self, window: PixelWindow) -> Result<WindowData, DetectError> {
        check_window(&self.image, window)?;
        let bands = self
            .bands
            .iter()
            .map(|b| b.crop(window.row_off, window.col_off, window.height, window.width))
            .collect();
        Ok(WindowData { window, bands })
    }

    fn describe(&self) -> String {
        format!("memory {}x{}", self.image.width, self.image.height)
    }
}

// ---------------------------------------------------------------------------
// GeoTiffSource
// ---------------------------------------------------------------------------

/// Options applied when opening a GeoTIFF.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Replace the layout guessed from the band count.
    pub layout: Option<BandLayout>,
    /// Replace the GSD derived from the transform.
    pub gsd_m: Option<f64>,
}

/// GeoTIFF read strip-by-strip or tile-by-tile; only the chunks intersecting
/// a requested window are decoded.
pub struct GeoTiffSource {
    path: PathBuf,
    image: SourceImage,
    samples_per_pixel: usize,
    chunk_width: usize,
    chunk_height: usize,
    decoder: Mutex<Decoder<BufReader<File>>>,
}

impl std::fmt::Debug for GeoTiffSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoTiffSource")
            .field("path", &self.path)
            .field("image", &self.image)
            .finish()
    }
}

impl GeoTiffSource {
    pub fn open(path: &Path, options: &OpenOptions) -> Result<Self, DetectError> {
        let open_err = |reason: String| DetectError::RasterOpen {
            path: path.to_path_buf(),
            reason,
        };
        let file = File::open(path).map_err(|e| open_err(e.to_string()))?;
        let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| open_err(e.to_string()))?;

        let (width, height) = decoder.dimensions().map_err(|e| open_err(e.to_string()))?;
        let colortype = decoder.colortype().map_err(|e| open_err(e.to_string()))?;
        let samples_per_pixel = samples_for(colortype);

        if let Ok(Some(planar)) = decoder.find_tag(Tag::PlanarConfiguration) {
            if planar.into_u32().unwrap_or(1) != 1 {
                return Err(DetectError::UnsupportedRaster(
                    "planar (band-separate) TIFF layout".into(),
                ));
            }
        }

        let transform = geotiff_transform(&mut decoder);
        let epsg = geotiff_epsg(&mut decoder);

        let has_alpha = samples_per_pixel >= 4 && extra_sample_is_alpha(&mut decoder);
        let layout = options
            .layout
            .unwrap_or_else(|| BandLayout::for_band_count(samples_per_pixel, has_alpha));
        let image = SourceImage::new(
            width as usize,
            height as usize,
            samples_per_pixel,
            layout,
            transform,
            epsg,
            options.gsd_m,
        )?;

        let (cw, ch) = decoder.chunk_dimensions();
        info!(
            "opened {}: {}x{} px, {} band(s), EPSG:{}, GSD {:.3} m, chunks {}x{}",
            path.display(),
            image.width,
            image.height,
            image.band_count,
            image.epsg,
            image.gsd_m,
            cw,
            ch
        );

        Ok(Self {
            path: path.to_path_buf(),
            image,
            samples_per_pixel,
            chunk_width: cw.max(1) as usize,
            chunk_height: ch.max(1) as usize,
            decoder: Mutex::new(decoder),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RasterSource for GeoTiffSource {
    fn image(&self) -> &SourceImage {
        &self.image
    }

    fn read_window(&self, window: PixelWindow) -> Result<WindowData, DetectError> {
        check_window(&self.image, window)?;
        let read_err = |reason: String| DetectError::WindowRead {
            window: window.to_string(),
            reason,
        };

        let spp = self.samples_per_pixel;
        let (cw, ch) = (self.chunk_width, self.chunk_height);
        let chunks_across = self.image.width.div_ceil(cw);
        let mut bands = vec![Raster::new(window.height, window.width, f64::NAN); spp];

        let mut decoder = self
            .decoder
            .lock()
            .map_err(|_| read_err("decoder lock poisoned".into()))?;

        let first_chunk_row = window.row_off / ch;
        let last_chunk_row = (window.row_end() - 1) / ch;
        let first_chunk_col = window.col_off / cw;
        let last_chunk_col = (window.col_end() - 1) / cw;

        for chunk_row in first_chunk_row..=last_chunk_row {
            for chunk_col in first_chunk_col..=last_chunk_col {
                let index = (chunk_row * chunks_across + chunk_col) as u32;
                let samples = decoding_to_f64(
                    decoder
                        .read_chunk(index)
                        .map_err(|e| read_err(format!("chunk {index}: {e}")))?,
                )
                .ok_or_else(|| read_err("unsupported sample format".into()))?;

                let (_, data_h) = decoder.chunk_data_dimensions(index);
                let data_h = (data_h as usize).max(1);
                // Edge tiles may be padded to the full tile width.
                let stride = samples.len() / (data_h * spp);

                let chunk_r0 = chunk_row * ch;
                let chunk_c0 = chunk_col * cw;
                let r_start = window.row_off.max(chunk_r0);
                let r_end = window.row_end().min(chunk_r0 + data_h);
                let c_start = window.col_off.max(chunk_c0);
                let c_end = window.col_end().min(chunk_c0 + stride);

                for r in r_start..r_end {
                    let src_row = (r - chunk_r0) * stride;
                    for c in c_start..c_end {
                        let src = (src_row + (c - chunk_c0)) * spp;
                        for (b, band) in bands.iter_mut().enumerate() {
                            band.set(r - window.row_off, c - window.col_off, samples[src + b]);
                        }
                    }
                }
            }
        }
        debug!("read window {} from {}", window, self.path.display());
        Ok(WindowData { window, bands })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// ExtraSamples (338): 1 is associated and 2 unassociated alpha. A fourth
/// band marked 0, or left unmarked, stays a data band.
fn extra_sample_is_alpha<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> bool {
    match decoder.find_tag(Tag::ExtraSamples) {
        Ok(Some(value)) => value
            .into_u32_vec()
            .map(|kinds| is_alpha_kind(&kinds))
            .unwrap_or(false),
        _ => false,
    }
}

fn is_alpha_kind(kinds: &[u32]) -> bool {
    matches!(kinds.first(), Some(1) | Some(2))
}

fn samples_for(colortype: ColorType) -> usize {
    match colortype {
        ColorType::Gray(_) => 1,
        ColorType::GrayA(_) => 2,
        ColorType::RGB(_) | ColorType::YCbCr(_) => 3,
        ColorType::RGBA(_) | ColorType::CMYK(_) => 4,
        ColorType::CMYKA(_) => 5,
        ColorType::Multiband { num_samples, .. } => num_samples as usize,
        _ => 1,
    }
}

fn decoding_to_f64(result: DecodingResult) -> Option<Vec<f64>> {
    Some(match result {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        #[allow(unreachable_patterns)]
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// GeoTIFF tags
// ---------------------------------------------------------------------------

/// Affine transform from `ModelTransformationTag` (34264), or from
/// `ModelPixelScaleTag` (33550) + `ModelTiepointTag` (33922). Missing tags
/// fall back to a unit north-up grid.
fn geotiff_transform<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
) -> AffineTransform {
    if let Ok(Some(value)) = decoder.find_tag(Tag::ModelTransformationTag) {
        if let Ok(m) = value.into_f64_vec() {
            if m.len() >= 8 {
                return AffineTransform::new([m[3], m[0], m[1], m[7], m[4], m[5]]);
            }
        }
    }

    let mut scale = None;
    let mut tiepoint = None;
    if let Ok(Some(value)) = decoder.find_tag(Tag::ModelPixelScaleTag) {
        if let Ok(s) = value.into_f64_vec() {
            if s.len() >= 2 {
                scale = Some((s[0], s[1]));
            }
        }
    }
    if let Ok(Some(value)) = decoder.find_tag(Tag::ModelTiepointTag) {
        if let Ok(t) = value.into_f64_vec() {
            if t.len() >= 6 {
                tiepoint = Some((t[0], t[1], t[3], t[4]));
            }
        }
    }

    let (sx, sy) = scale.unwrap_or_else(|| {
        warn!("ModelPixelScale tag (33550) missing, assuming 1.0 map unit per pixel");
        (1.0, 1.0)
    });
    let (i, j, x, y) = tiepoint.unwrap_or_else(|| {
        warn!("ModelTiepoint tag (33922) missing, assuming origin (0, 0)");
        (0.0, 0.0, 0.0, 0.0)
    });
    AffineTransform::north_up(x - i * sx, y + j * sy, sx, sy)
}

/// EPSG code from the GeoKey directory: ProjectedCSTypeGeoKey (3072) first,
/// then GeographicTypeGeoKey (2048). Defaults to EPSG:4326.
fn geotiff_epsg<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> u32 {
    let keys = match decoder.find_tag(Tag::GeoKeyDirectoryTag) {
        Ok(Some(value)) => value.into_u32_vec().unwrap_or_default(),
        _ => Vec::new(),
    };
    match epsg_from_geokeys(&keys) {
        Some(code) => code,
        None => {
            warn!("no EPSG code in GeoKeyDirectory, assuming EPSG:{EPSG_WGS84}");
            EPSG_WGS84
        }
    }
}

/// Parse a GeoKeyDirectory: 4-value header, then `(key, location, count, value)` entries.
pub(crate) fn epsg_from_geokeys(keys: &[u32]) -> Option<u32> {
    if keys.len() < 4 {
        return None;
    }
    let entries: Vec<&[u32]> = keys[4..].chunks_exact(4).collect();
    let lookup = |id: u32| {
        entries
            .iter()
            .find(|e| e[0] == id && e[1] == 0)
            .map(|e| e[3])
            .filter(|&code| code != 0 && code != 32767)
    };
    lookup(3072).or_else(|| lookup(2048))
}
