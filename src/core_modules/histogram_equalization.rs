// THEORY:
// Histogram equalization is the only method that needs no reference: it only spreads
// the source's own intensities. It produces four views of the same image so they can
// be compared side by side:
//
// - `original`:           the working [0, 1] image (grayscale by default).
// - `rescale`:            a contrast stretch that maps the 2nd..98th percentile onto [0, 1].
// - `equalize`:           global equalization. Each value is replaced by its position in
//                         the image's cumulative histogram.
// - `adaptive_equalize`:  CLAHE. The image is cut into an 8 x 8 grid of tiles, each tile
//                         gets its own clipped histogram mapping, and pixels blend the
//                         mappings of the four nearest tile centers so no seams appear.
//
// Every stage works on floats; the pipeline turns them into 8-bit images later. A stage
// whose input is flat (zero range) returns that input unchanged.

use crate::core_modules::color_math;
use crate::core_modules::image::{Image, to_u8};
use crate::core_modules::normalizer::{Method, Normalizer, NormalizerOutput};
use crate::error::{NormError, NormResult};
use tracing::debug;

/// Output names, in the order they are produced and stored.
pub const EQUALIZATION_NAMES: [&str; 4] = ["original", "rescale", "equalize", "adaptive_equalize"];

/// Bins of the global equalization histogram.
const EQUALIZE_BINS: usize = 256;
/// Tiles per axis for CLAHE.
const CLAHE_GRID: usize = 8;
/// Percentiles of the contrast stretch.
const STRETCH_PERCENTILES: (f64, f64) = (2.0, 98.0);

/// The four images produced by histogram equalization.
#[derive(Debug, Clone, PartialEq)]
pub struct EqualizationSet {
    pub original: Image<f32>,
    pub rescale: Image<f32>,
    pub equalize: Image<f32>,
    pub adaptive_equalize: Image<f32>,
}

impl EqualizationSet {
    /// Pairs each image with its name from `EQUALIZATION_NAMES`.
    pub fn into_named(self) -> [(&'static str, Image<f32>); 4] {
        [
            (EQUALIZATION_NAMES[0], self.original),
            (EQUALIZATION_NAMES[1], self.rescale),
            (EQUALIZATION_NAMES[2], self.equalize),
            (EQUALIZATION_NAMES[3], self.adaptive_equalize),
        ]
    }
}

pub struct HistogramEqualizer {
    /// Reduce RGB input to luminance first.
    grayscale: bool,
    /// CLAHE clip limit as a fraction of the tile area.
    clip_limit: f32,
}

impl HistogramEqualizer {
    pub fn new(grayscale: bool, clip_limit: f32) -> Self {
        Self {
            grayscale,
            clip_limit,
        }
    }

    /// Runs all three equalization stages on `source`.
    pub fn equalize_all(&self, source: &Image<u8>) -> NormResult<EqualizationSet> {
        if source.is_empty() {
            return Err(NormError::Numerical("cannot equalize an empty image".into()));
        }
        let float = source.to_float();
        let original = if self.grayscale { float.to_gray() } else { float };

        let rescale = contrast_stretch(&original)?;
        let equalize = equalize_global(&original);
        let adaptive_equalize = equalize_adaptive(&original, self.clip_limit);
        debug!(
            width = original.width(),
            height = original.height(),
            grayscale = self.grayscale,
            "Computed equalization stages"
        );
        Ok(EqualizationSet {
            original,
            rescale,
            equalize,
            adaptive_equalize,
        })
    }
}

impl Normalizer for HistogramEqualizer {
    fn method(&self) -> Method {
        Method::HistogramEqualization
    }

    fn fit(&mut self, _reference: Option<&Image<u8>>) -> NormResult<()> {
        Ok(())
    }

    fn transform(&self, source: &Image<u8>) -> NormResult<NormalizerOutput> {
        Ok(NormalizerOutput::Equalization(self.equalize_all(source)?))
    }
}

fn sample_range(image: &Image<f32>) -> (f32, f32) {
    image
        .data()
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Maps the 2nd..98th percentile range linearly onto [0, 1], clipping outside it.
fn contrast_stretch(image: &Image<f32>) -> NormResult<Image<f32>> {
    let mut samples: Vec<f64> = image.data().iter().map(|&v| v as f64).collect();
    samples.sort_by(|a, b| a.total_cmp(b));
    let low = color_math::percentile(&samples, STRETCH_PERCENTILES.0)?;
    let high = color_math::percentile(&samples, STRETCH_PERCENTILES.1)?;
    if high - low <= f64::EPSILON {
        return Ok(image.clone());
    }
    Ok(image.map(|v| ((v as f64 - low) / (high - low)).clamp(0.0, 1.0) as f32))
}

/// Global equalization: 256 bins over the observed range, values mapped through the
/// normalized CDF with linear interpolation between bin centers.
fn equalize_global(image: &Image<f32>) -> Image<f32> {
    let (low, high) = sample_range(image);
    let span = high - low;
    if span <= 0.0 || !span.is_finite() {
        return image.clone();
    }
    let width = span / EQUALIZE_BINS as f32;

    let mut histogram = [0u64; EQUALIZE_BINS];
    for &v in image.data() {
        let bin = (((v - low) / width) as usize).min(EQUALIZE_BINS - 1);
        histogram[bin] += 1;
    }
    let total = image.data().len() as f32;
    let mut cdf = [0f32; EQUALIZE_BINS];
    let mut running = 0u64;
    for (slot, count) in cdf.iter_mut().zip(histogram) {
        running += count;
        *slot = running as f32 / total;
    }

    let first_center = low + 0.5 * width;
    image.map(|v| {
        let position = (v - first_center) / width;
        if position <= 0.0 {
            return cdf[0];
        }
        let lower = position.floor() as usize;
        if lower >= EQUALIZE_BINS - 1 {
            return cdf[EQUALIZE_BINS - 1];
        }
        let fraction = position - lower as f32;
        cdf[lower] + (cdf[lower + 1] - cdf[lower]) * fraction
    })
}

/// Clips histogram bins at `limit` and spreads the excess evenly over all bins.
fn clip_histogram(histogram: &mut [u32; 256], limit: u32) {
    let mut excess = 0u32;
    for bin in histogram.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let per_bin = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in histogram.iter_mut().enumerate() {
        *bin += per_bin + u32::from(i < remainder);
    }
}

/// Contrast-limited adaptive equalization, one channel at a time.
fn equalize_adaptive(image: &Image<f32>, clip_limit: f32) -> Image<f32> {
    let (low, high) = sample_range(image);
    if high - low <= 0.0 {
        return image.clone();
    }
    let width = image.width() as usize;
    let height = image.height() as usize;
    let channels = image.channels();
    let tile_w = width.div_ceil(CLAHE_GRID).max(1);
    let tile_h = height.div_ceil(CLAHE_GRID).max(1);
    let cols = width.div_ceil(tile_w);
    let rows = height.div_ceil(tile_h);

    let levels: Vec<u8> = image.data().iter().map(|&v| to_u8(v * 255.0)).collect();
    let mut output = vec![0f32; levels.len()];

    for channel in 0..channels {
        let level_at = |x: usize, y: usize| levels[(y * width + x) * channels + channel] as usize;

        let mut luts = vec![[0f32; 256]; cols * rows];
        for ty in 0..rows {
            for tx in 0..cols {
                let (x0, y0) = (tx * tile_w, ty * tile_h);
                let (x1, y1) = ((x0 + tile_w).min(width), (y0 + tile_h).min(height));
                let area = (x1 - x0) * (y1 - y0);

                let mut histogram = [0u32; 256];
                for y in y0..y1 {
                    for x in x0..x1 {
                        histogram[level_at(x, y)] += 1;
                    }
                }
                let limit = ((clip_limit * area as f32) as u32).max(1);
                clip_histogram(&mut histogram, limit);

                let lut = &mut luts[ty * cols + tx];
                let mut running = 0u32;
                for (slot, count) in lut.iter_mut().zip(histogram) {
                    running += count;
                    *slot = running as f32 / area as f32;
                }
            }
        }

        let center_x = |tx: usize| (tx as f32 + 0.5) * tile_w as f32;
        let center_y = |ty: usize| (ty as f32 + 0.5) * tile_h as f32;
        for y in 0..height {
            let fy = y as f32 / tile_h as f32 - 0.5;
            let ty0 = (fy.floor().max(0.0) as usize).min(rows - 1);
            let ty1 = (ty0 + 1).min(rows - 1);
            let ay = if ty0 == ty1 {
                0.0
            } else {
                ((y as f32 - center_y(ty0)) / (center_y(ty1) - center_y(ty0))).clamp(0.0, 1.0)
            };
            for x in 0..width {
                let fx = x as f32 / tile_w as f32 - 0.5;
                let tx0 = (fx.floor().max(0.0) as usize).min(cols - 1);
                let tx1 = (tx0 + 1).min(cols - 1);
                let ax = if tx0 == tx1 {
                    0.0
                } else {
                    ((x as f32 - center_x(tx0)) / (center_x(tx1) - center_x(tx0))).clamp(0.0, 1.0)
                };

                let level = level_at(x, y);
                let v00 = luts[ty0 * cols + tx0][level];
                let v10 = luts[ty0 * cols + tx1][level];
                let v01 = luts[ty1 * cols + tx0][level];
                let v11 = luts[ty1 * cols + tx1][level];
                let value = v00 * (1.0 - ax) * (1.0 - ay)
                    + v10 * ax * (1.0 - ay)
                    + v01 * (1.0 - ax) * ay
                    + v11 * ax * ay;
                output[(y * width + x) * channels + channel] = value.clamp(0.0, 1.0);
            }
        }
    }
    image.with_data(output)
}
