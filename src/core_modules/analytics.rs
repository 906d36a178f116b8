// THEORY:
// The analytics extractor turns finished 8-bit images into chart-ready series. Nothing
// here changes pixels; it only counts them:
//
// - Histogram: 256 bins over the full 8-bit range, one series per channel, with counts
//   also normalized to the tallest bin so series of different images share a y-axis.
// - CDF: the running share of pixels at or below each bin; ends at exactly 1.
// - Scatter: for RGB images, a capped sample of pixels placed on a red/green plane
//   centered at mid-gray and tagged by their dominant channel.
//
// Sampling uses a seeded `StdRng`. With a fixed seed the same image always yields the
// same scatter points; without one, every request draws fresh entropy. Indices are
// sampled without replacement and kept in pixel order.

use crate::core_modules::image::{Image, Layout};
use crate::error::{NormError, NormResult};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::BTreeMap;

/// Scatter cap used when nothing else is configured.
pub const DEFAULT_SCATTER_CAP: usize = 2000;
const BINS: usize = 256;
const CENTER: f64 = 127.5;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsConfig {
    /// Upper bound on scatter points per image.
    pub scatter_cap: usize,
    /// Fixed sampling seed; `None` draws from entropy.
    pub scatter_seed: Option<u64>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            scatter_cap: DEFAULT_SCATTER_CAP,
            scatter_seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelTag {
    Gray,
    Red,
    Green,
    Blue,
}

impl ChannelTag {
    const RGB: [ChannelTag; 3] = [ChannelTag::Red, ChannelTag::Green, ChannelTag::Blue];

    fn for_layout(layout: Layout) -> &'static [ChannelTag] {
        match layout {
            Layout::Gray => &[ChannelTag::Gray],
            Layout::Rgb => &Self::RGB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramPoint {
    pub bin: u8,
    pub count: u64,
    pub normalized_count: f64,
    pub channel: ChannelTag,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CdfPoint {
    pub bin: u8,
    pub cdf: f64,
    pub channel: ChannelTag,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScatterPoint {
    pub x: f64,
    pub y: f64,
    pub color: ChannelTag,
    pub channel: ChannelTag,
}

/// Chart series of a single image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageChartData {
    pub histograms: Vec<HistogramPoint>,
    pub cdfs: Vec<CdfPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scatter_plots: Option<Vec<ScatterPoint>>,
}

/// Chart series of every labeled image of one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartData {
    pub images: BTreeMap<String, ImageChartData>,
}

pub struct AnalyticsExtractor {
    config: AnalyticsConfig,
}

impl AnalyticsExtractor {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self { config }
    }

    /// Extracts chart series for each `(name, image)` pair.
    pub fn extract<'a, I>(&self, images: I) -> NormResult<ChartData>
    where
        I: IntoIterator<Item = (&'a str, &'a Image<u8>)>,
    {
        let mut chart = ChartData::default();
        for (name, image) in images {
            chart.images.insert(name.to_string(), self.chart_data(image)?);
        }
        Ok(chart)
    }

    pub fn chart_data(&self, image: &Image<u8>) -> NormResult<ImageChartData> {
        if image.is_empty() {
            return Err(NormError::Numerical("cannot chart an empty image".into()));
        }
        let pixels = image.pixel_count() as f64;
        let mut histograms = Vec::with_capacity(BINS * image.channels());
        let mut cdfs = Vec::with_capacity(BINS * image.channels());

        for (index, &tag) in ChannelTag::for_layout(image.layout()).iter().enumerate() {
            let mut counts = [0u64; BINS];
            for v in image.channel(index) {
                counts[v as usize] += 1;
            }
            let tallest = counts.iter().copied().max().unwrap_or(0);
            let mut running = 0u64;
            for (bin, &count) in counts.iter().enumerate() {
                running += count;
                histograms.push(HistogramPoint {
                    bin: bin as u8,
                    count,
                    normalized_count: if tallest == 0 {
                        0.0
                    } else {
                        count as f64 / tallest as f64
                    },
                    channel: tag,
                });
                cdfs.push(CdfPoint {
                    bin: bin as u8,
                    cdf: running as f64 / pixels,
                    channel: tag,
                });
            }
        }

        let scatter_plots = image.is_rgb().then(|| self.scatter(image));
        Ok(ImageChartData {
            histograms,
            cdfs,
            scatter_plots,
        })
    }

    fn scatter(&self, image: &Image<u8>) -> Vec<ScatterPoint> {
        let count = image.pixel_count();
        let indices: Vec<usize> = if count > self.config.scatter_cap {
            let mut rng = match self.config.scatter_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let mut picked =
                rand::seq::index::sample(&mut rng, count, self.config.scatter_cap).into_vec();
            picked.sort_unstable();
            picked
        } else {
            (0..count).collect()
        };

        let data = image.data();
        indices
            .into_iter()
            .map(|i| {
                let p = &data[i * 3..i * 3 + 3];
                let dominant = dominant_channel([p[0], p[1], p[2]]);
                ScatterPoint {
                    x: p[0] as f64 - CENTER,
                    y: p[1] as f64 - CENTER,
                    color: dominant,
                    channel: dominant,
                }
            })
            .collect()
    }
}

/// Channel holding the largest value; ties go to the earlier channel.
fn dominant_channel(rgb: [u8; 3]) -> ChannelTag {
    let mut best = 0;
    for c in 1..3 {
        if rgb[c] > rgb[best] {
            best = c;
        }
    }
    ChannelTag::RGB[best]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy(width: u32, height: u32) -> Image<u8> {
        let data: Vec<u8> =
            (0..width * height * 3).map(|i| ((i * 37 + i / 7) % 256) as u8).collect();
        Image::new(width, height, Layout::Rgb, data).unwrap()
    }

    fn seeded(cap: usize, seed: u64) -> AnalyticsExtractor {
        AnalyticsExtractor::new(AnalyticsConfig {
            scatter_cap: cap,
            scatter_seed: Some(seed),
        })
    }

    #[test]
    fn histogram_counts_sum_to_pixel_count() {
        let image = noisy(13, 9);
        let data = seeded(2000, 1).chart_data(&image).unwrap();
        assert_eq!(data.histograms.len(), 3 * 256);
        for tag in ChannelTag::RGB {
            let total: u64 =
                data.histograms.iter().filter(|p| p.channel == tag).map(|p| p.count).sum();
            assert_eq!(total, 13 * 9);
            let peak = data
                .histograms
                .iter()
                .filter(|p| p.channel == tag)
                .map(|p| p.normalized_count)
                .fold(0.0, f64::max);
            assert_eq!(peak, 1.0);
        }
    }

    #[test]
    fn cdf_is_non_decreasing_and_ends_at_one() {
        let data = seeded(2000, 1).chart_data(&noisy(10, 10)).unwrap();
        for tag in ChannelTag::RGB {
            let series: Vec<f64> =
                data.cdfs.iter().filter(|p| p.channel == tag).map(|p| p.cdf).collect();
            assert_eq!(series.len(), 256);
            assert!(series.windows(2).all(|w| w[0] <= w[1]));
            assert!((series[255] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn grayscale_images_have_one_series_and_no_scatter() {
        let gray = Image::filled(5, 5, Layout::Gray, 42u8);
        let data = seeded(2000, 1).chart_data(&gray).unwrap();
        assert_eq!(data.histograms.len(), 256);
        assert!(data.histograms.iter().all(|p| p.channel == ChannelTag::Gray));
        assert_eq!(data.histograms[42].count, 25);
        assert!(data.scatter_plots.is_none());
        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("scatter_plots").is_none());
        assert_eq!(json["histograms"][0]["channel"], "gray");
    }

    #[test]
    fn scatter_is_capped_sorted_and_deterministic() {
        let image = noisy(40, 30);
        let first = seeded(100, 7).chart_data(&image).unwrap().scatter_plots.unwrap();
        let second = seeded(100, 7).chart_data(&image).unwrap().scatter_plots.unwrap();
        assert_eq!(first.len(), 100);
        assert_eq!(first, second);

        let everything = seeded(5000, 7).chart_data(&image).unwrap().scatter_plots.unwrap();
        assert_eq!(everything.len(), 1200);
        assert_eq!(everything[0].x, image.data()[0] as f64 - 127.5);
        let last = &image.data()[1199 * 3..];
        assert_eq!(everything[1199].x, last[0] as f64 - 127.5);
        assert_eq!(everything[1199].y, last[1] as f64 - 127.5);
        assert_eq!(everything[1199].color, dominant_channel([last[0], last[1], last[2]]));
    }

    #[test]
    fn dominant_channel_prefers_the_first_maximum() {
        assert_eq!(dominant_channel([10, 10, 10]), ChannelTag::Red);
        assert_eq!(dominant_channel([10, 200, 200]), ChannelTag::Green);
        assert_eq!(dominant_channel([0, 0, 1]), ChannelTag::Blue);
    }

    #[test]
    fn extract_keys_series_by_name() {
        let (a, b) = (noisy(4, 4), Image::filled(3, 3, Layout::Gray, 0u8));
        let chart = seeded(10, 3).extract([("source", &a), ("result", &b)]).unwrap();
        let names: Vec<&str> = chart.images.keys().map(String::as_str).collect();
        assert_eq!(names, ["result", "source"]);
        let json = serde_json::to_value(&chart).unwrap();
        assert!(json["images"]["source"]["scatter_plots"].is_array());
    }

    #[test]
    fn empty_images_are_a_numerical_error() {
        let empty = Image::<u8>::new(0, 0, Layout::Gray, Vec::new()).unwrap();
        let extractor = AnalyticsExtractor::new(AnalyticsConfig::default());
        let err = extractor.chart_data(&empty).unwrap_err();
        assert_eq!(err.kind(), "numerical");
    }
}
