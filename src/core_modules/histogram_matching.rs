// THEORY:
// Histogram matching makes each channel of the source share the intensity distribution
// of the same channel of the reference. It is a pure lookup-table method: for every
// 8-bit level we know its quantile in the source (the source CDF), and we find the
// reference value sitting at that same quantile by linearly interpolating the
// reference's inverse CDF between its distinct values. Quantiles outside the
// reference's range clamp to its lowest or highest value.
//
// The fitted state is simply a per-channel summary of the reference: its distinct
// values and their cumulative quantiles.

use crate::core_modules::color_math::require_rgb;
use crate::core_modules::image::{Image, RawImage, to_u8};
use crate::core_modules::normalizer::{Method, Normalizer, NormalizerOutput, required_reference};
use crate::error::{NormError, NormResult};

/// Cumulative distribution of one 8-bit channel: distinct values and their quantiles.
#[derive(Debug, Clone, PartialEq)]
struct ChannelCdf {
    values: Vec<f64>,
    quantiles: Vec<f64>,
}

impl ChannelCdf {
    fn from_counts(counts: &[u64; 256]) -> Self {
        let total: u64 = counts.iter().sum();
        let mut values = Vec::new();
        let mut quantiles = Vec::new();
        let mut running = 0u64;
        for (level, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            running += count;
            values.push(level as f64);
            quantiles.push(running as f64 / total as f64);
        }
        Self { values, quantiles }
    }

    /// Value found at quantile `q` by linear interpolation (clamped at both ends).
    fn value_at(&self, q: f64) -> f64 {
        let last = self.quantiles.len() - 1;
        if q <= self.quantiles[0] {
            return self.values[0];
        }
        if q >= self.quantiles[last] {
            return self.values[last];
        }
        let upper = self.quantiles.partition_point(|&p| p < q);
        let lower = upper - 1;
        let (q0, q1) = (self.quantiles[lower], self.quantiles[upper]);
        let (v0, v1) = (self.values[lower], self.values[upper]);
        v0 + (v1 - v0) * (q - q0) / (q1 - q0)
    }
}

fn channel_counts(image: &Image<u8>, channel: usize) -> [u64; 256] {
    let mut counts = [0u64; 256];
    for v in image.channel(channel) {
        counts[v as usize] += 1;
    }
    counts
}

pub struct HistogramMatcher {
    reference: Option<[ChannelCdf; 3]>,
}

impl Default for HistogramMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HistogramMatcher {
    pub fn new() -> Self {
        Self { reference: None }
    }

    /// Maps every channel of `source` onto the fitted reference distribution.
    pub fn match_image(&self, source: &Image<u8>) -> NormResult<Image<u8>> {
        let reference = self.reference.as_ref().ok_or(NormError::NotFitted)?;
        require_rgb(source, "histogram matching")?;
        if source.is_empty() {
            return Err(NormError::Numerical("cannot match an empty image".into()));
        }

        let mut tables = [[0u8; 256]; 3];
        for (channel, (table, target)) in tables.iter_mut().zip(reference).enumerate() {
            let source_cdf = channel_counts(source, channel);
            let total: u64 = source_cdf.iter().sum();
            let mut running = 0u64;
            for (level, &count) in source_cdf.iter().enumerate() {
                running += count;
                let quantile = running as f64 / total as f64;
                table[level] = to_u8(target.value_at(quantile) as f32);
            }
        }

        let data: Vec<u8> = source
            .data()
            .iter()
            .enumerate()
            .map(|(i, &v)| tables[i % 3][v as usize])
            .collect();
        Ok(source.with_data(data))
    }
}

impl Normalizer for HistogramMatcher {
    fn method(&self) -> Method {
        Method::HistogramMatching
    }

    fn fit(&mut self, reference: Option<&Image<u8>>) -> NormResult<()> {
        let reference = required_reference(Method::HistogramMatching, reference)?;
        require_rgb(reference, "histogram matching")?;
        if reference.is_empty() {
            return Err(NormError::Numerical("cannot match against an empty reference".into()));
        }
        self.reference =
            Some([0, 1, 2].map(|c| ChannelCdf::from_counts(&channel_counts(reference, c))));
        Ok(())
    }

    fn transform(&self, source: &Image<u8>) -> NormResult<NormalizerOutput> {
        let matched = self.match_image(source)?;
        Ok(NormalizerOutput::Single(RawImage::Canonical(matched)))
    }
}
