// THEORY:
// Reinhard transfer treats color as three independent statistics in a perceptual space.
// In CIE L*a*b* the channels are nearly decorrelated, so matching the first two moments
// of each channel separately is enough to move the overall "look" of one image onto
// another:
//
//   x' = (x - mean_src) / std_src * std_ref + mean_ref
//
// The reference is reduced to six numbers (mean and population standard deviation per
// channel). A source channel with (near) zero spread has no contrast to rescale, so it
// is only shifted onto the reference mean.

use crate::core_modules::color_math::{self, require_rgb};
use crate::core_modules::image::{Image, RawImage, to_u8};
use crate::core_modules::normalizer::{Method, Normalizer, NormalizerOutput, required_reference};
use crate::error::{NormError, NormResult};

/// Standard deviations below this are treated as zero. The sRGB to L*a*b* round trip
/// leaves a*/b* noise around 1e-6 on neutral pixels, so the bound sits well above it.
const FLAT_STD: f64 = 1e-3;

/// Per-channel first and second moments of an L*a*b* image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabStatistics {
    pub mean: [f64; 3],
    pub std: [f64; 3],
}

impl LabStatistics {
    pub fn of(lab: &[[f64; 3]]) -> NormResult<Self> {
        if lab.is_empty() {
            return Err(NormError::Numerical("statistics of an empty image".into()));
        }
        let n = lab.len() as f64;
        let mut mean = [0.0; 3];
        for pixel in lab {
            for c in 0..3 {
                mean[c] += pixel[c];
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);
        let mut std = [0.0; 3];
        for pixel in lab {
            for c in 0..3 {
                std[c] += (pixel[c] - mean[c]).powi(2);
            }
        }
        std.iter_mut().for_each(|s| *s = (*s / n).sqrt());
        Ok(Self { mean, std })
    }
}

fn to_lab(image: &Image<u8>) -> NormResult<Vec<[f64; 3]>> {
    require_rgb(image, "Reinhard transfer")?;
    if image.is_empty() {
        return Err(NormError::Numerical("cannot transfer colors of an empty image".into()));
    }
    Ok(image
        .pixels()
        .map(|p| color_math::rgb_to_lab([p[0] as f64, p[1] as f64, p[2] as f64]))
        .collect())
}

pub struct ReinhardTransfer {
    reference: Option<LabStatistics>,
}

impl Default for ReinhardTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReinhardTransfer {
    pub fn new() -> Self {
        Self { reference: None }
    }

    pub fn reference_statistics(&self) -> Option<&LabStatistics> {
        self.reference.as_ref()
    }

    /// L*a*b* planes of `source` after the statistics transfer, before any clamping.
    pub fn transfer(&self, source: &Image<u8>) -> NormResult<Vec<[f64; 3]>> {
        let reference = self.reference.ok_or(NormError::NotFitted)?;
        let mut lab = to_lab(source)?;
        let stats = LabStatistics::of(&lab)?;
        for pixel in lab.iter_mut() {
            for c in 0..3 {
                pixel[c] = if stats.std[c] < FLAT_STD {
                    pixel[c] - stats.mean[c] + reference.mean[c]
                } else {
                    (pixel[c] - stats.mean[c]) / stats.std[c] * reference.std[c] + reference.mean[c]
                };
            }
        }
        Ok(lab)
    }
}

impl Normalizer for ReinhardTransfer {
    fn method(&self) -> Method {
        Method::Reinhard
    }

    fn fit(&mut self, reference: Option<&Image<u8>>) -> NormResult<()> {
        let reference = required_reference(Method::Reinhard, reference)?;
        self.reference = Some(LabStatistics::of(&to_lab(reference)?)?);
        Ok(())
    }

    fn transform(&self, source: &Image<u8>) -> NormResult<NormalizerOutput> {
        let lab = self.transfer(source)?;
        let data: Vec<u8> = lab
            .iter()
            .flat_map(|&pixel| color_math::lab_to_rgb(pixel).map(|v| to_u8(v as f32)))
            .collect();
        Ok(NormalizerOutput::Single(RawImage::Canonical(source.with_data(data))))
    }
}
