// THEORY:
// The `normalizer` module is the polymorphic seam of the engine. Every method follows
// the same two-step lifecycle:
//
//   fit(reference)      learn whatever describes the target look (may be a no-op)
//   transform(source)   re-render the source so it takes on that look
//
// Callers never branch on the algorithm: they pick a `Method`, ask it for a boxed
// `Normalizer`, and drive the lifecycle. `Method` is a closed enum, so the mapping
// from method to implementation is a single exhaustive `match` that the compiler checks
// whenever a method is added.
//
// Two output shapes exist. Histogram equalization produces a set of four named images,
// every other method produces exactly one. `NormalizerOutput` carries that distinction
// to the pipeline instead of hiding it behind a map of names.

use crate::core_modules::histogram_equalization::{EqualizationSet, HistogramEqualizer};
use crate::core_modules::histogram_matching::HistogramMatcher;
use crate::core_modules::image::{Image, RawImage};
use crate::core_modules::macenko::MacenkoStainNormalizer;
use crate::core_modules::reinhard::ReinhardTransfer;
use crate::core_modules::vahadane::VahadaneStainNormalizer;
use crate::error::{NormError, NormResult};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// The closed set of normalization methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    HistogramEqualization,
    HistogramMatching,
    Reinhard,
    Macenko,
    Vahadane,
}

/// Catalog entry describing a method to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodInfo {
    pub id: u8,
    pub key: &'static str,
    pub name: &'static str,
    pub requires_reference: bool,
    pub description: &'static str,
}

/// Tunables shared by the normalizer implementations.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizerConfig {
    /// Reduce RGB input to luminance before histogram equalization.
    pub grayscale_equalization: bool,
    /// CLAHE clip limit as a fraction of the tile area.
    pub clahe_clip_limit: f32,
    /// Stretch brightness (90th percentile -> white) before stain estimation.
    pub standardize_brightness: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            grayscale_equalization: true,
            clahe_clip_limit: 0.03,
            standardize_brightness: false,
        }
    }
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::HistogramEqualization,
        Method::HistogramMatching,
        Method::Reinhard,
        Method::Macenko,
        Method::Vahadane,
    ];

    /// Numeric id used by form-based clients (1-5).
    pub fn id(self) -> u8 {
        match self {
            Method::HistogramEqualization => 1,
            Method::HistogramMatching => 2,
            Method::Reinhard => 3,
            Method::Macenko => 4,
            Method::Vahadane => 5,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Method::HistogramEqualization => "histogram_equalization",
            Method::HistogramMatching => "histogram_matching",
            Method::Reinhard => "reinhard",
            Method::Macenko => "macenko",
            Method::Vahadane => "vahadane",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Method::HistogramEqualization => "Histogram Equalization",
            Method::HistogramMatching => "Histogram Matching",
            Method::Reinhard => "Reinhard",
            Method::Macenko => "Macenko",
            Method::Vahadane => "Vahadane",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Method::HistogramEqualization => "Enhances contrast by equalizing the image histogram",
            Method::HistogramMatching => "Matches histogram of source image to reference image",
            Method::Reinhard => "Color normalization using Reinhard's method",
            Method::Macenko => "Stain normalization using Macenko's method",
            Method::Vahadane => "Stain normalization using Vahadane's method",
        }
    }

    pub fn requires_reference(self) -> bool {
        !matches!(self, Method::HistogramEqualization)
    }

    pub fn from_id(id: u8) -> NormResult<Self> {
        Method::ALL
            .into_iter()
            .find(|m| m.id() == id)
            .ok_or_else(|| {
                NormError::InvalidInput(format!("invalid method number {id}; choose from 1-5"))
            })
    }

    pub fn catalog() -> Vec<MethodInfo> {
        Method::ALL
            .into_iter()
            .map(|m| MethodInfo {
                id: m.id(),
                key: m.key(),
                name: m.display_name(),
                requires_reference: m.requires_reference(),
                description: m.description(),
            })
            .collect()
    }

    /// Builds a fresh, unfitted normalizer for this method.
    pub fn normalizer(self, config: &NormalizerConfig) -> Box<dyn Normalizer> {
        match self {
            Method::HistogramEqualization => Box::new(HistogramEqualizer::new(
                config.grayscale_equalization,
                config.clahe_clip_limit,
            )),
            Method::HistogramMatching => Box::new(HistogramMatcher::new()),
            Method::Reinhard => Box::new(ReinhardTransfer::new()),
            Method::Macenko => Box::new(MacenkoStainNormalizer::new(config.standardize_brightness)),
            Method::Vahadane => {
                Box::new(VahadaneStainNormalizer::new(config.standardize_brightness))
            }
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Method {
    type Err = NormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(id) = trimmed.parse::<u8>() {
            return Method::from_id(id);
        }
        Method::ALL
            .into_iter()
            .find(|m| m.key().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| NormError::InvalidInput(format!("unsupported method '{trimmed}'")))
    }
}

/// What a normalizer hands back: one image, or the four equalization stages.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizerOutput {
    Single(RawImage),
    Equalization(EqualizationSet),
}

/// The fit/transform contract shared by all methods.
pub trait Normalizer: Send {
    fn method(&self) -> Method;

    /// Learns the target appearance. Overwrites any earlier fit. Methods that need no
    /// reference accept `None` and ignore whatever they are given.
    fn fit(&mut self, reference: Option<&Image<u8>>) -> NormResult<()>;

    /// Re-renders `source` toward the fitted appearance.
    fn transform(&self, source: &Image<u8>) -> NormResult<NormalizerOutput>;
}

/// Unwraps the reference for methods that cannot work without one.
pub(crate) fn required_reference(
    method: Method,
    reference: Option<&Image<u8>>,
) -> NormResult<&Image<u8>> {
    reference.ok_or_else(|| {
        NormError::InvalidInput(format!("method '{method}' requires a reference image"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::image::Layout;

    #[test]
    fn ids_and_keys_round_trip() {
        for method in Method::ALL {
            assert_eq!(Method::from_id(method.id()).unwrap(), method);
            assert_eq!(method.key().parse::<Method>().unwrap(), method);
            assert_eq!(method.to_string(), method.key());
        }
        assert_eq!("3".parse::<Method>().unwrap(), Method::Reinhard);
        assert_eq!(Method::from_id(6).unwrap_err().kind(), "invalid_input");
        assert_eq!("sharpen".parse::<Method>().unwrap_err().kind(), "invalid_input");
    }

    #[test]
    fn only_equalization_runs_without_reference() {
        let needing: Vec<Method> =
            Method::ALL.into_iter().filter(|m| m.requires_reference()).collect();
        assert_eq!(needing.len(), 4);
        assert!(!Method::HistogramEqualization.requires_reference());
    }

    #[test]
    fn catalog_lists_all_methods_in_id_order() {
        let catalog = Method::catalog();
        let ids: Vec<u8> = catalog.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        let json = serde_json::to_value(&catalog).unwrap();
        assert_eq!(json[4]["key"], "vahadane");
        assert_eq!(json[0]["requires_reference"], false);
    }

    #[test]
    fn factory_builds_matching_variants() {
        let config = NormalizerConfig::default();
        for method in Method::ALL {
            assert_eq!(method.normalizer(&config).method(), method);
        }
    }

    #[test]
    fn reference_methods_refuse_to_transform_unfitted() {
        let config = NormalizerConfig::default();
        let source = Image::filled(4, 4, Layout::Rgb, 120u8);
        for method in Method::ALL.into_iter().filter(|m| m.requires_reference()) {
            let normalizer = method.normalizer(&config);
            let err = normalizer.transform(&source).unwrap_err();
            assert_eq!(err.kind(), "not_fitted", "{method}");
        }
    }

    #[test]
    fn reference_methods_refuse_to_fit_without_reference() {
        let config = NormalizerConfig::default();
        for method in Method::ALL.into_iter().filter(|m| m.requires_reference()) {
            let mut normalizer = method.normalizer(&config);
            assert_eq!(normalizer.fit(None).unwrap_err().kind(), "invalid_input");
        }
    }
}
