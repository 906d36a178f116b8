// THEORY:
// Macenko's method estimates the two stain vectors geometrically. Once the stained
// pixels' optical densities are projected onto the plane of their two principal axes,
// every pixel is a direction in that plane. The stains are the *extreme* directions:
// the 1st and 99th percentile of the angle distribution (robust against outliers),
// turned back into 3D OD vectors.
//
// Fitting estimates the matrix of the reference. Transforming estimates the matrix of
// the source, separates the source into concentrations with it, and renders those
// concentrations through the reference matrix.

use crate::core_modules::color_math::{self, OdVector};
use crate::core_modules::image::{Image, RawImage};
use crate::core_modules::normalizer::{Method, Normalizer, NormalizerOutput, required_reference};
use crate::core_modules::stain::{self, StainMatrix};
use crate::error::{NormError, NormResult};
use nalgebra::Vector3;
use tracing::debug;

/// Lower and upper angle percentiles taken as the extreme stain directions.
const ANGLE_PERCENTILES: (f64, f64) = (1.0, 99.0);

pub struct MacenkoStainNormalizer {
    standardize_brightness: bool,
    /// Stain matrix of the fitted reference.
    target: Option<StainMatrix>,
}

impl MacenkoStainNormalizer {
    pub fn new(standardize_brightness: bool) -> Self {
        Self {
            standardize_brightness,
            target: None,
        }
    }

    pub fn stain_matrix(&self) -> Option<&StainMatrix> {
        self.target.as_ref()
    }

    /// Estimates the stain matrix of an RGB image.
    pub fn estimate(&self, image: &Image<u8>) -> NormResult<StainMatrix> {
        let prepared = stain::prepare(image, self.standardize_brightness)?;
        estimate_stain_matrix(&prepared)
    }
}

fn estimate_stain_matrix(image: &Image<u8>) -> NormResult<StainMatrix> {
    let tissue = stain::tissue_optical_density(image)?;
    let [first, second] = stain::principal_axes(&tissue)?;

    let angles: Vec<f64> = tissue
        .iter()
        .map(|od| {
            let v = Vector3::new(od[0], od[1], od[2]);
            v.dot(&second).atan2(v.dot(&first))
        })
        .collect();
    let low = color_math::percentile_of(&angles, ANGLE_PERCENTILES.0)?;
    let high = color_math::percentile_of(&angles, ANGLE_PERCENTILES.1)?;

    let direction = |phi: f64| -> OdVector {
        let v = first * phi.cos() + second * phi.sin();
        [v[0], v[1], v[2]]
    };
    debug!(
        tissue_pixels = tissue.len(),
        low_angle = low,
        high_angle = high,
        "Estimated Macenko stain directions"
    );
    StainMatrix::from_rows([direction(low), direction(high)])
}

impl Normalizer for MacenkoStainNormalizer {
    fn method(&self) -> Method {
        Method::Macenko
    }

    fn fit(&mut self, reference: Option<&Image<u8>>) -> NormResult<()> {
        let reference = required_reference(Method::Macenko, reference)?;
        self.target = Some(self.estimate(reference)?);
        Ok(())
    }

    fn transform(&self, source: &Image<u8>) -> NormResult<NormalizerOutput> {
        let target = self.target.as_ref().ok_or(NormError::NotFitted)?;
        let prepared = stain::prepare(source, self.standardize_brightness)?;
        let source_matrix = estimate_stain_matrix(&prepared)?;
        let result = stain::restain(&prepared, &source_matrix, target)?;
        Ok(NormalizerOutput::Single(RawImage::Canonical(result)))
    }
}
