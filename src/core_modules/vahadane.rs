// THEORY:
// Vahadane's method treats stain estimation as sparse non-negative matrix
// factorization: the stained pixels' optical densities X (N x 3) are explained as
// X ~ A * D, with D the 2x3 stain dictionary and A the per-pixel concentrations, where
// A is kept sparse by an L1 penalty.
//
// The factorization is learned by alternating two easy problems:
//   1. Fix D, solve A pixel by pixel (the exact two-stain lasso from `stain`).
//   2. Fix A, solve D by least squares, then project it back onto non-negative unit rows.
// It starts from canonical hematoxylin and eosin vectors and stops after a fixed number
// of rounds or once the dictionary stops moving. Learning is done on an evenly strided
// subsample so large slides stay cheap; the final matrix is ordered like every other
// stain matrix (row 0 has the larger red density).

use crate::core_modules::color_math::OdVector;
use crate::core_modules::image::{Image, RawImage};
use crate::core_modules::normalizer::{Method, Normalizer, NormalizerOutput, required_reference};
use crate::core_modules::stain::{self, LassoSolver, StainMatrix};
use crate::error::{NormError, NormResult};
use tracing::debug;

/// Sparsity weight while learning the dictionary.
const DICTIONARY_LAMBDA: f64 = 0.1;
/// Upper bound on alternating rounds.
const MAX_ITERATIONS: usize = 50;
/// Largest per-entry dictionary change that still counts as movement.
const TOLERANCE: f64 = 1e-6;
/// Pixels used for learning; larger tissue sets are strided down to this.
const MAX_LEARNING_PIXELS: usize = 20_000;
/// Ridge added to the normal equations of the dictionary update.
const RIDGE: f64 = 1e-10;

/// Starting dictionary: textbook hematoxylin and eosin optical densities.
const INITIAL_DICTIONARY: [[f64; 3]; 2] = [[0.650, 0.704, 0.286], [0.072, 0.990, 0.105]];

pub struct VahadaneStainNormalizer {
    standardize_brightness: bool,
    target: Option<StainMatrix>,
}

impl VahadaneStainNormalizer {
    pub fn new(standardize_brightness: bool) -> Self {
        Self {
            standardize_brightness,
            target: None,
        }
    }

    pub fn stain_matrix(&self) -> Option<&StainMatrix> {
        self.target.as_ref()
    }

    /// Learns the stain dictionary of an RGB image.
    pub fn estimate(&self, image: &Image<u8>) -> NormResult<StainMatrix> {
        let prepared = stain::prepare(image, self.standardize_brightness)?;
        learn_stain_matrix(&prepared)
    }
}

/// Keeps every k-th vector so that at most `limit` remain.
fn strided_sample(od: Vec<OdVector>, limit: usize) -> Vec<OdVector> {
    if od.len() <= limit {
        return od;
    }
    let step = od.len().div_ceil(limit);
    od.into_iter().step_by(step).collect()
}

fn learn_stain_matrix(image: &Image<u8>) -> NormResult<StainMatrix> {
    let tissue = stain::tissue_optical_density(image)?;
    // A rank-one cloud cannot support two stains.
    stain::principal_axes(&tissue)?;
    let sample = strided_sample(tissue, MAX_LEARNING_PIXELS);

    let mut dictionary = *StainMatrix::from_rows(INITIAL_DICTIONARY)?.rows();
    let mut rounds = 0;
    for _ in 0..MAX_ITERATIONS {
        rounds += 1;
        let solver = LassoSolver::new(&dictionary, DICTIONARY_LAMBDA);
        let codes: Vec<[f64; 2]> = sample.iter().map(|x| solver.solve(x)).collect();
        let Some(updated) = update_dictionary(&sample, &codes, &dictionary) else {
            break;
        };
        let change = updated
            .iter()
            .flatten()
            .zip(dictionary.iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        dictionary = updated;
        if change < TOLERANCE {
            break;
        }
    }
    debug!(rounds, sample = sample.len(), "Learned Vahadane stain dictionary");
    StainMatrix::from_rows(dictionary)
}

/// Least-squares dictionary for fixed codes, projected onto non-negative unit rows.
/// Returns `None` when the codes leave the normal equations singular.
fn update_dictionary(
    sample: &[OdVector],
    codes: &[[f64; 2]],
    previous: &[[f64; 3]; 2],
) -> Option<[[f64; 3]; 2]> {
    let (mut a00, mut a01, mut a11) = (RIDGE, 0.0, RIDGE);
    let mut atx = [[0.0f64; 3]; 2];
    for (x, c) in sample.iter().zip(codes) {
        a00 += c[0] * c[0];
        a01 += c[0] * c[1];
        a11 += c[1] * c[1];
        for ch in 0..3 {
            atx[0][ch] += c[0] * x[ch];
            atx[1][ch] += c[1] * x[ch];
        }
    }
    let det = a00 * a11 - a01 * a01;
    if det.abs() < 1e-12 {
        return None;
    }

    let mut rows = [[0.0f64; 3]; 2];
    for ch in 0..3 {
        rows[0][ch] = ((a11 * atx[0][ch] - a01 * atx[1][ch]) / det).max(0.0);
        rows[1][ch] = ((a00 * atx[1][ch] - a01 * atx[0][ch]) / det).max(0.0);
    }
    for (row, old) in rows.iter_mut().zip(previous) {
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm < 1e-12 || !norm.is_finite() {
            // A stain the codes no longer use keeps its last direction.
            *row = *old;
        } else {
            row.iter_mut().for_each(|v| *v /= norm);
        }
    }
    Some(rows)
}

impl Normalizer for VahadaneStainNormalizer {
    fn method(&self) -> Method {
        Method::Vahadane
    }

    fn fit(&mut self, reference: Option<&Image<u8>>) -> NormResult<()> {
        let reference = required_reference(Method::Vahadane, reference)?;
        self.target = Some(self.estimate(reference)?);
        Ok(())
    }

    fn transform(&self, source: &Image<u8>) -> NormResult<NormalizerOutput> {
        let target = self.target.as_ref().ok_or(NormError::NotFitted)?;
        let prepared = stain::prepare(source, self.standardize_brightness)?;
        let source_matrix = learn_stain_matrix(&prepared)?;
        let result = stain::restain(&prepared, &source_matrix, target)?;
        Ok(NormalizerOutput::Single(RawImage::Canonical(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::image::Layout;
    use crate::core_modules::stain::fixtures::*;

    #[test]
    fn learned_dictionary_stays_close_to_the_true_stains() {
        let matrix = VahadaneStainNormalizer::new(false).estimate(&he_tile()).unwrap();
        let rows = matrix.rows();
        assert!(cosine(&rows[0], &HEMATOXYLIN) > 0.9, "{rows:?}");
        assert!(cosine(&rows[1], &EOSIN) > 0.9, "{rows:?}");
    }

    #[test]
    fn stain_rows_are_non_negative_unit_vectors_in_red_order() {
        let normalizer = VahadaneStainNormalizer::new(false);
        for tile in [he_tile(), other_tile()] {
            let matrix = normalizer.estimate(&tile).unwrap();
            for row in matrix.rows() {
                assert!(row.iter().all(|v| *v >= 0.0));
                let norm: f64 = row.iter().map(|v| v * v).sum::<f64>().sqrt();
                assert!((norm - 1.0).abs() < 1e-9);
            }
            assert!(matrix.rows()[0][0] >= matrix.rows()[1][0]);
        }
    }

    #[test]
    fn fit_then_transform_produces_an_rgb_image_of_the_same_size() {
        let mut normalizer = VahadaneStainNormalizer::new(false);
        normalizer.fit(Some(&he_tile())).unwrap();
        assert!(normalizer.stain_matrix().is_some());
        let source = other_tile();
        match normalizer.transform(&source).unwrap() {
            NormalizerOutput::Single(RawImage::Canonical(result)) => {
                assert_eq!(result.width(), source.width());
                assert_eq!(result.height(), source.height());
                assert_eq!(result.layout(), Layout::Rgb);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn transform_before_fit_is_rejected() {
        let normalizer = VahadaneStainNormalizer::new(false);
        assert!(matches!(normalizer.transform(&he_tile()), Err(NormError::NotFitted)));
    }

    #[test]
    fn single_color_image_is_a_numerical_error() {
        let flat = Image::new(6, 6, Layout::Rgb, [150u8, 80, 160].repeat(36)).unwrap();
        let mut normalizer = VahadaneStainNormalizer::new(false);
        assert_eq!(normalizer.fit(Some(&flat)).unwrap_err().kind(), "numerical");
    }

    #[test]
    fn strided_sampling_caps_the_learning_set() {
        let od = vec![[0.1, 0.2, 0.3]; 50_001];
        let sample = strided_sample(od, MAX_LEARNING_PIXELS);
        assert!(sample.len() <= MAX_LEARNING_PIXELS);
        assert!(sample.len() > MAX_LEARNING_PIXELS / 2);
        assert_eq!(strided_sample(vec![[0.0; 3]; 10], MAX_LEARNING_PIXELS).len(), 10);
    }
}
