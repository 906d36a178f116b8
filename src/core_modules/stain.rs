// THEORY:
// The `stain` module is the shared engine room of the two stain-separation methods.
// Macenko and Vahadane differ only in *how* they estimate a stain matrix; everything
// around that estimate is common and lives here:
//
// 1.  **Tissue selection**: background glass is bright and carries no stain, so only
//     pixels that are "not white" (L* below a threshold) and have measurable optical
//     density in some channel take part in estimation.
// 2.  **Principal axes**: the OD cloud of a two-stain image lies (approximately) in a
//     plane. The two largest-variance eigenvectors of its 3x3 covariance span that
//     plane; a second eigenvalue of ~0 means the image has only one color and no
//     two-stain model can be fitted.
// 3.  **Concentrations**: each pixel's OD vector is explained as a non-negative,
//     sparse combination of the two stain vectors (a tiny lasso problem per pixel,
//     solved exactly).
// 4.  **Reconstruction**: concentrations re-expressed through a *different* stain
//     matrix and mapped back from OD to RGB give the normalized image.
//
// A `StainMatrix` is always 2x3, non-negative and row-normalized. Row 0 is the stain
// with the larger red-channel density (hematoxylin in H&E), row 1 the other one.

use crate::core_modules::color_math::{self, OdVector};
use crate::core_modules::image::Image;
use crate::error::{NormError, NormResult};
use nalgebra::{Matrix3, Vector3};

/// Pixels with L* / 100 at or above this value are treated as background.
pub const NOTWHITE_THRESHOLD: f64 = 0.8;
/// Minimum optical density (in at least one channel) for a pixel to count as stained.
pub const OD_THRESHOLD: f64 = 0.15;
/// Sparsity weight used when solving concentrations for reconstruction.
pub const CONCENTRATION_LAMBDA: f64 = 0.01;
/// Fewer stained pixels than this cannot support a covariance estimate.
const MIN_TISSUE_PIXELS: usize = 3;
/// Relative size of the second eigenvalue below which the OD cloud is one-dimensional.
const DEGENERATE_EIGEN_RATIO: f64 = 1e-9;

/// Two unit-norm, non-negative stain color vectors in optical-density space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StainMatrix {
    rows: [[f64; 3]; 2],
}

impl StainMatrix {
    /// Clamps negative entries, normalizes rows and orders them by red density.
    pub fn from_rows(mut rows: [[f64; 3]; 2]) -> NormResult<Self> {
        for row in rows.iter_mut() {
            for v in row.iter_mut() {
                if !v.is_finite() {
                    return Err(NormError::Numerical("stain vector is not finite".into()));
                }
                *v = v.max(0.0);
            }
        }
        color_math::normalize_rows(&mut rows)?;
        if rows[0][0] < rows[1][0] {
            rows.swap(0, 1);
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[[f64; 3]; 2] {
        &self.rows
    }

    /// Solves non-negative sparse concentrations for every OD vector.
    pub fn concentrations(&self, od: &[OdVector], lambda: f64) -> ConcentrationMap {
        let solver = LassoSolver::new(&self.rows, lambda);
        ConcentrationMap {
            values: od.iter().map(|v| solver.solve(v)).collect(),
        }
    }

    /// Re-expresses concentrations as optical densities through this matrix.
    pub fn optical_density(&self, concentrations: &ConcentrationMap) -> Vec<OdVector> {
        concentrations
            .values
            .iter()
            .map(|c| {
                [
                    c[0] * self.rows[0][0] + c[1] * self.rows[1][0],
                    c[0] * self.rows[0][1] + c[1] * self.rows[1][1],
                    c[0] * self.rows[0][2] + c[1] * self.rows[1][2],
                ]
            })
            .collect()
    }
}

/// Per-pixel, non-negative amounts of each stain (N x 2).
#[derive(Debug, Clone, PartialEq)]
pub struct ConcentrationMap {
    values: Vec<[f64; 2]>,
}

impl ConcentrationMap {
    pub fn values(&self) -> &[[f64; 2]] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Exact solver for `min 0.5 * ||x - c S||^2 + lambda * (c0 + c1), c >= 0` with a
/// fixed 2x3 dictionary `S`. The Gram matrix is computed once per dictionary.
pub(crate) struct LassoSolver {
    rows: [[f64; 3]; 2],
    g00: f64,
    g01: f64,
    g11: f64,
    lambda: f64,
}

impl LassoSolver {
    pub(crate) fn new(rows: &[[f64; 3]; 2], lambda: f64) -> Self {
        let dot = |a: &[f64; 3], b: &[f64; 3]| a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
        Self {
            rows: *rows,
            g00: dot(&rows[0], &rows[0]),
            g01: dot(&rows[0], &rows[1]),
            g11: dot(&rows[1], &rows[1]),
            lambda,
        }
    }

    fn objective(&self, c: [f64; 2], r: [f64; 2]) -> f64 {
        0.5 * (self.g00 * c[0] * c[0] + 2.0 * self.g01 * c[0] * c[1] + self.g11 * c[1] * c[1])
            - r[0] * c[0]
            - r[1] * c[1]
            + self.lambda * (c[0] + c[1])
    }

    pub(crate) fn solve(&self, x: &[f64; 3]) -> [f64; 2] {
        let r = [
            self.rows[0][0] * x[0] + self.rows[0][1] * x[1] + self.rows[0][2] * x[2],
            self.rows[1][0] * x[0] + self.rows[1][1] * x[1] + self.rows[1][2] * x[2],
        ];
        let b0 = r[0] - self.lambda;
        let b1 = r[1] - self.lambda;

        // Both stains active: stationary point of the smooth part.
        let det = self.g00 * self.g11 - self.g01 * self.g01;
        if det > 1e-12 {
            let c0 = (b0 * self.g11 - b1 * self.g01) / det;
            let c1 = (b1 * self.g00 - b0 * self.g01) / det;
            if c0 >= 0.0 && c1 >= 0.0 {
                return [c0, c1];
            }
        }

        // One stain active, or none.
        let mut best = [0.0, 0.0];
        let mut best_value = 0.0;
        let candidates = [
            [if self.g00 > 0.0 { (b0 / self.g00).max(0.0) } else { 0.0 }, 0.0],
            [0.0, if self.g11 > 0.0 { (b1 / self.g11).max(0.0) } else { 0.0 }],
        ];
        for candidate in candidates {
            let value = self.objective(candidate, r);
            if value < best_value {
                best_value = value;
                best = candidate;
            }
        }
        best
    }
}

/// Optical densities of the pixels that carry stain.
pub(crate) fn tissue_optical_density(image: &Image<u8>) -> NormResult<Vec<OdVector>> {
    if image.is_empty() {
        return Err(NormError::Numerical("cannot estimate stains of an empty image".into()));
    }
    let od = color_math::rgb_to_od(image)?;
    let mask = color_math::notwhite_mask(image, NOTWHITE_THRESHOLD)?;
    let tissue: Vec<OdVector> = od
        .into_iter()
        .zip(mask)
        .filter(|(v, keep)| *keep && v.iter().any(|d| *d > OD_THRESHOLD))
        .map(|(v, _)| v)
        .collect();
    if tissue.len() < MIN_TISSUE_PIXELS {
        return Err(NormError::Numerical(format!(
            "only {} stained pixels found; at least {MIN_TISSUE_PIXELS} are needed",
            tissue.len()
        )));
    }
    Ok(tissue)
}

/// The two largest-variance directions of an OD cloud, largest first, each oriented so
/// its first non-zero component is positive.
pub(crate) fn principal_axes(od: &[OdVector]) -> NormResult<[Vector3<f64>; 2]> {
    let n = od.len() as f64;
    let mut mean = Vector3::zeros();
    for v in od {
        mean += Vector3::new(v[0], v[1], v[2]);
    }
    mean /= n;

    let mut covariance = Matrix3::zeros();
    for v in od {
        let d = Vector3::new(v[0], v[1], v[2]) - mean;
        covariance += d * d.transpose();
    }
    covariance /= (n - 1.0).max(1.0);

    let eigen = covariance.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let largest = eigen.eigenvalues[order[0]];
    let second = eigen.eigenvalues[order[1]];
    if !largest.is_finite() || largest <= 0.0 || second <= largest * DEGENERATE_EIGEN_RATIO {
        return Err(NormError::Numerical(
            "optical densities span fewer than two directions (single-color image?)".into(),
        ));
    }

    let orient = |index: usize| {
        let axis: Vector3<f64> = eigen.eigenvectors.column(index).into_owned();
        let leading = axis.iter().copied().find(|v| v.abs() > 1e-12).unwrap_or(0.0);
        if color_math::sign(leading) < 0.0 { -axis } else { axis }
    };
    Ok([orient(order[0]), orient(order[1])])
}

/// Maps concentrations through `target` and back to an RGB image.
pub(crate) fn reconstruct(
    concentrations: &ConcentrationMap,
    target: &StainMatrix,
    width: u32,
    height: u32,
) -> NormResult<Image<u8>> {
    let od = target.optical_density(concentrations);
    color_math::od_to_rgb(&od, width, height)
}

/// Separates `source` with its own stain matrix and re-renders it with `target`.
pub(crate) fn restain(
    source: &Image<u8>,
    source_matrix: &StainMatrix,
    target: &StainMatrix,
) -> NormResult<Image<u8>> {
    let od = color_math::rgb_to_od(source)?;
    let concentrations = source_matrix.concentrations(&od, CONCENTRATION_LAMBDA);
    reconstruct(&concentrations, target, source.width(), source.height())
}

/// Applies the optional brightness standardization ahead of stain estimation.
pub(crate) fn prepare(image: &Image<u8>, standardize_brightness: bool) -> NormResult<Image<u8>> {
    color_math::require_rgb(image, "stain normalization")?;
    if standardize_brightness {
        color_math::standardize_brightness(image)
    } else {
        Ok(image.clone())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::core_modules::image::Layout;

    #[test]
    fn stain_matrix_rows_are_ordered_by_red_density() {
        let matrix = StainMatrix::from_rows([EOSIN, HEMATOXYLIN]).unwrap();
        assert!(matrix.rows()[0][0] > matrix.rows()[1][0]);
        assert!(cosine(&matrix.rows()[0], &HEMATOXYLIN) > 0.9999);
    }

    #[test]
    fn stain_matrix_clamps_negative_entries() {
        let matrix = StainMatrix::from_rows([[0.7, 0.7, -0.2], [0.1, 0.9, 0.1]]).unwrap();
        for row in matrix.rows() {
            assert!(row.iter().all(|v| *v >= 0.0));
            let norm: f64 = row.iter().map(|v| v * v).sum::<f64>().sqrt();
            assert!((norm - 1.0).abs() < 1e-12);
        }
        assert!(StainMatrix::from_rows([[-1.0, -1.0, -1.0], EOSIN]).is_err());
    }

    #[test]
    fn lasso_recovers_exact_mixtures() {
        let matrix = StainMatrix::from_rows([HEMATOXYLIN, EOSIN]).unwrap();
        let rows = matrix.rows();
        let truth = [0.8, 0.3];
        let od: Vec<OdVector> = vec![[
            truth[0] * rows[0][0] + truth[1] * rows[1][0],
            truth[0] * rows[0][1] + truth[1] * rows[1][1],
            truth[0] * rows[0][2] + truth[1] * rows[1][2],
        ]];
        let concentrations = matrix.concentrations(&od, 0.0);
        let c = concentrations.values()[0];
        assert!((c[0] - truth[0]).abs() < 1e-9 && (c[1] - truth[1]).abs() < 1e-9);
    }

    #[test]
    fn lasso_never_goes_negative() {
        let matrix = StainMatrix::from_rows([HEMATOXYLIN, EOSIN]).unwrap();
        let od = vec![[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 0.0, 2.0], [0.01, 0.01, 0.01]];
        let concentrations = matrix.concentrations(&od, CONCENTRATION_LAMBDA);
        assert_eq!(concentrations.len(), 4);
        assert_eq!(concentrations.values()[0], [0.0, 0.0]);
        for c in concentrations.values() {
            assert!(c[0] >= 0.0 && c[1] >= 0.0);
        }
    }

    #[test]
    fn principal_axes_reject_single_color_images() {
        let flat = Image::new(4, 4, Layout::Rgb, [150u8, 80, 160].repeat(16)).unwrap();
        let od = tissue_optical_density(&flat).unwrap();
        assert_eq!(principal_axes(&od).unwrap_err().kind(), "numerical");
    }

    #[test]
    fn blank_slides_have_no_tissue() {
        let blank = Image::filled(8, 8, Layout::Rgb, 250u8);
        assert_eq!(tissue_optical_density(&blank).unwrap_err().kind(), "numerical");
        let empty = Image::<u8>::new(0, 0, Layout::Rgb, Vec::new()).unwrap();
        assert_eq!(tissue_optical_density(&empty).unwrap_err().kind(), "numerical");
    }

    #[test]
    fn reconstruction_with_the_same_matrix_is_near_identity() {
        let tile = he_tile();
        let matrix = StainMatrix::from_rows([HEMATOXYLIN, EOSIN]).unwrap();
        let od = color_math::rgb_to_od(&tile).unwrap();
        let concentrations = matrix.concentrations(&od, 0.0);
        let rebuilt = reconstruct(&concentrations, &matrix, tile.width(), tile.height()).unwrap();
        let worst = tile
            .data()
            .iter()
            .zip(rebuilt.data())
            .map(|(a, b)| (*a as i16 - *b as i16).abs())
            .max()
            .unwrap();
        assert!(worst <= 3, "worst channel error {worst}");
    }
}
