// THEORY:
// `color_math` holds the numeric primitives shared by the normalizers. Nothing in here
// knows about fitting or references; every function is a pure, single-purpose transform.
//
// - Optical density (OD): Beer-Lambert turns transmitted light into absorbance,
//   `OD = -ln(I / 255)`. In OD space the contributions of several stains add linearly,
//   which is what makes stain separation a linear-algebra problem. Zero samples have
//   infinite density, so they are lifted to 1 before the logarithm.
// - CIE L*a*b*: a perceptual, largely decorrelated space (lightness plus two chroma
//   axes). It drives both Reinhard statistics transfer and the "not white" tissue mask.
//   Conversion assumes sRGB companding and a D65 white point.
// - Percentiles follow the linear-interpolation definition used by numpy, so percentile
//   based thresholds behave the same on small images as on large ones.

use crate::core_modules::image::{Image, Layout, to_u8};
use crate::error::{NormError, NormResult};

/// Optical-density vector of one RGB pixel.
pub type OdVector = [f64; 3];

/// Intensity of unattenuated light.
pub const WHITE: f64 = 255.0;

// sRGB (D65) -> XYZ and back.
const RGB_TO_XYZ: [[f64; 3]; 3] = [
    [0.4124564, 0.3575761, 0.1804375],
    [0.2126729, 0.7151522, 0.0721750],
    [0.0193339, 0.1191920, 0.9503041],
];
const XYZ_TO_RGB: [[f64; 3]; 3] = [
    [3.2404542, -1.5371385, -0.4985314],
    [-0.9692660, 1.8760108, 0.0415560],
    [0.0556434, -0.2040259, 1.0572252],
];
const D65_WHITE: [f64; 3] = [0.95047, 1.0, 1.08883];
const LAB_DELTA: f64 = 6.0 / 29.0;

/// Converts an RGB image to per-pixel optical density.
pub fn rgb_to_od(image: &Image<u8>) -> NormResult<Vec<OdVector>> {
    require_rgb(image, "optical density conversion")?;
    Ok(image
        .pixels()
        .map(|p| {
            [
                sample_to_od(p[0]),
                sample_to_od(p[1]),
                sample_to_od(p[2]),
            ]
        })
        .collect())
}

fn sample_to_od(sample: u8) -> f64 {
    let lifted = sample.max(1) as f64;
    -(lifted / WHITE).ln()
}

/// Converts optical densities back into an 8-bit RGB image of the given size.
pub fn od_to_rgb(od: &[OdVector], width: u32, height: u32) -> NormResult<Image<u8>> {
    let data: Vec<u8> = od
        .iter()
        .flat_map(|v| v.map(|d| to_u8((WHITE * (-d).exp()) as f32)))
        .collect();
    Image::new(width, height, Layout::Rgb, data)
}

/// Scales each row to unit L2 norm. A row with no length cannot describe a direction.
pub fn normalize_rows(rows: &mut [[f64; 3]]) -> NormResult<()> {
    for row in rows.iter_mut() {
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        if !norm.is_finite() || norm < 1e-12 {
            return Err(NormError::Numerical(
                "cannot normalize a zero-length stain vector".into(),
            ));
        }
        for v in row.iter_mut() {
            *v /= norm;
        }
    }
    Ok(())
}

/// True for pixels whose L* lightness (scaled to [0, 1]) is below `threshold`.
pub fn notwhite_mask(image: &Image<u8>, threshold: f64) -> NormResult<Vec<bool>> {
    require_rgb(image, "tissue masking")?;
    Ok(image
        .pixels()
        .map(|p| {
            let lab = rgb_to_lab([p[0] as f64, p[1] as f64, p[2] as f64]);
            lab[0] / 100.0 < threshold
        })
        .collect())
}

/// -1, 0 or +1 following the sign of `x`.
pub fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f64) -> f64 {
    if c <= 0.0031308 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn lab_f(t: f64) -> f64 {
    if t > LAB_DELTA.powi(3) {
        t.cbrt()
    } else {
        t / (3.0 * LAB_DELTA * LAB_DELTA) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f64) -> f64 {
    if t > LAB_DELTA {
        t.powi(3)
    } else {
        3.0 * LAB_DELTA * LAB_DELTA * (t - 4.0 / 29.0)
    }
}

fn mat_vec(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// RGB in [0, 255] to L*a*b* (L* in [0, 100]).
pub fn rgb_to_lab(rgb: [f64; 3]) -> [f64; 3] {
    let linear = rgb.map(|c| srgb_to_linear(c / WHITE));
    let xyz = mat_vec(&RGB_TO_XYZ, linear);
    let fx = lab_f(xyz[0] / D65_WHITE[0]);
    let fy = lab_f(xyz[1] / D65_WHITE[1]);
    let fz = lab_f(xyz[2] / D65_WHITE[2]);
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// L*a*b* back to RGB in the [0, 255] scale. Out-of-gamut colors are not clamped.
pub fn lab_to_rgb(lab: [f64; 3]) -> [f64; 3] {
    let fy = (lab[0] + 16.0) / 116.0;
    let fx = fy + lab[1] / 500.0;
    let fz = fy - lab[2] / 200.0;
    let xyz = [
        lab_f_inv(fx) * D65_WHITE[0],
        lab_f_inv(fy) * D65_WHITE[1],
        lab_f_inv(fz) * D65_WHITE[2],
    ];
    mat_vec(&XYZ_TO_RGB, xyz).map(|c| linear_to_srgb(c) * WHITE)
}

/// Linear-interpolation percentile of already sorted data, `q` in [0, 100].
pub fn percentile(sorted: &[f64], q: f64) -> NormResult<f64> {
    if sorted.is_empty() {
        return Err(NormError::Numerical("percentile of an empty sample".into()));
    }
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Ok(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Sorts a copy of `values` (NaN-free input assumed) and takes a percentile.
pub fn percentile_of(values: &[f64], q: f64) -> NormResult<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile(&sorted, q)
}

/// Stretches intensities so the 90th percentile sample becomes white.
pub fn standardize_brightness(image: &Image<u8>) -> NormResult<Image<u8>> {
    let samples: Vec<f64> = image.data().iter().map(|&v| v as f64).collect();
    let p90 = percentile_of(&samples, 90.0)?;
    if p90 <= 0.0 {
        return Err(NormError::Numerical(
            "cannot standardize the brightness of a black image".into(),
        ));
    }
    Ok(image.map(|v| to_u8((v as f64 * WHITE / p90) as f32)))
}

pub(crate) fn require_rgb<T: Copy>(image: &Image<T>, purpose: &str) -> NormResult<()> {
    if image.layout() != Layout::Rgb {
        return Err(NormError::InvalidInput(format!(
            "{purpose} requires an RGB image, got {:?}",
            image.layout()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_color_image() -> Image<u8> {
        // 16 x 16 x 16 lattice of colors including 0 and 255 on every axis.
        let levels: Vec<u8> = (0..16).map(|i| (i * 17) as u8).collect();
        let mut data = Vec::new();
        for &r in &levels {
            for &g in &levels {
                for &b in &levels {
                    data.extend_from_slice(&[r, g, b]);
                }
            }
        }
        Image::new(64, 64, Layout::Rgb, data).unwrap()
    }

    #[test]
    fn od_round_trip_is_within_one_level() {
        let image = every_color_image();
        let od = rgb_to_od(&image).unwrap();
        let back = od_to_rgb(&od, image.width(), image.height()).unwrap();
        for (a, b) in image.data().iter().zip(back.data()) {
            assert!((*a as i16 - *b as i16).abs() <= 1, "{a} vs {b}");
        }
    }

    #[test]
    fn od_of_white_is_zero_and_black_is_finite() {
        let image = Image::new(2, 1, Layout::Rgb, vec![255, 255, 255, 0, 0, 0]).unwrap();
        let od = rgb_to_od(&image).unwrap();
        assert_eq!(od[0], [0.0, 0.0, 0.0]);
        assert!(od[1].iter().all(|v| v.is_finite() && *v > 5.0));
    }

    #[test]
    fn od_requires_rgb() {
        let gray = Image::filled(2, 2, Layout::Gray, 10u8);
        assert_eq!(rgb_to_od(&gray).unwrap_err().kind(), "invalid_input");
    }

    #[test]
    fn rows_become_unit_length() {
        let mut rows = [[3.0, 4.0, 0.0], [1.0, 1.0, 1.0]];
        normalize_rows(&mut rows).unwrap();
        assert!((rows[0][0] - 0.6).abs() < 1e-12);
        let norm: f64 = rows[1].iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_rows_are_a_numerical_error() {
        let mut rows = [[0.0, 0.0, 0.0]];
        assert_eq!(normalize_rows(&mut rows).unwrap_err().kind(), "numerical");
    }

    #[test]
    fn white_is_masked_out_and_tissue_kept() {
        let image = Image::new(
            3,
            1,
            Layout::Rgb,
            vec![255, 255, 255, 240, 240, 240, 150, 80, 160],
        )
        .unwrap();
        assert_eq!(notwhite_mask(&image, 0.8).unwrap(), vec![false, false, true]);
    }

    #[test]
    fn sign_covers_all_cases() {
        assert_eq!(sign(3.5), 1.0);
        assert_eq!(sign(-0.1), -1.0);
        assert_eq!(sign(0.0), 0.0);
    }

    #[test]
    fn lab_round_trip() {
        let samples = [
            [0.0, 0.0, 0.0],
            [255.0, 255.0, 255.0],
            [200.0, 150.0, 100.0],
            [12.0, 250.0, 77.0],
        ];
        for rgb in samples {
            let back = lab_to_rgb(rgb_to_lab(rgb));
            for c in 0..3 {
                assert!((back[c] - rgb[c]).abs() < 1e-3, "{rgb:?} -> {back:?}");
            }
        }
        let white = rgb_to_lab([255.0, 255.0, 255.0]);
        assert!((white[0] - 100.0).abs() < 1e-3);
        assert!(white[1].abs() < 1e-2 && white[2].abs() < 1e-2);
    }

    #[test]
    fn percentile_matches_linear_interpolation() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0).unwrap(), 1.0);
        assert_eq!(percentile(&sorted, 50.0).unwrap(), 3.0);
        assert!((percentile(&sorted, 90.0).unwrap() - 4.6).abs() < 1e-12);
        assert!(percentile(&[], 50.0).is_err());
    }

    #[test]
    fn brightness_standardization_whitens_the_90th_percentile() {
        let data: Vec<u8> = (0..100).map(|v| v as u8 * 2).collect();
        let image = Image::new(10, 10, Layout::Gray, data).unwrap();
        let standardized = standardize_brightness(&image).unwrap();
        assert_eq!(*standardized.data().iter().max().unwrap(), 255);
        assert_eq!(standardized.data()[0], 0);
        let black = Image::filled(2, 2, Layout::Rgb, 0u8);
        assert_eq!(standardize_brightness(&black).unwrap_err().kind(), "numerical");
    }
}
