// THEORY:
// The `image` module defines the one data container every other module speaks. An
// `Image<T>` is a "dumb" row-major, channel-interleaved buffer plus an explicit `Layout`
// tag, so grayscale vs RGB is a checked property instead of something guessed from an
// array shape at runtime.
//
// Two sample types flow through the engine:
// - `u8` in [0, 255]: the canonical interchange and storage format. Every normalizer
//   accepts it at its public boundary.
// - `f32` in [0, 1]:  the working format for percentile and histogram math.
//
// Normalizers hand their results back as a `RawImage`, and `RawImage::into_canonical`
// is the single place where working images become storable 8-bit images again. The rule
// is fixed: float outputs whose maximum is <= 1.0 are normalized and get scaled by 255,
// anything else is taken as-is; either way values are rounded and clamped, never
// truncated.
//
// Decoding and encoding go through the `image` crate; PNG is the storage format for
// results.

use crate::error::{NormError, NormResult};
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// The channel arrangement of an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// One sample per pixel.
    Gray,
    /// Three interleaved samples per pixel, in R, G, B order.
    Rgb,
}

impl Layout {
    pub fn channels(self) -> usize {
        match self {
            Layout::Gray => 1,
            Layout::Rgb => 3,
        }
    }
}

/// A 2D grayscale or RGB image stored row-major with interleaved channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Image<T> {
    /// Width in pixels.
    width: u32,
    /// Height in pixels.
    height: u32,
    /// Channel arrangement of `data`.
    layout: Layout,
    /// `width * height * layout.channels()` samples.
    data: Vec<T>,
}

impl<T: Copy> Image<T> {
    /// Wraps a sample buffer, checking that its length matches the dimensions.
    pub fn new(width: u32, height: u32, layout: Layout, data: Vec<T>) -> NormResult<Self> {
        let expected = width as usize * height as usize * layout.channels();
        if data.len() != expected {
            return Err(NormError::InvalidInput(format!(
                "buffer holds {} samples but a {}x{} {:?} image needs {}",
                data.len(),
                width,
                height,
                layout,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            layout,
            data,
        })
    }

    /// An image where every sample has the same value.
    pub fn filled(width: u32, height: u32, layout: Layout, value: T) -> Self {
        let len = width as usize * height as usize * layout.channels();
        Self {
            width,
            height,
            layout,
            data: vec![value; len],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn channels(&self) -> usize {
        self.layout.channels()
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_count() == 0
    }

    pub fn is_rgb(&self) -> bool {
        self.layout == Layout::Rgb
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Iterates pixels as slices of `channels()` samples.
    pub fn pixels(&self) -> std::slice::ChunksExact<'_, T> {
        self.data.chunks_exact(self.layout.channels())
    }

    /// Iterates the samples of a single channel.
    pub fn channel(&self, index: usize) -> impl Iterator<Item = T> + '_ {
        self.data
            .iter()
            .skip(index)
            .step_by(self.layout.channels())
            .copied()
    }

    /// Applies `f` to every sample, keeping dimensions and layout.
    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Image<U> {
        Image {
            width: self.width,
            height: self.height,
            layout: self.layout,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Same dimensions and layout, new samples. Callers guarantee the length.
    pub(crate) fn with_data<U: Copy>(&self, data: Vec<U>) -> Image<U> {
        debug_assert_eq!(data.len(), self.data.len());
        Image {
            width: self.width,
            height: self.height,
            layout: self.layout,
            data,
        }
    }

    /// Same dimensions, different layout. Callers guarantee the length.
    pub(crate) fn with_layout<U: Copy>(&self, layout: Layout, data: Vec<U>) -> Image<U> {
        debug_assert_eq!(data.len(), self.pixel_count() * layout.channels());
        Image {
            width: self.width,
            height: self.height,
            layout,
            data,
        }
    }
}

/// Weights of the luminance used for grayscale reduction (ITU-R BT.709).
const GRAY_WEIGHTS: [f32; 3] = [0.2125, 0.7154, 0.0721];

impl Image<u8> {
    /// Converts to the [0, 1] working representation.
    pub fn to_float(&self) -> Image<f32> {
        self.map(|v| v as f32 / 255.0)
    }

    /// Builds a canonical image from anything the `image` crate decoded. Images without
    /// color become `Gray`; everything else (alpha, 16-bit, float) becomes 8-bit `Rgb`.
    pub fn from_dynamic(decoded: &DynamicImage) -> Self {
        if decoded.color().has_color() {
            let rgb = decoded.to_rgb8();
            let (width, height) = rgb.dimensions();
            Self {
                width,
                height,
                layout: Layout::Rgb,
                data: rgb.into_raw(),
            }
        } else {
            let gray = decoded.to_luma8();
            let (width, height) = gray.dimensions();
            Self {
                width,
                height,
                layout: Layout::Gray,
                data: gray.into_raw(),
            }
        }
    }

    /// Decodes an image file. Unreadable or undecodable files are invalid input.
    pub fn load(path: &Path) -> NormResult<Self> {
        let decoded = image::open(path).map_err(|e| {
            NormError::InvalidInput(format!("could not read image {}: {e}", path.display()))
        })?;
        Ok(Self::from_dynamic(&decoded))
    }

    /// Encodes the image as PNG at `path`.
    pub fn save_png(&self, path: &Path) -> NormResult<()> {
        let output = BufWriter::new(File::create(path)?);
        let encoder = image::codecs::png::PngEncoder::new(output);
        let color = match self.layout {
            Layout::Gray => ExtendedColorType::L8,
            Layout::Rgb => ExtendedColorType::Rgb8,
        };
        encoder.write_image(&self.data, self.width, self.height, color)?;
        Ok(())
    }
}

impl Image<f32> {
    /// Reduces an RGB image to luminance. Grayscale images are returned as a copy.
    pub fn to_gray(&self) -> Image<f32> {
        match self.layout {
            Layout::Gray => self.clone(),
            Layout::Rgb => {
                let data: Vec<f32> = self
                    .pixels()
                    .map(|p| {
                        GRAY_WEIGHTS[0] * p[0] + GRAY_WEIGHTS[1] * p[1] + GRAY_WEIGHTS[2] * p[2]
                    })
                    .collect();
                self.with_layout(Layout::Gray, data)
            }
        }
    }

    pub fn max_sample(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }
}

/// A normalizer result before it is turned into the canonical storage format.
#[derive(Debug, Clone, PartialEq)]
pub enum RawImage {
    /// Already 8-bit.
    Canonical(Image<u8>),
    /// Floating point samples, usually normalized to [0, 1].
    Float(Image<f32>),
}

impl RawImage {
    pub fn width(&self) -> u32 {
        match self {
            RawImage::Canonical(image) => image.width(),
            RawImage::Float(image) => image.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            RawImage::Canonical(image) => image.height(),
            RawImage::Float(image) => image.height(),
        }
    }

    /// Converts to 8-bit. Floats with a maximum <= 1.0 are scaled by 255, otherwise
    /// they are used directly; values are rounded and clamped to [0, 255].
    pub fn into_canonical(self) -> Image<u8> {
        match self {
            RawImage::Canonical(image) => image,
            RawImage::Float(image) => {
                let scale = if image.max_sample() <= 1.0 { 255.0 } else { 1.0 };
                image.map(|v| to_u8(v * scale))
            }
        }
    }
}

/// Rounds and clamps a sample into the 8-bit range. NaN maps to 0.
pub fn to_u8(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffers() {
        let err = Image::new(2, 2, Layout::Rgb, vec![0u8; 11]).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(Image::new(2, 2, Layout::Gray, vec![0u8; 4]).is_ok());
    }

    #[test]
    fn channel_iterates_interleaved_samples() {
        let image = Image::new(2, 1, Layout::Rgb, vec![1u8, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(image.channel(0).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(image.channel(2).collect::<Vec<_>>(), vec![3, 6]);
        assert_eq!(image.pixels().count(), 2);
    }

    #[test]
    fn normalized_floats_are_rescaled() {
        let float = Image::new(3, 1, Layout::Gray, vec![0.0f32, 0.5, 1.0]).unwrap();
        let canonical = RawImage::Float(float).into_canonical();
        assert_eq!(canonical.data(), &[0, 128, 255]);
    }

    #[test]
    fn large_floats_are_clamped_not_wrapped() {
        let float = Image::new(3, 1, Layout::Gray, vec![12.4f32, 254.6, 300.0]).unwrap();
        let canonical = RawImage::Float(float).into_canonical();
        assert_eq!(canonical.data(), &[12, 255, 255]);
    }

    #[test]
    fn gray_reduction_of_white_is_white() {
        let white = Image::filled(2, 2, Layout::Rgb, 1.0f32);
        let gray = white.to_gray();
        assert_eq!(gray.layout(), Layout::Gray);
        assert!(gray.data().iter().all(|v| (v - 1.0).abs() < 1e-4));
    }

    #[test]
    fn png_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.png");
        let data: Vec<u8> = (0..(4 * 3 * 3)).map(|v| (v * 7) as u8).collect();
        let image = Image::new(4, 3, Layout::Rgb, data).unwrap();
        image.save_png(&path).unwrap();
        let loaded = Image::load(&path).unwrap();
        assert_eq!(loaded, image);
    }

    #[test]
    fn unreadable_files_are_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_an_image.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        assert_eq!(Image::load(&path).unwrap_err().kind(), "invalid_input");
    }
}
