pub mod analytics;
pub mod color_math;
pub mod histogram_equalization;
pub mod histogram_matching;
pub mod image;
pub mod macenko;
pub mod normalizer;
pub mod reinhard;
pub mod stain;
pub mod vahadane;
