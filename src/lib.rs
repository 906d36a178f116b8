// THEORY:
// This file is the main entry point for the `color_norm` library crate. It exports the
// `NormalizationPipeline` and the `ResourceReclaimer` as the high-level interface, plus
// the data structures a host needs to talk to them (`Method`, `Image`, `NormError`,
// the analytics payload). The algorithms live in `core_modules`; they are public so a
// host can drive a single normalizer directly, but most callers only need the pipeline.

pub mod core_modules;
pub mod error;
pub mod pipeline;
pub mod reclaimer;

pub use crate::core_modules::analytics::{AnalyticsConfig, ChartData};
pub use crate::core_modules::image::{Image, Layout, RawImage};
pub use crate::core_modules::normalizer::{Method, MethodInfo, Normalizer, NormalizerConfig};
pub use crate::error::{NormError, NormResult};
pub use crate::pipeline::{
    NormalizationOutcome, NormalizationPipeline, NormalizationRequest, PipelineConfig,
};
pub use crate::reclaimer::{ReclaimerConfig, ResourceReclaimer, StopOutcome, SweepReport};
