// THEORY:
// The `pipeline` module is the top-level API of the normalization engine. One call to
// `run` takes a request all the way from decoded pixels to files on disk plus chart
// data:
//
//   validate -> claim output dir -> fit -> transform -> canonicalize -> write PNGs
//            -> analytics -> commit
//
// Output lives in `<results_root>/<method>_<source stem>/`. The directory is held by an
// `OutputDir` guard for the whole run. Only `commit` makes the written files permanent;
// any early return (an error from any stage) drops the guard, which removes every file
// it wrote and every directory this run created, up to a results root that did not exist
// yet. A failed request therefore never leaves partial artifacts behind.
//
// The pipeline owns nothing but immutable configuration, so one instance can serve many
// requests at once.

use crate::core_modules::analytics::{AnalyticsConfig, AnalyticsExtractor, ChartData};
use crate::core_modules::image::{Image, RawImage};
use crate::core_modules::normalizer::{
    Method, NormalizerConfig, NormalizerOutput, required_reference,
};
use crate::error::{NormError, NormResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

pub const RESULTS_DIR_VAR: &str = "COLOR_NORM_RESULTS_DIR";
pub const SCATTER_CAP_VAR: &str = "COLOR_NORM_SCATTER_CAP";
pub const SCATTER_SEED_VAR: &str = "COLOR_NORM_SCATTER_SEED";

/// Configuration for the NormalizationPipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Parent of every per-request output directory.
    pub results_root: PathBuf,
    pub normalizer: NormalizerConfig,
    pub analytics: AnalyticsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            results_root: PathBuf::from("static/images/results"),
            normalizer: NormalizerConfig::default(),
            analytics: AnalyticsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `COLOR_NORM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`. Unparsable values are
    /// logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = lookup(RESULTS_DIR_VAR).filter(|d| !d.is_empty()) {
            config.results_root = PathBuf::from(dir);
        }
        if let Some(cap) = parse_var(&lookup, SCATTER_CAP_VAR) {
            config.analytics.scatter_cap = cap;
        }
        if let Some(seed) = parse_var(&lookup, SCATTER_SEED_VAR) {
            config.analytics.scatter_seed = Some(seed);
        }
        config
    }
}

pub(crate) fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}

/// One normalization job.
#[derive(Debug, Clone, Copy)]
pub struct NormalizationRequest<'a> {
    pub method: Method,
    pub source: &'a Image<u8>,
    /// Required by every method except histogram equalization.
    pub reference: Option<&'a Image<u8>>,
    /// Base name of the source file, used to name the output directory.
    pub source_stem: &'a str,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizationOutcome {
    Single {
        result: PathBuf,
        analytics: ChartData,
    },
    Equalization {
        results: BTreeMap<String, PathBuf>,
        analytics: ChartData,
    },
}

impl NormalizationOutcome {
    pub fn analytics(&self) -> &ChartData {
        match self {
            NormalizationOutcome::Single { analytics, .. } => analytics,
            NormalizationOutcome::Equalization { analytics, .. } => analytics,
        }
    }

    /// Every image file written by the run.
    pub fn result_paths(&self) -> Vec<&Path> {
        match self {
            NormalizationOutcome::Single { result, .. } => vec![result.as_path()],
            NormalizationOutcome::Equalization { results, .. } => {
                results.values().map(PathBuf::as_path).collect()
            }
        }
    }
}

/// Scoped claim on a request's output directory. Uncommitted output is removed on drop.
struct OutputDir {
    path: PathBuf,
    /// Outermost directory this guard created, if any.
    created: Option<PathBuf>,
    written: Vec<PathBuf>,
    committed: bool,
}

impl OutputDir {
    fn acquire(path: PathBuf) -> NormResult<Self> {
        let created = path
            .ancestors()
            .filter(|dir| !dir.as_os_str().is_empty())
            .take_while(|dir| !dir.exists())
            .last()
            .map(Path::to_path_buf);
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            created,
            written: Vec::new(),
            committed: false,
        })
    }

    fn write_png(&mut self, file_name: &str, image: &Image<u8>) -> NormResult<PathBuf> {
        let target = self.path.join(file_name);
        // Tracked before writing so a half-written file is cleaned up too.
        self.written.push(target.clone());
        image.save_png(&target)?;
        Ok(target)
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for OutputDir {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for file in &self.written {
            if let Err(e) = fs::remove_file(file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %file.display(), error = %e, "Failed to remove partial output");
                }
            }
        }
        if let Some(dir) = &self.created {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!(path = %dir.display(), error = %e, "Failed to remove output directory");
            }
        }
        debug!(path = %self.path.display(), "Rolled back uncommitted output");
    }
}

fn validate_stem(stem: &str) -> NormResult<()> {
    let mut components = Path::new(stem).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !stem.contains(['/', '\\']) => Ok(()),
        _ => Err(NormError::InvalidInput(format!(
            "source name '{stem}' must be a single, non-empty file name"
        ))),
    }
}

/// Base name of a file: everything before the first '.'.
fn file_stem(path: &Path) -> NormResult<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| {
            NormError::InvalidInput(format!("cannot derive a name from {}", path.display()))
        })
}

/// The main, top-level struct of the normalization engine.
pub struct NormalizationPipeline {
    config: PipelineConfig,
    analytics: AnalyticsExtractor,
}

impl NormalizationPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let analytics = AnalyticsExtractor::new(config.analytics.clone());
        Self { config, analytics }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Normalizes one request and writes its results under the results root.
    pub fn run(&self, request: &NormalizationRequest<'_>) -> NormResult<NormalizationOutcome> {
        let method = request.method;
        validate_stem(request.source_stem)?;
        let reference = if method.requires_reference() {
            Some(required_reference(method, request.reference)?)
        } else {
            if request.reference.is_some() {
                debug!(method = %method, "Ignoring reference image");
            }
            None
        };

        info!(
            method = %method,
            stem = request.source_stem,
            width = request.source.width(),
            height = request.source.height(),
            "Starting normalization"
        );
        let directory = self
            .config
            .results_root
            .join(format!("{}_{}", method.key(), request.source_stem));
        let mut output = OutputDir::acquire(directory)?;

        let mut normalizer = method.normalizer(&self.config.normalizer);
        normalizer.fit(reference)?;
        let outcome = match normalizer.transform(request.source)? {
            NormalizerOutput::Single(raw) => {
                let result = raw.into_canonical();
                let path = output.write_png(&format!("{}_result.png", method.key()), &result)?;
                let mut labeled = vec![("source", request.source)];
                if let Some(reference) = reference {
                    labeled.push(("reference", reference));
                }
                labeled.push(("result", &result));
                let analytics = self.analytics.extract(labeled)?;
                NormalizationOutcome::Single {
                    result: path,
                    analytics,
                }
            }
            NormalizerOutput::Equalization(set) => {
                let stages: Vec<(&str, Image<u8>)> = set
                    .into_named()
                    .into_iter()
                    .map(|(name, image)| (name, RawImage::Float(image).into_canonical()))
                    .collect();
                let mut results = BTreeMap::new();
                for (name, image) in &stages {
                    let path = output.write_png(&format!("histogram_{name}.png"), image)?;
                    results.insert(name.to_string(), path);
                }
                let analytics = self
                    .analytics
                    .extract(stages.iter().map(|(name, image)| (*name, image)))?;
                NormalizationOutcome::Equalization { results, analytics }
            }
        };

        output.commit();
        info!(
            method = %method,
            stem = request.source_stem,
            files = outcome.result_paths().len(),
            "Finished normalization"
        );
        Ok(outcome)
    }

    /// Decodes the images at the given paths and runs them. The output directory is
    /// named after the source file.
    pub fn run_paths(
        &self,
        method: Method,
        source_path: &Path,
        reference_path: Option<&Path>,
    ) -> NormResult<NormalizationOutcome> {
        let source = Image::load(source_path)?;
        let reference = match reference_path {
            Some(path) if method.requires_reference() => Some(Image::load(path)?),
            _ => None,
        };
        self.run(&NormalizationRequest {
            method,
            source: &source,
            reference: reference.as_ref(),
            source_stem: file_stem(source_path)?,
        })
    }
}
