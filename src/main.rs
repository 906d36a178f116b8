// Command-line runner for the `color_norm` library.
//
//   color_norm methods                              list the available methods as JSON
//   color_norm sweep                                empty the working directories once
//   color_norm <method> <source> [reference]        normalize and print the outcome
//
// Directories and analytics settings come from the `COLOR_NORM_*` environment variables.

use anyhow::{Context, bail};
use color_norm::{Method, NormalizationPipeline, PipelineConfig, ReclaimerConfig, ResourceReclaimer};
use std::path::Path;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: color_norm methods | sweep | <method> <source> [reference]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => bail!(USAGE),
        Some("methods") => {
            println!("{}", serde_json::to_string_pretty(&Method::catalog())?);
        }
        Some("sweep") => {
            let reclaimer = ResourceReclaimer::new(ReclaimerConfig::from_env());
            let report = tokio::task::spawn_blocking(move || reclaimer.sweep()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                bail!("{}", report.message);
            }
        }
        Some(method) => {
            let method: Method = method.parse()?;
            let source = args.get(1).context(USAGE)?;
            let reference = args.get(2).map(Path::new);
            let pipeline = NormalizationPipeline::new(PipelineConfig::from_env());
            let outcome = pipeline
                .run_paths(method, Path::new(source), reference)
                .with_context(|| format!("{method} normalization of {source} failed"))?;
            for path in outcome.result_paths() {
                println!("wrote {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }
    Ok(())
}
