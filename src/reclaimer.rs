// THEORY:
// The `reclaimer` keeps the working directories from growing without bound. Uploaded
// inputs and written results are only needed for the lifetime of a request, so every
// so often everything directly inside the two roots is deleted.
//
// Lifecycle:
//   Idle --start()--> Running --stop()--> Idle
//
// `start` sweeps once right away (so a restarted service begins clean), then hands a
// loop to the tokio runtime. The loop waits for whichever comes first: the interval
// elapsing, or the stop signal on a `watch` channel. Sweeps touch the filesystem, so they
// run on the blocking pool. `stop` raises the signal and waits for the loop with a
// bounded timeout; a loop that does not finish in time is abandoned and the reason is
// kept as a diagnostic.
//
// A sweep never fails loudly. Every entry that cannot be removed is logged and listed in
// the report, and the sweep carries on. A root that cannot even be listed marks the
// report unsuccessful. A root that does not exist is simply empty.
//
// Sweeps take no lock against in-flight requests. With the default 12 hour interval a
// collision is rare; a request that loses its files to a sweep fails with a resource
// error and can be retried.

use crate::error::{NormError, NormResult};
use crate::pipeline::{RESULTS_DIR_VAR, parse_var};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const UPLOADS_DIR_VAR: &str = "COLOR_NORM_UPLOADS_DIR";
pub const SWEEP_INTERVAL_VAR: &str = "COLOR_NORM_SWEEP_INTERVAL_SECS";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimerConfig {
    /// Where uploaded inputs are stored.
    pub upload_dir: PathBuf,
    /// Where the pipeline writes its results.
    pub result_dir: PathBuf,
    /// Time between periodic sweeps.
    pub interval: Duration,
    /// How long `stop` waits for the background loop.
    pub stop_timeout: Duration,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("static/images/uploads"),
            result_dir: PathBuf::from("static/images/results"),
            interval: DEFAULT_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl ReclaimerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = lookup(UPLOADS_DIR_VAR).filter(|d| !d.is_empty()) {
            config.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(RESULTS_DIR_VAR).filter(|d| !d.is_empty()) {
            config.result_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, SWEEP_INTERVAL_VAR).filter(|s| *s > 0) {
            config.interval = Duration::from_secs(secs);
        }
        config
    }

    fn roots(&self) -> Vec<PathBuf> {
        vec![self.upload_dir.clone(), self.result_dir.clone()]
    }
}

/// Result of one sweep over both roots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// False when a root could not be listed.
    pub success: bool,
    /// Top-level files and directories removed.
    pub items_removed: usize,
    pub message: String,
    /// One line per entry or root that could not be handled.
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped,
    TimedOut,
}

struct RunningLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodically empties the upload and result directories.
pub struct ResourceReclaimer {
    config: ReclaimerConfig,
    running: Option<RunningLoop>,
    last_diagnostic: Option<String>,
}

impl ResourceReclaimer {
    pub fn new(config: ReclaimerConfig) -> Self {
        Self {
            config,
            running: None,
            last_diagnostic: None,
        }
    }

    pub fn config(&self) -> &ReclaimerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Why the last `stop` did not end cleanly, if it did not.
    pub fn last_diagnostic(&self) -> Option<&str> {
        self.last_diagnostic.as_deref()
    }

    /// Removes everything directly inside both roots.
    pub fn sweep(&self) -> SweepReport {
        sweep_roots(&self.config.roots())
    }

    /// Sweeps once, then keeps sweeping every interval on the current tokio runtime.
    /// Returns the report of the initial sweep, or `None` when already running.
    pub fn start(&mut self) -> NormResult<Option<SweepReport>> {
        if self.running.is_some() {
            warn!("Reclaimer is already running");
            return Ok(None);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| NormError::Resource(format!("reclaimer needs a tokio runtime: {e}")))?;

        let initial = self.sweep();
        let (stop, mut stop_signal) = watch::channel(false);
        let roots = self.config.roots();
        let interval = self.config.interval;

        let handle = runtime.spawn(async move {
            info!(interval_secs = interval.as_secs(), "Reclaimer started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let roots = roots.clone();
                        let sweep = tokio::task::spawn_blocking(move || sweep_roots(&roots));
                        if let Err(e) = sweep.await {
                            error!(error = %e, "Periodic sweep did not complete");
                        }
                    }
                    _ = stop_signal.changed() => break,
                }
            }
            info!("Reclaimer stopped");
        });

        self.running = Some(RunningLoop { stop, handle });
        Ok(Some(initial))
    }

    /// Signals the loop to stop and waits up to `stop_timeout` for it.
    pub async fn stop(&mut self) -> StopOutcome {
        let Some(RunningLoop { stop, handle }) = self.running.take() else {
            return StopOutcome::NotRunning;
        };
        // A closed channel means the loop is already gone, which is fine.
        let _ = stop.send(true);

        match tokio::time::timeout(self.config.stop_timeout, handle).await {
            Ok(Ok(())) => {
                self.last_diagnostic = None;
                StopOutcome::Stopped
            }
            Ok(Err(e)) => {
                let diagnostic = format!("reclaimer loop ended abnormally: {e}");
                error!("{diagnostic}");
                self.last_diagnostic = Some(diagnostic);
                StopOutcome::Stopped
            }
            Err(_) => {
                let diagnostic = format!(
                    "reclaimer loop did not stop within {:?} and was abandoned",
                    self.config.stop_timeout
                );
                warn!("{diagnostic}");
                self.last_diagnostic = Some(diagnostic);
                StopOutcome::TimedOut
            }
        }
    }
}

impl Drop for ResourceReclaimer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop.send(true);
        }
    }
}

fn remove_entry(path: &Path, is_dir: bool) -> std::io::Result<()> {
    if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn sweep_roots(roots: &[PathBuf]) -> SweepReport {
    let mut report = SweepReport {
        success: true,
        ..SweepReport::default()
    };

    for root in roots {
        if !root.exists() {
            debug!(root = %root.display(), "Skipping missing directory");
            continue;
        }
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                error!(root = %root.display(), error = %e, "Cannot list directory");
                report.success = false;
                report.failures.push(format!("{}: {e}", root.display()));
                continue;
            }
        };
        for entry in entries {
            let outcome = entry.and_then(|entry| {
                let is_dir = entry.file_type()?.is_dir();
                let path = entry.path();
                remove_entry(&path, is_dir).map_err(|e| {
                    std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))
                })
            });
            match outcome {
                Ok(()) => report.items_removed += 1,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "Failed to remove entry");
                    report.failures.push(e.to_string());
                }
            }
        }
    }

    report.message = if !report.success {
        format!("Cleanup failed: {}", report.failures.join("; "))
    } else if report.failures.is_empty() {
        format!("Cleanup completed: {} items removed", report.items_removed)
    } else {
        format!(
            "Cleanup completed with {} failures: {} items removed",
            report.failures.len(),
            report.items_removed
        )
    };
    info!(
        success = report.success,
        items_removed = report.items_removed,
        failures = report.failures.len(),
        "Sweep finished"
    );
    report
}
