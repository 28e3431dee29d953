//! The capture-session supervisor.
//!
//! Drives one external capture process per attempt through the state
//! machine Idle → Starting → Running → {Stalled, Finished, Cancelled},
//! with a concurrent progress monitor, a stall/startup watchdog,
//! terminate-then-kill shutdown and a bounded retry loop that refreshes
//! the locator between attempts (ephemeral media URLs expire).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::metadata::SessionMetadata;
use crate::monitor::{LogSink, ProgressMonitor, ProgressTracker};
use crate::probe::{LivenessVerdict, MediaLocator};
use crate::session::SessionContext;
use crate::storage::StorageManager;
use crate::validate::{ArtifactValidator, DurationProbe, Validity};

/// Why a single capture attempt ended without a valid artifact.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to start capture process: {0}")]
    Spawn(#[source] anyhow::Error),

    #[error("no artifact growth for {0:?}")]
    Stalled(Duration),

    #[error("output file never appeared within {0:?}")]
    NeverStarted(Duration),

    #[error("capture process exited with status {0}")]
    ExitStatus(i32),

    #[error("artifact rejected: {0}")]
    InvalidArtifact(String),

    #[error("cancelled")]
    Cancelled,
}

/// Handle to a spawned capture child process.
pub trait ProcessHandle: Send {
    /// Non-blocking exit check; `None` while still running.
    fn poll(&mut self) -> Result<Option<i32>>;

    /// Ask the child to stop gracefully.
    fn terminate(&mut self) -> Result<()>;

    /// Force-kill the child.
    fn kill(&mut self) -> Result<()>;

    /// Wait up to `timeout` for exit; `None` on timeout.
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<i32>>;
}

/// Spawns the external capture tool for a locator.
pub trait CaptureSpawner {
    fn spawn(&self, locator: &MediaLocator, output: &Path) -> Result<Box<dyn ProcessHandle>>;
}

impl<S: CaptureSpawner + ?Sized> CaptureSpawner for &S {
    fn spawn(&self, locator: &MediaLocator, output: &Path) -> Result<Box<dyn ProcessHandle>> {
        (**self).spawn(locator, output)
    }
}

/// Terminal result of a whole capture session (all attempts).
#[derive(Debug)]
pub enum CaptureOutcome {
    Completed { artifact: PathBuf },
    Abandoned { reason: String },
    Cancelled,
}

pub struct CaptureSupervisor<'a, S, D> {
    config: &'a Config,
    spawner: &'a S,
    duration_probe: D,
    /// Watchdog poll cadence; shortened in tests
    tick: Duration,
}

impl<'a, S, D> CaptureSupervisor<'a, S, D>
where
    S: CaptureSpawner,
    D: DurationProbe,
{
    pub fn new(config: &'a Config, spawner: &'a S, duration_probe: D) -> Self {
        Self {
            config,
            spawner,
            duration_probe,
            tick: Duration::from_millis(250),
        }
    }

    #[cfg(test)]
    fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run the bounded retry loop for one session.
    ///
    /// `reprobe` is consulted before every retry; a target that went
    /// offline abandons the remaining budget instead of burning it.
    pub fn capture(
        &self,
        ctx: &SessionContext,
        storage: &StorageManager,
        metadata: &SessionMetadata,
        locator: MediaLocator,
        reprobe: &dyn Fn() -> LivenessVerdict,
    ) -> CaptureOutcome {
        let max_retries = self.config.capture.max_retries.max(1);
        let mut locator = locator;

        for attempt in 1..=max_retries {
            if ctx.cancel.is_cancelled() {
                return CaptureOutcome::Cancelled;
            }

            let output = match storage.unique_output_path(
                &metadata.title,
                &metadata.session_id,
                "mp4",
            ) {
                Ok(path) => path,
                Err(err) => {
                    return CaptureOutcome::Abandoned {
                        reason: format!("output path: {}", err),
                    };
                }
            };
            ctx.set_output(Some(output.clone()));

            info!(
                attempt,
                max_retries,
                url = locator.capture_url(),
                output = %output.display(),
                "starting capture attempt"
            );

            match self.run_attempt(ctx, &locator, &output) {
                Ok(()) => {
                    if ctx.cancel.is_cancelled() {
                        // Shutdown landed between child exit and validation
                        self.preserve_on_cancel(ctx, storage, &output);
                        return CaptureOutcome::Cancelled;
                    }
                    let validator = ArtifactValidator::new(
                        &self.duration_probe,
                        self.config.min_artifact_bytes(),
                        self.config.validation.min_duration_secs,
                    )
                    .with_cancel(ctx.cancel.clone());
                    match validator.validate(&output) {
                        Validity::Valid {
                            size,
                            duration_secs,
                        } => {
                            info!(
                                size,
                                duration_secs, "capture finished and artifact validated"
                            );
                            return CaptureOutcome::Completed { artifact: output };
                        }
                        Validity::Invalid(reason) => {
                            if ctx.cancel.is_cancelled() {
                                // Validation was cut short by shutdown, so
                                // the verdict is not trustworthy; keep the
                                // capture instead of deleting it
                                self.preserve_on_cancel(ctx, storage, &output);
                                return CaptureOutcome::Cancelled;
                            }
                            warn!(attempt, %reason, "artifact failed validation");
                            self.discard_invalid(storage, &output);
                        }
                    }
                }
                Err(CaptureError::Cancelled) => {
                    self.preserve_on_cancel(ctx, storage, &output);
                    return CaptureOutcome::Cancelled;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "capture attempt failed");
                    self.discard_invalid(storage, &output);
                }
            }

            if attempt == max_retries {
                break;
            }

            if !ctx.sleep_interruptible(self.config.retry_delay()) {
                return CaptureOutcome::Cancelled;
            }

            // Media URLs expire; refresh before retrying
            match reprobe() {
                LivenessVerdict::Live(fresh) => locator = fresh,
                LivenessVerdict::Offline => {
                    info!("target went offline, abandoning remaining retries");
                    return CaptureOutcome::Abandoned {
                        reason: "target went offline during retries".to_string(),
                    };
                }
            }
        }

        CaptureOutcome::Abandoned {
            reason: format!("all {} capture attempts failed", max_retries),
        }
    }

    /// One Starting → Running → terminal pass over the child process.
    fn run_attempt(
        &self,
        ctx: &SessionContext,
        locator: &MediaLocator,
        output: &Path,
    ) -> Result<(), CaptureError> {
        let mut handle = self
            .spawner
            .spawn(locator, output)
            .map_err(CaptureError::Spawn)?;

        let tracker = Arc::new(ProgressTracker::new());
        let monitor = ProgressMonitor::spawn(
            output.to_path_buf(),
            tracker.clone(),
            Box::new(LogSink),
            self.tick,
            Duration::from_secs(1),
        );

        let result = loop {
            if ctx.cancel.is_cancelled() {
                break Err(CaptureError::Cancelled);
            }

            match handle.poll() {
                Ok(Some(0)) => break Ok(()),
                Ok(Some(code)) => break Err(CaptureError::ExitStatus(code)),
                Ok(None) => {}
                Err(err) => break Err(CaptureError::Spawn(err)),
            }

            if tracker.waiting_for_file() {
                if tracker.elapsed() > self.config.startup_timeout() {
                    break Err(CaptureError::NeverStarted(self.config.startup_timeout()));
                }
            } else if tracker.since_last_growth() > self.config.stall_timeout() {
                break Err(CaptureError::Stalled(self.config.stall_timeout()));
            }

            std::thread::sleep(self.tick);
        };

        monitor.stop();

        match &result {
            Err(CaptureError::Stalled(_)) | Err(CaptureError::NeverStarted(_)) => {
                warn!("capture stalled, stopping child process");
                self.stop_child(handle.as_mut(), self.config.grace_period());
            }
            // A poll error means the child may still be alive; stop it
            // before the retry loop spawns another one
            Err(CaptureError::Spawn(_)) => {
                warn!("lost track of capture child, stopping it");
                self.stop_child(handle.as_mut(), self.config.grace_period());
            }
            Err(CaptureError::Cancelled) => {
                let grace = if self.config.capture.fast_exit || ctx.cancel.is_escalated() {
                    Duration::ZERO
                } else {
                    self.config.grace_period()
                };
                self.stop_child(handle.as_mut(), grace);
            }
            _ => {}
        }

        result
    }

    /// Terminate, wait out the grace period, then kill. Zero grace skips
    /// straight to kill.
    fn stop_child(&self, handle: &mut dyn ProcessHandle, grace: Duration) {
        if !grace.is_zero() {
            if handle.terminate().is_ok() {
                if let Ok(Some(_)) = handle.wait_timeout(grace) {
                    return;
                }
            }
        }
        let _ = handle.kill();
        let _ = handle.wait_timeout(Duration::from_secs(2));
    }

    /// An artifact that failed validation (or came from a failed process)
    /// is deleted; it never reaches post-processing.
    fn discard_invalid(&self, storage: &StorageManager, output: &Path) {
        storage.cleanup_temp_files(std::slice::from_ref(&output.to_path_buf()));
    }

    /// Cancellation preserves, never deletes, a non-empty partial capture
    /// (unless fast exit was requested).
    fn preserve_on_cancel(&self, ctx: &SessionContext, storage: &StorageManager, output: &Path) {
        if self.config.capture.fast_exit || ctx.cancel.is_escalated() {
            return;
        }
        let non_empty = std::fs::metadata(output).map(|m| m.len() > 0).unwrap_or(false);
        if non_empty {
            match storage.preserve_partial(output) {
                Ok(kept) => info!(kept = %kept.display(), "partial capture preserved"),
                Err(err) => warn!(error = %err, "could not preserve partial capture"),
            }
        }
    }
}
