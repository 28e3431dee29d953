//! The top-level session loop and its cancellation plumbing.
//!
//! One loop per process, one target per loop: poll until live, capture,
//! validate, post-process, clean up, sleep, repeat. Cancellation is a
//! token set by the signal handler and observed cooperatively at every
//! suspension point; all cleanup happens in normal control flow.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metadata::{MetadataResolver, PageFetch, SessionMetadata};
use crate::postprocess::{PostProcessor, Transcoder};
use crate::probe::{DirectResolver, FallbackProbe, LivenessProbe, LivenessVerdict};
use crate::storage::StorageManager;
use crate::supervisor::{CaptureOutcome, CaptureSpawner, CaptureSupervisor};
use crate::validate::DurationProbe;

/// Granularity of interruptible sleeps; shutdown latency stays within
/// roughly one tick.
const SLEEP_TICK: Duration = Duration::from_millis(250);

/// Process-wide cancellation token.
///
/// The signal handler's only job is to bump the counter. One delivery
/// requests a graceful stop; a second escalates to grace-free termination.
#[derive(Clone, Default)]
pub struct CancelToken {
    deliveries: Arc<AtomicUsize>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one cancellation delivery; returns the delivery count.
    pub fn trigger(&self) -> usize {
        self.deliveries.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_cancelled(&self) -> bool {
        self.deliveries.load(Ordering::SeqCst) > 0
    }

    /// True once a second delivery demanded immediate termination.
    pub fn is_escalated(&self) -> bool {
        self.deliveries.load(Ordering::SeqCst) >= 2
    }

    /// Sleep in short ticks, returning early (false) when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_cancelled() {
                return false;
            }
            let tick = remaining.min(SLEEP_TICK);
            std::thread::sleep(tick);
            remaining -= tick;
        }
        !self.is_cancelled()
    }
}

/// Files belonging to the in-flight capture attempt, tracked so
/// cancellation cleanup knows what to preserve or delete.
#[derive(Debug, Clone, Default)]
pub struct AttemptFiles {
    pub output: Option<PathBuf>,
    pub thumbnail: Option<PathBuf>,
}

/// Shared state between the control loop and the cancellation path:
/// the cancel token plus a mutex-guarded descriptor of the current
/// attempt's files. No other mutable state is shared.
#[derive(Clone, Default)]
pub struct SessionContext {
    pub cancel: CancelToken,
    current: Arc<Mutex<AttemptFiles>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_output(&self, path: Option<PathBuf>) {
        self.current.lock().unwrap().output = path;
    }

    pub fn set_thumbnail(&self, path: Option<PathBuf>) {
        self.current.lock().unwrap().thumbnail = path;
    }

    pub fn current_files(&self) -> AttemptFiles {
        self.current.lock().unwrap().clone()
    }

    /// Sleep in short ticks, returning early (false) when cancelled.
    pub fn sleep_interruptible(&self, duration: Duration) -> bool {
        self.cancel.sleep(duration)
    }
}

/// How one live-to-offline cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRunOutcome {
    Completed { artifact: PathBuf },
    Abandoned { reason: String },
    CancelledByUser,
}

/// Thumbnail byte fetch (HTTP in production, a stub in tests).
pub trait ByteFetch {
    fn get(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// Everything the session loop needs, wired together.
pub struct SessionLoop<A, B, P, S, D, T, F> {
    config: Config,
    target: String,
    target_url: String,
    probe: LivenessProbe<A, B>,
    resolver: MetadataResolver<P>,
    spawner: S,
    duration_probe: D,
    transcoder: T,
    thumb_fetch: F,
    ctx: SessionContext,
}

impl<A, B, P, S, D, T, F> SessionLoop<A, B, P, S, D, T, F>
where
    A: DirectResolver,
    B: FallbackProbe,
    P: PageFetch,
    S: CaptureSpawner,
    D: DurationProbe + Clone,
    T: Transcoder,
    F: ByteFetch,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        target: &str,
        target_url: &str,
        probe: LivenessProbe<A, B>,
        resolver: MetadataResolver<P>,
        spawner: S,
        duration_probe: D,
        transcoder: T,
        thumb_fetch: F,
        ctx: SessionContext,
    ) -> Self {
        Self {
            config,
            target: target.to_string(),
            target_url: target_url.to_string(),
            probe,
            resolver,
            spawner,
            duration_probe,
            transcoder,
            thumb_fetch,
            ctx,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Run until cancelled. Per-session failures never escape; they log
    /// and the loop moves on to the next poll cycle.
    pub fn run(&self) -> anyhow::Result<()> {
        let storage = StorageManager::new(self.config.clone(), &self.target);
        storage.ensure_target_dir()?;

        info!(target = %self.target, url = %self.target_url, "monitoring target");

        while !self.ctx.cancel.is_cancelled() {
            let verdict = self.probe.check(&self.target_url);
            if self.ctx.cancel.is_cancelled() {
                break;
            }

            let locator = match verdict {
                LivenessVerdict::Offline => {
                    debug!(
                        target = %self.target,
                        "offline, checking again in {}s",
                        self.config.monitor.poll_interval_secs
                    );
                    if !self.ctx.sleep_interruptible(self.config.poll_interval()) {
                        break;
                    }
                    continue;
                }
                LivenessVerdict::Live(locator) => locator,
            };

            match self.run_session(&storage, locator) {
                SessionRunOutcome::Completed { artifact } => {
                    info!(target = %self.target, artifact = %artifact.display(), "session completed");
                }
                SessionRunOutcome::Abandoned { reason } => {
                    error!(target = %self.target, %reason, "session abandoned");
                }
                SessionRunOutcome::CancelledByUser => {
                    info!(target = %self.target, "session cancelled by user");
                    break;
                }
            }

            self.ctx.set_output(None);
            self.ctx.set_thumbnail(None);

            debug!(
                "waiting {}s before checking stream status",
                self.config.monitor.retry_delay_secs
            );
            if !self.ctx.sleep_interruptible(self.config.retry_delay()) {
                break;
            }
        }

        info!(target = %self.target, "monitor stopped");
        Ok(())
    }

    /// One live-to-offline cycle: capture, validate, post-process.
    fn run_session(
        &self,
        storage: &StorageManager,
        locator: crate::probe::MediaLocator,
    ) -> SessionRunOutcome {
        let metadata = self
            .resolver
            .resolve(&self.target, &self.target_url, &locator);
        info!(
            title = %metadata.title,
            session_id = %metadata.session_id,
            "stream is live, starting capture"
        );

        let thumbnail = self.fetch_thumbnail(storage, &metadata);
        self.ctx.set_thumbnail(thumbnail.clone());

        let supervisor = CaptureSupervisor::new(&self.config, &self.spawner, self.duration_probe.clone());
        let outcome = supervisor.capture(&self.ctx, storage, &metadata, locator, &|| {
            self.probe.check(&self.target_url)
        });

        let result = match outcome {
            CaptureOutcome::Completed { artifact } => {
                if self.ctx.cancel.is_cancelled() {
                    // Shutdown landed after the capture finished; the raw
                    // artifact stays in place instead of going through a
                    // full remux
                    info!(
                        artifact = %artifact.display(),
                        "shutdown requested, skipping post-processing"
                    );
                    SessionRunOutcome::CancelledByUser
                } else {
                    self.post_process(storage, &metadata, &artifact, thumbnail.as_deref())
                }
            }
            CaptureOutcome::Abandoned { reason } => SessionRunOutcome::Abandoned { reason },
            CaptureOutcome::Cancelled => SessionRunOutcome::CancelledByUser,
        };

        // Thumbnail sidecars never outlive the session
        if let Some(thumb) = &thumbnail {
            storage.cleanup_temp_files(std::slice::from_ref(thumb));
        }

        result
    }

    fn post_process(
        &self,
        storage: &StorageManager,
        metadata: &SessionMetadata,
        raw: &std::path::Path,
        thumbnail: Option<&std::path::Path>,
    ) -> SessionRunOutcome {
        let final_path = match storage.unique_output_path(
            &metadata.title,
            &metadata.session_id,
            "mkv",
        ) {
            Ok(path) => path,
            Err(err) => {
                error!(error = %err, "could not derive final output path");
                return SessionRunOutcome::Abandoned {
                    reason: format!("final path: {}", err),
                };
            }
        };

        let processor = PostProcessor::new(&self.transcoder);
        let fields = metadata.embed_fields(&self.target, &self.target_url);
        match processor.process(storage, raw, &final_path, &fields, thumbnail) {
            Ok(artifact) => SessionRunOutcome::Completed { artifact },
            Err(err) => {
                // Raw artifact is quarantined by the processor; the loop
                // itself keeps running
                error!(error = %err, "post-processing failed");
                SessionRunOutcome::Abandoned {
                    reason: format!("post-processing: {}", err),
                }
            }
        }
    }

    /// Download the thumbnail sidecar, best-effort.
    fn fetch_thumbnail(
        &self,
        storage: &StorageManager,
        metadata: &SessionMetadata,
    ) -> Option<PathBuf> {
        let url = metadata.thumbnail_url.as_deref()?;
        let bytes = match self.thumb_fetch.get(url) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return None,
            Err(err) => {
                warn!(url, error = %err, "thumbnail download failed");
                return None;
            }
        };

        let dir = storage.ensure_target_dir().ok()?;
        let path = dir.join(format!("{}_thumbnail.jpg", metadata.session_id));
        match std::fs::write(&path, bytes) {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not write thumbnail");
                None
            }
        }
    }
}
