//! Progress monitoring for an active capture attempt.
//!
//! A sampler thread reads the output artifact's size on a fixed cadence
//! and records growth into a shared [`ProgressTracker`]. The supervisor's
//! watchdog reads the tracker to detect stalls; a sink receives throttled
//! human-readable progress lines. Formatting is pure and the sink is
//! injectable, so none of this needs a real terminal to test.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use humansize::{format_size, BINARY};
use tracing::info;

/// Consecutive metadata-read failures tolerated before they start counting
/// as stall evidence.
const READ_ERROR_BUDGET: u32 = 5;

/// Where formatted progress lines go.
pub trait ProgressSink: Send {
    fn update(&mut self, line: &str);
}

/// Default sink: a throttled structured log line.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn update(&mut self, line: &str) {
        info!("{}", line);
    }
}

/// Observed state of one capture attempt's artifact.
///
/// The monitor thread writes, the supervisor watchdog reads. The artifact
/// itself is only ever read here; the child process is its single writer.
pub struct ProgressTracker {
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    started_at: Instant,
    file_seen: bool,
    last_growth_at: Instant,
    bytes: u64,
    consecutive_errors: u32,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(TrackerInner {
                started_at: now,
                file_seen: false,
                last_growth_at: now,
                bytes: 0,
                consecutive_errors: 0,
            }),
        }
    }

    /// Record one sample. `size` is `None` while the file does not exist
    /// yet (the waiting phase).
    pub fn observe(&self, size: Option<u64>) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_errors = 0;
        match size {
            Some(bytes) => {
                if !inner.file_seen || bytes > inner.bytes {
                    inner.last_growth_at = Instant::now();
                }
                inner.file_seen = true;
                inner.bytes = bytes;
            }
            None => {
                // Still waiting for the child to create the file
            }
        }
    }

    /// Record a transient read failure. Within the error budget the stall
    /// clock is held; past it, the clock runs.
    pub fn observe_error(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_errors += 1;
        if inner.consecutive_errors <= READ_ERROR_BUDGET {
            inner.last_growth_at = Instant::now();
        }
    }

    pub fn bytes(&self) -> u64 {
        self.inner.lock().unwrap().bytes
    }

    /// True while the output file has never been seen.
    pub fn waiting_for_file(&self) -> bool {
        !self.inner.lock().unwrap().file_seen
    }

    /// Time since the artifact last grew (or since start, before it
    /// appeared).
    pub fn since_last_growth(&self) -> Duration {
        self.inner.lock().unwrap().last_growth_at.elapsed()
    }

    /// Time since the attempt started.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().unwrap().started_at.elapsed()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Format one progress line: total size, elapsed time, throughput since
/// the previous update.
pub fn format_progress(bytes: u64, delta_bytes: u64, elapsed: Duration, interval: Duration) -> String {
    let throughput = if interval.as_secs_f64() > 0.0 {
        delta_bytes as f64 / interval.as_secs_f64()
    } else {
        0.0
    };
    format!(
        "Recording: {} in {} ({}/s)",
        format_size(bytes, BINARY),
        format_elapsed(elapsed),
        format_size(throughput as u64, BINARY)
    )
}

fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Cooperative sampler bound to one capture attempt.
pub struct ProgressMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Spawn the sampler thread. `sample_interval` is the file-size poll
    /// cadence; sink updates are throttled to `update_interval`.
    pub fn spawn(
        path: PathBuf,
        tracker: Arc<ProgressTracker>,
        mut sink: Box<dyn ProgressSink>,
        sample_interval: Duration,
        update_interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            let mut last_update = Instant::now();
            let mut last_bytes = 0u64;

            while !stop_flag.load(Ordering::SeqCst) {
                match std::fs::metadata(&path) {
                    Ok(meta) => tracker.observe(Some(meta.len())),
                    Err(err) if err.kind() == ErrorKind::NotFound => tracker.observe(None),
                    Err(_) => tracker.observe_error(),
                }

                let since_update = last_update.elapsed();
                if since_update >= update_interval && !tracker.waiting_for_file() {
                    let bytes = tracker.bytes();
                    let line = format_progress(
                        bytes,
                        bytes.saturating_sub(last_bytes),
                        tracker.elapsed(),
                        since_update,
                    );
                    sink.update(&line);
                    last_update = Instant::now();
                    last_bytes = bytes;
                }

                std::thread::sleep(sample_interval);
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the sampler to stop and wait for it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
