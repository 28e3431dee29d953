//! Post-capture artifact validation.
//!
//! A capture only counts once the file exists, has a minimum size and
//! probes to a minimum media duration. Duration probing can race the file
//! still being flushed, so it gets its own bounded retries.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::retry::retry_with_delay;
use crate::session::CancelToken;

/// External media-duration probe (ffprobe in production, a stub in tests).
pub trait DurationProbe {
    fn probe(&self, path: &Path) -> Result<f64>;
}

impl<D: DurationProbe + ?Sized> DurationProbe for &D {
    fn probe(&self, path: &Path) -> Result<f64> {
        (**self).probe(path)
    }
}

/// Verdict on a captured artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum Validity {
    Valid { size: u64, duration_secs: f64 },
    Invalid(String),
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid { .. })
    }
}

pub struct ArtifactValidator<D> {
    probe: D,
    min_bytes: u64,
    min_duration_secs: f64,
    probe_attempts: u32,
    probe_delay: Duration,
    cancel: CancelToken,
}

impl<D: DurationProbe> ArtifactValidator<D> {
    pub fn new(probe: D, min_bytes: u64, min_duration_secs: f64) -> Self {
        Self {
            probe,
            min_bytes,
            min_duration_secs,
            probe_attempts: 3,
            probe_delay: Duration::from_secs(2),
            cancel: CancelToken::new(),
        }
    }

    /// Override the duration-probe retry policy (tests use zero delay).
    pub fn with_probe_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.probe_attempts = attempts;
        self.probe_delay = delay;
        self
    }

    /// Share the session cancel token so probe retries stop on shutdown.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Check existence, size and probed duration, in that order. The first
    /// failing check produces the reason.
    pub fn validate(&self, path: &Path) -> Validity {
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Validity::Invalid(format!("artifact missing: {}", path.display()));
            }
        };

        if size < self.min_bytes {
            return Validity::Invalid(format!(
                "artifact too small: {} bytes (minimum {})",
                size, self.min_bytes
            ));
        }

        let duration = match retry_with_delay(
            self.probe_attempts,
            self.probe_delay,
            &self.cancel,
            |attempt| {
                debug!(path = %path.display(), attempt, "probing artifact duration");
                self.probe.probe(path)
            },
        ) {
            Ok(d) => d,
            Err(err) => {
                return Validity::Invalid(format!("duration probe failed: {}", err));
            }
        };

        if duration < self.min_duration_secs {
            return Validity::Invalid(format!(
                "artifact too short: {:.1}s (minimum {:.1}s)",
                duration, self.min_duration_secs
            ));
        }

        Validity::Valid {
            size,
            duration_secs: duration,
        }
    }
}
