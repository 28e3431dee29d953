//! End-to-end test of the monitor loop with scripted components.
//!
//! Drives the full cycle: offline polls, liveness, capture, validation,
//! post-processing and cleanup, without touching the network or any
//! external tools.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tempfile::TempDir;

use castwatch::config::{Config, Quality};
use castwatch::metadata::{MetadataResolver, PageFetch};
use castwatch::probe::{DirectResolver, FallbackProbe, FallbackStatus, LivenessProbe, MediaLocator};
use castwatch::postprocess::Transcoder;
use castwatch::session::{ByteFetch, CancelToken, SessionContext, SessionLoop};
use castwatch::supervisor::{CaptureSpawner, ProcessHandle};
use castwatch::validate::DurationProbe;

const SAMPLE_PAGE: &str = r#"
    <html><head>
    <meta property="og:title" content="Alice Show" />
    <meta property="og:image" content="https://cdn.example/thumb.jpg" />
    </head><body>
    <a href="/alice/movie/555">live now</a>
    </body></html>
"#;

/// Direct resolver scripted per call: offline, offline, live, then
/// offline forever while also requesting shutdown.
struct ScriptedResolver {
    calls: AtomicU32,
    cancel: CancelToken,
}

impl DirectResolver for ScriptedResolver {
    fn resolve(&self, target: &str, _quality: Quality) -> Result<MediaLocator> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match call {
            1 | 2 => bail!("no playable streams"),
            3 => Ok(MediaLocator::PageRef {
                page_url: target.to_string(),
                session_id: "555".to_string(),
            }),
            _ => {
                self.cancel.trigger();
                bail!("no playable streams")
            }
        }
    }
}

struct NoFallback;
impl FallbackProbe for NoFallback {
    fn status(&self, _target: &str) -> Result<FallbackStatus> {
        bail!("status api unreachable")
    }
}

struct StubPage;
impl PageFetch for StubPage {
    fn get(&self, _url: &str) -> Result<String> {
        Ok(SAMPLE_PAGE.to_string())
    }
}

struct StubBytes;
impl ByteFetch for StubBytes {
    fn get(&self, _url: &str) -> Result<Vec<u8>> {
        Ok(vec![0xFF, 0xD8, 0xFF, 0xE0])
    }
}

/// Fake capture child: grows the output on each poll, exits cleanly.
struct GrowingHandle {
    polls_left: u32,
    output: std::path::PathBuf,
}

impl ProcessHandle for GrowingHandle {
    fn poll(&mut self) -> Result<Option<i32>> {
        let mut existing = fs::read(&self.output).unwrap_or_default();
        existing.extend(std::iter::repeat(0u8).take(4096));
        fs::write(&self.output, existing)?;
        if self.polls_left == 0 {
            return Ok(Some(0));
        }
        self.polls_left -= 1;
        Ok(None)
    }

    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        Ok(())
    }

    fn wait_timeout(&mut self, _timeout: Duration) -> Result<Option<i32>> {
        Ok(Some(0))
    }
}

struct GrowingSpawner {
    spawned: Arc<AtomicU32>,
}

impl CaptureSpawner for GrowingSpawner {
    fn spawn(&self, _locator: &MediaLocator, output: &Path) -> Result<Box<dyn ProcessHandle>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(GrowingHandle {
            polls_left: 3,
            output: output.to_path_buf(),
        }))
    }
}

#[derive(Clone)]
struct FixedDuration(f64);
impl DurationProbe for FixedDuration {
    fn probe(&self, _path: &Path) -> Result<f64> {
        Ok(self.0)
    }
}

/// Transcoder that copies input to output for both passes.
struct CopyTranscoder;
impl Transcoder for CopyTranscoder {
    fn repair(&self, input: &Path, output: &Path) -> Result<()> {
        fs::copy(input, output)?;
        Ok(())
    }

    fn remux(
        &self,
        input: &Path,
        output: &Path,
        _metadata: &[(String, String)],
        _thumbnail: Option<&Path>,
    ) -> Result<()> {
        fs::copy(input, output)?;
        Ok(())
    }
}

fn test_config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.directory = temp.path().to_string_lossy().to_string();
    config.monitor.poll_interval_secs = 0;
    config.monitor.retry_delay_secs = 0;
    config.monitor.jitter_max_ms = 0;
    config.capture.stall_timeout_secs = 5;
    config.capture.startup_timeout_secs = 5;
    config.capture.grace_period_secs = 0;
    config.validation.min_size_kib = 1;
    config.validation.min_duration_secs = 1.0;
    config
}

#[test]
fn full_cycle_from_offline_to_final_artifact() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);

    let ctx = SessionContext::new();
    let resolver = ScriptedResolver {
        calls: AtomicU32::new(0),
        cancel: ctx.cancel.clone(),
    };
    let probe = LivenessProbe::new(
        resolver,
        NoFallback,
        Quality::Best,
        Duration::ZERO,
        ctx.cancel.clone(),
    );
    let spawned = Arc::new(AtomicU32::new(0));
    let spawner = GrowingSpawner {
        spawned: spawned.clone(),
    };

    let session = SessionLoop::new(
        config,
        "alice",
        "https://example.tv/alice",
        probe,
        MetadataResolver::new(StubPage),
        spawner,
        FixedDuration(120.0),
        CopyTranscoder,
        StubBytes,
        ctx,
    );

    session.run().unwrap();

    // Exactly one capture across the whole run
    assert_eq!(spawned.load(Ordering::SeqCst), 1);

    let target_dir = temp.path().join("alice");
    let entries: Vec<_> = fs::read_dir(&target_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();

    // Final artifact carries title, target and session id in the name
    let finals: Vec<_> = entries.iter().filter(|n| n.ends_with(".mkv")).collect();
    assert_eq!(finals.len(), 1, "entries: {:?}", entries);
    assert!(finals[0].contains("Alice Show"));
    assert!(finals[0].contains("[alice][555]"));

    // Raw capture, repair temp and thumbnail sidecar are all gone
    assert!(!entries.iter().any(|n| n.ends_with(".mp4")));
    assert!(!entries.iter().any(|n| n.contains("repaired")));
    assert!(!entries.iter().any(|n| n.contains("thumbnail")));
}

#[test]
fn broken_postprocess_quarantines_raw_and_keeps_running() {
    struct BrokenTranscoder;
    impl Transcoder for BrokenTranscoder {
        fn repair(&self, input: &Path, output: &Path) -> Result<()> {
            fs::copy(input, output)?;
            Ok(())
        }

        fn remux(
            &self,
            _input: &Path,
            _output: &Path,
            _metadata: &[(String, String)],
            _thumbnail: Option<&Path>,
        ) -> Result<()> {
            bail!("muxer exploded")
        }
    }

    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);

    let ctx = SessionContext::new();
    let resolver = ScriptedResolver {
        calls: AtomicU32::new(0),
        cancel: ctx.cancel.clone(),
    };
    let probe = LivenessProbe::new(
        resolver,
        NoFallback,
        Quality::Best,
        Duration::ZERO,
        ctx.cancel.clone(),
    );

    let session = SessionLoop::new(
        config,
        "alice",
        "https://example.tv/alice",
        probe,
        MetadataResolver::new(StubPage),
        GrowingSpawner {
            spawned: Arc::new(AtomicU32::new(0)),
        },
        FixedDuration(120.0),
        BrokenTranscoder,
        StubBytes,
        ctx,
    );

    // The loop survives the failure and exits via cancellation
    session.run().unwrap();

    let quarantine = temp.path().join("alice").join("quarantine");
    assert!(quarantine.exists());
    assert_eq!(fs::read_dir(&quarantine).unwrap().count(), 1);

    // No final artifact was produced
    let entries: Vec<_> = fs::read_dir(temp.path().join("alice"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert!(!entries.iter().any(|n| n.ends_with(".mkv")));
}

#[test]
fn cancel_after_capture_keeps_raw_and_skips_remux() {
    /// Requests shutdown while the finished capture is being validated,
    /// as if Ctrl+C landed right after the child exited.
    #[derive(Clone)]
    struct CancellingDurationProbe {
        cancel: CancelToken,
    }
    impl DurationProbe for CancellingDurationProbe {
        fn probe(&self, _path: &Path) -> Result<f64> {
            self.cancel.trigger();
            Ok(120.0)
        }
    }

    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);

    let ctx = SessionContext::new();
    let resolver = ScriptedResolver {
        calls: AtomicU32::new(0),
        cancel: ctx.cancel.clone(),
    };
    let probe = LivenessProbe::new(
        resolver,
        NoFallback,
        Quality::Best,
        Duration::ZERO,
        ctx.cancel.clone(),
    );
    let duration_probe = CancellingDurationProbe {
        cancel: ctx.cancel.clone(),
    };

    let session = SessionLoop::new(
        config,
        "alice",
        "https://example.tv/alice",
        probe,
        MetadataResolver::new(StubPage),
        GrowingSpawner {
            spawned: Arc::new(AtomicU32::new(0)),
        },
        duration_probe,
        CopyTranscoder,
        StubBytes,
        ctx,
    );

    session.run().unwrap();

    let entries: Vec<_> = fs::read_dir(temp.path().join("alice"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();

    // The raw capture stays in place; post-processing never ran
    assert!(
        entries.iter().any(|n| n.ends_with(".mp4")),
        "entries: {:?}",
        entries
    );
    assert!(!entries.iter().any(|n| n.ends_with(".mkv")));
    assert!(!entries.iter().any(|n| n.contains("repaired")));
}

#[test]
fn cancellation_before_liveness_exits_cleanly() {
    struct AlwaysOffline;
    impl DirectResolver for AlwaysOffline {
        fn resolve(&self, _target: &str, _quality: Quality) -> Result<MediaLocator> {
            bail!("offline")
        }
    }

    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);

    let ctx = SessionContext::new();
    ctx.cancel.trigger();

    let session = SessionLoop::new(
        config,
        "alice",
        "https://example.tv/alice",
        LivenessProbe::new(
            AlwaysOffline,
            NoFallback,
            Quality::Best,
            Duration::ZERO,
            ctx.cancel.clone(),
        ),
        MetadataResolver::new(StubPage),
        GrowingSpawner {
            spawned: Arc::new(AtomicU32::new(0)),
        },
        FixedDuration(120.0),
        CopyTranscoder,
        StubBytes,
        ctx,
    );

    session.run().unwrap();

    // Nothing beyond the (empty) target folder was created
    let entries = fs::read_dir(temp.path().join("alice")).unwrap().count();
    assert_eq!(entries, 0);
}
