//! Streamlink integration: the direct liveness resolver and the capture
//! process spawner.

use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::config::{Config, Quality};
use crate::metadata::extract_movie_id;
use crate::probe::{DirectResolver, MediaLocator};
use crate::supervisor::{CaptureSpawner, ProcessHandle};

/// Upper bound on one liveness-check invocation; a hung streamlink must
/// not wedge the polling loop.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Streamlink {
    config: Config,
}

/// Run a command to completion, killing it if the deadline passes.
///
/// stdout/stderr are piped; the child is expected to produce a small
/// payload (the `--json` verdict), so pipe backpressure is not a concern.
fn output_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("failed to run streamlink")?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait().context("wait failed")? {
            Some(_) => {
                return child
                    .wait_with_output()
                    .context("failed to collect command output");
            }
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("command timed out after {:?}", timeout);
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

impl Streamlink {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Startup preflight: streamlink must be on PATH.
    pub fn check_available() -> Result<()> {
        let output = Command::new("streamlink")
            .arg("--version")
            .output()
            .context("streamlink not found. Please install it first.")?;
        if !output.status.success() {
            bail!("streamlink version check failed");
        }
        Ok(())
    }

    /// Auth/header arguments shared by the resolver and the capture spawn.
    fn common_args(&self, cmd: &mut Command) {
        cmd.arg("--http-header")
            .arg(format!("User-Agent={}", self.config.auth.user_agent));
        if let Some(password) = &self.config.auth.stream_password {
            cmd.arg("--twitcasting-password").arg(password);
        }
        for cookie in self.config.auth.cookie_pairs() {
            cmd.arg("--http-cookie").arg(cookie);
        }
    }
}

impl DirectResolver for Streamlink {
    /// Ask streamlink whether the page resolves to playable streams.
    ///
    /// `--json` output carrying an `error` key means offline; anything
    /// else means streamlink can capture directly from the page URL.
    fn resolve(&self, target_url: &str, quality: Quality) -> Result<MediaLocator> {
        let mut cmd = Command::new("streamlink");
        cmd.arg("--json").arg(target_url).arg(quality.as_str());
        self.common_args(&mut cmd);

        debug!(url = target_url, "running streamlink liveness check");
        let output = output_with_timeout(&mut cmd, PROBE_TIMEOUT)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let data: serde_json::Value =
            serde_json::from_str(&stdout).context("streamlink produced unparseable JSON")?;

        if data.get("error").is_some() {
            bail!("streamlink reports offline: {}", data["error"]);
        }

        // Prefer a broadcast id when the plugin exposes one
        let session_id = data
            .pointer("/metadata/id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| extract_movie_id(&stdout));

        Ok(match session_id {
            Some(session_id) => MediaLocator::PageRef {
                page_url: target_url.to_string(),
                session_id,
            },
            None => MediaLocator::DirectUrl(target_url.to_string()),
        })
    }
}

impl CaptureSpawner for Streamlink {
    fn spawn(&self, locator: &MediaLocator, output: &Path) -> Result<Box<dyn ProcessHandle>> {
        let mut cmd = Command::new("streamlink");
        cmd.arg(locator.capture_url())
            .arg(self.config.capture.quality.as_str())
            .arg("-o")
            .arg(output)
            .arg("--force")
            .arg("--retry-streams")
            .arg("30");
        if self.config.capture.live_restart {
            cmd.arg("--hls-live-restart");
        }
        self.common_args(&mut cmd);

        // Output is tracked through the artifact file, not the pipes
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        debug!(url = locator.capture_url(), output = %output.display(), "spawning capture process");
        let child = cmd.spawn().context("failed to spawn streamlink")?;
        Ok(Box::new(ChildHandle { child }))
    }
}

/// [`ProcessHandle`] over a std child process.
struct ChildHandle {
    child: Child,
}

impl ProcessHandle for ChildHandle {
    fn poll(&mut self) -> Result<Option<i32>> {
        let status = self.child.try_wait().context("poll failed")?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            let pid = self.child.id() as libc::pid_t;
            // SIGTERM lets streamlink close the output container cleanly
            let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
            if rc != 0 {
                bail!("SIGTERM failed: {}", std::io::Error::last_os_error());
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill().context("kill failed")?;
        Ok(())
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<i32>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().context("wait failed")? {
                return Ok(Some(status.code().unwrap_or(-1)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
