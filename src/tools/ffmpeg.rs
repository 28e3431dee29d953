//! ffmpeg/ffprobe integration: container remux with metadata and
//! thumbnail embedding, plus media-duration probing.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::postprocess::Transcoder;
use crate::validate::DurationProbe;

pub struct Ffmpeg;

impl Ffmpeg {
    /// Startup preflight: ffmpeg must be on PATH.
    pub fn check_available() -> Result<()> {
        let output = Command::new("ffmpeg")
            .arg("-version")
            .output()
            .context("ffmpeg not found. Please install it first.")?;
        if !output.status.success() {
            bail!("ffmpeg version check failed");
        }
        Ok(())
    }

    fn run(cmd: &mut Command) -> Result<()> {
        debug!(?cmd, "running ffmpeg");
        let output = cmd.output().context("failed to run ffmpeg")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.lines().last().unwrap_or("(no output)")
            );
        }
        Ok(())
    }
}

impl Transcoder for Ffmpeg {
    fn repair(&self, input: &Path, output: &Path) -> Result<()> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-c")
            .arg("copy")
            .arg(output);
        Self::run(&mut cmd)
    }

    fn remux(
        &self,
        input: &Path,
        output: &Path,
        metadata: &[(String, String)],
        thumbnail: Option<&Path>,
    ) -> Result<()> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y").arg("-i").arg(input);
        cmd.arg("-c").arg("copy");

        for (key, value) in metadata {
            cmd.arg("-metadata").arg(format!("{}={}", key, value));
        }

        if let Some(thumb) = thumbnail {
            cmd.arg("-attach")
                .arg(thumb)
                .arg("-metadata:s:t")
                .arg("mimetype=image/jpeg")
                .arg("-metadata:s:t")
                .arg("filename=cover.jpg");
        }

        cmd.arg(output);
        Self::run(&mut cmd)
    }
}

/// Duration probe backed by ffprobe.
#[derive(Clone)]
pub struct FfprobeDuration;

impl DurationProbe for FfprobeDuration {
    fn probe(&self, path: &Path) -> Result<f64> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .context("failed to run ffprobe")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("ffprobe failed: {}", stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<f64>()
            .with_context(|| format!("unparseable ffprobe duration: {:?}", stdout.trim()))
    }
}
