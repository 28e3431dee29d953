//! Save-folder management for recordings.
//!
//! Owns output naming, the quarantine and partial-capture folders, temp
//! file cleanup and the free-disk-space preflight.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use deunicode::deunicode;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Subfolder for raw artifacts whose post-processing failed.
const QUARANTINE_DIR: &str = "quarantine";
/// Subfolder for non-empty artifacts preserved on cancellation.
const PARTIAL_DIR: &str = "partial";

/// Storage manager for one monitored target.
pub struct StorageManager {
    config: Config,
    target: String,
}

impl StorageManager {
    pub fn new(config: Config, target: &str) -> Self {
        Self {
            config,
            target: target.to_string(),
        }
    }

    /// ASCII-safe directory/file slug for the target name.
    pub fn target_slug(&self) -> String {
        let slug: String = deunicode(&self.target)
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if slug.is_empty() {
            "target".to_string()
        } else {
            slug
        }
    }

    /// Per-target save folder under the configured storage directory.
    pub fn target_dir(&self) -> PathBuf {
        self.config.storage_directory().join(self.target_slug())
    }

    /// Ensure the per-target save folder exists.
    pub fn ensure_target_dir(&self) -> Result<PathBuf> {
        let dir = self.target_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create save folder: {:?}", dir))?;
        }
        Ok(dir)
    }

    /// Per-target log file path.
    pub fn log_file_path(&self) -> PathBuf {
        self.target_dir()
            .join(format!("{}_castwatch.log", self.target_slug()))
    }

    /// Build a unique output path `[YYYYMMDD] title [target][id].ext`.
    ///
    /// Collisions get a ` (n)` counter before the extension, starting at 2.
    pub fn unique_output_path(&self, title: &str, session_id: &str, ext: &str) -> Result<PathBuf> {
        let date = Local::now().date_naive();
        self.unique_output_path_for_date(title, session_id, ext, date)
    }

    /// Like [`unique_output_path`](Self::unique_output_path) with an
    /// explicit date, so naming stays deterministic under test.
    pub fn unique_output_path_for_date(
        &self,
        title: &str,
        session_id: &str,
        ext: &str,
        date: NaiveDate,
    ) -> Result<PathBuf> {
        let dir = self.ensure_target_dir()?;
        let base = format!(
            "[{}] {} [{}][{}]",
            date.format("%Y%m%d"),
            title,
            self.target,
            session_id
        );

        let mut path = dir.join(format!("{}.{}", base, ext));
        let mut counter = 2;
        while path.exists() {
            path = dir.join(format!("{} ({}).{}", base, counter, ext));
            counter += 1;
        }
        if counter > 2 {
            tracing::info!(path = %path.display(), "using numbered filename");
        }
        Ok(path)
    }

    /// Move a raw artifact into the quarantine folder instead of deleting
    /// it. Returns the new location.
    pub fn quarantine(&self, artifact: &Path) -> Result<PathBuf> {
        self.move_into_subdir(artifact, QUARANTINE_DIR)
    }

    /// Preserve a partially-written artifact on cancellation.
    pub fn preserve_partial(&self, artifact: &Path) -> Result<PathBuf> {
        self.move_into_subdir(artifact, PARTIAL_DIR)
    }

    fn move_into_subdir(&self, artifact: &Path, subdir: &str) -> Result<PathBuf> {
        let dir = self.ensure_target_dir()?.join(subdir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create folder: {:?}", dir))?;

        let filename = artifact
            .file_name()
            .with_context(|| format!("Artifact has no filename: {:?}", artifact))?;
        let mut dest = dir.join(filename);

        // Keep an existing quarantined file of the same name
        let mut counter = 2;
        while dest.exists() {
            dest = dir.join(format!(
                "{} ({})",
                filename.to_string_lossy(),
                counter
            ));
            counter += 1;
        }

        if fs::rename(artifact, &dest).is_err() {
            // Rename can fail across filesystems
            fs::copy(artifact, &dest)
                .with_context(|| format!("Failed to copy {:?} to {:?}", artifact, dest))?;
            fs::remove_file(artifact)
                .with_context(|| format!("Failed to remove original {:?}", artifact))?;
        }

        Ok(dest)
    }

    /// Delete temp files left over from a session, ignoring individual
    /// failures.
    pub fn cleanup_temp_files(&self, paths: &[PathBuf]) {
        for path in paths {
            if path.exists() {
                if let Err(err) = fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove temp file");
                }
            }
        }
    }

    /// Free space on the save folder's filesystem, in bytes.
    ///
    /// Uses `df -k` (macOS and Linux); `None` when it cannot be determined.
    pub fn free_space_bytes(&self) -> Option<u64> {
        let dir = self.config.storage_directory();
        let path_str = dir.to_string_lossy();

        let output = std::process::Command::new("df")
            .arg("-k")
            .arg(&*path_str)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        // Second line: Filesystem 1K-blocks Used Available Use% Mounted
        let line = stdout.lines().nth(1)?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        let avail_kb: u64 = parts.get(3)?.parse().ok()?;
        Some(avail_kb * 1024)
    }

    /// Startup preflight: fail when the filesystem is below the configured
    /// free-space floor. Unknown free space passes with a warning.
    pub fn check_free_space(&self) -> Result<()> {
        let min_bytes = (self.config.storage.min_free_space_gb * 1024.0 * 1024.0 * 1024.0) as u64;
        match self.free_space_bytes() {
            Some(free) if free < min_bytes => {
                anyhow::bail!(
                    "Insufficient disk space: {} free, {} required",
                    humansize::format_size(free, humansize::BINARY),
                    humansize::format_size(min_bytes, humansize::BINARY)
                )
            }
            Some(_) => Ok(()),
            None => {
                tracing::warn!("could not determine free disk space, continuing");
                Ok(())
            }
        }
    }
}
