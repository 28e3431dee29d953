//! Post-processing of a completed capture.
//!
//! Remuxes the raw artifact into the final container, embedding metadata
//! and the thumbnail, then removes the temporaries. A failed remux never
//! discards the raw capture; it goes to quarantine instead.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::storage::StorageManager;

/// External remux/repair capability (ffmpeg in production).
pub trait Transcoder {
    /// Defensive container rewrite for truncated streams.
    fn repair(&self, input: &Path, output: &Path) -> Result<()>;

    /// Copy streams into the final container, attaching metadata fields
    /// and an optional thumbnail.
    fn remux(
        &self,
        input: &Path,
        output: &Path,
        metadata: &[(String, String)],
        thumbnail: Option<&Path>,
    ) -> Result<()>;
}

impl<T: Transcoder + ?Sized> Transcoder for &T {
    fn repair(&self, input: &Path, output: &Path) -> Result<()> {
        (**self).repair(input, output)
    }

    fn remux(
        &self,
        input: &Path,
        output: &Path,
        metadata: &[(String, String)],
        thumbnail: Option<&Path>,
    ) -> Result<()> {
        (**self).remux(input, output, metadata, thumbnail)
    }
}

pub struct PostProcessor<T> {
    transcoder: T,
    repair_first: bool,
}

impl<T: Transcoder> PostProcessor<T> {
    pub fn new(transcoder: T) -> Self {
        Self {
            transcoder,
            repair_first: true,
        }
    }

    pub fn with_repair(mut self, repair_first: bool) -> Self {
        self.repair_first = repair_first;
        self
    }

    /// Produce the final artifact from a validated raw capture.
    ///
    /// On success the raw file (and repair temp, and thumbnail) are
    /// deleted and the final path is returned. On failure the raw file is
    /// moved to quarantine and the error propagates; the session loop
    /// treats that as non-fatal.
    pub fn process(
        &self,
        storage: &StorageManager,
        raw: &Path,
        final_path: &Path,
        metadata: &[(String, String)],
        thumbnail: Option<&Path>,
    ) -> Result<PathBuf> {
        let mut temp_files = Vec::new();

        let source = if self.repair_first {
            match self.repair_pass(raw) {
                Some(repaired) => {
                    temp_files.push(repaired.clone());
                    repaired
                }
                None => raw.to_path_buf(),
            }
        } else {
            raw.to_path_buf()
        };

        let result = self
            .transcoder
            .remux(&source, final_path, metadata, thumbnail)
            .with_context(|| format!("Remux to {:?} failed", final_path));

        match result {
            Ok(()) => {
                info!(output = %final_path.display(), "post-processing complete");
                temp_files.push(raw.to_path_buf());
                if let Some(thumb) = thumbnail {
                    temp_files.push(thumb.to_path_buf());
                }
                storage.cleanup_temp_files(&temp_files);
                Ok(final_path.to_path_buf())
            }
            Err(err) => {
                // A half-written final file is worthless, the raw is not
                storage.cleanup_temp_files(&temp_files);
                if final_path.exists() {
                    storage.cleanup_temp_files(&[final_path.to_path_buf()]);
                }
                match storage.quarantine(raw) {
                    Ok(kept) => {
                        error!(
                            raw = %raw.display(),
                            kept = %kept.display(),
                            "remux failed, raw artifact quarantined"
                        );
                    }
                    Err(move_err) => {
                        error!(
                            raw = %raw.display(),
                            error = %move_err,
                            "remux failed and quarantine move failed, raw left in place"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Try the defensive repair pass; `None` means continue with the
    /// original raw file.
    fn repair_pass(&self, raw: &Path) -> Option<PathBuf> {
        let repaired = raw.with_extension("repaired.mp4");
        match self.transcoder.repair(raw, &repaired) {
            Ok(()) if repaired.exists() => Some(repaired),
            Ok(()) => None,
            Err(err) => {
                warn!(error = %err, "repair pass failed, remuxing original");
                let _ = std::fs::remove_file(&repaired);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use anyhow::bail;
    use std::fs;
    use tempfile::TempDir;

    /// Remux = copy input to output; repair = no-op.
    struct CopyTranscoder;
    impl Transcoder for CopyTranscoder {
        fn repair(&self, _input: &Path, _output: &Path) -> Result<()> {
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

    struct BrokenTranscoder;
    impl Transcoder for BrokenTranscoder {
        fn repair(&self, _input: &Path, _output: &Path) -> Result<()> {
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

    fn setup(temp: &TempDir) -> (StorageManager, PathBuf, PathBuf) {
        let mut config = Config::default();
        config.storage.directory = temp.path().to_string_lossy().to_string();
        let storage = StorageManager::new(config, "alice");
        let dir = storage.ensure_target_dir().unwrap();

        let raw = dir.join("raw.mp4");
        fs::write(&raw, b"raw capture bytes").unwrap();
        let final_path = dir.join("final.mkv");
        (storage, raw, final_path)
    }

    #[test]
    fn success_produces_final_and_removes_raw() {
        let temp = TempDir::new().unwrap();
        let (storage, raw, final_path) = setup(&temp);

        let processor = PostProcessor::new(CopyTranscoder);
        let out = processor
            .process(&storage, &raw, &final_path, &[], None)
            .unwrap();

        assert_eq!(out, final_path);
        assert!(final_path.exists());
        assert!(!raw.exists());
    }

    #[test]
    fn success_removes_thumbnail_sidecar() {
        let temp = TempDir::new().unwrap();
        let (storage, raw, final_path) = setup(&temp);
        let thumb = raw.parent().unwrap().join("thumb.jpg");
        fs::write(&thumb, b"jpeg").unwrap();

        let processor = PostProcessor::new(CopyTranscoder);
        processor
            .process(&storage, &raw, &final_path, &[], Some(&thumb))
            .unwrap();

        assert!(!thumb.exists());
    }

    #[test]
    fn failure_quarantines_raw_instead_of_deleting() {
        let temp = TempDir::new().unwrap();
        let (storage, raw, final_path) = setup(&temp);

        let processor = PostProcessor::new(BrokenTranscoder);
        let result = processor.process(&storage, &raw, &final_path, &[], None);

        assert!(result.is_err());
        assert!(!final_path.exists());
        // Raw capture survives, relocated under quarantine/
        assert!(!raw.exists());
        let quarantine = raw.parent().unwrap().join("quarantine");
        let kept: Vec<_> = fs::read_dir(&quarantine).unwrap().collect();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn repair_disabled_skips_repair_pass() {
        let temp = TempDir::new().unwrap();
        let (storage, raw, final_path) = setup(&temp);

        let processor = PostProcessor::new(CopyTranscoder).with_repair(false);
        processor
            .process(&storage, &raw, &final_path, &[], None)
            .unwrap();
        assert!(final_path.exists());
    }

    /// Repair writing a real file means the remux consumes the repaired
    /// copy and both temporaries disappear on success.
    struct RepairingTranscoder;
    impl Transcoder for RepairingTranscoder {
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

    #[test]
    fn repair_temp_is_cleaned_up_on_success() {
        let temp = TempDir::new().unwrap();
        let (storage, raw, final_path) = setup(&temp);

        let processor = PostProcessor::new(RepairingTranscoder);
        processor
            .process(&storage, &raw, &final_path, &[], None)
            .unwrap();

        assert!(final_path.exists());
        assert!(!raw.with_extension("repaired.mp4").exists());
    }
}
