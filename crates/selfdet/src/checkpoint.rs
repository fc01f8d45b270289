//! Checkpoint save/load with resume semantics.
//!
//! Checkpoints are JSON files with a sha256 digest sidecar; a
//! `last_checkpoint` marker in the save dir names the newest one so a
//! resumed run can pick up where it stopped.

use crate::error::{RunError, RunResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const LAST_CHECKPOINT_MARKER: &str = "last_checkpoint";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub iteration: u64,
    pub model_state: serde_json::Value,
}

impl Checkpoint {
    #[must_use]
    pub fn new(iteration: u64, model_state: serde_json::Value) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            iteration,
            model_state,
        }
    }
}

/// Where a `resume_or_load` call found its weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedFrom {
    /// The `last_checkpoint` marker in the save dir (resumed run).
    Resumed(PathBuf),
    /// The configured weights path (fresh run, iteration restarts at 0).
    Weights(PathBuf),
    /// No weights anywhere; training starts from scratch.
    Scratch,
}

#[derive(Debug, Clone)]
pub struct Checkpointer {
    save_dir: PathBuf,
}

impl Checkpointer {
    #[must_use]
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self { save_dir: save_dir.into() }
    }

    #[must_use]
    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn save(&self, name: &str, checkpoint: &Checkpoint) -> RunResult<PathBuf> {
        std::fs::create_dir_all(&self.save_dir)?;
        let path = self.save_dir.join(format!("{name}.json"));
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        std::fs::write(&path, &bytes)?;
        std::fs::write(self.save_dir.join(format!("{name}.json.sha256")), &digest)?;
        std::fs::write(self.save_dir.join(LAST_CHECKPOINT_MARKER), format!("{name}.json"))?;

        tracing::info!(path = %path.display(), iteration = checkpoint.iteration, "saved checkpoint");
        Ok(path)
    }

    pub fn load(&self, path: &Path) -> RunResult<Checkpoint> {
        let bytes = std::fs::read(path).map_err(|e| {
            RunError::Checkpoint(format!("cannot read checkpoint {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            RunError::Checkpoint(format!("corrupt checkpoint {}: {e}", path.display()))
        })
    }

    fn last_checkpoint_path(&self) -> RunResult<Option<PathBuf>> {
        let marker = self.save_dir.join(LAST_CHECKPOINT_MARKER);
        match std::fs::read_to_string(&marker) {
            Ok(name) => Ok(Some(self.save_dir.join(name.trim()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load weights for a run start. With `resume` the `last_checkpoint`
    /// marker wins over the configured weights path; without it the weights
    /// path is loaded fresh (or nothing, when the path is empty).
    pub fn resume_or_load(
        &self,
        weights: &Path,
        resume: bool,
    ) -> RunResult<(Option<Checkpoint>, LoadedFrom)> {
        if resume {
            if let Some(path) = self.last_checkpoint_path()? {
                let checkpoint = self.load(&path)?;
                return Ok((Some(checkpoint), LoadedFrom::Resumed(path)));
            }
        }
        if weights.as_os_str().is_empty() {
            return Ok((None, LoadedFrom::Scratch));
        }
        let checkpoint = self.load(weights)?;
        Ok((Some(checkpoint), LoadedFrom::Weights(weights.to_path_buf())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checkpoint(iteration: u64) -> Checkpoint {
        Checkpoint::new(iteration, serde_json::json!({"iteration": iteration}))
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(temp.path());
        let path = checkpointer.save("model_0000100", &checkpoint(100)).unwrap();

        let loaded = checkpointer.load(&path).unwrap();
        assert_eq!(loaded.iteration, 100);
        assert!(temp.path().join("model_0000100.json.sha256").exists());
    }

    #[test]
    fn test_resume_prefers_marker_over_weights() {
        let temp = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(temp.path());
        let weights_path = checkpointer.save("pretrained", &checkpoint(0)).unwrap();
        checkpointer.save("model_0000500", &checkpoint(500)).unwrap();

        let (loaded, from) = checkpointer.resume_or_load(&weights_path, true).unwrap();
        assert_eq!(loaded.unwrap().iteration, 500);
        assert!(matches!(from, LoadedFrom::Resumed(_)));
    }

    #[test]
    fn test_no_resume_loads_configured_weights() {
        let temp = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(temp.path());
        let weights_path = checkpointer.save("pretrained", &checkpoint(42)).unwrap();
        checkpointer.save("model_0000500", &checkpoint(500)).unwrap();

        let (loaded, from) = checkpointer.resume_or_load(&weights_path, false).unwrap();
        assert_eq!(loaded.unwrap().iteration, 42);
        assert!(matches!(from, LoadedFrom::Weights(_)));
    }

    #[test]
    fn test_empty_weights_is_scratch() {
        let temp = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(temp.path());
        let (loaded, from) = checkpointer.resume_or_load(Path::new(""), false).unwrap();
        assert!(loaded.is_none());
        assert_eq!(from, LoadedFrom::Scratch);
    }

    #[test]
    fn test_corrupt_checkpoint_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();

        let checkpointer = Checkpointer::new(temp.path());
        let err = checkpointer.load(&path).unwrap_err();
        assert!(matches!(err, RunError::Checkpoint(_)));
    }
}
