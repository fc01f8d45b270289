//! Run configuration: schema defaults, file merge, CLI overrides, freeze.
//!
//! Precedence is fixed: schema defaults < config file < `opts` key/value
//! overrides < explicit dataset/eval flags < freeze. After `freeze()` the
//! configuration is immutable for the rest of the process: `FrozenConfig`
//! exposes read access only, and the builder is consumed.

use crate::error::{RunError, RunResult};
use crate::registry::{DATASET_TRAIN, DATASET_VALID};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunConfig {
    pub output_dir: PathBuf,
    pub seed: u64,
    pub model: ModelConfig,
    pub datasets: DatasetsConfig,
    pub solver: SolverConfig,
    pub test: TestConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            seed: 42,
            model: ModelConfig::default(),
            datasets: DatasetsConfig::default(),
            solver: SolverConfig::default(),
            test: TestConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelConfig {
    /// Checkpoint to load initial weights from. Empty means train from scratch.
    pub weights: PathBuf,
    pub score_threshold: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { weights: PathBuf::new(), score_threshold: 0.05 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatasetsConfig {
    pub train: Vec<String>,
    pub test: Vec<String>,
}

impl Default for DatasetsConfig {
    fn default() -> Self {
        Self {
            train: vec![DATASET_TRAIN.to_string()],
            test: vec![DATASET_VALID.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SolverConfig {
    pub max_iter: u64,
    pub base_lr: f64,
    pub checkpoint_period: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self { max_iter: 90_000, base_lr: 0.02, checkpoint_period: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TestConfig {
    /// Run an in-training evaluation every this many iterations (0 = final only).
    pub eval_period: u64,
    /// Drop segmentation metrics from COCO-style evaluation.
    pub no_segm: bool,
    pub expected_results: Vec<ExpectedResult>,
    pub aug: AugConfig,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            eval_period: 0,
            no_segm: false,
            expected_results: Vec::new(),
            aug: AugConfig::default(),
        }
    }
}

/// Test-time augmentation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AugConfig {
    pub enabled: bool,
    pub flip: bool,
    pub scales: Vec<f64>,
}

impl Default for AugConfig {
    fn default() -> Self {
        Self { enabled: false, flip: true, scales: vec![0.75, 1.0, 1.25] }
    }
}

/// A metric the run is expected to reproduce, checked by `verify_results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectedResult {
    pub dataset: String,
    pub metric: String,
    pub value: f64,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_tolerance() -> f64 {
    0.02
}

impl RunConfig {
    pub fn validate(&self) -> RunResult<()> {
        if self.solver.max_iter == 0 {
            return Err(RunError::Config("solver.max_iter must be >= 1".to_string()));
        }
        if !self.solver.base_lr.is_finite() || self.solver.base_lr <= 0.0 {
            return Err(RunError::Config("solver.base_lr must be > 0".to_string()));
        }
        if self.solver.checkpoint_period == 0 {
            return Err(RunError::Config("solver.checkpoint_period must be >= 1".to_string()));
        }
        if self.datasets.test.is_empty() {
            return Err(RunError::Config("datasets.test must not be empty".to_string()));
        }
        if self.test.aug.enabled && self.test.aug.scales.is_empty() {
            return Err(RunError::Config(
                "test.aug.scales must not be empty when test.aug.enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// An immutable, fully merged run configuration.
///
/// Cheap to clone and share across replicas; there is no way to mutate the
/// inner `RunConfig` once frozen.
#[derive(Debug, Clone)]
pub struct FrozenConfig(Arc<RunConfig>);

impl Deref for FrozenConfig {
    type Target = RunConfig;

    fn deref(&self) -> &RunConfig {
        &self.0
    }
}

/// Builds a `FrozenConfig` by layering sources over the schema defaults.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    file: Option<PathBuf>,
    overrides: Vec<(String, String)>,
    train_dataset: Option<String>,
    test_dataset: Option<String>,
    no_segm: Option<bool>,
    output_dir: Option<PathBuf>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a TOML config file over the defaults. A missing or malformed
    /// file fails at `freeze()` with the underlying error; keys absent from
    /// the schema are rejected.
    #[must_use]
    pub fn merge_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Merge trailing `key value` override pairs (dotted key paths).
    pub fn merge_overrides(mut self, opts: &[String]) -> RunResult<Self> {
        if opts.len() % 2 != 0 {
            return Err(RunError::Config(format!(
                "opts must be key/value pairs, got {} items",
                opts.len()
            )));
        }
        for pair in opts.chunks(2) {
            self.overrides.push((pair[0].clone(), pair[1].clone()));
        }
        Ok(self)
    }

    #[must_use]
    pub fn train_dataset(mut self, name: impl Into<String>) -> Self {
        self.train_dataset = Some(name.into());
        self
    }

    #[must_use]
    pub fn test_dataset(mut self, name: impl Into<String>) -> Self {
        self.test_dataset = Some(name.into());
        self
    }

    #[must_use]
    pub fn no_segm(mut self, no_segm: bool) -> Self {
        self.no_segm = Some(no_segm);
        self
    }

    #[must_use]
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Apply all layers in precedence order and freeze the result.
    pub fn freeze(self) -> RunResult<FrozenConfig> {
        let mut tree = toml::Value::try_from(RunConfig::default())
            .map_err(|e| RunError::Config(format!("default schema is not serializable: {e}")))?;

        if let Some(path) = &self.file {
            let text = std::fs::read_to_string(path)?;
            let patch: toml::Value = toml::from_str(&text)?;
            validate_keys(&patch, &tree, "")?;
            deep_merge(&mut tree, patch);
        }

        for (key, raw) in &self.overrides {
            set_by_path(&mut tree, key, parse_override_value(raw))?;
        }

        let mut cfg: RunConfig = tree
            .try_into()
            .map_err(|e| RunError::Config(format!("config does not match schema: {e}")))?;

        if let Some(name) = self.train_dataset {
            cfg.datasets.train = vec![name];
        }
        if let Some(name) = self.test_dataset {
            cfg.datasets.test = vec![name];
        }
        if let Some(no_segm) = self.no_segm {
            cfg.test.no_segm = no_segm;
        }
        if let Some(dir) = self.output_dir {
            cfg.output_dir = dir;
        }

        cfg.validate()?;
        Ok(FrozenConfig(Arc::new(cfg)))
    }
}

/// Reject any key in `patch` that the schema tree does not already contain.
fn validate_keys(patch: &toml::Value, base: &toml::Value, prefix: &str) -> RunResult<()> {
    let (toml::Value::Table(patch), toml::Value::Table(base)) = (patch, base) else {
        return Ok(());
    };
    for (key, value) in patch {
        let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
        match base.get(key) {
            None => return Err(RunError::UnknownKey { key: path }),
            Some(base_value) => {
                if value.is_table() && base_value.is_table() {
                    validate_keys(value, base_value, &path)?;
                } else if value.is_table() != base_value.is_table() {
                    return Err(RunError::Config(format!(
                        "key '{path}' has the wrong shape (table vs value)"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn deep_merge(base: &mut toml::Value, patch: toml::Value) {
    match (base, patch) {
        (toml::Value::Table(base), toml::Value::Table(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Replace the leaf at a dotted key path. The full path must already exist
/// in the schema tree; unknown segments fail with the offending path.
fn set_by_path(tree: &mut toml::Value, key: &str, value: toml::Value) -> RunResult<()> {
    let mut node = tree;
    let segments: Vec<&str> = key.split('.').collect();
    for (idx, segment) in segments.iter().enumerate() {
        let table = node
            .as_table_mut()
            .ok_or_else(|| RunError::UnknownKey { key: key.to_string() })?;
        let slot = table
            .get_mut(*segment)
            .ok_or_else(|| RunError::UnknownKey { key: key.to_string() })?;
        if idx == segments.len() - 1 {
            *slot = value;
            return Ok(());
        }
        node = slot;
    }
    Err(RunError::UnknownKey { key: key.to_string() })
}

/// Parse an override value as a TOML literal, falling back to a bare string.
fn parse_override_value(raw: &str) -> toml::Value {
    let doc = format!("v = {raw}");
    match doc.parse::<toml::Table>() {
        Ok(mut table) => table
            .remove("v")
            .unwrap_or_else(|| toml::Value::String(raw.to_string())),
        Err(_) => toml::Value::String(raw.to_string()),
    }
}

/// Write the frozen config next to the run outputs for reproducibility.
pub fn dump_config(cfg: &FrozenConfig, dir: &Path) -> RunResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("config.toml");
    let text = toml::to_string_pretty(&**cfg)
        .map_err(|e| RunError::Config(format!("cannot serialize frozen config: {e}")))?;
    std::fs::write(&path, text)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_freeze() {
        let cfg = ConfigBuilder::new().freeze().unwrap();
        assert_eq!(cfg.seed, 42);
        assert_eq!(cfg.datasets.train, vec![DATASET_TRAIN.to_string()]);
        assert!(!cfg.test.no_segm);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.toml");
        std::fs::write(&path, "seed = 7\n[solver]\nmax_iter = 10\n").unwrap();

        let cfg = ConfigBuilder::new().merge_file(&path).freeze().unwrap();
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.solver.max_iter, 10);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.solver.checkpoint_period, 5_000);
    }

    #[test]
    fn test_opts_override_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.toml");
        std::fs::write(&path, "[solver]\nmax_iter = 10\n").unwrap();

        let cfg = ConfigBuilder::new()
            .merge_file(&path)
            .merge_overrides(&["solver.max_iter".to_string(), "25".to_string()])
            .unwrap()
            .freeze()
            .unwrap();
        assert_eq!(cfg.solver.max_iter, 25);
    }

    #[test]
    fn test_flag_setters_override_opts() {
        let cfg = ConfigBuilder::new()
            .merge_overrides(&["test.no_segm".to_string(), "false".to_string()])
            .unwrap()
            .no_segm(true)
            .test_dataset("other_valid")
            .freeze()
            .unwrap();
        assert!(cfg.test.no_segm);
        assert_eq!(cfg.datasets.test, vec!["other_valid".to_string()]);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.toml");
        std::fs::write(&path, "[solver]\nmomentum = 0.9\n").unwrap();

        let err = ConfigBuilder::new().merge_file(&path).freeze().unwrap_err();
        assert!(matches!(err, RunError::UnknownKey { key } if key == "solver.momentum"));
    }

    #[test]
    fn test_unknown_override_key_rejected() {
        let err = ConfigBuilder::new()
            .merge_overrides(&["solver.gamma".to_string(), "0.1".to_string()])
            .unwrap()
            .freeze()
            .unwrap_err();
        assert!(matches!(err, RunError::UnknownKey { key } if key == "solver.gamma"));
    }

    #[test]
    fn test_missing_file_propagates_io_error() {
        let err = ConfigBuilder::new().merge_file("/nonexistent/run.toml").freeze().unwrap_err();
        assert!(matches!(err, RunError::Io(_)));
    }

    #[test]
    fn test_malformed_file_propagates_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.toml");
        std::fs::write(&path, "[solver\nmax_iter = 1\n").unwrap();

        let err = ConfigBuilder::new().merge_file(&path).freeze().unwrap_err();
        assert!(matches!(err, RunError::Toml(_)));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let err = ConfigBuilder::new()
            .merge_overrides(&["solver.max_iter".to_string(), "\"lots\"".to_string()])
            .unwrap()
            .freeze()
            .unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_max_iter() {
        let err = ConfigBuilder::new()
            .merge_overrides(&["solver.max_iter".to_string(), "0".to_string()])
            .unwrap()
            .freeze()
            .unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
    }

    #[test]
    fn test_dump_config_round_trips() {
        let temp = TempDir::new().unwrap();
        let cfg = ConfigBuilder::new().freeze().unwrap();
        let path = dump_config(&cfg, temp.path()).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let reparsed: RunConfig = toml::from_str(&text).unwrap();
        assert_eq!(reparsed.seed, cfg.seed);
    }
}
