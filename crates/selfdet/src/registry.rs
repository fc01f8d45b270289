//! Dataset registration.
//!
//! Registration state is an explicit `DatasetRegistry` value passed into the
//! run context, not a process-wide catalog, so registration logic can be
//! tested in isolation.

use crate::error::{RunError, RunResult};
use crate::evaluator::EvaluatorKind;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Fixed name of the training split.
pub const DATASET_TRAIN: &str = "selfdet_train";
/// Fixed name of the validation split.
pub const DATASET_VALID: &str = "selfdet_valid";

/// Maps a dataset name to its on-disk annotation file and image directory.
///
/// Created once per process before training/evaluation begins and never
/// updated afterwards.
#[derive(Debug, Clone)]
pub struct DatasetRecord {
    pub name: String,
    pub annotations: PathBuf,
    pub image_root: PathBuf,
    /// Which evaluator family scores this dataset; `None` means the dataset
    /// was registered without one and cannot be evaluated.
    pub evaluator: Option<EvaluatorKind>,
}

#[derive(Debug, Default)]
pub struct DatasetRegistry {
    records: BTreeMap<String, DatasetRecord>,
}

impl DatasetRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset. Registering the same name twice is a programming
    /// error and fails loudly.
    pub fn register(&mut self, record: DatasetRecord) -> RunResult<()> {
        if self.records.contains_key(&record.name) {
            return Err(RunError::DuplicateDataset { name: record.name });
        }
        tracing::debug!(dataset = %record.name, "registered dataset");
        self.records.insert(record.name.clone(), record);
        Ok(())
    }

    pub fn get(&self, name: &str) -> RunResult<&DatasetRecord> {
        self.records
            .get(name)
            .ok_or_else(|| RunError::DatasetNotRegistered { name: name.to_string() })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }
}

/// Register the train and valid splits of a COCO-layout dataset directory:
/// `<dir>/annotations/instances_{train,val}2017.json` with images under
/// `<dir>/{train,val}2017/`.
// The eval-only and train-mode branches currently select the same val
// split; they stay separate because the selection is a per-mode policy.
#[allow(clippy::if_same_then_else)]
pub fn register_coco_layout(
    registry: &mut DatasetRegistry,
    base_dir: &Path,
    eval_only: bool,
) -> RunResult<()> {
    let annotations = base_dir.join("annotations");

    registry.register(DatasetRecord {
        name: DATASET_TRAIN.to_string(),
        annotations: annotations.join("instances_train2017.json"),
        image_root: base_dir.join("train2017"),
        evaluator: Some(EvaluatorKind::Coco),
    })?;

    if eval_only {
        // Evaluation-only runs score the plain val split; the tiled test
        // variant is deliberately not used for evaluation.
        registry.register(DatasetRecord {
            name: DATASET_VALID.to_string(),
            annotations: annotations.join("instances_val2017.json"),
            image_root: base_dir.join("val2017"),
            evaluator: Some(EvaluatorKind::Coco),
        })?;
    } else {
        registry.register(DatasetRecord {
            name: DATASET_VALID.to_string(),
            annotations: annotations.join("instances_val2017.json"),
            image_root: base_dir.join("val2017"),
            evaluator: Some(EvaluatorKind::Coco),
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> DatasetRecord {
        DatasetRecord {
            name: name.to_string(),
            annotations: PathBuf::from("ann.json"),
            image_root: PathBuf::from("images"),
            evaluator: Some(EvaluatorKind::Coco),
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = DatasetRegistry::new();
        registry.register(record("a")).unwrap();
        assert_eq!(registry.get("a").unwrap().name, "a");
        assert!(registry.get("b").is_err());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = DatasetRegistry::new();
        registry.register(record("a")).unwrap();
        let err = registry.register(record("a")).unwrap_err();
        assert!(matches!(err, RunError::DuplicateDataset { name } if name == "a"));
    }

    #[test]
    fn test_coco_layout_paths() {
        let mut registry = DatasetRegistry::new();
        register_coco_layout(&mut registry, Path::new("/data/coco"), false).unwrap();

        let train = registry.get(DATASET_TRAIN).unwrap();
        assert_eq!(
            train.annotations,
            Path::new("/data/coco/annotations/instances_train2017.json")
        );
        assert_eq!(train.image_root, Path::new("/data/coco/train2017"));

        let valid = registry.get(DATASET_VALID).unwrap();
        assert_eq!(
            valid.annotations,
            Path::new("/data/coco/annotations/instances_val2017.json")
        );
    }

    #[test]
    fn test_coco_layout_eval_only_registers_val_split() {
        let mut registry = DatasetRegistry::new();
        register_coco_layout(&mut registry, Path::new("/data/coco"), true).unwrap();
        let valid = registry.get(DATASET_VALID).unwrap();
        assert_eq!(valid.image_root, Path::new("/data/coco/val2017"));
    }

    #[test]
    fn test_coco_layout_twice_fails() {
        let mut registry = DatasetRegistry::new();
        register_coco_layout(&mut registry, Path::new("/data/coco"), false).unwrap();
        let err = register_coco_layout(&mut registry, Path::new("/data/coco"), false).unwrap_err();
        assert!(matches!(err, RunError::DuplicateDataset { .. }));
    }
}
