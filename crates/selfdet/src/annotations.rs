//! COCO-instances annotation parsing (the subset this pipeline consumes).

use crate::error::{RunError, RunResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoAnnotations {
    pub images: Vec<ImageRecord>,
    pub annotations: Vec<InstanceRecord>,
    #[serde(default)]
    pub categories: Vec<CategoryRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: u64,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: u64,
    pub image_id: u64,
    pub category_id: u64,
    /// `[x, y, width, height]` in absolute pixels.
    pub bbox: [f64; 4],
    #[serde(default)]
    pub segmentation: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub id: u64,
    pub name: String,
}

impl CocoAnnotations {
    pub fn load(path: &Path) -> RunResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            RunError::Evaluation(format!("cannot read annotations {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Ground-truth instances for one image.
    pub fn instances_for(&self, image_id: u64) -> impl Iterator<Item = &InstanceRecord> {
        self.annotations.iter().filter(move |a| a.image_id == image_id)
    }
}
