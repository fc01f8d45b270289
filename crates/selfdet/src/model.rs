//! The model seam and the built-in replay backend.
//!
//! Model architectures and losses live behind the `Model` trait; this crate
//! ships only `ReplayModel`, a deterministic backend that replays a
//! prediction table from its checkpoint. It exists so the full pipeline
//! (config, registration, checkpointing, evaluation, TTA) can run and be
//! tested end to end without a tensor backend.

use crate::annotations::ImageRecord;
use crate::config::AugConfig;
use crate::error::{RunError, RunResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One predicted instance, boxes as `[x, y, width, height]` in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: [f64; 4],
    pub score: f64,
    pub category_id: u64,
}

/// Intersection over union of two `[x, y, w, h]` boxes.
#[must_use]
pub fn iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let ax2 = a[0] + a[2];
    let ay2 = a[1] + a[3];
    let bx2 = b[0] + b[2];
    let by2 = b[1] + b[3];

    let ix = (ax2.min(bx2) - a[0].max(b[0])).max(0.0);
    let iy = (ay2.min(by2) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let union = a[2] * a[3] + b[2] * b[3] - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

pub trait Model: Send + Sync {
    fn id(&self) -> &'static str;

    /// Detections for one image, in the image's pixel frame.
    fn predict(&self, image: &ImageRecord) -> Vec<Detection>;

    /// Predict on an augmented view, returning detections mapped back to the
    /// original frame. The default runs the plain forward path; backends with
    /// real augmentation sensitivity override this.
    fn predict_augmented(&self, image: &ImageRecord, view: &AugView) -> Vec<Detection> {
        let _ = view;
        self.predict(image)
    }

    /// One optimization step; returns the step loss.
    fn train_step(&mut self, iteration: u64, lr: f64) -> f64;

    fn state(&self) -> RunResult<serde_json::Value>;

    fn load_state(&mut self, state: &serde_json::Value) -> RunResult<()>;
}

/// Serializable state of `ReplayModel`: the prediction table keyed by image id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayState {
    pub iteration: u64,
    #[serde(default)]
    pub predictions: BTreeMap<u64, Vec<Detection>>,
}

#[derive(Debug, Default)]
pub struct ReplayModel {
    state: ReplayState,
}

impl ReplayModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_state(state: ReplayState) -> Self {
        Self { state }
    }

    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.state.iteration
    }
}

impl Model for ReplayModel {
    fn id(&self) -> &'static str {
        "replay"
    }

    fn predict(&self, image: &ImageRecord) -> Vec<Detection> {
        self.state.predictions.get(&image.id).cloned().unwrap_or_default()
    }

    fn train_step(&mut self, iteration: u64, lr: f64) -> f64 {
        // Nothing to optimize; report a deterministic decaying loss so the
        // loop, progress reporting and checkpoints stay exercised.
        self.state.iteration = iteration;
        (1.0 + iteration as f64 * lr).recip()
    }

    fn state(&self) -> RunResult<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn load_state(&mut self, state: &serde_json::Value) -> RunResult<()> {
        self.state = serde_json::from_value(state.clone())
            .map_err(|e| RunError::Checkpoint(format!("model state does not parse: {e}")))?;
        Ok(())
    }
}

/// One test-time augmentation view.
#[derive(Debug, Clone, PartialEq)]
pub struct AugView {
    pub scale: f64,
    pub hflip: bool,
}

/// Wraps a model and averages predictions across augmented views.
pub struct TtaModel<'a, M: Model + ?Sized> {
    inner: &'a M,
    views: Vec<AugView>,
}

impl<'a, M: Model + ?Sized> TtaModel<'a, M> {
    pub fn new(inner: &'a M, aug: &AugConfig) -> Self {
        let mut views = Vec::new();
        for &scale in &aug.scales {
            views.push(AugView { scale, hflip: false });
            if aug.flip {
                views.push(AugView { scale, hflip: true });
            }
        }
        if views.is_empty() {
            views.push(AugView { scale: 1.0, hflip: false });
        }
        Self { inner, views }
    }

    #[must_use]
    pub fn views(&self) -> &[AugView] {
        &self.views
    }

    /// Run every view and merge the pooled detections.
    pub fn predict(&self, image: &ImageRecord) -> Vec<Detection> {
        let mut pooled = Vec::new();
        for view in &self.views {
            pooled.extend(self.inner.predict_augmented(image, view));
        }
        merge_detections(pooled, 0.5)
    }
}

/// Greedy IoU clustering of pooled per-view detections: same-category boxes
/// overlapping a cluster representative above `iou_thresh` are averaged into
/// one detection (coordinates and scores alike).
#[must_use]
pub fn merge_detections(mut detections: Vec<Detection>, iou_thresh: f64) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut clusters: Vec<Vec<Detection>> = Vec::new();
    for det in detections {
        let slot = clusters.iter_mut().find(|c| {
            c[0].category_id == det.category_id && iou(&c[0].bbox, &det.bbox) > iou_thresh
        });
        match slot {
            Some(cluster) => cluster.push(det),
            None => clusters.push(vec![det]),
        }
    }

    clusters
        .into_iter()
        .map(|cluster| {
            let n = cluster.len() as f64;
            let mut bbox = [0.0; 4];
            let mut score = 0.0;
            for det in &cluster {
                for (slot, v) in bbox.iter_mut().zip(det.bbox.iter()) {
                    *slot += v;
                }
                score += det.score;
            }
            for slot in &mut bbox {
                *slot /= n;
            }
            Detection { bbox, score: score / n, category_id: cluster[0].category_id }
        })
        .collect()
}
