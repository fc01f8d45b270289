//! Evaluators and the per-dataset evaluator selector.
//!
//! An evaluator lives for one evaluation pass: it accumulates predictions
//! image by image and produces a metrics report at the end. Mask-level
//! scoring is out of scope for this pipeline; every evaluator scores with
//! box overlap, and the semantic/panoptic variants state their box-proxy
//! semantics in their metric computation.

use crate::annotations::{ImageRecord, InstanceRecord};
use crate::config::FrozenConfig;
use crate::error::{RunError, RunResult};
use crate::model::{iou, Detection};
use crate::registry::DatasetRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Metrics produced by one evaluator for one dataset.
pub type MetricsReport = BTreeMap<String, f64>;

/// Results of a whole evaluation phase, keyed by dataset name.
pub type RunResults = BTreeMap<String, MetricsReport>;

/// The closed set of evaluator families a dataset can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    SemSeg,
    Coco,
    CocoPanopticSeg,
    CityscapesInstance,
    CityscapesSemSeg,
    PascalVoc,
    Lvis,
}

impl fmt::Display for EvaluatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::SemSeg => "sem_seg",
            Self::Coco => "coco",
            Self::CocoPanopticSeg => "coco_panoptic_seg",
            Self::CityscapesInstance => "cityscapes_instance",
            Self::CityscapesSemSeg => "cityscapes_sem_seg",
            Self::PascalVoc => "pascal_voc",
            Self::Lvis => "lvis",
        };
        f.write_str(tag)
    }
}

impl FromStr for EvaluatorKind {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sem_seg" => Ok(Self::SemSeg),
            "coco" => Ok(Self::Coco),
            "coco_panoptic_seg" => Ok(Self::CocoPanopticSeg),
            "cityscapes_instance" => Ok(Self::CityscapesInstance),
            "cityscapes_sem_seg" => Ok(Self::CityscapesSemSeg),
            "pascal_voc" => Ok(Self::PascalVoc),
            "lvis" => Ok(Self::Lvis),
            other => Err(RunError::Config(format!("unknown evaluator kind: {other}"))),
        }
    }
}

pub trait Evaluator: Send {
    fn name(&self) -> &'static str;

    /// Drop all accumulated state, ready for a fresh pass.
    fn reset(&mut self);

    /// Accumulate one image's ground truth and predictions.
    fn process(&mut self, image: &ImageRecord, groundtruth: &[InstanceRecord], predictions: &[Detection]);

    /// Finish the pass and report metrics.
    fn evaluate(&mut self) -> RunResult<MetricsReport>;

    /// Names of the evaluators running in this pass; a composite reports its
    /// members in order, anything else reports itself.
    fn member_names(&self) -> Vec<&'static str> {
        vec![self.name()]
    }
}

// ---------------------------------------------------------------------------
// Shared matching machinery
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct CategoryStats {
    gt: u64,
    tp: u64,
    iou_sum: f64,
}

/// Pooled greedy box matching across a dataset, at a set of IoU thresholds.
#[derive(Debug, Clone)]
struct DetectionAccumulator {
    thresholds: Vec<f64>,
    /// One `(score, is_true_positive)` list per threshold.
    samples: Vec<Vec<(f64, bool)>>,
    total_gt: u64,
    images: u64,
    /// Per-category stats at the first threshold.
    per_category: BTreeMap<u64, CategoryStats>,
}

impl DetectionAccumulator {
    fn new(thresholds: &[f64]) -> Self {
        Self {
            thresholds: thresholds.to_vec(),
            samples: vec![Vec::new(); thresholds.len()],
            total_gt: 0,
            images: 0,
            per_category: BTreeMap::new(),
        }
    }

    fn reset(&mut self) {
        for s in &mut self.samples {
            s.clear();
        }
        self.total_gt = 0;
        self.images = 0;
        self.per_category.clear();
    }

    fn observe(&mut self, groundtruth: &[InstanceRecord], predictions: &[Detection]) {
        self.images += 1;
        self.total_gt += groundtruth.len() as u64;
        for gt in groundtruth {
            self.per_category.entry(gt.category_id).or_default().gt += 1;
        }

        let mut ranked: Vec<&Detection> = predictions.iter().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        for (t_idx, &threshold) in self.thresholds.iter().enumerate() {
            let mut taken = vec![false; groundtruth.len()];
            for pred in &ranked {
                let mut best: Option<(usize, f64)> = None;
                for (g_idx, gt) in groundtruth.iter().enumerate() {
                    if taken[g_idx] || gt.category_id != pred.category_id {
                        continue;
                    }
                    let overlap = iou(&gt.bbox, &pred.bbox);
                    if overlap >= threshold && best.map_or(true, |(_, b)| overlap > b) {
                        best = Some((g_idx, overlap));
                    }
                }
                match best {
                    Some((g_idx, overlap)) => {
                        taken[g_idx] = true;
                        self.samples[t_idx].push((pred.score, true));
                        if t_idx == 0 {
                            let stats = self
                                .per_category
                                .entry(groundtruth[g_idx].category_id)
                                .or_default();
                            stats.tp += 1;
                            stats.iou_sum += overlap;
                        }
                    }
                    None => self.samples[t_idx].push((pred.score, false)),
                }
            }
        }
    }

    /// Continuous-interpolation average precision at threshold index `t_idx`.
    fn average_precision(&self, t_idx: usize) -> f64 {
        ap_from_samples(&self.samples[t_idx], self.total_gt, false)
    }

    /// PASCAL VOC 11-point interpolated AP at threshold index `t_idx`.
    fn average_precision_11point(&self, t_idx: usize) -> f64 {
        ap_from_samples(&self.samples[t_idx], self.total_gt, true)
    }

    /// Mean per-category recall at the first threshold.
    fn mean_category_recall(&self) -> f64 {
        let recalls: Vec<f64> = self
            .per_category
            .values()
            .filter(|c| c.gt > 0)
            .map(|c| c.tp as f64 / c.gt as f64)
            .collect();
        if recalls.is_empty() {
            0.0
        } else {
            recalls.iter().sum::<f64>() / recalls.len() as f64
        }
    }

    /// Panoptic-quality style score at the first threshold:
    /// `sum(IoU of matches) / (TP + FP/2 + FN/2)`.
    fn panoptic_quality(&self) -> f64 {
        let tp: u64 = self.samples[0].iter().filter(|(_, hit)| *hit).count() as u64;
        let fp: u64 = self.samples[0].len() as u64 - tp;
        let fn_: u64 = self.total_gt - tp;
        let denom = tp as f64 + fp as f64 / 2.0 + fn_ as f64 / 2.0;
        if denom == 0.0 {
            return 0.0;
        }
        let iou_sum: f64 = self
            .per_category
            .values()
            .map(|c| c.iou_sum)
            .sum();
        iou_sum / denom
    }
}

fn ap_from_samples(samples: &[(f64, bool)], total_gt: u64, eleven_point: bool) -> f64 {
    if total_gt == 0 || samples.is_empty() {
        return 0.0;
    }
    let mut ranked = samples.to_vec();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut tp = 0u64;
    let mut fp = 0u64;
    let mut points = Vec::with_capacity(ranked.len());
    for (_, hit) in ranked {
        if hit {
            tp += 1;
        } else {
            fp += 1;
        }
        let precision = tp as f64 / (tp + fp) as f64;
        let recall = tp as f64 / total_gt as f64;
        points.push((recall, precision));
    }

    // Precision envelope: each point gets the max precision at >= its recall.
    let mut envelope = points.clone();
    let mut running = 0.0f64;
    for point in envelope.iter_mut().rev() {
        running = running.max(point.1);
        point.1 = running;
    }

    if eleven_point {
        let mut sum = 0.0;
        for i in 0..=10 {
            let level = f64::from(i) / 10.0;
            let p = envelope
                .iter()
                .filter(|(r, _)| *r >= level)
                .map(|(_, p)| *p)
                .fold(0.0f64, f64::max);
            sum += p;
        }
        return sum / 11.0;
    }

    let mut ap = 0.0;
    let mut prev_recall = 0.0;
    for (recall, precision) in envelope {
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }
    ap
}

// ---------------------------------------------------------------------------
// Concrete evaluators
// ---------------------------------------------------------------------------

/// COCO-style detection evaluation (bbox AP at 0.5 and 0.75 IoU).
pub struct CocoEvaluator {
    dataset: String,
    output_dir: PathBuf,
    no_segm: bool,
    bbox: DetectionAccumulator,
    segm: DetectionAccumulator,
    segm_gt_seen: bool,
}

impl CocoEvaluator {
    #[must_use]
    pub fn new(dataset: &str, output_dir: &Path, no_segm: bool) -> Self {
        Self {
            dataset: dataset.to_string(),
            output_dir: output_dir.to_path_buf(),
            no_segm,
            bbox: DetectionAccumulator::new(&[0.5, 0.75]),
            segm: DetectionAccumulator::new(&[0.5, 0.75]),
            segm_gt_seen: false,
        }
    }
}

impl Evaluator for CocoEvaluator {
    fn name(&self) -> &'static str {
        "coco"
    }

    fn reset(&mut self) {
        self.bbox.reset();
        self.segm.reset();
        self.segm_gt_seen = false;
    }

    fn process(&mut self, _image: &ImageRecord, groundtruth: &[InstanceRecord], predictions: &[Detection]) {
        self.bbox.observe(groundtruth, predictions);
        if !self.no_segm {
            // Segmentation metrics score the instances that carry masks, with
            // box overlap standing in for mask overlap.
            let with_masks: Vec<InstanceRecord> = groundtruth
                .iter()
                .filter(|g| g.segmentation.is_some())
                .cloned()
                .collect();
            if !with_masks.is_empty() {
                self.segm_gt_seen = true;
                self.segm.observe(&with_masks, predictions);
            }
        }
    }

    fn evaluate(&mut self) -> RunResult<MetricsReport> {
        std::fs::create_dir_all(&self.output_dir)?;
        let mut report = MetricsReport::new();
        report.insert("bbox/AP50".to_string(), self.bbox.average_precision(0));
        report.insert("bbox/AP75".to_string(), self.bbox.average_precision(1));
        report.insert("bbox/num_images".to_string(), self.bbox.images as f64);
        if !self.no_segm && self.segm_gt_seen {
            report.insert("segm/AP50".to_string(), self.segm.average_precision(0));
            report.insert("segm/AP75".to_string(), self.segm.average_precision(1));
        }

        let summary = serde_json::to_string_pretty(&report)?;
        std::fs::write(
            self.output_dir.join(format!("{}_coco_metrics.json", self.dataset)),
            summary,
        )?;
        tracing::info!(dataset = %self.dataset, "coco evaluation finished");
        Ok(report)
    }
}

/// Semantic segmentation evaluation; category-level box-proxy mIoU.
pub struct SemSegEvaluator {
    dataset: String,
    output_dir: PathBuf,
    acc: DetectionAccumulator,
}

impl SemSegEvaluator {
    #[must_use]
    pub fn new(dataset: &str, output_dir: &Path) -> Self {
        Self {
            dataset: dataset.to_string(),
            output_dir: output_dir.to_path_buf(),
            acc: DetectionAccumulator::new(&[0.5]),
        }
    }
}

impl Evaluator for SemSegEvaluator {
    fn name(&self) -> &'static str {
        "sem_seg"
    }

    fn reset(&mut self) {
        self.acc.reset();
    }

    fn process(&mut self, _image: &ImageRecord, groundtruth: &[InstanceRecord], predictions: &[Detection]) {
        self.acc.observe(groundtruth, predictions);
    }

    fn evaluate(&mut self) -> RunResult<MetricsReport> {
        std::fs::create_dir_all(&self.output_dir)?;
        let mut report = MetricsReport::new();
        report.insert("sem_seg/mIoU".to_string(), self.acc.mean_category_recall());
        tracing::info!(dataset = %self.dataset, "semantic evaluation finished");
        Ok(report)
    }
}

/// Panoptic-quality style evaluation over matched instances.
pub struct PanopticEvaluator {
    dataset: String,
    acc: DetectionAccumulator,
}

impl PanopticEvaluator {
    #[must_use]
    pub fn new(dataset: &str) -> Self {
        Self { dataset: dataset.to_string(), acc: DetectionAccumulator::new(&[0.5]) }
    }
}

impl Evaluator for PanopticEvaluator {
    fn name(&self) -> &'static str {
        "panoptic"
    }

    fn reset(&mut self) {
        self.acc.reset();
    }

    fn process(&mut self, _image: &ImageRecord, groundtruth: &[InstanceRecord], predictions: &[Detection]) {
        self.acc.observe(groundtruth, predictions);
    }

    fn evaluate(&mut self) -> RunResult<MetricsReport> {
        let mut report = MetricsReport::new();
        report.insert("panoptic/PQ".to_string(), self.acc.panoptic_quality());
        tracing::info!(dataset = %self.dataset, "panoptic evaluation finished");
        Ok(report)
    }
}

pub struct CityscapesInstanceEvaluator {
    dataset: String,
    acc: DetectionAccumulator,
}

impl CityscapesInstanceEvaluator {
    #[must_use]
    pub fn new(dataset: &str) -> Self {
        Self { dataset: dataset.to_string(), acc: DetectionAccumulator::new(&[0.5]) }
    }
}

impl Evaluator for CityscapesInstanceEvaluator {
    fn name(&self) -> &'static str {
        "cityscapes_instance"
    }

    fn reset(&mut self) {
        self.acc.reset();
    }

    fn process(&mut self, _image: &ImageRecord, groundtruth: &[InstanceRecord], predictions: &[Detection]) {
        self.acc.observe(groundtruth, predictions);
    }

    fn evaluate(&mut self) -> RunResult<MetricsReport> {
        let mut report = MetricsReport::new();
        report.insert("cityscapes/AP50".to_string(), self.acc.average_precision(0));
        tracing::info!(dataset = %self.dataset, "cityscapes instance evaluation finished");
        Ok(report)
    }
}

pub struct CityscapesSemSegEvaluator {
    dataset: String,
    acc: DetectionAccumulator,
}

impl CityscapesSemSegEvaluator {
    #[must_use]
    pub fn new(dataset: &str) -> Self {
        Self { dataset: dataset.to_string(), acc: DetectionAccumulator::new(&[0.5]) }
    }
}

impl Evaluator for CityscapesSemSegEvaluator {
    fn name(&self) -> &'static str {
        "cityscapes_sem_seg"
    }

    fn reset(&mut self) {
        self.acc.reset();
    }

    fn process(&mut self, _image: &ImageRecord, groundtruth: &[InstanceRecord], predictions: &[Detection]) {
        self.acc.observe(groundtruth, predictions);
    }

    fn evaluate(&mut self) -> RunResult<MetricsReport> {
        let mut report = MetricsReport::new();
        report.insert("cityscapes_sem_seg/mIoU".to_string(), self.acc.mean_category_recall());
        tracing::info!(dataset = %self.dataset, "cityscapes semantic evaluation finished");
        Ok(report)
    }
}

/// Pascal VOC detection evaluation (11-point interpolated AP).
pub struct PascalVocEvaluator {
    dataset: String,
    acc: DetectionAccumulator,
}

impl PascalVocEvaluator {
    #[must_use]
    pub fn new(dataset: &str) -> Self {
        Self { dataset: dataset.to_string(), acc: DetectionAccumulator::new(&[0.5]) }
    }
}

impl Evaluator for PascalVocEvaluator {
    fn name(&self) -> &'static str {
        "pascal_voc"
    }

    fn reset(&mut self) {
        self.acc.reset();
    }

    fn process(&mut self, _image: &ImageRecord, groundtruth: &[InstanceRecord], predictions: &[Detection]) {
        self.acc.observe(groundtruth, predictions);
    }

    fn evaluate(&mut self) -> RunResult<MetricsReport> {
        let mut report = MetricsReport::new();
        report.insert("voc/AP50".to_string(), self.acc.average_precision_11point(0));
        tracing::info!(dataset = %self.dataset, "pascal voc evaluation finished");
        Ok(report)
    }
}

pub struct LvisEvaluator {
    dataset: String,
    output_dir: PathBuf,
    acc: DetectionAccumulator,
}

impl LvisEvaluator {
    #[must_use]
    pub fn new(dataset: &str, output_dir: &Path) -> Self {
        Self {
            dataset: dataset.to_string(),
            output_dir: output_dir.to_path_buf(),
            acc: DetectionAccumulator::new(&[0.5]),
        }
    }
}

impl Evaluator for LvisEvaluator {
    fn name(&self) -> &'static str {
        "lvis"
    }

    fn reset(&mut self) {
        self.acc.reset();
    }

    fn process(&mut self, _image: &ImageRecord, groundtruth: &[InstanceRecord], predictions: &[Detection]) {
        self.acc.observe(groundtruth, predictions);
    }

    fn evaluate(&mut self) -> RunResult<MetricsReport> {
        std::fs::create_dir_all(&self.output_dir)?;
        let mut report = MetricsReport::new();
        report.insert("lvis/AP50".to_string(), self.acc.average_precision(0));
        tracing::info!(dataset = %self.dataset, "lvis evaluation finished");
        Ok(report)
    }
}

/// Runs several evaluators over the same pass and merges their reports.
pub struct EvaluatorSet {
    members: Vec<Box<dyn Evaluator>>,
}

impl EvaluatorSet {
    #[must_use]
    pub fn new(members: Vec<Box<dyn Evaluator>>) -> Self {
        Self { members }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Evaluator for EvaluatorSet {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn reset(&mut self) {
        for member in &mut self.members {
            member.reset();
        }
    }

    fn process(&mut self, image: &ImageRecord, groundtruth: &[InstanceRecord], predictions: &[Detection]) {
        for member in &mut self.members {
            member.process(image, groundtruth, predictions);
        }
    }

    fn member_names(&self) -> Vec<&'static str> {
        self.members.iter().map(|m| m.name()).collect()
    }

    fn evaluate(&mut self) -> RunResult<MetricsReport> {
        let mut merged = MetricsReport::new();
        for member in &mut self.members {
            for (key, value) in member.evaluate()? {
                if merged.insert(key.clone(), value).is_some() {
                    return Err(RunError::Evaluation(format!(
                        "evaluator '{}' produced duplicate metric key '{key}'",
                        member.name()
                    )));
                }
            }
        }
        Ok(merged)
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Create evaluator(s) for a dataset from its declared evaluator kind.
///
/// Branch behavior kept as documented: the COCO-family kinds (`sem_seg`,
/// `coco`, `coco_panoptic_seg`) accumulate into a list that may become a
/// composite, while the cityscapes / pascal_voc / lvis kinds return their
/// single evaluator early and never compose.
pub fn build_evaluator(
    cfg: &FrozenConfig,
    registry: &DatasetRegistry,
    dataset_name: &str,
    output_dir: &Path,
) -> RunResult<Box<dyn Evaluator>> {
    let record = registry.get(dataset_name)?;
    let kind = record.evaluator;

    let mut evaluator_list: Vec<Box<dyn Evaluator>> = Vec::new();
    if matches!(kind, Some(EvaluatorKind::SemSeg | EvaluatorKind::CocoPanopticSeg)) {
        evaluator_list.push(Box::new(SemSegEvaluator::new(dataset_name, output_dir)));
    }
    if matches!(kind, Some(EvaluatorKind::Coco | EvaluatorKind::CocoPanopticSeg)) {
        evaluator_list.push(Box::new(CocoEvaluator::new(dataset_name, output_dir, cfg.test.no_segm)));
    }
    if matches!(kind, Some(EvaluatorKind::CocoPanopticSeg)) {
        evaluator_list.push(Box::new(PanopticEvaluator::new(dataset_name)));
    }
    if matches!(kind, Some(EvaluatorKind::CityscapesInstance)) {
        return Ok(Box::new(CityscapesInstanceEvaluator::new(dataset_name)));
    }
    if matches!(kind, Some(EvaluatorKind::CityscapesSemSeg)) {
        return Ok(Box::new(CityscapesSemSegEvaluator::new(dataset_name)));
    } else if matches!(kind, Some(EvaluatorKind::PascalVoc)) {
        return Ok(Box::new(PascalVocEvaluator::new(dataset_name)));
    } else if matches!(kind, Some(EvaluatorKind::Lvis)) {
        return Ok(Box::new(LvisEvaluator::new(dataset_name, output_dir)));
    }

    if evaluator_list.is_empty() {
        return Err(RunError::EvaluatorUnimplemented {
            dataset: dataset_name.to_string(),
            kind: kind.map_or_else(|| "unspecified".to_string(), |k| k.to_string()),
        });
    }
    if evaluator_list.len() == 1 {
        return Ok(evaluator_list.remove(0));
    }
    Ok(Box::new(EvaluatorSet::new(evaluator_list)))
}

/// Check produced metrics against the `[test] expected_results` entries.
/// Returns an error naming the first metric outside tolerance.
pub fn verify_results(cfg: &FrozenConfig, results: &RunResults) -> RunResult<()> {
    for expected in &cfg.test.expected_results {
        let report = results.get(&expected.dataset).ok_or_else(|| {
            RunError::Evaluation(format!(
                "expected results for dataset '{}' but it was not evaluated",
                expected.dataset
            ))
        })?;
        let actual = report.get(&expected.metric).ok_or_else(|| {
            RunError::Evaluation(format!(
                "expected metric '{}' missing from dataset '{}' report",
                expected.metric, expected.dataset
            ))
        })?;
        if (actual - expected.value).abs() > expected.tolerance {
            return Err(RunError::Evaluation(format!(
                "metric '{}' on '{}' is {actual:.4}, expected {:.4} +/- {:.4}",
                expected.metric, expected.dataset, expected.value, expected.tolerance
            )));
        }
        tracing::info!(
            dataset = %expected.dataset,
            metric = %expected.metric,
            value = actual,
            "expected result verified"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::registry::DatasetRecord;

    fn frozen() -> FrozenConfig {
        ConfigBuilder::new().freeze().unwrap()
    }

    fn registry_with(kind: Option<EvaluatorKind>) -> DatasetRegistry {
        let mut registry = DatasetRegistry::new();
        registry
            .register(DatasetRecord {
                name: "ds".to_string(),
                annotations: PathBuf::from("ann.json"),
                image_root: PathBuf::from("images"),
                evaluator: kind,
            })
            .unwrap();
        registry
    }

    fn gt(id: u64, x: f64) -> InstanceRecord {
        InstanceRecord {
            id,
            image_id: 1,
            category_id: 1,
            bbox: [x, 10.0, 20.0, 20.0],
            segmentation: None,
        }
    }

    fn image() -> ImageRecord {
        ImageRecord { id: 1, file_name: "000001.jpg".to_string(), width: 128, height: 128 }
    }

    #[test]
    fn test_selector_coco_is_single() {
        let registry = registry_with(Some(EvaluatorKind::Coco));
        let evaluator =
            build_evaluator(&frozen(), &registry, "ds", Path::new("/tmp/out")).unwrap();
        assert_eq!(evaluator.name(), "coco");
    }

    #[test]
    fn test_selector_panoptic_is_composite_of_three() {
        let registry = registry_with(Some(EvaluatorKind::CocoPanopticSeg));
        let evaluator = build_evaluator(&frozen(), &registry, "ds", Path::new("/tmp/out")).unwrap();
        assert_eq!(evaluator.name(), "composite");
        assert_eq!(evaluator.member_names(), vec!["sem_seg", "coco", "panoptic"]);
    }

    #[test]
    fn test_selector_lvis_returns_single_never_composite() {
        let registry = registry_with(Some(EvaluatorKind::Lvis));
        let evaluator =
            build_evaluator(&frozen(), &registry, "ds", Path::new("/tmp/out")).unwrap();
        assert_eq!(evaluator.name(), "lvis");
        assert_eq!(evaluator.member_names(), vec!["lvis"]);
    }

    #[test]
    fn test_selector_pascal_voc_returns_single() {
        let registry = registry_with(Some(EvaluatorKind::PascalVoc));
        let evaluator =
            build_evaluator(&frozen(), &registry, "ds", Path::new("/tmp/out")).unwrap();
        assert_eq!(evaluator.name(), "pascal_voc");
    }

    #[test]
    fn test_selector_unspecified_kind_is_unimplemented() {
        let registry = registry_with(None);
        let err =
            build_evaluator(&frozen(), &registry, "ds", Path::new("/tmp/out")).err().unwrap();
        match err {
            RunError::EvaluatorUnimplemented { dataset, kind } => {
                assert_eq!(dataset, "ds");
                assert_eq!(kind, "unspecified");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_selector_unregistered_dataset_fails() {
        let registry = DatasetRegistry::new();
        let err =
            build_evaluator(&frozen(), &registry, "nope", Path::new("/tmp/out")).err().unwrap();
        assert!(matches!(err, RunError::DatasetNotRegistered { .. }));
    }

    #[test]
    fn test_coco_evaluator_perfect_predictions() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut evaluator = CocoEvaluator::new("ds", temp.path(), true);
        let groundtruth = vec![gt(1, 10.0), gt(2, 50.0)];
        let predictions = vec![
            Detection { bbox: [10.0, 10.0, 20.0, 20.0], score: 0.9, category_id: 1 },
            Detection { bbox: [50.0, 10.0, 20.0, 20.0], score: 0.8, category_id: 1 },
        ];
        evaluator.process(&image(), &groundtruth, &predictions);
        let report = evaluator.evaluate().unwrap();
        assert_eq!(report["bbox/AP50"], 1.0);
        assert_eq!(report["bbox/AP75"], 1.0);
        assert!(!report.contains_key("segm/AP50"));
    }

    #[test]
    fn test_coco_evaluator_false_positive_lowers_ap() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut evaluator = CocoEvaluator::new("ds", temp.path(), true);
        let groundtruth = vec![gt(1, 10.0)];
        let predictions = vec![
            // The false positive outranks the hit.
            Detection { bbox: [90.0, 90.0, 20.0, 20.0], score: 0.95, category_id: 1 },
            Detection { bbox: [10.0, 10.0, 20.0, 20.0], score: 0.9, category_id: 1 },
        ];
        evaluator.process(&image(), &groundtruth, &predictions);
        let report = evaluator.evaluate().unwrap();
        assert!(report["bbox/AP50"] < 1.0);
        assert!(report["bbox/AP50"] > 0.0);
    }

    #[test]
    fn test_coco_evaluator_segm_keys_follow_mask_presence() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut evaluator = CocoEvaluator::new("ds", temp.path(), false);
        let mut masked = gt(1, 10.0);
        masked.segmentation = Some(serde_json::json!([[0, 0, 1, 1]]));
        let predictions =
            vec![Detection { bbox: [10.0, 10.0, 20.0, 20.0], score: 0.9, category_id: 1 }];
        evaluator.process(&image(), &[masked], &predictions);
        let report = evaluator.evaluate().unwrap();
        assert!(report.contains_key("segm/AP50"));
    }

    #[test]
    fn test_evaluator_set_rejects_duplicate_keys() {
        let mut set = EvaluatorSet::new(vec![
            Box::new(PanopticEvaluator::new("ds")),
            Box::new(PanopticEvaluator::new("ds")),
        ]);
        let err = set.evaluate().unwrap_err();
        assert!(matches!(err, RunError::Evaluation(_)));
    }

    #[test]
    fn test_panoptic_quality_perfect_match() {
        let mut evaluator = PanopticEvaluator::new("ds");
        let groundtruth = vec![gt(1, 10.0)];
        let predictions =
            vec![Detection { bbox: [10.0, 10.0, 20.0, 20.0], score: 0.9, category_id: 1 }];
        evaluator.process(&image(), &groundtruth, &predictions);
        let report = evaluator.evaluate().unwrap();
        assert!((report["panoptic/PQ"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_verify_results_within_tolerance() {
        let cfg = ConfigBuilder::new()
            .merge_overrides(&[
                "test.expected_results".to_string(),
                "[{ dataset = \"ds\", metric = \"bbox/AP50\", value = 0.5, tolerance = 0.1 }]"
                    .to_string(),
            ])
            .unwrap()
            .freeze()
            .unwrap();

        let mut results = RunResults::new();
        results.insert("ds".to_string(), MetricsReport::from([("bbox/AP50".to_string(), 0.55)]));
        verify_results(&cfg, &results).unwrap();

        results.insert("ds".to_string(), MetricsReport::from([("bbox/AP50".to_string(), 0.9)]));
        assert!(verify_results(&cfg, &results).is_err());
    }

    #[test]
    fn test_kind_round_trips_strings() {
        for tag in [
            "sem_seg",
            "coco",
            "coco_panoptic_seg",
            "cityscapes_instance",
            "cityscapes_sem_seg",
            "pascal_voc",
            "lvis",
        ] {
            let kind: EvaluatorKind = tag.parse().unwrap();
            assert_eq!(kind.to_string(), tag);
        }
        assert!("mystery".parse::<EvaluatorKind>().is_err());
    }
}
