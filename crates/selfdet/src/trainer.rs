//! The trainer facade.
//!
//! Drives the generic loop (checkpointing, hooks, progress, final
//! evaluation) and owns the two extension points of this pipeline:
//! per-dataset evaluator construction and test-time-augmentation
//! evaluation. Everything model-specific stays behind the `Model` seam.

use crate::annotations::{CocoAnnotations, ImageRecord, InstanceRecord};
use crate::checkpoint::{Checkpoint, Checkpointer, LoadedFrom};
use crate::config::FrozenConfig;
use crate::error::{RunError, RunResult};
use crate::evaluator::{build_evaluator, RunResults};
use crate::launch::ReplicaContext;
use crate::model::{Detection, Model, ReplayModel, TtaModel};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::registry::DatasetRegistry;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

const LOG_PERIOD: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Constructed,
    Loaded,
    Running,
    Finished,
}

/// Hooks fired inside the training loop.
#[derive(Debug, Clone)]
pub enum Hook {
    /// Run an evaluation pass every `period` iterations; a period of 0 fires
    /// only at the final iteration.
    Eval { period: u64, tta: bool },
}

impl Hook {
    fn should_fire(&self, iteration: u64, max_iter: u64) -> bool {
        let Self::Eval { period, .. } = self;
        if *period == 0 {
            iteration + 1 == max_iter
        } else {
            (iteration + 1) % period == 0
        }
    }
}

/// A runnable training/evaluation driver.
#[async_trait]
pub trait Runner: Send {
    async fn train(&mut self, sink: &dyn ProgressSink) -> RunResult<RunResults>;

    async fn evaluate(&self, sink: &dyn ProgressSink) -> RunResult<RunResults>;
}

pub struct TrainerFacade {
    cfg: FrozenConfig,
    registry: Arc<DatasetRegistry>,
    model: Box<dyn Model>,
    checkpointer: Checkpointer,
    start_iter: u64,
    hooks: Vec<Hook>,
    state: TrainerState,
    main_process: bool,
}

impl TrainerFacade {
    #[must_use]
    pub fn new(cfg: FrozenConfig, registry: Arc<DatasetRegistry>) -> Self {
        let model = Self::build_model(&cfg);
        Self::with_model(cfg, registry, model)
    }

    /// Construct a trainer around an externally built model backend.
    #[must_use]
    pub fn with_model(
        cfg: FrozenConfig,
        registry: Arc<DatasetRegistry>,
        model: Box<dyn Model>,
    ) -> Self {
        let checkpointer = Checkpointer::new(cfg.output_dir.clone());
        Self {
            model,
            cfg,
            registry,
            checkpointer,
            start_iter: 0,
            hooks: Vec::new(),
            state: TrainerState::Constructed,
            main_process: true,
        }
    }

    /// Restrict file output (checkpoints, evaluator reports) to the main
    /// process of a multi-replica run. The replicas share one output
    /// directory, so only rank 0 may write to it.
    #[must_use]
    pub fn with_replica_context(mut self, ctx: &ReplicaContext) -> Self {
        self.main_process = ctx.is_main_process();
        self
    }

    /// Construct the model for a run. The only built-in backend is the
    /// replay model; swapping backends means swapping this constructor.
    #[must_use]
    pub fn build_model(_cfg: &FrozenConfig) -> Box<dyn Model> {
        Box::new(ReplayModel::new())
    }

    #[must_use]
    pub fn state(&self) -> TrainerState {
        self.state
    }

    #[must_use]
    pub fn start_iter(&self) -> u64 {
        self.start_iter
    }

    pub fn register_hooks(&mut self, hooks: Vec<Hook>) {
        self.hooks.extend(hooks);
    }

    /// Restore model weights: the newest checkpoint in the output dir when
    /// resuming, else the configured weights path, else scratch.
    pub fn resume_or_load(&mut self, resume: bool) -> RunResult<()> {
        let (checkpoint, from) =
            self.checkpointer.resume_or_load(&self.cfg.model.weights, resume)?;
        if let Some(checkpoint) = &checkpoint {
            self.model.load_state(&checkpoint.model_state)?;
        }
        self.start_iter = match (&from, &checkpoint) {
            (LoadedFrom::Resumed(_), Some(c)) => c.iteration + 1,
            _ => 0,
        };
        tracing::info!(?from, start_iter = self.start_iter, "weights loaded");
        self.state = TrainerState::Loaded;
        Ok(())
    }

    /// Evaluate `model` on every configured test dataset, writing evaluator
    /// outputs under `<output_dir>/inference/`.
    pub async fn test(
        cfg: &FrozenConfig,
        registry: &DatasetRegistry,
        model: &dyn Model,
        sink: &dyn ProgressSink,
    ) -> RunResult<RunResults> {
        let output_dir = cfg.output_dir.join("inference");
        evaluate_datasets(cfg, registry, &|image| model.predict(image), &output_dir, sink)
    }

    /// Evaluate with test-time augmentation: wrap the model in the
    /// augmentation-averaging wrapper, write outputs under
    /// `<output_dir>/inference_TTA/`, and re-key every result with a `-TTA`
    /// suffix so the reports can merge with the standard ones.
    pub async fn test_with_tta(
        cfg: &FrozenConfig,
        registry: &DatasetRegistry,
        model: &dyn Model,
        sink: &dyn ProgressSink,
    ) -> RunResult<RunResults> {
        tracing::info!("running inference with test-time augmentation ...");
        let tta = TtaModel::new(model, &cfg.test.aug);
        let output_dir = cfg.output_dir.join("inference_TTA");
        let results =
            evaluate_datasets(cfg, registry, &|image| tta.predict(image), &output_dir, sink)?;
        Ok(results.into_iter().map(|(name, report)| (format!("{name}-TTA"), report)).collect())
    }
}

#[async_trait]
impl Runner for TrainerFacade {
    /// Run the training loop to completion and return the final metrics
    /// (standard evaluation plus whatever the hooks produced).
    async fn train(&mut self, sink: &dyn ProgressSink) -> RunResult<RunResults> {
        match self.state {
            TrainerState::Constructed => self.resume_or_load(false)?,
            TrainerState::Loaded => {}
            TrainerState::Running | TrainerState::Finished => {
                return Err(RunError::Config("trainer has already run".to_string()));
            }
        }
        self.state = TrainerState::Running;

        let max_iter = self.cfg.solver.max_iter;
        let base_lr = self.cfg.solver.base_lr;
        sink.on_event(ProgressEvent::Started { start_iter: self.start_iter, max_iter });

        let mut hook_results = RunResults::new();
        for iteration in self.start_iter..max_iter {
            let loss = self.model.train_step(iteration, base_lr);
            if iteration % LOG_PERIOD == 0 || iteration + 1 == max_iter {
                sink.on_event(ProgressEvent::Step { iteration, max_iter, loss });
            }

            let is_final = iteration + 1 == max_iter;
            if self.main_process
                && ((iteration + 1) % self.cfg.solver.checkpoint_period == 0 || is_final)
            {
                let name = if is_final {
                    "model_final".to_string()
                } else {
                    format!("model_{iteration:07}")
                };
                let checkpoint = Checkpoint::new(iteration, self.model.state()?);
                self.checkpointer.save(&name, &checkpoint)?;
                sink.on_event(ProgressEvent::CheckpointSaved { iteration });
            }

            if self.main_process
                && self.cfg.test.eval_period > 0
                && (iteration + 1) % self.cfg.test.eval_period == 0
            {
                let results =
                    Self::test(&self.cfg, &self.registry, self.model.as_ref(), sink).await?;
                hook_results.extend(results);
            }

            let firing: Vec<Hook> = if self.main_process {
                self.hooks.iter().filter(|h| h.should_fire(iteration, max_iter)).cloned().collect()
            } else {
                Vec::new()
            };
            for hook in firing {
                let Hook::Eval { tta, .. } = hook;
                let results = if tta {
                    Self::test_with_tta(&self.cfg, &self.registry, self.model.as_ref(), sink)
                        .await?
                } else {
                    Self::test(&self.cfg, &self.registry, self.model.as_ref(), sink).await?
                };
                hook_results.extend(results);
            }
        }

        self.state = TrainerState::Finished;
        sink.on_event(ProgressEvent::Finished { iteration: max_iter });

        if !self.main_process {
            return Ok(RunResults::new());
        }

        // The final evaluation sees the fully trained model; it replaces any
        // earlier in-training report for the same dataset. Hook reports with
        // distinct keys (such as the `-TTA` ones) survive the merge.
        let final_results =
            Self::test(&self.cfg, &self.registry, self.model.as_ref(), sink).await?;
        hook_results.extend(final_results);
        Ok(hook_results)
    }

    async fn evaluate(&self, sink: &dyn ProgressSink) -> RunResult<RunResults> {
        Self::test(&self.cfg, &self.registry, self.model.as_ref(), sink).await
    }
}

/// One evaluation pass over every configured test dataset.
fn evaluate_datasets(
    cfg: &FrozenConfig,
    registry: &DatasetRegistry,
    predict: &dyn Fn(&ImageRecord) -> Vec<Detection>,
    output_dir: &Path,
    sink: &dyn ProgressSink,
) -> RunResult<RunResults> {
    let mut results = RunResults::new();
    for name in &cfg.datasets.test {
        sink.on_event(ProgressEvent::EvalStarted { dataset: name.clone() });
        let record = registry.get(name)?;
        let mut evaluator = build_evaluator(cfg, registry, name, output_dir)?;
        let annotations = CocoAnnotations::load(&record.annotations)?;

        evaluator.reset();
        for image in &annotations.images {
            let groundtruth: Vec<InstanceRecord> =
                annotations.instances_for(image.id).cloned().collect();
            let predictions: Vec<Detection> = predict(image)
                .into_iter()
                .filter(|d| d.score >= cfg.model.score_threshold)
                .collect();
            evaluator.process(image, &groundtruth, &predictions);
        }
        results.insert(name.clone(), evaluator.evaluate()?);
    }
    Ok(results)
}
