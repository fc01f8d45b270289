//! selfdet
//!
//! Orchestration for unsupervised object-detection runs:
//! - Building an immutable run configuration (`ConfigBuilder` / `FrozenConfig`)
//! - Registering dataset splits (`DatasetRegistry`)
//! - Selecting evaluators per dataset kind (`build_evaluator`)
//! - Driving training/evaluation through the trainer facade (`TrainerFacade`)
//! - Launching one task per replica (`launch`)

pub mod annotations;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod launch;
pub mod model;
pub mod progress;
pub mod registry;
pub mod trainer;

pub use annotations::{CocoAnnotations, ImageRecord, InstanceRecord};
pub use checkpoint::{Checkpoint, Checkpointer, LoadedFrom};
pub use config::{ConfigBuilder, FrozenConfig, RunConfig};
pub use error::{RunError, RunResult};
pub use evaluator::{
    build_evaluator, verify_results, Evaluator, EvaluatorKind, EvaluatorSet, MetricsReport,
    RunResults,
};
pub use launch::{launch, ReplicaContext};
pub use model::{Detection, Model, ReplayModel, ReplayState, TtaModel};
pub use progress::{NullProgressSink, ProgressEvent, ProgressSink, StdoutProgressSink};
pub use registry::{register_coco_layout, DatasetRegistry, DatasetRecord, DATASET_TRAIN, DATASET_VALID};
pub use trainer::{Hook, Runner, TrainerFacade, TrainerState};
