//! selfdet CLI - configure and launch training/evaluation runs.
//!
//! Reads a run config file, registers the dataset splits, and dispatches to
//! either an evaluation-only pass or a full training run, one task per
//! replica.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use selfdet::checkpoint::Checkpointer;
use selfdet::config::{dump_config, ConfigBuilder, FrozenConfig};
use selfdet::evaluator::{verify_results, RunResults};
use selfdet::launch::{launch, ReplicaContext};
use selfdet::progress::{NullProgressSink, ProgressSink, StdoutProgressSink};
use selfdet::registry::{register_coco_layout, DatasetRegistry};
use selfdet::trainer::{Hook, Runner, TrainerFacade};
use selfdet::RunResult;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// selfdet - unsupervised object-detection runs
#[derive(Parser, Debug)]
#[command(
    name = "selfdet",
    author,
    version,
    about = "Configure and launch unsupervised object-detection training/evaluation runs"
)]
struct Args {
    /// Run config file (TOML)
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Run evaluation only, restoring weights from the configured checkpoint
    #[arg(long)]
    eval_only: bool,

    /// Resume from the last checkpoint in the output directory
    #[arg(long)]
    resume: bool,

    /// Number of replica tasks to launch
    #[arg(long, default_value_t = 1)]
    num_replicas: usize,

    /// Override the training dataset name
    #[arg(long, default_value = "")]
    train_dataset: String,

    /// Override the test dataset name
    #[arg(long, default_value = "")]
    test_dataset: String,

    /// Drop segmentation metrics from COCO-style evaluation
    #[arg(long)]
    no_segm: bool,

    /// COCO-layout dataset directory
    #[arg(long, default_value = "./datasets/coco")]
    datasets_dir: PathBuf,

    /// Override the output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print final metrics as JSON
    #[arg(long)]
    json: bool,

    /// Trailing `key value` config overrides
    #[arg(trailing_var_arg = true)]
    opts: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct RunFlags {
    eval_only: bool,
    resume: bool,
}

/// Build the frozen config and the dataset registry for this invocation.
fn setup(args: &Args) -> Result<(FrozenConfig, Arc<DatasetRegistry>)> {
    let mut registry = DatasetRegistry::new();
    register_coco_layout(&mut registry, &args.datasets_dir, args.eval_only)
        .context("failed to register datasets")?;

    let mut builder = ConfigBuilder::new();
    if let Some(path) = &args.config_file {
        builder = builder.merge_file(path);
    }
    builder = builder.merge_overrides(&args.opts)?;
    if !args.train_dataset.is_empty() {
        builder = builder.train_dataset(&args.train_dataset);
    }
    if !args.test_dataset.is_empty() {
        builder = builder.test_dataset(&args.test_dataset);
    }
    builder = builder.no_segm(args.no_segm);
    if let Some(dir) = &args.output_dir {
        builder = builder.output_dir(dir);
    }
    let cfg = builder.freeze().context("failed to build run config")?;

    dump_config(&cfg, &cfg.output_dir).context("failed to write frozen config")?;
    tracing::info!(
        output_dir = %cfg.output_dir.display(),
        train = ?cfg.datasets.train,
        test = ?cfg.datasets.test,
        "run configured"
    );
    Ok((cfg, Arc::new(registry)))
}

/// One replica's share of the run: eval-only or full training.
async fn run_replica(
    cfg: FrozenConfig,
    registry: Arc<DatasetRegistry>,
    flags: RunFlags,
    ctx: ReplicaContext,
) -> RunResult<RunResults> {
    let sink: Box<dyn ProgressSink> = if ctx.is_main_process() {
        Box::new(StdoutProgressSink)
    } else {
        Box::new(NullProgressSink)
    };

    if flags.eval_only {
        // The replicas share one output directory; only rank 0 runs the
        // evaluation pass and writes its reports.
        if !ctx.is_main_process() {
            return Ok(RunResults::new());
        }
        let mut model = TrainerFacade::build_model(&cfg);
        let checkpointer = Checkpointer::new(cfg.output_dir.clone());
        let (checkpoint, _) = checkpointer.resume_or_load(&cfg.model.weights, flags.resume)?;
        if let Some(checkpoint) = checkpoint {
            model.load_state(&checkpoint.model_state)?;
        }

        let mut results =
            TrainerFacade::test(&cfg, &registry, model.as_ref(), sink.as_ref()).await?;
        if cfg.test.aug.enabled {
            results.extend(
                TrainerFacade::test_with_tta(&cfg, &registry, model.as_ref(), sink.as_ref())
                    .await?,
            );
        }
        verify_results(&cfg, &results)?;
        return Ok(results);
    }

    let mut trainer = TrainerFacade::new(cfg.clone(), registry).with_replica_context(&ctx);
    trainer.resume_or_load(flags.resume)?;
    if cfg.test.aug.enabled {
        trainer.register_hooks(vec![Hook::Eval { period: 0, tta: true }]);
    }
    trainer.train(sink.as_ref()).await
}

fn print_results(results: &RunResults, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }

    println!();
    println!("{}", "Evaluation results".bold().cyan());
    for (dataset, report) in results {
        println!();
        println!("  {}", dataset.cyan());
        for (metric, value) in report {
            println!("    {:<24} {value:.4}", metric.dimmed());
        }
    }
    println!();
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let (cfg, registry) = setup(&args)?;
    let flags = RunFlags { eval_only: args.eval_only, resume: args.resume };

    let results = launch(args.num_replicas, {
        let cfg = cfg.clone();
        move |ctx| {
            let cfg = cfg.clone();
            let registry = registry.clone();
            async move { run_replica(cfg, registry, flags, ctx).await }
        }
    })
    .await
    .context("run failed")?;

    print_results(&results, args.json)?;
    Ok(())
}
