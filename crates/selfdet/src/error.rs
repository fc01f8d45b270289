use thiserror::Error;

pub type RunResult<T> = std::result::Result<T, RunError>;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid run config: {0}")]
    Config(String),

    #[error("unknown config key: {key}")]
    UnknownKey { key: String },

    #[error("dataset '{name}' is already registered")]
    DuplicateDataset { name: String },

    #[error("dataset '{name}' is not registered")]
    DatasetNotRegistered { name: String },

    #[error("no evaluator for the dataset {dataset} with the type {kind}")]
    EvaluatorUnimplemented { dataset: String, kind: String },

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("config file parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
