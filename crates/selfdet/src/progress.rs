use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { start_iter: u64, max_iter: u64 },
    Step { iteration: u64, max_iter: u64, loss: f64 },
    CheckpointSaved { iteration: u64 },
    EvalStarted { dataset: String },
    Finished { iteration: u64 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { start_iter, max_iter } => {
                println!("[train] starting at iter {start_iter}/{max_iter}");
            }
            ProgressEvent::Step { iteration, max_iter, loss } => {
                println!("[train] iter {iteration}/{max_iter} loss {loss:.4}");
            }
            ProgressEvent::CheckpointSaved { iteration } => {
                println!("[train] checkpoint saved at iter {iteration}");
            }
            ProgressEvent::EvalStarted { dataset } => println!("[eval] {dataset}"),
            ProgressEvent::Finished { iteration } => println!("[train] finished at iter {iteration}"),
        }
    }
}

/// Sink that drops everything; non-main replicas report nothing.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}
