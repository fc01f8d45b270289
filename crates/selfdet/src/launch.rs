//! In-process replica launcher.
//!
//! Spawns one task per replica and hands each a `ReplicaContext`; the rank-0
//! result is the run result. This mirrors the call shape of a multi-process
//! launcher without owning any distributed coordination: side effects that
//! must happen once (result verification, summaries) are guarded by
//! `is_main_process` at the call sites.

use crate::error::{RunError, RunResult};
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaContext {
    pub rank: usize,
    pub world_size: usize,
}

impl ReplicaContext {
    /// Single-writer convention: only rank 0 verifies results and writes
    /// summaries.
    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }
}

/// Run `f` once per replica with identical arguments, returning the rank-0
/// result. Non-zero `world_size` is required; failures on any rank fail the
/// launch.
pub async fn launch<F, Fut, T>(world_size: usize, f: F) -> RunResult<T>
where
    F: Fn(ReplicaContext) -> Fut,
    Fut: Future<Output = RunResult<T>> + Send + 'static,
    T: Send + 'static,
{
    if world_size == 0 {
        return Err(RunError::Config("world_size must be >= 1".to_string()));
    }
    if world_size == 1 {
        return f(ReplicaContext { rank: 0, world_size: 1 }).await;
    }

    let mut handles = Vec::with_capacity(world_size - 1);
    for rank in 1..world_size {
        handles.push(tokio::spawn(f(ReplicaContext { rank, world_size })));
    }

    let main_result = f(ReplicaContext { rank: 0, world_size }).await;

    for handle in handles {
        handle
            .await
            .map_err(|e| RunError::Other(anyhow::anyhow!("replica task panicked: {e}")))??;
    }
    main_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_single_replica_returns_result() {
        let result = launch(1, |ctx| async move {
            assert!(ctx.is_main_process());
            Ok(ctx.rank)
        })
        .await
        .unwrap();
        assert_eq!(result, 0);
    }

    #[tokio::test]
    async fn test_all_replicas_run_and_rank_zero_wins() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = launch(4, {
            let counter = counter.clone();
            move |ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(ctx.rank * 10)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_replica_failure_fails_the_launch() {
        let result: RunResult<()> = launch(2, |ctx| async move {
            if ctx.rank == 1 {
                Err(RunError::Config("boom".to_string()))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_zero_world_size_rejected() {
        let result: RunResult<()> = launch(0, |_ctx| async move { Ok(()) }).await;
        assert!(result.is_err());
    }
}
