use super::Pipeline;
use crate::core::{PipelineError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// One background loop. A tick in progress always runs to completion; the
/// stop signal is only observed between ticks.
pub struct WorkerHandle {
    name: String,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| PipelineError::LockError(format!("{} worker join: {err}", self.name)))?;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawn a loop that calls `tick` every `interval`. A tick returning
/// `Ok(true)` has more work and is called again right away. A fatal error
/// stops the loop.
pub fn spawn_periodic<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    let name = name.into();
    let loop_name = name.clone();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(delay) => {
                    delay = match tick().await {
                        Ok(true) => Duration::ZERO,
                        Ok(false) => interval,
                        Err(err) if err.is_fatal() => {
                            event!(
                                Level::ERROR,
                                worker = %loop_name,
                                error_kind = err.kind(),
                                error = %err,
                                "worker halted"
                            );
                            break;
                        }
                        Err(err) => {
                            event!(
                                Level::WARN,
                                worker = %loop_name,
                                error_kind = err.kind(),
                                error = %err,
                                "worker iteration failed; retrying next interval"
                            );
                            interval
                        }
                    };
                }
            }
        }
        event!(Level::DEBUG, worker = %loop_name, "worker stopped");
    });

    WorkerHandle {
        name,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

/// Running pipeline: one reader per volume, the resolution worker, the
/// transition engine and the TTL sweep.
pub struct PipelineHandle {
    pipeline: Arc<Pipeline>,
    workers: Vec<WorkerHandle>,
}

impl PipelineHandle {
    pub(super) fn new(pipeline: Arc<Pipeline>, workers: Vec<WorkerHandle>) -> Self {
        Self { pipeline, workers }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(WorkerHandle::name).collect()
    }

    /// Names of loops that exited on their own, which only a fatal error does.
    pub fn halted(&self) -> Vec<&str> {
        self.workers
            .iter()
            .filter(|worker| worker.is_finished())
            .map(WorkerHandle::name)
            .collect()
    }

    /// Stop every loop after its current tick, then checkpoint the store.
    pub async fn shutdown(self) -> Result<()> {
        let Self { pipeline, workers } = self;
        for worker in workers {
            worker.stop().await?;
        }
        pipeline.checkpoint().await?;
        event!(Level::INFO, "pipeline stopped");
        Ok(())
    }
}
