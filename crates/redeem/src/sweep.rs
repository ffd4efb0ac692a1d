use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Owns a running periodic housekeeping task. Stop it on shutdown.
#[derive(Debug)]
pub struct SweepHandle {
    name: &'static str,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cancel the task and wait for it to finish its current pass.
    pub async fn stop(self) {
        self.cancel.cancel();
        _ = self.task.await;
        debug!(name = self.name, "Sweep stopped");
    }
}

/// Run `pass` every `period`, first pass immediately.
/// This must be called from within a tokio runtime.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut pass: F) -> SweepHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let stopped = cancel.clone();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = stopped.cancelled() => break,
                _ = interval.tick() => pass().await,
            }
        }
    });

    info!(name, ?period, "Sweep started");
    SweepHandle { name, cancel, task }
}
