//! Background task handle with graceful shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{BrokerError, Result};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A spawned loop that stops when its shutdown channel fires.
pub(crate) struct BackgroundTask {
    name: &'static str,
    background_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl BackgroundTask {
    /// Spawn `body`, handing it the receiving end of the shutdown channel.
    pub(crate) fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(mpsc::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let background_task = tokio::spawn(body(shutdown_rx));
        tracing::debug!("Started {} task", name);

        Self {
            name,
            background_task: Some(background_task),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Signal the task and wait up to 5 seconds for it to finish.
    pub(crate) async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }

        let Some(task) = self.background_task.take() else {
            return Ok(());
        };

        match timeout(SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => {
                tracing::debug!("Stopped {} task", self.name);
                Ok(())
            }
            Ok(Err(e)) => Err(BrokerError::ShutdownError(format!(
                "{} task panicked: {e}",
                self.name
            ))),
            Err(_) => Err(BrokerError::ShutdownError(format!(
                "{} task shutdown timed out after 5 seconds",
                self.name
            ))),
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(task) = self.background_task.take() {
            task.abort();
        }
    }
}
