use actix_web::dev::ServerHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Coordinates a clean stop of the HTTP surface and the pipeline workers.
///
/// Order matters: the server stops accepting submissions first, then the
/// workers are told to stop pulling from the queue. A pipeline that is
/// already driving an external tool runs to completion so its status record
/// and archive land on disk; jobs still queued never start and surface as
/// Unknown after a restart.
pub struct ShutdownCoordinator {
    server_handle: ServerHandle,
    server_task: JoinHandle<Result<(), std::io::Error>>,
    worker_handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new(
        server_handle: ServerHandle,
        server_task: JoinHandle<Result<(), std::io::Error>>,
        worker_handles: Vec<JoinHandle<()>>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            server_handle,
            server_task,
            worker_handles,
            shutdown_tx,
        }
    }

    /// Park until SIGTERM or CTRL+C arrives, then drain and stop.
    pub async fn wait_for_shutdown(self) -> Result<(), std::io::Error> {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("CTRL+C handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("SIGTERM handler unavailable: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("CTRL+C received, shutting down"),
            _ = terminate => info!("SIGTERM received, shutting down"),
        }

        self.drain().await
    }

    async fn drain(self) -> Result<(), std::io::Error> {
        info!("Closing HTTP listener, no new submissions accepted");
        self.server_handle.stop(true).await;

        // Flip the watch value so every worker sees it on its next poll of
        // the queue. Running pipelines are not interrupted.
        if self.shutdown_tx.send(true).is_err() {
            warn!("All workers already gone before shutdown signal");
        }

        info!(
            "Draining {} workers, in-flight pipelines run to completion",
            self.worker_handles.len()
        );
        for (i, handle) in self.worker_handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!("Worker {} terminated abnormally: {e:?}", i + 1);
            }
        }

        match self.server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("HTTP server error during shutdown: {e:?}"),
            Err(e) => error!("HTTP server task panicked: {e:?}"),
        }

        info!("Shutdown complete");
        Ok(())
    }
}
