// Daemon: serves the search engine over a Unix socket

mod admin;
mod ipc;
mod signals;

pub use admin::{AdminRequest, AdminResponse, AdminRouter};
pub use ipc::{read_frame, write_frame, IpcClient, IpcMessage, IpcResponse, IpcServer};
pub use signals::{DaemonSignal, SignalHandler};

use crate::engine::SearchEngine;
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task;
use tokio_util::sync::CancellationToken;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Daemon {
    engine: Arc<SearchEngine>,
    admin: AdminRouter,
    socket_path: PathBuf,
    connections: Arc<Semaphore>,
    max_connections: usize,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(engine: Arc<SearchEngine>) -> Self {
        let config = engine.config();
        let admin = AdminRouter::new(engine.manager().clone(), config.search.benchmark_iterations);
        let socket_path = config.socket_path();
        let max_connections = config.daemon.max_connections;
        Self {
            engine,
            admin,
            socket_path,
            connections: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled when the daemon begins shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until a shutdown signal or a `Stop` message arrives
    pub async fn run_foreground(self: Arc<Self>) -> Result<()> {
        let mut signal_handler = SignalHandler::new()?;
        let mut server = IpcServer::new(self.socket_path.clone());
        server.bind().await?;

        tracing::info!("Daemon started on {:?}", server.socket_path());

        loop {
            tokio::select! {
                accepted = server.accept() => {
                    let stream = match accepted {
                        Ok(stream) => stream,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    // Never wait for a permit here, or signals and Stop go unserved
                    let daemon = self.clone();
                    match self.connections.clone().try_acquire_owned() {
                        Ok(permit) => {
                            task::spawn(async move {
                                if let Err(e) = daemon.handle_client(stream).await {
                                    tracing::error!("Client handler error: {}", e);
                                }
                                drop(permit);
                            });
                        }
                        Err(TryAcquireError::NoPermits) => {
                            tracing::warn!(
                                "Connection limit of {} reached, rejecting client",
                                self.max_connections
                            );
                            task::spawn(async move {
                                if let Err(e) = daemon.reject_client(stream).await {
                                    tracing::debug!("Rejected client error: {}", e);
                                }
                            });
                        }
                        Err(TryAcquireError::Closed) => break,
                    }
                }

                sig = signal_handler.wait() => {
                    if sig.should_shutdown() {
                        tracing::info!("Shutdown signal received");
                        break;
                    } else if sig.should_reselect() {
                        let selection = self.engine.manager().auto_select_best_strategy();
                        tracing::info!(
                            "Re-selected strategy {}: {}",
                            selection.strategy.name,
                            selection.reason
                        );
                    }
                }

                _ = self.shutdown.cancelled() => {
                    tracing::info!("Stop requested");
                    break;
                }
            }
        }

        self.shutdown.cancel();
        server.shutdown()?;

        // In-flight handlers hold a permit until their response is written
        let drained = tokio::time::timeout(
            DRAIN_TIMEOUT,
            self.connections.acquire_many(self.max_connections as u32),
        )
        .await;
        if drained.is_err() {
            tracing::warn!("Timed out waiting for in-flight requests");
        }
        tracing::info!("Daemon shutdown complete");
        Ok(())
    }

    async fn handle_client(&self, mut stream: UnixStream) -> Result<()> {
        let Some(message) = self.read_request(&mut stream).await? else {
            return Ok(());
        };
        tracing::debug!("Received {:?}", message);

        let cancel = self.shutdown.child_token();
        let response = self.handle_message(message, &cancel).await;
        write_frame(&mut stream, &response).await
    }

    /// Answer a client over the connection limit without touching the engine
    async fn reject_client(&self, mut stream: UnixStream) -> Result<()> {
        if self.read_request(&mut stream).await?.is_none() {
            return Ok(());
        }
        let response = IpcResponse::error(format!(
            "Too many connections (limit {}), retry later",
            self.max_connections
        ));
        write_frame(&mut stream, &response).await
    }

    /// Next request frame, or `None` once shutdown begins
    async fn read_request(&self, stream: &mut UnixStream) -> Result<Option<IpcMessage>> {
        tokio::select! {
            frame = read_frame(stream) => frame.map(Some),
            _ = self.shutdown.cancelled() => Ok(None),
        }
    }

    /// Execute one request against the engine
    pub async fn handle_message(
        &self,
        message: IpcMessage,
        cancel: &CancellationToken,
    ) -> IpcResponse {
        let default_top_k = self.engine.config().search.default_top_k;

        match message {
            IpcMessage::Admin { method, path } => {
                let response = self.admin.dispatch(&method, &path, cancel).await;
                IpcResponse {
                    success: response.is_success(),
                    message: None,
                    data: serde_json::to_value(&response).ok(),
                }
            }
            IpcMessage::Search { vector, top_k } => {
                let top_k = top_k.unwrap_or(default_top_k);
                match self.engine.search().search(&vector, top_k, cancel).await {
                    Ok(results) => IpcResponse::from_serializable(&results),
                    Err(e) => IpcResponse::error(e.to_string()),
                }
            }
            IpcMessage::WeightedSearch {
                vector,
                preset,
                top_k,
            } => {
                let top_k = top_k.unwrap_or(default_top_k);
                match self
                    .engine
                    .weighted()
                    .search(&vector, &preset, top_k, cancel)
                    .await
                {
                    Ok(results) => IpcResponse::from_serializable(&results),
                    Err(e) => IpcResponse::error(e.to_string()),
                }
            }
            IpcMessage::Lookup { text, preset, top_k } => {
                let top_k = top_k.unwrap_or(default_top_k);
                match self
                    .engine
                    .retrieve_context(&text, preset.as_deref(), top_k, cancel)
                    .await
                {
                    Ok(matched) => IpcResponse::from_serializable(&matched),
                    Err(e) => IpcResponse::error(e.to_string()),
                }
            }
            IpcMessage::Ingest { path } => match self.engine.ingest_file(&path).await {
                Ok(report) => IpcResponse::from_serializable(&report),
                Err(e) => IpcResponse::error(e.to_string()),
            },
            IpcMessage::Purge { id } => match self.engine.purge(&id) {
                Ok(true) => IpcResponse::success(format!("Removed {}", id)),
                Ok(false) => IpcResponse::error(format!("No document with id {}", id)),
                Err(e) => IpcResponse::error(e.to_string()),
            },
            IpcMessage::Status => IpcResponse::from_serializable(&self.engine.status()),
            IpcMessage::Stop => {
                self.shutdown.cancel();
                IpcResponse::success("Shutdown initiated")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn daemon_in(dir: &std::path::Path) -> Daemon {
        daemon_with(dir, |_| {}).await
    }

    async fn daemon_with(dir: &std::path::Path, adjust: impl FnOnce(&mut Config)) -> Daemon {
        let mut config = Config::default();
        config.storage.data_dir = dir.to_path_buf();
        config.daemon.socket_path = dir.join("daemon.sock");
        config.search.enable_gpu = false;
        config.search.enable_persistent_store = false;
        config.search.benchmark_iterations = 2;
        adjust(&mut config);
        let engine = SearchEngine::bootstrap(config).await.unwrap();
        Daemon::new(Arc::new(engine))
    }

    #[tokio::test]
    async fn test_admin_over_messages() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;
        let cancel = CancellationToken::new();

        let response = daemon
            .handle_message(
                IpcMessage::Admin {
                    method: "GET".to_string(),
                    path: "/strategy/current".to_string(),
                },
                &cancel,
            )
            .await;
        assert!(response.success);
        let data = response.data.unwrap();
        assert_eq!(data["status"], 200);
        assert_eq!(data["body"]["name"], "InMemory");

        let response = daemon
            .handle_message(
                IpcMessage::Admin {
                    method: "POST".to_string(),
                    path: "/strategy/switch/Quantum".to_string(),
                },
                &cancel,
            )
            .await;
        assert!(!response.success);
        assert_eq!(response.data.unwrap()["status"], 400);
    }

    #[tokio::test]
    async fn test_stop_cancels_shutdown_token() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;
        let token = daemon.shutdown_token();

        let response = daemon
            .handle_message(IpcMessage::Stop, &CancellationToken::new())
            .await;
        assert!(response.success);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_wrong_length_query_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_in(dir.path()).await;

        let response = daemon
            .handle_message(
                IpcMessage::Search {
                    vector: vec![1.0; 3],
                    top_k: None,
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(!response.success);
        assert!(response.message.unwrap().contains("expected 384"));
    }

    #[tokio::test]
    async fn test_saturated_daemon_still_stops() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(daemon_with(dir.path(), |c| c.daemon.max_connections = 1).await);
        let socket = dir.path().join("daemon.sock");
        let token = daemon.shutdown_token();
        let server = tokio::spawn(daemon.clone().run_foreground());

        let client = IpcClient::new(socket.clone());
        let mut ready = false;
        for _ in 0..50 {
            if client.send(&IpcMessage::Status).await.is_ok() {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(ready);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Connected but silent: holds the only permit
        let _held = UnixStream::connect(&socket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let rejected = client.send(&IpcMessage::Status).await.unwrap();
        assert!(!rejected.success);
        assert!(rejected.message.unwrap().contains("Too many connections"));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("daemon did not stop while saturated")
            .unwrap()
            .unwrap();
    }
}
