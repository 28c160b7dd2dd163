//! HTTP/1.1 and HTTP/2 server

use bucketdeck_core::*;
use bucketdeck_engine::{Engine, SessionManager};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{BodyLimits, ReaperConfig, ServerConfig};
use crate::handlers::handle_request;

/// Everything a request handler needs
#[derive(Debug)]
pub struct AppState {
    pub manager: SessionManager,
    pub verifier: SessionVerifier,
    pub limits: BodyLimits,
    pub proxy_permits: Semaphore,
}

impl AppState {
    pub fn new(engine: Engine, verifier: SessionVerifier, upload: UploadConfig, limits: BodyLimits) -> Self {
        AppState {
            manager: SessionManager::new(engine, upload),
            verifier,
            proxy_permits: Semaphore::new(limits.proxy_concurrency),
            limits,
        }
    }

    pub fn engine(&self) -> &Engine {
        self.manager.engine()
    }
}

pub struct DeckServer {
    state: Arc<AppState>,
    reaper: ReaperConfig,
}

impl DeckServer {
    /// Connect every configured bucket and build the shared state
    pub fn new(config: ServerConfig) -> Self {
        let engine = Engine::connect(config.registry);
        Self::with_engine(engine, config.verifier, config.upload, config.limits, config.reaper)
    }

    pub fn with_engine(
        engine: Engine,
        verifier: SessionVerifier,
        upload: UploadConfig,
        limits: BodyLimits,
        reaper: ReaperConfig,
    ) -> Self {
        DeckServer {
            state: Arc::new(AppState::new(engine, verifier, upload, limits)),
            reaper,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, buckets = self.state.engine().registry().len(), "bucketdeck server listening");

        let reaper = spawn_reaper(self.state.clone(), self.reaper);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(connection) => connection,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%remote_addr, "new connection");

                    let state = self.state.clone();
                    let stop_rx = stop_rx.clone();
                    tokio::spawn(async move {
                        Self::handle_connection(stream, remote_addr, state, stop_rx).await;
                    });
                }
                _ = &mut shutdown => {
                    info!("shutting down, draining connections");
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        drop(stop_rx);
        stop_tx.closed().await;
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        info!("server shutdown complete");
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        state: Arc<AppState>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let state = state.clone();
            async move { Ok::<_, std::convert::Infallible>(handle_request(req, state).await) }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        let connection = builder.serve_connection(io, service);
        tokio::pin!(connection);
        let mut draining = false;

        loop {
            tokio::select! {
                result = connection.as_mut() => {
                    if let Err(e) = result {
                        debug!(%remote_addr, error = %e, "connection closed with error");
                    }
                    break;
                }
                changed = stop_rx.changed(), if !draining => {
                    if changed.is_err() || *stop_rx.borrow() {
                        connection.as_mut().graceful_shutdown();
                        draining = true;
                    }
                }
            }
        }
    }
}

/// Periodically abort upload sessions abandoned by their callers
fn spawn_reaper(state: Arc<AppState>, config: ReaperConfig) -> Option<JoinHandle<()>> {
    let period = config.interval?;
    info!(interval_secs = period.as_secs(), max_age_secs = config.max_age.as_secs(), "stale session reaper started");

    Some(tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        // First tick fires immediately
        timer.tick().await;
        loop {
            timer.tick().await;
            let reaped = state.manager.reap_stale(config.max_age).await;
            debug!(reaped, "stale session sweep done");
        }
    }))
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
