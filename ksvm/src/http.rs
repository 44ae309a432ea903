use anyhow::{Context, Result};
use axum::{Router, http::Request};
use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    thread::JoinHandle,
};
use tokio::{runtime::Runtime, sync::oneshot};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, debug_span, error, info};

/// Static HTTP server the installer fetches its kickstart file from.
///
/// The server runs on its own thread and stops when this handle is dropped.
pub struct KickstartServer {
    pub address: SocketAddr,
    pub directory: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl KickstartServer {
    /// Serve everything under `directory` on the given address.
    pub fn serve(directory: &Path, bind: IpAddr, port: u16) -> Result<Self> {
        if !directory.is_dir() {
            anyhow::bail!("Kickstart directory not found: {}", directory.display());
        }

        // Bind before spawning so the caller sees address conflicts
        let listener = std::net::TcpListener::bind((bind, port))
            .with_context(|| format!("failed to bind HTTP server to {bind}:{port}"))?;
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;

        let router = Router::new()
            .fallback_service(ServeDir::new(directory))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                    debug_span!(
                        "http_request",
                        method = ?request.method(),
                        path = %request.uri().path(),
                    )
                }),
            );

        let runtime = Runtime::new()?;
        let (shutdown, signal) = oneshot::channel::<()>();
        let thread = std::thread::spawn(move || {
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(error) => {
                        error!(error = ?error, "Failed to register HTTP listener");
                        return;
                    }
                };
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(async {
                        signal.await.ok();
                    })
                    .await;
                if let Err(error) = result {
                    error!(error = ?error, "HTTP server failed");
                }
            });
        });

        info!(address = %address, directory = ?directory, "Serving kickstart files");
        Ok(Self {
            address,
            directory: directory.to_path_buf(),
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl Drop for KickstartServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
        debug!(address = %self.address, "Stopped HTTP server");
    }
}
