//! HTTP server and graceful shutdown.
//!
//! Every accepted request passes through the [`Observer`] first (correlation
//! id, response recording, panic recovery, access log) and then through the
//! router's [`Chain`].
//!
//! # Graceful shutdown
//!
//! On SIGTERM or Ctrl-C the server:
//! 1. Stops `listener.accept()` at once, so no new connections are made.
//! 2. Lets every in-flight connection task run to completion.
//! 3. Returns from [`Server::serve`], which lets `main` exit cleanly.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::LogConfig;
use crate::error::Error;
use crate::middleware::Observer;
use crate::request::Request;
use crate::response::{BufferedWriter, Response};
use crate::router::{Chain, Router};

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
    listener: Option<TcpListener>,
    observer: Observer,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// ```rust,no_run
    /// use liner::Server;
    /// let server = Server::bind(([0, 0, 0, 0], 8080));
    /// ```
    pub fn bind(addr: impl Into<SocketAddr>) -> Self {
        Self { addr: addr.into(), listener: None, observer: Observer::new(LogConfig::default()) }
    }

    /// Serves on an already-bound listener.
    pub fn from_listener(listener: TcpListener) -> Result<Self, Error> {
        let addr = listener.local_addr()?;
        Ok(Self { addr, listener: Some(listener), observer: Observer::new(LogConfig::default()) })
    }

    /// Replaces the default edge observer (default access-log policy).
    pub fn observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Starts accepting connections and dispatching them through `router`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing).
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        self.serve_with_shutdown(router, shutdown_signal()).await
    }

    /// Like [`serve`](Server::serve), but stops accepting when `signal` resolves.
    pub async fn serve_with_shutdown(
        self,
        router: Router,
        signal: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let listener = match self.listener {
            Some(l) => l,
            None => TcpListener::bind(self.addr).await?,
        };
        let addr = listener.local_addr()?;

        let chain = router.into_chain();
        let observer = Arc::new(self.observer);

        info!(addr = %addr, "liner listening");

        let mut tasks = tokio::task::JoinSet::new();

        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Shutdown is checked first so a signal stops accepting at once.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let chain = chain.clone();
                    let observer = Arc::clone(&observer);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let chain = chain.clone();
                            let observer = Arc::clone(&observer);
                            async move { dispatch(&observer, &chain, req, remote_addr).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            warn!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet stays bounded.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("liner stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Produces exactly one response per request; hyper never sees an error.
async fn dispatch(
    observer: &Observer,
    chain: &Chain,
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(peer = %remote_addr, "failed to read request body: {e}");
            let mut writer = BufferedWriter::new();
            let _ = Response::status(StatusCode::BAD_REQUEST).write_to(&mut writer);
            return Ok(writer.into_http());
        }
    };

    let mut writer = BufferedWriter::new();
    observer
        .run(Request::new(parts, body, Some(remote_addr)), &mut writer, |req| chain.call(req))
        .await;

    Ok(writer.into_http())
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or SIGINT (Ctrl-C on Windows).
///
/// If a handler cannot be installed, that arm never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
