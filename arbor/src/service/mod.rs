//! The hyper transport adapter.
//!
//! Wraps a booted application core as a hyper `Service` and drives accepted connections
//! until shutdown. The core is transport-agnostic; anything able to produce a
//! `Request<Body>` can call [`App::handle`](crate::app::App::handle) directly instead.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_util::FutureExt;
use hyper::server::conn::Http;
use hyper::service::Service;
use hyper::{Body, Request, Response};
use log::{debug, error};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::app::Core;
use crate::pipeline;

/// A connected service: one per accepted connection, carrying the peer address hyper
/// does not otherwise expose to request handling.
pub(crate) struct ArborService {
    core: Arc<Core>,
    remote: SocketAddr,
    connection: CancellationToken,
}

impl Service<Request<Body>> for ArborService {
    type Response = Response<Body>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let core = self.core.clone();
        let remote = self.remote;
        let cancel = self.connection.child_token();
        async move { Ok(pipeline::dispatch(core, req, Some(remote), cancel).await) }.boxed()
    }
}

/// Accepts connections until the shutdown signal flips.
pub(crate) async fn serve(
    listener: TcpListener,
    core: Arc<Core>,
    mut shutdown: watch::Receiver<bool>,
) {
    let protocol = Arc::new(Http::new());

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("transport shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (socket, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("accept failed: {}", e);
                        continue;
                    }
                };

                let protocol = protocol.clone();
                let core = core.clone();
                tokio::spawn(async move {
                    let connection = CancellationToken::new();
                    // Trips request cancellation tokens when the connection goes away.
                    let _guard = connection.clone().drop_guard();
                    let service = ArborService {
                        core,
                        remote,
                        connection,
                    };
                    if let Err(e) = protocol.serve_connection(socket, service).await {
                        debug!("connection error: {}", e);
                    }
                });
            }
        }
    }
}
