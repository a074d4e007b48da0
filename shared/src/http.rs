use http::Version;
use http::header::{
    CONNECTION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, X_CONTENT_TYPE_OPTIONS,
};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

/// Connection-scoped headers that never travel past the proxy.
const HOP_BY_HOP: [HeaderName; 7] = [
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

/// Strips connection-scoped headers from a message crossing the proxy, in
/// either direction. Only HTTP/1.x carries them; other versions pass through.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) {
    if version > Version::HTTP_11 {
        return;
    }

    // names the sender declared connection-scoped
    let declared: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP.iter().chain(&declared) {
        headers.remove(name);
    }

    // implicit from 1.1 on
    if version < Version::HTTP_11 {
        headers.remove(HeaderName::from_static("keep-alive"));
    }
}

/// Builds a plain-text response carrying `message`, for errors produced by
/// the service itself rather than relayed from an upstream.
pub fn make_error_response<E>(
    status_code: StatusCode,
    message: &str,
) -> Response<UnsyncBoxBody<Bytes, E>> {
    let body = Full::new(Bytes::from(format!("{message}\n")))
        .map_err(|e| match e {})
        .boxed_unsync();

    let mut response = Response::new(body);
    *response.status_mut() = status_code;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

/// Pause after a failed accept before polling the listener again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Source of connections for `run_http_service`.
pub trait Accept {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Serves `service` on an already bound listener until `shutdown` resolves.
///
/// Every accepted connection runs on its own task. A failed accept (file
/// descriptor exhaustion, a connection reset before it was accepted) is
/// logged and retried after `ACCEPT_ERROR_BACKOFF`; only `shutdown` ends the
/// loop. Connections still open when shutdown fires are aborted, which drops
/// any in-flight request future.
pub async fn run_http_service<L, S, B, F>(listener: L, service: S, shutdown: F)
where
    S: Service<Request<Incoming>, Response = Response<B>> + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
    L: Accept,
    F: Future<Output = ()>,
{
    let service_arc = Arc::new(service);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _peer_addr)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let io = TokioIo::new(stream);
                let svc = service_arc.clone();

                // Hand the connection to hyper; auto-detect h1/h2 on this socket
                connections.spawn(async move {
                    if let Err(e) = Builder::new(TokioExecutor::new())
                        .serve_connection(io, svc)
                        .await
                    {
                        tracing::debug!(error = %e, "Connection closed with error");
                    }
                });
            }
        }

        while connections.try_join_next().is_some() {}
    }

    connections.shutdown().await;
}
