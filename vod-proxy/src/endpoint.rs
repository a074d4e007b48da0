use crate::config::Listener;
use crate::dispatcher::ProxyService;
use crate::errors::Result;
use parking_lot::Mutex;
use shared::http::run_http_service;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// The proxy's local listening endpoint.
///
/// Serving stops when `close` is called or when the endpoint is dropped.
pub struct LocalEndpoint {
    addr: SocketAddr,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl LocalEndpoint {
    pub async fn start(listener: &Listener, service: ProxyService) -> Result<Self> {
        let tcp_listener = TcpListener::bind((listener.host.as_str(), listener.port)).await?;
        let addr = tcp_listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let shutdown = async {
                // A dropped sender also means shutdown.
                let _ = rx.await;
            };
            run_http_service(tcp_listener, service, shutdown).await;
            tracing::debug!(addr = %addr, "Local endpoint stopped");
        });

        tracing::debug!(addr = %addr, "Local endpoint started");
        Ok(LocalEndpoint {
            addr,
            shutdown: Mutex::new(Some(tx)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops serving. Returns false when the endpoint was already closed.
    pub fn close(&self) -> bool {
        match self.shutdown.lock().take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}
