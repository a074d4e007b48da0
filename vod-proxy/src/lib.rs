//! Transparent failover proxy for video-on-demand urls.
//!
//! ```no_run
//! # async fn example() -> vod_proxy::errors::Result<()> {
//! let proxy = vod_proxy::Proxy::new(Some(3000))?;
//! proxy.set_strategy("https://example-qcdn.com", "https://example-cdn.com", None)?;
//!
//! // http://127.0.0.1:<port>/https,example-qcdn.com/video.mp4
//! let url = proxy.make_vod_url("https://example-qcdn.com/video.mp4", 0).await;
//! # Ok(())
//! # }
//! ```
//!
//! Requests to the returned url are sent to the origin; when it fails or
//! answers with a 5xx status the backup origin serves the same path instead.
//! Observed redirects and failovers are remembered per resource.

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod errors;
pub mod keys;
pub mod path_codec;
pub mod redirect_cache;
pub mod strategy;
pub mod upstream;

#[cfg(test)]
mod testutils;

use crate::config::{Config, Listener};
use crate::dispatcher::{FailoverDispatcher, ProxyService};
use crate::endpoint::LocalEndpoint;
use crate::errors::{ProxyError, Result};
use crate::keys::{OriginKey, ResourceKey};
use crate::redirect_cache::RedirectCache;
use crate::strategy::{Strategy, StrategyTable};
use crate::upstream::{ReqwestUpstream, Upstream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;
use url::Url;

pub struct Proxy {
    listener: Listener,
    strategies: Arc<StrategyTable>,
    redirects: Arc<RedirectCache>,
    dispatcher: Arc<FailoverDispatcher>,
    endpoint: OnceCell<LocalEndpoint>,
    closed: AtomicBool,
}

impl Proxy {
    /// Creates a proxy whose upstream attempts time out after `timeout_ms`.
    pub fn new(timeout_ms: Option<u64>) -> Result<Self> {
        Self::from_config(&Config {
            timeout_ms,
            ..Config::default()
        })
    }

    /// Creates a proxy and applies every configured strategy.
    pub fn from_config(config: &Config) -> Result<Self> {
        let upstream = Arc::new(ReqwestUpstream::new(config.timeout())?);
        let proxy = Self::with_upstream(config.listener.clone(), upstream);

        for strategy in &config.strategies {
            let (origin, strategy) = strategy.parse()?;
            proxy.strategies.set(origin, strategy);
        }

        Ok(proxy)
    }

    pub fn with_upstream(listener: Listener, upstream: Arc<dyn Upstream>) -> Self {
        let strategies = Arc::new(StrategyTable::new());
        let redirects = Arc::new(RedirectCache::new());
        let dispatcher = Arc::new(FailoverDispatcher::new(
            strategies.clone(),
            redirects.clone(),
            upstream,
        ));

        Proxy {
            listener,
            strategies,
            redirects,
            dispatcher,
            endpoint: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Puts `origin` under the proxy's control, failing over to `backup`.
    ///
    /// All three urls must be bare origins (scheme and host only). A url with a
    /// path is a configuration mistake and is rejected with
    /// `ProxyError::InvalidStrategyConfiguration`.
    pub fn set_strategy(&self, origin: &str, backup: &str, boot: Option<&str>) -> Result<()> {
        let origin = OriginKey::parse(origin)?;
        let strategy = Strategy::parse(backup, boot)?;
        self.strategies.set(origin, strategy);
        Ok(())
    }

    /// Rewrites `destination` to go through the local endpoint.
    ///
    /// Urls that do not parse, or whose origin has no strategy, are returned
    /// unchanged. `boot_len` is accepted for the boot origin but not acted on.
    pub async fn make_vod_url(&self, destination: &str, boot_len: u64) -> String {
        let Ok(url) = Url::parse(destination) else {
            return destination.to_string();
        };
        let Ok(resource) = ResourceKey::from_url(&url) else {
            return destination.to_string();
        };
        if !self.strategies.contains(resource.origin()) {
            return destination.to_string();
        }
        if boot_len > 0 {
            tracing::debug!(boot_len, "Boot optimization is not applied");
        }

        let addr = match self.local_addr().await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "Local endpoint unavailable, using original url");
                return destination.to_string();
            }
        };

        // query and fragment carry over unchanged
        let mut proxied = url;
        proxied.set_path(&path_codec::encode(&resource));
        let rewritten = proxied.set_scheme("http").is_ok()
            && proxied.set_ip_host(addr.ip()).is_ok()
            && proxied.set_port(Some(addr.port())).is_ok();
        if !rewritten {
            tracing::debug!(url = destination, "Url cannot be rewritten to the local endpoint");
            return destination.to_string();
        }
        proxied.into()
    }

    /// Url the proxy currently serves `destination` from, when a redirect or a
    /// failover to the backup has been observed for it.
    pub fn resolved_url(&self, destination: &str) -> Option<String> {
        let url = Url::parse(destination).ok()?;
        let resource = ResourceKey::from_url(&url).ok()?;
        self.redirects
            .get(&resource)
            .map(|resolved| resolved.to_string())
    }

    /// Address of the local endpoint, starting it on first use.
    pub async fn local_addr(&self) -> Result<SocketAddr> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::Closed);
        }

        let endpoint = self
            .endpoint
            .get_or_try_init(|| {
                LocalEndpoint::start(&self.listener, ProxyService::new(self.dispatcher.clone()))
            })
            .await?;

        // close() may have raced with the first start
        if self.closed.load(Ordering::Acquire) {
            endpoint.close();
            return Err(ProxyError::Closed);
        }
        Ok(endpoint.addr())
    }

    /// Stops the local endpoint. Safe to call repeatedly or before any use.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(endpoint) = self.endpoint.get()
            && endpoint.close()
        {
            tracing::info!(addr = %endpoint.addr(), "Local endpoint closed");
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.close();
    }
}
