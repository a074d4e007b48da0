use crate::errors::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use reqwest::redirect::Policy;
use std::time::Duration;
use url::Url;

/// Maximum number of redirect hops followed in a single attempt.
pub const MAX_REDIRECTS: usize = 10;

pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedirectMode {
    /// Follow up to `MAX_REDIRECTS` hops; exceeding the bound fails the attempt.
    Follow,
    /// Return 3xx responses as they are.
    Manual,
}

#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Last url actually fetched, after any redirects.
    pub url: Url,
    pub body: ProxyBody,
}

/// Performs one upstream HTTP exchange.
///
/// Implementations report transport problems (connect errors, timeouts, too
/// many redirects) as `ProxyError::UpstreamAttemptFailed`. Any received
/// response is returned as-is, whatever its status.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(
        &self,
        request: UpstreamRequest,
        mode: RedirectMode,
    ) -> Result<UpstreamResponse>;
}

/// `Upstream` backed by reqwest, with one client per redirect mode.
pub struct ReqwestUpstream {
    follow: reqwest::Client,
    manual: reqwest::Client,
}

impl ReqwestUpstream {
    /// `timeout` bounds each attempt, including reading the response body.
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        Ok(Self {
            follow: build_client(Policy::limited(MAX_REDIRECTS), timeout)?,
            manual: build_client(Policy::none(), timeout)?,
        })
    }
}

fn build_client(policy: Policy, timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().redirect(policy);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| ProxyError::Client(e.to_string()))
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn send(
        &self,
        request: UpstreamRequest,
        mode: RedirectMode,
    ) -> Result<UpstreamResponse> {
        let client = match mode {
            RedirectMode::Follow => &self.follow,
            RedirectMode::Manual => &self.manual,
        };
        let target = request.url.to_string();

        let mut builder = client
            .request(request.method, request.url)
            .headers(request.headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    "timed out".to_string()
                } else if e.is_redirect() {
                    format!("more than {MAX_REDIRECTS} redirects")
                } else {
                    e.to_string()
                };
                ProxyError::UpstreamAttemptFailed { target, reason }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = StreamBody::new(
            response
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(ProxyError::from),
        )
        .boxed_unsync();

        Ok(UpstreamResponse {
            status,
            headers,
            url,
            body,
        })
    }
}
