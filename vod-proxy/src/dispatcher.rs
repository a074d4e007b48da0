use crate::errors::{ProxyError, Result};
use crate::keys::{OriginKey, ResourceKey};
use crate::path_codec;
use crate::redirect_cache::RedirectCache;
use crate::strategy::StrategyTable;
use crate::upstream::{ProxyBody, RedirectMode, Upstream, UpstreamRequest, UpstreamResponse};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, Method, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response};
use shared::http::{filter_hop_by_hop, make_error_response};
use std::pin::Pin;
use std::sync::Arc;

/// Routes one proxy request to the primary origin, a cached resolution of it,
/// or the backup origin, and keeps the redirect cache up to date.
pub struct FailoverDispatcher {
    strategies: Arc<StrategyTable>,
    redirects: Arc<RedirectCache>,
    upstream: Arc<dyn Upstream>,
}

// Everything of the incoming request that is replayed on each attempt.
struct Forward {
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    query: Option<String>,
}

struct Attempt {
    response: UpstreamResponse,
    redirected: bool,
}

impl FailoverDispatcher {
    pub fn new(
        strategies: Arc<StrategyTable>,
        redirects: Arc<RedirectCache>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            strategies,
            redirects,
            upstream,
        }
    }

    /// Resolves a request addressed to a proxy path.
    ///
    /// Only terminal outcomes are returned as errors: a path that does not
    /// decode, an origin without strategy, or both origins failing. A response
    /// is only returned once an attempt produced a non-5xx status, so a failed
    /// primary never leaks into what the client receives.
    pub async fn dispatch(&self, request: Request<Bytes>) -> Result<Response<ProxyBody>> {
        let (mut parts, body) = request.into_parts();
        let resource = path_codec::decode(parts.uri.path())?;

        // Host and length are derived again for each upstream target.
        filter_hop_by_hop(&mut parts.headers, parts.version);
        parts.headers.remove(HOST);
        parts.headers.remove(CONTENT_LENGTH);
        let forward = Forward {
            method: parts.method,
            headers: parts.headers,
            body,
            query: parts.uri.query().map(str::to_string),
        };

        let attempted = match self.redirects.get(&resource) {
            Some(resolved) => {
                tracing::debug!(resource = %resource, resolved = %resolved, "Redirect cache hit");
                match self.attempt(&forward, &resolved, RedirectMode::Manual).await {
                    Ok(attempt) => return Ok(into_client_response(attempt.response)),
                    Err(e) => tracing::warn!(error = %e, "Cached target failed"),
                }
                resolved.origin().clone()
            }
            None => {
                match self.attempt(&forward, &resource, RedirectMode::Follow).await {
                    Ok(attempt) => {
                        if attempt.redirected {
                            self.remember_redirect(&resource, &attempt.response);
                        }
                        return Ok(into_client_response(attempt.response));
                    }
                    Err(e) => tracing::warn!(error = %e, "Primary origin failed"),
                }
                resource.origin().clone()
            }
        };

        let strategy = self
            .strategies
            .get(resource.origin())
            .ok_or_else(|| ProxyError::UnknownOrigin(resource.origin().clone()))?;

        if !same_host(&strategy.backup, &attempted) {
            let backup = resource.with_origin(&strategy.backup);
            match self.attempt(&forward, &backup, RedirectMode::Follow).await {
                Ok(attempt) => {
                    self.redirects.insert(resource, backup);
                    return Ok(into_client_response(attempt.response));
                }
                Err(e) => tracing::warn!(error = %e, "Backup origin failed"),
            }
        }

        Err(ProxyError::BothOriginsFailed)
    }

    // One upstream exchange. A 5xx response counts as a failed attempt.
    async fn attempt(
        &self,
        forward: &Forward,
        target: &ResourceKey,
        mode: RedirectMode,
    ) -> Result<Attempt> {
        let url = target.to_url(forward.query.as_deref()).map_err(|e| {
            ProxyError::UpstreamAttemptFailed {
                target: target.to_string(),
                reason: e.to_string(),
            }
        })?;

        let request = UpstreamRequest {
            method: forward.method.clone(),
            url: url.clone(),
            headers: forward.headers.clone(),
            body: forward.body.clone(),
        };
        let response = self.upstream.send(request, mode).await?;

        if response.status.is_server_error() {
            return Err(ProxyError::UpstreamAttemptFailed {
                target: url.to_string(),
                reason: format!("status {}", response.status),
            });
        }

        Ok(Attempt {
            redirected: response.url != url,
            response,
        })
    }

    fn remember_redirect(&self, resource: &ResourceKey, response: &UpstreamResponse) {
        match ResourceKey::from_url(&response.url) {
            Ok(resolved) => self.redirects.insert(resource.clone(), resolved),
            Err(e) => tracing::warn!(
                resource = %resource,
                resolved = %response.url,
                error = %e,
                "Redirect target cannot be cached"
            ),
        }
    }
}

fn same_host(a: &OriginKey, b: &OriginKey) -> bool {
    a.host() == b.host()
}

fn into_client_response(upstream: UpstreamResponse) -> Response<ProxyBody> {
    let mut headers = upstream.headers;
    filter_hop_by_hop(&mut headers, Version::HTTP_11);

    let mut response = Response::new(upstream.body);
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    response
}

/// Hyper service for the local endpoint: buffers the request body so it can
/// be replayed against the backup, then hands the request to the dispatcher.
#[derive(Clone)]
pub struct ProxyService {
    dispatcher: Arc<FailoverDispatcher>,
}

impl ProxyService {
    pub fn new(dispatcher: Arc<FailoverDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl Service<Request<Incoming>> for ProxyService {
    type Response = Response<ProxyBody>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let dispatcher = self.dispatcher.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let path = parts.uri.path().to_string();

            let result = match body.collect().await {
                Ok(collected) => {
                    let request = Request::from_parts(parts, collected.to_bytes());
                    dispatcher.dispatch(request).await
                }
                Err(e) => Err(ProxyError::RequestBody(e.to_string())),
            };

            Ok(result.unwrap_or_else(|e| {
                tracing::error!(path = %path, error = %e, "Proxy request failed");
                make_error_response(e.status_code(), &e.to_string())
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::StatusCode;
    use http_body_util::Full;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use url::Url;

    type Scripted = Result<(u16, &'static str, Option<&'static str>)>;

    // Replays scripted outcomes and records every request it was asked to send.
    #[derive(Default)]
    struct ScriptedUpstream {
        outcomes: Mutex<VecDeque<Scripted>>,
        sent: Mutex<Vec<(String, RedirectMode)>>,
    }

    impl ScriptedUpstream {
        fn new(outcomes: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                sent: Mutex::default(),
            })
        }

        fn sent(&self) -> Vec<(String, RedirectMode)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn send(
            &self,
            request: UpstreamRequest,
            mode: RedirectMode,
        ) -> Result<UpstreamResponse> {
            self.sent.lock().push((request.url.to_string(), mode));
            let (status, body, final_url) = self
                .outcomes
                .lock()
                .pop_front()
                .expect("unexpected upstream request")?;

            Ok(UpstreamResponse {
                status: StatusCode::from_u16(status).unwrap(),
                headers: HeaderMap::new(),
                url: final_url
                    .map(|u| Url::parse(u).unwrap())
                    .unwrap_or(request.url),
                body: Full::new(Bytes::from_static(body.as_bytes()))
                    .map_err(|e| match e {})
                    .boxed_unsync(),
            })
        }
    }

    fn network_error() -> Scripted {
        Err(ProxyError::UpstreamAttemptFailed {
            target: "test".into(),
            reason: "connection refused".into(),
        })
    }

    fn dispatcher(upstream: Arc<ScriptedUpstream>) -> FailoverDispatcher {
        let strategies = Arc::new(StrategyTable::new());
        strategies.set(
            OriginKey::parse("https://main.example.com").unwrap(),
            crate::strategy::Strategy::parse("https://backup.example.com", None).unwrap(),
        );
        FailoverDispatcher::new(strategies, Arc::new(RedirectCache::new()), upstream)
    }

    fn request(path: &str) -> Request<Bytes> {
        Request::builder()
            .uri(path)
            .header(HOST, "127.0.0.1:1234")
            .body(Bytes::new())
            .unwrap()
    }

    async fn body_of(response: Response<ProxyBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    fn resource(url: &str) -> ResourceKey {
        ResourceKey::from_url(&Url::parse(url).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_primary_success_is_not_cached() {
        let upstream = ScriptedUpstream::new(vec![Ok((404, "missing", None))]);
        let dispatcher = dispatcher(upstream.clone());

        let response = dispatcher
            .dispatch(request("/https,main.example.com/video.mp4?t=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_of(response).await.as_ref(), b"missing");

        assert_eq!(
            upstream.sent(),
            vec![(
                "https://main.example.com/video.mp4?t=1".to_string(),
                RedirectMode::Follow
            )]
        );
        assert!(dispatcher.redirects.is_empty());
    }

    #[tokio::test]
    async fn test_redirect_is_cached_and_reused() {
        let upstream = ScriptedUpstream::new(vec![
            Ok((200, "first", Some("https://edge.example.com/v/video.mp4"))),
            Ok((200, "second", None)),
        ]);
        let dispatcher = dispatcher(upstream.clone());

        let response = dispatcher
            .dispatch(request("/https,main.example.com/video.mp4"))
            .await
            .unwrap();
        assert_eq!(body_of(response).await.as_ref(), b"first");
        assert_eq!(
            dispatcher
                .redirects
                .get(&resource("https://main.example.com/video.mp4")),
            Some(resource("https://edge.example.com/v/video.mp4"))
        );

        let response = dispatcher
            .dispatch(request("/https,main.example.com/video.mp4"))
            .await
            .unwrap();
        assert_eq!(body_of(response).await.as_ref(), b"second");
        assert_eq!(
            upstream.sent()[1],
            (
                "https://edge.example.com/v/video.mp4".to_string(),
                RedirectMode::Manual
            )
        );
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back_to_backup() {
        let upstream = ScriptedUpstream::new(vec![
            Ok((502, "bad gateway", None)),
            Ok((200, "backup", None)),
            Ok((200, "backup again", None)),
        ]);
        let dispatcher = dispatcher(upstream.clone());

        let response = dispatcher
            .dispatch(request("/https,main.example.com/video.mp4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await.as_ref(), b"backup");

        // the next request goes straight to the backup
        let response = dispatcher
            .dispatch(request("/https,main.example.com/video.mp4"))
            .await
            .unwrap();
        assert_eq!(body_of(response).await.as_ref(), b"backup again");

        let sent: Vec<String> = upstream.sent().into_iter().map(|(url, _)| url).collect();
        assert_eq!(
            sent,
            vec![
                "https://main.example.com/video.mp4",
                "https://backup.example.com/video.mp4",
                "https://backup.example.com/video.mp4",
            ]
        );
    }

    #[tokio::test]
    async fn test_both_origins_failed() {
        let upstream = ScriptedUpstream::new(vec![network_error(), Ok((500, "down", None))]);
        let dispatcher = dispatcher(upstream.clone());

        let result = dispatcher
            .dispatch(request("/https,main.example.com/video.mp4"))
            .await;
        assert!(matches!(result, Err(ProxyError::BothOriginsFailed)));
        assert!(dispatcher.redirects.is_empty());
    }

    #[tokio::test]
    async fn test_failed_backup_is_not_retried() {
        // After failover the cached target is the backup; when it fails too the
        // backup is not attempted a second time.
        let upstream = ScriptedUpstream::new(vec![
            network_error(),
            Ok((200, "backup", None)),
            Ok((503, "busy", None)),
        ]);
        let dispatcher = dispatcher(upstream.clone());

        dispatcher
            .dispatch(request("/https,main.example.com/video.mp4"))
            .await
            .unwrap();
        let result = dispatcher
            .dispatch(request("/https,main.example.com/video.mp4"))
            .await;
        assert!(matches!(result, Err(ProxyError::BothOriginsFailed)));
        assert_eq!(upstream.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_origin() {
        let upstream = ScriptedUpstream::new(vec![network_error()]);
        let dispatcher = dispatcher(upstream.clone());

        let result = dispatcher
            .dispatch(request("/https,other.example.com/video.mp4"))
            .await;
        assert!(matches!(result, Err(ProxyError::UnknownOrigin(_))));
        assert_eq!(upstream.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_path_is_not_forwarded() {
        let upstream = ScriptedUpstream::new(vec![]);
        let dispatcher = dispatcher(upstream.clone());

        for path in ["/video.mp4", "/https,main.example.com", "/main.example.com/v.mp4"] {
            let result = dispatcher.dispatch(request(path)).await;
            assert!(matches!(result, Err(ProxyError::MalformedProxyPath(_))));
        }
        assert!(upstream.sent().is_empty());
    }
}
