//! Embeds a resource into a single proxy-local path.
//!
//! `https://origin.example/video.mp4` travels as `/https,origin.example/video.mp4`:
//! the first segment carries `scheme,host` and everything after it is the
//! original path, slashes included.

use crate::errors::{ProxyError, Result};
use crate::keys::{OriginKey, ResourceKey};

pub fn encode(resource: &ResourceKey) -> String {
    let origin = resource.origin();
    format!("/{},{}{}", origin.scheme(), origin.host(), resource.path())
}

pub fn decode(proxy_path: &str) -> Result<ResourceKey> {
    let malformed = || ProxyError::MalformedProxyPath(proxy_path.to_string());

    let rest = proxy_path.strip_prefix('/').ok_or_else(malformed)?;
    let (scheme_and_host, path) = rest.split_once('/').ok_or_else(malformed)?;
    let (scheme, host) = scheme_and_host.split_once(',').ok_or_else(malformed)?;
    if scheme.is_empty() || host.is_empty() {
        return Err(malformed());
    }

    Ok(ResourceKey::new(
        OriginKey::decoded(scheme, host),
        format!("/{path}"),
    ))
}
