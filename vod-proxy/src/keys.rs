use crate::errors::{ProxyError, Result};
use std::fmt;
use url::Url;

/// Scheme and host (including a non-default port) of an upstream origin.
///
/// An origin key never carries a path, query or fragment. Keys built from
/// configuration or urls also reject `,`, the separator used in proxy paths.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OriginKey {
    scheme: String,
    host: String,
}

impl OriginKey {
    pub fn new<S, H>(scheme: S, host: H) -> Result<Self>
    where
        S: Into<String>,
        H: Into<String>,
    {
        let scheme = scheme.into();
        let host = host.into();

        if scheme.is_empty() || host.is_empty() {
            return Err(ProxyError::InvalidStrategyConfiguration(format!(
                "origin needs both a scheme and a host, got {scheme:?} and {host:?}"
            )));
        }
        if scheme.contains(',') || host.contains(',') || host.contains('/') {
            return Err(ProxyError::InvalidStrategyConfiguration(format!(
                "origin {scheme}://{host} cannot be embedded in a proxy path"
            )));
        }

        Ok(OriginKey { scheme, host })
    }

    // Proxy paths are only checked for presence of both parts.
    pub(crate) fn decoded(scheme: &str, host: &str) -> Self {
        OriginKey {
            scheme: scheme.to_string(),
            host: host.to_string(),
        }
    }

    /// Parses an origin base such as `https://cdn.example.com`.
    ///
    /// Anything beyond scheme and authority is rejected instead of being
    /// silently dropped.
    pub fn parse(origin: &str) -> Result<Self> {
        let url = Url::parse(origin).map_err(|e| {
            ProxyError::InvalidStrategyConfiguration(format!("{origin:?} is not a url: {e}"))
        })?;

        let has_path = !matches!(url.path(), "" | "/") || origin.ends_with('/');
        if has_path || url.query().is_some() || url.fragment().is_some() {
            return Err(ProxyError::InvalidStrategyConfiguration(format!(
                "{origin:?} must not carry a path, query or fragment"
            )));
        }

        Self::from_url(&url)
    }

    /// Origin of an arbitrary url, ignoring its path.
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url.host_str().ok_or_else(|| {
            ProxyError::InvalidStrategyConfiguration(format!("{url} has no host"))
        })?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Self::new(url.scheme(), authority)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)
    }
}

/// One retrievable resource: an origin plus a path that starts with `/`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    origin: OriginKey,
    path: String,
}

impl ResourceKey {
    pub fn new<P: Into<String>>(origin: OriginKey, path: P) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        ResourceKey { origin, path }
    }

    /// Resource addressed by `url`; the query and fragment are not part of the key.
    pub fn from_url(url: &Url) -> Result<Self> {
        Ok(Self::new(OriginKey::from_url(url)?, url.path()))
    }

    pub fn origin(&self) -> &OriginKey {
        &self.origin
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Same path, served from another origin.
    pub fn with_origin(&self, origin: &OriginKey) -> Self {
        ResourceKey {
            origin: origin.clone(),
            path: self.path.clone(),
        }
    }

    /// Absolute url of this resource, with `query` appended when present.
    pub fn to_url(&self, query: Option<&str>) -> Result<Url, url::ParseError> {
        match query {
            Some(query) => Url::parse(&format!("{self}?{query}")),
            None => Url::parse(&self.to_string()),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.origin, self.path)
    }
}
