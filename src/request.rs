//! Outgoing request descriptors.
//!
//! The transport hook hands the engine an [`InterceptedRequest`]: method,
//! absolute URL, headers and the complete body buffer.

use crate::error::InterceptError;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// Scheme, host and port: the unit of isolation for matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    /// Parse an origin such as `https://api.example.com` or `http://localhost:8080`.
    ///
    /// Any path component is ignored.
    pub fn parse(input: &str) -> Result<Self, InterceptError> {
        let (origin, _, _) = split_url(input)?;
        Ok(origin)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

/// Split an absolute URL into origin, path and optional query.
fn split_url(input: &str) -> Result<(Origin, String, Option<String>), InterceptError> {
    let (scheme, rest) = input
        .split_once("://")
        .ok_or_else(|| InterceptError::invalid_url(input, "missing scheme"))?;
    let scheme = scheme.to_ascii_lowercase();
    if scheme.is_empty() {
        return Err(InterceptError::invalid_url(input, "missing scheme"));
    }

    // Fragments never reach the wire
    let rest = rest.split('#').next().unwrap_or_default();

    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, target) = rest.split_at(authority_end);
    // Drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(InterceptError::invalid_url(input, "missing host"));
    }

    let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
        let close = stripped
            .find(']')
            .ok_or_else(|| InterceptError::invalid_url(input, "unterminated IPv6 host"))?;
        let host = &authority[..close + 2];
        let port = stripped[close + 1..].strip_prefix(':');
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| InterceptError::invalid_url(input, format!("invalid port `{}`", p)))?,
        None => default_port(&scheme)
            .ok_or_else(|| InterceptError::invalid_url(input, "no port for scheme"))?,
    };

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (target, None),
    };
    let path = if path.is_empty() { "/" } else { path };

    Ok((
        Origin {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        },
        path.to_string(),
        query,
    ))
}

/// An outgoing request as seen by the engine.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    method: String,
    origin: Origin,
    path: String,
    query: Option<String>,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl InterceptedRequest {
    /// Describe a request to an absolute URL.
    pub fn new(method: &str, url: &str) -> Result<Self, InterceptError> {
        let (origin, path, query) = split_url(url)?;
        Ok(Self {
            method: method.to_ascii_uppercase(),
            origin,
            path,
            query,
            headers: Vec::new(),
            body: Bytes::new(),
        })
    }

    /// Append a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the complete request body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Path plus `?query` when a query is present.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// Absolute URL with an explicit port.
    pub fn url(&self) -> String {
        format!("{}{}", self.origin, self.path_and_query())
    }

    /// Headers in the order they were supplied.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header value for `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Header map keyed by lower-cased name (first value wins).
    pub fn header_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for (name, value) in &self.headers {
            map.entry(name.to_ascii_lowercase())
                .or_insert_with(|| value.clone());
        }
        map
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as UTF-8, if it is valid text.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Serialized request description, as read by the CLI.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestDescription {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl TryFrom<RequestDescription> for InterceptedRequest {
    type Error = InterceptError;

    fn try_from(desc: RequestDescription) -> Result<Self, Self::Error> {
        let mut request = InterceptedRequest::new(&desc.method, &desc.url)?;
        request.headers = desc.headers;
        if let Some(body) = desc.body {
            request.body = Bytes::from(body);
        }
        Ok(request)
    }
}
