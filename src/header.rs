//! Declared header values and their per-request resolution.
//!
//! A header is declared as a literal, an ordered list of values, or a
//! provider closure. Providers run once for every request the owning
//! interceptor serves and never for requests it does not serve.

use crate::error::{BoxError, InterceptError};
use crate::request::InterceptedRequest;
use crate::response::ResponseDraft;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;

/// Closure computing a header value from the in-flight request, the response
/// being built and the complete request body.
pub type HeaderProvider = Arc<
    dyn Fn(&InterceptedRequest, &ResponseDraft, &[u8]) -> Result<ResolvedHeader, BoxError>
        + Send
        + Sync,
>;

/// A declared header value.
#[derive(Clone)]
pub enum HeaderValue {
    /// Single literal value
    Literal(String),
    /// One wire value per element, emitted under one name
    Multi(Vec<String>),
    /// Computed per served request
    Provider(HeaderProvider),
}

impl HeaderValue {
    /// Wrap a closure as a header provider.
    pub fn provider<F, V>(f: F) -> Self
    where
        F: Fn(&InterceptedRequest, &ResponseDraft, &[u8]) -> Result<V, BoxError>
            + Send
            + Sync
            + 'static,
        V: Into<ResolvedHeader>,
    {
        HeaderValue::Provider(Arc::new(
            move |req: &InterceptedRequest,
                  res: &ResponseDraft,
                  body: &[u8]|
                  -> Result<ResolvedHeader, BoxError> { f(req, res, body).map(Into::into) },
        ))
    }
}

impl fmt::Debug for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            HeaderValue::Multi(v) => f.debug_tuple("Multi").field(v).finish(),
            HeaderValue::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

/// A header value ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResolvedHeader {
    Single(String),
    Multi(Vec<String>),
}

impl ResolvedHeader {
    /// All values, in order.
    pub fn values(&self) -> &[String] {
        match self {
            ResolvedHeader::Single(v) => std::slice::from_ref(v),
            ResolvedHeader::Multi(v) => v,
        }
    }

    /// The first value, if any.
    pub fn first(&self) -> Option<&str> {
        self.values().first().map(String::as_str)
    }

    fn append(self, other: ResolvedHeader) -> ResolvedHeader {
        let mut values = match self {
            ResolvedHeader::Single(v) => vec![v],
            ResolvedHeader::Multi(v) => v,
        };
        match other {
            ResolvedHeader::Single(v) => values.push(v),
            ResolvedHeader::Multi(v) => values.extend(v),
        }
        ResolvedHeader::Multi(values)
    }

    pub(crate) fn merged(existing: Option<ResolvedHeader>, next: ResolvedHeader) -> ResolvedHeader {
        match existing {
            Some(prev) => prev.append(next),
            None => next,
        }
    }
}

impl PartialEq<&str> for ResolvedHeader {
    fn eq(&self, other: &&str) -> bool {
        matches!(self, ResolvedHeader::Single(v) if v == other)
    }
}

macro_rules! impl_from_scalar {
    ($($t:ty),*) => {
        $(
            impl From<$t> for HeaderValue {
                fn from(v: $t) -> Self {
                    HeaderValue::Literal(v.to_string())
                }
            }

            impl From<$t> for ResolvedHeader {
                fn from(v: $t) -> Self {
                    ResolvedHeader::Single(v.to_string())
                }
            }
        )*
    };
}

impl_from_scalar!(&str, String, &String, u16, u32, u64, usize, i32, i64, f32, f64, bool);

impl From<Vec<String>> for HeaderValue {
    fn from(v: Vec<String>) -> Self {
        HeaderValue::Multi(v)
    }
}

impl From<Vec<&str>> for HeaderValue {
    fn from(v: Vec<&str>) -> Self {
        HeaderValue::Multi(v.into_iter().map(String::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for HeaderValue {
    fn from(v: [&str; N]) -> Self {
        HeaderValue::Multi(v.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Vec<String>> for ResolvedHeader {
    fn from(v: Vec<String>) -> Self {
        ResolvedHeader::Multi(v)
    }
}

impl From<Vec<&str>> for ResolvedHeader {
    fn from(v: Vec<&str>) -> Self {
        ResolvedHeader::Multi(v.into_iter().map(String::from).collect())
    }
}

/// Resolve one declared header for the request being served.
///
/// Providers are invoked exactly once; their result is used as-is.
pub fn resolve(
    name: &str,
    value: &HeaderValue,
    request: &InterceptedRequest,
    response: &ResponseDraft,
    body: &[u8],
) -> Result<ResolvedHeader, InterceptError> {
    match value {
        HeaderValue::Literal(v) => Ok(ResolvedHeader::Single(v.clone())),
        HeaderValue::Multi(v) => Ok(ResolvedHeader::Multi(v.clone())),
        HeaderValue::Provider(provider) => {
            provider(request, response, body).map_err(|source| InterceptError::HeaderProvider {
                header: name.to_string(),
                source,
            })
        }
    }
}

/// Ordered header declarations keyed by name as declared.
///
/// Names are unique under case-insensitive comparison.
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    entries: Vec<(String, HeaderValue)>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`HeaderSet::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert a header. An existing entry with the same name in any casing
    /// is replaced in place and takes the new casing.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx] = (name, value),
            None => self.entries.push((name, value)),
        }
    }

    /// Declared value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.position(name).map(|idx| &self.entries[idx].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        self.position(name).map(|idx| self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overlay `other` on top of this set.
    ///
    /// Entries of `other` replace same-named entries (any casing) at their
    /// original position; untouched entries keep their casing and order, and
    /// new names are appended in `other`'s order.
    pub fn merged(&self, other: &HeaderSet) -> HeaderSet {
        let mut merged = self.clone();
        for (name, value) in &other.entries {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

impl<K, V> FromIterator<(K, V)> for HeaderSet
where
    K: Into<String>,
    V: Into<HeaderValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = HeaderSet::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

/// YAML/JSON maps deserialize in document order. Scalars become literals and
/// sequences become multi-value headers.
impl<'de> Deserialize<'de> for HeaderSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderSetVisitor;

        impl<'de> Visitor<'de> for HeaderSetVisitor {
            type Value = HeaderSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<HeaderSet, A::Error> {
                let mut set = HeaderSet::new();
                while let Some((name, value)) = map.next_entry::<String, serde_json::Value>()? {
                    let value = match value {
                        serde_json::Value::String(s) => HeaderValue::Literal(s),
                        serde_json::Value::Number(n) => HeaderValue::Literal(n.to_string()),
                        serde_json::Value::Bool(b) => HeaderValue::Literal(b.to_string()),
                        serde_json::Value::Array(items) => HeaderValue::Multi(
                            items
                                .into_iter()
                                .map(|item| match item {
                                    serde_json::Value::String(s) => s,
                                    other => other.to_string(),
                                })
                                .collect(),
                        ),
                        other => {
                            return Err(de::Error::custom(format!(
                                "unsupported value for header `{}`: {}",
                                name, other
                            )))
                        }
                    };
                    set.insert(name, value);
                }
                Ok(set)
            }
        }

        deserializer.deserialize_map(HeaderSetVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> InterceptedRequest {
        InterceptedRequest::new("GET", "http://example.test/").unwrap()
    }

    #[test]
    fn test_literal_and_multi_resolve_unchanged() {
        let draft = ResponseDraft::default();
        let resolved = resolve("X-One", &"1".into(), &request(), &draft, b"").unwrap();
        assert_eq!(resolved, ResolvedHeader::Single("1".to_string()));

        let resolved = resolve("X-Two", &["a", "b"].into(), &request(), &draft, b"").unwrap();
        assert_eq!(resolved.values(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_numeric_literal_is_coerced() {
        let draft = ResponseDraft::default();
        let resolved = resolve("X-Count", &42u32.into(), &request(), &draft, b"").unwrap();
        assert_eq!(resolved, "42");

        let resolved = resolve("X-Ratio", &0.25f64.into(), &request(), &draft, b"").unwrap();
        assert_eq!(resolved, "0.25");
        assert_eq!(ResolvedHeader::from(1.5f32), "1.5");
    }

    #[test]
    fn test_provider_sees_request_and_body() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let value = HeaderValue::provider(move |req, _res, body| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(format!("{} {}", req.method(), body.len()))
        });

        let draft = ResponseDraft::default();
        let resolved = resolve("X-Echo", &value, &request(), &draft, b"abc").unwrap();
        assert_eq!(resolved, "GET 3");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_provider_error_propagates() {
        let value = HeaderValue::provider(|_, _, _| Err::<String, BoxError>("nope".into()));
        let err = resolve("X-Fail", &value, &request(), &ResponseDraft::default(), b"").unwrap_err();
        match err {
            InterceptError::HeaderProvider { header, .. } => assert_eq!(header, "X-Fail"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_insert_replaces_case_insensitively() {
        let mut set = HeaderSet::new().with("X-A", "1").with("X-B", "2");
        set.insert("x-a", "3");

        let names: Vec<_> = set.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["x-a", "X-B"]);
        assert!(matches!(set.get("X-A"), Some(HeaderValue::Literal(v)) if v == "3"));
    }

    #[test]
    fn test_merge_preserves_default_order() {
        let defaults = HeaderSet::new()
            .with("X-Powered-By", "zentinel")
            .with("Content-Type", "text/plain")
            .with("X-Trace", "on");
        let overlay = HeaderSet::new()
            .with("content-type", "application/json")
            .with("X-Extra", "1");

        let merged = defaults.merged(&overlay);
        let names: Vec<_> = merged.iter().map(|(k, _)| k).collect();
        assert_eq!(
            names,
            vec!["X-Powered-By", "content-type", "X-Trace", "X-Extra"]
        );
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn test_deserialize_keeps_document_order() {
        let yaml = "
Z-Last: first
A-First: 2
Set-Cookie: [a=1, b=2]
";
        let set: HeaderSet = serde_yaml::from_str(yaml).unwrap();
        let names: Vec<_> = set.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Z-Last", "A-First", "Set-Cookie"]);
        assert!(matches!(set.get("a-first"), Some(HeaderValue::Literal(v)) if v == "2"));
        assert!(matches!(set.get("set-cookie"), Some(HeaderValue::Multi(v)) if v.len() == 2));
    }
}
