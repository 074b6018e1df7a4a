//! Request matching logic.
//!
//! Decides whether an intercepted request satisfies one interceptor's
//! method, path, query, header and body rules.

use crate::error::InterceptError;
use crate::request::InterceptedRequest;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Path parameters extracted from template matching
    pub path_params: HashMap<String, String>,
    /// Query parameters
    pub query_params: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
}

/// Predicate over the path (or path plus query).
pub type PathPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Predicate over the raw request body.
pub type BodyPredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// How an interceptor accepts a request path.
#[derive(Clone)]
pub enum PathMatcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
    Glob(globset::GlobMatcher),
    /// Path with parameters (e.g., /users/{id})
    Template(PathTemplate),
    Predicate(PathPredicate),
}

impl PathMatcher {
    pub fn exact(value: impl Into<String>) -> Self {
        PathMatcher::Exact(value.into())
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        PathMatcher::Prefix(value.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, InterceptError> {
        compile_regex(pattern).map(PathMatcher::Regex)
    }

    pub fn glob(pattern: &str) -> Result<Self, InterceptError> {
        let glob = globset::Glob::new(pattern).map_err(|e| InterceptError::InvalidPattern {
            kind: "glob",
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(PathMatcher::Glob(glob.compile_matcher()))
    }

    /// Path template such as `/users/{id}`. Always matched against the path
    /// alone; parameters never absorb the query string.
    pub fn template(template: &str) -> Self {
        PathMatcher::Template(PathTemplate::parse(template))
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        PathMatcher::Predicate(Arc::new(f))
    }

    /// Whether this matcher sees the query string when no query rules exist.
    fn sees_query(&self) -> bool {
        !matches!(self, PathMatcher::Template(_))
    }

    fn matches(&self, path: &str, context: &mut MatchContext) -> bool {
        match self {
            PathMatcher::Exact(value) => path == value,
            PathMatcher::Prefix(value) => path.starts_with(value.as_str()),
            PathMatcher::Regex(regex) => {
                if let Some(captures) = regex.captures(path) {
                    for (i, cap) in captures.iter().enumerate().skip(1) {
                        if let Some(m) = cap {
                            context.captures.insert(i.to_string(), m.as_str().to_string());
                        }
                    }
                    for name in regex.capture_names().flatten() {
                        if let Some(m) = captures.name(name) {
                            context.captures.insert(name.to_string(), m.as_str().to_string());
                        }
                    }
                    true
                } else {
                    false
                }
            }
            PathMatcher::Glob(glob) => glob.is_match(path),
            PathMatcher::Template(template) => match template.matches(path) {
                Some(params) => {
                    context.path_params = params;
                    true
                }
                None => false,
            },
            PathMatcher::Predicate(f) => f(path),
        }
    }
}

impl From<&str> for PathMatcher {
    fn from(value: &str) -> Self {
        PathMatcher::exact(value)
    }
}

impl From<String> for PathMatcher {
    fn from(value: String) -> Self {
        PathMatcher::Exact(value)
    }
}

impl From<Regex> for PathMatcher {
    fn from(regex: Regex) -> Self {
        PathMatcher::Regex(regex)
    }
}

impl fmt::Display for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathMatcher::Exact(v) => f.write_str(v),
            PathMatcher::Prefix(v) => write!(f, "{}*", v),
            PathMatcher::Regex(r) => write!(f, "/{}/", r.as_str()),
            PathMatcher::Glob(g) => write!(f, "glob:{}", g.glob()),
            PathMatcher::Template(t) => f.write_str(&t.source),
            PathMatcher::Predicate(_) => f.write_str("<predicate>"),
        }
    }
}

impl fmt::Debug for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathMatcher({})", self)
    }
}

/// A parsed `/users/{id}` style template.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    source: String,
    segments: Vec<TemplateSegment>,
}

#[derive(Debug, Clone)]
enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    fn parse(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_param = false;

        for ch in template.chars() {
            match ch {
                '{' if !in_param => {
                    if !current.is_empty() {
                        segments.push(TemplateSegment::Literal(std::mem::take(&mut current)));
                    }
                    in_param = true;
                }
                '}' if in_param => {
                    segments.push(TemplateSegment::Param(std::mem::take(&mut current)));
                    in_param = false;
                }
                _ => current.push(ch),
            }
        }

        if !current.is_empty() {
            segments.push(TemplateSegment::Literal(current));
        }

        Self {
            source: template.to_string(),
            segments,
        }
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut remaining = path;

        for (idx, segment) in self.segments.iter().enumerate() {
            match segment {
                TemplateSegment::Literal(lit) => {
                    remaining = remaining.strip_prefix(lit.as_str())?;
                }
                TemplateSegment::Param(name) => {
                    // A parameter never spans a slash
                    let segment_end = remaining.find('/').unwrap_or(remaining.len());
                    let end_pos = match self.segments.get(idx + 1) {
                        Some(TemplateSegment::Literal(next)) if !next.starts_with('/') => {
                            remaining[..segment_end]
                                .find(next.as_str())
                                .unwrap_or(segment_end)
                        }
                        _ => segment_end,
                    };

                    if end_pos == 0 {
                        return None;
                    }

                    params.insert(name.clone(), remaining[..end_pos].to_string());
                    remaining = &remaining[end_pos..];
                }
            }
        }

        // Must consume entire path
        remaining.is_empty().then_some(params)
    }
}

/// Query parameter matching.
#[derive(Debug, Clone)]
pub enum QueryMatcher {
    Exact(String),
    Regex(Regex),
    /// Parameter must be present (any value)
    Present,
    /// Parameter must be absent
    Absent,
}

impl QueryMatcher {
    pub fn regex(pattern: &str) -> Result<Self, InterceptError> {
        compile_regex(pattern).map(QueryMatcher::Regex)
    }

    fn matches(&self, query_params: &HashMap<String, String>, name: &str) -> bool {
        let value = query_params.get(name);
        match self {
            QueryMatcher::Exact(expected) => value == Some(expected),
            QueryMatcher::Regex(regex) => value.is_some_and(|v| regex.is_match(v)),
            QueryMatcher::Present => value.is_some(),
            QueryMatcher::Absent => value.is_none(),
        }
    }
}

impl From<&str> for QueryMatcher {
    fn from(value: &str) -> Self {
        QueryMatcher::Exact(value.to_string())
    }
}

/// Request header matching. Names compare case-insensitively.
#[derive(Debug, Clone)]
pub enum HeaderMatcher {
    Exact(String),
    Regex(Regex),
    Present,
    Absent,
    /// Value must contain substring
    Contains(String),
}

impl HeaderMatcher {
    pub fn regex(pattern: &str) -> Result<Self, InterceptError> {
        compile_regex(pattern).map(HeaderMatcher::Regex)
    }

    fn matches(&self, request: &InterceptedRequest, name: &str) -> bool {
        let value = request.header(name);
        match self {
            HeaderMatcher::Exact(expected) => value == Some(expected.as_str()),
            HeaderMatcher::Regex(regex) => value.is_some_and(|v| regex.is_match(v)),
            HeaderMatcher::Present => value.is_some(),
            HeaderMatcher::Absent => value.is_none(),
            HeaderMatcher::Contains(needle) => value.is_some_and(|v| v.contains(needle.as_str())),
        }
    }
}

impl From<&str> for HeaderMatcher {
    fn from(value: &str) -> Self {
        HeaderMatcher::Exact(value.to_string())
    }
}

/// Request body matching.
#[derive(Clone)]
pub enum BodyMatcher {
    /// Exact body match
    Exact(String),
    Regex(Regex),
    /// Structural JSON equality
    Json(serde_json::Value),
    /// JSON path expressions and expected values (null = path must resolve)
    JsonPath(Vec<(String, serde_json::Value)>),
    Contains(String),
    /// Body must be valid JSON (any structure)
    IsJson,
    Empty,
    Predicate(BodyPredicate),
}

impl BodyMatcher {
    pub fn regex(pattern: &str) -> Result<Self, InterceptError> {
        compile_regex(pattern).map(BodyMatcher::Regex)
    }

    pub fn json_path<I, K>(expressions: I) -> Result<Self, InterceptError>
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        use jsonpath_rust::JsonPath;

        let expressions: Vec<(String, serde_json::Value)> = expressions
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect();
        for (expr, _) in &expressions {
            JsonPath::<serde_json::Value>::try_from(expr.as_str()).map_err(|e| InterceptError::InvalidPattern {
                kind: "JSON path",
                pattern: expr.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(BodyMatcher::JsonPath(expressions))
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        BodyMatcher::Predicate(Arc::new(f))
    }

    fn matches(&self, body: &[u8]) -> bool {
        let body_str = std::str::from_utf8(body).ok();

        match self {
            BodyMatcher::Exact(value) => body_str == Some(value.as_str()),
            BodyMatcher::Regex(regex) => body_str.is_some_and(|bs| regex.is_match(bs)),
            BodyMatcher::Json(expected) => serde_json::from_slice::<serde_json::Value>(body)
                .map(|actual| actual == *expected)
                .unwrap_or(false),
            BodyMatcher::JsonPath(expressions) => {
                match serde_json::from_slice::<serde_json::Value>(body) {
                    Ok(json) => matches_json_paths(&json, expressions),
                    Err(_) => false,
                }
            }
            BodyMatcher::Contains(value) => body_str.is_some_and(|bs| bs.contains(value.as_str())),
            BodyMatcher::IsJson => serde_json::from_slice::<serde_json::Value>(body).is_ok(),
            BodyMatcher::Empty => body.is_empty(),
            BodyMatcher::Predicate(f) => f(body),
        }
    }
}

impl From<serde_json::Value> for BodyMatcher {
    fn from(value: serde_json::Value) -> Self {
        BodyMatcher::Json(value)
    }
}

impl From<&str> for BodyMatcher {
    fn from(value: &str) -> Self {
        BodyMatcher::Exact(value.to_string())
    }
}

impl fmt::Debug for BodyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyMatcher::Exact(v) => f.debug_tuple("Exact").field(v).finish(),
            BodyMatcher::Regex(r) => f.debug_tuple("Regex").field(&r.as_str()).finish(),
            BodyMatcher::Json(v) => f.debug_tuple("Json").field(v).finish(),
            BodyMatcher::JsonPath(v) => f.debug_tuple("JsonPath").field(v).finish(),
            BodyMatcher::Contains(v) => f.debug_tuple("Contains").field(v).finish(),
            BodyMatcher::IsJson => f.write_str("IsJson"),
            BodyMatcher::Empty => f.write_str("Empty"),
            BodyMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

fn matches_json_paths(json: &serde_json::Value, expressions: &[(String, serde_json::Value)]) -> bool {
    use jsonpath_rust::JsonPath;

    for (path_expr, expected) in expressions {
        let path = match JsonPath::<serde_json::Value>::try_from(path_expr.as_str()) {
            Ok(p) => p,
            Err(_) => return false,
        };

        let results = path.find(json);

        // A null expectation only requires the path to resolve
        let matches = if expected.is_null() {
            !results.is_null()
        } else {
            results == *expected
        };
        if !matches {
            return false;
        }
    }
    true
}

fn compile_regex(pattern: &str) -> Result<Regex, InterceptError> {
    Regex::new(pattern).map_err(|e| InterceptError::InvalidPattern {
        kind: "regex",
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Every rule an interceptor applies to a request.
#[derive(Debug, Clone)]
pub struct RequestMatcher {
    /// Upper-cased HTTP method
    pub method: String,
    pub path: PathMatcher,
    pub query: Vec<(String, QueryMatcher)>,
    pub headers: Vec<(String, HeaderMatcher)>,
    pub body: Option<BodyMatcher>,
}

impl RequestMatcher {
    pub fn new(method: &str, path: PathMatcher) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Match a request, returning captured context on success.
    ///
    /// With query rules declared the path rule sees the bare path; otherwise
    /// it sees path and query together. Templates always see the bare path.
    pub fn matches(&self, request: &InterceptedRequest) -> Option<MatchContext> {
        let mut context = MatchContext::default();

        if !self.method.eq_ignore_ascii_case(request.method()) {
            return None;
        }

        let matched = if self.query.is_empty() && self.path.sees_query() {
            self.path.matches(&request.path_and_query(), &mut context)
        } else {
            self.path.matches(request.path(), &mut context)
        };
        if !matched {
            return None;
        }

        context.query_params = parse_query_string(request.query().unwrap_or(""));

        if !self
            .query
            .iter()
            .all(|(name, qm)| qm.matches(&context.query_params, name))
        {
            return None;
        }

        if !self
            .headers
            .iter()
            .all(|(name, hm)| hm.matches(request, name))
        {
            return None;
        }

        if let Some(bm) = &self.body {
            if !bm.matches(request.body()) {
                return None;
            }
        }

        Some(context)
    }
}

/// Parse a query string into key-value pairs.
pub(crate) fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        params.insert(decode_component(key), decode_component(value));
    }

    params
}

fn decode_component(s: &str) -> String {
    let s = s.replace('+', " ");
    match urlencoding::decode(&s) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn get(url: &str) -> InterceptedRequest {
        InterceptedRequest::new("GET", url).unwrap()
    }

    #[test]
    fn test_exact_path_matching() {
        let matcher = RequestMatcher::new("GET", "/api/users".into());

        assert!(matcher.matches(&get("http://h/api/users")).is_some());
        assert!(matcher.matches(&get("http://h/api/posts")).is_none());
        // Without query rules the query is part of the path
        assert!(matcher.matches(&get("http://h/api/users?x=1")).is_none());
    }

    #[test]
    fn test_method_is_case_insensitive() {
        let matcher = RequestMatcher::new("get", "/".into());
        assert!(matcher.matches(&get("http://h/")).is_some());

        let post = InterceptedRequest::new("POST", "http://h/").unwrap();
        assert!(matcher.matches(&post).is_none());
    }

    #[test]
    fn test_prefix_path_matching() {
        let matcher = RequestMatcher::new("GET", PathMatcher::prefix("/api/"));

        assert!(matcher.matches(&get("http://h/api/users")).is_some());
        assert!(matcher.matches(&get("http://h/api/posts/123")).is_some());
        assert!(matcher.matches(&get("http://h/other")).is_none());
    }

    #[test]
    fn test_regex_captures() {
        let matcher = RequestMatcher::new(
            "GET",
            PathMatcher::regex(r"^/orders/(?P<order>\d+)$").unwrap(),
        );

        let ctx = matcher.matches(&get("http://h/orders/42")).unwrap();
        assert_eq!(ctx.captures.get("1"), Some(&"42".to_string()));
        assert_eq!(ctx.captures.get("order"), Some(&"42".to_string()));
        assert!(matcher.matches(&get("http://h/orders/abc")).is_none());
    }

    #[test]
    fn test_glob_matching() {
        let matcher = RequestMatcher::new("GET", PathMatcher::glob("/static/**/*.css").unwrap());
        assert!(matcher.matches(&get("http://h/static/a/b/site.css")).is_some());
        assert!(matcher.matches(&get("http://h/static/site.js")).is_none());
    }

    #[test]
    fn test_template_path_matching() {
        let matcher = RequestMatcher::new("GET", PathMatcher::template("/users/{id}"));

        let ctx = matcher.matches(&get("http://h/users/123")).unwrap();
        assert_eq!(ctx.path_params.get("id"), Some(&"123".to_string()));

        assert!(matcher.matches(&get("http://h/users/")).is_none());
        assert!(matcher.matches(&get("http://h/users/1/posts")).is_none());
    }

    #[test]
    fn test_template_ignores_query_string() {
        let matcher = RequestMatcher::new("GET", PathMatcher::template("/users/{id}"));
        let ctx = matcher.matches(&get("http://h/users/1?expand=true")).unwrap();
        assert_eq!(ctx.path_params.get("id"), Some(&"1".to_string()));
        assert_eq!(ctx.query_params.get("expand"), Some(&"true".to_string()));
    }

    #[test]
    fn test_template_with_trailing_literal() {
        let matcher = RequestMatcher::new("GET", PathMatcher::template("/files/{name}.json"));
        let ctx = matcher.matches(&get("http://h/files/report.json")).unwrap();
        assert_eq!(ctx.path_params.get("name"), Some(&"report".to_string()));

        let matcher = RequestMatcher::new("GET", PathMatcher::template("/users/{id}/posts/{post}"));
        let ctx = matcher.matches(&get("http://h/users/7/posts/9")).unwrap();
        assert_eq!(ctx.path_params.get("id"), Some(&"7".to_string()));
        assert_eq!(ctx.path_params.get("post"), Some(&"9".to_string()));
    }

    #[test]
    fn test_predicate_sees_path_and_query() {
        let matcher = RequestMatcher::new("GET", PathMatcher::predicate(|p| p.ends_with("token=abc")));
        assert!(matcher.matches(&get("http://h/login?token=abc")).is_some());
        assert!(matcher.matches(&get("http://h/login?token=xyz")).is_none());
    }

    #[test]
    fn test_query_matching() {
        let mut matcher = RequestMatcher::new("GET", "/api/users".into());
        matcher.query.push(("page".to_string(), "1".into()));
        matcher.query.push(("debug".to_string(), QueryMatcher::Absent));

        assert!(matcher.matches(&get("http://h/api/users?page=1")).is_some());
        assert!(matcher.matches(&get("http://h/api/users?page=2")).is_none());
        assert!(matcher.matches(&get("http://h/api/users?page=1&debug")).is_none());
    }

    #[test]
    fn test_header_matching() {
        let mut matcher = RequestMatcher::new("GET", "/api/users".into());
        matcher
            .headers
            .push(("authorization".to_string(), HeaderMatcher::Present));
        matcher
            .headers
            .push(("Accept".to_string(), HeaderMatcher::Contains("json".to_string())));

        let request = get("http://h/api/users")
            .with_header("Authorization", "Bearer token")
            .with_header("accept", "application/json");
        assert!(matcher.matches(&request).is_some());
        assert!(matcher.matches(&get("http://h/api/users")).is_none());
    }

    #[test]
    fn test_body_matchers() {
        let post = |body: &'static str| {
            InterceptedRequest::new("POST", "http://h/api/users")
                .unwrap()
                .with_body(body)
        };

        let mut matcher = RequestMatcher::new("POST", "/api/users".into());
        matcher.body = Some(BodyMatcher::IsJson);
        assert!(matcher.matches(&post(r#"{"name": "John"}"#)).is_some());
        assert!(matcher.matches(&post("not json")).is_none());

        matcher.body = Some(json!({"name": "John", "age": 3}).into());
        assert!(matcher.matches(&post(r#"{"age":3,"name":"John"}"#)).is_some());
        assert!(matcher.matches(&post(r#"{"name":"John"}"#)).is_none());

        matcher.body = Some(BodyMatcher::predicate(|b| b.len() > 3));
        assert!(matcher.matches(&post("long enough")).is_some());
        assert!(matcher.matches(&post("no")).is_none());

        matcher.body = Some(BodyMatcher::Empty);
        assert!(matcher.matches(&post("")).is_some());
    }

    #[test]
    fn test_json_path_body() {
        let mut matcher = RequestMatcher::new("POST", "/orders".into());
        matcher.body = Some(BodyMatcher::json_path([("$.customer.id", json!(null))]).unwrap());

        let request = InterceptedRequest::new("POST", "http://h/orders")
            .unwrap()
            .with_body(r#"{"customer":{"id":7}}"#);
        assert!(matcher.matches(&request).is_some());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(PathMatcher::regex("(").is_err());
        assert!(PathMatcher::glob("[").is_err());
    }

    #[test]
    fn test_parse_query_string() {
        let params = parse_query_string("foo=bar&baz=qux");
        assert_eq!(params.get("foo"), Some(&"bar".to_string()));
        assert_eq!(params.get("baz"), Some(&"qux".to_string()));

        let params = parse_query_string("name=John%20Doe&q=a+b&flag");
        assert_eq!(params.get("name"), Some(&"John Doe".to_string()));
        assert_eq!(params.get("q"), Some(&"a b".to_string()));
        assert_eq!(params.get("flag"), Some(&String::new()));
    }
}
