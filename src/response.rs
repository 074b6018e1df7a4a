//! Response synthesis.
//!
//! Turns a matched interceptor's reply recipe into a [`SynthesizedResponse`]:
//! status, body, the merged header set, and the computed `Content-Length`
//! and `Date` extras.

use crate::clock::{http_date, Clock};
use crate::error::InterceptError;
use crate::header::{self, HeaderSet, ResolvedHeader};
use crate::interceptor::Reply;
use crate::matcher::MatchContext;
use crate::request::InterceptedRequest;
use crate::template::TemplateEngine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// How a scope stamps the `Date` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyDate {
    #[default]
    Off,
    Fixed(DateTime<Utc>),
    /// Read the engine clock at build time
    Live,
}

/// Origin-level reply settings applied to every response of a scope.
#[derive(Debug, Clone, Default)]
pub struct ReplyDefaults {
    pub headers: HeaderSet,
    pub content_length: bool,
    pub date: ReplyDate,
}

/// The response as it stands while headers are being resolved.
///
/// Header providers receive this; headers resolved earlier in declaration
/// order are visible to later providers.
#[derive(Debug, Clone, Default)]
pub struct ResponseDraft {
    status: u16,
    headers: Vec<(String, ResolvedHeader)>,
    body: Bytes,
}

impl ResponseDraft {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// A header resolved so far, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&ResolvedHeader> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn headers(&self) -> &[(String, ResolvedHeader)] {
        &self.headers
    }

    /// Replace a header in place (any casing) or append it.
    fn set_header(&mut self, name: &str, value: ResolvedHeader) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }
}

/// A fully built response.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesizedResponse {
    pub status: u16,
    /// Lower-cased names; repeated names collapse into one multi-value entry
    pub headers: HashMap<String, ResolvedHeader>,
    /// Wire order, one entry per name
    pub raw_headers: Vec<(String, ResolvedHeader)>,
    #[serde(serialize_with = "serialize_body")]
    pub body: Bytes,
}

fn serialize_body<S: serde::Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

impl SynthesizedResponse {
    fn from_draft(draft: ResponseDraft) -> Self {
        let mut headers: HashMap<String, ResolvedHeader> = HashMap::new();
        for (name, value) in &draft.headers {
            let key = name.to_ascii_lowercase();
            let existing = headers.remove(&key);
            headers.insert(key, ResolvedHeader::merged(existing, value.clone()));
        }

        Self {
            status: draft.status,
            headers,
            raw_headers: draft.headers,
            body: draft.body,
        }
    }

    /// Header lookup by any casing.
    pub fn header(&self, name: &str) -> Option<&ResolvedHeader> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    /// First value of a header by any casing.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(ResolvedHeader::first)
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Builds responses for one scope's defaults.
pub struct ResponseBuilder<'a> {
    defaults: &'a ReplyDefaults,
    clock: &'a dyn Clock,
    templates: &'a TemplateEngine,
}

impl<'a> ResponseBuilder<'a> {
    pub fn new(
        defaults: &'a ReplyDefaults,
        clock: &'a dyn Clock,
        templates: &'a TemplateEngine,
    ) -> Self {
        Self {
            defaults,
            clock,
            templates,
        }
    }

    /// Build the response for one served request.
    pub fn build(
        &self,
        reply: &Reply,
        context: &MatchContext,
        request: &InterceptedRequest,
    ) -> Result<SynthesizedResponse, InterceptError> {
        let status = reply.status.resolve(request)?;
        let body = reply.body.render(request, context, self.templates, self.clock)?;

        let mut declared = self.defaults.headers.merged(&reply.headers);
        if body.is_json && !declared.contains("content-type") {
            declared.insert("Content-Type", "application/json");
        }

        let mut draft = ResponseDraft {
            status,
            headers: Vec::with_capacity(declared.len() + 2),
            body: body.bytes,
        };

        for (name, value) in declared.iter() {
            let resolved = header::resolve(name, value, request, &draft, request.body())?;
            draft.headers.push((name.to_string(), resolved));
        }

        if self.defaults.content_length {
            let len = draft.body.len();
            draft.set_header("Content-Length", len.into());
        }

        let date = match self.defaults.date {
            ReplyDate::Off => None,
            ReplyDate::Fixed(at) => Some(at),
            ReplyDate::Live => Some(self.clock.now()),
        };
        if let Some(at) = date {
            draft.set_header("Date", ResolvedHeader::Single(http_date(at)));
        }

        Ok(SynthesizedResponse::from_draft(draft))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FrozenClock, SystemClock};
    use crate::error::BoxError;
    use crate::header::HeaderValue;
    use chrono::TimeZone;
    use serde_json::json;

    fn request() -> InterceptedRequest {
        InterceptedRequest::new("POST", "http://example.test/echo")
            .unwrap()
            .with_body("payload")
    }

    fn build(defaults: &ReplyDefaults, reply: &Reply) -> SynthesizedResponse {
        let templates = TemplateEngine::new();
        ResponseBuilder::new(defaults, &SystemClock, &templates)
            .build(reply, &MatchContext::default(), &request())
            .unwrap()
    }

    #[test]
    fn test_literal_headers_normalize() {
        let reply = Reply::new(201).text("ok").header("X-Custom", "value");
        let response = build(&ReplyDefaults::default(), &reply);

        assert_eq!(response.status, 201);
        assert_eq!(response.header_str("x-custom"), Some("value"));
        assert_eq!(response.header_str("X-CUSTOM"), Some("value"));
        assert_eq!(response.body_str(), Some("ok"));
    }

    #[test]
    fn test_multi_value_header_is_one_raw_entry() {
        let reply = Reply::new(200).header("Set-Cookie", ["a=1", "b=2"]);
        let response = build(&ReplyDefaults::default(), &reply);

        let expected = ResolvedHeader::Multi(vec!["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(response.header("set-cookie"), Some(&expected));
        let raw: Vec<_> = response
            .raw_headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
            .collect();
        assert_eq!(raw, vec![&("Set-Cookie".to_string(), expected)]);
    }

    #[test]
    fn test_content_length_counts_serialized_json() {
        let defaults = ReplyDefaults {
            content_length: true,
            ..Default::default()
        };
        let reply = Reply::new(200)
            .json(json!({"hello": "world"}))
            .header("Content-Length", "999");
        let response = build(&defaults, &reply);

        assert_eq!(response.body_str(), Some(r#"{"hello":"world"}"#));
        assert_eq!(response.header_str("content-length"), Some("17"));
        assert_eq!(response.header_str("content-type"), Some("application/json"));
    }

    #[test]
    fn test_fixed_and_live_date() {
        let at = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        let defaults = ReplyDefaults {
            date: ReplyDate::Fixed(at),
            ..Default::default()
        };
        let response = build(&defaults, &Reply::new(200));
        assert_eq!(response.header_str("date"), Some("Wed, 21 Oct 2015 07:28:00 GMT"));

        let clock = FrozenClock::new(Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap());
        let defaults = ReplyDefaults {
            date: ReplyDate::Live,
            ..Default::default()
        };
        let templates = TemplateEngine::new();
        let response = ResponseBuilder::new(&defaults, &clock, &templates)
            .build(&Reply::new(200), &MatchContext::default(), &request())
            .unwrap();
        assert_eq!(response.header_str("Date"), Some("Sat, 01 Jan 2000 12:00:00 GMT"));
    }

    #[test]
    fn test_defaults_merge_with_overrides() {
        let defaults = ReplyDefaults {
            headers: HeaderSet::new()
                .with("X-Powered-By", "zentinel")
                .with("Content-Type", "text/plain")
                .with("X-Region", "eu"),
            ..Default::default()
        };
        let reply = Reply::new(200).header("content-type", "text/html");
        let response = build(&defaults, &reply);

        let names: Vec<_> = response.raw_headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["X-Powered-By", "content-type", "X-Region"]);
        assert_eq!(response.header_str("content-type"), Some("text/html"));
        assert_eq!(response.header_str("x-powered-by"), Some("zentinel"));
    }

    #[test]
    fn test_provider_sees_earlier_headers_and_body() {
        let reply = Reply::new(202)
            .text("hi")
            .header("X-First", "1")
            .header(
                "X-Summary",
                HeaderValue::provider(|req, res, body| {
                    let first = res.header("x-first").and_then(ResolvedHeader::first).unwrap_or("-");
                    Ok::<_, BoxError>(format!(
                        "{} {} {} {}",
                        req.method(),
                        res.status(),
                        first,
                        String::from_utf8_lossy(body)
                    ))
                }),
            );
        let response = build(&ReplyDefaults::default(), &reply);
        assert_eq!(response.header_str("x-summary"), Some("POST 202 1 payload"));
    }

    #[test]
    fn test_provider_failure_fails_build() {
        let reply = Reply::new(200).header(
            "X-Broken",
            HeaderValue::provider(|_, _, _| Err::<String, BoxError>("broken".into())),
        );
        let templates = TemplateEngine::new();
        let err = ResponseBuilder::new(&ReplyDefaults::default(), &SystemClock, &templates)
            .build(&reply, &MatchContext::default(), &request())
            .unwrap_err();
        assert!(matches!(err, InterceptError::HeaderProvider { .. }));
    }
}
