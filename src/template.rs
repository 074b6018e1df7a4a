//! Template engine for dynamic reply bodies.
//!
//! Uses Handlebars for template rendering with request context.

use crate::matcher::MatchContext;
use crate::request::InterceptedRequest;
use chrono::{DateTime, TimeZone, Utc};
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Context for template rendering.
#[derive(Debug, Serialize)]
pub struct TemplateContext {
    /// Path parameters from URL template matching
    pub path: HashMap<String, String>,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers, lower-cased names
    pub headers: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
    /// Request method
    pub method: String,
    /// Absolute request URL
    pub url: String,
    /// Request path
    pub request_path: String,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
    /// Engine clock reading in epoch milliseconds
    pub timestamp: i64,
}

impl TemplateContext {
    fn new(match_ctx: &MatchContext, request: &InterceptedRequest, now: DateTime<Utc>) -> Self {
        let body = request.body_str().map(String::from);
        let json = body.as_ref().and_then(|s| serde_json::from_str(s).ok());

        Self {
            path: match_ctx.path_params.clone(),
            query: match_ctx.query_params.clone(),
            headers: request.header_map(),
            captures: match_ctx.captures.clone(),
            method: request.method().to_string(),
            url: request.url(),
            request_path: request.path().to_string(),
            body,
            json,
            timestamp: now.timestamp_millis(),
        }
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        // Register custom helpers
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));
        handlebars.register_helper("base64", Box::new(base64_helper));

        // Bodies are not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string for a matched request.
    pub fn render(
        &self,
        template: &str,
        match_ctx: &MatchContext,
        request: &InterceptedRequest,
        now: DateTime<Utc>,
    ) -> Result<String, handlebars::RenderError> {
        let ctx = TemplateContext::new(match_ctx, request, now);
        self.handlebars.render_template(template, &ctx)
    }

    /// Render a JSON value with templates in string fields.
    pub fn render_json(
        &self,
        json: &serde_json::Value,
        match_ctx: &MatchContext,
        request: &InterceptedRequest,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        let ctx = TemplateContext::new(match_ctx, request, now);
        self.render_json_value(json, &ctx)
    }

    fn render_json_value(
        &self,
        value: &serde_json::Value,
        ctx: &TemplateContext,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        match value {
            serde_json::Value::String(s) => {
                // Check if it contains template syntax
                if s.contains("{{") {
                    let rendered = self.handlebars.render_template(s, ctx)?;
                    Ok(serde_json::Value::String(rendered))
                } else {
                    Ok(value.clone())
                }
            }
            serde_json::Value::Array(arr) => {
                let rendered: Result<Vec<_>, _> = arr
                    .iter()
                    .map(|v| self.render_json_value(v, ctx))
                    .collect();
                Ok(serde_json::Value::Array(rendered?))
            }
            serde_json::Value::Object(obj) => {
                let mut rendered = serde_json::Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json_value(v, ctx)?);
                }
                Ok(serde_json::Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

// Custom Handlebars helpers

fn str_param<'a>(h: &'a handlebars::Helper, idx: usize) -> &'a str {
    h.param(idx).and_then(|v| v.value().as_str()).unwrap_or("")
}

/// `{{now "%Y"}}` formats the engine clock reading carried in the context.
fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    ctx: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    let now = ctx
        .data()
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    out.write(&now.format(format).to_string())?;
    Ok(())
}

/// `{{default value "fallback"}}`: fallback when value is null, missing or "".
fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let rendered = match h.param(0).map(|v| v.value()) {
        Some(serde_json::Value::Null) | None => None,
        Some(serde_json::Value::String(s)) if s.is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    out.write(rendered.as_deref().unwrap_or_else(|| str_param(h, 1)))?;
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&str_param(h, 0).to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&str_param(h, 0).to_lowercase())?;
    Ok(())
}

/// `{{base64 body}}` encodes a string with the standard alphabet.
fn base64_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use base64::Engine;
    out.write(&base64::engine::general_purpose::STANDARD.encode(str_param(h, 0)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> InterceptedRequest {
        InterceptedRequest::new("GET", url).unwrap()
    }

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 29, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_path_params() {
        let engine = TemplateEngine::new();
        let mut ctx = MatchContext::default();
        ctx.path_params.insert("id".to_string(), "123".to_string());

        let result = engine
            .render("User ID: {{path.id}}", &ctx, &request("http://h/users/123"), epoch())
            .unwrap();
        assert_eq!(result, "User ID: 123");
    }

    #[test]
    fn test_request_fields() {
        let engine = TemplateEngine::new();
        let req = InterceptedRequest::new("POST", "http://h/users")
            .unwrap()
            .with_header("Accept", "text/plain")
            .with_body(r#"{"name":"John"}"#);

        let result = engine
            .render(
                "{{method}} {{url}} {{headers.accept}} {{json.name}}",
                &MatchContext::default(),
                &req,
                epoch(),
            )
            .unwrap();
        assert_eq!(result, "POST http://h:80/users text/plain John");
    }

    #[test]
    fn test_now_reads_context_clock() {
        let engine = TemplateEngine::new();
        let result = engine
            .render(
                "{{now \"%Y-%m-%d %H:%M\"}}",
                &MatchContext::default(),
                &request("http://h/"),
                epoch(),
            )
            .unwrap();
        assert_eq!(result, "2024-02-29 10:30");
    }

    #[test]
    fn test_default_and_case_helpers() {
        let engine = TemplateEngine::new();
        let mut ctx = MatchContext::default();
        ctx.path_params.insert("name".to_string(), "John".to_string());

        let result = engine
            .render(
                "{{default query.missing \"none\"}} {{upper path.name}} {{lower path.name}}",
                &ctx,
                &request("http://h/"),
                epoch(),
            )
            .unwrap();
        assert_eq!(result, "none JOHN john");
    }

    #[test]
    fn test_base64_helper() {
        let engine = TemplateEngine::new();
        let req = InterceptedRequest::new("POST", "http://h/")
            .unwrap()
            .with_body("hello");
        let result = engine
            .render("{{base64 body}}", &MatchContext::default(), &req, epoch())
            .unwrap();
        assert_eq!(result, "aGVsbG8=");
    }

    #[test]
    fn test_render_json() {
        let engine = TemplateEngine::new();
        let mut ctx = MatchContext::default();
        ctx.captures.insert("order".to_string(), "42".to_string());

        let json = serde_json::json!({
            "id": "{{captures.order}}",
            "tags": ["{{method}}", 7],
            "static": "no template"
        });

        let result = engine
            .render_json(&json, &ctx, &request("http://h/orders/42"), epoch())
            .unwrap();
        assert_eq!(result["id"], "42");
        assert_eq!(result["tags"][0], "GET");
        assert_eq!(result["tags"][1], 7);
        assert_eq!(result["static"], "no template");
    }
}
