//! Error types for the interception engine.

use thiserror::Error;

/// Error type returned by user-supplied provider closures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced while matching requests or synthesizing responses.
#[derive(Debug, Error)]
pub enum InterceptError {
    /// No active interceptor accepted the request and passthrough is disabled.
    #[error("no interceptor matched {method} {url}")]
    NoMatch { method: String, url: String },

    /// A header provider returned an error.
    #[error("header provider for `{header}` failed: {source}")]
    HeaderProvider {
        header: String,
        #[source]
        source: BoxError,
    },

    /// A status provider returned an error.
    #[error("status provider failed: {0}")]
    StatusProvider(#[source] BoxError),

    /// A body provider returned an error.
    #[error("body provider failed: {0}")]
    BodyProvider(#[source] BoxError),

    /// A templated body failed to render.
    #[error("template rendering failed: {0}")]
    Template(#[from] handlebars::RenderError),

    /// A JSON body could not be serialized.
    #[error("body serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A request or scope URL could not be parsed.
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A regex, glob or JSON path pattern failed to compile.
    #[error("invalid {kind} pattern `{pattern}`: {reason}")]
    InvalidPattern {
        kind: &'static str,
        pattern: String,
        reason: String,
    },

    /// The matched interceptor was declared with `reply_with_error`.
    #[error("{0}")]
    Replied(String),

    /// `Scope::done` found expectations with remaining uses.
    #[error("{origin}: pending expectations: {}", pending.join(", "))]
    PendingExpectations {
        origin: String,
        pending: Vec<String>,
    },
}

impl InterceptError {
    pub(crate) fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        InterceptError::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this is a no-match failure.
    pub fn is_no_match(&self) -> bool {
        matches!(self, InterceptError::NoMatch { .. })
    }
}
