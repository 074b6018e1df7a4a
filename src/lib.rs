//! Zentinel Intercept
//!
//! An HTTP interception test double. Tests declare the requests they expect
//! per origin, and the engine answers them with synthesized responses
//! instead of touching the network.
//!
//! # Features
//!
//! - **Scopes**: ordered expectations for one origin with default reply headers
//! - **Request Matching**: Match by method, path, query params, headers, body
//! - **Dynamic Headers**: Header values computed per request by providers
//! - **Templates**: Handlebars bodies rendered from the request
//! - **Repeat Policies**: once, `times(n)`, persist, optional
//! - **Computed Extras**: `Content-Length` and `Date` on demand
//! - **Completion Checks**: `is_done` and pending expectation listing
//!
//! # Example
//!
//! ```
//! use zentinel_intercept::{InterceptedRequest, Registry, Reply};
//!
//! let registry = Registry::new();
//! let scope = registry.scope("http://api.example.com").unwrap();
//! scope
//!     .get("/users/1")
//!     .reply(Reply::new(200).json(serde_json::json!({"id": 1})));
//!
//! let request = InterceptedRequest::new("GET", "http://api.example.com/users/1").unwrap();
//! let served = registry.intercept(&request).unwrap().into_served().unwrap();
//! assert_eq!(served.response.status, 200);
//! assert!(scope.is_done());
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod header;
pub mod interceptor;
pub mod matcher;
pub mod registry;
pub mod request;
pub mod response;
pub mod scope;
pub mod template;

pub use clock::{Clock, FrozenClock, SystemClock};
pub use config::{EngineSettings, FixtureConfig};
pub use error::{BoxError, InterceptError};
pub use header::{HeaderSet, HeaderValue, ResolvedHeader};
pub use interceptor::{InterceptorHandle, Reply, ReplyBody};
pub use matcher::{BodyMatcher, HeaderMatcher, MatchContext, PathMatcher, QueryMatcher};
pub use registry::{Dispatch, Registry, Transport};
pub use request::{InterceptedRequest, Origin, RequestDescription};
pub use response::{ResponseDraft, SynthesizedResponse};
pub use scope::{Scope, Served};
