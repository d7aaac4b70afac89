pub mod verify_identity;
pub mod verify_internal;

use http::request::Parts as ReqParts;
use http::{HeaderValue, Method};
use thiserror::Error;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub type MiddlewareResult<T> = core::result::Result<T, MiddlewareErr>;

#[derive(Debug, Error)]
pub enum MiddlewareErr {
    #[error("identity secret is empty")]
    EmptySecret,

    #[error("internal token is empty")]
    EmptyToken,
}

/// `*` allows any origin; anything else is matched as an origin suffix
pub fn cors(allow_origins: &str) -> CorsLayer {
    let allowed = if allow_origins == "*" {
        AllowOrigin::any()
    } else {
        let suffix = allow_origins.to_string();
        AllowOrigin::predicate(move |org: &HeaderValue, _: &ReqParts| {
            org.as_bytes().ends_with(suffix.as_bytes())
        })
    };

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(allowed)
}
