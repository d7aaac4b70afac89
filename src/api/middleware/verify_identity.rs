//! The upstream gateway authenticates users and forwards the stable user id together with an
//! HMAC-SHA256 of that id, keyed with the shared identity secret.

use core::fmt;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::{HeaderMap, StatusCode};
use http::request::Parts;
use ring::hmac::{self, Key};

use super::{MiddlewareErr, MiddlewareResult};
use crate::api::server::AppState;
use crate::constants::{USER_ID_HEADER, USER_SIGNATURE_HEADER};
use crate::db::prelude::UserId;
use crate::util::constant_time_cmp;

#[derive(Clone)]
pub struct IdentityKey {
    key: Key,
}

impl IdentityKey {
    pub fn new(secret: &str) -> MiddlewareResult<Self> {
        if secret.is_empty() {
            return Err(MiddlewareErr::EmptySecret);
        }

        Ok(Self {
            key: Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        })
    }

    pub fn sign(&self, user_id: &str) -> String {
        hex::encode(hmac::sign(&self.key, user_id.as_bytes()))
    }

    pub fn verify(&self, user_id: &str, signature: &str) -> bool {
        constant_time_cmp(&signature.to_ascii_lowercase(), &self.sign(user_id))
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityKey(..)")
    }
}

/// Caller identity, set by [`verify_user_ident`]
#[derive(Debug, Clone)]
pub struct AuthedUser(pub UserId);

pub async fn verify_user_ident(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (Some(user_id), Some(signature)) = (
        header_value(req.headers(), USER_ID_HEADER),
        header_value(req.headers(), USER_SIGNATURE_HEADER),
    ) else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    if !state.identity.verify(&user_id, &signature) {
        tracing::warn!(%user_id, "identity signature mismatch");
        return Err(StatusCode::FORBIDDEN);
    }

    req.extensions_mut().insert(AuthedUser(UserId(user_id)));
    Ok(next.run(req).await)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthedUser>()
            .cloned()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}
