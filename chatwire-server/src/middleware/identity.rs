//! Caller identity supplied by the upstream gateway.
//!
//! The gateway authenticates the user and forwards the numeric user id in a
//! configurable header. Chat routes refuse requests without it.

use std::str::FromStr;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Request},
    middleware::Next,
    response::Response,
};
use shared::config::server::Config;
use tracing::Span;

use crate::{
    http::error::{ApiError, AppResult},
    middleware::request_context::RequestContext,
};

#[derive(Clone, Debug)]
pub struct IdentityState {
    header: HeaderName,
}

impl IdentityState {
    pub fn from_config(config: &Config) -> Self {
        let header = HeaderName::from_str(&config.identity.user_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-user-id"));
        Self { header }
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }
}

/// Parses the identity header. `Ok(None)` when the header is absent.
pub fn caller_from_headers(headers: &HeaderMap, header: &HeaderName) -> AppResult<Option<i64>> {
    let Some(raw) = headers.get(header) else {
        return Ok(None);
    };

    raw.to_str()
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .map(Some)
        .ok_or_else(|| ApiError::bad_request(format!("{header} must be a positive integer")))
}

pub async fn require_identity(
    State(state): State<IdentityState>,
    mut request: Request<Body>,
    next: Next,
) -> AppResult<Response> {
    let user_id = caller_from_headers(request.headers(), &state.header)?
        .ok_or_else(|| ApiError::unauthorized(format!("missing {} header", state.header)))?;

    Span::current().record("user_id", user_id);
    match request.extensions_mut().get_mut::<RequestContext>() {
        Some(context) => context.user_id = Some(user_id),
        None => {
            request.extensions_mut().insert(RequestContext {
                request_id: String::new(),
                user_id: Some(user_id),
            });
        }
    }

    Ok(next.run(request).await)
}
