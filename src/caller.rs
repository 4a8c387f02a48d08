//! Caller identity used to scope saved-document history.
//!
//! This is not authentication. The configured caller header is preferred;
//! forwarded-IP headers are a fallback and can be spoofed by any client.

use std::convert::Infallible;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};

use crate::AppState;

pub const UNKNOWN_CALLER: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn from_headers(headers: &HeaderMap, caller_header: &str) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let id = header(caller_header)
            .or_else(|| {
                header("x-forwarded-for")
                    .and_then(|v| v.split(',').next())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            })
            .or_else(|| header("x-real-ip"))
            .unwrap_or(UNKNOWN_CALLER);

        CallerId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CallerId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(CallerId::from_headers(
            &parts.headers,
            &state.config.server.caller_header,
        ))
    }
}
