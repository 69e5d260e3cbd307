use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApiError;

/// One accepted principal for HTTP basic authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub principal: String,
    pub secret: String,
}

/// Checks `Authorization: Basic` headers against a fixed credential list.
#[derive(Debug, Default)]
pub(crate) struct Authenticator {
    credentials: Vec<Credential>,
}

impl Authenticator {
    pub(crate) fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }

    /// Principal named by a valid header value.
    pub(crate) fn authenticate(&self, header: &str) -> Option<&str> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (principal, secret) = decoded.split_once(':')?;
        self.credentials
            .iter()
            .find(|c| c.principal == principal && c.secret == secret)
            .map(|c| c.principal.as_str())
    }
}

pub(crate) async fn require_credentials(
    State(auth): State<Arc<Authenticator>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match header.and_then(|h| auth.authenticate(h)) {
        Some(principal) => {
            debug!(principal, path = %request.uri().path(), "authenticated request");
            Ok(next.run(request).await)
        }
        None => Err(ApiError::Unauthorized),
    }
}
