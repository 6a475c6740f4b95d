//! Shared-secret gate for agent-facing routes.

use crate::api::ApiError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Header carrying the agent key.
pub const AGENT_KEY_HEADER: &str = "x-agent-key";

/// Expected agent key. `None` leaves the gate open.
#[derive(Debug, Clone, Default)]
pub struct AgentAuth {
    key: Option<Arc<str>>,
}

impl AgentAuth {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: key.filter(|k| !k.is_empty()).map(Arc::from),
        }
    }

    pub fn is_open(&self) -> bool {
        self.key.is_none()
    }

    pub fn permits(&self, presented: Option<&str>) -> bool {
        match &self.key {
            None => true,
            Some(expected) => presented
                .is_some_and(|got| constant_time_eq(got.as_bytes(), expected.as_bytes())),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Reject requests without a matching `x-agent-key` header.
pub async fn require_agent_key(
    State(auth): State<AgentAuth>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(AGENT_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    if auth.permits(presented) {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "Rejected request with bad agent key");
    ApiError::Unauthorized.into_response()
}
