use std::sync::Arc;

use axum::http::HeaderMap;

use crate::Engine;

pub mod cluster;
pub mod http;
pub mod message;
pub mod ws;

pub use http::router;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub forward: reqwest::Client,
}

/// Resolve the caller identity. The real deployment fronts this service
/// with an authentication middleware that injects the principal header;
/// `--use-mock-auth` trusts `X-User-Email` directly for development and
/// tests. Forwarded writes between nodes ride the cluster secret and carry
/// the original caller's email through.
pub fn identify(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let header_email = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    };

    if state.engine.cfg.use_mock_auth {
        return header_email("x-user-email");
    }
    let secret = &state.engine.cfg.raft_secret;
    if !secret.is_empty()
        && headers
            .get(crate::raft::transport::SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            == Some(secret.as_str())
    {
        return header_email("x-user-email");
    }
    header_email("x-authenticated-user")
}
