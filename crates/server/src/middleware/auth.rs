use crate::config::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Decides whether a request may reach the MCP endpoint
pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn authorize(&self, headers: &HeaderMap) -> bool;
}

/// Lets every request through
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn name(&self) -> &'static str {
        "none"
    }

    fn authorize(&self, _headers: &HeaderMap) -> bool {
        true
    }
}

/// Requires `Authorization: Bearer <token>` with a fixed token
pub struct StaticBearer {
    token: String,
}

impl StaticBearer {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthProvider for StaticBearer {
    fn name(&self) -> &'static str {
        "bearer"
    }

    fn authorize(&self, headers: &HeaderMap) -> bool {
        bearer_token(headers).is_some_and(|token| token == self.token)
    }
}

/// Auth providers selectable at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AuthMode {
    #[default]
    None,
    Bearer,
}

pub fn provider_for(mode: AuthMode, token: Option<String>) -> anyhow::Result<Arc<dyn AuthProvider>> {
    match mode {
        AuthMode::None => Ok(Arc::new(NoAuth)),
        AuthMode::Bearer => {
            let token = token
                .filter(|t| !t.is_empty())
                .ok_or_else(|| anyhow::anyhow!("bearer auth requires MCP_AUTH_TOKEN"))?;
            Ok(Arc::new(StaticBearer::new(token)))
        }
    }
}

/// Extract the bearer token from the authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth_header = headers.get(header::AUTHORIZATION)?;
    let auth_str = auth_header.to_str().ok()?;
    auth_str.strip_prefix("Bearer ").map(str::trim)
}

/// Reject requests the configured provider does not authorize
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !state.auth.authorize(req.headers()) {
        tracing::warn!("Rejected unauthorized request to {}", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert("Authorization", HeaderValue::from_static("Bearer token123"));
        assert_eq!(bearer_token(&headers), Some("token123"));

        headers.insert("Authorization", HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn test_static_bearer() {
        let provider = StaticBearer::new("s3cret");
        let mut headers = HeaderMap::new();
        assert!(!provider.authorize(&headers));

        headers.insert("Authorization", HeaderValue::from_static("Bearer wrong"));
        assert!(!provider.authorize(&headers));

        headers.insert("Authorization", HeaderValue::from_static("Bearer s3cret"));
        assert!(provider.authorize(&headers));
    }

    #[test]
    fn test_provider_for() {
        assert_eq!(provider_for(AuthMode::None, None).unwrap().name(), "none");
        assert_eq!(
            provider_for(AuthMode::Bearer, Some("t".to_string())).unwrap().name(),
            "bearer"
        );
        assert!(provider_for(AuthMode::Bearer, None).is_err());
        assert!(provider_for(AuthMode::Bearer, Some(String::new())).is_err());
    }
}
