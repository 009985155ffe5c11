//! Bearer API key check for the OpenAI-compatible routes

use axum::{
    Json,
    extract::Request,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing API key")]
    MissingKey,

    #[error("Invalid API key")]
    InvalidKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingKey => StatusCode::UNAUTHORIZED,
            AuthError::InvalidKey => StatusCode::FORBIDDEN,
        };

        tracing::warn!(error = %self, "Authentication failed");

        let body = Json(crate::error::ErrorResponse {
            error: self.to_string(),
            timestamp: chrono::Utc::now(),
        });
        (status, body).into_response()
    }
}

/// Accepted bearer keys. An empty set leaves the routes open.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: HashSet<String>,
}

impl ApiKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(Into::into)
                .filter(|key: &String| !key.is_empty())
                .collect(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        if self.is_open() {
            return Ok(());
        }

        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingKey)?;

        if self.keys.contains(token) {
            Ok(())
        } else {
            Err(AuthError::InvalidKey)
        }
    }
}

/// Axum middleware rejecting requests without an accepted bearer key
pub async fn api_key_middleware(
    keys: Arc<ApiKeys>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    keys.check(request.headers())?;
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request as AxumRequest, middleware, routing::get};
    use tower::ServiceExt;

    fn headers(authorization: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = authorization {
            headers.insert(AUTHORIZATION, value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_no_keys_means_open() {
        let keys = ApiKeys::new(Vec::<String>::new());
        assert!(keys.is_open());
        assert_eq!(keys.check(&headers(None)), Ok(()));
    }

    #[test]
    fn test_blank_keys_are_ignored() {
        assert!(ApiKeys::new(["", ""]).is_open());
    }

    #[test]
    fn test_key_checks() {
        let keys = ApiKeys::new(["sk-one", "sk-two"]);

        assert_eq!(keys.check(&headers(None)), Err(AuthError::MissingKey));
        assert_eq!(keys.check(&headers(Some("sk-one"))), Err(AuthError::MissingKey));
        assert_eq!(keys.check(&headers(Some("Basic sk-one"))), Err(AuthError::MissingKey));
        assert_eq!(keys.check(&headers(Some("Bearer sk-three"))), Err(AuthError::InvalidKey));
        assert_eq!(keys.check(&headers(Some("Bearer sk-two"))), Ok(()));
    }

    #[tokio::test]
    async fn test_middleware_statuses() {
        let keys = Arc::new(ApiKeys::new(["sk-one"]));
        let app = Router::new()
            .route("/v1/test", get(|| async { "ok" }))
            .route_layer(middleware::from_fn(move |req, next| {
                let keys = keys.clone();
                api_key_middleware(keys, req, next)
            }));

        for (authorization, expected) in [
            (None, StatusCode::UNAUTHORIZED),
            (Some("Bearer nope"), StatusCode::FORBIDDEN),
            (Some("Bearer sk-one"), StatusCode::OK),
        ] {
            let mut request = AxumRequest::builder().uri("/v1/test");
            if let Some(value) = authorization {
                request = request.header(AUTHORIZATION, value);
            }
            let response = app
                .clone()
                .oneshot(request.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), expected);
        }
    }
}
