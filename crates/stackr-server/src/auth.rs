use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

/// Bearer token guarding mutating routes.
#[derive(Clone)]
pub struct AuthConfig {
    pub token: Arc<str>,
}

impl AuthConfig {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Axum middleware requiring `Authorization: Bearer <token>`. Anything else
/// gets `401 {"error":"unauthorized"}`.
pub async fn auth_middleware(
    State(config): State<AuthConfig>,
    req: Request,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(bearer_token);

    if presented == Some(&*config.token) {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "rejected request without valid token");
    Response::builder()
        .status(401)
        .header("Content-Type", "application/json")
        .body(Body::from(r#"{"error":"unauthorized"}"#))
        .unwrap_or_default()
}

fn bearer_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::{http::Request, middleware, routing::get, Router};
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn test_app() -> Router {
        Router::new()
            .route("/deploy", get(ok_handler))
            .layer(middleware::from_fn_with_state(
                AuthConfig::new("secret"),
                auth_middleware,
            ))
    }

    async fn status_with(header: Option<&str>) -> StatusCode {
        let mut req = Request::builder().uri("/deploy");
        if let Some(h) = header {
            req = req.header("authorization", h);
        }
        test_app()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn matching_bearer_passes() {
        assert_eq!(status_with(Some("Bearer secret")).await, StatusCode::OK);
        assert_eq!(status_with(Some("Bearer  secret ")).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_or_wrong_token_is_rejected() {
        assert_eq!(status_with(None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_with(Some("Bearer nope")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_with(Some("secret")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_with(Some("Bearer ")).await, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
