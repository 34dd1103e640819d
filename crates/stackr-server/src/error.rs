use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use stackr_core::error::StackrError;

// ---------------------------------------------------------------------------
// Sentinels for explicit statuses
// ---------------------------------------------------------------------------

/// Carries an explicit 400 through the `anyhow::Error` chain for request
/// validation failures that have no core error.
#[derive(Debug)]
struct BadRequest(String);

impl std::fmt::Display for BadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequest {}

#[derive(Debug)]
struct Forbidden(String);

impl std::fmt::Display for Forbidden {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Forbidden {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequest(msg.into()).into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self(Forbidden(msg.into()).into())
    }
}

fn status_for(e: &StackrError) -> StatusCode {
    match e {
        StackrError::StackNotFound(_)
        | StackrError::AmbiguousStack(_)
        | StackrError::UnclassifiedStack(_)
        | StackrError::InvalidStackName(_)
        | StackrError::MissingDefinition { .. }
        | StackrError::InvalidDescriptor { .. } => StatusCode::BAD_REQUEST,
        StackrError::JobNotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(b) = self.0.downcast_ref::<BadRequest>() {
            let body = serde_json::json!({ "error": b.0.clone() });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }
        if let Some(f) = self.0.downcast_ref::<Forbidden>() {
            let body = serde_json::json!({ "error": f.0.clone() });
            return (StatusCode::FORBIDDEN, axum::Json(body)).into_response();
        }

        let status = match self.0.downcast_ref::<StackrError>() {
            // A failed deploy reports the captured process output.
            Some(StackrError::Deploy(d)) => {
                let body = serde_json::json!({
                    "error": d.error,
                    "exit_code": d.exit_code,
                    "stdout": d.stdout.trim(),
                    "stderr": d.stderr.trim(),
                });
                return (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response();
            }
            Some(e) => status_for(e),
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn unknown_stack_maps_to_400() {
        let err = AppError(StackrError::StackNotFound("web".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_definition_maps_to_400() {
        let err = AppError(
            StackrError::MissingDefinition {
                stack: "web".into(),
                path: PathBuf::from("/x/docker-compose.yml"),
            }
            .into(),
        );
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn sentinels_keep_their_status() {
        assert_eq!(
            AppError::forbidden("no").into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::bad_request("bad").into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn io_errors_map_to_500() {
        let err = AppError(StackrError::Io(std::io::Error::other("disk")).into());
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
