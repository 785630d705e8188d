//! Every way the gateway can refuse a request, and how each is shown to the caller.
use crate::schema::SchemaViolation;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The upstream credential or token signing secret was not configured.
    #[error("Missing environment variables")]
    Config,
    #[error("Invalid path: {0}")]
    InvalidRoute(String),
    #[error("{0}")]
    MissingCredential(&'static str),
    /// The reason is logged but never returned to the caller.
    #[error("Invalid token")]
    InvalidToken(String),
    #[error("Invalid user")]
    InvalidSubject,
    #[error("{0}")]
    ScopeViolation(String),
    #[error("Invalid request body: {0}")]
    SchemaViolation(#[from] SchemaViolation),
    #[error("Could not read request body: {0}")]
    InvalidBody(String),
    #[error("Upstream request failed")]
    Upstream(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Machine-readable error type, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config => "config_error",
            GatewayError::InvalidRoute(_) => "invalid_route",
            GatewayError::MissingCredential(_) => "missing_credential",
            GatewayError::InvalidToken(_) => "invalid_token",
            GatewayError::InvalidSubject => "invalid_subject",
            GatewayError::ScopeViolation(_) => "scope_violation",
            GatewayError::SchemaViolation(_) => "schema_violation",
            GatewayError::InvalidBody(_) => "invalid_body",
            GatewayError::Upstream(_) => "upstream_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match &self {
            GatewayError::InvalidToken(reason) => {
                warn!(code = self.code(), %reason, "Rejecting request")
            }
            GatewayError::Upstream(reason) => {
                error!(code = self.code(), %reason, "Upstream unreachable")
            }
            _ => warn!(code = self.code(), error = %self, "Rejecting request"),
        }

        let status = self.status();
        let message = if status == StatusCode::BAD_REQUEST {
            format!("Bad request: {self}")
        } else {
            self.to_string()
        };
        let body = json!({
            "error": {
                "type": self.code(),
                "message": message
            }
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Issue;

    async fn render(err: GatewayError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_rejections_render_as_bad_request_envelopes() {
        let (status, body) = render(GatewayError::InvalidRoute("/v1/unknown".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_route");
        assert_eq!(body["error"]["message"], "Bad request: Invalid path: /v1/unknown");
    }

    #[tokio::test]
    async fn test_token_failure_reason_is_not_returned() {
        let (_, body) = render(GatewayError::InvalidToken("ExpiredSignature".into())).await;
        assert_eq!(body["error"]["message"], "Bad request: Invalid token");
    }

    #[tokio::test]
    async fn test_schema_violation_lists_issues() {
        let violation = SchemaViolation {
            issues: vec![
                Issue {
                    path: "temperature".into(),
                    message: "must be exactly 0.8".into(),
                },
                Issue {
                    path: "user".into(),
                    message: "must not be present".into(),
                },
            ],
        };
        let (_, body) = render(violation.into()).await;
        assert_eq!(body["error"]["type"], "schema_violation");
        assert_eq!(
            body["error"]["message"],
            "Bad request: Invalid request body: temperature: must be exactly 0.8; user: must not be present"
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_is_bad_gateway() {
        let (status, body) = render(GatewayError::Upstream("connection refused".into())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["message"], "Upstream request failed");
    }
}
