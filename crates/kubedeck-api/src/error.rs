//! HTTP mapping of core errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use kubedeck_common::Error;

/// Core error wrapped for use as an axum response
#[derive(Debug)]
pub struct ApiError(pub Error);

/// Result type for handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        Self(Error::from(e))
    }
}

/// Status code a core error is reported with
pub fn status_code(error: &Error) -> StatusCode {
    match error {
        Error::Validation { .. } => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Build { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Unreachable { .. } | Error::Session { .. } | Error::Bridge { .. } => {
            StatusCode::BAD_GATEWAY
        }
        Error::Kube {
            source: kube::Error::Api(response),
        } => StatusCode::from_u16(response.code).unwrap_or(StatusCode::BAD_GATEWAY),
        Error::Kube { .. } => StatusCode::BAD_GATEWAY,
        Error::Persistence { .. } | Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);

        // Return K8s-style Status response
        let mut body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": self.0.to_string(),
            "code": status.as_u16()
        });
        if let Error::Validation {
            field: Some(field), ..
        } = &self.0
        {
            body["details"] = serde_json::json!({ "field": field });
        }

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Error::validation("bad"), StatusCode::BAD_REQUEST)]
    #[case(Error::bundle_not_found("b"), StatusCode::NOT_FOUND)]
    #[case(Error::build("t", "no auth"), StatusCode::UNPROCESSABLE_ENTITY)]
    #[case(Error::unreachable("t", "timeout"), StatusCode::BAD_GATEWAY)]
    #[case(Error::bridge("closed"), StatusCode::BAD_GATEWAY)]
    #[case(Error::persistence("disk"), StatusCode::INTERNAL_SERVER_ERROR)]
    fn test_status_codes(#[case] error: Error, #[case] expected: StatusCode) {
        assert_eq!(status_code(&error), expected);
    }

    #[tokio::test]
    async fn test_body_is_k8s_status() {
        let response =
            ApiError(Error::validation_for_field("endpoint", "endpoint is required")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["kind"], "Status");
        assert_eq!(body["code"], 400);
        assert_eq!(body["details"]["field"], "endpoint");
        assert_eq!(body["message"], "validation error: endpoint is required");
    }
}
