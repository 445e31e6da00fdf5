use axum::{http::StatusCode, response::IntoResponse, Json};
use parley_core::DomainError;

use super::{
    metrics::{record_auth_failure, record_rate_limit_hit},
    types::ApiError,
};

#[derive(Debug)]
pub(crate) enum ApiFailure {
    /// A request field failed validation; the field name is echoed back.
    Validation(&'static str),
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict(&'static str),
    PayloadTooLarge,
    UnsupportedMediaType,
    RateLimited,
    Internal,
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl ApiFailure {
    pub(crate) fn from_domain(error: &DomainError) -> Self {
        match error {
            DomainError::InvalidUsername => Self::Validation("username"),
            DomainError::InvalidEmail => Self::Validation("email"),
            DomainError::InvalidRoomName => Self::Validation("name"),
            DomainError::InvalidRoomDescription => Self::Validation("description"),
            DomainError::InvalidUserId | DomainError::InvalidRoomId => Self::NotFound,
            DomainError::InvalidMessageId => Self::Validation("cursor"),
            DomainError::EmptyMessage | DomainError::MessageTooLong => Self::Validation("body"),
            DomainError::InvalidAttachment => Self::Validation("attachment"),
            DomainError::InvalidResourceUrl => Self::Validation("avatar_url"),
            DomainError::SelfDirectMessage => Self::InvalidRequest,
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Validation(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
            Self::InvalidRequest => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            Self::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            Self::Conflict(reason) => (StatusCode::CONFLICT, reason),
            Self::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            Self::UnsupportedMediaType => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media_type")
            }
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            Self::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl From<DomainError> for ApiFailure {
    fn from(value: DomainError) -> Self {
        Self::from_domain(&value)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Unauthorized => record_auth_failure("unauthorized"),
            Self::Forbidden => record_auth_failure("forbidden"),
            Self::RateLimited => record_rate_limit_hit("http", "api_failure"),
            Self::Validation(_)
            | Self::InvalidRequest
            | Self::NotFound
            | Self::Conflict(_)
            | Self::PayloadTooLarge
            | Self::UnsupportedMediaType
            | Self::Internal => {}
        }

        let field = match self {
            Self::Validation(field) => Some(field),
            _ => None,
        };
        let (status, error) = self.status_and_code();
        (status, Json(ApiError { error, field })).into_response()
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, response::IntoResponse};
    use parley_core::DomainError;

    use super::ApiFailure;

    async fn body_json(failure: ApiFailure) -> (StatusCode, serde_json::Value) {
        let response = failure.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn validation_failures_name_the_field() {
        let (status, body) = body_json(ApiFailure::Validation("username")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");
        assert_eq!(body["field"], "username");
    }

    #[tokio::test]
    async fn conflicts_carry_their_reason_without_field() {
        let (status, body) = body_json(ApiFailure::Conflict("username_taken")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "username_taken");
        assert!(body.get("field").is_none());
    }

    #[test]
    fn domain_errors_map_to_request_fields() {
        assert!(matches!(
            ApiFailure::from(DomainError::EmptyMessage),
            ApiFailure::Validation("body")
        ));
        assert!(matches!(
            ApiFailure::from(DomainError::InvalidRoomId),
            ApiFailure::NotFound
        ));
    }
}
