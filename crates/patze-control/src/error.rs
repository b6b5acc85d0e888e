//! HTTP error envelope: every failure leaves as `{error, message?}` with a
//! status derived from the error code. Messages are scrubbed of paths and
//! internals before they reach a response body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use patze_proto::{ApiError, ErrorCode};

pub struct HttpError(pub ApiError);

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::InvalidBody => StatusCode::BAD_REQUEST,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::NotFound
        | ErrorCode::TargetNotFound
        | ErrorCode::SnapshotNotFound
        | ErrorCode::ApprovalNotFound => StatusCode::NOT_FOUND,
        ErrorCode::TargetVersionMismatch
        | ErrorCode::InvalidTransition
        | ErrorCode::ApprovalRequired
        | ErrorCode::ApprovalExpired
        | ErrorCode::ApprovalSignatureMismatch => StatusCode::CONFLICT,
        ErrorCode::CommandBlocked | ErrorCode::SmartFleetDisabled => StatusCode::FORBIDDEN,
        ErrorCode::PreflightFailed | ErrorCode::InstallFailed | ErrorCode::ReconcileFailed => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorCode::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (status_for(self.0.error), Json(self.0)).into_response()
    }
}

impl From<ApiError> for HttpError {
    fn from(error: ApiError) -> Self {
        Self(error)
    }
}

impl From<ErrorCode> for HttpError {
    fn from(code: ErrorCode) -> Self {
        Self(ApiError::new(code))
    }
}

pub fn bad_request(message: impl Into<String>) -> HttpError {
    HttpError(ApiError::with_message(ErrorCode::InvalidBody, message))
}

pub fn not_found(code: ErrorCode, message: impl Into<String>) -> HttpError {
    HttpError(ApiError::with_message(code, message))
}

pub fn internal() -> HttpError {
    HttpError(ApiError::new(ErrorCode::InternalServerError))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorCode::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorCode::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorCode::ApprovalRequired), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::TargetNotFound), StatusCode::NOT_FOUND);
    }
}
