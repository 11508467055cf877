use axum::{
    http::{header::WWW_AUTHENTICATE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Provider(String),
    #[error("{0}")]
    Internal(String),
}

/// Error body shape: `{"detail": "..."}`.
#[derive(Debug, Serialize)]
struct ErrorDetail {
    detail: String,
}

impl From<AuthError> for AppError {
    fn from(error: AuthError) -> Self {
        AppError::Unauthorized(error.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(message) => {
                let mut response = make_error_response(StatusCode::UNAUTHORIZED, message);
                response
                    .headers_mut()
                    .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            AppError::Validation(message) => {
                make_error_response(StatusCode::UNPROCESSABLE_ENTITY, message)
            }
            AppError::Provider(message) | AppError::Internal(message) => {
                make_error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

fn make_error_response(status: StatusCode, detail: String) -> Response {
    (status, Json(ErrorDetail { detail })).into_response()
}
