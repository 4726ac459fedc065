use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Stable, caller-observable error kinds. Everything else travels as
/// `Internal` with the wrapped cause attached.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device not found")]
    DevNotFound,
    #[error("group not found")]
    GroupNotFound,
    #[error("device with specified ID already exists")]
    DuplicatedDeviceId,
    #[error("attribute name cannot be empty")]
    NoAttrName,
    #[error("ETag does not match")]
    ETagDoesNotMatch,
    #[error("the number of attributes in the scope is above the limit")]
    TooManyAttributes,
    #[error("device or attribute not found")]
    DevOrAttrNotFound,
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::ValidationFailed(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::DevNotFound | Error::GroupNotFound | Error::DevOrAttrNotFound => {
                StatusCode::NOT_FOUND
            }
            Error::DuplicatedDeviceId | Error::ETagDoesNotMatch | Error::Conflict(_) => {
                StatusCode::CONFLICT
            }
            Error::NoAttrName | Error::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            Error::TooManyAttributes => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self:?}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(e: mongodb::error::Error) -> Self {
        Error::Internal(anyhow::Error::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::DevNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::ETagDoesNotMatch.status(), StatusCode::CONFLICT);
        assert_eq!(Error::DuplicatedDeviceId.status(), StatusCode::CONFLICT);
        assert_eq!(Error::TooManyAttributes.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            Error::validation("bad per_page").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
