//! HTTP mapping for identity errors.
//!
//! Every handler returns `Result<_, ApiError>`. The body is always
//! `{ "error": <code>, "message": <text> }`; backend details are logged and
//! replaced by a generic message.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use campus_sso_identity::SsoError;
use serde_json::json;

/// An identity error on its way to the client.
#[derive(Debug)]
pub struct ApiError(pub SsoError);

impl From<SsoError> for ApiError {
    fn from(err: SsoError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// HTTP status for the error kind.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SsoError::InvalidState | SsoError::InvalidGrant { .. } => StatusCode::BAD_REQUEST,
            SsoError::ReauthRequired { .. } | SsoError::InvalidCredential => {
                StatusCode::UNAUTHORIZED
            }
            SsoError::AuthorizationDenied { .. }
            | SsoError::EmailUnverified { .. }
            | SsoError::AccountInactive { .. }
            | SsoError::PasswordLoginDisabled => StatusCode::FORBIDDEN,
            SsoError::LinkNotFound { .. } | SsoError::UnknownProvider { .. } => {
                StatusCode::NOT_FOUND
            }
            SsoError::AccountAlreadyLinked { .. } | SsoError::LastLoginMethod { .. } => {
                StatusCode::CONFLICT
            }
            SsoError::Unauthorized { .. } | SsoError::MissingClaim { .. } => {
                StatusCode::BAD_GATEWAY
            }
            SsoError::ProviderUnavailable { .. } | SsoError::Storage { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SsoError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.0.code()
    }

    fn public_message(&self) -> String {
        match &self.0 {
            SsoError::Storage { reason } | SsoError::Internal { reason } => {
                tracing::error!(code = self.code(), %reason, "request failed");
                "internal error".to_string()
            }
            SsoError::ProviderUnavailable { reason } | SsoError::Unauthorized { reason } => {
                tracing::warn!(code = self.code(), %reason, "identity provider call failed");
                "the identity provider could not complete the request".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": self.code(),
            "message": self.public_message(),
        });
        (status, Json(body)).into_response()
    }
}
