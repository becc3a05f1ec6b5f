//! Authentication extractors for Axum.

use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use campus_sso_core::UserId;
use campus_sso_identity::{SessionClaims, SsoError, User};
use std::str::FromStr;
use std::sync::Arc;

use super::AppState;
use crate::error::ApiError;

/// A caller holding a valid session for an active account.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: User,
    pub claims: SessionClaims,
}

impl AuthenticatedUser {
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user.id()
    }
}

/// Extractor for requiring an authenticated user.
///
/// Reads `Authorization: Bearer <session token>`, verifies the token and loads
/// the account it names.
pub struct RequireAuth(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for RequireAuth
where
    Arc<AppState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = Arc::<AppState>::from_ref(state);
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AuthRejection::NotAuthenticated)?;

        let claims = app_state
            .sessions
            .verify(bearer.token())
            .map_err(|_| AuthRejection::InvalidSession)?;
        let user_id = UserId::from_str(&claims.sub).map_err(|_| AuthRejection::InvalidSession)?;

        let user = app_state
            .users
            .find_user_by_id(user_id)
            .await
            .map_err(|e| AuthRejection::Internal(e.into()))?
            .ok_or(AuthRejection::InvalidSession)?;

        // Sessions outlive deactivation; the account is rechecked on every request.
        if !user.is_active() {
            return Err(AuthRejection::AccountInactive(user_id));
        }

        Ok(RequireAuth(AuthenticatedUser { user, claims }))
    }
}

/// Rejection type for authentication extractors.
#[derive(Debug)]
pub enum AuthRejection {
    NotAuthenticated,
    InvalidSession,
    AccountInactive(UserId),
    Internal(SsoError),
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let err = match self {
            Self::NotAuthenticated | Self::InvalidSession => SsoError::InvalidCredential,
            Self::AccountInactive(user_id) => SsoError::AccountInactive { user_id },
            Self::Internal(err) => err,
        };
        ApiError(err).into_response()
    }
}
