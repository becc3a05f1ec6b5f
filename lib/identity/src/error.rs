//! Error types for the identity crate.
//!
//! - `SsoError`: the caller-facing taxonomy every public operation returns
//! - `ProviderError`: failures reported by an identity provider client
//! - `StoreError`: failures reported by a persistence backend
//!
//! Lower-level errors convert into `SsoError` so the callback flow can map
//! them onto its terminal states without inspecting strings.

use crate::link::Provider;
use campus_sso_core::UserId;
use std::fmt;

/// Errors surfaced by the federated identity subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsoError {
    /// The user declined (or the IdP refused) the authorization request.
    AuthorizationDenied { reason: Option<String> },
    /// The callback's `state` is unknown, expired, or bound to another browser.
    InvalidState,
    /// The authorization code or refresh token was rejected by the IdP.
    InvalidGrant { reason: String },
    /// Network failure, timeout or server error at the IdP.
    ProviderUnavailable { reason: String },
    /// The IdP rejected the access token presented to its userinfo endpoint.
    Unauthorized { reason: String },
    /// The IdP did not vouch for the asserted email address.
    EmailUnverified { email: String },
    /// The stored refresh token is dead; the user must sign in again.
    ReauthRequired { provider: Provider },
    /// No link exists for the requested provider.
    LinkNotFound { provider: Provider },
    /// The IdP response lacks a claim the resolver needs.
    MissingClaim { claim: String },
    /// The resolved local account is deactivated.
    AccountInactive { user_id: UserId },
    /// The local account already holds a link to a different identity at this provider.
    AccountAlreadyLinked { provider: Provider },
    /// Removing this link would leave the account without any way to sign in.
    LastLoginMethod { provider: Provider },
    /// The account was created through federation and has no local password.
    PasswordLoginDisabled,
    /// A password or session credential did not verify.
    InvalidCredential,
    /// The provider name is not configured.
    UnknownProvider { name: String },
    /// The persistence backend failed.
    Storage { reason: String },
    /// An internal invariant was broken.
    Internal { reason: String },
}

impl SsoError {
    /// Returns a stable machine-readable code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::InvalidState => "invalid_state",
            Self::InvalidGrant { .. } => "invalid_grant",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::Unauthorized { .. } => "unauthorized",
            Self::EmailUnverified { .. } => "email_unverified",
            Self::ReauthRequired { .. } => "reauth_required",
            Self::LinkNotFound { .. } => "link_not_found",
            Self::MissingClaim { .. } => "missing_claim",
            Self::AccountInactive { .. } => "account_inactive",
            Self::AccountAlreadyLinked { .. } => "account_already_linked",
            Self::LastLoginMethod { .. } => "last_login_method",
            Self::PasswordLoginDisabled => "password_login_disabled",
            Self::InvalidCredential => "invalid_credential",
            Self::UnknownProvider { .. } => "unknown_provider",
            Self::Storage { .. } => "storage_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Returns true if retrying the same step later may succeed.
    ///
    /// A retry never reuses a consumed authorization code; for callbacks the
    /// user has to restart the flow regardless.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. } | Self::Storage { .. }
        )
    }
}

impl fmt::Display for SsoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthorizationDenied { reason: Some(reason) } => {
                write!(f, "authorization denied: {reason}")
            }
            Self::AuthorizationDenied { reason: None } => write!(f, "authorization denied"),
            Self::InvalidState => write!(f, "authorization state is invalid or expired"),
            Self::InvalidGrant { reason } => write!(f, "invalid grant: {reason}"),
            Self::ProviderUnavailable { reason } => {
                write!(f, "identity provider unavailable: {reason}")
            }
            Self::Unauthorized { reason } => {
                write!(f, "access token rejected by provider: {reason}")
            }
            Self::EmailUnverified { email } => {
                write!(f, "email '{email}' is not verified by the provider")
            }
            Self::ReauthRequired { provider } => {
                write!(f, "{provider} link requires re-authorization")
            }
            Self::LinkNotFound { provider } => write!(f, "no {provider} link found"),
            Self::MissingClaim { claim } => write!(f, "missing required claim: {claim}"),
            Self::AccountInactive { user_id } => write!(f, "account {user_id} is inactive"),
            Self::AccountAlreadyLinked { provider } => {
                write!(f, "account is already linked to another {provider} identity")
            }
            Self::LastLoginMethod { provider } => {
                write!(f, "cannot unlink {provider}: it is the account's only sign-in method")
            }
            Self::PasswordLoginDisabled => {
                write!(f, "password login is disabled for this account")
            }
            Self::InvalidCredential => write!(f, "invalid credential"),
            Self::UnknownProvider { name } => write!(f, "unknown provider: {name}"),
            Self::Storage { reason } => write!(f, "storage error: {reason}"),
            Self::Internal { reason } => write!(f, "internal error: {reason}"),
        }
    }
}

impl std::error::Error for SsoError {}

/// Errors from identity provider calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Code or refresh token unknown, expired, reused, or revoked.
    InvalidGrant { reason: String },
    /// Access token rejected.
    Unauthorized { reason: String },
    /// Transport failure, timeout, or 5xx.
    Unavailable { reason: String },
    /// The provider answered with something we could not interpret.
    Protocol { reason: String },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGrant { reason } => write!(f, "invalid grant: {reason}"),
            Self::Unauthorized { reason } => write!(f, "unauthorized: {reason}"),
            Self::Unavailable { reason } => write!(f, "provider unavailable: {reason}"),
            Self::Protocol { reason } => write!(f, "provider protocol error: {reason}"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for SsoError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidGrant { reason } => Self::InvalidGrant { reason },
            ProviderError::Unauthorized { reason } => Self::Unauthorized { reason },
            ProviderError::Unavailable { reason } => Self::ProviderUnavailable { reason },
            ProviderError::Protocol { reason } => Self::ProviderUnavailable {
                reason: format!("malformed response: {reason}"),
            },
        }
    }
}

/// Errors from persistence backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    Conflict { reason: String },
    /// The target record does not exist.
    NotFound { entity: &'static str },
    /// The backend failed.
    Backend { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { reason } => write!(f, "conflicting write: {reason}"),
            Self::NotFound { entity } => write!(f, "{entity} not found"),
            Self::Backend { reason } => write!(f, "backend failure: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for SsoError {
    fn from(err: StoreError) -> Self {
        Self::Storage {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_from_provider_keeps_reason() {
        let err: SsoError = ProviderError::InvalidGrant {
            reason: "code already used".to_string(),
        }
        .into();
        assert_eq!(err.code(), "invalid_grant");
        assert!(err.to_string().contains("code already used"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn protocol_errors_surface_as_unavailable() {
        let err: SsoError = ProviderError::Protocol {
            reason: "not json".to_string(),
        }
        .into();
        assert_eq!(err.code(), "provider_unavailable");
        assert!(err.is_retryable());
    }

    #[test]
    fn reauth_is_distinct_from_transient_failure() {
        let reauth = SsoError::ReauthRequired {
            provider: Provider::Keycloak,
        };
        let transient = SsoError::ProviderUnavailable {
            reason: "timeout".to_string(),
        };
        assert_ne!(reauth.code(), transient.code());
        assert!(!reauth.is_retryable());
        assert!(transient.is_retryable());
    }

    #[test]
    fn store_error_becomes_storage() {
        let err: SsoError = StoreError::NotFound { entity: "sso link" }.into();
        assert_eq!(err.code(), "storage_error");
        assert!(err.to_string().contains("sso link not found"));
    }

    #[test]
    fn denied_display_includes_reason() {
        let err = SsoError::AuthorizationDenied {
            reason: Some("user cancelled".to_string()),
        };
        assert!(err.to_string().contains("user cancelled"));
    }
}
