//! Local session credentials.
//!
//! A session is an HS256 JWT naming the local user. Its lifetime is
//! independent of the provider's tokens: a provider refresh neither extends
//! nor shortens it.

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SsoError;
use crate::role::Role;
use crate::user::User;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// The local user ID, in `usr_` display form.
    pub sub: String,
    pub email: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl SessionClaims {
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A signed session token and the claims inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredential {
    pub token: String,
    pub claims: SessionClaims,
}

/// Signs and verifies session tokens.
pub struct SessionIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    lifetime: Duration,
}

impl SessionIssuer {
    #[must_use]
    pub fn new(secret: &[u8], issuer: impl Into<String>, lifetime: Duration) -> Self {
        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "sub"]);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer,
            lifetime,
        }
    }

    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Issues a session for a resolved user.
    ///
    /// # Errors
    ///
    /// Returns `AccountInactive` for deactivated users and `Internal` if
    /// signing fails.
    pub fn issue(&self, user: &User) -> Result<SessionCredential, SsoError> {
        if !user.is_active() {
            return Err(SsoError::AccountInactive { user_id: user.id() });
        }

        let now = Utc::now();
        let claims = SessionClaims {
            sub: user.id().to_string(),
            email: user.email().to_string(),
            role: user.role(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(
            |e| SsoError::Internal {
                reason: format!("session signing failed: {e}"),
            },
        )?;

        Ok(SessionCredential { token, claims })
    }

    /// Verifies a session token's signature, issuer and expiry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredential` for any token that does not verify.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, SsoError> {
        decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "session token rejected");
                SsoError::InvalidCredential
            })
    }
}

impl fmt::Debug for SessionIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIssuer")
            .field("issuer", &self.issuer)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}
