//! Local user accounts.
//!
//! A `User` may exist with zero, one, or several SSO links. Accounts created
//! through federation carry `PasswordState::Unusable`, which makes every
//! password login attempt fail explicitly rather than compare against an
//! empty hash.

use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use campus_sso_core::UserId;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::error::SsoError;
use crate::role::Role;

/// Normalizes an email address for lookup and storage.
#[must_use]
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Local password state of an account.
#[derive(Clone, PartialEq, Eq)]
pub enum PasswordState {
    /// An argon2 PHC-format hash.
    Set { hash: String },
    /// Password login is disabled for this account.
    Unusable,
}

impl PasswordState {
    /// Hashes a plaintext password with argon2 and a random salt.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredential` for an empty password and `Internal` if
    /// hashing fails.
    pub fn hash(password: &str) -> Result<Self, SsoError> {
        if password.is_empty() {
            return Err(SsoError::InvalidCredential);
        }
        let salt_bytes: [u8; 16] = rand::rng().random();
        let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| SsoError::Internal {
            reason: format!("salt encoding failed: {e}"),
        })?;
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| SsoError::Internal {
                reason: format!("password hashing failed: {e}"),
            })?
            .to_string();
        Ok(Self::Set { hash })
    }

    /// Returns true if a password login can ever succeed.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Set { .. })
    }

    /// Returns the stored hash, if any.
    #[must_use]
    pub fn hash_str(&self) -> Option<&str> {
        match self {
            Self::Set { hash } => Some(hash),
            Self::Unusable => None,
        }
    }
}

impl std::fmt::Debug for PasswordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Set { .. } => f.write_str("PasswordState::Set(..)"),
            Self::Unusable => f.write_str("PasswordState::Unusable"),
        }
    }
}

/// Profile fields taken from the IdP when a federated account is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewUser {
    /// Email address (normalized on construction of the `User`).
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar: Option<String>,
}

/// A local portal account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    id: UserId,
    email: String,
    role: Role,
    first_name: Option<String>,
    last_name: Option<String>,
    avatar: Option<String>,
    active: bool,
    password: PasswordState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl User {
    /// Creates an account for a federated identity.
    ///
    /// The account is active, has the least-privileged role, and cannot be
    /// used for password login.
    #[must_use]
    pub fn federated(fields: NewUser) -> Self {
        let now = Utc::now();
        Self {
            id: UserId::new(),
            email: normalize_email(&fields.email),
            role: Role::default(),
            first_name: fields.first_name,
            last_name: fields.last_name,
            avatar: fields.avatar,
            active: true,
            password: PasswordState::Unusable,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a user with all fields specified.
    ///
    /// Use this when reconstituting a user from storage.
    #[must_use]
    #[expect(clippy::too_many_arguments)]
    pub fn with_all_fields(
        id: UserId,
        email: String,
        role: Role,
        first_name: Option<String>,
        last_name: Option<String>,
        avatar: Option<String>,
        active: bool,
        password: PasswordState,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            email,
            role,
            first_name,
            last_name,
            avatar,
            active,
            password,
            created_at,
            updated_at,
        }
    }

    #[must_use]
    pub fn id(&self) -> UserId {
        self.id
    }

    /// Returns the normalized email address.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn first_name(&self) -> Option<&str> {
        self.first_name.as_deref()
    }

    #[must_use]
    pub fn last_name(&self) -> Option<&str> {
        self.last_name.as_deref()
    }

    #[must_use]
    pub fn avatar(&self) -> Option<&str> {
        self.avatar.as_deref()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn password(&self) -> &PasswordState {
        &self.password
    }

    #[must_use]
    pub fn has_usable_password(&self) -> bool {
        self.password.is_usable()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Sets the account's password.
    pub fn set_password(&mut self, password: PasswordState) {
        self.password = password;
        self.updated_at = Utc::now();
    }

    /// Activates or deactivates the account.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        self.updated_at = Utc::now();
    }

    /// Verifies a password login attempt.
    ///
    /// # Errors
    ///
    /// - `PasswordLoginDisabled` if the account has no usable password,
    ///   whatever the candidate is
    /// - `InvalidCredential` for an empty candidate or a mismatch
    pub fn check_password(&self, candidate: &str) -> Result<(), SsoError> {
        let hash = match &self.password {
            PasswordState::Unusable => return Err(SsoError::PasswordLoginDisabled),
            PasswordState::Set { hash } => hash,
        };
        if candidate.is_empty() {
            return Err(SsoError::InvalidCredential);
        }
        let parsed = PasswordHash::new(hash).map_err(|_| SsoError::InvalidCredential)?;
        Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .map_err(|_| SsoError::InvalidCredential)
    }

    /// Returns the public projection returned to API callers.
    #[must_use]
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            role: self.role,
            avatar: self.avatar.clone(),
        }
    }
}

/// User fields exposed in API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
    pub avatar: Option<String>,
}
