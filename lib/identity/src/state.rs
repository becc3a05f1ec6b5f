//! Authorization state: CSRF and replay protection for the callback.
//!
//! Every authorization flow gets a random `state` bound to the browser that
//! started it (the `binding` nonce from its cookie) and to a PKCE verifier.
//! The callback must present the same state from the same browser before the
//! expiry. The first callback records a fingerprint of its authorization code;
//! a repeat of that exact callback is reported as a replay so the flow can fail
//! with `InvalidGrant` without spending another round trip at the IdP. Replays
//! are recognized past the expiry for as long as the consumed state is retained.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::StoreError;
use crate::link::Provider;

/// Generates a random `state` parameter (16 random bytes, base64url).
#[must_use]
pub fn generate_state() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generates a browser binding nonce (32 random bytes, base64url).
#[must_use]
pub fn generate_binding() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generates a PKCE code verifier: 64 URL-safe characters.
#[must_use]
pub fn generate_code_verifier() -> String {
    let random_bytes: [u8; 48] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Computes the S256 code challenge: `BASE64URL(SHA256(verifier))`.
#[must_use]
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Fingerprints an authorization code so the raw code is never stored.
#[must_use]
pub fn code_fingerprint(code: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(code.as_bytes()))
}

/// Hours a consumed state is kept past its expiry before it can be purged.
pub const REPLAY_RETENTION_HOURS: i64 = 24;

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// A pending authorization request.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationState {
    state: String,
    provider: Provider,
    binding: String,
    pkce_verifier: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    consumed_code: Option<String>,
}

impl AuthorizationState {
    /// Starts a new flow for `provider` bound to the browser's `binding` nonce.
    #[must_use]
    pub fn new(provider: Provider, binding: String, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            state: generate_state(),
            provider,
            binding,
            pkce_verifier: generate_code_verifier(),
            created_at: now,
            expires_at: now + ttl,
            consumed_code: None,
        }
    }

    /// Creates a state with all fields specified, for reconstitution from storage.
    #[must_use]
    pub fn with_all_fields(
        state: String,
        provider: Provider,
        binding: String,
        pkce_verifier: String,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        consumed_code: Option<String>,
    ) -> Self {
        Self {
            state,
            provider,
            binding,
            pkce_verifier,
            created_at,
            expires_at,
            consumed_code,
        }
    }

    #[must_use]
    pub fn state(&self) -> &str {
        &self.state
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.provider
    }

    #[must_use]
    pub fn binding(&self) -> &str {
        &self.binding
    }

    #[must_use]
    pub fn pkce_verifier(&self) -> &str {
        &self.pkce_verifier
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Fingerprint of the code that consumed this state, if any.
    #[must_use]
    pub fn consumed_code(&self) -> Option<&str> {
        self.consumed_code.as_deref()
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True once the state can be deleted: unconsumed and expired, or consumed
    /// and past the replay retention window.
    #[must_use]
    pub fn is_purgeable(&self, now: DateTime<Utc>) -> bool {
        match self.consumed_code {
            None => self.is_expired(now),
            Some(_) => now >= self.expires_at + Duration::hours(REPLAY_RETENTION_HOURS),
        }
    }

    /// Decides what a callback presenting this state means, recording the
    /// code fingerprint on first use. Stores call this under their own lock
    /// or row lock and persist `consumed_code` when the result is `Fresh`.
    ///
    /// A repeat of the consuming callback is `Replayed` even after expiry.
    pub fn check(
        &mut self,
        binding: &str,
        provider: Provider,
        code_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> StateCheck {
        if self.provider != provider || !constant_time_eq(&self.binding, binding) {
            return StateCheck::Invalid;
        }

        match &self.consumed_code {
            Some(previous) if constant_time_eq(previous, code_fingerprint) => {
                StateCheck::Replayed
            }
            Some(_) => StateCheck::Invalid,
            None if self.is_expired(now) => StateCheck::Invalid,
            None => {
                self.consumed_code = Some(code_fingerprint.to_string());
                StateCheck::Fresh(self.clone())
            }
        }
    }
}

impl std::fmt::Debug for AuthorizationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationState")
            .field("provider", &self.provider)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("consumed", &self.consumed_code.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of presenting a state at the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateCheck {
    /// First valid use. Carries the PKCE verifier for the exchange.
    Fresh(AuthorizationState),
    /// The same state and code were already consumed.
    Replayed,
    /// Unknown, expired, bound to another browser or provider, or reused with a different code.
    Invalid,
}

/// Server-side storage for pending authorization states.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn issue(&self, state: AuthorizationState) -> Result<(), StoreError>;

    /// Atomically checks and consumes `state`. See [`AuthorizationState::check`].
    async fn consume(
        &self,
        state: &str,
        binding: &str,
        provider: Provider,
        code_fingerprint: &str,
    ) -> Result<StateCheck, StoreError>;

    /// Removes expired states and returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}
