//! The authorization-code callback as an explicit state machine.
//!
//! ```text
//! Initiated ──callback──▶ CallbackReceived ──exchange──▶ Exchanged ──resolve──▶ Resolved ──sign──▶ SessionIssued
//!     │                        │                             │                      │
//!     ├─▶ Denied               └─▶ ExchangeFailed            └─▶ ResolutionFailed ◀─┘
//!     ├─▶ InvalidState
//!     └─▶ ExchangeFailed (replayed code)
//! ```
//!
//! [`transition`] is pure. [`CallbackOrchestrator`] performs the effect each
//! transition asks for and feeds the outcome back in as the next event.

use chrono::{Duration, Utc};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::SsoError;
use crate::link::{Provider, TokenSet};
use crate::provider::{ExternalIdentity, IdentityProvider, ProviderRegistry};
use crate::resolver::{AccountResolver, Resolution};
use crate::session::{SessionCredential, SessionIssuer};
use crate::state::{AuthorizationState, StateCheck, StateStore, code_fingerprint};
use crate::user::{User, UserProfile};

/// Successful end of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignIn {
    pub credential: SessionCredential,
    pub user: UserProfile,
}

/// Where a single callback flow stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Initiated {
        provider: Provider,
    },
    CallbackReceived {
        provider: Provider,
        code: String,
        pkce_verifier: String,
    },
    Exchanged {
        provider: Provider,
        tokens: TokenSet,
        identity: ExternalIdentity,
    },
    Resolved {
        resolution: Resolution,
    },
    SessionIssued {
        sign_in: SignIn,
    },
    Denied {
        reason: Option<String>,
    },
    InvalidState,
    ExchangeFailed {
        error: SsoError,
    },
    ResolutionFailed {
        error: SsoError,
    },
}

impl FlowState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initiated { .. } => "initiated",
            Self::CallbackReceived { .. } => "callback_received",
            Self::Exchanged { .. } => "exchanged",
            Self::Resolved { .. } => "resolved",
            Self::SessionIssued { .. } => "session_issued",
            Self::Denied { .. } => "denied",
            Self::InvalidState => "invalid_state",
            Self::ExchangeFailed { .. } => "exchange_failed",
            Self::ResolutionFailed { .. } => "resolution_failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SessionIssued { .. }
                | Self::Denied { .. }
                | Self::InvalidState
                | Self::ExchangeFailed { .. }
                | Self::ResolutionFailed { .. }
        )
    }

    /// The caller-facing error for an error terminal.
    #[must_use]
    pub fn error(&self) -> Option<SsoError> {
        match self {
            Self::Denied { reason } => Some(SsoError::AuthorizationDenied {
                reason: reason.clone(),
            }),
            Self::InvalidState => Some(SsoError::InvalidState),
            Self::ExchangeFailed { error } | Self::ResolutionFailed { error } => {
                Some(error.clone())
            }
            _ => None,
        }
    }
}

/// Inputs that move a flow forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// The IdP redirected back with `error=...`.
    ProviderDenied { reason: Option<String> },
    /// The IdP redirected back; `check` is the state store's verdict.
    CallbackArrived {
        code: Option<String>,
        check: StateCheck,
    },
    CodeExchanged(Result<(TokenSet, ExternalIdentity), SsoError>),
    AccountResolved(Result<Resolution, SsoError>),
    SessionSigned(Result<SessionCredential, SsoError>),
}

impl FlowEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::ProviderDenied { .. } => "provider_denied",
            Self::CallbackArrived { .. } => "callback_arrived",
            Self::CodeExchanged(_) => "code_exchanged",
            Self::AccountResolved(_) => "account_resolved",
            Self::SessionSigned(_) => "session_signed",
        }
    }
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Redeem the code and fetch the identity with the new access token.
    ExchangeCode { code: String, pkce_verifier: String },
    ResolveAccount {
        identity: ExternalIdentity,
        tokens: TokenSet,
    },
    IssueSession { user: User },
}

/// An event that the current state does not accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowError {
    pub state: &'static str,
    pub event: &'static str,
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event {} is not valid in state {}", self.event, self.state)
    }
}

impl std::error::Error for FlowError {}

/// Advances a flow by one event.
///
/// # Errors
///
/// Returns `FlowError` if `event` is not valid in `state`, including any event
/// delivered to a terminal state.
pub fn transition(state: FlowState, event: FlowEvent) -> Result<(FlowState, Effect), FlowError> {
    use FlowEvent as E;
    use FlowState as S;

    let next = match (state, event) {
        (S::Initiated { .. }, E::ProviderDenied { reason }) => (S::Denied { reason }, Effect::None),
        (S::Initiated { provider }, E::CallbackArrived { code, check }) => match (code, check) {
            (Some(code), StateCheck::Fresh(pending)) => {
                let pkce_verifier = pending.pkce_verifier().to_string();
                (
                    S::CallbackReceived {
                        provider,
                        code: code.clone(),
                        pkce_verifier: pkce_verifier.clone(),
                    },
                    Effect::ExchangeCode {
                        code,
                        pkce_verifier,
                    },
                )
            }
            (Some(_), StateCheck::Replayed) => (
                S::ExchangeFailed {
                    error: SsoError::InvalidGrant {
                        reason: "authorization code already used".to_string(),
                    },
                },
                Effect::None,
            ),
            _ => (S::InvalidState, Effect::None),
        },
        (S::CallbackReceived { provider, .. }, E::CodeExchanged(outcome)) => match outcome {
            Ok((tokens, identity)) => (
                S::Exchanged {
                    provider,
                    tokens: tokens.clone(),
                    identity: identity.clone(),
                },
                Effect::ResolveAccount { identity, tokens },
            ),
            Err(error) => (S::ExchangeFailed { error }, Effect::None),
        },
        (S::Exchanged { .. }, E::AccountResolved(outcome)) => match outcome {
            Ok(resolution) => {
                let user = resolution.user().clone();
                (S::Resolved { resolution }, Effect::IssueSession { user })
            }
            Err(error) => (S::ResolutionFailed { error }, Effect::None),
        },
        (S::Resolved { resolution }, E::SessionSigned(outcome)) => match outcome {
            Ok(credential) => (
                S::SessionIssued {
                    sign_in: SignIn {
                        credential,
                        user: resolution.user().profile(),
                    },
                },
                Effect::None,
            ),
            Err(error) => (S::ResolutionFailed { error }, Effect::None),
        },
        (state, event) => {
            return Err(FlowError {
                state: state.name(),
                event: event.name(),
            });
        }
    };
    Ok(next)
}

/// Query parameters of the IdP redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// The start of a flow: where to send the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationStart {
    pub auth_url: String,
    pub state: String,
}

/// Drives authorization flows end to end.
pub struct CallbackOrchestrator {
    providers: Arc<ProviderRegistry>,
    states: Arc<dyn StateStore>,
    resolver: AccountResolver,
    sessions: Arc<SessionIssuer>,
    state_ttl: Duration,
}

impl CallbackOrchestrator {
    #[must_use]
    pub fn new(
        providers: Arc<ProviderRegistry>,
        states: Arc<dyn StateStore>,
        resolver: AccountResolver,
        sessions: Arc<SessionIssuer>,
        state_ttl: Duration,
    ) -> Self {
        Self {
            providers,
            states,
            resolver,
            sessions,
            state_ttl,
        }
    }

    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Records a new authorization state bound to `binding` and returns the
    /// provider URL to redirect to.
    ///
    /// # Errors
    ///
    /// Returns `UnknownProvider` or `Storage`.
    #[instrument(skip_all, fields(provider = %provider))]
    pub async fn begin(
        &self,
        provider: Provider,
        binding: &str,
    ) -> Result<AuthorizationStart, SsoError> {
        let client = self.providers.get(provider)?;
        let pending = AuthorizationState::new(provider, binding.to_string(), self.state_ttl);
        let auth_url = client.authorization_url(pending.state(), pending.pkce_verifier());
        let state = pending.state().to_string();
        self.states.issue(pending).await?;

        info!("issued authorization state");
        Ok(AuthorizationStart { auth_url, state })
    }

    /// Completes a flow from the IdP's redirect.
    ///
    /// # Errors
    ///
    /// Returns the error of whichever terminal the flow ended in.
    #[instrument(skip_all, fields(provider = %provider))]
    pub async fn complete(
        &self,
        provider: Provider,
        binding: &str,
        params: CallbackParams,
    ) -> Result<SignIn, SsoError> {
        let client = self.providers.get(provider)?;

        let mut event = if let Some(error) = params.error {
            FlowEvent::ProviderDenied {
                reason: params.error_description.or(Some(error)),
            }
        } else {
            let check = match (&params.code, &params.state) {
                (Some(code), Some(state)) => {
                    self.states
                        .consume(state, binding, provider, &code_fingerprint(code))
                        .await?
                }
                _ => StateCheck::Invalid,
            };
            FlowEvent::CallbackArrived {
                code: params.code,
                check,
            }
        };

        let mut state = FlowState::Initiated { provider };
        loop {
            let (next, effect) = transition(state, event).map_err(|e| SsoError::Internal {
                reason: e.to_string(),
            })?;
            state = next;
            event = match effect {
                Effect::None => break,
                Effect::ExchangeCode {
                    code,
                    pkce_verifier,
                } => FlowEvent::CodeExchanged(exchange(client.as_ref(), &code, &pkce_verifier).await),
                Effect::ResolveAccount { identity, tokens } => FlowEvent::AccountResolved(
                    self.resolver.resolve(provider, &identity, tokens).await,
                ),
                Effect::IssueSession { user } => FlowEvent::SessionSigned(self.sessions.issue(&user)),
            };
        }

        match state {
            FlowState::SessionIssued { sign_in } => {
                info!(user_id = %sign_in.user.id, "sign-in complete");
                Ok(sign_in)
            }
            terminal => {
                let error = terminal.error().unwrap_or_else(|| SsoError::Internal {
                    reason: format!("flow stopped in state {}", terminal.name()),
                });
                warn!(terminal = terminal.name(), code = error.code(), "sign-in failed");
                Err(error)
            }
        }
    }
}

async fn exchange(
    client: &dyn IdentityProvider,
    code: &str,
    pkce_verifier: &str,
) -> Result<(TokenSet, ExternalIdentity), SsoError> {
    let requested_at = Utc::now();
    let grant = client.exchange_code(code, pkce_verifier).await?;
    let tokens = TokenSet::from_grant(grant, requested_at, None);
    let identity = client.fetch_identity(tokens.access_token()).await?;
    Ok((tokens, identity))
}
