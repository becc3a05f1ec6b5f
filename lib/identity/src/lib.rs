//! Federated identity for the campus portal.
//!
//! This crate implements the OAuth2/OIDC authorization-code sign-in with an
//! external identity provider, the lifecycle of the provider tokens it yields,
//! and the resolution of an external identity to exactly one local account.
//!
//! # Architecture
//!
//! - [`provider`]: the `IdentityProvider` seam and the provider registry
//! - [`store`]: `UserDirectory` and `LinkStore` persistence seams
//! - [`state`]: authorization state (CSRF, replay and PKCE)
//! - [`resolver`]: existing link, then verified email, then new account
//! - [`refresh`]: per-link single-flight token refresh
//! - [`session`]: local session tokens
//! - [`flow`]: the callback state machine and its driver
//! - [`links`]: unlink and link overview
//! - [`memory`]: in-process stores and a scripted provider

pub mod config;
pub mod error;
pub mod flow;
pub mod link;
pub mod links;
pub mod memory;
pub mod provider;
pub mod refresh;
pub mod resolver;
pub mod role;
pub mod session;
pub mod state;
pub mod store;
pub mod user;

pub use config::{ProviderConfig, ProviderConfigBuilder};
pub use error::{ProviderError, SsoError, StoreError};
pub use flow::{
    AuthorizationStart, CallbackOrchestrator, CallbackParams, Effect, FlowError, FlowEvent,
    FlowState, SignIn, transition,
};
pub use link::{LinkSummary, Provider, Secret, SsoLink, TokenSet};
pub use links::{LinkOverview, LinkService};
pub use provider::{ExternalIdentity, IdentityProvider, ProviderRegistry, TokenGrant};
pub use refresh::{FreshTokens, RefreshCoordinator};
pub use resolver::{AccountResolver, Resolution, UnverifiedEmailPolicy};
pub use role::{ParseRoleError, Role};
pub use session::{SessionClaims, SessionCredential, SessionIssuer};
pub use state::{AuthorizationState, StateCheck, StateStore};
pub use store::{AccountCreation, LinkRemoval, LinkStore, Upserted, UserDirectory};
pub use user::{NewUser, PasswordState, User, UserProfile, normalize_email};
