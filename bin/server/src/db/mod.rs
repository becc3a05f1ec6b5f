//! PostgreSQL repositories for the SSO subsystem.
//!
//! - [`PgIdentityStore`]: users and SSO links
//! - [`PgStateStore`]: pending authorization states

pub mod identity;
pub mod state;

pub use identity::PgIdentityStore;
pub use state::PgStateStore;
