//! campus-sso HTTP server.
//!
//! Wires the federated identity library to PostgreSQL storage, real OAuth2/OIDC
//! providers, and an axum router.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
