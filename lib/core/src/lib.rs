//! Core domain types and utilities for campus-sso.
//!
//! This crate provides the identifier types and the error-handling
//! foundation shared by the identity library and the server.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ParseIdError, SsoLinkId, UserId};
