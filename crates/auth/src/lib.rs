//! `costwise-auth`: request identity at the HTTP boundary.
//!
//! Tokens are verified here and turned into claims; the API layer derives the
//! tenant context from those claims only. This crate knows nothing about
//! HTTP or storage.

pub mod claims;
pub mod jwt;
pub mod principal;
pub mod roles;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use principal::PrincipalId;
pub use roles::Role;
