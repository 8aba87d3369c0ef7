//! `costwise-core`: shared identifiers and the domain error model.
//!
//! This crate carries no infrastructure concerns. Every other crate in the
//! workspace depends on it for tenant identity.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::TenantId;

#[doc(hidden)]
pub mod __private {
    pub use uuid::Uuid;
}
