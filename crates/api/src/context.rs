//! Per-request identity, inserted by the auth middleware.

use costwise_auth::{JwtClaims, PrincipalId, Role};
use costwise_core::TenantId;

/// The tenant every job route operates on.
///
/// Only ever derived from a verified token; request bodies and query strings
/// cannot name a tenant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal_id: PrincipalId,
    roles: Vec<Role>,
}

impl PrincipalContext {
    pub fn principal_id(&self) -> PrincipalId {
        self.principal_id
    }

    /// Admins may trigger manual batch runs.
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role.as_str() == Role::ADMIN)
    }
}

/// Split verified claims into the two request extensions.
pub fn from_claims(claims: JwtClaims) -> (TenantContext, PrincipalContext) {
    (
        TenantContext {
            tenant_id: claims.tenant_id,
        },
        PrincipalContext {
            principal_id: claims.sub,
            roles: claims.roles,
        },
    )
}
