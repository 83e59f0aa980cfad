//! Request identity and capability checks.
//!
//! Session handling lives in front of this service; it forwards the resolved
//! identity as `x-tenant-id`, `x-user-id`, and `x-user-role` headers.

use axum::http::HeaderMap;

use crate::limits::{MAX_REF_ID_LEN, is_valid_tenant_name};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";
pub const ROLE_HEADER: &str = "x-user-role";

/// Tenant used for every request when multi-tenancy is switched off.
pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Manager,
    Staff,
    Client,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Some(Role::Admin),
            "MANAGER" => Some(Role::Manager),
            "STAFF" | "TEAM_MEMBER" => Some(Role::Staff),
            "CLIENT" => Some(Role::Client),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    CreateServiceRequest,
    ReadAllServiceRequests,
}

/// Who is calling, and on behalf of which tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant_id: String,
    pub user_id: String,
    pub role: Role,
}

pub trait TenantContext: Send + Sync {
    /// `None` when tenant or actor identity is missing.
    fn resolve(&self, headers: &HeaderMap) -> Option<RequestContext>;
}

pub trait PermissionCheck: Send + Sync {
    fn allows(&self, role: Role, capability: Capability) -> bool;
}

/// Reads identity from forwarded headers.
#[derive(Debug, Clone)]
pub struct HeaderTenantContext {
    multi_tenancy: bool,
}

impl HeaderTenantContext {
    pub fn new(multi_tenancy: bool) -> Self {
        Self { multi_tenancy }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl TenantContext for HeaderTenantContext {
    fn resolve(&self, headers: &HeaderMap) -> Option<RequestContext> {
        let tenant_id = if self.multi_tenancy {
            header(headers, TENANT_HEADER)?.to_string()
        } else {
            DEFAULT_TENANT.to_string()
        };
        if !is_valid_tenant_name(&tenant_id) {
            return None;
        }
        let user_id = header(headers, USER_HEADER)?;
        if user_id.len() > MAX_REF_ID_LEN {
            return None;
        }
        let role = Role::parse(header(headers, ROLE_HEADER)?)?;
        Some(RequestContext {
            tenant_id,
            user_id: user_id.to_string(),
            role,
        })
    }
}

/// Static role table.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePermissions;

impl PermissionCheck for RolePermissions {
    fn allows(&self, role: Role, capability: Capability) -> bool {
        match capability {
            Capability::CreateServiceRequest => true,
            Capability::ReadAllServiceRequests => {
                matches!(role, Role::Admin | Role::Manager | Role::Staff)
            }
        }
    }
}
