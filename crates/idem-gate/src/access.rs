//! Caller resolution and permission checks.
//!
//! The gate does not know how tenants, actors or roles are modelled. It asks an
//! [`AccessControl`] implementation who is calling and whether that caller
//! holds the permissions an operation requires.

use std::collections::BTreeSet;

use async_trait::async_trait;
use axum::http::HeaderMap;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ACTOR_HEADER: &str = "x-actor-id";
pub const PERMISSIONS_HEADER: &str = "x-permissions";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub tenant_id: String,
    pub actor_id: Option<String>,
    pub permissions: BTreeSet<String>,
}

#[async_trait]
pub trait AccessControl: Send + Sync {
    /// `None` when the request carries no usable identity.
    async fn caller(&self, headers: &HeaderMap) -> Option<Caller>;

    async fn authorize(&self, caller: &Caller, required: &BTreeSet<String>) -> bool;
}

/// Trusts identity headers set by an upstream authenticating proxy.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderAccessControl;

#[async_trait]
impl AccessControl for HeaderAccessControl {
    async fn caller(&self, headers: &HeaderMap) -> Option<Caller> {
        let tenant_id = header_str(headers, TENANT_HEADER)?.to_string();
        let actor_id = header_str(headers, ACTOR_HEADER).map(str::to_string);
        let permissions = header_str(headers, PERMISSIONS_HEADER)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Caller {
            tenant_id,
            actor_id,
            permissions,
        })
    }

    async fn authorize(&self, caller: &Caller, required: &BTreeSet<String>) -> bool {
        required.is_subset(&caller.permissions)
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
