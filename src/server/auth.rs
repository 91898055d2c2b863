use std::collections::HashMap;

use crate::config::AuthConfig;
use crate::error::GatewayError;

/// A workspace identity resolved from a bearer token, with the permissions
/// the limiter core cares about. Credential issuance and full RBAC live in
/// the key-management surface; this node only maps tokens it was configured
/// with.
#[derive(Debug, Clone)]
pub struct Principal {
    pub workspace_id: String,
    pub create_namespace: bool,
    pub manage_overrides: bool,
}

pub struct Authorizer {
    tokens: HashMap<String, Principal>,
}

impl Authorizer {
    pub fn from_config(cfg: &AuthConfig) -> Self {
        let tokens = cfg
            .tokens
            .iter()
            .map(|t| {
                (
                    t.token.clone(),
                    Principal {
                        workspace_id: t.workspace_id.clone(),
                        create_namespace: t.create_namespace,
                        manage_overrides: t.manage_overrides,
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    /// Resolve an `Authorization` header value to a principal.
    pub fn authorize(&self, header: Option<&str>) -> Result<Principal, GatewayError> {
        let header = header.ok_or(GatewayError::Unauthorized)?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or(GatewayError::Unauthorized)?;
        self.tokens
            .get(token.trim())
            .cloned()
            .ok_or(GatewayError::Unauthorized)
    }
}
