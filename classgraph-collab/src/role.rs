//! Project roles and the mutation gate.
//!
//! Roles come from an external membership service. The gate is fail-closed:
//! a user the service does not know resolves to the store's default role,
//! which is [`Role::Viewer`] unless configured otherwise.

use std::collections::HashMap;
use std::sync::RwLock;

use classgraph_core::MutationKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::Member;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn can_mutate(self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Some(Role::Owner),
            "editor" => Some(Role::Editor),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that `role` may originate a mutation of `kind`.
///
/// Every mutation kind changes shared state, snapshots included, so the
/// check is the same for all of them. The kind is carried into the error.
pub fn authorize(role: Role, kind: MutationKind) -> Result<(), SyncError> {
    if role.can_mutate() {
        Ok(())
    } else {
        Err(SyncError::Authorization { role, kind })
    }
}

/// Boundary to the service that owns project membership.
pub trait MembershipService: Send + Sync {
    fn resolve_role(&self, project_id: Uuid, user_id: Uuid) -> Role;

    fn list_members(&self, project_id: Uuid) -> Vec<Member>;
}

/// In-process membership table.
pub struct StaticMembership {
    grants: RwLock<HashMap<Uuid, HashMap<Uuid, Role>>>,
    default_role: Role,
}

impl StaticMembership {
    pub fn new(default_role: Role) -> Self {
        Self {
            grants: RwLock::new(HashMap::new()),
            default_role,
        }
    }

    pub fn default_role(&self) -> Role {
        self.default_role
    }

    pub fn grant(&self, project_id: Uuid, user_id: Uuid, role: Role) {
        let mut grants = self.grants.write().unwrap_or_else(|e| e.into_inner());
        grants.entry(project_id).or_default().insert(user_id, role);
    }

    pub fn revoke(&self, project_id: Uuid, user_id: Uuid) -> Option<Role> {
        let mut grants = self.grants.write().unwrap_or_else(|e| e.into_inner());
        grants.get_mut(&project_id)?.remove(&user_id)
    }
}

impl Default for StaticMembership {
    fn default() -> Self {
        Self::new(Role::Viewer)
    }
}

impl MembershipService for StaticMembership {
    fn resolve_role(&self, project_id: Uuid, user_id: Uuid) -> Role {
        let grants = self.grants.read().unwrap_or_else(|e| e.into_inner());
        grants
            .get(&project_id)
            .and_then(|members| members.get(&user_id))
            .copied()
            .unwrap_or(self.default_role)
    }

    fn list_members(&self, project_id: Uuid) -> Vec<Member> {
        let grants = self.grants.read().unwrap_or_else(|e| e.into_inner());
        let mut members: Vec<Member> = grants
            .get(&project_id)
            .map(|m| {
                m.iter()
                    .map(|(&user_id, &role)| Member { user_id, role })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by_key(|m| m.user_id);
        members
    }
}
