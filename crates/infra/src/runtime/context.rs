use serde::{Deserialize, Serialize};

use qcflow_core::{UserId, WorkspaceId};

/// Role of the session user inside one workspace.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl WorkspaceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceRole::Owner => "owner",
            WorkspaceRole::Admin => "admin",
            WorkspaceRole::Member => "member",
            WorkspaceRole::Viewer => "viewer",
        }
    }
}

impl core::fmt::Display for WorkspaceRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to `WorkspaceRuntimeFactory::create_runtime`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub role: WorkspaceRole,
}

impl Workspace {
    pub fn new(id: WorkspaceId, name: impl Into<String>, role: WorkspaceRole) -> Self {
        Self {
            id,
            name: name.into(),
            role,
        }
    }
}

/// Coarse capability flags derived from the session user's role.
///
/// Fine-grained permission matrices belong to the workflows; the core only
/// needs to know whether the user may originate events at all.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspacePermissions {
    pub can_read: bool,
    pub can_write: bool,
    pub can_manage_members: bool,
    pub can_delete_workspace: bool,
}

impl WorkspacePermissions {
    pub fn for_role(role: WorkspaceRole) -> Self {
        match role {
            WorkspaceRole::Owner => Self {
                can_read: true,
                can_write: true,
                can_manage_members: true,
                can_delete_workspace: true,
            },
            WorkspaceRole::Admin => Self {
                can_read: true,
                can_write: true,
                can_manage_members: true,
                can_delete_workspace: false,
            },
            WorkspaceRole::Member => Self {
                can_read: true,
                can_write: true,
                can_manage_members: false,
                can_delete_workspace: false,
            },
            WorkspaceRole::Viewer => Self {
                can_read: true,
                can_write: false,
                can_manage_members: false,
                can_delete_workspace: false,
            },
        }
    }
}

/// Access context of one runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceContext {
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub role: WorkspaceRole,
    /// Session user, stamped onto events that carry no actor.
    pub actor: Option<UserId>,
    pub permissions: WorkspacePermissions,
}

impl WorkspaceContext {
    pub fn new(workspace: &Workspace, actor: Option<UserId>) -> Self {
        Self {
            workspace_id: workspace.id.clone(),
            name: workspace.name.clone(),
            role: workspace.role,
            actor,
            permissions: WorkspacePermissions::for_role(workspace.role),
        }
    }
}
