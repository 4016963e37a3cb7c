use std::sync::Arc;

use mediaflow_types::AttachedRole;
use tokio::sync::RwLock;

/// Roles whose prompts are appended to every submitted task, in attach order.
#[derive(Clone, Default)]
pub struct RoleBook {
    roles: Arc<RwLock<Vec<AttachedRole>>>,
}

impl RoleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a role with the same name is already attached.
    pub async fn attach(&self, role: AttachedRole) -> bool {
        let mut roles = self.roles.write().await;
        if roles.iter().any(|r| r.name == role.name) {
            return false;
        }
        roles.push(role);
        true
    }

    pub async fn detach(&self, name: &str) -> bool {
        let mut roles = self.roles.write().await;
        let before = roles.len();
        roles.retain(|r| r.name != name);
        roles.len() != before
    }

    pub async fn list(&self) -> Vec<AttachedRole> {
        self.roles.read().await.clone()
    }
}
