//! Session permission collaborator interface.
//!
//! Authorization is owned by an external service; the HTTP layer only asks
//! these two questions and maps `false` to 403.

use async_trait::async_trait;

/// Session access contract.
#[async_trait]
pub trait PermissionService: Send + Sync {
    /// May this user read and post in the session?
    async fn can_access(&self, user_id: Option<&str>, session_id: i64) -> bool;

    /// May this user perform narrator/admin actions in the session?
    async fn can_manage(&self, user_id: Option<&str>, session_id: i64) -> bool;
}

/// Permissive implementation for development and tests.
pub struct AllowAll;

#[async_trait]
impl PermissionService for AllowAll {
    async fn can_access(&self, _user_id: Option<&str>, _session_id: i64) -> bool {
        true
    }

    async fn can_manage(&self, _user_id: Option<&str>, _session_id: i64) -> bool {
        true
    }
}
