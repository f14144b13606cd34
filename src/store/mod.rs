use async_trait::async_trait;

use crate::objects::server::{ServerRecord, ServerStatus};
use crate::objects::user::User;
use crate::Result;

pub mod mongo;

/// repository over the `users` collection
#[async_trait]
pub trait UserStore: Send + Sync {
    /// lookups are by lowercased email and exclude soft-deleted users
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn list(&self) -> Result<Vec<User>>;
    async fn upsert(&self, user: &User) -> Result<()>;
}

/// repository over the `servers` collection; the row is the source of truth
/// for a server's existence
#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn list(&self) -> Result<Vec<ServerRecord>>;
    async fn list_by_owner(&self, email: &str) -> Result<Vec<ServerRecord>>;
    async fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<ServerRecord>>;
    async fn find_by_name(&self, server_name: &str) -> Result<Option<ServerRecord>>;
    /// fails with a Conflict on any uniqueness violation
    async fn insert(&self, server: &ServerRecord) -> Result<()>;
    async fn update(&self, server: &ServerRecord) -> Result<()>;
    async fn set_status(
        &self,
        unique_id: &str,
        status: ServerStatus,
        is_online: bool,
    ) -> Result<()>;
    async fn set_dns_pending(&self, unique_id: &str, pending: bool) -> Result<()>;
    async fn delete(&self, unique_id: &str) -> Result<()>;
}
