use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::info;

use super::{ServerStore, UserStore};
use crate::objects::server::{ServerRecord, ServerStatus};
use crate::objects::user::User;
use crate::{Error, Result};

const DB_NAME: &str = "hopper";

/// open the database named by the connection string (falling back to
/// "hopper") and bootstrap the unique indexes
pub async fn connect(uri: &str) -> Result<(MongoUserStore, MongoServerStore)> {
    let client = Client::with_uri_str(uri).await?;
    let db = client
        .default_database()
        .unwrap_or_else(|| client.database(DB_NAME));
    ensure_indexes(&db).await?;
    info!(db = db.name(), "connected to document store");
    Ok((
        MongoUserStore {
            users: db.collection("users"),
        },
        MongoServerStore {
            servers: db.collection("servers"),
        },
    ))
}

async fn ensure_indexes(db: &Database) -> Result<()> {
    let unique = |keys| {
        IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(true).build())
            .build()
    };
    db.collection::<User>("users")
        .create_index(unique(doc! { "email": 1 }))
        .await?;
    let servers = db.collection::<ServerRecord>("servers");
    servers.create_index(unique(doc! { "unique_id": 1 })).await?;
    servers.create_index(unique(doc! { "server_name": 1 })).await?;
    servers.create_index(unique(doc! { "folder_path": 1 })).await?;
    servers
        .create_index(IndexModel::builder().keys(doc! { "owner_email": 1 }).build())
        .await?;
    Ok(())
}

/// translate a duplicate-key write into the Conflict class
fn classify_write(e: mongodb::error::Error, what: &str) -> Error {
    use mongodb::error::{ErrorKind, WriteFailure};
    if let ErrorKind::Write(WriteFailure::WriteError(we)) = &*e.kind {
        if we.code == 11000 {
            return Error::Conflict(format!("{what} already exists"));
        }
    }
    Error::Database(e)
}

pub struct MongoUserStore {
    users: Collection<User>,
}

#[async_trait]
impl UserStore for MongoUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.to_ascii_lowercase();
        Ok(self
            .users
            .find_one(doc! { "email": &email, "deleted": { "$ne": true } })
            .await?)
    }

    async fn list(&self) -> Result<Vec<User>> {
        Ok(self
            .users
            .find(doc! { "deleted": { "$ne": true } })
            .await?
            .try_collect()
            .await?)
    }

    async fn upsert(&self, user: &User) -> Result<()> {
        user.validate_reservations()?;
        self.users
            .replace_one(doc! { "email": &user.email }, user)
            .upsert(true)
            .await
            .map_err(|e| classify_write(e, "user"))?;
        Ok(())
    }
}

pub struct MongoServerStore {
    servers: Collection<ServerRecord>,
}

#[async_trait]
impl ServerStore for MongoServerStore {
    async fn list(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.servers.find(doc! {}).await?.try_collect().await?)
    }

    async fn list_by_owner(&self, email: &str) -> Result<Vec<ServerRecord>> {
        Ok(self
            .servers
            .find(doc! { "owner_email": email })
            .await?
            .try_collect()
            .await?)
    }

    async fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<ServerRecord>> {
        Ok(self
            .servers
            .find_one(doc! { "unique_id": unique_id })
            .await?)
    }

    async fn find_by_name(&self, server_name: &str) -> Result<Option<ServerRecord>> {
        Ok(self
            .servers
            .find_one(doc! { "server_name": server_name })
            .await?)
    }

    async fn insert(&self, server: &ServerRecord) -> Result<()> {
        self.servers
            .insert_one(server)
            .await
            .map_err(|e| classify_write(e, "server"))?;
        Ok(())
    }

    async fn update(&self, server: &ServerRecord) -> Result<()> {
        let updated = self
            .servers
            .replace_one(doc! { "unique_id": &server.unique_id }, server)
            .await
            .map_err(|e| classify_write(e, "server"))?;
        if updated.matched_count == 0 {
            return Err(Error::NotFound(server.unique_id.clone()));
        }
        Ok(())
    }

    async fn set_status(
        &self,
        unique_id: &str,
        status: ServerStatus,
        is_online: bool,
    ) -> Result<()> {
        self.servers
            .update_one(
                doc! { "unique_id": unique_id },
                doc! { "$set": { "status": status.as_str(), "is_online": is_online } },
            )
            .await?;
        Ok(())
    }

    async fn set_dns_pending(&self, unique_id: &str, pending: bool) -> Result<()> {
        self.servers
            .update_one(
                doc! { "unique_id": unique_id },
                doc! { "$set": { "dns_pending": pending } },
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, unique_id: &str) -> Result<()> {
        self.servers
            .delete_one(doc! { "unique_id": unique_id })
            .await?;
        Ok(())
    }
}
