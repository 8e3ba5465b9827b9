//! redb-backed metadata store.
//!
//! Each oid maps to a single record whose `existing` flag is flipped in place
//! on commit. Registration and commit each run inside one write transaction,
//! so racing `put` calls for the same oid converge on one record.

mod db;
mod tables;

pub use db::{Database, DatabaseError};

use async_trait::async_trait;
use std::path::Path;
use std::sync::RwLock;

use super::auth::{hash_password_blocking, Authenticator, PasswordTable};
use super::{
    closed_error, require_name, MetaError, MetaStore, NotFound, Object, Project, RequestVars,
    User,
};

pub struct EmbeddedMetaStore {
    db: RwLock<Option<Database>>,
    auth: Authenticator,
}

impl EmbeddedMetaStore {
    pub fn open<P: AsRef<Path>>(data_dir: P, auth: Authenticator) -> Result<Self, MetaError> {
        let db = Database::open(data_dir)?;
        Ok(Self {
            db: RwLock::new(Some(db)),
            auth,
        })
    }

    fn db(&self) -> Result<Database, MetaError> {
        self.db
            .read()
            .map_err(|_| MetaError::backend("database lock poisoned"))?
            .clone()
            .ok_or_else(closed_error)
    }

    async fn authorize(&self, rv: &RequestVars) -> Result<(), MetaError> {
        self.auth.authorize(&rv.authorization, self).await
    }

    fn find(&self, oid: &str) -> Result<Object, MetaError> {
        self.db()?
            .get_object(oid)?
            .ok_or_else(|| MetaError::NotFound(NotFound::Object(oid.to_string())))
    }
}

#[async_trait]
impl PasswordTable for EmbeddedMetaStore {
    async fn password_hash(&self, user: &str) -> Result<Option<String>, MetaError> {
        Ok(self.db()?.get_password_hash(user)?)
    }
}

#[async_trait]
impl MetaStore for EmbeddedMetaStore {
    async fn get(&self, rv: &RequestVars) -> Result<Object, MetaError> {
        self.authorize(rv).await?;
        let object = self.find(&rv.oid)?;
        if !object.existing {
            return Err(MetaError::NotFound(NotFound::Pending(rv.oid.clone())));
        }
        Ok(object)
    }

    async fn get_pending(&self, rv: &RequestVars) -> Result<Object, MetaError> {
        self.authorize(rv).await?;
        self.find(&rv.oid)
    }

    async fn put(&self, rv: &RequestVars) -> Result<Object, MetaError> {
        self.authorize(rv).await?;
        rv.validate()?;

        let object = self.db()?.register_object(&rv.pending_object())?;
        tracing::debug!(
            oid = %object.oid,
            repo = %rv.repo,
            existing = object.existing,
            "Registered object"
        );
        Ok(object)
    }

    async fn commit(&self, rv: &RequestVars) -> Result<Object, MetaError> {
        self.authorize(rv).await?;
        let object = self
            .db()?
            .commit_object(&rv.oid)?
            .ok_or_else(|| MetaError::NotFound(NotFound::Object(rv.oid.clone())))?;
        tracing::debug!(oid = %object.oid, "Committed object");
        Ok(object)
    }

    async fn add_user(&self, name: &str, password: &str) -> Result<(), MetaError> {
        self.auth.ensure_user_management()?;
        require_name("user", name)?;

        let db = self.db()?;
        if db.get_password_hash(name)?.is_some() {
            return Ok(());
        }
        let hash = hash_password_blocking(password).await?;
        if db.put_user_if_absent(name, &hash)? {
            tracing::info!(user = name, "Added user");
        }
        Ok(())
    }

    async fn delete_user(&self, name: &str) -> Result<(), MetaError> {
        self.auth.ensure_user_management()?;
        if self.db()?.delete_user(name)? {
            tracing::info!(user = name, "Deleted user");
        }
        Ok(())
    }

    async fn users(&self) -> Result<Vec<User>, MetaError> {
        self.auth.ensure_user_management()?;
        let names = self.db()?.get_all_users()?;
        Ok(names.into_iter().map(|name| User { name }).collect())
    }

    async fn add_project(&self, name: &str) -> Result<(), MetaError> {
        require_name("project", name)?;
        if self.db()?.put_project(name)? {
            tracing::info!(project = name, "Added project");
        }
        Ok(())
    }

    async fn projects(&self) -> Result<Vec<Project>, MetaError> {
        Ok(self.db()?.get_all_projects()?)
    }

    async fn objects(&self) -> Result<Vec<Object>, MetaError> {
        let objects = self.db()?.get_all_objects()?;
        Ok(objects.into_iter().filter(|o| o.existing).collect())
    }

    async fn close(&self) {
        let db = match self.db.write() {
            Ok(mut guard) => guard.take(),
            Err(_) => return,
        };
        if db.is_some() {
            tracing::debug!("Closed embedded meta store");
        }
    }
}
