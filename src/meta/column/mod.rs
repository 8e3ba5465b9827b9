//! Column-store metadata backend.
//!
//! Pending and committed records live in separate partitions: the `oids`
//! table carries a `pending` flag, and each project row keeps two oid sets,
//! `pending` and `oids` (committed). Commit moves the oid between the two
//! sets and then clears the flag. The store logic is written against
//! [`ColumnSession`], implemented over CQL by [`ScyllaSession`] and in memory
//! by [`MemorySession`].

mod cql;
mod memory;

pub use cql::{ColumnConfig, ScyllaSession};
pub use memory::MemorySession;

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::auth::{hash_password_blocking, Authenticator, PasswordTable};
use super::{require_name, MetaError, MetaStore, NotFound, Object, Project, RequestVars, User};

/// A row of the `oids` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidRow {
    pub oid: String,
    pub size: i64,
    pub pending: bool,
}

/// A row of the `projects` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectRow {
    pub name: String,
    pub oids: Vec<String>,
    pub pending: Vec<String>,
}

/// Which of a project's oid sets an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Pending,
    Committed,
}

/// Statement-level access to the column store tables.
#[async_trait]
pub trait ColumnSession: Send + Sync {
    async fn find_oid(&self, oid: &str) -> Result<Option<OidRow>, MetaError>;
    /// Conditionally insert a pending row. Returns false if a row existed.
    async fn insert_pending_oid(&self, oid: &str, size: i64) -> Result<bool, MetaError>;
    async fn mark_oid_committed(&self, oid: &str) -> Result<(), MetaError>;
    async fn all_oids(&self) -> Result<Vec<OidRow>, MetaError>;

    /// Create an empty project row unless it exists.
    async fn ensure_project(&self, name: &str) -> Result<(), MetaError>;
    async fn add_project_oid(
        &self,
        name: &str,
        oid: &str,
        membership: Membership,
    ) -> Result<(), MetaError>;
    async fn remove_pending_project_oid(&self, name: &str, oid: &str) -> Result<(), MetaError>;
    async fn projects_with_oid(
        &self,
        oid: &str,
        membership: Membership,
    ) -> Result<Vec<String>, MetaError>;
    async fn all_projects(&self) -> Result<Vec<ProjectRow>, MetaError>;

    async fn find_user(&self, name: &str) -> Result<Option<String>, MetaError>;
    /// Conditionally insert a user. Returns false if the name was taken.
    async fn insert_user_if_absent(&self, name: &str, hash: &str) -> Result<bool, MetaError>;
    async fn delete_user(&self, name: &str) -> Result<(), MetaError>;
    async fn all_users(&self) -> Result<Vec<String>, MetaError>;

    async fn close(&self);
}

pub struct ColumnMetaStore<S> {
    session: S,
    auth: Authenticator,
}

impl<S: ColumnSession> ColumnMetaStore<S> {
    pub fn new(session: S, auth: Authenticator) -> Self {
        Self { session, auth }
    }

    async fn authorize(&self, rv: &RequestVars) -> Result<(), MetaError> {
        self.auth.authorize(&rv.authorization, self).await
    }

    async fn find_object(&self, oid: &str) -> Result<Option<Object>, MetaError> {
        let Some(row) = self.session.find_oid(oid).await? else {
            return Ok(None);
        };
        let membership = if row.pending {
            Membership::Pending
        } else {
            Membership::Committed
        };
        let mut project_names = self.session.projects_with_oid(oid, membership).await?;
        project_names.sort();

        Ok(Some(Object {
            oid: row.oid,
            size: row.size,
            project_names,
            existing: !row.pending,
        }))
    }

    async fn require_object(&self, oid: &str) -> Result<Object, MetaError> {
        self.find_object(oid)
            .await?
            .ok_or_else(|| MetaError::NotFound(NotFound::Object(oid.to_string())))
    }
}

#[async_trait]
impl<S: ColumnSession> PasswordTable for ColumnMetaStore<S> {
    async fn password_hash(&self, user: &str) -> Result<Option<String>, MetaError> {
        self.session.find_user(user).await
    }
}

#[async_trait]
impl<S: ColumnSession> MetaStore for ColumnMetaStore<S> {
    async fn get(&self, rv: &RequestVars) -> Result<Object, MetaError> {
        self.authorize(rv).await?;
        let object = self.require_object(&rv.oid).await?;
        if !object.existing {
            return Err(MetaError::NotFound(NotFound::Pending(rv.oid.clone())));
        }
        Ok(object)
    }

    async fn get_pending(&self, rv: &RequestVars) -> Result<Object, MetaError> {
        self.authorize(rv).await?;
        self.require_object(&rv.oid).await
    }

    async fn put(&self, rv: &RequestVars) -> Result<Object, MetaError> {
        self.authorize(rv).await?;
        rv.validate()?;

        if let Some(existing) = self.find_object(&rv.oid).await? {
            return Ok(existing);
        }

        // Membership goes in before the oid row so a commit racing this put
        // always sees the project.
        for name in rv.project_names() {
            self.session.ensure_project(&name).await?;
            self.session
                .add_project_oid(&name, &rv.oid, Membership::Pending)
                .await?;
        }

        if !self.session.insert_pending_oid(&rv.oid, rv.size).await? {
            tracing::debug!(oid = %rv.oid, "Lost registration race, returning stored record");
            return self.require_object(&rv.oid).await;
        }

        tracing::debug!(oid = %rv.oid, repo = %rv.repo, "Registered object");
        Ok(rv.pending_object())
    }

    async fn commit(&self, rv: &RequestVars) -> Result<Object, MetaError> {
        self.authorize(rv).await?;
        self.require_object(&rv.oid).await?;

        let pending = self
            .session
            .projects_with_oid(&rv.oid, Membership::Pending)
            .await?;
        for name in &pending {
            self.session
                .add_project_oid(name, &rv.oid, Membership::Committed)
                .await?;
            self.session.remove_pending_project_oid(name, &rv.oid).await?;
        }
        self.session.mark_oid_committed(&rv.oid).await?;

        tracing::debug!(oid = %rv.oid, projects = pending.len(), "Committed object");
        self.require_object(&rv.oid).await
    }

    async fn add_user(&self, name: &str, password: &str) -> Result<(), MetaError> {
        self.auth.ensure_user_management()?;
        require_name("user", name)?;

        if self.session.find_user(name).await?.is_some() {
            return Ok(());
        }
        let hash = hash_password_blocking(password).await?;
        if self.session.insert_user_if_absent(name, &hash).await? {
            tracing::info!(user = name, "Added user");
        }
        Ok(())
    }

    async fn delete_user(&self, name: &str) -> Result<(), MetaError> {
        self.auth.ensure_user_management()?;
        self.session.delete_user(name).await
    }

    async fn users(&self) -> Result<Vec<User>, MetaError> {
        self.auth.ensure_user_management()?;
        let mut names = self.session.all_users().await?;
        names.sort();
        Ok(names.into_iter().map(|name| User { name }).collect())
    }

    async fn add_project(&self, name: &str) -> Result<(), MetaError> {
        require_name("project", name)?;
        self.session.ensure_project(name).await
    }

    async fn projects(&self) -> Result<Vec<Project>, MetaError> {
        let mut rows = self.session.all_projects().await?;
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut oids = row.oids;
                oids.sort();
                Project {
                    name: row.name,
                    oids,
                }
            })
            .collect())
    }

    async fn objects(&self) -> Result<Vec<Object>, MetaError> {
        let mut membership: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for project in self.session.all_projects().await? {
            for oid in project.oids {
                membership.entry(oid).or_default().push(project.name.clone());
            }
        }

        let mut objects: Vec<Object> = self
            .session
            .all_oids()
            .await?
            .into_iter()
            .filter(|row| !row.pending)
            .map(|row| {
                let mut project_names = membership.remove(&row.oid).unwrap_or_default();
                project_names.sort();
                Object {
                    oid: row.oid,
                    size: row.size,
                    project_names,
                    existing: true,
                }
            })
            .collect();
        objects.sort_by(|a, b| a.oid.cmp(&b.oid));
        Ok(objects)
    }

    async fn close(&self) {
        self.session.close().await;
    }
}
