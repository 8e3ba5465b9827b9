//! Object, project and user metadata.
//!
//! A [`MetaStore`] owns the pending -> committed lifecycle of every object:
//!
//! ```text
//!           put (no record)            commit
//!   [none] ----------------> [pending] --------> [committed]
//! ```
//!
//! Re-registering or re-committing an object is an idempotent no-op. Three
//! backends implement the contract with different storage models:
//! - [`EmbeddedMetaStore`] -- redb, one record per oid with an `existing` flag
//! - [`ColumnMetaStore`] -- column store, pending and committed partitions
//! - [`SqlMetaStore`] -- relational tables with a `pending` column and a join table

pub mod auth;
pub mod column;
pub mod embedded;
pub mod sql;

pub use auth::{AuthFailure, Authenticator, CredentialStore};
pub use column::{ColumnConfig, ColumnMetaStore, ColumnSession, MemorySession, ScyllaSession};
pub use embedded::EmbeddedMetaStore;
pub use sql::{SqlConfig, SqlDialect, SqlMetaStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which record a lookup failed to find.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotFound {
    #[error("Object not found: {0}")]
    Object(String),
    /// The object is registered but has not been committed yet.
    #[error("Object not committed: {0}")]
    Pending(String),
    #[error("Project not found: {0}")]
    Project(String),
    #[error("Unable to find user: {0}")]
    User(String),
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("Not authenticated: {0}")]
    Auth(AuthFailure),
    #[error(transparent)]
    NotFound(NotFound),
    #[error("Not supported by this backend: {0}")]
    Unsupported(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

impl MetaError {
    pub fn is_auth(&self) -> bool {
        matches!(self, MetaError::Auth(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MetaError::NotFound(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, MetaError::Unsupported(_))
    }

    pub(crate) fn backend(e: impl std::fmt::Display) -> Self {
        MetaError::Backend(e.to_string())
    }
}

/// A content-addressed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub oid: String,
    pub size: i64,
    #[serde(default)]
    pub project_names: Vec<String>,
    /// `false` while pending, `true` once committed.
    #[serde(default)]
    pub existing: bool,
}

impl Object {
    pub fn new(oid: impl Into<String>, size: i64) -> Self {
        Self {
            oid: oid.into(),
            size,
            project_names: Vec::new(),
            existing: false,
        }
    }
}

/// A named group of objects, typically a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// Committed oids, sorted.
    #[serde(default)]
    pub oids: Vec<String>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            oids: Vec::new(),
        }
    }

    /// Add an oid, keeping the set sorted. Returns false if already present.
    pub(crate) fn insert_oid(&mut self, oid: &str) -> bool {
        match self.oids.binary_search_by(|o| o.as_str().cmp(oid)) {
            Ok(_) => false,
            Err(pos) => {
                self.oids.insert(pos, oid.to_string());
                true
            }
        }
    }
}

/// An entry of the internal password table. Hashes never leave the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
}

/// Everything needed to address one object operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestVars {
    pub oid: String,
    pub size: i64,
    pub namespace: String,
    pub repo: String,
    /// Raw `Authorization` header value.
    pub authorization: String,
}

impl RequestVars {
    pub fn new(oid: impl Into<String>, size: i64) -> Self {
        Self {
            oid: oid.into(),
            size,
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = repo.into();
        self
    }

    pub fn with_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.authorization = authorization.into();
        self
    }

    /// `{base}/{namespace}/{repo}/objects/{oid}`
    pub fn object_link(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}/objects/{}",
            base_url.trim_end_matches('/'),
            self.namespace,
            self.repo,
            self.oid
        )
    }

    /// `{base}/{namespace}/{repo}/verify`
    pub fn verify_link(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}/verify",
            base_url.trim_end_matches('/'),
            self.namespace,
            self.repo
        )
    }

    /// The object a successful `put` of these vars registers.
    pub(crate) fn pending_object(&self) -> Object {
        Object {
            oid: self.oid.clone(),
            size: self.size,
            project_names: self.project_names(),
            existing: false,
        }
    }

    pub(crate) fn project_names(&self) -> Vec<String> {
        if self.repo.is_empty() {
            Vec::new()
        } else {
            vec![self.repo.clone()]
        }
    }

    /// Reject requests that could never name a valid object.
    pub(crate) fn validate(&self) -> Result<(), MetaError> {
        if !is_valid_oid(&self.oid) {
            return Err(MetaError::InvalidRequest(format!(
                "oid must be 64 lowercase hex characters, got {:?}",
                self.oid
            )));
        }
        if self.size < 0 {
            return Err(MetaError::InvalidRequest(format!(
                "size must not be negative, got {}",
                self.size
            )));
        }
        Ok(())
    }
}

/// An oid is a lowercase hex SHA-256 digest.
pub fn is_valid_oid(oid: &str) -> bool {
    oid.len() == 64 && oid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// The object/project/user registry shared by all metadata backends.
///
/// Object operations check `rv.authorization` before touching state and fail
/// with [`MetaError::Auth`] without side effects when it is rejected.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// A committed object. Pending objects are reported as not found.
    async fn get(&self, rv: &RequestVars) -> Result<Object, MetaError>;
    /// An object in either state.
    async fn get_pending(&self, rv: &RequestVars) -> Result<Object, MetaError>;
    /// Register a pending object, or return the existing record unchanged.
    async fn put(&self, rv: &RequestVars) -> Result<Object, MetaError>;
    /// Mark a registered object as committed.
    async fn commit(&self, rv: &RequestVars) -> Result<Object, MetaError>;

    async fn add_user(&self, name: &str, password: &str) -> Result<(), MetaError>;
    async fn delete_user(&self, name: &str) -> Result<(), MetaError>;
    async fn users(&self) -> Result<Vec<User>, MetaError>;

    async fn add_project(&self, name: &str) -> Result<(), MetaError>;
    async fn projects(&self) -> Result<Vec<Project>, MetaError>;
    /// Committed objects only.
    async fn objects(&self) -> Result<Vec<Object>, MetaError>;

    /// Release the backend handle. Calling it again is a no-op; other calls
    /// fail with a backend error afterwards.
    async fn close(&self);
}

pub(crate) fn closed_error() -> MetaError {
    MetaError::Backend("meta store is closed".to_string())
}

pub(crate) fn require_name(kind: &str, name: &str) -> Result<(), MetaError> {
    if name.trim().is_empty() {
        return Err(MetaError::InvalidRequest(format!("{kind} name must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_oid() {
        assert!(is_valid_oid(&"a".repeat(64)));
        assert!(!is_valid_oid(&"A".repeat(64)));
        assert!(!is_valid_oid(&"a".repeat(63)));
        assert!(!is_valid_oid(&format!("{}g", "a".repeat(63))));
    }

    #[test]
    fn test_links() {
        let rv = RequestVars::new("abc", 1)
            .with_namespace("ns")
            .with_repo("repo");
        assert_eq!(
            rv.object_link("https://lfs.example.com/"),
            "https://lfs.example.com/ns/repo/objects/abc"
        );
        assert_eq!(
            rv.verify_link("http://localhost:8080"),
            "http://localhost:8080/ns/repo/verify"
        );
    }

    #[test]
    fn test_pending_object_without_repo_has_no_projects() {
        let rv = RequestVars::new("abc", 3);
        assert!(rv.pending_object().project_names.is_empty());
        assert!(!rv.pending_object().existing);
        let rv = rv.with_repo("r");
        assert_eq!(rv.pending_object().project_names, vec!["r".to_string()]);
    }

    #[test]
    fn test_project_insert_oid_sorted_and_deduplicated() {
        let mut project = Project::new("p");
        assert!(project.insert_oid("b"));
        assert!(project.insert_oid("a"));
        assert!(!project.insert_oid("b"));
        assert_eq!(project.oids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_validate_rejects_negative_size() {
        let rv = RequestVars::new("a".repeat(64), -1);
        assert!(matches!(rv.validate(), Err(MetaError::InvalidRequest(_))));
    }
}
